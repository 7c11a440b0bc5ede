//! Agent counters and per-connection records.
//!
//! The four counters are lock-free atomics; connection records are shared
//! structs strongly owned by the pool and weakly referenced by the agent, so
//! `connections()` snapshots survive pool churn without keeping sockets
//! alive.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Protocol class negotiated via ALPN. Part of the pool key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlpnClass {
    H1,
    H2,
    H3,
}

impl AlpnClass {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::H1 => "h1",
            Self::H2 => "h2",
            Self::H3 => "h3",
        }
    }

    /// The `Version` reported on responses carried over this class.
    pub(crate) fn http_version(self) -> http::Version {
        match self {
            Self::H1 => http::Version::HTTP_11,
            Self::H2 => http::Version::HTTP_2,
            Self::H3 => http::Version::HTTP_3,
        }
    }
}

/// Transport protocol under a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionType {
    Tcp,
    Quic,
}

impl ConnectionType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Quic => "quic",
        }
    }
}

/// TLS details captured at handshake time.
#[derive(Debug, Clone, Default)]
pub struct TlsPeerInfo {
    /// DER-encoded leaf certificate, when the handshake presented one.
    pub certificate_der: Option<Vec<u8>>,
    /// Negotiated protocol version, e.g. `TLSv1.3`.
    pub version: Option<String>,
    /// SNI sent during the handshake (the original host, never an override).
    pub sni: Option<String>,
    /// Negotiated ALPN protocol id, e.g. `h2`.
    pub alpn: Option<String>,
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

fn millis_to_system_time(ms: u64) -> SystemTime {
    UNIX_EPOCH + std::time::Duration::from_millis(ms)
}

/// Shared bookkeeping for one live connection.
///
/// Created on successful handshake, mutated by the dispatcher on each
/// request, dropped when the connection closes.
#[derive(Debug)]
pub(crate) struct ConnectionRecord {
    pub id: u64,
    pub connection_type: ConnectionType,
    pub alpn: AlpnClass,
    pub local_addr: SocketAddr,
    pub remote_addr: SocketAddr,
    pub tls: TlsPeerInfo,
    pub first_seen_ms: u64,
    pub last_seen_ms: AtomicU64,
    pub response_count: AtomicU64,
    pub in_use: AtomicBool,
    pub live_streams: AtomicUsize,
    pub max_concurrent_streams: AtomicU32,
    pub rtt_us: AtomicU32,
    pub congestion_window: AtomicU32,
}

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

impl ConnectionRecord {
    pub fn new(
        connection_type: ConnectionType,
        alpn: AlpnClass,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
        tls: TlsPeerInfo,
    ) -> Self {
        let now = now_millis();
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            connection_type,
            alpn,
            local_addr,
            remote_addr,
            tls,
            first_seen_ms: now,
            last_seen_ms: AtomicU64::new(now),
            response_count: AtomicU64::new(0),
            in_use: AtomicBool::new(false),
            live_streams: AtomicUsize::new(0),
            max_concurrent_streams: AtomicU32::new(0),
            rtt_us: AtomicU32::new(0),
            congestion_window: AtomicU32::new(0),
        }
    }

    pub fn touch(&self) {
        self.last_seen_ms.store(now_millis(), Ordering::Relaxed);
    }

    pub fn record_response(&self) {
        self.response_count.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    pub fn set_telemetry(&self, rtt_us: u32, cwnd: u32) {
        self.rtt_us.store(rtt_us, Ordering::Relaxed);
        self.congestion_window.store(cwnd, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ConnectionInfo {
        let rtt = self.rtt_us.load(Ordering::Relaxed);
        let cwnd = self.congestion_window.load(Ordering::Relaxed);
        ConnectionInfo {
            id: self.id,
            connection_type: self.connection_type,
            alpn: self.alpn,
            local_address: self.local_addr.ip().to_string(),
            local_port: self.local_addr.port(),
            remote_address: self.remote_addr.ip().to_string(),
            remote_port: self.remote_addr.port(),
            first_seen: millis_to_system_time(self.first_seen_ms),
            last_seen: millis_to_system_time(self.last_seen_ms.load(Ordering::Relaxed)),
            response_count: self.response_count.load(Ordering::Relaxed),
            in_use: self.in_use.load(Ordering::Relaxed),
            live_streams: self.live_streams.load(Ordering::Relaxed),
            rtt_us: (rtt > 0).then_some(rtt),
            congestion_window: (cwnd > 0).then_some(cwnd),
        }
    }
}

/// One row of `agent.connections()`.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub id: u64,
    pub connection_type: ConnectionType,
    pub alpn: AlpnClass,
    pub local_address: String,
    pub local_port: u16,
    pub remote_address: String,
    pub remote_port: u16,
    pub first_seen: SystemTime,
    pub last_seen: SystemTime,
    pub response_count: u64,
    pub in_use: bool,
    pub live_streams: usize,
    /// Smoothed RTT in microseconds, when the OS exposes it.
    pub rtt_us: Option<u32>,
    /// Congestion window in packets, when the OS exposes it.
    pub congestion_window: Option<u32>,
}

/// Monotonic agent counters. Only ever increase within a process.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    requests_sent: AtomicU64,
    responses_received: AtomicU64,
    bodies_started: AtomicU64,
    bodies_finished: AtomicU64,
}

impl Counters {
    pub fn request_sent(&self) {
        self.requests_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn response_received(&self) {
        self.responses_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn body_started(&self) {
        self.bodies_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn body_finished(&self) {
        self.bodies_finished.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> AgentStats {
        AgentStats {
            requests_sent: self.requests_sent.load(Ordering::Relaxed),
            responses_received: self.responses_received.load(Ordering::Relaxed),
            bodies_started: self.bodies_started.load(Ordering::Relaxed),
            bodies_finished: self.bodies_finished.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of the agent counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgentStats {
    /// User-level fetches that reached the wire (redirect hops count once).
    pub requests_sent: u64,
    /// Fetches whose delivered response head parsed successfully.
    pub responses_received: u64,
    /// Non-empty response bodies handed to callers.
    pub bodies_started: u64,
    /// Bodies that reached the settled state.
    pub bodies_finished: u64,
}

/// Best-effort kernel TCP telemetry for a socket.
#[cfg(target_os = "linux")]
pub(crate) fn tcp_telemetry(fd: std::os::fd::RawFd) -> Option<(u32, u32)> {
    // SAFETY: getsockopt writes at most `len` bytes into the zeroed struct
    // and the fd is owned by a live TcpStream held by the caller.
    unsafe {
        let mut info: libc::tcp_info = std::mem::zeroed();
        let mut len = u32::try_from(std::mem::size_of::<libc::tcp_info>()).ok()?;
        let ret = libc::getsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_INFO,
            std::ptr::addr_of_mut!(info).cast(),
            &mut len,
        );
        if ret != 0 {
            return None;
        }
        Some((info.tcpi_rtt, info.tcpi_snd_cwnd))
    }
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn tcp_telemetry(_fd: std::os::fd::RawFd) -> Option<(u32, u32)> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_are_monotonic() {
        let counters = Counters::default();
        counters.request_sent();
        counters.request_sent();
        counters.response_received();
        counters.body_started();
        let stats = counters.snapshot();
        assert_eq!(stats.requests_sent, 2);
        assert_eq!(stats.responses_received, 1);
        assert_eq!(stats.bodies_started, 1);
        assert_eq!(stats.bodies_finished, 0);
    }

    #[test]
    fn record_snapshot_round_trips() {
        let record = ConnectionRecord::new(
            ConnectionType::Tcp,
            AlpnClass::H1,
            "127.0.0.1:50000".parse().unwrap(),
            "127.0.0.1:8080".parse().unwrap(),
            TlsPeerInfo::default(),
        );
        record.record_response();
        record.record_response();
        let info = record.snapshot();
        assert_eq!(info.response_count, 2);
        assert_eq!(info.connection_type.as_str(), "tcp");
        assert_eq!(info.remote_port, 8080);
        assert!(info.rtt_us.is_none());
    }

    #[test]
    fn connection_ids_are_unique() {
        let a = ConnectionRecord::new(
            ConnectionType::Tcp,
            AlpnClass::H1,
            "127.0.0.1:1".parse().unwrap(),
            "127.0.0.1:2".parse().unwrap(),
            TlsPeerInfo::default(),
        );
        let b = ConnectionRecord::new(
            ConnectionType::Quic,
            AlpnClass::H3,
            "127.0.0.1:1".parse().unwrap(),
            "127.0.0.1:2".parse().unwrap(),
            TlsPeerInfo::default(),
        );
        assert_ne!(a.id, b.id);
    }
}

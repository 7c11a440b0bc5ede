//! Socket dialing: TCP with staggered Happy Eyeballs, TLS with ALPN, and
//! QUIC for HTTP/3.
//!
//! A dial races the resolver's candidate list per RFC 8305: the first
//! candidate starts immediately, the next after 250 ms, then with
//! exponential spacing. The first established socket wins and the rest are
//! dropped. Aborting the signal tears down every in-flight attempt.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, trace, warn};

use crate::error::{Error, ErrorKind, Result};
use crate::signal::AbortSignal;
use crate::stats::{AlpnClass, TlsPeerInfo};

/// First-to-next-candidate gap per RFC 8305; doubles per attempt.
pub(crate) const CONNECTION_ATTEMPT_DELAY: Duration = Duration::from_millis(250);

/// TCP starts this long after QUIC in the h3 race.
pub(crate) const H3_RACE_TCP_DELAY: Duration = Duration::from_millis(100);

/// Per-agent TLS material. One config per ALPN offer set; the hash keys the
/// connection pool so differently-configured agents never share sockets.
pub(crate) struct TlsSetup {
    /// Offers `h2, http/1.1` for TCP origins.
    pub tcp: Arc<rustls::ClientConfig>,
    /// Offers `h3` for QUIC origins.
    #[cfg(feature = "http3")]
    pub quic: Arc<rustls::ClientConfig>,
    /// Distinguishes client TLS configurations in pool keys.
    pub config_hash: u64,
}

static TLS_SETUP_SEQ: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(1);

impl TlsSetup {
    pub fn new() -> Self {
        // same pattern as the quinn path: the provider install is idempotent
        let _ = rustls::crypto::ring::default_provider().install_default();

        let roots = rustls::RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        };

        let mut tcp = rustls::ClientConfig::builder()
            .with_root_certificates(roots.clone())
            .with_no_client_auth();
        tcp.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

        #[cfg(feature = "http3")]
        let quic = {
            let mut quic = rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth();
            quic.alpn_protocols = vec![b"h3".to_vec()];
            Arc::new(quic)
        };

        Self {
            tcp: Arc::new(tcp),
            #[cfg(feature = "http3")]
            quic,
            config_hash: TLS_SETUP_SEQ.fetch_add(1, std::sync::atomic::Ordering::Relaxed),
        }
    }
}

/// Plain or TLS-wrapped TCP stream. Both variants are `Unpin`.
pub(crate) enum MaybeTlsStream {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl MaybeTlsStream {
    fn tcp(&self) -> &TcpStream {
        match self {
            Self::Plain(s) => s,
            Self::Tls(s) => s.get_ref().0,
        }
    }

    /// Best-effort kernel telemetry for the underlying socket.
    pub fn telemetry(&self) -> Option<(u32, u32)> {
        #[cfg(unix)]
        {
            use std::os::fd::AsRawFd;
            crate::stats::tcp_telemetry(self.tcp().as_raw_fd())
        }
        #[cfg(not(unix))]
        {
            None
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.tcp().local_addr()
    }

    pub fn peer_addr(&self) -> std::io::Result<SocketAddr> {
        self.tcp().peer_addr()
    }
}

impl AsyncRead for MaybeTlsStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MaybeTlsStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_flush(cx),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Result of a successful TCP-path dial.
pub(crate) struct TcpDialed {
    pub io: MaybeTlsStream,
    pub alpn: AlpnClass,
    pub local_addr: SocketAddr,
    pub remote_addr: SocketAddr,
    pub tls: TlsPeerInfo,
}

/// Race the candidate list with staggered starts; first socket wins.
pub(crate) async fn happy_eyeballs_connect(
    candidates: &[SocketAddr],
    connect_timeout: Option<Duration>,
    signal: &AbortSignal,
) -> Result<TcpStream> {
    debug_assert!(!candidates.is_empty());
    let race = stagger_race(candidates, signal);
    match connect_timeout {
        Some(budget) => tokio::time::timeout(budget, race).await.map_err(|_| {
            Error::new(ErrorKind::Timeout, format!("connect exceeded {budget:?}"))
        })?,
        None => race.await,
    }
}

async fn stagger_race(candidates: &[SocketAddr], signal: &AbortSignal) -> Result<TcpStream> {
    let mut attempts = FuturesUnordered::new();
    let mut remaining = candidates.iter().copied();
    let mut gap = CONNECTION_ATTEMPT_DELAY;
    let mut last_err: Option<Error> = None;

    let first = remaining.next().expect("non-empty candidate list");
    attempts.push(attempt(first));

    loop {
        tokio::select! {
            () = signal.cancelled() => {
                return Err(Error::new(ErrorKind::Aborted, "request aborted"));
            }
            // start the next candidate once the gap passes
            () = tokio::time::sleep(gap), if remaining.len() > 0 => {
                if let Some(addr) = remaining.next() {
                    trace!(%addr, "starting fallback connect attempt");
                    attempts.push(attempt(addr));
                }
                gap = (gap * 2).min(Duration::from_secs(2));
            }
            outcome = attempts.next() => {
                match outcome {
                    Some(Ok((addr, stream))) => {
                        trace!(%addr, "connect attempt won the race");
                        return Ok(stream);
                    }
                    Some(Err((addr, err))) => {
                        debug!(%addr, error = %err, "connect attempt failed");
                        last_err = Some(Error::with_source(
                            ErrorKind::Network,
                            format!("connect to {addr} failed"),
                            err,
                        ));
                        if attempts.is_empty() && remaining.len() == 0 {
                            return Err(last_err.take().expect("failure recorded"));
                        }
                        // a failure releases the gap early
                        if let Some(addr) = remaining.next() {
                            attempts.push(attempt(addr));
                        }
                    }
                    None => {
                        // exhausted without a single failure record: can't happen
                        // with a non-empty candidate list, but fail closed
                        return Err(last_err.take().unwrap_or_else(|| {
                            Error::new(ErrorKind::Network, "no connect candidates")
                        }));
                    }
                }
            }
        }
    }
}

async fn attempt(addr: SocketAddr) -> std::result::Result<(SocketAddr, TcpStream), (SocketAddr, std::io::Error)> {
    match TcpStream::connect(addr).await {
        Ok(stream) => {
            let _ = stream.set_nodelay(true);
            Ok((addr, stream))
        }
        Err(err) => Err((addr, err)),
    }
}

/// Dial one origin over TCP, wrapping in TLS for https.
///
/// SNI is always the original host, never an override target.
pub(crate) async fn dial_tcp(
    candidates: &[SocketAddr],
    host: &str,
    is_tls: bool,
    tls: &TlsSetup,
    connect_timeout: Option<Duration>,
    signal: &AbortSignal,
) -> Result<TcpDialed> {
    let stream = happy_eyeballs_connect(candidates, connect_timeout, signal).await?;
    let local_addr = stream.local_addr()?;
    let remote_addr = stream.peer_addr()?;

    if !is_tls {
        return Ok(TcpDialed {
            io: MaybeTlsStream::Plain(stream),
            alpn: AlpnClass::H1,
            local_addr,
            remote_addr,
            tls: TlsPeerInfo::default(),
        });
    }

    let server_name = ServerName::try_from(host.to_string())
        .map_err(|e| Error::with_source(ErrorKind::InvalidUrl, "host is not a valid SNI name", e))?;
    let connector = TlsConnector::from(Arc::clone(&tls.tcp));
    let handshake = connector.connect(server_name, stream);
    let stream = tokio::select! {
        res = handshake => res.map_err(|e| {
            Error::with_source(ErrorKind::TlsHandshake, format!("TLS handshake with {host} failed"), e)
        })?,
        () = signal.cancelled() => {
            return Err(Error::new(ErrorKind::Aborted, "request aborted"));
        }
    };

    let (alpn, peer) = {
        let (_, session) = stream.get_ref();
        let alpn = match session.alpn_protocol() {
            Some(b"h2") => AlpnClass::H2,
            _ => AlpnClass::H1,
        };
        let peer = TlsPeerInfo {
            certificate_der: session
                .peer_certificates()
                .and_then(|certs| certs.first())
                .map(|c| c.as_ref().to_vec()),
            version: session.protocol_version().map(|v| format!("{v:?}")),
            sni: Some(host.to_string()),
            alpn: session
                .alpn_protocol()
                .map(|p| String::from_utf8_lossy(p).into_owned()),
        };
        (alpn, peer)
    };

    debug!(host, alpn = alpn.as_str(), "TLS established");
    Ok(TcpDialed {
        io: MaybeTlsStream::Tls(Box::new(stream)),
        alpn,
        local_addr,
        remote_addr,
        tls: peer,
    })
}

// ═══════════════════════════════════════════════════════════════════════════════
// QUIC (http3 feature)
// ═══════════════════════════════════════════════════════════════════════════════

/// Congestion controller selection for QUIC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CongestionAlgorithm {
    #[default]
    Cubic,
    Bbr1,
}

/// Result of a successful QUIC dial.
#[cfg(feature = "http3")]
pub(crate) struct QuicDialed {
    pub connection: quinn::Connection,
    pub local_addr: SocketAddr,
    pub remote_addr: SocketAddr,
    pub tls: TlsPeerInfo,
}

/// Lazily created QUIC endpoints, one per address family.
#[cfg(feature = "http3")]
#[derive(Default)]
pub(crate) struct QuicEndpoints {
    v4: once_cell::sync::OnceCell<quinn::Endpoint>,
    v6: once_cell::sync::OnceCell<quinn::Endpoint>,
}

#[cfg(feature = "http3")]
impl QuicEndpoints {
    fn endpoint_for(
        &self,
        remote: SocketAddr,
        tls: &TlsSetup,
        congestion: CongestionAlgorithm,
    ) -> Result<&quinn::Endpoint> {
        let cell = if remote.is_ipv4() { &self.v4 } else { &self.v6 };
        cell.get_or_try_init(|| {
            let bind: SocketAddr = if remote.is_ipv4() {
                "0.0.0.0:0".parse().expect("literal addr")
            } else {
                "[::]:0".parse().expect("literal addr")
            };

            let mut transport = quinn::TransportConfig::default();
            transport.max_idle_timeout(Some(Duration::from_secs(30).try_into().map_err(
                |e: quinn::VarIntBoundsExceeded| {
                    Error::with_source(ErrorKind::Network, "QUIC idle timeout out of range", e)
                },
            )?));
            transport.keep_alive_interval(Some(Duration::from_secs(5)));
            match congestion {
                CongestionAlgorithm::Cubic => {
                    transport.congestion_controller_factory(Arc::new(
                        quinn::congestion::CubicConfig::default(),
                    ));
                }
                CongestionAlgorithm::Bbr1 => {
                    transport.congestion_controller_factory(Arc::new(
                        quinn::congestion::BbrConfig::default(),
                    ));
                }
            }

            let crypto = quinn::crypto::rustls::QuicClientConfig::try_from(Arc::clone(&tls.quic))
                .map_err(|e| {
                    Error::with_source(ErrorKind::TlsHandshake, "QUIC TLS config rejected", e)
                })?;
            let mut client_config = quinn::ClientConfig::new(Arc::new(crypto));
            client_config.transport_config(Arc::new(transport));

            let mut endpoint = quinn::Endpoint::client(bind)
                .map_err(|e| Error::with_source(ErrorKind::Network, "QUIC endpoint bind failed", e))?;
            endpoint.set_default_client_config(client_config);
            Ok(endpoint)
        })
    }

    /// Dial one QUIC candidate. SNI is the original host.
    pub async fn dial(
        &self,
        remote: SocketAddr,
        host: &str,
        tls: &TlsSetup,
        congestion: CongestionAlgorithm,
        signal: &AbortSignal,
    ) -> Result<QuicDialed> {
        let endpoint = self.endpoint_for(remote, tls, congestion)?;
        let connecting = endpoint.connect(remote, host).map_err(|e| {
            Error::with_source(ErrorKind::Network, format!("QUIC connect to {remote} failed"), e)
        })?;
        let connection = tokio::select! {
            res = connecting => res.map_err(|e| {
                Error::with_source(
                    ErrorKind::TlsHandshake,
                    format!("QUIC handshake with {host} failed"),
                    e,
                )
            })?,
            () = signal.cancelled() => {
                return Err(Error::new(ErrorKind::Aborted, "request aborted"));
            }
        };

        let local_addr = endpoint.local_addr()?;
        let tls_info = TlsPeerInfo {
            certificate_der: connection
                .peer_identity()
                .and_then(|id| id.downcast::<Vec<rustls::pki_types::CertificateDer<'static>>>().ok())
                .and_then(|certs| certs.first().map(|c| c.as_ref().to_vec())),
            version: Some("TLSv1_3".to_string()),
            sni: Some(host.to_string()),
            alpn: Some("h3".to_string()),
        };

        debug!(host, %remote, "QUIC established");
        Ok(QuicDialed {
            connection,
            local_addr,
            remote_addr: remote,
            tls: tls_info,
        })
    }
}

/// Warn-level helper for dial failures that only demote a protocol, not the
/// whole fetch (the h3 race falling back to TCP).
pub(crate) fn log_demoted_dial(host: &str, err: &Error) {
    warn!(host, error = %err, "alternative-protocol dial failed; falling back");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn happy_eyeballs_connects_to_live_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let stream = happy_eyeballs_connect(&[addr], Some(Duration::from_secs(5)), &AbortSignal::never())
            .await
            .unwrap();
        assert_eq!(stream.peer_addr().unwrap(), addr);
    }

    #[tokio::test]
    async fn happy_eyeballs_skips_dead_candidate() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let live = listener.local_addr().unwrap();
        // a port nothing listens on: bind then drop
        let dead = {
            let l = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap()
        };
        let stream = happy_eyeballs_connect(
            &[dead, live],
            Some(Duration::from_secs(5)),
            &AbortSignal::never(),
        )
        .await
        .unwrap();
        assert_eq!(stream.peer_addr().unwrap(), live);
    }

    #[tokio::test]
    async fn connect_timeout_surfaces_timeout_kind() {
        // RFC 5737 TEST-NET-1 address: connects hang
        let blackhole: SocketAddr = "192.0.2.1:81".parse().unwrap();
        let err = happy_eyeballs_connect(
            &[blackhole],
            Some(Duration::from_millis(50)),
            &AbortSignal::never(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn abort_cancels_connect_race() {
        let blackhole: SocketAddr = "192.0.2.1:81".parse().unwrap();
        let controller = crate::signal::AbortController::new();
        let signal = controller.signal();
        let addrs = [blackhole];
        let race = happy_eyeballs_connect(&addrs, None, &signal);
        tokio::pin!(race);
        tokio::select! {
            _ = &mut race => panic!("must not resolve before abort"),
            () = tokio::time::sleep(Duration::from_millis(20)) => controller.abort(),
        }
        let err = race.await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Aborted);
    }

    #[tokio::test]
    async fn plain_dial_reports_addresses() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let tls = TlsSetup::new();
        let dialed = dial_tcp(&[addr], "127.0.0.1", false, &tls, None, &AbortSignal::never())
            .await
            .unwrap();
        assert_eq!(dialed.remote_addr, addr);
        assert_eq!(dialed.alpn, AlpnClass::H1);
        assert!(dialed.tls.certificate_der.is_none());

        // the stream is usable
        let (mut server, _) = listener.accept().await.unwrap();
        let mut io = dialed.io;
        io.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }
}

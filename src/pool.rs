//! Keyed cache of reusable connections.
//!
//! h1 connections are checked out exclusively and re-inserted by the body
//! reader once the prior response has fully drained; h2 and h3 handles stay
//! in the pool while live and are shared up to their stream budget. Idle h1
//! entries expire after the idle timeout and are swept by the agent's
//! background reaper.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, trace};
use url::Url;

use crate::error::{Error, ErrorKind, Result};
use crate::proto::h1::H1Conn;
use crate::proto::h2::H2Handle;
#[cfg(feature = "http3")]
use crate::proto::h3::H3Handle;
use crate::stats::AlpnClass;

pub(crate) const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const DEFAULT_MAX_IDLE_PER_KEY: usize = 10;
const DEFAULT_MAX_IDLE_TOTAL: usize = 100;

/// A normalised (scheme, host, port) triple.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct Origin {
    pub https: bool,
    /// Lowercased.
    pub host: String,
    pub port: u16,
}

impl Origin {
    pub fn from_url(url: &Url) -> Result<Self> {
        let https = match url.scheme() {
            "https" => true,
            "http" => false,
            other => {
                return Err(Error::new(
                    ErrorKind::InvalidUrl,
                    format!("unsupported scheme {other:?}"),
                ));
            }
        };
        let host = url
            .host_str()
            .ok_or_else(|| Error::new(ErrorKind::InvalidUrl, "URL has no host"))?
            .to_ascii_lowercase();
        let port = url.port().unwrap_or(if https { 443 } else { 80 });
        Ok(Self { https, host, port })
    }

    pub fn default_port(&self) -> bool {
        self.port == if self.https { 443 } else { 80 }
    }

    /// `host` or `host:port` for the wire (default port elided).
    pub fn authority(&self) -> String {
        if self.default_port() {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.https { "https" } else { "http" };
        write!(f, "{scheme}://{}:{}", self.host, self.port)
    }
}

/// The triple under which connections are reusable.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct ConnKey {
    pub origin: Origin,
    pub alpn: AlpnClass,
    pub tls_hash: u64,
}

struct IdleH1 {
    conn: H1Conn,
    since: Instant,
}

/// A multiplexed connection shared among concurrent requests.
#[derive(Clone)]
pub(crate) enum SharedConn {
    H2(H2Handle),
    #[cfg(feature = "http3")]
    H3(H3Handle),
}

impl SharedConn {
    fn is_closed(&self) -> bool {
        match self {
            Self::H2(h) => h.is_closed(),
            #[cfg(feature = "http3")]
            Self::H3(h) => h.is_closed(),
        }
    }

    fn at_capacity(&self) -> bool {
        match self {
            Self::H2(h) => h.at_capacity(),
            #[cfg(feature = "http3")]
            Self::H3(h) => h.at_capacity(),
        }
    }

    fn close(&self) {
        match self {
            // dropping the last sender closes an h2 connection; nothing to
            // do eagerly here
            Self::H2(_) => {}
            #[cfg(feature = "http3")]
            Self::H3(h) => h.close(),
        }
    }
}

#[derive(Default)]
struct PoolInner {
    idle: HashMap<ConnKey, VecDeque<IdleH1>>,
    shared: HashMap<ConnKey, Vec<SharedConn>>,
    total_idle: usize,
}

/// The per-agent connection pool.
pub(crate) struct Pool {
    inner: Mutex<PoolInner>,
    idle_timeout: Duration,
    max_idle_per_key: usize,
    max_idle_total: usize,
}

impl Pool {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(PoolInner::default()),
            idle_timeout,
            max_idle_per_key: DEFAULT_MAX_IDLE_PER_KEY,
            max_idle_total: DEFAULT_MAX_IDLE_TOTAL,
        }
    }

    /// Exclusive checkout of an idle h1 connection, freshest first.
    pub fn checkout_h1(&self, key: &ConnKey) -> Option<H1Conn> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let entries = inner.idle.get_mut(key)?;
        while let Some(entry) = entries.pop_back() {
            inner.total_idle = inner.total_idle.saturating_sub(1);
            if entry.since.elapsed() < self.idle_timeout {
                trace!(key = %key.origin, "h1 checkout hit");
                entry
                    .conn
                    .record()
                    .in_use
                    .store(true, std::sync::atomic::Ordering::Relaxed);
                return Some(entry.conn);
            }
            debug!(key = %key.origin, "dropping idle-expired h1 connection");
        }
        None
    }

    /// Shared checkout of a live multiplexed connection below its stream
    /// budget.
    pub fn checkout_shared(&self, key: &ConnKey) -> Option<SharedConn> {
        let mut inner = self.inner.lock();
        let entries = inner.shared.get_mut(key)?;
        entries.retain(|c| !c.is_closed());
        entries
            .iter()
            .find(|c| !c.at_capacity())
            .cloned()
    }

    /// Return an h1 connection after its response fully drained.
    pub fn insert_idle(&self, key: ConnKey, conn: H1Conn) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if inner.total_idle >= self.max_idle_total {
            debug!("pool at capacity; dropping returned connection");
            return;
        }
        let entries = inner.idle.entry(key).or_default();
        if entries.len() >= self.max_idle_per_key {
            // evict the stalest entry for this key
            entries.pop_front();
        } else {
            inner.total_idle += 1;
        }
        entries.push_back(IdleH1 {
            conn,
            since: Instant::now(),
        });
    }

    /// Insert a freshly dialed multiplexed connection.
    pub fn insert_shared(&self, key: ConnKey, conn: SharedConn) {
        self.inner.lock().shared.entry(key).or_default().push(conn);
    }

    /// Drop idle h1 entries older than `threshold` and prune dead shared
    /// connections.
    pub fn close_idle(&self, threshold: Duration) {
        let mut inner = self.inner.lock();
        let mut removed = 0usize;
        for entries in inner.idle.values_mut() {
            let before = entries.len();
            entries.retain(|e| e.since.elapsed() < threshold);
            removed += before - entries.len();
        }
        inner.idle.retain(|_, v| !v.is_empty());
        inner.total_idle = inner.total_idle.saturating_sub(removed);
        for entries in inner.shared.values_mut() {
            entries.retain(|c| !c.is_closed());
        }
        inner.shared.retain(|_, v| !v.is_empty());
        if removed > 0 {
            debug!(removed, "idle sweep closed connections");
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// Close everything. Called when the agent is dropped.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        for (_, entries) in inner.shared.drain() {
            for conn in entries {
                conn.close();
            }
        }
        inner.idle.clear();
        inner.total_idle = 0;
    }

    #[cfg(test)]
    pub fn idle_count(&self) -> usize {
        self.inner.lock().total_idle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origin_normalises_host_and_port() {
        let origin = Origin::from_url(&Url::parse("HTTPS://ExAmPle.COM/x").unwrap()).unwrap();
        assert_eq!(origin.host, "example.com");
        assert_eq!(origin.port, 443);
        assert!(origin.default_port());
        assert_eq!(origin.authority(), "example.com");

        let origin = Origin::from_url(&Url::parse("http://example.com:8080/").unwrap()).unwrap();
        assert_eq!(origin.port, 8080);
        assert_eq!(origin.authority(), "example.com:8080");
    }

    #[test]
    fn conn_keys_distinguish_alpn_and_tls() {
        let origin = Origin::from_url(&Url::parse("https://example.com/").unwrap()).unwrap();
        let a = ConnKey {
            origin: origin.clone(),
            alpn: AlpnClass::H1,
            tls_hash: 1,
        };
        let b = ConnKey {
            origin: origin.clone(),
            alpn: AlpnClass::H2,
            tls_hash: 1,
        };
        let c = ConnKey {
            origin,
            alpn: AlpnClass::H1,
            tls_hash: 2,
        };
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn checkout_on_empty_pool_misses() {
        let pool = Pool::new(DEFAULT_IDLE_TIMEOUT);
        let key = ConnKey {
            origin: Origin::from_url(&Url::parse("http://example.com/").unwrap()).unwrap(),
            alpn: AlpnClass::H1,
            tls_hash: 0,
        };
        assert!(pool.checkout_h1(&key).is_none());
        assert!(pool.checkout_shared(&key).is_none());
        assert_eq!(pool.idle_count(), 0);
    }
}

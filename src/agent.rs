//! The Agent: per-client owner of resolver, pool, TLS material, Alt-Svc
//! store, cookie jar, cache, default policy, and counters.
//!
//! Agents are cheap to construct and reference-counted; clones share one
//! state. The resolver and the idle-sweep task initialize lazily on the
//! first request. Dropping the last handle closes idle connections and
//! tears down the cache backend. Distinct agents share nothing.

use std::sync::{Arc, Weak};

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tracing::debug;
use url::Url;

use crate::altsvc::{AltSvcStore, Http3Hint};
use crate::cache::{CacheConfig, HttpCache};
use crate::cookies::{CookieJar, CookieSource};
use crate::dispatch;
use crate::error::{Error, ErrorKind, Result};
use crate::pool::{Pool, DEFAULT_IDLE_TIMEOUT};
use crate::request::{RedirectMode, RequestOptions, Timeouts};
use crate::resolve::{DnsConfig, Resolver};
use crate::response::Response;
use crate::stats::{AgentStats, ConnectionInfo, ConnectionRecord, Counters};
use crate::transport::{CongestionAlgorithm, TlsSetup};

const REAPER_INTERVAL: std::time::Duration = std::time::Duration::from_secs(30);

/// A default header sent on every request unless the request overrides it.
#[derive(Debug, Clone)]
pub struct DefaultHeader {
    pub name: String,
    pub value: String,
    /// Marks the value sensitive so logging and indexing skip it.
    pub sensitive: bool,
}

impl DefaultHeader {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            sensitive: false,
        }
    }
}

/// HTTP/3 behaviour knobs.
#[derive(Debug, Clone)]
pub struct Http3Config {
    /// Race QUIC against TCP when an Alt-Svc record (or hint) exists.
    pub upgrade_enabled: bool,
    pub congestion: CongestionAlgorithm,
    /// Pre-seeded h3 endpoints, tried without waiting for Alt-Svc.
    pub hints: Vec<Http3Hint>,
}

impl Default for Http3Config {
    fn default() -> Self {
        Self {
            upgrade_enabled: true,
            congestion: CongestionAlgorithm::default(),
            hints: Vec::new(),
        }
    }
}

/// Agent construction options.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Default `User-Agent`; a request header takes precedence.
    pub user_agent: Option<String>,
    pub headers: Vec<DefaultHeader>,
    /// Enables the cookie jar.
    pub cookies: bool,
    pub timeout: Timeouts,
    pub dns: DnsConfig,
    pub http3: Http3Config,
    /// Absent means no HTTP cache at all.
    pub cache: Option<CacheConfig>,
    pub redirect: RedirectMode,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            user_agent: None,
            headers: Vec::new(),
            cookies: false,
            timeout: Timeouts {
                connect: Some(std::time::Duration::from_secs(10)),
                read: Some(std::time::Duration::from_secs(30)),
                total: Some(std::time::Duration::from_secs(30)),
            },
            dns: DnsConfig::default(),
            http3: Http3Config::default(),
            cache: None,
            redirect: RedirectMode::Follow,
        }
    }
}

fn default_user_agent() -> String {
    let version = env!("CARGO_PKG_VERSION");
    format!("Faith/{version} faith.rs/{version}")
}

pub(crate) struct AgentInner {
    config: AgentConfig,
    user_agent: String,
    tls: TlsSetup,
    resolver: OnceCell<Resolver>,
    pool: Arc<Pool>,
    altsvc: AltSvcStore,
    jar: Option<CookieJar>,
    cache: Option<Arc<HttpCache>>,
    counters: Arc<Counters>,
    records: Mutex<Vec<Weak<ConnectionRecord>>>,
    #[cfg(feature = "http3")]
    quic: crate::transport::QuicEndpoints,
    reaper: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl AgentInner {
    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    pub fn tls(&self) -> &TlsSetup {
        &self.tls
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub fn pool_arc(&self) -> &Arc<Pool> {
        &self.pool
    }

    pub fn altsvc(&self) -> &AltSvcStore {
        &self.altsvc
    }

    pub fn jar(&self) -> Option<&CookieJar> {
        self.jar.as_ref()
    }

    pub fn cache(&self) -> Option<Arc<HttpCache>> {
        self.cache.clone()
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    pub fn counters_arc(&self) -> &Arc<Counters> {
        &self.counters
    }

    #[cfg(feature = "http3")]
    pub fn quic(&self) -> &crate::transport::QuicEndpoints {
        &self.quic
    }

    /// First use builds the resolver from the DNS config.
    pub fn resolver(&self) -> Result<&Resolver> {
        self.resolver.get_or_try_init(|| Resolver::new(&self.config.dns))
    }

    pub fn register_record(&self, record: &Arc<ConnectionRecord>) {
        self.records.lock().push(Arc::downgrade(record));
    }
}

impl Drop for AgentInner {
    fn drop(&mut self) {
        if let Some(handle) = self.reaper.lock().take() {
            handle.abort();
        }
        self.pool.clear();
        debug!("agent torn down");
    }
}

/// A fetch client. Clones share one agent; separate agents are isolated.
#[derive(Clone)]
pub struct Agent {
    inner: Arc<AgentInner>,
}

impl Agent {
    pub fn new() -> Self {
        Self::with_config(AgentConfig::default())
    }

    pub fn with_config(config: AgentConfig) -> Self {
        let user_agent = config
            .user_agent
            .clone()
            .unwrap_or_else(default_user_agent);
        let jar = config.cookies.then(CookieJar::new);
        let cache = config.cache.as_ref().map(|c| Arc::new(HttpCache::new(c)));
        let altsvc = AltSvcStore::with_hints(&config.http3.hints);
        Self {
            inner: Arc::new(AgentInner {
                user_agent,
                tls: TlsSetup::new(),
                resolver: OnceCell::new(),
                pool: Arc::new(Pool::new(DEFAULT_IDLE_TIMEOUT)),
                altsvc,
                jar,
                cache,
                counters: Arc::new(Counters::default()),
                records: Mutex::new(Vec::new()),
                #[cfg(feature = "http3")]
                quic: crate::transport::QuicEndpoints::default(),
                reaper: Mutex::new(None),
                config,
            }),
        }
    }

    /// Perform one fetch through this agent.
    pub async fn fetch(&self, url: &str, options: RequestOptions) -> Result<Response> {
        self.ensure_reaper();
        dispatch::fetch(&self.inner, url, options).await
    }

    /// Snapshot of the four monotonic counters.
    pub fn stats(&self) -> AgentStats {
        self.inner.counters.snapshot()
    }

    /// Snapshot of every connection this agent has opened and still knows
    /// about.
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        let mut records = self.inner.records.lock();
        records.retain(|w| w.strong_count() > 0);
        records
            .iter()
            .filter_map(Weak::upgrade)
            .map(|r| r.snapshot())
            .collect()
    }

    /// Store one cookie-pair string (plus attributes) scoped to the URL.
    /// A no-op when cookies are disabled.
    pub fn add_cookie(&self, url: &str, cookie: &str) -> Result<()> {
        let Some(jar) = self.inner.jar() else {
            return Ok(());
        };
        let url = Url::parse(url)?;
        if jar.add(&url, cookie, CookieSource::NonHttp) {
            Ok(())
        } else {
            Err(Error::new(
                ErrorKind::InvalidHeader,
                "cookie was rejected for this URL",
            ))
        }
    }

    /// The serialized cookies matching the URL, or `None` when nothing
    /// matches or cookies are disabled.
    pub fn get_cookie(&self, url: &str) -> Result<Option<String>> {
        let Some(jar) = self.inner.jar() else {
            return Ok(None);
        };
        let url = Url::parse(url)?;
        Ok(jar.cookies_for(&url, CookieSource::NonHttp))
    }

    pub fn clear_cookies(&self) {
        if let Some(jar) = self.inner.jar() {
            jar.clear();
        }
    }

    /// Spawn the idle sweep once a runtime is known to exist.
    fn ensure_reaper(&self) {
        let mut slot = self.inner.reaper.lock();
        if slot.is_some() {
            return;
        }
        let pool = Arc::downgrade(&self.inner.pool);
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(REAPER_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(pool) = pool.upgrade() else { break };
                pool.close_idle(pool.idle_timeout());
            }
        }));
    }
}

impl Default for Agent {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("user_agent", &self.inner.user_agent)
            .field("cookies", &self.inner.jar.is_some())
            .field("cache", &self.inner.cache.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_user_agent_carries_both_names() {
        let ua = default_user_agent();
        assert!(ua.starts_with("Faith/"));
        assert!(ua.contains("faith.rs/"));
    }

    #[test]
    fn construction_is_cheap_and_isolated() {
        let a = Agent::new();
        let b = Agent::new();
        assert_eq!(a.stats().requests_sent, 0);
        assert!(a.connections().is_empty());
        // isolated jars: b never sees a's cookies
        assert!(!Arc::ptr_eq(&a.inner, &b.inner));
    }

    #[test]
    fn cookie_api_is_noop_without_jar() {
        let agent = Agent::new();
        agent
            .add_cookie("http://example.com/", "a=1")
            .expect("no-op when cookies disabled");
        assert_eq!(agent.get_cookie("http://example.com/").unwrap(), None);
    }

    #[test]
    fn cookie_api_round_trips_with_jar() {
        let agent = Agent::with_config(AgentConfig {
            cookies: true,
            ..AgentConfig::default()
        });
        agent.add_cookie("http://example.com/", "a=1").unwrap();
        assert_eq!(
            agent.get_cookie("http://example.com/").unwrap().as_deref(),
            Some("a=1")
        );
        assert_eq!(agent.get_cookie("http://other.com/").unwrap(), None);
        agent.clear_cookies();
        assert_eq!(agent.get_cookie("http://example.com/").unwrap(), None);
    }

    #[test]
    fn clones_share_state() {
        let agent = Agent::with_config(AgentConfig {
            cookies: true,
            ..AgentConfig::default()
        });
        let clone = agent.clone();
        agent.add_cookie("http://example.com/", "shared=1").unwrap();
        assert_eq!(
            clone.get_cookie("http://example.com/").unwrap().as_deref(),
            Some("shared=1")
        );
    }
}

//! RFC 9111-aligned HTTP cache.
//!
//! Freshness math and `Vary` handling live here; the mode semantics
//! (`no-cache`, `force-cache`, ...) live in the dispatcher, and validator
//! exchanges (304 refresh) are driven from there too. Storage backends are
//! pluggable: an in-memory LRU and an on-disk directory of
//! content-addressed files.
//!
//! Entries hold the *decoded* body; framing and encoding headers are
//! stripped at store time so a cache hit is served exactly like an
//! identity-encoded response.

pub(crate) mod disk;
pub(crate) mod memory;

use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};
use url::Url;

use crate::request::CacheMode;

/// Statuses cacheable without explicit freshness information.
const CACHEABLE_BY_DEFAULT: &[u16] = &[200, 203, 204, 300, 301, 308, 404, 405, 410, 414, 501];

/// Headers never copied into or refreshed on a stored entry.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Headers describing the stored (decoded) body that must not be refreshed
/// from a 304.
const EXCLUDED_FROM_REVALIDATION: &[&str] = &[
    "content-encoding",
    "content-length",
    "content-range",
    "content-md5",
    "etag",
];

const HEURISTIC_FRACTION: u32 = 10;
const HEURISTIC_CAP: Duration = Duration::from_secs(86_400);

/// Where cached entries live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheBackend {
    #[default]
    Memory,
    Disk,
}

/// Cache configuration, part of the agent options. Absent config means no
/// cache at all.
#[derive(Debug, Clone, Default)]
pub struct CacheConfig {
    pub store: CacheBackend,
    /// Directory for the disk backend.
    pub path: Option<PathBuf>,
    /// Entry-count capacity for the memory backend.
    pub capacity: Option<usize>,
    /// Agent-level default mode; requests may override.
    pub mode: Option<CacheMode>,
}

/// One stored response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct CacheEntry {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    /// Decoded body bytes.
    pub body: Vec<u8>,
    /// Seconds since the epoch at storage or last revalidation.
    pub stored_at: u64,
    /// `(header-name, request-value)` pairs the response varied on.
    pub vary: Vec<(String, String)>,
}

impl CacheEntry {
    pub fn header_map(&self) -> HeaderMap {
        let mut map = HeaderMap::with_capacity(self.headers.len());
        for (name, value) in &self.headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_bytes(value.as_bytes()),
            ) {
                map.append(name, value);
            }
        }
        map
    }

    pub fn status_code(&self) -> StatusCode {
        StatusCode::from_u16(self.status).unwrap_or(StatusCode::OK)
    }

    fn stored_time(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(self.stored_at)
    }

    /// The entry's validators for a conditional request.
    pub fn validators(&self) -> (Option<String>, Option<String>) {
        let find = |wanted: &str| {
            self.headers
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case(wanted))
                .map(|(_, value)| value.clone())
        };
        (find("etag"), find("last-modified"))
    }

    /// Whether stored response directives allow serving without
    /// revalidation at all.
    pub fn requires_revalidation(&self) -> bool {
        let cc = parse_cache_control(self.header_values("cache-control"));
        cc.no_cache
    }

    pub fn is_fresh(&self, now: SystemTime) -> bool {
        self.current_age(now) < self.freshness_lifetime()
    }

    fn header_values(&self, wanted: &'static str) -> impl Iterator<Item = &str> + '_ {
        self.headers
            .iter()
            .filter(move |(name, _)| name.eq_ignore_ascii_case(wanted))
            .map(|(_, value)| value.as_str())
    }

    /// RFC 9111 §4.2.3, simplified: resident time plus any `Age` the
    /// upstream reported.
    fn current_age(&self, now: SystemTime) -> Duration {
        let resident = now
            .duration_since(self.stored_time())
            .unwrap_or(Duration::ZERO);
        let upstream_age = self
            .header_values("age")
            .next()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::ZERO);
        resident + upstream_age
    }

    /// RFC 9111 §4.2.1: max-age, then Expires - Date, then the
    /// Last-Modified heuristic.
    fn freshness_lifetime(&self) -> Duration {
        let cc = parse_cache_control(self.header_values("cache-control"));
        if let Some(max_age) = cc.max_age {
            return Duration::from_secs(max_age);
        }
        let date = self
            .header_values("date")
            .next()
            .and_then(parse_http_date)
            .unwrap_or_else(|| self.stored_time());
        if let Some(expires) = self.header_values("expires").next() {
            // an unparseable Expires means already stale
            let expires = parse_http_date(expires).unwrap_or(UNIX_EPOCH);
            return expires.duration_since(date).unwrap_or(Duration::ZERO);
        }
        if let Some(last_modified) = self
            .header_values("last-modified")
            .next()
            .and_then(parse_http_date)
        {
            if let Ok(delta) = date.duration_since(last_modified) {
                return (delta / HEURISTIC_FRACTION).min(HEURISTIC_CAP);
            }
        }
        Duration::ZERO
    }

    /// Refresh headers and stored-at from a 304 validation response.
    pub fn refresh_from(&mut self, headers: &HeaderMap, now: SystemTime) {
        for (name, value) in headers {
            let lower = name.as_str().to_ascii_lowercase();
            if HOP_BY_HOP.contains(&lower.as_str())
                || EXCLUDED_FROM_REVALIDATION.contains(&lower.as_str())
            {
                continue;
            }
            if let Ok(text) = value.to_str() {
                self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(&lower));
                self.headers.push((lower.clone(), text.to_string()));
            }
        }
        self.stored_at = now
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_secs();
    }
}

#[derive(Debug, Default)]
struct CacheControl {
    no_store: bool,
    no_cache: bool,
    max_age: Option<u64>,
}

fn parse_cache_control<'a>(values: impl Iterator<Item = &'a str>) -> CacheControl {
    let mut out = CacheControl::default();
    for value in values {
        for directive in value.split(',') {
            let directive = directive.trim();
            let (name, arg) = match directive.split_once('=') {
                Some((n, a)) => (n.trim(), Some(a.trim().trim_matches('"'))),
                None => (directive, None),
            };
            match name.to_ascii_lowercase().as_str() {
                "no-store" => out.no_store = true,
                "no-cache" => out.no_cache = true,
                "max-age" => out.max_age = arg.and_then(|a| a.parse().ok()),
                _ => {}
            }
        }
    }
    out
}

/// IMF-fixdate parser, tolerating the obsolete asctime variant poorly
/// enough to just reject it.
fn parse_http_date(value: &str) -> Option<SystemTime> {
    // e.g. "Sun, 06 Nov 1994 08:49:37 GMT"
    let parts: Vec<&str> = value.split_whitespace().collect();
    if parts.len() != 6 || !parts[5].eq_ignore_ascii_case("GMT") {
        return None;
    }
    let day: u64 = parts[1].parse().ok()?;
    let month = match parts[2].to_ascii_lowercase().as_str() {
        "jan" => 1u64,
        "feb" => 2,
        "mar" => 3,
        "apr" => 4,
        "may" => 5,
        "jun" => 6,
        "jul" => 7,
        "aug" => 8,
        "sep" => 9,
        "oct" => 10,
        "nov" => 11,
        "dec" => 12,
        _ => return None,
    };
    let year: u64 = parts[3].parse().ok()?;
    let mut clock = parts[4].split(':');
    let hour: u64 = clock.next()?.parse().ok()?;
    let minute: u64 = clock.next()?.parse().ok()?;
    let second: u64 = clock.next()?.parse().ok()?;
    if year < 1970 || day == 0 || day > 31 || hour > 23 || minute > 59 || second > 60 {
        return None;
    }

    // civil date to days since epoch
    let y = if month <= 2 { year - 1 } else { year };
    let era = y / 400;
    let yoe = y - era * 400;
    let mp = (month + 9) % 12;
    let doy = (153 * mp + 2) / 5 + day - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    let days = era * 146_097 + doe - 719_468;

    Some(UNIX_EPOCH + Duration::from_secs(days * 86_400 + hour * 3600 + minute * 60 + second))
}

/// Storage backend surface: `get`/`put`/`remove` plus `size`.
#[async_trait]
pub(crate) trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Option<CacheEntry>;
    async fn put(&self, key: String, entry: CacheEntry);
    async fn remove(&self, key: &str);
    async fn size(&self) -> usize;
}

/// The cache front: keying, vary checks, storability.
pub(crate) struct HttpCache {
    store: Box<dyn CacheStore>,
}

impl HttpCache {
    pub fn new(config: &CacheConfig) -> Self {
        let store: Box<dyn CacheStore> = match config.store {
            CacheBackend::Memory => Box::new(memory::MemoryStore::new(config.capacity)),
            CacheBackend::Disk => Box::new(disk::DiskStore::new(
                config
                    .path
                    .clone()
                    .unwrap_or_else(|| std::env::temp_dir().join("faith-cache")),
            )),
        };
        Self { store }
    }

    pub fn cache_key(method: &Method, url: &Url) -> String {
        format!("{method} {url}")
    }

    /// Fetch the stored entry for this request, honouring `Vary`.
    pub async fn lookup(
        &self,
        method: &Method,
        url: &Url,
        request_headers: &HeaderMap,
    ) -> Option<CacheEntry> {
        let entry = self.store.get(&Self::cache_key(method, url)).await?;
        for (name, stored_value) in &entry.vary {
            let current = request_headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("");
            if current != stored_value {
                trace!(header = %name, "vary mismatch; cache miss");
                return None;
            }
        }
        Some(entry)
    }

    /// Store a response if RFC 9111 permits it.
    pub async fn store(
        &self,
        method: &Method,
        url: &Url,
        request_headers: &HeaderMap,
        status: StatusCode,
        response_headers: &HeaderMap,
        body: &Bytes,
        now: SystemTime,
    ) {
        if !Self::is_storable(method, request_headers, status, response_headers) {
            return;
        }

        let vary = response_headers
            .get_all(http::header::VARY)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .map(|name| name.trim().to_ascii_lowercase())
            .filter(|name| !name.is_empty())
            .map(|name| {
                let value = request_headers
                    .get(&name)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("")
                    .to_string();
                (name, value)
            })
            .collect();

        let headers = response_headers
            .iter()
            .filter_map(|(name, value)| {
                let lower = name.as_str().to_ascii_lowercase();
                if HOP_BY_HOP.contains(&lower.as_str())
                    || lower == "content-encoding"
                    || lower == "content-length"
                {
                    return None;
                }
                value.to_str().ok().map(|v| (lower, v.to_string()))
            })
            .collect();

        let entry = CacheEntry {
            status: status.as_u16(),
            headers,
            body: body.to_vec(),
            stored_at: now
                .duration_since(UNIX_EPOCH)
                .unwrap_or(Duration::ZERO)
                .as_secs(),
            vary,
        };
        debug!(key = %Self::cache_key(method, url), bytes = entry.body.len(), "caching response");
        self.store.put(Self::cache_key(method, url), entry).await;
    }

    /// RFC 9111 §3 storability for a private client cache.
    pub fn is_storable(
        method: &Method,
        request_headers: &HeaderMap,
        status: StatusCode,
        response_headers: &HeaderMap,
    ) -> bool {
        // only safe idempotent reads are cached
        if method != Method::GET {
            return false;
        }
        if request_headers.contains_key(http::header::RANGE)
            || status == StatusCode::PARTIAL_CONTENT
        {
            return false;
        }
        let vary_star = response_headers
            .get_all(http::header::VARY)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .any(|v| v.split(',').any(|n| n.trim() == "*"));
        if vary_star {
            return false;
        }

        let header_strs = |map: &HeaderMap, name: http::header::HeaderName| -> Vec<String> {
            map.get_all(name)
                .iter()
                .filter_map(|v| v.to_str().ok().map(ToString::to_string))
                .collect()
        };
        let req_cc =
            parse_cache_control(header_strs(request_headers, http::header::CACHE_CONTROL)
                .iter()
                .map(String::as_str));
        let resp_cc =
            parse_cache_control(header_strs(response_headers, http::header::CACHE_CONTROL)
                .iter()
                .map(String::as_str));
        if req_cc.no_store || resp_cc.no_store {
            return false;
        }

        CACHEABLE_BY_DEFAULT.contains(&status.as_u16())
            || resp_cc.max_age.is_some()
            || response_headers.contains_key(http::header::EXPIRES)
    }

    pub async fn update(&self, method: &Method, url: &Url, entry: CacheEntry) {
        self.store.put(Self::cache_key(method, url), entry).await;
    }

    pub async fn remove(&self, method: &Method, url: &Url) {
        self.store.remove(&Self::cache_key(method, url)).await;
    }

    #[cfg(test)]
    pub async fn size(&self) -> usize {
        self.store.size().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry_with_headers(headers: &[(&str, &str)], stored_secs_ago: u64) -> CacheEntry {
        let stored_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs()
            - stored_secs_ago;
        CacheEntry {
            status: 200,
            headers: headers
                .iter()
                .map(|(n, v)| ((*n).to_string(), (*v).to_string()))
                .collect(),
            body: b"cached".to_vec(),
            stored_at,
            vary: Vec::new(),
        }
    }

    #[test]
    fn max_age_governs_freshness() {
        let entry = entry_with_headers(&[("cache-control", "max-age=60")], 10);
        assert!(entry.is_fresh(SystemTime::now()));
        let stale = entry_with_headers(&[("cache-control", "max-age=60")], 120);
        assert!(!stale.is_fresh(SystemTime::now()));
    }

    #[test]
    fn age_header_counts_against_lifetime() {
        let entry = entry_with_headers(&[("cache-control", "max-age=60"), ("age", "55")], 10);
        assert!(!entry.is_fresh(SystemTime::now()));
    }

    #[test]
    fn heuristic_freshness_from_last_modified() {
        // modified 100 days before Date: heuristic lifetime is capped at a day
        let entry = entry_with_headers(
            &[
                ("date", "Mon, 01 Jan 2024 00:00:00 GMT"),
                ("last-modified", "Sat, 23 Sep 2023 00:00:00 GMT"),
            ],
            10,
        );
        assert_eq!(entry.freshness_lifetime(), HEURISTIC_CAP);
    }

    #[test]
    fn no_validators_no_lifetime_is_stale() {
        let entry = entry_with_headers(&[], 0);
        assert!(!entry.is_fresh(SystemTime::now()));
    }

    #[test]
    fn http_date_parses_imf_fixdate() {
        let parsed = parse_http_date("Sun, 06 Nov 1994 08:49:37 GMT").unwrap();
        let secs = parsed.duration_since(UNIX_EPOCH).unwrap().as_secs();
        assert_eq!(secs, 784_111_777);
        assert!(parse_http_date("yesterday").is_none());
    }

    #[test]
    fn storability_rules() {
        let ok = |m: &Method, s: StatusCode, req: &HeaderMap, resp: &HeaderMap| {
            HttpCache::is_storable(m, req, s, resp)
        };
        let empty = HeaderMap::new();
        assert!(ok(&Method::GET, StatusCode::OK, &empty, &empty));
        assert!(!ok(&Method::POST, StatusCode::OK, &empty, &empty));

        let mut no_store = HeaderMap::new();
        no_store.insert(http::header::CACHE_CONTROL, "no-store".parse().unwrap());
        assert!(!ok(&Method::GET, StatusCode::OK, &empty, &no_store));
        assert!(!ok(&Method::GET, StatusCode::OK, &no_store, &empty));

        let mut vary_star = HeaderMap::new();
        vary_star.insert(http::header::VARY, "*".parse().unwrap());
        assert!(!ok(&Method::GET, StatusCode::OK, &empty, &vary_star));

        let mut range = HeaderMap::new();
        range.insert(http::header::RANGE, "bytes=0-5".parse().unwrap());
        assert!(!ok(&Method::GET, StatusCode::OK, &range, &empty));

        // 500 is not cacheable by default but explicit max-age allows it
        assert!(!ok(&Method::GET, StatusCode::INTERNAL_SERVER_ERROR, &empty, &empty));
        let mut explicit = HeaderMap::new();
        explicit.insert(http::header::CACHE_CONTROL, "max-age=5".parse().unwrap());
        assert!(ok(&Method::GET, StatusCode::INTERNAL_SERVER_ERROR, &empty, &explicit));
    }

    #[test]
    fn refresh_from_304_updates_headers_and_clock() {
        let mut entry = entry_with_headers(&[("cache-control", "max-age=1"), ("etag", "\"v1\"")], 300);
        assert!(!entry.is_fresh(SystemTime::now()));
        let mut fresh_headers = HeaderMap::new();
        fresh_headers.insert(http::header::CACHE_CONTROL, "max-age=600".parse().unwrap());
        fresh_headers.insert(http::header::ETAG, "\"v2\"".parse().unwrap());
        entry.refresh_from(&fresh_headers, SystemTime::now());
        assert!(entry.is_fresh(SystemTime::now()));
        // etag is body metadata: not refreshed from a 304
        assert_eq!(entry.validators().0.as_deref(), Some("\"v1\""));
    }

    #[tokio::test]
    async fn vary_mismatch_misses() {
        let cache = HttpCache::new(&CacheConfig::default());
        let url = Url::parse("http://example.com/data").unwrap();
        let mut req = HeaderMap::new();
        req.insert(http::header::ACCEPT_ENCODING, "gzip".parse().unwrap());
        let mut resp = HeaderMap::new();
        resp.insert(http::header::VARY, "accept-encoding".parse().unwrap());
        resp.insert(http::header::CACHE_CONTROL, "max-age=60".parse().unwrap());

        cache
            .store(
                &Method::GET,
                &url,
                &req,
                StatusCode::OK,
                &resp,
                &Bytes::from_static(b"x"),
                SystemTime::now(),
            )
            .await;

        assert!(cache.lookup(&Method::GET, &url, &req).await.is_some());
        let mut other = HeaderMap::new();
        other.insert(http::header::ACCEPT_ENCODING, "br".parse().unwrap());
        assert!(cache.lookup(&Method::GET, &url, &other).await.is_none());
    }
}

//! Cookie jar: parse, store, and select cookies per URL.
//!
//! Storage is a trie keyed by reversed domain labels; each node holds the
//! cookies scoped to exactly that domain. Selection walks the request
//! host's label path, collecting every node on the way whose cookies
//! domain-match, then filters by path, scheme, and expiry. Writes are
//! serialized behind one lock; reads see a consistent snapshot.

use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use tracing::{debug, trace};
use url::Url;

use crate::public_suffix::crosses_suffix_boundary;

/// Where a cookie write or read originates. HttpOnly cookies are invisible
/// to non-HTTP access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CookieSource {
    Http,
    NonHttp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SameSite {
    Strict,
    Lax,
    None,
}

#[derive(Debug, Clone)]
struct StoredCookie {
    name: String,
    value: String,
    /// Normalised domain, no leading dot.
    domain: String,
    /// True when no `Domain` attribute was given: exact-host match only.
    host_only: bool,
    path: String,
    secure: bool,
    http_only: bool,
    #[allow(dead_code)] // stored per RFC 6265bis; no cross-site context to enforce against
    same_site: Option<SameSite>,
    expires: Option<SystemTime>,
    created: SystemTime,
}

impl StoredCookie {
    fn expired(&self, now: SystemTime) -> bool {
        self.expires.is_some_and(|at| at <= now)
    }
}

#[derive(Default)]
struct TrieNode {
    children: HashMap<String, TrieNode>,
    cookies: Vec<StoredCookie>,
}

impl TrieNode {
    fn prune_expired(&mut self, now: SystemTime) {
        self.cookies.retain(|c| !c.expired(now));
        self.children.retain(|_, child| {
            child.prune_expired(now);
            !child.cookies.is_empty() || !child.children.is_empty()
        });
    }
}

/// The per-agent cookie jar.
pub(crate) struct CookieJar {
    root: Mutex<TrieNode>,
}

impl CookieJar {
    pub fn new() -> Self {
        Self {
            root: Mutex::new(TrieNode::default()),
        }
    }

    /// Store one raw `Set-Cookie` style string scoped to `url`.
    ///
    /// Returns false when the cookie was refused (parse failure, suffix
    /// boundary, domain mismatch, or HttpOnly from a non-HTTP source).
    pub fn add(&self, url: &Url, raw: &str, source: CookieSource) -> bool {
        let Some(host) = url.host_str() else {
            return false;
        };
        let host = host.to_ascii_lowercase();
        let Ok(parsed) = cookie::Cookie::parse(raw.trim()) else {
            trace!("unparseable cookie ignored");
            return false;
        };
        if parsed.name().is_empty() {
            return false;
        }
        if source == CookieSource::NonHttp && parsed.http_only().unwrap_or(false) {
            return false;
        }

        let (domain, host_only) = match parsed.domain() {
            Some(dom) if !dom.trim().is_empty() => {
                let dom = dom.trim().trim_start_matches('.').to_ascii_lowercase();
                if crosses_suffix_boundary(&host, &dom) {
                    debug!(domain = %dom, "cookie refused: public suffix scope");
                    return false;
                }
                if !domain_match(&host, &dom) {
                    debug!(host = %host, domain = %dom, "cookie refused: domain mismatch");
                    return false;
                }
                (dom, false)
            }
            _ => (host.clone(), true),
        };

        let path = match parsed.path() {
            Some(p) if p.starts_with('/') => p.to_string(),
            _ => default_path(url.path()),
        };

        let now = SystemTime::now();
        // Max-Age wins over Expires
        let expires = if let Some(max_age) = parsed.max_age() {
            let secs = max_age.whole_seconds();
            if secs <= 0 {
                Some(now) // immediate expiry: an eviction
            } else {
                Some(now + Duration::from_secs(secs.unsigned_abs()))
            }
        } else {
            parsed.expires_datetime().map(Into::into)
        };

        let same_site = parsed.same_site().map(|s| match s {
            cookie::SameSite::Strict => SameSite::Strict,
            cookie::SameSite::Lax => SameSite::Lax,
            cookie::SameSite::None => SameSite::None,
        });

        let stored = StoredCookie {
            name: parsed.name().to_string(),
            value: parsed.value().to_string(),
            domain: domain.clone(),
            host_only,
            path,
            secure: parsed.secure().unwrap_or(false),
            http_only: parsed.http_only().unwrap_or(false),
            same_site,
            expires,
            created: now,
        };

        let mut root = self.root.lock();
        let node = node_for_domain_mut(&mut root, &domain);
        // replace any cookie with the same (name, path); keep original
        // creation time so ordering stays stable across updates
        if let Some(existing) = node
            .cookies
            .iter_mut()
            .find(|c| c.name == stored.name && c.path == stored.path && c.host_only == stored.host_only)
        {
            let created = existing.created;
            *existing = stored;
            existing.created = created;
        } else {
            node.cookies.push(stored);
        }
        true
    }

    /// Store every `Set-Cookie` header of a response.
    pub fn store_response_cookies<'a>(&self, url: &Url, headers: impl Iterator<Item = &'a str>) {
        for raw in headers {
            self.add(url, raw, CookieSource::Http);
        }
    }

    /// The serialized `Cookie` header value for `url`, longest path first,
    /// or `None` when nothing matches.
    pub fn cookies_for(&self, url: &Url, source: CookieSource) -> Option<String> {
        let host = url.host_str()?.to_ascii_lowercase();
        let is_secure = url.scheme() == "https";
        let request_path = if url.path().is_empty() { "/" } else { url.path() };
        let now = SystemTime::now();

        let mut root = self.root.lock();
        root.prune_expired(now);

        let mut matched: Vec<StoredCookie> = Vec::new();
        collect_matching(&root, &host, &mut |node| {
            for c in &node.cookies {
                let domain_ok = if c.host_only {
                    host == c.domain
                } else {
                    domain_match(&host, &c.domain)
                };
                let path_ok = path_match(request_path, &c.path);
                let secure_ok = !c.secure || is_secure;
                let source_ok = source == CookieSource::Http || !c.http_only;
                if domain_ok && path_ok && secure_ok && source_ok {
                    matched.push(c.clone());
                }
            }
        });

        if matched.is_empty() {
            return None;
        }
        // longest path first, then earliest creation
        matched.sort_by(|a, b| {
            b.path
                .len()
                .cmp(&a.path.len())
                .then(a.created.cmp(&b.created))
        });
        Some(
            matched
                .iter()
                .map(|c| format!("{}={}", c.name, c.value))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }

    pub fn clear(&self) {
        *self.root.lock() = TrieNode::default();
    }
}

/// Walk the reversed-label path of `host`, visiting every node on the way.
fn collect_matching<'a>(root: &'a TrieNode, host: &str, visit: &mut impl FnMut(&'a TrieNode)) {
    let mut node = root;
    for label in host.rsplit('.') {
        match node.children.get(label) {
            Some(child) => {
                node = child;
                visit(node);
            }
            None => break,
        }
    }
}

fn node_for_domain_mut<'a>(root: &'a mut TrieNode, domain: &str) -> &'a mut TrieNode {
    let mut node = root;
    for label in domain.rsplit('.') {
        node = node.children.entry(label.to_string()).or_default();
    }
    node
}

/// RFC 6265 §5.1.3 domain matching.
pub(crate) fn domain_match(host: &str, domain: &str) -> bool {
    if host == domain {
        return true;
    }
    if host.parse::<std::net::IpAddr>().is_ok() {
        return false;
    }
    host.len() > domain.len()
        && host.ends_with(domain)
        && host.as_bytes()[host.len() - domain.len() - 1] == b'.'
}

/// RFC 6265 §5.1.4 path matching.
fn path_match(request_path: &str, cookie_path: &str) -> bool {
    if request_path == cookie_path {
        return true;
    }
    if request_path.starts_with(cookie_path) {
        return cookie_path.ends_with('/')
            || request_path.as_bytes().get(cookie_path.len()) == Some(&b'/');
    }
    false
}

/// RFC 6265 §5.1.4 default path from the request URI.
pub(crate) fn default_path(uri_path: &str) -> String {
    if uri_path.is_empty() || !uri_path.starts_with('/') {
        return "/".to_string();
    }
    match uri_path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => uri_path[..idx].to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_domain_match() {
        assert!(domain_match("foo.com", "foo.com"));
        assert!(domain_match("bar.foo.com", "foo.com"));
        assert!(domain_match("baz.bar.foo.com", "foo.com"));

        assert!(!domain_match("bar.foo.com", "bar.com"));
        assert!(!domain_match("bar.com", "baz.bar.com"));
        assert!(!domain_match("foo.com", "bar.com"));

        assert!(!domain_match("bar.com", "bbar.com"));
        assert!(domain_match("235.132.2.3", "235.132.2.3"));
        assert!(!domain_match("235.132.2.3", "1.1.1.1"));
    }

    #[test]
    fn test_default_path() {
        assert_eq!(default_path("/foo/bar/baz/"), "/foo/bar/baz");
        assert_eq!(default_path("/foo/bar/baz"), "/foo/bar");
        assert_eq!(default_path("/foo/"), "/foo");
        assert_eq!(default_path("/foo"), "/");
        assert_eq!(default_path("/"), "/");
        assert_eq!(default_path(""), "/");
        assert_eq!(default_path("foo"), "/");
    }

    #[test]
    fn set_and_get_round_trip() {
        let jar = CookieJar::new();
        let u = url("http://example.com/foo/bar");
        assert!(jar.add(&u, "session=abc123", CookieSource::Http));
        assert_eq!(
            jar.cookies_for(&u, CookieSource::Http).as_deref(),
            Some("session=abc123")
        );
        // host-only: subdomain does not match
        assert!(jar
            .cookies_for(&url("http://sub.example.com/foo/bar"), CookieSource::Http)
            .is_none());
        // unrelated origin gets nothing
        assert!(jar
            .cookies_for(&url("http://other.com/"), CookieSource::Http)
            .is_none());
    }

    #[test]
    fn domain_cookie_covers_subdomains() {
        let jar = CookieJar::new();
        let u = url("http://example.com/");
        assert!(jar.add(&u, "a=1; Domain=example.com", CookieSource::Http));
        assert_eq!(
            jar.cookies_for(&url("http://deep.sub.example.com/"), CookieSource::Http)
                .as_deref(),
            Some("a=1")
        );
    }

    #[test]
    fn public_suffix_domain_refused() {
        let jar = CookieJar::new();
        let u = url("http://foo.gov.ac/");
        assert!(!jar.add(&u, "a=1; Domain=gov.ac", CookieSource::Http));
        // but the suffix host itself may set a host cookie for itself
        let gov = url("http://gov.ac/");
        assert!(jar.add(&gov, "a=1; Domain=gov.ac", CookieSource::Http));
    }

    #[test]
    fn domain_not_matching_host_refused() {
        let jar = CookieJar::new();
        let u = url("http://example.com/");
        assert!(!jar.add(&u, "a=1; Domain=bazample.com", CookieSource::Http));
        assert!(!jar.add(&u, "a=1; Domain=sub.example.com", CookieSource::Http));
    }

    #[test]
    fn secure_cookie_not_sent_over_http() {
        let jar = CookieJar::new();
        let https = url("https://example.com/");
        assert!(jar.add(&https, "s=1; Secure", CookieSource::Http));
        assert!(jar
            .cookies_for(&url("http://example.com/"), CookieSource::Http)
            .is_none());
        assert_eq!(
            jar.cookies_for(&https, CookieSource::Http).as_deref(),
            Some("s=1")
        );
    }

    #[test]
    fn http_only_invisible_to_non_http_reads() {
        let jar = CookieJar::new();
        let u = url("http://example.com/");
        assert!(jar.add(&u, "h=1; HttpOnly", CookieSource::Http));
        assert!(jar.cookies_for(&u, CookieSource::NonHttp).is_none());
        assert_eq!(jar.cookies_for(&u, CookieSource::Http).as_deref(), Some("h=1"));
        // non-HTTP writes may not create HttpOnly cookies
        assert!(!jar.add(&u, "x=2; HttpOnly", CookieSource::NonHttp));
    }

    #[test]
    fn path_scoping_and_ordering() {
        let jar = CookieJar::new();
        let u = url("http://example.com/a/b/c");
        assert!(jar.add(&u, "broad=1; Path=/", CookieSource::Http));
        assert!(jar.add(&u, "narrow=2; Path=/a/b", CookieSource::Http));
        // longest path first
        assert_eq!(
            jar.cookies_for(&u, CookieSource::Http).as_deref(),
            Some("narrow=2; broad=1")
        );
        // outside the narrow path only the broad cookie is sent
        assert_eq!(
            jar.cookies_for(&url("http://example.com/z"), CookieSource::Http)
                .as_deref(),
            Some("broad=1")
        );
        // prefix without a segment boundary does not match
        assert_eq!(
            jar.cookies_for(&url("http://example.com/a/bc"), CookieSource::Http)
                .as_deref(),
            Some("broad=1")
        );
    }

    #[test]
    fn max_age_zero_evicts() {
        let jar = CookieJar::new();
        let u = url("http://example.com/");
        assert!(jar.add(&u, "gone=1; Max-Age=0", CookieSource::Http));
        assert!(jar.cookies_for(&u, CookieSource::Http).is_none());
    }

    #[test]
    fn replacement_keeps_single_cookie() {
        let jar = CookieJar::new();
        let u = url("http://example.com/");
        jar.add(&u, "a=1", CookieSource::Http);
        jar.add(&u, "a=2", CookieSource::Http);
        assert_eq!(jar.cookies_for(&u, CookieSource::Http).as_deref(), Some("a=2"));
    }

    #[test]
    fn clear_empties_jar() {
        let jar = CookieJar::new();
        let u = url("http://example.com/");
        jar.add(&u, "a=1", CookieSource::Http);
        jar.clear();
        assert!(jar.cookies_for(&u, CookieSource::Http).is_none());
    }
}

//! HTTP/3 upgrade hints: `Alt-Svc` records per origin (RFC 7838).
//!
//! Records are populated from response headers or explicit user hints,
//! checked on connect, and evicted on expiry. A failed h3 dial puts the
//! origin in a cool-down so the race is not retried immediately. Nothing
//! here persists across the agent's lifetime.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::pool::Origin;

const DEFAULT_MAX_AGE: Duration = Duration::from_secs(86_400);
const HINT_MAX_AGE: Duration = Duration::from_secs(30 * 86_400);
const FAILURE_COOLDOWN: Duration = Duration::from_secs(300);

/// An explicit HTTP/3 endpoint hint from the agent options. Pre-seeds the
/// store with a long expiry and forces a trial dial.
#[derive(Debug, Clone)]
pub struct Http3Hint {
    pub host: String,
    pub port: u16,
}

/// The h3 endpoint to race for an origin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct AltAuthority {
    /// `None` means same host as the origin.
    pub host: Option<String>,
    pub port: u16,
}

#[derive(Debug)]
struct AltSvcRecord {
    authority: AltAuthority,
    expires_at: Instant,
    /// Hint-seeded records survive `Alt-Svc: clear`.
    forced: bool,
}

/// Per-agent store of h3 alternative services.
#[derive(Default)]
pub(crate) struct AltSvcStore {
    records: Mutex<HashMap<Origin, AltSvcRecord>>,
    cooldowns: Mutex<HashMap<Origin, Instant>>,
    /// Host-keyed hints applied lazily to any https origin on that host.
    hints: Mutex<HashMap<String, u16>>,
}

impl AltSvcStore {
    pub fn with_hints(hints: &[Http3Hint]) -> Self {
        let store = Self::default();
        {
            let mut map = store.hints.lock();
            for hint in hints {
                map.insert(hint.host.to_ascii_lowercase(), hint.port);
            }
        }
        store
    }

    /// Record any `h3` advertisement in a response's `Alt-Svc` headers.
    pub fn observe<'a>(&self, origin: &Origin, alt_svc_values: impl Iterator<Item = &'a str>) {
        if !origin.https {
            return;
        }
        for value in alt_svc_values {
            if value.trim().eq_ignore_ascii_case("clear") {
                debug!(%origin, "Alt-Svc clear");
                let mut records = self.records.lock();
                if records.get(origin).is_some_and(|r| !r.forced) {
                    records.remove(origin);
                }
                continue;
            }
            for (authority, max_age) in parse_alt_svc(value) {
                trace!(%origin, port = authority.port, "recording h3 alternative");
                self.records.lock().insert(
                    origin.clone(),
                    AltSvcRecord {
                        authority,
                        expires_at: Instant::now() + max_age,
                        forced: false,
                    },
                );
            }
        }
    }

    /// The h3 endpoint to try for this origin, if any and not cooling down.
    pub fn lookup(&self, origin: &Origin) -> Option<AltAuthority> {
        if !origin.https {
            return None;
        }
        if let Some(until) = self.cooldowns.lock().get(origin) {
            if *until > Instant::now() {
                return None;
            }
        }

        let mut records = self.records.lock();
        if let Some(record) = records.get(origin) {
            if record.expires_at > Instant::now() {
                return Some(record.authority.clone());
            }
            records.remove(origin);
        }
        drop(records);

        // hints seed a record on first consultation
        let port = *self.hints.lock().get(&origin.host)?;
        let authority = AltAuthority { host: None, port };
        self.records.lock().insert(
            origin.clone(),
            AltSvcRecord {
                authority: authority.clone(),
                expires_at: Instant::now() + HINT_MAX_AGE,
                forced: true,
            },
        );
        Some(authority)
    }

    /// A failed h3 dial: evict the record and cool the origin down.
    pub fn record_failure(&self, origin: &Origin) {
        debug!(%origin, "h3 dial failed; cooling down");
        let mut records = self.records.lock();
        if records.get(origin).is_some_and(|r| !r.forced) {
            records.remove(origin);
        }
        drop(records);
        self.cooldowns
            .lock()
            .insert(origin.clone(), Instant::now() + FAILURE_COOLDOWN);
    }

    /// A successful h3 exchange clears any cool-down.
    pub fn record_success(&self, origin: &Origin) {
        self.cooldowns.lock().remove(origin);
    }
}

/// Parse one `Alt-Svc` header value into h3 authorities.
///
/// Grammar per RFC 7838: comma-separated `proto="[host]:port"` entries with
/// `;`-separated parameters. Only exact `h3` entries are kept.
fn parse_alt_svc(value: &str) -> Vec<(AltAuthority, Duration)> {
    let mut out = Vec::new();
    for entry in split_outside_quotes(value, ',') {
        let mut params = split_outside_quotes(&entry, ';').into_iter();
        let Some(first) = params.next() else { continue };
        let Some((proto, authority)) = first.split_once('=') else {
            continue;
        };
        if proto.trim() != "h3" {
            continue;
        }
        let authority = authority.trim().trim_matches('"');
        let Some(authority) = parse_authority(authority) else {
            continue;
        };

        let mut max_age = DEFAULT_MAX_AGE;
        for param in params {
            if let Some((key, val)) = param.split_once('=') {
                if key.trim().eq_ignore_ascii_case("ma") {
                    if let Ok(secs) = val.trim().trim_matches('"').parse::<u64>() {
                        max_age = Duration::from_secs(secs);
                    }
                }
            }
        }
        out.push((authority, max_age));
    }
    out
}

/// `[host]:port` with the host part optional; bracketed IPv6 accepted.
fn parse_authority(s: &str) -> Option<AltAuthority> {
    let (host, port) = if let Some(rest) = s.strip_prefix('[') {
        let (host, rest) = rest.split_once(']')?;
        (Some(host.to_string()), rest.strip_prefix(':')?)
    } else {
        match s.rsplit_once(':') {
            Some(("", port)) => (None, port),
            Some((host, port)) => (Some(host.to_string()), port),
            None => return None,
        }
    };
    let port: u16 = port.trim().parse().ok()?;
    Some(AltAuthority {
        host: host.filter(|h| !h.is_empty()),
        port,
    })
}

fn split_outside_quotes(s: &str, sep: char) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    for c in s.chars() {
        match c {
            '"' => {
                quoted = !quoted;
                current.push(c);
            }
            c if c == sep && !quoted => {
                if !current.trim().is_empty() {
                    out.push(current.trim().to_string());
                }
                current = String::new();
            }
            c => current.push(c),
        }
    }
    if !current.trim().is_empty() {
        out.push(current.trim().to_string());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;

    fn origin(url: &str) -> Origin {
        Origin::from_url(&Url::parse(url).unwrap()).unwrap()
    }

    #[test]
    fn parses_simple_h3_advertisement() {
        let entries = parse_alt_svc("h3=\":443\"; ma=2592000");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, AltAuthority { host: None, port: 443 });
        assert_eq!(entries[0].1, Duration::from_secs(2_592_000));
    }

    #[test]
    fn ignores_other_protocols_and_drafts() {
        assert!(parse_alt_svc("h2=\":443\"").is_empty());
        assert!(parse_alt_svc("h3-29=\":443\"; ma=86400").is_empty());
        let mixed = parse_alt_svc("h3-29=\":443\", h3=\":8443\"");
        assert_eq!(mixed.len(), 1);
        assert_eq!(mixed[0].0.port, 8443);
    }

    #[test]
    fn parses_explicit_host_and_defaults_ma() {
        let entries = parse_alt_svc("h3=\"alt.example.com:443\"");
        assert_eq!(entries[0].0.host.as_deref(), Some("alt.example.com"));
        assert_eq!(entries[0].1, DEFAULT_MAX_AGE);
    }

    #[test]
    fn observe_then_lookup() {
        let store = AltSvcStore::default();
        let https_origin = origin("https://example.com/");
        store.observe(&https_origin, std::iter::once("h3=\":443\"; ma=60"));
        assert_eq!(
            store.lookup(&https_origin),
            Some(AltAuthority { host: None, port: 443 })
        );
        // plaintext origins never upgrade
        assert!(store.lookup(&origin("http://example.com/")).is_none());
    }

    #[test]
    fn clear_evicts_record() {
        let store = AltSvcStore::default();
        let origin = origin("https://example.com/");
        store.observe(&origin, std::iter::once("h3=\":443\""));
        store.observe(&origin, std::iter::once("clear"));
        assert!(store.lookup(&origin).is_none());
    }

    #[test]
    fn failure_cools_down_and_success_restores() {
        let store = AltSvcStore::default();
        let origin = origin("https://example.com/");
        store.observe(&origin, std::iter::once("h3=\":443\""));
        store.record_failure(&origin);
        assert!(store.lookup(&origin).is_none());
        store.record_success(&origin);
        // record itself was evicted along with the cooldown
        assert!(store.lookup(&origin).is_none());
    }

    #[test]
    fn hints_seed_forced_records() {
        let store = AltSvcStore::with_hints(&[Http3Hint {
            host: "example.com".into(),
            port: 443,
        }]);
        let origin = origin("https://example.com/");
        assert_eq!(
            store.lookup(&origin),
            Some(AltAuthority { host: None, port: 443 })
        );
        // forced records survive a clear
        store.observe(&origin, std::iter::once("clear"));
        assert!(store.lookup(&origin).is_some());
    }
}

//! Public-suffix boundary checks for cookie `Domain` attributes.
//!
//! A compact table of the registry-controlled suffixes most commonly hit,
//! plus the single-label rule. Domains equal to a suffix are refused as
//! cookie scopes unless the request host is exactly that suffix.

/// Registry-controlled second-level suffixes and widely used hosting
/// suffixes. Single labels (`com`, `uk`, ...) are covered by the
/// label-count rule and are not listed.
const MULTI_LABEL_SUFFIXES: &[&str] = &[
    "co.uk", "org.uk", "ac.uk", "gov.uk", "me.uk", "net.uk", "ltd.uk", "plc.uk",
    "com.au", "net.au", "org.au", "edu.au", "gov.au", "asn.au", "id.au",
    "co.nz", "net.nz", "org.nz", "govt.nz", "ac.nz",
    "co.jp", "ne.jp", "or.jp", "ac.jp", "go.jp", "ad.jp",
    "com.br", "net.br", "org.br", "gov.br",
    "com.cn", "net.cn", "org.cn", "gov.cn", "edu.cn",
    "co.in", "net.in", "org.in", "firm.in", "gen.in",
    "com.mx", "org.mx", "net.mx",
    "com.ar", "com.tr", "com.sg", "com.hk", "com.tw", "com.my", "com.ph",
    "co.za", "org.za", "co.kr", "or.kr", "co.il", "org.il", "co.id", "or.id",
    "gov.ac", "com.ac", "org.ac", "net.ac",
    // hosting providers that delegate subdomains to mutually
    // untrusting users
    "github.io", "gitlab.io", "herokuapp.com", "netlify.app", "vercel.app",
    "web.app", "firebaseapp.com", "blogspot.com", "amazonaws.com",
    "cloudfront.net", "fastly.net", "azurewebsites.net", "workers.dev",
    "pages.dev", "s3.amazonaws.com",
];

/// True when `domain` is a public suffix: no cookie may claim it as scope.
pub(crate) fn is_public_suffix(domain: &str) -> bool {
    let domain = domain.trim_matches('.');
    if domain.is_empty() {
        return true;
    }
    // IP addresses are never suffixes; they are host-only scopes
    if domain.parse::<std::net::IpAddr>().is_ok() {
        return false;
    }
    let labels = domain.split('.').count();
    if labels == 1 {
        return true;
    }
    let lower = domain.to_ascii_lowercase();
    MULTI_LABEL_SUFFIXES.contains(&lower.as_str())
}

/// True when scoping a cookie to `domain` from `host` would cross the
/// public-suffix boundary. Setting a cookie *for* the suffix itself is only
/// allowed when the host is exactly that suffix.
pub(crate) fn crosses_suffix_boundary(host: &str, domain: &str) -> bool {
    is_public_suffix(domain) && !host.eq_ignore_ascii_case(domain)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_labels_are_suffixes() {
        assert!(is_public_suffix("com"));
        assert!(is_public_suffix("uk"));
        assert!(is_public_suffix("localhost"));
    }

    #[test]
    fn registry_two_level_suffixes() {
        assert!(is_public_suffix("co.uk"));
        assert!(is_public_suffix("gov.ac"));
        assert!(is_public_suffix("github.io"));
        assert!(!is_public_suffix("example.co.uk"));
        assert!(!is_public_suffix("example.com"));
    }

    #[test]
    fn ip_addresses_are_not_suffixes() {
        assert!(!is_public_suffix("127.0.0.1"));
        assert!(!is_public_suffix("::1"));
    }

    #[test]
    fn boundary_allows_exact_suffix_host() {
        // a site served from gov.ac itself may scope to gov.ac
        assert!(!crosses_suffix_boundary("gov.ac", "gov.ac"));
        // but foo.gov.ac may not widen to the whole registry
        assert!(crosses_suffix_boundary("foo.gov.ac", "gov.ac"));
        assert!(crosses_suffix_boundary("example.com", "com"));
        assert!(!crosses_suffix_boundary("example.com", "example.com"));
    }
}

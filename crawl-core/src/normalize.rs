//! Deterministic URL canonicalization.
//!
//! The normalized form is the dedup key for the whole crawl, so this must be
//! idempotent: `normalize(normalize(u)) == normalize(u)`.

/// Query parameters dropped during normalization. Tracking decorations only;
/// they never change the resource identity.
fn is_tracking_param(key: &str) -> bool {
    key.starts_with("utm_") || key == "fbclid" || key == "gclid"
}

/// Canonicalize a URL: lowercase host, strip default ports, strip the
/// trailing slash (except on the root path), drop the fragment, drop tracking
/// parameters, and sort the remaining query parameters by key. The scheme is
/// preserved. Invalid URLs pass through unchanged; they fail the downstream
/// in-domain filter instead.
pub fn normalize_url(raw: &str) -> String {
    let Ok(mut url) = url::Url::parse(raw) else {
        return raw.to_owned();
    };
    if url.cannot_be_a_base() {
        return raw.to_owned();
    }

    url.set_fragment(None);

    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    pairs.retain(|(key, _)| !is_tracking_param(key));
    // Stable sort: repeated keys keep their relative order.
    pairs.sort_by(|a, b| a.0.cmp(&b.0));
    if pairs.is_empty() {
        url.set_query(None);
    } else {
        let mut serializer = url.query_pairs_mut();
        serializer.clear();
        for (key, value) in &pairs {
            serializer.append_pair(key, value);
        }
        drop(serializer);
    }

    let path = url.path().to_owned();
    if path.len() > 1 && path.ends_with('/') {
        url.set_path(path.trim_end_matches('/'));
    }

    url.to_string()
}

/// The lowercased host of a URL, when it has one.
pub fn host_of(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    parsed.host_str().map(|host| host.to_ascii_lowercase())
}

/// Whether a URL belongs to the crawl domain: its host equals the domain or
/// is a subdomain of it.
pub fn in_domain(url: &str, domain: &str) -> bool {
    match host_of(url) {
        Some(host) => host == domain || host.ends_with(&format!(".{domain}")),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_is_idempotent() {
        let inputs = [
            "https://Example.COM:443/path/?b=2&a=1#frag",
            "http://a.test/a/",
            "https://a.test/a?utm_source=x&q=1",
            "https://a.test/?a",
            "not a url at all",
            "https://a.test/x%20y?k=v%26w",
        ];
        for input in inputs {
            let once = normalize_url(input);
            assert_eq!(normalize_url(&once), once, "not idempotent for {input}");
        }
    }

    #[test]
    fn equivalent_urls_collapse() {
        // The dedup scenario: all four address the same target.
        let target = normalize_url("https://a.test/a");
        assert_eq!(normalize_url("https://a.test/a/"), target);
        assert_eq!(normalize_url("https://a.test/a?utm_source=x"), target);
        assert_eq!(normalize_url("https://a.test/a#top"), target);
    }

    #[test]
    fn host_and_port_are_canonicalized() {
        assert_eq!(
            normalize_url("https://EXAMPLE.com:443/x"),
            "https://example.com/x"
        );
        assert_eq!(
            normalize_url("http://example.com:80/x"),
            "http://example.com/x"
        );
        // Non-default ports survive.
        assert_eq!(
            normalize_url("http://example.com:8080/x"),
            "http://example.com:8080/x"
        );
    }

    #[test]
    fn root_keeps_its_slash() {
        assert_eq!(normalize_url("https://a.test/"), "https://a.test/");
        assert_eq!(normalize_url("https://a.test"), "https://a.test/");
    }

    #[test]
    fn query_params_are_sorted_and_filtered() {
        assert_eq!(
            normalize_url("https://a.test/p?z=1&a=2&utm_campaign=x&fbclid=y&gclid=z"),
            "https://a.test/p?a=2&z=1"
        );
        // Dropping every param drops the '?' too.
        assert_eq!(
            normalize_url("https://a.test/p?utm_source=x"),
            "https://a.test/p"
        );
    }

    #[test]
    fn invalid_urls_pass_through() {
        assert_eq!(normalize_url("::::"), "::::");
        assert_eq!(normalize_url(""), "");
    }

    #[test]
    fn in_domain_accepts_subdomains_only() {
        assert!(in_domain("https://a.test/x", "a.test"));
        assert!(in_domain("https://www.a.test/x", "a.test"));
        assert!(in_domain("https://deep.sub.a.test/x", "a.test"));
        assert!(!in_domain("https://aa.test/x", "a.test"));
        assert!(!in_domain("https://nota.test/x", "a.test"));
        assert!(!in_domain("https://a.test.evil.com/x", "a.test"));
        assert!(!in_domain("not a url", "a.test"));
    }

    #[test]
    fn normalization_preserves_in_domain() {
        // normalize(u1) == normalize(u2) implies in_domain(u1) == in_domain(u2)
        let pairs = [
            ("https://A.TEST/x", "https://a.test/x"),
            ("https://sub.a.test/y/", "https://sub.a.test/y"),
        ];
        for (u1, u2) in pairs {
            assert_eq!(normalize_url(u1), normalize_url(u2));
            assert_eq!(in_domain(u1, "a.test"), in_domain(u2, "a.test"));
        }
    }
}

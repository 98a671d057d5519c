//! Request keys for deterministic HAR lookup

use std::fmt;

use sha2::{Digest, Sha256};

/// Identity of a request within an archive: method, normalized URL and body hash
///
/// Keys need not be unique; repeated calls to the same URL share a key and
/// are replayed in recording order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestKey {
    /// Uppercase method
    pub method: String,
    /// URL with query parameters sorted and fragment dropped
    pub url: String,
    /// SHA-256 of the body, hex encoded
    pub body_hash: String,
}

impl RequestKey {
    /// Compute the key for a request
    #[must_use]
    pub fn new(method: &str, url: &str, body: &[u8]) -> Self {
        Self {
            method: method.to_ascii_uppercase(),
            url: normalize_url(url),
            body_hash: hash_body(body),
        }
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hash = self.body_hash.get(..12).unwrap_or(self.body_hash.as_str());
        write!(f, "{} {} [{}]", self.method, self.url, hash)
    }
}

/// SHA-256 of a body, hex encoded
#[must_use]
pub fn hash_body(body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body);
    hex::encode(hasher.finalize())
}

/// Split a URL's query string into decoded name/value pairs, in order
#[must_use]
pub fn split_query(url: &str) -> Vec<(String, String)> {
    let without_fragment = url.split('#').next().unwrap_or_default();
    let Some((_, query)) = without_fragment.split_once('?') else {
        return Vec::new();
    };

    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
            (decode(name), decode(value))
        })
        .collect()
}

fn decode(component: &str) -> String {
    let spaced = component.replace('+', " ");
    urlencoding::decode(&spaced)
        .map(|s| s.into_owned())
        .unwrap_or(spaced)
}

/// Normalize a URL for key comparison
///
/// Query parameters are sorted (stable, by name then value) and re-encoded;
/// the fragment is dropped; a missing path becomes `/`.
#[must_use]
pub fn normalize_url(url: &str) -> String {
    let trimmed = url.trim();
    let without_fragment = trimmed.split('#').next().unwrap_or_default();
    let base = without_fragment
        .split_once('?')
        .map_or(without_fragment, |(base, _)| base);

    let mut normalized = ensure_path(base);

    let mut query = split_query(without_fragment);
    if !query.is_empty() {
        query.sort();
        let encoded: Vec<String> = query
            .iter()
            .map(|(name, value)| {
                format!("{}={}", urlencoding::encode(name), urlencoding::encode(value))
            })
            .collect();
        normalized.push('?');
        normalized.push_str(&encoded.join("&"));
    }

    normalized
}

fn ensure_path(base: &str) -> String {
    match base.find("://") {
        Some(scheme_end) if !base[scheme_end + 3..].contains('/') => format!("{base}/"),
        _ => base.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_deterministic() {
        let a = RequestKey::new("GET", "http://example.com/api?x=1", b"");
        let b = RequestKey::new("GET", "http://example.com/api?x=1", b"");
        assert_eq!(a, b, "Key must be deterministic");
    }

    #[test]
    fn test_method_case_normalized() {
        let a = RequestKey::new("post", "http://example.com/api", b"{}");
        let b = RequestKey::new("POST", "http://example.com/api", b"{}");
        assert_eq!(a, b);
        assert_eq!(a.method, "POST");
    }

    #[test]
    fn test_query_order_independence() {
        let a = RequestKey::new("GET", "http://example.com/s?b=2&a=1", b"");
        let b = RequestKey::new("GET", "http://example.com/s?a=1&b=2", b"");
        assert_eq!(a, b, "Query parameter order should not affect the key");
    }

    #[test]
    fn test_body_distinguishes_keys() {
        let a = RequestKey::new("POST", "http://example.com/api", b"one");
        let b = RequestKey::new("POST", "http://example.com/api", b"two");
        assert_ne!(a, b);
    }

    #[test]
    fn test_display_abbreviates_hash() {
        let key = RequestKey::new("GET", "http://example.com/api", b"");
        assert_eq!(
            key.to_string(),
            format!("GET http://example.com/api [{}]", &key.body_hash[..12])
        );

        let short = RequestKey {
            method: "GET".to_string(),
            url: "http://example.com/".to_string(),
            body_hash: "abc".to_string(),
        };
        assert_eq!(short.to_string(), "GET http://example.com/ [abc]");
    }

    #[test]
    fn test_normalize_url() {
        assert_eq!(normalize_url("http://example.com"), "http://example.com/");
        assert_eq!(
            normalize_url("http://example.com/p?q=a%20b#frag"),
            "http://example.com/p?q=a%20b"
        );
        assert_eq!(
            normalize_url("http://example.com/p?q=a+b"),
            "http://example.com/p?q=a%20b"
        );
        assert_eq!(normalize_url("  http://example.com/p  "), "http://example.com/p");
    }

    #[test]
    fn test_split_query() {
        let pairs = split_query("http://x/p?a=1&flag&b=two%2Fthree");
        assert_eq!(
            pairs,
            vec![
                ("a".to_string(), "1".to_string()),
                ("flag".to_string(), String::new()),
                ("b".to_string(), "two/three".to_string()),
            ]
        );
        assert!(split_query("http://x/p").is_empty());
    }

    #[test]
    fn test_hash_body_empty() {
        assert_eq!(
            hash_body(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}

//! URL canonicalization and content fingerprinting.

use sha2::{Digest, Sha256};
use url::Url;

use crate::error::FetchError;

/// Parse and normalize a URL for frontier storage: https/http only,
/// fragment dropped, empty path becomes "/". The `url` crate already
/// lowercases the host and strips default ports.
pub fn canonicalize(raw: &str) -> Result<Url, FetchError> {
    let mut url = Url::parse(raw.trim()).map_err(|e| FetchError::InvalidUrl {
        url: raw.to_string(),
        reason: e.to_string(),
    })?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(FetchError::InvalidUrl {
            url: raw.to_string(),
            reason: format!("unsupported scheme {}", url.scheme()),
        });
    }
    if url.host_str().is_none() {
        return Err(FetchError::InvalidUrl {
            url: raw.to_string(),
            reason: "missing host".into(),
        });
    }
    url.set_fragment(None);
    if url.path().is_empty() {
        url.set_path("/");
    }
    Ok(url)
}

/// Dedup fingerprint of a canonical URL.
pub fn url_hash(url: &Url) -> String {
    let mut hasher = Sha256::new();
    hasher.update(url.as_str().as_bytes());
    hex::encode(hasher.finalize())
}

/// SHA-256 fingerprint of extracted content, whitespace-normalized so
/// markup reflows do not read as content changes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContentHash(String);

impl ContentHash {
    pub fn from_content(content: &str) -> Self {
        let normalized = normalize_content(content);
        let mut hasher = Sha256::new();
        hasher.update(normalized.as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_hex(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

fn normalize_content(content: &str) -> String {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonicalize_drops_fragment_and_normalizes() {
        let url = canonicalize("HTTPS://Example.test:443/a/b#section").unwrap();
        assert_eq!(url.as_str(), "https://example.test/a/b");

        let url = canonicalize("http://example.test").unwrap();
        assert_eq!(url.path(), "/");
    }

    #[test]
    fn canonicalize_rejects_non_http_schemes() {
        assert!(matches!(
            canonicalize("ftp://example.test/file"),
            Err(FetchError::InvalidUrl { .. })
        ));
        assert!(matches!(
            canonicalize("not a url"),
            Err(FetchError::InvalidUrl { .. })
        ));
    }

    #[test]
    fn url_hash_is_stable_for_equivalent_spellings() {
        let a = canonicalize("https://example.test/page#top").unwrap();
        let b = canonicalize("https://EXAMPLE.test/page").unwrap();
        assert_eq!(url_hash(&a), url_hash(&b));

        let c = canonicalize("http://example.test/page").unwrap();
        assert_ne!(url_hash(&a), url_hash(&c));
    }

    #[test]
    fn content_hash_ignores_whitespace_reflow() {
        let a = ContentHash::from_content("Breaking news\n\n  body text  \n");
        let b = ContentHash::from_content("Breaking news\nbody text");
        assert_eq!(a, b);

        let c = ContentHash::from_content("Breaking news\nother body");
        assert_ne!(a, c);
        assert_eq!(a.as_hex().len(), 64);
    }
}

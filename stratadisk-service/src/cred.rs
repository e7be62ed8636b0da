//! Registry credential resolution
//!
//! The remote blob filesystem calls back here on an auth challenge:
//! given the image's blob URL, walk its host / namespace / repository
//! prefixes against the credential document and return the pair stored
//! under the longest matching prefix. Empty credentials are a valid
//! "no match" answer.

use std::collections::HashMap;
use std::path::Path;

use base64::Engine;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::{Result, ServiceError};

/// A resolved username/password pair; both empty when nothing matched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credential {
    pub username: String,
    pub password: String,
}

impl Credential {
    /// Whether the resolver found anything
    pub fn is_empty(&self) -> bool {
        self.username.is_empty() && self.password.is_empty()
    }
}

/// One entry of the credential document: either a base-64 `user:pass`
/// token or an explicit pair.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthEntry {
    #[serde(default)]
    auth: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
}

/// The credential document: `host_or_prefix -> entry`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CredentialDocument {
    #[serde(default)]
    auths: HashMap<String, AuthEntry>,
}

impl CredentialDocument {
    /// Load from a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Ok(serde_json::from_str(&text)?)
    }
}

/// The addressable parts of a blob URL: the registry host followed by
/// the repository path segments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    pub segments: Vec<String>,
}

impl ImageRef {
    /// Prefixes to match, shortest first: `host`, `host/ns`,
    /// `host/ns/repo`, ...
    pub fn prefixes(&self) -> Vec<String> {
        let mut out = Vec::with_capacity(self.segments.len());
        let mut prefix = String::new();
        for seg in &self.segments {
            if !prefix.is_empty() {
                prefix.push('/');
            }
            prefix.push_str(seg);
            out.push(prefix.clone());
        }
        out
    }
}

/// Parse a repository blob URL (`https://host/v2/ns/repo/blobs`) into
/// its host and repository segments.
///
/// Malformed URLs (missing scheme, empty host, no repository path) are
/// rejected explicitly rather than resolving to an empty reference.
pub fn parse_blob_url(url: &str) -> Result<ImageRef> {
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .ok_or_else(|| ServiceError::Auth(format!("blob url has no scheme: {}", url)))?;

    let words: Vec<&str> = rest.split('/').filter(|w| !w.is_empty()).collect();
    // host / v2 / <repo segments...> / blobs
    if words.len() < 4 {
        return Err(ServiceError::Auth(format!("malformed blob url: {}", url)));
    }

    let mut segments = vec![words[0].to_string()];
    for word in &words[2..words.len() - 1] {
        segments.push((*word).to_string());
    }
    Ok(ImageRef { segments })
}

/// Resolve the credential for `blob_url` from `doc`: the longest
/// matching prefix wins. Returns an empty credential when no prefix
/// matches.
pub fn resolve_credential(doc: &CredentialDocument, blob_url: &str) -> Result<Credential> {
    let image_ref = parse_blob_url(blob_url)?;

    for prefix in image_ref.prefixes().iter().rev() {
        let Some(entry) = doc.auths.get(prefix) else {
            continue;
        };
        debug!("credential prefix match: {}", prefix);

        if let Some(token) = &entry.auth {
            let decoded = match base64::engine::general_purpose::STANDARD.decode(token) {
                Ok(bytes) => match String::from_utf8(bytes) {
                    Ok(s) => s,
                    Err(_) => {
                        warn!("credential for {} is not valid UTF-8", prefix);
                        continue;
                    }
                },
                Err(e) => {
                    warn!("bad base64 credential for {}: {}", prefix, e);
                    continue;
                }
            };
            let Some((username, password)) = decoded.split_once(':') else {
                warn!("base64 credential for {} has no ':' separator", prefix);
                continue;
            };
            return Ok(Credential {
                username: username.to_string(),
                password: password.to_string(),
            });
        }

        if let (Some(username), Some(password)) = (&entry.username, &entry.password) {
            return Ok(Credential {
                username: username.clone(),
                password: password.clone(),
            });
        }
    }

    Ok(Credential::default())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(json: &str) -> CredentialDocument {
        serde_json::from_str(json).unwrap()
    }

    const URL: &str = "https://registry.example.com/v2/library/app/blobs";

    #[test]
    fn test_parse_blob_url() {
        let r = parse_blob_url(URL).unwrap();
        assert_eq!(
            r.segments,
            vec!["registry.example.com", "library", "app"]
        );
        assert_eq!(
            r.prefixes(),
            vec![
                "registry.example.com",
                "registry.example.com/library",
                "registry.example.com/library/app",
            ]
        );
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(parse_blob_url("registry.example.com/v2/x/blobs").is_err());
        assert!(parse_blob_url("https://host").is_err());
        assert!(parse_blob_url("https:///v2/a/blobs").is_err());
    }

    #[test]
    fn test_base64_token() {
        let d = doc(
            r#"{"auths": {"registry.example.com": {"auth": "dXNlcjpwYXNz"}}}"#, // user:pass
        );
        let c = resolve_credential(&d, URL).unwrap();
        assert_eq!(c.username, "user");
        assert_eq!(c.password, "pass");
    }

    #[test]
    fn test_explicit_pair() {
        let d = doc(
            r#"{"auths": {"registry.example.com/library": {
                "username": "alice", "password": "s3cret"}}}"#,
        );
        let c = resolve_credential(&d, URL).unwrap();
        assert_eq!(c.username, "alice");
        assert_eq!(c.password, "s3cret");
    }

    #[test]
    fn test_longest_prefix_wins() {
        let d = doc(
            r#"{"auths": {
                "registry.example.com": {"username": "host-wide", "password": "a"},
                "registry.example.com/library/app": {"username": "repo", "password": "b"}
            }}"#,
        );
        let c = resolve_credential(&d, URL).unwrap();
        assert_eq!(c.username, "repo");
    }

    #[test]
    fn test_no_match_is_empty() {
        let d = doc(r#"{"auths": {"other.example.com": {"auth": "dXNlcjpwYXNz"}}}"#);
        let c = resolve_credential(&d, URL).unwrap();
        assert!(c.is_empty());
    }

    #[test]
    fn test_bad_token_falls_back_to_shorter_prefix() {
        let d = doc(
            r#"{"auths": {
                "registry.example.com": {"username": "fallback", "password": "x"},
                "registry.example.com/library/app": {"auth": "no-colon-here!"}
            }}"#,
        );
        let c = resolve_credential(&d, URL).unwrap();
        assert_eq!(c.username, "fallback");
    }
}

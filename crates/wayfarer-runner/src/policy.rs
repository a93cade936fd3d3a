//! URL allow/deny lists applied to every navigation the engine causes.

use serde::{Deserialize, Serialize};
use url::Url;

use crate::{Error, Result};

/// Host-based navigation policy.
///
/// Patterns match the host itself and any subdomain; a leading `*.` is
/// accepted and ignored. Deny wins over allow. An empty allow list admits
/// every host not denied.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UrlPolicy {
    pub allow: Vec<String>,
    pub deny: Vec<String>,
}

impl UrlPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allow(mut self, host: impl Into<String>) -> Self {
        self.allow.push(host.into());
        self
    }

    pub fn deny(mut self, host: impl Into<String>) -> Self {
        self.deny.push(host.into());
        self
    }

    /// `Ok` if the engine may navigate to `raw`.
    pub fn check(&self, raw: &str) -> Result<()> {
        let url = Url::parse(raw).map_err(|e| Error::InvalidInput(format!("bad url '{}': {}", raw, e)))?;

        match url.scheme() {
            "http" | "https" => {}
            "about" | "data" => return Ok(()),
            other => {
                return Err(Error::PolicyViolation(format!(
                    "scheme '{}' is not allowed: {}",
                    other, raw
                )))
            }
        }

        let host = url.host_str().unwrap_or_default().to_ascii_lowercase();
        if self.deny.iter().any(|p| host_matches(&host, p)) {
            return Err(Error::PolicyViolation(format!("{} is denied", host)));
        }
        if !self.allow.is_empty() && !self.allow.iter().any(|p| host_matches(&host, p)) {
            return Err(Error::PolicyViolation(format!(
                "{} is not in the allow list",
                host
            )));
        }
        Ok(())
    }
}

fn host_matches(host: &str, pattern: &str) -> bool {
    let pattern = pattern.trim().trim_start_matches("*.").to_ascii_lowercase();
    if pattern.is_empty() {
        return false;
    }
    host == pattern
        || host
            .strip_suffix(pattern.as_str())
            .is_some_and(|rest| rest.ends_with('.'))
}

/// Add `https://` to bare hosts like `example.com/path`.
pub fn normalize_url(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.contains("://") || trimmed.starts_with("about:") || trimmed.starts_with("data:") {
        trimmed.to_string()
    } else {
        format!("https://{}", trimmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_policy_allows_web() {
        let policy = UrlPolicy::new();
        assert!(policy.check("https://example.com/a").is_ok());
        assert!(policy.check("about:blank").is_ok());
    }

    #[test]
    fn test_blocks_local_schemes() {
        let policy = UrlPolicy::new();
        assert!(matches!(
            policy.check("file:///etc/passwd"),
            Err(Error::PolicyViolation(_))
        ));
        assert!(matches!(
            policy.check("chrome://settings"),
            Err(Error::PolicyViolation(_))
        ));
    }

    #[test]
    fn test_allow_list_with_subdomains() {
        let policy = UrlPolicy::new().allow("example.com");
        assert!(policy.check("https://example.com").is_ok());
        assert!(policy.check("https://shop.example.com/cart").is_ok());
        assert!(policy.check("https://badexample.com").is_err());
        assert!(policy.check("https://other.org").is_err());
    }

    #[test]
    fn test_deny_wins() {
        let policy = UrlPolicy::new().allow("example.com").deny("*.admin.example.com");
        assert!(policy.check("https://www.example.com").is_ok());
        assert!(matches!(
            policy.check("https://eu.admin.example.com"),
            Err(Error::PolicyViolation(_))
        ));
    }

    #[test]
    fn test_invalid_url() {
        assert!(matches!(
            UrlPolicy::new().check("not a url"),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_normalize_url() {
        assert_eq!(normalize_url("example.com/x"), "https://example.com/x");
        assert_eq!(normalize_url("http://a.b"), "http://a.b");
        assert_eq!(normalize_url("about:blank"), "about:blank");
    }
}

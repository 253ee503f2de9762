//! Identification credential checks.
//!
//! The session dispatcher only needs a yes/no answer per identification;
//! how credentials are issued and stored lives outside the relay.

use std::collections::HashMap;

use tracing::debug;

use crate::registry::Role;

/// Decides whether a peer may identify as `id`.
pub trait Authenticator: Send + Sync {
    /// `true` if `id` presenting `token` may take `role`.
    fn authenticate(&self, role: Role, id: &str, token: Option<&str>) -> bool;
}

/// Accepts every identification.
#[derive(Clone, Copy, Debug, Default)]
pub struct AllowAll;

impl Authenticator for AllowAll {
    fn authenticate(&self, _role: Role, _id: &str, _token: Option<&str>) -> bool {
        true
    }
}

/// Per-id shared secrets from configuration.
///
/// An id with a configured secret must present it. An id without one is
/// accepted unless `require_credentials` is set.
#[derive(Clone, Debug, Default)]
pub struct StaticCredentials {
    secrets: HashMap<String, String>,
    require_credentials: bool,
}

impl StaticCredentials {
    /// Build from an id → secret map.
    pub fn new(secrets: HashMap<String, String>, require_credentials: bool) -> Self {
        Self {
            secrets,
            require_credentials,
        }
    }
}

impl Authenticator for StaticCredentials {
    fn authenticate(&self, role: Role, id: &str, token: Option<&str>) -> bool {
        match (self.secrets.get(id), token) {
            (Some(expected), Some(provided)) => safe_equal(expected, provided),
            (Some(_), None) => {
                debug!(%role, id, "credential required but not presented");
                false
            }
            (None, _) => !self.require_credentials,
        }
    }
}

/// Check the controller's connect-time token against the configured one.
///
/// With no configured token the controller path is disabled.
pub fn admin_token_matches(expected: Option<&str>, provided: Option<&str>) -> bool {
    match (expected, provided) {
        (Some(expected), Some(provided)) => safe_equal(expected, provided),
        _ => false,
    }
}

/// Constant-time string comparison.
fn safe_equal(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let diff = a
        .as_bytes()
        .iter()
        .zip(b.as_bytes())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y));
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds(require: bool) -> StaticCredentials {
        let mut secrets = HashMap::new();
        let _ = secrets.insert("AGENT001".to_string(), "s3cret".to_string());
        StaticCredentials::new(secrets, require)
    }

    #[test]
    fn allow_all_accepts_anything() {
        assert!(AllowAll.authenticate(Role::Worker, "x", None));
    }

    #[test]
    fn configured_id_needs_matching_token() {
        let c = creds(false);
        assert!(c.authenticate(Role::Worker, "AGENT001", Some("s3cret")));
        assert!(!c.authenticate(Role::Worker, "AGENT001", Some("wrong")));
        assert!(!c.authenticate(Role::Worker, "AGENT001", Some("s3cre")));
        assert!(!c.authenticate(Role::Worker, "AGENT001", None));
    }

    #[test]
    fn unknown_id_follows_require_flag() {
        assert!(creds(false).authenticate(Role::BatchCaller, "other", None));
        assert!(!creds(true).authenticate(Role::BatchCaller, "other", Some("x")));
    }

    #[test]
    fn admin_token_checks() {
        assert!(admin_token_matches(Some("abc"), Some("abc")));
        assert!(!admin_token_matches(Some("abc"), Some("abd")));
        assert!(!admin_token_matches(Some("abc"), None));
        assert!(!admin_token_matches(None, Some("abc")));
        assert!(!admin_token_matches(None, None));
    }
}

//! Viewer login.

use std::collections::HashMap;

use protocol::messages::{LoginRequest, Outcome};
use protocol::InstanceType;
use tracing::{info, warn};

use crate::config::AuthConfig;

/// Checks login requests against the configured accounts.
#[derive(Debug, Clone, Default)]
pub struct Authenticator {
    require_login: bool,
    /// username -> lowercase hex SHA-256 of the password
    users: HashMap<String, String>,
}

impl Authenticator {
    pub fn new(config: &AuthConfig) -> Self {
        let users = config
            .users
            .iter()
            .map(|user| (user.username.clone(), user.password_sha256.to_lowercase()))
            .collect();
        Self {
            require_login: config.require_login,
            users,
        }
    }

    /// Whether an instance of this type must log in before it is established.
    pub fn requires_login(&self, instance: InstanceType) -> bool {
        self.require_login && instance.requires_login()
    }

    /// Check a login request.
    ///
    /// Unknown users and wrong passwords get the same comment.
    pub fn check(&self, request: &LoginRequest) -> Outcome {
        let accepted = self
            .users
            .get(&request.username)
            .is_some_and(|expected| hashes_match(expected, &request.password));

        if accepted {
            info!(username = %request.username, "Login accepted");
            Outcome::success()
        } else {
            warn!(username = %request.username, "Login rejected");
            Outcome::failure("invalid username or password")
        }
    }

    /// Number of configured accounts.
    pub fn user_count(&self) -> usize {
        self.users.len()
    }
}

/// Compare without exiting early on the first differing byte.
fn hashes_match(expected: &str, presented: &str) -> bool {
    let presented = presented.to_ascii_lowercase();
    expected.len() == presented.len()
        && expected
            .bytes()
            .zip(presented.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UserEntry;
    use protocol::messages::hash_password;

    fn authenticator() -> Authenticator {
        Authenticator::new(&AuthConfig {
            require_login: true,
            users: vec![UserEntry {
                username: "admin".to_string(),
                password_sha256: hash_password("secret").to_uppercase(),
            }],
        })
    }

    #[test]
    fn test_valid_credentials() {
        let outcome = authenticator().check(&LoginRequest::new("admin", "secret"));
        assert!(outcome.result);
    }

    #[test]
    fn test_wrong_password() {
        let outcome = authenticator().check(&LoginRequest::new("admin", "guess"));
        assert!(!outcome.result);
        assert_eq!(outcome.comment, "invalid username or password");
    }

    #[test]
    fn test_unknown_user_same_comment() {
        let auth = authenticator();
        let unknown = auth.check(&LoginRequest::new("mallory", "secret"));
        let wrong = auth.check(&LoginRequest::new("admin", "guess"));
        assert_eq!(unknown, wrong);
    }

    #[test]
    fn test_requires_login_only_for_viewers() {
        let auth = authenticator();
        assert!(auth.requires_login(InstanceType::Viewer));
        assert!(!auth.requires_login(InstanceType::Agent));

        let open = Authenticator::new(&AuthConfig {
            require_login: false,
            users: Vec::new(),
        });
        assert!(!open.requires_login(InstanceType::Viewer));
    }

    #[test]
    fn test_hashes_match() {
        assert!(hashes_match("abcd", "ABCD"));
        assert!(!hashes_match("abcd", "abce"));
        assert!(!hashes_match("abcd", "abc"));
    }
}

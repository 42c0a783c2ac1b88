//! Caller authentication for privileged relay operations.
//!
//! Message submission and subscriber enumeration take API credentials
//! (basic-auth style user/password). Subscription updates take the identity
//! of an already authenticated session; establishing that session is left
//! to the embedding service.

use std::collections::HashMap;
use std::fmt;

use sha2::{Digest, Sha256};

use crate::types::RecipientId;

/// User/password pair presented by an API caller.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

impl Credentials {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Recipient identified by an authenticated session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIdentity(pub RecipientId);

impl SessionIdentity {
    /// Whether this session may act for `recipient`.
    pub fn owns(&self, recipient: &RecipientId) -> bool {
        &self.0 == recipient
    }
}

/// Configured API users.
#[derive(Clone, Default)]
pub struct ApiUsers {
    digests: HashMap<String, [u8; 32]>,
}

impl ApiUsers {
    pub fn new(users: &HashMap<String, String>) -> Self {
        Self {
            digests: users
                .iter()
                .map(|(user, password)| (user.clone(), digest(password)))
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.digests.is_empty()
    }

    /// Digests are compared so password length does not leak through timing.
    pub fn authorize(&self, credentials: Option<&Credentials>) -> bool {
        let Some(credentials) = credentials else {
            return false;
        };
        self.digests
            .get(&credentials.user)
            .is_some_and(|expected| *expected == digest(&credentials.password))
    }
}

fn digest(password: &str) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Sha256::digest(password.as_bytes()));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authorizes_known_users_only() {
        let users = ApiUsers::new(&HashMap::from([("ops".to_string(), "s3cret".to_string())]));

        assert!(users.authorize(Some(&Credentials::new("ops", "s3cret"))));
        assert!(!users.authorize(Some(&Credentials::new("ops", "wrong"))));
        assert!(!users.authorize(Some(&Credentials::new("dev", "s3cret"))));
        assert!(!users.authorize(None));
    }

    #[test]
    fn debug_hides_password() {
        let text = format!("{:?}", Credentials::new("ops", "s3cret"));
        assert!(!text.contains("s3cret"));
    }
}

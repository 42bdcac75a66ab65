//! Connection identity resolution.

use crate::error::{OrchestratorError, Result};
use dashmap::DashMap;
use shared::{Identity, Role, UserId};
use std::sync::atomic::{AtomicU64, Ordering};

pub const MAX_DISPLAY_NAME_LEN: usize = 24;

pub trait IdentityProvider: Send + Sync {
    /// Maps a connect token to the user behind it.
    fn resolve(&self, token: &str) -> Result<Identity>;
}

/// Token-is-the-name provider: the same token always yields the same user.
#[derive(Debug)]
pub struct GuestIdentityProvider {
    engine_token: String,
    users: DashMap<String, UserId>,
    next_user_id: AtomicU64,
}

impl GuestIdentityProvider {
    pub fn new(engine_token: impl Into<String>) -> Self {
        Self {
            engine_token: engine_token.into(),
            users: DashMap::new(),
            next_user_id: AtomicU64::new(1),
        }
    }
}

impl IdentityProvider for GuestIdentityProvider {
    fn resolve(&self, token: &str) -> Result<Identity> {
        let name = token.trim();
        if name.is_empty() || name.chars().count() > MAX_DISPLAY_NAME_LEN {
            return Err(OrchestratorError::Validation(format!(
                "display name must be 1-{} characters",
                MAX_DISPLAY_NAME_LEN
            )));
        }

        let user_id = *self
            .users
            .entry(name.to_string())
            .or_insert_with(|| self.next_user_id.fetch_add(1, Ordering::SeqCst));
        let role = if name == self.engine_token {
            Role::Engine
        } else {
            Role::Player
        };
        Ok(Identity {
            user_id,
            display_name: name.to_string(),
            role,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_same_token_same_user() {
        let provider = GuestIdentityProvider::new("engine");
        let alice = assert_ok!(provider.resolve("alice"));
        let bob = assert_ok!(provider.resolve("bob"));
        let again = assert_ok!(provider.resolve(" alice "));

        assert_eq!(alice.user_id, again.user_id);
        assert_ne!(alice.user_id, bob.user_id);
        assert_eq!(alice.role, Role::Player);
    }

    #[test]
    fn test_engine_token_gets_engine_role() {
        let provider = GuestIdentityProvider::new("secret-engine");
        assert_eq!(assert_ok!(provider.resolve("secret-engine")).role, Role::Engine);
    }

    #[test]
    fn test_rejects_bad_names() {
        let provider = GuestIdentityProvider::new("engine");
        assert_err!(provider.resolve("   "));
        assert_err!(provider.resolve(&"x".repeat(MAX_DISPLAY_NAME_LEN + 1)));
    }
}

//! Identity collaborator: who the local client is acting as

pub mod token;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::info;

pub use token::{verify_access_token, AccessClaims, AuthError};

/// The authenticated principal a client acts as
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub user_id: String,
    pub display_name: String,
}

impl Principal {
    pub fn new(user_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: display_name.into(),
        }
    }
}

/// Source of the current principal and of auth state transitions
pub trait IdentityProvider: Send + Sync {
    /// Principal active right now, if any
    fn current(&self) -> Option<Principal>;

    /// Receiver observing every auth state change
    fn subscribe(&self) -> watch::Receiver<Option<Principal>>;
}

/// Identity provider driven by explicit sign-in and sign-out calls
pub struct LocalIdentity {
    state: watch::Sender<Option<Principal>>,
}

impl LocalIdentity {
    pub fn signed_out() -> Self {
        let (state, _) = watch::channel(None);
        Self { state }
    }

    pub fn signed_in(principal: Principal) -> Self {
        let (state, _) = watch::channel(Some(principal));
        Self { state }
    }

    pub fn sign_in(&self, principal: Principal) {
        info!(user_id = %principal.user_id, "Principal signed in");
        self.state.send_replace(Some(principal));
    }

    /// Sign in from a hosted-auth access token
    pub fn sign_in_with_token(&self, token: &str, secret: &str) -> Result<Principal, AuthError> {
        let principal = verify_access_token(token, secret)?;
        self.sign_in(principal.clone());
        Ok(principal)
    }

    pub fn sign_out(&self) {
        if let Some(previous) = self.state.send_replace(None) {
            info!(user_id = %previous.user_id, "Principal signed out");
        }
    }
}

impl Default for LocalIdentity {
    fn default() -> Self {
        Self::signed_out()
    }
}

impl IdentityProvider for LocalIdentity {
    fn current(&self) -> Option<Principal> {
        self.state.borrow().clone()
    }

    fn subscribe(&self) -> watch::Receiver<Option<Principal>> {
        self.state.subscribe()
    }
}

/// Wait up to `timeout` for a principal; `None` means not authenticated
pub async fn wait_for_principal(
    provider: &dyn IdentityProvider,
    timeout: Duration,
) -> Option<Principal> {
    let mut rx = provider.subscribe();

    let wait = async move {
        loop {
            let current = rx.borrow_and_update().clone();
            if current.is_some() {
                return current;
            }
            if rx.changed().await.is_err() {
                return None;
            }
        }
    };

    tokio::time::timeout(timeout, wait).await.unwrap_or(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn wait_resolves_once_signed_in() {
        let identity = Arc::new(LocalIdentity::signed_out());

        let signer = identity.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            signer.sign_in(Principal::new("u1", "Ada"));
        });

        let principal = wait_for_principal(identity.as_ref(), Duration::from_secs(5)).await;
        assert_eq!(principal, Some(Principal::new("u1", "Ada")));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_expires_to_none() {
        let identity = LocalIdentity::signed_out();
        let principal = wait_for_principal(&identity, Duration::from_secs(5)).await;
        assert!(principal.is_none());
    }

    #[test]
    fn token_sign_in_replaces_current_only_when_valid() {
        use token::tests::{far_future, sign, SECRET};

        let identity = LocalIdentity::signed_in(Principal::new("u1", "Ada"));
        let mut changes = identity.subscribe();
        changes.borrow_and_update();

        let forged = sign(serde_json::json!({ "sub": "u2", "exp": far_future() }), "other");
        assert!(matches!(
            identity.sign_in_with_token(&forged, SECRET),
            Err(AuthError::InvalidToken)
        ));
        let expired = sign(serde_json::json!({ "sub": "u2", "exp": 1 }), SECRET);
        assert!(matches!(
            identity.sign_in_with_token(&expired, SECRET),
            Err(AuthError::TokenExpired)
        ));
        assert_eq!(identity.current(), Some(Principal::new("u1", "Ada")));
        assert!(!changes.has_changed().unwrap());

        let token = sign(
            serde_json::json!({
                "sub": "u2",
                "exp": far_future(),
                "user_metadata": { "username": "Grace" }
            }),
            SECRET,
        );
        let principal = identity.sign_in_with_token(&token, SECRET).unwrap();
        assert_eq!(principal, Principal::new("u2", "Grace"));
        assert_eq!(identity.current(), Some(principal));
        assert!(changes.has_changed().unwrap());
    }

    #[test]
    fn sign_out_clears_current() {
        let identity = LocalIdentity::signed_in(Principal::new("u1", "Ada"));
        identity.sign_out();
        assert!(identity.current().is_none());
    }
}

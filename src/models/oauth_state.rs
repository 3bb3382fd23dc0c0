//! OAuth state model
//!
//! Ephemeral CSRF/PKCE record keyed by a random state token. Consumed
//! exactly once on callback, discarded on expiry.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthState {
    /// Random URL-safe state token, also the storage key.
    pub state: String,
    pub organization_id: Uuid,
    pub vendor: String,
    pub scopes: Vec<String>,
    /// PKCE code verifier, when the vendor dialect uses one.
    pub code_verifier: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl OAuthState {
    pub fn new(
        state: String,
        organization_id: Uuid,
        vendor: &str,
        scopes: Vec<String>,
        ttl: Duration,
    ) -> Self {
        let now = Utc::now();
        Self {
            state,
            organization_id,
            vendor: vendor.to_string(),
            scopes,
            code_verifier: None,
            expires_at: now + ttl,
            created_at: now,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expiry() {
        let state = OAuthState::new(
            "abc".into(),
            Uuid::new_v4(),
            "acme_pm",
            vec!["read".into()],
            Duration::minutes(10),
        );
        assert!(!state.is_expired(Utc::now()));
        assert!(state.is_expired(Utc::now() + Duration::minutes(11)));
    }
}

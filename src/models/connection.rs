//! Connection model
//!
//! An organization-scoped authorization to one external vendor. Token
//! material is stored only as AES-GCM ciphertext; see `crypto`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Connection lifecycle states.
///
/// `not_connected → connecting → connected ⇄ (expired|error) → revoked`,
/// with `connected → connected` on a successful refresh. `revoked` is
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    NotConnected,
    Connecting,
    Connected,
    Expired,
    Error,
    Revoked,
}

impl ConnectionStatus {
    /// Legal state-machine transitions. Self-loop on `connected` covers
    /// token refresh.
    pub fn can_transition(self, to: ConnectionStatus) -> bool {
        use ConnectionStatus::*;
        match (self, to) {
            (NotConnected, Connecting) => true,
            (Connecting, Connected) | (Connecting, Error) => true,
            (Connected, Connected) | (Connected, Expired) | (Connected, Error) => true,
            (Expired, Connected) | (Error, Connected) => true,
            (Connected, Revoked) | (Expired, Revoked) | (Error, Revoked) => true,
            (Revoked, Revoked) => true, // revoke is idempotent
            _ => false,
        }
    }

    /// Whether the connection can serve API calls without refreshing first.
    pub fn is_active(self) -> bool {
        matches!(self, ConnectionStatus::Connected)
    }
}

/// Point-in-time view of the vendor's rate-limit budget for a connection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RateLimitSnapshot {
    pub limit: Option<u32>,
    pub remaining: Option<u32>,
    pub reset_at: Option<DateTime<Utc>>,
}

impl RateLimitSnapshot {
    /// Time left until the budget resets, when the remaining budget has
    /// fallen to the reserve the organization wants to keep untouched.
    pub fn exhausted_until(
        &self,
        now: DateTime<Utc>,
        reserve: u32,
    ) -> Option<chrono::Duration> {
        match (self.remaining, self.reset_at) {
            (Some(remaining), Some(reset_at)) if remaining <= reserve && reset_at > now => {
                Some(reset_at - now)
            }
            _ => None,
        }
    }
}

/// One authorized link between an organization and a vendor account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connection {
    pub id: Uuid,
    pub organization_id: Uuid,
    /// Vendor profile slug, e.g. "acme_pm".
    pub vendor: String,
    pub scopes: Vec<String>,
    pub status: ConnectionStatus,
    pub access_token_ciphertext: Option<Vec<u8>>,
    pub refresh_token_ciphertext: Option<Vec<u8>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub refresh_expires_at: Option<DateTime<Utc>>,
    pub rate_limit: RateLimitSnapshot,
    pub last_used_at: Option<DateTime<Utc>>,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Connection {
    pub fn new(organization_id: Uuid, vendor: &str, scopes: Vec<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            organization_id,
            vendor: vendor.to_string(),
            scopes,
            status: ConnectionStatus::Connecting,
            access_token_ciphertext: None,
            refresh_token_ciphertext: None,
            expires_at: None,
            refresh_expires_at: None,
            rate_limit: RateLimitSnapshot::default(),
            last_used_at: None,
            last_sync_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// AAD context binding token ciphertexts to this connection's identity.
    pub fn token_aad(&self) -> String {
        format!("{}|{}", self.organization_id, self.vendor)
    }

    /// Whether the access token expires within `buffer` from `now`.
    pub fn expires_within(&self, now: DateTime<Utc>, buffer: chrono::Duration) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at <= now + buffer,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn status_transitions() {
        use ConnectionStatus::*;
        assert!(NotConnected.can_transition(Connecting));
        assert!(Connecting.can_transition(Connected));
        assert!(Connected.can_transition(Connected));
        assert!(Connected.can_transition(Expired));
        assert!(Expired.can_transition(Connected));
        assert!(Error.can_transition(Revoked));
        assert!(Revoked.can_transition(Revoked));

        assert!(!Revoked.can_transition(Connected));
        assert!(!NotConnected.can_transition(Connected));
        assert!(!Expired.can_transition(Error));
    }

    #[test]
    fn expiry_buffer() {
        let mut conn = Connection::new(Uuid::new_v4(), "acme_pm", vec![]);
        let now = Utc::now();

        conn.expires_at = Some(now + Duration::minutes(2));
        assert!(conn.expires_within(now, Duration::minutes(5)));

        conn.expires_at = Some(now + Duration::minutes(30));
        assert!(!conn.expires_within(now, Duration::minutes(5)));

        conn.expires_at = None;
        assert!(!conn.expires_within(now, Duration::minutes(5)));
    }

    #[test]
    fn rate_limit_exhaustion_window() {
        let now = Utc::now();
        let snapshot = RateLimitSnapshot {
            limit: Some(100),
            remaining: Some(0),
            reset_at: Some(now + Duration::seconds(5)),
        };
        let wait = snapshot.exhausted_until(now, 0).expect("exhausted");
        assert!(wait.num_seconds() >= 4);

        let open = RateLimitSnapshot {
            limit: Some(100),
            remaining: Some(10),
            reset_at: Some(now + Duration::seconds(5)),
        };
        assert!(open.exhausted_until(now, 0).is_none());
        // A reserve of 10 means 10 remaining already counts as exhausted.
        assert!(open.exhausted_until(now, 10).is_some());

        let stale = RateLimitSnapshot {
            limit: Some(100),
            remaining: Some(0),
            reset_at: Some(now - Duration::seconds(5)),
        };
        assert!(stale.exhausted_until(now, 0).is_none());
    }
}

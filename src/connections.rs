//! Connection Manager
//!
//! Owns the OAuth lifecycle for vendor connections: authorization flow
//! start and callback, encrypted token storage, proactive refresh with
//! single-flight deduplication, revocation, and the background refresh
//! sweep. One active connection per (organization, vendor) pair.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use metrics::counter;
use rand::RngCore;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use url::Url;
use uuid::Uuid;

use crate::audit::AuditService;
use crate::config::{SyncSettings, VendorProfile, VendorRegistry};
use crate::crypto::{TokenCipher, TokenKey};
use crate::error::{Error, RefreshFailure, Result, classify_refresh_failure};
use crate::models::audit::AuditOperation;
use crate::models::connection::{Connection, ConnectionStatus, RateLimitSnapshot};
use crate::models::oauth_state::OAuthState;
use crate::store::Stores;

const STATE_TOKEN_BYTES: usize = 32;
const SWEEP_CONCURRENCY: usize = 4;

/// Everything the embedder needs to send the user to the vendor's consent
/// screen.
#[derive(Debug, Clone)]
pub struct AuthorizationRequest {
    pub authorize_url: String,
    pub state: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    /// Access token lifetime in seconds.
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    refresh_token_expires_in: Option<i64>,
}

pub struct ConnectionManager {
    settings: SyncSettings,
    vendors: Arc<VendorRegistry>,
    stores: Stores,
    cipher: TokenCipher,
    audit: AuditService,
    http: reqwest::Client,
    /// Per-connection refresh locks; the loser of a race re-reads instead
    /// of refreshing again.
    refresh_locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl ConnectionManager {
    pub fn new(
        settings: SyncSettings,
        vendors: Arc<VendorRegistry>,
        stores: Stores,
        audit: AuditService,
    ) -> Result<Self> {
        let key_b64 = settings
            .token_key_base64
            .as_deref()
            .ok_or_else(|| Error::Config("token cipher key is not configured".to_string()))?;
        let cipher = TokenCipher::new(TokenKey::from_base64(key_b64)?);

        let http = reqwest::Client::builder()
            .timeout(settings.request_timeout())
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            settings,
            vendors,
            stores,
            cipher,
            audit,
            http,
            refresh_locks: Mutex::new(HashMap::new()),
        })
    }

    pub async fn get(&self, id: Uuid) -> Result<Connection> {
        self.stores
            .connections
            .get(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("connection {id}")))
    }

    pub async fn find_active(&self, organization_id: Uuid, vendor: &str) -> Result<Connection> {
        self.stores
            .connections
            .find_active(organization_id, vendor)
            .await?
            .ok_or_else(|| Error::NotFound(format!("active {vendor} connection")))
    }

    /// Start the authorization flow. Stores an expiring single-use state
    /// record and returns the consent URL to redirect the user to.
    pub async fn begin_authorization(
        &self,
        organization_id: Uuid,
        vendor: &str,
        scopes: Vec<String>,
    ) -> Result<AuthorizationRequest> {
        let profile = self.vendors.get(vendor)?;
        let state = generate_state_token();

        self.stores
            .oauth_states
            .put(OAuthState::new(
                state.clone(),
                organization_id,
                vendor,
                scopes.clone(),
                Duration::minutes(self.settings.oauth_state_ttl_minutes as i64),
            ))
            .await?;

        let mut authorize_url = Url::parse(&profile.authorize_url)
            .map_err(|e| Error::Config(format!("invalid authorize_url for {vendor}: {e}")))?;
        authorize_url
            .query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &profile.client_id)
            .append_pair("redirect_uri", &profile.redirect_uri)
            .append_pair("scope", &scopes.join(" "))
            .append_pair("state", &state);

        debug!(%organization_id, vendor, "authorization flow started");
        Ok(AuthorizationRequest {
            authorize_url: authorize_url.to_string(),
            state,
        })
    }

    /// Complete the callback leg: consume the state token (exactly once),
    /// exchange the code, and persist the connection with sealed tokens.
    pub async fn complete_authorization(&self, state: &str, code: &str) -> Result<Connection> {
        let oauth_state = self
            .stores
            .oauth_states
            .take(state)
            .await?
            .ok_or(Error::InvalidState)?;
        if oauth_state.is_expired(Utc::now()) {
            return Err(Error::InvalidState);
        }

        let profile = self.vendors.get(&oauth_state.vendor)?;
        let tokens = self.exchange_code(profile, code).await?;

        // Reauthorizing replaces tokens on the existing connection; a new
        // row appears only when none exists for the pair.
        let mut connection = match self
            .stores
            .connections
            .find_active(oauth_state.organization_id, &oauth_state.vendor)
            .await?
        {
            Some(existing) => existing,
            None => Connection::new(
                oauth_state.organization_id,
                &oauth_state.vendor,
                oauth_state.scopes.clone(),
            ),
        };
        let is_new = connection.access_token_ciphertext.is_none();

        if !connection.status.can_transition(ConnectionStatus::Connected) {
            return Err(Error::Auth(format!(
                "connection is {:?} and cannot be authorized",
                connection.status
            )));
        }

        self.apply_tokens(&mut connection, &tokens)?;
        connection.scopes = oauth_state.scopes;
        connection.status = ConnectionStatus::Connected;
        connection.updated_at = Utc::now();

        if is_new {
            self.stores.connections.insert(connection.clone()).await?;
        } else {
            self.stores.connections.update(connection.clone()).await?;
        }

        self.audit
            .record_best_effort(
                connection.organization_id,
                AuditOperation::ConnectionCreate,
                None,
                Some(connection.id.to_string()),
                None,
                Some(json!({
                    "vendor": connection.vendor,
                    "status": connection.status,
                    "scopes": connection.scopes,
                })),
                None,
            )
            .await;

        info!(
            connection_id = %connection.id,
            vendor = %connection.vendor,
            "connection authorized"
        );
        Ok(connection)
    }

    /// Decrypted access token, refreshing first when it expires within the
    /// configured lead window.
    pub async fn get_valid_token(&self, connection_id: Uuid) -> Result<String> {
        let mut connection = self.get(connection_id).await?;

        if connection.status == ConnectionStatus::Revoked {
            return Err(Error::Auth("connection is revoked".to_string()));
        }
        let lead = Duration::seconds(self.settings.refresh_lead_seconds as i64);
        if !connection.status.is_active() || connection.expires_within(Utc::now(), lead) {
            connection = self.refresh(connection_id).await?;
        }

        let token = self
            .cipher
            .open_token(
                &connection.token_aad(),
                connection.access_token_ciphertext.as_deref(),
            )?
            .ok_or_else(|| Error::Auth("connection has no access token".to_string()))?;

        connection.last_used_at = Some(Utc::now());
        self.stores.connections.update(connection).await?;
        Ok(token)
    }

    /// Refresh the access token. Concurrent callers for the same connection
    /// collapse to one token-endpoint request; losers observe the winner's
    /// result on re-read.
    #[instrument(skip(self), fields(connection_id = %connection_id))]
    pub async fn refresh(&self, connection_id: Uuid) -> Result<Connection> {
        let lock = {
            let mut locks = self.refresh_locks.lock().await;
            locks.entry(connection_id).or_default().clone()
        };
        let result = {
            let _guard = lock.lock().await;
            self.refresh_guarded(connection_id).await
        };

        // Drop the lock entry once no other caller holds a clone, so the
        // map does not grow with every connection ever refreshed.
        let mut locks = self.refresh_locks.lock().await;
        if locks
            .get(&connection_id)
            .is_some_and(|entry| Arc::strong_count(entry) <= 2)
        {
            locks.remove(&connection_id);
        }
        drop(locks);

        result
    }

    async fn refresh_guarded(&self, connection_id: Uuid) -> Result<Connection> {
        let connection = self.get(connection_id).await?;
        let lead = Duration::seconds(self.settings.refresh_lead_seconds as i64);
        if connection.status == ConnectionStatus::Connected
            && !connection.expires_within(Utc::now(), lead)
        {
            // Another caller already refreshed while we waited on the lock.
            return Ok(connection);
        }

        self.refresh_locked(connection).await
    }

    async fn refresh_locked(&self, mut connection: Connection) -> Result<Connection> {
        if connection.status == ConnectionStatus::Revoked {
            return Err(Error::Auth("connection is revoked".to_string()));
        }

        let profile = self.vendors.get(&connection.vendor)?;
        let refresh_token = self
            .cipher
            .open_token(
                &connection.token_aad(),
                connection.refresh_token_ciphertext.as_deref(),
            )?
            .ok_or_else(|| Error::Auth("connection has no refresh token".to_string()))?;

        if connection
            .refresh_expires_at
            .is_some_and(|at| at <= Utc::now())
        {
            return self
                .disable_connection(connection, "refresh token expired")
                .await;
        }

        match self.exchange_refresh(profile, &refresh_token).await {
            Ok(tokens) => {
                self.apply_tokens(&mut connection, &tokens)?;
                connection.status = ConnectionStatus::Connected;
                connection.updated_at = Utc::now();
                self.stores.connections.update(connection.clone()).await?;

                self.audit
                    .record_best_effort(
                        connection.organization_id,
                        AuditOperation::TokenRefresh,
                        None,
                        Some(connection.id.to_string()),
                        None,
                        Some(json!({"expires_at": connection.expires_at})),
                        None,
                    )
                    .await;

                counter!("vendorsync_token_refreshes_total", "outcome" => "success")
                    .increment(1);
                debug!(connection_id = %connection.id, "token refreshed");
                Ok(connection)
            }
            Err(RefreshError { body, source }) => {
                counter!("vendorsync_token_refreshes_total", "outcome" => "failure")
                    .increment(1);
                self.audit
                    .record_best_effort(
                        connection.organization_id,
                        AuditOperation::TokenRefresh,
                        None,
                        Some(connection.id.to_string()),
                        None,
                        None,
                        Some(body.clone()),
                    )
                    .await;

                match classify_refresh_failure(&body) {
                    RefreshFailure::Permanent => {
                        self.disable_connection(connection, &body).await
                    }
                    RefreshFailure::RateLimited => {
                        warn!(connection_id = %connection.id, "token endpoint rate limited");
                        Err(Error::RateLimited {
                            retry_after_secs: None,
                        })
                    }
                    RefreshFailure::Transient => Err(source.unwrap_or(Error::Transient(body))),
                }
            }
        }
    }

    /// Permanent refresh failure: the connection needs reauthorization.
    async fn disable_connection(
        &self,
        mut connection: Connection,
        reason: &str,
    ) -> Result<Connection> {
        error!(
            connection_id = %connection.id,
            vendor = %connection.vendor,
            reason,
            "disabling connection after permanent refresh failure"
        );
        connection.status = ConnectionStatus::Expired;
        connection.updated_at = Utc::now();
        self.stores.connections.update(connection).await?;
        Err(Error::Auth(format!("token refresh failed: {reason}")))
    }

    /// Revoke the connection. Remote revocation is best effort; local state
    /// always ends up `revoked` with token material cleared. Idempotent.
    pub async fn revoke(&self, connection_id: Uuid) -> Result<Connection> {
        let mut connection = self.get(connection_id).await?;
        if connection.status == ConnectionStatus::Revoked {
            return Ok(connection);
        }

        let profile = self.vendors.get(&connection.vendor)?;
        if let Some(revoke_url) = &profile.revoke_url
            && let Ok(Some(token)) = self.cipher.open_token(
                &connection.token_aad(),
                connection.access_token_ciphertext.as_deref(),
            )
        {
            let result = self
                .http
                .post(revoke_url)
                .form(&[
                    ("token", token.as_str()),
                    ("client_id", profile.client_id.as_str()),
                    ("client_secret", profile.client_secret.as_str()),
                ])
                .send()
                .await;
            if let Err(err) = result {
                warn!(connection_id = %connection.id, error = %err, "remote revoke failed; revoking locally");
            }
        }

        connection.status = ConnectionStatus::Revoked;
        connection.access_token_ciphertext = None;
        connection.refresh_token_ciphertext = None;
        connection.expires_at = None;
        connection.refresh_expires_at = None;
        connection.updated_at = Utc::now();
        self.stores.connections.update(connection.clone()).await?;

        self.audit
            .record_best_effort(
                connection.organization_id,
                AuditOperation::Revoke,
                None,
                Some(connection.id.to_string()),
                None,
                Some(json!({"vendor": connection.vendor, "status": "revoked"})),
                None,
            )
            .await;

        info!(connection_id = %connection.id, "connection revoked");
        Ok(connection)
    }

    /// Persist the latest rate-limit header snapshot for a connection.
    pub async fn store_rate_limit(
        &self,
        connection_id: Uuid,
        snapshot: RateLimitSnapshot,
    ) -> Result<()> {
        let mut connection = self.get(connection_id).await?;
        connection.rate_limit = snapshot;
        connection.updated_at = Utc::now();
        self.stores.connections.update(connection).await
    }

    pub async fn mark_synced(&self, connection_id: Uuid) -> Result<()> {
        let mut connection = self.get(connection_id).await?;
        connection.last_sync_at = Some(Utc::now());
        connection.updated_at = Utc::now();
        self.stores.connections.update(connection).await
    }

    /// Background sweep refreshing every connection whose token expires
    /// within the lead window. Runs until `shutdown` fires.
    pub async fn run_refresh_worker(self: Arc<Self>, shutdown: CancellationToken) {
        let sweep = std::time::Duration::from_secs(self.settings.refresh_sweep_seconds);
        info!(interval_secs = self.settings.refresh_sweep_seconds, "token refresh worker started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("token refresh worker stopping");
                    return;
                }
                _ = tokio::time::sleep(sweep) => {}
            }

            // Jitter avoids synchronized sweeps across replicas.
            let jitter_ms = rand::Rng::gen_range(&mut rand::thread_rng(), 0..=sweep.as_millis() as u64 / 10);
            tokio::time::sleep(std::time::Duration::from_millis(jitter_ms)).await;

            // Abandoned authorization flows leave dead state records behind.
            match self.stores.oauth_states.purge_expired(Utc::now()).await {
                Ok(0) => {}
                Ok(purged) => debug!(purged, "expired oauth states purged"),
                Err(err) => warn!(error = %err, "oauth state purge failed"),
            }

            if let Err(err) = self.sweep_expiring().await {
                error!(error = %err, "refresh sweep failed");
            }
        }
    }

    async fn sweep_expiring(self: &Arc<Self>) -> Result<()> {
        let lead = Duration::seconds(self.settings.refresh_lead_seconds as i64);
        let expiring = self
            .stores
            .connections
            .list_expiring(Utc::now() + lead)
            .await?;
        if expiring.is_empty() {
            return Ok(());
        }

        debug!(count = expiring.len(), "refreshing expiring connections");
        let semaphore = Arc::new(Semaphore::new(SWEEP_CONCURRENCY));
        let mut handles = Vec::with_capacity(expiring.len());

        for connection in expiring {
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| Error::Internal(format!("semaphore closed: {e}")))?;
            let manager = self.clone();
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                if let Err(err) = manager.refresh(connection.id).await {
                    warn!(connection_id = %connection.id, error = %err, "sweep refresh failed");
                }
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }
        Ok(())
    }

    async fn exchange_code(&self, profile: &VendorProfile, code: &str) -> Result<TokenResponse> {
        let response = self
            .http
            .post(&profile.token_url)
            .form(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("client_id", &profile.client_id),
                ("client_secret", &profile.client_secret),
                ("redirect_uri", &profile.redirect_uri),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Auth(format!("code exchange failed: {body}")));
        }
        Ok(response.json::<TokenResponse>().await?)
    }

    async fn exchange_refresh(
        &self,
        profile: &VendorProfile,
        refresh_token: &str,
    ) -> std::result::Result<TokenResponse, RefreshError> {
        let response = self
            .http
            .post(&profile.token_url)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("client_id", &profile.client_id),
                ("client_secret", &profile.client_secret),
            ])
            .send()
            .await
            .map_err(|e| RefreshError {
                body: e.to_string(),
                source: Some(e.into()),
            })?;

        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RefreshError { body, source: None });
        }
        response.json::<TokenResponse>().await.map_err(|e| RefreshError {
            body: e.to_string(),
            source: Some(e.into()),
        })
    }

    fn apply_tokens(&self, connection: &mut Connection, tokens: &TokenResponse) -> Result<()> {
        let aad = connection.token_aad();
        connection.access_token_ciphertext =
            self.cipher.seal_token(&aad, Some(&tokens.access_token))?;
        // Vendors that rotate refresh tokens send a new one; keep the old
        // one otherwise.
        if let Some(refresh) = &tokens.refresh_token {
            connection.refresh_token_ciphertext = self.cipher.seal_token(&aad, Some(refresh))?;
        }
        connection.expires_at = tokens.expires_in.map(|s| Utc::now() + Duration::seconds(s));
        if let Some(s) = tokens.refresh_token_expires_in {
            connection.refresh_expires_at = Some(Utc::now() + Duration::seconds(s));
        }
        Ok(())
    }
}

/// Raw failure from the token endpoint, prior to classification.
struct RefreshError {
    body: String,
    source: Option<Error>,
}

fn generate_state_token() -> String {
    use base64::Engine as _;
    let mut bytes = [0u8; STATE_TOKEN_BYTES];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

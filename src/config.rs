//! Configuration for the sync core.
//!
//! Three layers: process-wide [`SyncSettings`] (retry/timeout/pool/cache
//! knobs, overridable from `VENDORSYNC_*` environment variables),
//! per-organization [`OrgSyncConfig`], and per-vendor [`VendorProfile`]
//! records describing each vendor's OAuth endpoints, URL scheme, auth
//! header shape, pagination convention, and rate-limit headers. Vendor
//! catalogs are configuration data, not code.

use std::collections::{BTreeMap, HashMap};
use std::env;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::record::EntityType;
use crate::models::sync_job::ConflictStrategy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {key}: {message}")]
    InvalidValue { key: String, message: String },
    #[error("missing required setting: {0}")]
    Missing(String),
}

/// Retry and backoff policy for transient failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct RetryPolicy {
    /// Maximum retry attempts for a transient failure.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Starting backoff in milliseconds; doubles per attempt.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Backoff ceiling in milliseconds.
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    /// Random jitter factor in `[0.0, 1.0]` applied on top of the backoff.
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            jitter_factor: default_jitter_factor(),
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff with jitter for the given completed attempt count.
    pub fn backoff_for_attempt(&self, attempt: u32) -> std::time::Duration {
        let base = self.backoff_base_ms as f64;
        let capped = (base * 2_f64.powi(attempt as i32)).min(self.backoff_max_ms as f64);
        let jitter = if self.jitter_factor > 0.0 {
            use rand::Rng;
            rand::thread_rng().gen_range(0.0..(self.jitter_factor * capped))
        } else {
            0.0
        };
        std::time::Duration::from_millis((capped + jitter) as u64)
    }
}

/// Process-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct SyncSettings {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Per-request timeout for a single outbound HTTP call, seconds.
    #[serde(default = "default_request_timeout_seconds")]
    pub request_timeout_seconds: u64,
    /// Overall timeout for one sync job, seconds.
    #[serde(default = "default_job_timeout_seconds")]
    pub job_timeout_seconds: u64,
    /// Number of sync jobs that may run concurrently across organizations.
    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: usize,
    /// Fan-out limit for API calls within one push batch.
    #[serde(default = "default_batch_concurrency")]
    pub batch_concurrency: usize,
    /// Refresh the access token when it expires within this many seconds.
    #[serde(default = "default_refresh_lead_seconds")]
    pub refresh_lead_seconds: u64,
    /// TTL for pending OAuth state records, minutes.
    #[serde(default = "default_oauth_state_ttl_minutes")]
    pub oauth_state_ttl_minutes: u64,
    /// Read-cache entry TTL, seconds.
    #[serde(default = "default_cache_ttl_seconds")]
    pub cache_ttl_seconds: u64,
    /// Read-cache size cap; oldest entries evict first.
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
    /// Wait applied to HTTP 429 responses without a Retry-After header,
    /// seconds.
    #[serde(default = "default_rate_limit_fallback_seconds")]
    pub rate_limit_fallback_seconds: u64,
    /// Poll interval for the pending-job worker loop, milliseconds.
    #[serde(default = "default_worker_tick_ms")]
    pub worker_tick_ms: u64,
    /// Interval between background token refresh sweeps, seconds.
    #[serde(default = "default_refresh_sweep_seconds")]
    pub refresh_sweep_seconds: u64,
    /// Token cipher key, standard base64 of 32 bytes. Required in
    /// production configurations; services fail fast without it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_key_base64: Option<String>,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            retry: RetryPolicy::default(),
            request_timeout_seconds: default_request_timeout_seconds(),
            job_timeout_seconds: default_job_timeout_seconds(),
            worker_pool_size: default_worker_pool_size(),
            batch_concurrency: default_batch_concurrency(),
            refresh_lead_seconds: default_refresh_lead_seconds(),
            oauth_state_ttl_minutes: default_oauth_state_ttl_minutes(),
            cache_ttl_seconds: default_cache_ttl_seconds(),
            cache_capacity: default_cache_capacity(),
            rate_limit_fallback_seconds: default_rate_limit_fallback_seconds(),
            worker_tick_ms: default_worker_tick_ms(),
            refresh_sweep_seconds: default_refresh_sweep_seconds(),
            token_key_base64: None,
        }
    }
}

impl SyncSettings {
    /// Load settings from `VENDORSYNC_*` environment variables over the
    /// defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut settings = Self::default();

        if let Ok(level) = env::var("VENDORSYNC_LOG_LEVEL") {
            settings.log_level = level;
        }
        if let Some(v) = read_env_parsed::<u32>("VENDORSYNC_MAX_RETRIES")? {
            settings.retry.max_retries = v;
        }
        if let Some(v) = read_env_parsed::<u64>("VENDORSYNC_BACKOFF_BASE_MS")? {
            settings.retry.backoff_base_ms = v;
        }
        if let Some(v) = read_env_parsed::<u64>("VENDORSYNC_BACKOFF_MAX_MS")? {
            settings.retry.backoff_max_ms = v;
        }
        if let Some(v) = read_env_parsed::<f64>("VENDORSYNC_JITTER_FACTOR")? {
            settings.retry.jitter_factor = v;
        }
        if let Some(v) = read_env_parsed::<u64>("VENDORSYNC_REQUEST_TIMEOUT_SECONDS")? {
            settings.request_timeout_seconds = v;
        }
        if let Some(v) = read_env_parsed::<u64>("VENDORSYNC_JOB_TIMEOUT_SECONDS")? {
            settings.job_timeout_seconds = v;
        }
        if let Some(v) = read_env_parsed::<usize>("VENDORSYNC_WORKER_POOL_SIZE")? {
            settings.worker_pool_size = v;
        }
        if let Some(v) = read_env_parsed::<usize>("VENDORSYNC_BATCH_CONCURRENCY")? {
            settings.batch_concurrency = v;
        }
        if let Some(v) = read_env_parsed::<u64>("VENDORSYNC_REFRESH_LEAD_SECONDS")? {
            settings.refresh_lead_seconds = v;
        }
        if let Some(v) = read_env_parsed::<u64>("VENDORSYNC_CACHE_TTL_SECONDS")? {
            settings.cache_ttl_seconds = v;
        }
        if let Some(v) = read_env_parsed::<usize>("VENDORSYNC_CACHE_CAPACITY")? {
            settings.cache_capacity = v;
        }
        if let Ok(key) = env::var("VENDORSYNC_TOKEN_KEY") {
            settings.token_key_base64 = Some(key);
        }

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.retry.jitter_factor) {
            return Err(ConfigError::InvalidValue {
                key: "VENDORSYNC_JITTER_FACTOR".into(),
                message: format!("must be in [0.0, 1.0], got {}", self.retry.jitter_factor),
            });
        }
        if self.retry.backoff_max_ms < self.retry.backoff_base_ms {
            return Err(ConfigError::InvalidValue {
                key: "VENDORSYNC_BACKOFF_MAX_MS".into(),
                message: "must be >= VENDORSYNC_BACKOFF_BASE_MS".into(),
            });
        }
        if self.worker_pool_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "VENDORSYNC_WORKER_POOL_SIZE".into(),
                message: "must be at least 1".into(),
            });
        }
        if self.batch_concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                key: "VENDORSYNC_BATCH_CONCURRENCY".into(),
                message: "must be at least 1".into(),
            });
        }
        if self.cache_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                key: "VENDORSYNC_CACHE_CAPACITY".into(),
                message: "must be at least 1".into(),
            });
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.request_timeout_seconds)
    }

    pub fn job_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.job_timeout_seconds)
    }
}

fn read_env_parsed<T: std::str::FromStr>(key: &str) -> Result<Option<T>, ConfigError> {
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("could not parse '{raw}'"),
            }),
        Err(_) => Ok(None),
    }
}

/// Per-organization sync configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrgSyncConfig {
    pub organization_id: uuid::Uuid,
    /// Entity types synced for this organization; empty means all.
    #[serde(default)]
    pub enabled_entity_types: Vec<EntityType>,
    #[serde(default)]
    pub excluded_entity_types: Vec<EntityType>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_conflict_strategy")]
    pub conflict_strategy: ConflictStrategy,
    /// Whether webhook events enqueue selective pulls automatically.
    #[serde(default = "default_auto_sync")]
    pub auto_sync: bool,
    /// Optional override of the process-wide retry cap.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    /// Optional override of the job timeout, seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_timeout_seconds: Option<u64>,
    /// Portion of the vendor's rate-limit budget this organization keeps
    /// untouched; calls wait for the reset once `remaining` falls to it.
    #[serde(default)]
    pub rate_limit_reserve: u32,
}

impl OrgSyncConfig {
    pub fn new(organization_id: uuid::Uuid) -> Self {
        Self {
            organization_id,
            enabled_entity_types: Vec::new(),
            excluded_entity_types: Vec::new(),
            batch_size: default_batch_size(),
            conflict_strategy: default_conflict_strategy(),
            auto_sync: default_auto_sync(),
            max_retries: None,
            job_timeout_seconds: None,
            rate_limit_reserve: 0,
        }
    }

    /// Whether this organization syncs the given entity type.
    pub fn entity_enabled(&self, entity_type: EntityType) -> bool {
        if self.excluded_entity_types.contains(&entity_type) {
            return false;
        }
        self.enabled_entity_types.is_empty() || self.enabled_entity_types.contains(&entity_type)
    }
}

/// Shared registry of per-organization configs. Clones view the same map,
/// so the orchestrator, webhook intake, and API client all read one
/// configuration.
#[derive(Debug, Clone, Default)]
pub struct OrgConfigs {
    inner: Arc<RwLock<HashMap<uuid::Uuid, OrgSyncConfig>>>,
}

impl OrgConfigs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, config: OrgSyncConfig) {
        self.inner
            .write()
            .expect("org config lock poisoned")
            .insert(config.organization_id, config);
    }

    /// Config for the organization, or defaults when none is registered.
    pub fn get(&self, organization_id: uuid::Uuid) -> OrgSyncConfig {
        self.inner
            .read()
            .expect("org config lock poisoned")
            .get(&organization_id)
            .cloned()
            .unwrap_or_else(|| OrgSyncConfig::new(organization_id))
    }
}

/// How the access credential travels on vendor API requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "style", rename_all = "snake_case")]
pub enum AuthHeaderStyle {
    /// `Authorization: Bearer <token>`
    Bearer,
    /// `Authorization: Token <token>` (older REST dialects)
    Token,
    /// Token in a custom header, e.g. `X-Api-Key`.
    Header { name: String },
}

/// How the vendor paginates list responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "style", rename_all = "snake_case")]
pub enum PaginationStyle {
    /// Opaque cursor echoed back via a query parameter; the response body
    /// carries the next cursor and a has-more flag under the given keys.
    Cursor {
        param: String,
        next_cursor_key: String,
        has_more_key: String,
    },
    /// Page-numbered listing; exhaustion is a short page.
    PageNumber { page_param: String, size_param: String },
}

/// Names of the vendor's rate-limit response headers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitHeaders {
    #[serde(default = "default_rate_limit_limit_header")]
    pub limit: String,
    #[serde(default = "default_rate_limit_remaining_header")]
    pub remaining: String,
    /// Header carrying the reset time as a unix timestamp.
    #[serde(default = "default_rate_limit_reset_header")]
    pub reset: String,
}

impl Default for RateLimitHeaders {
    fn default() -> Self {
        Self {
            limit: default_rate_limit_limit_header(),
            remaining: default_rate_limit_remaining_header(),
            reset: default_rate_limit_reset_header(),
        }
    }
}

/// Everything vendor-specific: endpoints, credentials, wire conventions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VendorProfile {
    pub slug: String,
    pub display_name: String,
    pub authorize_url: String,
    pub token_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revoke_url: Option<String>,
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
    /// Base URL of the vendor REST API, no trailing slash.
    pub api_base: String,
    /// Path template per entity type, e.g. `/v1/tenants`. Item operations
    /// append `/{id}`.
    pub entity_paths: BTreeMap<EntityType, String>,
    /// Response payload key holding the record list on list operations.
    #[serde(default = "default_list_key")]
    pub list_key: String,
    /// Field used to match records when no vendor id link exists yet.
    #[serde(default)]
    pub natural_keys: BTreeMap<EntityType, String>,
    pub auth_header: AuthHeaderStyle,
    pub pagination: PaginationStyle,
    #[serde(default)]
    pub rate_limit_headers: RateLimitHeaders,
    /// Query parameter for incremental pulls (`updated_since` filtering).
    #[serde(default = "default_updated_since_param")]
    pub updated_since_param: String,
}

impl VendorProfile {
    /// Collection path for an entity type.
    pub fn collection_path(&self, entity_type: EntityType) -> Result<&str, ConfigError> {
        self.entity_paths
            .get(&entity_type)
            .map(String::as_str)
            .ok_or_else(|| ConfigError::Missing(format!("entity path for {entity_type}")))
    }

    pub fn natural_key(&self, entity_type: EntityType) -> Option<&str> {
        self.natural_keys.get(&entity_type).map(String::as_str)
    }
}

/// Named lookup of registered vendor profiles.
#[derive(Debug, Clone, Default)]
pub struct VendorRegistry {
    profiles: BTreeMap<String, VendorProfile>,
}

impl VendorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, profile: VendorProfile) {
        self.profiles.insert(profile.slug.clone(), profile);
    }

    pub fn get(&self, slug: &str) -> Result<&VendorProfile, crate::error::Error> {
        self.profiles
            .get(slug)
            .ok_or_else(|| crate::error::Error::NotFound(format!("vendor profile '{slug}'")))
    }

    pub fn slugs(&self) -> impl Iterator<Item = &str> {
        self.profiles.keys().map(String::as_str)
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_max_retries() -> u32 {
    3
}
fn default_backoff_base_ms() -> u64 {
    500
}
fn default_backoff_max_ms() -> u64 {
    30_000
}
fn default_jitter_factor() -> f64 {
    0.1
}
fn default_request_timeout_seconds() -> u64 {
    30
}
fn default_job_timeout_seconds() -> u64 {
    1800
}
fn default_worker_pool_size() -> usize {
    8
}
fn default_batch_concurrency() -> usize {
    4
}
fn default_refresh_lead_seconds() -> u64 {
    300
}
fn default_oauth_state_ttl_minutes() -> u64 {
    10
}
fn default_cache_ttl_seconds() -> u64 {
    60
}
fn default_cache_capacity() -> usize {
    512
}
fn default_rate_limit_fallback_seconds() -> u64 {
    30
}
fn default_worker_tick_ms() -> u64 {
    1000
}
fn default_refresh_sweep_seconds() -> u64 {
    300
}
fn default_batch_size() -> usize {
    100
}
fn default_conflict_strategy() -> ConflictStrategy {
    ConflictStrategy::NewestWins
}
fn default_auto_sync() -> bool {
    true
}
fn default_list_key() -> String {
    "data".to_string()
}
fn default_updated_since_param() -> String {
    "updated_since".to_string()
}
fn default_rate_limit_limit_header() -> String {
    "X-RateLimit-Limit".to_string()
}
fn default_rate_limit_remaining_header() -> String {
    "X-RateLimit-Remaining".to_string()
}
fn default_rate_limit_reset_header() -> String {
    "X-RateLimit-Reset".to_string()
}

//! Resilient API Client
//!
//! Single execution path for every outbound vendor API call. Callers hand
//! over a [`RequestDescriptor`]; the client resolves credentials, applies
//! the vendor profile's wire conventions, and absorbs the failure modes
//! vendors actually exhibit: transient faults retry with jittered
//! exponential backoff, HTTP 429 waits out the advertised Retry-After
//! without consuming the retry budget, and an exhausted rate-limit budget
//! suspends new calls until the advertised reset. Auth failures are never
//! retried. Successful reads populate a TTL-bounded LRU cache.

use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use lru::LruCache;
use metrics::counter;
use reqwest::{Method, StatusCode, header::HeaderMap};
use serde_json::Value;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::{
    AuthHeaderStyle, OrgConfigs, PaginationStyle, RetryPolicy, SyncSettings, VendorProfile,
    VendorRegistry,
};
use crate::connections::ConnectionManager;
use crate::error::{Error, Result};
use crate::models::connection::RateLimitSnapshot;
use crate::models::record::EntityType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    List,
    Get,
    Create,
    Update,
    Delete,
}

impl Operation {
    fn method(self) -> Method {
        match self {
            Operation::List | Operation::Get => Method::GET,
            Operation::Create => Method::POST,
            Operation::Update => Method::PUT,
            Operation::Delete => Method::DELETE,
        }
    }

    fn is_read(self) -> bool {
        matches!(self, Operation::List | Operation::Get)
    }

    fn as_str(self) -> &'static str {
        match self {
            Operation::List => "list",
            Operation::Get => "get",
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }
}

/// Declarative description of one vendor API call.
#[derive(Debug, Clone)]
pub struct RequestDescriptor {
    pub entity_type: EntityType,
    pub operation: Operation,
    /// Vendor-side record id for item operations.
    pub id: Option<String>,
    /// Query parameters (pagination cursors, `updated_since`, ...).
    pub filters: BTreeMap<String, String>,
    pub payload: Option<Value>,
}

impl RequestDescriptor {
    pub fn list(entity_type: EntityType) -> Self {
        Self {
            entity_type,
            operation: Operation::List,
            id: None,
            filters: BTreeMap::new(),
            payload: None,
        }
    }

    pub fn get(entity_type: EntityType, id: &str) -> Self {
        Self {
            entity_type,
            operation: Operation::Get,
            id: Some(id.to_string()),
            filters: BTreeMap::new(),
            payload: None,
        }
    }

    pub fn create(entity_type: EntityType, payload: Value) -> Self {
        Self {
            entity_type,
            operation: Operation::Create,
            id: None,
            filters: BTreeMap::new(),
            payload: Some(payload),
        }
    }

    pub fn update(entity_type: EntityType, id: &str, payload: Value) -> Self {
        Self {
            entity_type,
            operation: Operation::Update,
            id: Some(id.to_string()),
            filters: BTreeMap::new(),
            payload: Some(payload),
        }
    }

    pub fn with_filter(mut self, key: &str, value: &str) -> Self {
        self.filters.insert(key.to_string(), value.to_string());
        self
    }

    fn cache_key(&self, connection_id: Uuid) -> String {
        let mut key = format!(
            "{connection_id}|{}|{}|{}",
            self.entity_type,
            self.operation.as_str(),
            self.id.as_deref().unwrap_or("")
        );
        for (k, v) in &self.filters {
            key.push_str(&format!("|{k}={v}"));
        }
        key
    }
}

/// Pagination state extracted from a list response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageInfo {
    pub next_cursor: Option<String>,
    pub has_more: bool,
}

/// Uniform response shape for every call, success or failure.
#[derive(Debug, Clone)]
pub struct ResponseEnvelope {
    pub success: bool,
    pub status: u16,
    pub payload: Value,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub pagination: Option<PageInfo>,
    pub rate_limit: RateLimitSnapshot,
}

impl ResponseEnvelope {
    /// Records of a list response, per the vendor profile's list key.
    pub fn list_records(&self, list_key: &str) -> Vec<Value> {
        match self.payload.get(list_key) {
            Some(Value::Array(items)) => items.clone(),
            // Some vendors return a bare array.
            _ => match &self.payload {
                Value::Array(items) => items.clone(),
                _ => Vec::new(),
            },
        }
    }
}

struct CachedEnvelope {
    envelope: ResponseEnvelope,
    inserted_at: Instant,
}

pub struct ResilientClient {
    settings: SyncSettings,
    vendors: Arc<VendorRegistry>,
    connections: Arc<ConnectionManager>,
    org_configs: OrgConfigs,
    http: reqwest::Client,
    cache: Mutex<LruCache<String, CachedEnvelope>>,
}

impl ResilientClient {
    pub fn new(
        settings: SyncSettings,
        vendors: Arc<VendorRegistry>,
        connections: Arc<ConnectionManager>,
        org_configs: OrgConfigs,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(settings.request_timeout())
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))?;
        let capacity = NonZeroUsize::new(settings.cache_capacity)
            .ok_or_else(|| Error::Config("cache capacity must be at least 1".to_string()))?;

        Ok(Self {
            settings,
            vendors,
            connections,
            org_configs,
            http,
            cache: Mutex::new(LruCache::new(capacity)),
        })
    }

    /// Execute one described call against the connection's vendor.
    pub async fn execute(
        &self,
        connection_id: Uuid,
        descriptor: &RequestDescriptor,
        cancel: &CancellationToken,
    ) -> Result<ResponseEnvelope> {
        let connection = self.connections.get(connection_id).await?;
        let profile = self.vendors.get(&connection.vendor)?;

        let cache_key = descriptor.cache_key(connection_id);
        if descriptor.operation.is_read() {
            if let Some(envelope) = self.cache_get(&cache_key).await {
                counter!("vendorsync_cache_hits_total", "vendor" => connection.vendor.clone())
                    .increment(1);
                return Ok(envelope);
            }
        }

        let org_config = self.org_configs.get(connection.organization_id);

        // Known-exhausted budget: suspend until the advertised reset
        // instead of burning a request on a guaranteed 429. Organizations
        // may keep part of the budget in reserve for other consumers.
        let reserve = org_config.rate_limit_reserve;
        if let Some(wait) = connection.rate_limit.exhausted_until(Utc::now(), reserve) {
            debug!(
                %connection_id,
                wait_secs = wait.num_seconds(),
                "rate limit budget exhausted; waiting for reset"
            );
            sleep_cancellable(wait.to_std().unwrap_or_default(), cancel).await?;
        }

        // The organization may cap retries tighter (or looser) than the
        // process-wide policy.
        let mut retry = self.settings.retry.clone();
        if let Some(max_retries) = org_config.max_retries {
            retry.max_retries = max_retries;
        }

        let envelope = self
            .execute_with_retries(connection_id, profile, descriptor, &retry, cancel)
            .await?;

        counter!(
            "vendorsync_api_requests_total",
            "vendor" => connection.vendor.clone(),
            "operation" => descriptor.operation.as_str(),
            "outcome" => if envelope.success { "success" } else { "failure" },
        )
        .increment(1);

        if envelope.success {
            if descriptor.operation.is_read() {
                self.cache_put(cache_key, envelope.clone()).await;
            } else {
                // A successful write makes cached reads for this
                // connection stale.
                self.cache_invalidate_connection(connection_id).await;
            }
        }

        Ok(envelope)
    }

    async fn execute_with_retries(
        &self,
        connection_id: Uuid,
        profile: &VendorProfile,
        descriptor: &RequestDescriptor,
        retry: &RetryPolicy,
        cancel: &CancellationToken,
    ) -> Result<ResponseEnvelope> {
        let mut attempt: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let token = self.connections.get_valid_token(connection_id).await?;
            let response = match self
                .send_once(profile, descriptor, &token)
                .await
            {
                Ok(response) => response,
                Err(err) if err.is_retryable() && attempt < retry.max_retries => {
                    let backoff = retry.backoff_for_attempt(attempt);
                    warn!(
                        %connection_id,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %err,
                        "transient request failure; backing off"
                    );
                    attempt += 1;
                    sleep_cancellable(backoff, cancel).await?;
                    continue;
                }
                Err(err) => return Err(err),
            };

            let status = response.status();
            let headers = response.headers().clone();
            let body = response.text().await.unwrap_or_default();

            let rate_limit = snapshot_from_headers(&headers, profile);
            if rate_limit != RateLimitSnapshot::default() {
                self.connections
                    .store_rate_limit(connection_id, rate_limit.clone())
                    .await?;
            }

            if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                return Err(Error::Auth(format!(
                    "vendor rejected credentials ({status}): {body}"
                )));
            }

            if status == StatusCode::TOO_MANY_REQUESTS {
                // Honoring Retry-After is compliance, not failure; it does
                // not consume the retry budget.
                let wait = parse_retry_after(&headers)
                    .unwrap_or(Duration::from_secs(self.settings.rate_limit_fallback_seconds));
                warn!(
                    %connection_id,
                    wait_secs = wait.as_secs(),
                    "received 429; honoring Retry-After"
                );
                counter!("vendorsync_rate_limit_waits_total", "vendor" => profile.slug.clone())
                    .increment(1);
                sleep_cancellable(wait, cancel).await?;
                continue;
            }

            if status.is_server_error() {
                if attempt < retry.max_retries {
                    let backoff = retry.backoff_for_attempt(attempt);
                    warn!(
                        %connection_id,
                        attempt,
                        status = status.as_u16(),
                        "server error; backing off"
                    );
                    attempt += 1;
                    sleep_cancellable(backoff, cancel).await?;
                    continue;
                }
                return Err(Error::Transient(format!(
                    "vendor returned {status} after {attempt} retries: {body}"
                )));
            }

            return Ok(build_envelope(status, &body, descriptor, profile, rate_limit));
        }
    }

    async fn send_once(
        &self,
        profile: &VendorProfile,
        descriptor: &RequestDescriptor,
        token: &str,
    ) -> Result<reqwest::Response> {
        let path = profile.collection_path(descriptor.entity_type)
            .map_err(|e| Error::Config(e.to_string()))?;
        let mut url = format!("{}{path}", profile.api_base);
        if let Some(id) = &descriptor.id {
            url.push('/');
            url.push_str(id);
        }

        let mut request = self.http.request(descriptor.operation.method(), &url);
        request = match &profile.auth_header {
            AuthHeaderStyle::Bearer => request.bearer_auth(token),
            AuthHeaderStyle::Token => {
                request.header(reqwest::header::AUTHORIZATION, format!("Token {token}"))
            }
            AuthHeaderStyle::Header { name } => request.header(name.as_str(), token),
        };
        if !descriptor.filters.is_empty() {
            request = request.query(&descriptor.filters);
        }
        if let Some(payload) = &descriptor.payload {
            request = request.json(payload);
        }

        Ok(request.send().await?)
    }

    async fn cache_get(&self, key: &str) -> Option<ResponseEnvelope> {
        let ttl = Duration::from_secs(self.settings.cache_ttl_seconds);
        let mut cache = self.cache.lock().await;
        match cache.get(key) {
            Some(cached) if cached.inserted_at.elapsed() < ttl => Some(cached.envelope.clone()),
            Some(_) => {
                cache.pop(key);
                None
            }
            None => None,
        }
    }

    async fn cache_put(&self, key: String, envelope: ResponseEnvelope) {
        self.cache.lock().await.put(
            key,
            CachedEnvelope {
                envelope,
                inserted_at: Instant::now(),
            },
        );
    }

    async fn cache_invalidate_connection(&self, connection_id: Uuid) {
        let prefix = format!("{connection_id}|");
        let mut cache = self.cache.lock().await;
        let stale: Vec<String> = cache
            .iter()
            .filter(|(key, _)| key.starts_with(&prefix))
            .map(|(key, _)| key.clone())
            .collect();
        for key in stale {
            cache.pop(&key);
        }
    }
}

fn build_envelope(
    status: StatusCode,
    body: &str,
    descriptor: &RequestDescriptor,
    profile: &VendorProfile,
    rate_limit: RateLimitSnapshot,
) -> ResponseEnvelope {
    let payload: Value = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_str(body).unwrap_or_else(|_| Value::String(body.to_string()))
    };

    let success = status.is_success();
    let errors = if success {
        Vec::new()
    } else {
        vec![format!("{status}: {body}")]
    };

    let pagination = if success && descriptor.operation == Operation::List {
        Some(extract_pagination(&payload, profile))
    } else {
        None
    };

    ResponseEnvelope {
        success,
        status: status.as_u16(),
        payload,
        errors,
        warnings: Vec::new(),
        pagination,
        rate_limit,
    }
}

fn extract_pagination(payload: &Value, profile: &VendorProfile) -> PageInfo {
    match &profile.pagination {
        PaginationStyle::Cursor {
            next_cursor_key,
            has_more_key,
            ..
        } => {
            let next_cursor = payload
                .get(next_cursor_key)
                .and_then(Value::as_str)
                .map(str::to_string);
            let has_more = payload
                .get(has_more_key)
                .and_then(Value::as_bool)
                .unwrap_or(next_cursor.is_some());
            PageInfo {
                next_cursor,
                has_more,
            }
        }
        // Page-numbered vendors signal exhaustion with a short page; the
        // caller compares page length against its requested size.
        PaginationStyle::PageNumber { .. } => PageInfo::default(),
    }
}

fn snapshot_from_headers(headers: &HeaderMap, profile: &VendorProfile) -> RateLimitSnapshot {
    let names = &profile.rate_limit_headers;
    let parse_u32 = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u32>().ok())
    };
    let reset_at = headers
        .get(names.reset.as_str())
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<i64>().ok())
        .and_then(|ts| DateTime::<Utc>::from_timestamp(ts, 0));

    RateLimitSnapshot {
        limit: parse_u32(&names.limit),
        remaining: parse_u32(&names.remaining),
        reset_at,
    }
}

fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
}

async fn sleep_cancellable(duration: Duration, cancel: &CancellationToken) -> Result<()> {
    tokio::select! {
        _ = cancel.cancelled() => Err(Error::Cancelled),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RateLimitHeaders;
    use serde_json::json;
    use std::collections::BTreeMap as Map;

    fn test_profile(pagination: PaginationStyle) -> VendorProfile {
        VendorProfile {
            slug: "acme_pm".into(),
            display_name: "Acme PM".into(),
            authorize_url: "https://auth.acme.test/authorize".into(),
            token_url: "https://auth.acme.test/token".into(),
            revoke_url: None,
            client_id: "cid".into(),
            client_secret: "secret".into(),
            redirect_uri: "https://app.test/callback".into(),
            api_base: "https://api.acme.test".into(),
            entity_paths: Map::from([(EntityType::Tenant, "/v1/tenants".into())]),
            list_key: "data".into(),
            natural_keys: Map::new(),
            auth_header: AuthHeaderStyle::Bearer,
            pagination,
            rate_limit_headers: RateLimitHeaders::default(),
            updated_since_param: "updated_since".into(),
        }
    }

    #[test]
    fn cache_keys_distinguish_filters_and_ids() {
        let connection_id = Uuid::new_v4();
        let list = RequestDescriptor::list(EntityType::Tenant);
        let filtered = RequestDescriptor::list(EntityType::Tenant).with_filter("page", "2");
        let item = RequestDescriptor::get(EntityType::Tenant, "t-1");

        assert_ne!(list.cache_key(connection_id), filtered.cache_key(connection_id));
        assert_ne!(list.cache_key(connection_id), item.cache_key(connection_id));
        assert_eq!(list.cache_key(connection_id), list.cache_key(connection_id));
    }

    #[test]
    fn rate_limit_snapshot_from_headers() {
        let profile = test_profile(PaginationStyle::PageNumber {
            page_param: "page".into(),
            size_param: "per_page".into(),
        });
        let mut headers = HeaderMap::new();
        headers.insert("X-RateLimit-Limit", "100".parse().unwrap());
        headers.insert("X-RateLimit-Remaining", "0".parse().unwrap());
        headers.insert("X-RateLimit-Reset", "1750000000".parse().unwrap());

        let snapshot = snapshot_from_headers(&headers, &profile);
        assert_eq!(snapshot.limit, Some(100));
        assert_eq!(snapshot.remaining, Some(0));
        assert!(snapshot.reset_at.is_some());
    }

    #[test]
    fn retry_after_seconds_parsed() {
        let mut headers = HeaderMap::new();
        headers.insert(reqwest::header::RETRY_AFTER, "7".parse().unwrap());
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(7)));
        assert_eq!(parse_retry_after(&HeaderMap::new()), None);
    }

    #[test]
    fn cursor_pagination_extracted_from_body() {
        let profile = test_profile(PaginationStyle::Cursor {
            param: "cursor".into(),
            next_cursor_key: "next_cursor".into(),
            has_more_key: "has_more".into(),
        });
        let page = extract_pagination(
            &json!({"data": [], "next_cursor": "abc", "has_more": true}),
            &profile,
        );
        assert_eq!(page.next_cursor.as_deref(), Some("abc"));
        assert!(page.has_more);

        let last = extract_pagination(&json!({"data": [], "has_more": false}), &profile);
        assert!(last.next_cursor.is_none());
        assert!(!last.has_more);
    }

    #[test]
    fn envelope_surfaces_failure_body() {
        let profile = test_profile(PaginationStyle::PageNumber {
            page_param: "page".into(),
            size_param: "per_page".into(),
        });
        let descriptor = RequestDescriptor::get(EntityType::Tenant, "t-1");
        let envelope = build_envelope(
            StatusCode::UNPROCESSABLE_ENTITY,
            r#"{"message": "email is invalid"}"#,
            &descriptor,
            &profile,
            RateLimitSnapshot::default(),
        );
        assert!(!envelope.success);
        assert_eq!(envelope.status, 422);
        assert_eq!(envelope.errors.len(), 1);
        assert_eq!(envelope.payload["message"], json!("email is invalid"));
    }

    #[test]
    fn list_records_handles_wrapped_and_bare_arrays() {
        let wrapped = ResponseEnvelope {
            success: true,
            status: 200,
            payload: json!({"data": [{"id": "1"}]}),
            errors: vec![],
            warnings: vec![],
            pagination: None,
            rate_limit: RateLimitSnapshot::default(),
        };
        assert_eq!(wrapped.list_records("data").len(), 1);

        let bare = ResponseEnvelope {
            payload: json!([{"id": "1"}, {"id": "2"}]),
            ..wrapped
        };
        assert_eq!(bare.list_records("data").len(), 2);
    }
}

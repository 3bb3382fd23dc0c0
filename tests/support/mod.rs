//! Shared fixtures for the integration tests: a mock vendor behind
//! wiremock, fast retry/backoff settings, and a fully wired service stack
//! over the in-memory stores.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use base64::Engine as _;
use chrono::{Duration, Utc};
use serde_json::Value;
use uuid::Uuid;
use wiremock::MockServer;

use vendorsync::audit::AuditService;
use vendorsync::client::ResilientClient;
use vendorsync::config::{
    AuthHeaderStyle, OrgConfigs, OrgSyncConfig, PaginationStyle, RateLimitHeaders, SyncSettings,
    VendorProfile, VendorRegistry,
};
use vendorsync::connections::ConnectionManager;
use vendorsync::crypto::{TokenCipher, TokenKey};
use vendorsync::mapping::{EntityMapping, FieldMapping, MappingEngine, TransformRegistry};
use vendorsync::models::connection::{Connection, ConnectionStatus};
use vendorsync::models::record::{EntityType, Record};
use vendorsync::orchestrator::SyncOrchestrator;
use vendorsync::reconciliation::ReconciliationService;
use vendorsync::store::Stores;
use vendorsync::webhooks::WebhookService;

pub const VENDOR: &str = "acme_pm";

pub fn test_key_base64() -> String {
    base64::engine::general_purpose::STANDARD.encode([7u8; 32])
}

pub fn test_cipher() -> TokenCipher {
    TokenCipher::new(TokenKey::new(vec![7u8; 32]).expect("test key"))
}

/// Fast settings: millisecond backoffs, tight worker tick.
pub fn test_settings() -> SyncSettings {
    let mut settings = SyncSettings::default();
    settings.retry.max_retries = 3;
    settings.retry.backoff_base_ms = 10;
    settings.retry.backoff_max_ms = 50;
    settings.retry.jitter_factor = 0.0;
    settings.request_timeout_seconds = 5;
    settings.job_timeout_seconds = 30;
    settings.rate_limit_fallback_seconds = 1;
    settings.worker_tick_ms = 50;
    settings.refresh_sweep_seconds = 1;
    settings.token_key_base64 = Some(test_key_base64());
    settings
}

pub fn test_profile(base: &str) -> VendorProfile {
    VendorProfile {
        slug: VENDOR.into(),
        display_name: "Acme Property Manager".into(),
        authorize_url: format!("{base}/oauth/authorize"),
        token_url: format!("{base}/oauth/token"),
        revoke_url: None,
        client_id: "client-id".into(),
        client_secret: "client-secret".into(),
        redirect_uri: "https://app.test/callback".into(),
        api_base: base.to_string(),
        entity_paths: BTreeMap::from([
            (EntityType::Tenant, "/v1/tenants".into()),
            (EntityType::Payment, "/v1/payments".into()),
        ]),
        list_key: "data".into(),
        natural_keys: BTreeMap::from([(EntityType::Tenant, "email".into())]),
        auth_header: AuthHeaderStyle::Bearer,
        pagination: PaginationStyle::PageNumber {
            page_param: "page".into(),
            size_param: "per_page".into(),
        },
        rate_limit_headers: RateLimitHeaders::default(),
        updated_since_param: "updated_since".into(),
    }
}

/// Near-identity mappings over the fields the tests exercise.
pub fn test_mappings() -> MappingEngine {
    let engine = MappingEngine::new(TransformRegistry::with_builtins());
    engine.register_mapping(EntityMapping {
        entity_type: EntityType::Tenant,
        to_vendor: vec![
            FieldMapping::direct("email", "email").required(),
            FieldMapping::direct("name", "name"),
            FieldMapping::direct("status", "status"),
            FieldMapping::direct("updated_at", "updated_at"),
        ],
        from_vendor: vec![
            FieldMapping::direct("email", "email").required(),
            FieldMapping::direct("name", "name"),
            FieldMapping::direct("status", "status"),
            FieldMapping::direct("updated_at", "updated_at"),
        ],
    });
    engine.register_mapping(EntityMapping {
        entity_type: EntityType::Payment,
        to_vendor: vec![
            FieldMapping::direct("amount", "amount").required(),
            FieldMapping::direct("status", "status"),
            FieldMapping::direct("paid_date", "paid_date"),
            FieldMapping::direct("updated_at", "updated_at"),
        ],
        from_vendor: vec![
            FieldMapping::direct("amount", "amount").required(),
            FieldMapping::direct("status", "status"),
            FieldMapping::direct("paid_date", "paid_date"),
            FieldMapping::direct("updated_at", "updated_at"),
        ],
    });
    engine
}

pub struct Harness {
    pub server: MockServer,
    pub settings: SyncSettings,
    pub stores: Stores,
    pub audit: AuditService,
    pub connections: Arc<ConnectionManager>,
    pub client: Arc<ResilientClient>,
    pub orchestrator: Arc<SyncOrchestrator>,
    pub reconciliation: ReconciliationService,
    pub webhooks: WebhookService,
    pub organization_id: Uuid,
}

impl Harness {
    pub async fn new() -> Self {
        let server = MockServer::start().await;
        let settings = test_settings();
        let stores = Stores::in_memory();
        let audit = AuditService::new(stores.audit.clone());

        let mut registry = VendorRegistry::new();
        registry.register(test_profile(&server.uri()));
        let vendors = Arc::new(registry);

        let connections = Arc::new(
            ConnectionManager::new(
                settings.clone(),
                vendors.clone(),
                stores.clone(),
                audit.clone(),
            )
            .expect("connection manager"),
        );
        let org_configs = OrgConfigs::new();
        let client = Arc::new(
            ResilientClient::new(
                settings.clone(),
                vendors.clone(),
                connections.clone(),
                org_configs.clone(),
            )
            .expect("client"),
        );
        let mappings = Arc::new(test_mappings());
        let orchestrator = Arc::new(SyncOrchestrator::new(
            settings.clone(),
            vendors.clone(),
            stores.clone(),
            connections.clone(),
            client.clone(),
            mappings.clone(),
            audit.clone(),
            org_configs,
        ));
        let reconciliation = ReconciliationService::new(
            stores.clone(),
            vendors.clone(),
            connections.clone(),
            client.clone(),
            mappings,
            orchestrator.clone(),
            audit.clone(),
        );
        let webhooks =
            WebhookService::new(stores.clone(), connections.clone(), orchestrator.clone());

        Self {
            server,
            settings,
            stores,
            audit,
            connections,
            client,
            orchestrator,
            reconciliation,
            webhooks,
            organization_id: Uuid::new_v4(),
        }
    }

    /// Insert a connected connection with sealed tokens expiring after
    /// `expires_in`.
    pub async fn seed_connection(&self, expires_in: Duration) -> Connection {
        let cipher = test_cipher();
        let mut connection = Connection::new(self.organization_id, VENDOR, vec!["read".into()]);
        connection.status = ConnectionStatus::Connected;
        let aad = connection.token_aad();
        connection.access_token_ciphertext =
            cipher.seal_token(&aad, Some("access-token")).expect("seal");
        connection.refresh_token_ciphertext =
            cipher.seal_token(&aad, Some("refresh-token")).expect("seal");
        connection.expires_at = Some(Utc::now() + expires_in);
        self.stores
            .connections
            .insert(connection.clone())
            .await
            .expect("insert connection");
        connection
    }

    pub async fn seed_record(&self, entity_type: EntityType, record: Value) -> Record {
        let record = record.as_object().expect("object record").clone();
        self.stores
            .records
            .upsert(self.organization_id, entity_type, record.clone())
            .await
            .expect("seed record");
        record
    }

    pub fn set_org_config(&self, mutate: impl FnOnce(&mut OrgSyncConfig)) {
        let mut config = OrgSyncConfig::new(self.organization_id);
        mutate(&mut config);
        self.orchestrator.set_org_config(config);
    }
}

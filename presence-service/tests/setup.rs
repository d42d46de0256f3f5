use std::sync::Arc;

use axum_test::TestServer;
use presence_service::services::presence_registry::PresenceRegistry;
use presence_service::services::rate_limiter::{
    IpHasher, RateLimiter, RateLimiterConfig, RateLimiterKind,
};
use presence_service::services::session_manager::SessionManager;
use presence_service::services::store::StoreAdapter;
use presence_service::services::store::postgres::PostgresStore;
use presence_service::services::token::TokenService;
use presence_test_utils::{TestDatabase, postgres_testcontainer};
use secrecy::SecretString;
use uuid::Uuid;

pub const JWT_SECRET: &str = "integration-test-jwt-signing-secret-value";
pub const IP_HASH_SECRET: &str = "integration-test-ip-hash-secret-value";

/// A running presence service wired directly over a fresh testcontainer
/// database, bypassing [`presence_service::PresenceServiceBuilder`] so tests
/// can reach the registry's sweep methods without waiting on real timers.
pub struct TestHarness {
    pub db: TestDatabase,
    pub server: TestServer,
    pub registry: Arc<PresenceRegistry>,
}

impl TestHarness {
    pub async fn start() -> eyre::Result<Self> {
        let db = postgres_testcontainer().await?;

        let store: Arc<dyn StoreAdapter> = Arc::new(
            PostgresStore::connect(&SecretString::from(db.connection_string.clone()), 5).await?,
        );
        let tokens = TokenService::new(
            &SecretString::from(JWT_SECRET.to_owned()),
            std::time::Duration::from_secs(24 * 60 * 60),
        );
        let ip_hasher = IpHasher::new(&SecretString::from(IP_HASH_SECRET.to_owned()));

        let sessions = Arc::new(SessionManager::new(
            store.clone(),
            tokens,
            ip_hasher,
            RateLimiter::new(RateLimiterKind::SessionBegin, RateLimiterConfig::session_begin()),
        ));
        let registry = Arc::new(PresenceRegistry::new(
            store.clone(),
            RateLimiter::new(RateLimiterKind::WsControl, RateLimiterConfig::ws_control()),
            RateLimiter::new(RateLimiterKind::Heartbeat, RateLimiterConfig::heartbeat()),
        ));
        let api_limiter = Arc::new(RateLimiter::new(RateLimiterKind::Api, RateLimiterConfig::api()));

        let gateway_state = presence_service::api::gateway::GatewayState {
            registry: registry.clone(),
            sessions: sessions.clone(),
            dev_mode: true,
            allowed_origins: Vec::new(),
        };
        let http_state = presence_service::api::http::HttpState {
            sessions,
            registry: registry.clone(),
            store,
            api_limiter,
        };

        let router = axum::Router::new()
            .merge(presence_service::api::gateway::routes(gateway_state))
            .merge(presence_service::api::http::routes(http_state));

        let server = TestServer::builder()
            .http_transport()
            .build(router)
            .expect("can build test server");

        Ok(Self {
            db,
            server,
            registry,
        })
    }

    /// Inserts a moment row directly, bypassing the administrative surface
    /// this crate never implements.
    pub async fn insert_moment(&self, status: &str, max_participants: i32) -> Uuid {
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
                INSERT INTO moment (id, slug, title, status, max_participants, duration_seconds)
                VALUES ($1, $2, 'Test Moment', $3, $4, 3600)
            "#,
        )
        .bind(id)
        .bind(format!("test-moment-{id}"))
        .bind(status)
        .bind(max_participants)
        .execute(&self.db.pool)
        .await
        .expect("inserts fixture moment");
        id
    }
}

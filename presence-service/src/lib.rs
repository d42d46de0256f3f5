#![deny(missing_docs)]
//! Core concurrent backend for the ephemeral presence service.
//!
//! The main entry point is [`PresenceServiceBuilder`]: a staged `init` that
//! loads configuration, connects to the durable store, and constructs every
//! service, followed by [`PresenceServiceBuilder::build`] which returns the
//! `axum::Router` to mount plus the background sweepers' `JoinHandle`s.
//!
//! If any sweeper encounters an unrecoverable error, the provided
//! `CancellationToken` is not touched automatically; the hosting binary
//! decides whether a sweeper failure is fatal. Cancelling the token signals
//! every sweeper to stop on its next tick and the Connection Gateway to close
//! its open channels.

use std::sync::Arc;

use eyre::Context as _;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::api::gateway::GatewayState;
use crate::api::http::HttpState;
use crate::services::presence_registry::PresenceRegistry;
use crate::services::rate_limiter::{IpHasher, RateLimiter, RateLimiterConfig, RateLimiterKind};
use crate::services::session_manager::SessionManager;
use crate::services::store::StoreAdapter;
use crate::services::store::postgres::PostgresStore;
use crate::services::token::TokenService;

pub mod api;
pub mod config;
pub mod metrics;
pub mod services;

pub use config::PresenceServiceConfig;

const SWEEPER_SHUTDOWN_REASON: &str = "server shutting down";
const SWEEPER_SHUTDOWN_CLOSE_CODE: u16 = 1000;

/// Builds and wires every service that makes up the presence core.
///
/// Call [`PresenceServiceBuilder::init`] once at process start, then
/// [`PresenceServiceBuilder::build`] to obtain the router and sweeper handles.
pub struct PresenceServiceBuilder {
    config: PresenceServiceConfig,
    store: Arc<dyn StoreAdapter>,
    sessions: Arc<SessionManager>,
    registry: Arc<PresenceRegistry>,
    api_limiter: Arc<RateLimiter>,
    cancellation_token: CancellationToken,
}

impl PresenceServiceBuilder {
    /// Initializes every service the core depends on.
    ///
    /// 1. Asserts the configured secrets meet the minimum length requirement.
    /// 2. Connects to Postgres.
    /// 3. Builds the Token Service, the IP hasher, and the four independently
    ///    configured rate limiters.
    /// 4. Builds the Session Manager and the Presence Registry over the
    ///    shared store handle.
    /// 5. Registers every metric descriptor.
    pub async fn init(
        config: PresenceServiceConfig,
        cancellation_token: CancellationToken,
    ) -> eyre::Result<Self> {
        config
            .assert_secrets_are_sane()
            .context("refusing to start with an unsafe secret")?;

        crate::metrics::describe_metrics();

        tracing::info!("connecting to the durable store..");
        let store: Arc<dyn StoreAdapter> = Arc::new(
            PostgresStore::connect(&config.database_url, config.database_max_connections)
                .await
                .context("while connecting to postgres")?,
        );

        let tokens = TokenService::new(&config.jwt_secret, config.session_token_lifetime);
        let ip_hasher = IpHasher::new(&config.ip_hash_secret);

        let session_begin_limiter = RateLimiter::new(
            RateLimiterKind::SessionBegin,
            RateLimiterConfig::session_begin(),
        );
        let control_limiter =
            RateLimiter::new(RateLimiterKind::WsControl, RateLimiterConfig::ws_control());
        let heartbeat_limiter =
            RateLimiter::new(RateLimiterKind::Heartbeat, RateLimiterConfig::heartbeat());
        let api_limiter = Arc::new(RateLimiter::new(RateLimiterKind::Api, RateLimiterConfig::api()));

        let sessions = Arc::new(SessionManager::new(
            store.clone(),
            tokens,
            ip_hasher,
            session_begin_limiter,
        ));
        let registry = Arc::new(PresenceRegistry::new(
            store.clone(),
            control_limiter,
            heartbeat_limiter,
        ));

        Ok(Self {
            config,
            store,
            sessions,
            registry,
            api_limiter,
            cancellation_token,
        })
    }

    /// Spawns the heartbeat-timeout and stale-session sweepers, merges the
    /// Connection Gateway and the HTTP Control Surface into one router, and
    /// returns it alongside the sweepers' `JoinHandle`s.
    ///
    /// The hosting binary should call `axum::serve` with
    /// `into_make_service_with_connect_info::<SocketAddr>()`, since both the
    /// gateway's origin check and the HTTP surface's rate limiting key off
    /// the peer address.
    pub fn build(self) -> (axum::Router, Vec<tokio::task::JoinHandle<()>>) {
        let heartbeat_sweeper = tokio::spawn(heartbeat_sweeper_task(
            self.registry.clone(),
            self.config.heartbeat_sweep_interval,
            self.config.heartbeat_timeout,
            self.cancellation_token.clone(),
        ));
        let stale_session_sweeper = tokio::spawn(stale_session_sweeper_task(
            self.sessions.clone(),
            self.registry.clone(),
            self.api_limiter.clone(),
            self.config.stale_session_sweep_interval,
            self.config.stale_session_max_idle,
            self.cancellation_token.clone(),
        ));

        let gateway_state = GatewayState {
            registry: self.registry.clone(),
            sessions: self.sessions.clone(),
            dev_mode: self.config.dev_mode,
            allowed_origins: self.config.allowed_origins.clone(),
        };
        let http_state = HttpState {
            sessions: self.sessions,
            registry: self.registry,
            store: self.store,
            api_limiter: self.api_limiter,
        };

        let router = axum::Router::new()
            .merge(api::gateway::routes(gateway_state))
            .merge(api::http::routes(http_state))
            .layer(TraceLayer::new_for_http());

        (router, vec![heartbeat_sweeper, stale_session_sweeper])
    }
}

async fn heartbeat_sweeper_task(
    registry: Arc<PresenceRegistry>,
    tick_interval: std::time::Duration,
    timeout: std::time::Duration,
    cancellation_token: CancellationToken,
) {
    let mut interval = tokio::time::interval(tick_interval);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let reaped = registry.sweep_timed_out(timeout).await;
                if reaped > 0 {
                    tracing::debug!(reaped, "closed timed-out channels");
                }
            }
            _ = cancellation_token.cancelled() => {
                tracing::info!("closing every open channel before shutdown");
                registry
                    .close_all(SWEEPER_SHUTDOWN_CLOSE_CODE, SWEEPER_SHUTDOWN_REASON)
                    .await;
                break;
            }
        }
    }
}

async fn stale_session_sweeper_task(
    sessions: Arc<SessionManager>,
    registry: Arc<PresenceRegistry>,
    api_limiter: Arc<RateLimiter>,
    tick_interval: std::time::Duration,
    max_idle: std::time::Duration,
    cancellation_token: CancellationToken,
) {
    let mut interval = tokio::time::interval(tick_interval);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                match sessions.sweep_stale(max_idle).await {
                    Ok(reaped) if reaped > 0 => tracing::debug!(reaped, "reaped stale sessions"),
                    Ok(_) => {}
                    Err(err) => tracing::warn!(error = %err, "stale-session sweep failed"),
                }
                let dropped = sessions.sweep_rate_limiter()
                    + registry.sweep_rate_limiters()
                    + api_limiter.sweep();
                if dropped > 0 {
                    tracing::trace!(dropped, "swept expired rate limiter entries");
                }
            }
            _ = cancellation_token.cancelled() => break,
        }
    }
}

//! The HTTP Control Surface: `/session/begin`, `/session/end`,
//! `/moment/current`, and `/health`.
//!
//! Every response here carries `Cache-Control: no-store`; none of this
//! surface's state is safe to cache at any layer.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, State};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use axum_extra::TypedHeader;
use axum_extra::headers::authorization::Bearer;
use axum_extra::headers::{Authorization, HeaderMapExt, UserAgent};
use http::{HeaderValue, header};
use presence_types::domain::{
    HealthResponse, HealthStats, MomentView, SessionBeginResponse, SessionEndResponse,
};
use presence_types::MomentId;
use serde::Deserialize;
use tower_http::set_header::SetResponseHeaderLayer;
use tracing::instrument;

use super::errors::ApiError;
use crate::services::presence_registry::PresenceRegistry;
use crate::services::rate_limiter::{RateDecision, RateLimiter};
use crate::services::session_manager::{CreateAnonymousRequest, SessionManager};
use crate::services::store::StoreAdapter;

const RATE_KEY_PREFIX_BEGIN: &str = "http:begin";
const RATE_KEY_PREFIX_API: &str = "http:api";

/// Shared state the HTTP control surface's handlers are built over.
#[derive(Clone)]
pub struct HttpState {
    /// Resolves moments, issues and ends sessions.
    pub sessions: Arc<SessionManager>,
    /// Source of truth for live presence counts.
    pub registry: Arc<PresenceRegistry>,
    /// Durable storage, consulted directly for moment lookups and health.
    pub store: Arc<dyn StoreAdapter>,
    /// Rate limiter guarding `/moment/current` and `/session/end`.
    pub api_limiter: Arc<RateLimiter>,
}

#[derive(Debug, Deserialize, Default)]
struct SessionBeginBody {
    moment_id: Option<MomentId>,
}

/// Builds a router exposing the four control-surface endpoints, all with
/// `Cache-Control: no-store`.
pub fn routes(state: HttpState) -> Router {
    Router::new()
        .route("/session/begin", post(session_begin))
        .route("/session/end", post(session_end))
        .route("/moment/current", get(moment_current))
        .route("/health", get(health))
        .layer(SetResponseHeaderLayer::overriding(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-store"),
        ))
        .with_state(state)
}

fn rate_key(prefix: &str, addr: &SocketAddr) -> String {
    format!("{prefix}:{}", addr.ip())
}

#[instrument(level = "debug", skip(state, headers, body))]
async fn session_begin(
    State(state): State<HttpState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: http::HeaderMap,
    body: Option<Json<SessionBeginBody>>,
) -> Result<impl IntoResponse, ApiError> {
    let user_agent = headers
        .typed_get::<UserAgent>()
        .map(|ua| ua.as_str().to_owned());
    let request = CreateAnonymousRequest {
        moment_id: body.map(|Json(b)| b.moment_id).unwrap_or_default(),
        user_agent,
        ip_address: Some(addr.ip().to_string()),
    };

    let created = state
        .sessions
        .create_anonymous(request, &rate_key(RATE_KEY_PREFIX_BEGIN, &addr))
        .await?;

    Ok(Json(SessionBeginResponse {
        token: created.token,
        session_id: created.session_id,
        moment_id: created.moment_id,
        expires_at: created.expires_at,
    }))
}

#[instrument(level = "debug", skip(state, authorization))]
async fn session_end(
    State(state): State<HttpState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    authorization: Option<TypedHeader<Authorization<Bearer>>>,
) -> Result<impl IntoResponse, ApiError> {
    let TypedHeader(authorization) = authorization.ok_or(ApiError::MissingToken)?;

    if let RateDecision::Denied {
        retry_after_seconds,
    } = state.api_limiter.check(&rate_key(RATE_KEY_PREFIX_API, &addr))
    {
        return Err(ApiError::RateLimited {
            retry_after_seconds,
        });
    }

    let claims = state.sessions.verify(authorization.token()).await?;

    state.registry.evict_session(claims.session_id).await;
    if let Err(err) = state
        .store
        .delete_presences_by_session_id(claims.session_id)
        .await
    {
        tracing::warn!(session_id = %claims.session_id, error = %err, "defensive presence cleanup failed");
    }

    let duration_seconds = state.sessions.end(claims.session_id).await?;

    Ok(Json(SessionEndResponse {
        session_id: claims.session_id,
        moment_id: claims.moment_id,
        duration_seconds,
        duration_minutes: duration_seconds / 60,
    }))
}

#[instrument(level = "debug", skip(state))]
async fn moment_current(
    State(state): State<HttpState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Result<impl IntoResponse, ApiError> {
    if let RateDecision::Denied {
        retry_after_seconds,
    } = state.api_limiter.check(&rate_key(RATE_KEY_PREFIX_API, &addr))
    {
        return Err(ApiError::RateLimited {
            retry_after_seconds,
        });
    }

    let moment = state
        .store
        .find_first_live()
        .await?
        .ok_or(ApiError::NoLiveMoment)?;
    let presence_count = state.registry.presence_count(moment.id);

    Ok(Json(MomentView::from((&moment, presence_count))))
}

#[instrument(level = "debug", skip(state))]
async fn health(State(state): State<HttpState>) -> impl IntoResponse {
    match gather_health_stats(&state).await {
        Ok(stats) => (
            http::StatusCode::OK,
            Json(HealthResponse {
                status: "healthy",
                database: "connected",
                stats,
            }),
        )
            .into_response(),
        Err(_) => (
            http::StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthResponse {
                status: "unhealthy",
                database: "disconnected",
                stats: HealthStats::default(),
            }),
        )
            .into_response(),
    }
}

async fn gather_health_stats(
    state: &HttpState,
) -> Result<HealthStats, crate::services::store::StoreError> {
    state.store.ping().await?;
    let total_sessions = state.store.count_sessions().await?;
    let total_presences = state.store.count_presences(None).await?;
    let live_moment_id = state.store.find_first_live().await?.map(|m| m.id);
    Ok(HealthStats {
        total_sessions,
        total_presences,
        live_moment_id,
    })
}

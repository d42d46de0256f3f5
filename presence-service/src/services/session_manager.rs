//! Durable session bookkeeping: creation, verification, ending, and the
//! stale-session sweeper.

use std::sync::Arc;

use chrono::Utc;
use presence_types::domain::MomentStatus;
use presence_types::{MomentId, SessionId};
use tracing::instrument;

use super::rate_limiter::{IpHasher, RateDecision, RateLimiter};
use super::store::{NewSession, StoreAdapter, StoreError};
use super::token::{TokenClaims, TokenError, TokenService};
use crate::metrics::{METRICS_ID_SESSIONS_CREATED, METRICS_ID_SESSIONS_ENDED, METRICS_ID_SESSIONS_REAPED};

/// Every way [`SessionManager`] operations can fail.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The caller must back off before retrying.
    #[error("rate limited, retry after {retry_after_seconds}s")]
    RateLimited {
        /// Seconds the caller should wait before retrying.
        retry_after_seconds: u64,
    },
    /// No moment exists with the requested id.
    #[error("moment not found")]
    MomentNotFound,
    /// The moment exists but is not currently live.
    #[error("moment not live")]
    MomentNotLive,
    /// The token failed signature, claims, or algorithm validation.
    #[error("invalid token")]
    InvalidToken,
    /// No session exists with the decoded id.
    #[error("session not found")]
    SessionNotFound,
    /// The session has already ended.
    #[error("session already ended")]
    AlreadyEnded,
    /// The durable store could not be reached.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<TokenError> for SessionError {
    fn from(_: TokenError) -> Self {
        SessionError::InvalidToken
    }
}

/// The successful result of [`SessionManager::create_anonymous`].
#[derive(Debug, Clone)]
pub struct CreatedSession {
    /// The signed session token.
    pub token: String,
    /// The newly created session id.
    pub session_id: SessionId,
    /// The moment the session was begun against.
    pub moment_id: MomentId,
    /// When the token expires.
    pub expires_at: chrono::DateTime<Utc>,
}

/// Input to [`SessionManager::create_anonymous`].
#[derive(Debug, Clone, Default)]
pub struct CreateAnonymousRequest {
    /// The moment the caller wants a session against, if known in advance.
    pub moment_id: Option<MomentId>,
    /// Raw `User-Agent` header, truncated to 500 code units before storage.
    pub user_agent: Option<String>,
    /// Raw client address; hashed before storage, never stored raw.
    pub ip_address: Option<String>,
}

const USER_AGENT_MAX_LEN: usize = 500;

/// Creates, verifies, and ends durable sessions.
pub struct SessionManager {
    store: Arc<dyn StoreAdapter>,
    tokens: TokenService,
    ip_hasher: IpHasher,
    session_begin_limiter: RateLimiter,
}

impl SessionManager {
    /// Builds a manager over `store`, minting tokens via `tokens` and
    /// hashing addresses with `ip_hasher`.
    pub fn new(
        store: Arc<dyn StoreAdapter>,
        tokens: TokenService,
        ip_hasher: IpHasher,
        session_begin_limiter: RateLimiter,
    ) -> Self {
        Self {
            store,
            tokens,
            ip_hasher,
            session_begin_limiter,
        }
    }

    /// Returns the currently live moment, or the one named in `request`.
    #[instrument(level = "debug", skip(self))]
    async fn resolve_moment(
        &self,
        moment_id: Option<MomentId>,
    ) -> Result<presence_types::domain::Moment, SessionError> {
        let moment = match moment_id {
            Some(id) => self
                .store
                .find_moment_by_id(id)
                .await?
                .ok_or(SessionError::MomentNotFound)?,
            None => self
                .store
                .find_first_live()
                .await?
                .ok_or(SessionError::MomentNotFound)?,
        };
        if moment.status != MomentStatus::Live {
            return Err(SessionError::MomentNotLive);
        }
        Ok(moment)
    }

    /// Creates a new anonymous session bound to a live moment, rate-limited
    /// per `rate_key`.
    #[instrument(level = "debug", skip(self, request), fields(moment_id = ?request.moment_id))]
    pub async fn create_anonymous(
        &self,
        request: CreateAnonymousRequest,
        rate_key: &str,
    ) -> Result<CreatedSession, SessionError> {
        if let RateDecision::Denied {
            retry_after_seconds,
        } = self.session_begin_limiter.check(rate_key)
        {
            return Err(SessionError::RateLimited {
                retry_after_seconds,
            });
        }

        let moment = self.resolve_moment(request.moment_id).await?;

        let user_agent = request
            .user_agent
            .map(|ua| ua.chars().take(USER_AGENT_MAX_LEN).collect());
        let ip_hash = request
            .ip_address
            .as_deref()
            .map(|addr| self.ip_hasher.hash(addr));

        let session_id = self
            .store
            .create_session(NewSession {
                moment_id: moment.id,
                user_agent,
                ip_hash,
            })
            .await?;

        let (token, expires_at) = self.tokens.issue(session_id, moment.id)?;
        self.store.set_issued_token(session_id, &token).await?;
        self.store.increment_total_sessions(moment.id).await?;
        ::metrics::counter!(METRICS_ID_SESSIONS_CREATED).increment(1);

        Ok(CreatedSession {
            token,
            session_id,
            moment_id: moment.id,
            expires_at,
        })
    }

    /// Verifies a token's signature and that its session is still open.
    #[instrument(level = "debug", skip(self, token))]
    pub async fn verify(&self, token: &str) -> Result<TokenClaims, SessionError> {
        let claims = self.tokens.verify(token)?;
        let session = self
            .store
            .find_session(claims.session_id)
            .await?
            .ok_or(SessionError::SessionNotFound)?;
        if session.is_ended() {
            return Err(SessionError::AlreadyEnded);
        }
        Ok(claims)
    }

    /// Ends a session, returning its total duration in seconds.
    #[instrument(level = "debug", skip(self))]
    pub async fn end(&self, session_id: SessionId) -> Result<u64, SessionError> {
        let session = self
            .store
            .find_session(session_id)
            .await?
            .ok_or(SessionError::SessionNotFound)?;
        if session.is_ended() {
            return Err(SessionError::AlreadyEnded);
        }

        let now = Utc::now();
        let duration_seconds = (now - session.started_at).num_seconds().max(0) as u64;
        let minutes_present = duration_seconds / 60;

        self.store
            .end_session_transactionally(
                session_id,
                session.moment_id,
                now,
                duration_seconds,
                minutes_present,
            )
            .await?;
        ::metrics::counter!(METRICS_ID_SESSIONS_ENDED).increment(1);

        Ok(duration_seconds)
    }

    /// Ends every session whose presences have all gone stale, returning how
    /// many were reaped.
    #[instrument(level = "debug", skip(self))]
    pub async fn sweep_stale(&self, max_idle: std::time::Duration) -> Result<usize, SessionError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(max_idle).unwrap_or(chrono::Duration::hours(24));
        let stale = self.store.find_stale_sessions(cutoff).await?;
        let mut reaped = 0;
        for session in stale {
            match self.end(session.id).await {
                Ok(_) => reaped += 1,
                Err(SessionError::AlreadyEnded) => {}
                Err(err) => tracing::warn!(session_id = %session.id, error = %err, "failed to reap stale session"),
            }
        }
        if reaped > 0 {
            ::metrics::counter!(METRICS_ID_SESSIONS_REAPED).increment(reaped as u64);
        }
        Ok(reaped)
    }

    /// Drops expired, unblocked entries from the session-begin rate limiter.
    pub fn sweep_rate_limiter(&self) -> usize {
        self.session_begin_limiter.sweep()
    }
}

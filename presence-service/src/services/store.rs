//! The narrow interface over durable storage.
//!
//! Every method may fail with [`StoreError::Unavailable`]; callers treat a
//! store failure as transient and never retry inline. The production
//! implementation lives in [`postgres`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use presence_types::domain::{Moment, Session};
use presence_types::{MomentId, PresenceId, SessionId};

pub mod postgres;

/// Fields accepted when inserting a new session row.
#[derive(Debug, Clone)]
pub struct NewSession {
    /// The moment the session belongs to.
    pub moment_id: MomentId,
    /// Client-supplied user agent, already truncated to 500 code units.
    pub user_agent: Option<String>,
    /// Keyed SHA-256 hash of the client address.
    pub ip_hash: Option<String>,
}

/// Fields accepted when inserting a new presence row.
#[derive(Debug, Clone)]
pub struct NewPresence {
    /// The owning channel's stable identifier.
    pub socket_id: String,
    /// The session this presence belongs to.
    pub session_id: SessionId,
    /// The moment this presence belongs to.
    pub moment_id: MomentId,
}

/// The error every [`StoreAdapter`] method may return.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The durable store could not be reached or returned an unexpected error.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// A narrow, transactional interface over moments, sessions, and presences.
///
/// Object-safe so it can be held behind an `Arc<dyn StoreAdapter>` in router
/// state; the one production implementation is [`postgres::PostgresStore`].
#[async_trait]
pub trait StoreAdapter: Send + Sync {
    /// Looks up a moment by id.
    async fn find_moment_by_id(&self, id: MomentId) -> Result<Option<Moment>, StoreError>;

    /// Returns whichever moment the store considers currently live, if any.
    ///
    /// Administrative code is trusted to keep at most one moment live; if
    /// more than one row qualifies, this returns whichever the underlying
    /// query returns first and does not attempt to arbitrate.
    async fn find_first_live(&self) -> Result<Option<Moment>, StoreError>;

    /// Increments `total_sessions` by one for the given moment.
    async fn increment_total_sessions(&self, id: MomentId) -> Result<(), StoreError>;

    /// Applies a compare-and-update to `peak_presence`: only writes if
    /// `candidate` strictly exceeds the moment's stored peak.
    async fn bump_peak_presence(&self, id: MomentId, candidate: u32) -> Result<(), StoreError>;

    /// Inserts a new session row, returning its generated id.
    async fn create_session(&self, data: NewSession) -> Result<SessionId, StoreError>;

    /// Loads a session by id.
    async fn find_session(&self, id: SessionId) -> Result<Option<Session>, StoreError>;

    /// Records the token string issued for a session, for bookkeeping only.
    async fn set_issued_token(&self, id: SessionId, token: &str) -> Result<(), StoreError>;

    /// Ends a session as a single transaction: sets `ended_at`/`duration_seconds`,
    /// deletes its presences, and, when `minutes_present > 0`, bumps the
    /// moment's minute counter.
    async fn end_session_transactionally(
        &self,
        session_id: SessionId,
        moment_id: MomentId,
        ended_at: DateTime<Utc>,
        duration_seconds: u64,
        minutes_present: u64,
    ) -> Result<(), StoreError>;

    /// Inserts a new presence row.
    async fn create_presence(&self, data: NewPresence) -> Result<PresenceId, StoreError>;

    /// Deletes the presence row owned by a socket, if any.
    async fn delete_presence_by_socket_id(&self, socket_id: &str) -> Result<(), StoreError>;

    /// Deletes every presence row belonging to a session.
    async fn delete_presences_by_session_id(
        &self,
        session_id: SessionId,
    ) -> Result<(), StoreError>;

    /// Write-through of a heartbeat timestamp for a presence's socket.
    async fn update_presence_heartbeat(
        &self,
        socket_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Counts live presences, optionally scoped to one moment.
    async fn count_presences(&self, moment_id: Option<MomentId>) -> Result<u64, StoreError>;

    /// Returns every session whose presences have all gone stale as of `cutoff`.
    async fn find_stale_sessions(&self, cutoff: DateTime<Utc>)
    -> Result<Vec<Session>, StoreError>;

    /// Counts every session row ever created, ended or not.
    async fn count_sessions(&self) -> Result<u64, StoreError>;

    /// A trivial round-trip used by the health endpoint to probe connectivity.
    async fn ping(&self) -> Result<(), StoreError>;
}

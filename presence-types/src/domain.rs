//! Domain value types for moments, sessions and presences.
//!
//! These mirror the persisted rows the Store Adapter reads and writes; they
//! intentionally carry no behavior beyond simple accessors so that both the
//! service crate and test utilities can share one definition.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{MomentId, PresenceId, SessionId};

/// Lifecycle state of a [`Moment`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MomentStatus {
    /// The moment has been created but has not started yet.
    Scheduled,
    /// The moment is currently accepting sessions and presences.
    Live,
    /// The moment has concluded; no new sessions may begin against it.
    Ended,
}

/// The ambient, time-boxed shared experience that presence is counted against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Moment {
    /// Opaque identifier.
    pub id: MomentId,
    /// Lowercase, hyphenated slug.
    pub slug: String,
    /// Human-readable title.
    pub title: String,
    /// Current lifecycle status.
    pub status: MomentStatus,
    /// Maximum number of concurrent participants, always `>= 2`.
    pub max_participants: u32,
    /// Planned duration in seconds, within `[60, 86400]`.
    pub duration_seconds: u32,
    /// Cumulative number of sessions ever begun against this moment.
    pub total_sessions: u64,
    /// Cumulative number of whole minutes of presence ever accrued.
    pub total_minutes_present: u64,
    /// The highest concurrent presence count ever observed for this moment.
    pub peak_presence: u32,
    /// When the moment was created.
    pub created_at: DateTime<Utc>,
}

impl Moment {
    /// Returns `true` if the moment currently accepts sessions and presences.
    pub fn is_live(&self) -> bool {
        self.status == MomentStatus::Live
    }
}

/// The public, privacy-safe view of a [`Moment`] returned by `GET /moment/current`.
///
/// Deliberately excludes anything session-scoped: no ip hashes, no user
/// agents, no session or socket identifiers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MomentView {
    /// Opaque identifier.
    pub id: MomentId,
    /// Lowercase, hyphenated slug.
    pub slug: String,
    /// Human-readable title.
    pub title: String,
    /// Maximum number of concurrent participants.
    pub max_participants: u32,
    /// Planned duration in seconds.
    pub duration_seconds: u32,
    /// Live presence count, read from the in-memory registry when possible.
    pub presence_count: u32,
    /// The highest concurrent presence count ever observed for this moment.
    pub peak_presence: u32,
}

impl From<(&Moment, u32)> for MomentView {
    fn from((moment, presence_count): (&Moment, u32)) -> Self {
        Self {
            id: moment.id,
            slug: moment.slug.clone(),
            title: moment.title.clone(),
            max_participants: moment.max_participants,
            duration_seconds: moment.duration_seconds,
            presence_count,
            peak_presence: moment.peak_presence,
        }
    }
}

/// One visitor's durable stay in one moment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Opaque identifier.
    pub id: SessionId,
    /// The moment this session belongs to.
    pub moment_id: MomentId,
    /// When the session was created.
    pub started_at: DateTime<Utc>,
    /// When the session ended, if it has.
    pub ended_at: Option<DateTime<Utc>>,
    /// Duration in whole seconds, set only once `ended_at` is set.
    pub duration_seconds: u64,
    /// Client-supplied user agent, truncated to 500 code units.
    pub user_agent: Option<String>,
    /// Keyed SHA-256 hash of the client's address, 64 hex characters.
    pub ip_hash: Option<String>,
    /// The token string issued for this session, kept only for bookkeeping.
    ///
    /// Never consulted for authentication; the cryptographically verified
    /// token is always authoritative.
    pub issued_token: Option<String>,
}

impl Session {
    /// Returns `true` if `end()` has already been called for this session.
    pub fn is_ended(&self) -> bool {
        self.ended_at.is_some()
    }
}

/// One live duplex channel attached to a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Presence {
    /// Opaque identifier.
    pub id: PresenceId,
    /// The stable socket id of the owning channel, stored as a string.
    pub socket_id: String,
    /// The session this presence belongs to.
    pub session_id: SessionId,
    /// The moment this presence belongs to.
    pub moment_id: MomentId,
    /// When the channel connected.
    pub connected_at: DateTime<Utc>,
    /// The last time a heartbeat was durably recorded for this presence.
    pub last_heartbeat_at: DateTime<Utc>,
}

/// The response body of `POST /session/begin`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionBeginResponse {
    /// The signed session token.
    pub token: String,
    /// The newly created session id.
    pub session_id: SessionId,
    /// The moment the session was begun against.
    pub moment_id: MomentId,
    /// When the token expires.
    pub expires_at: DateTime<Utc>,
}

/// The response body of `POST /session/end`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEndResponse {
    /// The ended session's id.
    pub session_id: SessionId,
    /// The moment the session belonged to.
    pub moment_id: MomentId,
    /// Total duration of the session, in whole seconds.
    pub duration_seconds: u64,
    /// Total duration of the session, in whole minutes (floored).
    pub duration_minutes: u64,
}

/// The response body of `GET /health`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// `"healthy"` or `"unhealthy"`.
    pub status: &'static str,
    /// `"connected"` or `"disconnected"`.
    pub database: &'static str,
    /// Aggregate counters reported alongside health.
    pub stats: HealthStats,
}

/// Aggregate counters returned by `GET /health`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthStats {
    /// Total number of sessions ever created.
    pub total_sessions: u64,
    /// Total number of presences currently live, across all moments.
    pub total_presences: u64,
    /// The currently live moment's id, if any.
    pub live_moment_id: Option<MomentId>,
}

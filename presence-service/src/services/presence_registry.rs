//! The in-memory, authoritative presence registry.
//!
//! Four maps track every live channel: which handle owns a socket, the
//! socket's connection state, the presence it has joined (if any), and the
//! reverse index from moment to socket set. Every mutation goes through one
//! of the operations below; nothing outside this module writes to the maps
//! directly.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use presence_types::domain::MomentStatus;
use presence_types::frame::{ServerFrame, TimestampMillis};
use presence_types::{ErrorCode, MomentId, SessionId};
use tracing::instrument;

use super::broadcast::{broadcast_presence_update, snapshot_moment_sockets};
use super::rate_limiter::{RateDecision, RateLimiter};
use super::session_manager::{SessionError, SessionManager};
use super::store::{NewPresence, StoreAdapter, StoreError};
use crate::metrics::{
    METRICS_ID_PRESENCES_OPEN, METRICS_ID_SOCKETS_OPEN, METRICS_ID_SOCKETS_TIMED_OUT,
};

/// A live duplex channel the registry can send frames to or close.
///
/// Implemented by the Connection Gateway over a per-socket outbound `mpsc`
/// channel so that sends from multiple broadcast producers serialize through
/// one queue and ordering holds trivially.
pub trait ChannelHandle: Send + Sync {
    /// Enqueues a frame for delivery; returns `false` if the channel is
    /// already gone.
    fn send(&self, frame: ServerFrame) -> bool;
    /// Requests the channel close with the given close code and reason.
    fn close(&self, code: u16, reason: String);
}

#[derive(Debug, Clone)]
struct ConnState {
    session_id: Option<SessionId>,
    moment_id: Option<MomentId>,
    connected_at: DateTime<Utc>,
    last_heartbeat_at: DateTime<Utc>,
    message_count: u64,
    is_joined: bool,
}

#[derive(Debug, Clone)]
struct PresenceInfo {
    session_id: SessionId,
    moment_id: MomentId,
    connected_at: DateTime<Utc>,
    last_heartbeat_at: DateTime<Utc>,
    last_durable_heartbeat_at: DateTime<Utc>,
}

/// The outcome of a failed [`PresenceRegistry::join`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinError {
    /// The socket has already joined a moment.
    AlreadyJoined,
    /// The token failed verification.
    InvalidToken,
    /// The token's moment does not match the one the socket claimed.
    MomentMismatch,
    /// No moment exists with the claimed id.
    MomentNotFound,
    /// The moment exists but is not live.
    MomentNotLive,
    /// The durable store could not be reached.
    StoreUnavailable,
}

impl JoinError {
    /// Maps this error onto the closed, client-visible error-code vocabulary.
    pub fn error_code(self) -> ErrorCode {
        match self {
            JoinError::AlreadyJoined => ErrorCode::AlreadyJoined,
            JoinError::InvalidToken | JoinError::MomentMismatch => ErrorCode::InvalidToken,
            JoinError::MomentNotFound => ErrorCode::MomentNotFound,
            JoinError::MomentNotLive => ErrorCode::MomentNotLive,
            JoinError::StoreUnavailable => ErrorCode::ServerError,
        }
    }
}

const DURABLE_HEARTBEAT_MIN_INTERVAL: Duration = Duration::from_secs(60);

/// The authoritative, in-memory presence registry.
pub struct PresenceRegistry {
    conn: DashMap<String, Arc<dyn ChannelHandle>>,
    conn_state: DashMap<String, ConnState>,
    presence: DashMap<String, PresenceInfo>,
    by_moment: DashMap<MomentId, Arc<DashSet<String>>>,
    store: Arc<dyn StoreAdapter>,
    control_limiter: RateLimiter,
    heartbeat_limiter: RateLimiter,
}

impl PresenceRegistry {
    /// Builds an empty registry writing through to `store`.
    pub fn new(
        store: Arc<dyn StoreAdapter>,
        control_limiter: RateLimiter,
        heartbeat_limiter: RateLimiter,
    ) -> Self {
        Self {
            conn: DashMap::new(),
            conn_state: DashMap::new(),
            presence: DashMap::new(),
            by_moment: DashMap::new(),
            store,
            control_limiter,
            heartbeat_limiter,
        }
    }

    /// Registers a newly accepted channel under `socket_id`.
    pub fn register(&self, socket_id: String, channel: Arc<dyn ChannelHandle>) {
        let now = Utc::now();
        self.conn.insert(socket_id.clone(), channel);
        self.conn_state.insert(
            socket_id,
            ConnState {
                session_id: None,
                moment_id: None,
                connected_at: now,
                last_heartbeat_at: now,
                message_count: 0,
                is_joined: false,
            },
        );
        ::metrics::gauge!(METRICS_ID_SOCKETS_OPEN).increment(1);
    }

    /// Removes a channel, leaving its presence first if it has one.
    #[instrument(level = "debug", skip(self))]
    pub async fn unregister(&self, socket_id: &str) {
        if self.presence.contains_key(socket_id) {
            self.leave(socket_id).await;
        }
        self.conn.remove(socket_id);
        self.conn_state.remove(socket_id);
        ::metrics::gauge!(METRICS_ID_SOCKETS_OPEN).decrement(1);
    }

    /// Consults the control-channel rate limiter for `socket_id`.
    pub fn check_control_rate_limit(&self, socket_id: &str) -> RateDecision {
        self.control_limiter.check(socket_id)
    }

    /// Attempts to join `claimed_moment_id`, verifying `token` via `sessions`.
    #[instrument(level = "debug", skip(self, sessions, token))]
    pub async fn join(
        &self,
        socket_id: &str,
        token: &str,
        claimed_moment_id: MomentId,
        sessions: &SessionManager,
    ) -> Result<u32, JoinError> {
        if self
            .conn_state
            .get(socket_id)
            .map(|s| s.is_joined)
            .unwrap_or(false)
        {
            return Err(JoinError::AlreadyJoined);
        }

        let claims = sessions.verify(token).await.map_err(|err| match err {
            SessionError::Store(_) => JoinError::StoreUnavailable,
            _ => JoinError::InvalidToken,
        })?;
        if claims.moment_id != claimed_moment_id {
            return Err(JoinError::InvalidToken);
        }

        let moment = self
            .store
            .find_moment_by_id(claimed_moment_id)
            .await
            .map_err(|_: StoreError| JoinError::StoreUnavailable)?
            .ok_or(JoinError::MomentNotFound)?;
        if moment.status != MomentStatus::Live {
            return Err(JoinError::MomentNotLive);
        }

        self.store
            .create_presence(NewPresence {
                socket_id: socket_id.to_owned(),
                session_id: claims.session_id,
                moment_id: claimed_moment_id,
            })
            .await
            .map_err(|_: StoreError| JoinError::StoreUnavailable)?;

        let now = Utc::now();
        self.presence.insert(
            socket_id.to_owned(),
            PresenceInfo {
                session_id: claims.session_id,
                moment_id: claimed_moment_id,
                connected_at: now,
                last_heartbeat_at: now,
                last_durable_heartbeat_at: now,
            },
        );
        if let Some(mut state) = self.conn_state.get_mut(socket_id) {
            state.session_id = Some(claims.session_id);
            state.moment_id = Some(claimed_moment_id);
            state.is_joined = true;
            state.last_heartbeat_at = now;
        }
        let moment_set = self
            .by_moment
            .entry(claimed_moment_id)
            .or_insert_with(|| Arc::new(DashSet::new()))
            .clone();
        moment_set.insert(socket_id.to_owned());
        let count = moment_set.len() as u32;

        if count > moment.peak_presence {
            let _ = self.store.bump_peak_presence(claimed_moment_id, count).await;
        }

        if let Some(channel) = self.conn.get(socket_id) {
            channel.send(ServerFrame::Joined {
                socket_id: socket_id.to_owned(),
                moment_id: claimed_moment_id,
                presence_count: count,
                timestamp: TimestampMillis::now(),
            });
        }

        let recipients = self.recipients_for(&moment_set);
        broadcast_presence_update(
            claimed_moment_id,
            count,
            count.max(moment.peak_presence),
            recipients,
        );
        ::metrics::gauge!(METRICS_ID_PRESENCES_OPEN).increment(1);

        Ok(count)
    }

    /// Leaves the current presence for `socket_id`, if any. Never fails.
    #[instrument(level = "debug", skip(self))]
    pub async fn leave(&self, socket_id: &str) {
        let Some((_, info)) = self.presence.remove(socket_id) else {
            return;
        };
        if let Some(mut state) = self.conn_state.get_mut(socket_id) {
            state.is_joined = false;
        }
        ::metrics::gauge!(METRICS_ID_PRESENCES_OPEN).decrement(1);

        if let Err(err) = self.store.delete_presence_by_socket_id(socket_id).await {
            tracing::warn!(%socket_id, error = %err, "failed to delete presence row on leave");
        }

        let moment_set = self.by_moment.get(&info.moment_id).map(|set| set.clone());
        let count = if let Some(set) = &moment_set {
            set.remove(socket_id);
            set.len() as u32
        } else {
            0
        };

        if let Some(channel) = self.conn.get(socket_id) {
            channel.send(ServerFrame::Left {
                socket_id: socket_id.to_owned(),
                moment_id: info.moment_id,
                presence_count: count,
                timestamp: TimestampMillis::now(),
            });
        }

        if let Some(set) = moment_set {
            let recipients = self.recipients_for(&set);
            let peak = self
                .store
                .find_moment_by_id(info.moment_id)
                .await
                .ok()
                .flatten()
                .map(|m| m.peak_presence)
                .unwrap_or(count);
            broadcast_presence_update(info.moment_id, count, peak.max(count), recipients);
        }
    }

    /// Processes a heartbeat for `socket_id`, rate-limited silently.
    #[instrument(level = "debug", skip(self, token, sessions))]
    pub async fn heartbeat(&self, socket_id: &str, token: &str, sessions: &SessionManager) {
        if let RateDecision::Denied { .. } = self.heartbeat_limiter.check(socket_id) {
            return;
        }
        if sessions.verify(token).await.is_err() {
            return;
        }

        let now = Utc::now();
        let mut due_for_write = false;
        if let Some(mut info) = self.presence.get_mut(socket_id) {
            info.last_heartbeat_at = now;
            if (now - info.last_durable_heartbeat_at) >= chrono::Duration::from_std(DURABLE_HEARTBEAT_MIN_INTERVAL).unwrap() {
                info.last_durable_heartbeat_at = now;
                due_for_write = true;
            }
        }
        if let Some(mut state) = self.conn_state.get_mut(socket_id) {
            state.last_heartbeat_at = now;
            state.message_count += 1;
        }

        if due_for_write && let Err(err) = self.store.update_presence_heartbeat(socket_id, now).await {
            tracing::warn!(%socket_id, error = %err, "failed to write through heartbeat");
        }

        self.send_message(
            socket_id,
            ServerFrame::Pong {
                timestamp: TimestampMillis::now(),
                server_time: TimestampMillis::now(),
            },
        );
    }

    /// Sends a frame to `socket_id`, returning `false` if no channel exists.
    pub fn send_message(&self, socket_id: &str, frame: ServerFrame) -> bool {
        match self.conn.get(socket_id) {
            Some(channel) => channel.send(frame),
            None => false,
        }
    }

    /// Convenience wrapper building and sending an `error` frame.
    pub fn send_error(&self, socket_id: &str, code: ErrorCode, message: impl Into<String>) {
        self.send_message(socket_id, ServerFrame::error(code, message));
    }

    /// The live presence count for a moment, or 0 if unknown.
    pub fn presence_count(&self, moment_id: MomentId) -> u32 {
        self.by_moment
            .get(&moment_id)
            .map(|set| set.len() as u32)
            .unwrap_or(0)
    }

    fn recipients_for(
        &self,
        moment_set: &DashSet<String>,
    ) -> Vec<(String, Arc<dyn ChannelHandle>)> {
        snapshot_moment_sockets(moment_set)
            .into_iter()
            .filter_map(|socket_id| {
                self.conn
                    .get(&socket_id)
                    .map(|handle| (socket_id, handle.clone()))
            })
            .collect()
    }

    /// Leaves every presence currently attached to `session_id`, without
    /// closing the owning channel. Used when a session ends explicitly so a
    /// socket still joined under it loses its presence immediately rather
    /// than waiting for a heartbeat timeout.
    #[instrument(level = "debug", skip(self))]
    pub async fn evict_session(&self, session_id: SessionId) {
        let socket_ids: Vec<String> = self
            .presence
            .iter()
            .filter(|entry| entry.value().session_id == session_id)
            .map(|entry| entry.key().clone())
            .collect();
        for socket_id in socket_ids {
            self.leave(&socket_id).await;
        }
    }

    /// Drops expired, unblocked entries from the control and heartbeat rate
    /// limiters, bounding their memory use.
    pub fn sweep_rate_limiters(&self) -> usize {
        self.control_limiter.sweep() + self.heartbeat_limiter.sweep()
    }

    /// Closes every currently open channel with the given close code and
    /// reason, without ending their sessions. Used on process shutdown; the
    /// stale-session sweeper reaps the sessions left behind on its next tick.
    #[instrument(level = "debug", skip(self))]
    pub async fn close_all(&self, code: u16, reason: &str) {
        let socket_ids: Vec<String> = self.conn.iter().map(|entry| entry.key().clone()).collect();
        for socket_id in &socket_ids {
            if let Some(channel) = self.conn.get(socket_id) {
                channel.close(code, reason.to_owned());
            }
        }
    }

    /// Forcibly closes and unregisters every socket whose last heartbeat is
    /// older than `timeout`. Runs on the heartbeat-timeout sweeper's timer.
    #[instrument(level = "debug", skip(self))]
    pub async fn sweep_timed_out(&self, timeout: Duration) -> usize {
        let cutoff = Utc::now() - chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::seconds(90));
        let stale: Vec<String> = self
            .conn_state
            .iter()
            .filter(|entry| entry.value().last_heartbeat_at < cutoff)
            .map(|entry| entry.key().clone())
            .collect();

        for socket_id in &stale {
            if let Some(channel) = self.conn.get(socket_id) {
                channel.close(1001, "heartbeat timeout".to_owned());
            }
            self.unregister(socket_id).await;
        }
        if !stale.is_empty() {
            ::metrics::counter!(METRICS_ID_SOCKETS_TIMED_OUT).increment(stale.len() as u64);
        }
        stale.len()
    }
}

//! The WebSocket wire protocol exchanged over the Connection Gateway.
//!
//! Every frame on the wire is a UTF-8 JSON object shaped as
//! `{"type": "...", "payload": { ... }}`, decoded here as an adjacently
//! tagged enum so that both directions get exhaustive matching and neither
//! side can construct a frame kind the other doesn't understand.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::{ErrorCode, MomentId};

/// Milliseconds since the Unix epoch.
///
/// A thin newtype rather than a bare `i64` so frame payloads read as
/// self-documenting and a future change of unit only touches one place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TimestampMillis(pub i64);

impl TimestampMillis {
    /// Captures the current wall-clock time.
    pub fn now() -> Self {
        Self(Utc::now().timestamp_millis())
    }
}

/// A frame sent from a client to the Connection Gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Request to join a moment's presence set.
    Join {
        /// The signed session token obtained from `POST /session/begin`.
        session_token: String,
        /// The moment the client believes it is joining.
        moment_id: MomentId,
    },
    /// Request to leave the moment's presence set.
    Leave {
        /// The signed session token identifying the presence to remove.
        session_token: String,
    },
    /// A keep-alive frame; absence for 90s is fatal to a presence.
    Heartbeat {
        /// The signed session token identifying the presence to refresh.
        session_token: String,
        /// The client's timestamp when the heartbeat was sent.
        timestamp: TimestampMillis,
    },
    /// A bare liveness probe, independent of any presence.
    Ping {
        /// The client's timestamp when the ping was sent.
        timestamp: TimestampMillis,
    },
}

/// A frame sent from the Connection Gateway to a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Sent to a socket immediately after a successful join.
    Joined {
        /// The socket's own stable identifier.
        socket_id: String,
        /// The moment that was joined.
        moment_id: MomentId,
        /// The live presence count immediately after this join.
        presence_count: u32,
        /// Server timestamp of the join.
        timestamp: TimestampMillis,
    },
    /// Sent to a socket immediately after it leaves, best-effort.
    Left {
        /// The socket's own stable identifier.
        socket_id: String,
        /// The moment that was left.
        moment_id: MomentId,
        /// The live presence count immediately after this leave.
        presence_count: u32,
        /// Server timestamp of the leave.
        timestamp: TimestampMillis,
    },
    /// Broadcast to every socket in a moment whenever its presence count changes.
    PresenceUpdate {
        /// The moment whose presence changed.
        moment_id: MomentId,
        /// The current live presence count.
        count: u32,
        /// The highest presence count ever observed for this moment.
        peak_count: u32,
        /// Server timestamp of this broadcast.
        timestamp: TimestampMillis,
    },
    /// Reply to a `ping` or a heartbeat, or sent unsolicited right after accept.
    Pong {
        /// Echoes the client's timestamp, if this was a reply.
        timestamp: TimestampMillis,
        /// The server's own current time.
        server_time: TimestampMillis,
    },
    /// A closed-vocabulary error, never leaking internal detail.
    Error {
        /// The error code.
        code: ErrorCode,
        /// A short, human-readable message safe to display.
        message: String,
        /// Server timestamp of the error.
        timestamp: TimestampMillis,
    },
    /// Sent instead of `Error` when a rate limit denies a frame.
    RateLimited {
        /// Seconds the caller should wait before retrying.
        retry_after: u64,
        /// A short, human-readable message safe to display.
        message: String,
        /// Server timestamp.
        timestamp: TimestampMillis,
    },
}

impl ServerFrame {
    /// Builds an [`ServerFrame::Error`] frame with the current time.
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            code,
            message: message.into(),
            timestamp: TimestampMillis::now(),
        }
    }

    /// Builds a [`ServerFrame::RateLimited`] frame with the current time.
    pub fn rate_limited(retry_after_seconds: u64, message: impl Into<String>) -> Self {
        Self::RateLimited {
            retry_after: retry_after_seconds,
            message: message.into(),
            timestamp: TimestampMillis::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_frame_join_round_trips() {
        let moment_id = MomentId::new();
        let frame = ClientFrame::Join {
            session_token: "tok".to_owned(),
            moment_id,
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("\"type\":\"join\""));
        let back: ClientFrame = serde_json::from_str(&json).unwrap();
        match back {
            ClientFrame::Join {
                session_token,
                moment_id: m,
            } => {
                assert_eq!(session_token, "tok");
                assert_eq!(m, moment_id);
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn server_frame_error_uses_closed_code_vocabulary() {
        let frame = ServerFrame::error(ErrorCode::InvalidToken, "bad token");
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["payload"]["code"], "INVALID_TOKEN");
    }

    #[test]
    fn unknown_client_frame_type_fails_to_parse() {
        let raw = r#"{"type":"unknown","payload":{}}"#;
        assert!(serde_json::from_str::<ClientFrame>(raw).is_err());
    }
}

//! The closed set of error codes the presence service ever reports to a client.
//!
//! Both the HTTP control surface and the Connection Gateway map their internal
//! error enums onto this type before putting anything on the wire, so a
//! client only ever has to understand one vocabulary regardless of which
//! surface it talked to.

use serde::{Deserialize, Serialize};

/// A client-visible error code.
///
/// This is intentionally a closed, exhaustive enum: adding a new failure mode
/// anywhere in the service means extending this type, not inventing a new
/// string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// The session token failed signature, claims, or algorithm validation.
    InvalidToken,
    /// The session token was valid but the session it names has ended.
    SessionExpired,
    /// No moment exists with the requested id.
    MomentNotFound,
    /// The requested moment exists but is not currently live.
    MomentNotLive,
    /// The caller has exceeded a rate limit and must back off.
    RateLimited,
    /// The inbound frame could not be parsed or was missing required fields.
    InvalidMessage,
    /// An unexpected internal failure occurred.
    ServerError,
    /// The socket attempted to join while already joined.
    AlreadyJoined,
    /// The socket attempted an operation that requires an active join.
    NotJoined,
}

impl ErrorCode {
    /// Returns the `SCREAMING_SNAKE_CASE` wire representation of this code.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::InvalidToken => "INVALID_TOKEN",
            ErrorCode::SessionExpired => "SESSION_EXPIRED",
            ErrorCode::MomentNotFound => "MOMENT_NOT_FOUND",
            ErrorCode::MomentNotLive => "MOMENT_NOT_LIVE",
            ErrorCode::RateLimited => "RATE_LIMITED",
            ErrorCode::InvalidMessage => "INVALID_MESSAGE",
            ErrorCode::ServerError => "SERVER_ERROR",
            ErrorCode::AlreadyJoined => "ALREADY_JOINED",
            ErrorCode::NotJoined => "NOT_JOINED",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

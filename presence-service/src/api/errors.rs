//! Closed error enums for the HTTP control surface and the Connection
//! Gateway, and their conversions onto the client-visible wire vocabulary.

use axum::Json;
use axum::response::{IntoResponse, Response};
use http::StatusCode;
use presence_types::ErrorCode;
use serde::Serialize;

use crate::services::session_manager::SessionError;
use crate::services::store::StoreError;

/// Errors the HTTP control surface maps onto a status code and JSON body.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The caller must back off before retrying.
    #[error("rate limited")]
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
    /// No moment is currently live.
    #[error("no live moment")]
    NoLiveMoment,
    /// The `Authorization` header was missing or malformed.
    #[error("missing or malformed token")]
    MissingToken,
    /// The session token failed verification.
    #[error("invalid token")]
    InvalidToken,
    /// The session has already ended.
    #[error("session already ended")]
    AlreadyEnded,
    /// An unexpected internal failure occurred.
    #[error("internal error")]
    Internal,
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::RateLimited {
                retry_after_seconds,
            } => ApiError::RateLimited {
                retry_after_seconds,
            },
            SessionError::MomentNotFound | SessionError::SessionNotFound => {
                ApiError::MomentNotFound
            }
            SessionError::MomentNotLive => ApiError::MomentNotLive,
            SessionError::InvalidToken => ApiError::InvalidToken,
            SessionError::AlreadyEnded => ApiError::AlreadyEnded,
            SessionError::Store(_) => ApiError::Internal,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    code: &'static str,
    message: &'static str,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            ApiError::RateLimited {
                retry_after_seconds,
            } => {
                let body = Json(ErrorBody {
                    code: ErrorCode::RateLimited.as_str(),
                    message: "rate limited",
                });
                let mut response = (StatusCode::TOO_MANY_REQUESTS, body).into_response();
                if let Ok(value) = http::HeaderValue::from_str(&retry_after_seconds.to_string()) {
                    response.headers_mut().insert(http::header::RETRY_AFTER, value);
                }
                return response;
            }
            ApiError::MomentNotFound | ApiError::NoLiveMoment => (
                StatusCode::NOT_FOUND,
                ErrorCode::MomentNotFound.as_str(),
                "no live moment",
            ),
            ApiError::MomentNotLive => (
                StatusCode::BAD_REQUEST,
                ErrorCode::MomentNotLive.as_str(),
                "moment is not live",
            ),
            ApiError::MissingToken | ApiError::InvalidToken => (
                StatusCode::UNAUTHORIZED,
                ErrorCode::InvalidToken.as_str(),
                "invalid or missing token",
            ),
            ApiError::AlreadyEnded => (
                StatusCode::BAD_REQUEST,
                "ALREADY_ENDED",
                "session already ended",
            ),
            ApiError::Internal => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorCode::ServerError.as_str(),
                "internal error",
            ),
        };
        (status, Json(ErrorBody { code, message })).into_response()
    }
}

/// Transport and framing errors encountered while reading the gateway's
/// websocket read loop.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// The peer closed the connection, gracefully or not.
    #[error("connection closed")]
    ConnectionClosed,
    /// A frame could not be parsed as a known `ClientFrame`.
    #[error(transparent)]
    Malformed(#[from] serde_json::Error),
    /// A frame type the gateway does not accept over text/binary framing.
    #[error("unexpected message type")]
    UnexpectedMessage,
    /// The underlying transport reported an error.
    #[error(transparent)]
    Transport(#[from] axum::Error),
}

impl GatewayError {
    /// The wire-visible code this error maps onto, if the socket is still
    /// writable. Transport failures have no recipient left to tell.
    pub fn error_code(&self) -> Option<ErrorCode> {
        match self {
            GatewayError::Malformed(_) | GatewayError::UnexpectedMessage => {
                Some(ErrorCode::InvalidMessage)
            }
            GatewayError::ConnectionClosed | GatewayError::Transport(_) => None,
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(_: StoreError) -> Self {
        ApiError::Internal
    }
}

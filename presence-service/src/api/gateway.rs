//! The Connection Gateway: accepts long-lived websocket channels, frames
//! inbound JSON, and dispatches to the Presence Registry.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::any;
use futures_util::{SinkExt, StreamExt};
use http::HeaderMap;
use presence_types::frame::{ClientFrame, ServerFrame, TimestampMillis};
use presence_types::{MomentId, SocketId};
use tokio::sync::mpsc;
use tracing::instrument;

use crate::api::errors::GatewayError;
use crate::services::presence_registry::{ChannelHandle, PresenceRegistry};
use crate::services::rate_limiter::RateDecision;
use crate::services::session_manager::SessionManager;

const SOCKET_ID_TAG: &str = "sock";
const TRANSPORT_PING_INTERVAL: Duration = Duration::from_secs(30);

/// Shared state the gateway's handlers and read loop are built over.
#[derive(Clone)]
pub struct GatewayState {
    /// The authoritative presence registry.
    pub registry: Arc<PresenceRegistry>,
    /// Verifies tokens carried by `join`/`heartbeat` frames.
    pub sessions: Arc<SessionManager>,
    /// Whether all origins are accepted, bypassing `allowed_origins`.
    pub dev_mode: bool,
    /// Origins allowed to open a channel when not in development mode.
    pub allowed_origins: Vec<String>,
}

enum OutboundCommand {
    Frame(ServerFrame),
    Close(u16, String),
}

struct MpscChannelHandle {
    tx: mpsc::UnboundedSender<OutboundCommand>,
}

impl ChannelHandle for MpscChannelHandle {
    fn send(&self, frame: ServerFrame) -> bool {
        self.tx.send(OutboundCommand::Frame(frame)).is_ok()
    }

    fn close(&self, code: u16, reason: String) {
        let _ = self.tx.send(OutboundCommand::Close(code, reason));
    }
}

fn origin_is_allowed(state: &GatewayState, origin: Option<&str>) -> bool {
    if state.dev_mode {
        return true;
    }
    match origin {
        Some(origin) => state.allowed_origins.iter().any(|allowed| allowed == origin),
        None => false,
    }
}

/// Builds a router exposing the websocket upgrade at `/ws`.
pub fn routes(state: GatewayState) -> Router {
    Router::new().route("/ws", any(ws_handler)).with_state(state)
}

#[instrument(level = "debug", skip_all)]
async fn ws_handler(
    State(state): State<GatewayState>,
    ws: WebSocketUpgrade,
    headers: HeaderMap,
) -> impl IntoResponse {
    let origin_str = headers
        .get(http::header::ORIGIN)
        .and_then(|value| value.to_str().ok());
    if !origin_is_allowed(&state, origin_str) {
        tracing::debug!(origin = ?origin_str, "rejecting upgrade: origin not allowed");
        return (http::StatusCode::FORBIDDEN, "origin not allowed").into_response();
    }

    ws.on_failed_upgrade(|err| {
        tracing::warn!("could not establish websocket connection: {err:?}");
    })
    .on_upgrade(move |socket| handle_socket(socket, state))
}

#[instrument(level = "debug", skip_all)]
async fn handle_socket(socket: WebSocket, state: GatewayState) {
    let socket_id = SocketId::generate(SOCKET_ID_TAG).to_string();
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<OutboundCommand>();

    state
        .registry
        .register(socket_id.clone(), Arc::new(MpscChannelHandle { tx: tx.clone() }));

    let writer_socket_id = socket_id.clone();
    let writer = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(TRANSPORT_PING_INTERVAL);
        ping_interval.tick().await;
        loop {
            tokio::select! {
                command = rx.recv() => {
                    match command {
                        Some(OutboundCommand::Frame(frame)) => {
                            let Ok(json) = serde_json::to_string(&frame) else { continue };
                            if sink.send(Message::Text(json.into())).await.is_err() {
                                break;
                            }
                        }
                        Some(OutboundCommand::Close(code, reason)) => {
                            let _ = sink
                                .send(Message::Close(Some(CloseFrame {
                                    code,
                                    reason: reason.into(),
                                })))
                                .await;
                            break;
                        }
                        None => break,
                    }
                }
                _ = ping_interval.tick() => {
                    if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
        tracing::trace!(socket_id = %writer_socket_id, "writer task exiting");
    });

    let _ = tx.send(OutboundCommand::Frame(ServerFrame::Pong {
        timestamp: TimestampMillis::now(),
        server_time: TimestampMillis::now(),
    }));

    while let Some(message) = stream.next().await {
        let message = match message {
            Ok(message) => message,
            Err(err) => {
                let err = GatewayError::Transport(err);
                tracing::trace!(socket_id = %socket_id, error = %err, "transport error, closing");
                break;
            }
        };
        match message {
            Message::Text(text) => dispatch(&state, &socket_id, text.as_str()).await,
            Message::Binary(_) => {
                let err = GatewayError::UnexpectedMessage;
                if let Some(code) = err.error_code() {
                    state
                        .registry
                        .send_error(&socket_id, code, "binary frames are not supported");
                }
            }
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    state.registry.unregister(&socket_id).await;
    drop(tx);
    let _ = writer.await;
}

#[instrument(level = "debug", skip(state, raw))]
async fn dispatch(state: &GatewayState, socket_id: &str, raw: &str) {
    if let RateDecision::Denied {
        retry_after_seconds,
    } = state.registry.check_control_rate_limit(socket_id)
    {
        state.registry.send_message(
            socket_id,
            ServerFrame::rate_limited(retry_after_seconds, "control rate limit exceeded"),
        );
        return;
    }

    let frame: ClientFrame = match serde_json::from_str(raw) {
        Ok(frame) => frame,
        Err(err) => {
            let err = GatewayError::Malformed(err);
            tracing::trace!(socket_id = %socket_id, error = %err, "could not parse frame");
            if let Some(code) = err.error_code() {
                state.registry.send_error(socket_id, code, "could not parse frame");
            }
            return;
        }
    };

    match frame {
        ClientFrame::Join {
            session_token,
            moment_id,
        } => handle_join(state, socket_id, &session_token, moment_id).await,
        ClientFrame::Leave { session_token: _ } => {
            state.registry.leave(socket_id).await;
        }
        ClientFrame::Heartbeat {
            session_token,
            timestamp: _,
        } => {
            state
                .registry
                .heartbeat(socket_id, &session_token, &state.sessions)
                .await;
        }
        ClientFrame::Ping { timestamp } => {
            state.registry.send_message(
                socket_id,
                ServerFrame::Pong {
                    timestamp,
                    server_time: TimestampMillis::now(),
                },
            );
        }
    }
}

async fn handle_join(state: &GatewayState, socket_id: &str, token: &str, moment_id: MomentId) {
    if let Err(err) = state
        .registry
        .join(socket_id, token, moment_id, &state.sessions)
        .await
    {
        state
            .registry
            .send_error(socket_id, err.error_code(), "could not join moment");
    }
}

//! Metrics definitions for the presence service.
//!
//! This module defines all metrics keys used by the service and provides a
//! helper [`describe_metrics`] to set metadata for each metric using the
//! `metrics` crate. Wiring an exporter is left to the hosting application.

/// Metrics key for the number of currently open websocket channels.
pub const METRICS_ID_SOCKETS_OPEN: &str = "presence.service.sockets.open";
/// Metrics key for the number of live presences across all moments.
pub const METRICS_ID_PRESENCES_OPEN: &str = "presence.service.presences.open";
/// Metrics key for sessions created via `session/begin`.
pub const METRICS_ID_SESSIONS_CREATED: &str = "presence.service.sessions.created";
/// Metrics key for sessions ended, whether explicitly or by the sweeper.
pub const METRICS_ID_SESSIONS_ENDED: &str = "presence.service.sessions.ended";
/// Metrics key for sessions reaped by the stale-session sweeper.
pub const METRICS_ID_SESSIONS_REAPED: &str = "presence.service.sessions.reaped";
/// Metrics key for sockets force-closed by the heartbeat-timeout sweeper.
pub const METRICS_ID_SOCKETS_TIMED_OUT: &str = "presence.service.sockets.timed_out";
/// Metrics key for rate-limit denials, labeled by limiter kind at the call site.
pub const METRICS_ID_RATE_LIMIT_DENIALS: &str = "presence.service.rate_limit.denials";
/// Metrics key for the duration of a single moment's broadcast fan-out.
pub const METRICS_ID_BROADCAST_FANOUT_DURATION: &str = "presence.service.broadcast.fanout.duration";

/// Describes all metrics used by the service.
///
/// Calls the `describe_*` functions from the `metrics` crate to set metadata
/// on each metric; does not itself install a recorder.
pub fn describe_metrics() {
    metrics::describe_gauge!(
        METRICS_ID_SOCKETS_OPEN,
        metrics::Unit::Count,
        "Number of websocket channels currently accepted by the gateway"
    );

    metrics::describe_gauge!(
        METRICS_ID_PRESENCES_OPEN,
        metrics::Unit::Count,
        "Number of live presences across all moments"
    );

    metrics::describe_counter!(
        METRICS_ID_SESSIONS_CREATED,
        metrics::Unit::Count,
        "Number of sessions created via session/begin"
    );

    metrics::describe_counter!(
        METRICS_ID_SESSIONS_ENDED,
        metrics::Unit::Count,
        "Number of sessions ended, explicitly or by the sweeper"
    );

    metrics::describe_counter!(
        METRICS_ID_SESSIONS_REAPED,
        metrics::Unit::Count,
        "Number of sessions ended by the stale-session sweeper specifically"
    );

    metrics::describe_counter!(
        METRICS_ID_SOCKETS_TIMED_OUT,
        metrics::Unit::Count,
        "Number of sockets force-closed by the heartbeat-timeout sweeper"
    );

    metrics::describe_counter!(
        METRICS_ID_RATE_LIMIT_DENIALS,
        metrics::Unit::Count,
        "Number of rate limit denials across all limiter kinds"
    );

    metrics::describe_histogram!(
        METRICS_ID_BROADCAST_FANOUT_DURATION,
        metrics::Unit::Milliseconds,
        "Duration of a single moment's presence_update fan-out"
    );
}

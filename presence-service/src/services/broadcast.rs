//! Per-moment ordered fan-out of presence updates.
//!
//! A `presence_update` frame is composed once per broadcast and sent to
//! every socket currently in the moment's set. Sends are best-effort: a
//! failure to reach one recipient is logged and does not block delivery to
//! the rest.

use std::time::Instant;

use dashmap::DashSet;
use presence_types::frame::{ServerFrame, TimestampMillis};
use presence_types::MomentId;

use super::presence_registry::ChannelHandle;
use crate::metrics::METRICS_ID_BROADCAST_FANOUT_DURATION;

/// Composes and fans out a `presence_update` frame to a snapshot of sockets.
///
/// Takes an owned snapshot of socket ids rather than the live set so the
/// registry's map is never held locked across the send loop.
pub fn broadcast_presence_update(
    moment_id: MomentId,
    count: u32,
    peak_count: u32,
    recipients: impl IntoIterator<Item = (String, std::sync::Arc<dyn ChannelHandle>)>,
) {
    let frame = ServerFrame::PresenceUpdate {
        moment_id,
        count,
        peak_count,
        timestamp: TimestampMillis::now(),
    };
    let start = Instant::now();
    for (socket_id, handle) in recipients {
        if !handle.send(frame.clone()) {
            tracing::debug!(%socket_id, %moment_id, "presence_update send failed, recipient likely disconnecting");
        }
    }
    let elapsed = start.elapsed();
    ::metrics::histogram!(METRICS_ID_BROADCAST_FANOUT_DURATION).record(elapsed.as_millis() as f64);
}

/// Reads a moment's current socket set as an owned snapshot, for use as the
/// `recipients` argument to [`broadcast_presence_update`].
pub fn snapshot_moment_sockets(set: &DashSet<String>) -> Vec<String> {
    set.iter().map(|entry| entry.clone()).collect()
}

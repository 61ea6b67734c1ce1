//! Metrics collection using metrics-rs.

use std::sync::atomic::{AtomicBool, Ordering};

use metrics::Unit;

/// Whether metrics have been initialized.
static METRICS_INITIALIZED: AtomicBool = AtomicBool::new(false);

// Metric names as constants for consistency
/// Frames successfully decoded.
pub const FRAMES_DECODED: &str = "argus_frames_decoded";
/// Encoded frames dropped before codec metadata arrived.
pub const FRAMES_DROPPED_NO_METADATA: &str = "argus_frames_dropped_no_metadata";
/// Packets the decoder consumed without producing a picture.
pub const FRAMES_NOT_READY: &str = "argus_frames_not_ready";
/// Frame-local errors that were swallowed and counted.
pub const FRAME_ERRORS: &str = "argus_frame_errors";
/// Items a live source dropped because no demand was pending.
pub const LIVE_ITEMS_DROPPED: &str = "argus_live_items_dropped";
/// Bot messages published to derived channels.
pub const MESSAGES_PUBLISHED: &str = "argus_messages_published";
/// Heartbeats published by the pool controller.
pub const HEARTBEATS_PUBLISHED: &str = "argus_heartbeats_published";

/// Initialize metric descriptions.
///
/// Call once at startup before recording. Safe to call multiple times;
/// subsequent calls are no-ops.
pub fn init_metrics() {
    if METRICS_INITIALIZED.swap(true, Ordering::SeqCst) {
        return; // Already initialized
    }

    metrics::describe_counter!(FRAMES_DECODED, Unit::Count, "Frames successfully decoded");
    metrics::describe_counter!(
        FRAMES_DROPPED_NO_METADATA,
        Unit::Count,
        "Encoded frames dropped because no codec metadata had arrived"
    );
    metrics::describe_counter!(
        FRAMES_NOT_READY,
        Unit::Count,
        "Packets consumed by the decoder without producing a picture"
    );
    metrics::describe_counter!(
        FRAME_ERRORS,
        Unit::Count,
        "Frame-local errors swallowed by the pipeline"
    );
    metrics::describe_counter!(
        LIVE_ITEMS_DROPPED,
        Unit::Count,
        "Items dropped by live sources under backpressure"
    );
    metrics::describe_counter!(
        MESSAGES_PUBLISHED,
        Unit::Count,
        "Bot messages published to derived channels"
    );
    metrics::describe_counter!(
        HEARTBEATS_PUBLISHED,
        Unit::Count,
        "Pool controller heartbeats published"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init_metrics();
        init_metrics();
    }
}

//! Live capture source.
//!
//! Platform capture is an external collaborator behind [`CaptureDevice`];
//! the source pumps it at the device's frame rate on the reactor and
//! feeds a live publisher. Frames the downstream has no demand for are
//! dropped — live capture does not buffer.

use std::time::Duration;

use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::media::{EncodedFrame, EncodedMetadata, EncodedPacket};
use crate::streams::{live, Observer, Publisher};

/// A platform capture device producing encoded packets.
pub trait CaptureDevice {
    /// Codec metadata for the capture stream.
    fn metadata(&mut self) -> Result<EncodedMetadata>;

    /// Capture and encode one frame. Return [`Error::EndOfStream`] when
    /// the device shuts down.
    fn capture(&mut self) -> Result<EncodedFrame>;

    /// Nominal capture rate.
    fn fps(&self) -> f64 {
        30.0
    }
}

/// Capture from `device` as an [`EncodedPacket`] publisher.
///
/// Must run inside the reactor's `LocalSet`: the capture loop is a local
/// task. Emits the device metadata first, then one frame per tick.
pub fn camera_source(device: impl CaptureDevice + 'static) -> Publisher<EncodedPacket> {
    live(move |observer| {
        let mut device = device;
        tokio::task::spawn_local(async move {
            let metadata = match device.metadata() {
                Ok(metadata) => metadata,
                Err(error) => {
                    observer.on_error(Error::StreamInitialization(error.to_string()));
                    return;
                }
            };
            info!(codec = %metadata.codec_name, fps = device.fps(), "capture started");
            observer.on_next(EncodedPacket::Metadata(metadata));

            let period = Duration::from_secs_f64(1.0 / device.fps().max(1.0));
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                if !observer.is_active() {
                    debug!("capture loop ending, downstream detached");
                    break;
                }
                match device.capture() {
                    Ok(frame) => observer.on_next(EncodedPacket::Frame(frame)),
                    Err(Error::EndOfStream) => {
                        info!("capture device closed");
                        observer.on_complete();
                        break;
                    }
                    Err(error) => {
                        observer.on_error(Error::FrameGeneration(error.to_string()));
                        break;
                    }
                }
            }
        });
    })
}

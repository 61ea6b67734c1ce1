//! Encoded-packet sources.
//!
//! All three sources produce a `Publisher<EncodedPacket>` for one logical
//! stream:
//!
//! - [`file_source`]: replay from a container via a [`Demuxer`], with
//!   chained frame ids and optional looping.
//! - [`camera_source`]: live capture via a [`CaptureDevice`]; lossy under
//!   backpressure.
//! - [`bus_source`]: remote stream over the bus — a metadata sub-channel
//!   subscription (history count 1) plus the frames channel.

mod bus;
mod camera;
mod file;

pub use bus::bus_source;
pub use camera::{camera_source, CaptureDevice};
pub use file::{file_source, Demuxer, DemuxedPacket, ReplayDemuxer};

//! Bus subscription source.
//!
//! One logical stream arrives over two bus subscriptions: the metadata
//! sub-channel (history count 1, so codec parameters reach late joiners)
//! and the frames channel (no history). Both feed a single live
//! publisher; messages past demand are dropped like any live source.

use std::rc::Rc;

use serde_json::Value;
use tracing::warn;

use crate::bus::{
    wire, BusClient, SubscriptionCallbacks, SubscriptionHandle, SubscriptionOptions,
    METADATA_CHANNEL_SUFFIX,
};
use crate::error::Error;
use crate::media::EncodedPacket;
use crate::metrics::FRAME_ERRORS;
use crate::streams::{live, LiveObserver, Observer, Publisher};

struct PacketCallbacks {
    observer: LiveObserver<EncodedPacket>,
    metadata_handle: SubscriptionHandle,
}

impl SubscriptionCallbacks for PacketCallbacks {
    fn on_data(&self, sub: SubscriptionHandle, message: Value) {
        let packet = if sub == self.metadata_handle {
            wire::metadata_from_value(&message).map(EncodedPacket::Metadata)
        } else {
            wire::frame_from_value(&message).map(EncodedPacket::Frame)
        };
        match packet {
            Ok(packet) => self.observer.on_next(packet),
            Err(error) => {
                // A malformed message is frame-local: log and keep the
                // stream alive.
                metrics::counter!(FRAME_ERRORS).increment(1);
                warn!(%error, "discarding malformed bus message");
            }
        }
    }

    fn on_error(&self, error: Error) {
        self.observer.on_error(error);
    }
}

/// Subscribe to `channel` on `bus` as an [`EncodedPacket`] publisher.
///
/// Must run inside the reactor's `LocalSet`: the subscriptions are issued
/// from a local task so that downstream demand is registered before any
/// history replay arrives.
pub fn bus_source(bus: Rc<dyn BusClient>, channel: &str) -> Publisher<EncodedPacket> {
    let channel = channel.to_owned();
    live(move |observer| {
        tokio::task::spawn_local(async move {
            let metadata_handle = SubscriptionHandle::next();
            let frames_handle = SubscriptionHandle::next();
            let callbacks = Rc::new(PacketCallbacks {
                observer: observer.clone(),
                metadata_handle,
            });

            let metadata_channel = format!("{channel}{METADATA_CHANNEL_SUFFIX}");
            if let Err(error) = bus.subscribe_channel(
                &metadata_channel,
                metadata_handle,
                callbacks.clone(),
                Some(SubscriptionOptions::with_history_count(1)),
            ) {
                observer.on_error(error);
                return;
            }
            if let Err(error) = bus.subscribe_channel(&channel, frames_handle, callbacks, None) {
                observer.on_error(error);
            }
        });
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::LocalBus;
    use crate::media::{EncodedFrame, EncodedMetadata, FrameId};
    use bytes::Bytes;
    use std::cell::RefCell;

    #[tokio::test(flavor = "current_thread")]
    async fn test_bus_source_decodes_both_channels() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let bus = LocalBus::new();

                // Metadata published before anyone subscribes: history
                // replay must still deliver it.
                let metadata = EncodedMetadata {
                    codec_name: "h264".into(),
                    codec_data: Bytes::from_static(&[9]),
                    image_size: None,
                };
                bus.publish("cam/metadata", &wire::metadata_to_value(&metadata))
                    .unwrap();

                let packets = Rc::new(RefCell::new(Vec::new()));
                let packets2 = packets.clone();
                bus_source(bus.clone(), "cam").process(
                    move |packet| packets2.borrow_mut().push(packet),
                    || {},
                    |error| panic!("unexpected error: {error}"),
                );

                // Let the subscription task run.
                tokio::task::yield_now().await;

                let frame = EncodedFrame {
                    data: Bytes::from_static(b"xyz"),
                    id: FrameId::new(0, 4),
                    timestamp: None,
                };
                bus.publish("cam", &wire::frame_to_value(&frame)).unwrap();

                let packets = packets.borrow();
                assert_eq!(packets.len(), 2);
                assert!(matches!(
                    &packets[0],
                    EncodedPacket::Metadata(m) if m.codec_name == "h264"
                ));
                assert!(matches!(
                    &packets[1],
                    EncodedPacket::Frame(f) if f.id == FrameId::new(0, 4)
                ));
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_malformed_messages_are_skipped() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let bus = LocalBus::new();
                let packets = Rc::new(RefCell::new(Vec::new()));
                let packets2 = packets.clone();
                bus_source(bus.clone(), "cam").process(
                    move |packet| packets2.borrow_mut().push(packet),
                    || {},
                    |error| panic!("unexpected error: {error}"),
                );
                tokio::task::yield_now().await;

                bus.publish("cam", &serde_json::json!({"not": "a frame"}))
                    .unwrap();
                assert!(packets.borrow().is_empty());

                let frame = EncodedFrame {
                    data: Bytes::from_static(b"ok"),
                    id: FrameId::new(0, 0),
                    timestamp: None,
                };
                bus.publish("cam", &wire::frame_to_value(&frame)).unwrap();
                assert_eq!(packets.borrow().len(), 1);
            })
            .await;
    }
}

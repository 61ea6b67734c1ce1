//! Integration tests for the video pipeline assembly: file replay ids,
//! metadata re-injection, decode, and the two bot sinks.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use bytes::Bytes;
use serde_json::{json, Value};

use argus::bot::{
    control_source, start_control_pipeline, start_image_pipeline, BotContext, MessageKind,
};
use argus::bus::{BusClient, LocalBus};
use argus::codec::PassthroughDecoder;
use argus::error::{Error, Result};
use argus::media::{EncodedMetadata, EncodedPacket, FrameId, ImageSize, PixelFormat};
use argus::source::{file_source, DemuxedPacket, Demuxer, ReplayDemuxer};
use argus::streams::repeat_if;

/// The per-packet durations of the reference clip: six video packets
/// whose ids must chain exactly.
const CLIP_DURATIONS: [i64; 6] = [49, 28927, 3943, 5403, 6488, 2773];

struct ClipDemuxer {
    durations: Vec<i64>,
    index: usize,
    codec_name: String,
    image_size: Option<ImageSize>,
    payload: Bytes,
}

impl ClipDemuxer {
    fn reference() -> Self {
        Self {
            durations: CLIP_DURATIONS.to_vec(),
            index: 0,
            codec_name: "h264".into(),
            image_size: None,
            payload: Bytes::from_static(b"nal"),
        }
    }

    fn rawvideo(width: u32, height: u32, frames: usize) -> Self {
        let pixels = vec![7u8; (width * height * 3) as usize];
        Self {
            durations: vec![10; frames],
            index: 0,
            codec_name: "rawvideo".into(),
            image_size: Some(ImageSize { width, height }),
            payload: Bytes::from(pixels),
        }
    }
}

impl Demuxer for ClipDemuxer {
    fn metadata(&mut self) -> Result<EncodedMetadata> {
        Ok(EncodedMetadata {
            codec_name: self.codec_name.clone(),
            codec_data: Bytes::from_static(&[0x42]),
            image_size: self.image_size,
        })
    }

    fn next_packet(&mut self) -> Result<DemuxedPacket> {
        let Some(&duration) = self.durations.get(self.index) else {
            return Err(Error::EndOfStream);
        };
        self.index += 1;
        Ok(DemuxedPacket {
            data: self.payload.clone(),
            duration,
            timestamp: None,
        })
    }
}

#[test]
fn test_file_frame_ids_chain_like_reference_clip() {
    let packets = file_source(ClipDemuxer::reference(), false).collect().unwrap();

    let ids: Vec<FrameId> = packets
        .iter()
        .filter_map(|packet| match packet {
            EncodedPacket::Frame(frame) => Some(frame.id),
            EncodedPacket::Metadata(_) => None,
        })
        .collect();

    assert_eq!(
        ids,
        vec![
            FrameId::new(0, 48),
            FrameId::new(49, 28975),
            FrameId::new(28976, 32918),
            FrameId::new(32919, 38321),
            FrameId::new(38322, 44809),
            FrameId::new(44810, 47582),
        ]
    );
}

#[test]
fn test_metadata_repeats_before_every_frame() {
    let metadata_count = Rc::new(Cell::new(0usize));
    let metadata_count2 = metadata_count.clone();

    (file_source(ClipDemuxer::reference(), false)
        >> repeat_if(0, EncodedPacket::is_metadata))
    .process(
        move |packet| {
            if packet.is_metadata() {
                metadata_count2.set(metadata_count2.get() + 1);
            }
        },
        || {},
        |e| panic!("unexpected error: {e}"),
    );

    // The original observation plus one re-injection before each of the
    // six frames.
    assert_eq!(metadata_count.get(), 7);
}

#[tokio::test(flavor = "current_thread")]
async fn test_image_pipeline_flushes_messages_to_derived_channels() {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let bus = LocalBus::new();
            let ctx = BotContext::new();
            let frames_seen = Rc::new(Cell::new(0u32));

            let frames_seen2 = frames_seen.clone();
            let finished = Rc::new(Cell::new(false));
            let finished2 = finished.clone();
            let _handle = start_image_pipeline(
                file_source(ClipDemuxer::rawvideo(2, 2, 3), false),
                PassthroughDecoder::new(),
                ctx,
                Box::new(move |ctx, frame| {
                    frames_seen2.set(frames_seen2.get() + 1);
                    ctx.message(
                        MessageKind::Analysis,
                        json!({"seq": frames_seen2.get()}),
                        None,
                    );
                    ctx.message(MessageKind::Debug, json!({"w": frame.width}), None);
                }),
                bus.clone(),
                "cam",
                None,
                PixelFormat::Bgr24,
                move || finished2.set(true),
            );

            assert_eq!(frames_seen.get(), 3);
            assert!(finished.get());

            let analysis = bus.published_to("cam/analysis");
            let debug = bus.published_to("cam/debug");
            assert_eq!(analysis.len(), 3);
            assert_eq!(debug.len(), 3);
            assert_eq!(analysis[0]["seq"], 1);
            // Flushed messages carry the frame id they were buffered for.
            assert_eq!(analysis[0]["i"], json!([0, 9]));
            assert_eq!(analysis[1]["i"], json!([10, 19]));

            // Buffered order is preserved: analysis before debug per frame.
            let all = bus.published();
            let first_analysis = all.iter().position(|(c, _)| c == "cam/analysis").unwrap();
            let first_debug = all.iter().position(|(c, _)| c == "cam/debug").unwrap();
            assert!(first_analysis < first_debug);
        })
        .await;
}

#[tokio::test(flavor = "current_thread")]
async fn test_image_pipeline_downscales_to_requested_box() {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let bus = LocalBus::new();
            let sizes = Rc::new(RefCell::new(Vec::new()));

            let sizes2 = sizes.clone();
            let _handle = start_image_pipeline(
                file_source(ClipDemuxer::rawvideo(4, 4, 2), false),
                PassthroughDecoder::new(),
                BotContext::new(),
                Box::new(move |_ctx, frame| {
                    sizes2.borrow_mut().push((frame.width, frame.height));
                }),
                bus,
                "cam",
                Some((2, 2)),
                PixelFormat::Bgr24,
                || {},
            );

            assert_eq!(*sizes.borrow(), vec![(2, 2), (2, 2)]);
        })
        .await;
}

#[tokio::test(flavor = "current_thread")]
async fn test_replay_file_drives_whole_pipeline() {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            // Write a two-frame rawvideo replay file to disk: header line,
            // then length/duration-prefixed packets.
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("replay.bin");
            let mut contents = Vec::new();
            contents.extend_from_slice(
                br#"{"codecName": "rawvideo", "codecData": "", "width": 2, "height": 2}"#,
            );
            contents.push(b'\n');
            let pixels = [9u8; 12];
            for duration in [30i64, 40] {
                contents.extend_from_slice(&(pixels.len() as u32).to_le_bytes());
                contents.extend_from_slice(&duration.to_le_bytes());
                contents.extend_from_slice(&pixels);
            }
            std::fs::write(&path, contents).unwrap();

            let bus = LocalBus::new();
            let ids = Rc::new(RefCell::new(Vec::new()));
            let ids2 = ids.clone();
            let _handle = start_image_pipeline(
                file_source(ReplayDemuxer::open(&path).unwrap(), false),
                PassthroughDecoder::new(),
                BotContext::new(),
                Box::new(move |_ctx, frame| ids2.borrow_mut().push(frame.id)),
                bus,
                "cam",
                None,
                PixelFormat::Bgr24,
                || {},
            );

            assert_eq!(*ids.borrow(), vec![FrameId::new(0, 29), FrameId::new(30, 69)]);
        })
        .await;
}

#[tokio::test(flavor = "current_thread")]
async fn test_control_callback_sees_synthetic_configure() {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let bus = LocalBus::new();
            let commands = Rc::new(RefCell::new(Vec::new()));

            let commands2 = commands.clone();
            let _handle = start_control_pipeline(
                control_source(bus.clone(), "cam"),
                BotContext::new(),
                Box::new(move |_ctx, command| {
                    commands2.borrow_mut().push(command);
                    None
                }),
                bus.clone(),
                "cam",
            );
            tokio::task::yield_now().await;

            // No command is pending, yet the callback ran once with the
            // synthetic configure.
            assert_eq!(
                *commands.borrow(),
                vec![json!({"action": "configure", "body": {}})]
            );
        })
        .await;
}

#[tokio::test(flavor = "current_thread")]
async fn test_control_response_is_republished() {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let bus = LocalBus::new();

            let _handle = start_control_pipeline(
                control_source(bus.clone(), "cam"),
                BotContext::new(),
                Box::new(|_ctx, command: Value| {
                    match command.get("action").and_then(Value::as_str) {
                        Some("ping") => Some(json!({"action": "pong"})),
                        _ => None,
                    }
                }),
                bus.clone(),
                "cam",
            );
            tokio::task::yield_now().await;

            bus.publish("cam/control", &json!({"action": "ping"})).unwrap();

            let control = bus.published_to("cam/control");
            assert_eq!(control.len(), 2);
            assert_eq!(control[1], json!({"action": "pong"}));
        })
        .await;
}

#[tokio::test(flavor = "current_thread")]
async fn test_cancel_tears_pipeline_down_silently() {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let bus = LocalBus::new();
            let terminal = Rc::new(Cell::new(0u32));

            let terminal2 = terminal.clone();
            // A live source that never produces: the pipeline sits
            // quiescent with one unit of pending demand, so cancellation
            // is the only terminal path, and it must run the hook once.
            let source: argus::streams::Publisher<EncodedPacket> = argus::streams::live(|_| {});
            let handle = start_image_pipeline(
                source,
                PassthroughDecoder::new(),
                BotContext::new(),
                Box::new(|_ctx, _frame| {}),
                bus,
                "cam",
                None,
                PixelFormat::Bgr24,
                move || terminal2.set(terminal2.get() + 1),
            );
            assert!(!handle.is_finished());
            handle.cancel();
            handle.cancel();
            assert!(handle.is_finished());
            assert_eq!(terminal.get(), 1);
        })
        .await;
}

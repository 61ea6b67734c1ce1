//! Bot runtime: user-callback lifecycle, message buffering and channel
//! naming.
//!
//! A bot is described by a [`BotDescriptor`] — a pixel format plus two
//! callbacks — and executed by a [`Runtime`] built explicitly in `main`.
//! The image callback never publishes directly: it appends to the
//! pipeline-local buffer through [`BotContext::message`], and the image
//! sink flushes the buffer to the derived channels after the callback
//! returns. This keeps publish I/O off the callback's critical path and
//! preserves message order.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

use serde_json::Value;
use tracing::{error, info};

use crate::bus::{BusClient, WsBusClient, ANALYSIS_CHANNEL_SUFFIX, CONTROL_CHANNEL_SUFFIX, DEBUG_CHANNEL_SUFFIX};
use crate::codec::{PassthroughDecoder, VideoDecoder};
use crate::error::{Error, Result};
use crate::media::{FrameId, ImageFrame, ImageMetadata, PixelFormat};
use crate::source::{bus_source, camera_source, file_source, CaptureDevice, ReplayDemuxer};

pub mod config;
pub mod sink;

pub use config::{Config, InputKind};
pub use sink::{
    control_source, start_control_pipeline, start_image_pipeline, PipelineHandle,
};

/// Kind of a bot output message; selects the derived channel it is
/// published to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageKind {
    /// Analysis output, published to `{channel}/analysis`.
    Analysis,
    /// Debugging output, published to `{channel}/debug`.
    Debug,
    /// Control traffic, published to `{channel}/control`.
    Control,
}

impl MessageKind {
    /// Sub-channel suffix for this kind.
    pub fn channel_suffix(self) -> &'static str {
        match self {
            MessageKind::Analysis => ANALYSIS_CHANNEL_SUFFIX,
            MessageKind::Debug => DEBUG_CHANNEL_SUFFIX,
            MessageKind::Control => CONTROL_CHANNEL_SUFFIX,
        }
    }
}

/// One buffered bot output message.
#[derive(Clone, Debug)]
pub struct BotMessage {
    /// Destination kind.
    pub kind: MessageKind,
    /// User payload.
    pub body: Value,
    /// Frame the message refers to.
    pub id: FrameId,
}

/// User-visible handle carried through both pipelines of a bot.
///
/// Execution is single-threaded on the reactor, so the "thread-local"
/// message buffer is literally pipeline-local state in here.
pub struct BotContext {
    instance_data: RefCell<Option<Box<dyn Any>>>,
    frame_metadata: Cell<ImageMetadata>,
    current_id: Cell<FrameId>,
    pending: RefCell<Vec<BotMessage>>,
}

impl BotContext {
    /// Create a context with no frame seen yet.
    pub fn new() -> Rc<Self> {
        Rc::new(Self {
            instance_data: RefCell::new(None),
            frame_metadata: Cell::new(ImageMetadata::default()),
            current_id: Cell::new(FrameId::default()),
            pending: RefCell::new(Vec::new()),
        })
    }

    /// Metadata of the frame currently being processed.
    pub fn frame_metadata(&self) -> ImageMetadata {
        self.frame_metadata.get()
    }

    /// Buffer a message for publication after the callback returns.
    ///
    /// `id` defaults to the id of the frame being processed.
    pub fn message(&self, kind: MessageKind, body: Value, id: Option<FrameId>) {
        self.pending.borrow_mut().push(BotMessage {
            kind,
            body,
            id: id.unwrap_or_else(|| self.current_id.get()),
        });
    }

    /// Attach opaque per-bot state.
    pub fn set_instance_data(&self, data: Box<dyn Any>) {
        *self.instance_data.borrow_mut() = Some(data);
    }

    /// Run `f` against the instance data, if it exists and has type `T`.
    pub fn with_instance_data<T: 'static, R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        self.instance_data
            .borrow_mut()
            .as_mut()
            .and_then(|data| data.downcast_mut::<T>())
            .map(f)
    }

    pub(crate) fn begin_frame(&self, frame: &ImageFrame) {
        self.frame_metadata.set(ImageMetadata::of(frame));
        self.current_id.set(frame.id);
    }

    pub(crate) fn drain_messages(&self) -> Vec<BotMessage> {
        std::mem::take(&mut self.pending.borrow_mut())
    }
}

/// Per-frame analyzer callback.
pub type ImageCallback = Box<dyn FnMut(&BotContext, &ImageFrame)>;

/// Control-command callback. A non-empty return value is republished on
/// the control channel as the response.
pub type CommandCallback = Box<dyn FnMut(&BotContext, Value) -> Option<Value>>;

/// Everything that defines one bot: the pixel format its analyzer wants
/// and the two user callbacks.
pub struct BotDescriptor {
    /// Pixel format frames are converted to before the image callback.
    pub pixel_format: PixelFormat,
    pub(crate) image: Option<ImageCallback>,
    pub(crate) command: Option<CommandCallback>,
}

impl BotDescriptor {
    /// Describe a bot wanting frames in `pixel_format`.
    pub fn new(pixel_format: PixelFormat) -> Self {
        Self {
            pixel_format,
            image: None,
            command: None,
        }
    }

    /// Set the per-frame analyzer callback.
    pub fn on_image(mut self, f: impl FnMut(&BotContext, &ImageFrame) + 'static) -> Self {
        self.image = Some(Box::new(f));
        self
    }

    /// Set the control-command callback.
    pub fn on_command(
        mut self,
        f: impl FnMut(&BotContext, Value) -> Option<Value> + 'static,
    ) -> Self {
        self.command = Some(Box::new(f));
        self
    }
}

/// Factory producing a decoder per stream.
pub type DecoderFactory = Box<dyn Fn() -> Box<dyn VideoDecoder>>;

/// The bot runtime: owns the reactor, the bus connection and the
/// pipeline pair for one bot.
///
/// Built explicitly in `main` and consumed by [`run`](Runtime::run):
/// there is no process-global registration.
pub struct Runtime {
    descriptor: BotDescriptor,
    config: Config,
    capture: Option<Box<dyn CaptureDevice>>,
    decoder_factory: DecoderFactory,
}

impl Runtime {
    /// Create a runtime for `descriptor` with the given configuration.
    pub fn new(descriptor: BotDescriptor, config: Config) -> Self {
        Self {
            descriptor,
            config,
            capture: None,
            decoder_factory: Box::new(|| Box::new(PassthroughDecoder::new())),
        }
    }

    /// Provide the capture device backing `--input-camera`.
    pub fn with_capture_device(mut self, device: impl CaptureDevice + 'static) -> Self {
        self.capture = Some(Box::new(device));
        self
    }

    /// Replace the default decoder factory. The default decodes only
    /// `rawvideo` streams; real codecs plug in here.
    pub fn with_decoder_factory(
        mut self,
        factory: impl Fn() -> Box<dyn VideoDecoder> + 'static,
    ) -> Self {
        self.decoder_factory = Box::new(factory);
        self
    }

    /// Run the bot until the stream ends or a termination signal arrives.
    ///
    /// Returns the process exit code: 0 for a clean stop.
    pub fn run(mut self) -> Result<i32> {
        self.config.validate()?;
        crate::metrics::init_metrics();

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| Error::Reactor(e.to_string()))?;
        let local = tokio::task::LocalSet::new();
        let exit = runtime.block_on(local.run_until(self.run_on_reactor()))?;
        Ok(exit)
    }

    async fn run_on_reactor(&mut self) -> Result<i32> {
        let config = self.config.clone();

        let bus: Rc<dyn BusClient> = match (&config.endpoint, &config.appkey) {
            (Some(endpoint), Some(appkey)) => WsBusClient::connect(
                endpoint,
                config.port,
                appkey,
                |error| error!(%error, "bus client error"),
            )
            .await?,
            _ => {
                info!("no bus endpoint configured, using in-process loopback");
                crate::bus::LocalBus::new()
            }
        };
        bus.start()?;

        let source = match config.input() {
            InputKind::File(path) => {
                let demuxer = ReplayDemuxer::open(&path)?;
                file_source(demuxer, config.loop_file)
            }
            InputKind::Camera => {
                let device = self.capture.take().ok_or_else(|| {
                    Error::StreamInitialization(
                        "--input-camera requires a capture device".into(),
                    )
                })?;
                camera_source(BoxedCapture(device))
            }
            InputKind::Bus => bus_source(bus.clone(), &config.channel),
        };

        let ctx = BotContext::new();
        let image_callback = self
            .descriptor
            .image
            .take()
            .unwrap_or_else(|| Box::new(|_: &BotContext, _: &ImageFrame| {}));
        let command_callback = self
            .descriptor
            .command
            .take()
            .unwrap_or_else(|| Box::new(|_: &BotContext, _| None));

        let stopped = Rc::new(Cell::new(false));
        let stopped_hook = stopped.clone();
        let image_pipeline = start_image_pipeline(
            source,
            (self.decoder_factory)(),
            ctx.clone(),
            image_callback,
            bus.clone(),
            &config.channel,
            config.image_size(),
            self.descriptor.pixel_format,
            move || stopped_hook.set(true),
        );
        let control_pipeline = start_control_pipeline(
            control_source(bus.clone(), &config.channel),
            ctx,
            command_callback,
            bus.clone(),
            &config.channel,
        );

        let exit = wait_for_shutdown(&stopped).await;
        info!("shutting down");
        image_pipeline.cancel();
        control_pipeline.cancel();
        bus.stop()?;
        Ok(exit)
    }
}

/// Adapter so `Runtime` can hold the device as a trait object.
struct BoxedCapture(Box<dyn CaptureDevice>);

impl CaptureDevice for BoxedCapture {
    fn metadata(&mut self) -> Result<crate::media::EncodedMetadata> {
        self.0.metadata()
    }

    fn capture(&mut self) -> Result<crate::media::EncodedFrame> {
        self.0.capture()
    }

    fn fps(&self) -> f64 {
        self.0.fps()
    }
}

/// Block until SIGINT, SIGTERM or SIGQUIT, or until the image pipeline
/// terminates on its own (file replay finishing, stream error).
async fn wait_for_shutdown(stopped: &Cell<bool>) -> i32 {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = match signal(SignalKind::interrupt()) {
        Ok(signal) => signal,
        Err(e) => {
            error!(%e, "failed to install signal handler");
            return 2;
        }
    };
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(signal) => signal,
        Err(e) => {
            error!(%e, "failed to install signal handler");
            return 2;
        }
    };
    let mut quit = match signal(SignalKind::quit()) {
        Ok(signal) => signal,
        Err(e) => {
            error!(%e, "failed to install signal handler");
            return 2;
        }
    };

    let mut poll = tokio::time::interval(std::time::Duration::from_millis(100));
    loop {
        tokio::select! {
            _ = interrupt.recv() => {
                info!("SIGINT");
                return 0;
            }
            _ = terminate.recv() => {
                info!("SIGTERM");
                return 0;
            }
            _ = quit.recv() => {
                info!("SIGQUIT");
                return 0;
            }
            _ = poll.tick() => {
                if stopped.get() {
                    info!("pipeline finished");
                    return 0;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_kind_suffixes() {
        assert_eq!(MessageKind::Analysis.channel_suffix(), "/analysis");
        assert_eq!(MessageKind::Debug.channel_suffix(), "/debug");
        assert_eq!(MessageKind::Control.channel_suffix(), "/control");
    }

    #[test]
    fn test_context_buffers_messages_in_order() {
        let ctx = BotContext::new();
        ctx.message(MessageKind::Analysis, json!({"n": 1}), None);
        ctx.message(MessageKind::Debug, json!({"n": 2}), Some(FrameId::new(5, 9)));

        let drained = ctx.drain_messages();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].body, json!({"n": 1}));
        assert_eq!(drained[1].id, FrameId::new(5, 9));
        assert!(ctx.drain_messages().is_empty());
    }

    #[test]
    fn test_context_instance_data_roundtrip() {
        let ctx = BotContext::new();
        ctx.set_instance_data(Box::new(41u32));
        let bumped = ctx.with_instance_data::<u32, u32>(|n| {
            *n += 1;
            *n
        });
        assert_eq!(bumped, Some(42));
        assert_eq!(ctx.with_instance_data::<String, usize>(|s| s.len()), None);
    }
}

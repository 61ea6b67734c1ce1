//! Terminal subscribers for the bot's two pipelines, and the assembly
//! functions that wire source → decode → downscale → sink.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use super::{BotContext, CommandCallback, ImageCallback};
use crate::bus::{
    BusClient, SubscriptionCallbacks, SubscriptionHandle, CONTROL_CHANNEL_SUFFIX,
};
use crate::codec::{decode, downscale, VideoDecoder};
use crate::error::Error;
use crate::media::{EncodedPacket, FramePool, ImageFrame, PixelFormat};
use crate::metrics::MESSAGES_PUBLISHED;
use crate::streams::{do_finally, live, Observer, Publisher, Subscriber, Subscription};

/// Cancellation handle for one running pipeline.
///
/// Cancel is idempotent and silent: it tears the chain down from the sink
/// upward without delivering a completion.
#[derive(Clone)]
pub struct PipelineHandle {
    root: Rc<RefCell<Option<Subscription>>>,
    finished: Rc<Cell<bool>>,
}

impl PipelineHandle {
    fn new() -> Self {
        Self {
            root: Rc::new(RefCell::new(None)),
            finished: Rc::new(Cell::new(false)),
        }
    }

    /// Cancel the pipeline. Safe to call repeatedly.
    pub fn cancel(&self) {
        if let Some(subscription) = self.root.borrow_mut().take() {
            subscription.cancel();
        }
        self.finished.set(true);
    }

    /// Whether the pipeline has terminated, by any path.
    pub fn is_finished(&self) -> bool {
        self.finished.get()
    }
}

struct ImageSink {
    ctx: Rc<BotContext>,
    callback: RefCell<ImageCallback>,
    bus: Rc<dyn BusClient>,
    channel: String,
    root: Rc<RefCell<Option<Subscription>>>,
}

impl ImageSink {
    fn flush_messages(&self) {
        for message in self.ctx.drain_messages() {
            let channel = format!("{}{}", self.channel, message.kind.channel_suffix());
            let mut body = message.body;
            if let Value::Object(ref mut map) = body {
                map.insert("i".into(), json!([message.id.i1, message.id.i2]));
            }
            if let Err(e) = self.bus.publish(&channel, &body) {
                warn!(%channel, %e, "failed to publish bot message");
                continue;
            }
            metrics::counter!(MESSAGES_PUBLISHED).increment(1);
        }
    }
}

impl Subscriber<ImageFrame> for ImageSink {
    fn on_subscribe(&self, subscription: Subscription) {
        *self.root.borrow_mut() = Some(subscription.clone());
        subscription.request(1);
    }

    fn on_next(&self, frame: ImageFrame) {
        self.ctx.begin_frame(&frame);
        (&mut *self.callback.borrow_mut())(&self.ctx, &frame);
        self.flush_messages();

        let root = self.root.borrow().clone();
        if let Some(root) = root {
            root.request(1);
        }
    }

    fn on_complete(&self) {
        info!(channel = %self.channel, "image stream complete");
        self.root.borrow_mut().take();
    }

    fn on_error(&self, error: Error) {
        error!(channel = %self.channel, %error, "image stream failed");
        self.root.borrow_mut().take();
    }
}

/// Wire and start the image pipeline for one stream:
///
/// ```text
/// source -> decode -> downscale? -> image sink
/// ```
///
/// `on_terminal` runs exactly once when the pipeline ends for any reason,
/// including cancellation through the returned handle.
#[allow(clippy::too_many_arguments)]
pub fn start_image_pipeline<D: VideoDecoder + 'static>(
    source: Publisher<EncodedPacket>,
    decoder: D,
    ctx: Rc<BotContext>,
    callback: ImageCallback,
    bus: Rc<dyn BusClient>,
    channel: &str,
    target_size: Option<(u32, u32)>,
    pixel_format: PixelFormat,
    on_terminal: impl FnOnce() + 'static,
) -> PipelineHandle {
    let handle = PipelineHandle::new();

    let mut chain = source.pipe(decode(decoder));
    if let Some((width, height)) = target_size {
        chain = chain.pipe(downscale(width, height, pixel_format, FramePool::new()));
    }

    let finished = handle.finished.clone();
    let chain = chain.pipe(do_finally(move || {
        finished.set(true);
        on_terminal();
    }));

    chain.subscribe(Rc::new(ImageSink {
        ctx,
        callback: RefCell::new(callback),
        bus,
        channel: channel.to_owned(),
        root: handle.root.clone(),
    }));
    handle
}

struct ControlSink {
    ctx: Rc<BotContext>,
    callback: RefCell<CommandCallback>,
    bus: Rc<dyn BusClient>,
    control_channel: String,
    root: Rc<RefCell<Option<Subscription>>>,
}

impl ControlSink {
    fn dispatch(&self, command: Value) {
        let response = (&mut *self.callback.borrow_mut())(&self.ctx, command);
        match response {
            Some(response) if !response.is_null() => {
                if let Err(e) = self.bus.publish(&self.control_channel, &response) {
                    warn!(channel = %self.control_channel, %e, "failed to publish control response");
                }
            }
            _ => {}
        }
    }
}

impl Subscriber<Value> for ControlSink {
    fn on_subscribe(&self, subscription: Subscription) {
        *self.root.borrow_mut() = Some(subscription.clone());
        // The callback always sees one configure, even when no command is
        // pending at startup.
        self.dispatch(json!({"action": "configure", "body": {}}));
        subscription.request(1);
    }

    fn on_next(&self, command: Value) {
        debug!(channel = %self.control_channel, "control command");
        self.dispatch(command);
        let root = self.root.borrow().clone();
        if let Some(root) = root {
            root.request(1);
        }
    }

    fn on_complete(&self) {
        self.root.borrow_mut().take();
    }

    fn on_error(&self, error: Error) {
        error!(channel = %self.control_channel, %error, "control stream failed");
        self.root.borrow_mut().take();
    }
}

struct ControlCallbacks {
    observer: crate::streams::LiveObserver<Value>,
}

impl SubscriptionCallbacks for ControlCallbacks {
    fn on_data(&self, _sub: SubscriptionHandle, message: Value) {
        self.observer.on_next(message);
    }

    fn on_error(&self, error: Error) {
        self.observer.on_error(error);
    }
}

/// Commands arriving on `{channel}/control`, as a live publisher.
///
/// Must run inside the reactor's `LocalSet`.
pub fn control_source(bus: Rc<dyn BusClient>, channel: &str) -> Publisher<Value> {
    let control_channel = format!("{channel}{CONTROL_CHANNEL_SUFFIX}");
    live(move |observer| {
        tokio::task::spawn_local(async move {
            let handle = SubscriptionHandle::next();
            let callbacks = Rc::new(ControlCallbacks {
                observer: observer.clone(),
            });
            if let Err(error) = bus.subscribe_channel(&control_channel, handle, callbacks, None) {
                observer.on_error(error);
            }
        });
    })
}

/// Wire and start the control pipeline: bus commands through the user
/// control callback, responses republished on the control channel.
pub fn start_control_pipeline(
    source: Publisher<Value>,
    ctx: Rc<BotContext>,
    callback: CommandCallback,
    bus: Rc<dyn BusClient>,
    channel: &str,
) -> PipelineHandle {
    let handle = PipelineHandle::new();
    let finished = handle.finished.clone();
    let chain = source.pipe(do_finally(move || finished.set(true)));

    chain.subscribe(Rc::new(ControlSink {
        ctx,
        callback: RefCell::new(callback),
        bus,
        control_channel: format!("{channel}{CONTROL_CHANNEL_SUFFIX}"),
        root: handle.root.clone(),
    }));
    handle
}

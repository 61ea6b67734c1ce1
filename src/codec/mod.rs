//! Codec seam and decode operator.
//!
//! The codec itself is an external collaborator behind [`VideoDecoder`];
//! this module contributes the stateful [`decode`] operator that drives
//! it from an [`EncodedPacket`] stream, and the [`downscale`]
//! transform (see [`scale`]).

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::media::{EncodedFrame, EncodedMetadata, EncodedPacket, ImageFrame};
use crate::metrics::{FRAMES_DECODED, FRAMES_DROPPED_NO_METADATA, FRAMES_NOT_READY};
use crate::streams::{Demand, Operator, Publisher, PublisherCore, Subscriber, Subscription};

pub mod scale;

pub use scale::downscale;

/// A video decoder for one stream.
///
/// Implementations wrap a codec library. The decode operator owns the
/// lifecycle: [`configure`](VideoDecoder::configure) is called on every
/// metadata packet (codec parameters can change mid-stream), then
/// [`decode`](VideoDecoder::decode) once per encoded frame.
pub trait VideoDecoder {
    /// (Re)initialize the codec from stream metadata.
    fn configure(&mut self, metadata: &EncodedMetadata) -> Result<()>;

    /// Decode one frame.
    ///
    /// Return [`Error::FrameNotReady`] when the packet was consumed but no
    /// picture is available yet (reference frames, codec delay); the
    /// operator swallows it and pulls the next packet.
    fn decode(&mut self, frame: &EncodedFrame) -> Result<ImageFrame>;
}

impl VideoDecoder for Box<dyn VideoDecoder> {
    fn configure(&mut self, metadata: &EncodedMetadata) -> Result<()> {
        (**self).configure(metadata)
    }

    fn decode(&mut self, frame: &EncodedFrame) -> Result<ImageFrame> {
        (**self).decode(frame)
    }
}

/// Decoder for `rawvideo` streams: frame payloads are already packed
/// pixels, so decoding is a copy into a pooled buffer.
///
/// This is the default decoder of the runtime; real codecs plug in
/// through [`VideoDecoder`].
pub struct PassthroughDecoder {
    format: crate::media::PixelFormat,
    size: Option<crate::media::ImageSize>,
    pool: crate::media::FramePool,
}

impl Default for PassthroughDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl PassthroughDecoder {
    /// A passthrough decoder producing BGR frames.
    pub fn new() -> Self {
        Self {
            format: crate::media::PixelFormat::Bgr24,
            size: None,
            pool: crate::media::FramePool::new(),
        }
    }

    /// Interpret payloads as `format` instead of BGR.
    pub fn with_format(mut self, format: crate::media::PixelFormat) -> Self {
        self.format = format;
        self
    }
}

impl VideoDecoder for PassthroughDecoder {
    fn configure(&mut self, metadata: &EncodedMetadata) -> Result<()> {
        if metadata.codec_name != "rawvideo" {
            return Err(Error::StreamInitialization(format!(
                "passthrough decoder cannot decode {:?}",
                metadata.codec_name
            )));
        }
        let size = metadata.image_size.ok_or_else(|| {
            Error::StreamInitialization("rawvideo stream without dimensions".into())
        })?;
        self.size = Some(size);
        Ok(())
    }

    fn decode(&mut self, frame: &EncodedFrame) -> Result<ImageFrame> {
        let size = self
            .size
            .ok_or_else(|| Error::FrameGeneration("decoder not configured".into()))?;
        let bpp = self
            .format
            .bytes_per_pixel()
            .ok_or_else(|| Error::FrameGeneration("planar rawvideo unsupported".into()))?;
        let stride = size.width as usize * bpp;
        let expected = stride * size.height as usize;
        if frame.data.len() != expected {
            return Err(Error::FrameGeneration(format!(
                "payload is {} bytes, {}x{} {:?} needs {}",
                frame.data.len(),
                size.width,
                size.height,
                self.format,
                expected
            )));
        }

        Ok(ImageFrame::packed(
            frame.id,
            size.width,
            size.height,
            self.format,
            Rc::new(self.pool.acquire_from(&frame.data)),
            stride as u32,
        ))
    }
}

/// Decode an [`EncodedPacket`] stream into [`ImageFrame`]s.
///
/// Stateful: metadata packets (re)configure the decoder and produce no
/// output; frame packets produce zero or one image each. Frames that
/// arrive before any metadata are silently dropped (and counted) — the
/// decoder cannot interpret them. A failed configure terminates the
/// stream with [`Error::StreamInitialization`]; a failed decode with
/// [`Error::FrameGeneration`].
pub fn decode<D: VideoDecoder + 'static>(decoder: D) -> Decode<D> {
    Decode { decoder }
}

/// See [`decode`].
pub struct Decode<D> {
    decoder: D,
}

impl<D: VideoDecoder + 'static> Operator<EncodedPacket> for Decode<D> {
    type Out = ImageFrame;

    fn apply(self, source: Publisher<EncodedPacket>) -> Publisher<ImageFrame> {
        struct Core<D> {
            source: Publisher<EncodedPacket>,
            decoder: D,
        }

        impl<D: VideoDecoder + 'static> PublisherCore<ImageFrame> for Core<D> {
            fn attach(self: Box<Self>, sink: Rc<dyn Subscriber<ImageFrame>>) {
                let me = *self;
                let inst = Rc::new_cyclic(|this| DecodeInst {
                    decoder: RefCell::new(me.decoder),
                    configured: Cell::new(false),
                    frames_out: Cell::new(0),
                    sink: RefCell::new(Some(sink)),
                    upstream: RefCell::new(None),
                    this: this.clone(),
                });
                me.source.subscribe(inst);
            }
        }

        Publisher::from_core(Core {
            source,
            decoder: self.decoder,
        })
    }
}

struct DecodeInst<D> {
    decoder: RefCell<D>,
    configured: Cell<bool>,
    frames_out: Cell<u64>,
    sink: RefCell<Option<Rc<dyn Subscriber<ImageFrame>>>>,
    upstream: RefCell<Option<Subscription>>,
    this: Weak<DecodeInst<D>>,
}

impl<D: VideoDecoder + 'static> DecodeInst<D> {
    /// The consumed packet produced no image; pull a replacement so the
    /// downstream demand is still eventually satisfied.
    fn top_up(&self) {
        let upstream = self.upstream.borrow().clone();
        if let Some(upstream) = upstream {
            upstream.request(1);
        }
    }

    fn fail(&self, error: Error) {
        if let Some(upstream) = self.upstream.borrow_mut().take() {
            upstream.cancel();
        }
        if let Some(sink) = self.sink.borrow_mut().take() {
            sink.on_error(error);
        }
    }
}

impl<D: VideoDecoder + 'static> Subscriber<EncodedPacket> for DecodeInst<D> {
    fn on_subscribe(&self, subscription: Subscription) {
        *self.upstream.borrow_mut() = Some(subscription);
        let sink = self.sink.borrow().clone();
        if let Some(sink) = sink {
            let this = self.this.upgrade().expect("operator instance alive");
            sink.on_subscribe(Subscription::new(this));
        }
    }

    fn on_next(&self, packet: EncodedPacket) {
        match packet {
            EncodedPacket::Metadata(metadata) => {
                match self.decoder.borrow_mut().configure(&metadata) {
                    Ok(()) => {
                        debug!(codec = %metadata.codec_name, "decoder configured");
                        self.configured.set(true);
                        self.top_up();
                    }
                    Err(error) => {
                        self.fail(Error::StreamInitialization(error.to_string()));
                    }
                }
            }
            EncodedPacket::Frame(frame) => {
                if !self.configured.get() {
                    // Nothing to decode it with yet.
                    metrics::counter!(FRAMES_DROPPED_NO_METADATA).increment(1);
                    debug!(id = %frame.id, "frame before metadata, dropped");
                    self.top_up();
                    return;
                }
                let decoded = self.decoder.borrow_mut().decode(&frame);
                match decoded {
                    Ok(mut image) => {
                        image.id = frame.id;
                        self.frames_out.set(self.frames_out.get() + 1);
                        metrics::counter!(FRAMES_DECODED).increment(1);
                        let sink = self.sink.borrow().clone();
                        if let Some(sink) = sink {
                            sink.on_next(image);
                        }
                    }
                    Err(Error::FrameNotReady) => {
                        metrics::counter!(FRAMES_NOT_READY).increment(1);
                        self.top_up();
                    }
                    Err(error) => {
                        warn!(id = %frame.id, %error, "decode failed");
                        self.fail(Error::FrameGeneration(error.to_string()));
                    }
                }
            }
        }
    }

    fn on_complete(&self) {
        debug!(frames = self.frames_out.get(), "encoded stream complete");
        self.upstream.borrow_mut().take();
        if let Some(sink) = self.sink.borrow_mut().take() {
            sink.on_complete();
        }
    }

    fn on_error(&self, error: Error) {
        self.upstream.borrow_mut().take();
        if let Some(sink) = self.sink.borrow_mut().take() {
            sink.on_error(error);
        }
    }
}

impl<D: VideoDecoder + 'static> Demand for DecodeInst<D> {
    fn request(&self, n: u64) {
        let upstream = self.upstream.borrow().clone();
        if let Some(upstream) = upstream {
            upstream.request(n);
        }
    }

    fn cancel(&self) {
        let upstream = self.upstream.borrow_mut().take();
        self.sink.borrow_mut().take();
        if let Some(upstream) = upstream {
            upstream.cancel();
        }
    }
}

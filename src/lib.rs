//! # Argus
//!
//! A distributed video-bot runtime. Argus ingests encoded video published
//! on a message-bus channel, decodes frames on the fly, hands them to a
//! user-supplied image analyzer and republishes structured analysis output
//! on derived channels.
//!
//! ## Architecture
//!
//! - **Streams kernel** ([`streams`]): pull-based reactive publishers and
//!   subscribers with composable operators and downstream-controlled
//!   backpressure (`request(n)` demand).
//! - **Codec operators** ([`codec`]): a stateful decode operator over a
//!   pluggable [`codec::VideoDecoder`], plus downscale/convert into pooled
//!   frame buffers.
//! - **Sources** ([`source`]): file replay, live capture and bus
//!   subscription sources producing [`media::EncodedPacket`] streams.
//! - **Bot runtime** ([`bot`]): callback lifecycle, message buffering and
//!   channel naming; an explicit [`bot::Runtime`] built in `main`.
//! - **Pool controller** ([`pool`]): starts and retires pipelines from bus
//!   directives, bounded by a configured capacity, heartbeating liveness.
//!
//! ## Execution model
//!
//! Everything runs on a single-threaded cooperative reactor (a tokio
//! current-thread runtime driving a `LocalSet`). Pipeline state is
//! `Rc`/`Cell` based and deliberately `!Send`; the compiler enforces the
//! one-reactor-thread rule.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use argus::prelude::*;
//!
//! let descriptor = BotDescriptor::new(PixelFormat::Bgr24)
//!     .on_image(|ctx, frame| {
//!         ctx.message(MessageKind::Analysis, serde_json::json!({"w": frame.width}), None);
//!     })
//!     .on_command(|_ctx, cmd| {
//!         tracing::info!(?cmd, "command");
//!         None
//!     });
//!
//! let config = Config::try_parse()?;
//! std::process::exit(Runtime::new(descriptor, config).run()?);
//! ```

pub mod bot;
pub mod bus;
pub mod codec;
pub mod error;
pub mod media;
pub mod metrics;
pub mod pool;
pub mod source;
pub mod streams;

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::bot::{BotContext, BotDescriptor, Config, MessageKind, Runtime};
    pub use crate::bus::{BusClient, SubscriptionHandle, SubscriptionOptions};
    pub use crate::codec::VideoDecoder;
    pub use crate::error::{Error, Result};
    pub use crate::media::{EncodedPacket, FrameId, ImageFrame, PixelFormat};
    pub use crate::streams::{Publisher, Subscriber, Subscription};
}

pub use error::{Error, Result};

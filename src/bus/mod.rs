//! Message-bus client contract and implementations.
//!
//! The core only ever talks to the bus through [`BusClient`]; the
//! WebSocket implementation lives in [`ws`], and [`LocalBus`] provides an
//! in-process loopback used by tests and local demos.
//!
//! # Channel naming
//!
//! A logical stream fans out over sub-channels derived from its base
//! channel name (bit-stable):
//!
//! | purpose  | channel                |
//! |----------|------------------------|
//! | frames   | `{channel}`            |
//! | metadata | `{channel}/metadata`   |
//! | control  | `{channel}/control`    |
//! | analysis | `{channel}/analysis`   |
//! | debug    | `{channel}/debug`      |
//!
//! The metadata sub-channel is subscribed with history count 1 so a late
//! subscriber still receives codec parameters.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use serde_json::Value;

use crate::error::{Error, Result};

pub mod wire;
pub mod ws;

pub use ws::WsBusClient;

/// Sub-channel for frame payloads (the base channel itself).
pub const FRAMES_CHANNEL_SUFFIX: &str = "";
/// Sub-channel for codec metadata. Infrequent data should be expected.
pub const METADATA_CHANNEL_SUFFIX: &str = "/metadata";
/// Sub-channel for bot control commands.
pub const CONTROL_CHANNEL_SUFFIX: &str = "/control";
/// Sub-channel for bot analysis output. Format is defined by the user.
pub const ANALYSIS_CHANNEL_SUFFIX: &str = "/analysis";
/// Sub-channel for bot debugging output. Format is defined by the user.
pub const DEBUG_CHANNEL_SUFFIX: &str = "/debug";

/// Identity of one subscription, chosen by the subscriber.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(pub u64);

impl SubscriptionHandle {
    /// Allocate a handle unique within this reactor thread.
    pub fn next() -> Self {
        thread_local! {
            static NEXT: std::cell::Cell<u64> = const { std::cell::Cell::new(1) };
        }
        NEXT.with(|next| {
            let handle = next.get();
            next.set(handle + 1);
            Self(handle)
        })
    }
}

/// History replay options for a subscription.
#[derive(Clone, Copy, Debug, Default)]
pub struct History {
    /// Maximum age, in seconds, of replayed messages.
    pub age: Option<u64>,
    /// Number of retained messages to replay on subscribe.
    pub count: Option<u64>,
}

/// Options for [`BusClient::subscribe_channel`].
#[derive(Clone, Copy, Debug, Default)]
pub struct SubscriptionOptions {
    /// History replay behavior.
    pub history: History,
}

impl SubscriptionOptions {
    /// Replay the last `count` retained messages on subscribe.
    pub fn with_history_count(count: u64) -> Self {
        Self {
            history: History {
                age: None,
                count: Some(count),
            },
        }
    }
}

/// Per-subscription callbacks.
pub trait SubscriptionCallbacks {
    /// A message arrived on the subscribed channel.
    fn on_data(&self, sub: SubscriptionHandle, message: Value);
    /// The subscription failed.
    fn on_error(&self, error: Error);
}

/// The pub/sub transport used by pipelines and the pool controller.
///
/// Implementations are driven from the single reactor thread; no method
/// blocks.
pub trait BusClient {
    /// Subscribe to `channel`, delivering messages to `callbacks` tagged
    /// with `handle`.
    fn subscribe_channel(
        &self,
        channel: &str,
        handle: SubscriptionHandle,
        callbacks: Rc<dyn SubscriptionCallbacks>,
        options: Option<SubscriptionOptions>,
    ) -> Result<()>;

    /// Drop the subscription identified by `handle`.
    fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<()>;

    /// Publish `body` to `channel`.
    fn publish(&self, channel: &str, body: &Value) -> Result<()>;

    /// Start the client. Idempotent.
    fn start(&self) -> Result<()>;

    /// Stop the client. Idempotent.
    fn stop(&self) -> Result<()>;
}

/// How many retained messages a [`LocalBus`] channel keeps for history
/// replay.
const LOCAL_RETAINED: usize = 16;

struct LocalSubscription {
    handle: SubscriptionHandle,
    channel: String,
    callbacks: Rc<dyn SubscriptionCallbacks>,
}

/// In-process loopback bus.
///
/// Publishes dispatch synchronously to subscribers on the same reactor
/// thread. Each channel retains its last few messages so history replay
/// behaves like the remote bus. Tests use [`published`](LocalBus::published)
/// to observe traffic.
#[derive(Default)]
pub struct LocalBus {
    subscriptions: RefCell<Vec<LocalSubscription>>,
    retained: RefCell<HashMap<String, VecDeque<Value>>>,
    published: RefCell<Vec<(String, Value)>>,
}

impl LocalBus {
    /// Create an empty loopback bus.
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    /// Every message published so far, in order, as `(channel, body)`.
    pub fn published(&self) -> Vec<(String, Value)> {
        self.published.borrow().clone()
    }

    /// Messages published to one channel, in order.
    pub fn published_to(&self, channel: &str) -> Vec<Value> {
        self.published
            .borrow()
            .iter()
            .filter(|(c, _)| c == channel)
            .map(|(_, v)| v.clone())
            .collect()
    }
}

impl BusClient for LocalBus {
    fn subscribe_channel(
        &self,
        channel: &str,
        handle: SubscriptionHandle,
        callbacks: Rc<dyn SubscriptionCallbacks>,
        options: Option<SubscriptionOptions>,
    ) -> Result<()> {
        self.subscriptions.borrow_mut().push(LocalSubscription {
            handle,
            channel: channel.to_owned(),
            callbacks: callbacks.clone(),
        });

        if let Some(count) = options.and_then(|o| o.history.count) {
            let retained = self.retained.borrow();
            if let Some(messages) = retained.get(channel) {
                let replay: Vec<Value> = messages
                    .iter()
                    .rev()
                    .take(count as usize)
                    .rev()
                    .cloned()
                    .collect();
                drop(retained);
                for message in replay {
                    callbacks.on_data(handle, message);
                }
            }
        }
        Ok(())
    }

    fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<()> {
        let mut subscriptions = self.subscriptions.borrow_mut();
        let before = subscriptions.len();
        subscriptions.retain(|sub| sub.handle != handle);
        if subscriptions.len() == before {
            return Err(Error::Unsubscribe(format!(
                "no subscription with handle {}",
                handle.0
            )));
        }
        Ok(())
    }

    fn publish(&self, channel: &str, body: &Value) -> Result<()> {
        self.published
            .borrow_mut()
            .push((channel.to_owned(), body.clone()));

        {
            let mut retained = self.retained.borrow_mut();
            let messages = retained.entry(channel.to_owned()).or_default();
            messages.push_back(body.clone());
            while messages.len() > LOCAL_RETAINED {
                messages.pop_front();
            }
        }

        let targets: Vec<(SubscriptionHandle, Rc<dyn SubscriptionCallbacks>)> = self
            .subscriptions
            .borrow()
            .iter()
            .filter(|sub| sub.channel == channel)
            .map(|sub| (sub.handle, sub.callbacks.clone()))
            .collect();
        for (handle, callbacks) in targets {
            callbacks.on_data(handle, body.clone());
        }
        Ok(())
    }

    fn start(&self) -> Result<()> {
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        Ok(())
    }
}

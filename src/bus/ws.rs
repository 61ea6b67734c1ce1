//! WebSocket bus client.
//!
//! Speaks a JSON PDU protocol over a single WebSocket connection:
//! `pubsub/subscribe`, `pubsub/unsubscribe` and `pubsub/publish` requests,
//! `pubsub/subscription/data` deliveries, and `ok`/`error` acknowledgements
//! matched back to requests by id.
//!
//! The client is wired for the single-threaded reactor: a reader task and
//! a writer task run on the current `LocalSet`, and all callbacks fire on
//! that thread.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};
use url::Url;

use super::{BusClient, SubscriptionCallbacks, SubscriptionHandle, SubscriptionOptions};
use crate::error::{Error, Result};

/// Upper bound on one inbound PDU.
const READ_BUFFER_SIZE: usize = 100_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ClientState {
    Running = 1,
    Stopped = 2,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SubscriptionStatus {
    PendingSubscribe = 1,
    Current = 2,
    PendingUnsubscribe = 3,
}

struct SubscriptionEntry {
    handle: SubscriptionHandle,
    callbacks: Rc<dyn SubscriptionCallbacks>,
    status: SubscriptionStatus,
    pending_request_id: Option<u64>,
}

struct Shared {
    state: Cell<ClientState>,
    request_id: Cell<u64>,
    /// Keyed by subscription id (= channel name).
    subscriptions: RefCell<HashMap<String, SubscriptionEntry>>,
    outbound: mpsc::UnboundedSender<Message>,
    on_error: Box<dyn Fn(Error)>,
}

impl Shared {
    fn next_request_id(&self) -> u64 {
        let id = self.request_id.get() + 1;
        self.request_id.set(id);
        id
    }

    fn send(&self, pdu: Value) -> Result<()> {
        if self.state.get() != ClientState::Running {
            return Err(Error::NotConnected);
        }
        self.outbound
            .send(Message::Text(pdu.to_string()))
            .map_err(|_| Error::NotConnected)
    }

    fn process_input(&self, pdu: Value) {
        let Some(action) = pdu.get("action").and_then(Value::as_str) else {
            warn!(%pdu, "no action in pdu");
            return;
        };

        match action {
            "pubsub/subscription/data" => self.on_subscription_data(&pdu),
            "pubsub/subscribe/ok" => {
                self.on_request_ack(&pdu, true, SubscriptionStatus::PendingSubscribe)
            }
            "pubsub/subscribe/error" => {
                self.on_request_ack(&pdu, false, SubscriptionStatus::PendingSubscribe)
            }
            "pubsub/unsubscribe/ok" => {
                self.on_request_ack(&pdu, true, SubscriptionStatus::PendingUnsubscribe)
            }
            "pubsub/unsubscribe/error" => {
                self.on_request_ack(&pdu, false, SubscriptionStatus::PendingUnsubscribe)
            }
            "pubsub/subscription/error" => {
                error!(%pdu, "subscription error");
                (self.on_error)(Error::Subscription(pdu.to_string()));
            }
            other => {
                warn!(action = other, %pdu, "unhandled action");
            }
        }
    }

    fn on_subscription_data(&self, pdu: &Value) {
        let body = &pdu["body"];
        let Some(subscription_id) = body.get("subscription_id").and_then(Value::as_str) else {
            (self.on_error)(Error::InvalidResponse("data without subscription_id".into()));
            return;
        };

        let target = {
            let subscriptions = self.subscriptions.borrow();
            match subscriptions.get(subscription_id) {
                Some(entry) if entry.status == SubscriptionStatus::PendingUnsubscribe => {
                    debug!(subscription_id, "data for subscription pending deletion");
                    return;
                }
                Some(entry) => Some((entry.handle, entry.callbacks.clone())),
                None => None,
            }
        };
        let Some((handle, callbacks)) = target else {
            (self.on_error)(Error::InvalidResponse(format!(
                "data for unknown subscription {subscription_id}"
            )));
            return;
        };

        if let Some(messages) = body.get("messages").and_then(Value::as_array) {
            for message in messages {
                callbacks.on_data(handle, message.clone());
            }
        }
    }

    fn on_request_ack(&self, pdu: &Value, ok: bool, expected: SubscriptionStatus) {
        let Some(id) = pdu.get("id").and_then(Value::as_u64) else {
            (self.on_error)(Error::InvalidResponse("acknowledgement without id".into()));
            return;
        };

        let mut subscriptions = self.subscriptions.borrow_mut();
        let channel = subscriptions
            .iter()
            .find(|(_, entry)| entry.pending_request_id == Some(id))
            .map(|(channel, _)| channel.clone());
        let Some(channel) = channel else {
            warn!(id, %pdu, "unexpected acknowledgement");
            (self.on_error)(Error::InvalidResponse(format!(
                "acknowledgement for unknown request {id}"
            )));
            return;
        };

        let entry = subscriptions
            .get_mut(&channel)
            .expect("entry found by scan above");
        if entry.status != expected {
            warn!(%channel, status = ?entry.status, "acknowledgement in wrong state");
        }

        match (expected, ok) {
            (SubscriptionStatus::PendingSubscribe, true) => {
                info!(%channel, "subscribe confirmed");
                entry.pending_request_id = None;
                entry.status = SubscriptionStatus::Current;
            }
            (SubscriptionStatus::PendingSubscribe, false) => {
                error!(%channel, %pdu, "subscribe rejected");
                let callbacks = entry.callbacks.clone();
                subscriptions.remove(&channel);
                drop(subscriptions);
                callbacks.on_error(Error::Subscribe(channel));
            }
            (SubscriptionStatus::PendingUnsubscribe, true) => {
                info!(%channel, "unsubscribe confirmed");
                subscriptions.remove(&channel);
            }
            (SubscriptionStatus::PendingUnsubscribe, false) => {
                error!(%channel, %pdu, "unsubscribe rejected");
                let callbacks = entry.callbacks.clone();
                subscriptions.remove(&channel);
                drop(subscriptions);
                callbacks.on_error(Error::Unsubscribe(channel));
            }
            (SubscriptionStatus::Current, _) => {
                warn!(%channel, status = ?expected, ok, "unexpected acknowledgement state");
            }
        }
    }
}

/// WebSocket implementation of [`BusClient`].
///
/// Create with [`connect`](WsBusClient::connect) from inside the reactor's
/// `LocalSet`; the connection handshake happens there, and subsequent
/// calls are non-blocking.
pub struct WsBusClient {
    shared: Rc<Shared>,
}

impl WsBusClient {
    /// Connect to `wss://{endpoint}:{port}/v2?appkey={appkey}`.
    ///
    /// `on_error` receives client-level failures: protocol violations and
    /// subscription errors that have no owning subscription.
    pub async fn connect(
        endpoint: &str,
        port: u16,
        appkey: &str,
        on_error: impl Fn(Error) + 'static,
    ) -> Result<Rc<Self>> {
        let raw = format!("wss://{endpoint}:{port}/v2?appkey={appkey}");
        let url = Url::parse(&raw)
            .map_err(|e| Error::StreamInitialization(format!("bad bus endpoint: {e}")))?;
        info!(%url, "connecting bus client");

        let mut config = WebSocketConfig::default();
        config.max_message_size = Some(READ_BUFFER_SIZE);
        let (stream, _response) =
            tokio_tungstenite::connect_async_with_config(raw, Some(config), false)
                .await
                .map_err(|e| Error::Reactor(format!("websocket connect: {e}")))?;
        info!("websocket open");

        let (mut write, mut read) = stream.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();

        let shared = Rc::new(Shared {
            state: Cell::new(ClientState::Running),
            request_id: Cell::new(0),
            subscriptions: RefCell::new(HashMap::new()),
            outbound,
            on_error: Box::new(on_error),
        });

        tokio::task::spawn_local(async move {
            while let Some(message) = outbound_rx.recv().await {
                if let Err(e) = write.send(message).await {
                    error!(%e, "websocket write failed");
                    break;
                }
            }
        });

        let reader_shared = shared.clone();
        tokio::task::spawn_local(async move {
            while let Some(message) = read.next().await {
                match message {
                    Ok(Message::Text(text)) => match serde_json::from_str::<Value>(&text) {
                        Ok(pdu) => reader_shared.process_input(pdu),
                        Err(e) => {
                            (reader_shared.on_error)(Error::ResponseParsing(e.to_string()));
                        }
                    },
                    Ok(Message::Close(_)) => {
                        info!("bus connection closed");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        if reader_shared.state.get() == ClientState::Stopped {
                            debug!("read loop ending after stop");
                        } else {
                            error!(%e, "websocket read failed");
                            (reader_shared.on_error)(Error::Reactor(e.to_string()));
                        }
                        break;
                    }
                }
            }
            reader_shared.state.set(ClientState::Stopped);
            reader_shared.subscriptions.borrow_mut().clear();
        });

        Ok(Rc::new(Self { shared }))
    }
}

impl BusClient for WsBusClient {
    fn subscribe_channel(
        &self,
        channel: &str,
        handle: SubscriptionHandle,
        callbacks: Rc<dyn SubscriptionCallbacks>,
        options: Option<SubscriptionOptions>,
    ) -> Result<()> {
        let request_id = self.shared.next_request_id();
        self.shared.subscriptions.borrow_mut().insert(
            channel.to_owned(),
            SubscriptionEntry {
                handle,
                callbacks,
                status: SubscriptionStatus::PendingSubscribe,
                pending_request_id: Some(request_id),
            },
        );

        let mut body = json!({
            "channel": channel,
            "subscription_id": channel,
        });
        if let Some(options) = options {
            let mut history = serde_json::Map::new();
            if let Some(age) = options.history.age {
                history.insert("age".into(), age.into());
            }
            if let Some(count) = options.history.count {
                history.insert("count".into(), count.into());
            }
            if !history.is_empty() {
                body["history"] = Value::Object(history);
            }
        }

        let pdu = json!({
            "action": "pubsub/subscribe",
            "body": body,
            "id": request_id,
        });
        info!(channel, %pdu, "requested subscribe");
        self.shared.send(pdu)
    }

    fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<()> {
        let channel = {
            let subscriptions = self.shared.subscriptions.borrow();
            subscriptions
                .iter()
                .find(|(_, entry)| entry.handle == handle)
                .map(|(channel, _)| channel.clone())
        };
        let Some(channel) = channel else {
            return Err(Error::Unsubscribe(format!(
                "no subscription with handle {}",
                handle.0
            )));
        };

        let request_id = self.shared.next_request_id();
        {
            let mut subscriptions = self.shared.subscriptions.borrow_mut();
            if let Some(entry) = subscriptions.get_mut(&channel) {
                entry.status = SubscriptionStatus::PendingUnsubscribe;
                entry.pending_request_id = Some(request_id);
            }
        }

        let pdu = json!({
            "action": "pubsub/unsubscribe",
            "body": {"subscription_id": channel},
            "id": request_id,
        });
        info!(%channel, "requested unsubscribe");
        self.shared.send(pdu)
    }

    fn publish(&self, channel: &str, body: &Value) -> Result<()> {
        self.shared.send(json!({
            "action": "pubsub/publish",
            "body": {"channel": channel, "message": body},
        }))
    }

    fn start(&self) -> Result<()> {
        // The connection is established in `connect`; starting twice is a
        // no-op by contract.
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        if self.shared.state.get() == ClientState::Stopped {
            return Ok(());
        }
        info!("stopping bus client");
        self.shared.state.set(ClientState::Stopped);
        let _ = self.shared.outbound.send(Message::Close(None));
        self.shared.subscriptions.borrow_mut().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared() -> Rc<Shared> {
        let (outbound, _rx) = mpsc::unbounded_channel();
        Rc::new(Shared {
            state: Cell::new(ClientState::Running),
            request_id: Cell::new(0),
            subscriptions: RefCell::new(HashMap::new()),
            outbound,
            on_error: Box::new(|_| {}),
        })
    }

    struct Recorder {
        seen: RefCell<Vec<Value>>,
        errors: RefCell<Vec<Error>>,
    }

    impl Recorder {
        fn new() -> Rc<Self> {
            Rc::new(Self {
                seen: RefCell::new(Vec::new()),
                errors: RefCell::new(Vec::new()),
            })
        }
    }

    impl SubscriptionCallbacks for Recorder {
        fn on_data(&self, _sub: SubscriptionHandle, message: Value) {
            self.seen.borrow_mut().push(message);
        }
        fn on_error(&self, error: Error) {
            self.errors.borrow_mut().push(error);
        }
    }

    fn insert_subscription(shared: &Shared, channel: &str, recorder: Rc<Recorder>) {
        shared.subscriptions.borrow_mut().insert(
            channel.to_owned(),
            SubscriptionEntry {
                handle: SubscriptionHandle(1),
                callbacks: recorder,
                status: SubscriptionStatus::PendingSubscribe,
                pending_request_id: Some(1),
            },
        );
    }

    #[test]
    fn test_subscribe_ack_promotes_to_current() {
        let shared = shared();
        let recorder = Recorder::new();
        insert_subscription(&shared, "cam", recorder);

        shared.process_input(json!({"action": "pubsub/subscribe/ok", "id": 1}));

        let subscriptions = shared.subscriptions.borrow();
        assert_eq!(
            subscriptions.get("cam").unwrap().status,
            SubscriptionStatus::Current
        );
    }

    #[test]
    fn test_subscribe_error_notifies_and_removes() {
        let shared = shared();
        let recorder = Recorder::new();
        insert_subscription(&shared, "cam", recorder.clone());

        shared.process_input(json!({"action": "pubsub/subscribe/error", "id": 1}));

        assert!(shared.subscriptions.borrow().is_empty());
        assert!(matches!(
            recorder.errors.borrow().as_slice(),
            [Error::Subscribe(_)]
        ));
    }

    #[test]
    fn test_data_fans_out_messages_in_order() {
        let shared = shared();
        let recorder = Recorder::new();
        insert_subscription(&shared, "cam", recorder.clone());
        shared.process_input(json!({"action": "pubsub/subscribe/ok", "id": 1}));

        shared.process_input(json!({
            "action": "pubsub/subscription/data",
            "body": {"subscription_id": "cam", "messages": [{"n": 1}, {"n": 2}]},
        }));

        assert_eq!(*recorder.seen.borrow(), vec![json!({"n": 1}), json!({"n": 2})]);
    }

    #[test]
    fn test_data_for_pending_unsubscribe_is_dropped() {
        let shared = shared();
        let recorder = Recorder::new();
        insert_subscription(&shared, "cam", recorder.clone());
        shared
            .subscriptions
            .borrow_mut()
            .get_mut("cam")
            .unwrap()
            .status = SubscriptionStatus::PendingUnsubscribe;

        shared.process_input(json!({
            "action": "pubsub/subscription/data",
            "body": {"subscription_id": "cam", "messages": [{"n": 1}]},
        }));

        assert!(recorder.seen.borrow().is_empty());
    }
}

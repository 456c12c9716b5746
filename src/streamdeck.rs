//! Connection to the Stream Deck application's plugin socket.
//!
//! [`DeviceHost`] owns the socket, performs the registration handshake and
//! re-emits every inbound frame on the topic named after its `event` field.
//! Role-specific behaviour (key press timing for the plugin, nothing for the
//! property inspector) is injected as a [`SessionRole`].

pub mod protocol;
pub mod session;

use std::{fmt, mem, sync::Arc, sync::Mutex};

use futures_util::{SinkExt, StreamExt};
use serde_json::{Map, Value};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tokio_tungstenite::tungstenite::Message;

use crate::{
    emitter::{EventEmitter, Subscription, Topic},
    error::{Error, Result},
    sync::lock,
};
use protocol::{
    ActionEvent, DeviceEvent, Frame, GlobalSettingsEvent, InboundEvent, InspectorMessage,
    InspectorVisibility, Outbound, RegisterFrame,
};
pub use session::{InspectorSession, KeyPressRole, PluginSession, KEY_PRESS, LONG_KEY_PRESS};

/// Emitted after registration, carrying the launch-time action info.
pub const CONNECTED: Topic<Value> = Topic::new("connected");
pub const DISCONNECTED: Topic<()> = Topic::new("disconnected");

pub const KEY_DOWN: Topic<ActionEvent> = Topic::new("keyDown");
pub const KEY_UP: Topic<ActionEvent> = Topic::new("keyUp");
pub const WILL_APPEAR: Topic<ActionEvent> = Topic::new("willAppear");
pub const WILL_DISAPPEAR: Topic<ActionEvent> = Topic::new("willDisappear");
pub const DID_RECEIVE_SETTINGS: Topic<ActionEvent> = Topic::new("didReceiveSettings");
pub const DID_RECEIVE_GLOBAL_SETTINGS: Topic<GlobalSettingsEvent> =
    Topic::new("didReceiveGlobalSettings");
pub const SEND_TO_PLUGIN: Topic<InspectorMessage> = Topic::new("sendToPlugin");
pub const SEND_TO_PROPERTY_INSPECTOR: Topic<InspectorMessage> =
    Topic::new("sendToPropertyInspector");
pub const DEVICE_DID_CONNECT: Topic<DeviceEvent> = Topic::new("deviceDidConnect");
pub const DEVICE_DID_DISCONNECT: Topic<DeviceEvent> = Topic::new("deviceDidDisconnect");
pub const PROPERTY_INSPECTOR_DID_APPEAR: Topic<InspectorVisibility> =
    Topic::new("propertyInspectorDidAppear");
pub const PROPERTY_INSPECTOR_DID_DISAPPEAR: Topic<InspectorVisibility> =
    Topic::new("propertyInspectorDidDisappear");

/// What the Stream Deck application passes on the command line.
#[derive(Debug, Clone)]
pub struct HostRegistration {
    pub port: u16,
    /// Plugin UUID, or the action context when running as an inspector.
    pub uuid: String,
    pub register_event: String,
    /// Parsed `-info` JSON (application, devices...).
    pub info: Value,
    /// Parsed action info; only the property inspector receives one.
    pub action_info: Value,
}

/// Hook run for every decoded frame before it is re-emitted.
pub trait SessionRole: Send + Sync + 'static {
    fn handle_message(&self, _event: &InboundEvent, _events: &EventEmitter) {}
}

/// A role that adds nothing to the generic dispatch.
#[derive(Debug, Default)]
pub struct PassiveRole;

impl SessionRole for PassiveRole {}

struct HostInner {
    registration: HostRegistration,
    events: EventEmitter,
    outbox: Mutex<Option<mpsc::UnboundedSender<String>>>,
    role: Box<dyn SessionRole>,
}

#[derive(Clone)]
pub struct DeviceHost {
    inner: Arc<HostInner>,
}

impl DeviceHost {
    pub fn new(registration: HostRegistration, role: impl SessionRole) -> Self {
        Self {
            inner: Arc::new(HostInner {
                registration,
                events: EventEmitter::new(),
                outbox: Mutex::new(None),
                role: Box::new(role),
            }),
        }
    }

    pub fn registration(&self) -> &HostRegistration {
        &self.inner.registration
    }

    pub fn uuid(&self) -> &str {
        &self.inner.registration.uuid
    }

    pub fn events(&self) -> &EventEmitter {
        &self.inner.events
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.inner.outbox)
            .as_ref()
            .is_some_and(|outbox| !outbox.is_closed())
    }

    /// Opens `ws://127.0.0.1:{port}`, registers, and spawns the socket pump.
    ///
    /// The socket is not reopened if it drops; [`DISCONNECTED`] is emitted
    /// instead.
    pub async fn connect(&self) -> Result<JoinHandle<()>> {
        let url = format!("ws://127.0.0.1:{}", self.inner.registration.port);
        tracing::info!(%url, "Connecting to device host");
        let (stream, _response) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| Error::WebSocketConnect(e.to_string()))?;
        let (mut write, mut read) = stream.split();

        let registration = serde_json::to_string(&RegisterFrame {
            event: &self.inner.registration.register_event,
            uuid: &self.inner.registration.uuid,
        })?;
        write
            .send(Message::text(registration))
            .await
            .map_err(|e| Error::WebSocketConnect(e.to_string()))?;

        let mut outbox = self.attach();
        self.inner
            .events
            .emit(CONNECTED, &self.inner.registration.action_info);

        let host = self.clone();
        Ok(tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(frame) = outbox.recv() => {
                        if let Err(e) = write.send(Message::text(frame)).await {
                            tracing::warn!(error = %e, "Device host write failed");
                            break;
                        }
                    }
                    frame = read.next() => match frame {
                        Some(Ok(Message::Text(text))) => host.handle_text(&text),
                        Some(Ok(Message::Close(frame))) => {
                            tracing::info!(?frame, "Device host closed the connection");
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            tracing::warn!(error = %e, "Device host socket error");
                            break;
                        }
                        None => break,
                    }
                }
            }
            host.detach();
            host.inner.events.emit(DISCONNECTED, &());
        }))
    }

    fn attach(&self) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        *lock(&self.inner.outbox) = Some(tx);
        rx
    }

    fn detach(&self) {
        lock(&self.inner.outbox).take();
    }

    fn handle_text(&self, text: &str) {
        match InboundEvent::decode(text) {
            Ok(Frame::Known(event)) => {
                tracing::trace!(context = ?event.context(), "Device host event");
                self.inner.role.handle_message(&event, &self.inner.events);
                dispatch(&self.inner.events, &event);
            }
            Ok(Frame::Unrecognized(name)) => {
                tracing::trace!(event = %name, "Ignoring unrecognized device host event");
            }
            Err(e) => tracing::debug!(error = %e, "Ignoring malformed device host frame"),
        }
    }

    pub fn send(&self, frame: &Outbound) -> Result<()> {
        let text = serde_json::to_string(frame)?;
        let outbox = lock(&self.inner.outbox);
        let outbox = outbox.as_ref().ok_or(Error::NotConnected)?;
        outbox.send(text).map_err(|_| Error::NotConnected)
    }

    /// Overwrites the settings stored for `context`.
    pub fn set_settings(&self, context: &str, settings: Value) -> Result<()> {
        self.send(&Outbound::set_settings(context, settings))
    }

    /// Requests the settings of `context` and waits for the matching
    /// `didReceiveSettings` reply.
    pub async fn get_settings(&self, context: &str) -> Result<Value> {
        let (tx, rx) = oneshot::channel();
        let slot = Arc::new(Mutex::new(Some(tx)));
        let wanted = context.to_string();
        let subscription = self.events().on(DID_RECEIVE_SETTINGS, move |event: &ActionEvent| {
            if event.context == wanted {
                if let Some(tx) = lock(&slot).take() {
                    let _ = tx.send(event.payload.settings.clone());
                }
            }
        });

        let outcome = match self.send(&Outbound::get_settings(context)) {
            Ok(()) => rx.await.map_err(|_| Error::RequestAbandoned),
            Err(e) => Err(e),
        };
        subscription.unsubscribe();
        outcome
    }

    /// Merges `patch` over the current settings of `context`; keys in
    /// `patch` win.
    pub async fn add_settings(&self, context: &str, patch: Map<String, Value>) -> Result<()> {
        let current = self.get_settings(context).await?;
        self.set_settings(context, merge_settings(current, patch))
    }

    pub fn set_global_settings(&self, settings: Value) -> Result<()> {
        self.send(&Outbound::set_global_settings(self.uuid(), settings))
    }

    /// Requests the plugin-wide settings and resolves with the next
    /// `didReceiveGlobalSettings` reply.
    pub async fn get_global_settings(&self) -> Result<Value> {
        let (tx, rx) = oneshot::channel();
        let slot = Arc::new(Mutex::new(Some(tx)));
        let subscription = self.events().once(
            DID_RECEIVE_GLOBAL_SETTINGS,
            move |event: &GlobalSettingsEvent| {
                if let Some(tx) = lock(&slot).take() {
                    let _ = tx.send(event.payload.settings.clone());
                }
            },
        );

        let outcome = match self.send(&Outbound::get_global_settings(self.uuid())) {
            Ok(()) => rx.await.map_err(|_| Error::RequestAbandoned),
            Err(e) => Err(e),
        };
        subscription.unsubscribe();
        outcome
    }

    pub async fn add_global_settings(&self, patch: Map<String, Value>) -> Result<()> {
        let current = self.get_global_settings().await?;
        self.set_global_settings(merge_settings(current, patch))
    }

    pub fn open_url(&self, url: &str) -> Result<()> {
        self.send(&Outbound::open_url(url))
    }

    /// Traces `message` and appends it to the Stream Deck application log.
    pub fn log(&self, message: &str) -> Result<()> {
        tracing::info!(target: "streamdeck", "{message}");
        self.send(&Outbound::log_message(message))
    }
}

impl fmt::Debug for DeviceHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceHost")
            .field("uuid", &self.inner.registration.uuid)
            .field("port", &self.inner.registration.port)
            .field("connected", &self.is_connected())
            .finish()
    }
}

fn dispatch(events: &EventEmitter, event: &InboundEvent) {
    match event {
        InboundEvent::KeyDown(ev) => events.emit(KEY_DOWN, ev),
        InboundEvent::KeyUp(ev) => events.emit(KEY_UP, ev),
        InboundEvent::WillAppear(ev) => events.emit(WILL_APPEAR, ev),
        InboundEvent::WillDisappear(ev) => events.emit(WILL_DISAPPEAR, ev),
        InboundEvent::DidReceiveSettings(ev) => events.emit(DID_RECEIVE_SETTINGS, ev),
        InboundEvent::DidReceiveGlobalSettings(ev) => events.emit(DID_RECEIVE_GLOBAL_SETTINGS, ev),
        InboundEvent::SendToPlugin(msg) => events.emit(SEND_TO_PLUGIN, msg),
        InboundEvent::SendToPropertyInspector(msg) => events.emit(SEND_TO_PROPERTY_INSPECTOR, msg),
        InboundEvent::DeviceDidConnect(ev) => events.emit(DEVICE_DID_CONNECT, ev),
        InboundEvent::DeviceDidDisconnect(ev) => events.emit(DEVICE_DID_DISCONNECT, ev),
        InboundEvent::PropertyInspectorDidAppear(ev) => {
            events.emit(PROPERTY_INSPECTOR_DID_APPEAR, ev);
        }
        InboundEvent::PropertyInspectorDidDisappear(ev) => {
            events.emit(PROPERTY_INSPECTOR_DID_DISAPPEAR, ev);
        }
    }
}

/// Button lifecycle topics a [`Backlog`] holds.
const HELD_TOPICS: [Topic<ActionEvent>; 3] = [WILL_APPEAR, DID_RECEIVE_SETTINGS, WILL_DISAPPEAR];

/// Holds button lifecycle events that arrive before their real listeners are
/// registered.
pub struct Backlog {
    events: EventEmitter,
    held: Arc<Mutex<Vec<(Topic<ActionEvent>, ActionEvent)>>>,
    subscriptions: Vec<Subscription>,
}

impl Backlog {
    /// Starts recording `willAppear`, `didReceiveSettings` and
    /// `willDisappear` on `events`.
    pub fn record(events: &EventEmitter) -> Self {
        let held = Arc::new(Mutex::new(Vec::new()));
        let subscriptions = HELD_TOPICS
            .iter()
            .map(|&topic| {
                let held = held.clone();
                events.on(topic, move |event: &ActionEvent| {
                    lock(&held).push((topic, event.clone()));
                })
            })
            .collect();
        Self {
            events: events.clone(),
            held,
            subscriptions,
        }
    }

    /// Stops recording and re-emits the held events in arrival order.
    /// Returns how many were replayed.
    pub fn replay(self) -> usize {
        for subscription in &self.subscriptions {
            subscription.unsubscribe();
        }
        let held = mem::take(&mut *lock(&self.held));
        for (topic, event) in &held {
            self.events.emit(*topic, event);
        }
        held.len()
    }
}

pub(crate) fn merge_settings(current: Value, patch: Map<String, Value>) -> Value {
    let mut merged = match current {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    merged.extend(patch);
    Value::Object(merged)
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    pub(crate) fn registration() -> HostRegistration {
        HostRegistration {
            port: 28196,
            uuid: "plugin-uuid".into(),
            register_event: "registerPlugin".into(),
            info: json!({"devices": [{"id": "dev1", "name": "Stream Deck", "type": 0}]}),
            action_info: json!({}),
        }
    }

    /// Wires an in-memory outbox, as [`DeviceHost::connect`] does for a socket.
    pub(crate) fn attached(host: &DeviceHost) -> mpsc::UnboundedReceiver<String> {
        host.attach()
    }

    pub(crate) fn feed(host: &DeviceHost, frame: Value) {
        host.handle_text(&frame.to_string());
    }

    pub(crate) async fn next_frame(outbox: &mut mpsc::UnboundedReceiver<String>) -> Value {
        let text = outbox.recv().await.expect("outbox closed");
        serde_json::from_str(&text).unwrap()
    }

    struct Recorder(Arc<Mutex<Vec<String>>>);

    impl SessionRole for Recorder {
        fn handle_message(&self, event: &InboundEvent, _events: &EventEmitter) {
            lock(&self.0).push(format!("hook:{}", event.context().unwrap_or("-")));
        }
    }

    #[test]
    fn registration_frame_shape() {
        let frame = serde_json::to_value(RegisterFrame {
            event: "registerPlugin",
            uuid: "plugin-uuid",
        })
        .unwrap();
        assert_eq!(frame, json!({"event": "registerPlugin", "uuid": "plugin-uuid"}));
    }

    #[test]
    fn hook_runs_before_dispatch() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let host = DeviceHost::new(registration(), Recorder(log.clone()));
        let sink = log.clone();
        host.events().on(WILL_APPEAR, move |event: &ActionEvent| {
            lock(&sink).push(format!("emit:{}", event.context));
        });

        feed(
            &host,
            json!({"event": "willAppear", "action": "a", "context": "ctx1", "device": "dev1",
                   "payload": {"settings": {}}}),
        );

        assert_eq!(*lock(&log), vec!["hook:ctx1", "emit:ctx1"]);
    }

    #[test]
    fn unrecognized_and_malformed_frames_are_dropped() {
        let host = DeviceHost::new(registration(), PassiveRole);
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        host.events().on(KEY_DOWN, move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        feed(&host, json!({"event": "dialRotate", "context": "c"}));
        host.handle_text("{not json");
        feed(&host, json!({"event": "keyDown", "context": "c"}));

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn send_requires_a_socket() {
        let host = DeviceHost::new(registration(), PassiveRole);
        assert!(!host.is_connected());
        assert!(matches!(host.open_url("https://example.org"), Err(Error::NotConnected)));
    }

    #[tokio::test]
    async fn get_settings_waits_for_the_matching_context() {
        let host = DeviceHost::new(registration(), PassiveRole);
        let mut outbox = attached(&host);

        let requester = host.clone();
        let task = tokio::spawn(async move { requester.get_settings("ctx1").await });
        assert_eq!(
            next_frame(&mut outbox).await,
            json!({"event": "getSettings", "context": "ctx1"})
        );

        feed(
            &host,
            json!({"event": "didReceiveSettings", "context": "ctx2",
                   "payload": {"settings": {"iconVariant": 2}}}),
        );
        feed(
            &host,
            json!({"event": "didReceiveSettings", "context": "ctx1",
                   "payload": {"settings": {"iconVariant": 1}}}),
        );

        assert_eq!(task.await.unwrap().unwrap(), json!({"iconVariant": 1}));
        assert!(!host.events().has_listener(DID_RECEIVE_SETTINGS));
    }

    #[tokio::test]
    async fn add_settings_merges_over_current() {
        let host = DeviceHost::new(registration(), PassiveRole);
        let mut outbox = attached(&host);

        let requester = host.clone();
        let task = tokio::spawn(async move {
            let mut patch = Map::new();
            patch.insert("profile".into(), json!("P2"));
            patch.insert("iconVariant".into(), json!(1));
            requester.add_settings("ctx1", patch).await
        });
        next_frame(&mut outbox).await;
        feed(
            &host,
            json!({"event": "didReceiveSettings", "context": "ctx1",
                   "payload": {"settings": {"iconVariant": 0, "state": {"value": "light.a"}}}}),
        );

        task.await.unwrap().unwrap();
        assert_eq!(
            next_frame(&mut outbox).await,
            json!({
                "event": "setSettings",
                "context": "ctx1",
                "payload": {"iconVariant": 1, "profile": "P2", "state": {"value": "light.a"}}
            })
        );
    }

    #[tokio::test]
    async fn global_settings_use_the_plugin_uuid() {
        let host = DeviceHost::new(registration(), PassiveRole);
        let mut outbox = attached(&host);

        let requester = host.clone();
        let task = tokio::spawn(async move {
            let mut patch = Map::new();
            patch.insert("haToken".into(), json!("new"));
            requester.add_global_settings(patch).await
        });
        assert_eq!(
            next_frame(&mut outbox).await,
            json!({"event": "getGlobalSettings", "context": "plugin-uuid"})
        );
        feed(
            &host,
            json!({"event": "didReceiveGlobalSettings",
                   "payload": {"settings": {"haUrl": "ws://hub", "haToken": "old"}}}),
        );

        task.await.unwrap().unwrap();
        assert_eq!(
            next_frame(&mut outbox).await,
            json!({
                "event": "setGlobalSettings",
                "context": "plugin-uuid",
                "payload": {"haUrl": "ws://hub", "haToken": "new"}
            })
        );
    }

    #[test]
    fn backlog_replays_lifecycle_events_in_order() {
        let host = DeviceHost::new(registration(), PassiveRole);
        let backlog = Backlog::record(host.events());

        let button = |event: &str, context: &str| {
            json!({"event": event, "action": "a", "context": context, "device": "dev1",
                   "payload": {"settings": {"state": {"value": "light.kitchen"}}}})
        };
        feed(&host, button("willAppear", "ctx1"));
        feed(&host, button("didReceiveSettings", "ctx1"));
        feed(&host, button("willAppear", "ctx2"));
        feed(&host, button("willDisappear", "ctx2"));

        let seen = Arc::new(Mutex::new(Vec::new()));
        for topic in HELD_TOPICS {
            let sink = seen.clone();
            host.events().on(topic, move |event: &ActionEvent| {
                lock(&sink).push(format!("{}:{}", topic.name(), event.context));
            });
        }

        assert_eq!(backlog.replay(), 4);
        assert_eq!(
            *lock(&seen),
            vec![
                "willAppear:ctx1",
                "didReceiveSettings:ctx1",
                "willAppear:ctx2",
                "willDisappear:ctx2"
            ]
        );

        feed(&host, button("willAppear", "ctx3"));
        assert_eq!(lock(&seen).len(), 5);
    }

    #[test]
    fn merge_replaces_non_objects() {
        let mut patch = Map::new();
        patch.insert("a".into(), json!(1));
        assert_eq!(merge_settings(Value::Null, patch), json!({"a": 1}));
    }
}

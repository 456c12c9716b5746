//! Role-specific sessions built on [`DeviceHost`].

use std::{
    collections::HashMap,
    ops::Deref,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use serde_json::{Map, Value};
use tokio::task::JoinHandle;

use super::{
    protocol::{ActionEvent, InboundEvent, Outbound, Target},
    DeviceHost, HostRegistration, PassiveRole, SessionRole,
};
use crate::{
    emitter::{EventEmitter, Topic},
    error::Result,
    sync::lock,
};

/// A key released before the long-press threshold.
pub const KEY_PRESS: Topic<ActionEvent> = Topic::new("keyPress");
/// A key held past the long-press threshold.
pub const LONG_KEY_PRESS: Topic<ActionEvent> = Topic::new("longKeyPress");

pub const DEFAULT_LONG_PRESS: Duration = Duration::from_millis(300);

struct HeldKey {
    generation: u64,
    timer: JoinHandle<()>,
}

/// Turns raw `keyDown`/`keyUp` pairs into [`KEY_PRESS`] or
/// [`LONG_KEY_PRESS`], independently per context.
pub struct KeyPressRole {
    threshold: Duration,
    held: Arc<Mutex<HashMap<String, HeldKey>>>,
    generation: AtomicU64,
}

impl KeyPressRole {
    pub fn new(threshold: Duration) -> Self {
        Self {
            threshold,
            held: Arc::default(),
            generation: AtomicU64::new(0),
        }
    }

    fn key_down(&self, event: &ActionEvent, events: &EventEmitter) {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let context = event.context.clone();

        // The timer cannot observe the map before its own entry is in place.
        let mut held = lock(&self.held);
        let timer = {
            let held = self.held.clone();
            let events = events.clone();
            let event = event.clone();
            let context = context.clone();
            let threshold = self.threshold;
            tokio::spawn(async move {
                tokio::time::sleep(threshold).await;
                let fired = {
                    let mut held = lock(&held);
                    match held.get(&context) {
                        Some(key) if key.generation == generation => {
                            held.remove(&context);
                            true
                        }
                        _ => false,
                    }
                };
                if fired {
                    tracing::debug!(%context, "Long key press");
                    events.emit(LONG_KEY_PRESS, &event);
                }
            })
        };
        if let Some(previous) = held.insert(context, HeldKey { generation, timer }) {
            previous.timer.abort();
        }
    }

    fn key_up(&self, event: &ActionEvent, events: &EventEmitter) {
        let released = lock(&self.held).remove(&event.context);
        if let Some(key) = released {
            key.timer.abort();
            tracing::debug!(context = %event.context, "Key press");
            events.emit(KEY_PRESS, event);
        }
    }
}

impl Default for KeyPressRole {
    fn default() -> Self {
        Self::new(DEFAULT_LONG_PRESS)
    }
}

impl SessionRole for KeyPressRole {
    fn handle_message(&self, event: &InboundEvent, events: &EventEmitter) {
        match event {
            InboundEvent::KeyDown(ev) => self.key_down(ev, events),
            InboundEvent::KeyUp(ev) => self.key_up(ev, events),
            _ => {}
        }
    }
}

/// The plugin side of the device host connection.
#[derive(Clone, Debug)]
pub struct PluginSession {
    host: DeviceHost,
}

impl PluginSession {
    pub fn new(registration: HostRegistration) -> Self {
        Self::with_long_press(registration, DEFAULT_LONG_PRESS)
    }

    pub fn with_long_press(registration: HostRegistration, threshold: Duration) -> Self {
        Self {
            host: DeviceHost::new(registration, KeyPressRole::new(threshold)),
        }
    }

    pub fn host(&self) -> &DeviceHost {
        &self.host
    }

    pub fn set_title(&self, context: &str, title: &str) -> Result<()> {
        self.host
            .send(&Outbound::set_title(context, title, Target::HardwareAndSoftware))
    }

    /// `image` is a self-contained data URL.
    pub fn set_image(&self, context: &str, image: &str) -> Result<()> {
        self.host
            .send(&Outbound::set_image(context, image, Target::HardwareAndSoftware))
    }

    pub fn set_state(&self, context: &str, state: u8) -> Result<()> {
        self.host.send(&Outbound::set_state(context, state))
    }

    pub fn show_alert(&self, context: &str) -> Result<()> {
        self.host.send(&Outbound::show_alert(context))
    }

    pub fn show_ok(&self, context: &str) -> Result<()> {
        self.host.send(&Outbound::show_ok(context))
    }

    pub fn switch_to_profile(&self, device: &str, profile: &str) -> Result<()> {
        self.host
            .send(&Outbound::switch_to_profile(self.host.uuid(), device, profile))
    }

    pub fn send_to_property_inspector(
        &self,
        action: &str,
        context: &str,
        payload: Value,
    ) -> Result<()> {
        self.host
            .send(&Outbound::send_to_property_inspector(action, context, payload))
    }
}

impl Deref for PluginSession {
    type Target = DeviceHost;

    fn deref(&self) -> &DeviceHost {
        &self.host
    }
}

/// The property inspector side: its uuid is the inspected action's context.
#[derive(Clone, Debug)]
pub struct InspectorSession {
    host: DeviceHost,
    devices: HashMap<String, Value>,
}

impl InspectorSession {
    pub fn new(registration: HostRegistration) -> Self {
        let devices = registration
            .info
            .get("devices")
            .and_then(Value::as_array)
            .map(|devices| {
                devices
                    .iter()
                    .filter_map(|device| {
                        let id = device.get("id")?.as_str()?;
                        Some((id.to_string(), device.clone()))
                    })
                    .collect()
            })
            .unwrap_or_default();
        Self {
            host: DeviceHost::new(registration, PassiveRole),
            devices,
        }
    }

    pub fn host(&self) -> &DeviceHost {
        &self.host
    }

    fn action_field(&self, field: &str) -> &str {
        self.host
            .registration()
            .action_info
            .get(field)
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    /// The device the inspected action lives on.
    pub fn device(&self) -> Option<&Value> {
        self.devices.get(self.action_field("device"))
    }

    pub fn send_to_plugin(&self, payload: Value) -> Result<()> {
        self.host.send(&Outbound::send_to_plugin(
            self.action_field("action"),
            self.host.uuid(),
            payload,
        ))
    }

    pub async fn settings(&self) -> Result<Value> {
        self.host.get_settings(self.host.uuid()).await
    }

    pub fn set_settings(&self, settings: Value) -> Result<()> {
        self.host.set_settings(self.host.uuid(), settings)
    }

    pub async fn add_settings(&self, patch: Map<String, Value>) -> Result<()> {
        self.host.add_settings(self.host.uuid(), patch).await
    }
}

impl Deref for InspectorSession {
    type Target = DeviceHost;

    fn deref(&self) -> &DeviceHost {
        &self.host
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::streamdeck::tests::{attached, feed, next_frame, registration};

    struct Counts {
        press: Arc<Mutex<Vec<String>>>,
        long: Arc<Mutex<Vec<String>>>,
    }

    fn session() -> (PluginSession, Counts) {
        let session = PluginSession::new(registration());
        let press = Arc::new(Mutex::new(Vec::new()));
        let long = Arc::new(Mutex::new(Vec::new()));
        let sink = press.clone();
        session.events().on(KEY_PRESS, move |event: &ActionEvent| {
            lock(&sink).push(event.context.clone());
        });
        let sink = long.clone();
        session.events().on(LONG_KEY_PRESS, move |event: &ActionEvent| {
            lock(&sink).push(event.context.clone());
        });
        (session, Counts { press, long })
    }

    fn key(session: &PluginSession, event: &str, context: &str) {
        feed(
            session.host(),
            json!({"event": event, "action": "io.hass.action", "context": context,
                   "device": "dev1", "payload": {"settings": {}}}),
        );
    }

    #[tokio::test(start_paused = true)]
    async fn quick_release_is_a_key_press() {
        let (session, counts) = session();

        key(&session, "keyDown", "ctx1");
        tokio::time::sleep(Duration::from_millis(120)).await;
        key(&session, "keyUp", "ctx1");
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert_eq!(*lock(&counts.press), vec!["ctx1"]);
        assert!(lock(&counts.long).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn holding_past_the_threshold_is_one_long_press() {
        let (session, counts) = session();

        key(&session, "keyDown", "ctx1");
        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(*lock(&counts.long), vec!["ctx1"]);

        key(&session, "keyUp", "ctx1");
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert_eq!(*lock(&counts.long), vec!["ctx1"]);
        assert!(lock(&counts.press).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn contexts_are_timed_independently() {
        let (session, counts) = session();

        key(&session, "keyDown", "a");
        key(&session, "keyDown", "b");
        tokio::time::sleep(Duration::from_millis(100)).await;
        key(&session, "keyUp", "a");
        tokio::time::sleep(Duration::from_millis(300)).await;
        key(&session, "keyUp", "b");

        assert_eq!(*lock(&counts.press), vec!["a"]);
        assert_eq!(*lock(&counts.long), vec!["b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn key_up_without_key_down_is_ignored() {
        let (session, counts) = session();
        key(&session, "keyUp", "ctx1");
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(lock(&counts.press).is_empty());
        assert!(lock(&counts.long).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn custom_threshold_is_honoured() {
        let session = PluginSession::with_long_press(registration(), Duration::from_secs(1));
        let long = Arc::new(AtomicUsize::new(0));
        let seen = long.clone();
        session.events().on(LONG_KEY_PRESS, move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        key(&session, "keyDown", "ctx1");
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(long.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(long.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn ui_commands_target_the_button() {
        let session = PluginSession::new(registration());
        let mut outbox = attached(session.host());

        session.set_state("ctx1", 1).unwrap();
        session.set_title("ctx1", "Kitchen").unwrap();
        session
            .send_to_property_inspector("io.hass.action", "ctx1", json!({"services": []}))
            .unwrap();

        assert_eq!(
            next_frame(&mut outbox).await,
            json!({"event": "setState", "context": "ctx1", "payload": {"state": 1}})
        );
        assert_eq!(
            next_frame(&mut outbox).await,
            json!({"event": "setTitle", "context": "ctx1",
                   "payload": {"title": "Kitchen", "target": 0}})
        );
        assert_eq!(
            next_frame(&mut outbox).await,
            json!({"event": "sendToPropertyInspector", "action": "io.hass.action",
                   "context": "ctx1", "payload": {"services": []}})
        );
    }

    #[tokio::test]
    async fn inspector_talks_to_the_plugin_as_its_action() {
        let mut registration = registration();
        registration.uuid = "ctx7".into();
        registration.register_event = "registerPropertyInspector".into();
        registration.action_info = json!({"action": "io.hass.action", "context": "ctx7", "device": "dev1"});
        let inspector = InspectorSession::new(registration);
        let mut outbox = attached(inspector.host());

        assert_eq!(inspector.device().unwrap()["name"], "Stream Deck");
        inspector.send_to_plugin(json!({"image": "data:"})).unwrap();
        inspector.set_settings(json!({"iconVariant": 1})).unwrap();

        assert_eq!(
            next_frame(&mut outbox).await,
            json!({"event": "sendToPlugin", "action": "io.hass.action", "context": "ctx7",
                   "payload": {"image": "data:"}})
        );
        assert_eq!(
            next_frame(&mut outbox).await,
            json!({"event": "setSettings", "context": "ctx7", "payload": {"iconVariant": 1}})
        );
    }
}

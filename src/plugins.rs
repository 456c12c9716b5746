//! The Home Assistant plugin: wires the hub session to the button session.
//!
//! Buttons are bound to entities by their settings. Hub state changes
//! re-render every button bound to the changed entity, key presses call hub
//! services, and long presses switch profile while publishing the pressed
//! button's settings as the shared variables.

pub mod appearance;

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, Weak},
};

use serde_json::{Map, Value};
use tokio::task::JoinHandle;

use crate::{
    emitter::Subscription,
    error::Result,
    hass::{self, HubClient, HubEvent, HubFailure, State},
    icons::IconRenderer,
    settings::{ActionSettings, SharedVariables, SHARED_VARIABLES_KEY},
    streamdeck::{
        self,
        protocol::{ActionEvent, InspectorMessage},
        merge_settings, PluginSession, KEY_PRESS, LONG_KEY_PRESS,
    },
    sync::lock,
};

/// Orchestrates one [`PluginSession`] and one [`HubClient`].
///
/// Nothing happens until [`attach`](Self::attach) registers the listeners.
#[derive(Clone)]
pub struct HomeAssistantPlugin {
    inner: Arc<Inner>,
}

struct Inner {
    deck: PluginSession,
    hub: HubClient,
    renderer: Arc<dyn IconRenderer>,
    state: Mutex<PluginState>,
    subscriptions: Mutex<Vec<Subscription>>,
}

#[derive(Default)]
struct PluginState {
    /// Settings of every visible button, by context.
    bindings: HashMap<String, ActionSettings>,
    shared: SharedVariables,
    /// The latest render task of each context.
    renders: HashMap<String, JoinHandle<()>>,
}

/// Where a render gets its entity state from.
enum Source {
    Fetch(String),
    Known(State),
}

impl HomeAssistantPlugin {
    pub fn new(deck: PluginSession, hub: HubClient, renderer: Arc<dyn IconRenderer>) -> Self {
        Self {
            inner: Arc::new(Inner {
                deck,
                hub,
                renderer,
                state: Mutex::new(PluginState::default()),
                subscriptions: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Starts from a previously persisted set of shared variables.
    pub fn restore_shared_variables(&self, shared: SharedVariables) {
        lock(&self.inner.state).shared = shared;
    }

    pub fn shared_variables(&self) -> SharedVariables {
        lock(&self.inner.state).shared.clone()
    }

    pub fn binding(&self, context: &str) -> Option<ActionSettings> {
        lock(&self.inner.state).bindings.get(context).cloned()
    }

    /// Registers the plugin's listeners on both sessions.
    pub fn attach(&self) {
        let weak = Arc::downgrade(&self.inner);
        let deck = self.inner.deck.events();
        let hub = self.inner.hub.events();

        let subscriptions = vec![
            deck.on(
                streamdeck::WILL_APPEAR,
                with(&weak, |inner, event: &ActionEvent| inner.bind(event)),
            ),
            deck.on(
                streamdeck::DID_RECEIVE_SETTINGS,
                with(&weak, |inner, event: &ActionEvent| inner.bind(event)),
            ),
            deck.on(
                streamdeck::WILL_DISAPPEAR,
                with(&weak, |inner, event: &ActionEvent| inner.unbind(&event.context)),
            ),
            deck.on(
                KEY_PRESS,
                with(&weak, |inner, event: &ActionEvent| inner.key_press(event)),
            ),
            deck.on(
                LONG_KEY_PRESS,
                with(&weak, |inner, event: &ActionEvent| inner.long_key_press(event)),
            ),
            deck.on(
                streamdeck::SEND_TO_PLUGIN,
                with(&weak, |inner, message: &InspectorMessage| {
                    inner.inspector_message(message)
                }),
            ),
            hub.on(hass::CONNECTED, with(&weak, |inner, _: &()| inner.hub_connected())),
            hub.on(
                hass::DISCONNECTED,
                with(&weak, |inner, _: &()| {
                    inner.log(&format!("HomeAssistant disconnected from {}", inner.hub.url()));
                }),
            ),
            hub.on(
                hass::ERROR,
                with(&weak, |inner, failure: &HubFailure| {
                    inner.log(&format!("HomeAssistant error: {failure}"));
                }),
            ),
        ];
        lock(&self.inner.subscriptions).extend(subscriptions);
    }

    /// Removes the listeners and cancels pending renders.
    pub fn detach(&self) {
        for subscription in lock(&self.inner.subscriptions).drain(..) {
            subscription.unsubscribe();
        }
        for (_, render) in lock(&self.inner.state).renders.drain() {
            render.abort();
        }
    }
}

/// Adapts a handler to a listener that holds the plugin weakly.
fn with<T, F>(weak: &Weak<Inner>, handler: F) -> impl Fn(&T) + Send + Sync + 'static
where
    T: 'static,
    F: Fn(&Arc<Inner>, &T) + Send + Sync + 'static,
{
    let weak = weak.clone();
    move |payload: &T| {
        if let Some(inner) = weak.upgrade() {
            handler(&inner, payload);
        }
    }
}

impl Inner {
    /// Appends to the Stream Deck log, which also traces.
    fn log(&self, message: &str) {
        if let Err(e) = self.deck.log(message) {
            tracing::debug!(error = %e, "Could not forward log message");
        }
    }

    fn bind(self: &Arc<Self>, event: &ActionEvent) {
        let settings = ActionSettings::from_payload(&event.payload.settings);
        let target = {
            let mut state = lock(&self.state);
            let target = settings.target_entity(&state.shared).map(str::to_string);
            state.bindings.insert(event.context.clone(), settings);
            target
        };
        tracing::debug!(context = %event.context, entity_id = ?target, "Bound button");
        if let Some(entity_id) = target {
            self.schedule_render(&event.context, Source::Fetch(entity_id));
        }
    }

    fn unbind(&self, context: &str) {
        let mut state = lock(&self.state);
        state.bindings.remove(context);
        if let Some(render) = state.renders.remove(context) {
            render.abort();
        }
        tracing::debug!(%context, "Unbound button");
    }

    /// Replaces any render still pending for `context`.
    fn schedule_render(self: &Arc<Self>, context: &str, source: Source) {
        let mut state = lock(&self.state);
        let task = tokio::spawn(self.clone().render(context.to_string(), source));
        if let Some(previous) = state.renders.insert(context.to_string(), task) {
            previous.abort();
        }
    }

    async fn render(self: Arc<Self>, context: String, source: Source) {
        let entity = match source {
            Source::Known(state) => state,
            Source::Fetch(entity_id) => match self.hub.get_state(&entity_id).await {
                Ok(state) => state,
                Err(e) => {
                    tracing::warn!(%context, %entity_id, error = %e, "Could not fetch entity state");
                    return;
                }
            },
        };
        let variant = {
            let state = lock(&self.state);
            state.bindings.get(&context).map(|settings| settings.icon_variant)
        };
        let Some(variant) = variant else {
            return;
        };

        if let Some(request) = appearance::icon_request(&entity, variant) {
            match self.renderer.render(&request).await {
                Ok(Some(image)) => {
                    if let Err(e) = self.deck.set_image(&context, &image) {
                        tracing::debug!(%context, error = %e, "Could not send image");
                    }
                }
                Ok(None) => tracing::debug!(%context, ?request, "No icon for this variant"),
                Err(e) => tracing::warn!(%context, error = %e, "Icon rendering failed"),
            }
        }
        if let Err(e) = self.deck.set_state(&context, appearance::button_state(&entity)) {
            tracing::debug!(%context, error = %e, "Could not send button state");
        }
    }

    /// Re-renders every bound button, or only those using shared variables.
    fn refresh(self: &Arc<Self>, variables_only: bool) {
        let targets: Vec<(String, String)> = {
            let state = lock(&self.state);
            state
                .bindings
                .iter()
                .filter(|(_, settings)| !variables_only || settings.uses_variables())
                .filter_map(|(context, settings)| {
                    let entity_id = settings.target_entity(&state.shared)?;
                    Some((context.clone(), entity_id.to_string()))
                })
                .collect()
        };
        for (context, entity_id) in targets {
            self.schedule_render(&context, Source::Fetch(entity_id));
        }
    }

    fn hub_connected(self: &Arc<Self>) {
        self.log(&format!("HomeAssistant connected on {}", self.hub.url()));

        let weak = Arc::downgrade(self);
        let hub = self.hub.clone();
        tokio::spawn(async move {
            let subscribed = hub
                .subscribe_events(move |event: &HubEvent| {
                    if let Some(inner) = weak.upgrade() {
                        inner.hub_event(event);
                    }
                })
                .await;
            if let Err(e) = subscribed {
                tracing::warn!(error = %e, "Could not subscribe to state changes");
            }
        });

        self.refresh(false);
    }

    fn hub_event(self: &Arc<Self>, event: &HubEvent) {
        let Some(changed) = event.state_changed() else {
            return;
        };
        let Some(new_state) = changed.new_state else {
            tracing::debug!(entity_id = %changed.entity_id, "Entity removed");
            return;
        };

        let contexts: Vec<String> = {
            let state = lock(&self.state);
            state
                .bindings
                .iter()
                .filter(|(_, settings)| {
                    settings.target_entity(&state.shared) == Some(changed.entity_id.as_str())
                })
                .map(|(context, _)| context.clone())
                .collect()
        };
        for context in contexts {
            tracing::trace!(%context, entity_id = %changed.entity_id, "State changed");
            self.schedule_render(&context, Source::Known(new_state.clone()));
        }
    }

    fn key_press(self: &Arc<Self>, event: &ActionEvent) {
        let settings = ActionSettings::from_payload(&event.payload.settings);
        let Some(call) = settings.service_call(&lock(&self.state).shared) else {
            tracing::debug!(context = %event.context, "Incomplete settings, no service call");
            return;
        };
        self.log(&format!("{} {} '{}'", call.service, call.domain, call.entity_id));

        let inner = self.clone();
        let context = event.context.clone();
        tokio::spawn(async move {
            let outcome = inner
                .hub
                .call_service(&call.domain, &call.service, Some(call.service_data))
                .await;
            if let Err(e) = outcome {
                tracing::warn!(%context, domain = %call.domain, service = %call.service, error = %e, "Service call failed");
                if let Err(e) = inner.deck.show_alert(&context) {
                    tracing::debug!(%context, error = %e, "Could not show alert");
                }
            }
        });
    }

    fn long_key_press(self: &Arc<Self>, event: &ActionEvent) {
        let settings = ActionSettings::from_payload(&event.payload.settings);
        let Some(profile) = settings.profile.clone().filter(|p| !p.is_empty()) else {
            return;
        };

        lock(&self.state).shared.publish(settings);
        self.log(&format!("Switching to profile '{profile}'"));

        let inner = self.clone();
        tokio::spawn(async move {
            if let Err(e) = inner.persist_shared_variables().await {
                tracing::warn!(error = %e, "Could not persist shared variables");
            }
        });

        if let Err(e) = self.deck.switch_to_profile(&event.device, &profile) {
            tracing::warn!(%profile, error = %e, "Could not switch profile");
        }
        self.refresh(true);
    }

    /// Merges the current shared variables into the global settings.
    ///
    /// The variables are read after the global settings arrive, so the last
    /// write always carries the latest published set.
    async fn persist_shared_variables(&self) -> Result<()> {
        let current = self.deck.get_global_settings().await?;
        let mut patch = Map::new();
        patch.insert(
            SHARED_VARIABLES_KEY.to_string(),
            lock(&self.state).shared.to_value(),
        );
        self.deck.set_global_settings(merge_settings(current, patch))
    }

    fn inspector_message(&self, message: &InspectorMessage) {
        if let Some(image) = message.payload.get("image").and_then(Value::as_str) {
            if let Err(e) = self.deck.set_image(&message.context, image) {
                tracing::debug!(context = %message.context, error = %e, "Could not send image");
            }
        }
    }
}

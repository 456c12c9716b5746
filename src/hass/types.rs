//! Entity and service shapes reported by the hub.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The state of one entity, as returned by `get_states` or the REST API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct State {
    pub entity_id: String,
    pub state: String,
    /// Domain-specific attributes (`color_mode`, `hs_color`, `friendly_name`...).
    #[serde(default)]
    pub attributes: Map<String, Value>,
    #[serde(default)]
    pub last_changed: String,
    #[serde(default)]
    pub last_updated: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<StateContext>,
}

impl State {
    pub fn entity(&self) -> Entity {
        Entity::new(&self.entity_id)
    }

    pub fn is_on(&self) -> bool {
        self.state == "on"
    }

    pub fn attribute(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }

    pub fn attribute_f64(&self, name: &str) -> Option<f64> {
        self.attributes.get(name).and_then(Value::as_f64)
    }

    pub fn attribute_str(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateContext {
    pub id: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
}

/// An entity id split into its domain and object name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Entity {
    pub entity_id: String,
    pub domain: String,
    pub name: String,
}

impl Entity {
    /// Splits at the first `.`; an id without one has an empty name.
    pub fn new(entity_id: &str) -> Self {
        let (domain, name) = entity_id.split_once('.').unwrap_or((entity_id, ""));
        Self {
            entity_id: entity_id.to_string(),
            domain: domain.to_string(),
            name: name.to_string(),
        }
    }
}

/// A hub service descriptor. `id` is the service key within its domain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Service {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub fields: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<Value>,
}

pub type DomainServices = BTreeMap<String, Vec<Service>>;

/// Flattens the hub's `{domain: {service: {...}}}` answer into per-domain
/// lists, injecting each service key as `id`.
pub(crate) fn flatten_services(raw: Map<String, Value>) -> Result<DomainServices, serde_json::Error> {
    let mut services = DomainServices::new();
    for (domain, entries) in raw {
        let Value::Object(entries) = entries else {
            continue;
        };
        let mut list = Vec::with_capacity(entries.len());
        for (key, descriptor) in entries {
            let mut descriptor = match descriptor {
                Value::Object(map) => map,
                _ => Map::new(),
            };
            descriptor.insert("id".to_string(), Value::String(key));
            list.push(serde_json::from_value(Value::Object(descriptor))?);
        }
        services.insert(domain, list);
    }
    Ok(services)
}

/// An event delivered on a `subscribe_events` subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HubEvent {
    pub event_type: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub origin: Option<String>,
    #[serde(default)]
    pub time_fired: Option<String>,
}

impl HubEvent {
    /// Interprets the event as a state change, if it is one.
    pub fn state_changed(&self) -> Option<StateChangedEvent> {
        if self.event_type != STATE_CHANGED {
            return None;
        }
        serde_json::from_value(self.data.clone()).ok()
    }
}

pub const STATE_CHANGED: &str = "state_changed";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateChangedEvent {
    pub entity_id: String,
    #[serde(default)]
    pub old_state: Option<State>,
    #[serde(default)]
    pub new_state: Option<State>,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn entity_splits_at_first_dot() {
        let entity = Entity::new("light.kitchen.ceiling");
        assert_eq!(entity.domain, "light");
        assert_eq!(entity.name, "kitchen.ceiling");

        let bare = Entity::new("sun");
        assert_eq!(bare.domain, "sun");
        assert_eq!(bare.name, "");
    }

    #[test]
    fn flattens_services_with_ids() {
        let raw = json!({
            "light": {
                "turn_on": { "name": "Turn on", "description": "Turn on a light", "fields": {} },
                "toggle": { "name": "Toggle", "fields": { "transition": {} } }
            },
            "switch": { "turn_off": {} }
        });
        let Value::Object(raw) = raw else { unreachable!() };

        let services = flatten_services(raw).unwrap();

        let light = &services["light"];
        let turn_on = light.iter().find(|s| s.id == "turn_on").unwrap();
        let toggle = light.iter().find(|s| s.id == "toggle").unwrap();
        assert_eq!(light.len(), 2);
        assert_eq!(turn_on.name.as_deref(), Some("Turn on"));
        assert!(toggle.fields.contains_key("transition"));
        assert_eq!(services["switch"][0].id, "turn_off");
    }

    #[test]
    fn parses_state_changed_event() {
        let event: HubEvent = serde_json::from_value(json!({
            "event_type": "state_changed",
            "data": {
                "entity_id": "light.kitchen",
                "old_state": null,
                "new_state": { "entity_id": "light.kitchen", "state": "off", "attributes": {} }
            },
            "origin": "LOCAL",
            "time_fired": "2024-05-01T10:00:00+00:00"
        }))
        .unwrap();

        let change = event.state_changed().unwrap();
        assert_eq!(change.entity_id, "light.kitchen");
        assert!(change.old_state.is_none());
        assert_eq!(change.new_state.unwrap().state, "off");
    }

    #[test]
    fn other_event_types_are_not_state_changes() {
        let event = HubEvent {
            event_type: "call_service".into(),
            data: json!({}),
            origin: None,
            time_fired: None,
        };
        assert!(event.state_changed().is_none());
    }
}

//! Per-button settings and the shared variables published by a long press.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A setting that is either a literal or a reference to the shared value of
/// the same field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SettingVariable<T> {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<T>,
    #[serde(rename = "isVariable")]
    pub is_variable: bool,
}

impl<T> Default for SettingVariable<T> {
    fn default() -> Self {
        Self {
            value: None,
            is_variable: false,
        }
    }
}

impl<T> SettingVariable<T> {
    pub fn literal(value: T) -> Self {
        Self {
            value: Some(value),
            is_variable: false,
        }
    }

    pub fn variable() -> Self {
        Self {
            value: None,
            is_variable: true,
        }
    }
}

/// Picks the shared value when `setting` is a variable, its own value
/// otherwise.
///
/// ```
/// use streamdeck_hass_plugin::settings::{resolve, SettingVariable};
///
/// let literal = SettingVariable::literal("x".to_string());
/// assert_eq!(resolve(&literal, Some(&"y".to_string())).map(String::as_str), Some("x"));
///
/// let variable = SettingVariable::<String>::variable();
/// assert_eq!(resolve(&variable, Some(&"y".to_string())).map(String::as_str), Some("y"));
/// assert_eq!(resolve(&variable, None), None);
/// ```
pub fn resolve<'a, T>(setting: &'a SettingVariable<T>, shared: Option<&'a T>) -> Option<&'a T> {
    if setting.is_variable {
        shared
    } else {
        setting.value.as_ref()
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceField {
    pub field_id: String,
    pub value: Value,
}

/// What the property inspector stores for one button.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ActionSettings {
    pub domain: SettingVariable<String>,
    pub service: SettingVariable<String>,
    /// The target entity id.
    pub state: SettingVariable<String>,
    pub service_config: Vec<ServiceField>,
    pub icon_variant: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,
}

/// A fully resolved `call_service` request.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceCall {
    pub domain: String,
    pub service: String,
    pub entity_id: String,
    pub service_data: Value,
}

impl ActionSettings {
    /// Reads settings from a device host payload. Anything that does not fit
    /// the expected shape yields the empty settings.
    pub fn from_payload(settings: &Value) -> Self {
        match serde_json::from_value(settings.clone()) {
            Ok(settings) => settings,
            Err(e) => {
                tracing::debug!(error = %e, "Unreadable action settings, using defaults");
                Self::default()
            }
        }
    }

    pub fn uses_variables(&self) -> bool {
        self.domain.is_variable || self.service.is_variable || self.state.is_variable
    }

    pub fn domain<'a>(&'a self, shared: &'a SharedVariables) -> Option<&'a str> {
        resolve(&self.domain, shared.get().and_then(|s| s.domain.value.as_ref()))
            .map(String::as_str)
    }

    pub fn service<'a>(&'a self, shared: &'a SharedVariables) -> Option<&'a str> {
        resolve(&self.service, shared.get().and_then(|s| s.service.value.as_ref()))
            .map(String::as_str)
    }

    pub fn entity_id<'a>(&'a self, shared: &'a SharedVariables) -> Option<&'a str> {
        resolve(&self.state, shared.get().and_then(|s| s.state.value.as_ref()))
            .map(String::as_str)
            .filter(|id| !id.is_empty())
    }

    /// The entity a button displays: [`entity_id`](Self::entity_id), or the
    /// button's own `state` value while no shared entity is published.
    ///
    /// Service calls keep using the strict form.
    pub fn target_entity<'a>(&'a self, shared: &'a SharedVariables) -> Option<&'a str> {
        self.entity_id(shared).or_else(|| {
            self.state
                .value
                .as_deref()
                .filter(|id| !id.is_empty())
        })
    }

    /// Resolves every field needed for a service call, or `None` when any of
    /// domain, service or entity is missing.
    ///
    /// The field list follows the service: when the service comes from the
    /// shared variables, so do its fields.
    pub fn service_call(&self, shared: &SharedVariables) -> Option<ServiceCall> {
        let domain = self.domain(shared).filter(|d| !d.is_empty())?;
        let service = self.service(shared).filter(|s| !s.is_empty())?;
        let entity_id = self.entity_id(shared)?;

        let fields = if self.service.is_variable {
            shared.get().map(|s| s.service_config.as_slice()).unwrap_or_default()
        } else {
            self.service_config.as_slice()
        };
        let mut data: Map<String, Value> = fields
            .iter()
            .filter(|field| !field.field_id.is_empty())
            .map(|field| (field.field_id.clone(), field.value.clone()))
            .collect();
        data.insert("entity_id".into(), Value::String(entity_id.to_string()));

        Some(ServiceCall {
            domain: domain.to_string(),
            service: service.to_string(),
            entity_id: entity_id.to_string(),
            service_data: Value::Object(data),
        })
    }
}

/// Global settings key the shared variables are persisted under.
pub const SHARED_VARIABLES_KEY: &str = "sharedVariables";

/// The settings of the last button that switched profile.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SharedVariables {
    current: Option<ActionSettings>,
}

impl SharedVariables {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restores the published set from the plugin's global settings.
    pub fn from_global_settings(global: &Value) -> Self {
        Self {
            current: global
                .get(SHARED_VARIABLES_KEY)
                .filter(|value| value.is_object())
                .map(ActionSettings::from_payload),
        }
    }

    pub fn get(&self) -> Option<&ActionSettings> {
        self.current.as_ref()
    }

    /// Replaces the whole set.
    pub fn publish(&mut self, settings: ActionSettings) {
        self.current = Some(settings);
    }

    pub fn to_value(&self) -> Value {
        self.current
            .as_ref()
            .and_then(|settings| serde_json::to_value(settings).ok())
            .unwrap_or(Value::Null)
    }
}

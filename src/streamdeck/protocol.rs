//! Frames exchanged with the Stream Deck application over its local socket.

use serde::{Deserialize, Serialize, Serializer};
use serde_json::{json, Value};

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct Coordinates {
    pub column: u32,
    pub row: u32,
}

/// Payload shared by `keyDown`, `keyUp`, `willAppear`, `willDisappear` and
/// `didReceiveSettings`.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionPayload {
    #[serde(default)]
    pub settings: Value,
    #[serde(default)]
    pub coordinates: Option<Coordinates>,
    #[serde(default)]
    pub state: Option<u32>,
    #[serde(default)]
    pub is_in_multi_action: bool,
}

/// An event addressed to one button instance.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ActionEvent {
    #[serde(default)]
    pub action: String,
    pub context: String,
    #[serde(default)]
    pub device: String,
    #[serde(default)]
    pub payload: ActionPayload,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct GlobalSettingsPayload {
    #[serde(default)]
    pub settings: Value,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GlobalSettingsEvent {
    #[serde(default)]
    pub payload: GlobalSettingsPayload,
}

/// `sendToPlugin` / `sendToPropertyInspector` messages.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct InspectorMessage {
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub context: String,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceEvent {
    pub device: String,
    #[serde(default)]
    pub device_info: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct InspectorVisibility {
    #[serde(default)]
    pub action: String,
    pub context: String,
    #[serde(default)]
    pub device: String,
}

/// Every inbound event this crate understands, tagged by the frame's `event`
/// field.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum InboundEvent {
    KeyDown(ActionEvent),
    KeyUp(ActionEvent),
    WillAppear(ActionEvent),
    WillDisappear(ActionEvent),
    DidReceiveSettings(ActionEvent),
    DidReceiveGlobalSettings(GlobalSettingsEvent),
    SendToPlugin(InspectorMessage),
    SendToPropertyInspector(InspectorMessage),
    DeviceDidConnect(DeviceEvent),
    DeviceDidDisconnect(DeviceEvent),
    PropertyInspectorDidAppear(InspectorVisibility),
    PropertyInspectorDidDisappear(InspectorVisibility),
}

/// A decoded inbound text frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Known(InboundEvent),
    /// Valid JSON with an `event` name this crate does not handle.
    Unrecognized(String),
}

impl InboundEvent {
    pub const NAMES: &'static [&'static str] = &[
        "keyDown",
        "keyUp",
        "willAppear",
        "willDisappear",
        "didReceiveSettings",
        "didReceiveGlobalSettings",
        "sendToPlugin",
        "sendToPropertyInspector",
        "deviceDidConnect",
        "deviceDidDisconnect",
        "propertyInspectorDidAppear",
        "propertyInspectorDidDisappear",
    ];

    pub fn decode(text: &str) -> Result<Frame, serde_json::Error> {
        let raw: Value = serde_json::from_str(text)?;
        let name = raw.get("event").and_then(Value::as_str).unwrap_or_default();
        if !Self::NAMES.contains(&name) {
            return Ok(Frame::Unrecognized(name.to_string()));
        }
        Ok(Frame::Known(serde_json::from_value(raw)?))
    }

    /// The button context this event concerns, if any.
    pub fn context(&self) -> Option<&str> {
        match self {
            Self::KeyDown(ev)
            | Self::KeyUp(ev)
            | Self::WillAppear(ev)
            | Self::WillDisappear(ev)
            | Self::DidReceiveSettings(ev) => Some(&ev.context),
            Self::SendToPlugin(msg) | Self::SendToPropertyInspector(msg) => Some(&msg.context),
            Self::PropertyInspectorDidAppear(ev) | Self::PropertyInspectorDidDisappear(ev) => {
                Some(&ev.context)
            }
            Self::DidReceiveGlobalSettings(_)
            | Self::DeviceDidConnect(_)
            | Self::DeviceDidDisconnect(_) => None,
        }
    }
}

/// Which renderings of a key a title or image applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Target {
    #[default]
    HardwareAndSoftware,
    Hardware,
    Software,
}

impl Serialize for Target {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(match self {
            Self::HardwareAndSoftware => 0,
            Self::Hardware => 1,
            Self::Software => 2,
        })
    }
}

/// `{event: registerEvent, uuid}`, sent once when the socket opens.
#[derive(Debug, Serialize)]
pub(crate) struct RegisterFrame<'a> {
    pub event: &'a str,
    pub uuid: &'a str,
}

/// An outgoing command frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Outbound {
    pub event: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl Outbound {
    fn new(event: &'static str) -> Self {
        Self {
            event,
            action: None,
            context: None,
            device: None,
            payload: None,
        }
    }

    fn context(mut self, context: &str) -> Self {
        self.context = Some(context.to_string());
        self
    }

    fn payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn set_settings(context: &str, settings: Value) -> Self {
        Self::new("setSettings").context(context).payload(settings)
    }

    pub fn get_settings(context: &str) -> Self {
        Self::new("getSettings").context(context)
    }

    pub fn set_global_settings(context: &str, settings: Value) -> Self {
        Self::new("setGlobalSettings").context(context).payload(settings)
    }

    pub fn get_global_settings(context: &str) -> Self {
        Self::new("getGlobalSettings").context(context)
    }

    pub fn open_url(url: &str) -> Self {
        Self::new("openUrl").payload(json!({ "url": url }))
    }

    pub fn log_message(message: &str) -> Self {
        Self::new("logMessage").payload(json!({ "message": message }))
    }

    pub fn set_title(context: &str, title: &str, target: Target) -> Self {
        Self::new("setTitle")
            .context(context)
            .payload(json!({ "title": title, "target": target }))
    }

    pub fn set_image(context: &str, image: &str, target: Target) -> Self {
        Self::new("setImage")
            .context(context)
            .payload(json!({ "image": image, "target": target }))
    }

    pub fn set_state(context: &str, state: u8) -> Self {
        Self::new("setState")
            .context(context)
            .payload(json!({ "state": state }))
    }

    pub fn show_alert(context: &str) -> Self {
        Self::new("showAlert").context(context)
    }

    pub fn show_ok(context: &str) -> Self {
        Self::new("showOk").context(context)
    }

    pub fn switch_to_profile(context: &str, device: &str, profile: &str) -> Self {
        let mut frame = Self::new("switchToProfile")
            .context(context)
            .payload(json!({ "profile": profile }));
        frame.device = Some(device.to_string());
        frame
    }

    pub fn send_to_property_inspector(action: &str, context: &str, payload: Value) -> Self {
        let mut frame = Self::new("sendToPropertyInspector")
            .context(context)
            .payload(payload);
        frame.action = Some(action.to_string());
        frame
    }

    pub fn send_to_plugin(action: &str, context: &str, payload: Value) -> Self {
        let mut frame = Self::new("sendToPlugin").context(context).payload(payload);
        frame.action = Some(action.to_string());
        frame
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn decodes_key_down() {
        let frame = InboundEvent::decode(
            r#"{"event":"keyDown","action":"io.hass.toggle","context":"ctx1","device":"dev1",
                "payload":{"settings":{"iconVariant":1},"coordinates":{"column":2,"row":0},
                           "isInMultiAction":false}}"#,
        )
        .unwrap();

        let Frame::Known(InboundEvent::KeyDown(event)) = frame else {
            panic!("expected keyDown, got {frame:?}");
        };
        assert_eq!(event.context, "ctx1");
        assert_eq!(event.device, "dev1");
        assert_eq!(event.payload.coordinates, Some(Coordinates { column: 2, row: 0 }));
        assert_eq!(event.payload.settings["iconVariant"], 1);
    }

    #[test]
    fn decodes_global_settings() {
        let frame = InboundEvent::decode(
            r#"{"event":"didReceiveGlobalSettings","payload":{"settings":{"haUrl":"ws://x"}}}"#,
        )
        .unwrap();
        let Frame::Known(InboundEvent::DidReceiveGlobalSettings(event)) = frame else {
            panic!("expected didReceiveGlobalSettings");
        };
        assert_eq!(event.payload.settings["haUrl"], "ws://x");
    }

    #[test]
    fn unknown_events_are_reported_not_rejected() {
        let frame = InboundEvent::decode(r#"{"event":"dialRotate","context":"c"}"#).unwrap();
        assert_eq!(frame, Frame::Unrecognized("dialRotate".into()));
        assert!(InboundEvent::decode("not json").is_err());
    }

    #[test]
    fn encodes_ui_commands() {
        let image = serde_json::to_value(Outbound::set_image(
            "ctx1",
            "data:image/png;base64,AA==",
            Target::HardwareAndSoftware,
        ))
        .unwrap();
        assert_eq!(
            image,
            json!({
                "event": "setImage",
                "context": "ctx1",
                "payload": {"image": "data:image/png;base64,AA==", "target": 0}
            })
        );

        let profile =
            serde_json::to_value(Outbound::switch_to_profile("plugin-uuid", "dev1", "P2")).unwrap();
        assert_eq!(
            profile,
            json!({
                "event": "switchToProfile",
                "context": "plugin-uuid",
                "device": "dev1",
                "payload": {"profile": "P2"}
            })
        );

        let alert = serde_json::to_value(Outbound::show_alert("ctx9")).unwrap();
        assert_eq!(alert, json!({"event": "showAlert", "context": "ctx9"}));
    }
}

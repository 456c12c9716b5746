//! JSON frames exchanged with the hub's WebSocket API.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// `{type: "auth", access_token}`; the only frame sent without an id.
#[derive(Debug, Serialize)]
pub(crate) struct AuthFrame<'a> {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub access_token: &'a str,
}

impl<'a> AuthFrame<'a> {
    pub fn new(access_token: &'a str) -> Self {
        Self {
            kind: "auth",
            access_token,
        }
    }
}

/// A command frame: `{id, type, ...fields}`.
#[derive(Debug, Serialize)]
pub(crate) struct CommandFrame<'a> {
    pub id: u64,
    #[serde(flatten)]
    pub command: &'a Command,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum Command {
    GetStates,
    GetServices,
    SubscribeEvents {
        event_type: String,
    },
    CallService {
        domain: String,
        service: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        service_data: Option<Value>,
    },
}

/// Frames the hub sends to the client.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum HubMessage {
    AuthRequired {
        #[serde(default)]
        ha_version: Option<String>,
    },
    AuthOk {
        #[serde(default)]
        ha_version: Option<String>,
    },
    AuthInvalid {
        #[serde(default)]
        message: Option<String>,
    },
    AuthFailed {
        #[serde(default)]
        message: Option<String>,
    },
    Result {
        id: u64,
        #[serde(default = "default_success")]
        success: bool,
        #[serde(default)]
        result: Value,
        #[serde(default)]
        error: Option<ErrorBody>,
    },
    Event {
        id: u64,
        #[serde(default)]
        event: Value,
    },
    #[serde(other)]
    Unknown,
}

fn default_success() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ErrorBody {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub message: String,
}

//! Launch arguments and configuration for the plugin executable.

use std::{
    ffi::OsString,
    path::{Path, PathBuf},
    time::Duration,
};

use clap::Parser;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer};
use serde_json::Value;

use crate::{
    error::{Error, Result},
    hass::{HubConfig, DEFAULT_RECONNECT_DELAY},
    icons::{DEFAULT_BACKGROUND, DEFAULT_ICON_SIZE},
    streamdeck::{session::DEFAULT_LONG_PRESS, HostRegistration},
};

/// Environment variable that overrides the token from the config file.
pub const TOKEN_ENV: &str = "HASS_API_TOKEN";

/// Arguments the Stream Deck application launches the plugin with.
///
/// The application uses single-dash long flags (`-port 28196`); pass the raw
/// arguments through [`LaunchArgs::parse_host_args`] to accept them.
#[derive(Debug, Parser)]
#[command(name = "streamdeck-hass-plugin", version, about)]
pub struct LaunchArgs {
    /// Local port of the Stream Deck application
    #[arg(long)]
    pub port: u16,

    /// Identifier of this plugin instance
    #[arg(long = "pluginUUID")]
    pub plugin_uuid: String,

    /// Event name to register with
    #[arg(long = "registerEvent")]
    pub register_event: String,

    /// Application and device information, as JSON
    #[arg(long, default_value = "{}")]
    pub info: String,

    /// Optional YAML configuration file
    #[arg(long, env = "HASS_DECK_CONFIG")]
    pub config: Option<PathBuf>,
}

impl LaunchArgs {
    pub fn parse_host_args<I, T>(args: I) -> std::result::Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString>,
    {
        Self::try_parse_from(normalize_flags(args))
    }

    pub fn registration(&self) -> Result<HostRegistration> {
        Ok(HostRegistration {
            port: self.port,
            uuid: self.plugin_uuid.clone(),
            register_event: self.register_event.clone(),
            info: serde_json::from_str(&self.info)?,
            action_info: Value::Object(Default::default()),
        })
    }
}

/// Rewrites `-name` into `--name`. Short flags, negative numbers and values
/// are left alone.
pub fn normalize_flags<I, T>(args: I) -> Vec<OsString>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString>,
{
    args.into_iter()
        .map(Into::into)
        .map(|arg| match arg.to_str() {
            Some(flag)
                if flag.len() > 2
                    && flag.starts_with('-')
                    && !flag.starts_with("--")
                    && flag[1..].starts_with(|c: char| c.is_ascii_alphabetic()) =>
            {
                OsString::from(format!("-{flag}"))
            }
            _ => arg,
        })
        .collect()
}

/// Optional file configuration.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "snake_case", default)]
pub struct PluginConfig {
    /// WebSocket URL of the hub (e.g., "ws://192.168.0.1:8123/api/websocket")
    pub url: Option<String>,
    /// Long-lived access token; `HASS_API_TOKEN` overrides it
    #[serde(deserialize_with = "secret")]
    pub token: Option<SecretString>,
    /// Seconds to wait before reconnecting a dropped hub session
    pub reconnect_delay_secs: u64,
    /// How long a key must be held to count as a long press
    pub long_press_ms: u64,
    /// Width and height of rendered button icons, in pixels
    pub icon_size: u32,
    /// Icon background colour (e.g., "#0a1423")
    pub background: String,
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            url: None,
            token: None,
            reconnect_delay_secs: DEFAULT_RECONNECT_DELAY.as_secs(),
            long_press_ms: DEFAULT_LONG_PRESS.as_millis() as u64,
            icon_size: DEFAULT_ICON_SIZE,
            background: DEFAULT_BACKGROUND.to_string(),
        }
    }
}

fn secret<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Option<SecretString>, D::Error> {
    Ok(Option::<String>::deserialize(deserializer)?.map(SecretString::from))
}

impl PluginConfig {
    /// Replaces the token when `token` is set and not empty.
    pub fn with_token_override(mut self, token: Option<String>) -> Self {
        if let Some(token) = token.filter(|t| !t.is_empty()) {
            self.token = Some(SecretString::from(token));
        }
        self
    }

    /// [`reconnect_delay_secs`](Self::reconnect_delay_secs) as a duration.
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    /// [`long_press_ms`](Self::long_press_ms) as a duration.
    pub fn long_press(&self) -> Duration {
        Duration::from_millis(self.long_press_ms)
    }

    /// Builds the hub connection from the plugin's global settings (`haUrl`,
    /// `haToken`), falling back to this file for anything they lack.
    pub fn hub_config(&self, global: &Value) -> Result<HubConfig> {
        let from_global = |key: &str| {
            global
                .get(key)
                .and_then(Value::as_str)
                .filter(|value| !value.is_empty())
        };

        let url = from_global("haUrl")
            .or(self.url.as_deref())
            .ok_or_else(|| Error::Config("no Home Assistant URL configured".into()))?;
        let token = match from_global("haToken") {
            Some(token) => token.to_string(),
            None => self
                .token
                .as_ref()
                .map(|token| token.expose_secret().to_string())
                .ok_or_else(|| Error::Config("no Home Assistant token configured".into()))?,
        };
        Ok(HubConfig::new(url, token)?.with_reconnect_delay(self.reconnect_delay()))
    }
}

/// Loads a configuration from a YAML file.
///
/// # Arguments
///
/// * `path` - Path to the YAML configuration file
///
/// # Returns
///
/// The parsed configuration, or `Error::Io` / `Error::Yaml`
///
/// # Example
///
/// ```no_run
/// use streamdeck_hass_plugin::config;
///
/// let config = config::load_config("hass-deck.yaml").expect("Failed to load config");
/// println!("Long press after {:?}", config.long_press());
/// ```
pub fn load_config(path: impl AsRef<Path>) -> Result<PluginConfig> {
    let file = std::fs::File::open(path.as_ref())?;
    let reader = std::io::BufReader::new(file);
    let config: PluginConfig = serde_yaml::from_reader(reader)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    fn host_args() -> Vec<&'static str> {
        vec![
            "streamdeck-hass-plugin",
            "-port",
            "28196",
            "-pluginUUID",
            "6C1A8B",
            "-registerEvent",
            "registerPlugin",
            "-info",
            r#"{"devices":[{"id":"dev1"}]}"#,
        ]
    }

    #[test]
    fn accepts_single_dash_flags() {
        let args = LaunchArgs::parse_host_args(host_args()).unwrap();
        assert_eq!(args.port, 28196);
        assert_eq!(args.plugin_uuid, "6C1A8B");

        let registration = args.registration().unwrap();
        assert_eq!(registration.register_event, "registerPlugin");
        assert_eq!(registration.info["devices"][0]["id"], "dev1");
    }

    #[test]
    fn normalization_leaves_values_alone() {
        let args = normalize_flags(["bin", "-x", "-port", "--config", "-1", "{}"]);
        assert_eq!(args, vec!["bin", "-x", "--port", "--config", "-1", "{}"]);
    }

    #[test]
    fn bad_info_is_a_json_error() {
        let mut args = host_args();
        args[8] = "{nope";
        let args = LaunchArgs::parse_host_args(args).unwrap();
        assert!(matches!(args.registration(), Err(Error::Json(_))));
    }

    #[test]
    fn parses_yaml_with_defaults() {
        let config: PluginConfig = serde_yaml::from_str(
            "url: ws://hub.local:8123/api/websocket\ntoken: abc\nlong_press_ms: 450\n",
        )
        .unwrap();
        assert_eq!(config.long_press(), Duration::from_millis(450));
        assert_eq!(config.reconnect_delay(), Duration::from_secs(5));
        assert_eq!(config.icon_size, 128);
        assert_eq!(config.token.unwrap().expose_secret(), "abc");
    }

    #[test]
    fn rejects_unknown_keys() {
        assert!(serde_yaml::from_str::<PluginConfig>("menu: []\n").is_err());
    }

    #[test]
    fn global_settings_win_over_the_file() {
        let file = PluginConfig {
            url: Some("ws://file:8123/api/websocket".into()),
            token: Some(SecretString::from("file-token".to_string())),
            ..PluginConfig::default()
        };

        let hub = file
            .hub_config(&json!({"haUrl": "ws://global:8123/api/websocket", "haToken": ""}))
            .unwrap();
        assert_eq!(hub.url.as_str(), "ws://global:8123/api/websocket");
        assert_eq!(hub.token.expose_secret(), "file-token");

        let file = file.with_token_override(Some("env-token".into()));
        let hub = file.hub_config(&json!({})).unwrap();
        assert_eq!(hub.url.host_str(), Some("file"));
        assert_eq!(hub.token.expose_secret(), "env-token");
    }

    #[test]
    fn missing_hub_settings_are_config_errors() {
        let empty = PluginConfig::default();
        assert!(matches!(empty.hub_config(&json!({})), Err(Error::Config(_))));
        assert!(matches!(
            empty.hub_config(&json!({"haUrl": "ws://hub/api/websocket"})),
            Err(Error::Config(_))
        ));
    }
}

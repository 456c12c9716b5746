//! # Stream Deck Home Assistant Plugin
//!
//! This library drives a Stream Deck plugin that controls Home Assistant
//! entities from Stream Deck buttons.
//!
//! ## Features
//!
//! - Plugin and property inspector sessions on the Stream Deck application socket
//! - Home Assistant WebSocket session with authentication and automatic reconnection
//! - Short and long key presses
//! - Light and switch icons that follow entity state
//! - Shared variables published by a profile switch

pub mod config;
pub mod emitter;
pub mod error;
pub mod hass;
pub mod icons;
pub mod plugins;
pub mod settings;
pub mod streamdeck;
mod sync;

// Re-export main types for convenience
pub use config::{LaunchArgs, PluginConfig};
pub use emitter::{EventEmitter, Subscription, Topic};
pub use error::{Error, Result};
pub use hass::{HubClient, HubConfig};
pub use icons::{IconRenderer, SvgIconRenderer};
pub use plugins::HomeAssistantPlugin;
pub use streamdeck::{DeviceHost, InspectorSession, PluginSession};

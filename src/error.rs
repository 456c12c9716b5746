//! Error types shared by the hub client, the device host client and the plugin.

use thiserror::Error;

/// Everything that can go wrong while talking to the hub or the device host.
#[derive(Debug, Error)]
pub enum Error {
    /// Opening or driving a WebSocket failed.
    #[error("WebSocket connection failed: {0}")]
    WebSocketConnect(String),

    /// A command was issued while the socket is not ready for it.
    #[error("Not connected")]
    NotConnected,

    /// The hub rejected the access token.
    #[error("Authentication failed: {message}")]
    Authentication { message: String },

    /// The hub answered a command with `success: false`.
    #[error("Command failed ({code}): {message}")]
    CommandFailed { code: String, message: String },

    /// The connection ended before a reply arrived.
    #[error("Request abandoned: connection closed before a reply arrived")]
    RequestAbandoned,

    /// HTTP transport error while using the REST API.
    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Missing or inconsistent configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The icon renderer could not produce an image.
    #[error("Render error: {0}")]
    Render(String),
}

impl Error {
    /// Returns `true` for failures a reconnect may cure.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::WebSocketConnect(_) | Self::NotConnected | Self::RequestAbandoned => true,
            Self::Transport(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_errors_are_transient() {
        assert!(Error::WebSocketConnect("refused".into()).is_transient());
        assert!(Error::RequestAbandoned.is_transient());
        assert!(!Error::Authentication {
            message: "bad token".into()
        }
        .is_transient());
        assert!(!Error::Config("missing url".into()).is_transient());
    }
}

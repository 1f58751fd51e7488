use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Result type for Plex bridge operations
pub type Result<T> = std::result::Result<T, PlexError>;

/// Errors that can occur when talking to Plex
///
/// The enum is `Clone` so that a single settled operation can hand the same
/// outcome to every caller that joined it.
#[derive(Error, Debug, Clone)]
pub enum PlexError {
    /// No account token was supplied
    #[error("No Plex token provided")]
    MissingCredential,

    /// The token was rejected (expired or revoked)
    #[error("Authentication rejected: {0}")]
    Auth(String),

    /// No reachable endpoint for the server
    #[error("Server unavailable: {0}")]
    ServerUnavailable(String),

    /// The session is not in the current session list
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// Request timed out
    #[error("Plex timeout after {elapsed:?}")]
    Timeout {
        /// Time spent before the request was abandoned
        elapsed: Duration,
    },

    /// Low-level HTTP transport failure (connection refused, reset, ...)
    #[error("HTTP error: {0}")]
    Http(#[source] Arc<reqwest::Error>),

    /// WebSocket connection error
    #[error("WebSocket error: {0}")]
    WebSocket(#[source] Arc<tokio_tungstenite::tungstenite::Error>),

    /// Unexpected or unparseable server payload
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Server returned a clean error response
    #[error("API error ({status}): {detail}")]
    Api {
        /// HTTP status code
        status: u16,
        /// Error detail from the body, or the status text
        detail: String,
    },

    /// Connection was closed
    #[error("Connection closed")]
    ConnectionClosed,

    /// Channel receive error
    #[error("Channel error: {0}")]
    ChannelError(String),

    /// PIN was not approved in time
    #[error("Timeout receiving Plex token")]
    PinTimeout,

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),
}

impl PlexError {
    /// Whether this failure happened below HTTP (no clean response was received)
    ///
    /// These failures invalidate the currently resolved endpoint.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            PlexError::Timeout { .. } | PlexError::Http(_) | PlexError::WebSocket(_)
        )
    }
}

impl From<reqwest::Error> for PlexError {
    fn from(err: reqwest::Error) -> Self {
        PlexError::Http(Arc::new(err))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for PlexError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        PlexError::WebSocket(Arc::new(err))
    }
}

impl From<serde_json::Error> for PlexError {
    fn from(err: serde_json::Error) -> Self {
        PlexError::Protocol(format!("JSON: {}", err))
    }
}

impl From<quick_xml::DeError> for PlexError {
    fn from(err: quick_xml::DeError) -> Self {
        PlexError::Protocol(format!("XML: {}", err))
    }
}

impl From<url::ParseError> for PlexError {
    fn from(err: url::ParseError) -> Self {
        PlexError::Protocol(format!("URL: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_classification() {
        assert!(PlexError::Timeout { elapsed: Duration::from_secs(5) }.is_transport());
        assert!(!PlexError::SessionNotFound("1".into()).is_transport());
        assert!(!PlexError::Api { status: 500, detail: "boom".into() }.is_transport());
        assert!(!PlexError::Auth("nope".into()).is_transport());
    }

    #[test]
    fn timeout_message_carries_elapsed() {
        let err = PlexError::Timeout { elapsed: Duration::from_millis(1500) };
        assert_eq!(err.to_string(), "Plex timeout after 1.5s");
    }
}

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use uuid::Uuid;

/// Session identifier as reported by the server
pub type SessionKey = String;

/// Library section key
pub type SectionKey = String;

/// Identifier this client presents to Plex as `X-Plex-Client-Identifier`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientIdentifier(pub String);

impl ClientIdentifier {
    /// Generate a fresh random identifier
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Account token plus the client identifier it was issued to
#[derive(Clone, Serialize, Deserialize)]
pub struct Credential {
    pub account_token: String,
    pub client_identifier: ClientIdentifier,
}

impl Credential {
    pub fn new(account_token: impl Into<String>, client_identifier: ClientIdentifier) -> Self {
        Self {
            account_token: account_token.into(),
            client_identifier,
        }
    }
}

// Keep the token out of logs
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("account_token", &"<redacted>")
            .field("client_identifier", &self.client_identifier)
            .finish()
    }
}

/// Stable identity of one Plex Media Server
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServerIdentity {
    pub machine_identifier: String,
}

impl ServerIdentity {
    pub fn new(machine_identifier: impl Into<String>) -> Self {
        Self {
            machine_identifier: machine_identifier.into(),
        }
    }
}

/// A concrete network address for a server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub scheme: String,
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(scheme: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme: scheme.into(),
            host: host.into(),
            port,
        }
    }

    /// `scheme://host:port` with no trailing slash
    pub fn base_url(&self) -> String {
        format!("{}://{}:{}", self.scheme, self.host, self.port)
    }

    /// Scheme for the notification websocket on this endpoint
    pub fn websocket_scheme(&self) -> &'static str {
        if self.scheme.eq_ignore_ascii_case("https") {
            "wss"
        } else {
            "ws"
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.base_url())
    }
}

/// A server listed on the account, as shown when pairing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerSummary {
    pub name: String,
    pub machine_identifier: String,
    pub access_token: Option<String>,
}

/// A PIN issued by the account API
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pin {
    pub id: u64,
    pub code: String,
}

/// Playback state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackState {
    Playing,
    Paused,
    Stopped,
    Buffering,
    #[serde(other)]
    Unknown,
}

/// One active playback on one player
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Session {
    pub session_key: SessionKey,
    pub player_title: Option<String>,
    pub media_title: Option<String>,
    pub user_title: Option<String>,
    pub state: Option<PlaybackState>,
}

/// An item from the "recently added" listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LibraryItem {
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub parent_title: Option<String>,
    #[serde(default)]
    pub grandparent_title: Option<String>,
    #[serde(default)]
    pub added_at: i64,
}

impl LibraryItem {
    /// Title joined across the hierarchy ("Show - Season - Episode")
    pub fn display_title(&self) -> Option<String> {
        display_title(
            self.grandparent_title.as_deref(),
            self.parent_title.as_deref(),
            self.title.as_deref(),
        )
    }
}

/// A library section (Movies, TV Shows, ...)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LibrarySection {
    #[serde(deserialize_with = "string_or_number")]
    pub key: SectionKey,
    pub title: String,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
}

/// Host-visible availability of the server pairing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Availability {
    /// Not yet determined
    Unknown,
    Available,
    /// Last connect or poll failed with this reason
    Unavailable(String),
}

/// Join grandparent, parent and own title with " - ", skipping absent levels
pub fn display_title(
    grandparent: Option<&str>,
    parent: Option<&str>,
    title: Option<&str>,
) -> Option<String> {
    let parts: Vec<&str> = [grandparent, parent, title]
        .into_iter()
        .flatten()
        .filter(|part| !part.is_empty())
        .collect();

    if parts.is_empty() {
        None
    } else {
        Some(parts.join(" - "))
    }
}

/// Plex reports some identifiers as strings in one payload and numbers in another
pub(crate) fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(i64),
    }

    Ok(match Raw::deserialize(deserializer)? {
        Raw::Text(text) => text,
        Raw::Number(number) => number.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_title_skips_missing_levels() {
        assert_eq!(
            display_title(Some("Show"), Some("Season 1"), Some("Pilot")).as_deref(),
            Some("Show - Season 1 - Pilot")
        );
        assert_eq!(
            display_title(None, Some("Album"), Some("Track")).as_deref(),
            Some("Album - Track")
        );
        assert_eq!(display_title(None, None, Some("Movie")).as_deref(), Some("Movie"));
        assert_eq!(display_title(None, None, None), None);
    }

    #[test]
    fn endpoint_urls() {
        let endpoint = Endpoint::new("https", "10-0-0-2.abc.plex.direct", 32400);
        assert_eq!(endpoint.base_url(), "https://10-0-0-2.abc.plex.direct:32400");
        assert_eq!(endpoint.websocket_scheme(), "wss");
        assert_eq!(Endpoint::new("http", "10.0.0.2", 32400).websocket_scheme(), "ws");
    }

    #[test]
    fn section_key_accepts_numbers() {
        let section: LibrarySection =
            serde_json::from_str(r#"{"key": 3, "title": "Movies", "type": "movie"}"#).unwrap();
        assert_eq!(section.key, "3");
        assert_eq!(section.kind.as_deref(), Some("movie"));
    }

    #[test]
    fn unknown_playback_state() {
        let state: PlaybackState = serde_json::from_str("\"rewinding\"").unwrap();
        assert_eq!(state, PlaybackState::Unknown);
    }

    #[test]
    fn credential_debug_hides_token() {
        let credential = Credential::new("secret", ClientIdentifier("id".into()));
        assert!(!format!("{:?}", credential).contains("secret"));
    }
}

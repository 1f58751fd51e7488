use crate::error::Result;
use crate::types::{display_title, string_or_number, PlaybackState, Session, SessionKey};
use serde::Deserialize;
use serde_json::Value;

/// Timeline identifier for library scanner activity
pub const LIBRARY_IDENTIFIER: &str = "com.plexapp.plugins.library";

/// Timeline state meaning the item finished processing
pub const TIMELINE_STATE_PROCESSED: i64 = 5;

/// HTTP response envelope: `{"MediaContainer": {...}}`
#[derive(Debug, Deserialize)]
pub(crate) struct Envelope<T> {
    #[serde(rename = "MediaContainer")]
    pub media_container: MediaContainer<T>,
}

/// Container with a type-specific child array; a missing array means empty
#[derive(Debug, Deserialize)]
pub(crate) struct MediaContainer<T> {
    #[serde(rename = "Metadata")]
    pub metadata: Option<Vec<T>>,
    #[serde(rename = "Directory")]
    pub directory: Option<Vec<T>>,
}

impl<T> Envelope<T> {
    pub fn metadata(self) -> Vec<T> {
        self.media_container.metadata.unwrap_or_default()
    }

    pub fn directory(self) -> Vec<T> {
        self.media_container.directory.unwrap_or_default()
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct Titled {
    pub title: Option<String>,
}

/// Session entry from `/status/sessions`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SessionMetadata {
    #[serde(deserialize_with = "string_or_number")]
    pub session_key: SessionKey,
    pub title: Option<String>,
    pub parent_title: Option<String>,
    pub grandparent_title: Option<String>,
    #[serde(rename = "Player")]
    pub player: Option<PlayerInfo>,
    #[serde(rename = "User")]
    pub user: Option<Titled>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct PlayerInfo {
    pub title: Option<String>,
    pub state: Option<PlaybackState>,
}

impl From<SessionMetadata> for Session {
    fn from(raw: SessionMetadata) -> Self {
        let media_title = display_title(
            raw.grandparent_title.as_deref(),
            raw.parent_title.as_deref(),
            raw.title.as_deref(),
        );
        let (player_title, state) = match raw.player {
            Some(player) => (player.title, player.state),
            None => (None, None),
        };

        Session {
            session_key: raw.session_key,
            player_title,
            media_title,
            user_title: raw.user.and_then(|u| u.title),
            state,
        }
    }
}

/// Body of the account `resources` listing (XML)
#[derive(Debug, Deserialize)]
pub(crate) struct ResourceContainer {
    #[serde(rename = "Device", default)]
    pub devices: Vec<ResourceDevice>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ResourceDevice {
    #[serde(rename = "@name", default)]
    pub name: String,
    #[serde(rename = "@product", default)]
    pub product: String,
    #[serde(rename = "@provides", default)]
    pub provides: String,
    #[serde(rename = "@clientIdentifier", default)]
    pub client_identifier: String,
    #[serde(rename = "@accessToken")]
    pub access_token: Option<String>,
    #[serde(rename = "Connection", default)]
    pub connections: Vec<ResourceConnection>,
}

impl ResourceDevice {
    pub fn is_media_server(&self) -> bool {
        self.product == "Plex Media Server" || self.provides.split(',').any(|p| p == "server")
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct ResourceConnection {
    #[serde(rename = "@protocol", default)]
    pub protocol: String,
    #[serde(rename = "@address", default)]
    pub address: String,
    #[serde(rename = "@port", default)]
    pub port: u16,
    #[serde(rename = "@uri")]
    pub uri: Option<String>,
}

pub(crate) fn parse_resources(xml: &str) -> Result<ResourceContainer> {
    Ok(quick_xml::de::from_str(xml)?)
}

/// PIN payloads from the account API
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PinResponse {
    pub id: u64,
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub auth_token: Option<String>,
}

/// Error body returned alongside a failing status
#[derive(Debug, Deserialize)]
pub(crate) struct ErrorBody {
    pub error: Option<String>,
}

/// A classified notification from the websocket
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationEvent {
    /// Playback state changed on a session
    Playing {
        session_key: SessionKey,
        state: PlaybackState,
    },
    /// Library timeline activity
    TimelineEntry {
        identifier: String,
        state: Option<i64>,
        title: Option<String>,
    },
}

impl NotificationEvent {
    /// Whether this entry announces a finished library scan of a titled item
    pub fn processed_library_title(&self) -> Option<&str> {
        match self {
            NotificationEvent::TimelineEntry {
                identifier,
                state: Some(TIMELINE_STATE_PROCESSED),
                title: Some(title),
            } if identifier == LIBRARY_IDENTIFIER => Some(title),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct NotificationContainer {
    #[serde(rename = "type")]
    kind: String,
    #[serde(rename = "PlaySessionStateNotification", default)]
    playing: Vec<PlaySessionState>,
    #[serde(rename = "TimelineEntry", default)]
    timeline: Vec<TimelineWire>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlaySessionState {
    #[serde(deserialize_with = "string_or_number")]
    session_key: SessionKey,
    state: PlaybackState,
}

#[derive(Debug, Deserialize)]
struct TimelineWire {
    #[serde(default)]
    identifier: String,
    state: Option<i64>,
    title: Option<String>,
}

/// Decode one websocket text frame
///
/// Frames without a `NotificationContainer` and unknown notification types
/// decode to nothing. Unparseable JSON is a protocol error.
pub fn decode_frame(text: &str) -> Result<Vec<NotificationEvent>> {
    let mut frame: Value = serde_json::from_str(text)?;

    let Some(container) = frame.get_mut("NotificationContainer").map(Value::take) else {
        return Ok(Vec::new());
    };
    let container: NotificationContainer = serde_json::from_value(container)?;

    let events = match container.kind.as_str() {
        "playing" => container
            .playing
            .into_iter()
            .take(1)
            .map(|record| NotificationEvent::Playing {
                session_key: record.session_key,
                state: record.state,
            })
            .collect(),
        "timeline" => container
            .timeline
            .into_iter()
            .map(|entry| NotificationEvent::TimelineEntry {
                identifier: entry.identifier,
                state: entry.state,
                title: entry.title,
            })
            .collect(),
        _ => Vec::new(),
    };

    Ok(events)
}

use crate::error::{PlexError, Result};
use crate::types::{PlaybackState, Session};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

/// Details carried by player events
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackEvent {
    pub player_title: Option<String>,
    pub media_title: Option<String>,
    pub user_title: Option<String>,
}

impl From<&Session> for PlaybackEvent {
    fn from(session: &Session) -> Self {
        Self {
            player_title: session.player_title.clone(),
            media_title: session.media_title.clone(),
            user_title: session.user_title.clone(),
        }
    }
}

/// Outward event delivered to the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlexEvent {
    PlayerStart(PlaybackEvent),
    PlayerPause(PlaybackEvent),
    PlayerStop(PlaybackEvent),
    RecentlyAdded { title: String },
}

impl PlexEvent {
    /// Build the player event for a playback state, if it has one
    pub fn for_playback(state: PlaybackState, session: &Session) -> Option<Self> {
        let details = PlaybackEvent::from(session);
        match state {
            PlaybackState::Playing => Some(PlexEvent::PlayerStart(details)),
            PlaybackState::Paused => Some(PlexEvent::PlayerPause(details)),
            PlaybackState::Stopped => Some(PlexEvent::PlayerStop(details)),
            PlaybackState::Buffering | PlaybackState::Unknown => None,
        }
    }

    /// Host event name
    pub fn name(&self) -> &'static str {
        match self {
            PlexEvent::PlayerStart(_) => "player_start",
            PlexEvent::PlayerPause(_) => "player_pause",
            PlexEvent::PlayerStop(_) => "player_stop",
            PlexEvent::RecentlyAdded { .. } => "recently_added",
        }
    }

    /// Host event payload
    pub fn payload(&self) -> Value {
        match self {
            PlexEvent::PlayerStart(details)
            | PlexEvent::PlayerPause(details)
            | PlexEvent::PlayerStop(details) => {
                serde_json::to_value(details).unwrap_or(Value::Null)
            }
            PlexEvent::RecentlyAdded { title } => serde_json::json!({ "title": title }),
        }
    }
}

/// Host-side consumer of named events
///
/// Emission is fire-and-forget; the bridge never waits for acknowledgement.
pub trait EventSink: Send + Sync {
    fn emit(&self, name: &str, payload: Value);
}

/// One subscriber's view of the outward event stream
///
/// Each receiver sees every event emitted after it subscribed. A receiver
/// that falls more than `event_capacity` events behind loses the oldest ones
/// and is told how many through `ChannelError`.
pub struct EventReceiver {
    rx: broadcast::Receiver<PlexEvent>,
}

impl EventReceiver {
    pub(crate) fn new(rx: broadcast::Receiver<PlexEvent>) -> Self {
        Self { rx }
    }

    /// Wait for the next player or library event
    ///
    /// `ConnectionClosed` means the bridge (and with it the notification
    /// stream and poll loop) was dropped, so no more events can arrive.
    pub async fn recv(&mut self) -> Result<PlexEvent> {
        self.rx.recv().await.map_err(|e| match e {
            broadcast::error::RecvError::Closed => PlexError::ConnectionClosed,
            broadcast::error::RecvError::Lagged(n) => {
                PlexError::ChannelError(format!("Lagged by {} messages", n))
            }
        })
    }

    /// Take an already queued event, if any
    pub fn try_recv(&mut self) -> Result<Option<PlexEvent>> {
        match self.rx.try_recv() {
            Ok(event) => Ok(Some(event)),
            Err(broadcast::error::TryRecvError::Empty) => Ok(None),
            Err(broadcast::error::TryRecvError::Closed) => Err(PlexError::ConnectionClosed),
            Err(broadcast::error::TryRecvError::Lagged(n)) => {
                Err(PlexError::ChannelError(format!("Lagged by {} messages", n)))
            }
        }
    }
}

use crate::client::PlexClient;
use crate::config::BridgeConfig;
use crate::error::Result;
use crate::notifications::NotificationStream;
use crate::poller::{PollLoop, WatermarkStore};
use crate::subscription::{EventReceiver, EventSink, PlexEvent};
use crate::types::{Availability, Credential, LibraryItem, LibrarySection, ServerIdentity, Session};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

/// Capability surface for one paired Plex server
///
/// The host glue calls these methods and consumes events through
/// [`subscribe`](PlexBridge::subscribe) or [`spawn_sink`](PlexBridge::spawn_sink).
/// Nothing here depends on the host's device lifecycle.
///
/// # Example
///
/// ```no_run
/// use plex_bridge::{BridgeConfig, ClientIdentifier, Credential, MemoryWatermarkStore, PlexBridge, ServerIdentity};
/// use std::sync::Arc;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let credential = Credential::new("token", ClientIdentifier::generate());
///     let mut bridge = PlexBridge::new(
///         BridgeConfig::default(),
///         credential,
///         ServerIdentity::new("machine-identifier"),
///         Arc::new(MemoryWatermarkStore::default()),
///     )?;
///
///     let mut events = bridge.subscribe();
///     bridge.start().await;
///
///     while let Ok(event) = events.recv().await {
///         println!("{}: {}", event.name(), event.payload());
///     }
///
///     bridge.stop().await;
///     Ok(())
/// }
/// ```
pub struct PlexBridge {
    client: Arc<PlexClient>,
    stream: Arc<NotificationStream>,
    poller: PollLoop,
    events: broadcast::Sender<PlexEvent>,
    availability: Arc<watch::Sender<Availability>>,
}

impl PlexBridge {
    pub fn new(
        config: BridgeConfig,
        credential: Credential,
        server: ServerIdentity,
        store: Arc<dyn WatermarkStore>,
    ) -> Result<Self> {
        let config = Arc::new(config);
        let (events, _) = broadcast::channel(config.event_capacity);
        let (availability, _) = watch::channel(Availability::Unknown);
        let availability = Arc::new(availability);

        let client = Arc::new(PlexClient::new(config.clone(), credential, server)?);
        let stream = Arc::new(NotificationStream::with_channels(
            client.clone(),
            config.clone(),
            events.clone(),
            availability.clone(),
        ));
        let poller = PollLoop::new(
            client.clone(),
            stream.clone(),
            config,
            store,
            events.clone(),
            availability.clone(),
        );

        Ok(Self {
            client,
            stream,
            poller,
            events,
            availability,
        })
    }

    pub fn client(&self) -> &PlexClient {
        &self.client
    }

    pub fn stream(&self) -> &NotificationStream {
        &self.stream
    }

    pub fn poller(&self) -> &PollLoop {
        &self.poller
    }

    /// Start polling; the first tick also opens the notification stream
    pub async fn start(&mut self) {
        tracing::info!(
            "Starting bridge for {}",
            self.client.locator().server().machine_identifier
        );
        self.poller.start().await;
    }

    /// Stop polling and close the notification stream
    pub async fn stop(&mut self) {
        self.poller.stop().await;
        self.stream.disconnect().await;
    }

    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver::new(self.events.subscribe())
    }

    /// Forward every event to a host sink until the bridge is dropped
    pub fn spawn_sink(&self, sink: Arc<dyn EventSink>) -> JoinHandle<()> {
        let mut events = self.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => sink.emit(event.name(), event.payload()),
                    Err(crate::PlexError::ConnectionClosed) => break,
                    Err(e) => tracing::warn!("Event sink fell behind: {}", e),
                }
            }
        })
    }

    pub fn availability(&self) -> watch::Receiver<Availability> {
        self.availability.subscribe()
    }

    pub fn active_session(&self) -> Option<Session> {
        self.poller.active_session()
    }

    pub async fn rescan_library(&self, key: &str) -> Result<()> {
        self.client.rescan_library(key).await
    }

    pub async fn refresh_library(&self, key: &str) -> Result<()> {
        self.client.refresh_library(key).await
    }

    pub async fn library_sections(&self) -> Result<Vec<LibrarySection>> {
        self.client.library_sections().await
    }

    pub async fn recently_added(&self) -> Result<Vec<LibraryItem>> {
        self.client.recently_added().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::poller::{MemoryWatermarkStore, Watermark};
    use crate::types::ClientIdentifier;
    use std::sync::Mutex;
    use std::time::Duration;

    struct Recorder(Mutex<Vec<(String, serde_json::Value)>>);

    impl EventSink for Recorder {
        fn emit(&self, name: &str, payload: serde_json::Value) {
            self.0.lock().unwrap().push((name.to_string(), payload));
        }
    }

    fn bridge(account: &str, store: Arc<MemoryWatermarkStore>) -> PlexBridge {
        let config = BridgeConfig {
            account_base_url: account.to_string(),
            ..BridgeConfig::default()
        };
        PlexBridge::new(
            config,
            Credential::new("token", ClientIdentifier("c".into())),
            ServerIdentity::new("m"),
            store,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn sink_receives_named_events() {
        let bridge = bridge("http://127.0.0.1:9", Arc::new(MemoryWatermarkStore::default()));
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let _handle = bridge.spawn_sink(recorder.clone());

        bridge
            .events
            .send(PlexEvent::RecentlyAdded { title: "Heat".into() })
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let seen = recorder.0.lock().unwrap().clone();
        assert_eq!(seen, vec![("recently_added".to_string(), serde_json::json!({"title": "Heat"}))]);
    }

    #[tokio::test]
    async fn failed_tick_marks_unavailable() {
        let store = Arc::new(MemoryWatermarkStore::new(Some(10)));
        let bridge = bridge("http://127.0.0.1:9", store);
        let availability = bridge.availability();

        assert!(bridge.poller().tick().await.is_err());
        assert!(matches!(&*availability.borrow(), Availability::Unavailable(_)));
        assert_eq!(bridge.poller().watermark().await, Watermark::At(10));
    }

    #[tokio::test]
    async fn stop_before_start_is_safe() {
        let mut bridge = bridge("http://127.0.0.1:9", Arc::new(MemoryWatermarkStore::default()));
        bridge.stop().await;
        assert!(!bridge.stream().is_running());
    }
}

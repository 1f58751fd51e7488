use crate::client::PlexClient;
use crate::config::BridgeConfig;
use crate::error::{PlexError, Result};
use crate::pending::PendingSlot;
use crate::protocol::{decode_frame, NotificationEvent};
use crate::session_cache::SessionCache;
use crate::subscription::{EventReceiver, PlexEvent};
use crate::types::{Availability, PlaybackState, SessionKey};
use futures_util::{SinkExt, StreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Consecutive reconnect failures after which each failure is logged as an error
const FAILURE_ALERT_THRESHOLD: u32 = 3;

/// Lifecycle of the notification connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Per-connection dedup state; dropped and rebuilt on every reconnect
#[derive(Debug, Default)]
pub(crate) struct ConnectionScope {
    last_states: HashMap<SessionKey, PlaybackState>,
    announced: HashSet<String>,
}

impl ConnectionScope {
    /// Record a playback state; false when it should not produce an event
    pub fn admit_playing(&mut self, session_key: &str, state: PlaybackState) -> bool {
        if state == PlaybackState::Buffering {
            return false;
        }
        if self.last_states.get(session_key) == Some(&state) {
            return false;
        }
        self.last_states.insert(session_key.to_string(), state);
        true
    }

    /// Title to announce for a timeline entry, at most once per connection
    pub fn admit_timeline(&mut self, entry: &NotificationEvent) -> Option<String> {
        let title = entry.processed_library_title()?;
        if !self.announced.insert(title.to_string()) {
            return None;
        }
        Some(title.to_string())
    }
}

struct StreamShared {
    client: Arc<PlexClient>,
    config: Arc<BridgeConfig>,
    sessions: SessionCache,
    events: broadcast::Sender<PlexEvent>,
    state: watch::Sender<ConnectionState>,
    availability: Arc<watch::Sender<Availability>>,
    /// Bumped by `disconnect()`; workers from an older epoch never emit
    epoch: AtomicU64,
    failures: AtomicU32,
}

impl StreamShared {
    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    fn emit(&self, event: PlexEvent, epoch: u64) {
        if self.epoch.load(Ordering::SeqCst) != epoch {
            return;
        }
        tracing::debug!("Emitting {}", event.name());
        if self.events.send(event).is_err() {
            tracing::debug!("No event subscribers");
        }
    }

    fn on_connected(&self) {
        self.failures.store(0, Ordering::SeqCst);
        self.set_state(ConnectionState::Connected);
        self.availability.send_replace(Availability::Available);
        tracing::info!("Notification stream connected");
    }

    /// Connection loss: the endpoint may be stale and session keys may change
    async fn on_disconnected(&self) {
        self.set_state(ConnectionState::Disconnected);
        self.client.invalidate_endpoint();
        self.sessions.clear().await;
    }
}

struct Worker {
    stop_tx: broadcast::Sender<()>,
    handle: JoinHandle<()>,
}

enum Outcome {
    Stopped,
    Lost,
}

/// Persistent websocket subscription to server notifications
///
/// Once connected, a background task reads frames, turns them into
/// [`PlexEvent`]s and reconnects indefinitely after a fixed delay whenever
/// the connection drops. Only one connection attempt runs at a time; a
/// second `connect()` joins the pending one.
pub struct NotificationStream {
    shared: Arc<StreamShared>,
    attempt: PendingSlot<()>,
    worker: Arc<Mutex<Option<Worker>>>,
}

impl NotificationStream {
    /// Create a stream with its own event channel
    pub fn new(client: Arc<PlexClient>, config: Arc<BridgeConfig>) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity);
        let (availability, _) = watch::channel(Availability::Unknown);
        Self::with_channels(client, config, events, Arc::new(availability))
    }

    pub(crate) fn with_channels(
        client: Arc<PlexClient>,
        config: Arc<BridgeConfig>,
        events: broadcast::Sender<PlexEvent>,
        availability: Arc<watch::Sender<Availability>>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            shared: Arc::new(StreamShared {
                client,
                config,
                sessions: SessionCache::new(),
                events,
                state,
                availability,
                epoch: AtomicU64::new(0),
                failures: AtomicU32::new(0),
            }),
            attempt: PendingSlot::new(),
            worker: Arc::new(Mutex::new(None)),
        }
    }

    /// Subscribe to events produced by this stream
    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver::new(self.shared.events.subscribe())
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Watch connection state transitions
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Consecutive failed reconnect attempts since the last successful open
    pub fn reconnect_failures(&self) -> u32 {
        self.shared.failures.load(Ordering::SeqCst)
    }

    /// Whether a connection (or its reconnect loop) is being supervised
    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|worker| !worker.handle.is_finished())
    }

    /// Open the stream
    ///
    /// Returns once the websocket is open. If a connection is already being
    /// supervised this is a no-op; if an attempt is in flight it is joined.
    /// A failed first attempt is returned to the caller and not retried.
    pub async fn connect(&self) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }

        let shared = self.shared.clone();
        let worker = self.worker.clone();

        self.attempt
            .run(move || async move {
                let epoch = shared.epoch.load(Ordering::SeqCst);
                shared.set_state(ConnectionState::Connecting);

                let socket = match open(&shared).await {
                    Ok(socket) => socket,
                    Err(e) => {
                        shared.set_state(ConnectionState::Disconnected);
                        return Err(e);
                    }
                };

                let mut slot = worker.lock().unwrap();
                if shared.epoch.load(Ordering::SeqCst) != epoch {
                    tracing::debug!("Disconnected while connecting, dropping socket");
                    shared.set_state(ConnectionState::Disconnected);
                    return Err(PlexError::ConnectionClosed);
                }

                let (stop_tx, stop_rx) = broadcast::channel(1);
                let handle = tokio::spawn(supervise(shared.clone(), socket, stop_rx, epoch));
                *slot = Some(Worker { stop_tx, handle });
                Ok(())
            })
            .await
    }

    /// Close the stream and cancel any scheduled reconnect
    ///
    /// Safe to call when nothing is connected. Waits up to the configured
    /// disconnect timeout for a clean close; no events fire after it returns.
    pub async fn disconnect(&self) {
        let worker = {
            let mut slot = self.worker.lock().unwrap();
            self.shared.epoch.fetch_add(1, Ordering::SeqCst);
            slot.take()
        };

        let Some(worker) = worker else {
            tracing::debug!("Disconnect requested with no active stream");
            return;
        };

        let _ = worker.stop_tx.send(());
        let mut handle = worker.handle;
        if timeout(self.shared.config.disconnect_timeout(), &mut handle)
            .await
            .is_err()
        {
            tracing::warn!("Notification stream did not close in time, aborting");
            handle.abort();
            let _ = handle.await;
        }

        self.shared.sessions.clear().await;
        self.shared.set_state(ConnectionState::Disconnected);
        tracing::info!("Notification stream disconnected");
    }
}

impl Drop for NotificationStream {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.worker.lock() {
            self.shared.epoch.fetch_add(1, Ordering::SeqCst);
            if let Some(worker) = slot.take() {
                worker.handle.abort();
            }
        }
    }
}

async fn open(shared: &StreamShared) -> Result<Socket> {
    let url = shared.client.notification_url().await?;
    tracing::info!(
        "Connecting to notification stream at {}",
        url.split('?').next().unwrap_or_default()
    );

    let limit = shared.config.request_timeout();
    let started = Instant::now();
    match timeout(limit, connect_async(url.as_str())).await {
        Ok(Ok((socket, _))) => Ok(socket),
        Ok(Err(e)) => {
            // a rejected upgrade still proves the endpoint is reachable
            if !matches!(e, tungstenite::Error::Http(_)) {
                shared.client.invalidate_endpoint();
            }
            Err(e.into())
        }
        Err(_) => {
            shared.client.invalidate_endpoint();
            Err(PlexError::Timeout {
                elapsed: started.elapsed(),
            })
        }
    }
}

async fn supervise(
    shared: Arc<StreamShared>,
    mut socket: Socket,
    mut stop_rx: broadcast::Receiver<()>,
    epoch: u64,
) {
    loop {
        shared.on_connected();
        let outcome = run_connection(&shared, socket, &mut stop_rx, epoch).await;
        shared.on_disconnected().await;

        if let Outcome::Stopped = outcome {
            return;
        }

        socket = match reconnect(&shared, &mut stop_rx).await {
            Some(socket) => socket,
            None => return,
        };
    }
}

/// Retry forever with a fixed delay until a socket opens or we are stopped
async fn reconnect(shared: &StreamShared, stop_rx: &mut broadcast::Receiver<()>) -> Option<Socket> {
    let delay = shared.config.reconnect_delay();

    loop {
        tracing::info!("Reconnecting notification stream in {:?}", delay);
        tokio::select! {
            _ = stop_rx.recv() => return None,
            _ = sleep(delay) => {}
        }

        shared.set_state(ConnectionState::Connecting);
        let attempt = tokio::select! {
            _ = stop_rx.recv() => return None,
            result = open(shared) => result,
        };

        match attempt {
            Ok(socket) => return Some(socket),
            Err(e) => {
                let failures = shared.failures.fetch_add(1, Ordering::SeqCst) + 1;
                shared.set_state(ConnectionState::Disconnected);
                shared
                    .availability
                    .send_replace(Availability::Unavailable(e.to_string()));

                if failures >= FAILURE_ALERT_THRESHOLD {
                    tracing::error!(failures, "Reconnect failed: {}", e);
                } else {
                    tracing::warn!(failures, "Reconnect failed: {}", e);
                }
            }
        }
    }
}

async fn run_connection(
    shared: &StreamShared,
    socket: Socket,
    stop_rx: &mut broadcast::Receiver<()>,
    epoch: u64,
) -> Outcome {
    let (mut write, mut read) = socket.split();
    let mut scope = ConnectionScope::default();

    loop {
        tokio::select! {
            _ = stop_rx.recv() => {
                tracing::info!("Closing notification stream");
                if write.send(Message::Close(None)).await.is_ok() {
                    // wait for the close acknowledgement
                    while let Some(Ok(msg)) = read.next().await {
                        if let Message::Close(_) = msg {
                            break;
                        }
                    }
                }
                return Outcome::Stopped;
            }
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    handle_frame(shared, &mut scope, &text, epoch).await;
                }
                Some(Ok(Message::Close(_))) | None => {
                    tracing::info!("Notification stream closed by server");
                    return Outcome::Lost;
                }
                Some(Err(e)) => {
                    tracing::warn!("Notification stream error: {}", e);
                    return Outcome::Lost;
                }
                Some(Ok(_)) => {}
            }
        }
    }
}

async fn handle_frame(shared: &StreamShared, scope: &mut ConnectionScope, text: &str, epoch: u64) {
    let events = match decode_frame(text) {
        Ok(events) => events,
        Err(e) => {
            tracing::debug!("Dropping malformed frame: {}", e);
            return;
        }
    };

    for event in events {
        match event {
            NotificationEvent::Playing { session_key, state } => {
                if !scope.admit_playing(&session_key, state) {
                    continue;
                }

                match shared.sessions.get_cached(&shared.client, &session_key).await {
                    Ok(session) => {
                        if let Some(event) = PlexEvent::for_playback(state, &session) {
                            shared.emit(event, epoch);
                        }
                    }
                    Err(PlexError::SessionNotFound(_)) => {
                        tracing::debug!("Session {} already ended, dropping {:?}", session_key, state);
                    }
                    Err(e) => {
                        tracing::warn!("Failed to look up session {}: {}", session_key, e);
                    }
                }
            }
            entry @ NotificationEvent::TimelineEntry { .. } => {
                if let Some(title) = scope.admit_timeline(&entry) {
                    tracing::info!("Added: {}", title);
                    shared.emit(PlexEvent::RecentlyAdded { title }, epoch);
                }
            }
        }
    }
}

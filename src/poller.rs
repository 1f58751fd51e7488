use crate::client::PlexClient;
use crate::config::BridgeConfig;
use crate::error::Result;
use crate::notifications::NotificationStream;
use crate::subscription::PlexEvent;
use crate::types::{Availability, LibraryItem, Session};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant, MissedTickBehavior};

/// Last processed "recently added" timestamp
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Watermark {
    /// Nothing has ever been polled
    Never,
    At(i64),
}

/// Host-owned persistence for the watermark
pub trait WatermarkStore: Send + Sync {
    fn load(&self) -> Option<i64>;
    fn save(&self, watermark: i64);
}

/// Watermark store that lives only as long as the process
#[derive(Debug, Default)]
pub struct MemoryWatermarkStore {
    value: Mutex<Option<i64>>,
}

impl MemoryWatermarkStore {
    pub fn new(initial: Option<i64>) -> Self {
        Self {
            value: Mutex::new(initial),
        }
    }
}

impl WatermarkStore for MemoryWatermarkStore {
    fn load(&self) -> Option<i64> {
        *self.value.lock().unwrap()
    }

    fn save(&self, watermark: i64) {
        *self.value.lock().unwrap() = Some(watermark);
    }
}

/// Diffs "recently added" listings against the watermark
#[derive(Debug, Clone)]
pub struct ChangeDetector {
    watermark: Watermark,
}

impl ChangeDetector {
    pub fn new(watermark: Watermark) -> Self {
        Self { watermark }
    }

    pub fn watermark(&self) -> Watermark {
        self.watermark
    }

    /// Items newer than the watermark, oldest first, advancing the watermark
    ///
    /// The very first observation only records the watermark so existing
    /// library content is never reported as new.
    pub fn observe(&mut self, items: &[LibraryItem]) -> Vec<LibraryItem> {
        let Some(newest) = items.iter().map(|item| item.added_at).max() else {
            return Vec::new();
        };

        match self.watermark {
            Watermark::Never => {
                tracing::debug!("First poll, recording watermark {}", newest);
                self.watermark = Watermark::At(newest);
                Vec::new()
            }
            Watermark::At(previous) if newest > previous => {
                let mut fresh: Vec<LibraryItem> = items
                    .iter()
                    .filter(|item| item.added_at > previous)
                    .cloned()
                    .collect();
                fresh.sort_by_key(|item| item.added_at);
                self.watermark = Watermark::At(newest);
                fresh
            }
            Watermark::At(_) => Vec::new(),
        }
    }
}

/// Single announcer for `recently_added` events
///
/// Titles from every tick queue behind each other, so consecutive events are
/// always at least `stagger` apart. The first title after a quiet period
/// goes out immediately.
struct Announcer {
    titles: mpsc::UnboundedSender<String>,
    handle: JoinHandle<()>,
}

impl Announcer {
    fn spawn(events: broadcast::Sender<PlexEvent>, stagger: Duration) -> Self {
        let (titles, mut queue) = mpsc::unbounded_channel::<String>();
        let handle = tokio::spawn(async move {
            let mut last: Option<Instant> = None;
            while let Some(title) = queue.recv().await {
                if let Some(last) = last {
                    sleep_until(last + stagger).await;
                }
                tracing::info!("Added: {}", title);
                let _ = events.send(PlexEvent::RecentlyAdded { title });
                last = Some(Instant::now());
            }
        });

        Self { titles, handle }
    }

    fn send(&self, titles: Vec<String>) {
        for title in titles {
            let _ = self.titles.send(title);
        }
    }
}

impl Drop for Announcer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

struct PollInner {
    client: Arc<PlexClient>,
    stream: Arc<NotificationStream>,
    config: Arc<BridgeConfig>,
    store: Arc<dyn WatermarkStore>,
    detector: tokio::sync::Mutex<ChangeDetector>,
    events: broadcast::Sender<PlexEvent>,
    availability: Arc<watch::Sender<Availability>>,
    active_session: watch::Sender<Option<Session>>,
    announcer: Mutex<Option<Announcer>>,
}

impl PollInner {
    async fn tick(&self) -> Result<()> {
        let result = self.poll_once().await;
        match &result {
            Ok(()) => {
                self.availability.send_replace(Availability::Available);
            }
            Err(e) => {
                tracing::warn!("Poll failed: {}", e);
                self.availability
                    .send_replace(Availability::Unavailable(e.to_string()));
            }
        }
        result
    }

    async fn poll_once(&self) -> Result<()> {
        // the stream retries on the next tick; polling goes on without it
        if let Err(e) = self.stream.connect().await {
            tracing::warn!("Notification stream not connected: {}", e);
        }

        // only the first session is tracked as active
        let sessions = self.client.sessions().await?;
        self.active_session.send_replace(sessions.into_iter().next());

        let items = self.client.recently_added().await?;
        let (fresh, watermark) = {
            let mut detector = self.detector.lock().await;
            let before = detector.watermark();
            let fresh = detector.observe(&items);
            let after = detector.watermark();
            (fresh, (after != before).then_some(after))
        };

        if let Some(Watermark::At(value)) = watermark {
            self.store.save(value);
        }

        let titles: Vec<String> = fresh.iter().filter_map(LibraryItem::display_title).collect();
        if !titles.is_empty() {
            self.announcer
                .lock()
                .unwrap()
                .get_or_insert_with(|| {
                    Announcer::spawn(self.events.clone(), self.config.recently_added_stagger())
                })
                .send(titles);
        }

        Ok(())
    }
}

/// Periodic driver for session and "recently added" polling
///
/// Each tick also tries to connect the notification stream, which is how a
/// pairing recovers after its server was unreachable. Polling does not depend
/// on the stream: a tick whose stream connect fails still polls over HTTP.
pub struct PollLoop {
    inner: Arc<PollInner>,
    stop_tx: Option<broadcast::Sender<()>>,
    task_handle: Option<JoinHandle<()>>,
}

impl PollLoop {
    pub(crate) fn new(
        client: Arc<PlexClient>,
        stream: Arc<NotificationStream>,
        config: Arc<BridgeConfig>,
        store: Arc<dyn WatermarkStore>,
        events: broadcast::Sender<PlexEvent>,
        availability: Arc<watch::Sender<Availability>>,
    ) -> Self {
        let watermark = store.load().map_or(Watermark::Never, Watermark::At);
        let (active_session, _) = watch::channel(None);

        Self {
            inner: Arc::new(PollInner {
                client,
                stream,
                config,
                store,
                detector: tokio::sync::Mutex::new(ChangeDetector::new(watermark)),
                events,
                availability,
                active_session,
                announcer: Mutex::new(None),
            }),
            stop_tx: None,
            task_handle: None,
        }
    }

    /// Run a single poll immediately
    pub async fn tick(&self) -> Result<()> {
        self.inner.tick().await
    }

    /// First session seen on the last successful tick
    pub fn active_session(&self) -> Option<Session> {
        self.inner.active_session.borrow().clone()
    }

    pub async fn watermark(&self) -> Watermark {
        self.inner.detector.lock().await.watermark()
    }

    /// Start ticking in the background; restarts if already running
    pub async fn start(&mut self) {
        self.stop().await;

        let (stop_tx, mut stop_rx) = broadcast::channel(1);
        self.stop_tx = Some(stop_tx);

        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(inner.config.poll_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = stop_rx.recv() => {
                        tracing::info!("Poll loop stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let _ = inner.tick().await;
                    }
                }
            }
        });

        self.task_handle = Some(handle);
    }

    /// Stop ticking and drop queued announcements
    pub async fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(mut handle) = self.task_handle.take() {
            if tokio::time::timeout(self.inner.config.disconnect_timeout(), &mut handle)
                .await
                .is_err()
            {
                handle.abort();
            }
        }
        self.inner.announcer.lock().unwrap().take();
    }
}

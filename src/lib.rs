//! Rust library bridging a Plex Media Server into a home-automation host
//!
//! This library keeps a live connection to one paired Plex server and turns
//! its activity into named events. It supports:
//!
//! - PIN pairing against the Plex account API
//! - Server location via the account `resources` listing with reachability probes
//! - Playback events from the server's notification websocket
//! - "Recently added" announcements from scanner activity and periodic polling
//! - Library refresh and rescan commands
//!
//! # Quick Start
//!
//! ```no_run
//! use plex_bridge::{BridgeConfig, ClientIdentifier, MemoryWatermarkStore, PinAuth, PlexBridge, ServerIdentity};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = BridgeConfig::default();
//!
//!     // Pair with the account
//!     let auth = PinAuth::new(Arc::new(config.clone()), ClientIdentifier::generate())?;
//!     let pin = auth.create_pin().await?;
//!     println!("Approve at {}", auth.auth_url(&pin));
//!     let credential = auth.wait_for_token(&pin).await?;
//!
//!     // Watch one server
//!     let mut bridge = PlexBridge::new(
//!         config,
//!         credential,
//!         ServerIdentity::new("machine-identifier"),
//!         Arc::new(MemoryWatermarkStore::default()),
//!     )?;
//!     let mut events = bridge.subscribe();
//!     bridge.start().await;
//!
//!     while let Ok(event) = events.recv().await {
//!         println!("{}: {}", event.name(), event.payload());
//!     }
//!
//!     bridge.stop().await;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! The library is organized into several layers:
//!
//! - **Bridge**: Capability facade combining the pieces below
//! - **Poller**: Periodic session and "recently added" polling
//! - **Notifications**: Websocket subscription with reconnect and dedup
//! - **Client**: Authenticated server API calls
//! - **Locator**: Account lookup and endpoint selection
//! - **Transport**: HTTP with per-request timeouts
//! - **Protocol**: JSON and XML wire structures
//! - **Types**: Domain types and data structures

mod auth;
mod bridge;
mod client;
mod config;
mod error;
mod locator;
mod notifications;
mod pending;
mod poller;
mod protocol;
mod session_cache;
mod subscription;
mod transport;
mod types;

// Public exports
pub use auth::PinAuth;
pub use bridge::PlexBridge;
pub use client::PlexClient;
pub use config::BridgeConfig;
pub use error::{PlexError, Result};
pub use locator::ServerLocator;
pub use notifications::{ConnectionState, NotificationStream};
pub use poller::{ChangeDetector, MemoryWatermarkStore, PollLoop, Watermark, WatermarkStore};
pub use protocol::{decode_frame, NotificationEvent};
pub use session_cache::SessionCache;
pub use subscription::{EventReceiver, EventSink, PlaybackEvent, PlexEvent};
pub use transport::{HttpResponse, Transport};
pub use types::{
    Availability, ClientIdentifier, Credential, Endpoint, LibraryItem, LibrarySection, Pin,
    PlaybackState, ServerIdentity, ServerSummary, Session, SessionKey,
};

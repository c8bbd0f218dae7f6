//! Rust library for controlling Hearth & Home IntelliFire gas fireplaces
//!
//! IntelliFire fireplaces are reachable two ways: through the vendor's
//! cloud relay (HTTPS with session cookies and long-poll state updates)
//! and directly on the LAN (HTTP, discovered over UDP broadcast, with
//! challenge-response signed commands). This library keeps a consistent
//! typed view of fireplace state across whichever transport is currently
//! viable, failing over between them automatically. It supports:
//!
//! - Cloud session management with keep-alive and automatic re-login
//! - Long-poll state synchronization with ETag reuse
//! - UDP discovery of fireplaces on the local network
//! - Challenge-response command signing for the local API
//! - Per-device poll loops with state-change subscriptions
//! - Debounced flame height and fan speed commands
//!
//! # Quick Start
//!
//! ```no_run
//! use intellifire::{
//!     CloudAuth, CloudTransport, DiscoveryService, Fireplace, LocalTransport, TransportRouter,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut cloud = CloudTransport::new(CloudAuth::Credentials {
//!         username: "you@example.com".into(),
//!         password: "secret".into(),
//!     })?;
//!     cloud.start();
//!
//!     let mut discovery = DiscoveryService::new()?;
//!     discovery.start().await?;
//!
//!     // Wait for the first successful login before enumerating
//!     let mut connectivity = cloud.subscribe_connectivity();
//!     connectivity.wait_for(|connected| *connected).await?;
//!
//!     let user = cloud.user_id().unwrap_or_default();
//!     let devices = cloud.devices().await?;
//!
//!     let local = Arc::new(LocalTransport::new(Arc::new(discovery), user)?);
//!     let router = Arc::new(TransportRouter::new(Arc::new(cloud), local));
//!
//!     let mut fireplaces = Vec::new();
//!     for device in devices {
//!         let mut fireplace = Fireplace::new(device, router.clone());
//!         fireplace.start();
//!
//!         let mut updates = fireplace.subscribe();
//!         tokio::spawn(async move {
//!             while let Ok(state) = updates.recv().await {
//!                 println!("State update: {:?}", state);
//!             }
//!         });
//!
//!         fireplaces.push(fireplace);
//!     }
//!
//!     if let Some(fireplace) = fireplaces.first() {
//!         fireplace.set_power(true).await?;
//!         fireplace.set_height(3).await?;
//!     }
//!
//!     tokio::signal::ctrl_c().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! The library is organized into several layers:
//!
//! - **CloudTransport**: session cookies, keep-alive, long-poll, commands
//! - **DiscoveryService**: UDP broadcast discovery and address verification
//! - **LocalTransport**: LAN polling and signed commands
//! - **TransportRouter**: per-call selection between cloud and local
//! - **Fireplace**: per-device poll loop, debouncing, state events
//! - **Types**: domain types and wire-format decoding

mod cloud;
mod discovery;
mod error;
mod fireplace;
mod local;
mod transport;
mod types;

// Public exports
pub use cloud::{CloudAuth, CloudTransport};
pub use discovery::{DiscoveryEntry, DiscoveryService};
pub use error::{FireplaceError, Result};
pub use fireplace::Fireplace;
pub use local::{sign_command, LocalTransport};
pub use transport::{PollCursor, PollOutcome, TransportKind, TransportRouter};
pub use types::{
    Announcement, Command, Device, FireplaceState, Location, Locations, MAX_FAN_SPEED, MAX_HEIGHT,
};

use crate::error::Result;
use crate::types::Announcement;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::broadcast;

/// Port fireplaces listen on for search datagrams
const SEARCH_PORT: u16 = 3785;

/// Port fireplaces send self-announcements to
const LISTEN_PORT: u16 = 55555;

/// Fixed search datagram the fireplaces answer to
const SEARCH_PACKET: &[u8] = b"IFT-search";

const MAX_PACKET_SIZE: usize = 1024;

const VERIFY_TIMEOUT: Duration = Duration::from_secs(5);

/// A verified LAN address for a fireplace
#[derive(Debug, Clone)]
pub struct DiscoveryEntry {
    pub ip: String,
    pub last_seen: Instant,
}

/// UDP discovery service for fireplaces on the local network
///
/// Broadcasts a search datagram at startup and listens for fireplace
/// self-announcements. Each announcement is verified with an HTTP call to
/// the announced address before its `serial -> ip` mapping is recorded, so
/// spoofed or stale packets cannot poison the table.
///
/// # Example
///
/// ```no_run
/// use intellifire::DiscoveryService;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let mut discovery = DiscoveryService::new()?;
///     discovery.start().await?;
///
///     let mut serials = discovery.subscribe();
///     while let Ok(serial) = serials.recv().await {
///         println!("Fireplace {} is at {:?}", serial, discovery.ip(&serial));
///     }
///     Ok(())
/// }
/// ```
pub struct DiscoveryService {
    http: reqwest::Client,
    entries: Arc<Mutex<HashMap<String, DiscoveryEntry>>>,
    discovered_tx: broadcast::Sender<String>,
    listen_port: u16,
    stop_tx: Option<broadcast::Sender<()>>,
    task_handle: Option<tokio::task::JoinHandle<()>>,
}

impl DiscoveryService {
    /// Create a discovery service on the standard announcement port
    pub fn new() -> Result<Self> {
        Self::with_listen_port(LISTEN_PORT)
    }

    /// Create a discovery service bound to a specific announcement port
    pub fn with_listen_port(listen_port: u16) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(VERIFY_TIMEOUT).build()?;
        let (discovered_tx, _) = broadcast::channel(16);

        Ok(Self {
            http,
            entries: Arc::new(Mutex::new(HashMap::new())),
            discovered_tx,
            listen_port,
            stop_tx: None,
            task_handle: None,
        })
    }

    /// The verified LAN address for a serial, if one has been learned
    ///
    /// Absence means "not discovered yet", which callers treat as a
    /// recoverable local-unavailability condition.
    pub fn ip(&self, serial: &str) -> Option<String> {
        let entries = self.entries.lock().unwrap();
        entries.get(serial).map(|entry| entry.ip.clone())
    }

    /// When the serial's address was last confirmed
    ///
    /// Entries are never expired; a fireplace that changes address keeps
    /// resolving to the old one until a fresh announcement overwrites it.
    pub fn last_seen(&self, serial: &str) -> Option<Instant> {
        let entries = self.entries.lock().unwrap();
        entries.get(serial).map(|entry| entry.last_seen)
    }

    /// Subscribe to newly verified serials
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.discovered_tx.subscribe()
    }

    /// Record an address without waiting for an announcement
    ///
    /// For networks where UDP broadcast is filtered and the fireplace
    /// address is known up front. A later verified announcement overwrites
    /// the entry like any other.
    pub fn register(&self, serial: impl Into<String>, ip: impl Into<String>) {
        let serial = serial.into();
        let changed = {
            let mut entries = self.entries.lock().unwrap();
            let ip = ip.into();
            let previous = entries.insert(
                serial.clone(),
                DiscoveryEntry {
                    ip: ip.clone(),
                    last_seen: Instant::now(),
                },
            );
            previous.is_none_or(|entry| entry.ip != ip)
        };
        if changed {
            let _ = self.discovered_tx.send(serial);
        }
    }

    /// Bind the socket, send the search datagram, and start listening
    ///
    /// If discovery is already running, it is stopped and restarted. The
    /// learned address table is preserved.
    pub async fn start(&mut self) -> Result<()> {
        self.stop().await;

        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, self.listen_port)).await?;
        socket.set_broadcast(true)?;

        tracing::debug!("Sending UDP discovery packet");
        socket
            .send_to(SEARCH_PACKET, (Ipv4Addr::BROADCAST, SEARCH_PORT))
            .await?;

        let (stop_tx, stop_rx) = broadcast::channel(1);
        self.stop_tx = Some(stop_tx);

        let http = self.http.clone();
        let entries = self.entries.clone();
        let discovered_tx = self.discovered_tx.clone();
        self.task_handle = Some(tokio::spawn(run_listener(
            socket,
            http,
            entries,
            discovered_tx,
            stop_rx,
        )));

        Ok(())
    }

    /// Stop listening for announcements
    ///
    /// The learned address table is preserved and can still be read.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.task_handle.take() {
            let _ = tokio::time::timeout(Duration::from_millis(500), handle).await;
        }
    }
}

async fn run_listener(
    socket: UdpSocket,
    http: reqwest::Client,
    entries: Arc<Mutex<HashMap<String, DiscoveryEntry>>>,
    discovered_tx: broadcast::Sender<String>,
    mut stop_rx: broadcast::Receiver<()>,
) {
    let mut buf = vec![0u8; MAX_PACKET_SIZE];

    loop {
        tokio::select! {
            _ = stop_rx.recv() => {
                tracing::info!("Shutting down discovery.");
                break;
            }
            result = socket.recv_from(&mut buf) => {
                match result {
                    Ok((len, addr)) => {
                        tracing::debug!("Received UDP packet from {}: {}",
                            addr, String::from_utf8_lossy(&buf[..len]));

                        match serde_json::from_slice::<Announcement>(&buf[..len]) {
                            Ok(announcement) => {
                                // Verification blocks on HTTP, so run it off
                                // the listener loop
                                let http = http.clone();
                                let entries = entries.clone();
                                let discovered_tx = discovered_tx.clone();
                                tokio::spawn(async move {
                                    verify_announcement(&http, announcement, &entries, &discovered_tx).await;
                                });
                            }
                            Err(e) => {
                                tracing::debug!("Ignoring malformed announcement from {}: {}", addr, e);
                            }
                        }
                    }
                    Err(e) => {
                        tracing::error!("Receiver error: {}", e);
                        break;
                    }
                }
            }
        }
    }
}

/// Confirm an announced address actually answers as a fireplace before
/// recording it
async fn verify_announcement(
    http: &reqwest::Client,
    announcement: Announcement,
    entries: &Arc<Mutex<HashMap<String, DiscoveryEntry>>>,
    discovered_tx: &broadcast::Sender<String>,
) {
    let url = format!("http://{}/poll", announcement.ip);

    let response = match http.get(&url).send().await {
        Ok(response) if response.status().is_success() => response,
        Ok(response) => {
            tracing::info!(
                "Failed to verify fireplace ip {}: status {}",
                announcement.ip,
                response.status()
            );
            return;
        }
        Err(e) => {
            tracing::info!("Failed to verify fireplace ip {}: {}", announcement.ip, e);
            return;
        }
    };

    let body: serde_json::Value = match response.json().await {
        Ok(body) => body,
        Err(e) => {
            tracing::info!("Unreadable poll body from {}: {}", announcement.ip, e);
            return;
        }
    };

    let Some(serial) = body.get("serial").and_then(|v| v.as_str()) else {
        tracing::info!("Poll body from {} has no serial, ignoring", announcement.ip);
        return;
    };

    tracing::debug!("Fireplace {} (uuid {}) is at ip {}", serial, announcement.uuid, announcement.ip);

    let changed = {
        let mut entries = entries.lock().unwrap();
        let previous = entries.insert(
            serial.to_string(),
            DiscoveryEntry {
                ip: announcement.ip.clone(),
                last_seen: Instant::now(),
            },
        );
        previous.is_none_or(|entry| entry.ip != announcement.ip)
    };

    if changed {
        let _ = discovered_tx.send(serial.to_string());
    }
}

use crate::error::{FireplaceError, Result};
use crate::types::{parse_state, Device, FireplaceState, Location, Locations};
use reqwest::cookie::{CookieStore, Jar};
use reqwest::header::{ETAG, IF_NONE_MATCH};
use reqwest::{StatusCode, Url};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::sleep;

const DEFAULT_BASE_URL: &str = "https://iftapi.net";

/// Interval between keep-alive probes, and between login retries after a
/// failed probe
const PING_INTERVAL: Duration = Duration::from_secs(300);

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Long-poll requests are held open server side until state changes or the
/// server gives up, so they get a much longer client timeout than ordinary
/// calls
const LONG_POLL_TIMEOUT: Duration = Duration::from_secs(70);

/// Credentials for the cloud service
#[derive(Debug, Clone)]
pub enum CloudAuth {
    /// Log in with account credentials
    Credentials { username: String, password: String },

    /// Reuse session cookies obtained out of band (for example from a
    /// browser session), skipping the login endpoint entirely
    Cookies {
        user: String,
        auth_cookie: String,
        web_client_id: String,
    },
}

struct CloudInner {
    http: reqwest::Client,
    jar: Arc<Jar>,
    base_url: String,
    auth: CloudAuth,
    connected_tx: watch::Sender<bool>,
}

/// Cloud transport for the IntelliFire service
///
/// Owns the session cookies and the keep-alive cycle. After [`start`], a
/// background task logs in and then re-probes the service every five
/// minutes; a failed probe drops back to the login step on the next cycle.
/// Connectivity transitions are observable through
/// [`subscribe_connectivity`].
///
/// [`start`]: CloudTransport::start
/// [`subscribe_connectivity`]: CloudTransport::subscribe_connectivity
///
/// # Example
///
/// ```no_run
/// use intellifire::{CloudAuth, CloudTransport};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let mut cloud = CloudTransport::new(CloudAuth::Credentials {
///         username: "you@example.com".into(),
///         password: "secret".into(),
///     })?;
///     cloud.start();
///
///     let mut connectivity = cloud.subscribe_connectivity();
///     connectivity.wait_for(|connected| *connected).await?;
///
///     for device in cloud.devices().await? {
///         println!("Found fireplace: {} ({})", device.name, device.serial);
///     }
///     Ok(())
/// }
/// ```
pub struct CloudTransport {
    inner: Arc<CloudInner>,
    stop_tx: Option<broadcast::Sender<()>>,
    task_handle: Option<tokio::task::JoinHandle<()>>,
}

impl CloudTransport {
    /// Create a transport against the production cloud service
    pub fn new(auth: CloudAuth) -> Result<Self> {
        Self::with_base_url(auth, DEFAULT_BASE_URL)
    }

    /// Create a transport against a specific base URL
    pub fn with_base_url(auth: CloudAuth, base_url: impl Into<String>) -> Result<Self> {
        match &auth {
            CloudAuth::Credentials { username, .. } if username.is_empty() => {
                return Err(FireplaceError::Auth(
                    "username is not configured".to_string(),
                ));
            }
            CloudAuth::Cookies { user, .. } if user.is_empty() => {
                return Err(FireplaceError::Auth(
                    "user cookie is not configured".to_string(),
                ));
            }
            _ => {}
        }

        let jar = Arc::new(Jar::default());
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .cookie_provider(jar.clone())
            .build()?;

        let (connected_tx, _) = watch::channel(false);

        Ok(Self {
            inner: Arc::new(CloudInner {
                http,
                jar,
                base_url: base_url.into().trim_end_matches('/').to_string(),
                auth,
                connected_tx,
            }),
            stop_tx: None,
            task_handle: None,
        })
    }

    /// Whether the last probe of the cloud service succeeded
    pub fn is_connected(&self) -> bool {
        *self.inner.connected_tx.borrow()
    }

    /// Subscribe to connectivity transitions
    ///
    /// The receiver carries the current `connected` flag and is only
    /// notified when it changes.
    pub fn subscribe_connectivity(&self) -> watch::Receiver<bool> {
        self.inner.connected_tx.subscribe()
    }

    /// The account user id, needed to sign commands on the local transport
    ///
    /// Known up front for cookie auth; populated by the server's `user`
    /// cookie after a credential login.
    pub fn user_id(&self) -> Option<String> {
        if let CloudAuth::Cookies { user, .. } = &self.inner.auth {
            return Some(user.clone());
        }

        let url = Url::parse(&self.inner.base_url).ok()?;
        let header = self.inner.jar.cookies(&url)?;
        let cookies = header.to_str().ok()?;
        cookies
            .split(';')
            .map(str::trim)
            .find_map(|cookie| cookie.strip_prefix("user=").map(str::to_string))
    }

    /// Authenticate against the cloud service
    ///
    /// Posts credentials to the login endpoint, or seeds the cookie jar
    /// when pre-obtained cookies are configured. Does not probe; call
    /// [`ping`](CloudTransport::ping) to validate the session.
    pub async fn login(&self) -> Result<()> {
        login(&self.inner).await
    }

    /// Probe the cloud service and update the connectivity flag
    ///
    /// Issues the lightweight `enumlocations` request the keep-alive cycle
    /// uses. Returns whether the probe succeeded.
    pub async fn ping(&self) -> bool {
        ping(&self.inner).await
    }

    /// Start the session task
    ///
    /// If the task is already running, it is stopped and restarted.
    pub fn start(&mut self) {
        self.shutdown();

        let (stop_tx, stop_rx) = broadcast::channel(1);
        self.stop_tx = Some(stop_tx);

        let inner = self.inner.clone();
        self.task_handle = Some(tokio::spawn(run_session(inner, stop_rx)));
    }

    /// Stop the session task
    pub async fn stop(&mut self) {
        self.shutdown();
        if let Some(handle) = self.task_handle.take() {
            let _ = tokio::time::timeout(Duration::from_millis(500), handle).await;
        }
    }

    fn shutdown(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
    }

    /// Enumerate the fireplaces registered to the account
    pub async fn devices(&self) -> Result<Vec<Device>> {
        tracing::info!("Discovering locations...");
        let response = self.get(None, "enumlocations").send().await?;
        if !response.status().is_success() {
            return Err(FireplaceError::CloudStatus(response.status()));
        }
        let locations: Locations = response.json().await?;

        let Some(first) = locations.locations.first() else {
            tracing::warn!("Account has no locations");
            return Ok(Vec::new());
        };

        tracing::info!("Discovering fireplaces...");
        let response = self
            .get(None, "enumfireplaces")
            .query(&[("location_id", &first.location_id)])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(FireplaceError::CloudStatus(response.status()));
        }
        let location: Location = response.json().await?;

        tracing::info!("Found {} fireplaces.", location.fireplaces.len());
        Ok(location.fireplaces)
    }

    /// Fetch the current state snapshot for a device
    pub async fn status(&self, serial: &str) -> Result<FireplaceState> {
        let response = self.get(Some(serial), "apppoll").send().await?;
        if !response.status().is_success() {
            return Err(FireplaceError::CloudStatus(response.status()));
        }
        let body: serde_json::Value = serde_json::from_str(&response.text().await?)?;
        parse_state(&body)
    }

    /// Long-poll for a state change on a device
    ///
    /// Blocks until the server reports a change or times out. Passing the
    /// ETag from a previous call lets the server short-circuit with "no
    /// change", returned here as `None`. The second element is the ETag to
    /// carry into the next call, when the server supplied one.
    pub async fn poll(
        &self,
        serial: &str,
        etag: Option<&str>,
    ) -> Result<(Option<FireplaceState>, Option<String>)> {
        let mut request = self
            .get(Some(serial), "applongpoll")
            .timeout(LONG_POLL_TIMEOUT);
        if let Some(etag) = etag {
            tracing::debug!("Long poll for {} with etag {}", serial, etag);
            request = request.header(IF_NONE_MATCH, etag);
        } else {
            tracing::debug!("Long poll for {}", serial);
        }

        let response = request.send().await?;
        let next_etag = response
            .headers()
            .get(ETAG)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);

        if response.status() == StatusCode::NOT_MODIFIED {
            return Ok((None, next_etag));
        }
        if !response.status().is_success() {
            return Err(FireplaceError::CloudStatus(response.status()));
        }

        let body: serde_json::Value = serde_json::from_str(&response.text().await?)?;
        Ok((Some(parse_state(&body)?), next_etag))
    }

    /// Apply one setting to a device
    ///
    /// Failures are reported to the caller but never retried here; the
    /// device session decides whether to re-issue.
    pub async fn post(&self, serial: &str, command: &str, value: &str) -> Result<()> {
        tracing::info!("Sending {}={} to fireplace {}", command, value, serial);
        let response = self
            .inner
            .http
            .post(self.action_url(Some(serial), "apppost"))
            .form(&[(command, value)])
            .send()
            .await?;

        tracing::info!("Fireplace {} update response: {}", serial, response.status());
        if response.status().is_success() {
            Ok(())
        } else {
            Err(FireplaceError::CloudStatus(response.status()))
        }
    }

    fn get(&self, serial: Option<&str>, action: &str) -> reqwest::RequestBuilder {
        self.inner.http.get(self.action_url(serial, action))
    }

    fn action_url(&self, serial: Option<&str>, action: &str) -> String {
        format!(
            "{}/a/{}/{}",
            self.inner.base_url,
            serial.unwrap_or(""),
            action
        )
    }
}

async fn run_session(inner: Arc<CloudInner>, mut stop_rx: broadcast::Receiver<()>) {
    let mut logged_in = false;

    loop {
        if !logged_in {
            match login(&inner).await {
                Ok(()) => logged_in = true,
                Err(e) => {
                    tracing::warn!("Cloud login failed: {}", e);
                    set_connected(&inner, false);
                }
            }
        }

        if logged_in && !ping(&inner).await {
            // Next cycle retries the full login
            logged_in = false;
        }

        tokio::select! {
            _ = stop_rx.recv() => {
                tracing::info!("Cloud session stopped");
                break;
            }
            _ = sleep(PING_INTERVAL) => {}
        }
    }
}

async fn login(inner: &Arc<CloudInner>) -> Result<()> {
    match &inner.auth {
        CloudAuth::Credentials { username, password } => {
            tracing::info!("Logging into IntelliFire...");
            let response = inner
                .http
                .post(format!("{}/a//login", inner.base_url))
                .form(&[("username", username.as_str()), ("password", password.as_str())])
                .send()
                .await?;

            match response.status() {
                status if status.is_success() => Ok(()),
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(FireplaceError::Auth(
                    format!("login rejected: {}", response.status()),
                )),
                status => Err(FireplaceError::CloudStatus(status)),
            }
        }
        CloudAuth::Cookies {
            user,
            auth_cookie,
            web_client_id,
        } => {
            tracing::info!("Reusing IntelliFire session cookies...");
            let url = Url::parse(&inner.base_url)
                .map_err(|e| FireplaceError::InvalidResponse(format!("invalid base url: {e}")))?;
            inner.jar.add_cookie_str(&format!("user={user}; Path=/"), &url);
            inner
                .jar
                .add_cookie_str(&format!("auth_cookie={auth_cookie}; Path=/"), &url);
            inner
                .jar
                .add_cookie_str(&format!("web_client_id={web_client_id}; Path=/"), &url);
            Ok(())
        }
    }
}

async fn ping(inner: &Arc<CloudInner>) -> bool {
    let result = inner
        .http
        .get(format!("{}/a//enumlocations", inner.base_url))
        .send()
        .await;

    let connected = match result {
        Ok(response) => {
            tracing::debug!("Cloud probe status: {}", response.status());
            response.status().is_success()
        }
        Err(e) => {
            tracing::warn!("Cloud probe failed: {}", e);
            false
        }
    };

    set_connected(inner, connected);
    connected
}

fn set_connected(inner: &Arc<CloudInner>, connected: bool) {
    let changed = inner.connected_tx.send_if_modified(|current| {
        if *current != connected {
            *current = connected;
            true
        } else {
            false
        }
    });

    if changed {
        tracing::info!("Cloud connectivity changed to {}", connected);
    }
}

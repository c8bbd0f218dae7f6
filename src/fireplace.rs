use crate::error::Result;
use crate::transport::{PollCursor, TransportKind, TransportRouter};
use crate::types::{Command, Device, FireplaceState, MAX_FAN_SPEED, MAX_HEIGHT};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::sleep;

/// Delay before re-polling when the local transport served the poll, or
/// after any poll failure. The cloud long-poll blocks server side, so it
/// is re-issued immediately instead.
const RETRY_DELAY: Duration = Duration::from_secs(5);

/// Window in which repeated analog commands are coalesced
const DEBOUNCE_WINDOW: Duration = Duration::from_secs(2);

/// Session for a single fireplace
///
/// Drives the perpetual poll loop through the transport router, decodes
/// raw responses into [`FireplaceState`], and submits commands with the
/// debouncing policy each setting calls for. State changes are broadcast
/// to subscribers.
///
/// # Example
///
/// ```no_run
/// # use intellifire::{Device, Fireplace, TransportRouter};
/// # use std::sync::Arc;
/// # async fn example(device: Device, router: Arc<TransportRouter>) -> intellifire::Result<()> {
/// let mut fireplace = Fireplace::new(device, router);
/// fireplace.start();
///
/// let mut updates = fireplace.subscribe();
/// tokio::spawn(async move {
///     while let Ok(state) = updates.recv().await {
///         println!("Fireplace is {}", if state.power { "on" } else { "off" });
///     }
/// });
///
/// fireplace.set_power(true).await?;
/// fireplace.set_height(3).await?;
/// # Ok(())
/// # }
/// ```
pub struct Fireplace {
    device: Device,
    router: Arc<TransportRouter>,
    state: Arc<Mutex<FireplaceState>>,
    update_tx: broadcast::Sender<FireplaceState>,
    pending: Arc<Mutex<HashMap<&'static str, tokio::task::JoinHandle<()>>>>,
    debounce_window: Duration,
    retry_delay: Duration,
    stop_tx: Option<broadcast::Sender<()>>,
    task_handle: Option<tokio::task::JoinHandle<()>>,
}

impl Fireplace {
    pub fn new(device: Device, router: Arc<TransportRouter>) -> Self {
        let (update_tx, _) = broadcast::channel(16);
        Self {
            device,
            router,
            state: Arc::new(Mutex::new(FireplaceState::default())),
            update_tx,
            pending: Arc::new(Mutex::new(HashMap::new())),
            debounce_window: DEBOUNCE_WINDOW,
            retry_delay: RETRY_DELAY,
            stop_tx: None,
            task_handle: None,
        }
    }

    /// The device this session controls
    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn serial(&self) -> &str {
        &self.device.serial
    }

    /// Snapshot of the current state
    pub fn state(&self) -> FireplaceState {
        self.state.lock().unwrap().clone()
    }

    /// Subscribe to state updates
    ///
    /// Updates are emitted for every decoded poll response and for
    /// optimistic power changes.
    pub fn subscribe(&self) -> broadcast::Receiver<FireplaceState> {
        self.update_tx.subscribe()
    }

    /// Start the poll loop
    ///
    /// If the loop is already running, it is stopped and restarted.
    pub fn start(&mut self) {
        self.shutdown();

        let (stop_tx, stop_rx) = broadcast::channel(1);
        self.stop_tx = Some(stop_tx);

        self.task_handle = Some(tokio::spawn(run_poll_loop(
            self.device.clone(),
            self.router.clone(),
            self.state.clone(),
            self.update_tx.clone(),
            self.retry_delay,
            stop_rx,
        )));
    }

    /// Stop the poll loop and cancel any pending debounced sends
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
        let mut pending = self.pending.lock().unwrap();
        for (_, handle) in pending.drain() {
            handle.abort();
        }
    }

    /// Turn the burner on or off
    ///
    /// The state flips optimistically so subscribers see the change right
    /// away; `ack_power` follows once the device confirms. Requesting the
    /// state the fireplace is already in sends nothing.
    pub async fn set_power(&self, on: bool) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            if state.power == on {
                tracing::debug!("Fireplace {} power already {}", self.device.name, on);
                return Ok(());
            }
            state.power = on;
        }
        self.emit();
        self.submit(Command::Power(on)).await
    }

    /// Set the flame height
    pub async fn set_height(&self, height: u8) -> Result<()> {
        self.submit(Command::Height(height.min(MAX_HEIGHT))).await
    }

    /// Set the fan speed
    pub async fn set_fan_speed(&self, speed: u8) -> Result<()> {
        self.submit(Command::FanSpeed(speed.min(MAX_FAN_SPEED))).await
    }

    /// Turn the accent light on or off
    pub async fn set_light(&self, on: bool) -> Result<()> {
        self.submit(Command::Light(on)).await
    }

    /// Submit a command with the policy its setting calls for
    ///
    /// Switches go out immediately; analog settings restart a debounce
    /// window and only the last value requested within it is transmitted.
    pub async fn submit(&self, command: Command) -> Result<()> {
        if command.is_debounced() {
            self.submit_debounced(command);
            Ok(())
        } else {
            self.router
                .post(&self.device, command.name(), &command.value())
                .await
        }
    }

    fn submit_debounced(&self, command: Command) {
        let mut pending = self.pending.lock().unwrap();
        if let Some(handle) = pending.remove(command.name()) {
            handle.abort();
        }

        let router = self.router.clone();
        let device = self.device.clone();
        let state = self.state.clone();
        let window = self.debounce_window;
        let handle = tokio::spawn(async move {
            sleep(window).await;
            let command = clamp_for_ignition(command, &state);
            if let Err(e) = router.post(&device, command.name(), &command.value()).await {
                tracing::warn!("Failed to send {} to {}: {}", command.name(), device.name, e);
            }
        });
        pending.insert(command.name(), handle);
    }

    fn emit(&self) {
        let snapshot = self.state.lock().unwrap().clone();
        let _ = self.update_tx.send(snapshot);
    }
}

impl Drop for Fireplace {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

/// Cap height requests until the device confirms ignition; the burner
/// cannot safely jump to a high flame level straight from cold.
fn clamp_for_ignition(command: Command, state: &Arc<Mutex<FireplaceState>>) -> Command {
    if let Command::Height(height) = command {
        let limit = MAX_HEIGHT / 2;
        let ack_power = state.lock().unwrap().ack_power;
        if !ack_power && height > limit {
            tracing::debug!("Capping height at {} until ignition is confirmed", limit);
            return Command::Height(limit);
        }
    }
    command
}

async fn run_poll_loop(
    device: Device,
    router: Arc<TransportRouter>,
    state: Arc<Mutex<FireplaceState>>,
    update_tx: broadcast::Sender<FireplaceState>,
    retry_delay: Duration,
    mut stop_rx: broadcast::Receiver<()>,
) {
    let mut cursor: Option<PollCursor> = None;

    loop {
        // A cursor from another transport is useless there; drop it before
        // polling so a stale validator is never replayed
        let active = router.active();
        if cursor.as_ref().is_some_and(|c| c.transport != active) {
            cursor = None;
        }

        let outcome = tokio::select! {
            _ = stop_rx.recv() => break,
            result = router.poll(&device, cursor.as_ref()) => result,
        };

        let delay = match outcome {
            Ok(outcome) => {
                if let Some(new_state) = outcome.state {
                    apply_update(&state, &update_tx, new_state);
                }
                if let Some(etag) = outcome.etag {
                    cursor = Some(PollCursor {
                        etag,
                        transport: outcome.transport,
                    });
                }
                match outcome.transport {
                    TransportKind::Cloud => Duration::ZERO,
                    TransportKind::Local => retry_delay,
                }
            }
            Err(e) => {
                tracing::debug!("Poll failed for {}: {}", device.name, e);
                retry_delay
            }
        };

        if !delay.is_zero() {
            tokio::select! {
                _ = stop_rx.recv() => break,
                _ = sleep(delay) => {}
            }
        }
    }

    tracing::debug!("Poll loop for {} stopped", device.name);
}

fn apply_update(
    state: &Arc<Mutex<FireplaceState>>,
    update_tx: &broadcast::Sender<FireplaceState>,
    new_state: FireplaceState,
) {
    let snapshot = {
        let mut state = state.lock().unwrap();
        *state = new_state;
        state.clone()
    };
    let _ = update_tx.send(snapshot);
}

// ── Instance controller ──
//
// One controller per firmware-level logical sub-device. Maintains the
// live state snapshot (capability flags, color, brightness, active
// effect, effect catalog), drives a self-rescheduling polling loop,
// and exposes the typed command surface callers mutate state through.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use hyperhdr_api::{AdjustmentKey, Command, Component, InstanceId, Rgb, ServerInfo};

use crate::effects::sort_effects;
use crate::error::CoreError;
use crate::session::{Session, WeakSession};
use crate::state::ComponentStates;

/// Bound on the server-info round trip while connecting.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Steady-state poll interval.
const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Poll interval right after a mutating command, to observe its effect
/// sooner.
const FAST_POLL_INTERVAL: Duration = Duration::from_millis(450);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── Types ───────────────────────────────────────────────────────────

/// Connection state of one instance, observable by consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// What the demultiplexer routes to a controller: either a full
/// server-info report, or the distinguished "administratively stopped"
/// value. Distinct from "no data yet" (`None`).
#[derive(Debug, Clone)]
pub enum InstanceUpdate {
    Report(ServerInfo),
    Stopped,
}

impl InstanceUpdate {
    pub fn is_stopped(&self) -> bool {
        matches!(self, Self::Stopped)
    }
}

#[derive(Default)]
struct InstanceState {
    /// Last routed update; `None` until the first round trip.
    latest: Option<InstanceUpdate>,
    components: ComponentStates,
    /// Diff cache for capability flags. Add/update only -- the firmware
    /// never retracts a component name within a connection.
    component_cache: HashMap<String, bool>,
    color: Option<Rgb>,
    brightness: Option<u8>,
    active_effect: Option<String>,
    /// Catalog, ordered classic-first. Built on first sight and
    /// immutable afterwards.
    effects: Vec<String>,
}

// ── InstanceController ──────────────────────────────────────────────

/// Live state and command surface for one instance.
///
/// Cheaply cloneable. Created by the session when it first discovers
/// the instance id; torn down when the session disconnects.
#[derive(Clone)]
pub struct InstanceController {
    inner: Arc<InstanceInner>,
}

struct InstanceInner {
    id: InstanceId,
    session: WeakSession,
    connection: watch::Sender<ConnectionState>,
    /// Bumped on every visible state change -- the registered
    /// notification.
    changes: watch::Sender<u64>,
    /// Set by mutating commands, cleared by the next notified diff.
    fast_poll: AtomicBool,
    state: Mutex<InstanceState>,
    poll: Mutex<Option<CancellationToken>>,
}

impl InstanceController {
    pub(crate) fn new(session: WeakSession, id: InstanceId) -> Self {
        let (connection, _) = watch::channel(ConnectionState::Disconnected);
        let (changes, _) = watch::channel(0);

        Self {
            inner: Arc::new(InstanceInner {
                id,
                session,
                connection,
                changes,
                fast_poll: AtomicBool::new(false),
                state: Mutex::new(InstanceState::default()),
                poll: Mutex::new(None),
            }),
        }
    }

    pub fn id(&self) -> InstanceId {
        self.inner.id
    }

    fn session(&self) -> Result<Session, CoreError> {
        self.inner.session.upgrade().ok_or(CoreError::Disconnected)
    }

    // ── Connection lifecycle ─────────────────────────────────────

    /// Bring the instance online: one server-info round trip bounded
    /// at the connect timeout, then start the polling loop.
    ///
    /// On timeout the controller transitions to `Disconnected` and
    /// force-applies the stopped sentinel rather than keeping stale
    /// state.
    pub async fn connect(&self) -> Result<(), CoreError> {
        let session = self.session()?;
        if !session.is_connected() {
            return Err(CoreError::Disconnected);
        }

        self.inner.connection.send_replace(ConnectionState::Connecting);

        match tokio::time::timeout(CONNECT_TIMEOUT, self.refresh()).await {
            Ok(Ok(())) => {
                self.inner.connection.send_replace(ConnectionState::Connected);
                self.start_polling();
                Ok(())
            }
            Ok(Err(e)) => {
                self.inner.connection.send_replace(ConnectionState::Disconnected);
                Err(e)
            }
            Err(_) => {
                warn!(instance = %self.inner.id, "no server-info response while connecting");
                self.inner.connection.send_replace(ConnectionState::Disconnected);
                self.apply_update(InstanceUpdate::Stopped);
                Err(CoreError::Timeout {
                    timeout_secs: CONNECT_TIMEOUT.as_secs(),
                })
            }
        }
    }

    /// Mark the instance disconnected and cancel its polling loop.
    /// Synchronous and idempotent; the loop is never restarted
    /// implicitly -- an explicit [`connect`](Self::connect) is required.
    pub fn disconnect(&self) {
        self.inner.connection.send_replace(ConnectionState::Disconnected);
        if let Some(cancel) = lock(&self.inner.poll).take() {
            debug!(instance = %self.inner.id, "cancelling state poll loop");
            cancel.cancel();
        }
    }

    /// Request a fresh server-info snapshot. The response is applied
    /// through the session demultiplexer before this resolves.
    pub async fn refresh(&self) -> Result<(), CoreError> {
        let session = self.session()?;
        session
            .publish(self.inner.id, vec![Command::server_info()], true)
            .await?;
        Ok(())
    }

    fn start_polling(&self) {
        let mut poll = lock(&self.inner.poll);
        if poll.is_some() {
            return;
        }
        let cancel = CancellationToken::new();
        *poll = Some(cancel.clone());
        drop(poll);

        tokio::spawn(poll_loop(self.clone(), cancel));
    }

    // ── Commands ─────────────────────────────────────────────────

    /// Toggle a capability flag.
    pub async fn set_component(&self, component: Component, enabled: bool) -> Result<(), CoreError> {
        self.send(vec![Command::component_state(component, enabled)])
            .await
    }

    /// Administratively start or stop this instance. Goes through the
    /// session channel -- instance 0's view -- since a stopped instance
    /// cannot answer for itself.
    pub async fn set_instance(&self, running: bool) -> Result<(), CoreError> {
        let session = self.session()?;
        let command = if running {
            Command::start_instance(self.inner.id)
        } else {
            Command::stop_instance(self.inner.id)
        };
        self.inner.fast_poll.store(true, Ordering::Relaxed);
        session
            .publish(InstanceId::PRIMARY, vec![command], true)
            .await?;
        Ok(())
    }

    /// Activate a named effect at the configured priority.
    pub async fn set_effect(&self, name: &str) -> Result<(), CoreError> {
        let priority = self.session()?.config().priority;
        self.send(vec![Command::effect(name, priority)]).await
    }

    /// Show a solid color at the configured priority.
    pub async fn set_color(&self, rgb: Rgb) -> Result<(), CoreError> {
        let priority = self.session()?.config().priority;
        self.send(vec![Command::color(rgb, priority)]).await
    }

    /// Patch one calibration parameter without resetting the rest of
    /// the adjustment block.
    pub async fn set_adjustment(
        &self,
        key: AdjustmentKey,
        value: impl Into<serde_json::Value>,
    ) -> Result<(), CoreError> {
        self.send(vec![Command::adjustment(key, value)]).await
    }

    /// Publish several commands as one ordered envelope, applied by
    /// the firmware in order.
    pub async fn send_batch(&self, commands: Vec<Command>) -> Result<(), CoreError> {
        self.send(commands).await
    }

    async fn send(&self, commands: Vec<Command>) -> Result<(), CoreError> {
        let session = self.session()?;
        self.inner.fast_poll.store(true, Ordering::Relaxed);
        session.publish(self.inner.id, commands, true).await?;
        Ok(())
    }

    // ── State accessors ──────────────────────────────────────────

    pub fn components(&self) -> ComponentStates {
        lock(&self.inner.state).components.clone()
    }

    pub fn color(&self) -> Option<Rgb> {
        lock(&self.inner.state).color
    }

    pub fn brightness(&self) -> Option<u8> {
        lock(&self.inner.state).brightness
    }

    pub fn active_effect(&self) -> Option<String> {
        lock(&self.inner.state).active_effect.clone()
    }

    /// Effect catalog, classic effects before music effects.
    pub fn effect_catalog(&self) -> Vec<String> {
        lock(&self.inner.state).effects.clone()
    }

    /// `true` when the firmware declared this instance
    /// administratively stopped (distinct from "no data yet").
    pub fn is_stopped(&self) -> bool {
        lock(&self.inner.state)
            .latest
            .as_ref()
            .is_some_and(InstanceUpdate::is_stopped)
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.inner.connection.borrow()
    }

    /// Observe connection state transitions.
    pub fn connection(&self) -> watch::Receiver<ConnectionState> {
        self.inner.connection.subscribe()
    }

    /// Observe state changes: the value increments on every visible
    /// change (the notification contract).
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.inner.changes.subscribe()
    }

    /// A mutating command was issued and its effect has not been
    /// observed yet.
    pub fn fast_poll_requested(&self) -> bool {
        self.inner.fast_poll.load(Ordering::Relaxed)
    }

    pub fn is_connected(&self) -> bool {
        let session_up = self
            .inner
            .session
            .upgrade()
            .is_some_and(|s| s.is_connected());
        session_up && *self.inner.connection.borrow() == ConnectionState::Connected
    }

    /// Friendly name from the firmware's instance registry.
    pub fn name(&self) -> Option<String> {
        self.inner
            .session
            .upgrade()?
            .instance_descriptor(self.inner.id)?
            .friendly_name
    }

    /// Whether the firmware reports this instance as running. Gated on
    /// connectivity: an unreachable instance is never "running".
    pub fn is_running(&self) -> bool {
        if !self.is_connected() {
            return false;
        }
        self.inner
            .session
            .upgrade()
            .and_then(|s| s.instance_descriptor(self.inner.id))
            .is_some_and(|d| d.running)
    }

    // ── Diff and notify ──────────────────────────────────────────

    /// Apply a routed update: diff against the cached state and notify
    /// observers when anything visible changed.
    pub(crate) fn apply_update(&self, update: InstanceUpdate) {
        match update {
            InstanceUpdate::Stopped => {
                let mut state = lock(&self.inner.state);
                state.latest = Some(InstanceUpdate::Stopped);
                state.component_cache.clear();
                state.components = ComponentStates::default();
                drop(state);
                // A stopped instance is a visible state of its own.
                self.notify();
            }
            InstanceUpdate::Report(info) => {
                let mut dirty = false;
                let mut state = lock(&self.inner.state);

                if state.effects.is_empty() && !info.effects.is_empty() {
                    state.effects = sort_effects(info.effects.iter().map(|e| e.name.clone()));
                }

                if let Some(rgb) = info.active_led_color.first().and_then(|s| s.rgb()) {
                    if state.color != Some(rgb) {
                        state.color = Some(rgb);
                        dirty = true;
                    }
                }

                if let Some(brightness) = info.adjustment.first().and_then(|a| a.brightness) {
                    if state.brightness != Some(brightness) {
                        state.brightness = Some(brightness);
                        dirty = true;
                    }
                }

                let active = info.active_effects.first().map(|e| e.name.clone());
                if state.active_effect != active {
                    state.active_effect = active;
                    dirty = true;
                }

                for entry in &info.components {
                    if state.component_cache.get(&entry.name) != Some(&entry.enabled) {
                        state.component_cache.insert(entry.name.clone(), entry.enabled);
                        dirty = true;
                    }
                }
                if !info.components.is_empty() {
                    state.components = ComponentStates::from_entries(&info.components);
                }

                state.latest = Some(InstanceUpdate::Report(info));
                drop(state);

                if dirty {
                    self.notify();
                }
            }
        }
    }

    fn notify(&self) {
        self.inner.changes.send_modify(|version| *version += 1);
        self.inner.fast_poll.store(false, Ordering::Relaxed);
    }
}

// ── Polling loop ─────────────────────────────────────────────────────

/// Self-rescheduling state poll. Runs until cancelled or faulted; a
/// fault leaves the instance un-polled until the next external
/// reconnect cycle.
async fn poll_loop(controller: InstanceController, cancel: CancellationToken) {
    let instance = controller.id();
    debug!(%instance, "state poll loop started");

    loop {
        let interval = if controller.fast_poll_requested() {
            FAST_POLL_INTERVAL
        } else {
            POLL_INTERVAL
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            () = tokio::time::sleep(interval) => {}
        }

        match controller.refresh().await {
            Ok(()) => {}
            Err(CoreError::Timeout { .. }) => {
                warn!(%instance, "poll timed out, marking instance disconnected");
                controller.disconnect();
                controller.apply_update(InstanceUpdate::Stopped);
                break;
            }
            Err(e) => {
                warn!(%instance, error = %e, "state poll loop faulted");
                break;
            }
        }
    }

    debug!(%instance, "state poll loop exiting");
}

// ── Tests ────────────────────────────────────────────────────────────

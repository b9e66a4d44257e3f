// ── Transport session ──
//
// Owns one broker connection: instance-scoped publish with optional
// wait-for-response semantics, the response demultiplexer, and the
// registry of firmware-reported instances. One session per configured
// broker; instance controllers hang off it.
//
// Response correlation is positional: the firmware envelope carries no
// correlation field, so a FIFO of oneshot waiters is resolved in
// arrival order. Waiters that gave up (bounded timeout) are skipped.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{broadcast, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use hyperhdr_api::{
    Command, InstanceDescriptor, InstanceId, Publication, ResponseEnvelope, ServerInfo, TopicSet,
    Transport, envelope, response,
};

use crate::config::BridgeConfig;
use crate::error::CoreError;
use crate::instance::{InstanceController, InstanceUpdate};

/// Bound on the initial server-info round trip at connect.
const BOOTSTRAP_TIMEOUT: Duration = Duration::from_secs(10);

/// Bound on a single wait-mode publish.
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── Session ─────────────────────────────────────────────────────────

/// One pub/sub connection to a HyperHDR installation.
///
/// Cheaply cloneable via `Arc<SessionInner>`. Created once per
/// configured broker; [`connect`](Self::connect) bootstraps the
/// instance registry and spawns the response demultiplexer.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

pub(crate) struct SessionInner {
    config: BridgeConfig,
    topics: TopicSet,
    transport: Arc<dyn Transport>,
    connected: watch::Sender<bool>,
    /// Session-level snapshot: instance 0's last server-info.
    server_info: Mutex<Option<ServerInfo>>,
    /// Firmware-reported instance registry, refreshed on every message.
    instances: DashMap<InstanceId, InstanceDescriptor>,
    /// One controller per discovered instance id.
    controllers: DashMap<InstanceId, InstanceController>,
    /// Wait-mode publishes pending a response, oldest first.
    waiters: Mutex<VecDeque<oneshot::Sender<ResponseEnvelope>>>,
    demux: Mutex<Option<CancellationToken>>,
}

/// Non-owning session handle held by instance controllers.
#[derive(Clone)]
pub(crate) struct WeakSession(Weak<SessionInner>);

impl WeakSession {
    pub(crate) fn upgrade(&self) -> Option<Session> {
        self.0.upgrade().map(|inner| Session { inner })
    }

    /// A handle that never upgrades. Test scaffolding.
    #[cfg(test)]
    pub(crate) fn detached() -> Self {
        Self(Weak::new())
    }
}

impl Session {
    /// Create a session over an already-built transport. Does NOT
    /// connect -- call [`connect()`](Self::connect).
    pub fn new(config: BridgeConfig, transport: Arc<dyn Transport>) -> Self {
        let topics = TopicSet::new(config.base_topic.clone());
        let (connected, _) = watch::channel(false);

        Self {
            inner: Arc::new(SessionInner {
                config,
                topics,
                transport,
                connected,
                server_info: Mutex::new(None),
                instances: DashMap::new(),
                controllers: DashMap::new(),
                waiters: Mutex::new(VecDeque::new()),
                demux: Mutex::new(None),
            }),
        }
    }

    /// Create a session with the production MQTT link derived from the
    /// configuration.
    pub fn over_mqtt(config: BridgeConfig) -> Self {
        let link = hyperhdr_api::MqttLink::new(config.broker_options());
        Self::new(config, Arc::new(link))
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.inner.config
    }

    pub(crate) fn downgrade(&self) -> WeakSession {
        WeakSession(Arc::downgrade(&self.inner))
    }

    // ── Connection lifecycle ─────────────────────────────────────

    /// Connect to the broker, subscribe to the response topic, and
    /// bootstrap the instance registry with a server-info round trip.
    ///
    /// Fails with [`CoreError::ConnectionFailed`] when the transport
    /// never reports connected, or [`CoreError::Timeout`] when no
    /// server-info response arrives within the bootstrap bound.
    pub async fn connect(&self) -> Result<(), CoreError> {
        let config = &self.inner.config;
        let broker = format!("{}:{}", config.host, config.port);
        debug!(%broker, topic = %config.base_topic, "connecting session");

        self.inner
            .transport
            .connect()
            .await
            .map_err(|e| CoreError::ConnectionFailed {
                broker: broker.clone(),
                reason: e.to_string(),
            })?;

        // Take the message stream before subscribing so nothing the
        // firmware sends can slip past the demultiplexer.
        let messages = self.inner.transport.messages();
        self.inner
            .transport
            .subscribe(&self.inner.topics.response())
            .await
            .map_err(CoreError::from)?;

        let cancel = CancellationToken::new();
        if let Some(previous) = lock(&self.inner.demux).replace(cancel.clone()) {
            previous.cancel();
        }
        tokio::spawn(demux_loop(
            self.downgrade(),
            messages,
            self.inner.topics.response(),
            cancel,
        ));

        // Bootstrap: ask for server info until the session snapshot
        // exists, bounded as a whole.
        let bootstrap = async {
            loop {
                match self
                    .publish(InstanceId::PRIMARY, vec![Command::server_info()], true)
                    .await
                {
                    Ok(_) | Err(CoreError::Timeout { .. }) => {}
                    Err(e) => return Err(e),
                }
                if lock(&self.inner.server_info).is_some() {
                    return Ok(());
                }
            }
        };
        match tokio::time::timeout(BOOTSTRAP_TIMEOUT, bootstrap).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(CoreError::Timeout {
                    timeout_secs: BOOTSTRAP_TIMEOUT.as_secs(),
                });
            }
        }

        self.inner.connected.send_replace(true);
        info!(
            %broker,
            instances = self.inner.instances.len(),
            "session connected"
        );
        Ok(())
    }

    /// Tear the session down: stop the demultiplexer, shut down and
    /// drop every controller, unsubscribe, disconnect the transport.
    pub async fn disconnect(&self) {
        debug!(topic = %self.inner.config.base_topic, "disconnecting session");

        if let Some(cancel) = lock(&self.inner.demux).take() {
            cancel.cancel();
        }

        for controller in self.inner.controllers.iter() {
            controller.value().disconnect();
        }
        self.inner.controllers.clear();
        self.inner.instances.clear();
        lock(&self.inner.waiters).clear();
        *lock(&self.inner.server_info) = None;

        if let Err(e) = self
            .inner
            .transport
            .unsubscribe(&self.inner.topics.response())
            .await
        {
            warn!(error = %e, "unsubscribe failed (non-fatal)");
        }
        let _ = self.inner.transport.disconnect().await;
        self.inner.connected.send_replace(false);
    }

    /// `true` once the transport is up and the bootstrap round trip
    /// has completed. The external supervisor polls this to decide
    /// when to invoke [`connect`](Self::connect) again.
    pub fn is_connected(&self) -> bool {
        self.inner.transport.is_connected() && *self.inner.connected.borrow()
    }

    /// Observe session connectivity changes.
    pub fn connection(&self) -> watch::Receiver<bool> {
        self.inner.connected.subscribe()
    }

    // ── Publish ──────────────────────────────────────────────────

    /// Publish commands for an instance, prefixed with the
    /// instance-selection directive and applied by the firmware in
    /// order.
    ///
    /// In wait mode the call resolves with the next response envelope
    /// or [`CoreError::Timeout`] after the response bound.
    pub async fn publish(
        &self,
        instance: InstanceId,
        commands: Vec<Command>,
        wait: bool,
    ) -> Result<Option<ResponseEnvelope>, CoreError> {
        if !self.inner.transport.is_connected() {
            debug!(%instance, "dropping publish, broker not connected");
            return Err(CoreError::Disconnected);
        }

        let payload = serde_json::to_vec(&envelope(instance, commands))
            .map_err(|e| CoreError::Internal(format!("Serialization error: {e}")))?;

        let waiter = wait.then(|| {
            let (tx, rx) = oneshot::channel();
            lock(&self.inner.waiters).push_back(tx);
            rx
        });

        debug!(%instance, bytes = payload.len(), "publishing command envelope");
        self.inner
            .transport
            .publish(&self.inner.topics.command(), payload)
            .await
            .map_err(CoreError::from)?;

        let Some(rx) = waiter else { return Ok(None) };
        match tokio::time::timeout(RESPONSE_TIMEOUT, rx).await {
            Ok(Ok(response)) => Ok(Some(response)),
            Ok(Err(_)) => Err(CoreError::Disconnected),
            Err(_) => Err(CoreError::Timeout {
                timeout_secs: RESPONSE_TIMEOUT.as_secs(),
            }),
        }
    }

    // ── Registry accessors ───────────────────────────────────────

    /// Firmware-reported descriptors, ordered by instance id.
    pub fn instances(&self) -> Vec<InstanceDescriptor> {
        let mut descriptors: Vec<_> = self
            .inner
            .instances
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        descriptors.sort_by_key(|d| d.instance);
        descriptors
    }

    pub fn instance_descriptor(&self, id: InstanceId) -> Option<InstanceDescriptor> {
        self.inner.instances.get(&id).map(|d| d.value().clone())
    }

    /// Controller for one instance, if discovered.
    pub fn controller(&self, id: InstanceId) -> Option<InstanceController> {
        self.inner.controllers.get(&id).map(|c| c.value().clone())
    }

    /// All controllers, ordered by instance id.
    pub fn controllers(&self) -> Vec<InstanceController> {
        let mut controllers: Vec<_> = self
            .inner
            .controllers
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        controllers.sort_by_key(InstanceController::id);
        controllers
    }

    /// The session-level snapshot (instance 0's last server-info).
    pub fn server_info(&self) -> Option<ServerInfo> {
        lock(&self.inner.server_info).clone()
    }

    // ── Demultiplexer ────────────────────────────────────────────

    /// Process one inbound response payload to completion.
    fn handle_message(&self, payload: &[u8]) {
        let envelope = match response::decode(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!(error = %e, "ignoring undecodable response payload");
                return;
            }
        };

        // Route snapshots before waking the waiter, so a caller in
        // wait mode observes the applied state when its publish
        // resolves.
        if let ResponseEnvelope::Batch(responses) = &envelope {
            for response in responses {
                if !response.is_server_info() {
                    continue;
                }
                if response.is_not_ready() {
                    self.apply_stopped_instances();
                    continue;
                }
                let Some(info) = &response.info else { continue };

                self.sync_registry(&info.instance);

                let Some(current) = info.current_instance else {
                    continue;
                };
                if current.is_primary() {
                    *lock(&self.inner.server_info) = Some(info.clone());
                }
                if let Some(controller) = self.inner.controllers.get(&current) {
                    controller.apply_update(InstanceUpdate::Report(info.clone()));
                }
            }
        }

        self.resolve_waiter(envelope);
    }

    /// The firmware answered "Not ready": every registered instance
    /// whose descriptor reports not-running is administratively
    /// stopped.
    fn apply_stopped_instances(&self) {
        for entry in self.inner.instances.iter() {
            if entry.value().running {
                continue;
            }
            if let Some(controller) = self.inner.controllers.get(entry.key()) {
                debug!(instance = %entry.key(), "instance reported stopped");
                controller.apply_update(InstanceUpdate::Stopped);
            }
        }
    }

    /// Refresh the registry and create controllers for newly
    /// discovered instance ids.
    fn sync_registry(&self, descriptors: &[InstanceDescriptor]) {
        for descriptor in descriptors {
            let id = descriptor.instance;
            self.inner.instances.insert(id, descriptor.clone());
            if !self.inner.controllers.contains_key(&id) {
                debug!(instance = %id, "discovered instance");
                self.inner
                    .controllers
                    .insert(id, InstanceController::new(self.downgrade(), id));
            }
        }
    }

    /// Hand the envelope to the oldest waiter still listening.
    fn resolve_waiter(&self, mut envelope: ResponseEnvelope) {
        let mut waiters = lock(&self.inner.waiters);
        while let Some(waiter) = waiters.pop_front() {
            match waiter.send(envelope) {
                Ok(()) => return,
                // That waiter timed out and dropped its receiver; the
                // envelope goes to the next one.
                Err(returned) => envelope = returned,
            }
        }
    }
}

// ── Background delivery loop ─────────────────────────────────────────

/// Forward response-topic messages into the session, one at a time,
/// until cancelled or the session is dropped.
async fn demux_loop(
    session: WeakSession,
    mut messages: broadcast::Receiver<Publication>,
    response_topic: String,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            received = messages.recv() => match received {
                Ok(publication) => {
                    if publication.topic != response_topic {
                        continue;
                    }
                    let Some(session) = session.upgrade() else { break };
                    session.handle_message(&publication.payload);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "response stream lagged, messages dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
    debug!("response demultiplexer exiting");
}

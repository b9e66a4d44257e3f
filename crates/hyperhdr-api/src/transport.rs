// ── MQTT transport ──
//
// The one seam between the protocol core and the outside world. The
// `Transport` trait is exactly what the session layer needs from a
// pub/sub broker link: connect, subscribe, publish, a message stream,
// and a connectivity query. `MqttLink` is the production
// implementation on rumqttc; tests substitute an in-process fake.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::{Mutex, broadcast, watch};
use tokio_util::sync::CancellationToken;

use crate::error::Error;

const MESSAGE_CHANNEL_CAPACITY: usize = 256;
const REQUEST_QUEUE_CAPACITY: usize = 64;
const CONNACK_TIMEOUT: Duration = Duration::from_secs(10);
const POLL_ERROR_PAUSE: Duration = Duration::from_secs(1);

// ── Types ───────────────────────────────────────────────────────────

/// An inbound message delivered by the broker.
#[derive(Debug, Clone)]
pub struct Publication {
    pub topic: String,
    pub payload: Bytes,
}

/// Broker connection parameters.
#[derive(Debug, Clone)]
pub struct BrokerOptions {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<SecretString>,
    pub keep_alive: Duration,
}

impl BrokerOptions {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }
}

impl Default for BrokerOptions {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 1883,
            client_id: "hyperhdr-bridge".into(),
            username: None,
            password: None,
            keep_alive: Duration::from_secs(30),
        }
    }
}

// ── Transport trait ─────────────────────────────────────────────────

/// What the session layer requires from a pub/sub link.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish the connection. Resolves once the broker has
    /// acknowledged it, or fails with [`Error::ConnectionFailed`].
    async fn connect(&self) -> Result<(), Error>;

    /// Tear the connection down and stop background delivery.
    async fn disconnect(&self) -> Result<(), Error>;

    async fn subscribe(&self, topic: &str) -> Result<(), Error>;

    async fn unsubscribe(&self, topic: &str) -> Result<(), Error>;

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), Error>;

    fn is_connected(&self) -> bool;

    /// Subscribe to the inbound message stream. Only messages arriving
    /// after the call are delivered.
    fn messages(&self) -> broadcast::Receiver<Publication>;
}

// ── MqttLink ────────────────────────────────────────────────────────

/// Production [`Transport`] backed by rumqttc.
///
/// `connect()` spawns a driver task that polls the rumqttc event loop,
/// fans inbound publishes out through a broadcast channel, and tracks
/// connectivity from ConnAck/error transitions. The event loop re-dials
/// the broker on its own while polled; deciding *when* to rebuild
/// sessions on top of it stays with the caller.
pub struct MqttLink {
    options: BrokerOptions,
    client: Mutex<Option<AsyncClient>>,
    connected: watch::Sender<bool>,
    message_tx: broadcast::Sender<Publication>,
    cancel: Mutex<Option<CancellationToken>>,
}

impl MqttLink {
    pub fn new(options: BrokerOptions) -> Self {
        let (connected, _) = watch::channel(false);
        let (message_tx, _) = broadcast::channel(MESSAGE_CHANNEL_CAPACITY);

        Self {
            options,
            client: Mutex::new(None),
            connected,
            message_tx,
            cancel: Mutex::new(None),
        }
    }

    async fn client_handle(&self) -> Result<AsyncClient, Error> {
        self.client.lock().await.clone().ok_or(Error::NotConnected)
    }
}

#[async_trait]
impl Transport for MqttLink {
    async fn connect(&self) -> Result<(), Error> {
        let opts = &self.options;
        tracing::debug!(host = %opts.host, port = opts.port, "connecting to broker");

        let mut mqtt = MqttOptions::new(&opts.client_id, &opts.host, opts.port);
        mqtt.set_keep_alive(opts.keep_alive);
        if let Some(username) = &opts.username {
            let password = opts
                .password
                .as_ref()
                .map(|p| p.expose_secret().to_owned())
                .unwrap_or_default();
            mqtt.set_credentials(username, password);
        }

        let (client, event_loop) = AsyncClient::new(mqtt, REQUEST_QUEUE_CAPACITY);

        let cancel = CancellationToken::new();
        if let Some(previous) = self.cancel.lock().await.replace(cancel.clone()) {
            previous.cancel();
        }
        *self.client.lock().await = Some(client);

        tokio::spawn(driver_loop(
            event_loop,
            self.message_tx.clone(),
            self.connected.clone(),
            cancel,
        ));

        // Wait for the broker to acknowledge before reporting success.
        let mut rx = self.connected.subscribe();
        let acked = tokio::time::timeout(CONNACK_TIMEOUT, rx.wait_for(|up| *up)).await;
        match acked {
            Ok(Ok(_)) => {
                tracing::info!(host = %opts.host, port = opts.port, "broker connected");
                Ok(())
            }
            Ok(Err(_)) => Err(Error::ConnectionFailed {
                reason: "driver task ended before ConnAck".into(),
            }),
            Err(_) => Err(Error::ConnectionFailed {
                reason: format!("no ConnAck within {}s", CONNACK_TIMEOUT.as_secs()),
            }),
        }
    }

    async fn disconnect(&self) -> Result<(), Error> {
        if let Some(cancel) = self.cancel.lock().await.take() {
            cancel.cancel();
        }
        if let Some(client) = self.client.lock().await.take() {
            // The driver is already cancelled; a failed DISCONNECT send
            // just means the socket is gone.
            let _ = client.disconnect().await;
        }
        self.connected.send_replace(false);
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<(), Error> {
        let client = self.client_handle().await?;
        client.subscribe(topic, QoS::AtMostOnce).await?;
        tracing::debug!(topic, "subscribed");
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), Error> {
        let client = self.client_handle().await?;
        client.unsubscribe(topic).await?;
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), Error> {
        let client = self.client_handle().await?;
        client.publish(topic, QoS::AtMostOnce, false, payload).await?;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    fn messages(&self) -> broadcast::Receiver<Publication> {
        self.message_tx.subscribe()
    }
}

// ── Driver loop ─────────────────────────────────────────────────────

/// Poll the rumqttc event loop until cancelled, forwarding publishes
/// and tracking connectivity.
async fn driver_loop(
    mut event_loop: EventLoop,
    message_tx: broadcast::Sender<Publication>,
    connected: watch::Sender<bool>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = event_loop.poll() => match event {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    connected.send_replace(true);
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let _ = message_tx.send(Publication {
                        topic: publish.topic,
                        payload: publish.payload,
                    });
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    connected.send_replace(false);
                }
                Ok(_) => {}
                Err(e) => {
                    connected.send_replace(false);
                    tracing::warn!(error = %e, "MQTT event loop error");
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        () = tokio::time::sleep(POLL_ERROR_PAUSE) => {}
                    }
                }
            }
        }
    }

    connected.send_replace(false);
    tracing::debug!("MQTT driver loop exiting");
}

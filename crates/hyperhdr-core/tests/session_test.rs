// Integration tests for `Session` + `InstanceController` over an
// in-process mock transport. The mock answers publishes from a
// scripted responder, so whole round trips run without a broker.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use tokio::sync::{broadcast, watch};

use hyperhdr_api::{Error as ApiError, Publication, Transport};
use hyperhdr_core::{
    AdjustmentKey, BridgeConfig, Command, Component, ConnectionState, CoreError, InstanceId,
    Session,
};

// ── Mock transport ──────────────────────────────────────────────────

type Responder = Box<dyn Fn(&[u8]) -> Option<Vec<u8>> + Send + Sync>;

struct MockBroker {
    refuse_connect: bool,
    connected: watch::Sender<bool>,
    published: Mutex<Vec<Vec<u8>>>,
    responder: Responder,
    message_tx: broadcast::Sender<Publication>,
    response_topic: String,
}

impl MockBroker {
    fn new(responder: Responder) -> Arc<Self> {
        let (connected, _) = watch::channel(false);
        let (message_tx, _) = broadcast::channel(64);
        Arc::new(Self {
            refuse_connect: false,
            connected,
            published: Mutex::new(Vec::new()),
            responder,
            message_tx,
            response_topic: "HyperHDR/JsonAPI/response".into(),
        })
    }

    fn refusing() -> Arc<Self> {
        let (connected, _) = watch::channel(false);
        let (message_tx, _) = broadcast::channel(64);
        Arc::new(Self {
            refuse_connect: true,
            connected,
            published: Mutex::new(Vec::new()),
            responder: Box::new(|_| None),
            message_tx,
            response_topic: "HyperHDR/JsonAPI/response".into(),
        })
    }

    /// Push a payload onto the response topic out-of-band.
    fn inject(&self, payload: Vec<u8>) {
        let _ = self.message_tx.send(Publication {
            topic: self.response_topic.clone(),
            payload: payload.into(),
        });
    }

    fn last_published(&self) -> Value {
        let published = self.published.lock().unwrap();
        serde_json::from_slice(published.last().expect("nothing published")).unwrap()
    }
}

#[async_trait]
impl Transport for MockBroker {
    async fn connect(&self) -> Result<(), ApiError> {
        if self.refuse_connect {
            return Err(ApiError::ConnectionFailed {
                reason: "connection refused".into(),
            });
        }
        self.connected.send_replace(true);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), ApiError> {
        self.connected.send_replace(false);
        Ok(())
    }

    async fn subscribe(&self, _topic: &str) -> Result<(), ApiError> {
        Ok(())
    }

    async fn unsubscribe(&self, _topic: &str) -> Result<(), ApiError> {
        Ok(())
    }

    async fn publish(&self, _topic: &str, payload: Vec<u8>) -> Result<(), ApiError> {
        self.published.lock().unwrap().push(payload.clone());
        if let Some(reply) = (self.responder)(&payload) {
            self.inject(reply);
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    fn messages(&self) -> broadcast::Receiver<Publication> {
        self.message_tx.subscribe()
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

fn config() -> BridgeConfig {
    BridgeConfig {
        host: "broker.local".into(),
        ..BridgeConfig::default()
    }
}

fn server_info_reply(current: u8, instances: &[(u8, bool, &str)]) -> Value {
    let rows: Vec<Value> = instances
        .iter()
        .map(|(id, running, name)| {
            json!({ "instance": id, "running": running, "friendly_name": name })
        })
        .collect();

    json!([{
        "command": "serverinfo",
        "success": true,
        "info": {
            "instance": rows,
            "currentInstance": current,
            "effects": [ { "name": "Rainbow swirl" }, { "name": "Music: pulse" } ],
            "activeLedColor": [ { "RGB Value": [255, 0, 0] } ],
            "adjustment": [ { "brightness": 80 } ],
            "activeEffects": [],
            "components": [
                { "name": "ALL", "enabled": true },
                { "name": "LEDDEVICE", "enabled": true },
            ],
        },
    }])
}

/// Answer server-info requests for whichever instance the envelope
/// switched to; ack everything else.
fn echo_responder(instances: Vec<(u8, bool, &'static str)>) -> Responder {
    Box::new(move |payload| {
        let envelope: Value = serde_json::from_slice(payload).ok()?;
        let commands = envelope.as_array()?;
        let target = commands.first()?["instance"].as_u64()? as u8;
        if commands.iter().any(|c| c["command"] == "serverinfo") {
            Some(serde_json::to_vec(&server_info_reply(target, &instances)).unwrap())
        } else {
            Some(br#"{ "success": true }"#.to_vec())
        }
    })
}

/// Let the demultiplexer task drain injected messages.
async fn settle() {
    for _ in 0..100 {
        tokio::task::yield_now().await;
    }
}

// ── Connection lifecycle ────────────────────────────────────────────

#[tokio::test]
async fn connect_discovers_instances() {
    let broker = MockBroker::new(echo_responder(vec![(0, true, "Primary"), (2, true, "Desk")]));
    let session = Session::new(config(), broker.clone());

    session.connect().await.unwrap();

    assert!(session.is_connected());
    assert!(session.server_info().is_some());

    let ids: Vec<InstanceId> = session.instances().iter().map(|d| d.instance).collect();
    assert_eq!(ids, [InstanceId(0), InstanceId(2)]);

    let desk = session.controller(InstanceId(2)).unwrap();
    assert_eq!(desk.name().as_deref(), Some("Desk"));
}

#[tokio::test]
async fn connect_fails_when_broker_refuses() {
    let broker = MockBroker::refusing();
    let session = Session::new(config(), broker);

    let err = session.connect().await.unwrap_err();
    assert!(matches!(err, CoreError::ConnectionFailed { .. }));
    assert!(!session.is_connected());
}

#[tokio::test(start_paused = true)]
async fn connect_times_out_without_response() {
    let broker = MockBroker::new(Box::new(|_| None));
    let session = Session::new(config(), broker);

    let err = session.connect().await.unwrap_err();
    assert!(matches!(err, CoreError::Timeout { .. }));
    assert!(!session.is_connected());
}

#[tokio::test]
async fn disconnect_tears_down_controllers() {
    let broker = MockBroker::new(echo_responder(vec![(0, true, "Primary"), (1, true, "Desk")]));
    let session = Session::new(config(), broker);
    session.connect().await.unwrap();
    let controller = session.controller(InstanceId(1)).unwrap();
    controller.connect().await.unwrap();

    session.disconnect().await;

    assert!(!session.is_connected());
    assert!(session.controllers().is_empty());
    assert!(session.server_info().is_none());
    assert_eq!(controller.connection_state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn instance_connect_round_trip() {
    let broker = MockBroker::new(echo_responder(vec![(0, true, "Primary"), (1, true, "Desk")]));
    let session = Session::new(config(), broker);
    session.connect().await.unwrap();

    let controller = session.controller(InstanceId(1)).unwrap();
    controller.connect().await.unwrap();

    assert_eq!(controller.connection_state(), ConnectionState::Connected);
    assert!(controller.is_connected());
    assert!(controller.is_running());
    assert_eq!(controller.brightness(), Some(80));
    assert_eq!(controller.color(), Some([255, 0, 0]));
    assert_eq!(controller.effect_catalog(), ["Rainbow swirl", "Music: pulse"]);
}

// ── Command envelopes ───────────────────────────────────────────────

#[tokio::test]
async fn component_toggle_publishes_switch_to_envelope() {
    let broker = MockBroker::new(echo_responder(vec![(0, true, "Primary"), (2, true, "Desk")]));
    let session = Session::new(config(), broker.clone());
    session.connect().await.unwrap();

    let controller = session.controller(InstanceId(2)).unwrap();
    controller
        .set_component(Component::Leddevice, true)
        .await
        .unwrap();

    assert_eq!(
        broker.last_published(),
        json!([
            { "command": "instance", "subcommand": "switchTo", "instance": 2 },
            {
                "command": "componentstate",
                "componentstate": { "component": "LEDDEVICE", "state": true }
            },
        ])
    );
    assert!(controller.fast_poll_requested());
}

#[tokio::test]
async fn adjustment_patches_single_key() {
    let broker = MockBroker::new(echo_responder(vec![(0, true, "Primary")]));
    let session = Session::new(config(), broker.clone());
    session.connect().await.unwrap();

    let controller = session.controller(InstanceId(0)).unwrap();
    controller
        .set_adjustment(AdjustmentKey::Brightness, 80)
        .await
        .unwrap();

    let envelope = broker.last_published();
    assert_eq!(
        envelope[1],
        json!({
            "command": "adjustment",
            "adjustment": { "classic_config": false, "brightness": 80 }
        })
    );
}

#[tokio::test]
async fn effect_and_color_use_configured_priority() {
    let broker = MockBroker::new(echo_responder(vec![(0, true, "Primary")]));
    let mut cfg = config();
    cfg.priority = 128;
    let session = Session::new(cfg, broker.clone());
    session.connect().await.unwrap();

    let controller = session.controller(InstanceId(0)).unwrap();

    controller.set_effect("Rainbow swirl").await.unwrap();
    let envelope = broker.last_published();
    assert_eq!(envelope[1]["priority"], 128);
    assert_eq!(envelope[1]["origin"], "JSON API");
    assert_eq!(envelope[1]["duration"], 0);

    controller.set_color([0, 255, 0]).await.unwrap();
    let envelope = broker.last_published();
    assert_eq!(envelope[1]["color"], json!([0, 255, 0]));
    assert_eq!(envelope[1]["priority"], 128);
}

#[tokio::test]
async fn set_instance_goes_through_session_channel() {
    let broker = MockBroker::new(echo_responder(vec![(0, true, "Primary"), (1, true, "Desk")]));
    let session = Session::new(config(), broker.clone());
    session.connect().await.unwrap();

    let controller = session.controller(InstanceId(1)).unwrap();
    controller.set_instance(false).await.unwrap();

    assert_eq!(
        broker.last_published(),
        json!([
            { "command": "instance", "subcommand": "switchTo", "instance": 0 },
            { "command": "instance", "subcommand": "stopInstance", "instance": 1 },
        ])
    );
    assert!(controller.fast_poll_requested());
}

#[tokio::test]
async fn batch_publishes_one_ordered_envelope() {
    let broker = MockBroker::new(echo_responder(vec![(0, true, "Primary")]));
    let session = Session::new(config(), broker.clone());
    session.connect().await.unwrap();

    let controller = session.controller(InstanceId(0)).unwrap();
    let published_before = {
        let published = broker.published.lock().unwrap();
        published.len()
    };

    controller
        .send_batch(vec![
            Command::component_state(Component::Smoothing, false),
            Command::color([0, 0, 0], 50),
        ])
        .await
        .unwrap();

    let published_after = broker.published.lock().unwrap().len();
    assert_eq!(published_after, published_before + 1);

    let commands: Vec<String> = broker
        .last_published()
        .as_array()
        .unwrap()
        .iter()
        .map(|c| c["command"].as_str().unwrap().to_owned())
        .collect();
    assert_eq!(commands, ["instance", "componentstate", "color"]);
}

// ── Routing and state transitions ───────────────────────────────────

#[tokio::test]
async fn not_ready_routes_stopped_sentinel() {
    let broker = MockBroker::new(echo_responder(vec![(0, true, "Primary"), (1, true, "Desk")]));
    let session = Session::new(config(), broker.clone());
    session.connect().await.unwrap();

    let controller = session.controller(InstanceId(1)).unwrap();

    // Seed instance 1 with a non-empty snapshot.
    broker.inject(
        serde_json::to_vec(&server_info_reply(1, &[(0, true, "Primary"), (1, true, "Desk")]))
            .unwrap(),
    );
    settle().await;
    assert!(controller.components().leddevice());

    let changes = controller.changes();
    let before = *changes.borrow();

    // Registry flips to not-running, then the firmware reports the
    // stopped instance as not ready.
    broker.inject(
        serde_json::to_vec(&server_info_reply(0, &[(0, true, "Primary"), (1, false, "Desk")]))
            .unwrap(),
    );
    settle().await;
    broker.inject(
        serde_json::to_vec(&json!([
            { "command": "serverinfo", "success": false, "error": "Not ready" }
        ]))
        .unwrap(),
    );
    settle().await;

    assert!(controller.is_stopped());
    assert!(controller.components().is_empty());
    assert_eq!(*changes.borrow(), before + 1);
}

#[tokio::test]
async fn reapplied_snapshot_notifies_only_once() {
    let broker = MockBroker::new(echo_responder(vec![(0, true, "Primary"), (1, true, "Desk")]));
    let session = Session::new(config(), broker.clone());
    session.connect().await.unwrap();

    let controller = session.controller(InstanceId(1)).unwrap();
    let changes = controller.changes();

    let snapshot =
        serde_json::to_vec(&server_info_reply(1, &[(0, true, "Primary"), (1, true, "Desk")]))
            .unwrap();
    broker.inject(snapshot.clone());
    settle().await;
    let after_first = *changes.borrow();

    broker.inject(snapshot);
    settle().await;

    assert_eq!(*changes.borrow(), after_first);
}

#[tokio::test]
async fn primary_snapshot_updates_session_slot() {
    let broker = MockBroker::new(echo_responder(vec![(0, true, "Primary"), (1, true, "Desk")]));
    let session = Session::new(config(), broker.clone());
    session.connect().await.unwrap();

    // A snapshot for instance 1 must not replace the session slot.
    broker.inject(
        serde_json::to_vec(&server_info_reply(1, &[(0, true, "Primary"), (1, true, "Desk")]))
            .unwrap(),
    );
    settle().await;

    let info = session.server_info().unwrap();
    assert_eq!(info.current_instance, Some(InstanceId(0)));
}

#[tokio::test]
async fn malformed_payload_is_ignored() {
    let broker = MockBroker::new(echo_responder(vec![(0, true, "Primary")]));
    let session = Session::new(config(), broker.clone());
    session.connect().await.unwrap();

    broker.inject(b"not json at all".to_vec());
    settle().await;

    // The session keeps working afterwards.
    let controller = session.controller(InstanceId(0)).unwrap();
    controller.refresh().await.unwrap();
    assert!(session.is_connected());
}

#[tokio::test(start_paused = true)]
async fn poll_timeout_disconnects_instance() {
    // Reply to the first two server-info requests (session bootstrap
    // and instance connect), then go silent so the poll loop times out.
    let answered = Arc::new(AtomicUsize::new(0));
    let counter = answered.clone();
    let responder: Responder = Box::new(move |payload| {
        let envelope: Value = serde_json::from_slice(payload).ok()?;
        let commands = envelope.as_array()?;
        if commands.iter().any(|c| c["command"] == "serverinfo") {
            if counter.fetch_add(1, Ordering::SeqCst) >= 2 {
                return None;
            }
            let target = commands.first()?["instance"].as_u64()? as u8;
            return Some(
                serde_json::to_vec(&server_info_reply(
                    target,
                    &[(0, true, "Primary"), (1, true, "Desk")],
                ))
                .unwrap(),
            );
        }
        Some(br#"{ "success": true }"#.to_vec())
    });

    let broker = MockBroker::new(responder);
    let session = Session::new(config(), broker);
    session.connect().await.unwrap();

    let controller = session.controller(InstanceId(1)).unwrap();
    controller.connect().await.unwrap();
    assert_eq!(controller.connection_state(), ConnectionState::Connected);

    // The poll loop fires after the steady interval, gets no answer,
    // and marks the instance disconnected with the stopped sentinel.
    tokio::time::timeout(Duration::from_secs(60), async {
        while controller.connection_state() != ConnectionState::Disconnected {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .expect("instance never disconnected");

    assert!(controller.is_stopped());
}

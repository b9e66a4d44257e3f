// hyperhdr-api: wire protocol and MQTT transport for the HyperHDR JSON API.
//
// The firmware speaks JSON over a command/response topic pair. This
// crate owns the payload shapes in both directions plus the broker
// link; `hyperhdr-core` builds sessions and instance controllers on
// top of it.

pub mod command;
pub mod error;
pub mod response;
pub mod topic;
pub mod transport;

// ── Primary re-exports ──────────────────────────────────────────────
pub use command::{
    AdjustmentKey, Command, Component, InstanceId, InstanceSubcommand, ORIGIN_JSON_API, Rgb,
    envelope,
};
pub use error::Error;
pub use response::{
    Ack, ActiveEffect, AdjustmentState, CommandResponse, ComponentEntry, ERROR_NOT_READY,
    EffectEntry, InstanceDescriptor, LedColorSample, ResponseEnvelope, ServerInfo, decode,
};
pub use topic::TopicSet;
pub use transport::{BrokerOptions, MqttLink, Publication, Transport};

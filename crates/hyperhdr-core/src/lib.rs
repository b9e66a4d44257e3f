// hyperhdr-core: stateful session and per-instance control on top of
// the hyperhdr-api wire layer.
//
// The embedding application builds a `BridgeConfig`, connects a
// `Session`, and drives the `InstanceController`s the session
// discovers. Reconnect policy lives outside: poll `is_connected()` and
// call `connect()` again when it goes false.

pub mod config;
pub mod effects;
pub mod error;
pub mod instance;
pub mod session;
pub mod state;

// ── Primary re-exports ──────────────────────────────────────────────
pub use config::BridgeConfig;
pub use effects::sort_effects;
pub use error::CoreError;
pub use instance::{ConnectionState, InstanceController, InstanceUpdate};
pub use session::Session;
pub use state::ComponentStates;

// Wire vocabulary callers need alongside the core types.
pub use hyperhdr_api::{
    AdjustmentKey, Command, Component, InstanceDescriptor, InstanceId, Rgb, ServerInfo,
};

// ── Core error types ──
//
// User-facing errors from hyperhdr-core. Consumers never see MQTT
// client errors or JSON parse failures directly; the
// `From<hyperhdr_api::Error>` impl translates wire-layer failures into
// domain-appropriate variants. An administratively stopped instance is
// NOT an error -- it is a sentinel state (`InstanceUpdate::Stopped`).

use thiserror::Error;

/// Unified error type for the core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    // ── Connection errors ────────────────────────────────────────────
    #[error("Cannot connect to broker {broker}: {reason}")]
    ConnectionFailed { broker: String, reason: String },

    /// A bounded wait for a device response expired. Repeated timeouts
    /// are the caller's disconnect signal.
    #[error("No response from device within {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("Session disconnected")]
    Disconnected,

    // ── Configuration errors ─────────────────────────────────────────
    #[error("Configuration error: {message}")]
    Config { message: String },

    // ── Wire errors (wrapped, not exposed raw) ───────────────────────
    #[error("Transport error: {message}")]
    Transport { message: String },

    // ── Internal errors ──────────────────────────────────────────────
    #[error("Internal error: {0}")]
    Internal(String),
}

// ── Conversion from wire-layer errors ────────────────────────────────

impl From<hyperhdr_api::Error> for CoreError {
    fn from(err: hyperhdr_api::Error) -> Self {
        match err {
            hyperhdr_api::Error::ConnectionFailed { reason } => CoreError::ConnectionFailed {
                broker: "<unknown>".into(),
                reason,
            },
            hyperhdr_api::Error::NotConnected => CoreError::Disconnected,
            hyperhdr_api::Error::Timeout { timeout_secs } => CoreError::Timeout { timeout_secs },
            hyperhdr_api::Error::Client(e) => CoreError::Transport {
                message: e.to_string(),
            },
            hyperhdr_api::Error::Serialization(e) => {
                CoreError::Internal(format!("Serialization error: {e}"))
            }
            hyperhdr_api::Error::Deserialization { message, body: _ } => {
                CoreError::Internal(format!("Deserialization error: {message}"))
            }
        }
    }
}

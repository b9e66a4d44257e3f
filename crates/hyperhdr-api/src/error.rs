use thiserror::Error;

/// Top-level error type for the `hyperhdr-api` crate.
///
/// Covers transport-level failures (broker connection, MQTT client calls)
/// and wire-format failures. `hyperhdr-core` maps these into its own
/// user-facing diagnostics.
#[derive(Debug, Error)]
pub enum Error {
    // ── Connection ──────────────────────────────────────────────────
    /// The broker never acknowledged the connection attempt.
    #[error("Broker connection failed: {reason}")]
    ConnectionFailed { reason: String },

    /// An operation was attempted while the link was down.
    #[error("Not connected to broker")]
    NotConnected,

    /// A bounded wait expired.
    #[error("Timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    // ── MQTT client ─────────────────────────────────────────────────
    /// Error surfaced by the underlying MQTT client (publish queue full,
    /// client dropped, etc.)
    #[error("MQTT client error: {0}")]
    Client(#[from] rumqttc::ClientError),

    // ── Data ────────────────────────────────────────────────────────
    /// Payload serialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Inbound payload did not match any known envelope shape.
    /// Carries the raw body for debugging.
    #[error("Deserialization error: {message}")]
    Deserialization { message: String, body: String },
}

impl Error {
    /// Returns `true` if this is a transient error worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ConnectionFailed { .. } | Self::NotConnected | Self::Timeout { .. }
        )
    }
}

// ── Inbound response envelope ──
//
// The firmware answers on the response topic with one of two shapes:
// a single ack object carrying `success`, or a list of per-command
// results. Server-info results embed the full state snapshot. Every
// field is default-tolerant -- firmware builds differ in what they
// include.

use serde::Deserialize;

use crate::command::InstanceId;
use crate::error::Error;

/// Error string the firmware reports for an instance that is
/// administratively stopped.
pub const ERROR_NOT_READY: &str = "Not ready";

const SERVERINFO: &str = "serverinfo";

// ── Envelope ────────────────────────────────────────────────────────

/// Any payload arriving on the response topic.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ResponseEnvelope {
    /// A list of per-command results.
    Batch(Vec<CommandResponse>),
    /// A single result object.
    Ack(Ack),
}

/// A bare result object.
#[derive(Debug, Clone, Deserialize)]
pub struct Ack {
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
}

/// One entry of a batched response.
#[derive(Debug, Clone, Deserialize)]
pub struct CommandResponse {
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub info: Option<ServerInfo>,
}

impl CommandResponse {
    pub fn is_server_info(&self) -> bool {
        self.command == SERVERINFO
    }

    /// The instance this snapshot answers for is stopped.
    pub fn is_not_ready(&self) -> bool {
        self.error.as_deref() == Some(ERROR_NOT_READY)
    }
}

/// Decode a raw response-topic payload.
pub fn decode(payload: &[u8]) -> Result<ResponseEnvelope, Error> {
    serde_json::from_slice(payload).map_err(|e| Error::Deserialization {
        message: e.to_string(),
        body: String::from_utf8_lossy(payload).into_owned(),
    })
}

// ── Server-info snapshot ────────────────────────────────────────────

/// The firmware's full state snapshot for one instance.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    /// Registry of all instances sharing this connection.
    #[serde(default)]
    pub instance: Vec<InstanceDescriptor>,
    /// Which instance this snapshot describes.
    #[serde(default)]
    pub current_instance: Option<InstanceId>,
    /// Installed effects. Immutable for the life of a connection.
    #[serde(default)]
    pub effects: Vec<EffectEntry>,
    #[serde(default)]
    pub active_led_color: Vec<LedColorSample>,
    #[serde(default)]
    pub adjustment: Vec<AdjustmentState>,
    #[serde(default)]
    pub active_effects: Vec<ActiveEffect>,
    #[serde(default)]
    pub components: Vec<ComponentEntry>,
}

/// One row of the firmware's instance registry.
#[derive(Debug, Clone, Deserialize)]
pub struct InstanceDescriptor {
    pub instance: InstanceId,
    #[serde(default)]
    pub running: bool,
    #[serde(default)]
    pub friendly_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EffectEntry {
    pub name: String,
}

/// A sampled LED color. The field name with a space is the firmware's.
#[derive(Debug, Clone, Deserialize)]
pub struct LedColorSample {
    #[serde(default, rename = "RGB Value")]
    pub rgb_value: Vec<u8>,
}

impl LedColorSample {
    /// First three channels as a triple, if the sample is complete.
    pub fn rgb(&self) -> Option<[u8; 3]> {
        match self.rgb_value[..] {
            [r, g, b, ..] => Some([r, g, b]),
            _ => None,
        }
    }
}

/// One adjustment block. Only brightness is read by the core; the rest
/// rides along untyped.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AdjustmentState {
    #[serde(default)]
    pub brightness: Option<u8>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ActiveEffect {
    pub name: String,
}

/// One capability flag as reported by the firmware.
#[derive(Debug, Clone, Deserialize)]
pub struct ComponentEntry {
    pub name: String,
    #[serde(default)]
    pub enabled: bool,
}

// ── Tests ───────────────────────────────────────────────────────────

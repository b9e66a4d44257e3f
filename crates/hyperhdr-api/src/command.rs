// ── Typed command payloads ──
//
// Every write operation against the firmware is one of these payload
// shapes, serialized into the JSON array envelope the device consumes.
// The first element of every envelope is the instance-selection
// directive that tells the firmware which instance subsequent commands
// target.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Origin marker stamped on effect and color commands.
pub const ORIGIN_JSON_API: &str = "JSON API";

// ── InstanceId ──────────────────────────────────────────────────────

/// Identifier of a firmware-level logical sub-device.
///
/// Instance 0 is the primary/session-scoped instance; its server-info
/// also carries the registry of all other instances.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct InstanceId(pub u8);

impl InstanceId {
    pub const PRIMARY: InstanceId = InstanceId(0);

    pub fn is_primary(self) -> bool {
        self.0 == 0
    }
}

impl From<u8> for InstanceId {
    fn from(id: u8) -> Self {
        Self(id)
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// ── Capability names ────────────────────────────────────────────────

/// The closed set of capability flags the firmware reports and toggles.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::AsRefStr,
    strum::EnumString,
)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE")]
pub enum Component {
    /// Overall enable for the whole instance.
    All,
    Hdr,
    Smoothing,
    Blackborder,
    Forwarder,
    Videograbber,
    Systemgrabber,
    /// The LED output device itself -- what a light switch toggles.
    Leddevice,
}

/// Calibration parameters settable through the adjustment command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, strum::Display, strum::AsRefStr)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum AdjustmentKey {
    White,
    // Firmware expects the capitalised spelling for this key only.
    #[serde(rename = "Red")]
    #[strum(serialize = "Red")]
    Red,
    Green,
    Blue,
    Cyan,
    Magenta,
    Yellow,
    BacklightThreshold,
    BacklightColored,
    Brightness,
    BrightnessCompensation,
    GammaRed,
    GammaGreen,
    GammaBlue,
}

/// An RGB triple as the wire format carries it.
pub type Rgb = [u8; 3];

// ── Command ─────────────────────────────────────────────────────────

/// Subcommands of the `instance` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum InstanceSubcommand {
    #[serde(rename = "switchTo")]
    SwitchTo,
    #[serde(rename = "startInstance")]
    Start,
    #[serde(rename = "stopInstance")]
    Stop,
}

/// Inner body of a `componentstate` command.
#[derive(Debug, Clone, Serialize)]
pub struct ComponentState {
    pub component: Component,
    pub state: bool,
}

/// Inner body of an `effect` command.
#[derive(Debug, Clone, Serialize)]
pub struct EffectSelector {
    pub name: String,
}

/// Inner body of an `adjustment` command.
///
/// `classic_config: false` patches the one given key without resetting
/// the rest of the adjustment block.
#[derive(Debug, Clone, Serialize)]
pub struct AdjustmentPatch {
    pub classic_config: bool,
    #[serde(flatten)]
    pub values: serde_json::Map<String, Value>,
}

/// One command object in the outbound envelope.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "command")]
pub enum Command {
    #[serde(rename = "serverinfo")]
    ServerInfo,
    #[serde(rename = "componentstate")]
    ComponentState { componentstate: ComponentState },
    #[serde(rename = "instance")]
    Instance {
        subcommand: InstanceSubcommand,
        instance: InstanceId,
    },
    #[serde(rename = "effect")]
    Effect {
        effect: EffectSelector,
        duration: u32,
        priority: u8,
        origin: String,
    },
    #[serde(rename = "color")]
    Color {
        color: Rgb,
        duration: u32,
        priority: u8,
        origin: String,
    },
    #[serde(rename = "adjustment")]
    Adjustment { adjustment: AdjustmentPatch },
}

impl Command {
    /// Request a full server-info snapshot.
    pub fn server_info() -> Self {
        Self::ServerInfo
    }

    /// Instance-selection directive prepended to every envelope.
    pub fn switch_to(instance: InstanceId) -> Self {
        Self::Instance {
            subcommand: InstanceSubcommand::SwitchTo,
            instance,
        }
    }

    /// Administratively start an instance.
    pub fn start_instance(instance: InstanceId) -> Self {
        Self::Instance {
            subcommand: InstanceSubcommand::Start,
            instance,
        }
    }

    /// Administratively stop an instance.
    pub fn stop_instance(instance: InstanceId) -> Self {
        Self::Instance {
            subcommand: InstanceSubcommand::Stop,
            instance,
        }
    }

    /// Toggle a capability flag.
    pub fn component_state(component: Component, state: bool) -> Self {
        Self::ComponentState {
            componentstate: ComponentState { component, state },
        }
    }

    /// Activate a named effect at the given priority, zero duration.
    pub fn effect(name: impl Into<String>, priority: u8) -> Self {
        Self::Effect {
            effect: EffectSelector { name: name.into() },
            duration: 0,
            priority,
            origin: ORIGIN_JSON_API.to_owned(),
        }
    }

    /// Show a solid color at the given priority, zero duration.
    pub fn color(rgb: Rgb, priority: u8) -> Self {
        Self::Color {
            color: rgb,
            duration: 0,
            priority,
            origin: ORIGIN_JSON_API.to_owned(),
        }
    }

    /// Patch a single calibration parameter, leaving the rest of the
    /// adjustment block untouched.
    pub fn adjustment(key: AdjustmentKey, value: impl Into<Value>) -> Self {
        let mut values = serde_json::Map::with_capacity(1);
        values.insert(key.as_ref().to_owned(), value.into());
        Self::Adjustment {
            adjustment: AdjustmentPatch {
                classic_config: false,
                values,
            },
        }
    }
}

/// Build the outbound envelope: the `switchTo` directive for `instance`
/// followed by the given commands, applied by the firmware in order.
pub fn envelope(instance: InstanceId, commands: impl IntoIterator<Item = Command>) -> Vec<Command> {
    std::iter::once(Command::switch_to(instance))
        .chain(commands)
        .collect()
}

// ── Tests ───────────────────────────────────────────────────────────

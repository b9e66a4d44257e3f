// ── Runtime connection configuration ──
//
// Describes *how* to reach one HyperHDR installation over MQTT. The
// embedding application collects and validates these values and hands
// them in; the core never touches configuration storage.

use hyperhdr_api::BrokerOptions;
use secrecy::SecretString;

use crate::error::CoreError;

pub const DEFAULT_BASE_TOPIC: &str = "HyperHDR";
pub const DEFAULT_PORT: u16 = 1883;
pub const DEFAULT_PRIORITY: u8 = 50;

/// Valid priority band for effect and color commands.
pub const PRIORITY_MIN: u8 = 1;
pub const PRIORITY_MAX: u8 = 253;

/// Configuration for one broker-backed HyperHDR session.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Base MQTT topic the firmware listens under.
    pub base_topic: String,
    /// Broker host.
    pub host: String,
    /// Broker port.
    pub port: u16,
    /// Optional broker credentials.
    pub username: Option<String>,
    pub password: Option<SecretString>,
    /// Priority band stamped on effect and color commands (1–253).
    pub priority: u8,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            base_topic: DEFAULT_BASE_TOPIC.into(),
            host: String::new(),
            port: DEFAULT_PORT,
            username: None,
            password: None,
            priority: DEFAULT_PRIORITY,
        }
    }
}

impl BridgeConfig {
    /// Check the few constraints the core itself depends on.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.host.is_empty() {
            return Err(CoreError::Config {
                message: "broker host is empty".into(),
            });
        }
        if !(PRIORITY_MIN..=PRIORITY_MAX).contains(&self.priority) {
            return Err(CoreError::Config {
                message: format!(
                    "priority {} outside {PRIORITY_MIN}..={PRIORITY_MAX}",
                    self.priority
                ),
            });
        }
        Ok(())
    }

    /// Broker options for the MQTT link. The client id is derived from
    /// the base topic so two bridges on one broker stay distinct.
    pub fn broker_options(&self) -> BrokerOptions {
        BrokerOptions {
            host: self.host.clone(),
            port: self.port,
            client_id: format!("hyperhdr-{}", self.base_topic),
            username: self.username.clone(),
            password: self.password.clone(),
            ..BrokerOptions::default()
        }
    }
}

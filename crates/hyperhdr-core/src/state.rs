// ── Component-state snapshot ──
//
// One immutable value per server-info update. Always rebuilt wholesale
// from a complete component list, never merged field-by-field across
// messages.

use std::collections::HashMap;

use hyperhdr_api::{Component, ComponentEntry};

/// The capability flags reported for one instance.
///
/// Named accessors cover the closed capability set; anything else the
/// firmware reports is kept but only reachable through
/// [`as_map`](Self::as_map).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ComponentStates {
    data: HashMap<String, bool>,
}

impl ComponentStates {
    pub fn from_entries(entries: &[ComponentEntry]) -> Self {
        Self {
            data: entries
                .iter()
                .map(|entry| (entry.name.clone(), entry.enabled))
                .collect(),
        }
    }

    /// Flag for a known capability; `false` when the firmware did not
    /// report it.
    pub fn get(&self, component: Component) -> bool {
        self.data.get(component.as_ref()).copied().unwrap_or(false)
    }

    /// Overall enable for the instance.
    pub fn all(&self) -> bool {
        self.get(Component::All)
    }

    pub fn hdr(&self) -> bool {
        self.get(Component::Hdr)
    }

    pub fn smoothing(&self) -> bool {
        self.get(Component::Smoothing)
    }

    pub fn blackborder(&self) -> bool {
        self.get(Component::Blackborder)
    }

    pub fn forwarder(&self) -> bool {
        self.get(Component::Forwarder)
    }

    pub fn videograbber(&self) -> bool {
        self.get(Component::Videograbber)
    }

    pub fn systemgrabber(&self) -> bool {
        self.get(Component::Systemgrabber)
    }

    /// The LED output device -- what a light switch toggles.
    pub fn leddevice(&self) -> bool {
        self.get(Component::Leddevice)
    }

    /// Raw view, including capabilities outside the closed set.
    pub fn as_map(&self) -> &HashMap<String, bool> {
        &self.data
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

// ── Tests ───────────────────────────────────────────────────────────

//! Session configuration.

use crate::ble::registry::AttributeRegistry;
use crate::events::DEFAULT_EVENT_CAPACITY;
use crate::protocol::RecordLayout;

/// Tunables for a [`Session`](crate::Session).
///
/// # Example
///
/// ```
/// use helena_ble::{RecordLayout, SessionConfig};
///
/// let config = SessionConfig::default()
///     .with_event_capacity(256)
///     .with_layout(RecordLayout::raw().with_device_id(0..6));
/// assert_eq!(config.event_capacity, 256);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SessionConfig {
    /// Events buffered per subscriber before the oldest are dropped.
    pub event_capacity: usize,
    /// Services and characteristics the session recognizes.
    pub registry: AttributeRegistry,
    /// Sub-field layout used when decoding payloads.
    pub layout: RecordLayout,
}

impl SessionConfig {
    /// Set the per-subscriber event buffer size.
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Set the attribute registry.
    pub fn with_registry(mut self, registry: AttributeRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Set the payload record layout.
    pub fn with_layout(mut self, layout: RecordLayout) -> Self {
        self.layout = layout;
        self
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            event_capacity: DEFAULT_EVENT_CAPACITY,
            registry: AttributeRegistry::helena(),
            layout: RecordLayout::helena(),
        }
    }
}

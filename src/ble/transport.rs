//! Transport capability interface.
//!
//! The session never touches platform BLE types. Everything it needs from the
//! host stack goes through [`Transport`], whose operations only *begin* work:
//! results come back later as [`TransportEvent`]s posted through the
//! [`CompletionSink`] handed over on `connect`.

use async_trait::async_trait;
use std::fmt;
use tokio::sync::mpsc;
use tracing::trace;
use uuid::Uuid;

use crate::ble::registry::CharacteristicProperties;
use crate::error::TransportError;

/// Opaque peripheral identifier (hardware address on most platforms).
#[derive(Debug, Clone, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviceAddress(String);

impl DeviceAddress {
    /// Parse an address.
    ///
    /// Returns `None` for empty or whitespace-only input.
    pub fn parse(address: &str) -> Option<Self> {
        let trimmed = address.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Self(trimmed.to_string()))
        }
    }

    /// The address as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Check whether a platform identifier refers to this address.
    pub fn matches(&self, identifier: &str) -> bool {
        self.0.eq_ignore_ascii_case(identifier.trim())
    }
}

impl PartialEq for DeviceAddress {
    fn eq(&self, other: &Self) -> bool {
        self.matches(&other.0)
    }
}

impl std::hash::Hash for DeviceAddress {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.to_ascii_uppercase().hash(state);
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Status code reported with a transport completion.
///
/// Values follow the GATT status numbering used by most host stacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct GattStatus(pub u16);

impl GattStatus {
    /// Operation completed successfully.
    pub const SUCCESS: Self = Self(0x0000);
    /// The attribute cannot be read.
    pub const READ_NOT_PERMITTED: Self = Self(0x0002);
    /// The link is not authenticated.
    pub const INSUFFICIENT_AUTHENTICATION: Self = Self(0x0005);
    /// Generic failure.
    pub const FAILURE: Self = Self(0x0101);
    /// The peripheral is not known to the local adapter.
    pub const DEVICE_NOT_FOUND: Self = Self(0x0102);

    /// Check if this status reports success.
    pub fn is_success(&self) -> bool {
        *self == Self::SUCCESS
    }
}

impl fmt::Display for GattStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06X}", self.0)
    }
}

/// A characteristic discovered on the current link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CharacteristicHandle {
    /// UUID of the service that owns the characteristic.
    pub service: Uuid,
    /// UUID of the characteristic.
    pub uuid: Uuid,
    /// Declared property flags.
    pub properties: CharacteristicProperties,
}

impl CharacteristicHandle {
    /// Create a new handle.
    pub fn new(service: Uuid, uuid: Uuid, properties: CharacteristicProperties) -> Self {
        Self {
            service,
            uuid,
            properties,
        }
    }
}

/// A service discovered on the current link, with its characteristics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredService {
    /// UUID of the service.
    pub uuid: Uuid,
    /// Characteristics declared by the service.
    pub characteristics: Vec<CharacteristicHandle>,
}

/// Completion or unsolicited event reported by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The link is up.
    Connected,
    /// The connection attempt failed before the link came up.
    ConnectionFailed {
        /// Status reported by the adapter.
        status: GattStatus,
    },
    /// The link went down, either on request or because it was lost.
    Disconnected,
    /// Service discovery finished.
    ServicesDiscovered(std::result::Result<Vec<DiscoveredService>, GattStatus>),
    /// Notification delivery was armed or disarmed.
    NotificationArmed {
        /// The characteristic that was configured.
        characteristic: CharacteristicHandle,
        /// Whether notifications were being enabled.
        enabled: bool,
        /// Outcome of the request.
        result: std::result::Result<(), GattStatus>,
    },
    /// A characteristic value notification arrived.
    Notification {
        /// UUID of the notifying characteristic.
        characteristic: Uuid,
        /// The notified value.
        value: Vec<u8>,
    },
    /// A one-shot read finished.
    ReadComplete {
        /// The characteristic that was read.
        characteristic: CharacteristicHandle,
        /// The value read, or the failure status.
        result: std::result::Result<Vec<u8>, GattStatus>,
    },
}

/// A transport event tagged with the connect cycle it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    /// Connect cycle the event belongs to.
    pub cycle: u64,
    /// The event itself.
    pub event: TransportEvent,
}

/// Where a transport posts completions for one connect cycle.
///
/// Delivery never blocks. Events posted after the owning session is gone are
/// dropped.
#[derive(Debug, Clone)]
pub struct CompletionSink {
    cycle: u64,
    tx: mpsc::UnboundedSender<Completion>,
}

impl CompletionSink {
    /// Create a sink for a connect cycle.
    pub fn new(cycle: u64, tx: mpsc::UnboundedSender<Completion>) -> Self {
        Self { cycle, tx }
    }

    /// The connect cycle this sink reports for.
    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    /// Post an event.
    pub fn deliver(&self, event: TransportEvent) {
        trace!("Completion for cycle {}: {:?}", self.cycle, event);
        let _ = self.tx.send(Completion {
            cycle: self.cycle,
            event,
        });
    }
}

/// Capability interface over the host's BLE central role.
///
/// All methods except `initialize` return immediately; their outcome arrives
/// later through the [`CompletionSink`] passed to [`Transport::connect`]. An
/// `Err` return means the request could not even be issued.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// Acquire the local BLE capability.
    async fn initialize(&self) -> Result<(), TransportError>;

    /// Whether `initialize` has completed successfully.
    fn is_initialized(&self) -> bool;

    /// Begin connecting to `address`.
    ///
    /// Reuses the existing link when it already points at `address`.
    fn connect(&self, address: &DeviceAddress, sink: CompletionSink)
        -> Result<(), TransportError>;

    /// Begin tearing down the active or pending link.
    fn disconnect(&self);

    /// Begin service and characteristic enumeration.
    fn discover_services(&self) -> Result<(), TransportError>;

    /// Begin arming or disarming notifications for a characteristic.
    fn enable_notification(
        &self,
        characteristic: &CharacteristicHandle,
        enabled: bool,
    ) -> Result<(), TransportError>;

    /// Begin a one-shot read of a characteristic.
    fn read_characteristic(&self, characteristic: &CharacteristicHandle)
        -> Result<(), TransportError>;

    /// Release every transport resource. Safe to call repeatedly.
    fn close(&self);
}

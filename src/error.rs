//! Error types for the helena-ble crate.

use thiserror::Error;
use uuid::Uuid;

use crate::ble::connection::ConnectionState;
use crate::ble::registry::CharacteristicRole;
use crate::ble::transport::GattStatus;

/// The main error type for this crate.
///
/// Returned synchronously by session operations whose preconditions are not
/// met. Failures that happen later, on the transport's completion path, are
/// reported as [`SessionEvent::Error`](crate::events::SessionEvent::Error)
/// carrying an [`ErrorKind`] instead.
#[derive(Error, Debug)]
pub enum Error {
    /// Bluetooth is not available or is disabled on this system.
    #[error("Bluetooth not available or disabled")]
    BluetoothUnavailable,

    /// The device address could not be used.
    #[error("Invalid device address: {address:?}")]
    InvalidAddress {
        /// The address that was rejected.
        address: String,
    },

    /// An operation was attempted before the transport was initialized.
    #[error("Bluetooth transport not initialized")]
    NotInitialized,

    /// The operation is not legal in the session's current state.
    #[error("Cannot {operation} while {state}")]
    InvalidState {
        /// The operation that was attempted.
        operation: &'static str,
        /// The state the session was in.
        state: ConnectionState,
    },

    /// No characteristic with the required role was matched during discovery.
    #[error("No {role} characteristic matched on this device")]
    CharacteristicNotFound {
        /// The role that was required.
        role: CharacteristicRole,
    },

    /// The transport refused the request.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

impl Error {
    /// The event-level kind this error corresponds to, if any.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::BluetoothUnavailable => Some(ErrorKind::Unavailable),
            Self::InvalidAddress { .. } => Some(ErrorKind::InvalidAddress),
            Self::NotInitialized => Some(ErrorKind::NotInitialized),
            Self::Transport(e) => Some(e.kind()),
            Self::InvalidState { .. } | Self::CharacteristicNotFound { .. } => None,
        }
    }
}

/// Errors reported by a [`Transport`](crate::ble::transport::Transport).
#[derive(Error, Debug)]
pub enum TransportError {
    /// The host has no usable Bluetooth adapter.
    #[error("No Bluetooth adapter available")]
    Unavailable,

    /// `initialize` has not completed successfully.
    #[error("Transport not initialized")]
    NotInitialized,

    /// There is no open link to operate on.
    #[error("No open link")]
    NotConnected,

    /// The characteristic is not present on the open link.
    #[error("Characteristic not found on link: {uuid}")]
    CharacteristicNotFound {
        /// UUID of the missing characteristic.
        uuid: Uuid,
    },

    /// Generic adapter-reported failure.
    #[error("Transport failure (status {status})")]
    Failure {
        /// Status code reported by the adapter.
        status: GattStatus,
    },

    /// Error from the underlying BLE library.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),
}

impl TransportError {
    /// The event-level kind for this transport error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Unavailable => ErrorKind::Unavailable,
            Self::NotInitialized => ErrorKind::NotInitialized,
            Self::Failure { status } => ErrorKind::TransportFailure { status: *status },
            Self::NotConnected | Self::CharacteristicNotFound { .. } | Self::Bluetooth(_) => {
                ErrorKind::TransportFailure {
                    status: GattStatus::FAILURE,
                }
            }
        }
    }
}

/// Error kinds published on the session event stream.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// No local BLE capability.
    #[error("Bluetooth unavailable")]
    Unavailable,

    /// The device address is unusable.
    #[error("Invalid device address")]
    InvalidAddress,

    /// Operation attempted before the transport was initialized.
    #[error("Transport not initialized")]
    NotInitialized,

    /// Service discovery completed with a non-success status.
    #[error("Service discovery failed (status {status})")]
    DiscoveryFailed {
        /// Status reported by the transport.
        status: GattStatus,
    },

    /// Generic adapter-reported failure.
    #[error("Transport failure (status {status})")]
    TransportFailure {
        /// Status reported by the transport.
        status: GattStatus,
    },

    /// A payload arrived for a characteristic the session never armed.
    #[error("Unexpected characteristic: {uuid}")]
    UnexpectedCharacteristic {
        /// UUID of the characteristic.
        uuid: Uuid,
    },
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;

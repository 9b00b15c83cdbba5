//! BLE communication module.
//!
//! This module provides the GATT-level pieces of a session: the transport
//! abstraction and its `btleplug` implementation, the attribute registry,
//! and the connection state machine.

pub mod btleplug_transport;
pub mod connection;
pub mod registry;
pub mod transport;
pub mod uuids;

pub use btleplug_transport::BtleplugTransport;
pub use connection::{ConnectionState, SessionMachine};
pub use registry::{
    AttributeId, AttributeRegistry, CharacteristicProperties, CharacteristicRole, Classification,
};
pub use transport::{
    CharacteristicHandle, Completion, CompletionSink, DeviceAddress, DiscoveredService, GattStatus,
    Transport, TransportEvent,
};
pub use uuids::*;

// Allow unusual byte groupings for UUIDs which have standard format
#![allow(clippy::unusual_byte_groupings)]

//! # helena-ble
//!
//! A Rust library for holding a Bluetooth Low Energy session with a single
//! Helena observation beacon and turning its GATT traffic into decoded
//! observation records.
//!
//! A [`Session`] connects to one peripheral by address, discovers its
//! services, recognizes the Helena service and its two characteristics,
//! enables notifications on the data-available characteristic, and serves
//! reads of the observation-set characteristic on request. Every payload is
//! decoded into an [`ObservationRecord`] and published as a
//! [`SessionEvent`] to any number of subscribers.
//!
//! ## Features
//!
//! - **Serialized state machine**: Disconnected, Connecting, Connected,
//!   ServicesDiscovering and Ready, with stale completions dropped
//! - **Pluggable transport**: [`BtleplugTransport`] for real hardware, or any
//!   [`Transport`] implementation for tests
//! - **Configurable registry**: recognize additional services and
//!   characteristics through [`AttributeRegistry`]
//! - **Non-blocking event bus**: slow subscribers lag instead of stalling
//!   the session
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use helena_ble::{BtleplugTransport, Result, Session, SessionEvent};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let session = Session::new("AA:BB:CC:DD:EE:FF", Arc::new(BtleplugTransport::new()))?;
//!     session.initialize().await?;
//!
//!     let mut events = session.subscribe();
//!     session.connect()?;
//!
//!     while let Ok(event) = events.recv().await {
//!         match event {
//!             SessionEvent::ServicesDiscovered => session.request_read()?,
//!             SessionEvent::DataNotified(record) | SessionEvent::DataRead(record) => {
//!                 println!("{}", record.hex());
//!             }
//!             SessionEvent::Disconnected => break,
//!             other => println!("{:?}", other),
//!         }
//!     }
//!
//!     session.close();
//!     Ok(())
//! }
//! ```
//!
//! ## Platform Notes
//!
//! ### macOS
//! Requires Bluetooth permission. Add `NSBluetoothAlwaysUsageDescription`
//! to your Info.plist for bundled apps. Peripherals are identified by a
//! platform UUID rather than a hardware address.
//!
//! ### Linux
//! Requires BlueZ. User may need to be in the `bluetooth` group.
//!
//! ### Windows
//! Requires Windows 10 or later with Bluetooth LE support.
//!
//! ## Feature Flags
//!
//! - `serde`: Enable serialization/deserialization for configuration types

// Public modules
pub mod ble;
pub mod config;
pub mod error;
pub mod events;
pub mod protocol;
pub mod session;
pub mod utils;

// Re-exports for convenience
pub use config::SessionConfig;
pub use error::{Error, ErrorKind, Result, TransportError};
pub use events::{CallbackHandle, EventBus, SessionEvent, DEFAULT_EVENT_CAPACITY};
pub use session::Session;
pub use utils::hex_pairs;

// Re-export commonly used types from submodules
pub use ble::btleplug_transport::BtleplugTransport;
pub use ble::connection::ConnectionState;
pub use ble::registry::{
    AttributeId, AttributeRegistry, CharacteristicProperties, CharacteristicRole, Classification,
};
pub use ble::transport::{
    CharacteristicHandle, CompletionSink, DeviceAddress, DiscoveredService, GattStatus, Transport,
    TransportEvent,
};
pub use protocol::{decode, ObservationDecoder, ObservationRecord, RecordLayout};

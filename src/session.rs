//! Session struct and methods.
//!
//! Represents the connection to a single Helena peripheral.

use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info};

use crate::ble::connection::{ConnectionState, SessionMachine};
use crate::ble::registry::AttributeId;
use crate::ble::transport::{
    CharacteristicHandle, Completion, DeviceAddress, DiscoveredService, Transport,
};
use crate::config::SessionConfig;
use crate::error::{Error, Result, TransportError};
use crate::events::{CallbackHandle, EventBus, SessionEvent};
use crate::protocol::ObservationDecoder;

/// A session with one BLE peripheral.
///
/// The session owns its state machine and a driver task that feeds transport
/// completions into it one at a time. Dropping the session closes the
/// transport and stops the driver.
pub struct Session {
    /// Serialized state machine.
    machine: Arc<Mutex<SessionMachine>>,
    /// Transport shared with the machine.
    transport: Arc<dyn Transport>,
    /// Outbound events.
    events: EventBus,
    /// Completion driver task.
    driver: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Session {
    /// Create a session for `address` with the default configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAddress`] if the address is empty.
    ///
    /// # Panics
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(address: &str, transport: Arc<dyn Transport>) -> Result<Self> {
        Self::with_config(address, transport, SessionConfig::default())
    }

    /// Create a session for `address` with a custom configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAddress`] if the address is empty.
    ///
    /// # Panics
    ///
    /// Must be called from within a tokio runtime.
    pub fn with_config(
        address: &str,
        transport: Arc<dyn Transport>,
        config: SessionConfig,
    ) -> Result<Self> {
        let address = DeviceAddress::parse(address).ok_or_else(|| Error::InvalidAddress {
            address: address.to_string(),
        })?;

        let events = EventBus::new(config.event_capacity);
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();

        let machine = Arc::new(Mutex::new(SessionMachine::new(
            address,
            transport.clone(),
            config.registry,
            ObservationDecoder::new(config.layout),
            events.clone(),
            completion_tx,
        )));

        let driver = tokio::spawn(Self::drive(Arc::downgrade(&machine), completion_rx));

        Ok(Self {
            machine,
            transport,
            events,
            driver: Mutex::new(Some(driver)),
        })
    }

    /// Feed completions into the machine until the session goes away.
    async fn drive(
        machine: Weak<Mutex<SessionMachine>>,
        mut completions: mpsc::UnboundedReceiver<Completion>,
    ) {
        debug!("Session driver started");
        while let Some(completion) = completions.recv().await {
            let Some(machine) = machine.upgrade() else {
                break;
            };
            machine.lock().handle_completion(completion);
        }
        debug!("Session driver stopped");
    }

    // === Identification ===

    /// Get the peripheral address.
    pub fn address(&self) -> DeviceAddress {
        self.machine.lock().address().clone()
    }

    // === Connection ===

    /// Acquire the local BLE capability.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BluetoothUnavailable`] if the host has no adapter.
    pub async fn initialize(&self) -> Result<()> {
        self.transport.initialize().await.map_err(|e| match e {
            TransportError::Unavailable => Error::BluetoothUnavailable,
            other => Error::Transport(other),
        })
    }

    /// Get the current connection state.
    pub fn state(&self) -> ConnectionState {
        self.machine.lock().state()
    }

    /// Start connecting.
    ///
    /// Returns once the attempt is under way; watch for
    /// [`SessionEvent::Connected`] and [`SessionEvent::ServicesDiscovered`].
    pub fn connect(&self) -> Result<()> {
        self.machine.lock().connect()
    }

    /// Retry service discovery after a [`DiscoveryFailed`](crate::ErrorKind::DiscoveryFailed) error.
    pub fn discover_services(&self) -> Result<()> {
        self.machine.lock().discover_services()
    }

    /// Disconnect from the peripheral.
    pub fn disconnect(&self) {
        info!("Disconnect requested for {}", self.address());
        self.machine.lock().disconnect();
    }

    /// Release the transport. Safe to call at any time, any number of times.
    pub fn close(&self) {
        self.machine.lock().close();
    }

    // === Data ===

    /// Request a read of the observation set.
    ///
    /// The result arrives as [`SessionEvent::DataRead`].
    pub fn request_read(&self) -> Result<()> {
        self.machine.lock().request_read()
    }

    /// The service matched during discovery.
    pub fn matched_service(&self) -> Option<AttributeId> {
        self.machine.lock().matched_service().cloned()
    }

    /// The characteristic armed for notifications.
    pub fn notify_characteristic(&self) -> Option<CharacteristicHandle> {
        self.machine.lock().notify_characteristic()
    }

    /// The characteristic used for reads.
    pub fn readable_characteristic(&self) -> Option<CharacteristicHandle> {
        self.machine.lock().readable_characteristic()
    }

    /// Services reported by the last successful discovery.
    pub fn services(&self) -> Vec<DiscoveredService> {
        self.machine.lock().services().to_vec()
    }

    // === Events ===

    /// Subscribe to session events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Register a callback for session events.
    pub fn on_event<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(SessionEvent) + Send + Sync + 'static,
    {
        self.events.on_event(callback)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.machine.lock().close();
        if let Some(handle) = self.driver.lock().take() {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let machine = self.machine.lock();
        f.debug_struct("Session")
            .field("address", machine.address())
            .field("state", &machine.state())
            .finish()
    }
}

//! BLE connection management.
//!
//! Holds the per-session state machine. Every inbound call and every
//! transport completion for one session goes through [`SessionMachine`],
//! which the owning [`Session`](crate::Session) keeps behind a mutex so that
//! transitions never interleave.

use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::ble::registry::{AttributeId, AttributeRegistry, CharacteristicRole, Classification};
use crate::ble::transport::{
    CharacteristicHandle, Completion, CompletionSink, DeviceAddress, DiscoveredService,
    GattStatus, Transport, TransportEvent,
};
use crate::error::{Error, ErrorKind, Result};
use crate::events::{EventBus, SessionEvent};
use crate::protocol::ObservationDecoder;

/// Connection state for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ConnectionState {
    /// Not connected to the peripheral.
    #[default]
    Disconnected,
    /// Currently attempting to connect.
    Connecting,
    /// Link is up, services not yet discovered.
    Connected,
    /// Service discovery is in progress.
    ServicesDiscovering,
    /// Services discovered; notifications and reads are valid.
    Ready,
}

impl ConnectionState {
    /// Check if the link is up.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected | Self::ServicesDiscovering | Self::Ready)
    }

    /// Check if in a transitional state.
    pub fn is_transitioning(&self) -> bool {
        matches!(self, Self::Connecting | Self::ServicesDiscovering)
    }

    /// Check if notifications and reads are valid.
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::ServicesDiscovering => write!(f, "ServicesDiscovering"),
            Self::Ready => write!(f, "Ready"),
        }
    }
}

/// The transition function for one peripheral session.
pub struct SessionMachine {
    /// Peripheral this session talks to.
    address: DeviceAddress,
    /// Current connection state.
    state: ConnectionState,
    /// Connect cycle counter; completions from older cycles are dropped.
    cycle: u64,
    /// Service matched during the last discovery.
    matched_service: Option<AttributeId>,
    /// Characteristic armed for notifications.
    notify_characteristic: Option<CharacteristicHandle>,
    /// Characteristic used for on-demand reads.
    readable_characteristic: Option<CharacteristicHandle>,
    /// Services reported by the last successful discovery.
    services: Vec<DiscoveredService>,
    /// The host BLE stack.
    transport: Arc<dyn Transport>,
    /// Recognized services and characteristics.
    registry: AttributeRegistry,
    /// Payload decoder.
    decoder: ObservationDecoder,
    /// Outbound events.
    events: EventBus,
    /// Where transports post completions.
    completions: mpsc::UnboundedSender<Completion>,
}

impl SessionMachine {
    /// Create a machine in the `Disconnected` state.
    pub fn new(
        address: DeviceAddress,
        transport: Arc<dyn Transport>,
        registry: AttributeRegistry,
        decoder: ObservationDecoder,
        events: EventBus,
        completions: mpsc::UnboundedSender<Completion>,
    ) -> Self {
        Self {
            address,
            state: ConnectionState::Disconnected,
            cycle: 0,
            matched_service: None,
            notify_characteristic: None,
            readable_characteristic: None,
            services: Vec::new(),
            transport,
            registry,
            decoder,
            events,
            completions,
        }
    }

    /// The peripheral address.
    pub fn address(&self) -> &DeviceAddress {
        &self.address
    }

    /// Get the current connection state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// The current connect cycle.
    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    /// The service matched during discovery.
    pub fn matched_service(&self) -> Option<&AttributeId> {
        self.matched_service.as_ref()
    }

    /// The characteristic armed for notifications.
    pub fn notify_characteristic(&self) -> Option<CharacteristicHandle> {
        self.notify_characteristic
    }

    /// The characteristic used for reads.
    pub fn readable_characteristic(&self) -> Option<CharacteristicHandle> {
        self.readable_characteristic
    }

    /// Services reported by the last successful discovery.
    pub fn services(&self) -> &[DiscoveredService] {
        &self.services
    }

    /// The transport this machine drives.
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    // === Inbound calls ===

    /// Start a connection attempt.
    ///
    /// Only legal from `Disconnected`. Fails without contacting the transport
    /// if it has not been initialized.
    pub fn connect(&mut self) -> Result<()> {
        if self.state != ConnectionState::Disconnected {
            return Err(Error::InvalidState {
                operation: "connect",
                state: self.state,
            });
        }

        if !self.transport.is_initialized() {
            warn!("Transport not initialized, refusing to connect to {}", self.address);
            return Err(Error::NotInitialized);
        }

        self.cycle += 1;
        self.clear_discovery();

        let sink = CompletionSink::new(self.cycle, self.completions.clone());
        self.transport.connect(&self.address, sink)?;

        info!("Connecting to {} (cycle {})", self.address, self.cycle);
        self.set_state(ConnectionState::Connecting);
        Ok(())
    }

    /// Retry service discovery after a failed attempt.
    ///
    /// Only legal in `Connected`.
    pub fn discover_services(&mut self) -> Result<()> {
        if self.state != ConnectionState::Connected {
            return Err(Error::InvalidState {
                operation: "discover services",
                state: self.state,
            });
        }

        self.transport.discover_services()?;
        self.set_state(ConnectionState::ServicesDiscovering);
        Ok(())
    }

    /// Request a read of the readable characteristic.
    ///
    /// A no-op while `Disconnected`; otherwise only legal in `Ready`.
    pub fn request_read(&mut self) -> Result<()> {
        match self.state {
            ConnectionState::Disconnected => {
                debug!("Ignoring read request while disconnected");
                Ok(())
            }
            ConnectionState::Ready => {
                let handle = self
                    .readable_characteristic
                    .ok_or(Error::CharacteristicNotFound {
                        role: CharacteristicRole::ReadableSet,
                    })?;
                self.transport.read_characteristic(&handle)?;
                trace!("Read requested on {}", handle.uuid);
                Ok(())
            }
            state => Err(Error::InvalidState {
                operation: "request a read",
                state,
            }),
        }
    }

    /// Tear down the link.
    ///
    /// A no-op while `Disconnected`.
    pub fn disconnect(&mut self) {
        if self.state == ConnectionState::Disconnected {
            debug!("Ignoring disconnect while disconnected");
            return;
        }

        info!("Disconnecting from {}", self.address);

        if self.state.is_ready() {
            if let Some(handle) = self.notify_characteristic {
                if let Err(e) = self.transport.enable_notification(&handle, false) {
                    debug!("Failed to disarm notifications on {}: {}", handle.uuid, e);
                }
            }
        }

        self.transport.disconnect();
        self.teardown();
    }

    /// Release the transport and return to `Disconnected`.
    ///
    /// Always legal. Publishes `Disconnected` only if the session was not
    /// already disconnected.
    pub fn close(&mut self) {
        self.transport.close();

        if self.state != ConnectionState::Disconnected {
            info!("Closing session with {}", self.address);
            self.teardown();
        }
    }

    // === Transport completions ===

    /// Apply one transport completion.
    pub fn handle_completion(&mut self, completion: Completion) {
        if completion.cycle != self.cycle {
            debug!(
                "Ignoring completion from cycle {} (current {}): {:?}",
                completion.cycle, self.cycle, completion.event
            );
            return;
        }

        if self.state == ConnectionState::Disconnected {
            debug!("Ignoring completion while disconnected: {:?}", completion.event);
            return;
        }

        match completion.event {
            TransportEvent::Connected => self.on_connected(),
            TransportEvent::ConnectionFailed { status } => self.on_connection_failed(status),
            TransportEvent::Disconnected => {
                info!("Link to {} went down", self.address);
                self.teardown();
            }
            TransportEvent::ServicesDiscovered(result) => self.on_services_discovered(result),
            TransportEvent::NotificationArmed {
                characteristic,
                enabled,
                result,
            } => self.on_notification_armed(characteristic, enabled, result),
            TransportEvent::Notification {
                characteristic,
                value,
            } => self.on_notification(characteristic, &value),
            TransportEvent::ReadComplete {
                characteristic,
                result,
            } => self.on_read_complete(characteristic, result),
        }
    }

    fn on_connected(&mut self) {
        if self.state != ConnectionState::Connecting {
            debug!("Ignoring connected report while {}", self.state);
            return;
        }

        info!("Connected to {}", self.address);
        self.set_state(ConnectionState::Connected);
        self.events.publish(SessionEvent::Connected);

        match self.transport.discover_services() {
            Ok(()) => self.set_state(ConnectionState::ServicesDiscovering),
            Err(e) => {
                warn!("Failed to start service discovery: {}", e);
                self.events.publish(SessionEvent::Error(e.kind()));
            }
        }
    }

    fn on_connection_failed(&mut self, status: GattStatus) {
        if self.state != ConnectionState::Connecting {
            debug!("Ignoring connection failure while {}", self.state);
            return;
        }

        warn!("Connection to {} failed with status {}", self.address, status);
        self.events
            .publish(SessionEvent::Error(ErrorKind::TransportFailure { status }));
        self.teardown();
    }

    fn on_services_discovered(
        &mut self,
        result: std::result::Result<Vec<DiscoveredService>, GattStatus>,
    ) {
        if self.state != ConnectionState::ServicesDiscovering {
            debug!("Ignoring discovery result while {}", self.state);
            return;
        }

        let services = match result {
            Ok(services) => services,
            Err(status) => {
                warn!("Service discovery failed with status {}", status);
                self.set_state(ConnectionState::Connected);
                self.events
                    .publish(SessionEvent::Error(ErrorKind::DiscoveryFailed { status }));
                return;
            }
        };

        debug!("Discovered {} services", services.len());

        for service in &services {
            let Some(id) = self.registry.service(&service.uuid) else {
                debug!("Skipping other service {}", service.uuid);
                continue;
            };

            if let Some(ref matched) = self.matched_service {
                debug!("Already matched {}, skipping {}", matched, id);
                continue;
            }

            debug!("Matched service {}", id);
            self.matched_service = Some(id.clone());

            for characteristic in &service.characteristics {
                match self.registry.classify(characteristic) {
                    Classification::Recognized(CharacteristicRole::NotifySource) => {
                        if self.notify_characteristic.is_none() {
                            debug!("Notify characteristic: {}", characteristic.uuid);
                            self.notify_characteristic = Some(*characteristic);
                        }
                    }
                    Classification::Recognized(CharacteristicRole::ReadableSet) => {
                        if self.readable_characteristic.is_none() {
                            debug!("Readable characteristic: {}", characteristic.uuid);
                            self.readable_characteristic = Some(*characteristic);
                        }
                    }
                    Classification::MissingProperty { role, properties } => {
                        debug!(
                            "Characteristic {} lacks the property for {}: {}",
                            characteristic.uuid, role, properties
                        );
                    }
                    Classification::Unrecognized => {
                        debug!("Unrecognized characteristic {}", characteristic.uuid);
                    }
                }
            }
        }

        self.services = services;

        if let Some(handle) = self.notify_characteristic {
            if let Err(e) = self.transport.enable_notification(&handle, true) {
                warn!("Failed to enable notifications on {}: {}", handle.uuid, e);
                self.events.publish(SessionEvent::Error(e.kind()));
            }
        }

        self.set_state(ConnectionState::Ready);
        self.events.publish(SessionEvent::ServicesDiscovered);
    }

    fn on_notification_armed(
        &mut self,
        characteristic: CharacteristicHandle,
        enabled: bool,
        result: std::result::Result<(), GattStatus>,
    ) {
        match result {
            Ok(()) => debug!(
                "Notifications {} on {}",
                if enabled { "enabled" } else { "disabled" },
                characteristic.uuid
            ),
            Err(status) => {
                warn!(
                    "Failed to configure notifications on {}: status {}",
                    characteristic.uuid, status
                );
                if enabled && self.notify_characteristic == Some(characteristic) {
                    self.events
                        .publish(SessionEvent::Error(ErrorKind::TransportFailure { status }));
                }
            }
        }
    }

    fn on_notification(&mut self, characteristic: uuid::Uuid, value: &[u8]) {
        let armed = self.state.is_ready()
            && self.notify_characteristic.map(|h| h.uuid) == Some(characteristic);

        if !armed {
            debug!(
                "{} ({} bytes ignored)",
                ErrorKind::UnexpectedCharacteristic {
                    uuid: characteristic
                },
                value.len()
            );
            return;
        }

        trace!(
            "Notification from {}: {} bytes, data: {:02X?}",
            characteristic,
            value.len(),
            value
        );

        let record = self.decoder.decode(value);
        self.events.publish(SessionEvent::DataNotified(record));
    }

    fn on_read_complete(
        &mut self,
        characteristic: CharacteristicHandle,
        result: std::result::Result<Vec<u8>, GattStatus>,
    ) {
        let expected = self.state.is_ready()
            && self.readable_characteristic.map(|h| h.uuid) == Some(characteristic.uuid);

        if !expected {
            debug!(
                "{} (read result ignored)",
                ErrorKind::UnexpectedCharacteristic {
                    uuid: characteristic.uuid
                }
            );
            return;
        }

        match result {
            Ok(value) => {
                trace!("Read {} bytes from {}", value.len(), characteristic.uuid);
                let record = self.decoder.decode(&value);
                self.events.publish(SessionEvent::DataRead(record));
            }
            Err(status) => {
                warn!("Read of {} failed with status {}", characteristic.uuid, status);
                self.events
                    .publish(SessionEvent::Error(ErrorKind::TransportFailure { status }));
            }
        }
    }

    // === Internal ===

    fn teardown(&mut self) {
        self.set_state(ConnectionState::Disconnected);
        self.clear_discovery();
        self.events.publish(SessionEvent::Disconnected);
    }

    fn clear_discovery(&mut self) {
        self.matched_service = None;
        self.notify_characteristic = None;
        self.readable_characteristic = None;
        self.services.clear();
    }

    /// Update the connection state.
    fn set_state(&mut self, new_state: ConnectionState) {
        let old_state = std::mem::replace(&mut self.state, new_state);
        if old_state != new_state {
            debug!(
                "Session {} state changed: {} -> {}",
                self.address, old_state, new_state
            );
        }
    }
}

impl std::fmt::Debug for SessionMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionMachine")
            .field("address", &self.address)
            .field("state", &self.state)
            .field("cycle", &self.cycle)
            .field("matched_service", &self.matched_service)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::registry::CharacteristicProperties;
    use crate::ble::transport::MockTransport;
    use crate::ble::uuids::*;
    use crate::error::TransportError;
    use crate::protocol::RecordLayout;
    use pretty_assertions::assert_eq;
    use tokio::sync::broadcast;
    use uuid::Uuid;

    const ADDRESS: &str = "AA:BB:CC:DD:EE:FF";
    const GENERIC_ACCESS_UUID: Uuid = Uuid::from_u128(0x0000_1800_0000_1000_8000_00805f9b34fb);
    const DEVICE_NAME_UUID: Uuid = Uuid::from_u128(0x0000_2a00_0000_1000_8000_00805f9b34fb);

    struct Harness {
        machine: SessionMachine,
        events: broadcast::Receiver<SessionEvent>,
        _completions: mpsc::UnboundedReceiver<Completion>,
    }

    impl Harness {
        fn new(transport: MockTransport) -> Self {
            let bus = EventBus::default();
            let events = bus.subscribe();
            let (tx, rx) = mpsc::unbounded_channel();
            let machine = SessionMachine::new(
                DeviceAddress::parse(ADDRESS).unwrap(),
                Arc::new(transport),
                AttributeRegistry::helena(),
                ObservationDecoder::new(RecordLayout::raw()),
                bus,
                tx,
            );
            Self {
                machine,
                events,
                _completions: rx,
            }
        }

        fn deliver(&mut self, event: TransportEvent) {
            let cycle = self.machine.cycle();
            self.machine.handle_completion(Completion { cycle, event });
        }

        fn drain(&mut self) -> Vec<SessionEvent> {
            let mut out = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                out.push(event);
            }
            out
        }
    }

    fn notify_handle() -> CharacteristicHandle {
        CharacteristicHandle::new(
            HELENA_SERVICE_UUID,
            DATA_AVAILABLE_UUID,
            CharacteristicProperties::NOTIFY,
        )
    }

    fn read_handle() -> CharacteristicHandle {
        CharacteristicHandle::new(
            HELENA_SERVICE_UUID,
            OBSERVATION_SET_UUID,
            CharacteristicProperties::READ,
        )
    }

    fn generic_access() -> DiscoveredService {
        DiscoveredService {
            uuid: GENERIC_ACCESS_UUID,
            characteristics: vec![CharacteristicHandle::new(
                GENERIC_ACCESS_UUID,
                DEVICE_NAME_UUID,
                CharacteristicProperties::READ,
            )],
        }
    }

    fn helena_services() -> Vec<DiscoveredService> {
        vec![
            generic_access(),
            DiscoveredService {
                uuid: HELENA_SERVICE_UUID,
                characteristics: vec![notify_handle(), read_handle()],
            },
        ]
    }

    /// A transport that accepts connect and discovery requests.
    fn accepting_transport() -> MockTransport {
        let mut transport = MockTransport::new();
        transport.expect_is_initialized().return_const(true);
        transport.expect_connect().returning(|_, _| Ok(()));
        transport.expect_discover_services().returning(|| Ok(()));
        transport
    }

    /// Drive a harness to `Ready` with the Helena service present.
    fn ready_harness(mut transport: MockTransport) -> Harness {
        transport
            .expect_enable_notification()
            .withf(|handle, enabled| handle.uuid == DATA_AVAILABLE_UUID && *enabled)
            .times(1)
            .returning(|_, _| Ok(()));

        let mut h = Harness::new(transport);
        h.machine.connect().unwrap();
        h.deliver(TransportEvent::Connected);
        h.deliver(TransportEvent::ServicesDiscovered(Ok(helena_services())));
        assert_eq!(h.machine.state(), ConnectionState::Ready);
        assert_eq!(
            h.drain(),
            vec![SessionEvent::Connected, SessionEvent::ServicesDiscovered]
        );
        h
    }

    #[test]
    fn test_connection_state() {
        assert!(!ConnectionState::Disconnected.is_connected());
        assert!(ConnectionState::Connected.is_connected());
        assert!(ConnectionState::Ready.is_connected());
        assert!(!ConnectionState::Connecting.is_connected());

        assert!(ConnectionState::Connecting.is_transitioning());
        assert!(ConnectionState::ServicesDiscovering.is_transitioning());
        assert!(!ConnectionState::Ready.is_transitioning());

        assert!(ConnectionState::Ready.is_ready());
        assert!(!ConnectionState::Connected.is_ready());
    }

    #[test]
    fn test_connection_state_display() {
        assert_eq!(format!("{}", ConnectionState::Ready), "Ready");
        assert_eq!(format!("{}", ConnectionState::Disconnected), "Disconnected");
    }

    #[test]
    fn test_connect_requires_initialized_transport() {
        let mut transport = MockTransport::new();
        transport.expect_is_initialized().return_const(false);
        transport.expect_connect().times(0);

        let mut h = Harness::new(transport);
        assert!(matches!(h.machine.connect(), Err(Error::NotInitialized)));
        assert_eq!(h.machine.state(), ConnectionState::Disconnected);
        assert!(h.drain().is_empty());
    }

    #[test]
    fn test_connect_transport_refusal_keeps_state() {
        let mut transport = MockTransport::new();
        transport.expect_is_initialized().return_const(true);
        transport
            .expect_connect()
            .times(1)
            .returning(|_, _| Err(TransportError::Unavailable));

        let mut h = Harness::new(transport);
        assert!(matches!(
            h.machine.connect(),
            Err(Error::Transport(TransportError::Unavailable))
        ));
        assert_eq!(h.machine.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_connect_passes_address_and_cycle() {
        let mut transport = MockTransport::new();
        transport.expect_is_initialized().return_const(true);
        transport
            .expect_connect()
            .withf(|address, sink| address.matches(ADDRESS) && sink.cycle() == 1)
            .times(1)
            .returning(|_, _| Ok(()));

        let mut h = Harness::new(transport);
        h.machine.connect().unwrap();
        assert_eq!(h.machine.state(), ConnectionState::Connecting);
        assert!(matches!(
            h.machine.connect(),
            Err(Error::InvalidState {
                state: ConnectionState::Connecting,
                ..
            })
        ));
    }

    #[test]
    fn test_successful_session() {
        let mut h = ready_harness(accepting_transport());

        assert_eq!(
            h.machine.matched_service().map(|s| s.uuid),
            Some(HELENA_SERVICE_UUID)
        );
        assert_eq!(h.machine.notify_characteristic(), Some(notify_handle()));
        assert_eq!(h.machine.readable_characteristic(), Some(read_handle()));
        assert_eq!(h.machine.services().len(), 2);

        h.deliver(TransportEvent::Notification {
            characteristic: DATA_AVAILABLE_UUID,
            value: vec![0x01, 0x02, 0x0A],
        });

        let events = h.drain();
        assert_eq!(events.len(), 1);
        match &events[0] {
            SessionEvent::DataNotified(record) => assert_eq!(record.hex(), "01 02 0A "),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_unmatched_services() {
        let mut transport = accepting_transport();
        transport.expect_enable_notification().times(0);

        let mut h = Harness::new(transport);
        h.machine.connect().unwrap();
        h.deliver(TransportEvent::Connected);
        h.deliver(TransportEvent::ServicesDiscovered(Ok(vec![generic_access()])));

        assert_eq!(h.machine.state(), ConnectionState::Ready);
        assert!(h.machine.matched_service().is_none());
        assert!(h.machine.notify_characteristic().is_none());
        assert!(h.machine.readable_characteristic().is_none());
        assert_eq!(
            h.drain(),
            vec![SessionEvent::Connected, SessionEvent::ServicesDiscovered]
        );

        // A read without a matched characteristic is refused but leaves the
        // session usable.
        assert!(matches!(
            h.machine.request_read(),
            Err(Error::CharacteristicNotFound {
                role: CharacteristicRole::ReadableSet
            })
        ));
        assert_eq!(h.machine.state(), ConnectionState::Ready);
        assert!(h.drain().is_empty());
    }

    #[test]
    fn test_read_protected_characteristic_is_skipped() {
        let mut transport = accepting_transport();
        transport.expect_enable_notification().returning(|_, _| Ok(()));
        transport.expect_read_characteristic().times(0);

        let mut h = Harness::new(transport);
        h.machine.connect().unwrap();
        h.deliver(TransportEvent::Connected);
        h.deliver(TransportEvent::ServicesDiscovered(Ok(vec![DiscoveredService {
            uuid: HELENA_SERVICE_UUID,
            characteristics: vec![
                notify_handle(),
                CharacteristicHandle::new(
                    HELENA_SERVICE_UUID,
                    OBSERVATION_SET_UUID,
                    CharacteristicProperties::WRITE,
                ),
            ],
        }])));

        assert_eq!(h.machine.state(), ConnectionState::Ready);
        assert!(h.machine.readable_characteristic().is_none());
        assert!(matches!(
            h.machine.request_read(),
            Err(Error::CharacteristicNotFound {
                role: CharacteristicRole::ReadableSet
            })
        ));
    }

    #[test]
    fn test_discovery_failure_then_retry() {
        let mut transport = accepting_transport();
        transport.expect_enable_notification().returning(|_, _| Ok(()));

        let mut h = Harness::new(transport);
        h.machine.connect().unwrap();
        h.deliver(TransportEvent::Connected);
        h.deliver(TransportEvent::ServicesDiscovered(Err(GattStatus::FAILURE)));

        assert_eq!(h.machine.state(), ConnectionState::Connected);
        assert_eq!(
            h.drain(),
            vec![
                SessionEvent::Connected,
                SessionEvent::Error(ErrorKind::DiscoveryFailed {
                    status: GattStatus::FAILURE
                }),
            ]
        );

        h.machine.discover_services().unwrap();
        assert_eq!(h.machine.state(), ConnectionState::ServicesDiscovering);
        h.deliver(TransportEvent::ServicesDiscovered(Ok(helena_services())));
        assert_eq!(h.machine.state(), ConnectionState::Ready);
    }

    #[test]
    fn test_discover_services_requires_connected() {
        let mut h = Harness::new(MockTransport::new());
        assert!(matches!(
            h.machine.discover_services(),
            Err(Error::InvalidState {
                state: ConnectionState::Disconnected,
                ..
            })
        ));
    }

    #[test]
    fn test_disconnect_during_discovery() {
        let mut transport = accepting_transport();
        transport.expect_disconnect().times(1).return_const(());
        transport.expect_enable_notification().times(0);

        let mut h = Harness::new(transport);
        h.machine.connect().unwrap();
        h.deliver(TransportEvent::Connected);
        assert_eq!(h.machine.state(), ConnectionState::ServicesDiscovering);

        h.machine.disconnect();
        h.deliver(TransportEvent::ServicesDiscovered(Ok(helena_services())));
        h.deliver(TransportEvent::Disconnected);

        assert_eq!(h.machine.state(), ConnectionState::Disconnected);
        assert!(h.machine.notify_characteristic().is_none());
        assert_eq!(
            h.drain(),
            vec![SessionEvent::Connected, SessionEvent::Disconnected]
        );
    }

    #[test]
    fn test_calls_from_disconnected_are_silent() {
        // No expectations: any transport call would panic.
        let mut h = Harness::new(MockTransport::new());

        h.machine.disconnect();
        h.machine.request_read().unwrap();

        assert_eq!(h.machine.state(), ConnectionState::Disconnected);
        assert!(h.drain().is_empty());
    }

    #[test]
    fn test_close_twice_publishes_once() {
        let mut transport = accepting_transport();
        transport.expect_close().times(2).return_const(());

        let mut h = Harness::new(transport);
        h.machine.connect().unwrap();
        h.deliver(TransportEvent::Connected);

        h.machine.close();
        h.machine.close();

        assert_eq!(h.machine.state(), ConnectionState::Disconnected);
        assert_eq!(
            h.drain(),
            vec![SessionEvent::Connected, SessionEvent::Disconnected]
        );
    }

    #[test]
    fn test_close_after_disconnect_does_not_republish() {
        let mut transport = accepting_transport();
        transport.expect_disconnect().return_const(());
        transport.expect_close().times(1).return_const(());

        let mut h = Harness::new(transport);
        h.machine.connect().unwrap();
        h.machine.disconnect();
        h.machine.close();

        assert_eq!(h.drain(), vec![SessionEvent::Disconnected]);
    }

    #[test]
    fn test_disconnect_from_ready_disarms_notifications() {
        let mut transport = accepting_transport();
        transport
            .expect_enable_notification()
            .withf(|_, enabled| !*enabled)
            .times(1)
            .returning(|_, _| Ok(()));
        transport.expect_disconnect().times(1).return_const(());

        let mut h = ready_harness(transport);
        h.machine.disconnect();

        assert_eq!(h.machine.state(), ConnectionState::Disconnected);
        assert!(h.machine.matched_service().is_none());
        assert!(h.machine.services().is_empty());
        assert_eq!(h.drain(), vec![SessionEvent::Disconnected]);
    }

    #[test]
    fn test_transport_teardown_from_ready() {
        let mut h = ready_harness(accepting_transport());
        h.deliver(TransportEvent::Disconnected);

        assert_eq!(h.machine.state(), ConnectionState::Disconnected);
        assert!(h.machine.notify_characteristic().is_none());
        assert_eq!(h.drain(), vec![SessionEvent::Disconnected]);

        // Late payloads on the dead link are dropped.
        h.deliver(TransportEvent::Notification {
            characteristic: DATA_AVAILABLE_UUID,
            value: vec![1],
        });
        assert!(h.drain().is_empty());
    }

    #[test]
    fn test_reconnect_ignores_previous_cycle() {
        let mut transport = accepting_transport();
        transport.expect_disconnect().return_const(());

        let mut h = Harness::new(transport);
        h.machine.connect().unwrap();
        h.machine.disconnect();
        h.machine.connect().unwrap();
        assert_eq!(h.machine.cycle(), 2);
        h.drain();

        h.machine.handle_completion(Completion {
            cycle: 1,
            event: TransportEvent::Connected,
        });
        assert_eq!(h.machine.state(), ConnectionState::Connecting);
        assert!(h.drain().is_empty());

        h.deliver(TransportEvent::Connected);
        assert_eq!(h.machine.state(), ConnectionState::ServicesDiscovering);
    }

    #[test]
    fn test_connection_failed() {
        let mut h = Harness::new(accepting_transport());
        h.machine.connect().unwrap();
        h.deliver(TransportEvent::ConnectionFailed {
            status: GattStatus::DEVICE_NOT_FOUND,
        });

        assert_eq!(h.machine.state(), ConnectionState::Disconnected);
        assert_eq!(
            h.drain(),
            vec![
                SessionEvent::Error(ErrorKind::TransportFailure {
                    status: GattStatus::DEVICE_NOT_FOUND
                }),
                SessionEvent::Disconnected,
            ]
        );
    }

    #[test]
    fn test_unexpected_characteristic_is_ignored() {
        let mut h = ready_harness(accepting_transport());
        h.deliver(TransportEvent::Notification {
            characteristic: DEVICE_NAME_UUID,
            value: vec![0x41],
        });
        h.deliver(TransportEvent::ReadComplete {
            characteristic: notify_handle(),
            result: Ok(vec![0x41]),
        });

        assert_eq!(h.machine.state(), ConnectionState::Ready);
        assert!(h.drain().is_empty());
    }

    #[test]
    fn test_read_flow() {
        let mut transport = accepting_transport();
        transport
            .expect_read_characteristic()
            .withf(|handle| handle.uuid == OBSERVATION_SET_UUID)
            .times(2)
            .returning(|_| Ok(()));

        let mut h = ready_harness(transport);

        h.machine.request_read().unwrap();
        h.deliver(TransportEvent::ReadComplete {
            characteristic: read_handle(),
            result: Ok(vec![0xDE, 0xAD]),
        });

        h.machine.request_read().unwrap();
        h.deliver(TransportEvent::ReadComplete {
            characteristic: read_handle(),
            result: Err(GattStatus::READ_NOT_PERMITTED),
        });

        let events = h.drain();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].record().map(|r| r.hex()), Some("DE AD "));
        assert!(matches!(events[0], SessionEvent::DataRead(_)));
        assert_eq!(
            events[1],
            SessionEvent::Error(ErrorKind::TransportFailure {
                status: GattStatus::READ_NOT_PERMITTED
            })
        );
    }

    #[test]
    fn test_request_read_while_connecting() {
        let mut h = Harness::new(accepting_transport());
        h.machine.connect().unwrap();
        assert!(matches!(
            h.machine.request_read(),
            Err(Error::InvalidState {
                state: ConnectionState::Connecting,
                ..
            })
        ));
    }

    #[test]
    fn test_arming_failure_is_reported() {
        let mut h = ready_harness(accepting_transport());
        h.deliver(TransportEvent::NotificationArmed {
            characteristic: notify_handle(),
            enabled: true,
            result: Err(GattStatus::INSUFFICIENT_AUTHENTICATION),
        });

        assert_eq!(h.machine.state(), ConnectionState::Ready);
        assert_eq!(
            h.drain(),
            vec![SessionEvent::Error(ErrorKind::TransportFailure {
                status: GattStatus::INSUFFICIENT_AUTHENTICATION
            })]
        );
    }
}

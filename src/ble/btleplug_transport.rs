//! `btleplug`-backed transport.
//!
//! Implements [`Transport`] on top of the host BLE stack through `btleplug`.
//! Each request is run as a task on the runtime captured during
//! `initialize`, and its outcome is posted through the link's
//! [`CompletionSink`].

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, Service,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::stream::{Stream, StreamExt};
use parking_lot::RwLock;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::ble::registry::CharacteristicProperties;
use crate::ble::transport::{
    CharacteristicHandle, CompletionSink, DeviceAddress, DiscoveredService, GattStatus,
    Transport, TransportEvent,
};
use crate::ble::uuids::*;
use crate::error::TransportError;

type SharedLink = Arc<RwLock<Option<Link>>>;

/// How long to scan for a peripheral the adapter does not know yet.
pub const DEFAULT_SCAN_TIMEOUT: Duration = Duration::from_secs(10);

/// The single platform connection owned by the transport.
struct Link {
    /// Address the link points at.
    address: DeviceAddress,
    /// Where completions for the current cycle go.
    sink: CompletionSink,
    /// The peripheral, once located.
    peripheral: Option<Peripheral>,
    /// Set when a disconnect was requested while the connect was pending.
    cancelled: bool,
    /// Whether notification and disconnect watchers are running.
    watching: bool,
    /// Connect task and watchers.
    tasks: Vec<JoinHandle<()>>,
    /// Teardown started by `disconnect` that has not been awaited yet.
    disconnecting: Option<JoinHandle<()>>,
}

impl Link {
    fn new(address: DeviceAddress, sink: CompletionSink) -> Self {
        Self {
            address,
            sink,
            peripheral: None,
            cancelled: false,
            watching: false,
            tasks: Vec::new(),
            disconnecting: None,
        }
    }

    /// Whether a new connect to `address` may keep using this link.
    fn reusable_for(&self, address: &DeviceAddress) -> bool {
        self.address == *address && !self.cancelled && self.peripheral.is_some()
    }

    fn track(&mut self, task: JoinHandle<()>) {
        self.tasks.retain(|t| !t.is_finished());
        self.tasks.push(task);
    }

    fn abort(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.watching = false;
    }
}

/// What a connect attempt starts from.
struct LinkPlan {
    /// Peripheral of a link that stays in use.
    reused: Option<Peripheral>,
    /// Teardown of the replaced link, to finish before connecting again.
    pending_disconnect: Option<JoinHandle<()>>,
}

/// Point `slot` at `address` for the cycle carried by `sink`.
///
/// A link is only kept when it targets the same address and no disconnect
/// was requested on it. Otherwise it is replaced by a fresh one and any
/// teardown still running on it is handed to the caller.
fn prepare_link(slot: &mut Option<Link>, address: &DeviceAddress, sink: &CompletionSink) -> LinkPlan {
    if let Some(link) = slot.as_mut().filter(|l| l.reusable_for(address)) {
        debug!("Trying to use an existing link for {}", address);
        link.sink = sink.clone();
        return LinkPlan {
            reused: link.peripheral.clone(),
            pending_disconnect: None,
        };
    }

    let pending_disconnect = slot.take().and_then(|mut old| {
        debug!("Dropping link to {}", old.address);
        old.abort();
        old.disconnecting.take()
    });

    debug!("Trying to create a new link to {}", address);
    *slot = Some(Link::new(address.clone(), sink.clone()));

    LinkPlan {
        reused: None,
        pending_disconnect,
    }
}

/// [`Transport`] implementation backed by `btleplug`.
pub struct BtleplugTransport {
    /// The BLE adapter to use.
    adapter: RwLock<Option<Adapter>>,
    /// Runtime that runs transport tasks.
    runtime: RwLock<Option<Handle>>,
    /// The current link.
    link: SharedLink,
    /// Characteristics whose configuration descriptor is written explicitly
    /// when notifications are enabled.
    descriptor_quirks: Vec<Uuid>,
    /// Services advertised by the peripherals scanned for.
    scan_services: Vec<Uuid>,
    /// Upper bound on a scan for an unknown peripheral.
    scan_timeout: Duration,
}

impl BtleplugTransport {
    /// Create a transport that will use the first adapter found.
    pub fn new() -> Self {
        Self {
            adapter: RwLock::new(None),
            runtime: RwLock::new(None),
            link: Arc::new(RwLock::new(None)),
            descriptor_quirks: vec![DATA_AVAILABLE_UUID],
            scan_services: vec![HELENA_SERVICE_UUID],
            scan_timeout: DEFAULT_SCAN_TIMEOUT,
        }
    }

    /// Create a transport with a specific adapter.
    pub fn with_adapter(adapter: Adapter) -> Self {
        let transport = Self::new();
        *transport.adapter.write() = Some(adapter);
        transport
    }

    /// Replace the list of characteristics that need an explicit
    /// configuration descriptor write.
    pub fn with_descriptor_quirks(mut self, characteristics: Vec<Uuid>) -> Self {
        self.descriptor_quirks = characteristics;
        self
    }

    /// Set how long to scan for a peripheral the adapter has not seen yet.
    pub fn with_scan_timeout(mut self, timeout: Duration) -> Self {
        self.scan_timeout = timeout;
        self
    }

    /// Restrict scans to peripherals advertising one of `services`.
    ///
    /// An empty list scans for every peripheral.
    pub fn with_scan_services(mut self, services: Vec<Uuid>) -> Self {
        self.scan_services = services;
        self
    }

    fn runtime(&self) -> Result<Handle, TransportError> {
        self.runtime.read().clone().ok_or(TransportError::NotInitialized)
    }

    /// The located peripheral and current sink of the open link.
    fn open_link(&self) -> Result<(Handle, Peripheral, CompletionSink), TransportError> {
        let runtime = self.runtime()?;
        let guard = self.link.read();
        let link = guard.as_ref().ok_or(TransportError::NotConnected)?;
        let peripheral = link
            .peripheral
            .clone()
            .ok_or(TransportError::NotConnected)?;
        Ok((runtime, peripheral, link.sink.clone()))
    }
}

impl Default for BtleplugTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for BtleplugTransport {
    async fn initialize(&self) -> Result<(), TransportError> {
        if self.adapter.read().is_none() {
            let manager = Manager::new()
                .await
                .map_err(|_e| TransportError::Unavailable)?;

            let adapters = manager.adapters().await?;

            let adapter = adapters
                .into_iter()
                .next()
                .ok_or(TransportError::Unavailable)?;

            info!(
                "Using Bluetooth adapter: {:?}",
                adapter.adapter_info().await.ok()
            );

            *self.adapter.write() = Some(adapter);
        }

        if self.runtime.read().is_none() {
            *self.runtime.write() = Some(Handle::current());
        }

        Ok(())
    }

    fn is_initialized(&self) -> bool {
        self.adapter.read().is_some() && self.runtime.read().is_some()
    }

    fn connect(&self, address: &DeviceAddress, sink: CompletionSink) -> Result<(), TransportError> {
        let adapter = self
            .adapter
            .read()
            .clone()
            .ok_or(TransportError::NotInitialized)?;
        let runtime = self.runtime()?;

        let LinkPlan {
            reused,
            pending_disconnect,
        } = prepare_link(&mut self.link.write(), address, &sink);

        let link = self.link.clone();
        let address = address.clone();
        let task_runtime = runtime.clone();
        let scan = ScanFilter {
            services: self.scan_services.clone(),
        };
        let scan_timeout = self.scan_timeout;

        let task = runtime.spawn(async move {
            if let Some(pending) = pending_disconnect {
                debug!("Waiting for the previous link to {} to close", address);
                if let Err(e) = pending.await {
                    debug!("Previous disconnect did not finish: {}", e);
                }
            }

            let peripheral = match reused {
                Some(peripheral) => peripheral,
                None => match locate_peripheral(&adapter, &address, scan, scan_timeout).await {
                    Ok(Some(peripheral)) => peripheral,
                    Ok(None) => {
                        warn!("Device {} not found. Unable to connect.", address);
                        sink.deliver(TransportEvent::ConnectionFailed {
                            status: GattStatus::DEVICE_NOT_FOUND,
                        });
                        return;
                    }
                    Err(e) => {
                        error!("Failed to look up {}: {}", address, e);
                        sink.deliver(TransportEvent::ConnectionFailed {
                            status: GattStatus::FAILURE,
                        });
                        return;
                    }
                },
            };

            if !peripheral.is_connected().await.unwrap_or(false) {
                if let Err(e) = peripheral.connect().await {
                    warn!("Connection to {} failed: {}", address, e);
                    sink.deliver(TransportEvent::ConnectionFailed {
                        status: GattStatus::FAILURE,
                    });
                    return;
                }
            } else {
                info!("Peripheral {} already connected at BLE level", address);
            }

            let attached = {
                let mut guard = link.write();
                let current = guard
                    .as_mut()
                    .filter(|l| l.sink.cycle() == sink.cycle() && !l.cancelled);
                match current {
                    Some(current) => {
                        current.peripheral = Some(peripheral.clone());

                        if !current.watching {
                            current.track(task_runtime.spawn(forward_notifications(
                                peripheral.clone(),
                                link.clone(),
                            )));
                            current.track(task_runtime.spawn(watch_disconnects(
                                adapter.clone(),
                                peripheral.id(),
                                link.clone(),
                            )));
                            current.watching = true;
                        }
                        true
                    }
                    None => false,
                }
            };

            if !attached {
                debug!("Link to {} cancelled while connecting", address);
                if let Err(e) = peripheral.disconnect().await {
                    debug!("Failed to drop cancelled connection: {}", e);
                }
                return;
            }

            info!("Connected to {}", address);
            sink.deliver(TransportEvent::Connected);
        });

        if let Some(link) = self.link.write().as_mut() {
            link.track(task);
        }

        Ok(())
    }

    fn disconnect(&self) {
        let Ok(runtime) = self.runtime() else {
            debug!("Transport not initialized, nothing to disconnect");
            return;
        };

        let mut guard = self.link.write();
        let Some(link) = guard.as_mut() else {
            debug!("No link to disconnect");
            return;
        };
        link.cancelled = true;

        let peripheral = link.peripheral.clone();
        let sink = link.sink.clone();
        link.disconnecting = Some(runtime.spawn(async move {
            if let Some(peripheral) = peripheral {
                match peripheral.disconnect().await {
                    Ok(()) => info!("Successfully disconnected"),
                    Err(e) => error!("Failed to disconnect: {}", e),
                }
            }
            sink.deliver(TransportEvent::Disconnected);
        }));
    }

    fn discover_services(&self) -> Result<(), TransportError> {
        let (runtime, peripheral, sink) = self.open_link()?;

        runtime.spawn(async move {
            let result = match peripheral.discover_services().await {
                Ok(()) => {
                    let services: Vec<DiscoveredService> =
                        peripheral.services().iter().map(discovered_service).collect();
                    debug!("Discovered {} services", services.len());
                    Ok(services)
                }
                Err(e) => {
                    warn!("Failed to discover services: {}", e);
                    Err(GattStatus::FAILURE)
                }
            };
            sink.deliver(TransportEvent::ServicesDiscovered(result));
        });

        Ok(())
    }

    fn enable_notification(
        &self,
        characteristic: &CharacteristicHandle,
        enabled: bool,
    ) -> Result<(), TransportError> {
        let (runtime, peripheral, sink) = self.open_link()?;
        let target = find_characteristic(&peripheral, characteristic)?;
        let handle = *characteristic;
        let write_descriptor = enabled && self.descriptor_quirks.contains(&handle.uuid);

        runtime.spawn(async move {
            let outcome = if enabled {
                peripheral.subscribe(&target).await
            } else {
                peripheral.unsubscribe(&target).await
            };

            let mut result = outcome.map_err(|e| {
                warn!("Failed to configure notifications on {}: {}", handle.uuid, e);
                GattStatus::FAILURE
            });

            if result.is_ok() && write_descriptor {
                result = write_notification_descriptor(&peripheral, &target).await;
            }

            sink.deliver(TransportEvent::NotificationArmed {
                characteristic: handle,
                enabled,
                result,
            });
        });

        Ok(())
    }

    fn read_characteristic(&self, characteristic: &CharacteristicHandle) -> Result<(), TransportError> {
        let (runtime, peripheral, sink) = self.open_link()?;
        let target = find_characteristic(&peripheral, characteristic)?;
        let handle = *characteristic;

        runtime.spawn(async move {
            let result = match peripheral.read(&target).await {
                Ok(data) => {
                    trace!("Read {} bytes from characteristic {}", data.len(), handle.uuid);
                    Ok(data)
                }
                Err(e) => {
                    warn!("Failed to read {}: {}", handle.uuid, e);
                    Err(GattStatus::FAILURE)
                }
            };
            sink.deliver(TransportEvent::ReadComplete {
                characteristic: handle,
                result,
            });
        });

        Ok(())
    }

    fn close(&self) {
        let Some(mut link) = self.link.write().take() else {
            return;
        };

        debug!("Closing link to {}", link.address);
        link.abort();

        if let (Some(peripheral), Ok(runtime)) = (link.peripheral.take(), self.runtime()) {
            runtime.spawn(async move {
                if let Err(e) = peripheral.disconnect().await {
                    debug!("Disconnect during close failed: {}", e);
                }
            });
        }
    }
}

impl Drop for BtleplugTransport {
    fn drop(&mut self) {
        if let Some(link) = self.link.write().as_mut() {
            link.abort();
        }
    }
}

impl std::fmt::Debug for BtleplugTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BtleplugTransport")
            .field("initialized", &self.is_initialized())
            .field(
                "link",
                &self.link.read().as_ref().map(|l| l.address.to_string()),
            )
            .field("descriptor_quirks", &self.descriptor_quirks)
            .field("scan_timeout", &self.scan_timeout)
            .finish()
    }
}

/// Whether `peripheral` is the one at `address`, by platform identifier or
/// hardware address.
async fn peripheral_matches(peripheral: &Peripheral, address: &DeviceAddress) -> bool {
    if address.matches(&peripheral.id().to_string()) {
        return true;
    }

    match peripheral.properties().await {
        Ok(Some(properties)) => address.matches(&properties.address.to_string()),
        Ok(None) => false,
        Err(e) => {
            debug!("Failed to read properties of {:?}: {}", peripheral.id(), e);
            false
        }
    }
}

/// Find a peripheral the adapter already knows about.
async fn find_known_peripheral(
    adapter: &Adapter,
    address: &DeviceAddress,
) -> Result<Option<Peripheral>, btleplug::Error> {
    for peripheral in adapter.peripherals().await? {
        if peripheral_matches(&peripheral, address).await {
            return Ok(Some(peripheral));
        }
    }
    Ok(None)
}

/// Find the peripheral at `address`, scanning for it when the adapter has
/// not seen it yet.
async fn locate_peripheral(
    adapter: &Adapter,
    address: &DeviceAddress,
    filter: ScanFilter,
    timeout: Duration,
) -> Result<Option<Peripheral>, btleplug::Error> {
    if let Some(peripheral) = find_known_peripheral(adapter, address).await? {
        return Ok(Some(peripheral));
    }

    debug!("Device {} not known yet, scanning for up to {:?}", address, timeout);

    let events = adapter.events().await?;
    adapter.start_scan(filter).await?;

    let discovered = events.filter_map(|event| futures::future::ready(discovered_id(event)));
    let found = first_match(discovered, timeout, |id| {
        let adapter = adapter.clone();
        let address = address.clone();
        async move {
            let peripheral = adapter.peripheral(&id).await.ok()?;
            let matched = peripheral_matches(&peripheral, &address).await;
            matched.then_some(peripheral)
        }
    })
    .await;

    if let Err(e) = adapter.stop_scan().await {
        warn!("Failed to stop scan: {}", e);
    }

    match found {
        Some(peripheral) => Ok(Some(peripheral)),
        None => find_known_peripheral(adapter, address).await,
    }
}

fn discovered_id(event: CentralEvent) -> Option<PeripheralId> {
    match event {
        CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => Some(id),
        _ => None,
    }
}

/// Resolve candidates in arrival order until one matches, the stream ends,
/// or `timeout` passes.
async fn first_match<S, F, Fut, P>(mut candidates: S, timeout: Duration, mut resolve: F) -> Option<P>
where
    S: Stream + Unpin,
    F: FnMut(S::Item) -> Fut,
    Fut: Future<Output = Option<P>>,
{
    let search = async {
        while let Some(candidate) = candidates.next().await {
            if let Some(found) = resolve(candidate).await {
                return Some(found);
            }
        }
        None
    };

    tokio::time::timeout(timeout, search).await.unwrap_or(None)
}

fn find_characteristic(
    peripheral: &Peripheral,
    handle: &CharacteristicHandle,
) -> Result<Characteristic, TransportError> {
    peripheral
        .characteristics()
        .into_iter()
        .find(|c| c.uuid == handle.uuid && c.service_uuid == handle.service)
        .ok_or(TransportError::CharacteristicNotFound { uuid: handle.uuid })
}

/// Convert a `btleplug` service into the transport-neutral form.
fn discovered_service(service: &Service) -> DiscoveredService {
    DiscoveredService {
        uuid: service.uuid,
        characteristics: service
            .characteristics
            .iter()
            .map(|c| {
                CharacteristicHandle::new(
                    service.uuid,
                    c.uuid,
                    CharacteristicProperties::from_bits(c.properties.bits()),
                )
            })
            .collect(),
    }
}

/// Write the notification-enable value to the characteristic's client
/// configuration descriptor.
async fn write_notification_descriptor(
    peripheral: &Peripheral,
    characteristic: &Characteristic,
) -> Result<(), GattStatus> {
    let Some(descriptor) = characteristic
        .descriptors
        .iter()
        .find(|d| d.uuid == CLIENT_CHARACTERISTIC_CONFIG_UUID)
    else {
        debug!(
            "Characteristic {} exposes no configuration descriptor",
            characteristic.uuid
        );
        return Ok(());
    };

    peripheral
        .write_descriptor(descriptor, &ENABLE_NOTIFICATION_VALUE)
        .await
        .map_err(|e| {
            warn!(
                "Failed to write configuration descriptor of {}: {}",
                characteristic.uuid, e
            );
            GattStatus::FAILURE
        })
}

fn current_sink(link: &SharedLink) -> Option<CompletionSink> {
    link.read().as_ref().map(|l| l.sink.clone())
}

async fn forward_notifications(peripheral: Peripheral, link: SharedLink) {
    debug!("Notification listener task starting");

    let mut notifications = match peripheral.notifications().await {
        Ok(n) => n,
        Err(e) => {
            error!("Failed to get notifications stream: {}", e);
            return;
        }
    };

    while let Some(notification) = notifications.next().await {
        trace!(
            "Notification received from {}: {} bytes",
            notification.uuid,
            notification.value.len()
        );

        if let Some(sink) = current_sink(&link) {
            sink.deliver(TransportEvent::Notification {
                characteristic: notification.uuid,
                value: notification.value,
            });
        }
    }

    debug!("Notification listener stopped");
}

async fn watch_disconnects(adapter: Adapter, id: PeripheralId, link: SharedLink) {
    let mut events = match adapter.events().await {
        Ok(events) => events,
        Err(e) => {
            error!("Failed to get adapter events: {}", e);
            return;
        }
    };

    while let Some(event) = events.next().await {
        if let CentralEvent::DeviceDisconnected(disconnected) = event {
            if disconnected == id {
                info!("Peripheral {:?} disconnected", id);
                if let Some(sink) = current_sink(&link) {
                    sink.deliver(TransportEvent::Disconnected);
                }
            }
        }
    }

    debug!("Disconnect watcher stopped");
}

//! Session events and their delivery.
//!
//! Events are published on a `tokio::sync::broadcast` channel. Publishing
//! never blocks: a subscriber that falls more than the channel capacity
//! behind loses the oldest events and sees `RecvError::Lagged` on its next
//! receive.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{trace, warn};

use crate::error::ErrorKind;
use crate::protocol::ObservationRecord;

/// Default number of events buffered per subscriber.
pub const DEFAULT_EVENT_CAPACITY: usize = 64;

/// Something that happened on a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The link to the peripheral is up.
    Connected,
    /// The link to the peripheral is down.
    Disconnected,
    /// Service discovery finished and the session is ready.
    ServicesDiscovered,
    /// A notification was decoded.
    DataNotified(ObservationRecord),
    /// A read completed and was decoded.
    DataRead(ObservationRecord),
    /// An asynchronous operation failed.
    Error(ErrorKind),
}

impl SessionEvent {
    /// The decoded record carried by this event, if any.
    pub fn record(&self) -> Option<&ObservationRecord> {
        match self {
            Self::DataNotified(record) | Self::DataRead(record) => Some(record),
            _ => None,
        }
    }
}

/// Callback handle for unregistering callbacks.
pub struct CallbackHandle {
    id: u64,
    unregister_fn: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl CallbackHandle {
    /// Create a new callback handle.
    pub(crate) fn new(id: u64, unregister_fn: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            id,
            unregister_fn: Some(Box::new(unregister_fn)),
        }
    }

    /// Unregister this callback.
    pub fn unregister(mut self) {
        if let Some(f) = self.unregister_fn.take() {
            f();
        }
    }

    /// Get the callback ID.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for CallbackHandle {
    fn drop(&mut self) {
        if let Some(f) = self.unregister_fn.take() {
            f();
        }
    }
}

impl std::fmt::Debug for CallbackHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackHandle").field("id", &self.id).finish()
    }
}

/// Fan-out of session events to any number of subscribers.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SessionEvent>,
    callback_counter: Arc<AtomicU64>,
}

impl EventBus {
    /// Create a bus buffering up to `capacity` events per subscriber.
    ///
    /// A capacity of zero is raised to one.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            callback_counter: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Publish an event to every current subscriber.
    ///
    /// Returns the number of subscribers that received it.
    pub fn publish(&self, event: SessionEvent) -> usize {
        trace!("Publishing {:?}", event);
        self.tx.send(event).unwrap_or(0)
    }

    /// Subscribe to events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }

    /// Number of current subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Register a callback for every event.
    ///
    /// The callback runs on a spawned task, so this must be called from
    /// within a tokio runtime. Dropping the handle stops delivery.
    pub fn on_event<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(SessionEvent) + Send + Sync + 'static,
    {
        let callback_id = self.callback_counter.fetch_add(1, Ordering::SeqCst);
        let mut rx = self.tx.subscribe();

        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => callback(event),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Event callback {} lagged, {} events dropped", callback_id, skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        CallbackHandle::new(callback_id, move || {
            handle.abort();
        })
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::decode;
    use std::time::Duration;

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::default();
        assert_eq!(bus.publish(SessionEvent::Connected), 0);
    }

    #[test]
    fn test_subscribers_receive_in_order() {
        let bus = EventBus::default();
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        assert_eq!(bus.publish(SessionEvent::Connected), 2);
        assert_eq!(bus.publish(SessionEvent::ServicesDiscovered), 2);

        for rx in [&mut first, &mut second] {
            assert_eq!(rx.try_recv().unwrap(), SessionEvent::Connected);
            assert_eq!(rx.try_recv().unwrap(), SessionEvent::ServicesDiscovered);
            assert!(rx.try_recv().is_err());
        }
    }

    #[test]
    fn test_slow_subscriber_lags_instead_of_blocking() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();

        for _ in 0..5 {
            bus.publish(SessionEvent::Connected);
        }

        assert!(matches!(
            rx.try_recv(),
            Err(broadcast::error::TryRecvError::Lagged(3))
        ));
        assert_eq!(rx.try_recv().unwrap(), SessionEvent::Connected);
    }

    #[test]
    fn test_event_record() {
        let record = decode(&[1, 2]);
        assert_eq!(
            SessionEvent::DataRead(record.clone()).record(),
            Some(&record)
        );
        assert_eq!(SessionEvent::Disconnected.record(), None);
    }

    #[tokio::test]
    async fn test_on_event_callback() {
        let bus = EventBus::default();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let handle = bus.on_event(move |event| {
            let _ = tx.send(event);
        });
        bus.publish(SessionEvent::Connected);

        let received = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap();
        assert_eq!(received, Some(SessionEvent::Connected));

        handle.unregister();
        bus.publish(SessionEvent::Disconnected);

        // The aborted task drops the callback and with it the sender.
        let after = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap();
        assert_eq!(after, None);
    }
}

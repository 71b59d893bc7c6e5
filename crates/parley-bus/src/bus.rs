//! Event bus: typed synchronous fan-out with scoped subscriptions.

use parley_types::event::{BackendEvent, FrontendEvent};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Identifier of a registered handler, unique per bus.
pub type HandlerId = u64;

type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Handlers registered for one event family.
pub struct HandlerTable<E> {
    handlers: RwLock<Vec<(HandlerId, Handler<E>)>>,
}

impl<E> HandlerTable<E> {
    fn new() -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
        }
    }

    fn insert(&self, id: HandlerId, handler: Handler<E>) {
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        handlers.push((id, handler));
    }

    fn remove(&self, id: HandlerId) -> bool {
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        let before = handlers.len();
        handlers.retain(|(hid, _)| *hid != id);
        handlers.len() != before
    }

    fn snapshot(&self) -> Vec<Handler<E>> {
        let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
        handlers.iter().map(|(_, h)| Arc::clone(h)).collect()
    }

    fn len(&self) -> usize {
        self.handlers.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn clear(&self) {
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

mod sealed {
    pub trait Sealed {}
    impl Sealed for parley_types::event::BackendEvent {}
    impl Sealed for parley_types::event::FrontendEvent {}
}

/// An event family the bus can route.
///
/// Implemented for [`BackendEvent`] and [`FrontendEvent`] only; the set of
/// families is closed.
pub trait BusEvent: sealed::Sealed + Clone + Send + Sync + 'static {
    /// Short family name used in logs.
    const FAMILY: &'static str;

    #[doc(hidden)]
    fn table(bus: &EventBus) -> &HandlerTable<Self>;
}

impl BusEvent for BackendEvent {
    const FAMILY: &'static str = "backend";

    fn table(bus: &EventBus) -> &HandlerTable<Self> {
        &bus.backend
    }
}

impl BusEvent for FrontendEvent {
    const FAMILY: &'static str = "frontend";

    fn table(bus: &EventBus) -> &HandlerTable<Self> {
        &bus.frontend
    }
}

/// The process-wide event bus.
///
/// Create one per node with [`EventBus::new`] and share it as `Arc<EventBus>`.
/// Handler-table mutation is guarded by a lock, and handlers run after the
/// lock is released, so a handler may itself subscribe or unsubscribe.
pub struct EventBus {
    next_id: AtomicU64,
    closed: AtomicBool,
    backend: HandlerTable<BackendEvent>,
    frontend: HandlerTable<FrontendEvent>,
}

impl EventBus {
    /// Create a new, empty bus.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            backend: HandlerTable::new(),
            frontend: HandlerTable::new(),
        })
    }

    /// Publish an event to every handler registered for its family.
    ///
    /// Returns the number of handlers invoked.
    pub fn send<E: BusEvent>(&self, event: E) -> usize {
        if self.is_shut_down() {
            trace!(family = E::FAMILY, "Event dropped, bus is shut down");
            return 0;
        }
        let handlers = E::table(self).snapshot();
        for handler in &handlers {
            handler(&event);
        }
        handlers.len()
    }

    /// Register `handler` for events of family `E`.
    ///
    /// The handler stays registered until the returned [`Subscription`] is
    /// dropped or released with [`Subscription::unsubscribe`]. On a bus that
    /// has been shut down the subscription is inert.
    pub fn subscribe<E, F>(self: &Arc<Self>, handler: F) -> Subscription
    where
        E: BusEvent,
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if !self.is_shut_down() {
            E::table(self).insert(id, Arc::new(handler));
            debug!(family = E::FAMILY, handler = id, "Listener registered");
        }
        Subscription {
            bus: Arc::downgrade(self),
            id,
            remove: remove_handler::<E>,
            active: true,
        }
    }

    /// Register a handler that forwards every event of family `E` into an
    /// unbounded channel, for consumers running on an async task.
    pub fn subscribe_channel<E: BusEvent>(
        self: &Arc<Self>,
    ) -> (Subscription, mpsc::UnboundedReceiver<E>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = self.subscribe(move |event: &E| {
            let _ = tx.send(event.clone());
        });
        (subscription, rx)
    }

    /// Number of handlers currently registered for family `E`.
    pub fn listener_count<E: BusEvent>(&self) -> usize {
        E::table(self).len()
    }

    /// Drop every handler and stop accepting new ones.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.backend.clear();
        self.frontend.clear();
        debug!("Event bus shut down");
    }

    /// Whether [`EventBus::shutdown`] has been called.
    pub fn is_shut_down(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

fn remove_handler<E: BusEvent>(bus: &EventBus, id: HandlerId) {
    if E::table(bus).remove(id) {
        debug!(family = E::FAMILY, handler = id, "Listener removed");
    }
}

/// A scoped handler registration. Dropping it deregisters the handler.
#[must_use = "dropping a Subscription immediately deregisters its handler"]
pub struct Subscription {
    bus: Weak<EventBus>,
    id: HandlerId,
    remove: fn(&EventBus, HandlerId),
    active: bool,
}

impl Subscription {
    /// The handler's identifier.
    pub fn id(&self) -> HandlerId {
        self.id
    }

    /// Deregister the handler now.
    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !std::mem::take(&mut self.active) {
            return;
        }
        if let Some(bus) = self.bus.upgrade() {
            (self.remove)(&bus, self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("active", &self.active)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    fn counter() -> Arc<AtomicUsize> {
        Arc::new(AtomicUsize::new(0))
    }

    #[test]
    fn test_fan_out_to_all_listeners_of_family() {
        let bus = EventBus::new();
        let a = counter();
        let b = counter();
        let other = counter();

        let (a2, b2, other2) = (a.clone(), b.clone(), other.clone());
        let _sa = bus.subscribe(move |_: &BackendEvent| {
            a2.fetch_add(1, Ordering::SeqCst);
        });
        let _sb = bus.subscribe(move |_: &BackendEvent| {
            b2.fetch_add(1, Ordering::SeqCst);
        });
        let _so = bus.subscribe(move |_: &FrontendEvent| {
            other2.fetch_add(1, Ordering::SeqCst);
        });

        let delivered = bus.send(BackendEvent::PeerConnected);
        assert_eq!(delivered, 2);
        assert_eq!(a.load(Ordering::SeqCst), 1);
        assert_eq!(b.load(Ordering::SeqCst), 1);
        assert_eq!(other.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_event_payload_delivered() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        let _sub = bus.subscribe(move |e: &FrontendEvent| {
            seen2.lock().unwrap().push(e.clone());
        });

        bus.send(FrontendEvent::send_message("hi"));
        bus.send(FrontendEvent::Terminate);

        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![FrontendEvent::send_message("hi"), FrontendEvent::Terminate]
        );
    }

    #[test]
    fn test_dropped_subscription_receives_nothing() {
        let bus = EventBus::new();
        let hits = counter();
        let hits2 = hits.clone();
        let sub = bus.subscribe(move |_: &BackendEvent| {
            hits2.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(bus.listener_count::<BackendEvent>(), 1);

        drop(sub);
        assert_eq!(bus.listener_count::<BackendEvent>(), 0);
        assert_eq!(bus.send(BackendEvent::PeerDisconnected), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_explicit_unsubscribe_only_removes_own_handler() {
        let bus = EventBus::new();
        let first = bus.subscribe(|_: &BackendEvent| {});
        let _second = bus.subscribe(|_: &BackendEvent| {});
        first.unsubscribe();
        assert_eq!(bus.listener_count::<BackendEvent>(), 1);
    }

    #[test]
    fn test_handler_may_subscribe_during_send() {
        let bus = EventBus::new();
        let nested = Arc::new(Mutex::new(Vec::new()));
        let (bus2, nested2) = (bus.clone(), nested.clone());
        let _sub = bus.subscribe(move |_: &FrontendEvent| {
            let sub = bus2.subscribe(|_: &BackendEvent| {});
            nested2.lock().unwrap().push(sub);
        });

        bus.send(FrontendEvent::Terminate);
        assert_eq!(bus.listener_count::<BackendEvent>(), 1);
    }

    #[test]
    fn test_shutdown_clears_and_ignores() {
        let bus = EventBus::new();
        let hits = counter();
        let hits2 = hits.clone();
        let _sub = bus.subscribe(move |_: &BackendEvent| {
            hits2.fetch_add(1, Ordering::SeqCst);
        });

        bus.shutdown();
        assert!(bus.is_shut_down());
        assert_eq!(bus.send(BackendEvent::PeerConnected), 0);
        let _late = bus.subscribe(|_: &BackendEvent| {});
        assert_eq!(bus.listener_count::<BackendEvent>(), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_subscription_outliving_bus() {
        let bus = EventBus::new();
        let sub = bus.subscribe(|_: &BackendEvent| {});
        drop(bus);
        drop(sub);
    }

    #[tokio::test]
    async fn test_subscribe_channel() {
        let bus = EventBus::new();
        let (_sub, mut rx) = bus.subscribe_channel::<BackendEvent>();
        bus.send(BackendEvent::SetPeerName {
            name: "bob".to_string(),
        });
        assert_eq!(
            rx.recv().await,
            Some(BackendEvent::SetPeerName {
                name: "bob".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_channel_closes_when_unsubscribed() {
        let bus = EventBus::new();
        let (sub, mut rx) = bus.subscribe_channel::<FrontendEvent>();
        drop(sub);
        assert_eq!(rx.recv().await, None);
    }
}

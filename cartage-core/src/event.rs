//! Session events and their synchronous dispatcher.
//!
//! Workers report counters and failures as events; the transfer controller
//! listens for [`SessionEvent::Interrupt`] to implement cancellation. The
//! dispatcher is passed explicitly through the session context.

use std::collections::BTreeMap;
use std::error::Error;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::model::{DeferredKind, ExternalId, FeatureTypeId, GeometryClass, InternalKey};

/// Interrupt notification raised on fatal errors or user cancellation.
#[derive(Debug, Clone)]
pub struct InterruptEvent {
    /// Message logged by the controller when the interrupt is applied.
    pub message: String,
    /// Level at which the message is logged.
    pub level: log::Level,
    /// Root cause for fatal interrupts.
    pub cause: Option<Arc<dyn Error + Send + Sync>>,
}

impl InterruptEvent {
    /// Interrupt requested by the user.
    pub fn user(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            level: log::Level::Info,
            cause: None,
        }
    }

    /// Interrupt caused by a fatal error.
    pub fn fatal(message: impl Into<String>, cause: Arc<dyn Error + Send + Sync>) -> Self {
        Self {
            message: message.into(),
            level: log::Level::Error,
            cause: Some(cause),
        }
    }
}

/// Event emitted during a transfer session.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Object count increments by feature type.
    ObjectCounter(BTreeMap<FeatureTypeId, u64>),
    /// Geometry count increments by class.
    GeometryCounter(BTreeMap<GeometryClass, u64>),
    /// Progress message.
    StatusMessage(String),
    /// Progress title.
    StatusTitle(String),
    /// Number of tiles still to be processed, including the current one.
    RemainingTiles(u64),
    /// Number of objects matched by the current tile's query.
    NumberMatched(u64),
    /// Number of work items completed since the last step.
    ProgressStep(u64),
    /// A deferred record whose target never materialised.
    UnresolvedReference {
        /// Queue the record came from.
        kind: DeferredKind,
        /// Referencing feature.
        source: InternalKey,
        /// Missing target id or payload location.
        target: String,
    },
    /// A single work item failed and was skipped.
    ItemFailed {
        /// External id of the failed item, when known.
        external_id: Option<ExternalId>,
        /// Failure description.
        message: String,
    },
    /// A tile pass failed.
    TileFailed {
        /// Row of the tile.
        row: u32,
        /// Column of the tile.
        column: u32,
        /// Failure description.
        message: String,
    },
    /// Cancellation request.
    Interrupt(InterruptEvent),
}

/// Receiver of session events.
///
/// Handlers are called synchronously on the thread that triggered the event
/// and must therefore be cheap and thread-safe.
pub trait EventHandler: Send + Sync {
    /// React to one event.
    fn handle_event(&self, event: &SessionEvent);
}

/// Identifier returned when registering a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

#[derive(Default)]
struct Registry {
    handlers: RwLock<Vec<(HandlerId, Arc<dyn EventHandler>)>>,
    next_id: AtomicU64,
}

/// Synchronous fan-out of [`SessionEvent`]s to registered handlers.
///
/// Clones share the same handler list.
///
/// # Examples
/// ```
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicUsize, Ordering};
/// use cartage_core::{EventDispatcher, EventHandler, SessionEvent};
///
/// struct Count(AtomicUsize);
/// impl EventHandler for Count {
///     fn handle_event(&self, _event: &SessionEvent) {
///         self.0.fetch_add(1, Ordering::SeqCst);
///     }
/// }
///
/// let dispatcher = EventDispatcher::new();
/// let count = Arc::new(Count(AtomicUsize::new(0)));
/// dispatcher.add_handler(count.clone());
/// dispatcher.trigger(&SessionEvent::StatusMessage("hello".into()));
/// assert_eq!(count.0.load(Ordering::SeqCst), 1);
/// ```
#[derive(Clone, Default)]
pub struct EventDispatcher {
    registry: Arc<Registry>,
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("handlers", &self.registry.handlers.read().len())
            .finish()
    }
}

impl EventDispatcher {
    /// Create a dispatcher without handlers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler.
    pub fn add_handler(&self, handler: Arc<dyn EventHandler>) -> HandlerId {
        let id = HandlerId(self.registry.next_id.fetch_add(1, Ordering::Relaxed));
        self.registry.handlers.write().push((id, handler));
        id
    }

    /// Unregister a handler; returns whether it was registered.
    pub fn remove_handler(&self, id: HandlerId) -> bool {
        let mut handlers = self.registry.handlers.write();
        let before = handlers.len();
        handlers.retain(|(registered, _)| *registered != id);
        handlers.len() != before
    }

    /// Deliver `event` to every handler.
    ///
    /// The handler list is snapshotted first so handlers may trigger further
    /// events or register handlers without deadlocking.
    pub fn trigger(&self, event: &SessionEvent) {
        let handlers: Vec<Arc<dyn EventHandler>> = self
            .registry
            .handlers
            .read()
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect();
        for handler in handlers {
            handler.handle_event(event);
        }
    }

    /// Handle raising user interrupts on this dispatcher.
    #[must_use]
    pub fn cancellation_handle(&self) -> CancellationHandle {
        CancellationHandle {
            dispatcher: self.clone(),
        }
    }
}

/// Cloneable handle that cancels the session owning a dispatcher.
#[derive(Debug, Clone)]
pub struct CancellationHandle {
    dispatcher: EventDispatcher,
}

impl CancellationHandle {
    /// Raise a user interrupt.
    pub fn cancel(&self, message: impl Into<String>) {
        self.dispatcher
            .trigger(&SessionEvent::Interrupt(InterruptEvent::user(message)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use rstest::{fixture, rstest};

    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    impl EventHandler for Recorder {
        fn handle_event(&self, event: &SessionEvent) {
            if let SessionEvent::StatusMessage(message) = event {
                self.0.lock().push(message.clone());
            }
            if let SessionEvent::Interrupt(interrupt) = event {
                self.0.lock().push(format!("interrupt: {}", interrupt.message));
            }
        }
    }

    #[fixture]
    fn dispatcher() -> EventDispatcher {
        EventDispatcher::new()
    }

    #[rstest]
    fn clones_share_handlers(dispatcher: EventDispatcher) {
        let recorder = Arc::new(Recorder::default());
        dispatcher.add_handler(recorder.clone());
        dispatcher
            .clone()
            .trigger(&SessionEvent::StatusMessage("tile 1".into()));
        assert_eq!(*recorder.0.lock(), vec!["tile 1".to_owned()]);
    }

    #[rstest]
    fn removed_handler_receives_nothing(dispatcher: EventDispatcher) {
        let recorder = Arc::new(Recorder::default());
        let id = dispatcher.add_handler(recorder.clone());
        assert!(dispatcher.remove_handler(id));
        assert!(!dispatcher.remove_handler(id));
        dispatcher.trigger(&SessionEvent::StatusMessage("ignored".into()));
        assert!(recorder.0.lock().is_empty());
    }

    #[rstest]
    fn cancellation_raises_user_interrupt(dispatcher: EventDispatcher) {
        let recorder = Arc::new(Recorder::default());
        dispatcher.add_handler(recorder.clone());
        dispatcher.cancellation_handle().cancel("stop");
        assert_eq!(*recorder.0.lock(), vec!["interrupt: stop".to_owned()]);
    }

    #[rstest]
    fn handlers_may_trigger_nested_events(dispatcher: EventDispatcher) {
        struct Echo(EventDispatcher);
        impl EventHandler for Echo {
            fn handle_event(&self, event: &SessionEvent) {
                if matches!(event, SessionEvent::StatusTitle(_)) {
                    self.0.trigger(&SessionEvent::StatusMessage("echo".into()));
                }
            }
        }
        let recorder = Arc::new(Recorder::default());
        dispatcher.add_handler(Arc::new(Echo(dispatcher.clone())));
        dispatcher.add_handler(recorder.clone());
        dispatcher.trigger(&SessionEvent::StatusTitle("title".into()));
        assert_eq!(*recorder.0.lock(), vec!["echo".to_owned()]);
    }
}

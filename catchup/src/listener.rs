//! Event listeners and the capabilities the invoker looks for.
//!
//! A listener is any type that declares, once per run, which event types it
//! handles. Everything else is optional and exposed through capability
//! accessors that default to `None`:
//!
//! - [`StreamAware`]: consume a specific stream or category instead of all events
//! - [`BeforeInvoke`] / [`AfterInvoke`]: hooks around each handled event
//! - [`Resettable`]: clear materialized state before a full replay
//!
//! ```ignore
//! struct InvoiceTotals { totals: HashMap<String, u64> }
//!
//! impl EventListener for InvoiceTotals {
//!     fn handlers(&self) -> HandlerRegistry<Self> {
//!         HandlerRegistry::new()
//!             .on(|me: &mut Self, event: &InvoiceIssued, _raw: &RawEvent| {
//!                 *me.totals.entry(event.customer.clone()).or_default() += event.amount;
//!                 Ok::<_, HandlerError>(())
//!             })
//!     }
//! }
//! ```

use std::collections::HashMap;
use std::fmt;

use catchup_types::{DomainEvent, EventEnvelope, EventTypeName, ListenerId, RawEvent, StreamSelector};

use crate::errors::HandlerError;

/// A consumer of replayed events with its own materialized state.
pub trait EventListener: Send + Sized + 'static {
    /// Key under which the listener's progress is stored.
    ///
    /// Defaults to the fully-qualified type path, so renaming or moving the
    /// type starts it from scratch.
    fn listener_id(&self) -> ListenerId {
        ListenerId::of::<Self>()
    }

    /// Build the handler registry. Called once at the start of each run.
    fn handlers(&self) -> HandlerRegistry<Self>;

    /// The listener's stream selection, if it consumes less than the whole log.
    fn as_stream_aware(&self) -> Option<&dyn StreamAware> {
        None
    }

    /// Hook to run before each handled event.
    fn as_before_invoke(&mut self) -> Option<&mut dyn BeforeInvoke> {
        None
    }

    /// Hook to run after each successfully handled event.
    fn as_after_invoke(&mut self) -> Option<&mut dyn AfterInvoke> {
        None
    }

    /// State reset used by [`replay`](crate::CatchUpInvoker::replay).
    fn as_resettable(&mut self) -> Option<&mut dyn Resettable> {
        None
    }
}

/// Listener that consumes a selected part of the event log.
pub trait StreamAware {
    /// The streams this listener consumes.
    fn listens_to(&self) -> StreamSelector;
}

/// Hook run before each event that has a handler.
pub trait BeforeInvoke {
    /// Called with the envelope about to be handled.
    fn before_invoke(&mut self, envelope: &EventEnvelope);
}

/// Hook run after each event whose handler succeeded.
pub trait AfterInvoke {
    /// Called with the envelope that was just handled.
    fn after_invoke(&mut self, envelope: &EventEnvelope);
}

/// Listener whose materialized state can be cleared for a full replay.
pub trait Resettable {
    /// Clear everything the listener derived from events.
    fn reset(&mut self) -> Result<(), HandlerError>;
}

type Handler<L> =
    Box<dyn Fn(&mut L, &dyn DomainEvent, &RawEvent) -> Option<Result<(), HandlerError>> + Send + Sync>;

/// Result of dispatching one event through a registry.
pub(crate) enum Dispatch {
    /// No handler is registered for the event type.
    Unhandled,
    /// The handler ran and returned this result.
    Handled(Result<(), HandlerError>),
    /// A handler is registered under the name but for a different Rust type.
    TypeMismatch,
}

/// Explicit mapping from event type name to handler, built once per run.
///
/// Events whose type has no registered handler are skipped.
pub struct HandlerRegistry<L> {
    handlers: HashMap<EventTypeName, Handler<L>>,
}

impl<L: 'static> HandlerRegistry<L> {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register the handler for events of type `E`.
    ///
    /// Registering a second handler for the same type replaces the first.
    /// A type whose short name is not a valid [`EventTypeName`] cannot be
    /// dispatched to and is ignored here; its events fail resolution instead.
    #[must_use]
    pub fn on<E, F, Err>(mut self, handler: F) -> Self
    where
        E: DomainEvent,
        F: Fn(&mut L, &E, &RawEvent) -> Result<(), Err> + Send + Sync + 'static,
        Err: Into<HandlerError>,
    {
        if let Ok(event_type) = EventTypeName::of::<E>() {
            let erased: Handler<L> = Box::new(
                move |listener: &mut L, event: &dyn DomainEvent, raw: &RawEvent| {
                    let typed = event.as_any().downcast_ref::<E>()?;
                    Some(handler(listener, typed, raw).map_err(Into::into))
                },
            );
            let _ = self.handlers.insert(event_type, erased);
        }
        self
    }

    /// The conventional handler name for an event type, `when<Type>`.
    pub fn handler_name(event_type: &EventTypeName) -> String {
        format!("when{event_type}")
    }

    /// Whether a handler is registered for `event_type`.
    pub fn contains(&self, event_type: &EventTypeName) -> bool {
        self.handlers.contains_key(event_type)
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether no handler is registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Registered event types, sorted.
    pub fn handled_types(&self) -> Vec<EventTypeName> {
        let mut types: Vec<EventTypeName> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }

    pub(crate) fn dispatch(
        &self,
        listener: &mut L,
        event_type: &EventTypeName,
        event: &dyn DomainEvent,
        raw: &RawEvent,
    ) -> Dispatch {
        match self.handlers.get(event_type) {
            None => Dispatch::Unhandled,
            Some(handler) => match handler(listener, event, raw) {
                Some(result) => Dispatch::Handled(result),
                None => Dispatch::TypeMismatch,
            },
        }
    }
}

impl<L: 'static> Default for HandlerRegistry<L> {
    fn default() -> Self {
        Self::new()
    }
}

impl<L> fmt::Debug for HandlerRegistry<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&EventTypeName> = self.handlers.keys().collect();
        names.sort();
        f.debug_struct("HandlerRegistry")
            .field("handlers", &names)
            .finish()
    }
}

//! Stored and decoded event representations.
//!
//! A stream source reads [`RawEvent`]s from storage and decodes their payloads
//! into [`DomainEvent`]s; the pair travels through the replay loop as an
//! [`EventEnvelope`].

use crate::types::{EventId, EventTypeName, Metadata, SequenceNumber, StreamName, Timestamp};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Upcast to [`Any`] for concrete-type dispatch.
///
/// Implemented for every sized `'static` type; trait objects forward through
/// their vtable so the concrete type is preserved.
pub trait AsAny: Any {
    /// View `self` as `&dyn Any`.
    fn as_any(&self) -> &dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A decoded, strongly typed event.
///
/// The concrete type's short name is the dispatch key, so most event types
/// implement this trait with an empty body:
///
/// ```ignore
/// #[derive(Debug, Serialize, Deserialize)]
/// struct MoneyDeposited { amount: u64 }
///
/// impl DomainEvent for MoneyDeposited {}
/// ```
pub trait DomainEvent: AsAny + fmt::Debug + Send + Sync {
    /// Fully-qualified path of the concrete runtime type.
    ///
    /// Wrappers that carry metadata around another event report the path of
    /// the event they wrap.
    fn type_path(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    /// Capability accessor for events that carry metadata.
    fn as_event_with_metadata(&self) -> Option<&dyn DomainEventWithMetadata> {
        None
    }
}

impl dyn DomainEvent {
    /// Borrow the concrete event if it is of type `E`.
    ///
    /// Metadata wrappers are not looked through; unwrap with
    /// [`undecorated`] first when the event may be decorated.
    pub fn downcast_ref<E: DomainEvent>(&self) -> Option<&E> {
        self.as_any().downcast_ref::<E>()
    }

    /// Whether the concrete event is of type `E`.
    pub fn is<E: DomainEvent>(&self) -> bool {
        self.as_any().is::<E>()
    }
}

/// An event wrapped with string-keyed metadata.
pub trait DomainEventWithMetadata: DomainEvent {
    /// The innermost, undecorated event.
    fn event(&self) -> &Arc<dyn DomainEvent>;

    /// The merged metadata visible through this wrapper.
    fn metadata(&self) -> &Metadata;
}

/// Walk a chain of metadata wrappers down to the original event.
pub fn undecorated(event: &Arc<dyn DomainEvent>) -> Arc<dyn DomainEvent> {
    let mut current = Arc::clone(event);
    loop {
        let inner = match current.as_event_with_metadata() {
            Some(decorated) => Arc::clone(decorated.event()),
            None => return current,
        };
        current = inner;
    }
}

/// The metadata carried by `event`, or an empty map for a plain event.
pub fn metadata_of(event: &dyn DomainEvent) -> Metadata {
    event
        .as_event_with_metadata()
        .map(|decorated| decorated.metadata().clone())
        .unwrap_or_default()
}

/// An event exactly as the stream source stored it.
///
/// Raw events are created on read and never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawEvent {
    identifier: EventId,
    event_type: EventTypeName,
    sequence_number: SequenceNumber,
    stream_name: StreamName,
    payload: serde_json::Value,
    metadata: Metadata,
    recorded_at: Timestamp,
}

impl RawEvent {
    /// Create a raw event recorded now with empty metadata.
    pub fn new(
        identifier: EventId,
        event_type: EventTypeName,
        sequence_number: SequenceNumber,
        stream_name: StreamName,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            identifier,
            event_type,
            sequence_number,
            stream_name,
            payload,
            metadata: Metadata::new(),
            recorded_at: Timestamp::now(),
        }
    }

    /// Replace the metadata map.
    #[must_use]
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Replace the recording instant.
    #[must_use]
    pub const fn with_recorded_at(mut self, recorded_at: Timestamp) -> Self {
        self.recorded_at = recorded_at;
        self
    }

    /// Unique identifier assigned at append.
    pub const fn identifier(&self) -> &EventId {
        &self.identifier
    }

    /// Short type name used as the dispatch key.
    pub const fn event_type(&self) -> &EventTypeName {
        &self.event_type
    }

    /// Position in the global append order.
    pub const fn sequence_number(&self) -> SequenceNumber {
        self.sequence_number
    }

    /// Stream the event was appended to.
    pub const fn stream_name(&self) -> &StreamName {
        &self.stream_name
    }

    /// Stored JSON payload of the undecorated event.
    pub const fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    /// Metadata stored with the event, such as correlation identifiers.
    pub const fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// When the event was stored.
    pub const fn recorded_at(&self) -> Timestamp {
        self.recorded_at
    }
}

/// One stored event paired with its decoded domain representation.
#[derive(Debug, Clone)]
pub struct EventEnvelope {
    raw: RawEvent,
    event: Arc<dyn DomainEvent>,
}

impl EventEnvelope {
    /// Pair a stored event with its decoded form.
    pub const fn new(raw: RawEvent, event: Arc<dyn DomainEvent>) -> Self {
        Self { raw, event }
    }

    /// The event as stored.
    pub const fn raw_event(&self) -> &RawEvent {
        &self.raw
    }

    /// The decoded event.
    pub fn domain_event(&self) -> &dyn DomainEvent {
        self.event.as_ref()
    }

    /// Shared handle to the decoded event.
    pub const fn domain_event_arc(&self) -> &Arc<dyn DomainEvent> {
        &self.event
    }

    /// Shorthand for the raw event's sequence number.
    pub const fn sequence_number(&self) -> SequenceNumber {
        self.raw.sequence_number
    }
}

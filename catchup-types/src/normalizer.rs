//! Mapping between stored payloads and decoded domain events.
//!
//! Stream sources persist events as JSON payloads tagged with an
//! [`EventTypeName`]. The [`EventNormalizer`] is the registry that turns a
//! payload back into the concrete Rust event (`denormalize`) and turns an
//! appended event into a payload plus the metadata of any decorators wrapping
//! it (`normalize`).

use crate::event::{metadata_of, undecorated, DomainEvent};
use crate::types::{EventTypeName, EventTypeNameError, Metadata};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Errors raised while registering, encoding or decoding event types.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NormalizerError {
    /// The Rust type path does not reduce to a valid event type name.
    #[error("cannot derive an event type name from {type_path}: {reason}")]
    InvalidTypeName { type_path: String, reason: String },

    /// No event type is registered under this name.
    #[error("unknown event type: {event_type}")]
    UnknownEventType { event_type: String },

    /// The name is already registered for a different Rust type.
    #[error("event type name {event_type} is already registered for a different type")]
    TypeNameConflict { event_type: EventTypeName },

    /// Encoding an event to JSON failed.
    #[error("failed to serialize event of type {event_type}: {detail}")]
    Serialization {
        event_type: EventTypeName,
        detail: String,
    },

    /// Decoding a stored payload failed.
    #[error("failed to deserialize event of type {event_type}: {detail}")]
    Deserialization {
        event_type: EventTypeName,
        detail: String,
    },
}

/// An appended event reduced to what a stream source stores.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedEvent {
    /// Short type name of the undecorated event.
    pub event_type: EventTypeName,
    /// JSON encoding of the undecorated event.
    pub payload: Value,
    /// Metadata collected from the decorator chain.
    pub metadata: Metadata,
}

type EncodeFn = Arc<dyn Fn(&dyn DomainEvent) -> Result<Value, String> + Send + Sync>;
type DecodeFn = Arc<dyn Fn(Value) -> Result<Arc<dyn DomainEvent>, String> + Send + Sync>;

#[derive(Clone)]
struct Registration {
    type_id: TypeId,
    encode: EncodeFn,
    decode: DecodeFn,
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("type_id", &self.type_id)
            .field("encode", &"<function>")
            .field("decode", &"<function>")
            .finish()
    }
}

/// Registry of the event types a stream source can store and decode.
///
/// Built once at wiring time and shared; cloning is cheap.
///
/// ```ignore
/// let normalizer = EventNormalizer::new()
///     .register::<MoneyDeposited>()?
///     .register::<MoneyWithdrawn>()?;
/// ```
#[derive(Debug, Clone, Default)]
pub struct EventNormalizer {
    types: Arc<HashMap<EventTypeName, Registration>>,
}

impl EventNormalizer {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register event type `E` under its short type name.
    ///
    /// Registering the same type twice is a no-op; registering a different
    /// type under an existing name is a [`NormalizerError::TypeNameConflict`].
    pub fn register<E>(mut self) -> Result<Self, NormalizerError>
    where
        E: DomainEvent + Serialize + DeserializeOwned,
    {
        let type_path = std::any::type_name::<E>();
        let event_type = EventTypeName::from_type_path(type_path)
            .map_err(|error| invalid_type_name(type_path, &error))?;

        if let Some(existing) = self.types.get(&event_type) {
            if existing.type_id == TypeId::of::<E>() {
                return Ok(self);
            }
            return Err(NormalizerError::TypeNameConflict { event_type });
        }

        let encode: EncodeFn = Arc::new(|event: &dyn DomainEvent| {
            let typed = event
                .as_any()
                .downcast_ref::<E>()
                .ok_or_else(|| format!("event is not a {}", std::any::type_name::<E>()))?;
            serde_json::to_value(typed).map_err(|error| error.to_string())
        });
        let decode: DecodeFn = Arc::new(|payload: Value| {
            let typed: E = serde_json::from_value(payload).map_err(|error| error.to_string())?;
            let event: Arc<dyn DomainEvent> = Arc::new(typed);
            Ok(event)
        });

        let _ = Arc::make_mut(&mut self.types).insert(
            event_type,
            Registration {
                type_id: TypeId::of::<E>(),
                encode,
                decode,
            },
        );
        Ok(self)
    }

    /// Whether an event type is registered under `event_type`.
    pub fn is_registered(&self, event_type: &EventTypeName) -> bool {
        self.types.contains_key(event_type)
    }

    /// Names of every registered event type, sorted.
    pub fn registered_types(&self) -> Vec<EventTypeName> {
        let mut names: Vec<EventTypeName> = self.types.keys().cloned().collect();
        names.sort();
        names
    }

    /// Reduce an event, possibly wrapped in metadata decorators, to its
    /// storable form.
    pub fn normalize(&self, event: &Arc<dyn DomainEvent>) -> Result<NormalizedEvent, NormalizerError> {
        let metadata = metadata_of(event.as_ref());
        let inner = undecorated(event);
        let type_path = inner.type_path();
        let event_type = EventTypeName::from_type_path(type_path)
            .map_err(|error| invalid_type_name(type_path, &error))?;

        let inner: &dyn DomainEvent = inner.as_ref();
        let registration = self.registration(&event_type)?;
        if inner.as_any().type_id() != registration.type_id {
            return Err(NormalizerError::TypeNameConflict { event_type });
        }

        let payload = (registration.encode)(inner).map_err(|detail| {
            NormalizerError::Serialization {
                event_type: event_type.clone(),
                detail,
            }
        })?;

        Ok(NormalizedEvent {
            event_type,
            payload,
            metadata,
        })
    }

    /// Decode a stored payload into the registered domain event.
    pub fn denormalize(
        &self,
        event_type: &EventTypeName,
        payload: Value,
    ) -> Result<Arc<dyn DomainEvent>, NormalizerError> {
        let registration = self.registration(event_type)?;
        (registration.decode)(payload).map_err(|detail| NormalizerError::Deserialization {
            event_type: event_type.clone(),
            detail,
        })
    }

    fn registration(&self, event_type: &EventTypeName) -> Result<&Registration, NormalizerError> {
        self.types
            .get(event_type)
            .ok_or_else(|| NormalizerError::UnknownEventType {
                event_type: event_type.to_string(),
            })
    }
}

fn invalid_type_name(type_path: &str, error: &EventTypeNameError) -> NormalizerError {
    NormalizerError::InvalidTypeName {
        type_path: type_path.to_owned(),
        reason: error.to_string(),
    }
}

//! Metadata decorators for domain events.
//!
//! A decorator wraps a domain event and attaches string-keyed metadata to it
//! without touching the event itself. Decorators compose: wrapping an event
//! that already carries metadata starts from the inner map and overwrites only
//! the decorator's own keys, while the wrapped event is always the innermost
//! original. Unwrapping therefore never needs more than one step.
//!
//! ```ignore
//! let event: Arc<dyn DomainEvent> = Arc::new(InvoiceIssued { amount: 40 });
//! let caused = EventWithCausationIdentifier::new(event, "cmd-17")?;
//! let correlated = EventWithCorrelationIdentifier::new(Arc::new(caused), "req-42")?;
//!
//! // {"causationIdentifier": "cmd-17", "correlationIdentifier": "req-42"}
//! correlated.metadata();
//! ```

use std::sync::Arc;

use catchup_types::{metadata_of, undecorated, DomainEvent, DomainEventWithMetadata, Metadata};
use nutype::nutype;
use serde_json::Value;

use crate::errors::DecoratorError;

/// Metadata key of the correlation identifier.
pub const CORRELATION_IDENTIFIER: &str = "correlationIdentifier";

/// Metadata key of the causation identifier.
pub const CAUSATION_IDENTIFIER: &str = "causationIdentifier";

/// Identifier linking events that belong to the same logical workflow.
///
/// Non-empty and at most 255 characters; the value is kept verbatim.
#[nutype(
    validate(not_empty, len_char_max = 255),
    derive(Debug, Clone, PartialEq, Eq, Hash, AsRef, Deref, Display, Serialize, Deserialize)
)]
pub struct CorrelationIdentifier(String);

/// Identifier of whatever directly caused an event.
///
/// Non-empty and at most 255 characters; the value is kept verbatim.
#[nutype(
    validate(not_empty, len_char_max = 255),
    derive(Debug, Clone, PartialEq, Eq, Hash, AsRef, Deref, Display, Serialize, Deserialize)
)]
pub struct CausationIdentifier(String);

/// Shared state of every decorator: the innermost event and the merged map.
#[derive(Debug, Clone)]
struct Decorated {
    event: Arc<dyn DomainEvent>,
    metadata: Metadata,
}

impl Decorated {
    fn wrap(event: &Arc<dyn DomainEvent>, overlay: Metadata) -> Self {
        let mut metadata = metadata_of(event.as_ref());
        metadata.extend(overlay);
        Self {
            event: undecorated(event),
            metadata,
        }
    }

    fn with_entry(event: &Arc<dyn DomainEvent>, key: &str, value: &str) -> Self {
        let mut overlay = Metadata::new();
        let _ = overlay.insert(key.to_owned(), Value::String(value.to_owned()));
        Self::wrap(event, overlay)
    }
}

macro_rules! impl_decorated_event {
    ($decorator:ty) => {
        impl DomainEvent for $decorator {
            fn type_path(&self) -> &'static str {
                self.decorated.event.type_path()
            }

            fn as_event_with_metadata(&self) -> Option<&dyn DomainEventWithMetadata> {
                Some(self)
            }
        }

        impl DomainEventWithMetadata for $decorator {
            fn event(&self) -> &Arc<dyn DomainEvent> {
                &self.decorated.event
            }

            fn metadata(&self) -> &Metadata {
                &self.decorated.metadata
            }
        }
    };
}

/// Domain event carrying a correlation identifier.
///
/// The metadata is the wrapped event's metadata with `correlationIdentifier`
/// set to this decorator's value.
#[derive(Debug, Clone)]
pub struct EventWithCorrelationIdentifier {
    decorated: Decorated,
    correlation_identifier: CorrelationIdentifier,
}

impl EventWithCorrelationIdentifier {
    /// Wrap `event` with a correlation identifier.
    ///
    /// Fails with [`DecoratorError::InvalidArgument`] if the identifier is
    /// empty or longer than 255 characters.
    pub fn new(
        event: Arc<dyn DomainEvent>,
        correlation_identifier: impl Into<String>,
    ) -> Result<Self, DecoratorError> {
        let correlation_identifier = CorrelationIdentifier::try_new(correlation_identifier.into())
            .map_err(|error| DecoratorError::InvalidArgument {
                key: CORRELATION_IDENTIFIER,
                reason: error.to_string(),
            })?;
        Ok(Self {
            decorated: Decorated::with_entry(
                &event,
                CORRELATION_IDENTIFIER,
                correlation_identifier.as_ref(),
            ),
            correlation_identifier,
        })
    }

    /// The identifier this decorator attaches.
    pub const fn correlation_identifier(&self) -> &CorrelationIdentifier {
        &self.correlation_identifier
    }
}

impl_decorated_event!(EventWithCorrelationIdentifier);

/// Domain event carrying a causation identifier.
///
/// Composes with the correlation decorator under the same rules, using the
/// `causationIdentifier` key.
#[derive(Debug, Clone)]
pub struct EventWithCausationIdentifier {
    decorated: Decorated,
    causation_identifier: CausationIdentifier,
}

impl EventWithCausationIdentifier {
    /// Wrap `event` with a causation identifier.
    pub fn new(
        event: Arc<dyn DomainEvent>,
        causation_identifier: impl Into<String>,
    ) -> Result<Self, DecoratorError> {
        let causation_identifier = CausationIdentifier::try_new(causation_identifier.into())
            .map_err(|error| DecoratorError::InvalidArgument {
                key: CAUSATION_IDENTIFIER,
                reason: error.to_string(),
            })?;
        Ok(Self {
            decorated: Decorated::with_entry(
                &event,
                CAUSATION_IDENTIFIER,
                causation_identifier.as_ref(),
            ),
            causation_identifier,
        })
    }

    /// The identifier this decorator attaches.
    pub const fn causation_identifier(&self) -> &CausationIdentifier {
        &self.causation_identifier
    }
}

impl_decorated_event!(EventWithCausationIdentifier);

/// Domain event carrying arbitrary metadata.
///
/// Keys of the supplied map overwrite keys of the wrapped event's metadata;
/// nested maps are replaced as a whole, not merged.
#[derive(Debug, Clone)]
pub struct EventWithMetadata {
    decorated: Decorated,
}

impl EventWithMetadata {
    pub fn new(event: Arc<dyn DomainEvent>, metadata: Metadata) -> Self {
        Self {
            decorated: Decorated::wrap(&event, metadata),
        }
    }
}

impl_decorated_event!(EventWithMetadata);

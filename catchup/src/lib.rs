//! `catchup` - event listener catch-up over persisted event streams
//!
//! A [`CatchUpInvoker`] replays an append-only event log into a listener so
//! the listener's materialized state converges on every event written so far.
//! Progress is stored per listener and written through after each event, so a
//! run that stops (by failure or crash) resumes exactly after the last event
//! it applied. Concurrent runs for the same listener are excluded by the
//! progress store's reservation.
//!
//! Storage lives behind the [`ProgressStore`] and [`StreamSource`] traits;
//! `catchup-memory` and `catchup-postgres` provide implementations.
//!
//! ```ignore
//! let normalizer = EventNormalizer::new().register::<InvoiceIssued>()?;
//! let source = InMemoryStreamSource::new(normalizer);
//! let invoker = CatchUpInvoker::new(InMemoryProgressStore::new(), source);
//!
//! let summary = invoker.catch_up(&mut InvoiceTotals::default()).await?;
//! ```
//!
//! Events can carry correlation and causation identifiers through the
//! decorators in this crate; see [`EventWithCorrelationIdentifier`].

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod config;
pub mod errors;
mod invoker;
mod listener;
pub mod metadata;

pub use config::CatchUpConfig;
pub use errors::{CatchUpError, DecoratorError, HandlerError};
pub use invoker::{CatchUpInvoker, CatchUpSummary};
pub use listener::{
    AfterInvoke, BeforeInvoke, EventListener, HandlerRegistry, Resettable, StreamAware,
};
pub use metadata::{
    CausationIdentifier, CorrelationIdentifier, EventWithCausationIdentifier,
    EventWithCorrelationIdentifier, EventWithMetadata,
};

pub use catchup_types::{
    BatchSize, DomainEvent, DomainEventWithMetadata, EventAppender, EventBatch, EventEnvelope,
    EventId, EventNormalizer, EventTypeName, ListenerId, LoadOutcome, Metadata, ProgressStore,
    ProgressStoreError, RawEvent, ReservationPolicy, SequenceNumber, StreamName, StreamPrefix,
    StreamSelector, StreamSource, StreamSourceError, Timestamp,
};

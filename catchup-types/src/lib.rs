#![forbid(
    dead_code,
    invalid_value,
    overflowing_literals,
    unconditional_recursion,
    unreachable_pub,
    unused_allocation,
    unsafe_code
)]
#![deny(
    bad_style,
    clippy::allow_attributes,
    deprecated,
    meta_variable_misuse,
    non_ascii_idents,
    non_camel_case_types,
    non_snake_case,
    non_upper_case_globals,
    rust_2018_idioms,
    rust_2021_compatibility,
    trivial_casts,
    trivial_numeric_casts,
    unreachable_code,
    unused_assignments,
    unused_attributes,
    unused_extern_crates,
    unused_imports,
    unused_must_use,
    unused_mut,
    unused_parens,
    unused_qualifications,
    unused_results,
    unused_variables
)]

//! Shared vocabulary types and collaborator traits for catchup.
//!
//! This crate holds everything the catch-up invoker and its storage adapters
//! must agree on, so `catchup-memory` and `catchup-postgres` can implement the
//! collaborator traits without depending on the invoker itself.
//!
//! # Overview
//!
//! - Identifiers: `ListenerId`, `EventId`, `EventTypeName`, `SequenceNumber`,
//!   `StreamName`, `StreamPrefix`, `StreamSelector`, `BatchSize`, `Timestamp`
//! - Events: `DomainEvent`, `DomainEventWithMetadata`, `RawEvent`, `EventEnvelope`
//! - Payload mapping: `EventNormalizer`, `NormalizedEvent`, `NormalizerError`
//! - Collaborators: `ProgressStore`, `StreamSource`, `EventAppender`, `LoadOutcome`,
//!   `EventBatch`
//! - Errors: `ProgressStoreError`, `StreamSourceError`, `Operation`

mod event;
mod normalizer;
mod operation;
mod progress;
mod source;
mod types;

pub use event::{
    metadata_of, undecorated, AsAny, DomainEvent, DomainEventWithMetadata, EventEnvelope,
    RawEvent,
};
pub use normalizer::{EventNormalizer, NormalizedEvent, NormalizerError};
pub use operation::Operation;
pub use progress::{ProgressStore, ProgressStoreError, ReservationPolicy};
pub use source::{EventAppender, EventBatch, LoadOutcome, StreamSource, StreamSourceError};
pub use types::{
    BatchSize, BatchSizeError, EventId, EventIdError, EventTypeName, EventTypeNameError,
    ListenerId, ListenerIdError, Metadata, SequenceNumber, StreamName, StreamNameError,
    StreamPrefix, StreamPrefixError, StreamSelector, Timestamp,
};

//! Ordered, queryable event log as seen by the catch-up invoker.

use crate::event::{DomainEvent, EventEnvelope};
use crate::normalizer::NormalizerError;
use crate::operation::Operation;
use crate::types::{BatchSize, SequenceNumber, StreamName, StreamSelector};
use std::future::Future;
use std::sync::Arc;

/// One page of envelopes read from a stream source.
#[derive(Debug, Clone)]
pub struct EventBatch {
    envelopes: Vec<EventEnvelope>,
    head: SequenceNumber,
}

impl EventBatch {
    /// Create a batch.
    ///
    /// `head` is the highest sequence number visible through the selector at
    /// read time, which may lie beyond the last envelope of this page.
    pub const fn new(envelopes: Vec<EventEnvelope>, head: SequenceNumber) -> Self {
        Self { envelopes, head }
    }

    /// The envelopes in ascending sequence order.
    pub fn envelopes(&self) -> &[EventEnvelope] {
        &self.envelopes
    }

    /// Take the envelopes out of the batch.
    pub fn into_envelopes(self) -> Vec<EventEnvelope> {
        self.envelopes
    }

    /// Highest sequence number visible to the selector when loaded.
    pub const fn head(&self) -> SequenceNumber {
        self.head
    }

    /// Number of envelopes in this page.
    pub fn len(&self) -> usize {
        self.envelopes.len()
    }

    /// Whether this page holds no envelopes.
    pub fn is_empty(&self) -> bool {
        self.envelopes.is_empty()
    }
}

/// Result of loading from a selector.
///
/// A selector nobody ever wrote to is an expected outcome, not an error.
#[derive(Debug, Clone)]
pub enum LoadOutcome {
    /// At least one stream matched; the batch may still be empty.
    Found(EventBatch),
    /// No stream matches the selector.
    NotFound,
}

/// Errors returned by stream source operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamSourceError {
    /// A stored payload could not be decoded, or an appended event encoded.
    #[error(transparent)]
    Normalizer(#[from] NormalizerError),

    /// The underlying storage failed.
    #[error("stream source {operation} failed: {detail}")]
    StoreFailure { operation: Operation, detail: String },
}

/// Durable, append-only event log queryable by selector and position.
pub trait StreamSource {
    /// Load up to `limit` envelopes visible through `selector` with a
    /// sequence number of at least `from`, in ascending order.
    fn load(
        &self,
        selector: &StreamSelector,
        from: SequenceNumber,
        limit: BatchSize,
    ) -> impl Future<Output = Result<LoadOutcome, StreamSourceError>> + Send;
}

impl<T: StreamSource + Sync> StreamSource for &T {
    async fn load(
        &self,
        selector: &StreamSelector,
        from: SequenceNumber,
        limit: BatchSize,
    ) -> Result<LoadOutcome, StreamSourceError> {
        (*self).load(selector, from, limit).await
    }
}

/// Write side of an event log, used to seed stream sources.
///
/// Events may be wrapped in metadata decorators; the decorators' metadata is
/// stored alongside the undecorated payload.
pub trait EventAppender {
    /// Append `events` to `stream` atomically, returning the sequence number
    /// assigned to each event in order.
    fn append(
        &self,
        stream: &StreamName,
        events: Vec<Arc<dyn DomainEvent>>,
    ) -> impl Future<Output = Result<Vec<SequenceNumber>, StreamSourceError>> + Send;
}

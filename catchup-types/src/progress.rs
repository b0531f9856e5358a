//! Durable per-listener progress with an exclusive reservation protocol.

use crate::operation::Operation;
use crate::types::{ListenerId, SequenceNumber};
use std::future::Future;
use std::time::Duration;

/// What a progress store does when a listener is already reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReservationPolicy {
    /// Fail immediately with [`ProgressStoreError::ReservationConflict`].
    #[default]
    FailFast,
    /// Wait for the holder to release, up to `timeout`.
    ///
    /// Waiters are not queued: whichever waiter observes the release first
    /// wins the reservation.
    Wait { timeout: Duration },
}

/// Errors returned by progress store operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProgressStoreError {
    /// Another catch-up run currently holds the listener's reservation.
    #[error("listener {listener} is already reserved by another catch-up run")]
    ReservationConflict { listener: ListenerId },

    /// The reservation did not become free before the wait timed out.
    #[error("timed out after {timeout:?} waiting to reserve listener {listener}")]
    ReservationTimeout {
        listener: ListenerId,
        timeout: Duration,
    },

    /// A write was attempted without holding the listener's reservation.
    #[error("listener {listener} must be reserved before {operation}")]
    NotReserved {
        listener: ListenerId,
        operation: Operation,
    },

    /// The underlying storage failed.
    #[error("progress store {operation} failed: {detail}")]
    StoreFailure { operation: Operation, detail: String },
}

/// Durable mapping from listener identity to highest applied sequence number.
///
/// Only the holder of a listener's reservation may write its progress. A
/// catch-up run pairs every successful [`reserve`](Self::reserve) with exactly
/// one [`release`](Self::release), or with [`abandon`](Self::abandon) when the
/// run is dropped before it could release.
pub trait ProgressStore {
    /// Take the listener's exclusive reservation and return its applied
    /// sequence number ([`SequenceNumber::none`] if it never ran).
    ///
    /// Two reservations for the same listener never both succeed.
    fn reserve(
        &self,
        listener: &ListenerId,
    ) -> impl Future<Output = Result<SequenceNumber, ProgressStoreError>> + Send;

    /// Durably record `sequence_number` as the listener's applied position.
    ///
    /// Saving a value at or below the stored one is a no-op; progress never
    /// regresses through `save`.
    fn save(
        &self,
        listener: &ListenerId,
        sequence_number: SequenceNumber,
    ) -> impl Future<Output = Result<(), ProgressStoreError>> + Send;

    /// Drop the listener's reservation. Idempotent and infallible.
    fn release(&self, listener: &ListenerId) -> impl Future<Output = ()> + Send;

    /// Drop the listener's reservation without awaiting anything.
    ///
    /// Runs from `Drop` when a catch-up future is cancelled mid-run, so it
    /// must not block on I/O. Stores whose reservation lives in a remote
    /// session may let it lapse asynchronously; the reservation must become
    /// available again without a process restart. Idempotent.
    fn abandon(&self, listener: &ListenerId);

    /// Read the listener's applied sequence number without reserving it.
    fn current(
        &self,
        listener: &ListenerId,
    ) -> impl Future<Output = Result<SequenceNumber, ProgressStoreError>> + Send;

    /// Rewind the listener's applied sequence number to zero for a full
    /// replay. Requires the reservation.
    fn reset(
        &self,
        listener: &ListenerId,
    ) -> impl Future<Output = Result<(), ProgressStoreError>> + Send;
}

impl<T: ProgressStore + Sync> ProgressStore for &T {
    async fn reserve(&self, listener: &ListenerId) -> Result<SequenceNumber, ProgressStoreError> {
        (*self).reserve(listener).await
    }

    async fn save(
        &self,
        listener: &ListenerId,
        sequence_number: SequenceNumber,
    ) -> Result<(), ProgressStoreError> {
        (*self).save(listener, sequence_number).await
    }

    async fn release(&self, listener: &ListenerId) {
        (*self).release(listener).await;
    }

    fn abandon(&self, listener: &ListenerId) {
        (*self).abandon(listener);
    }

    async fn current(&self, listener: &ListenerId) -> Result<SequenceNumber, ProgressStoreError> {
        (*self).current(listener).await
    }

    async fn reset(&self, listener: &ListenerId) -> Result<(), ProgressStoreError> {
        (*self).reset(listener).await
    }
}

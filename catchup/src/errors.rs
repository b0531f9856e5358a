//! Error types for catch-up runs and metadata decorators.
//!
//! Every failure aborts the run after its reservation has been released; the
//! invoker never retries internally. Callers decide what to do based on the
//! variant:
//!
//! - **EventApplicationFailed**: fix the listener or the event, then run again.
//!   Progress stops just before the failing event.
//! - **DispatchResolutionFailed**: a programming error, never worth retrying.
//! - **ReservationConflict**: another run holds the listener; try later.
//! - **ProgressStore / StreamSource**: infrastructure failure; retry later.
//!
//! ```rust,ignore
//! match invoker.catch_up(&mut listener).await {
//!     Ok(summary) => info!(applied = summary.applied, "caught up"),
//!     Err(CatchUpError::ReservationConflict { .. }) => debug!("already running elsewhere"),
//!     Err(error) => return Err(error.into()),
//! }
//! ```

use catchup_types::{
    EventId, EventTypeName, ListenerId, ProgressStoreError, SequenceNumber, StreamSourceError,
};
use thiserror::Error;

/// Error returned by an event handler, hook or reset.
///
/// Anything convertible into a boxed error works, including `String` and
/// `&str`.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Errors that end a catch-up or replay run.
#[derive(Debug, Error)]
pub enum CatchUpError {
    /// A handler rejected an event. Progress stays at the previous event.
    #[error(
        "listener {listener} failed to apply event {event_id} of type {event_type} at sequence number {sequence_number}"
    )]
    EventApplicationFailed {
        listener: ListenerId,
        event_id: EventId,
        event_type: EventTypeName,
        sequence_number: SequenceNumber,
        #[source]
        source: HandlerError,
    },

    /// The handler for a decoded event could not be determined.
    #[error("cannot resolve a handler for {type_path} on listener {listener}: {reason}")]
    DispatchResolutionFailed {
        listener: ListenerId,
        type_path: String,
        reason: String,
    },

    /// Another run currently holds the listener's reservation.
    #[error("listener {listener} is busy: another catch-up run holds its reservation")]
    ReservationConflict { listener: ListenerId },

    /// The stream source returned events out of order.
    #[error(
        "stream source returned sequence number {found} after {previous} for listener {listener}"
    )]
    NonMonotonicSequence {
        listener: ListenerId,
        previous: SequenceNumber,
        found: SequenceNumber,
    },

    /// The listener could not clear its state before a replay.
    #[error("listener {listener} failed to reset before replay")]
    ResetFailed {
        listener: ListenerId,
        #[source]
        source: HandlerError,
    },

    /// The progress store failed.
    #[error(transparent)]
    ProgressStore(#[from] ProgressStoreError),

    /// The stream source failed.
    #[error(transparent)]
    StreamSource(#[from] StreamSourceError),
}

impl CatchUpError {
    /// Whether running again later may succeed without a code change.
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ReservationConflict { .. } | Self::ProgressStore(_) | Self::StreamSource(_)
        )
    }
}

/// Errors raised when constructing a metadata decorator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecoratorError {
    /// The metadata value was rejected; no decorator was created.
    #[error("invalid {key}: {reason}")]
    InvalidArgument { key: &'static str, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    fn listener() -> ListenerId {
        ListenerId::try_new("billing::InvoiceProjector").expect("valid listener id")
    }

    #[test]
    fn application_failure_keeps_handler_error_as_source() {
        let error = CatchUpError::EventApplicationFailed {
            listener: listener(),
            event_id: EventId::try_new("evt-1").expect("valid event id"),
            event_type: EventTypeName::try_new("InvoiceIssued").expect("valid event type"),
            sequence_number: SequenceNumber::new(7),
            source: "invoice total overflowed".into(),
        };

        assert_eq!(
            error.to_string(),
            "listener billing::InvoiceProjector failed to apply event evt-1 of type InvoiceIssued at sequence number 7"
        );
        assert_eq!(
            error.source().map(ToString::to_string),
            Some("invoice total overflowed".to_owned())
        );
        assert!(!error.is_transient());
    }

    #[test]
    fn reservation_conflict_is_transient() {
        let error = CatchUpError::ReservationConflict {
            listener: listener(),
        };

        assert!(error.is_transient());
    }
}

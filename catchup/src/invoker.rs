//! The catch-up invoker.
//!
//! One call replays everything a listener has not yet applied:
//!
//! 1. reserve the listener in the progress store and read its applied position
//! 2. pick the stream (the listener's selector if it is stream-aware, else all)
//! 3. load envelopes after the applied position, batch by batch
//! 4. apply each envelope, persist its sequence number, report progress
//! 5. release the reservation, whatever happened
//!
//! A run whose future is dropped mid-flight (a timeout, a lost `select!`
//! branch, an aborted task) abandons the reservation from `Drop` instead.
//!
//! The run is bounded by the head of the stream as seen by the first load;
//! events appended while the run is in progress are left for the next run.

use catchup_types::{
    undecorated, EventEnvelope, EventTypeName, ListenerId, LoadOutcome, ProgressStore,
    ProgressStoreError, SequenceNumber, StreamSelector, StreamSource,
};
use tracing::{debug, error, info, instrument, warn, Span};

use crate::config::CatchUpConfig;
use crate::errors::CatchUpError;
use crate::listener::{Dispatch, EventListener, HandlerRegistry, StreamAware};

/// Outcome of a successful catch-up or replay run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatchUpSummary {
    /// Identity the run reserved.
    pub listener_id: ListenerId,
    /// Stream the run consumed.
    pub selector: StreamSelector,
    /// Events dispatched to a handler.
    pub applied: usize,
    /// Events without a handler; their progress was still recorded.
    pub skipped: usize,
    /// Listener's applied sequence number when the run ended.
    pub last_applied: SequenceNumber,
    /// `false` when the selector matched no stream at all.
    pub stream_found: bool,
}

impl CatchUpSummary {
    fn starting_at(
        listener_id: ListenerId,
        selector: StreamSelector,
        position: SequenceNumber,
    ) -> Self {
        Self {
            listener_id,
            selector,
            applied: 0,
            skipped: 0,
            last_applied: position,
            stream_found: false,
        }
    }

    /// Number of envelopes the run moved past.
    pub const fn processed(&self) -> usize {
        self.applied + self.skipped
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    CatchUp,
    Replay,
}

enum Applied {
    Handled,
    Skipped,
}

/// A held reservation. Dropping it without [`release`](Self::release)
/// abandons the reservation in the progress store.
struct Reservation<'a, P: ProgressStore> {
    progress: &'a P,
    listener: &'a ListenerId,
    held: bool,
}

impl<'a, P: ProgressStore> Reservation<'a, P> {
    const fn new(progress: &'a P, listener: &'a ListenerId) -> Self {
        Self {
            progress,
            listener,
            held: true,
        }
    }

    async fn release(mut self) {
        self.progress.release(self.listener).await;
        self.held = false;
    }
}

impl<P: ProgressStore> Drop for Reservation<'_, P> {
    fn drop(&mut self) {
        if self.held {
            warn!(
                listener = %self.listener,
                "[catch_up.abandoned] run dropped before release"
            );
            self.progress.abandon(self.listener);
        }
    }
}

/// Orchestrates catch-up runs over a progress store and a stream source.
///
/// The invoker holds no state between runs; concurrent runs for the same
/// listener are kept apart by the progress store's reservation.
///
/// # Example
///
/// ```ignore
/// let invoker = CatchUpInvoker::new(progress, source);
/// let summary = invoker.catch_up(&mut listener).await?;
/// info!(applied = summary.applied, "listener caught up");
/// ```
#[derive(Debug)]
pub struct CatchUpInvoker<P, S> {
    progress: P,
    source: S,
    config: CatchUpConfig,
}

impl<P, S> CatchUpInvoker<P, S>
where
    P: ProgressStore,
    S: StreamSource,
{
    /// Create an invoker with the default configuration.
    pub fn new(progress: P, source: S) -> Self {
        Self {
            progress,
            source,
            config: CatchUpConfig::default(),
        }
    }

    /// Replace the configuration.
    #[must_use]
    pub fn with_config(mut self, config: CatchUpConfig) -> Self {
        self.config = config;
        self
    }

    /// Configuration used by every run.
    pub const fn config(&self) -> &CatchUpConfig {
        &self.config
    }

    /// The progress store runs reserve and record progress in.
    pub const fn progress_store(&self) -> &P {
        &self.progress
    }

    /// The source runs load envelopes from.
    pub const fn stream_source(&self) -> &S {
        &self.source
    }

    /// Apply every event the listener has not yet applied.
    pub async fn catch_up<L: EventListener>(
        &self,
        listener: &mut L,
    ) -> Result<CatchUpSummary, CatchUpError> {
        self.catch_up_with_progress(listener, |_| {}).await
    }

    /// Like [`catch_up`](Self::catch_up), calling `on_progress` with each
    /// envelope once its sequence number has been persisted.
    #[instrument(
        name = "catch_up",
        skip_all,
        fields(listener = %listener.listener_id(), selector = tracing::field::Empty)
    )]
    pub async fn catch_up_with_progress<L, F>(
        &self,
        listener: &mut L,
        on_progress: F,
    ) -> Result<CatchUpSummary, CatchUpError>
    where
        L: EventListener,
        F: FnMut(&EventEnvelope) + Send,
    {
        self.run(listener, on_progress, Mode::CatchUp).await
    }

    /// Rebuild the listener from the first event.
    ///
    /// Under the reservation, the listener's state is cleared through
    /// [`Resettable`](crate::Resettable) (when implemented) and its stored
    /// progress rewound to zero before catching up.
    #[instrument(
        name = "replay",
        skip_all,
        fields(listener = %listener.listener_id(), selector = tracing::field::Empty)
    )]
    pub async fn replay<L: EventListener>(
        &self,
        listener: &mut L,
    ) -> Result<CatchUpSummary, CatchUpError> {
        self.run(listener, |_| {}, Mode::Replay).await
    }

    async fn run<L, F>(
        &self,
        listener: &mut L,
        on_progress: F,
        mode: Mode,
    ) -> Result<CatchUpSummary, CatchUpError>
    where
        L: EventListener,
        F: FnMut(&EventEnvelope) + Send,
    {
        let listener_id = listener.listener_id();

        let reserved = self
            .progress
            .reserve(&listener_id)
            .await
            .map_err(|error| match error {
                ProgressStoreError::ReservationConflict { listener } => {
                    warn!("[catch_up.reservation_conflict] listener is busy");
                    CatchUpError::ReservationConflict { listener }
                }
                other => CatchUpError::ProgressStore(other),
            })?;
        let reservation = Reservation::new(&self.progress, &listener_id);

        let selector = listener
            .as_stream_aware()
            .map_or(StreamSelector::All, StreamAware::listens_to);
        Span::current().record("selector", tracing::field::display(&selector));

        let outcome = self
            .replay_reserved(listener, &listener_id, selector, reserved, on_progress, mode)
            .await;

        reservation.release().await;

        match &outcome {
            Ok(summary) => info!(
                applied = summary.applied,
                skipped = summary.skipped,
                last_applied = %summary.last_applied,
                "[catch_up.finished] catch-up run finished"
            ),
            Err(error) => error!(
                error = %error,
                "[catch_up.failed] catch-up run failed"
            ),
        }
        outcome
    }

    async fn replay_reserved<L, F>(
        &self,
        listener: &mut L,
        listener_id: &ListenerId,
        selector: StreamSelector,
        reserved: SequenceNumber,
        mut on_progress: F,
        mode: Mode,
    ) -> Result<CatchUpSummary, CatchUpError>
    where
        L: EventListener,
        F: FnMut(&EventEnvelope) + Send,
    {
        let mut position = reserved;
        if mode == Mode::Replay {
            if let Some(resettable) = listener.as_resettable() {
                resettable
                    .reset()
                    .map_err(|source| CatchUpError::ResetFailed {
                        listener: listener_id.clone(),
                        source,
                    })?;
            }
            self.progress.reset(listener_id).await?;
            position = SequenceNumber::none();
        }

        info!(
            from = %position.next(),
            "[catch_up.started] catch-up run started"
        );

        let mut summary = CatchUpSummary::starting_at(listener_id.clone(), selector, position);
        let handlers = listener.handlers();
        let mut bound: Option<SequenceNumber> = None;

        loop {
            let outcome = self
                .source
                .load(&summary.selector, position.next(), self.config.batch_size())
                .await?;
            let batch = match outcome {
                LoadOutcome::Found(batch) => batch,
                LoadOutcome::NotFound => {
                    if bound.is_none() {
                        warn!("[catch_up.stream_not_found] nothing to replay");
                    }
                    break;
                }
            };
            summary.stream_found = true;
            let head = *bound.get_or_insert(batch.head());
            if batch.is_empty() {
                break;
            }

            let mut reached_head = false;
            for envelope in batch.into_envelopes() {
                let sequence_number = envelope.sequence_number();
                if sequence_number > head {
                    reached_head = true;
                    break;
                }
                if sequence_number <= position {
                    return Err(CatchUpError::NonMonotonicSequence {
                        listener: listener_id.clone(),
                        previous: position,
                        found: sequence_number,
                    });
                }

                match apply(listener, listener_id, &handlers, &envelope)? {
                    Applied::Handled => summary.applied += 1,
                    Applied::Skipped => summary.skipped += 1,
                }

                self.progress.save(listener_id, sequence_number).await?;
                position = sequence_number;
                summary.last_applied = sequence_number;
                on_progress(&envelope);

                if sequence_number == head {
                    reached_head = true;
                    break;
                }
            }
            if reached_head {
                break;
            }
        }

        Ok(summary)
    }
}

/// Dispatch one envelope to the listener's handler, running the hooks around
/// it. Events without a handler are skipped without running the hooks.
fn apply<L: EventListener>(
    listener: &mut L,
    listener_id: &ListenerId,
    handlers: &HandlerRegistry<L>,
    envelope: &EventEnvelope,
) -> Result<Applied, CatchUpError> {
    let event = undecorated(envelope.domain_event_arc());
    let raw = envelope.raw_event();
    let type_path = event.type_path();
    let event_type = EventTypeName::from_type_path(type_path).map_err(|error| {
        CatchUpError::DispatchResolutionFailed {
            listener: listener_id.clone(),
            type_path: type_path.to_owned(),
            reason: error.to_string(),
        }
    })?;

    if !handlers.contains(&event_type) {
        debug!(
            sequence_number = %envelope.sequence_number(),
            handler = %HandlerRegistry::<L>::handler_name(&event_type),
            "[catch_up.event_skipped] no handler registered"
        );
        return Ok(Applied::Skipped);
    }

    if let Some(hook) = listener.as_before_invoke() {
        hook.before_invoke(envelope);
    }

    match handlers.dispatch(listener, &event_type, event.as_ref(), raw) {
        Dispatch::Handled(Ok(())) => {}
        Dispatch::Handled(Err(source)) => {
            error!(
                event_id = %raw.identifier(),
                event_type = %raw.event_type(),
                sequence_number = %raw.sequence_number(),
                error = %source,
                "[catch_up.event_failed] handler rejected event"
            );
            return Err(CatchUpError::EventApplicationFailed {
                listener: listener_id.clone(),
                event_id: raw.identifier().clone(),
                event_type: raw.event_type().clone(),
                sequence_number: raw.sequence_number(),
                source,
            });
        }
        Dispatch::Unhandled | Dispatch::TypeMismatch => {
            return Err(CatchUpError::DispatchResolutionFailed {
                listener: listener_id.clone(),
                type_path: type_path.to_owned(),
                reason: format!(
                    "{} is registered for a different type",
                    HandlerRegistry::<L>::handler_name(&event_type)
                ),
            });
        }
    }

    if let Some(hook) = listener.as_after_invoke() {
        hook.after_invoke(envelope);
    }

    debug!(
        sequence_number = %envelope.sequence_number(),
        handler = %HandlerRegistry::<L>::handler_name(&event_type),
        "[catch_up.event_applied] event applied"
    );
    Ok(Applied::Handled)
}

use std::sync::{Arc, Mutex};

use catchup_types::{
    BatchSize, DomainEvent, EventAppender, EventBatch, EventEnvelope, EventId, EventNormalizer,
    LoadOutcome, Operation, RawEvent, SequenceNumber, StreamName, StreamSelector, StreamSource,
    StreamSourceError,
};
use tracing::{debug, instrument};

/// Stream source backed by an in-memory, append-only global log.
///
/// Payloads are stored as JSON and decoded through the [`EventNormalizer`] on
/// every load, exactly as a durable source would.
///
/// `StreamSelector::All` is always found, even on an empty log. Named and
/// category selectors are not found until an event has been appended to a
/// matching stream.
#[derive(Debug, Clone)]
pub struct InMemoryStreamSource {
    normalizer: EventNormalizer,
    log: Arc<Mutex<Vec<RawEvent>>>,
}

impl InMemoryStreamSource {
    /// Create an empty log decoding payloads with `normalizer`.
    pub fn new(normalizer: EventNormalizer) -> Self {
        Self {
            normalizer,
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// The normalizer used to encode and decode payloads.
    pub const fn normalizer(&self) -> &EventNormalizer {
        &self.normalizer
    }

    /// Number of events in the global log.
    pub fn len(&self) -> usize {
        self.log.lock().map_or(0, |log| log.len())
    }

    /// Whether the global log is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn failure(operation: Operation) -> StreamSourceError {
        StreamSourceError::StoreFailure {
            operation,
            detail: "event log lock poisoned".to_owned(),
        }
    }
}

impl StreamSource for InMemoryStreamSource {
    #[instrument(name = "memory.load", skip(self, selector), fields(selector = %selector))]
    async fn load(
        &self,
        selector: &StreamSelector,
        from: SequenceNumber,
        limit: BatchSize,
    ) -> Result<LoadOutcome, StreamSourceError> {
        let log = self.log.lock().map_err(|_| Self::failure(Operation::Load))?;

        let mut visible = log
            .iter()
            .filter(|event| selector.matches(event.stream_name()))
            .peekable();
        if visible.peek().is_none() && *selector != StreamSelector::All {
            debug!("[memory.load] no stream matches selector");
            return Ok(LoadOutcome::NotFound);
        }

        let mut head = SequenceNumber::none();
        let mut page = Vec::new();
        for raw in visible {
            head = raw.sequence_number();
            if raw.sequence_number() >= from && page.len() < limit.into_inner() {
                page.push(raw.clone());
            }
        }
        drop(log);

        let envelopes = page
            .into_iter()
            .map(|raw| {
                let event = self
                    .normalizer
                    .denormalize(raw.event_type(), raw.payload().clone())?;
                Ok(EventEnvelope::new(raw, event))
            })
            .collect::<Result<Vec<_>, StreamSourceError>>()?;

        debug!(
            count = envelopes.len(),
            head = %head,
            "[memory.load] loaded events"
        );
        Ok(LoadOutcome::Found(EventBatch::new(envelopes, head)))
    }
}

impl EventAppender for InMemoryStreamSource {
    #[instrument(name = "memory.append", skip(self, stream, events), fields(stream = %stream, count = events.len()))]
    async fn append(
        &self,
        stream: &StreamName,
        events: Vec<Arc<dyn DomainEvent>>,
    ) -> Result<Vec<SequenceNumber>, StreamSourceError> {
        let normalized = events
            .iter()
            .map(|event| self.normalizer.normalize(event))
            .collect::<Result<Vec<_>, _>>()?;

        let mut log = self.log.lock().map_err(|_| Self::failure(Operation::Append))?;
        let mut assigned = Vec::with_capacity(normalized.len());
        for event in normalized {
            let sequence_number = SequenceNumber::new(log.len() as u64 + 1);
            log.push(
                RawEvent::new(
                    EventId::generate(),
                    event.event_type,
                    sequence_number,
                    stream.clone(),
                    event.payload,
                )
                .with_metadata(event.metadata),
            );
            assigned.push(sequence_number);
        }
        Ok(assigned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use catchup_types::NormalizerError;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize)]
    struct SeatReserved {
        seat: String,
    }

    impl DomainEvent for SeatReserved {}

    #[derive(Debug, Serialize, Deserialize)]
    struct SeatReleased;

    impl DomainEvent for SeatReleased {}

    fn source() -> InMemoryStreamSource {
        let normalizer = EventNormalizer::new()
            .register::<SeatReserved>()
            .expect("valid event type");
        InMemoryStreamSource::new(normalizer)
    }

    fn stream(name: &str) -> StreamName {
        StreamName::try_new(name).expect("valid stream name")
    }

    fn reserved(seat: &str) -> Arc<dyn DomainEvent> {
        Arc::new(SeatReserved {
            seat: seat.to_owned(),
        })
    }

    fn limit(size: usize) -> BatchSize {
        BatchSize::try_new(size).expect("non-zero batch size")
    }

    #[tokio::test]
    async fn all_selector_is_found_on_an_empty_log() {
        let source = source();

        let outcome = source
            .load(&StreamSelector::All, SequenceNumber::new(1), limit(10))
            .await
            .expect("load succeeds");

        match outcome {
            LoadOutcome::Found(batch) => {
                assert!(batch.is_empty());
                assert!(batch.head().is_none());
            }
            LoadOutcome::NotFound => panic!("the global log always exists"),
        }
    }

    #[tokio::test]
    async fn append_with_unregistered_type_writes_nothing() {
        let source = source();
        let released: Arc<dyn DomainEvent> = Arc::new(SeatReleased);

        let result = source
            .append(&stream("theatre-1"), vec![reserved("A1"), released])
            .await;

        assert!(matches!(
            result,
            Err(StreamSourceError::Normalizer(
                NormalizerError::UnknownEventType { .. }
            ))
        ));
        assert!(source.is_empty());
    }

    #[tokio::test]
    async fn sequence_numbers_are_global_across_streams() {
        let source = source();

        let first = source
            .append(&stream("theatre-1"), vec![reserved("A1")])
            .await
            .expect("append succeeds");
        let second = source
            .append(&stream("theatre-2"), vec![reserved("B1"), reserved("B2")])
            .await
            .expect("append succeeds");

        assert_eq!(first, vec![SequenceNumber::new(1)]);
        assert_eq!(second, vec![SequenceNumber::new(2), SequenceNumber::new(3)]);
        assert_eq!(source.len(), 3);
    }

    #[tokio::test]
    async fn loaded_events_decode_to_their_registered_type() {
        let source = source();
        let _ = source
            .append(&stream("theatre-1"), vec![reserved("C7")])
            .await
            .expect("append succeeds");

        let outcome = source
            .load(&StreamSelector::All, SequenceNumber::new(1), limit(10))
            .await
            .expect("load succeeds");

        let LoadOutcome::Found(batch) = outcome else {
            panic!("global log exists");
        };
        let seat = batch.envelopes()[0]
            .domain_event()
            .downcast_ref::<SeatReserved>()
            .map(|event| event.seat.clone());
        assert_eq!(seat.as_deref(), Some("C7"));
        assert_eq!(
            batch.envelopes()[0].raw_event().event_type().to_string(),
            "SeatReserved"
        );
    }

    #[tokio::test]
    async fn clones_share_the_log() {
        let source = source();
        let clone = source.clone();

        let _ = clone
            .append(&stream("theatre-1"), vec![reserved("D4")])
            .await
            .expect("append succeeds");

        assert_eq!(source.len(), 1);
    }
}

//! Runs against a scripted stream source that returns whatever envelopes the
//! test hands it, to cover inputs a well-behaved store never produces.

use std::sync::Arc;

use catchup::{
    BatchSize, CatchUpError, CatchUpInvoker, DomainEvent, EventBatch, EventEnvelope, EventId,
    EventListener, EventTypeName, LoadOutcome, ProgressStore, RawEvent, SequenceNumber,
    StreamName, StreamSelector, StreamSource, StreamSourceError,
};
use catchup_memory::InMemoryProgressStore;
use catchup_testing::contract::ContractTestEvent;
use catchup_testing::RecordingListener;
use serde_json::json;

mod impostor {
    use catchup::DomainEvent;

    /// Shares its short name with the fixture's handled event type.
    #[derive(Debug)]
    pub struct ContractTestEvent;

    impl DomainEvent for ContractTestEvent {}
}

/// Reports a type path that is not a Rust identifier.
#[derive(Debug)]
struct Unnamed;

impl DomainEvent for Unnamed {
    fn type_path(&self) -> &'static str {
        "generated event"
    }
}

/// Serves the same scripted envelopes for every load at or before them.
struct ScriptedSource {
    envelopes: Vec<EventEnvelope>,
}

impl ScriptedSource {
    fn new(events: Vec<(u64, Arc<dyn DomainEvent>)>) -> Self {
        let envelopes = events
            .into_iter()
            .map(|(sequence_number, event)| {
                let raw = RawEvent::new(
                    EventId::generate(),
                    EventTypeName::try_new("ContractTestEvent").expect("valid event type"),
                    SequenceNumber::new(sequence_number),
                    StreamName::try_new("scripted-1").expect("valid stream name"),
                    json!({ "label": "scripted" }),
                );
                EventEnvelope::new(raw, event)
            })
            .collect();
        Self { envelopes }
    }
}

impl StreamSource for ScriptedSource {
    async fn load(
        &self,
        _selector: &StreamSelector,
        from: SequenceNumber,
        _limit: BatchSize,
    ) -> Result<LoadOutcome, StreamSourceError> {
        let head = self
            .envelopes
            .iter()
            .map(EventEnvelope::sequence_number)
            .max()
            .unwrap_or_else(SequenceNumber::none);
        let page = self
            .envelopes
            .iter()
            .skip_while(|envelope| envelope.sequence_number() < from)
            .cloned()
            .collect();
        Ok(LoadOutcome::Found(EventBatch::new(page, head)))
    }
}

fn handled(label: &str) -> Arc<dyn DomainEvent> {
    Arc::new(ContractTestEvent::new(label))
}

#[tokio::test]
async fn repeated_sequence_number_stops_the_run() {
    // Given: a source that serves sequence number 2 twice
    let progress = InMemoryProgressStore::new();
    let source = ScriptedSource::new(vec![
        (1, handled("a")),
        (2, handled("b")),
        (2, handled("b-again")),
        (3, handled("c")),
    ]);
    let invoker = CatchUpInvoker::new(progress.clone(), source);
    let mut listener = RecordingListener::new("scripted");

    // When: the listener catches up
    let error = invoker
        .catch_up(&mut listener)
        .await
        .expect_err("out-of-order sequence is rejected");

    // Then: the run stops at the duplicate with progress at the last good event
    assert!(matches!(
        error,
        CatchUpError::NonMonotonicSequence { previous, found, .. }
            if previous == SequenceNumber::new(2) && found == SequenceNumber::new(2)
    ));
    assert_eq!(listener.labels(), ["a", "b"]);
    assert_eq!(
        progress
            .current(&listener.listener_id())
            .await
            .expect("current succeeds"),
        SequenceNumber::new(2)
    );
    assert!(!progress.is_reserved(&listener.listener_id()));
}

#[tokio::test]
async fn same_short_name_with_another_type_is_a_resolution_failure() {
    let progress = InMemoryProgressStore::new();
    let impostor: Arc<dyn DomainEvent> = Arc::new(impostor::ContractTestEvent);
    let source = ScriptedSource::new(vec![(1, handled("a")), (2, impostor)]);
    let invoker = CatchUpInvoker::new(progress.clone(), source);
    let mut listener = RecordingListener::new("scripted");

    let error = invoker
        .catch_up(&mut listener)
        .await
        .expect_err("impostor is not dispatched");

    match error {
        CatchUpError::DispatchResolutionFailed { type_path, .. } => {
            assert!(type_path.contains("impostor"));
        }
        other => panic!("expected DispatchResolutionFailed, got {other}"),
    }
    assert_eq!(listener.labels(), ["a"]);
    assert_eq!(
        progress
            .current(&listener.listener_id())
            .await
            .expect("current succeeds"),
        SequenceNumber::new(1)
    );
}

#[tokio::test]
async fn unusable_type_name_is_a_resolution_failure() {
    let progress = InMemoryProgressStore::new();
    let unnamed: Arc<dyn DomainEvent> = Arc::new(Unnamed);
    let source = ScriptedSource::new(vec![(1, unnamed)]);
    let invoker = CatchUpInvoker::new(progress.clone(), source);
    let mut listener = RecordingListener::new("scripted");

    let error = invoker
        .catch_up(&mut listener)
        .await
        .expect_err("unnamed event is not dispatched");

    assert!(matches!(
        error,
        CatchUpError::DispatchResolutionFailed { ref type_path, .. } if type_path == "generated event"
    ));
    assert!(listener.journal().is_empty());
    assert!(progress
        .current(&listener.listener_id())
        .await
        .expect("current succeeds")
        .is_none());
}

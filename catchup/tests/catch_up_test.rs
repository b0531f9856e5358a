//! Catch-up runs against the in-memory progress store and stream source.
//!
//! Every scenario drives a `RecordingListener` through a `CatchUpInvoker` and
//! checks three things: what the listener applied, what progress was stored,
//! and that the reservation was released.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use catchup::{
    BatchSize, CatchUpConfig, CatchUpError, CatchUpInvoker, DomainEvent, EventAppender,
    EventListener, ListenerId, LoadOutcome, ProgressStore, SequenceNumber, StreamName,
    StreamPrefix, StreamSelector, StreamSource, StreamSourceError,
};
use catchup_memory::{InMemoryProgressStore, InMemoryStreamSource};
use catchup_testing::contract::{contract_events, contract_normalizer, OtherContractEvent};
use catchup_testing::RecordingListener;
use proptest::prelude::*;

type Invoker = CatchUpInvoker<InMemoryProgressStore, InMemoryStreamSource>;

struct World {
    progress: InMemoryProgressStore,
    source: InMemoryStreamSource,
    invoker: Invoker,
}

impl World {
    fn new() -> Self {
        let progress = InMemoryProgressStore::new();
        let source = InMemoryStreamSource::new(contract_normalizer());
        let invoker = CatchUpInvoker::new(progress.clone(), source.clone());
        Self {
            progress,
            source,
            invoker,
        }
    }

    fn with_batch_size(mut self, size: usize) -> Self {
        let batch_size = BatchSize::try_new(size).expect("non-zero batch size");
        self.invoker = CatchUpInvoker::new(self.progress.clone(), self.source.clone())
            .with_config(CatchUpConfig::default().with_batch_size(batch_size));
        self
    }

    async fn append(&self, stream: &str, labels: &[&str]) -> Vec<SequenceNumber> {
        self.source
            .append(&stream_name(stream), contract_events(labels))
            .await
            .expect("append succeeds")
    }

    async fn append_events(&self, stream: &str, events: Vec<Arc<dyn DomainEvent>>) {
        let _ = self
            .source
            .append(&stream_name(stream), events)
            .await
            .expect("append succeeds");
    }

    async fn stored_progress(&self, listener: &RecordingListener) -> SequenceNumber {
        self.progress
            .current(&listener.listener_id())
            .await
            .expect("current succeeds")
    }
}

/// Serves `pages` loads from the wrapped source, then never answers again.
struct StallingSource {
    inner: InMemoryStreamSource,
    pages: usize,
    loads: AtomicUsize,
}

impl StallingSource {
    const fn after(pages: usize, inner: InMemoryStreamSource) -> Self {
        Self {
            inner,
            pages,
            loads: AtomicUsize::new(0),
        }
    }
}

impl StreamSource for StallingSource {
    async fn load(
        &self,
        selector: &StreamSelector,
        from: SequenceNumber,
        limit: BatchSize,
    ) -> Result<LoadOutcome, StreamSourceError> {
        if self.loads.fetch_add(1, Ordering::SeqCst) >= self.pages {
            futures::future::pending::<()>().await;
        }
        self.inner.load(selector, from, limit).await
    }
}

fn stream_name(name: &str) -> StreamName {
    StreamName::try_new(name).expect("valid stream name")
}

fn seq(value: u64) -> SequenceNumber {
    SequenceNumber::new(value)
}

fn seqs(values: &[u64]) -> Vec<SequenceNumber> {
    values.iter().copied().map(SequenceNumber::new).collect()
}

#[tokio::test]
async fn catch_up_applies_backlog_in_order_and_records_progress() {
    // Given: three events in one stream
    let world = World::new();
    let _ = world.append("invoice-1", &["issued", "paid", "closed"]).await;
    let mut listener = RecordingListener::new("invoice-totals");

    // When: the listener catches up
    let summary = world
        .invoker
        .catch_up(&mut listener)
        .await
        .expect("catch-up succeeds");

    // Then: every event is applied once, in order, and progress points at the last
    assert_eq!(listener.applied(), seqs(&[1, 2, 3]).as_slice());
    assert_eq!(listener.labels(), ["issued", "paid", "closed"]);
    assert_eq!(summary.applied, 3);
    assert_eq!(summary.last_applied, seq(3));
    assert!(summary.stream_found);
    assert_eq!(world.stored_progress(&listener).await, seq(3));
    assert!(!world.progress.is_reserved(&listener.listener_id()));
}

#[tokio::test]
async fn second_run_without_new_events_applies_nothing() {
    // Given: a listener that already caught up
    let world = World::new();
    let _ = world.append("invoice-1", &["issued", "paid"]).await;
    let mut listener = RecordingListener::new("invoice-totals");
    let _ = world.invoker.catch_up(&mut listener).await.expect("first run");

    // When: it catches up again
    let summary = world.invoker.catch_up(&mut listener).await.expect("second run");

    // Then: nothing is reapplied
    assert_eq!(summary.processed(), 0);
    assert_eq!(listener.applied(), seqs(&[1, 2]).as_slice());
    assert_eq!(world.stored_progress(&listener).await, seq(2));
}

#[tokio::test]
async fn fresh_instance_resumes_after_stored_progress() {
    // Given: stored progress at 2 and two events appended afterwards
    let world = World::new();
    let _ = world.append("invoice-1", &["issued", "paid"]).await;
    let _ = world
        .invoker
        .catch_up(&mut RecordingListener::new("invoice-totals"))
        .await
        .expect("first run");
    let _ = world.append("invoice-2", &["issued", "voided"]).await;

    // When: a new instance of the same listener catches up
    let mut restarted = RecordingListener::new("invoice-totals");
    let summary = world
        .invoker
        .catch_up(&mut restarted)
        .await
        .expect("resumed run");

    // Then: only the events after the stored position are applied
    assert_eq!(restarted.applied(), seqs(&[3, 4]).as_slice());
    assert_eq!(summary.last_applied, seq(4));
}

#[tokio::test]
async fn handler_failure_stops_the_run_before_the_failed_event() {
    // Given: five events and a listener that rejects the third
    let world = World::new();
    let _ = world
        .append("invoice-1", &["a", "b", "c", "d", "e"])
        .await;
    let mut listener = RecordingListener::new("invoice-totals").failing_at(seq(3));

    // When: the listener catches up
    let error = world
        .invoker
        .catch_up(&mut listener)
        .await
        .expect_err("handler failure surfaces");

    // Then: the failure names the event and progress stops just before it
    match &error {
        CatchUpError::EventApplicationFailed {
            sequence_number,
            event_type,
            ..
        } => {
            assert_eq!(*sequence_number, seq(3));
            assert_eq!(event_type.to_string(), "ContractTestEvent");
        }
        other => panic!("expected EventApplicationFailed, got {other}"),
    }
    assert!(!error.is_transient());
    assert_eq!(listener.applied(), seqs(&[1, 2]).as_slice());
    assert_eq!(world.stored_progress(&listener).await, seq(2));
    assert!(!world.progress.is_reserved(&listener.listener_id()));

    // And: once fixed, the next run picks up at the failed event
    listener.heal();
    let summary = world.invoker.catch_up(&mut listener).await.expect("retry");
    assert_eq!(summary.applied, 3);
    assert_eq!(listener.applied(), seqs(&[1, 2, 3, 4, 5]).as_slice());
}

#[tokio::test]
async fn failed_event_runs_before_hook_but_not_after_hook() {
    let world = World::new();
    let _ = world.append("invoice-1", &["a"]).await;
    let mut listener = RecordingListener::new("invoice-totals").failing_at(seq(1));

    let _ = world.invoker.catch_up(&mut listener).await;

    assert_eq!(listener.journal(), ["before:1", "handle:1"]);
}

#[tokio::test]
async fn missing_stream_is_a_successful_no_op() {
    // Given: a listener bound to a stream nobody wrote to
    let world = World::new();
    let _ = world.append("invoice-1", &["a"]).await;
    let mut listener = RecordingListener::new("refund-totals")
        .listening_to(StreamSelector::Named(stream_name("refund-1")));

    // When: it catches up
    let summary = world
        .invoker
        .catch_up(&mut listener)
        .await
        .expect("missing stream is not an error");

    // Then: nothing happens and the reservation is released
    assert!(!summary.stream_found);
    assert_eq!(summary.processed(), 0);
    assert!(listener.journal().is_empty());
    assert!(world.stored_progress(&listener).await.is_none());
    assert!(!world.progress.is_reserved(&listener.listener_id()));
}

#[tokio::test]
async fn empty_log_is_found_and_applies_nothing() {
    let world = World::new();
    let mut listener = RecordingListener::new("invoice-totals");

    let summary = world.invoker.catch_up(&mut listener).await.expect("empty log");

    assert!(summary.stream_found);
    assert_eq!(summary.processed(), 0);
    assert!(summary.last_applied.is_none());
}

#[tokio::test]
async fn unhandled_events_advance_progress_without_hooks() {
    // Given: a handled, an unhandled, and another handled event
    let world = World::new();
    let _ = world.append("invoice-1", &["issued"]).await;
    let other: Arc<dyn DomainEvent> = Arc::new(OtherContractEvent::new("audited"));
    world.append_events("invoice-1", vec![other]).await;
    let _ = world.append("invoice-1", &["paid"]).await;
    let mut listener = RecordingListener::new("invoice-totals");

    // When: the listener catches up
    let summary = world
        .invoker
        .catch_up(&mut listener)
        .await
        .expect("catch-up succeeds");

    // Then: the unhandled event is skipped silently but still counted as done
    assert_eq!(summary.applied, 2);
    assert_eq!(summary.skipped, 1);
    assert_eq!(
        listener.journal(),
        ["before:1", "handle:1", "after:1", "before:3", "handle:3", "after:3"]
    );
    assert_eq!(world.stored_progress(&listener).await, seq(3));
}

#[tokio::test]
async fn stream_aware_listener_sees_only_its_category() {
    // Given: invoice and payment streams interleaved in the log
    let world = World::new();
    let _ = world.append("invoice-1", &["i1"]).await;
    let _ = world.append("payment-1", &["p1"]).await;
    let _ = world.append("invoice-2", &["i2"]).await;
    let _ = world.append("payment-2", &["p2"]).await;
    let prefix = StreamPrefix::try_new("invoice-").expect("valid prefix");
    let mut listener =
        RecordingListener::new("invoice-totals").listening_to(StreamSelector::Category(prefix));

    // When: the listener catches up
    let summary = world
        .invoker
        .catch_up(&mut listener)
        .await
        .expect("catch-up succeeds");

    // Then: only invoice events are applied and progress is the last one seen
    assert_eq!(listener.labels(), ["i1", "i2"]);
    assert_eq!(listener.applied(), seqs(&[1, 3]).as_slice());
    assert_eq!(summary.selector.to_string(), "category:invoice-");
    assert_eq!(world.stored_progress(&listener).await, seq(3));
}

#[tokio::test]
async fn small_batches_still_drain_the_backlog() {
    let world = World::new().with_batch_size(2);
    let _ = world
        .append("invoice-1", &["a", "b", "c", "d", "e"])
        .await;
    let mut listener = RecordingListener::new("invoice-totals");

    let summary = world
        .invoker
        .catch_up(&mut listener)
        .await
        .expect("catch-up succeeds");

    assert_eq!(summary.applied, 5);
    assert_eq!(listener.applied(), seqs(&[1, 2, 3, 4, 5]).as_slice());
}

#[tokio::test]
async fn progress_callback_follows_each_persisted_event() {
    let world = World::new();
    let _ = world.append("invoice-1", &["a", "b", "c"]).await;
    let mut listener = RecordingListener::new("invoice-totals");
    let mut reported = Vec::new();

    let _ = world
        .invoker
        .catch_up_with_progress(&mut listener, |envelope| {
            reported.push(envelope.sequence_number());
        })
        .await
        .expect("catch-up succeeds");

    assert_eq!(reported, seqs(&[1, 2, 3]));
}

#[tokio::test]
async fn reserved_listener_is_rejected_and_left_reserved() {
    // Given: another run holds the listener's reservation
    let world = World::new();
    let _ = world.append("invoice-1", &["a"]).await;
    let mut listener = RecordingListener::new("invoice-totals");
    let listener_id = listener.listener_id();
    let _ = world
        .progress
        .reserve(&listener_id)
        .await
        .expect("first reservation");

    // When: this run tries to catch up
    let result = world.invoker.catch_up(&mut listener).await;

    // Then: it fails without applying anything or releasing the other run's reservation
    assert!(matches!(
        result,
        Err(CatchUpError::ReservationConflict { ref listener }) if *listener == listener_id
    ));
    assert!(listener.journal().is_empty());
    assert!(world.progress.is_reserved(&listener_id));

    // And: after the holder releases, the run goes through
    world.progress.release(&listener_id).await;
    let summary = world.invoker.catch_up(&mut listener).await.expect("retry");
    assert_eq!(summary.applied, 1);
}

#[tokio::test]
async fn run_dropped_while_loading_frees_the_listener() {
    // Given: a source that never answers
    let world = World::new();
    let _ = world.append("invoice-1", &["a", "b"]).await;
    let stalled = CatchUpInvoker::new(
        world.progress.clone(),
        StallingSource::after(0, world.source.clone()),
    );
    let mut listener = RecordingListener::new("billing::Totals");

    // When: the caller gives up on the run
    let timed_out = tokio::time::timeout(Duration::from_millis(50), stalled.catch_up(&mut listener))
        .await;

    // Then: the reservation is gone and a later run catches up normally
    assert!(timed_out.is_err());
    assert!(!world.progress.is_reserved(&listener.listener_id()));
    let summary = world
        .invoker
        .catch_up(&mut listener)
        .await
        .expect("later run is not locked out");
    assert_eq!(summary.applied, 2);
    assert_eq!(listener.labels(), ["a", "b"]);
}

#[tokio::test]
async fn run_dropped_mid_backlog_keeps_saved_progress() {
    let world = World::new().with_batch_size(1);
    let _ = world.append("invoice-1", &["a", "b", "c"]).await;
    let stalled = CatchUpInvoker::new(
        world.progress.clone(),
        StallingSource::after(1, world.source.clone()),
    )
    .with_config(CatchUpConfig::default().with_batch_size(BatchSize::try_new(1).expect("non-zero")));
    let mut listener = RecordingListener::new("billing::Totals");

    let timed_out = tokio::time::timeout(Duration::from_millis(50), stalled.catch_up(&mut listener))
        .await;

    assert!(timed_out.is_err());
    assert!(!world.progress.is_reserved(&listener.listener_id()));
    assert_eq!(world.stored_progress(&listener).await, seq(1));

    let summary = world
        .invoker
        .catch_up(&mut listener)
        .await
        .expect("later run resumes");
    assert_eq!(summary.applied, 2);
    assert_eq!(listener.labels(), ["a", "b", "c"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_runs_never_apply_an_event_twice() {
    // Given: a backlog and four instances of the same listener
    let world = World::new();
    let _ = world
        .append("invoice-1", &["a", "b", "c", "d", "e", "f", "g", "h"])
        .await;
    let invoker = Arc::new(world.invoker);

    // When: they all catch up at once
    let runs: Vec<_> = (0..4)
        .map(|_| {
            let invoker = Arc::clone(&invoker);
            tokio::spawn(async move {
                let mut listener = RecordingListener::new("invoice-totals");
                let result = invoker.catch_up(&mut listener).await;
                (result, listener)
            })
        })
        .collect();
    let outcomes = futures::future::join_all(runs).await;

    // Then: losers see a conflict and the events are applied exactly once overall
    let mut applied = Vec::new();
    for outcome in outcomes {
        let (result, listener) = outcome.expect("run task completes");
        match result {
            Ok(_) | Err(CatchUpError::ReservationConflict { .. }) => {}
            Err(other) => panic!("unexpected failure: {other}"),
        }
        applied.extend_from_slice(listener.applied());
    }
    applied.sort();
    assert_eq!(applied, seqs(&[1, 2, 3, 4, 5, 6, 7, 8]));
    assert_eq!(
        world
            .progress
            .current(&ListenerId::try_new("invoice-totals").expect("valid id"))
            .await
            .expect("current succeeds"),
        seq(8)
    );
}

#[tokio::test]
async fn replay_resets_the_listener_and_applies_everything_again() {
    // Given: a listener that already caught up
    let world = World::new();
    let _ = world.append("invoice-1", &["a", "b", "c"]).await;
    let mut listener = RecordingListener::new("invoice-totals");
    let _ = world.invoker.catch_up(&mut listener).await.expect("first run");

    // When: it is replayed
    let summary = world.invoker.replay(&mut listener).await.expect("replay");

    // Then: state was cleared once and every event was applied again
    assert_eq!(listener.resets(), 1);
    assert_eq!(listener.applied(), seqs(&[1, 2, 3]).as_slice());
    assert_eq!(summary.applied, 3);
    assert_eq!(world.stored_progress(&listener).await, seq(3));
    assert!(!world.progress.is_reserved(&listener.listener_id()));
}

#[tokio::test]
#[tracing_test::traced_test]
async fn run_logs_its_start_and_finish() {
    let world = World::new();
    let _ = world.append("invoice-1", &["a"]).await;

    let _ = world
        .invoker
        .catch_up(&mut RecordingListener::new("invoice-totals"))
        .await
        .expect("catch-up succeeds");

    assert!(logs_contain("[catch_up.started]"));
    assert!(logs_contain("[catch_up.finished]"));
    assert!(logs_contain("selector=all"));
}

#[tokio::test]
#[tracing_test::traced_test]
async fn handler_failure_is_logged_with_the_event() {
    let world = World::new();
    let _ = world.append("invoice-1", &["a"]).await;

    let _ = world
        .invoker
        .catch_up(&mut RecordingListener::new("invoice-totals").failing_at(seq(1)))
        .await;

    assert!(logs_contain("[catch_up.event_failed]"));
    assert!(logs_contain("[catch_up.failed]"));
}

proptest! {
    #[test]
    fn stored_progress_is_always_the_event_before_the_failure(
        total in 1u64..30,
        fail_offset in 0u64..30,
        batch in 1usize..8,
    ) {
        let fail_at = (fail_offset % total) + 1;

        tokio_test::block_on(async {
            let world = World::new().with_batch_size(batch);
            let labels: Vec<String> = (1..=total).map(|n| format!("e{n}")).collect();
            let labels: Vec<&str> = labels.iter().map(String::as_str).collect();
            let _ = world.append("ledger-1", &labels).await;
            let mut listener = RecordingListener::new("ledger").failing_at(seq(fail_at));

            let result = world.invoker.catch_up(&mut listener).await;

            assert!(result.is_err());
            assert_eq!(world.stored_progress(&listener).await, seq(fail_at - 1));
            let expected: Vec<SequenceNumber> = (1..fail_at).map(SequenceNumber::new).collect();
            assert_eq!(listener.applied(), expected.as_slice());
        });
    }
}

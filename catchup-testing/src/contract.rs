use catchup::EventWithCorrelationIdentifier;
use catchup_types::{
    BatchSize, DomainEvent, EventAppender, EventBatch, EventNormalizer, ListenerId, LoadOutcome,
    ProgressStore, ProgressStoreError, SequenceNumber, StreamName, StreamPrefix, StreamSelector,
    StreamSource, StreamSourceError,
};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// A contract scenario that a backend did not satisfy.
#[derive(Debug)]
pub struct ContractTestFailure {
    scenario: &'static str,
    detail: String,
}

impl ContractTestFailure {
    fn new(scenario: &'static str, detail: impl Into<String>) -> Self {
        Self {
            scenario,
            detail: detail.into(),
        }
    }

    fn progress_error(
        scenario: &'static str,
        operation: &'static str,
        error: &ProgressStoreError,
    ) -> Self {
        Self::new(
            scenario,
            format!("{operation} operation returned unexpected error: {error}"),
        )
    }

    fn source_error(
        scenario: &'static str,
        operation: &'static str,
        error: &StreamSourceError,
    ) -> Self {
        Self::new(
            scenario,
            format!("{operation} operation returned unexpected error: {error}"),
        )
    }

    fn assertion(scenario: &'static str, detail: impl Into<String>) -> Self {
        Self::new(scenario, detail)
    }
}

impl fmt::Display for ContractTestFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.scenario, self.detail)
    }
}

impl std::error::Error for ContractTestFailure {}

/// Outcome of one contract scenario.
pub type ContractTestResult = Result<(), ContractTestFailure>;

/// Event type every contract suite writes; handled by [`RecordingListener`](crate::RecordingListener).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractTestEvent {
    label: String,
}

impl ContractTestEvent {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

impl DomainEvent for ContractTestEvent {}

/// Event type no fixture listener handles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OtherContractEvent {
    label: String,
}

impl OtherContractEvent {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

impl DomainEvent for OtherContractEvent {}

/// Normalizer knowing both contract event types.
///
/// Stream sources under test must be built with it.
pub fn contract_normalizer() -> EventNormalizer {
    EventNormalizer::new()
        .register::<ContractTestEvent>()
        .and_then(EventNormalizer::register::<OtherContractEvent>)
        .expect("contract event types have distinct valid names")
}

/// Wrap labels as contract events ready for [`EventAppender::append`].
pub fn contract_events(labels: &[&str]) -> Vec<Arc<dyn DomainEvent>> {
    labels
        .iter()
        .map(|label| -> Arc<dyn DomainEvent> { Arc::new(ContractTestEvent::new(*label)) })
        .collect()
}

fn contract_listener(scenario: &'static str) -> Result<ListenerId, ContractTestFailure> {
    // Unique per run so suites can share a database
    let raw = format!("contract::{}::{}", scenario, Uuid::now_v7());

    ListenerId::try_new(raw.clone()).map_err(|error| {
        ContractTestFailure::assertion(
            scenario,
            format!("unable to construct listener id `{raw}`: {error}"),
        )
    })
}

fn contract_stream(
    scenario: &'static str,
    run: &Uuid,
    label: &str,
) -> Result<StreamName, ContractTestFailure> {
    let raw = format!("contract-{scenario}-{run}-{label}");

    StreamName::try_new(raw.clone()).map_err(|error| {
        ContractTestFailure::assertion(
            scenario,
            format!("unable to construct stream name `{raw}`: {error}"),
        )
    })
}

fn batch_size(scenario: &'static str, size: usize) -> Result<BatchSize, ContractTestFailure> {
    BatchSize::try_new(size).map_err(|error| {
        ContractTestFailure::assertion(scenario, format!("invalid batch size {size}: {error}"))
    })
}

async fn append<S: EventAppender>(
    scenario: &'static str,
    source: &S,
    stream: &StreamName,
    events: Vec<Arc<dyn DomainEvent>>,
) -> Result<Vec<SequenceNumber>, ContractTestFailure> {
    source
        .append(stream, events)
        .await
        .map_err(|error| ContractTestFailure::source_error(scenario, "append", &error))
}

async fn load_found<S: StreamSource>(
    scenario: &'static str,
    source: &S,
    selector: &StreamSelector,
    from: SequenceNumber,
    limit: BatchSize,
) -> Result<EventBatch, ContractTestFailure> {
    match source.load(selector, from, limit).await {
        Ok(LoadOutcome::Found(batch)) => Ok(batch),
        Ok(LoadOutcome::NotFound) => Err(ContractTestFailure::assertion(
            scenario,
            format!("expected {selector} to be found after appending to it"),
        )),
        Err(error) => Err(ContractTestFailure::source_error(scenario, "load", &error)),
    }
}

fn labels_of(batch: &EventBatch) -> Vec<String> {
    batch
        .envelopes()
        .iter()
        .filter_map(|envelope| {
            envelope
                .domain_event()
                .downcast_ref::<ContractTestEvent>()
                .map(|event| event.label().to_owned())
        })
        .collect()
}

fn sequence_numbers_of(batch: &EventBatch) -> Vec<SequenceNumber> {
    batch
        .envelopes()
        .iter()
        .map(|envelope| envelope.sequence_number())
        .collect()
}

pub async fn test_first_reservation_starts_from_nothing<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: ProgressStore,
{
    const SCENARIO: &str = "first_reservation_starts_from_nothing";

    let store = make_store();
    let listener = contract_listener(SCENARIO)?;

    let applied = store
        .reserve(&listener)
        .await
        .map_err(|error| ContractTestFailure::progress_error(SCENARIO, "reserve", &error))?;
    store.release(&listener).await;

    if !applied.is_none() {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("expected a fresh listener to start at 0 but got {applied}"),
        ));
    }

    Ok(())
}

pub async fn test_second_reservation_conflicts<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: ProgressStore,
{
    const SCENARIO: &str = "second_reservation_conflicts";

    let store = make_store();
    let listener = contract_listener(SCENARIO)?;

    let _ = store
        .reserve(&listener)
        .await
        .map_err(|error| ContractTestFailure::progress_error(SCENARIO, "reserve", &error))?;

    let second = store.reserve(&listener).await;
    store.release(&listener).await;

    match second {
        Err(ProgressStoreError::ReservationConflict { listener: reported }) if reported == listener => {}
        Err(error) => {
            return Err(ContractTestFailure::assertion(
                SCENARIO,
                format!("expected ReservationConflict for {listener} but got {error}"),
            ));
        }
        Ok(applied) => {
            return Err(ContractTestFailure::assertion(
                SCENARIO,
                format!("second reservation succeeded at {applied} while the first was held"),
            ));
        }
    }

    let _ = store.reserve(&listener).await.map_err(|error| {
        ContractTestFailure::progress_error(SCENARIO, "reserve after release", &error)
    })?;
    store.release(&listener).await;

    Ok(())
}

pub async fn test_saved_progress_survives_release<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: ProgressStore,
{
    const SCENARIO: &str = "saved_progress_survives_release";

    let store = make_store();
    let listener = contract_listener(SCENARIO)?;
    let saved = SequenceNumber::new(5);

    let _ = store
        .reserve(&listener)
        .await
        .map_err(|error| ContractTestFailure::progress_error(SCENARIO, "reserve", &error))?;
    let save = store.save(&listener, saved).await;
    store.release(&listener).await;
    save.map_err(|error| ContractTestFailure::progress_error(SCENARIO, "save", &error))?;

    let current = store
        .current(&listener)
        .await
        .map_err(|error| ContractTestFailure::progress_error(SCENARIO, "current", &error))?;
    if current != saved {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("expected current to report {saved} after release but got {current}"),
        ));
    }

    let reserved = store
        .reserve(&listener)
        .await
        .map_err(|error| ContractTestFailure::progress_error(SCENARIO, "reserve again", &error))?;
    store.release(&listener).await;
    if reserved != saved {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("expected the next reservation to start at {saved} but got {reserved}"),
        ));
    }

    Ok(())
}

pub async fn test_save_never_regresses<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: ProgressStore,
{
    const SCENARIO: &str = "save_never_regresses";

    let store = make_store();
    let listener = contract_listener(SCENARIO)?;

    let _ = store
        .reserve(&listener)
        .await
        .map_err(|error| ContractTestFailure::progress_error(SCENARIO, "reserve", &error))?;
    let saves = async {
        store.save(&listener, SequenceNumber::new(7)).await?;
        store.save(&listener, SequenceNumber::new(3)).await
    }
    .await;
    store.release(&listener).await;
    saves.map_err(|error| ContractTestFailure::progress_error(SCENARIO, "save", &error))?;

    let current = store
        .current(&listener)
        .await
        .map_err(|error| ContractTestFailure::progress_error(SCENARIO, "current", &error))?;
    if current != SequenceNumber::new(7) {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("saving a lower value moved progress from 7 to {current}"),
        ));
    }

    Ok(())
}

pub async fn test_save_requires_reservation<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: ProgressStore,
{
    const SCENARIO: &str = "save_requires_reservation";

    let store = make_store();
    let listener = contract_listener(SCENARIO)?;

    match store.save(&listener, SequenceNumber::new(1)).await {
        Err(ProgressStoreError::NotReserved { .. }) => {}
        Err(error) => {
            return Err(ContractTestFailure::assertion(
                SCENARIO,
                format!("expected NotReserved but got {error}"),
            ));
        }
        Ok(()) => {
            return Err(ContractTestFailure::assertion(
                SCENARIO,
                "save succeeded without holding the reservation",
            ));
        }
    }

    let current = store
        .current(&listener)
        .await
        .map_err(|error| ContractTestFailure::progress_error(SCENARIO, "current", &error))?;
    if !current.is_none() {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("rejected save still moved progress to {current}"),
        ));
    }

    Ok(())
}

pub async fn test_release_is_idempotent<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: ProgressStore,
{
    const SCENARIO: &str = "release_is_idempotent";

    let store = make_store();
    let listener = contract_listener(SCENARIO)?;

    store.release(&listener).await;
    let _ = store
        .reserve(&listener)
        .await
        .map_err(|error| ContractTestFailure::progress_error(SCENARIO, "reserve", &error))?;
    store.release(&listener).await;
    store.release(&listener).await;

    let _ = store.reserve(&listener).await.map_err(|error| {
        ContractTestFailure::progress_error(SCENARIO, "reserve after double release", &error)
    })?;
    store.release(&listener).await;

    Ok(())
}

pub async fn test_abandoned_reservation_becomes_available<F, S>(
    make_store: F,
) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: ProgressStore,
{
    const SCENARIO: &str = "abandoned_reservation_becomes_available";
    const ATTEMPTS: usize = 100;

    let store = make_store();
    let listener = contract_listener(SCENARIO)?;

    let _ = store
        .reserve(&listener)
        .await
        .map_err(|error| ContractTestFailure::progress_error(SCENARIO, "reserve", &error))?;
    store.abandon(&listener);
    store.abandon(&listener);

    // Remote stores may let the reservation lapse asynchronously.
    for _ in 0..ATTEMPTS {
        match store.reserve(&listener).await {
            Ok(_) => {
                store.release(&listener).await;
                return Ok(());
            }
            Err(ProgressStoreError::ReservationConflict { .. }) => {
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            }
            Err(error) => {
                return Err(ContractTestFailure::progress_error(
                    SCENARIO,
                    "reserve after abandon",
                    &error,
                ))
            }
        }
    }

    Err(ContractTestFailure::assertion(
        SCENARIO,
        "abandoned reservation never became available again",
    ))
}

pub async fn test_reset_rewinds_progress<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: ProgressStore,
{
    const SCENARIO: &str = "reset_rewinds_progress";

    let store = make_store();
    let listener = contract_listener(SCENARIO)?;

    let _ = store
        .reserve(&listener)
        .await
        .map_err(|error| ContractTestFailure::progress_error(SCENARIO, "reserve", &error))?;
    let rewound = async {
        store.save(&listener, SequenceNumber::new(4)).await?;
        store.reset(&listener).await
    }
    .await;
    store.release(&listener).await;
    rewound.map_err(|error| ContractTestFailure::progress_error(SCENARIO, "reset", &error))?;

    let current = store
        .current(&listener)
        .await
        .map_err(|error| ContractTestFailure::progress_error(SCENARIO, "current", &error))?;
    if !current.is_none() {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("expected reset to rewind progress to 0 but got {current}"),
        ));
    }

    match store.reset(&listener).await {
        Err(ProgressStoreError::NotReserved { .. }) => Ok(()),
        Err(error) => Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("expected NotReserved for an unreserved reset but got {error}"),
        )),
        Ok(()) => Err(ContractTestFailure::assertion(
            SCENARIO,
            "reset succeeded without holding the reservation",
        )),
    }
}

pub async fn test_current_does_not_reserve<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: ProgressStore,
{
    const SCENARIO: &str = "current_does_not_reserve";

    let store = make_store();
    let listener = contract_listener(SCENARIO)?;

    let _ = store
        .current(&listener)
        .await
        .map_err(|error| ContractTestFailure::progress_error(SCENARIO, "current", &error))?;

    let _ = store.reserve(&listener).await.map_err(|error| {
        ContractTestFailure::progress_error(SCENARIO, "reserve after current", &error)
    })?;
    store.release(&listener).await;

    Ok(())
}

pub async fn test_unknown_selector_is_not_found<F, S>(make_source: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: StreamSource + EventAppender,
{
    const SCENARIO: &str = "unknown_selector_is_not_found";

    let source = make_source();
    let run = Uuid::now_v7();
    let stream = contract_stream(SCENARIO, &run, "missing")?;
    let prefix = StreamPrefix::try_new(format!("contract-{SCENARIO}-{run}")).map_err(|error| {
        ContractTestFailure::assertion(SCENARIO, format!("invalid stream prefix: {error}"))
    })?;
    let limit = batch_size(SCENARIO, 10)?;

    for selector in [StreamSelector::Named(stream), StreamSelector::Category(prefix)] {
        match source.load(&selector, SequenceNumber::new(1), limit).await {
            Ok(LoadOutcome::NotFound) => {}
            Ok(LoadOutcome::Found(batch)) => {
                return Err(ContractTestFailure::assertion(
                    SCENARIO,
                    format!(
                        "expected {selector} to be NotFound but got {} envelopes",
                        batch.len()
                    ),
                ));
            }
            Err(error) => return Err(ContractTestFailure::source_error(SCENARIO, "load", &error)),
        }
    }

    Ok(())
}

pub async fn test_append_assigns_ascending_sequence_numbers<F, S>(
    make_source: F,
) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: StreamSource + EventAppender,
{
    const SCENARIO: &str = "append_assigns_ascending_sequence_numbers";

    let source = make_source();
    let stream = contract_stream(SCENARIO, &Uuid::now_v7(), "ledger")?;

    let first = append(SCENARIO, &source, &stream, contract_events(&["a", "b"])).await?;
    let second = append(SCENARIO, &source, &stream, contract_events(&["c"])).await?;
    let assigned: Vec<SequenceNumber> = first.into_iter().chain(second).collect();

    if assigned.len() != 3 {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("expected 3 assigned sequence numbers but got {}", assigned.len()),
        ));
    }
    if assigned.iter().any(|number| number.is_none()) {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            "sequence numbers start at 1, but 0 was assigned",
        ));
    }
    if !assigned.windows(2).all(|pair| pair[0] < pair[1]) {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("expected strictly ascending sequence numbers but got {assigned:?}"),
        ));
    }

    Ok(())
}

pub async fn test_named_load_returns_stream_in_order<F, S>(make_source: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: StreamSource + EventAppender,
{
    const SCENARIO: &str = "named_load_returns_stream_in_order";

    let source = make_source();
    let run = Uuid::now_v7();
    let stream_a = contract_stream(SCENARIO, &run, "a")?;
    let stream_b = contract_stream(SCENARIO, &run, "b")?;

    let mut assigned = append(SCENARIO, &source, &stream_a, contract_events(&["a1", "a2"])).await?;
    let _ = append(SCENARIO, &source, &stream_b, contract_events(&["b1"])).await?;
    assigned.extend(append(SCENARIO, &source, &stream_a, contract_events(&["a3"])).await?);

    let selector = StreamSelector::Named(stream_a.clone());
    let batch = load_found(
        SCENARIO,
        &source,
        &selector,
        SequenceNumber::new(1),
        batch_size(SCENARIO, 100)?,
    )
    .await?;

    if labels_of(&batch) != ["a1", "a2", "a3"] {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("expected [a1, a2, a3] from {selector} but got {:?}", labels_of(&batch)),
        ));
    }
    if sequence_numbers_of(&batch) != assigned {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!(
                "loaded sequence numbers {:?} differ from assigned {assigned:?}",
                sequence_numbers_of(&batch)
            ),
        ));
    }
    if batch
        .envelopes()
        .iter()
        .any(|envelope| envelope.raw_event().stream_name() != &stream_a)
    {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("{selector} returned an event from another stream"),
        ));
    }
    if assigned.last() != Some(&batch.head()) {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("expected head {:?} but got {}", assigned.last(), batch.head()),
        ));
    }

    Ok(())
}

pub async fn test_load_starts_at_position<F, S>(make_source: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: StreamSource + EventAppender,
{
    const SCENARIO: &str = "load_starts_at_position";

    let source = make_source();
    let stream = contract_stream(SCENARIO, &Uuid::now_v7(), "ledger")?;
    let assigned = append(SCENARIO, &source, &stream, contract_events(&["a", "b", "c"])).await?;

    let batch = load_found(
        SCENARIO,
        &source,
        &StreamSelector::Named(stream),
        assigned[1],
        batch_size(SCENARIO, 100)?,
    )
    .await?;

    if labels_of(&batch) != ["b", "c"] {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!(
                "expected [b, c] when loading from {} but got {:?}",
                assigned[1],
                labels_of(&batch)
            ),
        ));
    }

    Ok(())
}

pub async fn test_limit_bounds_page_not_head<F, S>(make_source: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: StreamSource + EventAppender,
{
    const SCENARIO: &str = "limit_bounds_page_not_head";

    let source = make_source();
    let stream = contract_stream(SCENARIO, &Uuid::now_v7(), "ledger")?;
    let assigned = append(
        SCENARIO,
        &source,
        &stream,
        contract_events(&["a", "b", "c", "d", "e"]),
    )
    .await?;

    let selector = StreamSelector::Named(stream);
    let first_page = load_found(
        SCENARIO,
        &source,
        &selector,
        SequenceNumber::new(1),
        batch_size(SCENARIO, 2)?,
    )
    .await?;

    if labels_of(&first_page) != ["a", "b"] {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("expected first page [a, b] but got {:?}", labels_of(&first_page)),
        ));
    }
    if Some(&first_page.head()) != assigned.last() {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!(
                "expected head {:?} beyond the page but got {}",
                assigned.last(),
                first_page.head()
            ),
        ));
    }

    let second_page = load_found(
        SCENARIO,
        &source,
        &selector,
        assigned[1].next(),
        batch_size(SCENARIO, 2)?,
    )
    .await?;
    if labels_of(&second_page) != ["c", "d"] {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("expected second page [c, d] but got {:?}", labels_of(&second_page)),
        ));
    }

    Ok(())
}

pub async fn test_category_selects_by_prefix<F, S>(make_source: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: StreamSource + EventAppender,
{
    const SCENARIO: &str = "category_selects_by_prefix";

    let source = make_source();
    let run = Uuid::now_v7();
    let invoices = contract_stream(SCENARIO, &run, "invoice-1")?;
    let more_invoices = contract_stream(SCENARIO, &run, "invoice-2")?;
    let payments = contract_stream(SCENARIO, &run, "payment-1")?;
    let prefix =
        StreamPrefix::try_new(format!("contract-{SCENARIO}-{run}-invoice")).map_err(|error| {
            ContractTestFailure::assertion(SCENARIO, format!("invalid stream prefix: {error}"))
        })?;

    let _ = append(SCENARIO, &source, &invoices, contract_events(&["i1"])).await?;
    let _ = append(SCENARIO, &source, &payments, contract_events(&["p1"])).await?;
    let _ = append(SCENARIO, &source, &more_invoices, contract_events(&["i2"])).await?;

    let batch = load_found(
        SCENARIO,
        &source,
        &StreamSelector::Category(prefix),
        SequenceNumber::new(1),
        batch_size(SCENARIO, 100)?,
    )
    .await?;

    if labels_of(&batch) != ["i1", "i2"] {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!(
                "expected [i1, i2] from the invoice category but got {:?}",
                labels_of(&batch)
            ),
        ));
    }

    Ok(())
}

pub async fn test_all_selector_sees_every_stream<F, S>(make_source: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: StreamSource + EventAppender,
{
    const SCENARIO: &str = "all_selector_sees_every_stream";

    let source = make_source();
    let run = Uuid::now_v7();
    let first = contract_stream(SCENARIO, &run, "first")?;
    let second = contract_stream(SCENARIO, &run, "second")?;

    let mut assigned = append(SCENARIO, &source, &first, contract_events(&["x"])).await?;
    assigned.extend(append(SCENARIO, &source, &second, contract_events(&["y"])).await?);

    let batch = load_found(
        SCENARIO,
        &source,
        &StreamSelector::All,
        assigned[0],
        batch_size(SCENARIO, 1000)?,
    )
    .await?;

    let ours: Vec<String> = batch
        .envelopes()
        .iter()
        .filter(|envelope| {
            let stream = envelope.raw_event().stream_name();
            stream == &first || stream == &second
        })
        .filter_map(|envelope| {
            envelope
                .domain_event()
                .downcast_ref::<ContractTestEvent>()
                .map(|event| event.label().to_owned())
        })
        .collect();

    if ours != ["x", "y"] {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("expected [x, y] across both streams but got {ours:?}"),
        ));
    }
    if batch.head() < assigned[1] {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("head {} is behind the last append {}", batch.head(), assigned[1]),
        ));
    }

    Ok(())
}

pub async fn test_decorator_metadata_is_stored<F, S>(make_source: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: StreamSource + EventAppender,
{
    const SCENARIO: &str = "decorator_metadata_is_stored";

    let source = make_source();
    let stream = contract_stream(SCENARIO, &Uuid::now_v7(), "ledger")?;
    let correlation = format!("correlation-{}", Uuid::now_v7());

    let event: Arc<dyn DomainEvent> = Arc::new(ContractTestEvent::new("decorated"));
    let decorated = EventWithCorrelationIdentifier::new(event, correlation.clone())
        .map_err(|error| ContractTestFailure::assertion(SCENARIO, error.to_string()))?;
    let decorated: Arc<dyn DomainEvent> = Arc::new(decorated);
    let plain: Arc<dyn DomainEvent> = Arc::new(OtherContractEvent::new("plain"));

    let _ = append(SCENARIO, &source, &stream, vec![decorated, plain]).await?;

    let batch = load_found(
        SCENARIO,
        &source,
        &StreamSelector::Named(stream),
        SequenceNumber::new(1),
        batch_size(SCENARIO, 10)?,
    )
    .await?;

    let [first, second] = batch.envelopes() else {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("expected 2 envelopes but got {}", batch.len()),
        ));
    };

    if !first.domain_event().is::<ContractTestEvent>() {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!(
                "expected the stored event to decode undecorated but got {:?}",
                first.domain_event()
            ),
        ));
    }
    if first.raw_event().metadata().get("correlationIdentifier") != Some(&Value::String(correlation))
    {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!(
                "correlation identifier missing from stored metadata {:?}",
                first.raw_event().metadata()
            ),
        ));
    }
    if !second.raw_event().metadata().is_empty() {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!(
                "undecorated event picked up metadata {:?}",
                second.raw_event().metadata()
            ),
        ));
    }
    if !second.domain_event().is::<OtherContractEvent>() {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            "second event decoded as the wrong type",
        ));
    }

    Ok(())
}

#[macro_export]
macro_rules! progress_store_contract_tests {
    (suite = $suite:ident, make_store = $make_store:expr $(,)?) => {
        #[allow(non_snake_case)]
        mod $suite {
            use $crate::contract::{
                test_abandoned_reservation_becomes_available,
                test_current_does_not_reserve, test_first_reservation_starts_from_nothing,
                test_release_is_idempotent, test_reset_rewinds_progress,
                test_save_never_regresses, test_save_requires_reservation,
                test_saved_progress_survives_release, test_second_reservation_conflicts,
            };

            #[tokio::test(flavor = "multi_thread")]
            async fn first_reservation_starts_from_nothing_contract() {
                test_first_reservation_starts_from_nothing($make_store)
                    .await
                    .expect("progress store contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn second_reservation_conflicts_contract() {
                test_second_reservation_conflicts($make_store)
                    .await
                    .expect("progress store contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn saved_progress_survives_release_contract() {
                test_saved_progress_survives_release($make_store)
                    .await
                    .expect("progress store contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn save_never_regresses_contract() {
                test_save_never_regresses($make_store)
                    .await
                    .expect("progress store contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn save_requires_reservation_contract() {
                test_save_requires_reservation($make_store)
                    .await
                    .expect("progress store contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn release_is_idempotent_contract() {
                test_release_is_idempotent($make_store)
                    .await
                    .expect("progress store contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn reset_rewinds_progress_contract() {
                test_reset_rewinds_progress($make_store)
                    .await
                    .expect("progress store contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn current_does_not_reserve_contract() {
                test_current_does_not_reserve($make_store)
                    .await
                    .expect("progress store contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn abandoned_reservation_becomes_available_contract() {
                test_abandoned_reservation_becomes_available($make_store)
                    .await
                    .expect("progress store contract failed");
            }
        }
    };
}

pub use progress_store_contract_tests;

#[macro_export]
macro_rules! stream_source_contract_tests {
    (suite = $suite:ident, make_source = $make_source:expr $(,)?) => {
        #[allow(non_snake_case)]
        mod $suite {
            use $crate::contract::{
                test_all_selector_sees_every_stream,
                test_append_assigns_ascending_sequence_numbers, test_category_selects_by_prefix,
                test_decorator_metadata_is_stored, test_limit_bounds_page_not_head,
                test_load_starts_at_position, test_named_load_returns_stream_in_order,
                test_unknown_selector_is_not_found,
            };

            #[tokio::test(flavor = "multi_thread")]
            async fn unknown_selector_is_not_found_contract() {
                test_unknown_selector_is_not_found($make_source)
                    .await
                    .expect("stream source contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn append_assigns_ascending_sequence_numbers_contract() {
                test_append_assigns_ascending_sequence_numbers($make_source)
                    .await
                    .expect("stream source contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn named_load_returns_stream_in_order_contract() {
                test_named_load_returns_stream_in_order($make_source)
                    .await
                    .expect("stream source contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn load_starts_at_position_contract() {
                test_load_starts_at_position($make_source)
                    .await
                    .expect("stream source contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn limit_bounds_page_not_head_contract() {
                test_limit_bounds_page_not_head($make_source)
                    .await
                    .expect("stream source contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn category_selects_by_prefix_contract() {
                test_category_selects_by_prefix($make_source)
                    .await
                    .expect("stream source contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn all_selector_sees_every_stream_contract() {
                test_all_selector_sees_every_stream($make_source)
                    .await
                    .expect("stream source contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn decorator_metadata_is_stored_contract() {
                test_decorator_metadata_is_stored($make_source)
                    .await
                    .expect("stream source contract failed");
            }
        }
    };
}

pub use stream_source_contract_tests;

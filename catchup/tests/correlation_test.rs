//! Correlation identifiers attached at write time reach listeners at catch-up.

use std::sync::Arc;

use catchup::metadata::CORRELATION_IDENTIFIER;
use catchup::{
    CatchUpInvoker, DecoratorError, DomainEvent, EventAppender, EventListener,
    EventWithCausationIdentifier, EventWithCorrelationIdentifier, HandlerError, HandlerRegistry,
    RawEvent, StreamName,
};
use catchup_memory::{InMemoryProgressStore, InMemoryStreamSource};
use catchup_testing::contract::{contract_normalizer, ContractTestEvent};

/// Collects the correlation identifier of every event it handles.
#[derive(Default)]
struct CorrelationLog {
    seen: Vec<Option<String>>,
}

impl CorrelationLog {
    fn when_contract_test_event(
        &mut self,
        _event: &ContractTestEvent,
        raw: &RawEvent,
    ) -> Result<(), HandlerError> {
        let correlation = raw
            .metadata()
            .get(CORRELATION_IDENTIFIER)
            .and_then(|value| value.as_str())
            .map(str::to_owned);
        self.seen.push(correlation);
        Ok(())
    }
}

impl EventListener for CorrelationLog {
    fn handlers(&self) -> HandlerRegistry<Self> {
        HandlerRegistry::new().on(Self::when_contract_test_event)
    }
}

fn event(label: &str) -> Arc<dyn DomainEvent> {
    Arc::new(ContractTestEvent::new(label))
}

#[tokio::test]
async fn listener_sees_the_correlation_identifier_of_each_event() {
    // Given: one correlated event, one correlated and caused event, one plain event
    let source = InMemoryStreamSource::new(contract_normalizer());
    let correlated: Arc<dyn DomainEvent> = Arc::new(
        EventWithCorrelationIdentifier::new(event("opened"), "req-1").expect("valid identifier"),
    );
    let caused: Arc<dyn DomainEvent> = Arc::new(
        EventWithCausationIdentifier::new(event("paid"), "cmd-9").expect("valid identifier"),
    );
    let caused_and_correlated: Arc<dyn DomainEvent> = Arc::new(
        EventWithCorrelationIdentifier::new(caused, "req-2").expect("valid identifier"),
    );
    let _ = source
        .append(
            &StreamName::try_new("invoice-1").expect("valid stream name"),
            vec![correlated, caused_and_correlated, event("closed")],
        )
        .await
        .expect("append succeeds");

    // When: a listener catches up
    let invoker = CatchUpInvoker::new(InMemoryProgressStore::new(), source);
    let mut log = CorrelationLog::default();
    let summary = invoker.catch_up(&mut log).await.expect("catch-up succeeds");

    // Then: each handler call observed the identifier written with its event
    assert_eq!(summary.applied, 3);
    assert_eq!(
        log.seen,
        vec![Some("req-1".to_owned()), Some("req-2".to_owned()), None]
    );
}

#[test]
fn invalid_correlation_identifier_creates_no_decorator() {
    let result = EventWithCorrelationIdentifier::new(event("opened"), String::new());

    assert!(matches!(
        result,
        Err(DecoratorError::InvalidArgument {
            key: CORRELATION_IDENTIFIER,
            ..
        })
    ));
}

#[test]
fn default_listener_identity_is_the_type_path() {
    let log = CorrelationLog::default();

    assert!(log.listener_id().to_string().ends_with("CorrelationLog"));
}

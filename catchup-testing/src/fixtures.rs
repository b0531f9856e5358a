//! Listener fixture for exercising the catch-up invoker.
//!
//! [`RecordingListener`] handles [`ContractTestEvent`] and nothing else, keeps
//! a journal of every hook and handler call, and can be told to fail on a
//! given sequence number.
//!
//! ```ignore
//! let mut listener = RecordingListener::new("billing-totals").failing_at(SequenceNumber::new(3));
//! let result = invoker.catch_up(&mut listener).await;
//!
//! assert_eq!(listener.applied(), &[SequenceNumber::new(1), SequenceNumber::new(2)]);
//! ```

use catchup::{
    AfterInvoke, BeforeInvoke, EventListener, HandlerError, HandlerRegistry, Resettable,
    StreamAware,
};
use catchup_types::{EventEnvelope, ListenerId, RawEvent, SequenceNumber, StreamSelector};

use crate::contract::ContractTestEvent;

/// Listener that records what the invoker asked of it.
#[derive(Debug, Clone)]
pub struct RecordingListener {
    listener_id: ListenerId,
    selector: Option<StreamSelector>,
    fail_at: Option<SequenceNumber>,
    applied: Vec<SequenceNumber>,
    labels: Vec<String>,
    journal: Vec<String>,
    resets: usize,
}

impl RecordingListener {
    /// Create a listener consuming every stream.
    ///
    /// # Panics
    ///
    /// Panics if `listener_id` is blank.
    pub fn new(listener_id: &str) -> Self {
        Self {
            listener_id: ListenerId::try_new(listener_id).expect("fixture listener id is not blank"),
            selector: None,
            fail_at: None,
            applied: Vec::new(),
            labels: Vec::new(),
            journal: Vec::new(),
            resets: 0,
        }
    }

    /// Make the listener stream-aware.
    #[must_use]
    pub fn listening_to(mut self, selector: StreamSelector) -> Self {
        self.selector = Some(selector);
        self
    }

    /// Make the handler fail on the event with this sequence number.
    #[must_use]
    pub const fn failing_at(mut self, sequence_number: SequenceNumber) -> Self {
        self.fail_at = Some(sequence_number);
        self
    }

    /// Stop failing, as after a fix is deployed.
    pub fn heal(&mut self) {
        self.fail_at = None;
    }

    /// Sequence numbers the handler applied, in order.
    pub fn applied(&self) -> &[SequenceNumber] {
        &self.applied
    }

    /// Labels of the applied events, in order.
    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    /// Every hook and handler call as `before:N`, `handle:N` or `after:N`.
    pub fn journal(&self) -> &[String] {
        &self.journal
    }

    /// How many times the listener's state was reset.
    pub const fn resets(&self) -> usize {
        self.resets
    }

    fn when_contract_test_event(
        &mut self,
        event: &ContractTestEvent,
        raw: &RawEvent,
    ) -> Result<(), HandlerError> {
        let sequence_number = raw.sequence_number();
        self.journal.push(format!("handle:{sequence_number}"));
        if self.fail_at == Some(sequence_number) {
            return Err(format!("refusing event {sequence_number}").into());
        }
        self.applied.push(sequence_number);
        self.labels.push(event.label().to_owned());
        Ok(())
    }
}

impl EventListener for RecordingListener {
    fn listener_id(&self) -> ListenerId {
        self.listener_id.clone()
    }

    fn handlers(&self) -> HandlerRegistry<Self> {
        HandlerRegistry::new().on(Self::when_contract_test_event)
    }

    fn as_stream_aware(&self) -> Option<&dyn StreamAware> {
        self.selector.as_ref().map(|_| -> &dyn StreamAware { self })
    }

    fn as_before_invoke(&mut self) -> Option<&mut dyn BeforeInvoke> {
        Some(self)
    }

    fn as_after_invoke(&mut self) -> Option<&mut dyn AfterInvoke> {
        Some(self)
    }

    fn as_resettable(&mut self) -> Option<&mut dyn Resettable> {
        Some(self)
    }
}

impl StreamAware for RecordingListener {
    fn listens_to(&self) -> StreamSelector {
        self.selector.clone().unwrap_or(StreamSelector::All)
    }
}

impl BeforeInvoke for RecordingListener {
    fn before_invoke(&mut self, envelope: &EventEnvelope) {
        self.journal
            .push(format!("before:{}", envelope.sequence_number()));
    }
}

impl AfterInvoke for RecordingListener {
    fn after_invoke(&mut self, envelope: &EventEnvelope) {
        self.journal
            .push(format!("after:{}", envelope.sequence_number()));
    }
}

impl Resettable for RecordingListener {
    fn reset(&mut self) -> Result<(), HandlerError> {
        self.applied.clear();
        self.labels.clear();
        self.resets += 1;
        Ok(())
    }
}

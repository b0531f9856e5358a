use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use catchup_types::{
    ListenerId, Operation, ProgressStore, ProgressStoreError, ReservationPolicy, SequenceNumber,
};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

#[derive(Debug, Clone, Copy)]
struct Slot {
    applied: SequenceNumber,
    reserved: bool,
}

impl Default for Slot {
    fn default() -> Self {
        Self {
            applied: SequenceNumber::none(),
            reserved: false,
        }
    }
}

#[derive(Debug, Default)]
struct Shared {
    slots: Mutex<HashMap<ListenerId, Slot>>,
    released: Notify,
}

/// Progress store keeping applied sequence numbers and reservations in memory.
///
/// Reservations follow the configured [`ReservationPolicy`]: fail fast by
/// default, or wait for a release up to a timeout.
///
/// # Example
///
/// ```ignore
/// let progress = InMemoryProgressStore::new()
///     .with_reservation_policy(ReservationPolicy::Wait { timeout: Duration::from_secs(5) });
/// let invoker = CatchUpInvoker::new(progress.clone(), source);
/// ```
#[derive(Debug, Clone, Default)]
pub struct InMemoryProgressStore {
    shared: Arc<Shared>,
    policy: ReservationPolicy,
}

impl InMemoryProgressStore {
    /// Create an empty store with the fail-fast reservation policy.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the reservation policy.
    #[must_use]
    pub fn with_reservation_policy(mut self, policy: ReservationPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Whether a catch-up run currently holds the listener's reservation.
    pub fn is_reserved(&self, listener: &ListenerId) -> bool {
        self.shared
            .slots
            .lock()
            .ok()
            .and_then(|slots| slots.get(listener).map(|slot| slot.reserved))
            .unwrap_or(false)
    }

    fn try_reserve(
        &self,
        listener: &ListenerId,
    ) -> Result<Option<SequenceNumber>, ProgressStoreError> {
        let mut slots = self.lock(Operation::Reserve)?;
        let slot = slots.entry(listener.clone()).or_default();
        if slot.reserved {
            return Ok(None);
        }
        slot.reserved = true;
        Ok(Some(slot.applied))
    }

    fn clear_reservation(&self, listener: &ListenerId) {
        if let Ok(mut slots) = self.shared.slots.lock() {
            if let Some(slot) = slots.get_mut(listener) {
                slot.reserved = false;
            }
        }
        self.shared.released.notify_waiters();
    }

    fn lock(
        &self,
        operation: Operation,
    ) -> Result<MutexGuard<'_, HashMap<ListenerId, Slot>>, ProgressStoreError> {
        self.shared
            .slots
            .lock()
            .map_err(|_| ProgressStoreError::StoreFailure {
                operation,
                detail: "progress lock poisoned".to_owned(),
            })
    }
}

impl ProgressStore for InMemoryProgressStore {
    #[instrument(name = "memory.reserve", skip(self, listener), fields(listener = %listener))]
    async fn reserve(&self, listener: &ListenerId) -> Result<SequenceNumber, ProgressStoreError> {
        let deadline = match self.policy {
            ReservationPolicy::FailFast => None,
            ReservationPolicy::Wait { timeout } => Some((Instant::now() + timeout, timeout)),
        };

        loop {
            // Created before the check so a release in between still wakes us.
            let released = self.shared.released.notified();

            if let Some(applied) = self.try_reserve(listener)? {
                debug!(applied = %applied, "[memory.reserve] reservation taken");
                return Ok(applied);
            }

            let Some((deadline, timeout)) = deadline else {
                warn!("[memory.reserve] listener already reserved");
                return Err(ProgressStoreError::ReservationConflict {
                    listener: listener.clone(),
                });
            };

            if tokio::time::timeout_at(deadline, released).await.is_err() {
                warn!(?timeout, "[memory.reserve] timed out waiting for reservation");
                return Err(ProgressStoreError::ReservationTimeout {
                    listener: listener.clone(),
                    timeout,
                });
            }
        }
    }

    #[instrument(name = "memory.save", skip(self, listener), fields(listener = %listener))]
    async fn save(
        &self,
        listener: &ListenerId,
        sequence_number: SequenceNumber,
    ) -> Result<(), ProgressStoreError> {
        let mut slots = self.lock(Operation::Save)?;
        let slot = slots
            .get_mut(listener)
            .filter(|slot| slot.reserved)
            .ok_or_else(|| ProgressStoreError::NotReserved {
                listener: listener.clone(),
                operation: Operation::Save,
            })?;

        if sequence_number > slot.applied {
            slot.applied = sequence_number;
        }
        Ok(())
    }

    #[instrument(name = "memory.release", skip(self, listener), fields(listener = %listener))]
    async fn release(&self, listener: &ListenerId) {
        self.clear_reservation(listener);
    }

    fn abandon(&self, listener: &ListenerId) {
        self.clear_reservation(listener);
    }

    async fn current(&self, listener: &ListenerId) -> Result<SequenceNumber, ProgressStoreError> {
        let slots = self.lock(Operation::Current)?;
        Ok(slots
            .get(listener)
            .map_or_else(SequenceNumber::none, |slot| slot.applied))
    }

    #[instrument(name = "memory.reset", skip(self, listener), fields(listener = %listener))]
    async fn reset(&self, listener: &ListenerId) -> Result<(), ProgressStoreError> {
        let mut slots = self.lock(Operation::Reset)?;
        let slot = slots
            .get_mut(listener)
            .filter(|slot| slot.reserved)
            .ok_or_else(|| ProgressStoreError::NotReserved {
                listener: listener.clone(),
                operation: Operation::Reset,
            })?;
        slot.applied = SequenceNumber::none();
        Ok(())
    }
}

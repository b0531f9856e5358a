use std::collections::HashMap;
use std::sync::{Arc, MutexGuard, PoisonError};

use catchup_types::{
    ListenerId, Operation, ProgressStore, ProgressStoreError, ReservationPolicy, SequenceNumber,
};
use sqlx::{query, ConnectOptions, Connection, PgConnection, Pool, Postgres, Row};
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use crate::{describe_sqlx_error, is_lock_timeout};

type Reservation = Arc<Mutex<PgConnection>>;
type Reservations = HashMap<ListenerId, Reservation>;

/// Progress store backed by `catchup_listener_progress` and advisory locks.
///
/// Each reservation holds its own connection, opened with the pool's connect
/// options, for as long as the reservation lasts. Progress writes made under
/// the reservation go through that connection and commit immediately.
/// Dropping that connection ends the session, which is how an abandoned
/// reservation lapses.
#[derive(Debug, Clone)]
pub struct PostgresProgressStore {
    pool: Pool<Postgres>,
    policy: ReservationPolicy,
    reservations: Arc<std::sync::Mutex<Reservations>>,
}

impl PostgresProgressStore {
    /// Use an existing pool with the fail-fast reservation policy.
    pub fn from_pool(pool: Pool<Postgres>) -> Self {
        Self {
            pool,
            policy: ReservationPolicy::default(),
            reservations: Arc::new(std::sync::Mutex::new(HashMap::new())),
        }
    }

    /// Replace the reservation policy.
    #[must_use]
    pub const fn with_reservation_policy(mut self, policy: ReservationPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// The pool used for reads outside a reservation.
    pub const fn pool(&self) -> &Pool<Postgres> {
        &self.pool
    }

    /// Whether this store instance currently holds the listener's reservation.
    pub fn is_reserved(&self, listener: &ListenerId) -> bool {
        self.reservations().contains_key(listener)
    }

    // The map is only touched between awaits, so a poisoned lock still
    // holds a consistent map.
    fn reservations(&self) -> MutexGuard<'_, Reservations> {
        self.reservations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn reservation(
        &self,
        listener: &ListenerId,
        operation: Operation,
    ) -> Result<Reservation, ProgressStoreError> {
        self.reservations()
            .get(listener)
            .cloned()
            .ok_or_else(|| ProgressStoreError::NotReserved {
                listener: listener.clone(),
                operation,
            })
    }

    /// Take the advisory lock on `connection` according to the policy.
    ///
    /// Returns `Ok(false)` when a fail-fast attempt finds the lock taken.
    async fn lock(
        &self,
        connection: &mut PgConnection,
        listener: &ListenerId,
    ) -> Result<bool, ProgressStoreError> {
        match self.policy {
            ReservationPolicy::FailFast => {
                let row = query("SELECT pg_try_advisory_lock(hashtextextended($1, 0)) AS acquired")
                    .bind(listener.as_ref())
                    .fetch_one(&mut *connection)
                    .await
                    .map_err(|error| store_failure(&error, Operation::Reserve))?;
                row.try_get::<bool, _>("acquired")
                    .map_err(|error| store_failure(&error, Operation::Reserve))
            }
            ReservationPolicy::Wait { timeout } => {
                let _ = query("SELECT set_config('lock_timeout', $1, false)")
                    .bind(format!("{}ms", timeout.as_millis().max(1)))
                    .execute(&mut *connection)
                    .await
                    .map_err(|error| store_failure(&error, Operation::Reserve))?;

                match query("SELECT pg_advisory_lock(hashtextextended($1, 0))")
                    .bind(listener.as_ref())
                    .execute(&mut *connection)
                    .await
                {
                    Ok(_) => Ok(true),
                    Err(error) if is_lock_timeout(&error) => {
                        warn!(?timeout, "[postgres.reserve] timed out waiting for reservation");
                        Err(ProgressStoreError::ReservationTimeout {
                            listener: listener.clone(),
                            timeout,
                        })
                    }
                    Err(error) => Err(store_failure(&error, Operation::Reserve)),
                }
            }
        }
    }

    async fn applied(
        connection: &mut PgConnection,
        listener: &ListenerId,
    ) -> Result<SequenceNumber, ProgressStoreError> {
        let _ = query(
            "INSERT INTO catchup_listener_progress (listener_id) VALUES ($1)
             ON CONFLICT (listener_id) DO NOTHING",
        )
        .bind(listener.as_ref())
        .execute(&mut *connection)
        .await
        .map_err(|error| store_failure(&error, Operation::Reserve))?;

        let row = query(
            "SELECT highest_sequence_number FROM catchup_listener_progress WHERE listener_id = $1",
        )
        .bind(listener.as_ref())
        .fetch_one(&mut *connection)
        .await
        .map_err(|error| store_failure(&error, Operation::Reserve))?;
        let highest: i64 = row
            .try_get("highest_sequence_number")
            .map_err(|error| store_failure(&error, Operation::Reserve))?;
        to_sequence_number(highest, Operation::Reserve)
    }
}

impl ProgressStore for PostgresProgressStore {
    #[instrument(name = "postgres.reserve", skip(self, listener), fields(listener = %listener))]
    async fn reserve(&self, listener: &ListenerId) -> Result<SequenceNumber, ProgressStoreError> {
        if self.is_reserved(listener) && self.policy == ReservationPolicy::FailFast {
            warn!("[postgres.reserve] listener already reserved by this store");
            return Err(ProgressStoreError::ReservationConflict {
                listener: listener.clone(),
            });
        }

        let mut connection = self
            .pool
            .connect_options()
            .connect()
            .await
            .map_err(|error| store_failure(&error, Operation::Reserve))?;

        if !self.lock(&mut connection, listener).await? {
            let _ = connection.close().await;
            warn!("[postgres.reserve] listener already reserved");
            return Err(ProgressStoreError::ReservationConflict {
                listener: listener.clone(),
            });
        }

        let applied = match Self::applied(&mut connection, listener).await {
            Ok(applied) => applied,
            Err(error) => {
                // Closing the session drops the advisory lock with it
                let _ = connection.close().await;
                return Err(error);
            }
        };

        let _ = self
            .reservations()
            .insert(listener.clone(), Arc::new(Mutex::new(connection)));
        debug!(applied = %applied, "[postgres.reserve] reservation taken");
        Ok(applied)
    }

    #[instrument(name = "postgres.save", skip(self, listener), fields(listener = %listener))]
    async fn save(
        &self,
        listener: &ListenerId,
        sequence_number: SequenceNumber,
    ) -> Result<(), ProgressStoreError> {
        let reservation = self.reservation(listener, Operation::Save)?;
        let mut connection = reservation.lock().await;

        let _ = query(
            "UPDATE catchup_listener_progress
             SET highest_sequence_number = $2, updated_at = now()
             WHERE listener_id = $1 AND highest_sequence_number < $2",
        )
        .bind(listener.as_ref())
        .bind(to_column(sequence_number, Operation::Save)?)
        .execute(&mut *connection)
        .await
        .map_err(|error| store_failure(&error, Operation::Save))?;
        Ok(())
    }

    #[instrument(name = "postgres.release", skip(self, listener), fields(listener = %listener))]
    async fn release(&self, listener: &ListenerId) {
        let removed = self.reservations().remove(listener);
        let Some(reservation) = removed else {
            return;
        };

        let mut connection = reservation.lock().await;
        if let Err(error) = query("SELECT pg_advisory_unlock(hashtextextended($1, 0))")
            .bind(listener.as_ref())
            .execute(&mut *connection)
            .await
        {
            warn!(
                error = %error,
                "[postgres.release] unlock failed; closing the session releases it"
            );
        }
        drop(connection);

        if let Ok(connection) = Arc::try_unwrap(reservation) {
            let _ = connection.into_inner().close().await;
        }
    }

    fn abandon(&self, listener: &ListenerId) {
        let removed = self.reservations().remove(listener);
        if removed.is_some() {
            warn!(
                listener = %listener,
                "[postgres.abandon] dropping reservation session without unlocking"
            );
        }
    }

    #[instrument(name = "postgres.current", skip(self, listener), fields(listener = %listener))]
    async fn current(&self, listener: &ListenerId) -> Result<SequenceNumber, ProgressStoreError> {
        let row = query(
            "SELECT highest_sequence_number FROM catchup_listener_progress WHERE listener_id = $1",
        )
        .bind(listener.as_ref())
        .fetch_optional(&self.pool)
        .await
        .map_err(|error| store_failure(&error, Operation::Current))?;

        match row {
            None => Ok(SequenceNumber::none()),
            Some(row) => {
                let highest: i64 = row
                    .try_get("highest_sequence_number")
                    .map_err(|error| store_failure(&error, Operation::Current))?;
                to_sequence_number(highest, Operation::Current)
            }
        }
    }

    #[instrument(name = "postgres.reset", skip(self, listener), fields(listener = %listener))]
    async fn reset(&self, listener: &ListenerId) -> Result<(), ProgressStoreError> {
        let reservation = self.reservation(listener, Operation::Reset)?;
        let mut connection = reservation.lock().await;

        let _ = query(
            "UPDATE catchup_listener_progress
             SET highest_sequence_number = 0, updated_at = now()
             WHERE listener_id = $1",
        )
        .bind(listener.as_ref())
        .execute(&mut *connection)
        .await
        .map_err(|error| store_failure(&error, Operation::Reset))?;
        Ok(())
    }
}

fn store_failure(error: &sqlx::Error, operation: Operation) -> ProgressStoreError {
    ProgressStoreError::StoreFailure {
        operation,
        detail: describe_sqlx_error(error, operation),
    }
}

fn to_sequence_number(value: i64, operation: Operation) -> Result<SequenceNumber, ProgressStoreError> {
    u64::try_from(value)
        .map(SequenceNumber::new)
        .map_err(|_| ProgressStoreError::StoreFailure {
            operation,
            detail: format!("stored sequence number {value} is negative"),
        })
}

fn to_column(sequence_number: SequenceNumber, operation: Operation) -> Result<i64, ProgressStoreError> {
    i64::try_from(sequence_number.into_inner()).map_err(|_| ProgressStoreError::StoreFailure {
        operation,
        detail: format!("sequence number {sequence_number} exceeds BIGINT"),
    })
}

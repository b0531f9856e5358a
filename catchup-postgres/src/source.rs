use std::sync::Arc;

use catchup_types::{
    BatchSize, DomainEvent, EventAppender, EventBatch, EventEnvelope, EventId, EventNormalizer,
    EventTypeName, LoadOutcome, Metadata, Operation, RawEvent, SequenceNumber, StreamName,
    StreamSelector, StreamSource, StreamSourceError, Timestamp,
};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{query, Pool, Postgres, Row};
use tracing::{debug, info, instrument};

use crate::describe_sqlx_error;

/// Serializes appends so sequence numbers commit in the order they are drawn.
const APPEND_LOCK_KEY: i64 = 0x6361_7463_6875_70;

/// Stream source backed by the `catchup_events` table.
#[derive(Debug, Clone)]
pub struct PostgresStreamSource {
    pool: Pool<Postgres>,
    normalizer: EventNormalizer,
}

impl PostgresStreamSource {
    /// Use an existing pool, decoding payloads with `normalizer`.
    pub const fn from_pool(pool: Pool<Postgres>, normalizer: EventNormalizer) -> Self {
        Self { pool, normalizer }
    }

    /// The underlying pool.
    pub const fn pool(&self) -> &Pool<Postgres> {
        &self.pool
    }

    /// The normalizer used for both directions.
    pub const fn normalizer(&self) -> &EventNormalizer {
        &self.normalizer
    }

    /// Highest sequence number visible through `selector`, or `None` when no
    /// stream matches.
    async fn head(&self, selector: &StreamSelector) -> Result<Option<SequenceNumber>, StreamSourceError> {
        let head_query = match selector {
            StreamSelector::All => query("SELECT MAX(sequence_number) AS head FROM catchup_events"),
            StreamSelector::Named(stream) => query(
                "SELECT MAX(sequence_number) AS head FROM catchup_events WHERE stream_name = $1",
            )
            .bind(stream.as_ref()),
            StreamSelector::Category(prefix) => query(
                "SELECT MAX(sequence_number) AS head FROM catchup_events WHERE stream_name LIKE $1",
            )
            .bind(like_prefix(prefix.as_ref())),
        };

        let row = head_query
            .fetch_one(&self.pool)
            .await
            .map_err(|error| store_failure(&error, Operation::Load))?;
        let head: Option<i64> = row
            .try_get("head")
            .map_err(|error| store_failure(&error, Operation::Load))?;
        head.map(to_sequence_number).transpose()
    }

    async fn page(
        &self,
        selector: &StreamSelector,
        from: i64,
        head: i64,
        limit: i64,
    ) -> Result<Vec<PgRow>, StreamSourceError> {
        const COLUMNS: &str =
            "sequence_number, event_id, stream_name, event_type, payload, metadata, recorded_at";

        let rows = match selector {
            StreamSelector::All => {
                let sql = format!(
                    "SELECT {COLUMNS} FROM catchup_events
                     WHERE sequence_number BETWEEN $1 AND $2
                     ORDER BY sequence_number
                     LIMIT $3"
                );
                query(&sql)
                    .bind(from)
                    .bind(head)
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await
            }
            StreamSelector::Named(stream) => {
                let sql = format!(
                    "SELECT {COLUMNS} FROM catchup_events
                     WHERE stream_name = $1 AND sequence_number BETWEEN $2 AND $3
                     ORDER BY sequence_number
                     LIMIT $4"
                );
                query(&sql)
                    .bind(stream.as_ref())
                    .bind(from)
                    .bind(head)
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await
            }
            StreamSelector::Category(prefix) => {
                let sql = format!(
                    "SELECT {COLUMNS} FROM catchup_events
                     WHERE stream_name LIKE $1 AND sequence_number BETWEEN $2 AND $3
                     ORDER BY sequence_number
                     LIMIT $4"
                );
                query(&sql)
                    .bind(like_prefix(prefix.as_ref()))
                    .bind(from)
                    .bind(head)
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await
            }
        };
        rows.map_err(|error| store_failure(&error, Operation::Load))
    }

    fn envelope(&self, row: &PgRow) -> Result<EventEnvelope, StreamSourceError> {
        let column = |error: sqlx::Error| store_failure(&error, Operation::Load);

        let sequence_number = to_sequence_number(row.try_get("sequence_number").map_err(column)?)?;
        let event_id: String = row.try_get("event_id").map_err(column)?;
        let stream_name: String = row.try_get("stream_name").map_err(column)?;
        let event_type: String = row.try_get("event_type").map_err(column)?;
        let Json(payload): Json<Value> = row.try_get("payload").map_err(column)?;
        let Json(metadata): Json<Value> = row.try_get("metadata").map_err(column)?;
        let recorded_at: DateTime<Utc> = row.try_get("recorded_at").map_err(column)?;

        let event_type = EventTypeName::try_new(event_type)
            .map_err(|error| corrupt_row(sequence_number, "event_type", &error))?;
        let raw = RawEvent::new(
            EventId::try_new(event_id)
                .map_err(|error| corrupt_row(sequence_number, "event_id", &error))?,
            event_type.clone(),
            sequence_number,
            StreamName::try_new(stream_name)
                .map_err(|error| corrupt_row(sequence_number, "stream_name", &error))?,
            payload.clone(),
        )
        .with_metadata(into_metadata(metadata))
        .with_recorded_at(Timestamp::new(recorded_at));

        let event = self.normalizer.denormalize(&event_type, payload)?;
        Ok(EventEnvelope::new(raw, event))
    }
}

impl StreamSource for PostgresStreamSource {
    #[instrument(name = "postgres.load", skip(self, selector), fields(selector = %selector))]
    async fn load(
        &self,
        selector: &StreamSelector,
        from: SequenceNumber,
        limit: BatchSize,
    ) -> Result<LoadOutcome, StreamSourceError> {
        let head = match (self.head(selector).await?, selector) {
            (Some(head), _) => head,
            (None, StreamSelector::All) => SequenceNumber::none(),
            (None, _) => {
                debug!("[postgres.load] no stream matches selector");
                return Ok(LoadOutcome::NotFound);
            }
        };

        let rows = self
            .page(
                selector,
                to_column(from)?,
                to_column(head)?,
                i64::try_from(limit.into_inner()).unwrap_or(i64::MAX),
            )
            .await?;
        let envelopes = rows
            .iter()
            .map(|row| self.envelope(row))
            .collect::<Result<Vec<_>, _>>()?;

        debug!(
            count = envelopes.len(),
            head = %head,
            "[postgres.load] loaded events"
        );
        Ok(LoadOutcome::Found(EventBatch::new(envelopes, head)))
    }
}

impl EventAppender for PostgresStreamSource {
    #[instrument(name = "postgres.append", skip(self, stream, events), fields(stream = %stream, count = events.len()))]
    async fn append(
        &self,
        stream: &StreamName,
        events: Vec<Arc<dyn DomainEvent>>,
    ) -> Result<Vec<SequenceNumber>, StreamSourceError> {
        let normalized = events
            .iter()
            .map(|event| self.normalizer.normalize(event))
            .collect::<Result<Vec<_>, _>>()?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|error| store_failure(&error, Operation::Append))?;

        let _ = query("SELECT pg_advisory_xact_lock($1)")
            .bind(APPEND_LOCK_KEY)
            .execute(&mut *tx)
            .await
            .map_err(|error| store_failure(&error, Operation::Append))?;

        let mut assigned = Vec::with_capacity(normalized.len());
        for event in normalized {
            let row = query(
                "INSERT INTO catchup_events (event_id, stream_name, event_type, payload, metadata)
                 VALUES ($1, $2, $3, $4, $5)
                 RETURNING sequence_number",
            )
            .bind(EventId::generate().into_inner())
            .bind(stream.as_ref())
            .bind(event.event_type.into_inner())
            .bind(Json(event.payload))
            .bind(Json(Value::Object(event.metadata)))
            .fetch_one(&mut *tx)
            .await
            .map_err(|error| store_failure(&error, Operation::Append))?;
            let sequence_number: i64 = row
                .try_get("sequence_number")
                .map_err(|error| store_failure(&error, Operation::Append))?;
            assigned.push(to_sequence_number(sequence_number)?);
        }

        tx.commit()
            .await
            .map_err(|error| store_failure(&error, Operation::Append))?;

        info!(
            count = assigned.len(),
            "[postgres.append] appended events"
        );
        Ok(assigned)
    }
}

/// `LIKE` pattern matching names that start with `prefix` literally.
fn like_prefix(prefix: &str) -> String {
    let mut pattern = String::with_capacity(prefix.len() + 1);
    for character in prefix.chars() {
        if matches!(character, '\\' | '%' | '_') {
            pattern.push('\\');
        }
        pattern.push(character);
    }
    pattern.push('%');
    pattern
}

fn into_metadata(value: Value) -> Metadata {
    match value {
        Value::Object(map) => map,
        _ => Metadata::new(),
    }
}

fn store_failure(error: &sqlx::Error, operation: Operation) -> StreamSourceError {
    StreamSourceError::StoreFailure {
        operation,
        detail: describe_sqlx_error(error, operation),
    }
}

fn corrupt_row(
    sequence_number: SequenceNumber,
    column: &str,
    error: &impl std::fmt::Display,
) -> StreamSourceError {
    StreamSourceError::StoreFailure {
        operation: Operation::Load,
        detail: format!("event {sequence_number} has an invalid {column}: {error}"),
    }
}

fn to_sequence_number(value: i64) -> Result<SequenceNumber, StreamSourceError> {
    u64::try_from(value)
        .map(SequenceNumber::new)
        .map_err(|_| StreamSourceError::StoreFailure {
            operation: Operation::Load,
            detail: format!("stored sequence number {value} is negative"),
        })
}

fn to_column(sequence_number: SequenceNumber) -> Result<i64, StreamSourceError> {
    i64::try_from(sequence_number.into_inner()).map_err(|_| StreamSourceError::StoreFailure {
        operation: Operation::Load,
        detail: format!("sequence number {sequence_number} exceeds BIGINT"),
    })
}

//! PostgreSQL collaborators for the catch-up invoker.
//!
//! [`PostgresStreamSource`] stores the event log in `catchup_events`, with the
//! `BIGSERIAL` primary key as the global sequence number. Appends serialize on
//! a transaction-scoped advisory lock so sequence numbers become visible in
//! the order they were assigned, which is what lets a listener trust that
//! nothing will later appear behind its stored position.
//!
//! [`PostgresProgressStore`] keeps applied positions in
//! `catchup_listener_progress`. A reservation is a session-level advisory
//! lock held on a dedicated connection; if the process dies, the session ends
//! and the lock is released by the server.
//!
//! ```ignore
//! let pool = catchup_postgres::connect(&url, PostgresConfig::default()).await?;
//! catchup_postgres::migrate(&pool).await?;
//!
//! let progress = PostgresProgressStore::from_pool(pool.clone());
//! let source = PostgresStreamSource::from_pool(pool, normalizer);
//! let invoker = CatchUpInvoker::new(progress, source);
//! ```

use std::time::Duration;

use catchup_types::Operation;
use nutype::nutype;
use sqlx::{postgres::PgPoolOptions, Pool, Postgres};
use thiserror::Error;
use tracing::{error, instrument};

mod progress;
mod source;

pub use progress::PostgresProgressStore;
pub use source::PostgresStreamSource;

/// Failures setting up the Postgres collaborators.
#[derive(Debug, Error)]
pub enum PostgresStoreError {
    /// The pool could not connect.
    #[error("failed to create postgres connection pool")]
    ConnectionFailed(#[source] sqlx::Error),

    /// A migration could not be applied.
    #[error("failed to apply catchup migrations")]
    MigrationFailed(#[source] sqlx::migrate::MigrateError),
}

/// Maximum number of database connections in the pool.
///
/// Connections held by active reservations are opened outside the pool and
/// do not count against this limit.
#[nutype(derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRef, Into))]
pub struct MaxConnections(std::num::NonZeroU32);

/// Configuration for the shared connection pool.
#[derive(Debug, Clone)]
pub struct PostgresConfig {
    /// Maximum number of connections in the pool (default: 10)
    pub max_connections: MaxConnections,
    /// Timeout for acquiring a connection from the pool (default: 30 seconds)
    pub acquire_timeout: Duration,
    /// Idle timeout for connections in the pool (default: 10 minutes)
    pub idle_timeout: Duration,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        const DEFAULT_MAX_CONNECTIONS: std::num::NonZeroU32 = match std::num::NonZeroU32::new(10) {
            Some(v) => v,
            None => unreachable!(),
        };

        Self {
            max_connections: MaxConnections::new(DEFAULT_MAX_CONNECTIONS),
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600),
        }
    }
}

/// Open a connection pool suitable for both collaborators.
pub async fn connect(
    connection_string: &str,
    config: PostgresConfig,
) -> Result<Pool<Postgres>, PostgresStoreError> {
    let max_connections: std::num::NonZeroU32 = config.max_connections.into();
    PgPoolOptions::new()
        .max_connections(max_connections.get())
        .acquire_timeout(config.acquire_timeout)
        .idle_timeout(config.idle_timeout)
        .connect(connection_string)
        .await
        .map_err(PostgresStoreError::ConnectionFailed)
}

/// Create or upgrade the `catchup_events` and `catchup_listener_progress`
/// tables.
#[instrument(name = "postgres.migrate", skip(pool))]
pub async fn migrate(pool: &Pool<Postgres>) -> Result<(), PostgresStoreError> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(PostgresStoreError::MigrationFailed)
}

/// Log a database failure and render it for a `StoreFailure` variant.
fn describe_sqlx_error(error: &sqlx::Error, operation: Operation) -> String {
    error!(
        error = %error,
        operation = %operation,
        "[postgres.database_error] database operation failed"
    );
    error.to_string()
}

/// SQLSTATE `lock_not_available`, raised when `lock_timeout` expires.
fn is_lock_timeout(error: &sqlx::Error) -> bool {
    matches!(
        error,
        sqlx::Error::Database(db_error) if db_error.code().as_deref() == Some("55P03")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_pool_matches_documented_values() {
        let config = PostgresConfig::default();

        assert_eq!(config.max_connections.to_string(), "10");
        assert_eq!(config.acquire_timeout, Duration::from_secs(30));
        assert_eq!(config.idle_timeout, Duration::from_secs(600));
    }

    #[test]
    fn pool_errors_are_not_lock_timeouts() {
        assert!(!is_lock_timeout(&sqlx::Error::PoolTimedOut));
    }

    #[test]
    fn store_failure_detail_is_the_database_message() {
        let detail = describe_sqlx_error(&sqlx::Error::PoolClosed, Operation::Load);

        assert_eq!(detail, sqlx::Error::PoolClosed.to_string());
    }
}

//! Backing store connections.
//!
//! A [`Connection`] owns one session to the backing database and issues the
//! handful of statements the store needs: table creation, the four record
//! operations, and transaction control.
//!
//! - **`PostgreSQL`**: `tokio-postgres`, optionally over rustls
//! - **`SQLite`**: `rusqlite`, with a `regexp()` function for key patterns

// Allow significant_drop_tightening - the SQLite mutex guard lives for one statement.
#![allow(clippy::significant_drop_tightening)]

mod metrics;
pub mod pattern;
#[cfg(feature = "postgres")]
pub(crate) mod postgresql;
mod sql;
mod sqlite;

pub use metrics::record_operation_metrics;
pub use pattern::Pattern;

use crate::config::{Backend, Options, Target};
use crate::Result;

/// An open session to the backing store.
pub(crate) enum Connection {
    /// `PostgreSQL` session.
    #[cfg(feature = "postgres")]
    Postgres(postgresql::PostgresConnection),
    /// `SQLite` session.
    Sqlite(sqlite::SqliteConnection),
}

impl Connection {
    /// Connects to the store described by `target`.
    ///
    /// TLS material is read before any network traffic, so a missing file
    /// leaves nothing half-open.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Connection`] if the session cannot be set up.
    pub async fn connect(target: &Target, options: &Options) -> Result<Self> {
        match target.backend {
            #[cfg(feature = "postgres")]
            Backend::Postgres => Ok(Self::Postgres(
                postgresql::PostgresConnection::connect(target, options).await?,
            )),
            #[cfg(not(feature = "postgres"))]
            Backend::Postgres => Err(crate::Error::FeatureNotEnabled("postgres".to_string())),
            Backend::Sqlite => Ok(Self::Sqlite(sqlite::SqliteConnection::open(options)?)),
        }
    }

    /// Returns the backend behind this connection.
    #[must_use]
    pub const fn backend(&self) -> Backend {
        match self {
            #[cfg(feature = "postgres")]
            Self::Postgres(_) => Backend::Postgres,
            Self::Sqlite(_) => Backend::Sqlite,
        }
    }

    /// Creates the record table if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Schema`] if the statement fails.
    pub async fn ensure_table(&self) -> Result<()> {
        match self {
            #[cfg(feature = "postgres")]
            Self::Postgres(conn) => conn.ensure_table().await,
            Self::Sqlite(conn) => conn.ensure_table(),
        }
    }

    /// Lists keys, optionally restricted to those matching `pattern`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Query`] if the statement fails.
    pub async fn keys(&self, pattern: Option<&Pattern>) -> Result<Vec<String>> {
        match self {
            #[cfg(feature = "postgres")]
            Self::Postgres(conn) => conn.keys(pattern).await,
            Self::Sqlite(conn) => conn.keys(pattern),
        }
    }

    /// Inserts or overwrites the serialized value for `key`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Query`] if the statement fails.
    pub async fn upsert(&self, key: &str, value: &str) -> Result<()> {
        match self {
            #[cfg(feature = "postgres")]
            Self::Postgres(conn) => conn.upsert(key, value).await,
            Self::Sqlite(conn) => conn.upsert(key, value),
        }
    }

    /// Returns the serialized value for `key`, if a row exists.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Query`] if the statement fails.
    pub async fn select(&self, key: &str) -> Result<Option<String>> {
        match self {
            #[cfg(feature = "postgres")]
            Self::Postgres(conn) => conn.select(key).await,
            Self::Sqlite(conn) => conn.select(key),
        }
    }

    /// Deletes the row for `key`. Missing rows are not an error.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Query`] if the statement fails.
    pub async fn delete(&self, key: &str) -> Result<()> {
        match self {
            #[cfg(feature = "postgres")]
            Self::Postgres(conn) => conn.delete(key).await,
            Self::Sqlite(conn) => conn.delete(key),
        }
    }

    /// Starts a transaction. On `SQLite` this takes the database write lock,
    /// waiting out the busy timeout if another process holds it.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Query`] if the statement fails.
    pub async fn begin(&self) -> Result<()> {
        match self {
            #[cfg(feature = "postgres")]
            Self::Postgres(conn) => conn.begin().await,
            Self::Sqlite(conn) => conn.begin(),
        }
    }

    /// Commits the open transaction.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Query`] if the statement fails.
    pub async fn commit(&self) -> Result<()> {
        self.transaction_control("COMMIT", "commit").await
    }

    /// Abandons the open transaction.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Query`] if the statement fails.
    pub async fn rollback(&self) -> Result<()> {
        self.transaction_control("ROLLBACK", "rollback").await
    }

    async fn transaction_control(&self, statement: &str, operation: &str) -> Result<()> {
        match self {
            #[cfg(feature = "postgres")]
            Self::Postgres(conn) => conn.batch(statement, operation).await,
            Self::Sqlite(conn) => conn.batch(statement, operation),
        }
    }

    /// Terminates the session.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Connection`] if the session does not shut down
    /// cleanly. The handle is gone either way.
    pub async fn close(self) -> Result<()> {
        match self {
            #[cfg(feature = "postgres")]
            Self::Postgres(conn) => conn.close().await,
            Self::Sqlite(conn) => conn.close(),
        }
    }
}

/// Builds a query error for `operation`.
pub(crate) fn query_error(operation: &str, cause: impl std::fmt::Display) -> crate::Error {
    crate::Error::Query {
        operation: operation.to_string(),
        cause: cause.to_string(),
    }
}

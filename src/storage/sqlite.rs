//! `SQLite` connection.
//!
//! The connection sits behind a `Mutex` so the store stays `Sync` across
//! await points; every statement runs to completion while the guard is held.

use super::sql::Statements;
use super::{Pattern, query_error};
use crate::config::{Backend, Options};
use crate::{Error, Result};
use regex::Regex;
use rusqlite::functions::FunctionFlags;
use rusqlite::{Connection, OptionalExtension, params};
use std::sync::{Arc, Mutex, MutexGuard};

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// `SQLite` session for one record table.
pub struct SqliteConnection {
    conn: Mutex<Connection>,
    sql: Statements,
    table: String,
}

impl SqliteConnection {
    /// Opens the database file named by `options.database`.
    pub fn open(options: &Options) -> Result<Self> {
        if options.tls.enabled {
            tracing::warn!(database = %options.database, "TLS options ignored for sqlite");
        }

        let conn = Connection::open(&options.database).map_err(|e| Error::Connection {
            operation: "open_sqlite".to_string(),
            cause: format!("{}: {e}", options.database),
        })?;
        configure_connection(&conn);
        register_regexp(&conn).map_err(|e| Error::Connection {
            operation: "register_regexp".to_string(),
            cause: e.to_string(),
        })?;

        tracing::debug!(database = %options.database, "Opened sqlite connection");

        Ok(Self {
            conn: Mutex::new(conn),
            sql: Statements::new(options, Backend::Sqlite),
            table: options.table.clone(),
        })
    }

    pub fn ensure_table(&self) -> Result<()> {
        self.lock()
            .execute(&self.sql.ensure_table, [])
            .map_err(|e| Error::Schema {
                table: self.table.clone(),
                cause: e.to_string(),
            })?;
        Ok(())
    }

    pub fn keys(&self, pattern: Option<&Pattern>) -> Result<Vec<String>> {
        let sql = pattern.map_or_else(
            || self.sql.select_keys.clone(),
            |p| self.sql.select_keys_matching(p),
        );

        let conn = self.lock();
        let mut stmt = conn.prepare(&sql).map_err(|e| query_error("keys", e))?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|e| query_error("keys", e))?;

        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| query_error("keys", e))
    }

    pub fn upsert(&self, key: &str, value: &str) -> Result<()> {
        self.lock()
            .execute(&self.sql.upsert, params![key, value])
            .map_err(|e| query_error("put", e))?;
        Ok(())
    }

    pub fn select(&self, key: &str) -> Result<Option<String>> {
        self.lock()
            .query_row(&self.sql.select_value, params![key], |row| {
                row.get::<_, Option<String>>(0)
            })
            .optional()
            .map(Option::flatten)
            .map_err(|e| query_error("get", e))
    }

    pub fn delete(&self, key: &str) -> Result<()> {
        self.lock()
            .execute(&self.sql.delete, params![key])
            .map_err(|e| query_error("del", e))?;
        Ok(())
    }

    pub fn begin(&self) -> Result<()> {
        self.batch(self.sql.begin, "begin")
    }

    pub fn batch(&self, statement: &str, operation: &str) -> Result<()> {
        self.lock()
            .execute_batch(statement)
            .map_err(|e| query_error(operation, e))
    }

    pub fn close(self) -> Result<()> {
        let conn = self
            .conn
            .into_inner()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        conn.close().map_err(|(_, e)| Error::Connection {
            operation: "close_sqlite".to_string(),
            cause: e.to_string(),
        })
    }

    /// Locks the connection, recovering from a poisoned mutex.
    fn lock(&self) -> MutexGuard<'_, Connection> {
        match self.conn.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::warn!("SQLite mutex was poisoned, recovering");
                poisoned.into_inner()
            },
        }
    }
}

/// Applies WAL journaling and a busy timeout.
///
/// Several processes share one file, so writers wait up to five seconds for
/// each other instead of failing with `SQLITE_BUSY`.
fn configure_connection(conn: &Connection) {
    // First, so switching the journal mode also waits on other openers
    let _ = conn.pragma_update(None, "busy_timeout", "5000");
    // journal_mode reports the resulting mode as a row
    let _ = conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()));
    let _ = conn.pragma_update(None, "synchronous", "NORMAL");
}

/// Registers `regexp(pattern, text)`, which backs the `REGEXP` operator.
fn register_regexp(conn: &Connection) -> rusqlite::Result<()> {
    conn.create_scalar_function(
        "regexp",
        2,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let regex: Arc<Regex> = ctx.get_or_create_aux(0, |raw| -> std::result::Result<_, BoxError> {
                Ok(Regex::new(raw.as_str()?)?)
            })?;
            let text = ctx
                .get_raw(1)
                .as_str()
                .map_err(|e| rusqlite::Error::UserFunctionError(e.into()))?;
            Ok(regex.is_match(text))
        },
    )
}

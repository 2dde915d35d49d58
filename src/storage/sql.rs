//! Statement text for the record table.
//!
//! Identifiers come from [`Options`] and are interpolated verbatim; values
//! are always bound as parameters. Key patterns are the one exception and are
//! embedded as quoted literals (see [`Pattern::sql_literal`]).

use super::Pattern;
use crate::MAX_KEY_LEN;
use crate::config::{Backend, Options};

/// Prepared statement text for one table on one backend.
#[derive(Debug, Clone)]
pub struct Statements {
    pub ensure_table: String,
    pub select_keys: String,
    pub upsert: String,
    pub select_value: String,
    pub delete: String,
    pub begin: &'static str,
    key_column: String,
    regex_operator: &'static str,
}

impl Statements {
    pub fn new(options: &Options, backend: Backend) -> Self {
        let Options {
            table,
            key_column: key,
            val_column: val,
            ..
        } = options;

        // SQLite takes the write lock at BEGIN IMMEDIATE, so writers in other
        // processes wait out the busy timeout instead of failing on upgrade.
        let (p1, p2, regex_operator, begin) = match backend {
            Backend::Postgres => ("$1", "$2", "~", "BEGIN"),
            Backend::Sqlite => ("?1", "?2", "REGEXP", "BEGIN IMMEDIATE"),
        };

        Self {
            ensure_table: format!(
                "CREATE TABLE IF NOT EXISTS {table} (
                    {key} VARCHAR({MAX_KEY_LEN}) NOT NULL PRIMARY KEY,
                    {val} TEXT
                )"
            ),
            select_keys: format!("SELECT {key} FROM {table}"),
            upsert: format!(
                "INSERT INTO {table} ({key}, {val}) VALUES ({p1}, {p2})
                 ON CONFLICT ({key}) DO UPDATE SET {val} = excluded.{val}"
            ),
            select_value: format!("SELECT {val} FROM {table} WHERE {key} = {p1}"),
            delete: format!("DELETE FROM {table} WHERE {key} = {p1}"),
            begin,
            key_column: key.clone(),
            regex_operator,
        }
    }

    /// Key listing restricted to keys matching `pattern`.
    pub fn select_keys_matching(&self, pattern: &Pattern) -> String {
        format!(
            "{} WHERE {} {} {}",
            self.select_keys,
            self.key_column,
            self.regex_operator,
            pattern.sql_literal()
        )
    }
}

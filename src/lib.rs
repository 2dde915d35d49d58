//! # kvlock
//!
//! A key-value store kept in a single relational table, for processes that
//! coordinate through shared state.
//!
//! Values are stored as JSON text under bounded string keys. Short critical
//! sections are taken with [`KeyValStore::acquire`], which grabs a named lock
//! and opens a transaction on the store's connection; [`KeyValStore::release`]
//! commits and then unlocks, so everything written in between becomes visible
//! to other lock holders at once.
//!
//! ## Backends
//!
//! - `postgres://` / `postgresql://` (feature `postgres`, on by default), with
//!   optional TLS through rustls
//! - `sqlite://` for processes sharing a database file on one host
//!
//! ## Example
//!
//! ```rust,ignore
//! use kvlock::KeyValStore;
//!
//! let mut store = KeyValStore::new("postgres://app:secret@db:5432/coord?table=Shared")?;
//! store.open().await?;
//!
//! store.acquire().await?;
//! let seen: Option<u64> = store.get("counter").await?;
//! store.put("counter", &(seen.unwrap_or(0) + 1)).await?;
//! store.release().await?;
//!
//! store.close().await?;
//! ```

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![warn(missing_docs)]
#![forbid(unsafe_code)]
#![allow(clippy::multiple_crate_versions)]

use thiserror::Error as ThisError;

pub mod config;
pub mod lock;
pub mod observability;
pub mod storage;
mod store;

pub use config::{Backend, Options, Target, TlsOptions};
#[cfg(feature = "postgres")]
pub use lock::AdvisoryLocks;
pub use lock::{LOCK_NAME, LockGuard, NamedLock, ProcessLocks};
pub use storage::pattern::Pattern;
pub use store::{KeyValStore, MAX_KEY_LEN};

/// Error type for kvlock operations.
///
/// # Error Variant Triggers
///
/// | Variant | Raised When |
/// |---------|-------------|
/// | `Configuration` | Descriptor cannot be parsed, has no database, or names an unknown scheme |
/// | `AlreadyOpen` / `NotOpen` | Lifecycle methods called out of order |
/// | `NotAcquired` / `AlreadyLocked` | `release` without a lock, `acquire` twice |
/// | `Connection` | Connect or TLS material load fails |
/// | `Schema` | Table creation fails |
/// | `Query` | Any CRUD or transaction statement fails |
/// | `Serialization` | A value cannot be encoded to or decoded from JSON |
/// | `Lock` | The named lock primitive fails |
#[derive(Debug, ThisError)]
pub enum Error {
    /// The connection descriptor is unusable.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The descriptor needs a cargo feature that was not compiled in.
    #[error("feature not enabled: {0} (compile with --features {0})")]
    FeatureNotEnabled(String),

    /// `open` was called on a store that is already open.
    #[error("store is already open")]
    AlreadyOpen,

    /// An operation needing the connection was called on a closed store.
    #[error("store is not open")]
    NotOpen,

    /// `release` was called without a held lock.
    #[error("lock is not acquired")]
    NotAcquired,

    /// `acquire` was called while this store already holds the lock.
    #[error("lock is already held by this store")]
    AlreadyLocked,

    /// Establishing the connection failed.
    #[error("connection failed during '{operation}': {cause}")]
    Connection {
        /// The step that failed.
        operation: String,
        /// The underlying cause.
        cause: String,
    },

    /// Creating the backing table failed.
    #[error("could not ensure table '{table}': {cause}")]
    Schema {
        /// The table being created.
        table: String,
        /// The underlying cause.
        cause: String,
    },

    /// A statement failed.
    #[error("query '{operation}' failed: {cause}")]
    Query {
        /// The operation that failed.
        operation: String,
        /// The underlying cause.
        cause: String,
    },

    /// A value could not be encoded or decoded.
    #[error("serialization of '{key}' failed: {cause}")]
    Serialization {
        /// The key whose value was being converted.
        key: String,
        /// The underlying cause.
        cause: String,
    },

    /// The named lock primitive failed.
    #[error("lock '{operation}' failed: {cause}")]
    Lock {
        /// The lock step that failed.
        operation: String,
        /// The underlying cause.
        cause: String,
    },

    /// The key exceeds the column bound.
    #[error("invalid key: {0}")]
    InvalidKey(String),
}

/// Result type alias for kvlock operations.
pub type Result<T> = std::result::Result<T, Error>;

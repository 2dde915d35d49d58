//! The key-value store.

#[cfg(feature = "postgres")]
use crate::config::Backend;
use crate::config::{Options, Target};
#[cfg(feature = "postgres")]
use crate::lock::AdvisoryLocks;
use crate::lock::{LOCK_NAME, LockGuard, NamedLock, ProcessLocks, lock_error};
use crate::storage::{Connection, Pattern, record_operation_metrics};
use crate::{Error, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

/// Longest key, in bytes, the store accepts.
pub const MAX_KEY_LEN: usize = 128;

/// Lock bookkeeping for one store.
enum LockState {
    /// No lock held.
    Idle,
    /// Lock held and a transaction open on the connection.
    Held(Box<dyn LockGuard>),
    /// The transaction committed but unlocking failed. The store must be
    /// recreated.
    Stale,
}

/// A key-value store on a single relational table.
///
/// Lifecycle: [`new`](Self::new) resolves options, [`open`](Self::open)
/// connects and creates the table, [`close`](Self::close) disconnects. Every
/// other method fails with [`Error::NotOpen`] while the store is closed.
///
/// Methods take `&mut self`: one store issues one statement at a time. Use
/// one store per task and let the named lock order them.
pub struct KeyValStore {
    target: Target,
    options: Options,
    locks: Arc<dyn NamedLock>,
    conn: Option<Connection>,
    lock: LockState,
    /// A `BEGIN` was sent and nothing has ended that transaction yet.
    in_transaction: bool,
}

impl KeyValStore {
    /// Creates a closed store with the default lock for its backend.
    ///
    /// - `PostgreSQL`: [`AdvisoryLocks`](crate::AdvisoryLocks) on the same
    ///   server, so every process using the descriptor is excluded.
    /// - `SQLite`: [`ProcessLocks::global`] orders stores within this
    ///   process. Across processes the database write lock taken by
    ///   `acquire` does the excluding, and a waiter gives up with
    ///   [`Error::Query`] after the five second busy timeout.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the descriptor cannot be parsed or
    /// names no database.
    pub fn new(descriptor: &str) -> Result<Self> {
        let target = Target::parse(descriptor)?;
        let locks: Arc<dyn NamedLock> = match target.backend {
            #[cfg(feature = "postgres")]
            Backend::Postgres => Arc::new(AdvisoryLocks::new(descriptor)?),
            _ => Arc::new(ProcessLocks::global()),
        };
        Self::from_target(target, locks)
    }

    /// Creates a closed store that locks through `locks`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the descriptor cannot be parsed or
    /// names no database.
    pub fn with_lock(descriptor: &str, locks: Arc<dyn NamedLock>) -> Result<Self> {
        Self::from_target(Target::parse(descriptor)?, locks)
    }

    fn from_target(target: Target, locks: Arc<dyn NamedLock>) -> Result<Self> {
        let options = Options::from_target(&target)?;

        Ok(Self {
            target,
            options,
            locks,
            conn: None,
            lock: LockState::Idle,
            in_transaction: false,
        })
    }

    /// Returns the resolved options.
    #[must_use]
    pub const fn options(&self) -> &Options {
        &self.options
    }

    /// Returns true between a successful `open` and `close`.
    #[must_use]
    pub const fn is_open(&self) -> bool {
        self.conn.is_some()
    }

    /// Returns true while this store holds the named lock.
    #[must_use]
    pub const fn is_locked(&self) -> bool {
        !matches!(self.lock, LockState::Idle)
    }

    /// Connects and creates the table if it is missing.
    ///
    /// # Errors
    ///
    /// - [`Error::AlreadyOpen`] if the store is open
    /// - [`Error::Connection`] if connecting or loading TLS files fails
    /// - [`Error::Schema`] if the table cannot be created
    pub async fn open(&mut self) -> Result<()> {
        if self.conn.is_some() {
            return Err(Error::AlreadyOpen);
        }

        let conn = Connection::connect(&self.target, &self.options).await?;
        if let Err(e) = conn.ensure_table().await {
            if let Err(close_err) = conn.close().await {
                tracing::warn!(error = %close_err, "Failed to close connection after schema error");
            }
            return Err(e);
        }

        tracing::info!(
            backend = %conn.backend(),
            database = %self.options.database,
            table = %self.options.table,
            "Store opened"
        );
        self.conn = Some(conn);
        Ok(())
    }

    /// Releases a held lock, then disconnects.
    ///
    /// The connection is torn down even if the release fails; that error is
    /// returned and the lock is dropped so nothing stays held.
    ///
    /// # Errors
    ///
    /// - [`Error::NotOpen`] if the store is closed
    /// - any error from [`release`](Self::release) or from disconnecting
    pub async fn close(&mut self) -> Result<()> {
        if self.conn.is_none() {
            return Err(Error::NotOpen);
        }

        let released = if matches!(self.lock, LockState::Held(_)) {
            self.release().await
        } else {
            if matches!(self.lock, LockState::Stale) {
                tracing::warn!("Closing store whose lock could not be released");
            }
            Ok(())
        };

        let closed = match self.conn.take() {
            Some(conn) => conn.close().await,
            None => Ok(()),
        };
        self.in_transaction = false;

        // A failed commit leaves the guard in place; the transaction died with
        // the connection, so the lock goes too.
        if let LockState::Held(guard) = std::mem::replace(&mut self.lock, LockState::Idle) {
            if let Err(e) = guard.unlock().await {
                tracing::warn!(error = %e, "Failed to unlock after closing");
            }
        }

        tracing::info!(database = %self.options.database, "Store closed");
        released.and(closed)
    }

    /// Lists keys, optionally only those matching a glob.
    ///
    /// In a pattern, `*` stands for one or more characters and everything
    /// else is literal. The pattern must match the whole key. Order is
    /// whatever the backend returns.
    ///
    /// # Errors
    ///
    /// - [`Error::NotOpen`] if the store is closed
    /// - [`Error::Query`] if the statement fails
    pub async fn keys(&mut self, pattern: Option<&str>) -> Result<Vec<String>> {
        self.settle().await?;
        let conn = self.conn.as_ref().ok_or(Error::NotOpen)?;
        let start = Instant::now();

        let pattern = pattern.map(Pattern::from_glob);
        let result = conn.keys(pattern.as_ref()).await;

        tracing::debug!(pattern = ?pattern.as_ref().map(Pattern::as_regex), "keys");
        self.observe("keys", start, &result);
        result
    }

    /// Stores `value` under `key` as JSON, replacing any previous value.
    ///
    /// # Errors
    ///
    /// - [`Error::NotOpen`] if the store is closed
    /// - [`Error::InvalidKey`] if `key` is longer than [`MAX_KEY_LEN`] bytes
    /// - [`Error::Serialization`] if `value` cannot be encoded
    /// - [`Error::Query`] if the statement fails
    pub async fn put<T>(&mut self, key: &str, value: &T) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        self.settle().await?;
        let conn = self.conn.as_ref().ok_or(Error::NotOpen)?;
        let start = Instant::now();

        if key.len() > MAX_KEY_LEN {
            return Err(Error::InvalidKey(format!(
                "key is {} bytes, limit is {MAX_KEY_LEN}",
                key.len()
            )));
        }
        let text = serde_json::to_string(value).map_err(|e| Error::Serialization {
            key: key.to_string(),
            cause: e.to_string(),
        })?;

        let result = conn.upsert(key, &text).await;

        tracing::debug!(key, bytes = text.len(), "put");
        self.observe("put", start, &result);
        result
    }

    /// Reads the value stored under `key`.
    ///
    /// Returns `Ok(None)` when no row exists. A stored JSON `null` read as
    /// [`serde_json::Value`] is `Some(Value::Null)`, so absence and null stay
    /// distinct.
    ///
    /// # Errors
    ///
    /// - [`Error::NotOpen`] if the store is closed
    /// - [`Error::Query`] if the statement fails
    /// - [`Error::Serialization`] if the stored text does not decode as `T`
    pub async fn get<T>(&mut self, key: &str) -> Result<Option<T>>
    where
        T: DeserializeOwned,
    {
        self.settle().await?;
        let conn = self.conn.as_ref().ok_or(Error::NotOpen)?;
        let start = Instant::now();

        let result = conn.select(key).await.and_then(|text| {
            text.map(|text| {
                serde_json::from_str(&text).map_err(|e| Error::Serialization {
                    key: key.to_string(),
                    cause: e.to_string(),
                })
            })
            .transpose()
        });

        tracing::debug!(key, found = matches!(result, Ok(Some(_))), "get");
        self.observe("get", start, &result);
        result
    }

    /// Deletes `key`. Deleting a missing key succeeds.
    ///
    /// # Errors
    ///
    /// - [`Error::NotOpen`] if the store is closed
    /// - [`Error::Query`] if the statement fails
    pub async fn del(&mut self, key: &str) -> Result<()> {
        self.settle().await?;
        let conn = self.conn.as_ref().ok_or(Error::NotOpen)?;
        let start = Instant::now();

        let result = conn.delete(key).await;

        tracing::debug!(key, "del");
        self.observe("del", start, &result);
        result
    }

    /// Takes the named lock, then opens a transaction.
    ///
    /// Waits for as long as another holder keeps the lock. If the
    /// transaction cannot be started the lock is given back before the error
    /// is returned.
    ///
    /// Dropping the returned future gives up the wait. If it is dropped
    /// while `BEGIN` is in flight the lock guard is dropped with it, and the
    /// transaction that may have started is rolled back by the next call on
    /// this store.
    ///
    /// # Errors
    ///
    /// - [`Error::NotOpen`] if the store is closed
    /// - [`Error::AlreadyLocked`] if this store already holds the lock
    /// - [`Error::Lock`] if the lock primitive fails, or a previous unlock
    ///   failed
    /// - [`Error::Query`] if the transaction cannot be started
    pub async fn acquire(&mut self) -> Result<()> {
        self.settle().await?;
        let conn = self.conn.as_ref().ok_or(Error::NotOpen)?;
        match self.lock {
            LockState::Idle => {},
            LockState::Held(_) => return Err(Error::AlreadyLocked),
            LockState::Stale => return Err(stale_error("acquire")),
        }

        let start = Instant::now();
        let guard = self.locks.lock(LOCK_NAME).await?;
        metrics::histogram!("kvlock_lock_wait_ms").record(start.elapsed().as_secs_f64() * 1000.0);

        self.in_transaction = true;
        if let Err(e) = conn.begin().await {
            self.in_transaction = false;
            if let Err(unlock_err) = guard.unlock().await {
                tracing::warn!(error = %unlock_err, "Failed to unlock after BEGIN failed");
            }
            return Err(e);
        }

        tracing::info!(lock = LOCK_NAME, "Lock acquired");
        self.lock = LockState::Held(guard);
        Ok(())
    }

    /// Commits the open transaction, then gives the lock back.
    ///
    /// A failed commit leaves the lock held. A failed unlock leaves the
    /// transaction committed and the store unusable for locking.
    ///
    /// # Errors
    ///
    /// - [`Error::NotOpen`] if the store is closed
    /// - [`Error::NotAcquired`] if no lock is held
    /// - [`Error::Query`] if the commit fails
    /// - [`Error::Lock`] if unlocking fails
    pub async fn release(&mut self) -> Result<()> {
        let conn = self.conn.as_ref().ok_or(Error::NotOpen)?;
        let guard = match std::mem::replace(&mut self.lock, LockState::Idle) {
            LockState::Held(guard) => guard,
            LockState::Idle => return Err(Error::NotAcquired),
            LockState::Stale => {
                self.lock = LockState::Stale;
                return Err(stale_error("release"));
            },
        };

        if let Err(e) = conn.commit().await {
            self.lock = LockState::Held(guard);
            return Err(e);
        }
        self.in_transaction = false;

        match guard.unlock().await {
            Ok(()) => {
                tracing::info!(lock = LOCK_NAME, "Lock released");
                Ok(())
            },
            Err(e) => {
                tracing::warn!(error = %e, "Transaction committed but unlock failed");
                self.lock = LockState::Stale;
                Err(e)
            },
        }
    }

    /// Rolls back a transaction that outlived its lock.
    ///
    /// That happens when an `acquire` future is dropped after sending
    /// `BEGIN`. Without the rollback the next statements would run inside a
    /// transaction no lock protects.
    async fn settle(&mut self) -> Result<()> {
        if !self.in_transaction || !matches!(self.lock, LockState::Idle) {
            return Ok(());
        }
        let conn = self.conn.as_ref().ok_or(Error::NotOpen)?;

        tracing::warn!("Rolling back transaction left by an abandoned acquire");
        conn.rollback().await?;
        self.in_transaction = false;
        Ok(())
    }

    fn observe<T>(&self, operation: &'static str, start: Instant, result: &Result<T>) {
        let backend = self.conn.as_ref().map_or("closed", |c| c.backend().as_str());
        let status = if result.is_ok() { "success" } else { "error" };
        record_operation_metrics(backend, operation, start, status);
    }
}

fn stale_error(operation: &str) -> Error {
    lock_error(operation, "a previous unlock failed, recreate the store")
}

impl fmt::Debug for KeyValStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyValStore")
            .field("backend", &self.target.backend)
            .field("options", &self.options)
            .field("open", &self.is_open())
            .field("locked", &self.is_locked())
            .finish_non_exhaustive()
    }
}

//! Named mutual-exclusion locks.
//!
//! The store does not implement a locking algorithm. It drives whatever
//! [`NamedLock`] it was built with: acquiring yields a [`LockGuard`], and
//! unlocking consumes that guard, so only the holder can release.
//!
//! Two primitives ship with the crate:
//!
//! - [`ProcessLocks`]: async mutexes keyed by name, shared within one process
//! - [`AdvisoryLocks`]: `PostgreSQL` advisory locks, shared by every process
//!   talking to the same server (feature `postgres`)

#[cfg(feature = "postgres")]
mod advisory;
mod process;

#[cfg(feature = "postgres")]
pub use advisory::AdvisoryLocks;
pub use process::ProcessLocks;

use crate::Result;
use async_trait::async_trait;

/// Name every store locks under.
///
/// All stores using the same primitive contend on this one name, whatever
/// database or table they point at.
pub const LOCK_NAME: &str = "kvlock";

/// A primitive that grants exclusive ownership of a name.
#[async_trait]
pub trait NamedLock: Send + Sync {
    /// Waits until `name` is free and takes it.
    ///
    /// There is no timeout; dropping the future abandons the wait.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Lock`] if the primitive cannot grant the lock.
    async fn lock(&self, name: &str) -> Result<Box<dyn LockGuard>>;
}

/// Proof of ownership for a held name.
#[async_trait]
pub trait LockGuard: Send + Sync {
    /// Releases the name.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Lock`] if the primitive fails to release. The
    /// name may still be held in that case.
    async fn unlock(self: Box<Self>) -> Result<()>;
}

/// Builds a lock error for `operation`.
#[cfg_attr(not(feature = "postgres"), allow(dead_code))]
pub(crate) fn lock_error(operation: &str, cause: impl std::fmt::Display) -> crate::Error {
    crate::Error::Lock {
        operation: operation.to_string(),
        cause: cause.to_string(),
    }
}

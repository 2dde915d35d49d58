//! In-process named locks.

use super::{LockGuard, NamedLock};
use crate::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use tokio::sync::OwnedMutexGuard;

type Registry = Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>;

/// Async mutexes keyed by name.
///
/// Clones share one registry. [`ProcessLocks::global`] is the registry
/// `SQLite` stores use unless given another primitive; [`ProcessLocks::new`]
/// creates an independent one.
#[derive(Clone, Default)]
pub struct ProcessLocks {
    registry: Arc<Registry>,
}

static GLOBAL: OnceLock<ProcessLocks> = OnceLock::new();

impl ProcessLocks {
    /// Creates an empty, independent registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the process-wide registry.
    #[must_use]
    pub fn global() -> Self {
        GLOBAL.get_or_init(Self::new).clone()
    }

    fn entry(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut registry = match self.registry.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::warn!("Lock registry mutex was poisoned, recovering");
                poisoned.into_inner()
            },
        };
        Arc::clone(registry.entry(name.to_string()).or_default())
    }
}

#[async_trait]
impl NamedLock for ProcessLocks {
    async fn lock(&self, name: &str) -> Result<Box<dyn LockGuard>> {
        let guard = self.entry(name).lock_owned().await;
        Ok(Box::new(ProcessGuard { _guard: guard }))
    }
}

/// Keeps the name's mutex locked until dropped.
struct ProcessGuard {
    _guard: OwnedMutexGuard<()>,
}

#[async_trait]
impl LockGuard for ProcessGuard {
    async fn unlock(self: Box<Self>) -> Result<()> {
        drop(self);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_lock_excludes_second_holder() {
        let locks = ProcessLocks::new();
        let first = locks.lock("job").await.unwrap();

        let contender = locks.clone();
        let mut waiting = tokio::spawn(async move { contender.lock("job").await.map(drop) });

        assert!(
            timeout(Duration::from_millis(50), &mut waiting)
                .await
                .is_err(),
            "second lock should wait"
        );

        first.unlock().await.unwrap();
        timeout(Duration::from_secs(1), waiting)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_names_are_independent() {
        let locks = ProcessLocks::new();
        let _a = locks.lock("a").await.unwrap();
        let b = timeout(Duration::from_millis(50), locks.lock("b")).await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn test_registries_are_independent() {
        let _held = ProcessLocks::new().lock("shared").await.unwrap();
        let other = timeout(Duration::from_millis(50), ProcessLocks::new().lock("shared")).await;
        assert!(other.is_ok());
    }

    #[test]
    fn test_global_is_shared() {
        let a = ProcessLocks::global();
        let b = ProcessLocks::global();
        assert!(Arc::ptr_eq(&a.registry, &b.registry));
    }
}

//! `PostgreSQL` advisory locks.
//!
//! Advisory locks belong to a server session, so every acquisition opens its
//! own session and keeps it until unlock. Two holders in one process then
//! still exclude each other, and a crashed holder's lock is freed when its
//! session drops.

use super::{LockGuard, NamedLock, lock_error};
use crate::config::{Backend, Options, Target};
use crate::storage::postgresql::open_session;
use crate::{Error, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_postgres::Client;

/// Advisory locks on a `PostgreSQL` server.
#[derive(Clone)]
pub struct AdvisoryLocks {
    target: Arc<Target>,
    options: Arc<Options>,
}

impl AdvisoryLocks {
    /// Creates a lock primitive for the server named by a descriptor.
    ///
    /// The descriptor's TLS options apply to lock sessions too.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the descriptor is invalid or does
    /// not name a `PostgreSQL` server.
    pub fn new(descriptor: &str) -> Result<Self> {
        let target = Target::parse(descriptor)?;
        if target.backend != Backend::Postgres {
            return Err(Error::Configuration(format!(
                "advisory locks need a postgres descriptor, got {}",
                target.backend
            )));
        }
        let options = Options::from_target(&target)?;

        Ok(Self {
            target: Arc::new(target),
            options: Arc::new(options),
        })
    }
}

/// Maps a lock name to a 64-bit advisory key.
#[must_use]
pub fn advisory_key(name: &str) -> i64 {
    let digest = Sha256::digest(name.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(bytes)
}

#[async_trait]
impl NamedLock for AdvisoryLocks {
    async fn lock(&self, name: &str) -> Result<Box<dyn LockGuard>> {
        let key = advisory_key(name);
        let (client, driver) = open_session(&self.target, &self.options).await?;

        client
            .execute("SELECT pg_advisory_lock($1)", &[&key])
            .await
            .map_err(|e| lock_error("lock", e))?;

        tracing::debug!(name, key, "Advisory lock granted");
        Ok(Box::new(AdvisoryGuard {
            client,
            driver,
            key,
        }))
    }
}

struct AdvisoryGuard {
    client: Client,
    driver: JoinHandle<()>,
    key: i64,
}

#[async_trait]
impl LockGuard for AdvisoryGuard {
    async fn unlock(self: Box<Self>) -> Result<()> {
        let Self {
            client,
            driver,
            key,
        } = *self;

        let released: bool = client
            .query_one("SELECT pg_advisory_unlock($1)", &[&key])
            .await
            .and_then(|row| row.try_get(0))
            .map_err(|e| lock_error("unlock", e))?;

        drop(client);
        if let Err(e) = driver.await {
            tracing::warn!(error = %e, "Advisory lock session did not shut down cleanly");
        }

        if released {
            Ok(())
        } else {
            Err(lock_error("unlock", "session did not hold the advisory lock"))
        }
    }
}

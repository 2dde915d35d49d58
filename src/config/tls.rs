//! Transport encryption options.

use super::Target;
use crate::{Error, Result};
use std::path::{Path, PathBuf};

/// TLS settings resolved from the descriptor query.
///
/// Any of `tls`, `ca`, `key` or `crt` turns encryption on. Only a `ca`
/// turns on server certificate verification.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsOptions {
    /// Whether the connection is encrypted.
    pub enabled: bool,
    /// CA bundle used to verify the server.
    pub ca: Option<PathBuf>,
    /// Client private key.
    pub key: Option<PathBuf>,
    /// Client certificate chain.
    pub cert: Option<PathBuf>,
}

/// File contents loaded for a TLS handshake, in PEM form.
#[derive(Default)]
pub struct TlsMaterial {
    /// CA bundle.
    pub ca: Option<Vec<u8>>,
    /// Client private key.
    pub key: Option<Vec<u8>>,
    /// Client certificate chain.
    pub cert: Option<Vec<u8>>,
}

impl TlsOptions {
    pub(super) fn from_target(target: &Target) -> Self {
        let path = |name: &str| target.param(name).filter(|p| !p.is_empty()).map(PathBuf::from);

        Self {
            enabled: ["tls", "ca", "key", "crt"]
                .iter()
                .any(|name| target.has_param(name)),
            ca: path("ca"),
            key: path("key"),
            cert: path("crt"),
        }
    }

    /// Returns true if the server certificate must be verified.
    #[must_use]
    pub const fn verify_server(&self) -> bool {
        self.ca.is_some()
    }

    /// Reads every configured file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Connection`] if a file cannot be read, or if only one
    /// of the client key and certificate is configured.
    pub async fn load(&self) -> Result<TlsMaterial> {
        if self.key.is_some() != self.cert.is_some() {
            return Err(Error::Connection {
                operation: "load_tls_material".to_string(),
                cause: "client key and certificate must be supplied together".to_string(),
            });
        }

        Ok(TlsMaterial {
            ca: read_optional(self.ca.as_deref()).await?,
            key: read_optional(self.key.as_deref()).await?,
            cert: read_optional(self.cert.as_deref()).await?,
        })
    }
}

async fn read_optional(path: Option<&Path>) -> Result<Option<Vec<u8>>> {
    let Some(path) = path else {
        return Ok(None);
    };

    tokio::fs::read(path)
        .await
        .map(Some)
        .map_err(|e| Error::Connection {
            operation: "load_tls_material".to_string(),
            cause: format!("{}: {e}", path.display()),
        })
}

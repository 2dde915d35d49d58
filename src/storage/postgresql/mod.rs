//! `PostgreSQL` connection.
//!
//! Holds a single `tokio-postgres` client. The connection future that drives
//! the socket runs on its own tokio task; closing the store drops the client
//! and waits for that task to finish.

mod tls;

use super::sql::Statements;
use super::{Pattern, query_error};
use crate::config::{Backend, Options, Target};
use crate::{Error, Result};
use secrecy::ExposeSecret;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;
use tokio_postgres::config::SslMode;
use tokio_postgres::{Client, NoTls};

/// `PostgreSQL` session for one record table.
pub struct PostgresConnection {
    client: Client,
    driver: JoinHandle<()>,
    sql: Statements,
    table: String,
}

impl PostgresConnection {
    /// Connects using the descriptor's host, port and credentials.
    pub async fn connect(target: &Target, options: &Options) -> Result<Self> {
        let (client, driver) = open_session(target, options).await?;

        tracing::debug!(
            host = %target.host,
            port = target.port,
            database = %options.database,
            tls = options.tls.enabled,
            verify_server = options.tls.verify_server(),
            "Connected to postgres"
        );

        Ok(Self {
            client,
            driver,
            sql: Statements::new(options, Backend::Postgres),
            table: options.table.clone(),
        })
    }

    pub async fn ensure_table(&self) -> Result<()> {
        self.client
            .batch_execute(&self.sql.ensure_table)
            .await
            .map_err(|e| Error::Schema {
                table: self.table.clone(),
                cause: e.to_string(),
            })
    }

    pub async fn keys(&self, pattern: Option<&Pattern>) -> Result<Vec<String>> {
        let sql = pattern.map_or_else(
            || self.sql.select_keys.clone(),
            |p| self.sql.select_keys_matching(p),
        );

        let rows = self
            .client
            .query(&sql, &[])
            .await
            .map_err(|e| query_error("keys", e))?;

        rows.iter()
            .map(|row| row.try_get::<_, String>(0))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| query_error("keys", e))
    }

    pub async fn upsert(&self, key: &str, value: &str) -> Result<()> {
        self.client
            .execute(&self.sql.upsert, &[&key, &value])
            .await
            .map_err(|e| query_error("put", e))?;
        Ok(())
    }

    pub async fn select(&self, key: &str) -> Result<Option<String>> {
        let row = self
            .client
            .query_opt(&self.sql.select_value, &[&key])
            .await
            .map_err(|e| query_error("get", e))?;

        match row {
            Some(row) => row
                .try_get::<_, Option<String>>(0)
                .map_err(|e| query_error("get", e)),
            None => Ok(None),
        }
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        self.client
            .execute(&self.sql.delete, &[&key])
            .await
            .map_err(|e| query_error("del", e))?;
        Ok(())
    }

    pub async fn begin(&self) -> Result<()> {
        self.batch(self.sql.begin, "begin").await
    }

    pub async fn batch(&self, statement: &str, operation: &str) -> Result<()> {
        self.client
            .batch_execute(statement)
            .await
            .map_err(|e| query_error(operation, e))
    }

    pub async fn close(self) -> Result<()> {
        drop(self.client);
        self.driver.await.map_err(|e| Error::Connection {
            operation: "close_postgres".to_string(),
            cause: e.to_string(),
        })
    }
}

/// Opens a session and spawns its driver task.
///
/// TLS files are read and parsed before any socket is opened.
pub(crate) async fn open_session(
    target: &Target,
    options: &Options,
) -> Result<(Client, JoinHandle<()>)> {
    let connector = if options.tls.enabled {
        let material = options.tls.load().await?;
        Some(tls::connector(material)?)
    } else {
        None
    };

    let mut config = client_config(target, options);

    match connector {
        Some(connector) => {
            config.ssl_mode(SslMode::Require);
            let (client, connection) = config.connect(connector).await.map_err(connect_error)?;
            Ok((client, spawn_driver(connection)))
        },
        None => {
            let (client, connection) = config.connect(NoTls).await.map_err(connect_error)?;
            Ok((client, spawn_driver(connection)))
        },
    }
}

/// Builds the `tokio-postgres` configuration for a target.
fn client_config(target: &Target, options: &Options) -> tokio_postgres::Config {
    let mut config = tokio_postgres::Config::new();
    config
        .host(&target.host)
        .port(target.port)
        .dbname(&options.database)
        .application_name("kvlock");
    if let Some(user) = &target.user {
        config.user(user);
    }
    if let Some(password) = &target.password {
        config.password(password.expose_secret());
    }
    config
}

/// Drives a connection future until the client goes away.
fn spawn_driver<S, T>(connection: tokio_postgres::Connection<S, T>) -> JoinHandle<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::warn!(error = %e, "Postgres connection closed with error");
        }
    })
}

#[allow(clippy::needless_pass_by_value)]
fn connect_error(e: tokio_postgres::Error) -> Error {
    Error::Connection {
        operation: "connect_postgres".to_string(),
        cause: e.to_string(),
    }
}

//! The control-connection capability consumed by the lifecycle controller.
//!
//! The controller never speaks the SQL wire protocol itself; it talks to a
//! freshly started server through the narrow [`ControlClient`] interface and
//! obtains clients from a [`ClientFactory`]. The factory seam is what the
//! readiness retrier keys off: a [`ClientError::Refused`] failure means "the
//! server is still coming up, try again", anything else is terminal.
//!
//! [`PgClientFactory`] is the default production implementation, backed by
//! `tokio-postgres`. Test suites substitute their own factory through
//! [`Config::client_factory`](crate::Config::client_factory).

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;

/// Failure classes a client can report.
///
/// Only `Refused` is interpreted as "server still starting up" and retried by
/// the readiness poller; every other failure (authentication, protocol
/// mismatch, query errors) is terminal.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("connection refused: {0}")]
    Refused(String),

    #[error("{0}")]
    Other(String),
}

impl ClientError {
    /// Whether this failure belongs to the connection-refused class.
    pub fn is_refused(&self) -> bool {
        matches!(self, ClientError::Refused(_))
    }
}

/// Parameters handed to a [`ClientFactory`].
///
/// `options` is the explicitly-typed pass-through bag from
/// [`Config::client_option`](crate::Config::client_option); the controller
/// forwards it verbatim and attaches no meaning to its keys.
#[derive(Clone, Debug)]
pub struct ConnectParams {
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub password: Option<String>,
    pub database: String,
    pub options: HashMap<String, String>,
}

impl ConnectParams {
    /// Render the parameters as a libpq-style `key=value` configuration
    /// string, quoting values where needed.
    pub fn config_string(&self) -> String {
        let mut parts = vec![
            format!("host={}", quote_value(&self.host)),
            format!("port={}", self.port),
            format!("dbname={}", quote_value(&self.database)),
        ];

        if let Some(ref user) = self.user {
            parts.push(format!("user={}", quote_value(user)));
        }
        if let Some(ref password) = self.password {
            parts.push(format!("password={}", quote_value(password)));
        }

        // Deterministic order so the string is stable for logging and tests
        let mut extra: Vec<_> = self.options.iter().collect();
        extra.sort_by_key(|(key, _)| key.as_str());
        for (key, value) in extra {
            parts.push(format!("{}={}", key, quote_value(value)));
        }

        parts.join(" ")
    }
}

/// Quote a libpq configuration value if it contains whitespace, quotes, or
/// is empty.
fn quote_value(value: &str) -> String {
    if !value.is_empty() && !value.contains([' ', '\'', '\\']) {
        return value.to_string();
    }

    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('\'');
    for ch in value.chars() {
        if ch == '\'' || ch == '\\' {
            quoted.push('\\');
        }
        quoted.push(ch);
    }
    quoted.push('\'');
    quoted
}

/// An open control connection.
///
/// The surface is deliberately minimal: the controller needs exactly one
/// parameterized count query (the database-existence check), one statement
/// execution (`CREATE DATABASE`), and an orderly close.
#[async_trait]
pub trait ControlClient: Send {
    /// Run a query returning a single `bigint` column with one text
    /// parameter bound to `$1`.
    async fn query_count(&mut self, text: &str, param: &str) -> Result<i64, ClientError>;

    /// Execute a statement, discarding any result.
    async fn execute(&mut self, text: &str) -> Result<(), ClientError>;

    /// Close the connection.
    async fn end(self: Box<Self>) -> Result<(), ClientError>;
}

/// Produces control connections for a running instance.
#[async_trait]
pub trait ClientFactory: Send + Sync {
    async fn connect(&self, params: &ConnectParams) -> Result<Box<dyn ControlClient>, ClientError>;
}

/// Default factory backed by `tokio-postgres`.
#[derive(Clone, Copy, Debug, Default)]
pub struct PgClientFactory;

#[async_trait]
impl ClientFactory for PgClientFactory {
    async fn connect(&self, params: &ConnectParams) -> Result<Box<dyn ControlClient>, ClientError> {
        let config: tokio_postgres::Config = params
            .config_string()
            .parse()
            .map_err(|e: tokio_postgres::Error| ClientError::Other(e.to_string()))?;

        let (client, connection) = config
            .connect(tokio_postgres::NoTls)
            .await
            .map_err(classify)?;

        // The connection object drives the protocol; it resolves once the
        // client half is dropped.
        let driver = tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::debug!(error = %e, "control connection closed with error");
            }
        });

        Ok(Box::new(PgControlClient { client, driver }))
    }
}

struct PgControlClient {
    client: tokio_postgres::Client,
    driver: tokio::task::JoinHandle<()>,
}

#[async_trait]
impl ControlClient for PgControlClient {
    async fn query_count(&mut self, text: &str, param: &str) -> Result<i64, ClientError> {
        let row = self
            .client
            .query_one(text, &[&param])
            .await
            .map_err(classify)?;
        row.try_get(0).map_err(classify)
    }

    async fn execute(&mut self, text: &str) -> Result<(), ClientError> {
        self.client.batch_execute(text).await.map_err(classify)
    }

    async fn end(self: Box<Self>) -> Result<(), ClientError> {
        let PgControlClient { client, driver } = *self;
        drop(client);
        if let Err(e) = driver.await {
            if !e.is_cancelled() {
                return Err(ClientError::Other(format!(
                    "connection task failed: {}",
                    e
                )));
            }
        }
        Ok(())
    }
}

/// Map a tokio-postgres error into the two classes the retrier cares about.
fn classify(error: tokio_postgres::Error) -> ClientError {
    if source_is_refused(&error) {
        ClientError::Refused(error.to_string())
    } else {
        ClientError::Other(error.to_string())
    }
}

fn source_is_refused(error: &(dyn std::error::Error + 'static)) -> bool {
    let mut current = Some(error);
    while let Some(err) = current {
        if let Some(io) = err.downcast_ref::<std::io::Error>() {
            if io.kind() == std::io::ErrorKind::ConnectionRefused {
                return true;
            }
        }
        current = err.source();
    }
    false
}

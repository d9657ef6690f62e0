//! Connection-readiness polling and the ensure-database step.
//!
//! `pg_ctl -w` returning does not guarantee the server accepts connections
//! yet, so the controller polls with a fixed backoff. Only the
//! connection-refused class means "still coming up"; an authentication or
//! protocol failure on a freshly initialized cluster indicates a real
//! problem and is surfaced immediately instead of burning the budget.

use std::time::Duration;

use crate::client::{ClientFactory, ConnectParams, ControlClient};
use crate::error::{Error, Result};

/// Connection attempts before giving up.
pub(super) const READY_ATTEMPTS: u32 = 5;

/// Fixed pause between attempts. No exponential growth, no jitter; callers
/// needing a harder deadline impose it externally.
pub(super) const READY_BACKOFF: Duration = Duration::from_millis(1000);

/// Poll until a control connection succeeds or the budget is exhausted.
///
/// Attempts are strictly sequential; there is never more than one
/// outstanding connection attempt per instance.
pub(super) async fn wait_ready(
    factory: &dyn ClientFactory,
    params: &ConnectParams,
    max_attempts: u32,
    backoff: Duration,
) -> Result<Box<dyn ControlClient>> {
    let mut last_refusal = None;

    for attempt in 1..=max_attempts {
        match factory.connect(params).await {
            Ok(client) => {
                tracing::debug!(attempt, "control connection established");
                return Ok(client);
            }
            Err(e) if e.is_refused() => {
                tracing::debug!(attempt, error = %e, "connection refused; server still coming up");
                last_refusal = Some(e);
                if attempt < max_attempts {
                    tokio::time::sleep(backoff).await;
                }
            }
            // Anything but refusal is terminal: retrying an auth or
            // protocol failure cannot succeed.
            Err(e) => return Err(Error::Client(e)),
        }
    }

    Err(Error::Connection {
        attempts: max_attempts,
        detail: last_refusal
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no connection attempts were made".to_string()),
    })
}

/// Create `database` if and only if it does not already exist. Returns
/// whether it was created.
///
/// The name is compared as stored; no case normalization happens on either
/// side. This is what makes `start()` idempotent against a recycled base
/// directory: the second run finds the database and leaves it alone.
pub(super) async fn ensure_database(
    client: &mut dyn ControlClient,
    database: &str,
) -> Result<bool> {
    let count = client
        .query_count(
            "SELECT count(*) AS have_database FROM pg_database WHERE datname = $1",
            database,
        )
        .await?;

    if count == 0 {
        client
            .execute(&format!("CREATE DATABASE {}", database))
            .await?;
        tracing::debug!(database, "target database created");
        Ok(true)
    } else {
        tracing::debug!(database, "target database already exists");
        Ok(false)
    }
}

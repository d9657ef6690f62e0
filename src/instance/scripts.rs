//! Running SQL through the interactive query program.
//!
//! Seed scripts and ad-hoc statements go through `psql` in batch mode:
//! single transaction, no `.psqlrc`, quiet, stop on first error. From 9.6
//! the program accepts several `-c`/`-f` operations in one invocation;
//! older servers get one invocation per operation, which weakens
//! single-transaction semantics but rarely matters in test scenarios.

use std::ffi::OsString;
use std::path::PathBuf;

use super::core::Instance;
use super::exec;
use crate::discovery::{PSQL_BATCH_VERSION, PSQL_ECHO_ERRORS_VERSION};
use crate::error::{Error, Result};

/// Anything below WARNING is noise in batch mode; scoped to the spawned
/// program, the caller's environment is never touched.
const PSQL_VERBOSITY: (&str, &str) = ("PGOPTIONS", "--client-min-messages=warning");

/// One unit of work for a `psql` invocation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PsqlOp {
    /// Run a SQL file (`-f`).
    File(PathBuf),
    /// Run a single statement (`-c`).
    Command(String),
}

/// Short-lived runner borrowing the instance, constructed per call.
pub(super) struct PsqlRunner<'a> {
    instance: &'a Instance,
}

impl<'a> PsqlRunner<'a> {
    pub(super) fn new(instance: &'a Instance) -> Self {
        Self { instance }
    }

    /// Run the operations, batching them into a single invocation when the
    /// server is new enough. Returns captured stdout, one entry per
    /// invocation.
    pub(super) async fn run_ops(&self, ops: &[PsqlOp]) -> Result<Vec<String>> {
        if ops.is_empty() {
            return Ok(Vec::new());
        }

        let version = self.instance.server_version().await?;

        if version >= PSQL_BATCH_VERSION {
            Ok(vec![self.invoke(ops, version).await?])
        } else {
            let mut outputs = Vec::with_capacity(ops.len());
            for op in ops {
                outputs.push(self.invoke(std::slice::from_ref(op), version).await?);
            }
            Ok(outputs)
        }
    }

    async fn invoke(&self, ops: &[PsqlOp], version: f64) -> Result<String> {
        let psql = self.instance.psql()?.to_path_buf();
        let base_dir = self.instance.base_dir().ok_or(Error::TornDown)?;
        let port = self.instance.port().ok_or(Error::NotRunning)?;
        let owner = self.instance.database_owner()?;

        let args = build_psql_args(
            owner,
            &self.instance.database,
            self.instance.host(),
            port,
            version,
            &self.instance.extra_psql_args,
            ops,
        );

        let output = exec::run(
            &psql,
            &args,
            self.instance.uid,
            &base_dir,
            &[PSQL_VERBOSITY],
        )
        .await
        .map_err(|e| Error::Psql(e.to_string()))?;

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl Instance {
    /// Run SQL operations through `psql` against the target database.
    /// Available once started.
    pub async fn run_psql(&self, ops: &[PsqlOp]) -> Result<Vec<String>> {
        PsqlRunner::new(self).run_ops(ops).await
    }

    /// Run a single SQL file through `psql`.
    pub async fn run_psql_file(&self, path: impl Into<PathBuf>) -> Result<String> {
        let outputs = self.run_psql(&[PsqlOp::File(path.into())]).await?;
        Ok(outputs.into_iter().next().unwrap_or_default())
    }
}

/// Assemble the full `psql` argument list for one invocation.
fn build_psql_args(
    owner: &str,
    database: &str,
    host: &str,
    port: u16,
    version: f64,
    extra_args: &[String],
    ops: &[PsqlOp],
) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![
        OsString::from("-U"),
        OsString::from(owner),
        OsString::from("-d"),
        OsString::from(database),
        OsString::from("-h"),
        OsString::from(host),
        OsString::from("-p"),
        OsString::from(port.to_string()),
        // Single transaction, skip .psqlrc, quiet, stop on first error
        OsString::from("-1"),
        OsString::from("-X"),
        OsString::from("-q"),
        OsString::from("-v"),
        OsString::from("ON_ERROR_STOP=1"),
    ];

    if version >= PSQL_ECHO_ERRORS_VERSION {
        args.push(OsString::from("-b"));
    }

    args.extend(extra_args.iter().map(OsString::from));

    for op in ops {
        match op {
            PsqlOp::File(path) => {
                args.push(OsString::from("-f"));
                args.push(path.clone().into());
            }
            PsqlOp::Command(stmt) => {
                args.push(OsString::from("-c"));
                args.push(OsString::from(stmt));
            }
        }
    }

    args
}

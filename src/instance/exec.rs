//! Spawning external PostgreSQL programs.
//!
//! Both flavors share the same shape: run with the instance's base directory
//! as the working directory, drop privileges to the configured uid, capture
//! output, and treat a non-zero exit as failure carrying the program's
//! stderr. The blocking flavor exists solely for the process-exit path,
//! where no suspension is permitted.

use std::ffi::OsString;
use std::fmt;
use std::path::Path;
use std::process::{Output, Stdio};

use nix::unistd::Uid;

/// A failed program invocation: which program and why.
///
/// Callers map this into the appropriate error-taxonomy variant (init vs
/// start vs teardown); the exec layer itself has no opinion.
#[derive(Debug)]
pub(crate) struct CommandFailure {
    pub(crate) program: String,
    pub(crate) detail: String,
}

impl fmt::Display for CommandFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.program, self.detail)
    }
}

fn failure(program: &Path, detail: String) -> CommandFailure {
    CommandFailure {
        program: program.display().to_string(),
        detail,
    }
}

fn describe_output(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stderr = stderr.trim();
    if stderr.is_empty() {
        format!("exited with {}", output.status)
    } else {
        format!("{} ({})", stderr, output.status)
    }
}

pub(crate) async fn run(
    program: &Path,
    args: &[OsString],
    uid: Option<Uid>,
    cwd: &Path,
    env: &[(&str, &str)],
) -> Result<Output, CommandFailure> {
    let mut cmd = tokio::process::Command::new(program);
    cmd.args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    for (key, value) in env {
        cmd.env(key, value);
    }
    if let Some(uid) = uid {
        cmd.uid(uid.as_raw());
    }

    tracing::debug!(program = %program.display(), ?args, "running");

    let output = cmd
        .output()
        .await
        .map_err(|e| failure(program, format!("cannot execute: {}", e)))?;

    if output.status.success() {
        Ok(output)
    } else {
        Err(failure(program, describe_output(&output)))
    }
}

/// Blocking twin of [`run`], for the process-exit path only.
pub(crate) fn run_blocking(
    program: &Path,
    args: &[OsString],
    uid: Option<Uid>,
    cwd: &Path,
) -> Result<Output, CommandFailure> {
    use std::os::unix::process::CommandExt;

    let mut cmd = std::process::Command::new(program);
    cmd.args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(uid) = uid {
        cmd.uid(uid.as_raw());
    }

    let output = cmd
        .output()
        .map_err(|e| failure(program, format!("cannot execute: {}", e)))?;

    if output.status.success() {
        Ok(output)
    } else {
        Err(failure(program, describe_output(&output)))
    }
}

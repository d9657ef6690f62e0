//! Port allocation by bounded retry.
//!
//! There is no race-free OS primitive for "reserve this port for a process
//! I am about to spawn", so the allocator simply asks `pg_ctl` to start the
//! daemon on a candidate port and walks upwards on failure. Every start
//! failure is treated as "port unavailable": the control program's failure
//! surface is opaque, and attempting to distinguish a bind conflict from
//! any other startup problem would change which error callers see on
//! genuine misconfiguration. After the attempt budget is spent, the last
//! underlying failure is surfaced.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use nix::unistd::Uid;

use super::core::DATA_DIR_NAME;
use super::exec;
use crate::error::{Error, Result};

/// Attempts made by the default port walk.
pub(super) const DEFAULT_PORT_ATTEMPTS: u16 = 10;

/// Pid file written by the daemon into its data directory.
pub(super) const PID_FILE_NAME: &str = "postmaster.pid";

/// Everything needed to launch the daemon on one candidate port.
///
/// Free-standing rather than borrowing the whole `Instance`: the launcher
/// only needs resolved paths and copies of the argument lists, and taking
/// them by field sidesteps borrow conflicts with the instance's mutable
/// lifecycle state.
pub(super) struct DaemonLauncher<'a> {
    pub(super) ctl: &'a Path,
    pub(super) base_dir: &'a Path,
    pub(super) server_args: &'a [String],
    pub(super) uid: Option<Uid>,
}

impl DaemonLauncher<'_> {
    fn data_dir(&self) -> PathBuf {
        self.base_dir.join(DATA_DIR_NAME)
    }

    /// One start attempt on `port`. On success returns the daemon pid read
    /// back from the pid file.
    pub(super) async fn try_start(&self, port: u16) -> Result<u32> {
        let data_dir = self.data_dir();
        let logfile = self.base_dir.join(super::core::SERVER_LOG_NAME);

        let mut server_opts = self.server_args.join(" ");
        server_opts.push_str(&format!(" -p {}", port));

        let args: Vec<OsString> = vec![
            OsString::from("start"),
            OsString::from("-s"),
            OsString::from("-w"),
            OsString::from("-D"),
            data_dir.clone().into(),
            OsString::from("-l"),
            logfile.into(),
            OsString::from("-o"),
            OsString::from(server_opts),
        ];

        exec::run(self.ctl, &args, self.uid, self.base_dir, &[])
            .await
            .map_err(|e| Error::Startup {
                port,
                detail: e.to_string(),
            })?;

        let pid_path = data_dir.join(PID_FILE_NAME);
        let contents = tokio::fs::read_to_string(&pid_path)
            .await
            .map_err(|e| Error::PidFile {
                path: pid_path.clone(),
                detail: e.to_string(),
            })?;

        parse_pid_file(&contents).map_err(|detail| Error::PidFile {
            path: pid_path,
            detail,
        })
    }

    /// Walk ports upwards from `start_port`, one start attempt per port,
    /// spending at most `attempts` attempts.
    pub(super) async fn allocate(&self, start_port: u16, attempts: u16) -> Result<(u16, u32)> {
        let mut last: Option<Error> = None;
        let mut port = start_port;

        for attempt in 0..attempts {
            match self.try_start(port).await {
                Ok(pid) => {
                    tracing::debug!(port, pid, "daemon started");
                    return Ok((port, pid));
                }
                Err(e) => {
                    tracing::debug!(port, error = %e, "start attempt failed");
                    last = Some(e);
                }
            }

            if attempt + 1 < attempts {
                port = port.checked_add(1).ok_or_else(|| Error::Startup {
                    port,
                    detail: "port range exhausted".to_string(),
                })?;
            }
        }

        Err(Error::Startup {
            port,
            detail: last
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no attempts were made".to_string()),
        })
    }
}

/// Extract the daemon pid from pid-file contents: the first
/// newline-delimited line only, as a positive decimal integer. Later lines
/// carry unrelated metadata.
pub(super) fn parse_pid_file(contents: &str) -> std::result::Result<u32, String> {
    let first_line = contents.lines().next().unwrap_or("").trim();
    let pid: i64 = first_line
        .parse()
        .map_err(|_| format!("invalid process id: {:?}", first_line))?;
    if pid <= 0 {
        return Err(format!("invalid process id: {}", pid));
    }
    u32::try_from(pid).map_err(|_| format!("invalid process id: {}", pid))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn takes_first_line_only() {
        let contents = "4242\n/tmp/base/data\n1700000000\n15432\n";
        assert_eq!(parse_pid_file(contents), Ok(4242));
    }

    #[test]
    fn single_line_without_newline() {
        assert_eq!(parse_pid_file("17"), Ok(17));
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_pid_file("not-a-pid\n").is_err());
        assert!(parse_pid_file("").is_err());
    }

    #[test]
    fn rejects_non_positive() {
        assert!(parse_pid_file("0\n").is_err());
        assert!(parse_pid_file("-5\n").is_err());
    }

    #[test]
    fn rejects_overflow() {
        assert!(parse_pid_file("99999999999999\n").is_err());
    }
}

use std::io;
use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

use crate::client::ClientError;

/// Errors surfaced by the instance lifecycle and its collaborators.
///
/// The variants fall into five families, each with different retry
/// semantics:
///
/// - discovery (`ProgramNotFound`, `ServerNotFound`, `VersionUnknown`,
///   `UnsupportedVersion`) — environment misconfiguration, fatal, never
///   retried;
/// - privilege (`RootUid`, `FallbackUser`, `OwnerUnresolved`) — fatal;
/// - startup (`Startup`, `InitFailed`, `PidFile`) — retried only inside the
///   port allocator, otherwise fatal;
/// - connection (`Connection`, `Client`) — the refused class is retried up
///   to the readiness budget, everything else is terminal;
/// - teardown (`Teardown`) — reported, but in-memory state is cleared
///   regardless so the controller never wedges on a stuck file lock.
#[derive(Error, Diagnostic, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("Cannot find {program}")]
    #[diagnostic(
        code(pg_testbed::discovery::not_found),
        help("Install PostgreSQL, or point PATH or POSTGRES_HOME at its installation root")
    )]
    ProgramNotFound { program: String },

    #[error("Cannot find the PostgreSQL server executable (postgres or postmaster)")]
    #[diagnostic(
        code(pg_testbed::discovery::server_not_found),
        help("Install PostgreSQL, or point PATH or POSTGRES_HOME at its installation root")
    )]
    ServerNotFound,

    #[error("Cannot determine the PostgreSQL version from `{program} --version`: {output:?}")]
    #[diagnostic(code(pg_testbed::discovery::version))]
    VersionUnknown { program: String, output: String },

    #[error("PostgreSQL {version} is not supported; 9.0 is the minimum")]
    #[diagnostic(
        code(pg_testbed::discovery::unsupported),
        help("Point POSTGRES_HOME at a newer installation")
    )]
    UnsupportedVersion { version: f64 },

    #[error("uid 0 is not allowed; the PostgreSQL server refuses to run as root")]
    #[diagnostic(code(pg_testbed::privilege::root), help("Set `uid` to a non-root user id"))]
    RootUid,

    #[error("Running as root and cannot fall back to user '{user}': {reason}")]
    #[diagnostic(
        code(pg_testbed::privilege::fallback),
        help("Set `uid` to a non-root user id")
    )]
    FallbackUser { user: String, reason: String },

    #[error("Cannot resolve the database owner account for uid {uid}")]
    #[diagnostic(code(pg_testbed::privilege::owner))]
    OwnerUnresolved { uid: u32 },

    #[error("Failed to initialize database cluster in {}: {detail}", .data_dir.display())]
    #[diagnostic(code(pg_testbed::startup::init))]
    InitFailed { data_dir: PathBuf, detail: String },

    #[error("Failed to start PostgreSQL on port {port}: {detail}")]
    #[diagnostic(
        code(pg_testbed::startup::port),
        help("Every port in the retry budget was tried; the last failure is shown above")
    )]
    Startup { port: u16, detail: String },

    #[error("Invalid pid file {}: {detail}", .path.display())]
    #[diagnostic(code(pg_testbed::startup::pid_file))]
    PidFile { path: PathBuf, detail: String },

    #[error("Instance already started with pid {pid}; not restarting")]
    #[diagnostic(code(pg_testbed::lifecycle::already_running))]
    AlreadyRunning { pid: u32 },

    #[error("Instance is not running")]
    NotRunning,

    #[error("Instance base directory has been removed; construct a new instance")]
    TornDown,

    #[error("Cannot connect to the database after {attempts} attempts: {detail}")]
    #[diagnostic(
        code(pg_testbed::connection::exhausted),
        help("The server kept refusing connections; check the server log in the base directory")
    )]
    Connection { attempts: u32, detail: String },

    #[error("psql failed: {0}")]
    #[diagnostic(code(pg_testbed::psql))]
    Psql(String),

    #[error("Teardown failed: {0}")]
    #[diagnostic(
        code(pg_testbed::teardown),
        help("In-memory state was cleared anyway; the on-disk resource may need manual cleanup")
    )]
    Teardown(String),

    #[error("Client error: {0}")]
    Client(#[from] ClientError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

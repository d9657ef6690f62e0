//! Shared fixtures for the integration suites.
//!
//! The suites drive the full lifecycle without a PostgreSQL installation:
//! stand-in `pg_ctl` / `postgres` / `psql` shell scripts are prepended to
//! `PATH` once per test process, and control connections come from a
//! scripted [`MockFactory`] injected through `Config::client_factory`.
//!
//! The fake `pg_ctl start` spawns a real detached `sleep` as the "daemon"
//! and writes a multi-line `postmaster.pid`, so pid-liveness and teardown
//! behavior are exercised against genuine processes.

#![allow(dead_code)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::process::Command;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Once};

use async_trait::async_trait;
use parking_lot::Mutex;
use pg_testbed::{ClientError, ClientFactory, ConnectParams, ControlClient};

/// Stand-in for `pg_ctl`.
///
/// `init` materializes the data directory and records the initdb arguments
/// in `<base>/init.log`; `start` spawns a detached `sleep` as the daemon and
/// writes its pid into a multi-line `postmaster.pid`, refusing ports listed
/// in `<base>/refuse-ports`; `stop` kills the recorded pid. Every command is
/// appended to `<base>/ctl.log`.
const FAKE_PG_CTL: &str = r#"#!/bin/sh
cmd="$1"
shift

DATADIR=""
MODE=""
OPTS=""
while [ $# -gt 0 ]; do
    case "$1" in
        -D) DATADIR="$2"; shift 2 ;;
        -l) shift 2 ;;
        -o) OPTS="$2"; shift 2 ;;
        -m) MODE="$2"; shift 2 ;;
        *) shift ;;
    esac
done

BASEDIR=$(dirname "$DATADIR")

case "$cmd" in
    init)
        mkdir -p "$DATADIR" || exit 1
        printf 'sample configuration from the packager\n' > "$DATADIR/postgresql.conf"
        printf 'init %s\n' "$OPTS" >> "$BASEDIR/init.log"
        printf 'init\n' >> "$BASEDIR/ctl.log"
        ;;
    start)
        PORT=$(printf '%s' "$OPTS" | sed -n 's/.*-p \([0-9][0-9]*\).*/\1/p')
        printf 'start %s\n' "$PORT" >> "$BASEDIR/ctl.log"
        if [ -f "$BASEDIR/refuse-ports" ] && grep -q "^$PORT$" "$BASEDIR/refuse-ports"; then
            echo "could not bind to port $PORT" >&2
            exit 1
        fi
        sleep 600 >/dev/null 2>&1 &
        PID=$!
        {
            printf '%s\n' "$PID"
            printf '%s\n' "$DATADIR"
            printf '%s\n' "$(date +%s) unused metadata"
            printf '%s\n' "$PORT"
        } > "$DATADIR/postmaster.pid"
        ;;
    stop)
        printf 'stop %s\n' "$MODE" >> "$BASEDIR/ctl.log"
        if [ -f "$DATADIR/postmaster.pid" ]; then
            kill "$(head -n 1 "$DATADIR/postmaster.pid")" 2>/dev/null
            rm -f "$DATADIR/postmaster.pid"
        fi
        ;;
    *)
        echo "unknown command: $cmd" >&2
        exit 1
        ;;
esac
exit 0
"#;

/// Stand-in for the server daemon; only `--version` matters. The reported
/// version is controlled through `FAKE_PG_VERSION`.
const FAKE_POSTGRES: &str = r#"#!/bin/sh
echo "postgres (PostgreSQL) ${FAKE_PG_VERSION:-12.3}"
exit 0
"#;

/// Stand-in for `psql`: records each invocation's arguments in
/// `./psql.log` and the verbosity variable in `./psql-env.log` (the library
/// runs it with the base directory as working directory).
const FAKE_PSQL: &str = r#"#!/bin/sh
printf '%s\n' "$*" >> ./psql.log
printf '%s\n' "${PGOPTIONS:-unset}" >> ./psql-env.log
exit 0
"#;

static INSTALL: Once = Once::new();

/// Prepend the fake programs to `PATH`, once per test process.
pub fn install_fake_programs() {
    INSTALL.call_once(|| {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();

        let bin = std::env::temp_dir()
            .join(format!("pg-testbed-fakes-{}", std::process::id()))
            .join("bin");
        fs::create_dir_all(&bin).expect("create fake bin dir");

        write_script(&bin.join("pg_ctl"), FAKE_PG_CTL);
        write_script(&bin.join("postgres"), FAKE_POSTGRES);
        write_script(&bin.join("psql"), FAKE_PSQL);

        let path = std::env::var("PATH").unwrap_or_default();
        std::env::set_var("PATH", format!("{}:{}", bin.display(), path));
    });
}

fn write_script(path: &Path, contents: &str) {
    fs::write(path, contents).expect("write fake program");
    fs::set_permissions(path, fs::Permissions::from_mode(0o755)).expect("chmod fake program");
}

/// Whether a process is still running.
///
/// A bare `kill -0` probe only tests pid existence, which counts a zombie
/// (a terminated process awaiting reaping by its parent) as "alive". The
/// fake daemon is a `sleep` reparented to pid 1; if that init does not reap
/// promptly, a killed daemon lingers as a zombie. Consult `/proc` so the
/// probe reflects actual liveness: a missing entry or a `Z` (zombie) state
/// both mean "not running".
pub fn pid_alive(pid: u32) -> bool {
    match fs::read_to_string(format!("/proc/{}/stat", pid)) {
        Ok(stat) => {
            // `/proc/<pid>/stat`: "pid (comm) state ...". The command name
            // may contain spaces/parens, so the state char is the first
            // field after the final ')'.
            let state = stat
                .rsplit_once(')')
                .and_then(|(_, rest)| rest.split_whitespace().next());
            !matches!(state, Some("Z") | None)
        }
        Err(_) => false,
    }
}

/// Open up a caller-supplied directory so the daemon uid (possibly
/// `nobody`, when the suite runs as root) can write into it.
pub fn permissive(dir: &Path) {
    fs::set_permissions(dir, fs::Permissions::from_mode(0o777)).expect("chmod base dir");
}

/// Lines of a log file the fake programs wrote under the base directory.
pub fn read_log(base: &Path, name: &str) -> Vec<String> {
    fs::read_to_string(base.join(name))
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}

/// Make the fake `pg_ctl` refuse to start on these ports.
pub fn refuse_ports(base: &Path, ports: impl IntoIterator<Item = u16>) {
    let contents: String = ports.into_iter().map(|p| format!("{}\n", p)).collect();
    fs::write(base.join("refuse-ports"), contents).expect("write refuse-ports");
}

/// Scripted control-connection factory.
///
/// Dispenses a configurable number of connection refusals before handing
/// out clients; every client records its statements into the shared log.
pub struct MockFactory {
    refusals: AtomicU32,
    terminal: bool,
    have_database: i64,
    pub connects: AtomicU32,
    pub log: Arc<Mutex<Vec<String>>>,
}

impl MockFactory {
    /// Connects on the first attempt; `have_database` answers the
    /// existence check.
    pub fn immediate(have_database: i64) -> Arc<Self> {
        Self::refusing(0, have_database)
    }

    /// Refuses the first `refusals` attempts, then connects.
    pub fn refusing(refusals: u32, have_database: i64) -> Arc<Self> {
        Arc::new(Self {
            refusals: AtomicU32::new(refusals),
            terminal: false,
            have_database,
            connects: AtomicU32::new(0),
            log: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// Every connection attempt fails with a terminal (non-refused) error.
    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            refusals: AtomicU32::new(0),
            terminal: true,
            have_database: 0,
            connects: AtomicU32::new(0),
            log: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn statements(&self) -> Vec<String> {
        self.log.lock().clone()
    }
}

#[async_trait]
impl ClientFactory for MockFactory {
    async fn connect(&self, params: &ConnectParams) -> Result<Box<dyn ControlClient>, ClientError> {
        self.connects.fetch_add(1, Ordering::SeqCst);

        if self.terminal {
            return Err(ClientError::Other(
                "password authentication failed".to_string(),
            ));
        }

        let remaining = self.refusals.load(Ordering::SeqCst);
        if remaining > 0 {
            self.refusals.store(remaining - 1, Ordering::SeqCst);
            return Err(ClientError::Refused("ECONNREFUSED".to_string()));
        }

        self.log
            .lock()
            .push(format!("connect {}", params.database));
        Ok(Box::new(MockClient {
            have_database: self.have_database,
            log: Arc::clone(&self.log),
        }))
    }
}

struct MockClient {
    have_database: i64,
    log: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl ControlClient for MockClient {
    async fn query_count(&mut self, _text: &str, param: &str) -> Result<i64, ClientError> {
        self.log.lock().push(format!("count {}", param));
        Ok(self.have_database)
    }

    async fn execute(&mut self, text: &str) -> Result<(), ClientError> {
        self.log.lock().push(text.to_string());
        Ok(())
    }

    async fn end(self: Box<Self>) -> Result<(), ClientError> {
        self.log.lock().push("end".to_string());
        Ok(())
    }
}

//! The lifecycle state machine: `setup → start → (serve) → stop`, plus the
//! non-suspending `stop_sync` variant run from the process-exit hook.
//!
//! Teardown is one algorithm in two flavors. A [`TeardownPlan`] is computed
//! under the state lock (clearing the in-memory record in the same breath),
//! then executed either asynchronously (`stop`) or with blocking operations
//! only (`stop_sync`, exit hook). Clearing before executing is deliberate:
//! a stuck file lock or failing stop command must not leave the controller
//! permanently unusable, at the accepted risk of an orphaned resource.

use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::Arc;

use nix::unistd::Uid;

use super::core::{Instance, LifeState, SyncMutex, DATA_DIR_NAME, MAINTENANCE_DATABASE};
use super::ports::{DaemonLauncher, DEFAULT_PORT_ATTEMPTS};
use super::readiness::{self, READY_ATTEMPTS, READY_BACKOFF};
use super::scripts::{PsqlOp, PsqlRunner};
use super::exec;
use crate::error::{Error, Result};
use crate::exit_guard;

/// Server configuration file under the data directory.
const SERVER_CONFIG_NAME: &str = "postgresql.conf";

impl Instance {
    /// Materialize the on-disk data directory. Idempotent: a second call
    /// returns immediately, and an existing data directory is never
    /// reinitialized — that is what makes recycling a caller-supplied base
    /// directory safe.
    #[tracing::instrument(skip(self), fields(database = %self.database))]
    pub async fn setup(&mut self) -> Result<()> {
        if self.state.lock().setup_done {
            return Ok(());
        }

        let base_dir = self.base_dir().ok_or(Error::TornDown)?;
        let data_dir = base_dir.join(DATA_DIR_NAME);

        let exists = tokio::fs::metadata(&data_dir)
            .await
            .map(|meta| meta.is_dir())
            .unwrap_or(false);

        if !exists {
            let ctl = self.pg_ctl().await?.to_path_buf();
            let init_args = self.initdb_args()?;

            let args: Vec<OsString> = vec![
                OsString::from("init"),
                OsString::from("-s"),
                OsString::from("-w"),
                OsString::from("-D"),
                data_dir.clone().into(),
                OsString::from("-o"),
                OsString::from(init_args.join(" ")),
            ];

            exec::run(&ctl, &args, self.uid, &base_dir, &[])
                .await
                .map_err(|e| Error::InitFailed {
                    data_dir: data_dir.clone(),
                    detail: e.to_string(),
                })?;

            tracing::info!(data_dir = %data_dir.display(), "database cluster initialized");

            // Write the caller's configuration, or truncate to the server's
            // built-in defaults: packagers mess with postgresql.conf.sample
            // too much for the initdb-produced file to be trustworthy.
            let config_path = data_dir.join(SERVER_CONFIG_NAME);
            match &self.server_config {
                Some(contents) => tokio::fs::write(&config_path, contents).await?,
                None => {
                    tokio::fs::File::create(&config_path).await?;
                }
            }
        } else {
            tracing::debug!(
                data_dir = %data_dir.display(),
                "data directory already present; skipping init"
            );
        }

        self.state.lock().setup_done = true;
        Ok(())
    }

    /// Start the daemon, wait for it to accept connections, and make sure
    /// the target database exists.
    ///
    /// An explicit configured port gets exactly one attempt; otherwise the
    /// allocator walks upwards from the base port within its budget. On
    /// success the instance registers its synchronous teardown with the
    /// process-wide exit guard before any readiness polling begins, so a
    /// crash mid-poll still cleans up the daemon.
    ///
    /// Calling `start` on a running instance is a caller bug in test
    /// hooks common enough to deserve a soft landing: a warning plus an
    /// [`Error::AlreadyRunning`] rejection, never a silent no-op and never
    /// a panic.
    #[tracing::instrument(skip(self), fields(database = %self.database))]
    pub async fn start(&mut self) -> Result<()> {
        if let Some(pid) = self.pid() {
            tracing::warn!(pid, "instance already started; not restarting");
            return Err(Error::AlreadyRunning { pid });
        }

        self.setup().await?;

        let base_dir = self.base_dir().ok_or(Error::TornDown)?;
        let ctl = self.pg_ctl().await?.to_path_buf();
        let server_args = self.server_args();

        let launcher = DaemonLauncher {
            ctl: &ctl,
            base_dir: &base_dir,
            server_args: &server_args,
            uid: self.uid,
        };

        // An explicitly configured port is authoritative: no walking.
        let (port, pid) = match self.port().or(self.explicit_port) {
            Some(port) => (port, launcher.try_start(port).await?),
            None => launcher.allocate(self.base_port, DEFAULT_PORT_ATTEMPTS).await?,
        };

        {
            let mut state = self.state.lock();
            state.port = Some(port);
            state.pid = Some(pid);
            state.started = true;
            state.registration = Some(register_exit_hook(
                Arc::clone(&self.state),
                ctl,
                self.uid,
                self.owns_base_dir,
            ));
        }

        tracing::info!(port, pid, "server running");

        match self.finish_start().await {
            Ok(()) => Ok(()),
            Err(e) => {
                // The daemon is up but unusable; take it back down so a
                // failed start leaves neither a pid nor a running process.
                if let Err(teardown) = self.stop().await {
                    tracing::warn!(error = %teardown, "cleanup after failed start also failed");
                }
                Err(e)
            }
        }
    }

    /// Readiness polling, the ensure-database step, and seed scripts.
    async fn finish_start(&mut self) -> Result<()> {
        let params = self.params_for(MAINTENANCE_DATABASE)?;
        let mut client =
            readiness::wait_ready(self.factory.as_ref(), &params, READY_ATTEMPTS, READY_BACKOFF)
                .await?;

        let ensured = readiness::ensure_database(client.as_mut(), &self.database).await;
        // The control connection is closed whether or not creation happened
        let closed = client.end().await;
        ensured?;
        closed.map_err(Error::Client)?;

        if !self.seed_scripts.is_empty() {
            let ops: Vec<PsqlOp> = self
                .seed_scripts
                .iter()
                .map(|path| PsqlOp::File(path.clone()))
                .collect();
            PsqlRunner::new(self).run_ops(&ops).await?;
        }

        Ok(())
    }

    /// Graceful asynchronous shutdown.
    ///
    /// A no-op when not started. Otherwise: disconnect the cached client
    /// (best-effort — the daemon is about to be terminated regardless),
    /// issue a fast-mode stop, delete the base directory if this instance
    /// created it, and deregister from the exit guard. In-memory state is
    /// cleared even when the external steps fail.
    #[tracing::instrument(skip(self), fields(database = %self.database))]
    pub async fn stop(&mut self) -> Result<()> {
        if let Some(client) = self.client.take() {
            if let Err(e) = client.end().await {
                tracing::debug!(error = %e, "ignoring client disconnect failure during stop");
            }
        }

        let Some(plan) = begin_teardown(&self.state, self.owns_base_dir, &self.programs, self.uid, true)
        else {
            return Ok(());
        };

        plan.run().await
    }

    /// Non-suspending shutdown, safe to run from a process-exit handler.
    ///
    /// Same algorithm as [`stop`](Instance::stop), executed with blocking
    /// operations only. The cached client is dropped rather than ended;
    /// its connection dies with the daemon.
    pub fn stop_sync(&mut self) -> Result<()> {
        self.client = None;

        let Some(plan) = begin_teardown(&self.state, self.owns_base_dir, &self.programs, self.uid, false)
        else {
            return Ok(());
        };

        plan.run_blocking()
    }
}

/// The shared teardown algorithm, computed under the state lock.
///
/// Returns `None` when the instance is not started (idempotent stop). The
/// in-memory record — `started`, `pid`, the exit-guard registration, and
/// (for owned directories) `base_dir` — is cleared here, before anything
/// external runs.
fn begin_teardown(
    state: &SyncMutex<LifeState>,
    owns_base_dir: bool,
    programs: &super::core::Programs,
    uid: Option<Uid>,
    wait: bool,
) -> Option<TeardownPlan> {
    // pg_ctl was resolved during start; if it never was, nothing ever ran.
    let ctl = programs.ctl.get()?.clone();

    let mut st = state.lock();
    if !st.started {
        return None;
    }

    st.started = false;
    st.pid = None;
    // Dropping the registration deregisters the exit hook
    st.registration.take();

    let base_dir = st.base_dir.clone()?;
    let remove_dir = if owns_base_dir {
        st.base_dir.take()
    } else {
        None
    };

    Some(TeardownPlan {
        ctl,
        data_dir: base_dir.join(DATA_DIR_NAME),
        cwd: base_dir,
        uid,
        wait,
        remove_dir,
    })
}

/// One teardown, ready to execute in either flavor.
struct TeardownPlan {
    ctl: PathBuf,
    data_dir: PathBuf,
    cwd: PathBuf,
    uid: Option<Uid>,
    /// Whether to pass `-w`; the exit-hook path cannot afford to wait.
    wait: bool,
    /// Owned base directory to delete, if any.
    remove_dir: Option<PathBuf>,
}

impl TeardownPlan {
    fn stop_args(&self) -> Vec<OsString> {
        let mut args = vec![OsString::from("stop"), OsString::from("-s")];
        if self.wait {
            args.push(OsString::from("-w"));
        }
        args.push(OsString::from("-D"));
        args.push(self.data_dir.clone().into());
        args.push(OsString::from("-m"));
        args.push(OsString::from("fast"));
        args
    }

    async fn run(self) -> Result<()> {
        let mut failures = Vec::new();

        if let Err(e) = exec::run(&self.ctl, &self.stop_args(), self.uid, &self.cwd, &[]).await {
            failures.push(e.to_string());
        }

        if let Some(dir) = &self.remove_dir {
            if let Err(e) = tokio::fs::remove_dir_all(dir).await {
                failures.push(format!("cannot remove {}: {}", dir.display(), e));
            }
        }

        finish(failures)
    }

    fn run_blocking(self) -> Result<()> {
        let mut failures = Vec::new();

        if let Err(e) = exec::run_blocking(&self.ctl, &self.stop_args(), self.uid, &self.cwd) {
            failures.push(e.to_string());
        }

        if let Some(dir) = &self.remove_dir {
            if let Err(e) = std::fs::remove_dir_all(dir) {
                failures.push(format!("cannot remove {}: {}", dir.display(), e));
            }
        }

        finish(failures)
    }
}

fn finish(failures: Vec<String>) -> Result<()> {
    if failures.is_empty() {
        tracing::info!("server stopped");
        Ok(())
    } else {
        Err(Error::Teardown(failures.join("; ")))
    }
}

/// Register the synchronous teardown callback for a freshly started
/// instance. The callback is a no-op unless the instance is still running
/// when the process exits.
fn register_exit_hook(
    state: Arc<SyncMutex<LifeState>>,
    ctl: PathBuf,
    uid: Option<Uid>,
    owns_base_dir: bool,
) -> exit_guard::Registration {
    exit_guard::global().register(Box::new(move || {
        let plan = {
            let mut st = state.lock();
            if !st.started {
                return;
            }
            st.started = false;
            st.pid = None;
            st.registration.take();

            let Some(base_dir) = st.base_dir.clone() else {
                return;
            };
            let remove_dir = if owns_base_dir {
                st.base_dir.take()
            } else {
                None
            };

            TeardownPlan {
                ctl: ctl.clone(),
                data_dir: base_dir.join(DATA_DIR_NAME),
                cwd: base_dir,
                uid,
                wait: false,
                remove_dir,
            }
        };

        if let Err(e) = plan.run_blocking() {
            tracing::warn!(error = %e, "exit-hook teardown failed");
        }
    }))
}

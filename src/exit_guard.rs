//! Process-wide registry of synchronous teardown callbacks.
//!
//! Every running instance registers one callback here; on process exit the
//! remaining entries run so no daemon or temporary directory outlives the
//! test run. Registration hands back a [`Registration`] handle whose drop
//! removes exactly that entry, so a normally stopped instance never leaves a
//! dangling callback behind.
//!
//! Callbacks must be fully synchronous: they run from an `atexit` handler
//! where no further scheduling is guaranteed.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Once;

use once_cell::sync::Lazy;
use parking_lot::Mutex;

type Callback = Box<dyn FnMut() + Send>;

static GUARD: Lazy<ExitGuard> = Lazy::new(ExitGuard::new);
static INSTALL: Once = Once::new();

/// The process-wide registry. Installing the exit hook happens on first
/// access, exactly once.
pub fn global() -> &'static ExitGuard {
    INSTALL.call_once(|| {
        // SAFETY: registering a no-argument extern "C" function with atexit
        // has no preconditions; the handler only touches the static registry.
        unsafe {
            nix::libc::atexit(run_exit_hooks);
        }
    });
    &GUARD
}

extern "C" fn run_exit_hooks() {
    GUARD.run_pending();
}

struct Entry {
    id: u64,
    callback: Callback,
}

/// Registry of teardown callbacks keyed by registration id.
pub struct ExitGuard {
    entries: Mutex<Vec<Entry>>,
    next_id: AtomicU64,
}

impl ExitGuard {
    /// Create a standalone registry. Library code uses [`global`]; this
    /// constructor exists so tests can exercise the registry in isolation.
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a teardown callback. The callback stays registered until the
    /// returned handle is dropped or the process exits.
    pub fn register(&'static self, callback: Callback) -> Registration {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().push(Entry { id, callback });
        Registration { id, guard: self }
    }

    fn deregister(&self, id: u64) {
        self.entries.lock().retain(|entry| entry.id != id);
    }

    /// Run and drain every registered callback. Each entry is isolated: a
    /// panicking callback does not prevent the remaining ones from running.
    pub fn run_pending(&self) {
        // Drain under the lock, run outside it, so a callback that touches
        // the registry (or drops a Registration) cannot deadlock.
        let drained = std::mem::take(&mut *self.entries.lock());

        for mut entry in drained {
            if catch_unwind(AssertUnwindSafe(|| (entry.callback)())).is_err() {
                tracing::warn!(
                    registration = entry.id,
                    "exit hook panicked; continuing with remaining hooks"
                );
            }
        }
    }

    /// Number of live registrations.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ExitGuard {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to one registered callback; dropping it deregisters the entry.
pub struct Registration {
    id: u64,
    guard: &'static ExitGuard,
}

impl Registration {
    /// Remove the entry now. Equivalent to dropping the handle.
    pub fn deregister(self) {}
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.guard.deregister(self.id);
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration").field("id", &self.id).finish()
    }
}

//! Locating PostgreSQL executables and probing the server version.
//!
//! Installation layouts differ wildly across platforms and packagers; the
//! locator searches the active `PATH` first, then a `POSTGRES_HOME` override
//! root, then a list of conventional installation roots, some of which hold
//! version-numbered subdirectories (Debian's `/usr/lib/postgresql/16`,
//! Postgres.app bundles). Versioned subdirectories are ordered numerically,
//! highest first, so a `10` install beats a `9.6` one even though it sorts
//! lower lexically.

use std::env;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{Error, Result};

/// Environment variable naming an installation root searched before the
/// conventional ones.
pub const ENV_OVERRIDE_ROOT: &str = "POSTGRES_HOME";

/// Oldest server major version the lifecycle controller supports. Older
/// servers lack the pg_ctl behavior we rely on and are rejected outright.
pub const MIN_SUPPORTED_VERSION: f64 = 9.0;

/// psql accepts multiple `-c`/`-f` operations in one invocation from 9.6.
pub const PSQL_BATCH_VERSION: f64 = 9.6;

/// psql understands `-b` (echo failed statements) from 9.5.
pub const PSQL_ECHO_ERRORS_VERSION: f64 = 9.5;

/// Finds absolute paths to the external programs the controller spawns.
///
/// The search-root list is computed once at construction; no root is
/// searched twice.
#[derive(Clone, Debug)]
pub struct ProgramLocator {
    roots: Vec<PathBuf>,
}

impl ProgramLocator {
    /// Build a locator from the process environment: the `POSTGRES_HOME`
    /// override (if set) followed by the conventional installation roots.
    pub fn from_environment() -> Self {
        let mut roots = Vec::new();

        if let Some(home) = env::var_os(ENV_OVERRIDE_ROOT) {
            roots.push(PathBuf::from(home));
        }

        roots.push(PathBuf::from("/usr/local/pgsql"));
        // Debian and Ubuntu
        roots.extend(versioned_subdirs(Path::new("/usr/lib/postgresql")));
        // MacPorts
        roots.extend(versioned_subdirs(Path::new("/opt/local/lib/postgresql")));
        // Postgres.app
        roots.extend(versioned_subdirs(Path::new(
            "/Applications/Postgres.app/Contents/Versions",
        )));
        // BSDs tend to land in /usr/local/bin, which is not always on PATH
        roots.push(PathBuf::from("/usr/local"));

        Self { roots }
    }

    /// Build a locator with an explicit root list.
    pub fn with_roots(roots: Vec<PathBuf>) -> Self {
        Self { roots }
    }

    /// Find a program, failing with a discovery error when absent.
    pub fn locate(&self, program: &str) -> Result<PathBuf> {
        self.locate_optional(program)
            .ok_or_else(|| Error::ProgramNotFound {
                program: program.to_string(),
            })
    }

    /// Find a program, returning `None` when absent. Used for fallback-name
    /// lookups where the caller supplies its own error.
    pub fn locate_optional(&self, program: &str) -> Option<PathBuf> {
        if let Ok(found) = which::which(program) {
            return Some(found);
        }

        let cwd = env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));
        for root in &self.roots {
            for dir in [root.join("bin"), root.clone()] {
                if let Ok(found) = which::which_in(program, Some(&dir), &cwd) {
                    return Some(found);
                }
            }
        }

        None
    }
}

/// List the version-numbered subdirectories of an installation root, highest
/// version first.
fn versioned_subdirs(root: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(root) else {
        return Vec::new();
    };

    let mut dirs: Vec<(f64, PathBuf)> = entries
        .flatten()
        .filter(|entry| entry.path().is_dir())
        .map(|entry| {
            let version = entry
                .file_name()
                .to_string_lossy()
                .parse::<f64>()
                .unwrap_or(f64::MIN);
            (version, entry.path())
        })
        .collect();

    dirs.sort_by(|a, b| b.0.total_cmp(&a.0));
    dirs.into_iter().map(|(_, path)| path).collect()
}

static VERSION_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d+)(?:\.(\d+|devel))?").expect("valid version pattern"));

/// Extract a numeric version from `--version` output.
///
/// Development builds report versions like `11devel` or `11.devel`; the
/// non-numeric suffix counts as minor version zero.
pub(crate) fn parse_version(output: &str) -> Option<f64> {
    let captures = VERSION_PATTERN.captures(output)?;
    let major = captures.get(1)?.as_str();
    let minor = match captures.get(2).map(|m| m.as_str()) {
        None | Some("devel") => "0",
        Some(minor) => minor,
    };
    format!("{}.{}", major, minor).parse().ok()
}

/// Invoke the server binary with `--version` and parse the result.
pub(crate) async fn probe_version(server: &Path) -> Result<f64> {
    let output = tokio::process::Command::new(server)
        .arg("--version")
        .output()
        .await
        .map_err(|e| Error::VersionUnknown {
            program: server.display().to_string(),
            output: e.to_string(),
        })?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    parse_version(&stdout).ok_or_else(|| Error::VersionUnknown {
        program: server.display().to_string(),
        output: stdout.trim().to_string(),
    })
}

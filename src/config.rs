//! Instance configuration.
//!
//! The recognized surface is a fixed set of fields plus one explicitly-typed
//! pass-through bag ([`Config::client_option`]) handed verbatim to the client
//! factory. Unknown keys are not silently absorbed anywhere.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::client::ClientFactory;

/// Default starting port for the retry walk.
pub const DEFAULT_BASE_PORT: u16 = 15432;

/// Default target database name.
pub const DEFAULT_DATABASE: &str = "test";

/// Configuration for one test instance.
///
/// All fields are optional; `Config::default()` produces a working setup on
/// a machine with PostgreSQL installed. The host is deliberately absent: the
/// instance always listens on the loopback literal `127.0.0.1`, never a
/// symbolic hostname, so IPv4/IPv6 resolution ambiguity cannot bite.
///
/// # Example
///
/// ```no_run
/// use pg_testbed::{Config, Instance};
///
/// # async fn example() -> pg_testbed::Result<()> {
/// let mut instance = Instance::new(
///     Config::default()
///         .database("myapp_test")
///         .seed_script("fixtures/schema.sql"),
/// )?;
/// instance.start().await?;
/// // ... run tests against instance.connection_string()? ...
/// instance.stop().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Explicit port. When set, exactly one start attempt is made on it and
    /// the retry walk is skipped.
    pub port: Option<u16>,

    /// Starting port for the retry walk. Defaults to 15432.
    pub base_port: Option<u16>,

    /// Target database name. Defaults to `test`.
    pub database: Option<String>,

    /// Connection user. When unset, the database owner account is used.
    pub user: Option<String>,

    /// Connection password. Only meaningful together with `user`.
    pub password: Option<String>,

    /// Caller-supplied working directory. When set, the instance never
    /// deletes it on teardown; when unset, a private temporary directory is
    /// created and removed with the instance.
    pub base_dir: Option<PathBuf>,

    /// Contents for `postgresql.conf`. When unset the file is truncated so
    /// the server runs on built-in defaults; the packager-installed sample
    /// template is never trusted.
    pub server_config: Option<String>,

    /// OS user id the daemon runs as. Must not be 0. When unset and the
    /// process runs as root, the `nobody` account is resolved instead.
    pub uid: Option<u32>,

    /// Database owner account name. When unset, resolved from `uid` (or the
    /// effective uid) through the password database.
    pub database_owner: Option<String>,

    /// Extra arguments appended to the `initdb` invocation.
    pub extra_initdb_args: Vec<String>,

    /// Extra arguments appended to the server command line.
    pub extra_server_args: Vec<String>,

    /// Extra arguments appended to every `psql` invocation.
    pub extra_psql_args: Vec<String>,

    /// SQL files run through `psql` once the target database exists.
    pub seed_scripts: Vec<PathBuf>,

    /// Pass-through options for the client factory. The controller attaches
    /// no meaning to these keys.
    pub client_options: HashMap<String, String>,

    /// Factory producing control connections. Defaults to the
    /// tokio-postgres backed factory; test suites inject a mock here.
    #[serde(skip)]
    pub client_factory: Option<Arc<dyn ClientFactory>>,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set an explicit port, disabling the retry walk.
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Set the starting port for the retry walk.
    pub fn base_port(mut self, port: u16) -> Self {
        self.base_port = Some(port);
        self
    }

    /// Set the target database name.
    pub fn database(mut self, name: impl Into<String>) -> Self {
        self.database = Some(name.into());
        self
    }

    /// Set the connection user.
    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Set the connection password.
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Use a caller-supplied base directory. It is reused as-is and never
    /// deleted on teardown.
    pub fn base_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.base_dir = Some(dir.into());
        self
    }

    /// Provide the full `postgresql.conf` contents.
    pub fn server_config(mut self, contents: impl Into<String>) -> Self {
        self.server_config = Some(contents.into());
        self
    }

    /// Run the daemon as this OS user id.
    pub fn uid(mut self, uid: u32) -> Self {
        self.uid = Some(uid);
        self
    }

    /// Set the database owner account name.
    pub fn database_owner(mut self, owner: impl Into<String>) -> Self {
        self.database_owner = Some(owner.into());
        self
    }

    /// Append an extra `initdb` argument.
    pub fn extra_initdb_arg(mut self, arg: impl Into<String>) -> Self {
        self.extra_initdb_args.push(arg.into());
        self
    }

    /// Append an extra server argument.
    pub fn extra_server_arg(mut self, arg: impl Into<String>) -> Self {
        self.extra_server_args.push(arg.into());
        self
    }

    /// Append an extra `psql` argument.
    pub fn extra_psql_arg(mut self, arg: impl Into<String>) -> Self {
        self.extra_psql_args.push(arg.into());
        self
    }

    /// Add a seed script to run after the target database exists.
    pub fn seed_script(mut self, path: impl Into<PathBuf>) -> Self {
        self.seed_scripts.push(path.into());
        self
    }

    /// Add a pass-through option for the client factory.
    pub fn client_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.client_options.insert(key.into(), value.into());
        self
    }

    /// Substitute the client factory. Test suites use this to avoid a real
    /// wire connection.
    pub fn client_factory(mut self, factory: Arc<dyn ClientFactory>) -> Self {
        self.client_factory = Some(factory);
        self
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("port", &self.port)
            .field("base_port", &self.base_port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("base_dir", &self.base_dir)
            .field("uid", &self.uid)
            .field("database_owner", &self.database_owner)
            .field("extra_initdb_args", &self.extra_initdb_args)
            .field("extra_server_args", &self.extra_server_args)
            .field("extra_psql_args", &self.extra_psql_args)
            .field("seed_scripts", &self.seed_scripts)
            .field("client_options", &self.client_options)
            .finish_non_exhaustive()
    }
}

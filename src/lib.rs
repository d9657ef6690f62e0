//! # pg-testbed
//!
//! Disposable PostgreSQL server instances for integration test suites.
//!
//! Each [`Instance`] discovers the PostgreSQL binaries on the host,
//! initializes a private on-disk cluster, claims a free port by bounded
//! retry, waits for the server to accept connections, makes sure the target
//! database exists, and tears everything down deterministically — including
//! from a process-exit hook, so no daemon or temporary directory survives a
//! crashed test run.
//!
//! ## Quick start
//!
//! ```no_run
//! use pg_testbed::{Config, Instance};
//!
//! # async fn example() -> pg_testbed::Result<()> {
//! let mut instance = Instance::new(Config::default().database("myapp_test"))?;
//! instance.start().await?;
//!
//! let url = instance.connection_string()?;
//! // hand `url` to the code under test ...
//!
//! instance.stop().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Concurrency model
//!
//! Instances are independent: each owns a disjoint base directory and, once
//! started, a disjoint port, so any number can run side by side. Operations
//! on a single instance are sequential — `start` rejects re-entry while
//! running, and readiness polling never overlaps itself.
//!
//! ## Crash safety
//!
//! Every running instance registers a synchronous teardown callback in a
//! process-wide [`exit_guard`] registry. On process exit the remaining
//! callbacks stop their daemons and remove owned directories; each entry is
//! isolated, so one failing teardown cannot block the rest.

pub mod client;
pub mod config;
pub mod discovery;
pub mod error;
pub mod exit_guard;
pub mod instance;

// Re-export commonly used types
pub use client::{ClientError, ClientFactory, ConnectParams, ControlClient, PgClientFactory};
pub use config::Config;
pub use error::{Error, Result};
pub use instance::{Instance, PsqlOp};

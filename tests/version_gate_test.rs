//! Version-dependent behavior: the supported-version floor, psql operation
//! batching, and the echo-errors flag.
//!
//! The fake server reports whatever `FAKE_PG_VERSION` says, and that
//! variable is process-global, so all scenarios run sequentially inside one
//! test function.

mod common;

use std::fs;

use common::{install_fake_programs, permissive, read_log, MockFactory};
use pg_testbed::{Config, Error, Instance};

#[tokio::test]
async fn version_gates_follow_the_probed_server() {
    install_fake_programs();

    pre_9_servers_are_rejected().await;
    old_psql_runs_one_invocation_per_script().await;
    modern_psql_batches_and_echoes_errors().await;

    std::env::remove_var("FAKE_PG_VERSION");
}

async fn pre_9_servers_are_rejected() {
    std::env::set_var("FAKE_PG_VERSION", "8.4");

    let dir = tempfile::tempdir().expect("tempdir");
    permissive(dir.path());

    let mut instance = Instance::new(
        Config::default()
            .base_dir(dir.path())
            .client_factory(MockFactory::immediate(0)),
    )
    .expect("instance");

    // Probing happens before any lifecycle command; nothing gets run
    let err = instance.setup().await.expect_err("unsupported version");
    assert!(
        matches!(err, Error::UnsupportedVersion { version } if version == 8.4),
        "unexpected: {:?}",
        err
    );
    assert!(read_log(dir.path(), "ctl.log").is_empty());

    // The probe is memoized per instance, so the error repeats
    let err = instance.start().await.expect_err("still unsupported");
    assert!(matches!(err, Error::UnsupportedVersion { .. }));
}

async fn old_psql_runs_one_invocation_per_script() {
    std::env::set_var("FAKE_PG_VERSION", "9.4");

    let dir = tempfile::tempdir().expect("tempdir");
    permissive(dir.path());
    let seed_a = dir.path().join("a.sql");
    let seed_b = dir.path().join("b.sql");
    fs::write(&seed_a, "CREATE TABLE foo (bar int);\n").expect("seed");
    fs::write(&seed_b, "INSERT INTO foo VALUES (42);\n").expect("seed");

    let mut instance = Instance::new(
        Config::default()
            .base_dir(dir.path())
            .seed_script(&seed_a)
            .seed_script(&seed_b)
            .client_factory(MockFactory::immediate(0)),
    )
    .expect("instance");

    instance.start().await.expect("start");
    assert_eq!(instance.server_version().await.expect("version"), 9.4);

    // Pre-9.6 psql cannot batch: two invocations, one file each, and no
    // echo-errors flag below 9.5
    let psql_log = read_log(dir.path(), "psql.log");
    assert_eq!(psql_log.len(), 2);
    assert!(psql_log[0].contains("-f") && psql_log[0].contains("a.sql"));
    assert!(!psql_log[0].contains("b.sql"));
    assert!(psql_log[1].contains("b.sql"));
    assert!(!psql_log[0].contains("-b"));

    // Verbosity is scoped to each spawned invocation
    for line in read_log(dir.path(), "psql-env.log") {
        assert_eq!(line, "--client-min-messages=warning");
    }

    instance.stop().await.expect("stop");
}

async fn modern_psql_batches_and_echoes_errors() {
    std::env::set_var("FAKE_PG_VERSION", "12.3");

    let dir = tempfile::tempdir().expect("tempdir");
    permissive(dir.path());
    let seed_a = dir.path().join("a.sql");
    let seed_b = dir.path().join("b.sql");
    fs::write(&seed_a, "CREATE TABLE foo (bar int);\n").expect("seed");
    fs::write(&seed_b, "INSERT INTO foo VALUES (42);\n").expect("seed");

    let mut instance = Instance::new(
        Config::default()
            .base_dir(dir.path())
            .seed_script(&seed_a)
            .seed_script(&seed_b)
            .client_factory(MockFactory::immediate(0)),
    )
    .expect("instance");

    instance.start().await.expect("start");

    // 9.6+ batches every operation into a single invocation, with -b
    let psql_log = read_log(dir.path(), "psql.log");
    assert_eq!(psql_log.len(), 1);
    assert!(psql_log[0].contains("a.sql") && psql_log[0].contains("b.sql"));
    assert!(psql_log[0].contains("-b"));
    assert!(psql_log[0].contains("ON_ERROR_STOP=1"));

    // Ad-hoc statements go through the same runner
    instance
        .run_psql(&[pg_testbed::PsqlOp::Command("SELECT 1".to_string())])
        .await
        .expect("run_psql");
    let psql_log = read_log(dir.path(), "psql.log");
    assert_eq!(psql_log.len(), 2);
    assert!(psql_log[1].contains("-c SELECT 1"));

    instance.stop().await.expect("stop");
}

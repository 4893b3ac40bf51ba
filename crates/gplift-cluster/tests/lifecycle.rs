//! Cluster lifecycle tests.
//!
//! Loads a topology from a scripted catalog, gates its version, starts it,
//! waits for readiness and checks for sessions, all without a database or
//! real child processes.

use std::sync::Arc;
use std::time::Duration;

use gplift_cluster::*;
use gplift_core::{BufferedStreams, FakeLauncher, FakeResponse};
use semver::Version;

fn catalog_6x() -> FakeCatalog {
    FakeCatalog::new(Version::new(6, 20, 3))
        .on(
            "ORDER BY content",
            rows![
                ["1", "-1", "5432", "cdw", "/data/qddir/seg-1", "p"],
                ["6", "-1", "5432", "scdw", "/data/standby", "m"],
                ["2", "0", "6000", "sdw1", "/data/primary/seg0", "p"],
                ["3", "1", "6001", "sdw2", "/data/primary/seg1", "p"],
                ["4", "0", "7000", "sdw2", "/data/mirror/seg0", "m"],
                ["5", "1", "7001", "sdw1", "/data/mirror/seg1", "m"],
            ],
        )
        .on("role = preferred_role", rows![["4"]])
        .on("gp_stat_replication", rows![["1"]])
}

#[tokio::test]
async fn load_gate_start_and_wait() {
    let catalog = catalog_6x();
    let cluster = Cluster::from_database(&catalog, "/usr/local/gpdb6", Destination::Source)
        .await
        .unwrap();

    assert!(cluster.has_all_mirrors_and_standby());
    assert_eq!(cluster.standby_datadir().unwrap().to_str(), Some("/data/standby"));

    VersionGate::default()
        .verify(&cluster.version, &Version::new(7, 0, 0))
        .unwrap();

    let launcher = FakeLauncher::new();
    let streams = BufferedStreams::new();
    launcher.push("bash", FakeResponse::success().with_stdout("gpstart done\n"));
    cluster.start(&launcher, Arc::new(streams.clone())).await.unwrap();
    assert_eq!(streams.stdout_string(), "gpstart done\n");

    wait_for_segments(&catalog, Duration::from_secs(10), &cluster)
        .await
        .unwrap();
    check_active_connections(&catalog, &cluster).await.unwrap();

    assert_eq!(
        cluster.connection().utility_mode().uri(),
        "postgresql://localhost:5432/template1?search_path=&gp_session_role=utility"
    );
}

#[tokio::test]
async fn start_failure_is_wrapped_with_destination() {
    let catalog = catalog_6x();
    let cluster = Cluster::from_database(&catalog, "/usr/local/gpdb6", Destination::Source)
        .await
        .unwrap();

    let launcher = FakeLauncher::new();
    launcher.push("bash", FakeResponse::exit(2));
    let err = cluster
        .start(&launcher, Arc::new(BufferedStreams::new()))
        .await
        .unwrap_err();
    assert!(err.to_string().starts_with("start source cluster: "), "{err}");
}

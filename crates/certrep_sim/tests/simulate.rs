//! End-to-end simulation runs.

use certrep_core::RollbackMode;
use certrep_sim::{SimError, SimParams, SimReport, Simulator};

/// Every committed write-set was ordered once and applied on every other
/// server; rolled back ones were never ordered.
fn assert_consistent(report: &SimReport, servers: u64, attempted: u64) {
    assert_eq!(report.committed + report.aborted, attempted);
    assert_eq!(report.last_seqno, report.committed as i64);
    assert_eq!(report.totals.applied, report.committed * (servers - 1));
    assert_eq!(
        report.totals.commits + report.totals.replays,
        report.committed
    );
    for server in &report.servers {
        assert_eq!(server.last_committed, report.last_seqno, "{}", server.name);
    }
}

#[test]
fn quiet_cluster_commits_everything() {
    let report = Simulator::new(
        SimParams::new()
            .servers(2)
            .clients(2)
            .transactions(20)
            .keys(1 << 40)
            .seed(11),
    )
    .run()
    .unwrap();

    assert_consistent(&report, 2, 80);
    assert_eq!(report.aborted, 0);
    assert_eq!(report.totals.bf_aborts, 0);
    assert_eq!(report.seed, 11);
}

#[test]
fn hot_keys_with_async_rollback() {
    let report = Simulator::new(
        SimParams::new()
            .servers(3)
            .clients(3)
            .transactions(30)
            .keys(8)
            .alg_freq(3)
            .seed(5),
    )
    .run()
    .unwrap();

    assert_consistent(&report, 3, 270);
    let attempted: u64 = report.servers.iter().map(|s| s.bf_attempts).sum();
    let accepted: u64 = report.servers.iter().map(|s| s.bf_accepted).sum();
    assert!(accepted <= attempted);
    assert_eq!(report.totals.bf_aborts, accepted);
}

#[test]
fn hot_keys_with_sync_rollback_and_two_phase() {
    let report = Simulator::new(
        SimParams::new()
            .servers(2)
            .clients(4)
            .transactions(25)
            .keys(4)
            .alg_freq(2)
            .rollback_mode(RollbackMode::Sync)
            .two_phase(true)
            .seed(9),
    )
    .run()
    .unwrap();

    assert_consistent(&report, 2, 200);
}

#[test]
fn reporter_file_tracks_first_server() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("certsim.json");
    Simulator::new(
        SimParams::new()
            .servers(1)
            .clients(1)
            .transactions(5)
            .reporter_file(&path),
    )
    .run()
    .unwrap();

    let doc: serde_json::Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
    assert_eq!(doc["status"]["state"], "disconnected");
}

#[test]
fn invalid_params_fail_fast() {
    let err = Simulator::new(SimParams::new().servers(0)).run().unwrap_err();
    assert!(matches!(err, SimError::InvalidParams(_)));
}

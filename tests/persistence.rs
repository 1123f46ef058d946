//! Node state survives a restart

use dynconf::applicator::{Applicability, Change, Cluster, Node, Stripe};
use dynconf::common::messages::{CommitMessage, NodeMode, PrepareMessage};
use dynconf::common::utils::now;
use dynconf::common::{LedgerBackend, NodeConfig};
use dynconf::ops::verify_node;
use dynconf::{Error, NodeServer};
use tempfile::TempDir;
use uuid::Uuid;

fn config(dir: &TempDir) -> NodeConfig {
    let mut config = NodeConfig::new("n1");
    config.data_dir = dir.path().join("n1");
    config.ledger = LedgerBackend::Rocksdb;
    config
}

fn prepare(uuid: u128, count: u64, version: u64, change: Change) -> PrepareMessage {
    PrepareMessage {
        expected_mutative_message_count: count,
        mutation_host: "ops-host".into(),
        mutation_user: "alice".into(),
        mutation_timestamp: now(),
        change_uuid: Uuid::from_u128(uuid),
        version_number: version,
        change,
    }
}

fn commit(uuid: u128, count: u64) -> CommitMessage {
    CommitMessage {
        expected_mutative_message_count: count,
        mutation_host: "ops-host".into(),
        mutation_user: "alice".into(),
        mutation_timestamp: now(),
        change_uuid: Uuid::from_u128(uuid),
    }
}

#[test]
fn test_prepared_change_survives_restart() {
    let dir = TempDir::new().unwrap();
    let cluster = Cluster::new("prod", vec![Stripe::new("s1", vec![Node::new("n1", "n1:9410")])]);

    // Activate, then prepare a second change and stop
    {
        let server = NodeServer::open(config(&dir)).unwrap();
        let protocol = server.protocol();
        assert!(protocol
            .prepare(&prepare(1, 0, 1, Change::Activate { cluster }))
            .unwrap()
            .is_accepted());
        assert!(protocol.commit(&commit(1, 1)).unwrap().is_accepted());
        let change = Change::set(Applicability::Cluster, "client-lease-duration", "20s");
        assert!(protocol.prepare(&prepare(2, 2, 2, change)).unwrap().is_accepted());
    }

    // Reopen and finish it
    {
        let server = NodeServer::open(config(&dir)).unwrap();
        let protocol = server.protocol();
        let d = protocol.discover().unwrap();
        assert_eq!(d.mode, NodeMode::Prepared);
        assert_eq!(d.mutative_message_count, 3);
        assert_eq!(d.current_version, 1);
        assert_eq!(d.highest_version, 2);
        assert_eq!(d.latest_change_uuid(), Some(Uuid::from_u128(2)));
        assert_eq!(d.last_mutation_user.as_deref(), Some("alice"));

        assert!(protocol.commit(&commit(2, 3)).unwrap().is_accepted());
        let config = protocol.current_committed_config().unwrap().unwrap();
        assert_eq!(config.setting("client-lease-duration"), Some("20s"));
    }

    // Reopen again: history and snapshots intact
    {
        let server = NodeServer::open(config(&dir)).unwrap();
        let protocol = server.protocol();
        assert_eq!(protocol.change_history().unwrap().len(), 2);
        assert_eq!(protocol.discover().unwrap().current_version, 2);
    }

    let report = verify_node(&config(&dir)).unwrap();
    assert_eq!(report.checked, 2);
    assert!(report.is_healthy());
}

#[test]
fn test_tampered_snapshot_fails_verification() {
    let dir = TempDir::new().unwrap();
    let cluster = Cluster::new("prod", vec![Stripe::new("s1", vec![Node::new("n1", "n1:9410")])]);
    {
        let server = NodeServer::open(config(&dir)).unwrap();
        let protocol = server.protocol();
        protocol
            .prepare(&prepare(1, 0, 1, Change::Activate { cluster }))
            .unwrap();
        protocol.commit(&commit(1, 1)).unwrap();
    }

    let snapshot_dir = config(&dir).snapshot_dir();
    let path = std::fs::read_dir(&snapshot_dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .find(|p| p.extension().and_then(|e| e.to_str()) == Some("1"))
        .unwrap();
    let body = std::fs::read_to_string(&path).unwrap();
    std::fs::write(&path, body.replace("\"prod\"", "\"qa\"")).unwrap();

    let report = verify_node(&config(&dir)).unwrap();
    assert_eq!(report.corrupted, vec![1]);
    assert!(report.ensure_healthy().is_err());

    // the node itself refuses to start on the tampered configuration
    match NodeServer::open(config(&dir)) {
        Err(Error::HashMismatch { version, .. }) => assert_eq!(version, 1),
        Err(e) => panic!("unexpected error: {}", e),
        Ok(_) => panic!("node opened a tampered snapshot"),
    }
}

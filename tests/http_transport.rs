//! Change runs over real HTTP between the CLI side and node servers

use dynconf::applicator::{Applicability, Change, Cluster, Node, Stripe};
use dynconf::common::utils::{ChangeIdGenerator, Environment};
use dynconf::common::{LedgerBackend, NodeConfig, OrchestratorConfig};
use dynconf::orchestrator::{
    Consistency, GlobalState, HttpEndpoint, NodeEndpoint, NoopReceiver, Orchestrator,
};
use dynconf::NodeServer;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

struct RunningNode {
    address: String,
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<dynconf::Result<()>>,
}

async fn start_node(name: &str) -> RunningNode {
    let mut config = NodeConfig::new(name);
    config.ledger = LedgerBackend::Memory;
    let server = NodeServer::open(config).unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    let (shutdown, rx) = oneshot::channel::<()>();
    let handle = tokio::spawn(server.serve_on(listener, async {
        let _ = rx.await;
    }));
    RunningNode {
        address,
        shutdown,
        handle,
    }
}

#[tokio::test]
async fn test_change_over_http() {
    let mut nodes = Vec::new();
    for name in ["n1", "n2", "n3"] {
        nodes.push((name, start_node(name).await));
    }

    let cluster = Cluster::new(
        "prod",
        vec![Stripe::new(
            "stripe-1",
            nodes
                .iter()
                .map(|(name, node)| Node::new(*name, node.address.clone()))
                .collect(),
        )],
    );
    let list: Vec<&str> = nodes.iter().map(|(_, n)| n.address.as_str()).collect();
    let orch = Orchestrator::new(
        HttpEndpoint::parse_list(&list.join(",")).unwrap(),
        Environment::new("ops-host", "alice"),
        Arc::new(ChangeIdGenerator::sequential(1)),
        OrchestratorConfig::default(),
    );

    let report = orch
        .apply_change(Change::Activate { cluster }, &mut NoopReceiver)
        .await
        .unwrap();
    assert!(report.is_consistent(), "{:?}", report);

    // n3 refuses a bad value scoped to it; the others roll back
    let report = orch
        .apply_change(
            Change::set(Applicability::node("n3"), "client-reconnect-window", "soon"),
            &mut NoopReceiver,
        )
        .await
        .unwrap();
    assert_eq!(report.consistency(), Some(Consistency::Consistent));
    assert!(!report.endpoints.is_empty());

    let status = orch.status(&mut NoopReceiver).await.unwrap();
    assert_eq!(status.state, GlobalState::Accepting);
    let first = status.nodes[&nodes[0].1.address].as_ref().unwrap();
    assert_eq!(first.current_version, 1);
    assert_eq!(first.highest_version, 2);
    let committed = first.latest_committed_change.as_ref().unwrap();
    assert_eq!(committed.result.as_ref().unwrap().cluster.name, "prod");

    for (_, node) in nodes {
        node.shutdown.send(()).unwrap();
        node.handle.await.unwrap().unwrap();
    }
}

#[tokio::test]
async fn test_malformed_request_is_an_http_error() {
    let node = start_node("n1").await;

    let response = reqwest::Client::new()
        .post(format!("http://{}/protocol/prepare", node.address))
        .header(reqwest::header::CONTENT_TYPE, "application/json")
        .body("{\"not\": \"a prepare\"}")
        .send()
        .await
        .unwrap();
    assert!(response.status().is_client_error());

    let health: serde_json::Value = serde_json::from_slice(
        &reqwest::get(format!("http://{}/health", node.address))
            .await
            .unwrap()
            .bytes()
            .await
            .unwrap(),
    )
    .unwrap();
    assert_eq!(health["node"], "n1");
    assert_eq!(health["prepared"], false);

    let endpoint = HttpEndpoint::new(node.address.clone()).unwrap();
    let discovered = endpoint.discover().await.unwrap();
    assert_eq!(discovered.mutative_message_count, 0);

    node.shutdown.send(()).unwrap();
    node.handle.await.unwrap().unwrap();
}

//! Shared helpers for the integration tests

#![allow(dead_code)]

use dynconf::applicator::{Change, Cluster, Node, RoutingApplicator, Stripe};
use dynconf::common::messages::{
    AcceptRejectResponse, CommitMessage, DiscoverResponse, PrepareMessage, RollbackMessage,
    TakeoverMessage,
};
use dynconf::common::utils::{now, ChangeIdGenerator, Environment};
use dynconf::common::{Error, MemLedger, OrchestratorConfig, Result};
use dynconf::node::{MemSnapshotStore, NodeStateStore, ProtocolServer};
use dynconf::orchestrator::{
    AbandonToken, Consistency, LocalEndpoint, NodeEndpoint, Orchestrator, ResultReceiver,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

pub fn server(name: &str) -> Arc<ProtocolServer> {
    let store = NodeStateStore::open(
        Arc::new(MemLedger::new()),
        Arc::new(MemSnapshotStore::new()),
    )
    .unwrap();
    Arc::new(
        ProtocolServer::new(name, store, Arc::new(RoutingApplicator::with_defaults(name))).unwrap(),
    )
}

pub fn cluster(names: &[&str]) -> Cluster {
    let nodes = names
        .iter()
        .map(|n| Node::new(*n, format!("{}:9410", n)))
        .collect();
    Cluster::new("prod", vec![Stripe::new("stripe-1", nodes)])
}

pub fn activation(names: &[&str]) -> Change {
    Change::Activate {
        cluster: cluster(names),
    }
}

/// What a [`FaultyEndpoint`] does wrong.
#[derive(Debug, Clone)]
pub enum Fault {
    None,
    /// Discovery takes this long before answering.
    SlowDiscover(Duration),
    /// Prepare reaches the node but the answer is lost.
    LosePrepareResponse,
    /// Commit never reaches the node.
    DropCommit,
    /// Another operator takes the node over right before the second
    /// discovery.
    TakeoverBeforeSecondDiscover,
    /// The operator abandons the run while this node is preparing. The
    /// prepare still lands.
    AbandonDuringPrepare(AbandonToken),
}

pub struct FaultyEndpoint {
    inner: LocalEndpoint,
    fault: Mutex<Fault>,
    discovers: AtomicUsize,
}

impl FaultyEndpoint {
    pub fn new(name: &str, server: Arc<ProtocolServer>) -> Self {
        Self {
            inner: LocalEndpoint::new(name, server),
            fault: Mutex::new(Fault::None),
            discovers: AtomicUsize::new(0),
        }
    }

    pub fn server(&self) -> &Arc<ProtocolServer> {
        self.inner.server()
    }

    pub fn set_fault(&self, fault: Fault) {
        *self.fault.lock().unwrap() = fault;
    }

    fn fault(&self) -> Fault {
        self.fault.lock().unwrap().clone()
    }
}

impl NodeEndpoint for FaultyEndpoint {
    fn address(&self) -> &str {
        self.inner.address()
    }

    async fn discover(&self) -> Result<DiscoverResponse> {
        let call = self.discovers.fetch_add(1, Ordering::SeqCst) + 1;
        match self.fault() {
            Fault::SlowDiscover(delay) => tokio::time::sleep(delay).await,
            Fault::TakeoverBeforeSecondDiscover if call == 2 => {
                let count = self.inner.discover().await?.mutative_message_count;
                let taken = self
                    .inner
                    .takeover(TakeoverMessage {
                        expected_mutative_message_count: count,
                        mutation_host: "intruder-host".into(),
                        mutation_user: "mallory".into(),
                        mutation_timestamp: now(),
                    })
                    .await?;
                assert!(taken.is_accepted());
            }
            _ => {}
        }
        self.inner.discover().await
    }

    async fn prepare(&self, msg: PrepareMessage) -> Result<AcceptRejectResponse> {
        let response = self.inner.prepare(msg).await?;
        match self.fault() {
            Fault::LosePrepareResponse => Err(Error::ConnectionFailed(format!(
                "{}: connection reset",
                self.address()
            ))),
            Fault::AbandonDuringPrepare(abandon) => {
                abandon.abandon();
                Ok(response)
            }
            _ => Ok(response),
        }
    }

    async fn commit(&self, msg: CommitMessage) -> Result<AcceptRejectResponse> {
        if matches!(self.fault(), Fault::DropCommit) {
            return Err(Error::ConnectionFailed(format!(
                "{}: connection refused",
                self.address()
            )));
        }
        self.inner.commit(msg).await
    }

    async fn rollback(&self, msg: RollbackMessage) -> Result<AcceptRejectResponse> {
        self.inner.rollback(msg).await
    }

    async fn takeover(&self, msg: TakeoverMessage) -> Result<AcceptRejectResponse> {
        self.inner.takeover(msg).await
    }
}

pub fn orchestrator(names: &[&str]) -> Orchestrator<FaultyEndpoint> {
    orchestrator_with(names, OrchestratorConfig::default())
}

pub fn orchestrator_with(names: &[&str], config: OrchestratorConfig) -> Orchestrator<FaultyEndpoint> {
    Orchestrator::new(
        names.iter().map(|n| FaultyEndpoint::new(n, server(n))).collect(),
        Environment::new("ops-host", "alice"),
        Arc::new(ChangeIdGenerator::sequential(100)),
        config,
    )
}

/// Orchestrator over a subset of existing endpoints' servers.
pub fn orchestrator_over(
    servers: &[(&str, Arc<ProtocolServer>)],
    env: Environment,
    first_id: u64,
) -> Orchestrator<FaultyEndpoint> {
    Orchestrator::new(
        servers
            .iter()
            .map(|(n, s)| FaultyEndpoint::new(n, s.clone()))
            .collect(),
        env,
        Arc::new(ChangeIdGenerator::sequential(first_id)),
        OrchestratorConfig::default(),
    )
}

/// Prepare `change` directly on `server`, as an orchestrator that then
/// vanished would have.
pub fn prepare_directly(server: &ProtocolServer, uuid: Uuid, version: u64, change: Change) {
    let count = server.discover().unwrap().mutative_message_count;
    let response = server
        .prepare(&PrepareMessage {
            expected_mutative_message_count: count,
            mutation_host: "gone-host".into(),
            mutation_user: "bob".into(),
            mutation_timestamp: now(),
            change_uuid: uuid,
            version_number: version,
            change,
        })
        .unwrap();
    assert!(response.is_accepted(), "{:?}", response);
}

/// Settle the change `uuid` on `server` directly, committing it when
/// `commit` is set and rolling it back otherwise.
pub fn finish_directly(server: &ProtocolServer, uuid: Uuid, commit: bool) {
    let count = server.discover().unwrap().mutative_message_count;
    let response = if commit {
        server
            .commit(&CommitMessage {
                expected_mutative_message_count: count,
                mutation_host: "gone-host".into(),
                mutation_user: "bob".into(),
                mutation_timestamp: now(),
                change_uuid: uuid,
            })
            .unwrap()
    } else {
        server
            .rollback(&RollbackMessage {
                expected_mutative_message_count: count,
                mutation_host: "gone-host".into(),
                mutation_user: "bob".into(),
                mutation_timestamp: now(),
                change_uuid: uuid,
            })
            .unwrap()
    };
    assert!(response.is_accepted(), "{:?}", response);
}

/// Receiver that writes every event it sees as one line.
#[derive(Clone, Default)]
pub struct Recorder(pub Arc<Mutex<Vec<String>>>);

impl Recorder {
    pub fn events(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn contains(&self, event: &str) -> bool {
        self.events().iter().any(|e| e == event)
    }

    fn push(&self, event: String) {
        self.0.lock().unwrap().push(event);
    }
}

impl ResultReceiver for Recorder {
    fn start_discovery(&mut self, addresses: &[String]) {
        self.push(format!("start_discovery {}", addresses.join(",")));
    }
    fn discovered(&mut self, address: &str, _response: &DiscoverResponse) {
        self.push(format!("discovered {}", address));
    }
    fn discover_fail(&mut self, address: &str, _reason: &str) {
        self.push(format!("discover_fail {}", address));
    }
    fn discover_already_prepared(&mut self, address: &str, _uuid: Uuid, _host: &str, user: &str) {
        self.push(format!("discover_already_prepared {} {}", address, user));
    }
    fn discover_config_inconsistent(&mut self, _uuid: Uuid, _committed: &[String], _rolled_back: &[String]) {
        self.push("discover_config_inconsistent".into());
    }
    fn discover_config_diverged(&mut self, majority: &[String], others: &[String]) {
        self.push(format!(
            "discover_config_diverged {} | {}",
            majority.join(","),
            others.join(",")
        ));
    }
    fn discover_config_partitioned(&mut self, partitions: &[Vec<String>]) {
        self.push(format!("discover_config_partitioned {}", partitions.len()));
    }
    fn end_discovery(&mut self) {
        self.push("end_discovery".into());
    }
    fn start_second_discovery(&mut self) {
        self.push("start_second_discovery".into());
    }
    fn discover_repeated(&mut self, address: &str) {
        self.push(format!("discover_repeated {}", address));
    }
    fn discover_other_client(&mut self, address: &str, _host: &str, user: &str) {
        self.push(format!("discover_other_client {} {}", address, user));
    }
    fn end_second_discovery(&mut self) {
        self.push("end_second_discovery".into());
    }
    fn start_prepare(&mut self, _uuid: Uuid) {
        self.push("start_prepare".into());
    }
    fn prepared(&mut self, address: &str) {
        self.push(format!("prepared {}", address));
    }
    fn prepare_fail(&mut self, address: &str, _reason: &str) {
        self.push(format!("prepare_fail {}", address));
    }
    fn prepare_other_client(&mut self, address: &str, _host: &str, user: &str) {
        self.push(format!("prepare_other_client {} {}", address, user));
    }
    fn prepare_change_unacceptable(&mut self, address: &str, _rejection: &str) {
        self.push(format!("prepare_change_unacceptable {}", address));
    }
    fn end_prepare(&mut self) {
        self.push("end_prepare".into());
    }
    fn start_commit(&mut self) {
        self.push("start_commit".into());
    }
    fn committed(&mut self, address: &str) {
        self.push(format!("committed {}", address));
    }
    fn commit_fail(&mut self, address: &str, _reason: &str) {
        self.push(format!("commit_fail {}", address));
    }
    fn end_commit(&mut self) {
        self.push("end_commit".into());
    }
    fn start_rollback(&mut self) {
        self.push("start_rollback".into());
    }
    fn rolled_back(&mut self, address: &str) {
        self.push(format!("rolled_back {}", address));
    }
    fn rollback_fail(&mut self, address: &str, _reason: &str) {
        self.push(format!("rollback_fail {}", address));
    }
    fn end_rollback(&mut self) {
        self.push("end_rollback".into());
    }
    fn start_take_over(&mut self) {
        self.push("start_take_over".into());
    }
    fn took_over(&mut self, address: &str) {
        self.push(format!("took_over {}", address));
    }
    fn take_over_fail(&mut self, address: &str, _reason: &str) {
        self.push(format!("take_over_fail {}", address));
    }
    fn end_take_over(&mut self) {
        self.push("end_take_over".into());
    }
    fn done(&mut self, consistency: Consistency) {
        self.push(format!("done {}", consistency));
    }
    fn cannot_decide(&mut self) {
        self.push("cannot_decide".into());
    }
}

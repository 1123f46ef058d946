//! Orchestration workflows: change, repair, takeover and status
//!
//! Every phase fans one request out to its target endpoints on a bounded
//! worker pool, each call under its own timeout, and joins all of them
//! before anything is reported or the next phase starts. Results are
//! reported in endpoint order. State lives in a per-run [`Run`] and never
//! outlives the call.

use super::analyzer::{
    analyze_global_state, committed_views, find_inconsistency, prepared_nodes, CommittedViews,
    Consistency, GlobalState,
};
use super::endpoint::NodeEndpoint;
use super::receiver::ResultReceiver;
use crate::applicator::Change;
use crate::common::messages::{
    AcceptRejectResponse, ChangeRequestState, CommitMessage, DiscoverResponse, NodeMode,
    PrepareMessage, RejectionReason, RollbackMessage, TakeoverMessage,
};
use crate::common::utils::{now, ChangeIdGenerator, Environment};
use crate::common::OrchestratorConfig;
use crate::{Error, Result};
use futures_util::future::join_all;
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use uuid::Uuid;

/// Lets a caller abandon one run between phases. Calls already in flight
/// finish, but their results are discarded. Hand a fresh token to every
/// run; an abandoned token stays abandoned.
#[derive(Debug, Clone, Default)]
pub struct AbandonToken(Arc<AtomicBool>);

impl AbandonToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abandon(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_abandoned(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Discovery,
    SecondDiscovery,
    Prepare,
    Commit,
    Rollback,
    Takeover,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointStatus {
    Ok,
    Rejected {
        reason: RejectionReason,
        message: String,
    },
    /// Unreachable, timed out, or failed internally.
    Failed(String),
}

/// Last thing that happened to one endpoint during a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EndpointOutcome {
    pub phase: Phase,
    pub status: EndpointStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Done(Consistency),
    /// Every node is prepared for the same change and nothing says whether
    /// to commit or roll it back.
    CannotDecide,
    Abandoned,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub outcome: RunOutcome,
    pub change_uuid: Option<Uuid>,
    pub endpoints: BTreeMap<String, EndpointOutcome>,
}

impl RunReport {
    pub fn consistency(&self) -> Option<Consistency> {
        match self.outcome {
            RunOutcome::Done(c) => Some(c),
            _ => None,
        }
    }

    pub fn is_consistent(&self) -> bool {
        self.consistency() == Some(Consistency::Consistent)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub state: GlobalState,
    pub nodes: BTreeMap<String, std::result::Result<DiscoverResponse, String>>,
}

/// What repair should do when the nodes alone cannot tell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairAction {
    Commit,
    Rollback,
}

/// Per-run state: receiver, abandon token, fence values and outcomes.
struct Run<'r> {
    receiver: &'r mut dyn ResultReceiver,
    abandon: AbandonToken,
    addresses: Vec<String>,
    expected: Vec<u64>,
    change_uuid: Option<Uuid>,
    endpoints: BTreeMap<String, EndpointOutcome>,
}

impl<'r> Run<'r> {
    fn new(
        receiver: &'r mut dyn ResultReceiver,
        abandon: AbandonToken,
        addresses: Vec<String>,
    ) -> Self {
        let expected = vec![0; addresses.len()];
        Self {
            receiver,
            abandon,
            addresses,
            expected,
            change_uuid: None,
            endpoints: BTreeMap::new(),
        }
    }

    fn abandoned(&self) -> bool {
        self.abandon.is_abandoned()
    }

    fn record(&mut self, index: usize, phase: Phase, status: EndpointStatus) {
        self.endpoints
            .insert(self.addresses[index].clone(), EndpointOutcome { phase, status });
    }

    fn finish(self, outcome: RunOutcome) -> RunReport {
        RunReport {
            outcome,
            change_uuid: self.change_uuid,
            endpoints: self.endpoints,
        }
    }

    fn done(self, consistency: Consistency) -> RunReport {
        self.receiver.done(consistency);
        self.finish(RunOutcome::Done(consistency))
    }

    fn emit_ok(&mut self, phase: Phase, address: &str) {
        match phase {
            Phase::Prepare => self.receiver.prepared(address),
            Phase::Commit => self.receiver.committed(address),
            Phase::Rollback => self.receiver.rolled_back(address),
            Phase::Takeover => self.receiver.took_over(address),
            Phase::Discovery | Phase::SecondDiscovery => {}
        }
    }

    fn emit_fail(&mut self, phase: Phase, address: &str, reason: &str) {
        match phase {
            Phase::Prepare => self.receiver.prepare_fail(address, reason),
            Phase::Commit => self.receiver.commit_fail(address, reason),
            Phase::Rollback => self.receiver.rollback_fail(address, reason),
            Phase::Takeover => self.receiver.take_over_fail(address, reason),
            Phase::Discovery | Phase::SecondDiscovery => self.receiver.discover_fail(address, reason),
        }
    }

    fn emit_other_client(&mut self, phase: Phase, address: &str, host: &str, user: &str) {
        match phase {
            Phase::Prepare => self.receiver.prepare_other_client(address, host, user),
            Phase::Commit => self.receiver.commit_other_client(address, host, user),
            Phase::Rollback => self.receiver.rollback_other_client(address, host, user),
            Phase::Takeover => self.receiver.take_over_other_client(address, host, user),
            Phase::Discovery | Phase::SecondDiscovery => {
                self.receiver.discover_other_client(address, host, user)
            }
        }
    }
}

pub struct Orchestrator<E: NodeEndpoint> {
    endpoints: Vec<Arc<E>>,
    environment: Environment,
    ids: Arc<ChangeIdGenerator>,
    config: OrchestratorConfig,
}

impl<E: NodeEndpoint> Orchestrator<E> {
    pub fn new(
        endpoints: Vec<E>,
        environment: Environment,
        ids: Arc<ChangeIdGenerator>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            endpoints: endpoints.into_iter().map(Arc::new).collect(),
            environment,
            ids,
            config,
        }
    }

    pub fn endpoints(&self) -> &[Arc<E>] {
        &self.endpoints
    }

    fn addresses(&self) -> Vec<String> {
        self.endpoints
            .iter()
            .map(|e| e.address().to_string())
            .collect()
    }

    fn all_targets(&self) -> Vec<usize> {
        (0..self.endpoints.len()).collect()
    }

    /// Call every target concurrently and wait for all of them. Results are
    /// returned in target order.
    async fn fan_out<T, F, Fut>(&self, targets: &[usize], call: F) -> Vec<Result<T>>
    where
        T: Send + 'static,
        F: Fn(usize, Arc<E>) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let workers = self.config.max_concurrency.min(targets.len()).max(1);
        let permits = Arc::new(Semaphore::new(workers));
        let timeout = self.config.call_timeout();

        let handles: Vec<_> = targets
            .iter()
            .map(|&i| {
                let fut = call(i, self.endpoints[i].clone());
                let permits = permits.clone();
                let address = self.endpoints[i].address().to_string();
                tokio::spawn(async move {
                    let _permit = permits
                        .acquire_owned()
                        .await
                        .map_err(|e| Error::Internal(format!("worker pool closed: {}", e)))?;
                    match tokio::time::timeout(timeout, fut).await {
                        Ok(result) => result,
                        Err(_) => Err(Error::Timeout(format!(
                            "{} did not respond within {:?}",
                            address, timeout
                        ))),
                    }
                })
            })
            .collect();

        join_all(handles)
            .await
            .into_iter()
            .map(|joined| {
                joined.unwrap_or_else(|e| Err(Error::Internal(format!("endpoint task failed: {}", e))))
            })
            .collect()
    }

    fn prepare_message(&self, expected: u64, change_uuid: Uuid, version: u64, change: &Change) -> PrepareMessage {
        PrepareMessage {
            expected_mutative_message_count: expected,
            mutation_host: self.environment.host.clone(),
            mutation_user: self.environment.user.clone(),
            mutation_timestamp: now(),
            change_uuid,
            version_number: version,
            change: change.clone(),
        }
    }

    fn commit_message(&self, expected: u64, change_uuid: Uuid) -> CommitMessage {
        CommitMessage {
            expected_mutative_message_count: expected,
            mutation_host: self.environment.host.clone(),
            mutation_user: self.environment.user.clone(),
            mutation_timestamp: now(),
            change_uuid,
        }
    }

    fn rollback_message(&self, expected: u64, change_uuid: Uuid) -> RollbackMessage {
        RollbackMessage {
            expected_mutative_message_count: expected,
            mutation_host: self.environment.host.clone(),
            mutation_user: self.environment.user.clone(),
            mutation_timestamp: now(),
            change_uuid,
        }
    }

    fn takeover_message(&self, expected: u64) -> TakeoverMessage {
        TakeoverMessage {
            expected_mutative_message_count: expected,
            mutation_host: self.environment.host.clone(),
            mutation_user: self.environment.user.clone(),
            mutation_timestamp: now(),
        }
    }

    // === Phases ===

    /// First discovery. `None` when the run was abandoned; `Some(Err(()))`
    /// when some node could not be discovered.
    async fn discovery(
        &self,
        run: &mut Run<'_>,
    ) -> Option<std::result::Result<Vec<(String, DiscoverResponse)>, ()>> {
        run.receiver.start_discovery(&run.addresses);
        let results = self
            .fan_out(&self.all_targets(), |_, ep| async move { ep.discover().await })
            .await;
        if run.abandoned() {
            return None;
        }

        let mut discovered = Vec::with_capacity(results.len());
        let mut complete = true;
        for (i, result) in results.into_iter().enumerate() {
            let address = run.addresses[i].clone();
            match result {
                Ok(response) => {
                    run.receiver.discovered(&address, &response);
                    run.expected[i] = response.mutative_message_count;
                    run.record(i, Phase::Discovery, EndpointStatus::Ok);
                    discovered.push((address, response));
                }
                Err(e) => {
                    run.emit_fail(Phase::Discovery, &address, &e.to_string());
                    run.record(i, Phase::Discovery, EndpointStatus::Failed(e.to_string()));
                    complete = false;
                }
            }
        }
        Some(if complete { Ok(discovered) } else { Err(()) })
    }

    /// Report disagreement on committed state, if any.
    fn check_committed(&self, run: &mut Run<'_>, discovered: &[(String, DiscoverResponse)]) -> Option<Consistency> {
        if let Some(found) = find_inconsistency(discovered) {
            run.receiver.discover_config_inconsistent(
                found.change_uuid,
                &found.committed,
                &found.rolled_back,
            );
            return Some(Consistency::UnrecoverablyInconsistent);
        }
        match committed_views(discovered) {
            CommittedViews::Agreed => None,
            CommittedViews::Diverged { majority, others } => {
                run.receiver.discover_config_diverged(&majority, &others);
                Some(Consistency::UnrecoverablyInconsistent)
            }
            CommittedViews::Partitioned(groups) => {
                run.receiver.discover_config_partitioned(&groups);
                Some(Consistency::UnrecoverablyPartitioned)
            }
        }
    }

    /// Re-discover and make sure no other client moved any fence. `None`
    /// when abandoned.
    async fn second_discovery(
        &self,
        run: &mut Run<'_>,
        first: &[(String, DiscoverResponse)],
    ) -> Option<bool> {
        run.receiver.start_second_discovery();
        let results = self
            .fan_out(&self.all_targets(), |_, ep| async move { ep.discover().await })
            .await;
        if run.abandoned() {
            return None;
        }

        let mut stable = true;
        for (i, result) in results.into_iter().enumerate() {
            let address = run.addresses[i].clone();
            match result {
                Ok(response)
                    if response.mutative_message_count == first[i].1.mutative_message_count =>
                {
                    run.receiver.discover_repeated(&address);
                    run.record(i, Phase::SecondDiscovery, EndpointStatus::Ok);
                }
                Ok(response) => {
                    let host = response.last_mutation_host.as_deref().unwrap_or("unknown");
                    let user = response.last_mutation_user.as_deref().unwrap_or("unknown");
                    run.emit_other_client(Phase::SecondDiscovery, &address, host, user);
                    run.record(
                        i,
                        Phase::SecondDiscovery,
                        EndpointStatus::Failed(format!("changed by {}@{}", user, host)),
                    );
                    stable = false;
                }
                Err(e) => {
                    run.emit_fail(Phase::SecondDiscovery, &address, &e.to_string());
                    run.record(i, Phase::SecondDiscovery, EndpointStatus::Failed(e.to_string()));
                    stable = false;
                }
            }
        }
        run.receiver.end_second_discovery();
        Some(stable)
    }

    /// Record the results of one mutating phase and return the indexes
    /// that accepted. Accepted endpoints advance their expected count.
    fn record_mutations(
        &self,
        run: &mut Run<'_>,
        phase: Phase,
        targets: &[usize],
        results: Vec<Result<AcceptRejectResponse>>,
    ) -> Vec<usize> {
        let mut accepted = Vec::with_capacity(targets.len());
        for (&i, result) in targets.iter().zip(results) {
            let address = run.addresses[i].clone();
            match result {
                Ok(response) if response.accepted => {
                    run.expected[i] += 1;
                    run.emit_ok(phase, &address);
                    run.record(i, phase, EndpointStatus::Ok);
                    accepted.push(i);
                }
                Ok(response) => {
                    let reason = response
                        .rejection_reason
                        .unwrap_or(RejectionReason::BadSequence);
                    let message = response.rejection_message.clone().unwrap_or_default();
                    if reason.is_other_client() {
                        let host = response.last_mutation_host.as_deref().unwrap_or("unknown");
                        let user = response.last_mutation_user.as_deref().unwrap_or("unknown");
                        run.emit_other_client(phase, &address, host, user);
                    } else if phase == Phase::Prepare && reason == RejectionReason::Unacceptable {
                        run.receiver.prepare_change_unacceptable(&address, &message);
                    } else {
                        run.emit_fail(phase, &address, &format!("{}: {}", reason, message));
                    }
                    run.record(i, phase, EndpointStatus::Rejected { reason, message });
                }
                Err(e) => {
                    run.emit_fail(phase, &address, &e.to_string());
                    run.record(i, phase, EndpointStatus::Failed(e.to_string()));
                }
            }
        }
        accepted
    }

    async fn commit_phase(&self, run: &mut Run<'_>, targets: &[usize], change_uuid: Uuid) -> Option<Vec<usize>> {
        run.receiver.start_commit();
        let messages: Vec<CommitMessage> = (0..self.endpoints.len())
            .map(|i| self.commit_message(run.expected[i], change_uuid))
            .collect();
        let results = self
            .fan_out(targets, |i, ep| {
                let msg = messages[i].clone();
                async move { ep.commit(msg).await }
            })
            .await;
        if run.abandoned() {
            return None;
        }
        let committed = self.record_mutations(run, Phase::Commit, targets, results);
        run.receiver.end_commit();
        Some(committed)
    }

    async fn rollback_phase(&self, run: &mut Run<'_>, targets: &[usize], change_uuid: Uuid) -> Option<Vec<usize>> {
        run.receiver.start_rollback();
        let messages: Vec<RollbackMessage> = (0..self.endpoints.len())
            .map(|i| self.rollback_message(run.expected[i], change_uuid))
            .collect();
        let results = self
            .fan_out(targets, |i, ep| {
                let msg = messages[i].clone();
                async move { ep.rollback(msg).await }
            })
            .await;
        if run.abandoned() {
            return None;
        }
        let rolled_back = self.record_mutations(run, Phase::Rollback, targets, results);
        run.receiver.end_rollback();
        Some(rolled_back)
    }

    // === Workflows ===

    /// Apply `change` on every endpoint, or on none of them.
    pub async fn apply_change(
        &self,
        change: Change,
        receiver: &mut dyn ResultReceiver,
    ) -> Result<RunReport> {
        self.apply_change_until(change, receiver, AbandonToken::new())
            .await
    }

    /// [`apply_change`](Self::apply_change) that stops at the first phase
    /// boundary after `abandon` fires.
    pub async fn apply_change_until(
        &self,
        change: Change,
        receiver: &mut dyn ResultReceiver,
        abandon: AbandonToken,
    ) -> Result<RunReport> {
        let mut run = Run::new(receiver, abandon, self.addresses());
        tracing::info!(endpoints = self.endpoints.len(), "Applying change: {}", change.summary());

        let discovered = match self.discovery(&mut run).await {
            None => return Ok(run.finish(RunOutcome::Abandoned)),
            Some(Err(())) => {
                run.receiver.end_discovery();
                return Ok(run.done(Consistency::UnknownButNoChange));
            }
            Some(Ok(discovered)) => discovered,
        };

        let prepared = prepared_nodes(&discovered);
        if !prepared.is_empty() {
            for p in &prepared {
                run.receiver.discover_already_prepared(
                    &p.address,
                    p.change_uuid,
                    &p.creation_host,
                    &p.creation_user,
                );
            }
            run.receiver.end_discovery();
            return Ok(run.done(Consistency::MayNeedRecovery));
        }
        if let Some(verdict) = self.check_committed(&mut run, &discovered) {
            run.receiver.end_discovery();
            return Ok(run.done(verdict));
        }
        run.receiver.end_discovery();

        match self.second_discovery(&mut run, &discovered).await {
            None => return Ok(run.finish(RunOutcome::Abandoned)),
            Some(false) => return Ok(run.done(Consistency::UnknownButNoChange)),
            Some(true) => {}
        }

        // === Prepare ===
        let version = discovered
            .iter()
            .map(|(_, r)| r.highest_version)
            .max()
            .unwrap_or(0)
            + 1;
        let change_uuid = self.ids.next_id();
        run.change_uuid = Some(change_uuid);
        run.receiver.start_prepare(change_uuid);

        let all = self.all_targets();
        let messages: Vec<PrepareMessage> = all
            .iter()
            .map(|&i| self.prepare_message(run.expected[i], change_uuid, version, &change))
            .collect();
        let results = self
            .fan_out(&all, |i, ep| {
                let msg = messages[i].clone();
                async move { ep.prepare(msg).await }
            })
            .await;
        if run.abandoned() {
            return Ok(run.finish(RunOutcome::Abandoned));
        }
        let accepted = self.record_mutations(&mut run, Phase::Prepare, &all, results);
        run.receiver.end_prepare();

        // === Commit or rollback ===
        if accepted.len() == all.len() {
            let Some(committed) = self.commit_phase(&mut run, &accepted, change_uuid).await else {
                return Ok(run.finish(RunOutcome::Abandoned));
            };
            let consistency = if committed.len() == accepted.len() {
                Consistency::Consistent
            } else {
                Consistency::MayNeedRecovery
            };
            return Ok(run.done(consistency));
        }

        // a prepare that errored may still have landed on its node
        let prepare_errored = run
            .endpoints
            .values()
            .any(|o| o.phase == Phase::Prepare && matches!(o.status, EndpointStatus::Failed(_)));
        let mut consistency = if prepare_errored {
            Consistency::MayNeedRecovery
        } else {
            Consistency::Consistent
        };
        if !accepted.is_empty() {
            let Some(rolled_back) = self.rollback_phase(&mut run, &accepted, change_uuid).await else {
                return Ok(run.finish(RunOutcome::Abandoned));
            };
            if rolled_back.len() != accepted.len() {
                consistency = Consistency::MayNeedRecovery;
            }
        }
        Ok(run.done(consistency))
    }

    /// Finish a change left PREPARED on some nodes by committing or rolling
    /// it back, as the other nodes show. Never prepares anything.
    pub async fn repair(
        &self,
        forced: Option<RepairAction>,
        receiver: &mut dyn ResultReceiver,
    ) -> Result<RunReport> {
        self.repair_until(forced, receiver, AbandonToken::new()).await
    }

    pub async fn repair_until(
        &self,
        forced: Option<RepairAction>,
        receiver: &mut dyn ResultReceiver,
        abandon: AbandonToken,
    ) -> Result<RunReport> {
        let mut run = Run::new(receiver, abandon, self.addresses());
        tracing::info!(endpoints = self.endpoints.len(), forced = ?forced, "Repairing");

        let discovered = match self.discovery(&mut run).await {
            None => return Ok(run.finish(RunOutcome::Abandoned)),
            Some(Err(())) => {
                run.receiver.end_discovery();
                return Ok(run.done(Consistency::UnknownButNoChange));
            }
            Some(Ok(discovered)) => discovered,
        };

        if let Some(found) = find_inconsistency(&discovered) {
            run.receiver.discover_config_inconsistent(
                found.change_uuid,
                &found.committed,
                &found.rolled_back,
            );
            run.receiver.end_discovery();
            return Ok(run.done(Consistency::UnrecoverablyInconsistent));
        }

        let prepared = prepared_nodes(&discovered);
        let Some(pending) = prepared.first().map(|p| p.change_uuid) else {
            let verdict = self.check_committed(&mut run, &discovered);
            run.receiver.end_discovery();
            return Ok(run.done(verdict.unwrap_or(Consistency::Consistent)));
        };
        if prepared.iter().any(|p| p.change_uuid != pending) {
            let mut groups: Vec<(Uuid, Vec<String>)> = Vec::new();
            for p in &prepared {
                match groups.iter_mut().find(|(u, _)| *u == p.change_uuid) {
                    Some((_, members)) => members.push(p.address.clone()),
                    None => groups.push((p.change_uuid, vec![p.address.clone()])),
                }
            }
            let partitions: Vec<Vec<String>> = groups.into_iter().map(|(_, m)| m).collect();
            run.receiver.discover_config_partitioned(&partitions);
            run.receiver.end_discovery();
            return Ok(run.done(Consistency::UnrecoverablyPartitioned));
        }
        run.receiver.end_discovery();
        run.change_uuid = Some(pending);

        let states: Vec<Option<ChangeRequestState>> = discovered
            .iter()
            .map(|(_, r)| {
                r.latest_change
                    .as_ref()
                    .filter(|c| c.uuid == pending)
                    .map(|c| c.state)
            })
            .collect();
        let decided = if states.contains(&Some(ChangeRequestState::Committed)) {
            Some(RepairAction::Commit)
        } else if states
            .iter()
            .any(|s| *s != Some(ChangeRequestState::Prepared))
        {
            Some(RepairAction::Rollback)
        } else {
            None
        };
        let action = match (decided, forced) {
            (Some(decided), Some(forced)) if decided != forced => {
                tracing::warn!(
                    change = %pending,
                    "Ignoring forced {:?}: nodes already show {:?}",
                    forced,
                    decided
                );
                decided
            }
            (Some(decided), _) => decided,
            (None, Some(forced)) => forced,
            (None, None) => {
                run.receiver.cannot_decide();
                return Ok(run.finish(RunOutcome::CannotDecide));
            }
        };

        match self.second_discovery(&mut run, &discovered).await {
            None => return Ok(run.finish(RunOutcome::Abandoned)),
            Some(false) => return Ok(run.done(Consistency::UnknownButNoChange)),
            Some(true) => {}
        }

        let targets: Vec<usize> = discovered
            .iter()
            .enumerate()
            .filter(|(_, (_, r))| r.mode == NodeMode::Prepared)
            .map(|(i, _)| i)
            .collect();
        let done = match action {
            RepairAction::Commit => self.commit_phase(&mut run, &targets, pending).await,
            RepairAction::Rollback => self.rollback_phase(&mut run, &targets, pending).await,
        };
        let Some(done) = done else {
            return Ok(run.finish(RunOutcome::Abandoned));
        };
        let consistency = if done.len() == targets.len() {
            Consistency::Consistent
        } else {
            Consistency::MayNeedRecovery
        };
        Ok(run.done(consistency))
    }

    /// Claim every node for this operator, rolling back any change a
    /// vanished operator left PREPARED.
    pub async fn takeover(&self, receiver: &mut dyn ResultReceiver) -> Result<RunReport> {
        self.takeover_until(receiver, AbandonToken::new()).await
    }

    pub async fn takeover_until(
        &self,
        receiver: &mut dyn ResultReceiver,
        abandon: AbandonToken,
    ) -> Result<RunReport> {
        let mut run = Run::new(receiver, abandon, self.addresses());
        tracing::info!(endpoints = self.endpoints.len(), "Taking over");

        let discovered = match self.discovery(&mut run).await {
            None => return Ok(run.finish(RunOutcome::Abandoned)),
            Some(Err(())) => {
                run.receiver.end_discovery();
                return Ok(run.done(Consistency::UnknownButNoChange));
            }
            Some(Ok(discovered)) => discovered,
        };

        let prepared = prepared_nodes(&discovered);
        let committed_elsewhere = prepared.iter().any(|p| {
            discovered.iter().any(|(_, r)| {
                r.latest_change
                    .as_ref()
                    .is_some_and(|c| c.uuid == p.change_uuid && c.state == ChangeRequestState::Committed)
            })
        });
        if committed_elsewhere {
            for p in &prepared {
                run.receiver.discover_already_prepared(
                    &p.address,
                    p.change_uuid,
                    &p.creation_host,
                    &p.creation_user,
                );
            }
            run.receiver.end_discovery();
            return Ok(run.done(Consistency::MayNeedRecovery));
        }
        run.receiver.end_discovery();
        run.change_uuid = prepared.first().map(|p| p.change_uuid);

        match self.second_discovery(&mut run, &discovered).await {
            None => return Ok(run.finish(RunOutcome::Abandoned)),
            Some(false) => return Ok(run.done(Consistency::UnknownButNoChange)),
            Some(true) => {}
        }

        run.receiver.start_take_over();
        let all = self.all_targets();
        let messages: Vec<TakeoverMessage> = all
            .iter()
            .map(|&i| self.takeover_message(run.expected[i]))
            .collect();
        let results = self
            .fan_out(&all, |i, ep| {
                let msg = messages[i].clone();
                async move { ep.takeover(msg).await }
            })
            .await;
        if run.abandoned() {
            return Ok(run.finish(RunOutcome::Abandoned));
        }
        let taken = self.record_mutations(&mut run, Phase::Takeover, &all, results);
        run.receiver.end_take_over();

        let consistency = if taken.len() == all.len() {
            Consistency::Consistent
        } else {
            Consistency::MayNeedRecovery
        };
        Ok(run.done(consistency))
    }

    /// One discovery round and the cluster state it shows. Read-only.
    pub async fn status(&self, receiver: &mut dyn ResultReceiver) -> Result<StatusReport> {
        let addresses = self.addresses();
        receiver.start_discovery(&addresses);
        let results = self
            .fan_out(&self.all_targets(), |_, ep| async move { ep.discover().await })
            .await;

        let mut classified = Vec::with_capacity(results.len());
        let mut nodes = BTreeMap::new();
        for (address, result) in addresses.into_iter().zip(results) {
            match result {
                Ok(response) => {
                    receiver.discovered(&address, &response);
                    classified.push((address.clone(), Some(response.clone())));
                    nodes.insert(address, Ok(response));
                }
                Err(e) => {
                    receiver.discover_fail(&address, &e.to_string());
                    classified.push((address.clone(), None));
                    nodes.insert(address, Err(e.to_string()));
                }
            }
        }
        receiver.end_discovery();

        let state = analyze_global_state(&classified);
        tracing::info!("Cluster state: {}", state);
        Ok(StatusReport { state, nodes })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::applicator::{Cluster, Node, RoutingApplicator, Stripe};
    use crate::common::storage::MemLedger;
    use crate::node::{MemSnapshotStore, NodeStateStore, ProtocolServer};
    use crate::orchestrator::endpoint::LocalEndpoint;
    use crate::orchestrator::receiver::NoopReceiver;

    fn local(name: &str) -> LocalEndpoint {
        let store = NodeStateStore::open(
            Arc::new(MemLedger::new()),
            Arc::new(MemSnapshotStore::new()),
        )
        .unwrap();
        let server =
            ProtocolServer::new(name, store, Arc::new(RoutingApplicator::with_defaults(name))).unwrap();
        LocalEndpoint::new(name, Arc::new(server))
    }

    fn orchestrator(names: &[&str]) -> Orchestrator<LocalEndpoint> {
        Orchestrator::new(
            names.iter().map(|n| local(n)).collect(),
            Environment::new("ops", "alice"),
            Arc::new(ChangeIdGenerator::sequential(1)),
            OrchestratorConfig::default(),
        )
    }

    fn activate(names: &[&str]) -> Change {
        let nodes = names.iter().map(|n| Node::new(*n, format!("{}:9410", n))).collect();
        Change::Activate {
            cluster: Cluster::new("prod", vec![Stripe::new("s1", nodes)]),
        }
    }

    #[tokio::test]
    async fn test_apply_change_commits_everywhere() {
        let names = ["n1", "n2", "n3"];
        let orch = orchestrator(&names);
        let report = orch
            .apply_change(activate(&names), &mut NoopReceiver)
            .await
            .unwrap();
        assert!(report.is_consistent());
        assert_eq!(report.change_uuid, Some(Uuid::from_u128(1)));
        assert!(report
            .endpoints
            .values()
            .all(|o| o.phase == Phase::Commit && o.status == EndpointStatus::Ok));

        let status = orch.status(&mut NoopReceiver).await.unwrap();
        assert_eq!(status.state, GlobalState::Accepting);
        for node in status.nodes.values() {
            let node = node.as_ref().unwrap();
            assert_eq!(node.current_version, 1);
            assert_eq!(node.mutative_message_count, 2);
        }
    }

    #[tokio::test]
    async fn test_abandoned_run_discards_results() {
        let orch = orchestrator(&["n1"]);
        let abandon = AbandonToken::new();
        abandon.abandon();
        let report = orch
            .apply_change_until(activate(&["n1"]), &mut NoopReceiver, abandon)
            .await
            .unwrap();
        assert_eq!(report.outcome, RunOutcome::Abandoned);
        assert!(report.endpoints.is_empty());
    }

    #[tokio::test]
    async fn test_abandoning_one_run_leaves_the_next_alone() {
        let orch = orchestrator(&["n1", "n2"]);
        let abandon = AbandonToken::new();
        abandon.abandon();
        let report = orch
            .apply_change_until(activate(&["n1", "n2"]), &mut NoopReceiver, abandon)
            .await
            .unwrap();
        assert_eq!(report.outcome, RunOutcome::Abandoned);

        let report = orch
            .apply_change(activate(&["n1", "n2"]), &mut NoopReceiver)
            .await
            .unwrap();
        assert_eq!(report.outcome, RunOutcome::Done(Consistency::Consistent));
        for endpoint in orch.endpoints() {
            let d = endpoint.discover().await.unwrap();
            assert_eq!(d.current_version, 1);
            assert_eq!(d.mutative_message_count, 2);
        }

        let report = orch.takeover(&mut NoopReceiver).await.unwrap();
        assert!(report.is_consistent());
    }

    #[tokio::test]
    async fn test_repair_with_nothing_pending_is_consistent() {
        let orch = orchestrator(&["n1", "n2"]);
        let report = orch.repair(None, &mut NoopReceiver).await.unwrap();
        assert!(report.is_consistent());
        assert_eq!(report.change_uuid, None);
    }
}

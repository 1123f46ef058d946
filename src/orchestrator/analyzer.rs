//! Consistency analysis over discovery results

use crate::common::messages::{ChangeRequestState, DiscoverResponse, NodeMode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Terminal outcome of an orchestration run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Consistency {
    /// Every node agrees; the run did what it set out to do or changed nothing.
    Consistent,
    /// Some node may be left PREPARED or disagree; run repair.
    MayNeedRecovery,
    /// The run stopped before mutating anything.
    UnknownButNoChange,
    /// Nodes disagree on what was committed, with a clear majority.
    UnrecoverablyInconsistent,
    /// Nodes disagree on what was committed, with no majority.
    UnrecoverablyPartitioned,
}

impl fmt::Display for Consistency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Consistency::Consistent => "CONSISTENT",
            Consistency::MayNeedRecovery => "MAY_NEED_RECOVERY",
            Consistency::UnknownButNoChange => "UNKNOWN_BUT_NO_CHANGE",
            Consistency::UnrecoverablyInconsistent => "UNRECOVERABLY_INCONSISTENT",
            Consistency::UnrecoverablyPartitioned => "UNRECOVERABLY_PARTITIONED",
        };
        write!(f, "{}", s)
    }
}

/// Cluster-wide state as seen by one discovery round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GlobalState {
    Accepting,
    Prepared,
    MaybePrepared,
    PartiallyPrepared,
    PartiallyCommitted,
    MaybePartiallyCommitted,
    PartiallyRolledBack,
    MaybePartiallyRolledBack,
    Inconsistent,
    Partitioned,
    DiscoveryFailure,
    Unknown,
    MaybeUnknown,
}

impl fmt::Display for GlobalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            GlobalState::Accepting => "ACCEPTING",
            GlobalState::Prepared => "PREPARED",
            GlobalState::MaybePrepared => "MAYBE_PREPARED",
            GlobalState::PartiallyPrepared => "PARTIALLY_PREPARED",
            GlobalState::PartiallyCommitted => "PARTIALLY_COMMITTED",
            GlobalState::MaybePartiallyCommitted => "MAYBE_PARTIALLY_COMMITTED",
            GlobalState::PartiallyRolledBack => "PARTIALLY_ROLLED_BACK",
            GlobalState::MaybePartiallyRolledBack => "MAYBE_PARTIALLY_ROLLED_BACK",
            GlobalState::Inconsistent => "INCONSISTENT",
            GlobalState::Partitioned => "PARTITIONED",
            GlobalState::DiscoveryFailure => "DISCOVERY_FAILURE",
            GlobalState::Unknown => "UNKNOWN",
            GlobalState::MaybeUnknown => "MAYBE_UNKNOWN",
        };
        write!(f, "{}", s)
    }
}

/// A node with a change outstanding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedNode {
    pub address: String,
    pub change_uuid: Uuid,
    pub creation_host: String,
    pub creation_user: String,
}

/// One change committed on some nodes and rolled back on others.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inconsistency {
    pub change_uuid: Uuid,
    pub committed: Vec<String>,
    pub rolled_back: Vec<String>,
}

/// How the nodes' latest committed changes line up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommittedViews {
    Agreed,
    /// A strict majority agrees; the rest do not.
    Diverged {
        majority: Vec<String>,
        others: Vec<String>,
    },
    /// No group is a strict majority.
    Partitioned(Vec<Vec<String>>),
}

pub fn prepared_nodes(responses: &[(String, DiscoverResponse)]) -> Vec<PreparedNode> {
    responses
        .iter()
        .filter(|(_, r)| r.mode == NodeMode::Prepared)
        .filter_map(|(address, r)| {
            r.latest_change.as_ref().map(|c| PreparedNode {
                address: address.clone(),
                change_uuid: c.uuid,
                creation_host: c.creation_host.clone(),
                creation_user: c.creation_user.clone(),
            })
        })
        .collect()
}

/// First change found COMMITTED on some node and ROLLED_BACK on another.
pub fn find_inconsistency(responses: &[(String, DiscoverResponse)]) -> Option<Inconsistency> {
    let mut by_change: BTreeMap<Uuid, (Vec<String>, Vec<String>)> = BTreeMap::new();
    for (address, response) in responses {
        let mut seen = Vec::with_capacity(2);
        for details in [&response.latest_change, &response.latest_committed_change]
            .into_iter()
            .flatten()
        {
            if seen.contains(&details.uuid) {
                continue;
            }
            seen.push(details.uuid);
            let entry = by_change.entry(details.uuid).or_default();
            match details.state {
                ChangeRequestState::Committed => entry.0.push(address.clone()),
                ChangeRequestState::RolledBack => entry.1.push(address.clone()),
                ChangeRequestState::Prepared => {}
            }
        }
    }
    by_change
        .into_iter()
        .find(|(_, (committed, rolled_back))| !committed.is_empty() && !rolled_back.is_empty())
        .map(|(change_uuid, (committed, rolled_back))| Inconsistency {
            change_uuid,
            committed,
            rolled_back,
        })
}

/// Group nodes by their latest committed change.
pub fn committed_views(responses: &[(String, DiscoverResponse)]) -> CommittedViews {
    let mut groups: Vec<(Option<Uuid>, Vec<String>)> = Vec::new();
    for (address, response) in responses {
        let key = response.latest_committed_change.as_ref().map(|c| c.uuid);
        match groups.iter_mut().find(|(k, _)| *k == key) {
            Some((_, members)) => members.push(address.clone()),
            None => groups.push((key, vec![address.clone()])),
        }
    }
    if groups.len() <= 1 {
        return CommittedViews::Agreed;
    }

    let total = responses.len();
    if let Some(pos) = groups.iter().position(|(_, m)| m.len() * 2 > total) {
        let (_, majority) = groups.remove(pos);
        let others = groups.into_iter().flat_map(|(_, m)| m).collect();
        return CommittedViews::Diverged { majority, others };
    }
    CommittedViews::Partitioned(groups.into_iter().map(|(_, m)| m).collect())
}

/// Classify the cluster from one discovery round. `None` marks a node that
/// could not be discovered.
pub fn analyze_global_state(results: &[(String, Option<DiscoverResponse>)]) -> GlobalState {
    let reachable: Vec<(String, DiscoverResponse)> = results
        .iter()
        .filter_map(|(a, r)| r.clone().map(|r| (a.clone(), r)))
        .collect();
    let failures = results.len() - reachable.len();
    if reachable.is_empty() {
        return GlobalState::DiscoveryFailure;
    }
    if find_inconsistency(&reachable).is_some() {
        return GlobalState::Inconsistent;
    }

    // newest change anywhere, by version
    let newest = reachable
        .iter()
        .filter_map(|(_, r)| r.latest_change.as_ref())
        .max_by_key(|c| c.version)
        .map(|c| c.uuid);

    let Some(newest) = newest else {
        return if failures > 0 {
            GlobalState::MaybeUnknown
        } else {
            GlobalState::Accepting
        };
    };

    let (mut prepared, mut committed, mut rolled_back, mut absent) = (0, 0, 0, 0);
    for (_, r) in &reachable {
        match r.latest_change.as_ref().filter(|c| c.uuid == newest) {
            Some(c) => match c.state {
                ChangeRequestState::Prepared => prepared += 1,
                ChangeRequestState::Committed => committed += 1,
                ChangeRequestState::RolledBack => rolled_back += 1,
            },
            None => absent += 1,
        }
    }
    let n = reachable.len();

    if committed > 0 && prepared > 0 {
        return GlobalState::PartiallyCommitted;
    }
    if rolled_back > 0 && prepared > 0 {
        return GlobalState::PartiallyRolledBack;
    }
    if prepared > 0 && absent > 0 {
        return GlobalState::PartiallyPrepared;
    }
    if prepared == n {
        return if failures > 0 {
            GlobalState::MaybePrepared
        } else {
            GlobalState::Prepared
        };
    }

    match committed_views(&reachable) {
        CommittedViews::Agreed => {}
        CommittedViews::Diverged { .. } => return GlobalState::Inconsistent,
        CommittedViews::Partitioned(_) => return GlobalState::Partitioned,
    }

    if failures > 0 {
        if committed == n {
            return GlobalState::MaybePartiallyCommitted;
        }
        if rolled_back == n {
            return GlobalState::MaybePartiallyRolledBack;
        }
        return GlobalState::MaybeUnknown;
    }
    if prepared == 0 {
        return GlobalState::Accepting;
    }
    GlobalState::Unknown
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::applicator::{Applicability, Change};
    use crate::common::messages::ChangeDetails;
    use chrono::Utc;

    fn details(id: u128, version: u64, state: ChangeRequestState) -> ChangeDetails {
        ChangeDetails {
            uuid: Uuid::from_u128(id),
            state,
            version,
            change: Change::set(Applicability::Cluster, "k", "v"),
            result: None,
            result_hash: String::new(),
            creation_host: "ops".into(),
            creation_user: "alice".into(),
            creation_timestamp: Utc::now(),
        }
    }

    /// Node whose latest change is `latest` and newest committed change is
    /// `committed`.
    fn node(latest: Option<ChangeDetails>, committed: Option<ChangeDetails>) -> DiscoverResponse {
        let mode = match &latest {
            Some(c) if c.state == ChangeRequestState::Prepared => NodeMode::Prepared,
            _ => NodeMode::Accepting,
        };
        DiscoverResponse {
            mode,
            mutative_message_count: 0,
            last_mutation_host: None,
            last_mutation_user: None,
            last_mutation_timestamp: None,
            current_version: committed.as_ref().map(|c| c.version).unwrap_or(0),
            highest_version: latest.as_ref().map(|c| c.version).unwrap_or(0),
            latest_change: latest,
            latest_committed_change: committed,
        }
    }

    fn committed_at(id: u128, version: u64) -> DiscoverResponse {
        let c = details(id, version, ChangeRequestState::Committed);
        node(Some(c.clone()), Some(c))
    }

    fn named(nodes: Vec<DiscoverResponse>) -> Vec<(String, DiscoverResponse)> {
        nodes
            .into_iter()
            .enumerate()
            .map(|(i, r)| (format!("node-{}", i + 1), r))
            .collect()
    }

    #[test]
    fn test_diverged_committed_versions() {
        let responses = named(vec![committed_at(4, 4), committed_at(5, 5), committed_at(4, 4)]);
        assert_eq!(
            committed_views(&responses),
            CommittedViews::Diverged {
                majority: vec!["node-1".into(), "node-3".into()],
                others: vec!["node-2".into()],
            }
        );
    }

    #[test]
    fn test_partitioned_committed_versions() {
        let responses = named(vec![committed_at(1, 1), committed_at(2, 2)]);
        assert!(matches!(
            committed_views(&responses),
            CommittedViews::Partitioned(groups) if groups.len() == 2
        ));
    }

    #[test]
    fn test_committed_vs_rolled_back() {
        let base = details(1, 1, ChangeRequestState::Committed);
        let responses = named(vec![
            node(Some(details(2, 2, ChangeRequestState::Committed)), Some(details(2, 2, ChangeRequestState::Committed))),
            node(Some(details(2, 2, ChangeRequestState::RolledBack)), Some(base)),
        ]);
        let found = find_inconsistency(&responses).unwrap();
        assert_eq!(found.change_uuid, Uuid::from_u128(2));
        assert_eq!(found.committed, vec!["node-1".to_string()]);
        assert_eq!(found.rolled_back, vec!["node-2".to_string()]);
    }

    #[test]
    fn test_prepared_nodes() {
        let responses = named(vec![
            committed_at(1, 1),
            node(Some(details(2, 2, ChangeRequestState::Prepared)), None),
        ]);
        let prepared = prepared_nodes(&responses);
        assert_eq!(prepared.len(), 1);
        assert_eq!(prepared[0].address, "node-2");
        assert_eq!(prepared[0].creation_user, "alice");
    }

    #[test]
    fn test_global_states() {
        let reachable = |nodes: Vec<DiscoverResponse>| -> Vec<(String, Option<DiscoverResponse>)> {
            named(nodes).into_iter().map(|(a, r)| (a, Some(r))).collect()
        };
        let base = details(1, 1, ChangeRequestState::Committed);
        let prepared = || node(Some(details(2, 2, ChangeRequestState::Prepared)), Some(base.clone()));
        let committed = || committed_at(2, 2);

        assert_eq!(
            analyze_global_state(&reachable(vec![node(None, None), node(None, None)])),
            GlobalState::Accepting
        );
        assert_eq!(
            analyze_global_state(&reachable(vec![committed(), committed()])),
            GlobalState::Accepting
        );
        assert_eq!(
            analyze_global_state(&reachable(vec![prepared(), prepared()])),
            GlobalState::Prepared
        );
        assert_eq!(
            analyze_global_state(&reachable(vec![prepared(), committed()])),
            GlobalState::PartiallyCommitted
        );
        assert_eq!(
            analyze_global_state(&reachable(vec![prepared(), committed_at(1, 1)])),
            GlobalState::PartiallyPrepared
        );

        let mut partial = reachable(vec![committed(), committed()]);
        partial.push(("node-3".into(), None));
        assert_eq!(analyze_global_state(&partial), GlobalState::MaybePartiallyCommitted);

        let mut maybe = reachable(vec![prepared()]);
        maybe.push(("node-2".into(), None));
        assert_eq!(analyze_global_state(&maybe), GlobalState::MaybePrepared);

        let none: Vec<(String, Option<DiscoverResponse>)> = vec![("node-1".into(), None)];
        assert_eq!(analyze_global_state(&none), GlobalState::DiscoveryFailure);

        assert_eq!(
            analyze_global_state(&reachable(vec![committed_at(4, 4), committed_at(5, 5), committed_at(4, 4)])),
            GlobalState::Inconsistent
        );
    }
}

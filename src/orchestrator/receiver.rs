//! Progress reporting for orchestration runs
//!
//! The orchestrator calls a [`ResultReceiver`] synchronously, in endpoint
//! order, after each phase barrier. Every callback has a no-op default so
//! a receiver only implements what it cares about. [`MultiReceiver`] fans
//! one event stream out to several receivers.

use super::analyzer::Consistency;
use crate::common::messages::DiscoverResponse;
use uuid::Uuid;

#[allow(unused_variables)]
pub trait ResultReceiver: Send {
    // === Discovery ===
    fn start_discovery(&mut self, addresses: &[String]) {}
    fn discovered(&mut self, address: &str, response: &DiscoverResponse) {}
    fn discover_fail(&mut self, address: &str, reason: &str) {}
    fn discover_already_prepared(
        &mut self,
        address: &str,
        change_uuid: Uuid,
        creation_host: &str,
        creation_user: &str,
    ) {
    }
    fn discover_config_inconsistent(
        &mut self,
        change_uuid: Uuid,
        committed: &[String],
        rolled_back: &[String],
    ) {
    }
    fn discover_config_diverged(&mut self, majority: &[String], others: &[String]) {}
    fn discover_config_partitioned(&mut self, partitions: &[Vec<String>]) {}
    fn end_discovery(&mut self) {}

    // === Second discovery ===
    fn start_second_discovery(&mut self) {}
    fn discover_repeated(&mut self, address: &str) {}
    fn discover_other_client(&mut self, address: &str, host: &str, user: &str) {}
    fn end_second_discovery(&mut self) {}

    // === Prepare ===
    fn start_prepare(&mut self, change_uuid: Uuid) {}
    fn prepared(&mut self, address: &str) {}
    fn prepare_fail(&mut self, address: &str, reason: &str) {}
    fn prepare_other_client(&mut self, address: &str, host: &str, user: &str) {}
    fn prepare_change_unacceptable(&mut self, address: &str, rejection: &str) {}
    fn end_prepare(&mut self) {}

    // === Commit ===
    fn start_commit(&mut self) {}
    fn committed(&mut self, address: &str) {}
    fn commit_fail(&mut self, address: &str, reason: &str) {}
    fn commit_other_client(&mut self, address: &str, host: &str, user: &str) {}
    fn end_commit(&mut self) {}

    // === Rollback ===
    fn start_rollback(&mut self) {}
    fn rolled_back(&mut self, address: &str) {}
    fn rollback_fail(&mut self, address: &str, reason: &str) {}
    fn rollback_other_client(&mut self, address: &str, host: &str, user: &str) {}
    fn end_rollback(&mut self) {}

    // === Takeover ===
    fn start_take_over(&mut self) {}
    fn took_over(&mut self, address: &str) {}
    fn take_over_fail(&mut self, address: &str, reason: &str) {}
    fn take_over_other_client(&mut self, address: &str, host: &str, user: &str) {}
    fn end_take_over(&mut self) {}

    // === Terminal ===
    fn done(&mut self, consistency: Consistency) {}
    fn cannot_decide(&mut self) {}
}

/// Receiver that ignores everything.
pub struct NoopReceiver;

impl ResultReceiver for NoopReceiver {}

/// Forwards every event to each inner receiver in order.
#[derive(Default)]
pub struct MultiReceiver {
    receivers: Vec<Box<dyn ResultReceiver>>,
}

impl MultiReceiver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, receiver: impl ResultReceiver + 'static) -> Self {
        self.receivers.push(Box::new(receiver));
        self
    }

    pub fn push(&mut self, receiver: Box<dyn ResultReceiver>) {
        self.receivers.push(receiver);
    }
}

macro_rules! fan_out {
    ($(fn $name:ident(&mut self $(, $arg:ident: $ty:ty)*);)*) => {
        $(
            fn $name(&mut self $(, $arg: $ty)*) {
                for r in &mut self.receivers {
                    r.$name($($arg),*);
                }
            }
        )*
    };
}

impl ResultReceiver for MultiReceiver {
    fan_out! {
        fn start_discovery(&mut self, addresses: &[String]);
        fn discovered(&mut self, address: &str, response: &DiscoverResponse);
        fn discover_fail(&mut self, address: &str, reason: &str);
        fn discover_already_prepared(&mut self, address: &str, change_uuid: Uuid, creation_host: &str, creation_user: &str);
        fn discover_config_inconsistent(&mut self, change_uuid: Uuid, committed: &[String], rolled_back: &[String]);
        fn discover_config_diverged(&mut self, majority: &[String], others: &[String]);
        fn discover_config_partitioned(&mut self, partitions: &[Vec<String>]);
        fn end_discovery(&mut self);
        fn start_second_discovery(&mut self);
        fn discover_repeated(&mut self, address: &str);
        fn discover_other_client(&mut self, address: &str, host: &str, user: &str);
        fn end_second_discovery(&mut self);
        fn start_prepare(&mut self, change_uuid: Uuid);
        fn prepared(&mut self, address: &str);
        fn prepare_fail(&mut self, address: &str, reason: &str);
        fn prepare_other_client(&mut self, address: &str, host: &str, user: &str);
        fn prepare_change_unacceptable(&mut self, address: &str, rejection: &str);
        fn end_prepare(&mut self);
        fn start_commit(&mut self);
        fn committed(&mut self, address: &str);
        fn commit_fail(&mut self, address: &str, reason: &str);
        fn commit_other_client(&mut self, address: &str, host: &str, user: &str);
        fn end_commit(&mut self);
        fn start_rollback(&mut self);
        fn rolled_back(&mut self, address: &str);
        fn rollback_fail(&mut self, address: &str, reason: &str);
        fn rollback_other_client(&mut self, address: &str, host: &str, user: &str);
        fn end_rollback(&mut self);
        fn start_take_over(&mut self);
        fn took_over(&mut self, address: &str);
        fn take_over_fail(&mut self, address: &str, reason: &str);
        fn take_over_other_client(&mut self, address: &str, host: &str, user: &str);
        fn end_take_over(&mut self);
        fn done(&mut self, consistency: Consistency);
        fn cannot_decide(&mut self);
    }
}

/// Renders every event through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingReceiver;

impl ResultReceiver for LoggingReceiver {
    fn start_discovery(&mut self, addresses: &[String]) {
        tracing::info!("Discovering {} node(s): {}", addresses.len(), addresses.join(", "));
    }

    fn discovered(&mut self, address: &str, response: &DiscoverResponse) {
        tracing::info!(
            node = %address,
            mode = %response.mode,
            count = response.mutative_message_count,
            current_version = response.current_version,
            highest_version = response.highest_version,
            "Discovered"
        );
    }

    fn discover_fail(&mut self, address: &str, reason: &str) {
        tracing::warn!(node = %address, "Discovery failed: {}", reason);
    }

    fn discover_already_prepared(
        &mut self,
        address: &str,
        change_uuid: Uuid,
        creation_host: &str,
        creation_user: &str,
    ) {
        tracing::warn!(
            node = %address,
            change = %change_uuid,
            "Node already has a change prepared by {}@{}",
            creation_user,
            creation_host
        );
    }

    fn discover_config_inconsistent(
        &mut self,
        change_uuid: Uuid,
        committed: &[String],
        rolled_back: &[String],
    ) {
        tracing::error!(
            change = %change_uuid,
            "Change committed on [{}] but rolled back on [{}]",
            committed.join(", "),
            rolled_back.join(", ")
        );
    }

    fn discover_config_diverged(&mut self, majority: &[String], others: &[String]) {
        tracing::error!(
            "Committed configuration diverged: majority [{}], others [{}]",
            majority.join(", "),
            others.join(", ")
        );
    }

    fn discover_config_partitioned(&mut self, partitions: &[Vec<String>]) {
        let groups: Vec<String> = partitions.iter().map(|p| format!("[{}]", p.join(", "))).collect();
        tracing::error!("Committed configuration partitioned: {}", groups.join(" "));
    }

    fn discover_other_client(&mut self, address: &str, host: &str, user: &str) {
        tracing::warn!(node = %address, "Node was changed by {}@{} during discovery", user, host);
    }

    fn start_prepare(&mut self, change_uuid: Uuid) {
        tracing::info!(change = %change_uuid, "Preparing change");
    }

    fn prepared(&mut self, address: &str) {
        tracing::info!(node = %address, "Prepared");
    }

    fn prepare_fail(&mut self, address: &str, reason: &str) {
        tracing::warn!(node = %address, "Prepare failed: {}", reason);
    }

    fn prepare_other_client(&mut self, address: &str, host: &str, user: &str) {
        tracing::warn!(node = %address, "Prepare lost to {}@{}", user, host);
    }

    fn prepare_change_unacceptable(&mut self, address: &str, rejection: &str) {
        tracing::warn!(node = %address, "Change refused: {}", rejection);
    }

    fn start_commit(&mut self) {
        tracing::info!("Committing change");
    }

    fn committed(&mut self, address: &str) {
        tracing::info!(node = %address, "Committed");
    }

    fn commit_fail(&mut self, address: &str, reason: &str) {
        tracing::error!(node = %address, "Commit failed: {}", reason);
    }

    fn commit_other_client(&mut self, address: &str, host: &str, user: &str) {
        tracing::error!(node = %address, "Commit lost to {}@{}", user, host);
    }

    fn start_rollback(&mut self) {
        tracing::info!("Rolling back change");
    }

    fn rolled_back(&mut self, address: &str) {
        tracing::info!(node = %address, "Rolled back");
    }

    fn rollback_fail(&mut self, address: &str, reason: &str) {
        tracing::error!(node = %address, "Rollback failed: {}", reason);
    }

    fn rollback_other_client(&mut self, address: &str, host: &str, user: &str) {
        tracing::error!(node = %address, "Rollback lost to {}@{}", user, host);
    }

    fn start_take_over(&mut self) {
        tracing::info!("Taking over nodes");
    }

    fn took_over(&mut self, address: &str) {
        tracing::info!(node = %address, "Taken over");
    }

    fn take_over_fail(&mut self, address: &str, reason: &str) {
        tracing::error!(node = %address, "Takeover failed: {}", reason);
    }

    fn take_over_other_client(&mut self, address: &str, host: &str, user: &str) {
        tracing::error!(node = %address, "Takeover lost to {}@{}", user, host);
    }

    fn done(&mut self, consistency: Consistency) {
        match consistency {
            Consistency::Consistent => tracing::info!("Done: {}", consistency),
            _ => tracing::warn!("Done: {}", consistency),
        }
    }

    fn cannot_decide(&mut self) {
        tracing::warn!("Every node is prepared for the same change; commit or rollback must be forced");
    }
}

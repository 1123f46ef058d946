//! Repair half-finished changes and take over abandoned nodes

use crate::common::{Error, OrchestratorConfig, Result};
use crate::common::utils::ChangeIdGenerator;
use crate::orchestrator::{
    HttpEndpoint, LoggingReceiver, MultiReceiver, Orchestrator, RepairAction, ResultReceiver,
    RunOutcome, RunReport,
};
use std::sync::Arc;

fn orchestrator(endpoints: &str, config: &OrchestratorConfig) -> Result<Orchestrator<HttpEndpoint>> {
    Ok(Orchestrator::new(
        HttpEndpoint::parse_list(endpoints)?,
        config.environment(),
        Arc::new(ChangeIdGenerator::random()),
        config.clone(),
    ))
}

/// Commit or roll back a change left PREPARED on some of `endpoints`.
///
/// Events go to the log and to `receiver`. When the nodes cannot tell
/// which way to go and `forced` is None, fails with `RepairFailed`.
pub async fn repair_cluster(
    endpoints: &str,
    forced: Option<RepairAction>,
    config: &OrchestratorConfig,
    receiver: Box<dyn ResultReceiver>,
) -> Result<RunReport> {
    tracing::info!("Starting cluster repair");
    let orch = orchestrator(endpoints, config)?;
    let mut events = MultiReceiver::new().with(LoggingReceiver);
    events.push(receiver);

    let report = orch.repair(forced, &mut events).await?;
    if report.outcome == RunOutcome::CannotDecide {
        let uuid = report
            .change_uuid
            .map(|u| u.to_string())
            .unwrap_or_else(|| "unknown".into());
        return Err(Error::RepairFailed(format!(
            "change {} is prepared on every node; force commit or rollback",
            uuid
        )));
    }
    Ok(report)
}

/// Reset every node in `endpoints` to ACCEPTING under this operator.
pub async fn takeover_cluster(
    endpoints: &str,
    config: &OrchestratorConfig,
    receiver: Box<dyn ResultReceiver>,
) -> Result<RunReport> {
    tracing::info!("Starting cluster takeover");
    let orch = orchestrator(endpoints, config)?;
    let mut events = MultiReceiver::new().with(LoggingReceiver);
    events.push(receiver);
    orch.takeover(&mut events).await
}

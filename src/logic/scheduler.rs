//! Periodic polling of the branch queue.

use log::{debug, error, info};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::logic::orchestrator::BranchQueueOrchestrator;
use crate::model::BranchQueueSettings;

/// Run the orchestrator every `every` until `cancel` is triggered.
///
/// A run in progress is not interrupted; the orchestrator stops after the
/// current row once the token is cancelled.
pub async fn run_scheduler(
    orchestrator: Arc<BranchQueueOrchestrator>,
    settings: BranchQueueSettings,
    every: Duration,
    cancel: CancellationToken,
) {
    info!("Branch queue scheduler started, polling every {}s", every.as_secs());

    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Branch queue scheduler stopping");
                break;
            }
            _ = interval.tick() => {
                match orchestrator.execute(&settings, &cancel).await {
                    Ok(run) if run.results.is_empty() => debug!("Branch queue: nothing due"),
                    Ok(run) => {
                        let failed = run.results.iter().filter(|r| !r.success).count();
                        info!(
                            "Run {} processed {} row(s), {} failed",
                            run.run_id,
                            run.results.len(),
                            failed
                        );
                    }
                    Err(e) => error!("Branch queue run failed: {:#}", e),
                }
            }
        }
    }
}

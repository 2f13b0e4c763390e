// src/scheduler.rs
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::pipeline::Pipeline;

/// Spawn the periodic pipeline trigger. Ticks that land while a run is in
/// flight are skipped, not queued; `Pipeline::try_run` enforces that at most
/// one invocation executes at a time.
pub fn spawn_pipeline_scheduler(pipeline: Arc<Pipeline>, interval_secs: u64) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(interval_secs));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match pipeline.try_run().await {
                Some(Ok(summary)) => info!(
                    collected = summary.collected,
                    stored = summary.stored,
                    flagged = summary.flagged_deleted,
                    "scheduled pipeline run finished"
                ),
                Some(Err(e)) => error!(error = %e, "scheduled pipeline run failed"),
                None => {}
            }
        }
    })
}

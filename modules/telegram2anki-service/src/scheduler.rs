//! Runs the pipeline on a cron schedule for hosts without an external scheduler.

use crate::error::{PipelineError, Result};
use crate::gemini_api::TextGenerator;
use crate::pipeline::{RunContext, RunOptions, run_once};
use chrono::{DateTime, Utc};
use cron::Schedule;
use std::str::FromStr;

/// Parses a six-field (seconds first) cron expression.
pub fn parse_schedule(expr: &str) -> Result<Schedule> {
    Schedule::from_str(expr.trim())
        .map_err(|e| PipelineError::InvalidConfig(format!("invalid cron expression '{}': {}", expr, e)))
}

pub fn next_run_after(schedule: &Schedule, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    schedule.after(&after).next()
}

/// Sleeps until each occurrence and runs the pipeline. A failed run is logged
/// and the loop moves on to the next occurrence.
pub async fn run_scheduler<G: TextGenerator>(ctx: &RunContext<G>, schedule: Schedule) -> Result<()> {
    loop {
        let now = Utc::now();
        let Some(next) = next_run_after(&schedule, now) else {
            log::warn!("[SCHEDULER] Schedule has no further occurrences, stopping");
            return Ok(());
        };

        let wait = (next - now).to_std().unwrap_or_default();
        log::info!(
            "[SCHEDULER] Next run at {} (in {}m)",
            next.to_rfc3339(),
            wait.as_secs() / 60
        );
        tokio::time::sleep(wait).await;

        match run_once(ctx, &RunOptions::default()).await {
            Ok(summary) => log::info!(
                "[SCHEDULER] Run {} {}: {} cards",
                summary.run_id,
                summary.status,
                summary.cards_added
            ),
            Err(e) => log::error!("[SCHEDULER] Run failed: {}", e),
        }
    }
}

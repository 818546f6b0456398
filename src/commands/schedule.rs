use anyhow::Result;
use chrono::Utc;
use std::time::Duration;
use tokio::signal;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::OrchestratorError;
use crate::orchestrator::Orchestrator;
use crate::schedule::{ScheduleOutcome, Scheduler, SCHEDULED_WORKER};

use super::run::print_lines;

/// Command to launch news collection on the `news_schedule` interval until Ctrl-C
pub struct ScheduleCommand {
    check_interval: Duration,
}

impl ScheduleCommand {
    pub fn new(check_secs: u64) -> Self {
        Self {
            check_interval: Duration::from_secs(check_secs.max(1)),
        }
    }

    pub async fn execute(&self) -> Result<()> {
        let config = Config::from_env();
        let orchestrator = Orchestrator::open(&config).await?;
        let scheduler = Scheduler::new(&orchestrator);

        let printer = tokio::spawn(print_lines(
            SCHEDULED_WORKER.to_string(),
            orchestrator.subscribe_logs(SCHEDULED_WORKER)?,
        ));
        info!(
            "Checking the {} schedule every {:?}. Press Ctrl-C to stop.",
            SCHEDULED_WORKER, self.check_interval
        );

        tokio::pin! {
            let shutdown_signal = signal::ctrl_c();
        }
        let mut ticker = tokio::time::interval(self.check_interval);
        let mut launched = false;

        loop {
            tokio::select! {
                _ = &mut shutdown_signal => {
                    info!("🛑 Shutdown signal received");
                    if launched {
                        match orchestrator.stop(SCHEDULED_WORKER).await {
                            Ok(report) => info!("{} stopped ({})", SCHEDULED_WORKER, report.termination),
                            Err(OrchestratorError::NotRunning { .. }) => {}
                            Err(e) => error!("Failed to stop {}: {}", SCHEDULED_WORKER, e),
                        }
                    }
                    break;
                }

                _ = ticker.tick() => {
                    match scheduler.tick(Utc::now()).await {
                        Ok(ScheduleOutcome::Started(report)) => {
                            info!("✅ {} is running (pid {})", SCHEDULED_WORKER, report.pid);
                            launched = true;
                        }
                        Ok(ScheduleOutcome::NotDue { next_run }) => {
                            debug!("Next {} run at {}", SCHEDULED_WORKER, next_run.to_rfc3339())
                        }
                        Ok(ScheduleOutcome::Disabled) => debug!("News schedule is disabled"),
                        Ok(ScheduleOutcome::Skipped(e)) => {
                            warn!("Scheduled run of {} skipped: {}", SCHEDULED_WORKER, e)
                        }
                        Err(e) => error!("Schedule check failed: {}", e),
                    }
                }
            }
        }

        printer.abort();
        Ok(())
    }
}

//! Cron-driven trigger for unattended backups.

use chrono::Utc;
use cron::Schedule;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::core::{JobKind, Orchestrator};
use crate::error::{PipelineError, Result};

pub struct Scheduler {
    schedule: Schedule,
    orchestrator: Arc<Orchestrator>,
}

impl Scheduler {
    pub fn new(expression: &str, orchestrator: Arc<Orchestrator>) -> Result<Self> {
        let schedule = Schedule::from_str(expression).map_err(|e| {
            PipelineError::Validation(format!("invalid cron expression {expression:?}: {e}"))
        })?;

        Ok(Self {
            schedule,
            orchestrator,
        })
    }

    /// Loop forever, firing `start_backup(scheduled)` at each cron tick.
    /// Every failure is caught and logged here; a failed run must never
    /// take down the process or suppress the next tick.
    pub async fn run(&self) {
        info!(schedule = %self.schedule, "Scheduler started");

        loop {
            let Some(next) = self.schedule.upcoming(Utc).next() else {
                warn!("Cron schedule yields no further ticks, scheduler stopping");
                return;
            };

            let wait = (next - Utc::now()).to_std().unwrap_or_default();
            info!(next_run = %next, "Next scheduled backup");
            tokio::time::sleep(wait).await;

            match self.orchestrator.start_backup(JobKind::Scheduled, None).await {
                Ok(job) => {
                    info!(job_id = %job.id, status = job.status.as_str(), "Scheduled backup finished");
                }
                Err(PipelineError::AlreadyRunning) => {
                    warn!("Scheduled backup skipped, another run is active");
                }
                Err(e) => {
                    error!(error = %e, "Scheduled backup failed to start");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::context::AppContext;
    use crate::core::FakeDumper;
    use crate::db;
    use crate::storage::MemoryStore;

    async fn test_orchestrator() -> Arc<Orchestrator> {
        let conn = db::init_in_memory().await.unwrap();
        let ctx = AppContext::new(AppConfig::default(), conn);
        Arc::new(Orchestrator::new(
            ctx,
            Arc::new(FakeDumper::default()),
            Arc::new(MemoryStore::new()),
            None,
        ))
    }

    #[tokio::test]
    async fn default_weekly_expression_parses() {
        let orchestrator = test_orchestrator().await;
        let scheduler = Scheduler::new(&AppConfig::default().schedule, orchestrator);
        assert!(scheduler.is_ok());
    }

    #[tokio::test]
    async fn bad_expression_is_a_validation_error() {
        let orchestrator = test_orchestrator().await;
        let result = Scheduler::new("not a cron line", orchestrator);
        assert!(matches!(result, Err(PipelineError::Validation(_))));
    }
}

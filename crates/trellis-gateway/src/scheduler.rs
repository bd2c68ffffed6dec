use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use cron::Schedule;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use trellis_common::{Error, Result};

type JobFn = Arc<dyn Fn() + Send + Sync>;

struct CronJob {
    name: String,
    schedule: Schedule,
    run: JobFn,
}

/// Runs named jobs on cron expressions with a leading seconds field,
/// e.g. `*/10 * * * * *`.
#[derive(Default)]
pub struct CronScheduler {
    jobs: Vec<CronJob>,
}

impl CronScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_job(
        &mut self,
        name: impl Into<String>,
        expression: &str,
        job: impl Fn() + Send + Sync + 'static,
    ) -> Result<()> {
        let name = name.into();
        let schedule = Schedule::from_str(expression).map_err(|e| {
            Error::Config(format!("invalid cron expression for job {name} ({expression}): {e}"))
        })?;
        self.jobs.push(CronJob {
            name,
            schedule,
            run: Arc::new(job),
        });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Spawn one task per job. Dropping the handles does not stop the jobs.
    pub fn start(self) -> Vec<JoinHandle<()>> {
        self.jobs
            .into_iter()
            .map(|job| {
                info!("scheduling cron job {}", job.name);
                tokio::spawn(run_job(job))
            })
            .collect()
    }
}

async fn run_job(job: CronJob) {
    loop {
        let Some(next) = job.schedule.upcoming(Utc).next() else {
            warn!("cron job {} has no future fire time, stopping", job.name);
            return;
        };
        let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        tokio::time::sleep(wait).await;

        debug!("running cron job {}", job.name);
        (job.run)();
    }
}

use chrono::Local;
use tracing::{info, warn};
use trellis_common::Result;
use trellis_config::{AppConfig, MigrationConfig};
use trellis_db::{Datasources, LockOptions, MigrationReport, MigrationRunner, migrations};

use crate::scheduler::CronScheduler;

pub const LOG_TIME_JOB: &str = "log-time";
pub const LOG_TIME_SCHEDULE: &str = "*/10 * * * * *";

pub fn lock_options(config: &MigrationConfig) -> LockOptions {
    LockOptions {
        timeout: config.lock_timeout(),
        poll_interval: config.lock_poll_interval(),
        lease: config.lock_lease(),
    }
}

/// Apply every pending application migration. Blocks while another process
/// holds the migration lock.
pub fn run_migrations(config: &AppConfig, datasources: &Datasources) -> Result<MigrationReport> {
    let registry = migrations::all()?;
    let report = MigrationRunner::new(&registry)
        .with_lock_options(lock_options(&config.migrations))
        .run(datasources)?;
    Ok(report)
}

/// Open the datasources and bring their schema up to date. A failed
/// migration aborts startup.
pub fn prepare_datasources(config: &AppConfig) -> Result<Datasources> {
    let datasources = Datasources::open(&config.datasources)?;

    if config.migrations.enabled {
        let report = run_migrations(config, &datasources)?;
        info!(
            "migrations complete: {} applied, {} already present",
            report.applied.len(),
            report.skipped
        );
    } else {
        warn!("migrations disabled, schema may be out of date");
    }

    Ok(datasources)
}

/// Scheduler with the built-in jobs, empty when cron is disabled.
pub fn build_scheduler(config: &AppConfig) -> Result<CronScheduler> {
    let mut scheduler = CronScheduler::new();
    if !config.cron.enabled {
        info!("cron disabled");
        return Ok(scheduler);
    }

    scheduler.add_job(LOG_TIME_JOB, LOG_TIME_SCHEDULE, || {
        info!("current time is {}", Local::now().format("%Y-%m-%d %H:%M:%S"));
    })?;
    Ok(scheduler)
}

#[cfg(test)]
mod tests {
    use super::{build_scheduler, prepare_datasources};
    use tempfile::TempDir;
    use trellis_config::AppConfig;
    use trellis_db::migrations::{GIFT_COUNTER_KEY, all};

    fn config_in(dir: &TempDir) -> AppConfig {
        let mut config = AppConfig::default();
        config.datasources.data_dir = dir.path().join("data");
        config.datasources.file_root = dir.path().join("files");
        config
    }

    #[test]
    fn prepare_applies_application_migrations() {
        let dir = TempDir::new().unwrap();
        let ds = prepare_datasources(&config_in(&dir)).expect("startup should succeed");

        assert!(ds.sql.table_exists("user").unwrap());
        assert!(ds.kv.get(GIFT_COUNTER_KEY).unwrap().is_some());
    }

    #[test]
    fn second_startup_finds_nothing_pending() {
        let dir = TempDir::new().unwrap();
        let config = config_in(&dir);
        drop(prepare_datasources(&config).unwrap());

        let ds = prepare_datasources(&config).unwrap();
        let registry = all().unwrap();
        let report = trellis_db::MigrationRunner::new(&registry).run(&ds).unwrap();
        assert!(report.applied.is_empty());
    }

    #[test]
    fn disabled_migrations_leave_schema_untouched() {
        let dir = TempDir::new().unwrap();
        let mut config = config_in(&dir);
        config.migrations.enabled = false;

        let ds = prepare_datasources(&config).unwrap();
        assert!(!ds.sql.table_exists("user").unwrap());
    }

    #[test]
    fn scheduler_respects_cron_toggle() {
        let mut config = AppConfig::default();
        assert_eq!(build_scheduler(&config).unwrap().len(), 1);

        config.cron.enabled = false;
        assert!(build_scheduler(&config).unwrap().is_empty());
    }
}

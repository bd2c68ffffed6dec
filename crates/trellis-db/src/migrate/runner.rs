use std::time::Instant;

use rusqlite::Connection;
use serde::Serialize;
use tracing::{info, warn};

use super::error::MigrationError;
use super::ledger::{Ledger, LedgerStatus};
use super::lock::{LockHolder, LockOptions, MigrationLock};
use super::registry::{Datasource, Migration, MigrationRegistry, Version};
use crate::datasources::Datasources;

/// Outcome of a successful run.
#[derive(Debug, Default, Clone, Serialize)]
pub struct MigrationReport {
    /// Versions applied by this run, ascending.
    pub applied: Vec<Version>,
    /// Registered versions that were already applied.
    pub skipped: usize,
    pub elapsed_ms: u128,
}

/// Where a registered version stands according to the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum VersionState {
    Pending,
    Applied { at: String },
    Failed { at: String, error: Option<String> },
}

#[derive(Debug, Clone, Serialize)]
pub struct VersionStatus {
    pub version: Version,
    pub name: &'static str,
    #[serde(flatten)]
    pub state: VersionState,
}

/// Applies the unapplied part of a registry, in order, under the migration lock.
pub struct MigrationRunner<'r> {
    registry: &'r MigrationRegistry,
    lock: LockOptions,
}

impl<'r> MigrationRunner<'r> {
    pub fn new(registry: &'r MigrationRegistry) -> Self {
        Self {
            registry,
            lock: LockOptions::default(),
        }
    }

    pub fn with_lock_options(mut self, lock: LockOptions) -> Self {
        self.lock = lock;
        self
    }

    pub fn run(&self, ds: &Datasources) -> Result<MigrationReport, MigrationError> {
        let started = Instant::now();
        if self.registry.is_empty() {
            info!("no migrations registered");
            return Ok(MigrationReport::default());
        }

        ds.ping()
            .map_err(|e| MigrationError::Connectivity(e.to_string()))?;
        let conn = ds
            .sql
            .connection()
            .map_err(|e| MigrationError::Connectivity(e.to_string()))?;

        let lock = MigrationLock::acquire(&conn, &self.lock)?;

        // Read the ledger only after the lock is held so a runner that waited
        // sees what the previous holder applied.
        let ledger = Ledger::new(&conn);
        ledger.ensure_table()?;
        let applied = ledger.applied_versions()?;

        let pending: Vec<(Version, &Migration)> = self
            .registry
            .iter()
            .filter(|(version, _)| !applied.contains(version))
            .collect();

        let mut report = MigrationReport {
            skipped: self.registry.len() - pending.len(),
            ..MigrationReport::default()
        };

        if pending.is_empty() {
            info!("schema is up to date ({} migrations applied)", report.skipped);
            report.elapsed_ms = started.elapsed().as_millis();
            return Ok(report);
        }

        info!("running {} pending migrations", pending.len());
        for (version, migration) in pending {
            lock.renew()?;
            apply(&conn, ds, version, migration)?;
            report.applied.push(version);
        }

        report.elapsed_ms = started.elapsed().as_millis();
        info!(
            "applied {} migrations in {}ms",
            report.applied.len(),
            report.elapsed_ms
        );
        Ok(report)
    }

    /// State of every registered version, ascending.
    pub fn status(&self, ds: &Datasources) -> Result<Vec<VersionStatus>, MigrationError> {
        let conn = ds
            .sql
            .connection()
            .map_err(|e| MigrationError::Connectivity(e.to_string()))?;
        let ledger = Ledger::new(&conn);
        ledger.ensure_table()?;
        let entries = ledger.entries()?;

        Ok(self
            .registry
            .iter()
            .map(|(version, migration)| {
                let state = match entries.iter().find(|e| e.version == version) {
                    None => VersionState::Pending,
                    Some(e) if e.status == LedgerStatus::Applied => VersionState::Applied {
                        at: e.applied_at.to_rfc3339(),
                    },
                    Some(e) => VersionState::Failed {
                        at: e.applied_at.to_rfc3339(),
                        error: e.error.clone(),
                    },
                };
                VersionStatus {
                    version,
                    name: migration.name(),
                    state,
                }
            })
            .collect())
    }

    /// Mark a failed version as handled so later runs skip it. Returns false
    /// when the version has no failed ledger row.
    pub fn resolve(&self, ds: &Datasources, version: Version) -> Result<bool, MigrationError> {
        let migration = self
            .registry
            .get(version)
            .ok_or(MigrationError::UnknownVersion(version))?;
        let conn = ds
            .sql
            .connection()
            .map_err(|e| MigrationError::Connectivity(e.to_string()))?;
        let ledger = Ledger::new(&conn);
        ledger.ensure_table()?;

        let resolved = ledger.resolve_failed(version)?;
        if resolved {
            warn!("migration {version} ({}) resolved by operator", migration.name());
        }
        Ok(resolved)
    }

    /// Remove a lock left by a process that died mid-run, returning who held it.
    pub fn unlock(ds: &Datasources) -> Result<Option<LockHolder>, MigrationError> {
        let conn = ds
            .sql
            .connection()
            .map_err(|e| MigrationError::Connectivity(e.to_string()))?;
        let holder = MigrationLock::holder(&conn)?;
        if MigrationLock::force_release(&conn)? {
            warn!("released migration lock held by {:?}", holder.as_ref().map(|h| &h.owner));
        }
        Ok(holder)
    }
}

/// Run one migration inside a transaction that also writes its ledger row.
fn apply(
    conn: &Connection,
    ds: &Datasources,
    version: Version,
    migration: &Migration,
) -> Result<(), MigrationError> {
    info!("applying migration {version} ({})", migration.name());
    let tx = conn.unchecked_transaction()?;

    let handle = Datasource {
        sql: &tx,
        documents: &ds.documents,
        kv: &ds.kv,
        files: &ds.files,
    };

    match migration.up(&handle) {
        Ok(()) => {
            Ledger::new(&tx).record_applied(version, migration.name())?;
            tx.commit()?;
            info!("migration {version} applied");
            Ok(())
        }
        Err(source) => {
            if let Err(e) = tx.rollback() {
                warn!("rollback of migration {version} failed: {e}");
            }
            if let Err(e) =
                Ledger::new(conn).record_failed(version, migration.name(), &source.to_string())
            {
                warn!("could not mark migration {version} as failed: {e}");
            }
            warn!("migration {version} failed: {source}");
            Err(MigrationError::Failed { version, source })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{MigrationRunner, VersionState};
    use crate::datasources::Datasources;
    use crate::migrate::{
        LedgerStatus, LockOptions, Migration, MigrationError, MigrationLock, MigrationRegistry,
        Version,
    };
    use crate::migrate::ledger::Ledger;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tempfile::TempDir;
    use trellis_common::Error;
    use trellis_config::DatasourceConfig;

    type Calls = Arc<Mutex<Vec<Version>>>;

    fn tracked(version: Version, calls: &Calls) -> Migration {
        let calls = Arc::clone(calls);
        Migration::new("tracked", move |_| {
            calls.lock().unwrap().push(version);
            Ok(())
        })
    }

    fn failing(version: Version, calls: &Calls) -> Migration {
        let calls = Arc::clone(calls);
        Migration::new("failing", move |_| {
            calls.lock().unwrap().push(version);
            Err(Error::Database("boom".into()))
        })
    }

    fn memory_ds() -> Datasources {
        Datasources::in_memory(std::env::temp_dir()).unwrap()
    }

    fn ledger_statuses(ds: &Datasources) -> Vec<(Version, LedgerStatus)> {
        let conn = ds.sql.connection().unwrap();
        Ledger::new(&conn)
            .entries()
            .unwrap()
            .into_iter()
            .map(|e| (e.version, e.status))
            .collect()
    }

    #[test]
    fn empty_registry_is_a_no_op() {
        let ds = memory_ds();
        let registry = MigrationRegistry::new();

        let report = MigrationRunner::new(&registry).run(&ds).unwrap();

        assert!(report.applied.is_empty());
        assert_eq!(report.skipped, 0);
    }

    #[test]
    fn applies_unapplied_versions_in_ascending_order() {
        let ds = memory_ds();
        let calls: Calls = Arc::default();
        let registry = MigrationRegistry::from_entries([
            (300, tracked(300, &calls)),
            (100, tracked(100, &calls)),
            (200, tracked(200, &calls)),
        ])
        .unwrap();

        let report = MigrationRunner::new(&registry).run(&ds).unwrap();

        assert_eq!(*calls.lock().unwrap(), [100, 200, 300]);
        assert_eq!(report.applied, [100, 200, 300]);
        assert_eq!(
            ledger_statuses(&ds),
            [
                (100, LedgerStatus::Applied),
                (200, LedgerStatus::Applied),
                (300, LedgerStatus::Applied)
            ]
        );
    }

    #[test]
    fn applies_only_registry_minus_ledger() {
        let ds = memory_ds();
        {
            let conn = ds.sql.connection().unwrap();
            let ledger = Ledger::new(&conn);
            ledger.ensure_table().unwrap();
            ledger.record_applied(200, "already").unwrap();
        }

        let calls: Calls = Arc::default();
        let registry = MigrationRegistry::from_entries([
            (100, tracked(100, &calls)),
            (200, tracked(200, &calls)),
            (300, tracked(300, &calls)),
        ])
        .unwrap();

        let report = MigrationRunner::new(&registry).run(&ds).unwrap();

        assert_eq!(*calls.lock().unwrap(), [100, 300]);
        assert_eq!(report.skipped, 1);
    }

    #[test]
    fn rerun_after_success_invokes_nothing() {
        let ds = memory_ds();
        let calls: Calls = Arc::default();
        let registry = MigrationRegistry::from_entries([(100, tracked(100, &calls))]).unwrap();
        let runner = MigrationRunner::new(&registry);

        runner.run(&ds).unwrap();
        calls.lock().unwrap().clear();

        let report = runner.run(&ds).unwrap();

        assert!(calls.lock().unwrap().is_empty());
        assert!(report.applied.is_empty());
        assert_eq!(report.skipped, 1);
    }

    #[test]
    fn failure_stops_the_run_and_names_the_version() {
        let ds = memory_ds();
        let calls: Calls = Arc::default();
        let registry = MigrationRegistry::from_entries([
            (100, tracked(100, &calls)),
            (200, failing(200, &calls)),
            (300, tracked(300, &calls)),
        ])
        .unwrap();

        let err = MigrationRunner::new(&registry).run(&ds).unwrap_err();

        assert!(matches!(err, MigrationError::Failed { version: 200, .. }));
        assert_eq!(err.version(), Some(200));
        assert!(err.to_string().contains("200"));
        assert_eq!(*calls.lock().unwrap(), [100, 200], "300 must never run");
        assert_eq!(
            ledger_statuses(&ds),
            [(100, LedgerStatus::Applied), (200, LedgerStatus::Failed)]
        );
    }

    #[test]
    fn failed_version_is_retried_on_next_run() {
        let ds = memory_ds();
        let attempts = Arc::new(Mutex::new(0u32));
        let counter = Arc::clone(&attempts);
        let flaky = Migration::new("flaky", move |_| {
            let mut n = counter.lock().unwrap();
            *n += 1;
            if *n == 1 {
                Err(Error::Database("transient".into()))
            } else {
                Ok(())
            }
        });
        let registry = MigrationRegistry::from_entries([(100, flaky)]).unwrap();
        let runner = MigrationRunner::new(&registry);

        assert!(runner.run(&ds).is_err());
        let report = runner.run(&ds).expect("retry should succeed");

        assert_eq!(report.applied, [100]);
        assert_eq!(*attempts.lock().unwrap(), 2);
        assert_eq!(ledger_statuses(&ds), [(100, LedgerStatus::Applied)]);
    }

    #[test]
    fn relational_changes_of_a_failed_migration_are_rolled_back() {
        let ds = memory_ds();
        let half_done = Migration::new("half_done", |ds| {
            ds.sql
                .execute_batch("CREATE TABLE widgets (id INTEGER PRIMARY KEY)")
                .map_err(|e| Error::Database(e.to_string()))?;
            Err(Error::Database("second step failed".into()))
        });
        let registry = MigrationRegistry::from_entries([(100, half_done)]).unwrap();

        MigrationRunner::new(&registry).run(&ds).unwrap_err();

        assert!(!ds.sql.table_exists("widgets").unwrap());
    }

    #[test]
    fn resolved_failure_is_skipped() {
        let ds = memory_ds();
        let calls: Calls = Arc::default();
        let registry = MigrationRegistry::from_entries([(100, failing(100, &calls))]).unwrap();
        let runner = MigrationRunner::new(&registry);

        runner.run(&ds).unwrap_err();
        {
            let conn = ds.sql.connection().unwrap();
            assert!(Ledger::new(&conn).resolve_failed(100).unwrap());
        }
        calls.lock().unwrap().clear();

        runner.run(&ds).expect("resolved version should be skipped");
        assert!(calls.lock().unwrap().is_empty());
    }

    #[test]
    fn resolve_via_runner_rejects_unregistered_versions() {
        let ds = memory_ds();
        let calls: Calls = Arc::default();
        let registry = MigrationRegistry::from_entries([(100, failing(100, &calls))]).unwrap();
        let runner = MigrationRunner::new(&registry);
        runner.run(&ds).unwrap_err();

        assert!(matches!(
            runner.resolve(&ds, 999),
            Err(MigrationError::UnknownVersion(999))
        ));
        assert!(runner.resolve(&ds, 100).unwrap());
        assert!(!runner.resolve(&ds, 100).unwrap(), "already resolved");
    }

    #[test]
    fn unlock_clears_a_stale_lock() {
        let ds = memory_ds();
        let registry = MigrationRegistry::from_entries([(100, Migration::new("a", |_| Ok(())))])
            .unwrap();
        {
            let conn = ds.sql.connection().unwrap();
            let stale = MigrationLock::acquire(&conn, &LockOptions::default()).unwrap();
            std::mem::forget(stale);
        }

        let holder = MigrationRunner::unlock(&ds).unwrap();
        assert!(holder.is_some());

        let quick = LockOptions {
            timeout: Some(Duration::from_millis(100)),
            poll_interval: Duration::from_millis(10),
            ..LockOptions::default()
        };
        MigrationRunner::new(&registry)
            .with_lock_options(quick)
            .run(&ds)
            .expect("run should proceed once the stale lock is gone");
    }

    #[test]
    fn lock_is_released_after_a_failed_run() {
        let ds = memory_ds();
        let calls: Calls = Arc::default();
        let registry = MigrationRegistry::from_entries([(100, failing(100, &calls))]).unwrap();
        let quick = LockOptions {
            timeout: Some(Duration::from_millis(100)),
            poll_interval: Duration::from_millis(10),
            ..LockOptions::default()
        };
        let runner = MigrationRunner::new(&registry).with_lock_options(quick);

        let first = runner.run(&ds).unwrap_err();
        let second = runner.run(&ds).unwrap_err();

        assert!(matches!(first, MigrationError::Failed { .. }));
        assert!(
            matches!(second, MigrationError::Failed { .. }),
            "second run should reach the migration, not time out on the lock"
        );
    }

    #[test]
    fn status_reports_each_registered_version() {
        let ds = memory_ds();
        let calls: Calls = Arc::default();
        let registry = MigrationRegistry::from_entries([
            (100, tracked(100, &calls)),
            (200, failing(200, &calls)),
            (300, tracked(300, &calls)),
        ])
        .unwrap();
        let runner = MigrationRunner::new(&registry);
        runner.run(&ds).unwrap_err();

        let status = runner.status(&ds).unwrap();

        assert!(matches!(status[0].state, VersionState::Applied { .. }));
        assert!(matches!(
            &status[1].state,
            VersionState::Failed { error: Some(msg), .. } if msg.contains("boom")
        ));
        assert_eq!(status[2].state, VersionState::Pending);
    }

    #[test]
    fn concurrent_runners_apply_each_version_once() {
        let dir = TempDir::new().unwrap();
        let config = DatasourceConfig {
            data_dir: dir.path().join("data"),
            file_root: dir.path().join("files"),
            ..DatasourceConfig::default()
        };
        let calls: Calls = Arc::default();

        let handles: Vec<_> = (0..3)
            .map(|_| {
                let config = config.clone();
                let calls = Arc::clone(&calls);
                std::thread::spawn(move || {
                    let ds = Datasources::open(&config).unwrap();
                    let slow = |version: Version| {
                        let calls = Arc::clone(&calls);
                        Migration::new("slow", move |ds| {
                            calls.lock().unwrap().push(version);
                            std::thread::sleep(Duration::from_millis(30));
                            ds.sql
                                .execute_batch(&format!("CREATE TABLE t_{version} (id INTEGER)"))
                                .map_err(|e| Error::Database(e.to_string()))
                        })
                    };
                    let registry =
                        MigrationRegistry::from_entries([(100, slow(100)), (200, slow(200))])
                            .unwrap();
                    let options = LockOptions {
                        timeout: Some(Duration::from_secs(10)),
                        poll_interval: Duration::from_millis(10),
                        ..LockOptions::default()
                    };
                    MigrationRunner::new(&registry)
                        .with_lock_options(options)
                        .run(&ds)
                        .map(|report| report.applied)
                })
            })
            .collect();

        let mut applied: Vec<Version> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap().expect("every runner should succeed"))
            .collect();
        applied.sort_unstable();

        assert_eq!(applied, [100, 200]);
        let mut seen = calls.lock().unwrap().clone();
        seen.sort_unstable();
        assert_eq!(seen, [100, 200]);
    }

    #[test]
    fn lock_abandoned_by_a_dead_process_expires() {
        let dir = TempDir::new().unwrap();
        let config = DatasourceConfig {
            data_dir: dir.path().join("data"),
            file_root: dir.path().join("files"),
            ..DatasourceConfig::default()
        };
        let calls: Calls = Arc::default();
        let registry = MigrationRegistry::from_entries([(100, tracked(100, &calls))]).unwrap();

        {
            let crashed = Datasources::open(&config).unwrap();
            let conn = crashed.sql.connection().unwrap();
            let short = LockOptions {
                lease: Duration::from_millis(100),
                ..LockOptions::default()
            };
            std::mem::forget(MigrationLock::acquire(&conn, &short).unwrap());
        }

        let ds = Datasources::open(&config).unwrap();
        let report = MigrationRunner::new(&registry)
            .run(&ds)
            .expect("default options should take over the expired claim");

        assert_eq!(report.applied, [100]);
        assert_eq!(*calls.lock().unwrap(), [100]);
    }

    #[test]
    fn unusable_store_is_a_connectivity_error() {
        let ds = memory_ds();
        std::thread::scope(|s| {
            let poisoner = s.spawn(|| {
                let _guard = ds.sql.connection().unwrap();
                panic!("poison the sql store");
            });
            assert!(poisoner.join().is_err());
        });

        let calls: Calls = Arc::default();
        let registry = MigrationRegistry::from_entries([
            (100, tracked(100, &calls)),
            (200, tracked(200, &calls)),
        ])
        .unwrap();

        let err = MigrationRunner::new(&registry).run(&ds).unwrap_err();

        assert!(matches!(err, MigrationError::Connectivity(_)));
        assert!(calls.lock().unwrap().is_empty());
    }
}

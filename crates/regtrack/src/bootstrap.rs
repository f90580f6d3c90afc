//! Application bootstrap and lifecycle wiring
//!
//! Builds every service in dependency order, spawns the long-lived
//! workers (release pollers, background pool, metadata ticker, cache
//! expirer, tracker sweeper) and tears them down within the configured
//! drain budgets on shutdown. A subsystem whose configuration fails
//! validation is left stopped; the rest of the process keeps running.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use regtrack_analytics::AnalyticsService;
use regtrack_config::{ApplicationConfig, Validate};
use regtrack_ingest::{ImportService, Scheduler, SchedulerHandle};
use regtrack_jenkins::JenkinsClient;
use regtrack_jobs::{JobTracker, WorkerPool, build_tracker};
use regtrack_metadata::{MetadataSync, MirrorRepo};
use regtrack_storage::{Database, MetadataStore, TrackerStore, run_migrations};

use crate::app::AdminService;

/// The wired application
pub struct App {
    pub analytics: Arc<AnalyticsService>,
    /// Absent when CI or mirror configuration failed validation; the
    /// shell returns 503 for admin routes in that case
    pub admin: Option<Arc<AdminService>>,
    pub tracker: Arc<dyn JobTracker>,
    config: ApplicationConfig,
    cancel: CancellationToken,
    scheduler_handle: Option<SchedulerHandle>,
    pool: Arc<WorkerPool>,
    housekeeping: JoinSet<()>,
    db: Database,
}

/// Connect to the store and apply pending migrations
///
/// # Errors
///
/// Returns an error if the database is unreachable or a migration fails.
pub async fn setup_database(config: &ApplicationConfig) -> Result<Database> {
    config
        .database
        .validate()
        .context("database configuration invalid")?;

    info!(url = %config.database.url, "opening database");
    let db = Database::connect(&config.database)
        .await
        .context("database connection failed")?;

    if config.database.auto_migrate {
        run_migrations(&db).await.context("migrations failed")?;
    }
    Ok(db)
}

/// Build and start the whole application
///
/// # Errors
///
/// Returns an error only for failures nothing can run without (database,
/// migrations). Optional subsystems log and stay stopped instead.
pub async fn start(config: ApplicationConfig) -> Result<App> {
    let cancel = CancellationToken::new();

    let db = setup_database(&config).await?;
    let store = TrackerStore::new(db.clone());
    let metadata_store = MetadataStore::new(db.clone());

    config.jobs.validate().context("job tracker configuration invalid")?;
    let tracker = build_tracker(config.jobs.clone(), db.clone());
    let pool = Arc::new(WorkerPool::start(config.jobs.worker_count, cancel.child_token()));

    let analytics = Arc::new(AnalyticsService::new(store.clone(), &config.cache));
    let import = ImportService::new(store.clone(), config.metadata.test_root_prefix.clone());

    // CI access is required for polling and manual imports; the daemon
    // still serves analytics without it.
    let scheduler = match config.jenkins.validate() {
        Ok(()) => {
            let client = JenkinsClient::new(config.jenkins.clone())
                .context("jenkins client construction failed")?;
            Some(Scheduler::new(
                store.clone(),
                client,
                import.clone(),
                config.polling.clone(),
            ))
        }
        Err(e) => {
            warn!(error = %e, "CI access not configured; ingestion disabled");
            None
        }
    };

    config.polling.validate().context("polling configuration invalid")?;
    let scheduler_handle = match (&scheduler, config.polling.auto_update_enabled) {
        (Some(scheduler), true) => Some(
            scheduler
                .clone()
                .spawn()
                .await
                .context("failed to start release pollers")?,
        ),
        (Some(_), false) => {
            info!("automatic polling disabled by configuration");
            None
        }
        (None, _) => None,
    };

    // Metadata sync is likewise optional
    let metadata_sync = match config.metadata.validate() {
        Ok(()) => {
            let mirror = MirrorRepo::new(&config.metadata);
            Some(Arc::new(MetadataSync::new(
                metadata_store.clone(),
                store.clone(),
                mirror,
                config.metadata.clone(),
            )))
        }
        Err(e) => {
            warn!(error = %e, "metadata mirror not configured; sync disabled");
            None
        }
    };

    let mut housekeeping = JoinSet::new();
    spawn_cache_expirer(&mut housekeeping, Arc::clone(&analytics), &config, cancel.child_token());
    spawn_tracker_sweeper(&mut housekeeping, Arc::clone(&tracker), cancel.child_token());
    if let Some(sync) = &metadata_sync
        && config.metadata.sync_enabled
    {
        spawn_sync_ticker(&mut housekeeping, Arc::clone(sync), &config, cancel.child_token());
    }

    let admin = scheduler
        .map(Arc::new)
        .zip(metadata_sync.clone())
        .map(|(scheduler, sync)| {
            Arc::new(AdminService::new(
                store.clone(),
                metadata_store.clone(),
                Arc::clone(&tracker),
                Arc::clone(&pool),
                scheduler,
                sync,
                cancel.child_token(),
            ))
        });

    if admin.is_none() {
        warn!("admin surface disabled: it requires both CI and mirror configuration");
    }

    info!("regtrack started");
    Ok(App {
        analytics,
        admin,
        tracker,
        config,
        cancel,
        scheduler_handle,
        pool,
        housekeeping,
        db,
    })
}

impl App {
    /// Graceful shutdown within the configured drain budgets
    ///
    /// Pollers get the import drain budget, background workers the HTTP
    /// drain budget; whatever survives is cancelled hard and its tracker
    /// entries are marked failed with reason "shutdown".
    pub async fn shutdown(mut self) {
        info!("shutting down");
        self.cancel.cancel();

        if let Some(handle) = self.scheduler_handle.take() {
            handle.shutdown().await;
        }

        // The admin façade holds the only other pool reference
        drop(self.admin.take());
        let pool = match Arc::try_unwrap(self.pool) {
            Ok(pool) => Some(pool),
            Err(_) => {
                warn!("worker pool still referenced at shutdown");
                None
            }
        };
        if let Some(pool) = pool {
            pool.shutdown(Duration::from_secs(
                self.config.polling.http_drain_timeout_seconds,
            ))
            .await;
        }

        self.housekeeping.abort_all();
        while self.housekeeping.join_next().await.is_some() {}

        match self.tracker.fail_inflight("shutdown").await {
            Ok(0) => {}
            Ok(n) => info!(jobs = n, "marked in-flight jobs failed"),
            Err(e) => error!(error = %e, "failed to mark in-flight jobs"),
        }

        self.db.close().await;
        info!("shutdown complete");
    }
}

fn spawn_cache_expirer(
    tasks: &mut JoinSet<()>,
    analytics: Arc<AnalyticsService>,
    config: &ApplicationConfig,
    token: CancellationToken,
) {
    let interval = Duration::from_secs(config.cache.sweep_interval_seconds.max(1));
    tasks.spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let removed = analytics.sweep_caches();
                    if removed > 0 {
                        tracing::debug!(removed, "cache entries expired");
                    }
                }
                () = token.cancelled() => return,
            }
        }
    });
}

fn spawn_tracker_sweeper(
    tasks: &mut JoinSet<()>,
    tracker: Arc<dyn JobTracker>,
    token: CancellationToken,
) {
    // TTLs are hours; sweeping every few minutes keeps expiry timely
    let interval = Duration::from_secs(300);
    tasks.spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match tracker.sweep_expired().await {
                        Ok(0) => {}
                        Ok(n) => tracing::debug!(removed = n, "expired background jobs swept"),
                        Err(e) => error!(error = %e, "tracker sweep failed"),
                    }
                }
                () = token.cancelled() => return,
            }
        }
    });
}

fn spawn_sync_ticker(
    tasks: &mut JoinSet<()>,
    sync: Arc<MetadataSync>,
    config: &ApplicationConfig,
    token: CancellationToken,
) {
    let interval = Duration::from_secs(config.metadata.sync_interval_hours.saturating_mul(3600));
    tasks.spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The immediate first tick would race startup imports; skip it
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    info!("scheduled metadata sync starting");
                    let progress = |line: &str| tracing::info!(target: "metadata_sync", "{line}");
                    if let Err(e) = sync.sync_all_active(&progress, &token).await {
                        error!(error = %e, "scheduled metadata sync failed");
                    }
                }
                () = token.cancelled() => return,
            }
        }
    });
}

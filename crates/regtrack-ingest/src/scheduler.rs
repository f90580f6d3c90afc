//! Per-release build polling and import scheduling
//!
//! One ticker per active release discovers parent builds past the release
//! watermark and imports them strictly in order. A build-map fetch failure
//! stops the pass before that build so the watermark can never jump a
//! gap; module-level failures are counted but do not block peers or the
//! watermark.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use regtrack_config::PollingConfig;
use regtrack_jenkins::JenkinsClient;
use regtrack_storage::{Release, TrackerStore};

use crate::error::IngestResult;
use crate::import::{ImportRequest, ImportService};

/// What one polling pass over a release did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollOutcome {
    pub builds_seen: usize,
    pub builds_completed: usize,
    pub modules_imported: usize,
    pub modules_skipped: usize,
    pub modules_failed: usize,
    /// Watermark after the pass
    pub watermark: i64,
}

/// Scheduler driving periodic polls for every active release
#[derive(Clone)]
pub struct Scheduler {
    store: TrackerStore,
    client: JenkinsClient,
    import: ImportService,
    config: PollingConfig,
}

/// Handle to the running ticker tasks
pub struct SchedulerHandle {
    cancel: CancellationToken,
    tasks: JoinSet<()>,
    drain_timeout: Duration,
}

impl SchedulerHandle {
    /// Signal shutdown and wait up to the drain timeout for tickers
    ///
    /// Tasks still running at the deadline are aborted; in-flight HTTP is
    /// cancelled with them.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();

        let drain = async {
            while self.tasks.join_next().await.is_some() {}
        };
        if tokio::time::timeout(self.drain_timeout, drain).await.is_err() {
            warn!("drain timeout elapsed, aborting poller tasks");
            self.tasks.abort_all();
            while self.tasks.join_next().await.is_some() {}
        }
    }
}

impl Scheduler {
    /// Create a scheduler over the shared services
    pub const fn new(
        store: TrackerStore,
        client: JenkinsClient,
        import: ImportService,
        config: PollingConfig,
    ) -> Self {
        Self {
            store,
            client,
            import,
            config,
        }
    }

    /// Spawn one ticker per active release
    ///
    /// # Errors
    ///
    /// Returns an error if the active release list cannot be read.
    pub async fn spawn(self) -> IngestResult<SchedulerHandle> {
        let releases = self.store.list_active_releases().await?;
        let cancel = CancellationToken::new();
        let mut tasks = JoinSet::new();
        let interval = Duration::from_secs(self.config.interval_minutes.saturating_mul(60));
        let drain_timeout = Duration::from_secs(self.config.import_drain_timeout_seconds);

        info!(
            releases = releases.len(),
            interval_minutes = self.config.interval_minutes,
            "starting release pollers"
        );

        let shared = Arc::new(self);
        for release in releases {
            let scheduler = Arc::clone(&shared);
            let token = cancel.child_token();
            tasks.spawn(async move {
                scheduler.run_release_loop(release, interval, token).await;
            });
        }

        Ok(SchedulerHandle {
            cancel,
            tasks,
            drain_timeout,
        })
    }

    async fn run_release_loop(
        &self,
        release: Release,
        interval: Duration,
        token: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                () = token.cancelled() => {
                    debug!(release = %release.name, "poller stopping");
                    return;
                }
            }

            // Reload the row each tick: the watermark moved if the last
            // pass imported anything, and the release may have been
            // deactivated meanwhile.
            let current = match self.store.get_release(&release.name).await {
                Ok(Some(row)) if row.is_active => row,
                Ok(_) => {
                    info!(release = %release.name, "release inactive, poller exiting");
                    return;
                }
                Err(e) => {
                    error!(release = %release.name, error = %e, "failed to reload release");
                    continue;
                }
            };

            match self.poll_release(&current, &token).await {
                Ok(outcome) => {
                    info!(
                        release = %current.name,
                        builds = outcome.builds_completed,
                        modules = outcome.modules_imported,
                        failed = outcome.modules_failed,
                        watermark = outcome.watermark,
                        "poll pass finished"
                    );
                }
                Err(e) => error!(release = %current.name, error = %e, "poll pass failed"),
            }

            if token.is_cancelled() {
                return;
            }
        }
    }

    /// One polling pass over one release
    ///
    /// # Errors
    ///
    /// Returns an error when the build list itself cannot be fetched; all
    /// later failures are folded into the outcome counters instead.
    pub async fn poll_release(
        &self,
        release: &Release,
        token: &CancellationToken,
    ) -> IngestResult<PollOutcome> {
        let Some(job_url) = release.jenkins_job_url.as_deref() else {
            warn!(release = %release.name, "no CI job URL configured, skipping");
            return Ok(PollOutcome {
                watermark: release.last_processed_build,
                ..PollOutcome::default()
            });
        };

        let builds = self
            .client
            .list_builds(job_url, release.last_processed_build)
            .await?;

        let mut outcome = PollOutcome {
            builds_seen: builds.len(),
            watermark: release.last_processed_build,
            ..PollOutcome::default()
        };

        for parent_build in builds {
            // Stop signal is consulted between builds, never inside one
            if token.is_cancelled() {
                break;
            }

            // Version token is best effort; builds with odd display names
            // import with a NULL version.
            let version = match self.client.get_display_name(job_url, parent_build).await {
                Ok(name) => JenkinsClient::extract_version(&name),
                Err(e) => {
                    debug!(parent_build, error = %e, "display name unavailable");
                    None
                }
            };

            // Without the map the build cannot be attributed to modules;
            // later builds must wait so the watermark never jumps a gap.
            let build_map = match self.client.get_build_map(job_url, parent_build).await {
                Ok(map) => map,
                Err(e) => {
                    warn!(parent_build, error = %e, "build map fetch failed, stopping pass");
                    break;
                }
            };

            let (imported, skipped, failed) = self
                .import_modules(release, job_url, parent_build, version, build_map, token)
                .await;
            outcome.modules_imported += imported;
            outcome.modules_skipped += skipped;
            outcome.modules_failed += failed;

            if token.is_cancelled() {
                // The pass was interrupted mid-build; leave the watermark
                // where it was so the next tick redoes this build.
                break;
            }

            self.store.advance_watermark(release.id, parent_build).await?;
            outcome.watermark = parent_build;
            outcome.builds_completed += 1;
        }

        Ok(outcome)
    }

    /// Import every module of one parent build with bounded fan-out
    ///
    /// Returns `(imported, skipped, failed)` counts. Failures are logged
    /// per module and never abort peers.
    async fn import_modules(
        &self,
        release: &Release,
        job_url: &str,
        parent_build: i64,
        version: Option<String>,
        build_map: std::collections::BTreeMap<String, i64>,
        token: &CancellationToken,
    ) -> (usize, usize, usize) {
        let results = futures::stream::iter(build_map.into_iter().map(|(module, module_build)| {
            let request = ImportRequest {
                release_name: release.name.clone(),
                module_name: module,
                parent_build,
                module_build,
                version: version.clone(),
                jenkins_url: Some(format!("{job_url}/{module_build}")),
            };
            self.import_one(job_url, request, token)
        }))
        .buffer_unordered(self.config.module_fan_out)
        .collect::<Vec<ModuleOutcome>>()
        .await;

        let mut counts = (0usize, 0usize, 0usize);
        for result in results {
            match result {
                ModuleOutcome::Imported => counts.0 += 1,
                ModuleOutcome::Skipped => counts.1 += 1,
                ModuleOutcome::Failed => counts.2 += 1,
            }
        }
        counts
    }

    async fn import_one(
        &self,
        job_url: &str,
        request: ImportRequest,
        token: &CancellationToken,
    ) -> ModuleOutcome {
        match self.import.is_imported(&request).await {
            Ok(true) => {
                debug!(
                    module = %request.module_name,
                    build = request.module_build,
                    "already imported, skipping"
                );
                return ModuleOutcome::Skipped;
            }
            Ok(false) => {}
            Err(e) => {
                error!(module = %request.module_name, error = %e, "import pre-check failed");
                return ModuleOutcome::Failed;
            }
        }

        let artifact = match self.client.get_artifact(job_url, request.module_build).await {
            Ok(reader) => reader,
            Err(e) => {
                warn!(
                    module = %request.module_name,
                    build = request.module_build,
                    error = %e,
                    "artifact fetch failed"
                );
                return ModuleOutcome::Failed;
            }
        };

        match self.import.import_job(&request, artifact, token).await {
            Ok(report) => {
                debug!(
                    module = %request.module_name,
                    build = request.module_build,
                    total = report.total,
                    "module imported"
                );
                ModuleOutcome::Imported
            }
            Err(e) => {
                warn!(
                    module = %request.module_name,
                    build = request.module_build,
                    error = %e,
                    "module import failed"
                );
                ModuleOutcome::Failed
            }
        }
    }
}

enum ModuleOutcome {
    Imported,
    Skipped,
    Failed,
}

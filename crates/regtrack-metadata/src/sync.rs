//! Metadata sync pipeline
//!
//! Updates the git mirror, walks the discovery tree, extracts test
//! metadata and upserts it in batches. A sync for a release layers
//! overrides over the global baseline; a baseline sync refreshes the
//! baseline itself. Baselines are never deleted for tests that vanish
//! from source, so a transient discovery failure cannot erase history.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use walkdir::WalkDir;

use regtrack_config::{
    MetadataConfig, SYNC_MAX_BATCH_FAILURE_RATE, SYNC_MAX_FILE_FAILURE_RATE,
    SYNC_MAX_RETRIES, SYNC_MIN_FAILED_BATCHES, SYNC_MIN_FAILED_FILES,
    SYNC_RETRY_INITIAL_DELAY_SECONDS,
};
use regtrack_storage::{
    MetadataStore, SyncFileError, SyncStatus, TrackerStore, UpsertOutcome,
};

use crate::discovery::{DiscoveredTest, discover_file, parse_staging_list};
use crate::error::{MetadataError, MetadataResult};
use crate::git::MirrorRepo;

/// Discovered tests written per transaction
const UPSERT_BATCH: usize = 100;

/// Counters of one finished sync run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOutcome {
    pub log_id: i64,
    pub status: SyncStatus,
    pub files_scanned: u64,
    pub files_failed: u64,
    pub tests_upserted: u64,
    pub tests_unchanged: u64,
}

/// Progress sink; lines end up on the triggering job's log queue
pub type ProgressFn<'a> = &'a (dyn Fn(&str) + Send + Sync);

/// Git-backed synchronizer of curated test metadata
pub struct MetadataSync {
    metadata: MetadataStore,
    tracker: TrackerStore,
    mirror: MirrorRepo,
    config: MetadataConfig,
}

impl MetadataSync {
    /// Create the synchronizer over the shared stores
    pub fn new(
        metadata: MetadataStore,
        tracker: TrackerStore,
        mirror: MirrorRepo,
        config: MetadataConfig,
    ) -> Self {
        Self {
            metadata,
            tracker,
            mirror,
            config,
        }
    }

    /// Sync one release (by name) or the global baseline (`None`)
    ///
    /// Updates the mirror first, retrying transient git failures with
    /// doubling backoff, then runs discovery over the checked-out tree.
    /// Every run leaves a `metadata_sync_log` row.
    ///
    /// # Errors
    ///
    /// Returns `UnknownRelease` before any work happens; mirror errors
    /// after the retry budget; `Aborted` when a failure threshold trips;
    /// `Cancelled` on shutdown.
    pub async fn sync(
        &self,
        release_name: Option<&str>,
        progress: ProgressFn<'_>,
        cancel: &CancellationToken,
    ) -> MetadataResult<SyncOutcome> {
        let release = match release_name {
            Some(name) => Some(
                self.tracker
                    .get_release(name)
                    .await?
                    .ok_or_else(|| MetadataError::UnknownRelease(name.to_string()))?,
            ),
            None => None,
        };

        let branch = release
            .as_ref()
            .and_then(|r| r.git_branch.clone())
            .unwrap_or_else(|| self.config.git_branch.clone());

        progress(&format!("updating mirror to origin/{branch}"));
        let root = self.checkout_with_retry(&branch, cancel).await?;

        self.sync_tree(&root, release.as_ref().map(|r| r.id), progress, cancel)
            .await
    }

    /// Run every active release in sequence (scheduled syncs)
    ///
    /// # Errors
    ///
    /// Returns the first error; completed releases keep their log rows.
    pub async fn sync_all_active(
        &self,
        progress: ProgressFn<'_>,
        cancel: &CancellationToken,
    ) -> MetadataResult<Vec<SyncOutcome>> {
        let releases = self.tracker.list_active_releases().await?;
        let mut outcomes = Vec::with_capacity(releases.len());

        for release in releases {
            if cancel.is_cancelled() {
                return Err(MetadataError::Cancelled);
            }
            progress(&format!("syncing metadata for {}", release.name));
            outcomes.push(self.sync(Some(&release.name), progress, cancel).await?);
        }
        Ok(outcomes)
    }

    async fn checkout_with_retry(
        &self,
        branch: &str,
        cancel: &CancellationToken,
    ) -> MetadataResult<std::path::PathBuf> {
        let mut delay = Duration::from_secs(SYNC_RETRY_INITIAL_DELAY_SECONDS);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            match self.mirror.ensure_checkout(branch).await {
                Ok(root) => return Ok(root),
                Err(e) if e.is_transient() && attempt <= SYNC_MAX_RETRIES => {
                    warn!(attempt, ?delay, error = %e, "mirror update failed, retrying");
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        () = cancel.cancelled() => return Err(MetadataError::Cancelled),
                    }
                    delay = delay.saturating_mul(2);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Discovery and upsert over an already checked-out tree
    ///
    /// Exposed for tests, which prepare the tree without git.
    ///
    /// # Errors
    ///
    /// See [`Self::sync`].
    pub async fn sync_tree(
        &self,
        root: &Path,
        release_id: Option<i64>,
        progress: ProgressFn<'_>,
        cancel: &CancellationToken,
    ) -> MetadataResult<SyncOutcome> {
        let log_id = self.metadata.start_sync_log(release_id).await?;

        let result = self
            .run_discovery(root, release_id, progress, cancel)
            .await;

        match result {
            Ok(counters) => {
                self.metadata
                    .finish_sync_log(
                        log_id,
                        SyncStatus::Completed,
                        counters.files_scanned as i64,
                        counters.files_failed as i64,
                        counters.tests_upserted as i64,
                        counters.tests_unchanged as i64,
                        &counters.errors,
                    )
                    .await?;
                info!(
                    files = counters.files_scanned,
                    failed = counters.files_failed,
                    upserted = counters.tests_upserted,
                    "metadata sync completed"
                );
                Ok(SyncOutcome {
                    log_id,
                    status: SyncStatus::Completed,
                    files_scanned: counters.files_scanned,
                    files_failed: counters.files_failed,
                    tests_upserted: counters.tests_upserted,
                    tests_unchanged: counters.tests_unchanged,
                })
            }
            Err((error, counters)) => {
                let status = match &error {
                    MetadataError::Aborted { .. } => SyncStatus::Aborted,
                    _ => SyncStatus::Failed,
                };
                self.metadata
                    .finish_sync_log(
                        log_id,
                        status,
                        counters.files_scanned as i64,
                        counters.files_failed as i64,
                        counters.tests_upserted as i64,
                        counters.tests_unchanged as i64,
                        &counters.errors,
                    )
                    .await?;
                Err(error)
            }
        }
    }

    async fn run_discovery(
        &self,
        root: &Path,
        release_id: Option<i64>,
        progress: ProgressFn<'_>,
        cancel: &CancellationToken,
    ) -> Result<Counters, (MetadataError, Counters)> {
        let mut counters = Counters::default();

        let staging = self.load_staging(root);
        let base = root.join(&self.config.discovery_base_path);

        let files: Vec<_> = WalkDir::new(&base)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| {
                e.file_type().is_file()
                    && e.path().extension().is_some_and(|ext| ext == "py")
            })
            .map(|e| e.path().to_path_buf())
            .collect();

        progress(&format!("scanning {} python files", files.len()));

        let mut pending: Vec<DiscoveredTest> = Vec::new();
        let mut failed_batches = 0u64;
        let mut total_batches = 0u64;

        for path in files {
            if cancel.is_cancelled() {
                return Err((MetadataError::Cancelled, counters));
            }

            counters.files_scanned += 1;
            let relative = path
                .strip_prefix(root)
                .unwrap_or(&path)
                .to_string_lossy()
                .replace('\\', "/");

            let outcome = std::fs::read_to_string(&path)
                .map_err(|e| format!("unreadable: {e}"))
                .and_then(|source| {
                    discover_file(&source, &relative, &self.config.test_root_prefix, &staging)
                });

            match outcome {
                Ok(tests) => pending.extend(tests),
                Err(reason) => {
                    counters.files_failed += 1;
                    counters.errors.push(SyncFileError {
                        path: relative.clone(),
                        reason,
                    });
                    if let Some(reason) = counters.file_threshold_tripped() {
                        return Err((MetadataError::Aborted { reason }, counters));
                    }
                }
            }

            while pending.len() >= UPSERT_BATCH {
                let batch: Vec<_> = pending.drain(..UPSERT_BATCH).collect();
                total_batches += 1;
                if let Err(e) = self.apply_batch(&batch, release_id, &mut counters).await {
                    failed_batches += 1;
                    warn!(error = %e, "metadata batch write failed");
                    if batch_threshold_tripped(failed_batches, total_batches) {
                        return Err((
                            MetadataError::Aborted {
                                reason: format!(
                                    "{failed_batches} of {total_batches} write batches failed"
                                ),
                            },
                            counters,
                        ));
                    }
                }
            }
        }

        if !pending.is_empty() {
            total_batches += 1;
            if let Err(e) = self.apply_batch(&pending, release_id, &mut counters).await {
                failed_batches += 1;
                warn!(error = %e, "metadata batch write failed");
                if batch_threshold_tripped(failed_batches, total_batches) {
                    return Err((
                        MetadataError::Aborted {
                            reason: format!(
                                "{failed_batches} of {total_batches} write batches failed"
                            ),
                        },
                        counters,
                    ));
                }
            }
        }

        progress(&format!(
            "discovery finished: {} files, {} upserts, {} unchanged",
            counters.files_scanned, counters.tests_upserted, counters.tests_unchanged
        ));
        Ok(counters)
    }

    /// One write transaction per batch of discovered tests
    async fn apply_batch(
        &self,
        batch: &[DiscoveredTest],
        release_id: Option<i64>,
        counters: &mut Counters,
    ) -> MetadataResult<()> {
        let mut session = self.metadata.database().write().await?;

        let mut upserted = 0u64;
        let mut unchanged = 0u64;
        for test in batch {
            let outcome = MetadataStore::apply_discovered_tx(
                session.conn(),
                &test.testcase_name,
                release_id,
                &test.content,
            )
            .await?;
            match outcome {
                UpsertOutcome::Unchanged => unchanged += 1,
                UpsertOutcome::Inserted | UpsertOutcome::Updated | UpsertOutcome::OverridePruned => {
                    upserted += 1;
                }
            }
        }

        session.commit().await?;
        counters.tests_upserted += upserted;
        counters.tests_unchanged += unchanged;
        Ok(())
    }

    fn load_staging(&self, root: &Path) -> HashSet<String> {
        let Some(staging_path) = &self.config.staging_config_path else {
            return HashSet::new();
        };
        match std::fs::read_to_string(root.join(staging_path)) {
            Ok(content) => parse_staging_list(&content),
            Err(e) => {
                warn!(path = %staging_path, error = %e, "staging list unreadable, treating all as PROD");
                HashSet::new()
            }
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    files_scanned: u64,
    files_failed: u64,
    tests_upserted: u64,
    tests_unchanged: u64,
    errors: Vec<SyncFileError>,
}

impl Counters {
    /// File-failure abort rule: rate above 10% AND more than 5 files
    fn file_threshold_tripped(&self) -> Option<String> {
        if self.files_failed <= SYNC_MIN_FAILED_FILES as u64 {
            return None;
        }
        #[allow(clippy::cast_precision_loss)]
        let rate = self.files_failed as f64 / self.files_scanned.max(1) as f64;
        (rate > SYNC_MAX_FILE_FAILURE_RATE).then(|| {
            format!(
                "{} of {} files failed discovery",
                self.files_failed, self.files_scanned
            )
        })
    }
}

/// Batch-failure abort rule: rate above 10% AND more than 2 batches
fn batch_threshold_tripped(failed: u64, total: u64) -> bool {
    if failed <= SYNC_MIN_FAILED_BATCHES as u64 {
        return false;
    }
    #[allow(clippy::cast_precision_loss)]
    let rate = failed as f64 / total.max(1) as f64;
    rate > SYNC_MAX_BATCH_FAILURE_RATE
}

#[cfg(test)]
mod tests {
    use super::*;
    use regtrack_storage::{Database, run_migrations};

    fn config(base: &str) -> MetadataConfig {
        MetadataConfig {
            sync_enabled: true,
            sync_interval_hours: 24,
            git_repo_url: "unused".to_string(),
            git_local_path: "unused".to_string(),
            git_branch: "main".to_string(),
            git_ssh_key_path: None,
            discovery_base_path: base.to_string(),
            staging_config_path: Some("staging_tests.ini".to_string()),
            test_root_prefix: "tests".to_string(),
        }
    }

    async fn sync_over(dir: &Path) -> (MetadataSync, TrackerStore) {
        let db = Database::connect_in_memory().await.expect("connect");
        run_migrations(&db).await.expect("migrate");
        let tracker = TrackerStore::new(db.clone());
        let metadata = MetadataStore::new(db);
        let cfg = config("tests");
        let mirror = MirrorRepo::new(&MetadataConfig {
            git_local_path: dir.to_string_lossy().into_owned(),
            ..cfg.clone()
        });
        (
            MetadataSync::new(metadata, tracker.clone(), mirror, cfg),
            tracker,
        )
    }

    fn write_tree(root: &Path) {
        let routing = root.join("tests/routing");
        std::fs::create_dir_all(&routing).expect("mkdir");
        std::fs::write(
            routing.join("test_bgp.py"),
            r#"
@testbed(topology="dual")
@testmanagement(case=17, priority="P1")
def test_converge():
    pass
"#,
        )
        .expect("write");
        std::fs::write(
            root.join("staging_tests.ini"),
            "[staging]\ntest_converge\n",
        )
        .expect("write staging");
    }

    #[tokio::test]
    async fn baseline_sync_then_release_override() {
        let dir = tempfile::tempdir().expect("dir");
        write_tree(dir.path());
        let (sync, tracker) = sync_over(dir.path()).await;
        let quiet: ProgressFn<'_> = &|_: &str| {};
        let cancel = CancellationToken::new();

        // Baseline pass
        let outcome = sync
            .sync_tree(dir.path(), None, quiet, &cancel)
            .await
            .expect("baseline sync");
        assert_eq!(outcome.status, SyncStatus::Completed);
        assert_eq!(outcome.files_scanned, 1);
        assert_eq!(outcome.tests_upserted, 1);

        let baseline = sync
            .metadata
            .get("tests.routing.test_bgp.test_converge", None)
            .await
            .expect("get")
            .expect("exists");
        assert_eq!(baseline.priority.as_deref(), Some("P1"));
        assert_eq!(baseline.testrail_id.as_deref(), Some("C17"));
        assert_eq!(
            baseline.test_state,
            regtrack_storage::TestState::Staging
        );

        // Identical release pass creates no override
        let release = tracker
            .ensure_release("6.1.0", None, None)
            .await
            .expect("release");
        let outcome = sync
            .sync_tree(dir.path(), Some(release.id), quiet, &cancel)
            .await
            .expect("release sync");
        assert_eq!(outcome.tests_unchanged, 1);
        assert!(sync
            .metadata
            .get("tests.routing.test_bgp.test_converge", Some(release.id))
            .await
            .expect("get")
            .is_none());

        // Source changes for the release: override appears
        std::fs::write(
            dir.path().join("tests/routing/test_bgp.py"),
            r#"
@testbed(topology="dual")
@testmanagement(case=17, priority="P0")
def test_converge():
    pass
"#,
        )
        .expect("rewrite");
        sync.sync_tree(dir.path(), Some(release.id), quiet, &cancel)
            .await
            .expect("override sync");

        let override_row = sync
            .metadata
            .get("tests.routing.test_bgp.test_converge", Some(release.id))
            .await
            .expect("get")
            .expect("override");
        assert_eq!(override_row.priority.as_deref(), Some("P0"));
        // Baseline untouched
        let baseline = sync
            .metadata
            .get("tests.routing.test_bgp.test_converge", None)
            .await
            .expect("get")
            .expect("exists");
        assert_eq!(baseline.priority.as_deref(), Some("P1"));
    }

    #[tokio::test]
    async fn vanished_test_keeps_baseline() {
        let dir = tempfile::tempdir().expect("dir");
        write_tree(dir.path());
        let (sync, _) = sync_over(dir.path()).await;
        let quiet: ProgressFn<'_> = &|_: &str| {};
        let cancel = CancellationToken::new();

        sync.sync_tree(dir.path(), None, quiet, &cancel)
            .await
            .expect("first sync");

        // The test file disappears; a re-sync must not delete the baseline
        std::fs::remove_file(dir.path().join("tests/routing/test_bgp.py")).expect("rm");
        sync.sync_tree(dir.path(), None, quiet, &cancel)
            .await
            .expect("second sync");

        assert!(sync
            .metadata
            .get("tests.routing.test_bgp.test_converge", None)
            .await
            .expect("get")
            .is_some());
    }

    #[tokio::test]
    async fn per_file_failures_are_recorded() {
        let dir = tempfile::tempdir().expect("dir");
        write_tree(dir.path());
        // A file whose known decorator has a bad argument
        std::fs::write(
            dir.path().join("tests/routing/test_bad.py"),
            "@testmanagement(case=\"nope\")\ndef test_x():\n    pass\n",
        )
        .expect("write");

        let (sync, _) = sync_over(dir.path()).await;
        let quiet: ProgressFn<'_> = &|_: &str| {};
        let outcome = sync
            .sync_tree(dir.path(), None, quiet, &CancellationToken::new())
            .await
            .expect("sync despite bad file");

        assert_eq!(outcome.files_scanned, 2);
        assert_eq!(outcome.files_failed, 1);

        let logs = sync.metadata.recent_sync_logs(1).await.expect("logs");
        let log = logs.first().expect("log");
        assert_eq!(log.files_failed, 1);
        assert_eq!(log.error_details.len(), 1);
        assert!(log.error_details.first().expect("detail").path.contains("test_bad"));
    }

    #[tokio::test]
    async fn sync_log_records_abort() {
        let dir = tempfile::tempdir().expect("dir");
        let base = dir.path().join("tests/broken");
        std::fs::create_dir_all(&base).expect("mkdir");
        // Seven unreadable-decorator files out of seven: rate 100%, count > 5
        for i in 0..7 {
            std::fs::write(
                base.join(format!("test_bad_{i}.py")),
                "@testmanagement(case=\"x\")\ndef test_x():\n    pass\n",
            )
            .expect("write");
        }

        let (sync, _) = sync_over(dir.path()).await;
        let quiet: ProgressFn<'_> = &|_: &str| {};
        let err = sync
            .sync_tree(dir.path(), None, quiet, &CancellationToken::new())
            .await
            .expect_err("must abort");
        assert!(matches!(err, MetadataError::Aborted { .. }));

        let logs = sync.metadata.recent_sync_logs(1).await.expect("logs");
        assert_eq!(logs.first().expect("log").status, SyncStatus::Aborted);
    }
}

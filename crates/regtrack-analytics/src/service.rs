//! Analytics façade served to the HTTP shell
//!
//! Every entry point resolves the release, folds its `data_version` into
//! the cache key, and memoizes the response for the configured TTL.
//! Errors bypass the cache entirely.

use std::collections::HashSet;
use std::time::Duration;

use tracing::{debug, instrument};

use regtrack_config::{CacheConfig, FLAKY_WINDOW};
use regtrack_storage::{Release, TrackerStore};

use crate::cache::{TtlCache, cache_key};
use crate::clusters::{ClusterParams, cluster_failures};
use crate::error::{AnalyticsError, AnalyticsResult};
use crate::types::{
    ClusteredFailures, ModuleBreakdownRow, Priority, StatusCounts, SummaryResponse, SummarySide,
    TrendPoint,
};
use crate::{flaky, queries};

/// Knobs of a summary request
#[derive(Debug, Clone, Default)]
pub struct SummaryParams {
    /// Keep only these normalized priorities; None means all
    pub priorities: Option<HashSet<Priority>>,
    /// Include the previous parent build and the delta
    pub compare: bool,
    /// Subtract flaky-but-passing tests from the passed numerator
    pub exclude_flaky: bool,
}

/// Knobs of a trends request
#[derive(Debug, Clone)]
pub struct TrendParams {
    /// How many recent parent builds the series covers
    pub job_limit: i64,
    pub priorities: Option<HashSet<Priority>>,
    pub exclude_flaky: bool,
}

impl Default for TrendParams {
    fn default() -> Self {
        Self {
            job_limit: 10,
            priorities: None,
            exclude_flaky: false,
        }
    }
}

fn priorities_key(priorities: Option<&HashSet<Priority>>) -> String {
    match priorities {
        Some(set) if !set.is_empty() => {
            let mut parts: Vec<&str> = set.iter().map(|p| p.as_str()).collect();
            parts.sort_unstable();
            parts.join(",")
        }
        _ => "all".to_string(),
    }
}

/// On-demand aggregations over the store, behind the TTL cache
pub struct AnalyticsService {
    store: TrackerStore,
    summary_cache: TtlCache<SummaryResponse>,
    breakdown_cache: TtlCache<Vec<ModuleBreakdownRow>>,
    modules_cache: TtlCache<Vec<String>>,
    trends_cache: TtlCache<Vec<TrendPoint>>,
    clusters_cache: TtlCache<ClusteredFailures>,
}

impl AnalyticsService {
    /// Create the service with per-family caches of the configured TTL
    pub fn new(store: TrackerStore, config: &CacheConfig) -> Self {
        let ttl = Duration::from_secs(config.ttl_seconds);
        Self {
            store,
            summary_cache: TtlCache::new(ttl),
            breakdown_cache: TtlCache::new(ttl),
            modules_cache: TtlCache::new(ttl),
            trends_cache: TtlCache::new(ttl),
            clusters_cache: TtlCache::new(ttl),
        }
    }

    async fn resolve_release(&self, release_name: &str) -> AnalyticsResult<Release> {
        self.store
            .get_release(release_name)
            .await?
            .ok_or_else(|| AnalyticsError::NotFound(format!("release '{release_name}'")))
    }

    /// Summary for one release + parent build
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown release or a parent build with no jobs;
    /// storage errors pass through uncached.
    #[instrument(skip(self, params), fields(release = release_name, parent_build))]
    pub async fn summary(
        &self,
        release_name: &str,
        parent_build: i64,
        params: &SummaryParams,
    ) -> AnalyticsResult<SummaryResponse> {
        let release = self.resolve_release(release_name).await?;

        let key = cache_key(&[
            "summary",
            release_name,
            &parent_build.to_string(),
            &priorities_key(params.priorities.as_ref()),
            &format!("compare={}", params.compare),
            &format!("exclude_flaky={}", params.exclude_flaky),
            &format!("v{}", release.data_version),
        ]);
        if let Some(hit) = self.summary_cache.get(&key) {
            debug!("summary cache hit");
            return Ok(hit);
        }

        let response = self
            .compute_summary(&release, release_name, parent_build, params)
            .await?;
        self.summary_cache.put(key, response.clone());
        Ok(response)
    }

    async fn compute_summary(
        &self,
        release: &Release,
        release_name: &str,
        parent_build: i64,
        params: &SummaryParams,
    ) -> AnalyticsResult<SummaryResponse> {
        let db = self.store.database();

        let all_priorities = queries::priority_counts(db, release.id, parent_build).await?;
        if all_priorities.is_empty() {
            return Err(AnalyticsError::NotFound(format!(
                "parent build {parent_build} of '{release_name}'"
            )));
        }

        let priorities: std::collections::BTreeMap<Priority, StatusCounts> = all_priorities
            .into_iter()
            .filter(|(priority, _)| {
                params
                    .priorities
                    .as_ref()
                    .is_none_or(|set| set.contains(priority))
            })
            .collect();

        let mut counts = StatusCounts::default();
        for c in priorities.values() {
            counts.total += c.total;
            counts.passed += c.passed;
            counts.failed += c.failed;
            counts.skipped += c.skipped;
            counts.error += c.error;
        }

        let mut effective_passed = counts.passed;
        if params.exclude_flaky {
            let flaky_set = flaky::flaky_tests_for_release(db, release.id, FLAKY_WINDOW as i64).await?;
            let excluded =
                queries::passed_among(db, release.id, &[parent_build], &flaky_set).await?;
            effective_passed -= excluded.get(&parent_build).copied().unwrap_or(0);
        }

        #[allow(clippy::cast_precision_loss)]
        let pass_rate = if counts.total > 0 {
            effective_passed as f64 / counts.total as f64
        } else {
            0.0
        };

        let (previous, delta) = if params.compare {
            match queries::previous_parent_build(db, release.id, parent_build).await? {
                Some(prev_build) => {
                    let prev_priorities =
                        queries::priority_counts(db, release.id, prev_build).await?;
                    let mut prev_counts = StatusCounts::default();
                    for (priority, c) in prev_priorities {
                        let keep = params
                            .priorities
                            .as_ref()
                            .is_none_or(|set| set.contains(&priority));
                        if keep {
                            prev_counts.total += c.total;
                            prev_counts.passed += c.passed;
                            prev_counts.failed += c.failed;
                            prev_counts.skipped += c.skipped;
                            prev_counts.error += c.error;
                        }
                    }
                    let prev_rate = prev_counts.pass_rate();
                    (
                        Some(SummarySide {
                            parent_build: prev_build,
                            counts: prev_counts,
                            pass_rate: prev_rate,
                        }),
                        Some(pass_rate - prev_rate),
                    )
                }
                None => (None, None),
            }
        } else {
            (None, None)
        };

        Ok(SummaryResponse {
            release: release_name.to_string(),
            parent_build,
            counts,
            pass_rate,
            priorities,
            previous,
            delta,
        })
    }

    /// Per-module breakdown of one parent build
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown release; storage errors pass through.
    pub async fn module_breakdown(
        &self,
        release_name: &str,
        parent_build: i64,
        priorities: Option<HashSet<Priority>>,
    ) -> AnalyticsResult<Vec<ModuleBreakdownRow>> {
        let release = self.resolve_release(release_name).await?;

        let key = cache_key(&[
            "breakdown",
            release_name,
            &parent_build.to_string(),
            &priorities_key(priorities.as_ref()),
            &format!("v{}", release.data_version),
        ]);
        if let Some(hit) = self.breakdown_cache.get(&key) {
            return Ok(hit);
        }

        let rows = queries::module_breakdown(
            self.store.database(),
            release.id,
            parent_build,
            priorities.as_ref(),
        )
        .await?;
        self.breakdown_cache.put(key, rows.clone());
        Ok(rows)
    }

    /// Path-derived module list of a release
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown release; storage errors pass through.
    pub async fn modules(&self, release_name: &str) -> AnalyticsResult<Vec<String>> {
        let release = self.resolve_release(release_name).await?;

        let key = cache_key(&["modules", release_name, &format!("v{}", release.data_version)]);
        if let Some(hit) = self.modules_cache.get(&key) {
            return Ok(hit);
        }

        let names = queries::module_names(self.store.database(), release.id).await?;
        self.modules_cache.put(key, names.clone());
        Ok(names)
    }

    /// Trend series across the last N parent builds
    ///
    /// # Errors
    ///
    /// `BadRequest` for a non-positive job limit, `NotFound` for an
    /// unknown release; storage errors pass through.
    pub async fn trends(
        &self,
        release_name: &str,
        params: &TrendParams,
    ) -> AnalyticsResult<Vec<TrendPoint>> {
        if params.job_limit <= 0 {
            return Err(AnalyticsError::BadRequest(format!(
                "job_limit must be positive, got {}",
                params.job_limit
            )));
        }
        let release = self.resolve_release(release_name).await?;

        let key = cache_key(&[
            "trends",
            release_name,
            &params.job_limit.to_string(),
            &priorities_key(params.priorities.as_ref()),
            &format!("exclude_flaky={}", params.exclude_flaky),
            &format!("v{}", release.data_version),
        ]);
        if let Some(hit) = self.trends_cache.get(&key) {
            return Ok(hit);
        }

        let db = self.store.database();
        let builds = queries::recent_parent_builds(db, release.id, params.job_limit).await?;
        let mut points =
            queries::trend_counts(db, release.id, &builds, params.priorities.as_ref()).await?;

        if params.exclude_flaky && !points.is_empty() {
            let flaky_set = flaky::flaky_tests_for_release(db, release.id, FLAKY_WINDOW as i64).await?;
            let excluded = queries::passed_among(db, release.id, &builds, &flaky_set).await?;
            for point in &mut points {
                let subtract = excluded.get(&point.parent_build).copied().unwrap_or(0);
                let effective = point.passed - subtract;
                #[allow(clippy::cast_precision_loss)]
                let rate = if point.total > 0 {
                    effective as f64 / point.total as f64
                } else {
                    0.0
                };
                point.pass_rate = rate;
            }
        }

        self.trends_cache.put(key, points.clone());
        Ok(points)
    }

    /// Failure clusters of one job
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown release or job; storage errors pass
    /// through.
    pub async fn clustered_failures(
        &self,
        release_name: &str,
        module_name: &str,
        job_id: &str,
        params: ClusterParams,
    ) -> AnalyticsResult<ClusteredFailures> {
        let release = self.resolve_release(release_name).await?;

        let key = cache_key(&[
            "clusters",
            release_name,
            module_name,
            job_id,
            &params.min_cluster_size.to_string(),
            &params.limit.to_string(),
            &params.skip.to_string(),
            &format!("v{}", release.data_version),
        ]);
        if let Some(hit) = self.clusters_cache.get(&key) {
            return Ok(hit);
        }

        let db = self.store.database();
        let (job_db_id, _module_id) = queries::find_job(db, release.id, module_name, job_id)
            .await?
            .ok_or_else(|| {
                AnalyticsError::NotFound(format!("job {job_id} of {module_name}/{release_name}"))
            })?;

        let failures = queries::failed_tests(db, job_db_id).await?;
        let clustered = cluster_failures(failures, params);
        self.clusters_cache.put(key, clustered.clone());
        Ok(clustered)
    }

    /// Drop expired entries from every cache; returns total removed
    pub fn sweep_caches(&self) -> usize {
        self.summary_cache.sweep()
            + self.breakdown_cache.sweep()
            + self.modules_cache.sweep()
            + self.trends_cache.sweep()
            + self.clusters_cache.sweep()
    }
}

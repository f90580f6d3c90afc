//! SQL aggregations behind the analytics engine
//!
//! Pure functions over the read pool. Priority normalization happens in
//! SQL (`CASE ... IN ('P0'..'P3') ELSE 'UNKNOWN'`) so stored values are
//! never mutated; path-derived `testcase_module` is the only module
//! notion used for aggregation.

use std::collections::{BTreeMap, HashSet};

use sqlx::Row;

use regtrack_storage::{
    BuildJob, Database, DatabaseErrorExt, DatabaseOperation, DatabaseResult,
};

use crate::types::{ModuleBreakdownRow, Priority, StatusCounts, TrendPoint};

/// Normalized-priority expression reused across queries
const PRIORITY_EXPR: &str =
    "CASE WHEN tr.priority IN ('P0','P1','P2','P3') THEN tr.priority ELSE 'UNKNOWN' END";

/// Chunk size for `IN (...)` lists of test names
const IN_CHUNK: usize = 500;

fn op(description: impl Into<String>) -> DatabaseOperation {
    DatabaseOperation::Query {
        description: description.into(),
    }
}

/// Render the optional priority filter as a SQL fragment
///
/// Empty/None means no filter. The returned fragment embeds only the
/// fixed normalized literals, never user input.
fn priority_filter(priorities: Option<&HashSet<Priority>>) -> String {
    match priorities {
        Some(set) if !set.is_empty() => {
            let mut literals: Vec<&str> = set.iter().map(|p| p.as_str()).collect();
            literals.sort_unstable();
            let joined = literals
                .iter()
                .map(|p| format!("'{p}'"))
                .collect::<Vec<_>>()
                .join(",");
            format!(" AND {PRIORITY_EXPR} IN ({joined})")
        }
        _ => String::new(),
    }
}

/// Status counts per normalized priority for one release + parent build
///
/// # Errors
///
/// Returns an error if the query fails.
pub async fn priority_counts(
    db: &Database,
    release_id: i64,
    parent_build: i64,
) -> DatabaseResult<BTreeMap<Priority, StatusCounts>> {
    let sql = format!(
        "
        SELECT {PRIORITY_EXPR} AS priority,
               COUNT(*) AS total,
               COALESCE(SUM(tr.status = 'PASSED'), 0) AS passed,
               COALESCE(SUM(tr.status = 'FAILED'), 0) AS failed,
               COALESCE(SUM(tr.status = 'SKIPPED'), 0) AS skipped,
               COALESCE(SUM(tr.status = 'ERROR'), 0) AS error
        FROM test_results tr
        JOIN jobs j ON j.id = tr.job_id
        JOIN modules m ON m.id = j.module_id
        WHERE m.release_id = ? AND j.parent_job_id = ?
        GROUP BY 1
        "
    );

    let rows = sqlx::query(&sql)
        .bind(release_id)
        .bind(parent_build.to_string())
        .fetch_all(db.read_pool())
        .await
        .map_db_err(op(format!("priority_counts {release_id}/{parent_build}")))?;

    let mut counts = BTreeMap::new();
    for row in rows {
        let priority: String = row.get("priority");
        counts.insert(
            Priority::normalize(Some(&priority)),
            StatusCounts {
                total: row.get("total"),
                passed: row.get("passed"),
                failed: row.get("failed"),
                skipped: row.get("skipped"),
                error: row.get("error"),
            },
        );
    }
    Ok(counts)
}

/// Largest parent build strictly below `before`, or the latest overall
///
/// One `ORDER BY ... LIMIT 1` query; never loads the job list.
///
/// # Errors
///
/// Returns an error if the query fails.
pub async fn previous_parent_build(
    db: &Database,
    release_id: i64,
    before: i64,
) -> DatabaseResult<Option<i64>> {
    let row = sqlx::query(
        "
        SELECT CAST(j.parent_job_id AS INTEGER) AS pb
        FROM jobs j
        JOIN modules m ON m.id = j.module_id
        WHERE m.release_id = ?
          AND j.parent_job_id IS NOT NULL
          AND CAST(j.parent_job_id AS INTEGER) < ?
        ORDER BY CAST(j.parent_job_id AS INTEGER) DESC
        LIMIT 1
        ",
    )
    .bind(release_id)
    .bind(before)
    .fetch_optional(db.read_pool())
    .await
    .map_db_err(op(format!("previous_parent_build < {before}")))?;

    Ok(row.map(|r| r.get("pb")))
}

/// The job with the numerically largest `job_id` strictly below `job_id`
///
/// # Errors
///
/// Returns an error if the query fails.
pub async fn previous_job(
    db: &Database,
    module_id: i64,
    job_id: i64,
) -> DatabaseResult<Option<BuildJob>> {
    let row = sqlx::query(
        "
        SELECT * FROM jobs
        WHERE module_id = ? AND CAST(job_id AS INTEGER) < ?
        ORDER BY CAST(job_id AS INTEGER) DESC
        LIMIT 1
        ",
    )
    .bind(module_id)
    .bind(job_id)
    .fetch_optional(db.read_pool())
    .await
    .map_db_err(op(format!("previous_job < {job_id}")))?;

    Ok(row.map(|r| BuildJob {
        id: r.get("id"),
        module_id: r.get("module_id"),
        job_id: r.get("job_id"),
        parent_job_id: r.get("parent_job_id"),
        jenkins_url: r.get("jenkins_url"),
        version: r.get("version"),
        total: r.get("total"),
        passed: r.get("passed"),
        failed: r.get("failed"),
        skipped: r.get("skipped"),
        error: r.get("error"),
        timestamp: r.get("timestamp"),
        created_at: r.get("created_at"),
    }))
}

/// Per-module breakdown of one parent build
///
/// Groups by path-derived `testcase_module`; rows whose file path never
/// matched the test root carry no module and are excluded. ERROR outcomes
/// fold into the failed column.
///
/// # Errors
///
/// Returns an error if the query fails.
pub async fn module_breakdown(
    db: &Database,
    release_id: i64,
    parent_build: i64,
    priorities: Option<&HashSet<Priority>>,
) -> DatabaseResult<Vec<ModuleBreakdownRow>> {
    let filter = priority_filter(priorities);
    let sql = format!(
        "
        SELECT tr.testcase_module AS module,
               COUNT(*) AS total,
               COALESCE(SUM(tr.status = 'PASSED'), 0) AS passed,
               COALESCE(SUM(tr.status IN ('FAILED','ERROR')), 0) AS failed,
               COALESCE(SUM(tr.status = 'SKIPPED'), 0) AS skipped
        FROM test_results tr
        JOIN jobs j ON j.id = tr.job_id
        JOIN modules m ON m.id = j.module_id
        WHERE m.release_id = ? AND j.parent_job_id = ? AND tr.testcase_module IS NOT NULL{filter}
        GROUP BY tr.testcase_module
        ORDER BY tr.testcase_module
        "
    );

    let rows = sqlx::query(&sql)
        .bind(release_id)
        .bind(parent_build.to_string())
        .fetch_all(db.read_pool())
        .await
        .map_db_err(op(format!("module_breakdown {release_id}/{parent_build}")))?;

    Ok(rows
        .into_iter()
        .map(|row| {
            let total: i64 = row.get("total");
            let passed: i64 = row.get("passed");
            #[allow(clippy::cast_precision_loss)]
            let pass_rate = if total > 0 {
                passed as f64 / total as f64
            } else {
                0.0
            };
            ModuleBreakdownRow {
                module: row.get("module"),
                total,
                passed,
                failed: row.get("failed"),
                skipped: row.get("skipped"),
                pass_rate,
            }
        })
        .collect())
}

/// Distinct path-derived modules seen in a release
///
/// # Errors
///
/// Returns an error if the query fails.
pub async fn module_names(db: &Database, release_id: i64) -> DatabaseResult<Vec<String>> {
    let rows = sqlx::query(
        "
        SELECT DISTINCT tr.testcase_module AS module
        FROM test_results tr
        JOIN jobs j ON j.id = tr.job_id
        JOIN modules m ON m.id = j.module_id
        WHERE m.release_id = ? AND tr.testcase_module IS NOT NULL
        ORDER BY tr.testcase_module
        ",
    )
    .bind(release_id)
    .fetch_all(db.read_pool())
    .await
    .map_db_err(op(format!("module_names {release_id}")))?;

    Ok(rows.into_iter().map(|r| r.get("module")).collect())
}

/// The last `limit` parent builds of a release, ascending
///
/// # Errors
///
/// Returns an error if the query fails.
pub async fn recent_parent_builds(
    db: &Database,
    release_id: i64,
    limit: i64,
) -> DatabaseResult<Vec<i64>> {
    let rows = sqlx::query(
        "
        SELECT DISTINCT CAST(j.parent_job_id AS INTEGER) AS pb
        FROM jobs j
        JOIN modules m ON m.id = j.module_id
        WHERE m.release_id = ? AND j.parent_job_id IS NOT NULL
        ORDER BY pb DESC
        LIMIT ?
        ",
    )
    .bind(release_id)
    .bind(limit)
    .fetch_all(db.read_pool())
    .await
    .map_db_err(op(format!("recent_parent_builds {release_id}")))?;

    let mut builds: Vec<i64> = rows.into_iter().map(|r| r.get("pb")).collect();
    builds.sort_unstable();
    Ok(builds)
}

/// Trend counts per parent build, time-ordered, optionally priority-scoped
///
/// ERROR outcomes fold into failed, matching the breakdown columns.
///
/// # Errors
///
/// Returns an error if the query fails.
pub async fn trend_counts(
    db: &Database,
    release_id: i64,
    parent_builds: &[i64],
    priorities: Option<&HashSet<Priority>>,
) -> DatabaseResult<Vec<TrendPoint>> {
    if parent_builds.is_empty() {
        return Ok(Vec::new());
    }

    let filter = priority_filter(priorities);
    let placeholders = parent_builds.iter().map(|_| "?").collect::<Vec<_>>().join(",");
    let sql = format!(
        "
        SELECT CAST(j.parent_job_id AS INTEGER) AS pb,
               COUNT(*) AS total,
               COALESCE(SUM(tr.status = 'PASSED'), 0) AS passed,
               COALESCE(SUM(tr.status IN ('FAILED','ERROR')), 0) AS failed
        FROM test_results tr
        JOIN jobs j ON j.id = tr.job_id
        JOIN modules m ON m.id = j.module_id
        WHERE m.release_id = ?
          AND CAST(j.parent_job_id AS INTEGER) IN ({placeholders}){filter}
        GROUP BY pb
        ORDER BY pb
        "
    );

    let mut query = sqlx::query(&sql).bind(release_id);
    for pb in parent_builds {
        query = query.bind(pb);
    }

    let rows = query
        .fetch_all(db.read_pool())
        .await
        .map_db_err(op(format!("trend_counts {release_id}")))?;

    Ok(rows
        .into_iter()
        .map(|row| {
            let total: i64 = row.get("total");
            let passed: i64 = row.get("passed");
            #[allow(clippy::cast_precision_loss)]
            let pass_rate = if total > 0 {
                passed as f64 / total as f64
            } else {
                0.0
            };
            TrendPoint {
                parent_build: row.get("pb"),
                total,
                passed,
                failed: row.get("failed"),
                pass_rate,
            }
        })
        .collect())
}

/// PASSED rows among the given tests, per parent build
///
/// Supports flaky exclusion: the caller subtracts these from the passed
/// numerators. Chunked to keep bind counts bounded.
///
/// # Errors
///
/// Returns an error if the query fails.
pub async fn passed_among(
    db: &Database,
    release_id: i64,
    parent_builds: &[i64],
    test_names: &HashSet<String>,
) -> DatabaseResult<BTreeMap<i64, i64>> {
    let mut totals: BTreeMap<i64, i64> = BTreeMap::new();
    if parent_builds.is_empty() || test_names.is_empty() {
        return Ok(totals);
    }

    let build_placeholders = parent_builds.iter().map(|_| "?").collect::<Vec<_>>().join(",");
    let names: Vec<&String> = test_names.iter().collect();

    for chunk in names.chunks(IN_CHUNK) {
        let name_placeholders = chunk.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!(
            "
            SELECT CAST(j.parent_job_id AS INTEGER) AS pb, COUNT(*) AS passed
            FROM test_results tr
            JOIN jobs j ON j.id = tr.job_id
            JOIN modules m ON m.id = j.module_id
            WHERE m.release_id = ?
              AND tr.status = 'PASSED'
              AND CAST(j.parent_job_id AS INTEGER) IN ({build_placeholders})
              AND tr.test_name IN ({name_placeholders})
            GROUP BY pb
            "
        );

        let mut query = sqlx::query(&sql).bind(release_id);
        for pb in parent_builds {
            query = query.bind(pb);
        }
        for name in chunk {
            query = query.bind(name.as_str());
        }

        let rows = query
            .fetch_all(db.read_pool())
            .await
            .map_db_err(op("passed_among flaky set"))?;

        for row in rows {
            let pb: i64 = row.get("pb");
            let passed: i64 = row.get("passed");
            *totals.entry(pb).or_insert(0) += passed;
        }
    }

    Ok(totals)
}

/// Module ids and names of a release
///
/// # Errors
///
/// Returns an error if the query fails.
pub async fn release_modules(db: &Database, release_id: i64) -> DatabaseResult<Vec<(i64, String)>> {
    let rows = sqlx::query("SELECT id, name FROM modules WHERE release_id = ? ORDER BY name")
        .bind(release_id)
        .fetch_all(db.read_pool())
        .await
        .map_db_err(op(format!("release_modules {release_id}")))?;

    Ok(rows.into_iter().map(|r| (r.get("id"), r.get("name"))).collect())
}

/// Tests that both passed and failed within the last `window` jobs of a module
///
/// # Errors
///
/// Returns an error if the query fails.
pub async fn flaky_tests_in_module(
    db: &Database,
    module_id: i64,
    window: i64,
) -> DatabaseResult<HashSet<String>> {
    let rows = sqlx::query(
        "
        SELECT tr.test_name
        FROM test_results tr
        WHERE tr.job_id IN (
            SELECT id FROM jobs
            WHERE module_id = ?
            ORDER BY CAST(job_id AS INTEGER) DESC
            LIMIT ?
        )
        GROUP BY tr.test_name
        HAVING SUM(tr.status = 'PASSED') > 0 AND SUM(tr.status = 'FAILED') > 0
        ",
    )
    .bind(module_id)
    .bind(window)
    .fetch_all(db.read_pool())
    .await
    .map_db_err(op(format!("flaky_tests_in_module {module_id}")))?;

    Ok(rows.into_iter().map(|r| r.get("test_name")).collect())
}

/// FAILED tests of one job with their stack traces
///
/// # Errors
///
/// Returns an error if the query fails.
pub async fn failed_tests(
    db: &Database,
    job_db_id: i64,
) -> DatabaseResult<Vec<(String, Option<String>)>> {
    let rows = sqlx::query(
        "
        SELECT test_name, stack_trace
        FROM test_results
        WHERE job_id = ? AND status = 'FAILED'
        ORDER BY test_name
        ",
    )
    .bind(job_db_id)
    .fetch_all(db.read_pool())
    .await
    .map_db_err(op(format!("failed_tests of job {job_db_id}")))?;

    Ok(rows
        .into_iter()
        .map(|r| (r.get("test_name"), r.get("stack_trace")))
        .collect())
}

/// Resolve a job row by release, module name and CI build number
///
/// # Errors
///
/// Returns an error if the query fails.
pub async fn find_job(
    db: &Database,
    release_id: i64,
    module_name: &str,
    job_id: &str,
) -> DatabaseResult<Option<(i64, i64)>> {
    let row = sqlx::query(
        "
        SELECT j.id AS job_db_id, m.id AS module_id
        FROM jobs j
        JOIN modules m ON m.id = j.module_id
        WHERE m.release_id = ? AND m.name = ? AND j.job_id = ?
        ",
    )
    .bind(release_id)
    .bind(module_name)
    .bind(job_id)
    .fetch_optional(db.read_pool())
    .await
    .map_db_err(op(format!("find_job {module_name}/{job_id}")))?;

    Ok(row.map(|r| (r.get("job_db_id"), r.get("module_id"))))
}

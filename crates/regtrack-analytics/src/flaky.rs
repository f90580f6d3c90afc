//! Flaky test classification
//!
//! A test is flaky iff both PASSED and FAILED appear among its outcomes
//! within the sliding window of the most recent jobs of its
//! `(release, module)`. The window is the last `FLAKY_WINDOW` jobs by
//! numeric CI build number.

use std::collections::HashSet;

use regtrack_storage::{Database, DatabaseResult};

use crate::queries;

/// Flaky tests across every module of a release
///
/// Union of the per-module windows; used by `exclude_flaky` query modes.
///
/// # Errors
///
/// Returns an error if any window query fails.
pub async fn flaky_tests_for_release(
    db: &Database,
    release_id: i64,
    window: i64,
) -> DatabaseResult<HashSet<String>> {
    let modules = queries::release_modules(db, release_id).await?;

    let mut flaky = HashSet::new();
    for (module_id, _) in modules {
        flaky.extend(queries::flaky_tests_in_module(db, module_id, window).await?);
    }
    Ok(flaky)
}

/// Flaky tests of one module's window
///
/// # Errors
///
/// Returns an error if the window query fails.
pub async fn flaky_tests_for_module(
    db: &Database,
    module_id: i64,
    window: i64,
) -> DatabaseResult<HashSet<String>> {
    queries::flaky_tests_in_module(db, module_id, window).await
}

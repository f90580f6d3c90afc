//! Analytics engine scenarios over an in-memory store

use std::collections::HashSet;

use regtrack_analytics::{
    AnalyticsService, ClusterParams, Priority, SummaryParams, TrendParams,
};
use regtrack_config::CacheConfig;
use regtrack_storage::{
    Database, NewTestResult, TestStatus, TrackerStore, run_migrations,
};

struct Fixture {
    service: AnalyticsService,
    store: TrackerStore,
}

async fn fixture() -> Fixture {
    let db = Database::connect_in_memory().await.expect("connect");
    run_migrations(&db).await.expect("migrate");
    let store = TrackerStore::new(db);
    let service = AnalyticsService::new(
        store.clone(),
        &CacheConfig {
            ttl_seconds: 300,
            sweep_interval_seconds: 60,
        },
    );
    Fixture { service, store }
}

fn result(
    name: &str,
    module: &str,
    status: TestStatus,
    priority: Option<&str>,
    stack_trace: Option<&str>,
) -> NewTestResult {
    NewTestResult {
        test_name: name.to_string(),
        file_path: Some(format!("tests/{module}/test_suite.py")),
        status,
        duration_sec: Some(0.5),
        message: None,
        stack_trace: stack_trace.map(str::to_string),
        testcase_module: Some(module.to_string()),
        priority: priority.map(str::to_string),
        bug: None,
    }
}

/// Insert one job with its results, maintaining the job counters
async fn seed_job(
    store: &TrackerStore,
    release: &str,
    module: &str,
    module_build: i64,
    parent_build: i64,
    results: &[NewTestResult],
) -> i64 {
    let release_row = store.ensure_release(release, None, None).await.expect("release");

    let mut session = store.database().write().await.expect("begin");
    let module_row = TrackerStore::ensure_module_tx(session.conn(), release_row.id, module)
        .await
        .expect("module");
    let job_db_id = TrackerStore::upsert_job_tx(
        session.conn(),
        module_row.id,
        &module_build.to_string(),
        Some(&parent_build.to_string()),
        None,
        None,
        None,
    )
    .await
    .expect("job");
    TrackerStore::insert_results_tx(session.conn(), job_db_id, results)
        .await
        .expect("results");
    TrackerStore::recompute_job_counts_tx(session.conn(), job_db_id)
        .await
        .expect("counts");
    TrackerStore::bump_data_version_tx(session.conn(), release_row.id)
        .await
        .expect("bump");
    session.commit().await.expect("commit");
    job_db_id
}

#[tokio::test]
async fn summary_counts_and_delta() {
    let f = fixture().await;

    // Build 11: 95 passed / 5 failed; build 12: all 100 passed
    let mut rows = Vec::new();
    for i in 0..95 {
        rows.push(result(&format!("t{i}"), "routing", TestStatus::Passed, None, None));
    }
    for i in 95..100 {
        rows.push(result(&format!("t{i}"), "routing", TestStatus::Failed, None, Some("x")));
    }
    seed_job(&f.store, "6.1.0", "routing", 451, 11, &rows).await;

    let all_pass: Vec<_> = (0..100)
        .map(|i| result(&format!("t{i}"), "routing", TestStatus::Passed, None, None))
        .collect();
    seed_job(&f.store, "6.1.0", "routing", 452, 12, &all_pass).await;

    let summary = f
        .service
        .summary(
            "6.1.0",
            12,
            &SummaryParams {
                compare: true,
                ..SummaryParams::default()
            },
        )
        .await
        .expect("summary");

    assert_eq!(summary.counts.total, 100);
    assert!((summary.pass_rate - 1.0).abs() < f64::EPSILON);

    let previous = summary.previous.expect("previous side");
    assert_eq!(previous.parent_build, 11);
    assert_eq!(previous.counts.failed, 5);
    assert!((previous.pass_rate - 0.95).abs() < 1e-9);
    assert!((summary.delta.expect("delta") - 0.05).abs() < 1e-9);
}

#[tokio::test]
async fn priority_filtered_breakdown() {
    let f = fixture().await;

    // P0: 10 pass, P1: 20 pass + 2 fail, P2: 5 skip
    let mut rows = Vec::new();
    for i in 0..10 {
        rows.push(result(&format!("p0_{i}"), "routing", TestStatus::Passed, Some("P0"), None));
    }
    for i in 0..20 {
        rows.push(result(&format!("p1_{i}"), "routing", TestStatus::Passed, Some("P1"), None));
    }
    for i in 0..2 {
        rows.push(result(
            &format!("p1_fail_{i}"),
            "routing",
            TestStatus::Failed,
            Some("P1"),
            Some("t"),
        ));
    }
    for i in 0..5 {
        rows.push(result(&format!("p2_{i}"), "routing", TestStatus::Skipped, Some("P2"), None));
    }
    seed_job(&f.store, "6.1.0", "routing", 451, 11, &rows).await;

    let wanted: HashSet<Priority> = [Priority::P0, Priority::P1].into_iter().collect();
    let breakdown = f
        .service
        .module_breakdown("6.1.0", 11, Some(wanted.clone()))
        .await
        .expect("breakdown");

    assert_eq!(breakdown.len(), 1);
    let row = breakdown.first().expect("row");
    assert_eq!(row.module, "routing");
    assert_eq!((row.total, row.passed, row.failed, row.skipped), (32, 30, 2, 0));
    assert!((row.pass_rate - 0.9375).abs() < 1e-9);

    // Summary with the same filter agrees
    let summary = f
        .service
        .summary(
            "6.1.0",
            11,
            &SummaryParams {
                priorities: Some(wanted),
                ..SummaryParams::default()
            },
        )
        .await
        .expect("summary");
    assert_eq!(summary.counts.total, 32);
    assert!((summary.pass_rate - 0.9375).abs() < 1e-9);
}

#[tokio::test]
async fn unknown_priority_normalizes() {
    let f = fixture().await;

    let rows = vec![
        result("a", "qos", TestStatus::Passed, Some("P1"), None),
        result("b", "qos", TestStatus::Passed, Some("urgent"), None),
        result("c", "qos", TestStatus::Passed, None, None),
    ];
    seed_job(&f.store, "6.1.0", "qos", 451, 11, &rows).await;

    let summary = f
        .service
        .summary("6.1.0", 11, &SummaryParams::default())
        .await
        .expect("summary");

    assert_eq!(
        summary.priorities.get(&Priority::Unknown).map(|c| c.total),
        Some(2)
    );
    assert_eq!(summary.priorities.get(&Priority::P1).map(|c| c.total), Some(1));
}

#[tokio::test]
async fn flaky_exclusion_in_trends() {
    let f = fixture().await;

    // Test T alternates within the 5-job window: flaky. Test S always passes.
    let outcomes = [
        TestStatus::Passed,
        TestStatus::Failed,
        TestStatus::Passed,
        TestStatus::Passed,
        TestStatus::Passed,
    ];
    for (i, status) in outcomes.into_iter().enumerate() {
        let build = 451 + i as i64;
        let parent = 11 + i as i64;
        let rows = vec![
            result("T", "routing", status, None, Some("t")),
            result("S", "routing", TestStatus::Passed, None, None),
        ];
        seed_job(&f.store, "6.1.0", "routing", build, parent, &rows).await;
    }

    let plain = f
        .service
        .trends("6.1.0", &TrendParams::default())
        .await
        .expect("trends");
    let latest = plain.last().expect("latest");
    assert_eq!(latest.parent_build, 15);
    assert!((latest.pass_rate - 1.0).abs() < f64::EPSILON);

    let excluded = f
        .service
        .trends(
            "6.1.0",
            &TrendParams {
                exclude_flaky: true,
                ..TrendParams::default()
            },
        )
        .await
        .expect("trends");
    let latest = excluded.last().expect("latest");
    // T's latest PASS no longer counts toward the numerator: 1/2
    assert!((latest.pass_rate - 0.5).abs() < 1e-9);
}

#[tokio::test]
async fn clustering_through_service() {
    let f = fixture().await;

    let rows = vec![
        result("t1", "routing", TestStatus::Failed, None, Some("at x.py:12 0xABCD")),
        result("t2", "routing", TestStatus::Failed, None, Some("at x.py:34 0x1234")),
        result("t3", "routing", TestStatus::Failed, None, Some("at y.py:7 0xBEEF")),
        result("t4", "routing", TestStatus::Failed, None, Some("at x.py:12 0x5555")),
        result("t5", "routing", TestStatus::Failed, None, Some("at y.py:7 0xDEAD")),
        result("ok", "routing", TestStatus::Passed, None, None),
    ];
    seed_job(&f.store, "6.1.0", "routing", 451, 11, &rows).await;

    let clustered = f
        .service
        .clustered_failures("6.1.0", "routing", "451", ClusterParams::default())
        .await
        .expect("clusters");

    assert_eq!(clustered.total_failed, 5);
    assert_eq!(clustered.clusters.len(), 2);
    assert_eq!(clustered.clusters.first().expect("first").size, 3);
    assert_eq!(clustered.clusters.get(1).expect("second").size, 2);
    let sum: usize = clustered.clusters.iter().map(|c| c.size).sum();
    assert_eq!(sum, clustered.total_failed);
}

#[tokio::test]
async fn missing_release_and_job_are_not_found() {
    let f = fixture().await;

    let err = f
        .service
        .summary("9.9.9", 1, &SummaryParams::default())
        .await
        .expect_err("unknown release");
    assert!(matches!(err, regtrack_analytics::AnalyticsError::NotFound(_)));

    seed_job(
        &f.store,
        "6.1.0",
        "routing",
        451,
        11,
        &[result("a", "routing", TestStatus::Passed, None, None)],
    )
    .await;

    let err = f
        .service
        .clustered_failures("6.1.0", "routing", "999", ClusterParams::default())
        .await
        .expect_err("unknown job");
    assert!(matches!(err, regtrack_analytics::AnalyticsError::NotFound(_)));
}

#[tokio::test]
async fn import_bump_invalidates_cached_summary() {
    let f = fixture().await;

    seed_job(
        &f.store,
        "6.1.0",
        "routing",
        451,
        11,
        &[result("a", "routing", TestStatus::Passed, None, None)],
    )
    .await;

    let first = f
        .service
        .summary("6.1.0", 11, &SummaryParams::default())
        .await
        .expect("summary");
    assert_eq!(first.counts.total, 1);

    // A fresh import of the same parent build adds a module and bumps the
    // release data version, steering subsequent reads past the old entry.
    seed_job(
        &f.store,
        "6.1.0",
        "qos",
        390,
        11,
        &[result("b", "qos", TestStatus::Passed, None, None)],
    )
    .await;

    let second = f
        .service
        .summary("6.1.0", 11, &SummaryParams::default())
        .await
        .expect("summary");
    assert_eq!(second.counts.total, 2);
}

#[tokio::test]
async fn previous_job_resolution_is_numeric() {
    let f = fixture().await;

    // "9" < "101" numerically even though "9" > "101" as strings
    for (build, parent) in [(9, 1), (101, 2), (250, 3)] {
        seed_job(
            &f.store,
            "6.1.0",
            "routing",
            build,
            parent,
            &[result("a", "routing", TestStatus::Passed, None, None)],
        )
        .await;
    }

    let db = f.store.database();
    let previous = regtrack_analytics::queries::previous_job(db, 1, 250)
        .await
        .expect("query")
        .expect("exists");
    assert_eq!(previous.job_id, "101");

    let previous = regtrack_analytics::queries::previous_job(db, 1, 101)
        .await
        .expect("query")
        .expect("exists");
    assert_eq!(previous.job_id, "9");

    assert!(regtrack_analytics::queries::previous_job(db, 1, 9)
        .await
        .expect("query")
        .is_none());
}

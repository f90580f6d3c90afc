//! Aggregated analytics over imported test results
//!
//! Trend series, module and priority breakdowns, flaky classification and
//! failure clustering, all served through a request-scoped TTL cache.

pub mod cache;
pub mod clusters;
pub mod error;
pub mod flaky;
pub mod queries;
pub mod service;
pub mod types;

pub use cache::TtlCache;
pub use clusters::{ClusterParams, cluster_failures, fingerprint};
pub use error::{AnalyticsError, AnalyticsResult};
pub use service::{AnalyticsService, SummaryParams, TrendParams};
pub use types::{
    ClusteredFailures, FailureCluster, ModuleBreakdownRow, Priority, StatusCounts,
    SummaryResponse, SummarySide, TrendPoint,
};

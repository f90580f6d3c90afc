//! Response shapes served to the HTTP shell

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Normalized test priority
///
/// Only P0..P3 are recognized; everything else, including absent values,
/// reads as UNKNOWN. Normalization happens at query time and never mutates
/// stored rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    P0,
    P1,
    P2,
    P3,
    Unknown,
}

impl Priority {
    /// Normalize a stored value
    pub fn normalize(raw: Option<&str>) -> Self {
        match raw {
            Some("P0") => Self::P0,
            Some("P1") => Self::P1,
            Some("P2") => Self::P2,
            Some("P3") => Self::P3,
            _ => Self::Unknown,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::P0 => "P0",
            Self::P1 => "P1",
            Self::P2 => "P2",
            Self::P3 => "P3",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "P0" => Ok(Self::P0),
            "P1" => Ok(Self::P1),
            "P2" => Ok(Self::P2),
            "P3" => Ok(Self::P3),
            "UNKNOWN" => Ok(Self::Unknown),
            _ => Err(format!("Invalid priority: {s}")),
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Counts across every status of a result set
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub total: i64,
    pub passed: i64,
    pub failed: i64,
    pub skipped: i64,
    pub error: i64,
}

impl StatusCounts {
    /// Pass rate with skipped tests in the denominator
    ///
    /// `passed / total`; zero when the set is empty. This formula is a
    /// deliberate, documented choice - queries must never silently switch
    /// to excluding skips.
    #[allow(clippy::cast_precision_loss)]
    pub fn pass_rate(&self) -> f64 {
        if self.total > 0 {
            self.passed as f64 / self.total as f64
        } else {
            0.0
        }
    }
}

/// One side of a summary comparison
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummarySide {
    pub parent_build: i64,
    pub counts: StatusCounts,
    pub pass_rate: f64,
}

/// Summary for one release + parent build
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryResponse {
    pub release: String,
    pub parent_build: i64,
    pub counts: StatusCounts,
    pub pass_rate: f64,
    /// Per-priority breakdown after normalization
    pub priorities: BTreeMap<Priority, StatusCounts>,
    /// Prior parent build, present when compare was requested and one exists
    pub previous: Option<SummarySide>,
    /// `pass_rate - previous.pass_rate`, when previous is present
    pub delta: Option<f64>,
}

/// One row of the per-module breakdown
///
/// `failed` folds ERROR outcomes in; the breakdown's columns mirror what
/// the dashboard renders.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleBreakdownRow {
    pub module: String,
    pub total: i64,
    pub passed: i64,
    pub failed: i64,
    pub skipped: i64,
    pub pass_rate: f64,
}

/// One point of a trend series
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrendPoint {
    pub parent_build: i64,
    pub total: i64,
    pub passed: i64,
    pub failed: i64,
    pub pass_rate: f64,
}

/// One failure cluster of a job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureCluster {
    /// Masked first stack-trace line shared by the cluster
    pub fingerprint: String,
    pub size: usize,
    pub tests: Vec<String>,
}

/// Clustered failures of one job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusteredFailures {
    /// FAILED tests in the job; equals the sum of all cluster sizes
    /// before `min_cluster_size`/paging narrowing
    pub total_failed: usize,
    pub clusters: Vec<FailureCluster>,
}

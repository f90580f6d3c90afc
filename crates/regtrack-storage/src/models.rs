//! Domain models for database entities

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outcome of a single test execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TestStatus {
    Passed,
    Failed,
    Skipped,
    Error,
}

impl TestStatus {
    /// Canonical uppercase database representation
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Passed => "PASSED",
            Self::Failed => "FAILED",
            Self::Skipped => "SKIPPED",
            Self::Error => "ERROR",
        }
    }
}

impl std::str::FromStr for TestStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PASSED" => Ok(Self::Passed),
            "FAILED" => Ok(Self::Failed),
            "SKIPPED" => Ok(Self::Skipped),
            "ERROR" => Ok(Self::Error),
            _ => Err(format!("Invalid test status: {s}")),
        }
    }
}

impl std::fmt::Display for TestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Whether a test belongs to the production or staging population
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TestState {
    Prod,
    Staging,
}

impl TestState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Prod => "PROD",
            Self::Staging => "STAGING",
        }
    }
}

impl std::str::FromStr for TestState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PROD" => Ok(Self::Prod),
            "STAGING" => Ok(Self::Staging),
            _ => Err(format!("Invalid test state: {s}")),
        }
    }
}

impl std::fmt::Display for TestState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A tracked software release
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Release {
    pub id: i64,
    pub name: String,
    pub jenkins_job_url: Option<String>,
    pub git_branch: Option<String>,
    pub is_active: bool,
    /// Largest parent build whose ingestion is durably complete
    pub last_processed_build: i64,
    /// Bumped on every successful import; folded into analytics cache keys
    pub data_version: i64,
    pub created_at: DateTime<Utc>,
}

/// One CI module under a release
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Module {
    pub id: i64,
    pub release_id: i64,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// One module's outcome for one parent build
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildJob {
    pub id: i64,
    pub module_id: i64,
    /// CI build number of the module build, as reported by the CI server
    pub job_id: String,
    /// Main-job build number this module build belongs to
    pub parent_job_id: Option<String>,
    pub jenkins_url: Option<String>,
    pub version: Option<String>,
    pub total: i64,
    pub passed: i64,
    pub failed: i64,
    pub skipped: i64,
    pub error: i64,
    pub timestamp: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// One test outcome within a job, as stored
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResult {
    pub id: i64,
    pub job_id: i64,
    pub test_name: String,
    pub file_path: Option<String>,
    pub status: TestStatus,
    pub duration_sec: Option<f64>,
    pub message: Option<String>,
    pub stack_trace: Option<String>,
    /// Second path segment under the test root, derived at import time
    pub testcase_module: Option<String>,
    /// Cached from testcase metadata at import time
    pub priority: Option<String>,
    pub bug: Option<String>,
}

/// Insert payload for one test outcome
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTestResult {
    pub test_name: String,
    pub file_path: Option<String>,
    pub status: TestStatus,
    pub duration_sec: Option<f64>,
    pub message: Option<String>,
    pub stack_trace: Option<String>,
    pub testcase_module: Option<String>,
    pub priority: Option<String>,
    pub bug: Option<String>,
}

/// Curated metadata for one testcase
///
/// `release_id = None` marks the global baseline; a row with a release is
/// an override that exists only while it differs from the baseline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestcaseMetadata {
    pub id: i64,
    pub testcase_name: String,
    pub release_id: Option<i64>,
    pub test_class_name: Option<String>,
    pub module: Option<String>,
    pub topology: Option<String>,
    pub test_state: TestState,
    pub test_case_id: Option<String>,
    pub testrail_id: Option<String>,
    pub priority: Option<String>,
    pub test_path: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// The comparable payload of a metadata row, independent of identity
///
/// Overrides are pruned when their content equals the baseline's; this is
/// the exact field set that comparison covers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataContent {
    pub test_class_name: Option<String>,
    pub module: Option<String>,
    pub topology: Option<String>,
    pub test_state: TestState,
    pub test_case_id: Option<String>,
    pub testrail_id: Option<String>,
    pub priority: Option<String>,
    pub test_path: Option<String>,
}

impl TestcaseMetadata {
    /// Comparable content of this row
    pub fn content(&self) -> MetadataContent {
        MetadataContent {
            test_class_name: self.test_class_name.clone(),
            module: self.module.clone(),
            topology: self.topology.clone(),
            test_state: self.test_state,
            test_case_id: self.test_case_id.clone(),
            testrail_id: self.testrail_id.clone(),
            priority: self.priority.clone(),
            test_path: self.test_path.clone(),
        }
    }
}

/// Status of one metadata sync run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Running,
    Completed,
    Failed,
    Aborted,
}

impl SyncStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
        }
    }
}

impl std::str::FromStr for SyncStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "aborted" => Ok(Self::Aborted),
            _ => Err(format!("Invalid sync status: {s}")),
        }
    }
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One file the sync failed to process, with the reason
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncFileError {
    pub path: String,
    pub reason: String,
}

/// Record of one metadata sync run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataSyncLog {
    pub id: i64,
    pub release_id: Option<i64>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: SyncStatus,
    pub files_scanned: i64,
    pub files_failed: i64,
    pub tests_upserted: i64,
    pub tests_unchanged: i64,
    pub error_details: Vec<SyncFileError>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for status in [
            TestStatus::Passed,
            TestStatus::Failed,
            TestStatus::Skipped,
            TestStatus::Error,
        ] {
            let parsed: TestStatus = status.as_str().parse().expect("round trip");
            assert_eq!(parsed, status);
        }
        assert!("passed".parse::<TestStatus>().is_err());
    }

    #[test]
    fn test_metadata_content_comparison() {
        let base = MetadataContent {
            test_class_name: Some("TestRouting".to_string()),
            module: Some("routing".to_string()),
            topology: Some("dual".to_string()),
            test_state: TestState::Prod,
            test_case_id: None,
            testrail_id: Some("C42".to_string()),
            priority: Some("P1".to_string()),
            test_path: Some("tests/routing/test_bgp.py".to_string()),
        };
        let mut other = base.clone();
        assert_eq!(base, other);
        other.priority = Some("P0".to_string());
        assert_ne!(base, other);
    }
}

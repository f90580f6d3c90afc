//! Failure clustering by normalized error fingerprint
//!
//! The fingerprint is the first non-blank line of a stack trace with hex
//! addresses and bare numbers masked, so the same crash site clusters
//! together across differing line numbers and pointers. Tests without a
//! stack trace share the empty-string bucket.

use lazy_static::lazy_static;
use regex::{Captures, Regex};

use crate::types::{ClusteredFailures, FailureCluster};

lazy_static! {
    /// Hex literals first: leftmost-first alternation keeps `\d+` from
    /// splitting `0x1234` into two masks.
    #[allow(clippy::expect_used)] // literal pattern always compiles
    static ref MASK_REGEX: Regex =
        Regex::new(r"0[xX][0-9a-fA-F]+|\d+").expect("mask regex");
}

/// Compute the cluster fingerprint of one stack trace
///
/// Empty or missing traces fingerprint to the empty string.
pub fn fingerprint(stack_trace: Option<&str>) -> String {
    let Some(trace) = stack_trace else {
        return String::new();
    };

    let Some(first_line) = trace.lines().map(str::trim).find(|l| !l.is_empty()) else {
        return String::new();
    };

    MASK_REGEX
        .replace_all(first_line, |caps: &Captures| {
            let matched = caps.get(0).map_or("", |m| m.as_str());
            if matched.starts_with("0x") || matched.starts_with("0X") {
                "0xN"
            } else {
                "N"
            }
        })
        .into_owned()
}

/// Paging and narrowing knobs for cluster queries
#[derive(Debug, Clone, Copy)]
pub struct ClusterParams {
    pub min_cluster_size: usize,
    pub limit: usize,
    pub skip: usize,
}

impl Default for ClusterParams {
    fn default() -> Self {
        Self {
            min_cluster_size: 1,
            limit: 50,
            skip: 0,
        }
    }
}

/// Group failed tests into clusters, largest first
///
/// `total_failed` always counts every input row; `min_cluster_size`,
/// `skip` and `limit` only narrow the returned clusters.
pub fn cluster_failures(
    failures: Vec<(String, Option<String>)>,
    params: ClusterParams,
) -> ClusteredFailures {
    let total_failed = failures.len();

    let mut buckets: std::collections::HashMap<String, Vec<String>> =
        std::collections::HashMap::new();
    for (test_name, stack_trace) in failures {
        buckets
            .entry(fingerprint(stack_trace.as_deref()))
            .or_default()
            .push(test_name);
    }

    let mut clusters: Vec<FailureCluster> = buckets
        .into_iter()
        .map(|(fingerprint, mut tests)| {
            tests.sort();
            FailureCluster {
                fingerprint,
                size: tests.len(),
                tests,
            }
        })
        .collect();

    // Deterministic order: size descending, fingerprint as tiebreaker
    clusters.sort_by(|a, b| b.size.cmp(&a.size).then_with(|| a.fingerprint.cmp(&b.fingerprint)));

    let clusters = clusters
        .into_iter()
        .filter(|c| c.size >= params.min_cluster_size)
        .skip(params.skip)
        .take(params.limit)
        .collect();

    ClusteredFailures {
        total_failed,
        clusters,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_masks_numbers_and_hex() {
        assert_eq!(
            fingerprint(Some("at x.py:12 0xABCD")),
            "at x.py:N 0xN".to_string()
        );
        assert_eq!(
            fingerprint(Some("at x.py:34 0x1234")),
            "at x.py:N 0xN".to_string()
        );
        assert_eq!(fingerprint(Some("at y.py:7 0xBEEF")), "at y.py:N 0xN");
    }

    #[test]
    fn test_fingerprint_uses_first_non_blank_line() {
        let trace = "\n   \nTypeError: bad value 42\n  at frame 1\n";
        assert_eq!(fingerprint(Some(trace)), "TypeError: bad value N");
    }

    #[test]
    fn test_fingerprint_empty_trace() {
        assert_eq!(fingerprint(None), "");
        assert_eq!(fingerprint(Some("   \n  ")), "");
    }

    #[test]
    fn test_clustering_matches_masked_lines() {
        // Three traces collapse onto "at x.py:N 0xN", two onto "at y.py:N 0xN"
        let failures = vec![
            ("t1".to_string(), Some("at x.py:12 0xABCD".to_string())),
            ("t2".to_string(), Some("at x.py:34 0x1234".to_string())),
            ("t3".to_string(), Some("at y.py:7 0xBEEF".to_string())),
            ("t4".to_string(), Some("at x.py:12 0x5555".to_string())),
            ("t5".to_string(), Some("at y.py:7 0xDEAD".to_string())),
        ];

        let result = cluster_failures(failures, ClusterParams::default());
        assert_eq!(result.total_failed, 5);
        assert_eq!(result.clusters.len(), 2);

        let first = result.clusters.first().expect("first");
        assert_eq!(first.size, 3);
        assert_eq!(first.fingerprint, "at x.py:N 0xN");
        assert_eq!(first.tests, vec!["t1", "t2", "t4"]);

        let second = result.clusters.get(1).expect("second");
        assert_eq!(second.size, 2);
        assert_eq!(second.fingerprint, "at y.py:N 0xN");
    }

    #[test]
    fn test_cluster_narrowing_keeps_total() {
        let failures = vec![
            ("t1".to_string(), Some("line a 1".to_string())),
            ("t2".to_string(), Some("line a 2".to_string())),
            ("t3".to_string(), Some("line b 1".to_string())),
        ];

        let result = cluster_failures(
            failures,
            ClusterParams {
                min_cluster_size: 2,
                limit: 10,
                skip: 0,
            },
        );
        assert_eq!(result.total_failed, 3);
        assert_eq!(result.clusters.len(), 1);
        assert_eq!(result.clusters.first().expect("one").size, 2);
    }

    #[test]
    fn test_missing_traces_share_one_bucket() {
        let failures = vec![
            ("t1".to_string(), None),
            ("t2".to_string(), None),
            ("t3".to_string(), Some("boom".to_string())),
        ];

        let result = cluster_failures(failures, ClusterParams::default());
        let empty = result
            .clusters
            .iter()
            .find(|c| c.fingerprint.is_empty())
            .expect("empty bucket");
        assert_eq!(empty.size, 2);
    }
}

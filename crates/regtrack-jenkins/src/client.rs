//! Authenticated Jenkins REST client
//!
//! Retrieves build lists, build maps, display names and test artifacts.
//! All GETs are idempotent; transient failures (connection errors, 5xx)
//! get one retry with exponential backoff. Credentials come from process
//! configuration and are never persisted.

use std::collections::BTreeMap;
use std::time::Duration;

use futures::TryStreamExt;
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use tokio::io::AsyncRead;
use tokio_util::io::StreamReader;
use tracing::{debug, warn};

use regtrack_config::JenkinsConfig;

use crate::error::{JenkinsError, JenkinsResult};

/// Artifact carrying the module → build-number map of a parent build
const BUILD_MAP_ARTIFACT: &str = "artifact/build_map.json";
/// Artifact carrying the JUnit results of a module build
const TEST_RESULTS_ARTIFACT: &str = "artifact/test-results.xml";

/// Total attempts per idempotent GET (one retry)
const MAX_ATTEMPTS: u32 = 2;

lazy_static! {
    /// Version token mined from build display names
    #[allow(clippy::expect_used)] // literal pattern always compiles
    static ref VERSION_REGEX: Regex =
        Regex::new(r"\d+\.\d+\.\d+\.\d+").expect("version regex");
}

#[derive(Debug, Deserialize)]
struct BuildList {
    #[serde(default)]
    builds: Vec<BuildRef>,
}

#[derive(Debug, Deserialize)]
struct BuildRef {
    number: i64,
}

#[derive(Debug, Deserialize)]
struct DisplayName {
    #[serde(rename = "displayName", default)]
    display_name: String,
}

/// Jenkins REST client
#[derive(Clone)]
pub struct JenkinsClient {
    http: reqwest::Client,
    config: JenkinsConfig,
}

impl JenkinsClient {
    /// Build a client from the process configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying HTTP client cannot be
    /// constructed.
    pub fn new(config: JenkinsConfig) -> JenkinsResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .build()
            .map_err(|e| JenkinsError::Request {
                url: config.base_url.clone(),
                message: format!("client construction failed: {e}"),
            })?;

        Ok(Self { http, config })
    }

    /// Build numbers strictly greater than `min_build`, ascending
    ///
    /// # Errors
    ///
    /// Returns an error after the retry budget is exhausted, or when the
    /// response body does not decode.
    pub async fn list_builds(&self, job_url: &str, min_build: i64) -> JenkinsResult<Vec<i64>> {
        let url = format!("{}/api/json?tree=builds[number]", job_url.trim_end_matches('/'));
        let response = self.get_with_retry(&url).await?;

        let list: BuildList = response
            .json()
            .await
            .map_err(|e| JenkinsError::Decode {
                url: url.clone(),
                message: e.to_string(),
            })?;

        let mut builds: Vec<i64> = list
            .builds
            .into_iter()
            .map(|b| b.number)
            .filter(|n| *n > min_build)
            .collect();
        builds.sort_unstable();
        builds.dedup();

        debug!(job_url, min_build, count = builds.len(), "listed builds");
        Ok(builds)
    }

    /// Module name → module build number for one parent build
    ///
    /// A missing or undecodable map is fatal for that build; the caller
    /// must not advance past it.
    ///
    /// # Errors
    ///
    /// Returns an error on HTTP failure or when the artifact is not a JSON
    /// object of integers.
    pub async fn get_build_map(
        &self,
        job_url: &str,
        build_number: i64,
    ) -> JenkinsResult<BTreeMap<String, i64>> {
        let url = format!(
            "{}/{build_number}/{BUILD_MAP_ARTIFACT}",
            job_url.trim_end_matches('/')
        );
        let response = self.get_with_retry(&url).await?;

        response.json().await.map_err(|e| JenkinsError::Decode {
            url: url.clone(),
            message: e.to_string(),
        })
    }

    /// Stream the JUnit artifact of one module build
    ///
    /// The body is exposed as an `AsyncRead` so the parser can consume it
    /// incrementally; nothing is buffered beyond transport chunks.
    ///
    /// # Errors
    ///
    /// Returns an error on HTTP failure. Read errors after the header
    /// surface through the returned reader.
    pub async fn get_artifact(
        &self,
        job_url: &str,
        build_number: i64,
    ) -> JenkinsResult<impl AsyncRead + Send + Unpin + use<>> {
        let url = format!(
            "{}/{build_number}/{TEST_RESULTS_ARTIFACT}",
            job_url.trim_end_matches('/')
        );
        let response = self.get_with_retry(&url).await?;

        let stream = response.bytes_stream().map_err(std::io::Error::other);
        Ok(StreamReader::new(stream))
    }

    /// Display name of one build (version token mined by the caller)
    ///
    /// # Errors
    ///
    /// Returns an error on HTTP failure or an undecodable body.
    pub async fn get_display_name(&self, job_url: &str, build_number: i64) -> JenkinsResult<String> {
        let url = format!(
            "{}/{build_number}/api/json?tree=displayName",
            job_url.trim_end_matches('/')
        );
        let response = self.get_with_retry(&url).await?;

        let name: DisplayName = response.json().await.map_err(|e| JenkinsError::Decode {
            url: url.clone(),
            message: e.to_string(),
        })?;

        Ok(name.display_name)
    }

    /// Extract the dotted version token from a display name
    pub fn extract_version(display_name: &str) -> Option<String> {
        VERSION_REGEX
            .find(display_name)
            .map(|m| m.as_str().to_string())
    }

    /// One authenticated GET with a single retry on transient failure
    async fn get_with_retry(&self, url: &str) -> JenkinsResult<reqwest::Response> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.get_once(url).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_transient() && attempt < MAX_ATTEMPTS => {
                    let backoff = Duration::from_millis(
                        self.config.retry_backoff_ms.saturating_mul(1u64 << attempt),
                    );
                    warn!(url, attempt, ?backoff, error = %e, "transient CI failure, retrying");
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn get_once(&self, url: &str) -> JenkinsResult<reqwest::Response> {
        let response = self
            .http
            .get(url)
            .basic_auth(&self.config.user, Some(&self.config.api_token))
            .send()
            .await
            .map_err(|e| JenkinsError::from_reqwest(url, &e))?;

        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            Err(JenkinsError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            })
        }
    }
}

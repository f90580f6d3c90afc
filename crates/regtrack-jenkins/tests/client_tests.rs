//! Jenkins client integration tests against a mock CI server

use tokio::io::AsyncReadExt;
use wiremock::matchers::{basic_auth, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use regtrack_config::JenkinsConfig;
use regtrack_jenkins::{JenkinsClient, JenkinsError};

fn test_config(base_url: &str) -> JenkinsConfig {
    JenkinsConfig {
        base_url: base_url.to_string(),
        user: "ci-bot".to_string(),
        api_token: "t0ken".to_string(),
        request_timeout_seconds: 5,
        // Keep retries fast in tests
        retry_backoff_ms: 10,
    }
}

#[tokio::test]
async fn list_builds_filters_and_sorts() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/job/regression/api/json"))
        .and(query_param("tree", "builds[number]"))
        .and(basic_auth("ci-bot", "t0ken"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "builds": [
                {"number": 14}, {"number": 11}, {"number": 13}, {"number": 12}, {"number": 9}
            ]
        })))
        .mount(&server)
        .await;

    let client = JenkinsClient::new(test_config(&server.uri())).expect("client");
    let job_url = format!("{}/job/regression", server.uri());

    let builds = client.list_builds(&job_url, 11).await.expect("builds");
    assert_eq!(builds, vec![12, 13, 14]);
}

#[tokio::test]
async fn list_builds_retries_once_on_5xx() {
    let server = MockServer::start().await;

    // First hit fails with 503, mounted ahead so it matches first
    Mock::given(method("GET"))
        .and(path("/job/regression/api/json"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/job/regression/api/json"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({"builds": [{"number": 12}]})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let client = JenkinsClient::new(test_config(&server.uri())).expect("client");
    let job_url = format!("{}/job/regression", server.uri());

    let builds = client.list_builds(&job_url, 0).await.expect("builds");
    assert_eq!(builds, vec![12]);
}

#[tokio::test]
async fn persistent_5xx_exhausts_retry_budget() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/job/regression/api/json"))
        .respond_with(ResponseTemplate::new(500))
        // One initial attempt plus exactly one retry
        .expect(2)
        .mount(&server)
        .await;

    let client = JenkinsClient::new(test_config(&server.uri())).expect("client");
    let job_url = format!("{}/job/regression", server.uri());

    let err = client.list_builds(&job_url, 0).await.expect_err("must fail");
    assert!(matches!(err, JenkinsError::HttpStatus { status: 500, .. }));
}

#[tokio::test]
async fn missing_build_map_is_http_status() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/job/regression/13/artifact/build_map.json"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let client = JenkinsClient::new(test_config(&server.uri())).expect("client");
    let job_url = format!("{}/job/regression", server.uri());

    let err = client.get_build_map(&job_url, 13).await.expect_err("must fail");
    assert!(matches!(err, JenkinsError::HttpStatus { status: 404, .. }));
    assert!(!err.is_transient());
}

#[tokio::test]
async fn build_map_decodes_modules() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/job/regression/12/artifact/build_map.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "routing": 451, "qos": 389, "platform": 502
        })))
        .mount(&server)
        .await;

    let client = JenkinsClient::new(test_config(&server.uri())).expect("client");
    let job_url = format!("{}/job/regression", server.uri());

    let map = client.get_build_map(&job_url, 12).await.expect("map");
    assert_eq!(map.len(), 3);
    assert_eq!(map.get("routing"), Some(&451));
}

#[tokio::test]
async fn artifact_streams_body() {
    let server = MockServer::start().await;
    let body = r#"<testsuite><testcase name="test_ok" time="0.1"/></testsuite>"#;

    Mock::given(method("GET"))
        .and(path("/job/regression/12/artifact/test-results.xml"))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .mount(&server)
        .await;

    let client = JenkinsClient::new(test_config(&server.uri())).expect("client");
    let job_url = format!("{}/job/regression", server.uri());

    let mut reader = client.get_artifact(&job_url, 12).await.expect("artifact");
    let mut received = String::new();
    reader.read_to_string(&mut received).await.expect("read");
    assert_eq!(received, body);
}

#[tokio::test]
async fn display_name_and_version_token() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/job/regression/12/api/json"))
        .and(query_param("tree", "displayName"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({"displayName": "#12 build 6.1.0.17"})),
        )
        .mount(&server)
        .await;

    let client = JenkinsClient::new(test_config(&server.uri())).expect("client");
    let job_url = format!("{}/job/regression", server.uri());

    let name = client.get_display_name(&job_url, 12).await.expect("name");
    assert_eq!(JenkinsClient::extract_version(&name).as_deref(), Some("6.1.0.17"));
}

use apitoolkit_testing::{default_metadata, MockBackend, MockResponse};
use http::StatusCode;
use serde_json::{json, Value};
use std::time::Duration;

#[tokio::test]
async fn test_serves_client_metadata() {
    let backend = MockBackend::start().await;

    let client = reqwest::Client::new();
    let resp = client
        .get(format!("{}/api/client_metadata", backend.base_url()))
        .bearer_auth("test-key")
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body, default_metadata());

    let requests = backend.metadata_requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].headers["authorization"], "Bearer test-key");
}

#[tokio::test]
async fn test_metadata_status_override() {
    let backend = MockBackend::start()
        .await
        .respond_to_metadata(MockResponse::new().status(StatusCode::UNAUTHORIZED));

    let resp = reqwest::get(format!("{}/api/client_metadata", backend.base_url()))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_records_published_messages() {
    let backend = MockBackend::start().await;

    let client = reqwest::Client::new();
    let resp = client
        .post(format!(
            "{}/v1/projects/p/topics/t:publish",
            backend.base_url()
        ))
        .bearer_auth("ya29.token")
        // {"a":1} and "hi"
        .json(&json!({"messages": [{"data": "eyJhIjoxfQ=="}, {"data": "ImhpIg=="}]}))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body, json!({"messageIds": ["1", "2"]}));

    let published = backend.wait_for_published(2, Duration::from_secs(1)).await;
    assert_eq!(published.len(), 2);
    assert_eq!(published[0].topic, "projects/p/topics/t");
    assert_eq!(published[0].json::<Value>().unwrap(), json!({"a": 1}));
    assert_eq!(published[1].data, br#""hi""#);
    assert_eq!(published[1].authorization.as_deref(), Some("Bearer ya29.token"));
}

#[tokio::test]
async fn test_rejects_bad_message_data() {
    let backend = MockBackend::start().await;

    let resp = reqwest::Client::new()
        .post(format!("{}/v1/projects/p/topics/t:publish", backend.base_url()))
        .json(&json!({"messages": [{"data": "%%%"}]}))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert!(backend.published().is_empty());
}

#[tokio::test]
async fn test_unmatched_requests_are_recorded() {
    let backend = MockBackend::start().await;

    let resp = reqwest::get(format!("{}/elsewhere", backend.base_url()))
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    let unmatched = backend.unmatched_requests();
    assert_eq!(unmatched.len(), 1);
    assert_eq!(unmatched[0].path, "/elsewhere");
}

#[tokio::test]
async fn test_recorded_request_fields() {
    let backend = MockBackend::start().await;

    reqwest::Client::new()
        .put(format!("{}/elsewhere?x=1", backend.base_url()))
        .header("x-trace", "t-1")
        .body("payload")
        .send()
        .await
        .unwrap();

    let recorded = &backend.unmatched_requests()[0];
    assert_eq!(recorded.method, http::Method::PUT);
    assert_eq!(recorded.path, "/elsewhere");
    assert_eq!(recorded.headers["x-trace"], "t-1");
    assert_eq!(recorded.body, "payload");
}

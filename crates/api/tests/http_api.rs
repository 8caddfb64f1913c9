//! Black-box tests against the HTTP surface, wired in-memory.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use tower::ServiceExt;

use filescan_api::app;
use filescan_api::config::Config;

const BOUNDARY: &str = "filescan-test-boundary";
const SAMPLE: &str = "AAABBBCCC Hello World AAABBBCCC";

async fn test_app(storage_dir: &std::path::Path) -> Router {
    let mut config = Config::from_env();
    config.use_persistent_stores = false;
    config.file_storage_path = storage_dir.to_path_buf();
    config.max_upload_bytes = 1024;

    let services = Arc::new(app::services::build_services(config).await.unwrap());
    app::build_app(services)
}

fn multipart_upload(filename: &str, content: &str) -> Request<Body> {
    let body = format!(
        "--{BOUNDARY}\r\n\
         Content-Disposition: form-data; name=\"file\"; filename=\"{filename}\"\r\n\
         Content-Type: text/plain\r\n\r\n\
         {content}\r\n\
         --{BOUNDARY}--\r\n"
    );
    Request::builder()
        .method("POST")
        .uri("/api/v1/files")
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(body))
        .unwrap()
}

async fn json_body(response: axum::response::Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

async fn get(app: &Router, uri: &str) -> axum::response::Response {
    app.clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap()
}

/// Poll the status endpoint until the job reaches a terminal state.
async fn await_terminal(app: &Router, job_id: &str) -> serde_json::Value {
    for _ in 0..100 {
        let response = get(app, &format!("/api/v1/files/{job_id}")).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        match body["status"].as_str() {
            Some("completed") | Some("failed") => return body,
            _ => tokio::time::sleep(Duration::from_millis(100)).await,
        }
    }
    panic!("job {job_id} never reached a terminal state");
}

#[tokio::test(flavor = "multi_thread")]
async fn upload_poll_and_dedup_flow() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_app(dir.path()).await;

    // First upload: new work.
    let response = app.clone().oneshot(multipart_upload("sample.txt", SAMPLE)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["deduplication"], false);
    assert_eq!(body["status"], "pending");
    let job_id = body["job_id"].as_str().unwrap().to_string();

    // Poll to completion (the in-process worker picks it up).
    let done = await_terminal(&app, &job_id).await;
    assert_eq!(done["status"], "completed");
    assert_eq!(done["original_filename"], "sample.txt");
    assert_eq!(done["results"]["A"], 6);
    assert_eq!(done["results"]["B"], 6);
    assert_eq!(done["results"]["C"], 6);
    assert_eq!(done["results"]["H"], 1);
    assert_eq!(done["results"]["W"], 1);
    assert_eq!(done["results"]["Z"], 0);

    // Identical bytes again: dedup hit with the result inline.
    let response = app.clone().oneshot(multipart_upload("other-name.txt", SAMPLE)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["deduplication"], true);
    assert_eq!(body["status"], "completed");
    assert_eq!(body["results"]["A"], 6);
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_and_malformed_job_ids() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_app(dir.path()).await;

    let response = get(&app, "/api/v1/files/0192b2f0-0000-7000-8000-000000000000").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = json_body(response).await;
    assert_eq!(body["error"], "not_found");

    let response = get(&app, "/api/v1/files/not-a-uuid").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test(flavor = "multi_thread")]
async fn oversized_upload_is_rejected_with_413() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_app(dir.path()).await;

    let big = "x".repeat(4096);
    let response = app.clone().oneshot(multipart_upload("big.txt", &big)).await.unwrap();
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    let body = json_body(response).await;
    assert_eq!(body["error"], "payload_too_large");
}

#[tokio::test(flavor = "multi_thread")]
async fn upload_without_file_field_is_a_bad_request() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_app(dir.path()).await;

    let body = format!(
        "--{BOUNDARY}\r\n\
         Content-Disposition: form-data; name=\"other\"\r\n\r\n\
         hello\r\n\
         --{BOUNDARY}--\r\n"
    );
    let request = Request::builder()
        .method("POST")
        .uri("/api/v1/files")
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(body))
        .unwrap();

    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test(flavor = "multi_thread")]
async fn health_reports_dependencies_and_queue() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_app(dir.path()).await;

    let response = get(&app, "/health").await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["database"], "healthy");
    assert_eq!(body["redis"], "healthy");
    assert!(body["storage"]["total_bytes"].as_u64().unwrap() > 0);
    assert!(body["queue"]["stream_length"].is_u64());
}

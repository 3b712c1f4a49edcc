// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::Router;
use parking_lot::Mutex;

use protocol::{InvocationResponse, InvocationSpec};

use crate::runtime::RuntimeClient;

#[derive(Default)]
struct Platform {
    responses: Mutex<Vec<(String, InvocationResponse)>>,
    errors: Mutex<Vec<(String, String)>>,
}

async fn next_invocation() -> (HeaderMap, String) {
    let mut headers = HeaderMap::new();
    headers.insert("Lambda-Runtime-Aws-Request-Id", "req-1".parse().unwrap());
    let spec = InvocationSpec {
        args: vec!["echo".to_owned(), "hi".to_owned()],
        ..InvocationSpec::default()
    };
    (headers, serde_json::to_string(&spec).unwrap())
}

async fn record_response(
    State(platform): State<Arc<Platform>>,
    Path(id): Path<String>,
    body: String,
) {
    let response = serde_json::from_str(&body).unwrap();
    platform.responses.lock().push((id, response));
}

async fn record_error(
    State(platform): State<Arc<Platform>>,
    Path(id): Path<String>,
    body: String,
) {
    platform.errors.lock().push((id, body));
}

async fn serve_platform(platform: Arc<Platform>) -> String {
    let app = Router::new()
        .route("/2018-06-01/runtime/invocation/next", get(next_invocation))
        .route(
            "/2018-06-01/runtime/invocation/:id/response",
            post(record_response),
        )
        .route(
            "/2018-06-01/runtime/invocation/:id/error",
            post(record_error),
        )
        .with_state(platform);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let _server = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

#[tokio::test]
async fn fetches_the_next_job_with_its_correlation_id() {
    let endpoint = serve_platform(Arc::new(Platform::default())).await;
    let client = RuntimeClient::new(&endpoint);

    let job = client.next().await.unwrap();
    assert_eq!(job.request_id, "req-1");
    assert_eq!(job.spec.args, vec!["echo".to_owned(), "hi".to_owned()]);
}

#[tokio::test]
async fn posts_responses_against_the_job_id() {
    let platform = Arc::new(Platform::default());
    let endpoint = serve_platform(platform.clone()).await;
    let client = RuntimeClient::new(&endpoint);

    let response = InvocationResponse {
        status: 0,
        ..InvocationResponse::default()
    };
    client.post_response("req-1", &response).await.unwrap();

    let recorded = platform.responses.lock();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].0, "req-1");
    assert_eq!(recorded[0].1.status, 0);
}

#[tokio::test]
async fn posts_structured_errors() {
    let platform = Arc::new(Platform::default());
    let endpoint = serve_platform(platform.clone()).await;
    let client = RuntimeClient::new(&endpoint);

    client.post_error("req-9", "sandbox exploded").await.unwrap();

    let recorded = platform.errors.lock();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].0, "req-9");
    assert!(recorded[0].1.contains("sandbox exploded"));
}

#[tokio::test]
async fn an_unreachable_platform_is_an_error() {
    let client = RuntimeClient::new("http://127.0.0.1:1");
    assert!(client.next().await.is_err());
}

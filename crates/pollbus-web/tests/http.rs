//! HTTP surface tests driven through the router without a listener.

use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use pollbus_core::{BusConfig, Channel, Dispatcher};
use pollbus_web::{create_router, state::AppState};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower::ServiceExt;

fn app() -> (Router, Arc<Dispatcher>) {
    let bus = Arc::new(Dispatcher::new(BusConfig::default()));
    (create_router(AppState::new(Arc::clone(&bus))), bus)
}

fn post(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn call(app: &Router, req: Request<Body>) -> (StatusCode, Vec<u8>) {
    let response = app.clone().oneshot(req).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, bytes.to_vec())
}

async fn call_json(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let (status, bytes) = call(app, req).await;
    (status, serde_json::from_slice(&bytes).unwrap())
}

#[tokio::test]
async fn test_send_assigns_increasing_ids() {
    let (app, _) = app();
    let (status, body) =
        call_json(&app, post("/longpolling/send", json!({"channel": "c1", "message": "m1"}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"id": 1}));

    let (_, body) = call_json(
        &app,
        post("/longpolling/send", json!({"channel": "c2", "message": {"k": [1, 2]}})),
    )
    .await;
    assert_eq!(body, json!({"id": 2}));
}

#[tokio::test]
async fn test_send_rejects_non_string_channel() {
    let (app, bus) = app();
    let (status, body) =
        call(&app, post("/longpolling/send", json!({"channel": ["c", 1], "message": 1}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(
        String::from_utf8(body).unwrap(),
        "bus.Bus only string channels are allowed."
    );
    assert_eq!(bus.store().last_id(), 0);
}

#[tokio::test]
async fn test_poll_returns_backlog_in_order() {
    let (app, _) = app();
    call(&app, post("/longpolling/send", json!({"channel": "c1", "message": "m1"}))).await;
    call(&app, post("/longpolling/send", json!({"channel": "c2", "message": "m2"}))).await;

    let (status, body) = call_json(
        &app,
        post("/longpolling/poll", json!({"channels": ["c1", "c2"], "last": 0})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        json!([
            {"id": 1, "channel": "c1", "message": "m1"},
            {"id": 2, "channel": "c2", "message": "m2"}
        ])
    );
}

#[tokio::test]
async fn test_poll_rejects_non_string_channel() {
    let (app, _) = app();
    let (status, _) = call(
        &app,
        post("/longpolling/poll", json!({"channels": ["ok", 5], "last": 0})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_poll_times_out_with_empty_list() {
    let (app, _) = app();
    let started = Instant::now();
    let (status, body) = call_json(
        &app,
        post("/longpolling/poll", json!({"channels": ["idle"], "last": 0, "timeout": 1})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!([]));
    assert!(started.elapsed() >= Duration::from_secs(1));
}

#[tokio::test]
async fn test_pending_poll_wakes_on_send() {
    let (app, bus) = app();
    let poller = {
        let app = app.clone();
        tokio::spawn(async move {
            call_json(
                &app,
                post("/longpolling/poll", json!({"channels": ["live"], "last": 0, "timeout": 10})),
            )
            .await
        })
    };
    while bus.registry().listeners(&Channel::new("live").unwrap()) == 0 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    call(&app, post("/longpolling/send", json!({"channel": "live", "message": "hi"}))).await;
    let (status, body) = tokio::time::timeout(Duration::from_secs(2), poller)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!([{"id": 1, "channel": "live", "message": "hi"}]));
}

#[tokio::test]
async fn test_poll_after_shutdown_is_unavailable() {
    let (app, bus) = app();
    bus.shutdown();
    let (status, _) = call(
        &app,
        post("/longpolling/poll", json!({"channels": ["c"], "last": 0, "timeout": 1})),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_health_reports_stats() {
    let (app, _) = app();
    call(&app, post("/longpolling/send", json!({"channel": "c", "message": 1}))).await;
    let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let (status, body) = call_json(&app, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["last_id"], json!(1));
    assert_eq!(body["retained"], json!(1));
    assert_eq!(body["consumers"], json!(0));
}

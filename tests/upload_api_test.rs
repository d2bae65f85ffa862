use axum::{
    Router,
    body::Body,
    extract::connect_info::MockConnectInfo,
    http::{Request, StatusCode, header},
};
use bytes::Bytes;
use futures::{StreamExt, stream};
use http_body_util::BodyExt;
use rust_file_ingest::config::{IngestConfig, ScanMode, parse_route_timeouts};
use rust_file_ingest::services::bus::InMemoryBus;
use rust_file_ingest::services::scanner::NoOpScanner;
use rust_file_ingest::services::storage::MemoryObjectStorage;
use rust_file_ingest::utils::hash::calculate_hash;
use rust_file_ingest::{AppState, create_app};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use tower::ServiceExt;

const CHROME: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0 Safari/537.36";
const FIREFOX: &str = "Mozilla/5.0 (X11; Linux x86_64; rv:127.0) Gecko/20100101 Firefox/127.0";

fn setup(config: IngestConfig) -> (Router, AppState, Arc<MemoryObjectStorage>) {
    let storage = Arc::new(MemoryObjectStorage::new());
    let state = AppState::new(
        config,
        storage.clone(),
        Arc::new(NoOpScanner),
        Arc::new(InMemoryBus::new()),
    );
    let app = create_app(state.clone())
        .layer(MockConnectInfo(SocketAddr::from(([203, 0, 113, 9], 41000))));
    (app, state, storage)
}

fn upload(path: &str, body: &'static str, user_agent: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(format!("/upload/{}", path))
        .header(header::CONTENT_LENGTH, body.len())
        .header(header::USER_AGENT, user_agent)
        .body(Body::from(body))
        .unwrap()
}

async fn json(response: axum::response::Response) -> Value {
    let body = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&body).unwrap()
}

#[tokio::test]
async fn test_upload_flow() {
    let (app, state, storage) = setup(IngestConfig::development());

    let response = app
        .clone()
        .oneshot(upload("invoices/2024/march.pdf", "%PDF-1.7 fake invoice", FIREFOX))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::CREATED);
    assert!(response.headers().contains_key("x-request-id"));
    let json = json(response).await;
    assert_eq!(json["status"], "committed");
    assert_eq!(json["path"], "invoices/2024/march.pdf");
    assert_eq!(json["size"], 21);
    assert_eq!(json["sha256"], calculate_hash(b"%PDF-1.7 fake invoice"));
    assert_eq!(json["scan"], "VERIFIED");
    assert_eq!(json["scan_outcome"]["detected"], false);

    assert!(storage.contains("invoices/2024/march.pdf"));
    assert!(state.monitor().is_empty());
}

#[tokio::test]
async fn test_chromium_replay_is_rejected() {
    let (app, _state, storage) = setup(IngestConfig::development());

    let first = app
        .clone()
        .oneshot(upload("a.txt", "same payload", CHROME))
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::CREATED);

    let replay = app
        .clone()
        .oneshot(upload("a-copy.txt", "same payload", CHROME))
        .await
        .unwrap();
    assert_eq!(replay.status(), StatusCode::CONFLICT);
    assert!(json(replay).await["error"].is_string());
    assert!(!storage.contains("a-copy.txt"));

    // Other agents are not treated as replays
    let firefox = app
        .clone()
        .oneshot(upload("b.txt", "same payload", FIREFOX))
        .await
        .unwrap();
    assert_eq!(firefox.status(), StatusCode::CREATED);
}

#[tokio::test]
async fn test_deadline_returns_request_timeout() {
    let config = IngestConfig {
        route_timeouts: parse_route_timeouts("/upload/*path=100"),
        scan_mode: ScanMode::Disabled,
        ..IngestConfig::development()
    };
    let (app, state, storage) = setup(config);

    let stalled = stream::iter(vec![Ok::<_, std::io::Error>(Bytes::from_static(b"partial"))])
        .chain(stream::pending());
    let request = Request::builder()
        .method("POST")
        .uri("/upload/slow/video.mp4")
        .header(header::USER_AGENT, FIREFOX)
        .body(Body::from_stream(stalled))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::REQUEST_TIMEOUT);
    assert_eq!(response.headers()[header::CONNECTION], "close");
    assert_eq!(response.headers()[header::CACHE_CONTROL], "no-store");

    assert!(storage.was_aborted("slow/video.mp4"));
    assert!(!storage.contains("slow/video.mp4"));
    assert!(state.monitor().is_empty());
}

#[tokio::test]
async fn test_rejects_traversal_and_oversized_uploads() {
    let config = IngestConfig {
        max_file_size: 8,
        ..IngestConfig::development()
    };
    let (app, _state, _storage) = setup(config);

    let response = app
        .clone()
        .oneshot(upload("docs/../../etc/passwd", "x", FIREFOX))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .clone()
        .oneshot(upload("big.bin", "more than eight bytes", FIREFOX))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn test_health() {
    let (app, _state, _storage) = setup(IngestConfig::development());
    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = json(response).await;
    assert_eq!(json["status"], "ok");
    assert_eq!(json["scanner"], "healthy");
    assert_eq!(json["scan_mode"], "inline");
    assert_eq!(json["active_sessions"], 0);
}

//! Drives the router in-process with `tower::ServiceExt::oneshot`.

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use chrono::{Duration, TimeZone, Utc};
use http_body_util::BodyExt;
use piedpiper_auth::{derive_token_id, PasswordPolicy, TokenPolicy};
use piedpiper_files::{LocalBlobStore, MemoryBlobStore};
use piedpiper_rpc::{build_router, AppState, Services};
use piedpiper_storage::{KvStore, MemoryStore};
use piedpiper_types::{Clock, ManualClock, Timestamp};
use serde_json::{json, Value};
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;

struct TestApp {
    router: Router,
    clock: Arc<ManualClock>,
}

impl TestApp {
    fn with_blobs(blobs: Arc<dyn piedpiper_files::BlobStore>) -> Self {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 5, 10, 9, 0, 0).unwrap(),
        ));
        let services = Services::new(
            store,
            blobs,
            clock.clone(),
            PasswordPolicy::insecure_fast(),
            TokenPolicy::default(),
        );
        Self {
            router: build_router(AppState::new(services, 1024)),
            clock,
        }
    }

    fn new() -> Self {
        Self::with_blobs(Arc::new(MemoryBlobStore::new()))
    }

    async fn send(&self, request: Request<Body>) -> (StatusCode, Vec<u8>) {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, body.to_vec())
    }

    async fn json(&self, method: Method, uri: &str, body: Value) -> (StatusCode, Vec<u8>) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        self.send(request).await
    }

    async fn raw(&self, method: Method, uri: &str, body: &'static [u8]) -> (StatusCode, Vec<u8>) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::from(body))
            .unwrap();
        self.send(request).await
    }

    async fn get(&self, uri: &str) -> (StatusCode, Vec<u8>) {
        self.send(Request::get(uri).body(Body::empty()).unwrap()).await
    }

    fn now(&self) -> String {
        Timestamp::from_datetime(self.clock.now()).to_string()
    }

    /// Registers and authenticates, returning the hex token id.
    async fn login(&self, username: &str, password: &str) -> String {
        let (status, _) = self
            .json(
                Method::POST,
                "/user",
                json!({"username": username, "password": password}),
            )
            .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = self
            .json(
                Method::POST,
                "/auth",
                json!({"username": username, "password": password, "reqdate": self.now()}),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        let response: Value = serde_json::from_slice(&body).unwrap();
        let nonce = response["nonce"].as_str().unwrap();
        let expiration = Timestamp::parse(response["expdate"].as_str().unwrap()).unwrap();
        derive_token_id(username, nonce, &expiration).to_hex()
    }

    async fn create(&self, token: &str, filename: &str) -> String {
        let (status, body) = self
            .json(
                Method::POST,
                "/object",
                json!({"token": token, "filename": filename}),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        String::from_utf8(body).unwrap()
    }
}

fn error_message(body: &[u8]) -> String {
    let value: Value = serde_json::from_slice(body).unwrap();
    value["error"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn test_alice_round_trip() {
    let app = TestApp::new();
    let token = app.login("alice", "pw1").await;

    let upload_id = app.create(&token, "notes.txt").await;
    assert_eq!(upload_id, "1");

    let (status, _) = app
        .raw(Method::PUT, &format!("/object/{upload_id}"), b"hello")
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = app
        .get(&format!("/object?token={token}&filename=notes.txt"))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"hello");

    let (status, body) = app.get(&format!("/objects?token={token}")).await;
    assert_eq!(status, StatusCode::OK);
    let listed: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(listed, json!([{"id": 1, "name": "notes.txt"}]));
}

#[tokio::test]
async fn test_file_backed_fetch_streams_bytes() {
    let dir = TempDir::new().unwrap();
    let app = TestApp::with_blobs(Arc::new(LocalBlobStore::new(dir.path()).unwrap()));
    let token = app.login("alice", "pw1").await;
    let upload_id = app.create(&token, "photo.jpg").await;
    app.raw(Method::POST, &format!("/object/{upload_id}"), b"\x89binary")
        .await;

    let (status, body) = app
        .get(&format!("/object?token={token}&filename=photo.jpg"))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"\x89binary");
}

#[tokio::test]
async fn test_registration_conflict_and_bad_json() {
    let app = TestApp::new();
    app.login("alice", "pw1").await;

    let (status, body) = app
        .json(
            Method::POST,
            "/user",
            json!({"username": "alice", "password": "x"}),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(error_message(&body).contains("alice"));

    let (status, _) = app
        .json(Method::POST, "/user", json!({"username": "bob"}))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = app.raw(Method::POST, "/user", b"{not json").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_authentication_failures() {
    let app = TestApp::new();
    app.login("alice", "pw1").await;

    let (status, _) = app
        .json(
            Method::POST,
            "/auth",
            json!({"username": "alice", "password": "wrong", "reqdate": app.now()}),
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = app
        .json(
            Method::POST,
            "/auth",
            json!({"username": "alice", "password": "pw1", "reqdate": "soon"}),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let stale = Timestamp::from_datetime(app.clock.now() - Duration::seconds(301)).to_string();
    let (status, _) = app
        .json(
            Method::POST,
            "/auth",
            json!({"username": "alice", "password": "pw1", "reqdate": stale}),
        )
        .await;
    assert_eq!(status, StatusCode::EXPECTATION_FAILED);
}

#[tokio::test]
async fn test_token_failures() {
    let app = TestApp::new();
    let token = app.login("alice", "pw1").await;

    let (status, body) = app
        .json(
            Method::POST,
            "/object",
            json!({"token": "00".repeat(64), "filename": "a"}),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(error_message(&body), "invalid token");

    app.clock.advance(Duration::hours(144) + Duration::seconds(1));
    let (status, _) = app
        .json(
            Method::PUT,
            "/object",
            json!({"token": token, "filename": "a"}),
        )
        .await;
    assert_eq!(status, StatusCode::PRECONDITION_FAILED);
}

#[tokio::test]
async fn test_upload_and_fetch_failures() {
    let app = TestApp::new();
    let token = app.login("alice", "pw1").await;
    let upload_id = app.create(&token, "draft.txt").await;

    let (status, _) = app
        .get(&format!("/object?token={token}&filename=draft.txt"))
        .await;
    assert_eq!(status, StatusCode::PRECONDITION_FAILED);

    let (status, _) = app
        .get(&format!("/object?token={token}&filename=missing.txt"))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = app.raw(Method::POST, "/object/0", b"x").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (status, _) = app.raw(Method::POST, "/object/abc", b"x").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (status, _) = app.raw(Method::POST, "/object/999", b"x").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let uri = format!("/object/{upload_id}");
    assert_eq!(app.raw(Method::POST, &uri, b"v1").await.0, StatusCode::OK);
    assert_eq!(app.raw(Method::POST, &uri, b"v2").await.0, StatusCode::NOT_FOUND);

    let (status, _) = app.get("/object?filename=draft.txt").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_upload_body_limit() {
    let app = TestApp::new();
    let token = app.login("alice", "pw1").await;
    let upload_id = app.create(&token, "big.bin").await;

    let request = Request::builder()
        .method(Method::POST)
        .uri(format!("/object/{upload_id}"))
        .body(Body::from(vec![0u8; 2048]))
        .unwrap();
    let (status, _) = app.send(request).await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn test_health_counts_requests() {
    let app = TestApp::new();
    app.get("/health").await;
    let (status, body) = app.get("/health").await;
    assert_eq!(status, StatusCode::OK);
    let health: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["req_total"], 2);
}

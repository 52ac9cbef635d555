use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::body::{Body, Bytes};
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{DefaultBodyLimit, Path, Query, State};
use axum::http::{header, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use axum_server::tls_rustls::RustlsConfig;
use piedpiper_auth::{PasswordPolicy, TokenPolicy, TokenService, UserDirectory};
use piedpiper_catalog::{ObjectCatalog, UploadSessionManager};
use piedpiper_files::{BlobHandle, BlobStore};
use piedpiper_storage::KvStore;
use piedpiper_types::{Clock, ObjectId, TokenResponse, UploadId};
use serde::{Deserialize, Serialize};
use tower::ServiceExt;
use tower_http::services::ServeFile;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use crate::error::ApiError;

/// The core components, wired to one store.
#[derive(Clone)]
pub struct Services {
    pub users: Arc<UserDirectory>,
    pub tokens: Arc<TokenService>,
    pub uploads: Arc<UploadSessionManager>,
    pub catalog: Arc<ObjectCatalog>,
}

impl Services {
    pub fn new(
        store: Arc<dyn KvStore>,
        blobs: Arc<dyn BlobStore>,
        clock: Arc<dyn Clock>,
        passwords: PasswordPolicy,
        token_policy: TokenPolicy,
    ) -> Self {
        let users = Arc::new(UserDirectory::new(Arc::clone(&store), passwords));
        let tokens = Arc::new(TokenService::new(
            Arc::clone(&store),
            Arc::clone(&users),
            clock,
            token_policy,
        ));
        let uploads = Arc::new(UploadSessionManager::new(Arc::clone(&store), blobs));
        let catalog = Arc::new(ObjectCatalog::new(
            store,
            Arc::clone(&users),
            Arc::clone(&tokens),
            Arc::clone(&uploads),
        ));
        Self {
            users,
            tokens,
            uploads,
            catalog,
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub services: Services,
    pub start_time: Instant,
    pub req_count: Arc<AtomicUsize>,
    pub max_upload_bytes: usize,
}

impl AppState {
    pub fn new(services: Services, max_upload_bytes: usize) -> Self {
        Self {
            services,
            start_time: Instant::now(),
            req_count: Arc::new(AtomicUsize::new(0)),
            max_upload_bytes,
        }
    }

    fn record_request(&self) -> u64 {
        self.req_count.fetch_add(1, Ordering::Relaxed) as u64 + 1
    }

    fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

type SharedState = Arc<AppState>;

#[derive(Debug, Deserialize)]
struct RegisterRequest {
    username: String,
    password: String,
}

#[derive(Debug, Deserialize)]
struct AuthRequest {
    username: String,
    password: String,
    reqdate: String,
}

#[derive(Debug, Deserialize)]
struct CreateObjectRequest {
    token: String,
    filename: String,
}

#[derive(Debug, Deserialize)]
struct FetchQuery {
    token: String,
    filename: String,
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    token: String,
}

#[derive(Debug, Serialize)]
struct ObjectSummary {
    id: ObjectId,
    name: String,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_secs: u64,
    req_total: u64,
}

/// How long open connections may take to finish once shutdown starts in TLS mode.
const TLS_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// PEM files for serving HTTPS directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsFiles {
    pub fullchain: PathBuf,
    pub privatekey: PathBuf,
}

impl TlsFiles {
    /// Parses the certificate chain and private key.
    pub async fn load(&self) -> Result<RustlsConfig> {
        RustlsConfig::from_pem_file(&self.fullchain, &self.privatekey)
            .await
            .with_context(|| {
                format!(
                    "failed to load TLS certificate {} and key {}",
                    self.fullchain.display(),
                    self.privatekey.display()
                )
            })
    }
}

/// Serves until `shutdown` resolves. With `tls` set the listener speaks HTTPS only.
pub async fn start_server(
    state: AppState,
    addr: &str,
    tls: Option<TlsFiles>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let app = build_router(state);
    let tls_config = match &tls {
        Some(files) => Some(files.load().await?),
        None => None,
    };
    let listener = bind_listener(addr).await?;
    let local_addr = listener.local_addr()?;

    let Some(tls_config) = tls_config else {
        info!("HTTP server listening on {}", local_addr);
        return axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
            .context("HTTP server terminated unexpectedly");
    };

    info!("HTTPS server listening on {}", local_addr);
    let handle = axum_server::Handle::new();
    let trigger = handle.clone();
    tokio::spawn(async move {
        shutdown.await;
        trigger.graceful_shutdown(Some(TLS_SHUTDOWN_GRACE));
    });

    let listener = listener
        .into_std()
        .context("failed to hand listener to the TLS acceptor")?;
    axum_server::from_tcp_rustls(listener, tls_config)
        .handle(handle)
        .serve(app.into_make_service())
        .await
        .context("HTTPS server terminated unexpectedly")
}

async fn bind_listener(addr: &str) -> Result<tokio::net::TcpListener> {
    if let Ok(socket_addr) = addr.parse::<SocketAddr>() {
        tokio::net::TcpListener::bind(socket_addr)
            .await
            .with_context(|| format!("failed to bind HTTP listener on {socket_addr}"))
    } else {
        tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind HTTP listener on {addr}"))
    }
}

pub fn build_router(state: AppState) -> Router {
    let body_limit = state.max_upload_bytes;
    Router::new()
        .route("/health", get(handle_health))
        .route("/user", post(handle_register))
        .route("/auth", post(handle_authenticate))
        .route(
            "/object",
            get(handle_fetch_object)
                .post(handle_create_object)
                .put(handle_create_object),
        )
        .route(
            "/object/:upload_id",
            post(handle_upload).put(handle_upload),
        )
        .route("/objects", get(handle_list_objects))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(state))
}

/// Runs a synchronous core call on the blocking pool.
async fn run_blocking<T, E, F>(f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> std::result::Result<T, E> + Send + 'static,
    T: Send + 'static,
    E: Into<ApiError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|err| ApiError::internal(format!("blocking task failed: {err}")))?
        .map_err(Into::into)
}

async fn handle_health(State(state): State<SharedState>) -> Json<HealthResponse> {
    let req_total = state.record_request();
    Json(HealthResponse {
        status: "ok",
        uptime_secs: state.uptime_seconds(),
        req_total,
    })
}

async fn handle_register(
    State(state): State<SharedState>,
    payload: std::result::Result<Json<RegisterRequest>, JsonRejection>,
) -> Result<StatusCode, ApiError> {
    state.record_request();
    let Json(request) = payload?;
    let users = Arc::clone(&state.services.users);
    run_blocking(move || users.create_user(&request.username, &request.password)).await?;
    Ok(StatusCode::OK)
}

async fn handle_authenticate(
    State(state): State<SharedState>,
    payload: std::result::Result<Json<AuthRequest>, JsonRejection>,
) -> Result<Json<TokenResponse>, ApiError> {
    state.record_request();
    let Json(request) = payload?;
    let tokens = Arc::clone(&state.services.tokens);
    let response = run_blocking(move || {
        tokens.authenticate(&request.username, &request.password, &request.reqdate)
    })
    .await?;
    Ok(Json(response))
}

async fn handle_create_object(
    State(state): State<SharedState>,
    payload: std::result::Result<Json<CreateObjectRequest>, JsonRejection>,
) -> Result<String, ApiError> {
    state.record_request();
    let Json(request) = payload?;
    let catalog = Arc::clone(&state.services.catalog);
    let upload_id =
        run_blocking(move || catalog.create_object(&request.token, &request.filename)).await?;
    Ok(upload_id.to_string())
}

async fn handle_upload(
    State(state): State<SharedState>,
    Path(raw_id): Path<String>,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    state.record_request();
    let upload_id = parse_upload_id(&raw_id)?;
    let uploads = Arc::clone(&state.services.uploads);
    run_blocking(move || uploads.upload(upload_id, &body)).await?;
    Ok(StatusCode::OK)
}

async fn handle_fetch_object(
    State(state): State<SharedState>,
    query: std::result::Result<Query<FetchQuery>, QueryRejection>,
    req: Request<Body>,
) -> Result<Response, ApiError> {
    state.record_request();
    let Query(query) = query?;
    let catalog = Arc::clone(&state.services.catalog);
    let (object, handle) =
        run_blocking(move || catalog.open_object(&query.token, &query.filename)).await?;
    debug!("Serving object {} ({} bytes)", object.id, handle.len());

    match handle {
        BlobHandle::File { path, .. } => {
            let response = ServeFile::new(path)
                .oneshot(req)
                .await
                .map_err(ApiError::internal)?;
            Ok(response.into_response())
        }
        BlobHandle::Bytes(bytes) => Ok((
            [(header::CONTENT_TYPE, "application/octet-stream")],
            Bytes::copy_from_slice(&bytes),
        )
            .into_response()),
    }
}

async fn handle_list_objects(
    State(state): State<SharedState>,
    query: std::result::Result<Query<ListQuery>, QueryRejection>,
) -> Result<Json<Vec<ObjectSummary>>, ApiError> {
    state.record_request();
    let Query(query) = query?;
    let catalog = Arc::clone(&state.services.catalog);
    let objects = run_blocking(move || catalog.list_objects(&query.token)).await?;
    Ok(Json(
        objects
            .into_iter()
            .map(|object| ObjectSummary {
                id: object.id,
                name: object.name,
            })
            .collect(),
    ))
}

fn parse_upload_id(raw: &str) -> Result<UploadId, ApiError> {
    match raw.parse::<u64>() {
        Ok(0) | Err(_) => Err(ApiError::bad_request(format!("invalid upload id {raw:?}"))),
        Ok(id) => Ok(UploadId(id)),
    }
}

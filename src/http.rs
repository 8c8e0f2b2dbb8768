//! HTTP surface of the broker.
//!
//! | Route                           | Effect                                   |
//! |---------------------------------|------------------------------------------|
//! | `GET /api/websocket`            | agent connection (WebSocket upgrade)     |
//! | `GET /api/printer/sessions`     | live session ids                         |
//! | `GET /api/printer/info`         | cached status of one session             |
//! | `POST /api/command/{command}`   | route one command to one session         |
//! | `POST /api/command/load`        | route `LOAD` for an uploaded file        |
//! | `GET/POST /api/gcodes`          | list / upload G-code files               |
//! | `GET /api/gcodes/{id}/download` | raw file bytes, fetched by agents        |
//!
//! Command endpoints answer once the envelope is queued for the session's
//! writer. A success means "accepted for delivery", never "executed": the
//! agent may still reject the command as busy, and clients learn the
//! outcome only by polling `/api/printer/info`.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{DefaultBodyLimit, Path, Query, State};
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, MethodRouter};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::broker::connection::serve_agent;
use crate::broker::{SessionBroker, SessionId};
use crate::config::BrokerConfig;
use crate::error::{RouteError, StoreError};
use crate::protocol::{AgentInfo, Envelope, LoadFile, RequestType};
use crate::store::{FileRecord, FileStore, MemoryStore};

/// G-code files are much larger than axum's default body limit.
const MAX_UPLOAD_BYTES: usize = 64 * 1024 * 1024;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub broker: Arc<SessionBroker>,
    pub store: Arc<dyn FileStore>,
    pub config: Arc<BrokerConfig>,
}

impl AppState {
    pub fn new(config: BrokerConfig, store: Arc<dyn FileStore>) -> Self {
        let broker = SessionBroker::new(config.route_timeout, config.channel_capacity);
        Self {
            broker: Arc::new(broker),
            store,
            config: Arc::new(config),
        }
    }

    /// Where agents download the file with record id `id`.
    pub fn download_url(&self, id: &str) -> String {
        format!("{}/api/gcodes/{id}/download", self.config.public_url)
    }
}

/// Success body shape the web client expects.
#[derive(Debug, Serialize)]
pub struct Payload<T> {
    pub payload: T,
}

impl<T> Payload<T> {
    pub fn new(payload: T) -> Json<Self> {
        Json(Self { payload })
    }
}

#[derive(Debug, Deserialize)]
pub struct SessionRequest {
    #[serde(alias = "sessionId")]
    pub session_id: SessionId,
}

#[derive(Debug, Deserialize)]
pub struct LoadRequest {
    #[serde(alias = "sessionId")]
    pub session_id: SessionId,
    #[serde(alias = "fileId")]
    pub file_id: String,
}

#[derive(Debug, Deserialize)]
pub struct UploadQuery {
    pub name: String,
}

/// Handler failure, rendered as `{"error": "..."}`.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Route(#[from] RouteError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Route(RouteError::NotFound(_)) | Self::Store(StoreError::NotFound(_)) => {
                StatusCode::NOT_FOUND
            }
            Self::Route(RouteError::NotDelivered(_)) => StatusCode::SERVICE_UNAVAILABLE,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(e: serde_json::Error) -> Self {
        Self::Internal(e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!(error = %self, "Request failed");
        }
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

/// Build the broker application.
pub fn router(state: AppState) -> Result<Router> {
    let cors = build_cors(&state.config.allow_origins)?;

    Ok(Router::new()
        .route("/api/websocket", get(agent_socket))
        .route("/api/printer/sessions", get(list_sessions))
        .route("/api/printer/info", get(printer_info))
        .route("/api/command/levelbedtest", command(RequestType::LevelBed))
        .route("/api/command/autohome", command(RequestType::AutoHome))
        .route("/api/command/unlock", command(RequestType::UnlockPrinter))
        .route("/api/command/start", command(RequestType::Start))
        .route("/api/command/pause", command(RequestType::Pause))
        .route("/api/command/cancel", command(RequestType::Cancel))
        .route("/api/command/load", post(load_file))
        .route(
            "/api/gcodes",
            get(list_files)
                .post(upload_file)
                .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES)),
        )
        .route("/api/gcodes/{id}/download", get(download_file))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state))
}

/// Bind `config.listen` and serve until the process is stopped.
pub async fn serve(config: BrokerConfig) -> Result<()> {
    let listen = config.listen;
    let state = AppState::new(config, Arc::new(MemoryStore::new()));
    let app = router(state)?;

    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .with_context(|| format!("Failed to bind broker listener on {listen}"))?;

    info!(addr = %listen, "Broker listening");
    axum::serve(listener, app).await.context("Broker server failed")
}

fn build_cors(origins: &[String]) -> Result<CorsLayer> {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::ACCEPT]);

    if origins.is_empty() || origins.iter().any(|o| o == "*") {
        return Ok(cors.allow_origin(Any));
    }

    let mut headers = Vec::with_capacity(origins.len());
    for origin in origins {
        headers.push(
            HeaderValue::from_str(origin)
                .with_context(|| format!("Invalid allowed origin: {origin}"))?,
        );
    }
    Ok(cors.allow_origin(AllowOrigin::list(headers)))
}

async fn agent_socket(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let write_timeout = state.config.write_timeout;
    ws.on_upgrade(move |socket| serve_agent(state.broker, socket, write_timeout))
}

async fn list_sessions(State(state): State<AppState>) -> Json<Payload<Vec<SessionId>>> {
    Payload::new(state.broker.list_sessions().await)
}

async fn printer_info(
    State(state): State<AppState>,
    Query(query): Query<SessionRequest>,
) -> Result<Json<Payload<AgentInfo>>, ApiError> {
    let info = state.broker.get_status(&query.session_id).await?;
    Ok(Payload::new(info))
}

/// POST handler that routes a payload-free `kind` command.
fn command(kind: RequestType) -> MethodRouter<AppState> {
    post(
        move |State(state): State<AppState>, Json(body): Json<SessionRequest>| async move {
            state
                .broker
                .route_command(&body.session_id, Envelope::command(kind))
                .await?;
            Ok::<_, ApiError>(Payload::new("accepted"))
        },
    )
}

async fn load_file(
    State(state): State<AppState>,
    Json(body): Json<LoadRequest>,
) -> Result<Json<Payload<LoadFile>>, ApiError> {
    let record = state.store.find_record(&body.file_id).await?;
    let file = LoadFile {
        url: state.download_url(&record.id),
        id: record.id,
    };

    state
        .broker
        .route_command(&body.session_id, Envelope::load(&file)?)
        .await?;
    Ok(Payload::new(file))
}

async fn list_files(State(state): State<AppState>) -> Json<Payload<Vec<FileRecord>>> {
    Payload::new(state.store.list().await)
}

async fn upload_file(
    State(state): State<AppState>,
    Query(query): Query<UploadQuery>,
    body: Bytes,
) -> Result<(StatusCode, Json<Payload<FileRecord>>), ApiError> {
    let name = query.name.trim();
    if name.is_empty() {
        return Err(ApiError::BadRequest("file name must not be empty".into()));
    }

    let size = body.len() as u64;
    let blob_id = state.store.insert_blob(body).await;
    let record = state.store.insert_record(name, &blob_id, size).await;
    info!(file = %record.id, name = %record.name, bytes = size, "G-code uploaded");
    Ok((StatusCode::CREATED, Payload::new(record)))
}

async fn download_file(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let record = state.store.find_record(&id).await?;
    let blob = state.store.find_blob(&record.blob_id).await?;
    Ok(([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], blob))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> AppState {
        AppState::new(
            BrokerConfig {
                public_url: "http://printers.local:8080".into(),
                ..BrokerConfig::default()
            },
            Arc::new(MemoryStore::new()),
        )
    }

    #[test]
    fn error_statuses() {
        let cases = [
            (ApiError::Route(RouteError::NotFound("s".into())), 404),
            (ApiError::Route(RouteError::NotDelivered("s".into())), 503),
            (ApiError::Store(StoreError::NotFound("f".into())), 404),
            (ApiError::BadRequest("x".into()), 400),
            (ApiError::Internal("x".into()), 500),
        ];
        for (err, code) in cases {
            assert_eq!(err.status().as_u16(), code, "{err}");
        }
    }

    #[test]
    fn download_url_uses_public_base() {
        assert_eq!(
            state().download_url("abc"),
            "http://printers.local:8080/api/gcodes/abc/download"
        );
    }

    #[test]
    fn request_bodies_accept_camel_case_aliases() {
        let body: LoadRequest =
            serde_json::from_str(r#"{"sessionId": "s1", "fileId": "f1"}"#).unwrap();
        assert_eq!(body.session_id, "s1");
        assert_eq!(body.file_id, "f1");

        let body: SessionRequest = serde_json::from_str(r#"{"session_id": "s2"}"#).unwrap();
        assert_eq!(body.session_id, "s2");
    }

    #[test]
    fn cors_rejects_bad_origin() {
        assert!(build_cors(&["*".into()]).is_ok());
        assert!(build_cors(&["http://localhost:3000".into()]).is_ok());
        assert!(build_cors(&["bad\norigin".into()]).is_err());
    }

    #[tokio::test]
    async fn load_unknown_file_is_not_found() {
        let state = state();
        let session = state.broker.register().await;
        let err = load_file(
            State(state.clone()),
            Json(LoadRequest {
                session_id: session.id,
                file_id: "missing".into(),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn load_routes_download_url_to_session() {
        let state = state();
        let mut session = state.broker.register().await;
        let blob = state.store.insert_blob(Bytes::from_static(b"G28\n")).await;
        let record = state.store.insert_record("home.gcode", &blob, 4).await;

        let Json(reply) = load_file(
            State(state.clone()),
            Json(LoadRequest {
                session_id: session.id.clone(),
                file_id: record.id.clone(),
            }),
        )
        .await
        .unwrap();

        let sent = session.to_agent.recv().await.unwrap();
        assert_eq!(sent.request_type, RequestType::Load);
        assert_eq!(sent.load_file().unwrap(), reply.payload);
        assert_eq!(reply.payload.url, state.download_url(&record.id));
    }

    #[tokio::test]
    async fn empty_upload_name_is_rejected() {
        let err = upload_file(
            State(state()),
            Query(UploadQuery { name: "  ".into() }),
            Bytes::new(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }
}

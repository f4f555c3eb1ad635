//! REST + websocket surface.
//!
//! CRUD routes sit behind bearer auth; the streaming endpoints are open so
//! workers can pull sources and push artifacts with plain HTTP, and the
//! websocket authenticates with a `token` query parameter.

use std::io;
use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::body::Body;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, Request, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use futures_util::TryStreamExt;
use serde::Deserialize;
use tokio::io::AsyncReadExt;
use tokio_util::io::{ReaderStream, StreamReader};
use tower_http::trace::TraceLayer;
use tracing::debug;
use uuid::Uuid;

use recodex_model::{Job, JobRequest, Worker};

use crate::errors::{ApiError, ApiResult};
use crate::scheduler::Scheduler;

const UPLOAD_CHUNK_SIZE: usize = 128 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub scheduler: Arc<Scheduler>,
    pub token: String,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState").finish_non_exhaustive()
    }
}

pub fn router(state: AppState) -> Router {
    let authed = Router::new()
        .route("/api/v1/job/", get(list_jobs).post(create_job))
        .route("/api/v1/job/{id}", get(get_job).delete(delete_job))
        .route("/api/v1/job/{id}/cancel", post(cancel_job))
        .route("/api/v1/workers/", get(list_workers))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_bearer,
        ));

    Router::new()
        .merge(authed)
        .route("/api/v1/job/{id}/download", get(download))
        .route("/api/v1/job/{id}/upload", post(upload))
        .route("/api/v1/job/{id}/checksum", get(checksum))
        .route("/ws/job", get(ws_job))
        .route("/-/healthy", get(healthy))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn require_bearer(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let authorized = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .is_some_and(|token| token == state.token);
    if !authorized {
        return ApiError::Unauthorized("invalid or missing bearer token").into_response();
    }
    next.run(request).await
}

async fn healthy() -> &'static str {
    "OK"
}

async fn create_job(
    State(state): State<AppState>,
    Json(request): Json<JobRequest>,
) -> ApiResult<Json<Job>> {
    let job = state.scheduler.schedule_job_request(&request).await?;
    Ok(Json(job))
}

#[derive(Debug, Deserialize)]
struct PageQuery {
    #[serde(default = "default_page")]
    page: u32,
    #[serde(default = "default_page_size")]
    page_size: u32,
}

fn default_page() -> u32 {
    1
}

fn default_page_size() -> u32 {
    20
}

async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<PageQuery>,
) -> ApiResult<Json<Vec<Job>>> {
    Ok(Json(state.scheduler.get_jobs(query.page, query.page_size).await?))
}

async fn get_job(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Json<Job>> {
    Ok(Json(state.scheduler.get_job(id).await?))
}

async fn delete_job(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<StatusCode> {
    state.scheduler.delete_job(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn cancel_job(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<StatusCode> {
    state.scheduler.cancel_job(id).await?;
    Ok(StatusCode::ACCEPTED)
}

async fn list_workers(State(state): State<AppState>) -> ApiResult<Json<Vec<Worker>>> {
    Ok(Json(state.scheduler.get_workers().await?))
}

async fn download(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Response> {
    let stream = state.scheduler.download_stream(id).await?;
    let headers = [
        (header::CONTENT_LENGTH, stream.size.to_string()),
        (
            header::CONTENT_DISPOSITION,
            format!("attachment; filename={}", stream.file_name),
        ),
    ];
    Ok((headers, Body::from_stream(ReaderStream::new(stream))).into_response())
}

async fn checksum(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<String> {
    Ok(state.scheduler.checksum(id).await?)
}

async fn upload(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    body: Body,
) -> ApiResult<StatusCode> {
    let declared_size: u64 = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse().ok())
        .ok_or(ApiError::MissingContentLength)?;
    let declared_checksum = headers
        .get("checksum")
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned)
        .ok_or(ApiError::MissingChecksum)?;

    let mut sink = state.scheduler.upload_sink(id).await?;
    let mut reader = StreamReader::new(body.into_data_stream().map_err(io::Error::other));
    let mut buffer = vec![0u8; UPLOAD_CHUNK_SIZE];
    loop {
        let read = match reader.read(&mut buffer).await {
            Ok(read) => read,
            Err(err) => {
                let _ = sink.discard().await;
                return Err(ApiError::UploadAborted(err));
            }
        };
        if read == 0 {
            break;
        }
        if let Err(err) = sink.write(&buffer[..read]).await {
            let _ = sink.discard().await;
            return Err(ApiError::Io(err));
        }
    }

    if sink.received() != declared_size {
        let received = sink.received();
        let _ = sink.discard().await;
        return Err(ApiError::SizeMismatch {
            expected: declared_size,
            received,
        });
    }
    let computed = sink.checksum();
    if computed != declared_checksum {
        let _ = sink.discard().await;
        return Err(ApiError::ChecksumMismatch {
            declared: declared_checksum,
            computed,
        });
    }

    sink.commit().await.map_err(ApiError::Io)?;
    debug!(job = %id, size = declared_size, "upload stored");
    Ok(StatusCode::CREATED)
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    #[serde(default)]
    token: String,
}

async fn ws_job(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<AppState>,
) -> Response {
    if query.token != state.token {
        return ApiError::Unauthorized("invalid token").into_response();
    }
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let (subscriber_id, mut updates) = state.scheduler.subscribe();
    debug!(subscriber = %subscriber_id, "websocket subscriber registered");

    loop {
        tokio::select! {
            update = updates.recv() => {
                let Some(update) = update else { break };
                let Ok(frame) = serde_json::to_string(&update) else { continue };
                if socket.send(Message::Text(frame.into())).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    _ => {}
                }
            }
        }
    }

    state.scheduler.unsubscribe(subscriber_id);
    debug!(subscriber = %subscriber_id, "websocket subscriber gone");
}

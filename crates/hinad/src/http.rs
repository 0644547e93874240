//! HTTP endpoints for the identification daemon.
//!
//! Endpoints:
//! - POST /upload       - classify an uploaded image (multipart field `file`)
//! - POST /v1/classify  - same as /upload
//! - POST /v1/reload    - re-read the gallery file
//! - GET  /v1/status    - gallery metadata
//! - GET  /v1/health    - liveness check

use crate::engine::EngineHandle;
use crate::error::ServiceError;
use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use hina_core::{BoundingBox, Classification, Gallery};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;

#[derive(Clone)]
pub struct AppState {
    pub engine: EngineHandle,
}

/// Build the router. Uploads larger than `max_upload_bytes` are rejected with 413.
pub fn router(engine: EngineHandle, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/upload", post(classify))
        .route("/v1/classify", post(classify))
        .route("/v1/reload", post(reload))
        .route("/v1/status", get(status))
        .route("/v1/health", get(health))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(CorsLayer::permissive())
        .with_state(AppState { engine })
}

// ── Request / Response types ────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct FaceBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

impl From<&BoundingBox> for FaceBox {
    fn from(b: &BoundingBox) -> Self {
        Self {
            x: b.x,
            y: b.y,
            width: b.width,
            height: b.height,
            confidence: b.confidence,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FaceJson {
    pub label: String,
    pub votes: usize,
    pub distance: Option<f32>,
    #[serde(rename = "box")]
    pub bbox: FaceBox,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ClassifyResponse {
    /// `ok` when at least one face was found, `no_faces` otherwise.
    pub status: String,
    pub faces: Vec<FaceJson>,
}

impl From<Classification> for ClassifyResponse {
    fn from(c: Classification) -> Self {
        let status = if c.faces.is_empty() { "no_faces" } else { "ok" };
        Self {
            status: status.to_string(),
            faces: c
                .faces
                .iter()
                .map(|f| FaceJson {
                    label: f.result.display_label().to_string(),
                    votes: f.result.votes,
                    distance: f.result.distance,
                    bbox: FaceBox::from(&f.bbox),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct IdentityCount {
    pub label: String,
    pub entries: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub version: String,
    pub gallery_id: String,
    pub created_at: String,
    pub model: String,
    pub dimension: usize,
    pub entries: usize,
    pub identities: Vec<IdentityCount>,
    pub tolerance: f32,
}

impl StatusResponse {
    fn new(gallery: &Gallery, tolerance: f32) -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            gallery_id: gallery.id().to_string(),
            created_at: gallery.created_at().to_string(),
            model: gallery.model_version().to_string(),
            dimension: gallery.dimension(),
            entries: gallery.len(),
            identities: gallery
                .identities()
                .into_iter()
                .map(|(label, entries)| IdentityCount {
                    label: label.to_string(),
                    entries,
                })
                .collect(),
            tolerance,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
}

// ── Handlers ────────────────────────────────────────────────────────

async fn classify(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<ClassifyResponse>, ServiceError> {
    let mut upload = None;
    while let Some(field) = multipart.next_field().await? {
        if field.name() == Some("file") {
            upload = Some(field.bytes().await?);
            break;
        }
    }
    let bytes = upload.ok_or(ServiceError::MissingFile)?;
    tracing::debug!(bytes = bytes.len(), "classify request");

    let classification = state.engine.classify(bytes.to_vec()).await?;
    Ok(Json(ClassifyResponse::from(classification)))
}

async fn reload(State(state): State<AppState>) -> Result<Json<StatusResponse>, ServiceError> {
    state.engine.reload().await?;
    let status = state.engine.status().await?;
    Ok(Json(StatusResponse::new(&status.gallery, status.tolerance)))
}

async fn status(State(state): State<AppState>) -> Result<Json<StatusResponse>, ServiceError> {
    let status = state.engine.status().await?;
    Ok(Json(StatusResponse::new(&status.gallery, status.tolerance)))
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

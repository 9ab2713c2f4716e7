use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::{StatusCode, header},
    response::IntoResponse,
    routing::{get, post},
};
use serde::Deserialize;
use tracing::error;

use crate::{
    app_state::AppState,
    vault::{VaultError, sanitize_name},
};

// Room for multipart boundaries, headers and the tags field
const MULTIPART_OVERHEAD: usize = 64 * 1024;

#[derive(Deserialize)]
pub struct ListParams {
    /// Substring matched against file names and tag names.
    pub q: Option<String>,
}

pub fn get_api_router(state: AppState) -> Router {
    let body_limit = state.vault.max_file_size() + MULTIPART_OVERHEAD;

    Router::new()
        .route("/upload", post(upload_file))
        .route("/files", get(list_files))
        .route("/files/{stored_name}", get(download_file))
        .route("/tags", get(list_tags))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

/// Maps engine errors onto HTTP statuses. Anything unexpected is logged here.
fn error_response(e: VaultError) -> (StatusCode, String) {
    match e {
        VaultError::Validation(msg) => (StatusCode::BAD_REQUEST, msg),
        VaultError::NotFound(_) => (StatusCode::NOT_FOUND, "File not found".to_string()),
        VaultError::BlobWrite { .. } => {
            error!(error = %e, "blob write failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                "Storage unavailable, try again later".to_string(),
            )
        }
        _ => {
            // Details such as blob paths stay in the log
            error!(error = %e, "request failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
            )
        }
    }
}

async fn upload_file(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let mut file = None;
    let mut tags = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?
    {
        let name = field.name().unwrap_or_default().to_string();

        match name.as_str() {
            "file" => {
                let file_name = field.file_name().unwrap_or_default().to_string();
                let mime = field
                    .content_type()
                    .unwrap_or("application/octet-stream")
                    .to_string();
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
                file = Some((file_name, mime, data));
            }
            "tags" => {
                let raw = field
                    .text()
                    .await
                    .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
                tags = Some(raw);
            }
            _ => {}
        }
    }

    let Some((file_name, mime, data)) = file else {
        return Err((StatusCode::BAD_REQUEST, "No file uploaded".to_string()));
    };

    let record = state
        .vault
        .ingest(&data, &file_name, &mime, tags.as_deref())
        .await
        .map_err(error_response)?;

    Ok((StatusCode::CREATED, Json(record)))
}

async fn list_files(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let files = match params.q {
        Some(query) => state.vault.search(&query),
        None => state.vault.list_files(),
    }
    .map_err(error_response)?;

    Ok(Json(files))
}

async fn download_file(
    State(state): State<AppState>,
    Path(stored_name): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let (record, data) = state
        .vault
        .retrieve_file(&stored_name)
        .await
        .map_err(error_response)?;

    Ok((
        [
            (header::CONTENT_TYPE, record.mime_type.as_str().to_string()),
            (
                header::CONTENT_DISPOSITION,
                content_disposition(&record.original_name),
            ),
        ],
        data,
    ))
}

async fn list_tags(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let tags = state.vault.list_tags().map_err(error_response)?;

    Ok(Json(tags))
}

// Original names are user input; only header-safe characters go in the value.
fn content_disposition(original_name: &str) -> String {
    format!("attachment; filename=\"{}\"", sanitize_name(original_name))
}

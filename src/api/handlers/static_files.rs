use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use std::sync::Arc;

use crate::api::response::ApiError;
use crate::object_store::ObjectStoreError;
use crate::AppState;

/// Serve the bytes of a completed upload by its stored key.
/// Route: GET {PUBLIC_BASE_PATH}/*key
///
/// In-progress uploads are never served, so readers cannot observe a
/// partially appended file.
pub async fn serve_upload(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> Result<Response, ApiError> {
    // Keys are `{id}_{filename}`; ids never contain '_'
    let id = key
        .split_once('_')
        .map(|(id, _)| id)
        .ok_or_else(|| ApiError::not_found("File not found"))?;

    let record = state
        .db
        .get_upload(id)
        .map_err(|e| ApiError::internal(e.to_string()))?
        .filter(|r| r.is_complete() && r.url == key)
        .ok_or_else(|| ApiError::not_found("File not found"))?;

    let data = state
        .engine
        .blobs()
        .get(&record.url)
        .await
        .map_err(|e| match e {
            ObjectStoreError::NotFound(_) | ObjectStoreError::InvalidKey(_) => {
                ApiError::not_found("File content not found")
            }
            _ => ApiError::internal(format!("Failed to retrieve file: {e}")),
        })?;

    let mime_type = mime_guess::from_path(&record.filename)
        .first_or_octet_stream()
        .to_string();

    let mut response = (StatusCode::OK, data).into_response();
    let headers = response.headers_mut();

    headers.insert(
        header::CONTENT_TYPE,
        mime_type
            .parse()
            .unwrap_or(header::HeaderValue::from_static("application/octet-stream")),
    );

    headers.insert(header::CONTENT_LENGTH, header::HeaderValue::from(record.size));

    if let Ok(value) = format!("inline; filename=\"{}\"", record.filename).parse() {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }

    // Completed uploads are immutable
    headers.insert(
        header::CACHE_CONTROL,
        header::HeaderValue::from_static("public, max-age=3600"),
    );

    Ok(response)
}

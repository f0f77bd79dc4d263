use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use std::sync::Arc;

use super::upload_error;
use crate::api::response::ApiError;
use crate::upload::{AppendChunk, CreateUpload};
use crate::AppState;

// ============================================================================
// Protocol constants
// ============================================================================

pub const TUS_VERSION: &str = "1.0.0";
const TUS_EXTENSIONS: &str = "creation,creation-with-upload,termination";
const OFFSET_CONTENT_TYPE: &str = "application/offset+octet-stream";

const TUS_RESUMABLE: HeaderName = HeaderName::from_static("tus-resumable");
const TUS_VERSION_HEADER: HeaderName = HeaderName::from_static("tus-version");
const TUS_EXTENSION: HeaderName = HeaderName::from_static("tus-extension");
const TUS_MAX_SIZE: HeaderName = HeaderName::from_static("tus-max-size");
const UPLOAD_OFFSET: HeaderName = HeaderName::from_static("upload-offset");
const UPLOAD_LENGTH: HeaderName = HeaderName::from_static("upload-length");
const UPLOAD_METADATA: HeaderName = HeaderName::from_static("upload-metadata");

// ============================================================================
// Handlers
// ============================================================================

/// Stamp every protocol response, including failures, with `Tus-Resumable`.
pub async fn tus_resumable(mut response: Response) -> Response {
    response
        .headers_mut()
        .insert(TUS_RESUMABLE, HeaderValue::from_static(TUS_VERSION));
    response
}

pub async fn tus_options(State(state): State<Arc<AppState>>) -> Response {
    (
        StatusCode::NO_CONTENT,
        [
            (TUS_VERSION_HEADER, TUS_VERSION.to_string()),
            (TUS_EXTENSION, TUS_EXTENSIONS.to_string()),
            (
                TUS_MAX_SIZE,
                state.config.upload.max_upload_size.to_string(),
            ),
        ],
    )
        .into_response()
}

/// Route: POST /files
pub async fn create_upload(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let upload_length = header_u64(&headers, &UPLOAD_LENGTH)?
        .ok_or_else(|| ApiError::bad_request("Upload-Length header is required"))?;
    let content_length =
        header_u64(&headers, &header::CONTENT_LENGTH)?.unwrap_or(body.len() as u64);
    let upload_metadata = headers
        .get(&UPLOAD_METADATA)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());

    let created = state
        .engine
        .create(CreateUpload {
            upload_length,
            upload_metadata,
            content_length,
            body,
        })
        .await
        .map_err(upload_error)?;

    Ok((
        StatusCode::CREATED,
        [
            (header::LOCATION, format!("/files/{}", created.id)),
            (UPLOAD_OFFSET, created.offset.to_string()),
        ],
    )
        .into_response())
}

/// Route: PATCH /files/:id
pub async fn upload_chunk(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if content_type != OFFSET_CONTENT_TYPE {
        return Err(ApiError::unsupported_media_type(format!(
            "Content-Type must be {OFFSET_CONTENT_TYPE}"
        )));
    }

    let upload_offset = header_u64(&headers, &UPLOAD_OFFSET)?
        .ok_or_else(|| ApiError::bad_request("Upload-Offset header is required"))?;
    let content_length = header_u64(&headers, &header::CONTENT_LENGTH)?
        .ok_or_else(|| ApiError::bad_request("Content-Length header is required"))?;

    let appended = state
        .engine
        .append_chunk(AppendChunk {
            upload_id: id,
            upload_offset,
            content_length,
            body,
        })
        .await
        .map_err(upload_error)?;

    Ok((
        StatusCode::NO_CONTENT,
        [(UPLOAD_OFFSET, appended.offset.to_string())],
    )
        .into_response())
}

/// Route: HEAD /files/:id
pub async fn upload_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let status = state.engine.status(&id).await.map_err(upload_error)?;

    Ok((
        StatusCode::OK,
        [
            (UPLOAD_OFFSET, status.offset.to_string()),
            (UPLOAD_LENGTH, status.size.to_string()),
            (header::CACHE_CONTROL, "no-store".to_string()),
        ],
    )
        .into_response())
}

/// Route: DELETE /files/:id
pub async fn delete_upload(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.engine.delete(&id).await.map_err(upload_error)?;
    Ok(StatusCode::NO_CONTENT)
}

// ============================================================================
// Helpers
// ============================================================================

fn header_u64(headers: &HeaderMap, name: &HeaderName) -> Result<Option<u64>, ApiError> {
    match headers.get(name) {
        None => Ok(None),
        Some(value) => value
            .to_str()
            .ok()
            .and_then(|s| s.trim().parse::<u64>().ok())
            .map(Some)
            .ok_or_else(|| {
                ApiError::bad_request(format!("{name} must be a non-negative integer"))
            }),
    }
}

use axum::extract::{Path, State};
use axum::Json;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use std::sync::Arc;

use super::upload_error;
use crate::api::response::{ApiError, AppJson, AppQuery, JSend, JSendPaginated, Pagination};
use crate::storage::models::{UploadRecord, UploadState};
use crate::AppState;

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct PhotoResponse {
    pub created_at: String,
    pub filename: String,
    pub id: String,
    pub offset: u64,
    pub report_id: Option<String>,
    pub size: u64,
    pub state: UploadState,
    pub updated_at: String,
    pub url: String,
}

#[derive(Debug, Serialize)]
pub struct DeletedPhotosResponse {
    pub deleted: u64,
}

#[derive(Debug, Deserialize)]
pub struct SetReportRequest {
    #[serde(default, deserialize_with = "nullable")]
    pub report_id: Option<Option<String>>,
}

#[derive(Debug, Deserialize)]
pub struct ListPhotosParams {
    #[serde(default = "default_limit")]
    pub limit: u32,
    #[serde(default)]
    pub offset: u32,
}

fn default_limit() -> u32 {
    20
}

/// Distinguishes between a missing field (`None`) and an explicit `null` (`Some(None)`).
fn nullable<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    T: DeserializeOwned,
    D: Deserializer<'de>,
{
    Ok(Some(Option::deserialize(deserializer)?))
}

// ============================================================================
// Handlers
// ============================================================================

pub async fn get_photo(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<JSend<PhotoResponse>>, ApiError> {
    let record = state.photos.get(&id).await.map_err(upload_error)?;
    Ok(JSend::success(photo_to_response(&state, &record)))
}

pub async fn delete_photo(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<JSend<()>>, ApiError> {
    state.photos.delete_photo(&id).await.map_err(upload_error)?;
    tracing::debug!(upload_id = %id, "Deleted photo");
    Ok(JSend::success(()))
}

/// Route: PUT /photos/:id/report
/// `{"report_id": "..."}` attaches, `{"report_id": null}` detaches.
pub async fn set_report(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    AppJson(req): AppJson<SetReportRequest>,
) -> Result<Json<JSend<PhotoResponse>>, ApiError> {
    let record = match req.report_id {
        None => return Err(ApiError::bad_request("report_id must be provided")),
        Some(Some(report_id)) => {
            if report_id.trim().is_empty() {
                return Err(ApiError::bad_request("report_id must not be empty"));
            }
            state.photos.attach_to_report(&id, &report_id).await
        }
        Some(None) => state.photos.detach_from_report(&id).await,
    }
    .map_err(upload_error)?;

    Ok(JSend::success(photo_to_response(&state, &record)))
}

pub async fn list_report_photos(
    State(state): State<Arc<AppState>>,
    Path(report_id): Path<String>,
    AppQuery(params): AppQuery<ListPhotosParams>,
) -> Result<Json<JSendPaginated<PhotoResponse>>, ApiError> {
    if params.limit == 0 {
        return Err(ApiError::bad_request("limit must be greater than 0"));
    }

    let photos = state
        .photos
        .photos_for_report(&report_id)
        .await
        .map_err(upload_error)?;

    let total = photos.len() as u64;
    let items: Vec<PhotoResponse> = photos
        .iter()
        .skip(params.offset as usize)
        .take(params.limit as usize)
        .map(|p| photo_to_response(&state, p))
        .collect();

    Ok(JSendPaginated::success(
        items,
        Pagination {
            limit: params.limit,
            offset: params.offset,
            total,
        },
    ))
}

pub async fn delete_report_photos(
    State(state): State<Arc<AppState>>,
    Path(report_id): Path<String>,
) -> Result<Json<JSend<DeletedPhotosResponse>>, ApiError> {
    let deleted = state
        .photos
        .delete_report_photos(&report_id)
        .await
        .map_err(upload_error)?;
    Ok(JSend::success(DeletedPhotosResponse { deleted }))
}

// ============================================================================
// Helpers
// ============================================================================

fn photo_to_response(state: &AppState, record: &UploadRecord) -> PhotoResponse {
    PhotoResponse {
        created_at: record.created_at.to_rfc3339(),
        filename: record.filename.clone(),
        id: record.id.clone(),
        offset: record.offset,
        report_id: record.report_id.clone(),
        size: record.size,
        state: record.state(),
        updated_at: record.updated_at.to_rfc3339(),
        url: state.photos.url_for(record),
    }
}

mod admin;
mod photos;
mod static_files;
mod tus;

use crate::api::response::ApiError;
use crate::upload::UploadError;

pub use admin::{admin_purge, health};
pub use photos::{delete_photo, delete_report_photos, get_photo, list_report_photos, set_report};
pub use static_files::serve_upload;
pub use tus::{create_upload, delete_upload, tus_options, tus_resumable, upload_chunk, upload_status};

/// Map an engine error to an ApiError. Server-side failures are logged in
/// full and reported to the client with a generic retry message.
fn upload_error(e: UploadError) -> ApiError {
    match e {
        UploadError::LengthMismatch { .. } => ApiError::bad_request(e.to_string()),
        UploadError::OffsetMismatch { .. } | UploadError::Incomplete(_) => {
            ApiError::conflict(e.to_string())
        }
        UploadError::NotFound(_) => ApiError::not_found(e.to_string()),
        UploadError::SizeExceeded { .. } => ApiError::payload_too_large(e.to_string()),
        UploadError::UploadBusy(_) => ApiError::locked(e.to_string()),
        UploadError::StorageWriteFailed(_)
        | UploadError::SizeVerificationFailed { .. }
        | UploadError::Record(_) => {
            tracing::error!(error = %e, "Upload operation failed");
            ApiError::internal("Upload failed, please retry")
        }
    }
}

//! Consistent JSON error responses.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use filescan_core::DomainError;
use filescan_infra::service::ScanError;

pub fn scan_error_to_response(err: ScanError) -> axum::response::Response {
    match err {
        ScanError::Domain(DomainError::PayloadTooLarge { limit }) => json_error(
            StatusCode::PAYLOAD_TOO_LARGE,
            "payload_too_large",
            format!("file too large, maximum size is {limit} bytes"),
        ),
        ScanError::Domain(DomainError::StorageExhausted { percent_used }) => json_error(
            StatusCode::INSUFFICIENT_STORAGE,
            "storage_exhausted",
            format!("storage at {percent_used:.1}%, uploads temporarily disabled"),
        ),
        ScanError::Domain(DomainError::NotFound(job_id)) => json_error(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("job not found: {job_id}"),
        ),
        ScanError::Domain(DomainError::InvalidId(msg)) => {
            json_error(StatusCode::BAD_REQUEST, "invalid_id", msg)
        }
        ScanError::Domain(e) => json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            e.to_string(),
        ),
        ScanError::Ledger(e) => json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "ledger_error",
            e.to_string(),
        ),
        ScanError::Queue(e) => {
            json_error(StatusCode::BAD_GATEWAY, "queue_error", e.to_string())
        }
        ScanError::Store(e) => json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "storage_error",
            e.to_string(),
        ),
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

//! HTTP routes and handlers.

use std::io;
use std::sync::Arc;

use axum::extract::{Extension, Multipart, Path};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use tokio_stream::StreamExt;
use tokio_util::io::StreamReader;
use tracing::error;

use filescan_core::JobId;

use crate::app::{dto, errors};
use crate::app::services::AppServices;

pub fn router() -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/api/v1/files", post(upload_file))
        .route("/api/v1/files/:job_id", get(job_status))
}

/// Upload a file for scanning. Multipart with a `file` field; responds with
/// a job id to poll, or the result directly on a dedup hit.
pub async fn upload_file(
    Extension(services): Extension<Arc<AppServices>>,
    mut multipart: Multipart,
) -> axum::response::Response {
    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => {
                return errors::json_error(
                    StatusCode::BAD_REQUEST,
                    "bad_request",
                    "multipart field 'file' is required",
                );
            }
            Err(e) => {
                return errors::json_error(StatusCode::BAD_REQUEST, "bad_request", e.to_string());
            }
        };
        if field.name() != Some("file") {
            continue;
        }

        let Some(filename) = field.file_name().map(str::to_owned).filter(|n| !n.is_empty())
        else {
            return errors::json_error(
                StatusCode::BAD_REQUEST,
                "bad_request",
                "no filename provided",
            );
        };

        let reader = StreamReader::new(
            field.map(|chunk| chunk.map_err(|e| io::Error::new(io::ErrorKind::Other, e))),
        );

        let upload_timeout = services.config.upload_timeout;
        return match tokio::time::timeout(upload_timeout, services.scanner.submit(reader, &filename))
            .await
        {
            Err(_) => errors::json_error(
                StatusCode::REQUEST_TIMEOUT,
                "upload_timeout",
                format!(
                    "upload took longer than {} seconds",
                    upload_timeout.as_secs()
                ),
            ),
            Ok(Err(e)) => errors::scan_error_to_response(e),
            Ok(Ok(submission)) => {
                let message = if submission.dedup {
                    "file already scanned, instant result".to_string()
                } else {
                    "file uploaded, processing started".to_string()
                };
                Json(dto::FileUploadResponse {
                    job_id: submission.job_id,
                    status: submission.status,
                    message,
                    deduplication: submission.dedup,
                    results: submission.results,
                })
                .into_response()
            }
        };
    }
}

/// Poll a job's status. Always a snapshot, never blocks on processing.
pub async fn job_status(
    Extension(services): Extension<Arc<AppServices>>,
    Path(job_id): Path<String>,
) -> axum::response::Response {
    let job_id: JobId = match job_id.parse() {
        Ok(id) => id,
        Err(_) => {
            return errors::json_error(
                StatusCode::BAD_REQUEST,
                "invalid_id",
                format!("not a job id: {job_id}"),
            );
        }
    };

    match services.scanner.status(job_id).await {
        Ok(snapshot) => Json(dto::JobStatusResponse::from(snapshot)).into_response(),
        Err(e) => errors::scan_error_to_response(e),
    }
}

/// Health of the service and its dependencies.
pub async fn health(
    Extension(services): Extension<Arc<AppServices>>,
) -> axum::response::Response {
    let database = match services.ledger.ping().await {
        Ok(()) => "healthy",
        Err(e) => {
            error!(error = %e, "ledger health check failed");
            "unhealthy"
        }
    };
    let redis = match services.cache.ping().await {
        Ok(()) => "healthy",
        Err(e) => {
            error!(error = %e, "cache health check failed");
            "unhealthy"
        }
    };

    let storage = match services.usage.usage() {
        Ok(usage) => Some(dto::StorageHealth {
            total_bytes: usage.total_bytes,
            used_bytes: usage.used_bytes(),
            percent_used: usage.percent_used(),
            tier: filescan_infra::retention::StorageTier::for_percent_used(usage.percent_used()),
        }),
        Err(e) => {
            error!(error = %e, "storage stats unavailable");
            None
        }
    };

    let queue = match services.queue.stats().await {
        Ok(stats) => dto::QueueHealth {
            status: "healthy",
            stream_length: stats.length,
            pending_count: stats.pending,
        },
        Err(e) => {
            error!(error = %e, "queue health check failed");
            dto::QueueHealth {
                status: "unhealthy",
                stream_length: 0,
                pending_count: 0,
            }
        }
    };

    let healthy = database == "healthy" && redis == "healthy";
    let body = dto::HealthResponse {
        status: if healthy { "healthy" } else { "degraded" },
        database,
        redis,
        storage,
        queue,
    };
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body)).into_response()
}

/// Service metadata.
pub async fn root() -> axum::response::Response {
    Json(serde_json::json!({
        "service": "filescan",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "upload": "POST /api/v1/files",
            "status": "GET /api/v1/files/{job_id}",
            "health": "GET /health",
        },
    }))
    .into_response()
}

//! HTTP request handlers.

use axum::{
    Json,
    body::{Body, Bytes},
    extract::{Multipart, Path, Query, State, multipart::MultipartError},
    http::{StatusCode, header},
    response::{Html, IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, instrument, warn};

use super::error::{ApiError, ApiResult};
use super::state::AppState;
use crate::imaging::LabelMap;
use crate::pipeline::{QueueStats, Task};
use crate::segmentation::{InputSource, SegmentationOutcome};
use crate::session::SessionId;

/// File name clients see for the result.
const DOWNLOAD_FILE_NAME: &str = "segmentation.nii";

static INDEX_HTML: &str = include_str!("index.html");

// ============================================================================
// Response types
// ============================================================================

/// Successful segmentation.
#[derive(Debug, Serialize)]
pub struct SegmentResponse {
    pub status: &'static str,
    pub session_id: String,
    pub download_url: String,
    pub segmentation_type: &'static str,
    pub label_map: LabelMap,
    pub task: Task,
    /// When the download link stops working.
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub sessions: usize,
    pub queue: QueueStats,
}

#[derive(Debug, Deserialize)]
pub struct DownloadQuery {
    pub token: Option<String>,
}

// ============================================================================
// Handlers
// ============================================================================

/// GET / - Upload form
pub async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

/// GET /health - Health check endpoint
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        sessions: state.sessions.len(),
        queue: state.segmentation.queue_stats(),
    })
}

/// POST /segment/ - Segment an uploaded scan
///
/// Multipart fields: `file` (required) and `image_type` (optional). `MR` in
/// any case selects the MR model; any other value, or no `image_type` field
/// at all, selects the default CT model (`total`).
#[instrument(skip_all)]
pub async fn segment(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> ApiResult<Json<SegmentResponse>> {
    let mut file: Option<Bytes> = None;
    let mut image_type: Option<String> = None;

    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field.name().map(str::to_owned);
        match name.as_deref() {
            Some("file") => {
                let data = field.bytes().await.map_err(multipart_error)?;
                debug!("Received upload ({} bytes)", data.len());
                file = Some(data);
            }
            Some("image_type") => {
                image_type = Some(field.text().await.map_err(multipart_error)?);
            }
            other => {
                debug!("Ignoring multipart field {:?}", other);
            }
        }
    }

    let file = file.ok_or_else(|| ApiError::bad_request("Missing 'file' field"))?;
    let task = requested_task(image_type.as_deref());

    let outcome = state
        .segmentation
        .segment(InputSource::Upload(file), task)
        .await?;
    respond(&state, outcome).map(Json)
}

/// GET /example/ - Segment the bundled example scan
#[instrument(skip_all)]
pub async fn example(State(state): State<AppState>) -> ApiResult<Json<SegmentResponse>> {
    let example = &state.config.example;
    let task = Task::from_image_type(&example.image_type);

    let outcome = state
        .segmentation
        .segment(InputSource::File(example.path.clone()), task)
        .await?;
    respond(&state, outcome).map(Json)
}

/// GET /download/{session_id}/segmentation.nii - Stream a result
pub async fn download(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<DownloadQuery>,
) -> ApiResult<Response> {
    let id: SessionId = session_id
        .parse()
        .map_err(|_| ApiError::not_found("Segmentation not found"))?;

    if state.config.download.require_token {
        state.signer.verify(query.token.as_deref(), &id)?;
    }

    let path = state.sessions.output_path(&id);
    let file = match fs::File::open(&path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ApiError::not_found("Segmentation not found"));
        }
        Err(e) => {
            warn!(session_id = %id, "Failed to open result: {}", e);
            return Err(ApiError::Filesystem("Server storage error".to_string()));
        }
    };
    let file_size = file
        .metadata()
        .await
        .map_err(|e| {
            warn!(session_id = %id, "Failed to stat result: {}", e);
            ApiError::Filesystem("Server storage error".to_string())
        })?
        .len();

    if let Err(e) = state.sessions.mark_delivered(&id) {
        debug!(session_id = %id, "Not tracking delivery: {}", e);
    }
    if state.config.storage.delete_after_download {
        // The open handle keeps the bytes readable.
        if let Err(e) = state.sessions.delete_session(&id).await {
            warn!(session_id = %id, "Failed to remove delivered session: {}", e);
        }
    }

    info!(session_id = %id, "Streaming result ({} bytes)", file_size);
    let body = Body::from_stream(ReaderStream::new(file));

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (header::CONTENT_LENGTH, file_size.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", DOWNLOAD_FILE_NAME),
            ),
        ],
        body,
    )
        .into_response())
}

// ============================================================================
// Helpers
// ============================================================================

fn respond(state: &AppState, outcome: SegmentationOutcome) -> ApiResult<SegmentResponse> {
    let id = outcome.session_id;
    let mut download_url = format!("/download/{}/{}", id, DOWNLOAD_FILE_NAME);

    // The link dies with the session or the token, whichever goes first.
    let ttl = chrono::Duration::from_std(state.config.storage.session_ttl())
        .map_err(|e| ApiError::internal(e.to_string()))?;
    let mut expires_at = Utc::now() + ttl;

    if state.config.download.require_token {
        let (token, token_expires_at) = state.signer.issue(&id)?;
        download_url.push_str("?token=");
        download_url.push_str(&token);
        expires_at = expires_at.min(token_expires_at);
    }

    Ok(SegmentResponse {
        status: "success",
        session_id: id.to_string(),
        download_url,
        segmentation_type: outcome.segmentation_type,
        label_map: outcome.label_map,
        task: outcome.task,
        expires_at,
    })
}

/// Task for an upload's `image_type` field; absent means CT.
fn requested_task(image_type: Option<&str>) -> Task {
    image_type.map(Task::from_image_type).unwrap_or(Task::Total)
}

fn multipart_error(err: MultipartError) -> ApiError {
    let status = err.status();
    debug!("Multipart error ({}): {}", status, err.body_text());
    if status == StatusCode::PAYLOAD_TOO_LARGE {
        ApiError::PayloadTooLarge("Upload exceeds the size limit".to_string())
    } else {
        ApiError::bad_request("Malformed multipart body")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_response_shape() {
        let labels: LabelMap = [(1, "spleen".to_string()), (2, "liver".to_string())]
            .into_iter()
            .collect();
        let response = SegmentResponse {
            status: "success",
            session_id: "abc".to_string(),
            download_url: "/download/abc/segmentation.nii".to_string(),
            segmentation_type: "Nifti1Image",
            label_map: labels,
            task: Task::TotalMr,
            expires_at: Utc::now(),
        };

        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["status"], "success");
        assert_eq!(json["task"], "total_mr");
        assert_eq!(json["label_map"]["1"], "spleen");
        assert_eq!(json["label_map"]["2"], "liver");
    }

    #[test]
    fn test_requested_task() {
        assert_eq!(requested_task(None), Task::Total);
        assert_eq!(requested_task(Some("CT")), Task::Total);
        assert_eq!(requested_task(Some("")), Task::Total);
        assert_eq!(requested_task(Some("mr")), Task::TotalMr);
        assert_eq!(requested_task(Some("MR")), Task::TotalMr);
    }

    #[tokio::test]
    async fn test_index_serves_form() {
        let Html(body) = index().await;
        assert!(body.contains("action=\"/segment/\""));
        assert!(body.contains("name=\"image_type\""));
    }
}

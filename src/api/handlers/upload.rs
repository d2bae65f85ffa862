use crate::AppState;
use crate::api::error::AppError;
use crate::services::deadline::DeadlineScope;
use crate::services::ingestion::{AbortReason, IngestOutcome};
use crate::services::lifecycle::{SessionId, UploadLifecycleMonitor};
use crate::services::scanner::{ScanOutcome, ScanVerdict};
use crate::utils::fingerprint::RequestFingerprint;
use crate::utils::validation::{sanitize_object_path, validate_file_size};
use axum::{
    Extension, Json,
    body::Body,
    extract::{ConnectInfo, Path, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
};
use futures::StreamExt;
use serde::Serialize;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

#[derive(Serialize)]
pub struct UploadResponse {
    pub status: &'static str,
    pub session_id: String,
    pub path: String,
    pub size: u64,
    pub sha256: String,
    pub scan: ScanVerdict,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scan_outcome: Option<ScanOutcome>,
}

#[derive(Serialize)]
pub struct AbortedResponse {
    pub status: &'static str,
    pub session_id: String,
    pub reason: AbortReason,
}

/// Marks the session aborted if the handler future is dropped before it finishes,
/// which is what happens when the client disconnects or the work outlives the
/// deadline's grace period.
struct SessionGuard {
    monitor: Arc<UploadLifecycleMonitor>,
    session: SessionId,
    finished: bool,
}

impl SessionGuard {
    fn finish(mut self) {
        self.finished = true;
        self.monitor.complete(&self.session);
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if !self.finished {
            tracing::info!(session_id = %self.session, "🔌 Upload dropped before completion");
            self.monitor.mark_aborted(&self.session);
            self.monitor.complete(&self.session);
        }
    }
}

fn declared_length(headers: &HeaderMap) -> Result<Option<u64>, AppError> {
    headers
        .get(header::CONTENT_LENGTH)
        .map(|v| {
            v.to_str()
                .ok()
                .and_then(|s| s.trim().parse::<u64>().ok())
                .ok_or_else(|| AppError::BadRequest("invalid Content-Length header".to_string()))
        })
        .transpose()
}

/// `POST /upload/*path` with the raw file as body
pub async fn upload_file(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(path): Path<String>,
    deadline: Option<Extension<DeadlineScope>>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, AppError> {
    let path = sanitize_object_path(&path).map_err(|e| AppError::BadRequest(e.to_string()))?;

    let content_length = declared_length(&headers)?;
    if let Some(len) = content_length {
        validate_file_size(len, state.config.max_file_size)
            .map_err(|e| AppError::PayloadTooLarge(e.to_string()))?;
    }

    let user_agent = headers.get(header::USER_AGENT).and_then(|v| v.to_str().ok());
    let fingerprint = RequestFingerprint::new(addr.ip(), content_length, user_agent);

    let coordinator = &state.coordinator;
    let session = coordinator.admit(&fingerprint)?;
    let guard = SessionGuard {
        monitor: coordinator.monitor().clone(),
        session: session.clone(),
        finished: false,
    };

    let limit = state.config.max_file_size as u64;
    let mut received: u64 = 0;
    let source = body.into_data_stream().map(move |chunk| {
        let chunk = chunk.map_err(io::Error::other)?;
        received += chunk.len() as u64;
        if received > limit {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("upload exceeds the maximum of {} bytes", limit),
            ));
        }
        Ok(chunk)
    });

    let scope = deadline
        .map(|Extension(scope)| scope)
        .unwrap_or_else(DeadlineScope::unbounded);

    tracing::info!(session_id = %session, path = %path, client = %addr, "📥 Upload started");
    let outcome = coordinator.ingest(&session, &path, source, scope).await;
    guard.finish();

    match outcome? {
        IngestOutcome::Committed(upload) => Ok((
            StatusCode::CREATED,
            Json(UploadResponse {
                status: "committed",
                session_id: upload.session_id,
                path: upload.object.path,
                size: upload.object.size,
                sha256: upload.object.sha256,
                scan: upload.scan,
                scan_outcome: upload.scan_outcome,
            }),
        )
            .into_response()),
        IngestOutcome::Aborted { session_id, reason } => Ok((
            StatusCode::CONFLICT,
            Json(AbortedResponse {
                status: "aborted",
                session_id: session_id.to_string(),
                reason,
            }),
        )
            .into_response()),
    }
}

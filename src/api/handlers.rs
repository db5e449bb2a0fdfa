use std::sync::Arc;

use axum::extract::{Multipart, Path, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;

use super::error::ApiError;
use crate::intake::MetadataOverrides;
use crate::ocr::OcrResult;
use crate::ops::{self, AppState, IngestOutcome};
use crate::report::{self, BatchReport};
use crate::storage::keys;
use crate::tracking::{OficioRecord, OficioStatus};
use crate::validate;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub ocr_queue_depth: usize,
    pub crm_queue_depth: usize,
    pub dead_letters: usize,
    pub crm_enabled: bool,
}

/// `GET /health`
pub async fn health(State(state): State<Arc<AppState>>) -> Result<Json<HealthResponse>, ApiError> {
    Ok(Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        ocr_queue_depth: state.ocr_queue.depth().await?,
        crm_queue_depth: state.crm_queue.depth().await?,
        dead_letters: state.ocr_queue.dead_depth().await? + state.crm_queue.dead_depth().await?,
        crm_enabled: state.crm.is_some(),
    }))
}

fn non_empty(value: String) -> Option<String> {
    let value = value.trim().to_string();
    (!value.is_empty()).then_some(value)
}

/// `POST /documents` with a multipart form: `file` plus optional metadata fields.
pub async fn upload(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<IngestOutcome>), ApiError> {
    let mut file: Option<(String, Vec<u8>)> = None;
    let mut overrides = MetadataOverrides::default();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("Malformed form: {e}")))?
    {
        let name = field.name().unwrap_or("").to_string();
        if name == "file" {
            let file_name = field.file_name().unwrap_or("upload.pdf").to_string();
            let bytes = field
                .bytes()
                .await
                .map_err(|e| ApiError::BadRequest(format!("Failed to read file data: {e}")))?;
            file = Some((file_name, bytes.to_vec()));
            continue;
        }

        let value = field
            .text()
            .await
            .map_err(|e| ApiError::BadRequest(format!("Failed to read field {name}: {e}")))?;
        match name.as_str() {
            "empresa" => overrides.empresa = non_empty(value),
            "contact_email" => overrides.contact_email = non_empty(value),
            "origen" => overrides.origen = non_empty(value),
            "observaciones" => overrides.observaciones = non_empty(value),
            "operador" => overrides.operador = non_empty(value),
            "cantidad_oficios" => {
                if let Some(raw) = non_empty(value) {
                    let count = raw
                        .parse()
                        .map_err(|_| ApiError::BadRequest(format!("cantidad_oficios must be a number, got {raw}")))?;
                    overrides.declared_count = Some(count);
                }
            }
            other => tracing::debug!("Ignoring form field {}", other),
        }
    }

    let (file_name, bytes) = file.ok_or_else(|| ApiError::BadRequest("No file provided".into()))?;
    validate::validate_pdf_bytes(&bytes)?;
    tracing::info!("Upload {} ({} bytes)", file_name, bytes.len());

    let outcome = ops::ingest_pdf(&state, bytes, &file_name, overrides).await?;
    let status = if outcome.accepted {
        StatusCode::ACCEPTED
    } else {
        StatusCode::UNPROCESSABLE_ENTITY
    };
    Ok((status, Json(outcome)))
}

#[derive(Serialize)]
pub struct RetryInfo {
    pub retry_count: u32,
    pub max_retries: u32,
    pub retry_scheduled_at: Option<DateTime<Utc>>,
    pub next_retry_in_seconds: Option<i64>,
}

#[derive(Serialize)]
pub struct JobStatusResponse {
    pub job_id: String,
    pub batch_id: String,
    pub status: &'static str,
    pub record: OficioRecord,
    pub result: Option<OcrResult>,
    pub retry: Option<RetryInfo>,
}

/// `GET /status/:job_id`
pub async fn job_status(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> Result<Json<JobStatusResponse>, ApiError> {
    let record = state
        .tracking
        .get_job(&job_id)?
        .ok_or_else(|| ApiError::NotFound(format!("Job {job_id} not found")))?;

    let result = if matches!(record.status, OficioStatus::OcrCompleted | OficioStatus::Completed) {
        match state.store.get_json(&keys::job_result(&job_id)).await {
            Ok(value) => serde_json::from_value(value).ok(),
            Err(e) => {
                tracing::warn!("Result for {} not readable: {}", job_id, e);
                None
            }
        }
    } else {
        None
    };

    let retry = (record.status == OficioStatus::Retrying || record.retry_count > 0).then(|| RetryInfo {
        retry_count: record.retry_count,
        max_retries: state.config.max_retries,
        retry_scheduled_at: record.retry_scheduled_at,
        next_retry_in_seconds: record
            .retry_scheduled_at
            .map(|at| (at - Utc::now()).num_seconds().max(0)),
    });

    Ok(Json(JobStatusResponse {
        job_id,
        batch_id: record.batch_id.clone(),
        status: record.status.as_str(),
        record,
        result,
        retry,
    }))
}

/// `GET /batch/status/:batch_id`
pub async fn batch_status(
    State(state): State<Arc<AppState>>,
    Path(batch_id): Path<String>,
) -> Result<Json<BatchReport>, ApiError> {
    let (summary, oficios) = state
        .tracking
        .get_batch(&batch_id)?
        .ok_or_else(|| ApiError::NotFound(format!("Batch {batch_id} not found")))?;
    Ok(Json(report::build(summary, oficios, Utc::now())))
}

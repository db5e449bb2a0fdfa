use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use super::retry::{backoff, is_rate_limited};
use super::AppState;
use crate::crm;
use crate::error::{PipelineError, PipelineResult};
use crate::ocr::{format, OcrResult};
use crate::queue::{send_message, CrmJob, JobQueue, OcrJob};
use crate::storage::keys;
use crate::tracking::OficioStatus;

/// Claims older than this are assumed to belong to a dead worker.
const STALE_CLAIM: Duration = Duration::from_secs(15 * 60);

/// Deliveries a message gets before it is dead-lettered.
pub const MAX_DELIVERIES: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerKind {
    Ocr,
    Crm,
}

impl std::str::FromStr for WorkerKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "ocr" => Ok(WorkerKind::Ocr),
            "crm" => Ok(WorkerKind::Crm),
            other => anyhow::bail!("Unknown worker kind: {} (expected ocr or crm)", other),
        }
    }
}

impl WorkerKind {
    fn queue<'a>(&self, state: &'a AppState) -> &'a Arc<dyn JobQueue> {
        match self {
            WorkerKind::Ocr => &state.ocr_queue,
            WorkerKind::Crm => &state.crm_queue,
        }
    }
}

async fn extract_and_analyze(state: &AppState, job: &OcrJob) -> Result<OcrResult, String> {
    let pdf = state
        .store
        .get(&job.oficio.storage_key)
        .await
        .map_err(|e| format!("Oficio PDF not available: {}", e))?;

    let output = state
        .ocr
        .extract(&pdf)
        .await
        .map_err(|e| format!("OCR failed: {}", e))?;
    tracing::info!(
        "OCR for {} returned {} chars from {} pages via {}",
        job.job_id,
        output.text.chars().count(),
        output.pages,
        output.engine
    );

    let analysis = state
        .analyzer
        .analyze(&output.text, &job.job_id)
        .await
        .map_err(|e| format!("AI analysis failed: {}", e))?;

    Ok(format::build_result(job, &output, analysis, Utc::now()))
}

/// Runs OCR and analysis for one oficio, then hands it to the CRM stage.
///
/// Stage failures are recorded on the oficio and reported through the returned
/// status; `Err` is only returned when tracking or storage itself fails.
pub async fn process_ocr_job(state: &AppState, job: &OcrJob) -> anyhow::Result<OficioStatus> {
    tracing::info!("Processing OCR job {} (attempt {})", job.job_id, job.retry_attempt + 1);

    if let Some(existing) = state.tracking.get_job(&job.job_id)? {
        if existing.status.is_finished() || existing.status == OficioStatus::OcrCompleted {
            tracing::warn!("Skipping duplicate delivery of {} ({})", job.job_id, existing.status);
            return Ok(existing.status);
        }
    }

    // 1. Claim
    state.tracking.update_oficio(&job.batch_id, &job.job_id, |r| {
        r.set_status(OficioStatus::Processing, Utc::now());
        r.error_message = None;
    })?;

    // 2. Extract and analyze
    let result = match extract_and_analyze(state, job).await {
        Ok(result) => result,
        Err(message) => {
            let now = Utc::now();
            let record = state.tracking.update_oficio(&job.batch_id, &job.job_id, |r| {
                if is_rate_limited(&message) {
                    let wait = backoff(&state.config, r.retry_count);
                    r.fail(OficioStatus::Retrying, &message, now);
                    r.ocr_status = "rate_limited".to_string();
                    r.retry_scheduled_at = Some(now + wait);
                    r.next_retry_in_seconds = Some(wait.num_seconds());
                } else {
                    r.fail(OficioStatus::Error, &message, now);
                }
            })?;
            tracing::error!("OCR job {} failed: {}", job.job_id, message);
            return Ok(record.status);
        }
    };

    // 3. Persist the result
    state
        .store
        .put_json(&keys::job_result(&job.job_id), &serde_json::to_value(&result)?)
        .await?;
    state.tracking.update_oficio(&job.batch_id, &job.job_id, |r| {
        r.set_status(OficioStatus::OcrCompleted, Utc::now());
        r.confidence = Some(result.analysis.nivel_confianza.clone());
    })?;

    // 4. CRM hand-off
    if state.crm.is_none() {
        let record = state.tracking.update_oficio(&job.batch_id, &job.job_id, |r| {
            r.crm_status = "skipped".to_string();
            r.set_status(OficioStatus::Completed, Utc::now());
        })?;
        tracing::info!("OCR job {} completed, CRM not configured", job.job_id);
        return Ok(record.status);
    }

    let crm_job = CrmJob {
        job_id: job.job_id.clone(),
        batch_id: job.batch_id.clone(),
        completed_at: Utc::now(),
    };
    let record = match send_message(state.crm_queue.as_ref(), &crm_job).await {
        Ok(_) => state.tracking.update_oficio(&job.batch_id, &job.job_id, |r| {
            r.crm_status = "queued".to_string();
        })?,
        Err(e) => {
            let message = format!("Queue error: {}", e);
            state.tracking.update_oficio(&job.batch_id, &job.job_id, |r| {
                r.fail(OficioStatus::CrmError, &message, Utc::now())
            })?
        }
    };
    tracing::info!("OCR job {} done, status {}", job.job_id, record.status);
    Ok(record.status)
}

async fn load_result(state: &AppState, job_id: &str) -> PipelineResult<OcrResult> {
    let value = state
        .store
        .get_json(&keys::job_result(job_id))
        .await
        .map_err(|_| PipelineError::Storage(format!("No OCR result found for {}", job_id)))?;
    Ok(serde_json::from_value(value)?)
}

/// Creates the CRM request for an oficio whose OCR result is stored.
pub async fn process_crm_job(state: &AppState, job: &CrmJob) -> anyhow::Result<OficioStatus> {
    if let Some(existing) = state.tracking.get_job(&job.job_id)? {
        if existing.status == OficioStatus::Completed {
            tracing::warn!("Skipping duplicate CRM delivery of {}", job.job_id);
            return Ok(existing.status);
        }
    }

    let Some(sink) = &state.crm else {
        let record = state.tracking.update_oficio(&job.batch_id, &job.job_id, |r| {
            r.crm_status = "skipped".to_string();
            r.set_status(OficioStatus::Completed, Utc::now());
        })?;
        return Ok(record.status);
    };

    let outcome = match load_result(state, &job.job_id).await {
        Ok(result) => {
            let payload = crm::map_to_crm(&result, &job.job_id, &job.batch_id, Utc::now());
            tracing::debug!("CRM payload for {}: priority {:?}", job.job_id, payload.priority);
            sink.create_request(&payload).await
        }
        Err(e) => Err(e),
    };

    let record = match outcome {
        Ok(crm_id) => {
            tracing::info!("CRM request {} created for {}", crm_id, job.job_id);
            state.tracking.update_oficio(&job.batch_id, &job.job_id, |r| {
                r.crm_id = Some(crm_id);
                r.crm_status = "completed".to_string();
                r.set_status(OficioStatus::Completed, Utc::now());
            })?
        }
        Err(e) => {
            tracing::error!("CRM job {} failed: {}", job.job_id, e);
            let message = e.to_string();
            state.tracking.update_oficio(&job.batch_id, &job.job_id, |r| {
                r.fail(OficioStatus::CrmError, &message, Utc::now())
            })?
        }
    };
    Ok(record.status)
}

/// Handles at most one message. Returns false when the queue was empty.
pub async fn run_once(state: &AppState, kind: WorkerKind) -> anyhow::Result<bool> {
    let queue = kind.queue(state);
    let Some(delivery) = queue.receive().await? else {
        return Ok(false);
    };

    let (batch_id, job_id, handled) = match kind {
        WorkerKind::Ocr => match delivery.parse::<OcrJob>() {
            Ok(job) => {
                let handled = process_ocr_job(state, &job).await;
                (job.batch_id, job.job_id, handled)
            }
            Err(e) => {
                tracing::warn!("Dropping malformed message on {}: {}", queue.name(), e);
                queue.ack(&delivery).await?;
                return Ok(true);
            }
        },
        WorkerKind::Crm => match delivery.parse::<CrmJob>() {
            Ok(job) => {
                let handled = process_crm_job(state, &job).await;
                (job.batch_id, job.job_id, handled)
            }
            Err(e) => {
                tracing::warn!("Dropping malformed message on {}: {}", queue.name(), e);
                queue.ack(&delivery).await?;
                return Ok(true);
            }
        },
    };

    match handled {
        Ok(_) => {
            queue.ack(&delivery).await?;
            Ok(true)
        }
        Err(e) if delivery.attempts >= MAX_DELIVERIES => {
            queue.dead_letter(&delivery).await?;
            let message = format!("Gave up after {} deliveries: {:#}", delivery.attempts, e);
            if let Err(mark) = state.tracking.update_oficio(&batch_id, &job_id, |r| {
                r.fail(OficioStatus::FailedPermanently, &message, Utc::now())
            }) {
                tracing::error!("Could not mark {} as failed: {}", job_id, mark);
            }
            Err(e)
        }
        Err(e) => {
            queue.release(&delivery).await?;
            Err(e)
        }
    }
}

/// Polls one queue until Ctrl-C.
pub async fn run_worker(state: Arc<AppState>, kind: WorkerKind, poll: Duration) -> anyhow::Result<()> {
    let queue = kind.queue(&state);
    let recovered = queue.recover_stale(STALE_CLAIM).await?;
    if recovered > 0 {
        tracing::warn!("Recovered {} stale messages on {}", recovered, queue.name());
    }

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = stop.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Shutdown requested, finishing current job");
                stop.store(true, Ordering::SeqCst);
            }
        });
    }

    tracing::info!("{:?} worker polling {} every {:?}", kind, queue.name(), poll);
    while !stop.load(Ordering::SeqCst) {
        match run_once(&state, kind).await {
            Ok(true) => {}
            Ok(false) => tokio::time::sleep(poll).await,
            Err(e) => {
                tracing::error!("Worker error on {}: {:#}", queue.name(), e);
                tokio::time::sleep(poll).await;
            }
        }
    }
    tracing::info!("{:?} worker stopped", kind);
    Ok(())
}

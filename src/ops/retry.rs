use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use super::AppState;
use crate::config::Config;
use crate::queue::{send_message, OcrJob};
use crate::storage::keys;
use crate::tracking::{OficioRecord, OficioStatus};

const RATE_LIMIT_MARKERS: &[&str] = &["429", "rate limit", "rate_limit", "capacity exceeded", "capacity_exceeded"];
const TRANSIENT_MARKERS: &[&str] = &[
    "timeout",
    "timed out",
    "connection",
    "temporary",
    "unavailable",
    "queue error",
];

/// Provider throttling; the job waits out a backoff before it is retried.
pub fn is_rate_limited(message: &str) -> bool {
    let lower = message.to_lowercase();
    RATE_LIMIT_MARKERS.iter().any(|m| lower.contains(m))
}

/// Failures worth another attempt. Anything else stays in `error` for an operator.
pub fn is_retryable(message: &str) -> bool {
    let lower = message.to_lowercase();
    is_rate_limited(&lower) || TRANSIENT_MARKERS.iter().any(|m| lower.contains(m))
}

/// Linear backoff: `retry_base_minutes * (attempts so far + 1)`.
pub fn backoff(config: &Config, retry_count: u32) -> Duration {
    Duration::minutes(config.retry_base_minutes * (retry_count as i64 + 1))
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetrySweep {
    pub examined: usize,
    pub requeued: usize,
    pub waiting: usize,
    pub not_retryable: usize,
    pub exhausted: usize,
}

async fn requeue(state: &AppState, record: &OficioRecord) -> anyhow::Result<()> {
    let value = state.store.get_json(&keys::job_input(&record.oficio_id)).await?;
    let mut job: OcrJob = serde_json::from_value(value)?;
    job.retry_attempt = record.retry_count + 1;
    send_message(state.ocr_queue.as_ref(), &job).await?;
    Ok(())
}

/// Puts failed OCR jobs back on the queue once their backoff has elapsed.
pub async fn sweep_retries(state: &AppState, now: DateTime<Utc>) -> anyhow::Result<RetrySweep> {
    let mut sweep = RetrySweep::default();
    let candidates = state
        .tracking
        .jobs_with_status(&[OficioStatus::Error, OficioStatus::Retrying])?;

    for record in candidates {
        sweep.examined += 1;
        let message = record.error_message.clone().unwrap_or_default();

        let due = match record.status {
            OficioStatus::Retrying => record.retry_scheduled_at.unwrap_or(record.updated_at),
            _ if is_retryable(&message) => {
                record.error_at.unwrap_or(record.updated_at) + backoff(&state.config, record.retry_count)
            }
            _ => {
                sweep.not_retryable += 1;
                continue;
            }
        };

        if record.retry_count >= state.config.max_retries {
            let final_message = format!("Max retries exceeded: {}", message);
            state.tracking.update_oficio(&record.batch_id, &record.oficio_id, |r| {
                r.fail(OficioStatus::FailedPermanently, &final_message, now)
            })?;
            tracing::warn!("{} gave up after {} retries", record.oficio_id, record.retry_count);
            sweep.exhausted += 1;
            continue;
        }

        if now < due {
            sweep.waiting += 1;
            continue;
        }

        match requeue(state, &record).await {
            Ok(()) => {
                state.tracking.update_oficio(&record.batch_id, &record.oficio_id, |r| {
                    r.retry_count += 1;
                    r.retry_scheduled_at = None;
                    r.next_retry_in_seconds = None;
                    r.ocr_status = "queued".to_string();
                    r.set_status(OficioStatus::Pending, now);
                })?;
                tracing::info!("Requeued {} (retry {})", record.oficio_id, record.retry_count + 1);
                sweep.requeued += 1;
            }
            Err(e) => {
                let final_message = format!("Retry failed: {}", e);
                state.tracking.update_oficio(&record.batch_id, &record.oficio_id, |r| {
                    r.fail(OficioStatus::FailedPermanently, &final_message, now)
                })?;
                tracing::error!("Could not requeue {}: {:#}", record.oficio_id, e);
                sweep.exhausted += 1;
            }
        }
    }

    tracing::info!(
        "Retry sweep: {} examined, {} requeued, {} waiting, {} exhausted",
        sweep.examined,
        sweep.requeued,
        sweep.waiting,
        sweep.exhausted
    );
    Ok(sweep)
}

/// Drops finished records older than `days`, with their stored job objects.
pub async fn cleanup(state: &AppState, days: i64, now: DateTime<Utc>) -> anyhow::Result<usize> {
    let cutoff = now - Duration::days(days);
    let removed = state
        .tracking
        .remove_older_than(&[OficioStatus::Completed, OficioStatus::FailedPermanently], cutoff)?;

    for record in &removed {
        for key in [keys::job_result(&record.oficio_id), keys::job_input(&record.oficio_id)] {
            if let Err(e) = state.store.delete(&key).await {
                tracing::debug!("Nothing to delete at {}: {}", key, e);
            }
        }
    }
    tracing::info!("Cleaned up {} records older than {} days", removed.len(), days);
    Ok(removed.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intake::MetadataOverrides;
    use crate::ops::test_support::{bundle, harness, Harness};
    use crate::ops::{ingest_pdf, run_once, WorkerKind};
    use crate::queue::JobQueue;

    async fn fail_first_job(h: &Harness, message: &str) -> OficioRecord {
        let overrides = MetadataOverrides {
            empresa: Some("Banco Nacional".to_string()),
            declared_count: Some(2),
            ..MetadataOverrides::default()
        };
        let outcome = ingest_pdf(&h.state, bundle(2), "lote.pdf", overrides).await.unwrap();
        *h.ocr.fail_with.lock().unwrap() = Some(message.to_string());
        run_once(&h.state, WorkerKind::Ocr).await.unwrap();
        *h.ocr.fail_with.lock().unwrap() = None;
        h.state.tracking.get_job(&outcome.oficios[0]).unwrap().unwrap()
    }

    #[test]
    fn classifies_failure_messages() {
        assert!(is_rate_limited("HTTP 429 Too Many Requests"));
        assert!(is_rate_limited("Service tier capacity exceeded"));
        assert!(!is_rate_limited("connection reset"));
        assert!(is_retryable("OCR failed: Request timeout"));
        assert!(is_retryable("Service Unavailable"));
        assert!(!is_retryable("OCR failed: document is encrypted"));
        assert!(is_retryable("Queue error: Queue operation failed: disk full"));
    }

    #[tokio::test]
    async fn oficios_that_never_reached_the_queue_are_requeued() {
        let h = harness(false);
        let overrides = MetadataOverrides {
            empresa: Some("Banco Nacional".to_string()),
            declared_count: Some(1),
            ..MetadataOverrides::default()
        };
        let outcome = ingest_pdf(&h.state, bundle(1), "lote.pdf", overrides).await.unwrap();
        let delivery = h.state.ocr_queue.receive().await.unwrap().unwrap();
        h.state.ocr_queue.ack(&delivery).await.unwrap();
        let failed = h
            .state
            .tracking
            .update_oficio(&outcome.batch_id, &outcome.oficios[0], |r| {
                r.fail(OficioStatus::Error, "Queue error: disk full", Utc::now())
            })
            .unwrap();

        let sweep = sweep_retries(&h.state, failed.error_at.unwrap() + Duration::minutes(6))
            .await
            .unwrap();
        assert_eq!(sweep.requeued, 1);
        assert_eq!(h.state.ocr_queue.depth().await.unwrap(), 1);
        run_once(&h.state, WorkerKind::Ocr).await.unwrap();
        let record = h.state.tracking.get_job(&failed.oficio_id).unwrap().unwrap();
        assert_eq!(record.status, OficioStatus::Completed);
    }

    #[tokio::test]
    async fn transient_errors_are_requeued_after_backoff() {
        let h = harness(false);
        let failed = fail_first_job(&h, "connection reset by peer").await;
        assert_eq!(failed.status, OficioStatus::Error);
        let now = failed.error_at.unwrap();

        let early = sweep_retries(&h.state, now + Duration::minutes(1)).await.unwrap();
        assert_eq!(early.waiting, 1);
        assert_eq!(early.requeued, 0);

        let depth = h.state.ocr_queue.depth().await.unwrap();
        let later = sweep_retries(&h.state, now + Duration::minutes(6)).await.unwrap();
        assert_eq!(later.requeued, 1);
        assert_eq!(h.state.ocr_queue.depth().await.unwrap(), depth + 1);

        let record = h.state.tracking.get_job(&failed.oficio_id).unwrap().unwrap();
        assert_eq!(record.status, OficioStatus::Pending);
        assert_eq!(record.retry_count, 1);
    }

    #[tokio::test]
    async fn rate_limited_jobs_wait_for_their_schedule() {
        let h = harness(false);
        let failed = fail_first_job(&h, "429 rate limit").await;
        assert_eq!(failed.status, OficioStatus::Retrying);
        let due = failed.retry_scheduled_at.unwrap();

        let sweep = sweep_retries(&h.state, due - Duration::seconds(1)).await.unwrap();
        assert_eq!(sweep.waiting, 1);
        let sweep = sweep_retries(&h.state, due).await.unwrap();
        assert_eq!(sweep.requeued, 1);
    }

    #[tokio::test]
    async fn permanent_errors_are_left_alone() {
        let h = harness(false);
        let failed = fail_first_job(&h, "document is encrypted").await;

        let sweep = sweep_retries(&h.state, Utc::now() + Duration::days(1)).await.unwrap();
        assert_eq!(sweep.not_retryable, 1);
        let record = h.state.tracking.get_job(&failed.oficio_id).unwrap().unwrap();
        assert_eq!(record.status, OficioStatus::Error);
    }

    #[tokio::test]
    async fn exhausted_jobs_fail_permanently() {
        let h = harness(false);
        let failed = fail_first_job(&h, "Request timeout").await;
        let max = h.state.config.max_retries;
        h.state
            .tracking
            .update_oficio(&failed.batch_id, &failed.oficio_id, |r| r.retry_count = max)
            .unwrap();

        let sweep = sweep_retries(&h.state, Utc::now() + Duration::days(1)).await.unwrap();
        assert_eq!(sweep.exhausted, 1);
        let record = h.state.tracking.get_job(&failed.oficio_id).unwrap().unwrap();
        assert_eq!(record.status, OficioStatus::FailedPermanently);
        assert!(record.error_message.unwrap().starts_with("Max retries exceeded"));
    }

    #[tokio::test]
    async fn missing_job_input_fails_permanently() {
        let h = harness(false);
        let failed = fail_first_job(&h, "Request timeout").await;
        h.state.store.delete(&keys::job_input(&failed.oficio_id)).await.unwrap();

        let sweep = sweep_retries(&h.state, Utc::now() + Duration::days(1)).await.unwrap();
        assert_eq!(sweep.exhausted, 1);
        let record = h.state.tracking.get_job(&failed.oficio_id).unwrap().unwrap();
        assert_eq!(record.status, OficioStatus::FailedPermanently);
    }

    #[tokio::test]
    async fn cleanup_drops_old_finished_records() {
        let h = harness(false);
        let failed = fail_first_job(&h, "document is encrypted").await;
        run_once(&h.state, WorkerKind::Ocr).await.unwrap();

        let removed = cleanup(&h.state, 7, Utc::now() + Duration::days(8)).await.unwrap();
        assert_eq!(removed, 1);
        let (_, records) = h.state.tracking.get_batch(&failed.batch_id).unwrap().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, OficioStatus::Error);
        assert_eq!(cleanup(&h.state, 7, Utc::now()).await.unwrap(), 0);
    }
}

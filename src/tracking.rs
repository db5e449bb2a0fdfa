use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, PipelineResult};
use crate::intake::BatchMetadata;
use crate::split::PageRange;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OficioStatus {
    Pending,
    Processing,
    OcrCompleted,
    Completed,
    Error,
    CrmError,
    Retrying,
    FailedPermanently,
}

impl OficioStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OficioStatus::Pending => "pending",
            OficioStatus::Processing => "processing",
            OficioStatus::OcrCompleted => "ocr_completed",
            OficioStatus::Completed => "completed",
            OficioStatus::Error => "error",
            OficioStatus::CrmError => "crm_error",
            OficioStatus::Retrying => "retrying",
            OficioStatus::FailedPermanently => "failed_permanently",
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(
            self,
            OficioStatus::Error | OficioStatus::CrmError | OficioStatus::FailedPermanently
        )
    }

    pub fn is_finished(&self) -> bool {
        *self == OficioStatus::Completed || self.is_failed()
    }

    pub fn is_active(&self) -> bool {
        matches!(self, OficioStatus::Processing | OficioStatus::OcrCompleted)
    }
}

impl std::fmt::Display for OficioStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Queued,
    Processing,
    Completed,
    PartialCompletion,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Queued => "queued",
            BatchStatus::Processing => "processing",
            BatchStatus::Completed => "completed",
            BatchStatus::PartialCompletion => "partial_completion",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OficioRecord {
    pub batch_id: String,
    pub oficio_id: String,
    pub sequence_number: u32,
    pub status: OficioStatus,
    pub ocr_status: String,
    pub crm_status: String,
    pub page_range: PageRange,
    pub page_count: u32,
    pub storage_key: String,
    pub document_type: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub ocr_started_at: Option<DateTime<Utc>>,
    pub ocr_completed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub crm_id: Option<String>,
    pub retry_count: u32,
    pub retry_scheduled_at: Option<DateTime<Utc>>,
    pub next_retry_in_seconds: Option<i64>,
    pub processing_time_secs: Option<f64>,
    pub confidence: Option<String>,
}

impl OficioRecord {
    pub fn new(oficio: &crate::queue::OficioRef, now: DateTime<Utc>) -> Self {
        Self {
            batch_id: oficio.batch_id.clone(),
            oficio_id: oficio.oficio_id.clone(),
            sequence_number: oficio.sequence_number,
            status: OficioStatus::Pending,
            ocr_status: "queued".to_string(),
            crm_status: "pending".to_string(),
            page_range: oficio.page_range,
            page_count: oficio.page_count,
            storage_key: oficio.storage_key.clone(),
            document_type: oficio.document_type.clone(),
            created_at: now,
            updated_at: now,
            ocr_started_at: None,
            ocr_completed_at: None,
            completed_at: None,
            error_at: None,
            error_message: None,
            crm_id: None,
            retry_count: 0,
            retry_scheduled_at: None,
            next_retry_in_seconds: None,
            processing_time_secs: None,
            confidence: None,
        }
    }

    /// Moves to `status`, stamping the matching timestamp.
    pub fn set_status(&mut self, status: OficioStatus, now: DateTime<Utc>) {
        self.status = status;
        self.updated_at = now;
        match status {
            OficioStatus::Processing => {
                self.ocr_started_at = Some(now);
                self.ocr_status = "processing".to_string();
            }
            OficioStatus::OcrCompleted => {
                self.ocr_completed_at = Some(now);
                self.ocr_status = "completed".to_string();
                if let Some(started) = self.ocr_started_at {
                    self.processing_time_secs =
                        Some((now - started).num_milliseconds() as f64 / 1000.0);
                }
            }
            OficioStatus::Completed => self.completed_at = Some(now),
            OficioStatus::Error | OficioStatus::CrmError => self.error_at = Some(now),
            _ => {}
        }
    }

    pub fn fail(&mut self, status: OficioStatus, message: &str, now: DateTime<Utc>) {
        self.set_status(status, now);
        self.error_message = Some(message.to_string());
        if status == OficioStatus::Error {
            self.ocr_status = "error".to_string();
        }
        if status == OficioStatus::CrmError {
            self.crm_status = "error".to_string();
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub batch_id: String,
    pub status: BatchStatus,
    pub status_message: String,
    pub metadata: BatchMetadata,
    pub validation_status: String,
    pub split_strategy: String,
    pub declared_count: u32,
    pub extracted_count: u32,
    pub total_oficios: u32,
    pub completed_oficios: u32,
    pub failed_oficios: u32,
    pub processing_oficios: u32,
    pub completion_rate: f64,
    pub created_at: DateTime<Utc>,
    pub processing_started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

/// Batch and oficio records in a SQLite table shared by every process that
/// opens the same path. Each mutation runs in its own immediate transaction.
pub struct TrackingStore {
    conn: Mutex<Connection>,
}

impl TrackingStore {
    pub fn open(db_path: impl AsRef<Path>) -> PipelineResult<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            CREATE TABLE IF NOT EXISTS batches (
                batch_id   TEXT PRIMARY KEY,
                data       BLOB NOT NULL
            );
            CREATE TABLE IF NOT EXISTS oficios (
                batch_id        TEXT NOT NULL,
                oficio_id       TEXT NOT NULL,
                sequence_number INTEGER NOT NULL,
                status          TEXT NOT NULL,
                updated_at      INTEGER NOT NULL,
                data            BLOB NOT NULL,
                PRIMARY KEY (batch_id, oficio_id)
            );
            CREATE INDEX IF NOT EXISTS oficios_by_id ON oficios (oficio_id);
            CREATE INDEX IF NOT EXISTS oficios_by_status ON oficios (status, updated_at);
            "#,
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> PipelineResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| PipelineError::Tracking("tracking lock poisoned".to_string()))
    }

    pub fn create_batch(&self, summary: BatchSummary, oficios: Vec<OficioRecord>) -> PipelineResult<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let batch_id = summary.batch_id.clone();
        let data = encode(&summary)?;
        tx.execute(
            "INSERT OR REPLACE INTO batches (batch_id, data) VALUES (?1, ?2)",
            params![batch_id, data],
        )?;
        for rec in &oficios {
            put_oficio(&tx, rec)?;
        }
        refresh_summary(&tx, &batch_id, Utc::now())?;
        tx.commit()?;
        tracing::info!("Tracking records created for batch {}", batch_id);
        Ok(())
    }

    /// Applies `change` to one oficio and refreshes its batch summary.
    pub fn update_oficio<F>(&self, batch_id: &str, oficio_id: &str, change: F) -> PipelineResult<OficioRecord>
    where
        F: FnOnce(&mut OficioRecord),
    {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let data: Option<Vec<u8>> = tx
            .query_row(
                "SELECT data FROM oficios WHERE batch_id = ?1 AND oficio_id = ?2",
                params![batch_id, oficio_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(data) = data else {
            return Err(PipelineError::Tracking(format!(
                "Unknown oficio {} in batch {}",
                oficio_id, batch_id
            )));
        };

        let mut rec: OficioRecord = decode(&data)?;
        change(&mut rec);
        put_oficio(&tx, &rec)?;
        refresh_summary(&tx, batch_id, Utc::now())?;
        tx.commit()?;
        tracing::debug!("Oficio {} is now {}", oficio_id, rec.status);
        Ok(rec)
    }

    pub fn get_batch(&self, batch_id: &str) -> PipelineResult<Option<(BatchSummary, Vec<OficioRecord>)>> {
        let mut conn = self.lock()?;
        // Read both tables from one snapshot.
        let tx = conn.transaction()?;
        let Some(summary) = load_summary(&tx, batch_id)? else {
            return Ok(None);
        };
        let oficios = load_oficios(&tx, batch_id)?;
        Ok(Some((summary, oficios)))
    }

    /// Job ids are oficio ids, which are unique across batches.
    pub fn get_job(&self, job_id: &str) -> PipelineResult<Option<OficioRecord>> {
        let conn = self.lock()?;
        let data: Option<Vec<u8>> = conn
            .query_row(
                "SELECT data FROM oficios WHERE oficio_id = ?1 LIMIT 1",
                params![job_id],
                |row| row.get(0),
            )
            .optional()?;
        data.map(|d| decode(&d)).transpose()
    }

    pub fn jobs_with_status(&self, statuses: &[OficioStatus]) -> PipelineResult<Vec<OficioRecord>> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT data FROM oficios WHERE status = ?1 ORDER BY batch_id, sequence_number")?;
        let mut records = Vec::new();
        for status in statuses {
            let rows = stmt.query_map(params![status.as_str()], |row| row.get::<_, Vec<u8>>(0))?;
            for data in rows {
                records.push(decode(&data?)?);
            }
        }
        Ok(records)
    }

    /// Deletes oficios in `statuses` last updated before `cutoff`. Returns the removed records.
    pub fn remove_older_than(
        &self,
        statuses: &[OficioStatus],
        cutoff: DateTime<Utc>,
    ) -> PipelineResult<Vec<OficioRecord>> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut removed: Vec<OficioRecord> = Vec::new();
        {
            let mut stmt = tx.prepare("SELECT data FROM oficios WHERE status = ?1 AND updated_at < ?2")?;
            for status in statuses {
                let rows = stmt.query_map(params![status.as_str(), cutoff.timestamp_millis()], |row| {
                    row.get::<_, Vec<u8>>(0)
                })?;
                for data in rows {
                    removed.push(decode(&data?)?);
                }
            }
        }
        if removed.is_empty() {
            return Ok(removed);
        }

        let mut touched: Vec<&str> = Vec::new();
        for rec in &removed {
            tx.execute(
                "DELETE FROM oficios WHERE batch_id = ?1 AND oficio_id = ?2",
                params![rec.batch_id, rec.oficio_id],
            )?;
            if !touched.contains(&rec.batch_id.as_str()) {
                touched.push(&rec.batch_id);
            }
        }

        let now = Utc::now();
        for batch_id in touched {
            let left: i64 = tx.query_row(
                "SELECT COUNT(*) FROM oficios WHERE batch_id = ?1",
                params![batch_id],
                |row| row.get(0),
            )?;
            if left == 0 {
                tx.execute("DELETE FROM batches WHERE batch_id = ?1", params![batch_id])?;
            } else {
                refresh_summary(&tx, batch_id, now)?;
            }
        }
        tx.commit()?;
        Ok(removed)
    }
}

fn encode<T: Serialize>(value: &T) -> PipelineResult<Vec<u8>> {
    bincode::serialize(value).map_err(|e| PipelineError::Tracking(format!("Failed to encode record: {}", e)))
}

fn decode<T: DeserializeOwned>(data: &[u8]) -> PipelineResult<T> {
    bincode::deserialize(data).map_err(|e| PipelineError::Tracking(format!("Corrupt tracking record: {}", e)))
}

fn put_oficio(conn: &Connection, rec: &OficioRecord) -> PipelineResult<()> {
    let data = encode(rec)?;
    conn.execute(
        r#"INSERT OR REPLACE INTO oficios
           (batch_id, oficio_id, sequence_number, status, updated_at, data)
           VALUES (?1, ?2, ?3, ?4, ?5, ?6)"#,
        params![
            rec.batch_id,
            rec.oficio_id,
            rec.sequence_number,
            rec.status.as_str(),
            rec.updated_at.timestamp_millis(),
            data,
        ],
    )?;
    Ok(())
}

fn load_summary(conn: &Connection, batch_id: &str) -> PipelineResult<Option<BatchSummary>> {
    let data: Option<Vec<u8>> = conn
        .query_row(
            "SELECT data FROM batches WHERE batch_id = ?1",
            params![batch_id],
            |row| row.get(0),
        )
        .optional()?;
    data.map(|d| decode(&d)).transpose()
}

fn load_oficios(conn: &Connection, batch_id: &str) -> PipelineResult<Vec<OficioRecord>> {
    let mut stmt = conn.prepare("SELECT data FROM oficios WHERE batch_id = ?1 ORDER BY sequence_number")?;
    let rows = stmt.query_map(params![batch_id], |row| row.get::<_, Vec<u8>>(0))?;
    let mut records = Vec::new();
    for data in rows {
        records.push(decode(&data?)?);
    }
    Ok(records)
}

fn refresh_summary(conn: &Connection, batch_id: &str, now: DateTime<Utc>) -> PipelineResult<()> {
    let Some(mut summary) = load_summary(conn, batch_id)? else {
        return Ok(());
    };
    let statuses: Vec<OficioStatus> = load_oficios(conn, batch_id)?.iter().map(|r| r.status).collect();
    let (status, message, counts) = summarize(&statuses);
    let (total, completed, failed, processing) = counts;

    summary.total_oficios = total;
    summary.completed_oficios = completed;
    summary.failed_oficios = failed;
    summary.processing_oficios = processing;
    summary.completion_rate = if total > 0 {
        completed as f64 / total as f64 * 100.0
    } else {
        0.0
    };
    if matches!(status, BatchStatus::Completed | BatchStatus::PartialCompletion) && summary.completed_at.is_none() {
        summary.completed_at = Some(now);
    }
    summary.status = status;
    summary.status_message = message;
    summary.updated_at = now;

    let data = encode(&summary)?;
    conn.execute(
        "UPDATE batches SET data = ?2 WHERE batch_id = ?1",
        params![batch_id, data],
    )?;
    Ok(())
}

/// Batch status from the statuses of its oficios, with (total, completed, failed, processing).
pub fn summarize(statuses: &[OficioStatus]) -> (BatchStatus, String, (u32, u32, u32, u32)) {
    let total = statuses.len() as u32;
    let completed = statuses.iter().filter(|s| **s == OficioStatus::Completed).count() as u32;
    let failed = statuses.iter().filter(|s| s.is_failed()).count() as u32;
    let processing = statuses.iter().filter(|s| s.is_active()).count() as u32;

    let (status, message) = if total > 0 && completed == total {
        (
            BatchStatus::Completed,
            format!("All {} oficios completed successfully", total),
        )
    } else if failed > 0 && completed + failed == total {
        (
            BatchStatus::PartialCompletion,
            format!("{} completed, {} failed", completed, failed),
        )
    } else if processing > 0 {
        (
            BatchStatus::Processing,
            format!("{}/{} completed, {} processing", completed, total, processing),
        )
    } else {
        (
            BatchStatus::Queued,
            format!("{} oficios queued for processing", total),
        )
    };
    (status, message, (total, completed, failed, processing))
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn batch_status_rules() {
        use OficioStatus::*;
        assert_eq!(summarize(&[Completed, Completed]).0, BatchStatus::Completed);
        assert_eq!(summarize(&[Completed, Error]).0, BatchStatus::PartialCompletion);
        assert_eq!(summarize(&[Completed, Processing]).0, BatchStatus::Processing);
        assert_eq!(summarize(&[Pending, Error]).0, BatchStatus::Queued);
        assert_eq!(summarize(&[]).0, BatchStatus::Queued);
    }

    #[test]
    fn updates_refresh_summary_and_persist() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store(dir.path(), "B1", 2);

        store
            .update_oficio("B1", "B1_oficio_001", |r| r.set_status(OficioStatus::Completed, Utc::now()))
            .unwrap();
        store
            .update_oficio("B1", "B1_oficio_002", |r| {
                r.fail(OficioStatus::Error, "timeout talking to OCR", Utc::now())
            })
            .unwrap();

        let reopened = TrackingStore::open(dir.path().join("tracking.db")).unwrap();
        let (summary, oficios) = reopened.get_batch("B1").unwrap().unwrap();
        assert_eq!(summary.status, BatchStatus::PartialCompletion);
        assert_eq!(summary.completed_oficios, 1);
        assert_eq!(summary.failed_oficios, 1);
        assert!((summary.completion_rate - 50.0).abs() < f64::EPSILON);
        assert!(summary.completed_at.is_some());
        assert_eq!(oficios[1].ocr_status, "error");
        assert_eq!(oficios[1].error_message.as_deref(), Some("timeout talking to OCR"));
    }

    #[test]
    fn processing_time_is_measured_between_ocr_stamps() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store(dir.path(), "B2", 1);
        let start = Utc::now();
        store
            .update_oficio("B2", "B2_oficio_001", |r| {
                r.set_status(OficioStatus::Processing, start);
                r.set_status(OficioStatus::OcrCompleted, start + chrono::Duration::seconds(4));
            })
            .unwrap();
        let job = store.get_job("B2_oficio_001").unwrap().unwrap();
        assert_eq!(job.processing_time_secs, Some(4.0));
        assert_eq!(job.ocr_status, "completed");
    }

    #[test]
    fn unknown_oficio_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store(dir.path(), "B3", 1);
        assert!(store.update_oficio("B3", "nope", |_| {}).is_err());
        assert!(store.get_batch("missing").unwrap().is_none());
    }

    #[test]
    fn handles_on_one_path_share_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tracking.db");
        let worker = TrackingStore::open(&path).unwrap();
        let ingest = TrackingStore::open(&path).unwrap();
        let now = Utc::now();

        ingest
            .create_batch(summary("B1"), vec![OficioRecord::new(&oficio_ref("B1", 1), now)])
            .unwrap();
        let updated = worker
            .update_oficio("B1", "B1_oficio_001", |r| r.set_status(OficioStatus::Processing, now))
            .unwrap();
        assert_eq!(updated.status, OficioStatus::Processing);

        let other_ingest = TrackingStore::open(&path).unwrap();
        other_ingest
            .create_batch(summary("B2"), vec![OficioRecord::new(&oficio_ref("B2", 1), now)])
            .unwrap();
        ingest
            .update_oficio("B1", "B1_oficio_001", |r| r.set_status(OficioStatus::Completed, now))
            .unwrap();

        let reopened = TrackingStore::open(&path).unwrap();
        let (b1, _) = reopened.get_batch("B1").unwrap().unwrap();
        assert_eq!(b1.status, BatchStatus::Completed);
        assert!(reopened.get_batch("B2").unwrap().is_some());
        assert_eq!(worker.get_job("B2_oficio_001").unwrap().unwrap().batch_id, "B2");
    }

    #[test]
    fn concurrent_writers_do_not_lose_updates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tracking.db");
        let count = 8;
        seeded_store(dir.path(), "B5", count);

        let handles: Vec<_> = (1..=count)
            .map(|n| {
                let path = path.clone();
                std::thread::spawn(move || {
                    let store = TrackingStore::open(&path).unwrap();
                    store
                        .update_oficio("B5", &format!("B5_oficio_{:03}", n), |r| {
                            r.set_status(OficioStatus::Completed, Utc::now())
                        })
                        .unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let store = TrackingStore::open(&path).unwrap();
        let (summary, oficios) = store.get_batch("B5").unwrap().unwrap();
        assert!(oficios.iter().all(|r| r.status == OficioStatus::Completed));
        assert_eq!(summary.completed_oficios, count);
        assert_eq!(summary.status, BatchStatus::Completed);
    }

    #[test]
    fn old_finished_jobs_are_removed_with_empty_batches() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store(dir.path(), "B4", 2);
        let old = Utc::now() - chrono::Duration::days(40);
        store
            .update_oficio("B4", "B4_oficio_001", |r| r.set_status(OficioStatus::Completed, old))
            .unwrap();

        let removed = store
            .remove_older_than(&[OficioStatus::Completed], Utc::now() - chrono::Duration::days(30))
            .unwrap();
        assert_eq!(removed.len(), 1);
        let (summary, oficios) = store.get_batch("B4").unwrap().unwrap();
        assert_eq!(oficios.len(), 1);
        assert_eq!(summary.total_oficios, 1);

        store
            .update_oficio("B4", "B4_oficio_002", |r| r.set_status(OficioStatus::FailedPermanently, old))
            .unwrap();
        store
            .remove_older_than(&[OficioStatus::FailedPermanently], Utc::now())
            .unwrap();
        assert!(store.get_batch("B4").unwrap().is_none());
    }
}

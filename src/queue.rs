//! Work queues between the pipeline stages.
//!
//! Delivery is at least once: a claimed message stays in `inflight/` until it
//! is acked, and claims older than the visibility timeout are put back.
//! Messages that keep failing are moved to `dead/`.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, PipelineResult};
use crate::intake::BatchMetadata;
use crate::split::PageRange;

pub const OCR_QUEUE: &str = "ocr";
pub const CRM_QUEUE: &str = "crm";

/// One split oficio as it travels between stages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OficioRef {
    pub oficio_id: String,
    pub batch_id: String,
    pub sequence_number: u32,
    pub storage_key: String,
    pub page_range: PageRange,
    pub page_count: u32,
    pub preview_text: String,
    pub document_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrJob {
    pub job_id: String,
    pub batch_id: String,
    pub oficio: OficioRef,
    pub metadata: BatchMetadata,
    pub source: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub retry_attempt: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrmJob {
    pub job_id: String,
    pub batch_id: String,
    pub completed_at: DateTime<Utc>,
}

/// A claimed message. Pass it back to `ack`, `release` or `dead_letter`.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub receipt: String,
    pub body: serde_json::Value,
    /// 1 on the first delivery, counting releases and recovered claims.
    pub attempts: u32,
}

impl Delivery {
    pub fn parse<T: serde::de::DeserializeOwned>(&self) -> PipelineResult<T> {
        serde_json::from_value(self.body.clone())
            .map_err(|e| PipelineError::Queue(format!("Malformed message {}: {}", self.receipt, e)))
    }
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, body: serde_json::Value) -> PipelineResult<String>;

    /// Claims the oldest ready message, if any.
    async fn receive(&self) -> PipelineResult<Option<Delivery>>;

    async fn ack(&self, delivery: &Delivery) -> PipelineResult<()>;

    /// Returns a claimed message to the queue for another attempt.
    async fn release(&self, delivery: &Delivery) -> PipelineResult<()>;

    /// Parks a claimed message where it is never delivered again.
    async fn dead_letter(&self, delivery: &Delivery) -> PipelineResult<()>;

    async fn depth(&self) -> PipelineResult<usize>;

    async fn dead_depth(&self) -> PipelineResult<usize>;

    /// Puts back messages claimed longer ago than `visibility`. Returns how many moved.
    async fn recover_stale(&self, visibility: Duration) -> PipelineResult<usize>;
}

pub async fn send_message<T: Serialize + Sync>(queue: &dyn JobQueue, message: &T) -> PipelineResult<String> {
    let body = serde_json::to_value(message)?;
    queue.send(body).await
}

static SEND_SEQ: AtomicU64 = AtomicU64::new(0);

/// Splits `<id>[~<deliveries>].json` into the id and the deliveries so far.
fn parse_name(name: &str) -> (&str, u32) {
    let stem = name.trim_end_matches(".json");
    match stem.split_once('~') {
        Some((id, n)) => (id, n.parse().unwrap_or(0)),
        None => (stem, 0),
    }
}

fn message_name(id: &str, deliveries: u32) -> String {
    if deliveries == 0 {
        format!("{}.json", id)
    } else {
        format!("{}~{}.json", id, deliveries)
    }
}

/// Directory-backed queue: one JSON file per message.
pub struct FsQueue {
    name: String,
    ready: PathBuf,
    inflight: PathBuf,
    dead: PathBuf,
}

impl FsQueue {
    pub fn open(name: &str, root: impl Into<PathBuf>) -> PipelineResult<Self> {
        let root = root.into();
        let ready = root.join("ready");
        let inflight = root.join("inflight");
        let dead = root.join("dead");
        std::fs::create_dir_all(&ready)?;
        std::fs::create_dir_all(&inflight)?;
        std::fs::create_dir_all(&dead)?;
        Ok(Self {
            name: name.to_string(),
            ready,
            inflight,
            dead,
        })
    }

    fn claimed_name(receipt: &str) -> PipelineResult<&str> {
        receipt
            .split_once("__")
            .map(|(_, n)| n)
            .ok_or_else(|| PipelineError::Queue(format!("Invalid receipt: {}", receipt)))
    }

    /// Moves a claimed file back to `ready/`, counting the delivery it used up.
    async fn requeue(&self, receipt: &str, name: &str) -> std::io::Result<()> {
        let (id, deliveries) = parse_name(name);
        tokio::fs::rename(self.inflight.join(receipt), self.ready.join(message_name(id, deliveries + 1))).await
    }

    async fn sorted_names(dir: &PathBuf) -> PipelineResult<Vec<String>> {
        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.ends_with(".json") {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }
}

#[async_trait]
impl JobQueue for FsQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, body: serde_json::Value) -> PipelineResult<String> {
        // The counter keeps messages sent within one millisecond in order.
        let seq = SEND_SEQ.fetch_add(1, Ordering::Relaxed) % 1_000_000;
        let id = format!(
            "{:013}-{:06}-{}",
            Utc::now().timestamp_millis(),
            seq,
            uuid::Uuid::new_v4()
        );
        let data = serde_json::to_vec(&body)?;
        let dir = self.ready.clone();
        let target = dir.join(format!("{}.json", id));

        tokio::task::spawn_blocking(move || -> PipelineResult<()> {
            // Staged with a non-.json name so receivers never see a partial file.
            let mut tmp = tempfile::Builder::new().suffix(".part").tempfile_in(&dir)?;
            std::io::Write::write_all(&mut tmp, &data)?;
            tmp.persist(&target)
                .map_err(|e| PipelineError::Queue(format!("Failed to enqueue message: {}", e)))?;
            Ok(())
        })
        .await
        .map_err(|e| PipelineError::Queue(format!("Enqueue task failed: {}", e)))??;

        tracing::debug!("Queue {}: sent message {}", self.name, id);
        Ok(id)
    }

    async fn receive(&self) -> PipelineResult<Option<Delivery>> {
        for name in Self::sorted_names(&self.ready).await? {
            let receipt = format!("{:013}__{}", Utc::now().timestamp_millis(), name);
            let claimed = self.inflight.join(&receipt);

            match tokio::fs::rename(self.ready.join(&name), &claimed).await {
                Ok(()) => {}
                // Another consumer got it first.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }

            let attempts = parse_name(&name).1 + 1;
            let data = tokio::fs::read(&claimed).await?;
            return match serde_json::from_slice(&data) {
                Ok(body) => Ok(Some(Delivery {
                    receipt,
                    body,
                    attempts,
                })),
                Err(e) => {
                    tracing::error!("Queue {}: dropping unreadable message {}: {}", self.name, name, e);
                    tokio::fs::remove_file(&claimed).await?;
                    Err(PipelineError::Queue(format!("Unreadable message {}: {}", name, e)))
                }
            };
        }
        Ok(None)
    }

    async fn ack(&self, delivery: &Delivery) -> PipelineResult<()> {
        match tokio::fs::remove_file(self.inflight.join(&delivery.receipt)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!("Queue {}: ack for unknown receipt {}", self.name, delivery.receipt);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn release(&self, delivery: &Delivery) -> PipelineResult<()> {
        let name = Self::claimed_name(&delivery.receipt)?;
        self.requeue(&delivery.receipt, name).await?;
        Ok(())
    }

    async fn dead_letter(&self, delivery: &Delivery) -> PipelineResult<()> {
        let name = Self::claimed_name(&delivery.receipt)?;
        tokio::fs::rename(self.inflight.join(&delivery.receipt), self.dead.join(name)).await?;
        tracing::error!(
            "Queue {}: moved {} to dead letters after {} deliveries",
            self.name,
            name,
            delivery.attempts
        );
        Ok(())
    }

    async fn depth(&self) -> PipelineResult<usize> {
        Ok(Self::sorted_names(&self.ready).await?.len())
    }

    async fn dead_depth(&self) -> PipelineResult<usize> {
        Ok(Self::sorted_names(&self.dead).await?.len())
    }

    async fn recover_stale(&self, visibility: Duration) -> PipelineResult<usize> {
        let now = Utc::now().timestamp_millis();
        let cutoff = visibility.as_millis() as i64;
        let mut restored = 0;

        for name in Self::sorted_names(&self.inflight).await? {
            let Some((claimed, original)) = name.split_once("__") else {
                continue;
            };
            let Ok(claimed) = claimed.parse::<i64>() else {
                continue;
            };
            if now - claimed < cutoff {
                continue;
            }
            match self.requeue(&name, original).await {
                Ok(()) => restored += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        if restored > 0 {
            tracing::warn!("Queue {}: restored {} stale messages", self.name, restored);
        }
        Ok(restored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn messages_come_out_in_send_order() {
        let dir = tempfile::tempdir().unwrap();
        let queue = FsQueue::open("ocr", dir.path()).unwrap();

        for n in 0..3 {
            queue.send(json!({ "n": n })).await.unwrap();
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert_eq!(queue.depth().await.unwrap(), 3);

        for n in 0..3 {
            let d = queue.receive().await.unwrap().unwrap();
            assert_eq!(d.body["n"], n);
            queue.ack(&d).await.unwrap();
        }
        assert!(queue.receive().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn released_message_is_delivered_again() {
        let dir = tempfile::tempdir().unwrap();
        let queue = FsQueue::open("crm", dir.path()).unwrap();
        queue.send(json!({ "job_id": "J1" })).await.unwrap();

        let first = queue.receive().await.unwrap().unwrap();
        assert_eq!(queue.depth().await.unwrap(), 0);
        queue.release(&first).await.unwrap();

        let second = queue.receive().await.unwrap().unwrap();
        assert_eq!(second.body["job_id"], "J1");
        assert_eq!(first.attempts, 1);
        assert_eq!(second.attempts, 2);
    }

    #[tokio::test]
    async fn dead_letters_leave_the_queue() {
        let dir = tempfile::tempdir().unwrap();
        let queue = FsQueue::open("ocr", dir.path()).unwrap();
        queue.send(json!({ "job_id": "J1" })).await.unwrap();
        queue.send(json!({ "job_id": "J2" })).await.unwrap();

        let d = queue.receive().await.unwrap().unwrap();
        queue.dead_letter(&d).await.unwrap();

        assert_eq!(queue.dead_depth().await.unwrap(), 1);
        assert_eq!(queue.depth().await.unwrap(), 1);
        let next = queue.receive().await.unwrap().unwrap();
        assert_eq!(next.body["job_id"], "J2");
        queue.ack(&next).await.unwrap();
        assert!(queue.receive().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stale_claims_are_recovered() {
        let dir = tempfile::tempdir().unwrap();
        let queue = FsQueue::open("ocr", dir.path()).unwrap();
        queue.send(json!({ "job_id": "J1" })).await.unwrap();

        let _claimed = queue.receive().await.unwrap().unwrap();
        assert_eq!(queue.recover_stale(Duration::from_secs(3600)).await.unwrap(), 0);
        assert_eq!(queue.recover_stale(Duration::ZERO).await.unwrap(), 1);
        assert_eq!(queue.depth().await.unwrap(), 1);
        assert_eq!(queue.receive().await.unwrap().unwrap().attempts, 2);
    }

    #[tokio::test]
    async fn typed_messages_parse_back() {
        let dir = tempfile::tempdir().unwrap();
        let queue = FsQueue::open("crm", dir.path()).unwrap();
        let job = CrmJob {
            job_id: "B_oficio_001".to_string(),
            batch_id: "B".to_string(),
            completed_at: Utc::now(),
        };
        send_message(&queue, &job).await.unwrap();

        let d = queue.receive().await.unwrap().unwrap();
        let parsed: CrmJob = d.parse().unwrap();
        assert_eq!(parsed, job);
        assert!(d.parse::<OcrJob>().is_err());
    }
}

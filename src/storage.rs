//! Object storage for raw uploads, split oficios, OCR results and logs.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;

use crate::error::{PipelineError, PipelineResult};

/// Key helpers for the object layout.
pub mod keys {
    pub fn inbox(file_name: &str) -> String {
        format!("inbox/{}", file_name)
    }

    pub fn oficio_pdf(batch_id: &str, oficio_id: &str) -> String {
        format!("oficios/lotes/{}/{}.pdf", batch_id, oficio_id)
    }

    pub fn job_result(job_id: &str) -> String {
        format!("jobs/{}/result.json", job_id)
    }

    pub fn job_input(job_id: &str) -> String {
        format!("jobs/{}/input.json", job_id)
    }

    pub fn success_log(batch_id: &str) -> String {
        format!("logs/success/{}.json", batch_id)
    }

    pub fn failed_log(batch_id: &str) -> String {
        format!("logs/failed/{}.json", batch_id)
    }

    pub const PENDING_NOTIFICATIONS: &str = "notifications/pending/";

    pub fn pending_notification(id: &str) -> String {
        format!("{}{}.json", PENDING_NOTIFICATIONS, id)
    }
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, key: &str, data: &[u8]) -> PipelineResult<()>;

    async fn get(&self, key: &str) -> PipelineResult<Vec<u8>>;

    async fn exists(&self, key: &str) -> PipelineResult<bool>;

    /// Keys under `prefix`, sorted.
    async fn list(&self, prefix: &str) -> PipelineResult<Vec<String>>;

    async fn delete(&self, key: &str) -> PipelineResult<()>;

    async fn put_json(&self, key: &str, value: &serde_json::Value) -> PipelineResult<()> {
        let data = serde_json::to_vec_pretty(value)?;
        self.put(key, &data).await
    }

    async fn get_json(&self, key: &str) -> PipelineResult<serde_json::Value> {
        let data = self.get(key).await?;
        Ok(serde_json::from_slice(&data)?)
    }
}

/// Objects stored as plain files below a root directory.
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> PipelineResult<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn path_for(&self, key: &str) -> PipelineResult<PathBuf> {
        let rel = Path::new(key);
        let safe = !key.is_empty()
            && rel
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !safe {
            return Err(PipelineError::Storage(format!("Invalid object key: {}", key)));
        }
        Ok(self.root.join(rel))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(&self, key: &str, data: &[u8]) -> PipelineResult<()> {
        let path = self.path_for(key)?;
        let parent = path
            .parent()
            .ok_or_else(|| PipelineError::Storage(format!("Invalid object key: {}", key)))?
            .to_path_buf();
        let data = data.to_vec();

        tokio::task::spawn_blocking(move || -> PipelineResult<()> {
            std::fs::create_dir_all(&parent)?;
            let mut tmp = tempfile::NamedTempFile::new_in(&parent)?;
            std::io::Write::write_all(&mut tmp, &data)?;
            tmp.persist(&path)
                .map_err(|e| PipelineError::Storage(format!("Failed to persist {:?}: {}", path, e)))?;
            Ok(())
        })
        .await
        .map_err(|e| PipelineError::Storage(format!("Write task failed: {}", e)))??;

        tracing::debug!("Stored object {}", key);
        Ok(())
    }

    async fn get(&self, key: &str) -> PipelineResult<Vec<u8>> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(PipelineError::Storage(format!("Object not found: {}", key)))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, key: &str) -> PipelineResult<bool> {
        let path = self.path_for(key)?;
        Ok(tokio::fs::try_exists(&path).await?)
    }

    async fn list(&self, prefix: &str) -> PipelineResult<Vec<String>> {
        let root = self.root.clone();
        let prefix = prefix.to_string();

        tokio::task::spawn_blocking(move || {
            let mut keys: Vec<String> = walkdir::WalkDir::new(&root)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
                .filter(|e| !e.file_name().to_string_lossy().starts_with(".tmp"))
                .filter_map(|e| {
                    let rel = e.path().strip_prefix(&root).ok()?;
                    let key = rel
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy())
                        .collect::<Vec<_>>()
                        .join("/");
                    key.starts_with(&prefix).then_some(key)
                })
                .collect();
            keys.sort();
            keys
        })
        .await
        .map_err(|e| PipelineError::Storage(format!("List task failed: {}", e)))
    }

    async fn delete(&self, key: &str) -> PipelineResult<()> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_list_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path()).unwrap();

        store.put("oficios/lotes/B1/B1_oficio_001.pdf", b"%PDF-1").await.unwrap();
        store.put("oficios/lotes/B1/B1_oficio_002.pdf", b"%PDF-2").await.unwrap();
        store.put("jobs/J1/result.json", b"{}").await.unwrap();

        assert_eq!(store.get("oficios/lotes/B1/B1_oficio_002.pdf").await.unwrap(), b"%PDF-2");
        assert!(store.exists("jobs/J1/result.json").await.unwrap());

        let listed = store.list("oficios/lotes/B1/").await.unwrap();
        assert_eq!(
            listed,
            vec![
                "oficios/lotes/B1/B1_oficio_001.pdf".to_string(),
                "oficios/lotes/B1/B1_oficio_002.pdf".to_string()
            ]
        );

        store.delete("jobs/J1/result.json").await.unwrap();
        assert!(!store.exists("jobs/J1/result.json").await.unwrap());
        store.delete("jobs/J1/result.json").await.unwrap();
    }

    #[tokio::test]
    async fn overwrite_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path()).unwrap();
        store.put("a/b.txt", b"one").await.unwrap();
        store.put("a/b.txt", b"two").await.unwrap();
        assert_eq!(store.get("a/b.txt").await.unwrap(), b"two");
        assert_eq!(store.list("a/").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn json_helpers_round_trip_values() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path()).unwrap();
        let value = serde_json::json!({"job_id": "J1", "status": "completed"});
        store.put_json(&keys::job_result("J1"), &value).await.unwrap();
        assert_eq!(store.get_json("jobs/J1/result.json").await.unwrap(), value);
    }

    #[tokio::test]
    async fn rejects_escaping_keys_and_reports_missing() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path()).unwrap();
        assert!(store.put("../outside", b"x").await.is_err());
        assert!(store.put("/abs", b"x").await.is_err());
        assert!(matches!(
            store.get("missing.json").await,
            Err(PipelineError::Storage(_))
        ));
    }
}

//! In-process remote store used by simulation mode and tests. Mirrors the
//! `RemoteStore` contract including newest-first listings.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;

use super::{RemoteStore, UploadResult};
use crate::core::RemoteFile;
use crate::error::{PipelineError, Result};

#[derive(Default)]
struct State {
    counter: u64,
    folder: Option<String>,
    files: Vec<RemoteFile>,
    contents: HashMap<String, Vec<u8>>,
    /// Ids whose deletion is forced to fail, for retention tests.
    fail_deletes: HashSet<String>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an artifact directly, bypassing `upload`. Later seeds get later
    /// creation times.
    pub fn seed(&self, name: &str, content: &[u8]) -> String {
        let mut state = self.state.lock().unwrap();
        state.counter += 1;
        let id = format!("mem-{}", state.counter);
        let file = RemoteFile {
            id: id.clone(),
            name: name.to_string(),
            created_time: Utc::now() + Duration::seconds(state.counter as i64),
            size_bytes: content.len() as u64,
        };
        state.files.push(file);
        state.contents.insert(id.clone(), content.to_vec());
        id
    }

    pub fn fail_delete_of(&self, id: &str) {
        self.state.lock().unwrap().fail_deletes.insert(id.to_string());
    }

    pub fn file_count(&self) -> usize {
        self.state.lock().unwrap().files.len()
    }

    pub fn content_of(&self, id: &str) -> Option<Vec<u8>> {
        self.state.lock().unwrap().contents.get(id).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        let mut files = state.files.clone();
        files.sort_by(|a, b| b.created_time.cmp(&a.created_time));
        files.into_iter().map(|f| f.name).collect()
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn ensure_folder(&self) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        if let Some(id) = &state.folder {
            return Ok(id.clone());
        }
        let id = "mem-folder".to_string();
        state.folder = Some(id.clone());
        Ok(id)
    }

    async fn upload(&self, local: &Path, name: &str, _folder_id: &str) -> Result<UploadResult> {
        let content = tokio::fs::read(local).await?;
        let size_bytes = content.len() as u64;
        let id = self.seed(name, &content);
        Ok(UploadResult { id, size_bytes })
    }

    async fn list(&self, _folder_id: &str) -> Result<Vec<RemoteFile>> {
        let state = self.state.lock().unwrap();
        let mut files = state.files.clone();
        files.sort_by(|a, b| b.created_time.cmp(&a.created_time));
        Ok(files)
    }

    async fn delete(&self, file_id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_deletes.contains(file_id) {
            return Err(PipelineError::RemoteOpFailed(format!(
                "simulated delete failure for {file_id}"
            )));
        }
        state.files.retain(|f| f.id != file_id);
        state.contents.remove(file_id);
        Ok(())
    }

    async fn download(&self, file_id: &str, dest: &Path) -> Result<()> {
        let content = {
            let state = self.state.lock().unwrap();
            state.contents.get(file_id).cloned()
        };
        let content = content.ok_or_else(|| {
            PipelineError::DownloadFailed(format!("no such remote file: {file_id}"))
        })?;
        tokio::fs::write(dest, content).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn lists_newest_first() {
        let store = MemoryStore::new();
        store.seed("old", b"1");
        store.seed("middle", b"2");
        store.seed("new", b"3");

        let files = store.list("mem-folder").await.unwrap();
        let names: Vec<_> = files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, ["new", "middle", "old"]);
    }

    #[tokio::test]
    async fn upload_then_download_round_trips() {
        let temp = tempdir().unwrap();
        let src = temp.path().join("artifact");
        std::fs::write(&src, b"artifact bytes").unwrap();

        let store = MemoryStore::new();
        let folder = store.ensure_folder().await.unwrap();
        let uploaded = store.upload(&src, "backup.zip", &folder).await.unwrap();
        assert_eq!(uploaded.size_bytes, 14);

        let dest = temp.path().join("recovered");
        store.download(&uploaded.id, &dest).await.unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"artifact bytes");
    }

    #[tokio::test]
    async fn forced_delete_failure_is_a_remote_op_error() {
        let store = MemoryStore::new();
        let id = store.seed("stuck", b"1");
        store.fail_delete_of(&id);

        let result = store.delete(&id).await;
        assert!(matches!(result, Err(PipelineError::RemoteOpFailed(_))));
        assert_eq!(store.file_count(), 1);
    }

    #[tokio::test]
    async fn ensure_folder_is_idempotent() {
        let store = MemoryStore::new();
        let a = store.ensure_folder().await.unwrap();
        let b = store.ensure_folder().await.unwrap();
        assert_eq!(a, b);
    }
}

//! Remote object storage: trait boundary plus the production OAuth2 Drive
//! client and an in-process fake for tests and simulation mode.

pub mod credentials;
pub mod drive;
pub mod memory;

use async_trait::async_trait;
use std::path::Path;

use crate::core::RemoteFile;
use crate::error::Result;

pub use credentials::{CredentialStore, FileTokenStore, TokenSet};
pub use drive::DriveStore;
pub use memory::MemoryStore;

#[derive(Debug, Clone)]
pub struct UploadResult {
    pub id: String,
    pub size_bytes: u64,
}

/// Off-site artifact storage. Every operation fails with `AuthRequired`
/// when no usable credentials are on hand; transport errors propagate to
/// the orchestrator, which owns job-level failure handling.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Resolve the destination folder id: config override first, then the
    /// per-process cache, then create-and-cache. Never duplicates a folder
    /// once cached.
    async fn ensure_folder(&self) -> Result<String>;

    /// Upload `local` under `name` into `folder_id`, streaming the file.
    async fn upload(&self, local: &Path, name: &str, folder_id: &str) -> Result<UploadResult>;

    /// All non-trashed files in the folder, newest first.
    async fn list(&self, folder_id: &str) -> Result<Vec<RemoteFile>>;

    async fn delete(&self, file_id: &str) -> Result<()>;

    /// Stream the remote content into `dest`.
    async fn download(&self, file_id: &str, dest: &Path) -> Result<()>;
}

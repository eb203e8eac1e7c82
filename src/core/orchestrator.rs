//! Pipeline orchestrator: drives dump → archive → encrypt → upload →
//! retention for backups and download → decrypt for restores, keeping the
//! job ledger current and enforcing single-flight execution.

use chrono::Utc;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::context::AppContext;
use crate::core::notifications::{JobEvent, NotificationChannel};
use crate::core::{archive, crypto, retention};
use crate::core::{BackupJob, Dumper, JobKind, JobStatus};
use crate::db::jobs;
use crate::error::{PipelineError, Result};
use crate::storage::RemoteStore;

pub struct Orchestrator {
    ctx: AppContext,
    dumper: Arc<dyn Dumper>,
    store: Arc<dyn RemoteStore>,
    notifier: Option<Arc<dyn NotificationChannel>>,
    /// Single-flight guard: id of the in-flight run. Owned by the instance
    /// so independent orchestrators (tests) never contend.
    active: Mutex<Option<String>>,
}

/// Timestamp-qualified temp file names so two runs can never collide in the
/// shared temp directory.
struct RunPaths {
    dump: PathBuf,
    zip: PathBuf,
    enc: PathBuf,
}

impl RunPaths {
    fn new(temp_dir: &Path, stamp: &str) -> Self {
        Self {
            dump: temp_dir.join(format!("dump-{stamp}.archive")),
            zip: temp_dir.join(format!("backup-{stamp}.zip")),
            enc: temp_dir.join(format!("backup-{stamp}.zip.enc")),
        }
    }

    /// Best-effort removal of every intermediate file; deletion failures
    /// are logged and swallowed on every exit path.
    fn cleanup(&self) {
        for path in [&self.dump, &self.zip, &self.enc] {
            if path.exists() {
                if let Err(e) = std::fs::remove_file(path) {
                    warn!(path = %path.display(), error = %e, "Failed to remove temp file");
                } else {
                    debug!(path = %path.display(), "Removed temp file");
                }
            }
        }
    }
}

impl Orchestrator {
    pub fn new(
        ctx: AppContext,
        dumper: Arc<dyn Dumper>,
        store: Arc<dyn RemoteStore>,
        notifier: Option<Arc<dyn NotificationChannel>>,
    ) -> Self {
        Self {
            ctx,
            dumper,
            store,
            notifier,
            active: Mutex::new(None),
        }
    }

    /// Run the full backup pipeline. Stage failures are recorded on the job
    /// (`failed`, error message preserved) and the final ledger row is
    /// returned; only `AlreadyRunning` is an error, raised before any row
    /// exists.
    pub async fn start_backup(
        &self,
        kind: JobKind,
        initiated_by: Option<String>,
    ) -> Result<BackupJob> {
        let job_id = Uuid::now_v7().to_string();
        self.acquire(&job_id)?;

        info!(job_id = %job_id, kind = kind.as_str(), "Backup started");

        if let Err(e) = jobs::create(&self.ctx.db, new_job(&job_id, kind, JobStatus::Running, initiated_by)).await {
            self.release();
            return Err(e);
        }

        let stamp = Utc::now().format("%Y-%m-%dT%H-%M-%S").to_string();
        let paths = RunPaths::new(&self.ctx.config.temp_dir, &stamp);

        let outcome = self.run_backup(&job_id, &stamp, &paths).await;

        paths.cleanup();
        self.release();

        self.finish(&job_id, outcome).await
    }

    /// Download a prior artifact and leave the recovered archive on disk
    /// for operator-driven verification and final load.
    pub async fn restore_backup(&self, file_id: &str) -> Result<BackupJob> {
        if file_id.trim().is_empty() {
            return Err(PipelineError::Validation(
                "a remote file id is required to restore".to_string(),
            ));
        }

        let job_id = Uuid::now_v7().to_string();
        self.acquire(&job_id)?;

        info!(job_id = %job_id, file_id, "Restore started");

        if let Err(e) = jobs::create(&self.ctx.db, new_job(&job_id, JobKind::Manual, JobStatus::Restoring, None)).await {
            self.release();
            return Err(e);
        }

        let outcome = self.run_restore(&job_id, file_id).await;
        self.release();

        self.finish(&job_id, outcome).await
    }

    /// The active run's ledger row, if any.
    pub async fn status(&self) -> Result<Option<BackupJob>> {
        let active = self.active.lock().unwrap().clone();
        match active {
            Some(job_id) => Ok(Some(jobs::get(&self.ctx.db, job_id).await?)),
            None => Ok(None),
        }
    }

    /// Job history, newest first.
    pub async fn history(&self, limit: u32) -> Result<Vec<BackupJob>> {
        jobs::recent(&self.ctx.db, limit).await
    }

    /// Passthrough to the storage adapter for arbitrary artifact downloads.
    pub async fn download_file(&self, file_id: &str, dest: &Path) -> Result<()> {
        self.store.download(file_id, dest).await
    }

    async fn run_backup(&self, job_id: &str, stamp: &str, paths: &RunPaths) -> Result<()> {
        let config = &self.ctx.config;
        std::fs::create_dir_all(&config.temp_dir)?;

        self.with_deadline("dump", self.dumper.dump(&config.database_url, &paths.dump))
            .await?;

        let dump = paths.dump.clone();
        let zip = paths.zip.clone();
        let assets = config.uploads_dir.clone();
        self.with_deadline(
            "archive",
            run_blocking(move || archive::bundle(&dump, assets.as_deref(), &zip)),
        )
        .await?;

        // Encryption decision: a configured key shorter than the minimum
        // disables encryption for the run rather than failing it.
        let encrypted = match config.encryption_key_bytes() {
            Some(key) => {
                let zip = paths.zip.clone();
                let enc = paths.enc.clone();
                self.with_deadline(
                    "encrypt",
                    run_blocking(move || crypto::encrypt_file(&zip, &enc, &key)),
                )
                .await?;
                true
            }
            None => {
                if config.encryption_key.is_some() {
                    warn!(job_id, "Encryption key shorter than 32 chars, uploading unencrypted");
                }
                false
            }
        };
        jobs::set_encrypted(&self.ctx.db, job_id.to_string(), encrypted).await?;

        let upload_path = if encrypted { &paths.enc } else { &paths.zip };
        let remote_name = format!(
            "{}-backup-{stamp}.zip{}",
            config.remote_prefix,
            if encrypted { ".enc" } else { "" }
        );

        let folder_id = self.with_deadline("upload", self.store.ensure_folder()).await?;
        let uploaded = self
            .with_deadline(
                "upload",
                self.store.upload(upload_path, &remote_name, &folder_id),
            )
            .await?;
        jobs::record_upload(
            &self.ctx.db,
            job_id.to_string(),
            uploaded.size_bytes,
            uploaded.id,
            folder_id.clone(),
        )
        .await?;

        let kept = self
            .with_deadline(
                "retention",
                retention::enforce_retention(self.store.as_ref(), &folder_id, config.retention_keep),
            )
            .await?;
        jobs::set_retention_kept(&self.ctx.db, job_id.to_string(), kept).await?;

        Ok(())
    }

    async fn run_restore(&self, job_id: &str, file_id: &str) -> Result<()> {
        let config = &self.ctx.config;
        std::fs::create_dir_all(&config.temp_dir)?;

        let stamp = Utc::now().format("%Y-%m-%dT%H-%M-%S").to_string();
        let key = config.encryption_key_bytes();
        let archive_path = config.temp_dir.join(format!("restore-{stamp}.zip"));
        let download_path = if key.is_some() {
            config.temp_dir.join(format!("restore-{stamp}.zip.enc"))
        } else {
            archive_path.clone()
        };

        let outcome = self
            .restore_stages(job_id, file_id, key, &download_path, &archive_path)
            .await;

        // A failed restore leaves no partial files that could be mistaken
        // for a recovered archive.
        if outcome.is_err() {
            for path in [&download_path, &archive_path] {
                if path.exists() {
                    if let Err(e) = std::fs::remove_file(path) {
                        warn!(path = %path.display(), error = %e, "Failed to remove temp file");
                    }
                }
            }
        }

        outcome
    }

    async fn restore_stages(
        &self,
        job_id: &str,
        file_id: &str,
        key: Option<[u8; 32]>,
        download_path: &Path,
        archive_path: &Path,
    ) -> Result<()> {
        self.with_deadline("download", self.store.download(file_id, download_path))
            .await?;
        let size_bytes = std::fs::metadata(download_path)?.len();
        jobs::record_restore(&self.ctx.db, job_id.to_string(), size_bytes, file_id.to_string())
            .await?;

        if let Some(key) = key {
            let src = download_path.to_path_buf();
            let dest = archive_path.to_path_buf();
            let result = self
                .with_deadline(
                    "decrypt",
                    run_blocking(move || crypto::decrypt_file(&src, &dest, &key)),
                )
                .await;
            // The encrypted download is intermediate either way.
            if let Err(e) = std::fs::remove_file(download_path) {
                warn!(path = %download_path.display(), error = %e, "Failed to remove temp file");
            }
            result?;
        }

        // The recovered archive intentionally stays on disk; the final load
        // into a live datastore is an operator step.
        info!(job_id, archive = %archive_path.display(), "Restore artifact ready for verification");
        Ok(())
    }

    /// Final ledger write plus completion notification; always runs, so no
    /// job is left in `running`/`restoring`.
    async fn finish(&self, job_id: &str, outcome: Result<()>) -> Result<BackupJob> {
        let (status, err_msg) = match &outcome {
            Ok(()) => (JobStatus::Completed, None),
            Err(e) => (JobStatus::Failed, Some(e.to_string())),
        };

        jobs::finish(&self.ctx.db, job_id.to_string(), status, err_msg.clone()).await?;
        let job = jobs::get(&self.ctx.db, job_id.to_string()).await?;

        match &job.status {
            JobStatus::Completed => info!(job_id, size_bytes = job.size_bytes, "Job completed"),
            _ => error!(job_id, error = err_msg.as_deref().unwrap_or(""), "Job failed"),
        }

        self.notify(&job).await;
        Ok(job)
    }

    async fn notify(&self, job: &BackupJob) {
        let Some(notifier) = &self.notifier else {
            return;
        };

        let event = match job.status {
            JobStatus::Completed => JobEvent::Completed {
                job_id: job.id.clone(),
                kind: job.kind,
                size_bytes: job.size_bytes,
                duration_secs: job
                    .finished_at
                    .map(|t| (t - job.started_at).num_seconds().max(0) as u64)
                    .unwrap_or(0),
            },
            JobStatus::Failed => JobEvent::Failed {
                job_id: job.id.clone(),
                kind: job.kind,
                error: job.error.clone().unwrap_or_default(),
            },
            _ => return,
        };

        if let Err(e) = notifier.notify(event).await {
            warn!(error = %e, "Failed to send job notification");
        }
    }

    fn acquire(&self, job_id: &str) -> Result<()> {
        let mut active = self.active.lock().unwrap();
        if active.is_some() {
            return Err(PipelineError::AlreadyRunning);
        }
        *active = Some(job_id.to_string());
        Ok(())
    }

    fn release(&self) {
        *self.active.lock().unwrap() = None;
    }

    async fn with_deadline<T>(
        &self,
        stage: &'static str,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        let secs = self.ctx.config.stage_timeout_secs;
        match tokio::time::timeout(Duration::from_secs(secs), fut).await {
            Ok(result) => result,
            Err(_) => Err(PipelineError::StageTimeout { stage, secs }),
        }
    }
}

fn new_job(
    job_id: &str,
    kind: JobKind,
    status: JobStatus,
    initiated_by: Option<String>,
) -> BackupJob {
    BackupJob {
        id: job_id.to_string(),
        kind,
        status,
        started_at: Utc::now(),
        finished_at: None,
        size_bytes: 0,
        drive_file_id: None,
        drive_folder_id: None,
        encrypted: false,
        retention_kept: 0,
        error: None,
        initiated_by,
    }
}

/// File-heavy stages run off the async executor.
async fn run_blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(|e| {
        PipelineError::Io(std::io::Error::other(format!(
            "blocking stage panicked: {e}"
        )))
    })?
}

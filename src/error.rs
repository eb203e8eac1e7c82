use thiserror::Error;

/// Failure taxonomy for the backup/restore pipeline.
///
/// `AlreadyRunning` and `Validation` are returned synchronously before any
/// ledger row exists; everything else is caught once at the orchestrator
/// boundary and recorded on the job as `failed`.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("dump utility unavailable: {0}")]
    ToolUnavailable(String),

    #[error("datastore dump failed: {0}")]
    DumpFailed(String),

    #[error("archive creation failed: {0}")]
    ArchiveFailed(String),

    #[error("remote storage authorization required: {0}")]
    AuthRequired(String),

    #[error("upload failed: {0}")]
    UploadFailed(String),

    #[error("download failed: {0}")]
    DownloadFailed(String),

    #[error("remote storage operation failed: {0}")]
    RemoteOpFailed(String),

    #[error("a backup or restore is already running")]
    AlreadyRunning,

    #[error("invalid request: {0}")]
    Validation(String),

    #[error("{stage} stage timed out after {secs}s")]
    StageTimeout { stage: &'static str, secs: u64 },

    #[error("encryption failed: {0}")]
    CryptoFailed(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("job ledger error: {0}")]
    Ledger(#[from] tokio_rusqlite::Error),
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;

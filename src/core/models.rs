use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One persisted pipeline run. Rows are append-only: a job is created when
/// a run starts, mutated in place as stages complete, and never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupJob {
    pub id: String,
    pub kind: JobKind,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub size_bytes: u64,
    pub drive_file_id: Option<String>,
    pub drive_folder_id: Option<String>,
    pub encrypted: bool,
    pub retention_kept: u32,
    pub error: Option<String>,
    /// Identity that triggered the run; None for scheduled runs.
    pub initiated_by: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Manual,
    Scheduled,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Scheduled => "scheduled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "manual" => Some(Self::Manual),
            "scheduled" => Some(Self::Scheduled),
            _ => None,
        }
    }
}

/// Status transitions are one-directional: `pending` exists only as the
/// initial value written together with `running`/`restoring`, and a job
/// never leaves `completed` or `failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Restoring,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Restoring => "restoring",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "restoring" => Some(Self::Restoring),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// A backup artifact as observed in the remote folder. Never persisted
/// locally; the retention collector works off fresh listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFile {
    pub id: String,
    pub name: String,
    pub created_time: DateTime<Utc>,
    pub size_bytes: u64,
}

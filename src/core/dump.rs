//! Dump stage: serializes the live datastore to a portable file via the
//! vendor `pg_dump` utility.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info};
use which::which;

use crate::error::{PipelineError, Result};

/// Produces a portable dump of the datastore at `database_url` into `dest`.
///
/// Abstracted so the pipeline is testable without PostgreSQL client tools
/// installed: `PgDumper` spawns the real binary, `FakeDumper` writes a
/// canned file (used in simulation mode and tests).
#[async_trait]
pub trait Dumper: Send + Sync {
    async fn dump(&self, database_url: &str, dest: &Path) -> Result<()>;
}

pub struct PgDumper {
    /// Explicit binary path from config; falls back to PATH lookup.
    binary: Option<PathBuf>,
}

impl PgDumper {
    pub fn new(binary: Option<PathBuf>) -> Self {
        Self { binary }
    }

    fn locate(&self) -> Result<PathBuf> {
        if let Some(path) = &self.binary {
            if path.is_file() {
                return Ok(path.clone());
            }
            return Err(PipelineError::ToolUnavailable(format!(
                "configured pg_dump path does not exist: {}",
                path.display()
            )));
        }

        which("pg_dump").map_err(|_| {
            PipelineError::ToolUnavailable(
                "pg_dump not found in PATH; install the PostgreSQL client tools \
                 (e.g. apt install postgresql-client) or set pg_dump_path"
                    .to_string(),
            )
        })
    }

    /// Lightweight probe run before the real dump so a missing or broken
    /// binary fails the job before any artifact is produced.
    async fn probe(&self, binary: &Path) -> Result<()> {
        let output = Command::new(binary)
            .arg("--version")
            .output()
            .await
            .map_err(|e| {
                PipelineError::ToolUnavailable(format!(
                    "failed to execute {}: {e}; install the PostgreSQL client tools",
                    binary.display()
                ))
            })?;

        if !output.status.success() {
            return Err(PipelineError::ToolUnavailable(format!(
                "{} --version exited with {}",
                binary.display(),
                output.status
            )));
        }

        debug!(
            version = %String::from_utf8_lossy(&output.stdout).trim(),
            "Dump utility probe succeeded"
        );
        Ok(())
    }
}

#[async_trait]
impl Dumper for PgDumper {
    async fn dump(&self, database_url: &str, dest: &Path) -> Result<()> {
        let binary = self.locate()?;
        self.probe(&binary).await?;

        info!(dest = %dest.display(), "Running pg_dump");

        // -Fc: custom format, compressed and portable across platforms.
        let output = Command::new(&binary)
            .arg("--format=custom")
            .arg("--file")
            .arg(dest)
            .arg(database_url)
            .output()
            .await
            .map_err(|e| PipelineError::DumpFailed(format!("failed to spawn pg_dump: {e}")))?;

        if !output.status.success() {
            return Err(PipelineError::DumpFailed(format!(
                "pg_dump exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(())
    }
}

/// Writes a canned dump file instead of touching a real datastore.
pub struct FakeDumper {
    pub content: Vec<u8>,
}

impl Default for FakeDumper {
    fn default() -> Self {
        Self {
            content: b"-- simulated dump\n".to_vec(),
        }
    }
}

#[async_trait]
impl Dumper for FakeDumper {
    async fn dump(&self, _database_url: &str, dest: &Path) -> Result<()> {
        tokio::fs::write(dest, &self.content).await?;
        Ok(())
    }
}

use chrono::{DateTime, Utc};
use tokio_rusqlite::rusqlite::OptionalExtension;
use tokio_rusqlite::{params, rusqlite, Connection};

use crate::core::{BackupJob, JobKind, JobStatus};
use crate::error::Result;

pub async fn create(conn: &Connection, job: BackupJob) -> Result<()> {
    conn.call(move |c| {
        c.execute(
            "INSERT INTO backup_jobs
             (id, kind, status, started_at, finished_at, size_bytes,
              drive_file_id, drive_folder_id, encrypted, retention_kept, error, initiated_by)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                &job.id,
                job.kind.as_str(),
                job.status.as_str(),
                job.started_at.to_rfc3339(),
                job.finished_at.map(|t| t.to_rfc3339()),
                job.size_bytes,
                &job.drive_file_id,
                &job.drive_folder_id,
                job.encrypted,
                job.retention_kept,
                &job.error,
                &job.initiated_by,
            ],
        )?;
        Ok(())
    })
    .await?;

    Ok(())
}

pub async fn get(conn: &Connection, job_id: String) -> Result<BackupJob> {
    let job = conn
        .call(move |c| {
            let mut stmt = c.prepare(
                "SELECT id, kind, status, started_at, finished_at, size_bytes,
                        drive_file_id, drive_folder_id, encrypted, retention_kept, error, initiated_by
                 FROM backup_jobs WHERE id = ?1",
            )?;
            let job = stmt.query_row(params![job_id], job_from_row)?;
            Ok(job)
        })
        .await?;

    Ok(job)
}

/// Final ledger write of a run: terminal status, finished_at, and the error
/// message when the run failed.
pub async fn finish(
    conn: &Connection,
    job_id: String,
    status: JobStatus,
    error: Option<String>,
) -> Result<()> {
    conn.call(move |c| {
        c.execute(
            "UPDATE backup_jobs
             SET status = ?2, finished_at = ?3, error = ?4
             WHERE id = ?1",
            params![job_id, status.as_str(), Utc::now().to_rfc3339(), error],
        )?;
        Ok(())
    })
    .await?;

    Ok(())
}

pub async fn record_upload(
    conn: &Connection,
    job_id: String,
    size_bytes: u64,
    file_id: String,
    folder_id: String,
) -> Result<()> {
    conn.call(move |c| {
        c.execute(
            "UPDATE backup_jobs
             SET size_bytes = ?2, drive_file_id = ?3, drive_folder_id = ?4
             WHERE id = ?1",
            params![job_id, size_bytes, file_id, folder_id],
        )?;
        Ok(())
    })
    .await?;

    Ok(())
}

/// Restore runs record the remote file they pulled and its size.
pub async fn record_restore(
    conn: &Connection,
    job_id: String,
    size_bytes: u64,
    file_id: String,
) -> Result<()> {
    conn.call(move |c| {
        c.execute(
            "UPDATE backup_jobs SET size_bytes = ?2, drive_file_id = ?3 WHERE id = ?1",
            params![job_id, size_bytes, file_id],
        )?;
        Ok(())
    })
    .await?;

    Ok(())
}

pub async fn set_encrypted(conn: &Connection, job_id: String, encrypted: bool) -> Result<()> {
    conn.call(move |c| {
        c.execute(
            "UPDATE backup_jobs SET encrypted = ?2 WHERE id = ?1",
            params![job_id, encrypted],
        )?;
        Ok(())
    })
    .await?;

    Ok(())
}

pub async fn set_retention_kept(conn: &Connection, job_id: String, kept: u32) -> Result<()> {
    conn.call(move |c| {
        c.execute(
            "UPDATE backup_jobs SET retention_kept = ?2 WHERE id = ?1",
            params![job_id, kept],
        )?;
        Ok(())
    })
    .await?;

    Ok(())
}

/// Job history for status display, newest first.
pub async fn recent(conn: &Connection, limit: u32) -> Result<Vec<BackupJob>> {
    let jobs = conn
        .call(move |c| {
            let mut stmt = c.prepare(
                "SELECT id, kind, status, started_at, finished_at, size_bytes,
                        drive_file_id, drive_folder_id, encrypted, retention_kept, error, initiated_by
                 FROM backup_jobs ORDER BY started_at DESC LIMIT ?1",
            )?;
            let jobs = stmt
                .query_map(params![limit], job_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(jobs)
        })
        .await?;

    Ok(jobs)
}

/// Most recent ledger row, if any. A non-terminal status here means a run
/// is in flight (or a crashed process left one behind).
pub async fn latest(conn: &Connection) -> Result<Option<BackupJob>> {
    let job = conn
        .call(|c| {
            let mut stmt = c.prepare(
                "SELECT id, kind, status, started_at, finished_at, size_bytes,
                        drive_file_id, drive_folder_id, encrypted, retention_kept, error, initiated_by
                 FROM backup_jobs ORDER BY started_at DESC LIMIT 1",
            )?;
            let job = stmt.query_row([], job_from_row).optional()?;
            Ok(job)
        })
        .await?;

    Ok(job)
}

pub async fn count(conn: &Connection) -> Result<u32> {
    let n = conn
        .call(|c| {
            let n: u32 = c.query_row("SELECT COUNT(*) FROM backup_jobs", [], |row| row.get(0))?;
            Ok(n)
        })
        .await?;

    Ok(n)
}

fn job_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<BackupJob> {
    let kind: String = row.get(1)?;
    let status: String = row.get(2)?;
    let started_at: String = row.get(3)?;
    let finished_at: Option<String> = row.get(4)?;

    Ok(BackupJob {
        id: row.get(0)?,
        kind: JobKind::from_str(&kind).ok_or_else(|| invalid_column(1, &kind))?,
        status: JobStatus::from_str(&status).ok_or_else(|| invalid_column(2, &status))?,
        started_at: parse_ts(3, &started_at)?,
        finished_at: finished_at.as_deref().map(|t| parse_ts(4, t)).transpose()?,
        size_bytes: row.get(5)?,
        drive_file_id: row.get(6)?,
        drive_folder_id: row.get(7)?,
        encrypted: row.get(8)?,
        retention_kept: row.get(9)?,
        error: row.get(10)?,
        initiated_by: row.get(11)?,
    })
}

fn parse_ts(idx: usize, value: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn invalid_column(idx: usize, value: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        format!("unexpected value: {value}").into(),
    )
}

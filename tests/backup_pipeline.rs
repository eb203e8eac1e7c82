use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Notify;
use tokio_rusqlite::Connection;

use vaultd::config::AppConfig;
use vaultd::context::AppContext;
use vaultd::core::{Dumper, FakeDumper, JobKind, JobStatus, Orchestrator, PgDumper};
use vaultd::db;
use vaultd::error::{PipelineError, Result};
use vaultd::storage::MemoryStore;

struct Harness {
    orchestrator: Arc<Orchestrator>,
    store: Arc<MemoryStore>,
    conn: Connection,
    temp: TempDir,
}

async fn setup(dumper: Arc<dyn Dumper>, configure: impl FnOnce(&mut AppConfig)) -> Harness {
    let temp = TempDir::new().unwrap();
    let mut config = AppConfig {
        database_url: "postgres://localhost/app".to_string(),
        temp_dir: temp.path().join("work"),
        ..Default::default()
    };
    configure(&mut config);

    let conn = db::init_in_memory().await.unwrap();
    let store = Arc::new(MemoryStore::new());
    let ctx = AppContext::new(config, conn.clone());
    let orchestrator = Arc::new(Orchestrator::new(ctx, dumper, store.clone(), None));

    Harness {
        orchestrator,
        store,
        conn,
        temp,
    }
}

fn asset_dir(temp: &TempDir, files: usize) -> std::path::PathBuf {
    let dir = temp.path().join("uploads");
    std::fs::create_dir_all(&dir).unwrap();
    for i in 0..files {
        std::fs::write(dir.join(format!("asset-{i}.bin")), format!("asset {i}")).unwrap();
    }
    dir
}

#[tokio::test]
async fn happy_path_with_assets_and_encryption() {
    let temp = TempDir::new().unwrap();
    let assets = asset_dir(&temp, 10);

    let dumper = Arc::new(FakeDumper {
        content: vec![0xAB; 40],
    });
    let h = setup(dumper, |c| {
        c.uploads_dir = Some(assets.clone());
        c.encryption_key = Some("k".repeat(32));
        c.retention_keep = 4;
    })
    .await;

    let job = h
        .orchestrator
        .start_backup(JobKind::Manual, Some("ops@example.com".to_string()))
        .await
        .unwrap();

    assert_eq!(job.status, JobStatus::Completed);
    assert!(job.encrypted);
    assert!(job.size_bytes > 0);
    assert!(job.drive_file_id.is_some());
    assert!(job.drive_folder_id.is_some());
    assert!(job.retention_kept <= 4);
    assert!(job.finished_at.is_some());
    assert_eq!(job.initiated_by.as_deref(), Some("ops@example.com"));

    // One encrypted artifact landed remotely.
    assert_eq!(h.store.file_count(), 1);
    let names = h.store.names();
    assert!(names[0].starts_with("vaultd-backup-"));
    assert!(names[0].ends_with(".zip.enc"));

    // Temp files are gone on the success path.
    let leftovers: Vec<_> = std::fs::read_dir(h.temp.path().join("work"))
        .unwrap()
        .collect();
    assert!(leftovers.is_empty());
}

#[tokio::test]
async fn short_key_uploads_plain_archive() {
    let h = setup(Arc::new(FakeDumper::default()), |c| {
        c.encryption_key = Some("too-short".to_string());
    })
    .await;

    let job = h
        .orchestrator
        .start_backup(JobKind::Manual, None)
        .await
        .unwrap();

    assert_eq!(job.status, JobStatus::Completed);
    assert!(!job.encrypted);

    let names = h.store.names();
    assert!(names[0].ends_with(".zip"));

    // The uploaded artifact is the plain zip, not ciphertext.
    let content = h.store.content_of(&job.drive_file_id.unwrap()).unwrap();
    assert_eq!(&content[..2], b"PK");
}

#[tokio::test]
async fn missing_dump_tool_fails_the_job_before_upload() {
    let temp = TempDir::new().unwrap();
    let dumper = Arc::new(PgDumper::new(Some(temp.path().join("missing-pg_dump"))));
    let h = setup(dumper, |_| {}).await;

    let job = h
        .orchestrator
        .start_backup(JobKind::Scheduled, None)
        .await
        .unwrap();

    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.finished_at.is_some());
    let error = job.error.unwrap();
    assert!(error.contains("missing-pg_dump"), "error was: {error}");

    // No remote upload was attempted.
    assert_eq!(h.store.file_count(), 0);
    assert!(job.drive_file_id.is_none());
}

/// Dumper that parks until released, to hold the single-flight guard open.
struct BlockedDumper {
    release: Arc<Notify>,
}

#[async_trait]
impl Dumper for BlockedDumper {
    async fn dump(&self, _database_url: &str, dest: &Path) -> Result<()> {
        self.release.notified().await;
        tokio::fs::write(dest, b"late dump").await?;
        Ok(())
    }
}

#[tokio::test]
async fn concurrent_start_is_rejected_without_a_second_job() {
    let release = Arc::new(Notify::new());
    let dumper = Arc::new(BlockedDumper {
        release: release.clone(),
    });
    let h = setup(dumper, |_| {}).await;

    let orchestrator = h.orchestrator.clone();
    let first = tokio::spawn(async move { orchestrator.start_backup(JobKind::Manual, None).await });

    // Let the first run reach the dump stage and park there.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let second = h.orchestrator.start_backup(JobKind::Manual, None).await;
    assert!(matches!(second, Err(PipelineError::AlreadyRunning)));
    assert_eq!(db::jobs::count(&h.conn).await.unwrap(), 1);

    release.notify_one();
    let job = first.await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);

    // Guard released: a follow-up run is accepted again.
    let third = h.orchestrator.start_backup(JobKind::Manual, None).await;
    assert!(third.is_ok());
}

/// Dumper that never finishes, to trip the stage deadline.
struct HangingDumper;

#[async_trait]
impl Dumper for HangingDumper {
    async fn dump(&self, _database_url: &str, _dest: &Path) -> Result<()> {
        std::future::pending::<()>().await;
        Ok(())
    }
}

#[tokio::test]
async fn stage_timeout_fails_the_job_and_releases_the_guard() {
    let h = setup(Arc::new(HangingDumper), |c| {
        c.stage_timeout_secs = 1;
    })
    .await;

    let job = h
        .orchestrator
        .start_backup(JobKind::Manual, None)
        .await
        .unwrap();

    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.finished_at.is_some());
    let error = job.error.unwrap();
    assert!(error.contains("timed out"), "error was: {error}");
    assert_eq!(h.store.file_count(), 0);

    // Guard released: the next run is accepted rather than rejected.
    let next = h.orchestrator.start_backup(JobKind::Manual, None).await;
    assert!(next.is_ok());
}

#[tokio::test]
async fn latest_ledger_row_tracks_the_in_flight_job() {
    let release = Arc::new(Notify::new());
    let dumper = Arc::new(BlockedDumper {
        release: release.clone(),
    });
    let h = setup(dumper, |_| {}).await;

    assert!(db::jobs::latest(&h.conn).await.unwrap().is_none());

    let orchestrator = h.orchestrator.clone();
    let run = tokio::spawn(async move { orchestrator.start_backup(JobKind::Manual, None).await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Mid-run the newest row is non-terminal, which is how a separate
    // process sees an active job.
    let mid = db::jobs::latest(&h.conn).await.unwrap().unwrap();
    assert_eq!(mid.status, JobStatus::Running);
    assert!(!mid.status.is_terminal());

    release.notify_one();
    let job = run.await.unwrap().unwrap();

    let after = db::jobs::latest(&h.conn).await.unwrap().unwrap();
    assert_eq!(after.id, job.id);
    assert_eq!(after.status, JobStatus::Completed);
}

#[tokio::test]
async fn repeated_runs_are_pruned_to_the_keep_count() {
    let h = setup(Arc::new(FakeDumper::default()), |c| {
        c.retention_keep = 3;
    })
    .await;

    let mut last = None;
    for _ in 0..5 {
        last = Some(
            h.orchestrator
                .start_backup(JobKind::Scheduled, None)
                .await
                .unwrap(),
        );
        // Distinct timestamps so remote names never collide.
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert_eq!(h.store.file_count(), 3);
    assert_eq!(last.unwrap().retention_kept, 3);
}

#[tokio::test]
async fn every_run_reaches_a_terminal_state() {
    let h = setup(Arc::new(FakeDumper::default()), |_| {}).await;

    h.orchestrator
        .start_backup(JobKind::Manual, None)
        .await
        .unwrap();
    let temp = TempDir::new().unwrap();
    let broken = Arc::new(PgDumper::new(Some(temp.path().join("nope"))));
    let h2 = setup(broken, |_| {}).await;
    h2.orchestrator
        .start_backup(JobKind::Manual, None)
        .await
        .unwrap();

    for conn in [&h.conn, &h2.conn] {
        for job in db::jobs::recent(conn, 10).await.unwrap() {
            assert!(job.status.is_terminal());
            assert!(job.finished_at.is_some());
        }
    }

    // Nothing is active once the runs are over.
    assert!(h.orchestrator.status().await.unwrap().is_none());
}

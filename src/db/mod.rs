use anyhow::Result;
use std::path::Path;
use tokio_rusqlite::Connection;

pub mod jobs;

pub async fn init(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path).await?;
    apply_schema(&conn).await?;
    Ok(conn)
}

/// In-memory ledger for tests and simulation mode.
pub async fn init_in_memory() -> Result<Connection> {
    let conn = Connection::open_in_memory().await?;
    apply_schema(&conn).await?;
    Ok(conn)
}

async fn apply_schema(conn: &Connection) -> Result<()> {
    conn.call(|conn| {
        let schema = include_str!("schema.sql");
        conn.execute_batch(schema)?;
        Ok::<(), tokio_rusqlite::rusqlite::Error>(())
    })
    .await?;

    Ok(())
}

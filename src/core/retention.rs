//! Retention collector: keeps only the `keep` most recent remote artifacts.

use tracing::{info, warn};

use crate::error::Result;
use crate::storage::RemoteStore;

/// Delete everything in `folder_id` beyond the `keep` newest files and
/// return how many were retained. Individual delete failures are logged and
/// skipped so one stuck artifact cannot abort the pass.
pub async fn enforce_retention(
    store: &dyn RemoteStore,
    folder_id: &str,
    keep: usize,
) -> Result<u32> {
    let files = store.list(folder_id).await?;
    let total = files.len();

    if total <= keep {
        return Ok(total as u32);
    }

    let mut deleted = 0usize;
    for file in &files[keep..] {
        match store.delete(&file.id).await {
            Ok(()) => {
                info!(file_id = %file.id, name = %file.name, "Pruned expired backup");
                deleted += 1;
            }
            Err(e) => {
                warn!(file_id = %file.id, error = %e, "Failed to prune backup, skipping");
            }
        }
    }

    Ok((total - deleted) as u32)
}

//! Archive stage: bundles the datastore dump and the optional asset
//! directory into a single zip, Deflated at maximum compression.

use std::fs::File;
use std::io::{self, Write};
use std::path::Path;
use tracing::{debug, info};
use walkdir::WalkDir;
use zip::{write::FileOptions, CompressionMethod, ZipWriter};

use crate::error::{PipelineError, Result};

/// Fixed top-level name the asset tree lives under inside the archive.
const ASSETS_PREFIX: &str = "uploads";

/// Bundle `primary` (under its base name) and, when present, the full tree
/// of `assets_dir` (under `uploads/`) into `dest_zip`.
pub fn bundle(primary: &Path, assets_dir: Option<&Path>, dest_zip: &Path) -> Result<()> {
    let out = File::create(dest_zip)?;
    let mut zip = ZipWriter::new(out);

    let result = write_entries(&mut zip, primary, assets_dir);

    // The writer must be finished on failure too, so the output handle is
    // closed before cleanup deletes the partial file.
    let finish = zip.finish();
    result?;
    finish.map_err(|e| PipelineError::ArchiveFailed(e.to_string()))?;

    info!(archive = %dest_zip.display(), "Archive created");
    Ok(())
}

fn write_entries(
    zip: &mut ZipWriter<File>,
    primary: &Path,
    assets_dir: Option<&Path>,
) -> Result<()> {
    let options = FileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .compression_level(Some(9))
        .large_file(true);

    let primary_name = primary
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| PipelineError::ArchiveFailed("dump file has no usable name".into()))?;

    add_file(zip, primary, primary_name, options)?;

    let Some(dir) = assets_dir else {
        return Ok(());
    };
    if !dir.is_dir() {
        debug!(dir = %dir.display(), "Asset directory absent, skipping");
        return Ok(());
    }

    for entry in WalkDir::new(dir).follow_links(false) {
        let entry = entry.map_err(|e| PipelineError::ArchiveFailed(e.to_string()))?;
        if !entry.file_type().is_file() {
            continue;
        }

        let relative = entry
            .path()
            .strip_prefix(dir)
            .map_err(|e| PipelineError::ArchiveFailed(e.to_string()))?;
        let name = format!("{ASSETS_PREFIX}/{}", relative.display());
        add_file(zip, entry.path(), &name, options)?;
    }

    Ok(())
}

fn add_file(
    zip: &mut ZipWriter<File>,
    path: &Path,
    name: &str,
    options: FileOptions,
) -> Result<()> {
    zip.start_file(name, options)
        .map_err(|e| PipelineError::ArchiveFailed(e.to_string()))?;

    let mut src = File::open(path)?;
    io::copy(&mut src, zip)?;
    zip.flush()?;

    debug!(entry = name, "Added archive entry");
    Ok(())
}

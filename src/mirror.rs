//! Module implementing the copy-if-missing mirror utility.
//!
//! Recordings live on an acquisition machine and are mirrored to external
//! storage; only files absent from the mirror are copied, so re-running after
//! an interrupted transfer is cheap and never overwrites existing data.
use std::fs;
use std::path::Path;
use walkdir::WalkDir;

use crate::error::SpikelineError;

/// Walk all files under the origin root and copy each one to the
/// corresponding path under the external root, unless a file already exists
/// there. Missing destination directories are created on the way.
///
/// Returns the number of files copied. Idempotent: a second run over an
/// unchanged tree copies nothing.
pub fn mirror_missing<P: AsRef<Path>, Q: AsRef<Path>>(
    origin_root: P,
    external_root: Q,
) -> Result<usize, SpikelineError> {
    let origin_root = origin_root.as_ref();
    let external_root = external_root.as_ref();

    let mut num_copied = 0;
    for entry in WalkDir::new(origin_root) {
        let entry = entry.map_err(|e| SpikelineError::TransientIO(e.to_string()))?;
        if !entry.file_type().is_file() {
            continue;
        }

        let relative = entry
            .path()
            .strip_prefix(origin_root)
            .expect("Walked entries live under the origin root");
        let destination = external_root.join(relative);
        if destination.exists() {
            continue;
        }

        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)?;
        }
        log::debug!(
            "Copying {} to {}",
            entry.path().display(),
            destination.display()
        );
        fs::copy(entry.path(), &destination)?;
        num_copied += 1;
    }

    Ok(num_copied)
}

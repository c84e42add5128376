//! Refuses writes that would destroy existing data unless the user unlocked them.

use std::fs;
use std::path::Path;

use crate::errors::{ConvertError, Result};

/// Kind of filesystem entry a conversion produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entry {
    File,
    Directory,
}

/// Checks that writing an `entry` at `path` is allowed. A file never replaces a directory and
/// a directory never replaces a file, unlocked or not.
pub fn check(path: &Path, entry: Entry, unlocked: bool) -> Result<()> {
    let denied = || Err(ConvertError::OverwriteDenied(path.to_path_buf()));

    if let Ok(metadata) = fs::metadata(path) {
        let kind_matches = match entry {
            Entry::File => metadata.is_file(),
            Entry::Directory => metadata.is_dir(),
        };
        if !kind_matches || !unlocked {
            return denied();
        }
    }

    // The closest existing ancestor has to be a directory we can create the rest in.
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        if let Some(existing) = parent.ancestors().find(|a| a.exists()) {
            if !existing.is_dir() {
                return Err(ConvertError::OverwriteDenied(existing.to_path_buf()));
            }
        }
    }
    Ok(())
}

/// Creates the directories leading to `path`. Only called once [`check`] passed.
pub fn prepare_parent(path: &Path) -> Result<()> {
    match path.parent().filter(|p| !p.as_os_str().is_empty()) {
        Some(parent) if !parent.is_dir() => {
            log::info!("creating directory {}", parent.display());
            fs::create_dir_all(parent).map_err(|e| ConvertError::io(parent, e))
        }
        _ => Ok(()),
    }
}

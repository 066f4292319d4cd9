//! Hardlinked tree clones
//!
//! A new generation is a copy of "current" in which only the directory
//! skeleton is new: every file is a hardlink to the inode already in
//! "current", so unchanged data is shared between all generations.

use crate::error::{HardsnapError, Result};
use crate::types::CloneStats;
use crate::utils;
use filetime::FileTime;
use std::fs;
use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::{Path, PathBuf};
use tracing::{debug, trace};
use walkdir::WalkDir;

/// Directory attributes restored once its contents exist
struct DirAttrs {
    path: PathBuf,
    mode: u32,
    atime: FileTime,
    mtime: FileTime,
}

/// Clone `source` into `dest` (which must not exist) using hardlinks
///
/// Directories are recreated with their permission bits and timestamps,
/// symlinks are recreated with the same target and every other entry
/// (regular files, fifos, device nodes) becomes a hardlink to the source inode.
pub fn link_clone(source: &Path, dest: &Path) -> Result<CloneStats> {
    if !source.is_dir() {
        return Err(HardsnapError::SnapshotIncomplete {
            path: source.to_path_buf(),
            reason: "clone source is not a directory".to_string(),
        });
    }

    let mut stats = CloneStats::default();
    let mut dirs = Vec::new();

    for entry in WalkDir::new(source).follow_links(false).sort_by_file_name() {
        let entry = entry?;
        let rel = entry
            .path()
            .strip_prefix(source)
            .map_err(|e| HardsnapError::internal(format!("walk escaped clone source: {}", e)))?;
        let target = dest.join(rel);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir(&target)?;
            let meta = entry.metadata()?;
            dirs.push(DirAttrs {
                path: target,
                mode: meta.permissions().mode() & 0o7777,
                atime: FileTime::from_last_access_time(&meta),
                mtime: FileTime::from_last_modification_time(&meta),
            });
            stats.directories += 1;
        } else if file_type.is_symlink() {
            let link = fs::read_link(entry.path())?;
            symlink(&link, &target)?;
            stats.symlinks += 1;
        } else {
            fs::hard_link(entry.path(), &target)?;
            stats.hardlinks += 1;
        }
        trace!("Cloned {:?}", rel);
    }

    // Deepest first, so restrictive modes never block the children and
    // parents' mtimes are set after their entries were created
    for dir in dirs.iter().rev() {
        utils::set_permissions(&dir.path, dir.mode)?;
        utils::set_times(&dir.path, dir.atime, dir.mtime)?;
    }

    debug!(
        "Cloned {:?} -> {:?}: {} dirs, {} hardlinks, {} symlinks",
        source, dest, stats.directories, stats.hardlinks, stats.symlinks
    );
    Ok(stats)
}

//! Utility functions for hardsnap
//!
//! Small filesystem and formatting helpers shared by the rotation and
//! reconciliation engines.
//!
//! ## Categories of Utilities
//!
//! ### File Operations
//! - Permission and timestamp updates
//! - Collision-free temporary sibling names for atomic replace-by-rename
//!
//! ### Data Processing
//! - Byte formatting (human-readable sizes)
//! - Epoch seconds to local calendar time
//!
//! ## Error Handling
//!
//! All fallible functions return `Result<T, HardsnapError>`.

use crate::error::{HardsnapError, Result};
use chrono::{DateTime, Local, TimeZone};
use filetime::FileTime;
use std::ffi::OsStr;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tracing::trace;
use uuid::Uuid;

/// Prefix of directories quarantined for background deletion
pub const REAP_PREFIX: &str = ".reap-";

/// Prefix of directories being built by a hardlinked clone
pub const STAGE_PREFIX: &str = ".stage-";

/// Infix of temporary hardlinks created while relinking
pub const RELINK_INFIX: &str = ".hslink-";

/// Length of the lowercase hex suffix ending every generated name
pub const GENERATED_SUFFIX_LEN: usize = 32;

/// Set Unix permission bits
pub fn set_permissions(path: &Path, mode: u32) -> Result<()> {
    fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    Ok(())
}

/// Set modification and access times without following symlinks
pub fn set_times(path: &Path, atime: FileTime, mtime: FileTime) -> Result<()> {
    filetime::set_symlink_file_times(path, atime, mtime)?;
    Ok(())
}

/// A fresh, unused name next to `path`
///
/// The name is hidden and tagged so that traversals can recognise and skip
/// it, e.g. `dir/.report.pdf.hslink-<uuid>` for `dir/report.pdf`.
pub fn temp_sibling(path: &Path, infix: &str) -> Result<PathBuf> {
    let name = path
        .file_name()
        .ok_or_else(|| HardsnapError::internal(format!("Path {:?} has no file name", path)))?;
    let mut tmp = std::ffi::OsString::from(".");
    tmp.push(name);
    tmp.push(infix);
    tmp.push(Uuid::new_v4().simple().to_string());
    let sibling = path.with_file_name(tmp);
    trace!("Temporary sibling for {:?}: {:?}", path, sibling);
    Ok(sibling)
}

/// A fresh, unused directory name inside `root` with the given prefix
pub fn unique_child(root: &Path, prefix: &str) -> PathBuf {
    root.join(format!("{}{}", prefix, Uuid::new_v4().simple()))
}

/// Whether `name` is `prefix` followed by a suffix from [`unique_child`]
pub fn is_generated_child(name: &OsStr, prefix: &str) -> bool {
    name.to_str()
        .and_then(|name| name.strip_prefix(prefix))
        .is_some_and(|suffix| {
            suffix.len() == GENERATED_SUFFIX_LEN
                && suffix.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        })
}

/// Convert epoch seconds to local calendar time
pub fn local_time(epoch: i64) -> Option<DateTime<Local>> {
    Local.timestamp_opt(epoch, 0).single()
}

/// Format bytes in human-readable form
///
/// Uses binary units (1024-based).
///
/// ```rust,ignore
/// assert_eq!(format_bytes(1536), "1.50 KB");
/// ```
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{} {}", size as u64, UNITS[unit_idx])
    } else {
        format!("{:.2} {}", size, UNITS[unit_idx])
    }
}

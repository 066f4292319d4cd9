//! Depth-first traversal of reconciliation inputs
//!
//! [`TreeWalker`] turns a list of input paths (files or directories) into a
//! lazy stream of regular files with their [`FileIdentity`]. Directories are
//! walked depth-first with entries sorted by name at every level, so two runs
//! over the same tree visit files in the same order. Symlinks are never
//! followed and only regular files are yielded.

use crate::error::{HardsnapError, Result};
use crate::record::RECORD_FILE;
use crate::types::FileIdentity;
use crate::utils::{GENERATED_SUFFIX_LEN, RELINK_INFIX, REAP_PREFIX, STAGE_PREFIX};
use globset::{Glob, GlobBuilder, GlobSet, GlobSetBuilder};
use std::ffi::OsString;
use std::fs;
use std::path::{Component, Path, PathBuf};
use tracing::trace;
use walkdir::WalkDir;

/// Paths skipped by every traversal: hardsnap's own bookkeeping artifacts
///
/// Each pattern matches a single path component, and generated names only
/// when they carry a generated suffix, so user data such as `.stage-area`
/// is still visited.
fn builtin_patterns() -> Vec<String> {
    let suffix = "[0-9a-f]".repeat(GENERATED_SUFFIX_LEN);
    vec![
        format!("**/{}", RECORD_FILE),
        format!("**/{}.*", RECORD_FILE),
        format!("**/{}{}", REAP_PREFIX, suffix),
        format!("**/{}{}", STAGE_PREFIX, suffix),
        format!("**/.?*{}{}", RELINK_INFIX, suffix),
    ]
}

fn build_builtin_set() -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in builtin_patterns() {
        let glob = GlobBuilder::new(&pattern)
            .literal_separator(true)
            .build()
            .map_err(|e| HardsnapError::InvalidPattern(format!("{}: {}", pattern, e)))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| HardsnapError::InvalidPattern(format!("Failed to build pattern set: {}", e)))
}

/// Exclusion patterns applied to every visited path
#[derive(Debug, Clone)]
pub struct WalkFilter {
    builtin: GlobSet,
    user: GlobSet,
}

impl WalkFilter {
    /// Build a filter from user glob patterns (matched against full paths)
    pub fn new(patterns: &[String]) -> Result<Self> {
        Ok(Self {
            builtin: build_builtin_set()?,
            user: build_glob_set(patterns)?,
        })
    }

    /// Whether `path` must be skipped
    pub fn is_excluded(&self, path: &Path) -> bool {
        self.builtin.is_match(path) || self.user.is_match(path)
    }
}

impl Default for WalkFilter {
    fn default() -> Self {
        Self {
            builtin: build_builtin_set().unwrap_or_else(|_| GlobSet::empty()),
            user: GlobSet::empty(),
        }
    }
}

fn build_glob_set(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern)
            .map_err(|e| HardsnapError::InvalidPattern(format!("{}: {}", pattern, e)))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| HardsnapError::InvalidPattern(format!("Failed to build pattern set: {}", e)))
}

/// Top-level subtree a file belongs to
///
/// `root` is the position of the input the file was found under; `component`
/// is the first path component beneath that input, or `None` when the input
/// was the file itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopKey {
    /// Index of the input path
    pub root: usize,
    /// First component below the input
    pub component: Option<OsString>,
}

/// A regular file eligible for reconciliation
#[derive(Debug, Clone)]
pub struct WalkEntry {
    /// Path as reached from the input
    pub path: PathBuf,
    /// Identity captured when the file was visited
    pub identity: FileIdentity,
    /// Subtree used for scope decisions
    pub top: TopKey,
}

/// One step of a traversal
#[derive(Debug, Clone)]
pub enum WalkItem {
    /// A file to reconcile
    File(WalkEntry),
    /// A regular file smaller than the size floor
    BelowFloor(PathBuf),
    /// A file or pruned directory matching an exclusion pattern
    Excluded(PathBuf),
}

/// Lazy depth-first walk over several inputs
pub struct TreeWalker<'a> {
    inputs: Box<dyn Iterator<Item = PathBuf> + 'a>,
    filter: WalkFilter,
    size_floor: u64,
    next_root: usize,
    current: Option<(usize, PathBuf, walkdir::IntoIter)>,
}

impl<'a> TreeWalker<'a> {
    /// Walk `inputs` in order, skipping files below `size_floor` bytes
    pub fn new(inputs: impl Iterator<Item = PathBuf> + 'a, filter: WalkFilter, size_floor: u64) -> Self {
        Self {
            inputs: Box::new(inputs),
            filter,
            size_floor,
            next_root: 0,
            current: None,
        }
    }
}

impl std::fmt::Debug for TreeWalker<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TreeWalker")
            .field("size_floor", &self.size_floor)
            .field("next_root", &self.next_root)
            .field("current", &self.current.as_ref().map(|(_, root, _)| root))
            .finish()
    }
}

fn classify(path: PathBuf, meta: &fs::Metadata, top: TopKey, size_floor: u64) -> WalkItem {
    let identity = FileIdentity::from_metadata(meta);
    if identity.size < size_floor {
        WalkItem::BelowFloor(path)
    } else {
        WalkItem::File(WalkEntry { path, identity, top })
    }
}

fn top_component(root: &Path, path: &Path) -> Option<OsString> {
    path.strip_prefix(root)
        .ok()?
        .components()
        .find_map(|c| match c {
            Component::Normal(name) => Some(name.to_os_string()),
            _ => None,
        })
}

impl Iterator for TreeWalker<'_> {
    type Item = Result<WalkItem>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some((index, root, iter)) = &mut self.current {
                let entry = match iter.next() {
                    None => {
                        self.current = None;
                        continue;
                    }
                    Some(Err(e)) => return Some(Err(e.into())),
                    Some(Ok(entry)) => entry,
                };
                if entry.depth() == 0 {
                    continue;
                }

                let file_type = entry.file_type();
                if self.filter.is_excluded(entry.path()) {
                    if file_type.is_dir() {
                        iter.skip_current_dir();
                    }
                    trace!("Excluded {:?}", entry.path());
                    return Some(Ok(WalkItem::Excluded(entry.into_path())));
                }
                if !file_type.is_file() {
                    continue;
                }

                let meta = match entry.metadata() {
                    Ok(meta) => meta,
                    Err(e) => return Some(Err(e.into())),
                };
                let top = TopKey {
                    root: *index,
                    component: top_component(root, entry.path()),
                };
                return Some(Ok(classify(entry.into_path(), &meta, top, self.size_floor)));
            }

            let input = self.inputs.next()?;
            let index = self.next_root;
            self.next_root += 1;

            if self.filter.is_excluded(&input) {
                return Some(Ok(WalkItem::Excluded(input)));
            }
            let meta = match fs::symlink_metadata(&input) {
                Ok(meta) => meta,
                Err(e) => return Some(Err(e.into())),
            };
            if meta.is_dir() {
                let iter = WalkDir::new(&input)
                    .follow_links(false)
                    .sort_by_file_name()
                    .into_iter();
                self.current = Some((index, input, iter));
            } else if meta.is_file() {
                let top = TopKey {
                    root: index,
                    component: None,
                };
                return Some(Ok(classify(input, &meta, top, self.size_floor)));
            }
        }
    }
}

// src/fs/mod.rs

//! Thin filesystem abstraction used by the local dataspaces.

use std::fmt::Debug;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::task::selector::SelectorMatcher;

/// Abstract filesystem interface.
pub trait FileSystem: Send + Sync + Debug {
    fn is_file(&self, path: &Path) -> bool;
    fn is_dir(&self, path: &Path) -> bool;

    /// Return a list of entries in a directory.
    /// Returns full paths.
    fn read_dir(&self, path: &Path) -> Result<Vec<PathBuf>>;

    /// Copy one file, creating parent directories of `to`.
    fn copy_file(&self, from: &Path, to: &Path) -> Result<()>;

    fn create_dir_all(&self, path: &Path) -> Result<()>;

    /// Remove everything below `path`, keeping `path` itself.
    fn clear_dir(&self, path: &Path) -> Result<()>;
}

/// Implementation that uses `std::fs`.
#[derive(Debug, Clone, Default)]
pub struct RealFileSystem;

impl FileSystem for RealFileSystem {
    fn is_file(&self, path: &Path) -> bool {
        path.is_file()
    }

    fn is_dir(&self, path: &Path) -> bool {
        path.is_dir()
    }

    fn read_dir(&self, path: &Path) -> Result<Vec<PathBuf>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(path).with_context(|| format!("reading dir {:?}", path))? {
            let entry = entry?;
            entries.push(entry.path());
        }
        Ok(entries)
    }

    fn copy_file(&self, from: &Path, to: &Path) -> Result<()> {
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent).with_context(|| format!("creating dir {:?}", parent))?;
        }
        fs::copy(from, to).with_context(|| format!("copying {:?} to {:?}", from, to))?;
        Ok(())
    }

    fn create_dir_all(&self, path: &Path) -> Result<()> {
        fs::create_dir_all(path).with_context(|| format!("creating dir {:?}", path))
    }

    fn clear_dir(&self, path: &Path) -> Result<()> {
        for entry in self.read_dir(path)? {
            if entry.is_dir() {
                fs::remove_dir_all(&entry).with_context(|| format!("removing {:?}", entry))?;
            } else {
                fs::remove_file(&entry).with_context(|| format!("removing {:?}", entry))?;
            }
        }
        Ok(())
    }
}

/// Collect all files under `root` whose root-relative path matches.
pub fn collect_matching_files(
    fs: &dyn FileSystem,
    root: &Path,
    matcher: &SelectorMatcher,
) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut stack = vec![root.to_path_buf()];

    while let Some(dir) = stack.pop() {
        for path in fs.read_dir(&dir)? {
            if fs.is_dir(&path) {
                stack.push(path);
            } else if fs.is_file(&path) {
                if let Ok(rel) = path.strip_prefix(root) {
                    let rel_str = rel.to_string_lossy().replace('\\', "/");
                    if matcher.matches(&rel_str) {
                        files.push(path);
                    }
                }
            }
        }
    }

    files.sort();
    Ok(files)
}

/// Copy every matching file from `src_root` to the same relative location
/// under `dst_root`. Returns the number of files copied.
pub fn copy_matching_files(
    fs: &dyn FileSystem,
    src_root: &Path,
    dst_root: &Path,
    matcher: &SelectorMatcher,
) -> Result<usize> {
    let files = collect_matching_files(fs, src_root, matcher)?;
    for file in &files {
        let rel = file.strip_prefix(src_root).unwrap_or(file.as_path());
        fs.copy_file(file, &dst_root.join(rel))?;
    }
    Ok(files.len())
}

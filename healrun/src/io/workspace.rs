//! Project workspace access: code snapshots and sandboxed writes.

use std::fs;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result, bail};
use tracing::{debug, instrument};
use walkdir::{DirEntry, WalkDir};

use crate::core::types::{CodeContext, WriteFile};

/// Directories never included in a code snapshot.
const SKIPPED_DIRS: [&str; 6] = [".git", ".healrun", "node_modules", "target", "__pycache__", ".venv"];

/// Files larger than this are left out of snapshots.
const MAX_SNAPSHOT_FILE_BYTES: u64 = 64 * 1024;

fn is_skipped(entry: &DirEntry) -> bool {
    entry.depth() > 0
        && entry.file_type().is_dir()
        && entry
            .file_name()
            .to_str()
            .is_some_and(|name| SKIPPED_DIRS.contains(&name))
}

/// Read the workspace's text files into a [`CodeContext`], sorted by path.
///
/// Binary, non-UTF-8 and oversized files are skipped. A missing workspace is
/// an empty context.
#[instrument(skip_all, fields(workspace = %workspace.display()))]
pub fn snapshot_code(workspace: &Path) -> Result<CodeContext> {
    if !workspace.exists() {
        return Ok(CodeContext::default());
    }
    let mut files = Vec::new();
    for entry in WalkDir::new(workspace)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| !is_skipped(entry))
    {
        let entry = entry.with_context(|| format!("walk {}", workspace.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let metadata = entry
            .metadata()
            .with_context(|| format!("stat {}", entry.path().display()))?;
        if metadata.len() > MAX_SNAPSHOT_FILE_BYTES {
            debug!(path = %entry.path().display(), bytes = metadata.len(), "skipping large file");
            continue;
        }
        let Ok(content) = fs::read_to_string(entry.path()) else {
            continue;
        };
        let relative = entry.path().strip_prefix(workspace).unwrap_or(entry.path());
        files.push(WriteFile {
            file_name: relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/"),
            content,
        });
    }
    debug!(files = files.len(), "captured code snapshot");
    Ok(CodeContext { files })
}

/// Resolve `file_name` inside `workspace`, refusing absolute paths and any
/// `..` component.
pub fn resolve_in_workspace(workspace: &Path, file_name: &str) -> Result<PathBuf> {
    let relative = Path::new(file_name.trim());
    if relative.as_os_str().is_empty() {
        bail!("file name is empty");
    }
    let mut resolved = workspace.to_path_buf();
    for component in relative.components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                bail!("file name {file_name:?} escapes the workspace");
            }
        }
    }
    if resolved == workspace {
        bail!("file name {file_name:?} names the workspace itself");
    }
    Ok(resolved)
}

/// Write one file into the workspace, creating parent directories.
pub fn write_file(workspace: &Path, file: &WriteFile) -> Result<PathBuf> {
    let path = resolve_in_workspace(workspace, &file.file_name)?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    }
    fs::write(&path, &file.content).with_context(|| format!("write {}", path.display()))?;
    debug!(path = %path.display(), bytes = file.content.len(), "wrote workspace file");
    Ok(path)
}

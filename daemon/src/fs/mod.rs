//! Node filesystem access.
//!
//! All daemon I/O on a node's directory tree goes through [`NodeFs`].
//! Paths everywhere else in the daemon are relative to the node root;
//! absolute assembly happens only here.

pub mod updown;

use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use rand::Rng;
use tokio::fs;
use tokio::io;
use walkdir::WalkDir;

use crate::error::DaemonResult;
use alpenhorn::hash::Hash;

/// The marker file proving a node root is initialized.
///
/// Contains the node's name, newline-terminated. The name is reserved:
/// it can never be imported, on any node.
pub const NODE_MARKER: &str = "ALPENHORN_NODE";

/// Is this basename hidden from import?
pub fn is_hidden(name: &str) -> bool {
    name.starts_with('.')
}

/// The lock file basename suppressing import of `name`.
pub fn lock_file_for(name: &str) -> String {
    format!(".{}.lock", name)
}

/// If `name` is a lock file, the basename it locks.
pub fn locked_name(name: &str) -> Option<&str> {
    name.strip_prefix('.')
        .and_then(|n| n.strip_suffix(".lock"))
        .filter(|n| !n.is_empty())
}

/// A hidden temporary basename for an in-flight transfer of `name`.
pub fn temp_name(name: &str) -> String {
    let suffix: u32 = rand::thread_rng().gen();
    format!(".{}.{:08x}", name, suffix)
}

/// Is this basename fair game for the tidy-up sweep?
///
/// Hidden files that aren't lock files are the daemon's own leftovers
/// (transfer temporaries, placeholders); lock files belong to whatever
/// is writing the data.
pub fn is_temp_candidate(name: &str) -> bool {
    is_hidden(name) && locked_name(name).is_none()
}

/// Why a path can't be imported, if it can't be.
pub fn invalid_import_path(path: &str) -> Option<&'static str> {
    if path.is_empty() {
        return Some("empty path");
    }
    if path.ends_with('/') {
        return Some("directory path");
    }

    let path = Path::new(path);
    if path.is_absolute() {
        return Some("absolute path");
    }
    for component in path.components() {
        match component {
            Component::Normal(_) => {}
            _ => return Some("path not in normal form"),
        }
    }
    if path.components().next() == Some(Component::Normal(NODE_MARKER.as_ref())) {
        return Some("reserved name");
    }

    None
}

/// Read/write access to one node's directory tree.
#[derive(Debug, Clone)]
pub struct NodeFs {
    root: PathBuf,
}

impl NodeFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Joins a node-relative path onto the root.
    pub fn full_path(&self, rel: impl AsRef<Path>) -> PathBuf {
        self.root.join(rel)
    }

    pub async fn exists(&self, rel: &str) -> bool {
        fs::symlink_metadata(self.full_path(rel)).await.is_ok()
    }

    /// Is the path a regular file (not a symlink)?
    pub async fn is_file(&self, rel: &str) -> bool {
        fs::symlink_metadata(self.full_path(rel))
            .await
            .map(|m| m.is_file())
            .unwrap_or(false)
    }

    pub async fn file_size(&self, rel: &str) -> DaemonResult<u64> {
        Ok(fs::metadata(self.full_path(rel)).await?.len())
    }

    /// Time since the path was last modified.
    pub async fn modified_age(&self, rel: &str) -> Option<Duration> {
        let modified = fs::metadata(self.full_path(rel))
            .await
            .ok()?
            .modified()
            .ok()?;

        modified.elapsed().ok()
    }

    pub async fn md5sum(&self, rel: &str) -> DaemonResult<Hash> {
        Ok(Hash::md5_from_file(&self.full_path(rel)).await?)
    }

    /// Creates the parent directories of a path.
    pub async fn mkdir_parents(&self, rel: &str) -> DaemonResult<()> {
        if let Some(parent) = self.full_path(rel).parent() {
            fs::create_dir_all(parent).await?;
        }

        Ok(())
    }

    /// Renames within the node root.
    ///
    /// Rename on one filesystem is atomic: an observer sees either
    /// nothing at the destination or the complete file.
    pub async fn atomic_rename(&self, from_rel: &str, to_rel: &str) -> DaemonResult<()> {
        fs::rename(self.full_path(from_rel), self.full_path(to_rel)).await?;

        Ok(())
    }

    pub async fn remove_file(&self, rel: &str) -> DaemonResult<()> {
        fs::remove_file(self.full_path(rel)).await?;

        Ok(())
    }

    /// Removes now-empty directories above a deleted file.
    ///
    /// Walks from the file's directory up to (never including) the node
    /// root, removing each directory that has become empty. Stops at the
    /// first non-empty directory.
    pub async fn remove_empty_parents(&self, rel: &str) {
        let mut dir = match Path::new(rel).parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => return,
        };

        loop {
            let full = self.full_path(dir);
            match fs::remove_dir(&full).await {
                Ok(()) => {
                    tracing::info!("Removed empty directory: {}", full.display());
                }
                // Not empty, or already gone; either way we're done
                Err(_) => return,
            }

            dir = match dir.parent() {
                Some(parent) if !parent.as_os_str().is_empty() => parent,
                _ => return,
            };
        }
    }

    /// Free space on the filesystem holding the node root.
    pub async fn bytes_avail(&self) -> Option<u64> {
        let root = match fs::canonicalize(&self.root).await {
            Ok(root) => root,
            Err(_) => self.root.clone(),
        };

        tokio::task::spawn_blocking(move || {
            let disks = sysinfo::Disks::new_with_refreshed_list();
            disks
                .list()
                .iter()
                .filter(|d| root.starts_with(d.mount_point()))
                .max_by_key(|d| d.mount_point().as_os_str().len())
                .map(|d| d.available_space())
        })
        .await
        .ok()
        .flatten()
    }

    /// Lists all regular files under a directory, in sorted order.
    ///
    /// Paths are returned relative to the node root.
    pub async fn walk(&self, rel: &str) -> DaemonResult<Vec<String>> {
        let root = self.root.clone();
        let base = self.full_path(rel);

        let files = tokio::task::spawn_blocking(move || {
            let mut files = Vec::new();
            for entry in WalkDir::new(&base).sort_by_file_name() {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(e) => {
                        tracing::warn!("Error during scan: {}", e);
                        continue;
                    }
                };

                if !entry.file_type().is_file() {
                    continue;
                }

                if let Ok(rel) = entry.path().strip_prefix(&root) {
                    files.push(rel.to_string_lossy().into_owned());
                }
            }
            files
        })
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

        Ok(files)
    }

    /// Reads the node marker, if present and readable.
    pub async fn read_marker(&self) -> Option<String> {
        fs::read_to_string(self.full_path(NODE_MARKER))
            .await
            .ok()
            .map(|s| s.trim().to_string())
    }

    /// Writes the node marker.
    pub async fn write_marker(&self, node_name: &str) -> DaemonResult<()> {
        fs::write(self.full_path(NODE_MARKER), format!("{}\n", node_name)).await?;

        Ok(())
    }
}

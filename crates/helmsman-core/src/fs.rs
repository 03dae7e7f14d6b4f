//! Filesystem seam.
//!
//! The runtime persists scratchpad blobs, checkpoints, and the failure
//! knowledge base through this trait. Paths are opaque relative strings;
//! the runtime never interprets them.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::CoreError;

pub trait WorkspaceFs: Send + Sync {
    fn read(&self, path: &str) -> Result<String, CoreError>;
    fn write(&self, path: &str, contents: &str) -> Result<(), CoreError>;
    fn exists(&self, path: &str) -> bool;
}

/// Disk-backed store rooted at a directory. Writes go to a `.tmp`
/// sibling first, then rename, so readers never observe partial files.
pub struct DiskFs {
    root: PathBuf,
}

impl DiskFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(Path::new(path))
    }
}

impl WorkspaceFs for DiskFs {
    fn read(&self, path: &str) -> Result<String, CoreError> {
        let full = self.resolve(path);
        std::fs::read_to_string(&full).map_err(|e| CoreError::fs(path, e))
    }

    fn write(&self, path: &str, contents: &str) -> Result<(), CoreError> {
        let full = self.resolve(path);
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent).map_err(|e| CoreError::fs(path, e))?;
        }
        let tmp = full.with_extension("tmp");
        std::fs::write(&tmp, contents).map_err(|e| CoreError::fs(path, e))?;
        std::fs::rename(&tmp, &full).map_err(|e| CoreError::fs(path, e))?;
        Ok(())
    }

    fn exists(&self, path: &str) -> bool {
        self.resolve(path).exists()
    }
}

/// In-memory store for tests and ephemeral sessions.
#[derive(Default)]
pub struct MemoryFs {
    files: Mutex<HashMap<String, String>>,
}

impl MemoryFs {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WorkspaceFs for MemoryFs {
    fn read(&self, path: &str) -> Result<String, CoreError> {
        let files = self.files.lock().unwrap_or_else(|e| e.into_inner());
        files
            .get(path)
            .cloned()
            .ok_or_else(|| CoreError::fs(path, "not found"))
    }

    fn write(&self, path: &str, contents: &str) -> Result<(), CoreError> {
        let mut files = self.files.lock().unwrap_or_else(|e| e.into_inner());
        files.insert(path.to_string(), contents.to_string());
        Ok(())
    }

    fn exists(&self, path: &str) -> bool {
        let files = self.files.lock().unwrap_or_else(|e| e.into_inner());
        files.contains_key(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_fs_round_trip() {
        let fs = MemoryFs::new();
        assert!(!fs.exists("a/b.md"));
        fs.write("a/b.md", "hello").unwrap();
        assert!(fs.exists("a/b.md"));
        assert_eq!(fs.read("a/b.md").unwrap(), "hello");
    }

    #[test]
    fn test_disk_fs_creates_parents_and_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let fs = DiskFs::new(dir.path());
        fs.write("nested/dir/file.txt", "one").unwrap();
        assert_eq!(fs.read("nested/dir/file.txt").unwrap(), "one");
        fs.write("nested/dir/file.txt", "two").unwrap();
        assert_eq!(fs.read("nested/dir/file.txt").unwrap(), "two");
        assert!(!dir.path().join("nested/dir/file.tmp").exists());
    }

    #[test]
    fn test_disk_fs_missing_read_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let fs = DiskFs::new(dir.path());
        assert!(fs.read("missing.txt").is_err());
    }
}

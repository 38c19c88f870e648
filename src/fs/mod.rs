//! Filesystem abstractions used for snapshot import during the first-join handshake.
//!
//! The sync core does not perform ordinary file I/O itself — reading and writing
//! workspace files is the engine's job, invoked through the command/response
//! interface in [`crate::engine`]. These traits exist for the one place the core
//! *does* touch storage directly: unpacking a downloaded workspace snapshot into
//! local storage before handing off to CRDT sync (see
//! [`crate::crdt::unified`]).

mod async_fs;

pub use async_fs::{AsyncFileSystem, BoxFuture, SyncToAsyncFs};

use std::collections::HashMap;
use std::io::{self, Result};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Synchronous filesystem abstraction.
///
/// Implementations back [`SyncToAsyncFs`] for platforms where storage access is
/// not inherently async (e.g. an in-memory store used in tests).
pub trait FileSystem: Send + Sync {
    /// Read the file content as a string.
    fn read_to_string(&self, path: &Path) -> Result<String>;
    /// Overwrite an existing file with new content, creating it if absent.
    fn write_file(&self, path: &Path, content: &str) -> Result<()>;
    /// Create a file only if it doesn't already exist.
    fn create_new(&self, path: &Path, content: &str) -> Result<()>;
    /// Delete a file.
    fn delete_file(&self, path: &Path) -> Result<()>;
    /// Check whether a path exists.
    fn exists(&self, path: &Path) -> bool;
    /// List files directly inside a directory (not recursive).
    fn list_files(&self, dir: &Path) -> Result<Vec<PathBuf>>;
    /// List markdown files directly inside a directory.
    fn list_md_files(&self, dir: &Path) -> Result<Vec<PathBuf>>;
    /// Create a directory and all missing parents.
    fn create_dir_all(&self, path: &Path) -> Result<()>;
    /// Check whether a path is a directory.
    fn is_dir(&self, path: &Path) -> bool;
    /// Move or rename a file.
    fn move_file(&self, from: &Path, to: &Path) -> Result<()>;
}

/// An in-memory filesystem, useful for tests and for one-shot/guest sessions
/// that should not touch disk.
#[derive(Clone, Default)]
pub struct InMemoryFileSystem {
    files: Arc<Mutex<HashMap<PathBuf, String>>>,
}

const DIR_MARKER: &str = "<DIR>";

impl InMemoryFileSystem {
    /// Create a new, empty in-memory filesystem.
    pub fn new() -> Self {
        Self::default()
    }
}

impl FileSystem for InMemoryFileSystem {
    fn read_to_string(&self, path: &Path) -> Result<String> {
        let files = self.files.lock().unwrap();
        let content = files
            .get(path)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "file not found"))?;
        if content == DIR_MARKER {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "is a directory"));
        }
        Ok(content.clone())
    }

    fn write_file(&self, path: &Path, content: &str) -> Result<()> {
        self.files
            .lock()
            .unwrap()
            .insert(path.to_path_buf(), content.to_string());
        Ok(())
    }

    fn create_new(&self, path: &Path, content: &str) -> Result<()> {
        let mut files = self.files.lock().unwrap();
        if files.contains_key(path) {
            return Err(io::Error::new(io::ErrorKind::AlreadyExists, "file exists"));
        }
        files.insert(path.to_path_buf(), content.to_string());
        Ok(())
    }

    fn delete_file(&self, path: &Path) -> Result<()> {
        self.files.lock().unwrap().remove(path);
        Ok(())
    }

    fn exists(&self, path: &Path) -> bool {
        self.files.lock().unwrap().contains_key(path)
    }

    fn list_files(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        let files = self.files.lock().unwrap();
        Ok(files
            .keys()
            .filter(|p| p.parent() == Some(dir))
            .cloned()
            .collect())
    }

    fn list_md_files(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        let files = self.files.lock().unwrap();
        Ok(files
            .keys()
            .filter(|p| p.parent() == Some(dir) && p.extension().is_some_and(|e| e == "md"))
            .cloned()
            .collect())
    }

    fn create_dir_all(&self, path: &Path) -> Result<()> {
        self.files
            .lock()
            .unwrap()
            .insert(path.to_path_buf(), DIR_MARKER.to_string());
        Ok(())
    }

    fn is_dir(&self, path: &Path) -> bool {
        self.files
            .lock()
            .unwrap()
            .get(path)
            .map(|c| c == DIR_MARKER)
            .unwrap_or(false)
    }

    fn move_file(&self, from: &Path, to: &Path) -> Result<()> {
        let mut files = self.files.lock().unwrap();
        if !files.contains_key(from) {
            return Err(io::Error::new(io::ErrorKind::NotFound, "file not found"));
        }
        if files.contains_key(to) {
            return Err(io::Error::new(io::ErrorKind::AlreadyExists, "destination exists"));
        }
        let content = files.remove(from).unwrap();
        files.insert(to.to_path_buf(), content);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_round_trips() {
        let fs = InMemoryFileSystem::new();
        fs.write_file(Path::new("a.md"), "hello").unwrap();
        assert_eq!(fs.read_to_string(Path::new("a.md")).unwrap(), "hello");
    }

    #[test]
    fn create_new_rejects_existing() {
        let fs = InMemoryFileSystem::new();
        fs.create_new(Path::new("a.md"), "one").unwrap();
        assert!(fs.create_new(Path::new("a.md"), "two").is_err());
    }

    #[test]
    fn move_file_updates_key() {
        let fs = InMemoryFileSystem::new();
        fs.write_file(Path::new("a.md"), "hi").unwrap();
        fs.move_file(Path::new("a.md"), Path::new("b.md")).unwrap();
        assert!(!fs.exists(Path::new("a.md")));
        assert_eq!(fs.read_to_string(Path::new("b.md")).unwrap(), "hi");
    }
}

//! Where each user's index files live.

use std::collections::HashMap;
use std::fmt::Debug;
use std::path::PathBuf;
use std::sync::Arc;

use log::info;
use parking_lot::Mutex;

use crate::context::UserId;
use crate::error::{ChatSearchError, Result};
use crate::storage::Storage;
use crate::storage::file::FileStorage;
use crate::storage::memory::MemoryStorage;

/// Maps a user to the storage holding their index.
pub trait IndexDirectory: Send + Sync + Debug {
    /// Storage for `user_id`, created if needed.
    fn open(&self, user_id: UserId) -> Result<Arc<dyn Storage>>;

    /// Whether any index storage exists for `user_id`. Never creates it.
    fn exists(&self, user_id: UserId) -> bool;

    /// Remove all of the user's index files. Missing storage is not an error.
    fn remove(&self, user_id: UserId) -> Result<()>;

    /// Every user that has index storage, in ascending order.
    fn users(&self) -> Result<Vec<UserId>>;

    /// Path used for disk-space checks.
    fn root(&self) -> PathBuf;
}

/// One subdirectory per user under the index root.
#[derive(Debug, Clone)]
pub struct FileIndexDirectory {
    root: PathBuf,
}

impl FileIndexDirectory {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        FileIndexDirectory { root: root.into() }
    }

    fn user_dir(&self, user_id: UserId) -> PathBuf {
        self.root.join(user_id.to_string())
    }
}

impl IndexDirectory for FileIndexDirectory {
    fn open(&self, user_id: UserId) -> Result<Arc<dyn Storage>> {
        let storage: Arc<dyn Storage> = Arc::new(FileStorage::new(self.user_dir(user_id))?);
        Ok(storage)
    }

    fn exists(&self, user_id: UserId) -> bool {
        self.user_dir(user_id).is_dir()
    }

    fn remove(&self, user_id: UserId) -> Result<()> {
        let dir = self.user_dir(user_id);
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => {
                info!("Removed index directory {}", dir.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ChatSearchError::storage(format!(
                "Failed to remove {}: {e}",
                dir.display()
            ))),
        }
    }

    fn users(&self) -> Result<Vec<UserId>> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(ChatSearchError::storage(format!(
                    "Failed to list {}: {e}",
                    self.root.display()
                )));
            }
        };

        let mut users = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            // Anything not named after a user id is not ours.
            if let Some(user_id) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<UserId>().ok())
                .filter(|&user_id| user_id != 0)
            {
                users.push(user_id);
            }
        }
        users.sort_unstable();
        Ok(users)
    }

    fn root(&self) -> PathBuf {
        self.root.clone()
    }
}

/// In-memory index storage keyed by user; for tests and benchmarks.
#[derive(Debug, Default)]
pub struct MemoryIndexDirectory {
    users: Mutex<HashMap<UserId, Arc<MemoryStorage>>>,
}

impl MemoryIndexDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// The concrete storage of `user_id`, if it exists.
    pub fn storage(&self, user_id: UserId) -> Option<Arc<MemoryStorage>> {
        self.users.lock().get(&user_id).cloned()
    }
}

impl IndexDirectory for MemoryIndexDirectory {
    fn open(&self, user_id: UserId) -> Result<Arc<dyn Storage>> {
        let storage: Arc<dyn Storage> = self.users.lock().entry(user_id).or_default().clone();
        Ok(storage)
    }

    fn exists(&self, user_id: UserId) -> bool {
        self.users.lock().contains_key(&user_id)
    }

    fn remove(&self, user_id: UserId) -> Result<()> {
        self.users.lock().remove(&user_id);
        Ok(())
    }

    fn users(&self) -> Result<Vec<UserId>> {
        let mut users: Vec<_> = self.users.lock().keys().copied().collect();
        users.sort_unstable();
        Ok(users)
    }

    fn root(&self) -> PathBuf {
        std::env::temp_dir()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::write_atomic;
    use tempfile::TempDir;

    #[test]
    fn test_file_directory_lifecycle() {
        let temp_dir = TempDir::new().unwrap();
        let directory = FileIndexDirectory::new(temp_dir.path());

        assert!(!directory.exists(7));
        let storage = directory.open(7).unwrap();
        write_atomic(storage.as_ref(), "manifest.json", b"{}").unwrap();
        assert!(directory.exists(7));
        assert!(temp_dir.path().join("7").join("manifest.json").is_file());

        directory.remove(7).unwrap();
        assert!(!directory.exists(7));
        directory.remove(7).unwrap();
    }

    #[test]
    fn test_file_directory_lists_user_dirs_only() {
        let temp_dir = TempDir::new().unwrap();
        let directory = FileIndexDirectory::new(temp_dir.path().join("index"));
        assert!(directory.users().unwrap().is_empty());

        directory.open(30).unwrap();
        directory.open(4).unwrap();
        std::fs::create_dir_all(temp_dir.path().join("index").join("lost+found")).unwrap();
        std::fs::write(temp_dir.path().join("index").join("12"), b"not a dir").unwrap();

        assert_eq!(directory.users().unwrap(), vec![4, 30]);
    }

    #[test]
    fn test_memory_directory_shares_storage() {
        let directory = MemoryIndexDirectory::new();
        let first = directory.open(1).unwrap();
        write_atomic(first.as_ref(), "a", b"1").unwrap();

        let second = directory.open(1).unwrap();
        assert!(second.file_exists("a"));
        assert!(!directory.open(2).unwrap().file_exists("a"));
    }
}

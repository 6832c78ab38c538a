//! Storage abstraction layer.
//!
//! Segment files, manifests and the user config document are all written
//! through the [`Storage`] trait so that the index code never touches paths
//! directly. Two backends exist:
//!
//! - [`file::FileStorage`]: a directory on disk, used by the worker.
//! - [`memory::MemoryStorage`]: a map of byte buffers, used in tests.
//!
//! Durable replacement of a whole file goes through [`write_atomic`], which
//! writes a temporary sibling, syncs it and renames it over the target.
//!
//! # Example
//!
//! ```
//! use chatsearch::storage::memory::MemoryStorage;
//! use chatsearch::storage::{read_file, write_atomic, Storage};
//!
//! # fn main() -> chatsearch::error::Result<()> {
//! let storage = MemoryStorage::new();
//! write_atomic(&storage, "manifest.json", b"{}")?;
//! assert_eq!(read_file(&storage, "manifest.json")?, b"{}".to_vec());
//! assert!(!storage.file_exists("manifest.json.tmp"));
//! # Ok(())
//! # }
//! ```

use std::io::{self, Read, Write};

use thiserror::Error;

use crate::error::{ChatSearchError, Result};

pub mod file;
pub mod memory;

/// Storage-specific errors.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Storage is read-only: {0}")]
    ReadOnly(String),

    #[error("I/O error: {0}")]
    IoError(String),
}

impl From<StorageError> for ChatSearchError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::FileNotFound(name) => {
                ChatSearchError::Io(io::Error::new(io::ErrorKind::NotFound, name))
            }
            other => ChatSearchError::storage(other.to_string()),
        }
    }
}

/// A trait for storage backends that can store and retrieve named files.
pub trait Storage: Send + Sync + std::fmt::Debug {
    /// Open an existing file for reading.
    fn open_input(&self, name: &str) -> Result<Box<dyn StorageInput>>;

    /// Create (or truncate) a file for writing.
    fn create_output(&self, name: &str) -> Result<Box<dyn StorageOutput>>;

    /// Check if a file exists.
    fn file_exists(&self, name: &str) -> bool;

    /// Delete a file. Deleting a missing file is not an error.
    fn delete_file(&self, name: &str) -> Result<()>;

    /// List all files, sorted by name.
    fn list_files(&self) -> Result<Vec<String>>;

    /// Get the size of a file in bytes.
    fn file_size(&self, name: &str) -> Result<u64>;

    /// Rename a file, replacing `new_name` if it exists.
    fn rename_file(&self, old_name: &str, new_name: &str) -> Result<()>;

    /// Make completed renames and deletions durable.
    fn sync(&self) -> Result<()>;
}

/// A trait for reading data from storage.
pub trait StorageInput: Read + Send + std::fmt::Debug {
    /// Get the size of the input stream.
    fn size(&self) -> Result<u64>;
}

/// A trait for writing data to storage.
pub trait StorageOutput: Write + Send + std::fmt::Debug {
    /// Flush and sync the output to storage.
    fn flush_and_sync(&mut self) -> Result<()>;

    /// Number of bytes written so far.
    fn position(&self) -> u64;
}

/// Read a whole file.
pub fn read_file(storage: &dyn Storage, name: &str) -> Result<Vec<u8>> {
    let mut input = storage.open_input(name)?;
    let mut buf = Vec::with_capacity(input.size()? as usize);
    input.read_to_end(&mut buf)?;
    Ok(buf)
}

/// Read a whole file, mapping "does not exist" to `None`.
pub fn read_file_opt(storage: &dyn Storage, name: &str) -> Result<Option<Vec<u8>>> {
    match read_file(storage, name) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(ChatSearchError::Io(e)) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Replace `name` with `bytes` using write-temp, sync, rename.
///
/// Readers observe either the previous content or the new content, never a
/// partial write.
pub fn write_atomic(storage: &dyn Storage, name: &str, bytes: &[u8]) -> Result<()> {
    let temp_name = format!("{name}.tmp");
    {
        let mut output = storage.create_output(&temp_name)?;
        output.write_all(bytes)?;
        output.flush_and_sync()?;
    }
    if let Err(e) = storage.rename_file(&temp_name, name) {
        let _ = storage.delete_file(&temp_name);
        return Err(e);
    }
    storage.sync()
}

#[cfg(test)]
mod tests {
    use super::memory::MemoryStorage;
    use super::*;

    #[test]
    fn test_read_missing_file_is_none() {
        let storage = MemoryStorage::new();
        assert!(read_file_opt(&storage, "missing").unwrap().is_none());
        assert!(read_file(&storage, "missing").is_err());
    }

    #[test]
    fn test_write_atomic_replaces_content() {
        let storage = MemoryStorage::new();
        write_atomic(&storage, "doc.json", b"first").unwrap();
        write_atomic(&storage, "doc.json", b"second").unwrap();

        assert_eq!(read_file(&storage, "doc.json").unwrap(), b"second".to_vec());
        assert_eq!(storage.list_files().unwrap(), vec!["doc.json".to_string()]);
    }

    #[test]
    fn test_write_atomic_on_read_only_storage_keeps_old_content() {
        let storage = MemoryStorage::new();
        write_atomic(&storage, "doc.json", b"first").unwrap();
        storage.set_read_only(true);

        assert!(write_atomic(&storage, "doc.json", b"second").is_err());
        assert_eq!(read_file(&storage, "doc.json").unwrap(), b"first".to_vec());
    }
}

//! In-memory storage implementation for testing.

use std::collections::HashMap;
use std::io::{Cursor, Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::error::Result;
use crate::storage::{Storage, StorageError, StorageInput, StorageOutput};

type FileMap = Arc<Mutex<HashMap<String, Box<[u8]>>>>;

/// An in-memory storage implementation.
///
/// Outputs are published into the map when they are synced or dropped, which
/// mirrors a buffered file becoming visible on close.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    files: FileMap,
    read_only: Arc<AtomicBool>,
}

impl MemoryStorage {
    /// Create a new, empty memory storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse every subsequent write. Used to simulate an unwritable directory.
    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
    }

    /// Get the number of files stored.
    pub fn file_count(&self) -> usize {
        self.files.lock().len()
    }

    fn check_writable(&self, name: &str) -> Result<()> {
        if self.read_only.load(Ordering::SeqCst) {
            Err(StorageError::ReadOnly(name.to_string()).into())
        } else {
            Ok(())
        }
    }
}

impl Storage for MemoryStorage {
    fn open_input(&self, name: &str) -> Result<Box<dyn StorageInput>> {
        let files = self.files.lock();
        let data = files
            .get(name)
            .ok_or_else(|| StorageError::FileNotFound(name.to_string()))?;

        Ok(Box::new(MemoryInput::new(data.clone())))
    }

    fn create_output(&self, name: &str) -> Result<Box<dyn StorageOutput>> {
        self.check_writable(name)?;
        Ok(Box::new(MemoryOutput::new(
            name.to_string(),
            Arc::clone(&self.files),
        )))
    }

    fn file_exists(&self, name: &str) -> bool {
        self.files.lock().contains_key(name)
    }

    fn delete_file(&self, name: &str) -> Result<()> {
        self.check_writable(name)?;
        self.files.lock().remove(name);
        Ok(())
    }

    fn list_files(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.files.lock().keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    fn file_size(&self, name: &str) -> Result<u64> {
        self.files
            .lock()
            .get(name)
            .map(|data| data.len() as u64)
            .ok_or_else(|| StorageError::FileNotFound(name.to_string()).into())
    }

    fn rename_file(&self, old_name: &str, new_name: &str) -> Result<()> {
        self.check_writable(new_name)?;
        let mut files = self.files.lock();
        let data = files
            .remove(old_name)
            .ok_or_else(|| StorageError::FileNotFound(old_name.to_string()))?;
        files.insert(new_name.to_string(), data);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

/// A memory-based input implementation.
#[derive(Debug)]
pub struct MemoryInput {
    cursor: Cursor<Box<[u8]>>,
}

impl MemoryInput {
    fn new(data: Box<[u8]>) -> Self {
        MemoryInput {
            cursor: Cursor::new(data),
        }
    }
}

impl Read for MemoryInput {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.cursor.read(buf)
    }
}

impl StorageInput for MemoryInput {
    fn size(&self) -> Result<u64> {
        Ok(self.cursor.get_ref().len() as u64)
    }
}

/// A memory-based output implementation.
#[derive(Debug)]
pub struct MemoryOutput {
    name: String,
    buffer: Vec<u8>,
    files: FileMap,
    published: bool,
}

impl MemoryOutput {
    fn new(name: String, files: FileMap) -> Self {
        MemoryOutput {
            name,
            buffer: Vec::new(),
            files,
            published: false,
        }
    }

    fn publish(&mut self) {
        self.files
            .lock()
            .insert(self.name.clone(), self.buffer.clone().into_boxed_slice());
        self.published = true;
    }
}

impl Write for MemoryOutput {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        self.published = false;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl StorageOutput for MemoryOutput {
    fn flush_and_sync(&mut self) -> Result<()> {
        self.publish();
        Ok(())
    }

    fn position(&self) -> u64 {
        self.buffer.len() as u64
    }
}

impl Drop for MemoryOutput {
    fn drop(&mut self) {
        if !self.published {
            self.publish();
        }
    }
}

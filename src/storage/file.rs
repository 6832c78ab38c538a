//! File-based storage implementation.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::error::{ChatSearchError, Result};
use crate::storage::{Storage, StorageError, StorageInput, StorageOutput};

const BUFFER_SIZE: usize = 64 * 1024;

/// A storage backed by one directory.
#[derive(Debug, Clone)]
pub struct FileStorage {
    directory: PathBuf,
}

impl FileStorage {
    /// Open storage in `directory`, creating it if needed.
    pub fn new<P: AsRef<Path>>(directory: P) -> Result<Self> {
        let directory = directory.as_ref().to_path_buf();

        if !directory.exists() {
            std::fs::create_dir_all(&directory).map_err(|e| {
                ChatSearchError::storage(format!(
                    "Failed to create directory {}: {e}",
                    directory.display()
                ))
            })?;
        }

        if !directory.is_dir() {
            return Err(ChatSearchError::storage(format!(
                "Path is not a directory: {}",
                directory.display()
            )));
        }

        Ok(FileStorage { directory })
    }

    /// The directory this storage writes into.
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn file_path(&self, name: &str) -> PathBuf {
        self.directory.join(name)
    }
}

fn map_io(name: &str, e: std::io::Error) -> StorageError {
    if e.kind() == std::io::ErrorKind::NotFound {
        StorageError::FileNotFound(name.to_string())
    } else {
        StorageError::IoError(format!("{name}: {e}"))
    }
}

impl Storage for FileStorage {
    fn open_input(&self, name: &str) -> Result<Box<dyn StorageInput>> {
        let file = File::open(self.file_path(name)).map_err(|e| map_io(name, e))?;
        Ok(Box::new(FileInput::new(file)?))
    }

    fn create_output(&self, name: &str) -> Result<Box<dyn StorageOutput>> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(self.file_path(name))
            .map_err(|e| map_io(name, e))?;

        Ok(Box::new(FileOutput::new(file)))
    }

    fn file_exists(&self, name: &str) -> bool {
        self.file_path(name).exists()
    }

    fn delete_file(&self, name: &str) -> Result<()> {
        match std::fs::remove_file(self.file_path(name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(map_io(name, e).into()),
        }
    }

    fn list_files(&self) -> Result<Vec<String>> {
        let mut files = Vec::new();

        for entry in std::fs::read_dir(&self.directory)
            .map_err(|e| StorageError::IoError(e.to_string()))?
        {
            let entry = entry.map_err(|e| StorageError::IoError(e.to_string()))?;
            let path = entry.path();

            if path.is_file()
                && let Some(name) = path.file_name().and_then(|n| n.to_str())
            {
                files.push(name.to_string());
            }
        }

        files.sort();
        Ok(files)
    }

    fn file_size(&self, name: &str) -> Result<u64> {
        let metadata = self.file_path(name).metadata().map_err(|e| map_io(name, e))?;
        Ok(metadata.len())
    }

    fn rename_file(&self, old_name: &str, new_name: &str) -> Result<()> {
        std::fs::rename(self.file_path(old_name), self.file_path(new_name))
            .map_err(|e| map_io(old_name, e))?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        // Persist directory entries (renames, unlinks). Not supported on every platform.
        #[cfg(unix)]
        {
            let dir = File::open(&self.directory)
                .map_err(|e| StorageError::IoError(format!("Failed to open directory: {e}")))?;
            dir.sync_all()
                .map_err(|e| StorageError::IoError(format!("Failed to sync directory: {e}")))?;
        }
        Ok(())
    }
}

/// A file input implementation.
#[derive(Debug)]
pub struct FileInput {
    reader: BufReader<File>,
    size: u64,
}

impl FileInput {
    fn new(file: File) -> Result<Self> {
        let size = file
            .metadata()
            .map_err(|e| ChatSearchError::storage(format!("Failed to get file metadata: {e}")))?
            .len();

        Ok(FileInput {
            reader: BufReader::with_capacity(BUFFER_SIZE, file),
            size,
        })
    }
}

impl Read for FileInput {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.reader.read(buf)
    }
}

impl StorageInput for FileInput {
    fn size(&self) -> Result<u64> {
        Ok(self.size)
    }
}

/// A file output implementation.
#[derive(Debug)]
pub struct FileOutput {
    writer: BufWriter<File>,
    position: u64,
}

impl FileOutput {
    fn new(file: File) -> Self {
        FileOutput {
            writer: BufWriter::with_capacity(BUFFER_SIZE, file),
            position: 0,
        }
    }
}

impl Write for FileOutput {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let bytes_written = self.writer.write(buf)?;
        self.position += bytes_written as u64;
        Ok(bytes_written)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }
}

impl StorageOutput for FileOutput {
    fn flush_and_sync(&mut self) -> Result<()> {
        self.writer
            .flush()
            .map_err(|e| ChatSearchError::storage(format!("Failed to flush: {e}")))?;

        self.writer
            .get_ref()
            .sync_all()
            .map_err(|e| ChatSearchError::storage(format!("Failed to sync: {e}")))?;

        Ok(())
    }

    fn position(&self) -> u64 {
        self.position
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{read_file, write_atomic};
    use tempfile::TempDir;

    #[test]
    fn test_file_storage_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let storage = FileStorage::new(temp_dir.path().join("user")).unwrap();

        write_atomic(&storage, "manifest.json", b"{\"a\":1}").unwrap();

        assert!(storage.file_exists("manifest.json"));
        assert_eq!(
            read_file(&storage, "manifest.json").unwrap(),
            b"{\"a\":1}".to_vec()
        );
        assert_eq!(storage.list_files().unwrap(), vec!["manifest.json"]);
    }

    #[test]
    fn test_missing_file_maps_to_not_found() {
        let temp_dir = TempDir::new().unwrap();
        let storage = FileStorage::new(temp_dir.path()).unwrap();

        match storage.open_input("nope") {
            Err(ChatSearchError::Io(e)) => assert_eq!(e.kind(), std::io::ErrorKind::NotFound),
            other => panic!("unexpected result: {other:?}"),
        }
        storage.delete_file("nope").unwrap();
    }

    #[test]
    fn test_new_rejects_regular_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("plain");
        std::fs::write(&path, b"x").unwrap();

        assert!(FileStorage::new(&path).is_err());
    }
}

//! Storage abstraction for segment files.
//!
//! Flushed segments are written through the [`Storage`] trait so the
//! ingestion core never touches a file system directly. Two backends are
//! provided: [`memory::MemoryStorage`] for tests and ephemeral indexes, and
//! [`file::FileStorage`] for a directory on disk.

use std::fmt::Debug;
use std::io::{Read, Write};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::Result;

pub mod file;
pub mod memory;
pub mod structured;
pub mod tracking;

use file::{FileStorage, FileStorageConfig};
use memory::{MemoryStorage, MemoryStorageConfig};

/// A named-file store.
pub trait Storage: Send + Sync + Debug {
    /// Create (or truncate) a file for writing.
    fn create_output(&self, name: &str) -> Result<Box<dyn StorageOutput>>;

    /// Open an existing file for reading.
    fn open_input(&self, name: &str) -> Result<Box<dyn StorageInput>>;

    /// Check whether a file exists.
    fn file_exists(&self, name: &str) -> bool;

    /// Delete a file. Deleting a missing file is an error.
    fn delete_file(&self, name: &str) -> Result<()>;

    /// List all file names, sorted.
    fn list_files(&self) -> Result<Vec<String>>;

    /// Atomically rename a file.
    fn rename_file(&self, old_name: &str, new_name: &str) -> Result<()>;

    /// Size of a file in bytes.
    fn file_size(&self, name: &str) -> Result<u64>;
}

/// A writable file handle.
pub trait StorageOutput: Write + Send + Debug {
    /// Flush buffered bytes and make them durable.
    fn flush_and_sync(&mut self) -> Result<()>;

    /// Number of bytes written so far.
    fn position(&self) -> u64;

    /// Finish the file. Bytes become visible to readers once closed.
    fn close(&mut self) -> Result<()>;
}

/// A readable file handle.
pub trait StorageInput: Read + Send + Debug {
    /// Total size of the underlying file.
    fn size(&self) -> Result<u64>;
}

/// Storage backend selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StorageConfig {
    Memory(MemoryStorageConfig),
    File(FileStorageConfig),
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Memory(MemoryStorageConfig::default())
    }
}

/// Creates storage backends from configuration.
pub struct StorageFactory;

impl StorageFactory {
    pub fn create(config: StorageConfig) -> Result<Arc<dyn Storage>> {
        match config {
            StorageConfig::Memory(config) => Ok(Arc::new(MemoryStorage::new(config))),
            StorageConfig::File(config) => Ok(Arc::new(FileStorage::new(config)?)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_factory_creates_memory_storage() {
        let storage = StorageFactory::create(StorageConfig::default()).unwrap();
        let mut out = storage.create_output("a.bin").unwrap();
        out.write_all(b"abc").unwrap();
        out.close().unwrap();
        assert!(storage.file_exists("a.bin"));
        assert_eq!(storage.file_size("a.bin").unwrap(), 3);
    }

    #[test]
    fn test_factory_creates_file_storage() {
        let dir = tempfile::TempDir::new().unwrap();
        let storage =
            StorageFactory::create(StorageConfig::File(FileStorageConfig::new(dir.path()))).unwrap();
        let mut out = storage.create_output("b.bin").unwrap();
        out.write_all(b"hello").unwrap();
        out.close().unwrap();
        assert_eq!(storage.list_files().unwrap(), vec!["b.bin".to_string()]);
    }
}

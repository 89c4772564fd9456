//! In-memory storage backend.

use std::io::{Cursor, Read, Write};
use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{IrisError, Result};
use crate::storage::{Storage, StorageInput, StorageOutput};

/// Configuration for [`MemoryStorage`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryStorageConfig {
    /// Optional cap on the total number of bytes held; `None` is unbounded.
    pub max_bytes: Option<u64>,
}

type FileMap = Arc<RwLock<AHashMap<String, Arc<Vec<u8>>>>>;

/// Storage that keeps every file in a shared map.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    files: FileMap,
    config: MemoryStorageConfig,
}

impl MemoryStorage {
    pub fn new(config: MemoryStorageConfig) -> Self {
        MemoryStorage {
            files: Arc::new(RwLock::new(AHashMap::new())),
            config,
        }
    }

    /// Total bytes across all files.
    pub fn total_bytes(&self) -> u64 {
        self.files.read().values().map(|f| f.len() as u64).sum()
    }
}

impl Storage for MemoryStorage {
    fn create_output(&self, name: &str) -> Result<Box<dyn StorageOutput>> {
        Ok(Box::new(MemoryOutput {
            name: name.to_string(),
            buffer: Vec::new(),
            files: Arc::clone(&self.files),
            max_bytes: self.config.max_bytes,
            closed: false,
        }))
    }

    fn open_input(&self, name: &str) -> Result<Box<dyn StorageInput>> {
        let data = self
            .files
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| IrisError::not_found(format!("file {name}")))?;
        Ok(Box::new(MemoryInput {
            cursor: Cursor::new(data),
        }))
    }

    fn file_exists(&self, name: &str) -> bool {
        self.files.read().contains_key(name)
    }

    fn delete_file(&self, name: &str) -> Result<()> {
        self.files
            .write()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| IrisError::not_found(format!("file {name}")))
    }

    fn list_files(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.files.read().keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    fn rename_file(&self, old_name: &str, new_name: &str) -> Result<()> {
        let mut files = self.files.write();
        let data = files
            .remove(old_name)
            .ok_or_else(|| IrisError::not_found(format!("file {old_name}")))?;
        files.insert(new_name.to_string(), data);
        Ok(())
    }

    fn file_size(&self, name: &str) -> Result<u64> {
        self.files
            .read()
            .get(name)
            .map(|f| f.len() as u64)
            .ok_or_else(|| IrisError::not_found(format!("file {name}")))
    }
}

#[derive(Debug)]
struct MemoryOutput {
    name: String,
    buffer: Vec<u8>,
    files: FileMap,
    max_bytes: Option<u64>,
    closed: bool,
}

impl MemoryOutput {
    fn publish(&mut self) -> Result<()> {
        let mut files = self.files.write();
        if let Some(max) = self.max_bytes {
            let used: u64 = files
                .iter()
                .filter(|(name, _)| **name != self.name)
                .map(|(_, f)| f.len() as u64)
                .sum();
            if used + self.buffer.len() as u64 > max {
                return Err(IrisError::storage(format!(
                    "memory storage limit of {max} bytes exceeded writing {}",
                    self.name
                )));
            }
        }
        files.insert(self.name.clone(), Arc::new(std::mem::take(&mut self.buffer)));
        Ok(())
    }
}

impl Write for MemoryOutput {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if self.closed {
            return Err(std::io::Error::other(format!("{} is closed", self.name)));
        }
        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl StorageOutput for MemoryOutput {
    fn flush_and_sync(&mut self) -> Result<()> {
        Ok(())
    }

    fn position(&self) -> u64 {
        self.buffer.len() as u64
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.publish()
    }
}

impl Drop for MemoryOutput {
    fn drop(&mut self) {
        if !self.closed {
            self.closed = true;
            let _ = self.publish();
        }
    }
}

#[derive(Debug)]
struct MemoryInput {
    cursor: Cursor<Arc<Vec<u8>>>,
}

impl Read for MemoryInput {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let pos = self.cursor.position() as usize;
        let data = self.cursor.get_ref();
        let remaining = data.len().saturating_sub(pos);
        let n = remaining.min(buf.len());
        buf[..n].copy_from_slice(&data[pos..pos + n]);
        self.cursor.set_position((pos + n) as u64);
        Ok(n)
    }
}

impl StorageInput for MemoryInput {
    fn size(&self) -> Result<u64> {
        Ok(self.cursor.get_ref().len() as u64)
    }
}

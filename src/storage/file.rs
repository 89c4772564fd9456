//! File-system storage backend rooted at a directory.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{IrisError, Result};
use crate::storage::{Storage, StorageInput, StorageOutput};

/// Configuration for [`FileStorage`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileStorageConfig {
    /// Directory holding the files.
    pub path: PathBuf,

    /// Whether `close()` fsyncs the file.
    pub sync_on_close: bool,

    /// Buffer size for writers.
    pub buffer_size: usize,
}

impl FileStorageConfig {
    pub fn new(path: impl AsRef<Path>) -> Self {
        FileStorageConfig {
            path: path.as_ref().to_path_buf(),
            sync_on_close: true,
            buffer_size: 64 * 1024,
        }
    }
}

/// Storage backed by a directory.
#[derive(Debug)]
pub struct FileStorage {
    config: FileStorageConfig,
}

impl FileStorage {
    pub fn new(config: FileStorageConfig) -> Result<Self> {
        fs::create_dir_all(&config.path)?;
        Ok(FileStorage { config })
    }

    fn resolve(&self, name: &str) -> Result<PathBuf> {
        if name.is_empty() || name.contains('/') || name.contains('\\') || name == ".." {
            return Err(IrisError::invalid_argument(format!(
                "invalid file name: {name:?}"
            )));
        }
        Ok(self.config.path.join(name))
    }
}

impl Storage for FileStorage {
    fn create_output(&self, name: &str) -> Result<Box<dyn StorageOutput>> {
        let path = self.resolve(name)?;
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        Ok(Box::new(FileOutput {
            writer: Some(BufWriter::with_capacity(self.config.buffer_size, file)),
            position: 0,
            sync_on_close: self.config.sync_on_close,
        }))
    }

    fn open_input(&self, name: &str) -> Result<Box<dyn StorageInput>> {
        let path = self.resolve(name)?;
        let file = File::open(&path)?;
        let size = file.metadata()?.len();
        Ok(Box::new(FileInput {
            reader: BufReader::new(file),
            size,
        }))
    }

    fn file_exists(&self, name: &str) -> bool {
        self.resolve(name).map(|p| p.is_file()).unwrap_or(false)
    }

    fn delete_file(&self, name: &str) -> Result<()> {
        fs::remove_file(self.resolve(name)?)?;
        Ok(())
    }

    fn list_files(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.config.path)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }

    fn rename_file(&self, old_name: &str, new_name: &str) -> Result<()> {
        fs::rename(self.resolve(old_name)?, self.resolve(new_name)?)?;
        Ok(())
    }

    fn file_size(&self, name: &str) -> Result<u64> {
        Ok(fs::metadata(self.resolve(name)?)?.len())
    }
}

#[derive(Debug)]
struct FileOutput {
    writer: Option<BufWriter<File>>,
    position: u64,
    sync_on_close: bool,
}

impl Write for FileOutput {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| std::io::Error::other("output is closed"))?;
        let n = writer.write(buf)?;
        self.position += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self.writer.as_mut() {
            Some(writer) => writer.flush(),
            None => Ok(()),
        }
    }
}

impl StorageOutput for FileOutput {
    fn flush_and_sync(&mut self) -> Result<()> {
        if let Some(writer) = self.writer.as_mut() {
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        Ok(())
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn close(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
            if self.sync_on_close {
                writer.get_ref().sync_all()?;
            }
        }
        Ok(())
    }
}

#[derive(Debug)]
struct FileInput {
    reader: BufReader<File>,
    size: u64,
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

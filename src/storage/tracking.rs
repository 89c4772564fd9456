//! Storage wrapper that records every file created through it.

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Result;
use crate::storage::{Storage, StorageInput, StorageOutput};

/// Wraps a storage and remembers the names of files created through it.
///
/// A segment flush writes through one of these so the flushed segment can
/// list exactly the files it produced.
#[derive(Debug)]
pub struct TrackingStorage {
    inner: Arc<dyn Storage>,
    created: Mutex<BTreeSet<String>>,
}

impl TrackingStorage {
    pub fn new(inner: Arc<dyn Storage>) -> Self {
        TrackingStorage {
            inner,
            created: Mutex::new(BTreeSet::new()),
        }
    }

    /// Names of all files created (and not deleted) through this wrapper.
    pub fn created_files(&self) -> BTreeSet<String> {
        self.created.lock().clone()
    }

    pub fn inner(&self) -> &Arc<dyn Storage> {
        &self.inner
    }
}

impl Storage for TrackingStorage {
    fn create_output(&self, name: &str) -> Result<Box<dyn StorageOutput>> {
        let output = self.inner.create_output(name)?;
        self.created.lock().insert(name.to_string());
        Ok(output)
    }

    fn open_input(&self, name: &str) -> Result<Box<dyn StorageInput>> {
        self.inner.open_input(name)
    }

    fn file_exists(&self, name: &str) -> bool {
        self.inner.file_exists(name)
    }

    fn delete_file(&self, name: &str) -> Result<()> {
        self.inner.delete_file(name)?;
        self.created.lock().remove(name);
        Ok(())
    }

    fn list_files(&self) -> Result<Vec<String>> {
        self.inner.list_files()
    }

    fn rename_file(&self, old_name: &str, new_name: &str) -> Result<()> {
        self.inner.rename_file(old_name, new_name)?;
        let mut created = self.created.lock();
        if created.remove(old_name) {
            created.insert(new_name.to_string());
        }
        Ok(())
    }

    fn file_size(&self, name: &str) -> Result<u64> {
        self.inner.file_size(name)
    }
}

//! Compound segment files.
//!
//! A compound segment packs all per-segment files into `{name}.cfs`, with the
//! table of `(file, offset, length)` entries in `{name}.cfe`.

use std::collections::BTreeSet;
use std::io::{Read, Write};

use ahash::AHashMap;

use crate::error::{IrisError, Result};
use crate::storage::Storage;
use crate::storage::structured::{StructReader, StructWriter};

const ENTRIES_MAGIC: u32 = 0x4346_4545; // "CFEE"

pub fn data_file_name(segment: &str) -> String {
    format!("{segment}.cfs")
}

pub fn entries_file_name(segment: &str) -> String {
    format!("{segment}.cfe")
}

/// Pack `files` into the compound files of `segment` and return their names.
///
/// The packed files are left in place; the caller deletes them.
pub fn write_compound(
    storage: &dyn Storage,
    segment: &str,
    files: &BTreeSet<String>,
) -> Result<BTreeSet<String>> {
    let data_name = data_file_name(segment);
    let entries_name = entries_file_name(segment);

    let mut data = storage.create_output(&data_name)?;
    let mut entries = Vec::with_capacity(files.len());
    for file in files {
        let offset = data.position();
        let mut input = storage.open_input(file)?;
        let length = std::io::copy(&mut input, &mut data)?;
        entries.push((file.as_str(), offset, length));
    }
    data.flush_and_sync()?;
    data.close()?;

    let mut table = StructWriter::new(storage.create_output(&entries_name)?);
    table.write_u32(ENTRIES_MAGIC)?;
    table.write_varint(entries.len() as u64)?;
    for (file, offset, length) in entries {
        table.write_string(file)?;
        table.write_u64(offset)?;
        table.write_u64(length)?;
    }
    table.close()?;

    Ok(BTreeSet::from([data_name, entries_name]))
}

/// Read-only view of a compound segment.
#[derive(Debug)]
pub struct CompoundReader {
    data: Vec<u8>,
    entries: AHashMap<String, (u64, u64)>,
}

impl CompoundReader {
    pub fn open(storage: &dyn Storage, segment: &str) -> Result<Self> {
        let mut table = StructReader::new(storage.open_input(&entries_file_name(segment))?);
        if table.read_u32()? != ENTRIES_MAGIC {
            return Err(IrisError::index(format!(
                "{} is not a compound entries file",
                entries_file_name(segment)
            )));
        }
        let count = table.read_varint()? as usize;
        let mut entries = AHashMap::with_capacity(count);
        for _ in 0..count {
            let name = table.read_string()?;
            let offset = table.read_u64()?;
            let length = table.read_u64()?;
            entries.insert(name, (offset, length));
        }
        table.verify_footer()?;

        let mut data = Vec::new();
        storage
            .open_input(&data_file_name(segment))?
            .read_to_end(&mut data)?;
        Ok(CompoundReader { data, entries })
    }

    pub fn file_names(&self) -> BTreeSet<&str> {
        self.entries.keys().map(String::as_str).collect()
    }

    pub fn read_file(&self, name: &str) -> Result<&[u8]> {
        let &(offset, length) = self
            .entries
            .get(name)
            .ok_or_else(|| IrisError::not_found(format!("{name} is not in the compound file")))?;
        let (start, end) = (offset as usize, (offset + length) as usize);
        self.data
            .get(start..end)
            .ok_or_else(|| IrisError::index(format!("entry {name} exceeds the compound data")))
    }
}

/// Copy `bytes` into a fresh file; used by tests and tools.
pub fn write_file(storage: &dyn Storage, name: &str, bytes: &[u8]) -> Result<()> {
    let mut output = storage.create_output(name)?;
    output.write_all(bytes)?;
    output.close()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::{MemoryStorage, MemoryStorageConfig};

    #[test]
    fn test_write_and_read_compound() {
        let storage = MemoryStorage::new(MemoryStorageConfig::default());
        write_file(&storage, "s.post", b"postings").unwrap();
        write_file(&storage, "s.dict", b"dictionary").unwrap();

        let files = BTreeSet::from(["s.post".to_string(), "s.dict".to_string()]);
        let compound = write_compound(&storage, "s", &files).unwrap();
        assert_eq!(
            compound,
            BTreeSet::from(["s.cfs".to_string(), "s.cfe".to_string()])
        );

        let reader = CompoundReader::open(&storage, "s").unwrap();
        assert_eq!(reader.file_names(), BTreeSet::from(["s.dict", "s.post"]));
        assert_eq!(reader.read_file("s.post").unwrap(), b"postings");
        assert_eq!(reader.read_file("s.dict").unwrap(), b"dictionary");
        assert!(matches!(
            reader.read_file("s.dv").unwrap_err(),
            IrisError::NotFound(_)
        ));
    }
}

//! Flushed segment descriptions, live docs and doc maps.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::sync::Arc;

use bit_vec::BitVec;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{IrisError, Result};
use crate::storage::Storage;
use crate::storage::structured::{StructReader, StructWriter};
use crate::writer::frozen_updates::FrozenBufferedUpdates;

/// Magic number at the start of live docs files ("LIVD").
const LIVE_DOCS_MAGIC: u32 = 0x4C49_5644;

/// Metadata of one segment, persisted as `{name}.meta`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentInfo {
    pub name: String,
    /// Random id, unique across segments of all indexes.
    pub id: String,
    pub max_doc: u32,
    pub del_count: u32,
    /// Generation of the current live docs file; 0 means none.
    pub del_gen: u64,
    pub use_compound_file: bool,
    pub files: BTreeSet<String>,
    pub diagnostics: BTreeMap<String, String>,
    pub created: DateTime<Utc>,
}

impl SegmentInfo {
    pub fn new(name: impl Into<String>, max_doc: u32, use_compound_file: bool) -> Self {
        let mut diagnostics = BTreeMap::new();
        diagnostics.insert("source".to_string(), "flush".to_string());
        diagnostics.insert("version".to_string(), crate::VERSION.to_string());
        diagnostics.insert("os".to_string(), std::env::consts::OS.to_string());
        SegmentInfo {
            name: name.into(),
            id: uuid::Uuid::new_v4().to_string(),
            max_doc,
            del_count: 0,
            del_gen: 0,
            use_compound_file,
            files: BTreeSet::new(),
            diagnostics,
            created: Utc::now(),
        }
    }

    pub fn meta_file_name(&self) -> String {
        format!("{}.meta", self.name)
    }

    pub fn live_docs_file_name(&self) -> Option<String> {
        (self.del_gen > 0).then(|| format!("{}_{}.liv", self.name, self.del_gen))
    }

    pub fn live_doc_count(&self) -> u32 {
        self.max_doc - self.del_count
    }

    /// Total size of the segment files, live docs included.
    pub fn size_in_bytes(&self, storage: &dyn Storage) -> Result<u64> {
        let mut total = 0;
        for file in self.files.iter().chain(self.live_docs_file_name().as_ref()) {
            total += storage.file_size(file)?;
        }
        Ok(total)
    }

    /// Write the metadata as JSON, returning the file name.
    pub fn write(&self, storage: &dyn Storage) -> Result<String> {
        let meta_file = self.meta_file_name();
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| IrisError::index(format!("Failed to serialize segment metadata: {e}")))?;
        let mut output = storage.create_output(&meta_file)?;
        output.write_all(json.as_bytes())?;
        output.close()?;
        Ok(meta_file)
    }

    pub fn read(storage: &dyn Storage, name: &str) -> Result<Self> {
        let mut input = storage.open_input(&format!("{name}.meta"))?;
        let mut json = String::new();
        std::io::Read::read_to_string(&mut input, &mut json)?;
        Ok(serde_json::from_str(&json)?)
    }
}

/// Bit set of the documents of a segment that are not deleted.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveDocs {
    bits: BitVec,
    del_count: u32,
}

impl LiveDocs {
    /// All `max_doc` documents live.
    pub fn new(max_doc: u32) -> Self {
        LiveDocs {
            bits: BitVec::from_elem(max_doc as usize, true),
            del_count: 0,
        }
    }

    /// Mark `doc` deleted; returns `false` if it already was.
    pub fn delete(&mut self, doc: u32) -> bool {
        let doc = doc as usize;
        assert!(doc < self.bits.len(), "doc {doc} out of bounds");
        if self.bits[doc] {
            self.bits.set(doc, false);
            self.del_count += 1;
            return true;
        }
        false
    }

    pub fn is_live(&self, doc: u32) -> bool {
        self.bits.get(doc as usize).unwrap_or(false)
    }

    pub fn len(&self) -> u32 {
        self.bits.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    pub fn num_deleted(&self) -> u32 {
        self.del_count
    }

    /// Rewrite the bits so doc ids follow the order of `map`.
    pub fn remap(&self, map: &DocMap) -> Self {
        let mut sorted = LiveDocs::new(self.len());
        for doc in 0..self.len() {
            if !self.is_live(doc) {
                sorted.delete(map.old_to_new(doc));
            }
        }
        sorted
    }

    pub fn write(&self, storage: &dyn Storage, file_name: &str) -> Result<()> {
        let mut writer = StructWriter::new(storage.create_output(file_name)?);
        writer.write_u32(LIVE_DOCS_MAGIC)?;
        writer.write_u32(self.len())?;
        writer.write_u32(self.del_count)?;
        writer.write_bytes(&self.bits.to_bytes())?;
        writer.close()?;
        Ok(())
    }

    pub fn read(storage: &dyn Storage, file_name: &str) -> Result<Self> {
        let mut reader = StructReader::new(storage.open_input(file_name)?);
        if reader.read_u32()? != LIVE_DOCS_MAGIC {
            return Err(IrisError::index(format!("{file_name} is not a live docs file")));
        }
        let max_doc = reader.read_u32()?;
        let del_count = reader.read_u32()?;
        let bytes = reader.read_bytes((max_doc as usize).div_ceil(8))?;
        reader.verify_footer()?;
        let mut bits = BitVec::from_bytes(&bytes);
        bits.truncate(max_doc as usize);
        Ok(LiveDocs { bits, del_count })
    }
}

/// Maps doc ids of a buffer to the doc ids of the segment written for it,
/// when the indexing chain reorders documents at flush.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocMap {
    old_to_new: Vec<u32>,
    new_to_old: Vec<u32>,
}

impl DocMap {
    /// Build from the old doc id of every new position.
    pub fn from_new_to_old(new_to_old: Vec<u32>) -> Result<Self> {
        let mut old_to_new = vec![u32::MAX; new_to_old.len()];
        for (new, &old) in new_to_old.iter().enumerate() {
            match old_to_new.get_mut(old as usize) {
                Some(slot) if *slot == u32::MAX => *slot = new as u32,
                _ => {
                    return Err(IrisError::invalid_argument(format!(
                        "doc map is not a permutation at old doc {old}"
                    )));
                }
            }
        }
        Ok(DocMap {
            old_to_new,
            new_to_old,
        })
    }

    pub fn old_to_new(&self, doc: u32) -> u32 {
        self.old_to_new[doc as usize]
    }

    pub fn new_to_old(&self, doc: u32) -> u32 {
        self.new_to_old[doc as usize]
    }

    pub fn len(&self) -> usize {
        self.old_to_new.len()
    }

    pub fn is_empty(&self) -> bool {
        self.old_to_new.is_empty()
    }
}

/// A segment written by a buffer flush, waiting on its ticket.
#[derive(Debug)]
pub struct FlushedSegment {
    pub info: SegmentInfo,
    /// Query deletes and doc-values updates private to this segment.
    pub segment_updates: Option<Arc<FrozenBufferedUpdates>>,
    pub live_docs: Option<LiveDocs>,
    pub del_count: u32,
    pub sort_map: Option<DocMap>,
}

impl FlushedSegment {
    pub fn new(
        info: SegmentInfo,
        segment_updates: Option<Arc<FrozenBufferedUpdates>>,
        live_docs: Option<LiveDocs>,
        sort_map: Option<DocMap>,
    ) -> Self {
        let del_count = live_docs.as_ref().map_or(0, LiveDocs::num_deleted);
        FlushedSegment {
            info,
            segment_updates: segment_updates.filter(|u| u.any()),
            live_docs,
            del_count,
            sort_map,
        }
    }
}

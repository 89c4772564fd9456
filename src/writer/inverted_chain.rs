//! Reference indexing chain building an in-memory inverted index.
//!
//! Text fields are analyzed into postings with positions, keyword and list
//! fields are indexed verbatim, numeric-like fields become doc values, and
//! every non-null field is stored. At flush the chain resolves buffered term
//! deletes against its postings and writes four files per segment:
//!
//! * `.post` - postings lists (doc, freq, positions) per term
//! * `.dict` - term dictionary pointing into `.post`
//! * `.docs` - stored fields
//! * `.dv`   - doc values, only if any field produced one

use std::collections::BTreeMap;
use std::mem;
use std::sync::Arc;

use ahash::AHashMap;
use log::trace;

use crate::analysis::{Analyzer, StandardAnalyzer};
use crate::data::{DataValue, Document};
use crate::error::{IrisError, Result};
use crate::storage::structured::StructWriter;
use crate::writer::chain::{IndexingChain, IndexingChainFactory, SegmentWriteState};
use crate::writer::segment::DocMap;
use crate::writer::term::Term;

const BYTES_PER_TERM: usize = 8 * mem::size_of::<usize>();
const BYTES_PER_POSTING: usize = 4 * mem::size_of::<u32>() + 3 * mem::size_of::<usize>();
const BYTES_PER_DOC_VALUE: usize = mem::size_of::<(u32, i64)>();

#[derive(Debug)]
struct Posting {
    doc_id: u32,
    positions: Vec<u32>,
}

/// Creates an [`InvertedIndexingChain`] for every buffer.
#[derive(Debug, Clone)]
pub struct InvertedChainFactory {
    analyzer: Arc<dyn Analyzer>,
    max_term_length: usize,
}

impl InvertedChainFactory {
    pub fn new(analyzer: Arc<dyn Analyzer>, max_term_length: usize) -> Self {
        InvertedChainFactory {
            analyzer,
            max_term_length,
        }
    }
}

impl Default for InvertedChainFactory {
    fn default() -> Self {
        Self::new(Arc::new(StandardAnalyzer::new()), 16383)
    }
}

impl IndexingChainFactory for InvertedChainFactory {
    fn create(&self, _segment_name: &str) -> Box<dyn IndexingChain> {
        Box::new(InvertedIndexingChain::new(
            Arc::clone(&self.analyzer),
            self.max_term_length,
        ))
    }
}

/// In-memory inverted index of one segment buffer.
#[derive(Debug)]
pub struct InvertedIndexingChain {
    analyzer: Arc<dyn Analyzer>,
    max_term_length: usize,
    postings: AHashMap<String, AHashMap<Vec<u8>, Vec<Posting>>>,
    stored: Vec<(u32, Vec<(String, DataValue)>)>,
    doc_values: AHashMap<String, Vec<(u32, i64)>>,
    bytes_used: usize,
}

impl InvertedIndexingChain {
    pub fn new(analyzer: Arc<dyn Analyzer>, max_term_length: usize) -> Self {
        InvertedIndexingChain {
            analyzer,
            max_term_length,
            postings: AHashMap::new(),
            stored: Vec::new(),
            doc_values: AHashMap::new(),
            bytes_used: 0,
        }
    }

    /// Terms of a field value with their positions, before any mutation.
    fn invert(&self, field: &str, value: &DataValue) -> Result<Vec<(String, u32)>> {
        let terms: Vec<(String, u32)> = match value {
            DataValue::Text(text) => self
                .analyzer
                .analyze(text)
                .into_iter()
                .map(|token| (token.text, token.position))
                .collect(),
            DataValue::String(keyword) => vec![(keyword.clone(), 0)],
            DataValue::List(keywords) => keywords
                .iter()
                .enumerate()
                .map(|(pos, k)| (k.clone(), pos as u32))
                .collect(),
            _ => Vec::new(),
        };
        if let Some((term, _)) = terms.iter().find(|(t, _)| t.len() > self.max_term_length) {
            return Err(IrisError::document(format!(
                "field \"{field}\" contains a term of {} bytes, longer than the max of {}: {}...",
                term.len(),
                self.max_term_length,
                term.chars().take(30).collect::<String>()
            )));
        }
        Ok(terms)
    }

    fn add_posting(&mut self, field: &str, term: String, doc_id: u32, position: u32) {
        let terms = self.postings.entry(field.to_string()).or_default();
        if !terms.contains_key(term.as_bytes()) {
            self.bytes_used += BYTES_PER_TERM + term.len();
        }
        let postings = terms.entry(term.into_bytes()).or_default();
        match postings.last_mut() {
            Some(last) if last.doc_id == doc_id => last.positions.push(position),
            _ => {
                self.bytes_used += BYTES_PER_POSTING;
                postings.push(Posting {
                    doc_id,
                    positions: vec![position],
                });
            }
        }
        self.bytes_used += mem::size_of::<u32>();
    }

    /// Delete every buffered doc matching a buffered term delete.
    fn apply_term_deletes(&self, state: &mut SegmentWriteState<'_>) {
        let mut deletes: Vec<(&Term, u32)> =
            state.segment_updates.delete_terms().collect();
        deletes.sort();
        for (term, doc_id_upto) in deletes {
            let Some(postings) = self
                .postings
                .get(&term.field)
                .and_then(|terms| terms.get(&term.bytes))
            else {
                continue;
            };
            for posting in postings {
                if posting.doc_id >= doc_id_upto {
                    break;
                }
                state.delete_doc(posting.doc_id);
            }
        }
    }

    fn write_postings(&self, state: &SegmentWriteState<'_>) -> Result<()> {
        let name = state.segment_name;
        let mut post = StructWriter::new(state.storage.create_output(&format!("{name}.post"))?);
        let mut dict = StructWriter::new(state.storage.create_output(&format!("{name}.dict"))?);

        let fields: BTreeMap<&String, &AHashMap<Vec<u8>, Vec<Posting>>> =
            self.postings.iter().collect();
        dict.write_varint(fields.len() as u64)?;
        for (field, terms) in fields {
            let mut sorted: Vec<(&Vec<u8>, &Vec<Posting>)> = terms.iter().collect();
            sorted.sort_unstable_by(|a, b| a.0.cmp(b.0));
            dict.write_string(field)?;
            dict.write_varint(sorted.len() as u64)?;
            for (bytes, postings) in sorted {
                dict.write_varint(bytes.len() as u64)?;
                dict.write_bytes(bytes)?;
                dict.write_varint(postings.len() as u64)?;
                dict.write_u64(post.position())?;

                let mut last_doc = 0;
                for posting in postings {
                    post.write_varint((posting.doc_id - last_doc) as u64)?;
                    post.write_varint(posting.positions.len() as u64)?;
                    let mut last_pos = 0;
                    for &pos in &posting.positions {
                        post.write_varint((pos - last_pos) as u64)?;
                        last_pos = pos;
                    }
                    last_doc = posting.doc_id;
                }
            }
        }
        post.close()?;
        dict.close()?;
        Ok(())
    }

    fn write_stored_fields(&self, state: &SegmentWriteState<'_>) -> Result<()> {
        let name = state.segment_name;
        let mut docs = StructWriter::new(state.storage.create_output(&format!("{name}.docs"))?);
        docs.write_varint(self.stored.len() as u64)?;
        for (doc_id, fields) in &self.stored {
            docs.write_u32(*doc_id)?;
            docs.write_varint(fields.len() as u64)?;
            for (field, value) in fields {
                docs.write_string(field)?;
                match value {
                    DataValue::Null => docs.write_u8(0)?,
                    DataValue::Bool(b) => {
                        docs.write_u8(1)?;
                        docs.write_u8(*b as u8)?;
                    }
                    DataValue::Int64(v) => {
                        docs.write_u8(2)?;
                        docs.write_i64(*v)?;
                    }
                    DataValue::Float64(v) => {
                        docs.write_u8(3)?;
                        docs.write_f64(*v)?;
                    }
                    DataValue::String(s) => {
                        docs.write_u8(4)?;
                        docs.write_string(s)?;
                    }
                    DataValue::Text(s) => {
                        docs.write_u8(5)?;
                        docs.write_string(s)?;
                    }
                    DataValue::Bytes(bytes) => {
                        docs.write_u8(6)?;
                        docs.write_varint(bytes.len() as u64)?;
                        docs.write_bytes(bytes)?;
                    }
                    DataValue::List(items) => {
                        docs.write_u8(7)?;
                        docs.write_varint(items.len() as u64)?;
                        for item in items {
                            docs.write_string(item)?;
                        }
                    }
                    DataValue::DateTime(dt) => {
                        docs.write_u8(8)?;
                        docs.write_string(&dt.to_rfc3339())?;
                    }
                }
            }
        }
        docs.close()?;
        Ok(())
    }

    fn write_doc_values(&self, state: &SegmentWriteState<'_>) -> Result<()> {
        if self.doc_values.is_empty() {
            return Ok(());
        }
        let name = state.segment_name;
        let mut dv = StructWriter::new(state.storage.create_output(&format!("{name}.dv"))?);
        let fields: BTreeMap<&String, &Vec<(u32, i64)>> = self.doc_values.iter().collect();
        dv.write_varint(fields.len() as u64)?;
        for (field, values) in fields {
            dv.write_string(field)?;
            dv.write_varint(values.len() as u64)?;
            for (doc_id, value) in values {
                dv.write_u32(*doc_id)?;
                dv.write_i64(*value)?;
            }
        }
        dv.close()?;
        Ok(())
    }

    fn reset(&mut self) {
        self.postings.clear();
        self.stored.clear();
        self.doc_values.clear();
        self.bytes_used = 0;
    }
}

impl IndexingChain for InvertedIndexingChain {
    fn process_document(&mut self, doc_id: u32, doc: &Document) -> Result<()> {
        let fields: Vec<(&String, &DataValue)> = doc.fields.iter().collect();

        // invert everything first so a rejected document leaves no postings
        let mut inverted = Vec::with_capacity(fields.len());
        for (field, value) in &fields {
            inverted.push(self.invert(field, value)?);
        }

        let mut stored = Vec::with_capacity(fields.len());
        for ((field, value), terms) in fields.into_iter().zip(inverted) {
            for (term, position) in terms {
                self.add_posting(field, term, doc_id, position);
            }
            if let Some(dv) = value.as_doc_value() {
                self.doc_values
                    .entry(field.clone())
                    .or_default()
                    .push((doc_id, dv));
                self.bytes_used += BYTES_PER_DOC_VALUE;
            }
            if !matches!(value, DataValue::Null) {
                self.bytes_used += field.len() + value.heap_size();
                stored.push((field.clone(), value.clone()));
            }
        }
        self.stored.push((doc_id, stored));
        Ok(())
    }

    fn flush(&mut self, state: &mut SegmentWriteState<'_>) -> Result<Option<DocMap>> {
        self.apply_term_deletes(state);
        self.write_postings(state)?;
        self.write_stored_fields(state)?;
        self.write_doc_values(state)?;
        trace!(
            "DWPT: chain flushed {} fields, {} stored docs for {}",
            self.postings.len(),
            self.stored.len(),
            state.segment_name
        );
        self.reset();
        Ok(None)
    }

    fn abort(&mut self) -> Result<()> {
        self.reset();
        Ok(())
    }

    fn ram_bytes_used(&self) -> usize {
        self.bytes_used
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;
    use crate::storage::memory::{MemoryStorage, MemoryStorageConfig};
    use crate::writer::buffered_updates::BufferedUpdates;

    fn chain() -> InvertedIndexingChain {
        InvertedIndexingChain::new(Arc::new(StandardAnalyzer::new()), 10)
    }

    #[test]
    fn test_process_document_tracks_bytes() {
        let mut chain = chain();
        assert_eq!(chain.ram_bytes_used(), 0);
        let doc = Document::new()
            .add_text("body", "hello hello world")
            .add_keyword("id", "1")
            .add_integer("price", 10);
        chain.process_document(0, &doc).unwrap();
        let after_first = chain.ram_bytes_used();
        assert!(after_first > 0);

        chain.process_document(1, &doc).unwrap();
        assert!(chain.ram_bytes_used() > after_first);

        chain.abort().unwrap();
        assert_eq!(chain.ram_bytes_used(), 0);
    }

    #[test]
    fn test_long_term_is_rejected_without_mutation() {
        let mut chain = chain();
        let doc = Document::new()
            .add_text("body", "short")
            .add_keyword("id", "a-keyword-that-is-too-long");
        let err = chain.process_document(0, &doc).unwrap_err();
        assert!(matches!(err, IrisError::Document(_)));
        assert!(!err.is_aborting());
        assert_eq!(chain.ram_bytes_used(), 0);
    }

    #[test]
    fn test_flush_resolves_term_deletes_below_limit() {
        let storage = MemoryStorage::new(MemoryStorageConfig::default());
        let mut chain = chain();
        for i in 0..4u32 {
            let doc = Document::new().add_keyword("id", "dup").add_integer("n", i as i64);
            chain.process_document(i, &doc).unwrap();
        }

        let mut updates = BufferedUpdates::new("s");
        updates.add_term(Term::new("id", "dup"), 3);
        let mut state = SegmentWriteState {
            storage: &storage,
            segment_name: "s",
            max_doc: 4,
            segment_updates: &updates,
            live_docs: None,
            del_count_on_flush: 0,
        };
        assert!(chain.flush(&mut state).unwrap().is_none());
        assert_eq!(state.del_count_on_flush, 3);
        let live = state.live_docs.unwrap();
        assert!(!live.is_live(0));
        assert!(!live.is_live(2));
        assert!(live.is_live(3));

        let files = storage.list_files().unwrap();
        assert_eq!(files, vec!["s.dict", "s.docs", "s.dv", "s.post"]);
    }
}

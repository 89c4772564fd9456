//! Immutable, compacted snapshots of buffered updates.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::util::set_once::SetOnce;
use crate::writer::buffered_updates::{BYTES_PER_DEL_QUERY, BYTES_PER_DV_UPDATE, BufferedUpdates};
use crate::writer::term::{DocValuesUpdate, QueryRef, Term};

/// Sorted terms, prefix-compressed against their predecessor.
///
/// Each entry is `varint(shared << 1 | field_changed)`, the field name when
/// it changed, then `varint(suffix_len)` and the suffix bytes.
#[derive(Debug, Clone, Default)]
pub struct PrefixCodedTerms {
    data: Vec<u8>,
    size: usize,
}

impl PrefixCodedTerms {
    /// Build from terms that are already sorted and deduplicated.
    pub fn from_sorted<'a>(terms: impl IntoIterator<Item = &'a Term>) -> Self {
        let mut data = Vec::new();
        let mut size = 0;
        let mut last: Option<&Term> = None;
        for term in terms {
            let (field_changed, shared) = match last {
                Some(prev) if prev.field == term.field => {
                    debug_assert!(prev.bytes < term.bytes, "terms must be sorted and unique");
                    (false, shared_prefix(&prev.bytes, &term.bytes))
                }
                _ => (true, 0),
            };
            write_varint(&mut data, ((shared as u64) << 1) | field_changed as u64);
            if field_changed {
                write_varint(&mut data, term.field.len() as u64);
                data.extend_from_slice(term.field.as_bytes());
            }
            let suffix = &term.bytes[shared..];
            write_varint(&mut data, suffix.len() as u64);
            data.extend_from_slice(suffix);
            size += 1;
            last = Some(term);
        }
        PrefixCodedTerms { data, size }
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn ram_bytes_used(&self) -> usize {
        self.data.capacity()
    }

    pub fn iter(&self) -> PrefixCodedTermsIter<'_> {
        PrefixCodedTermsIter {
            data: &self.data,
            pos: 0,
            field: String::new(),
            bytes: Vec::new(),
        }
    }
}

/// Decodes a [`PrefixCodedTerms`] in sort order.
pub struct PrefixCodedTermsIter<'a> {
    data: &'a [u8],
    pos: usize,
    field: String,
    bytes: Vec<u8>,
}

impl Iterator for PrefixCodedTermsIter<'_> {
    type Item = Term;

    fn next(&mut self) -> Option<Term> {
        if self.pos >= self.data.len() {
            return None;
        }
        let code = read_varint(self.data, &mut self.pos);
        if code & 1 == 1 {
            let len = read_varint(self.data, &mut self.pos) as usize;
            self.field = String::from_utf8_lossy(&self.data[self.pos..self.pos + len]).into_owned();
            self.pos += len;
        }
        let shared = (code >> 1) as usize;
        let suffix_len = read_varint(self.data, &mut self.pos) as usize;
        self.bytes.truncate(shared);
        self.bytes
            .extend_from_slice(&self.data[self.pos..self.pos + suffix_len]);
        self.pos += suffix_len;
        Some(Term::from_bytes(self.field.clone(), self.bytes.clone()))
    }
}

fn shared_prefix(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

fn write_varint(out: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        out.push((value as u8) | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
}

fn read_varint(data: &[u8], pos: &mut usize) -> u64 {
    let mut value = 0u64;
    let mut shift = 0;
    loop {
        let byte = data[*pos];
        *pos += 1;
        value |= ((byte & 0x7f) as u64) << shift;
        if byte & 0x80 == 0 {
            return value;
        }
        shift += 7;
    }
}

const UNASSIGNED_GEN: u64 = u64::MAX;

/// Holds buffered deletes and updates by term or query once pushed.
///
/// Pushed packets are write-once, so they move to a more compact layout.
/// Doc ids are not kept because they are applied on flush. A packet gets a
/// delete generation exactly once, when it is pushed to the update stream,
/// and carries a latch recording that it was applied to all live segments.
pub struct FrozenBufferedUpdates {
    terms: PrefixCodedTerms,
    // query and the doc id ceiling for each
    queries: Vec<(QueryRef, u32)>,
    field_updates: Vec<DocValuesUpdate>,
    num_term_deletes: usize,
    bytes_used: usize,
    del_gen: AtomicU64,
    applied: SetOnce,
    // set iff this packet holds the private deletes of one flushed segment
    private_segment: Option<String>,
}

impl FrozenBufferedUpdates {
    pub fn new(updates: &BufferedUpdates, private_segment: Option<String>) -> Self {
        assert!(
            private_segment.is_none() || updates.num_unique_delete_terms() == 0,
            "segment private packets must not carry term deletes"
        );
        let mut sorted: Vec<&Term> = updates.delete_terms().map(|(t, _)| t).collect();
        sorted.sort();
        let terms = PrefixCodedTerms::from_sorted(sorted);

        let mut queries: Vec<(QueryRef, u32)> = updates
            .delete_queries()
            .map(|(q, upto)| (q.clone(), upto))
            .collect();
        queries.sort_by_key(|(q, _)| q.key());

        let field_updates: Vec<DocValuesUpdate> = updates.field_updates().cloned().collect();

        let bytes_used = terms.ram_bytes_used()
            + queries.len() * BYTES_PER_DEL_QUERY
            + field_updates
                .iter()
                .map(|u| BYTES_PER_DV_UPDATE + u.heap_size())
                .sum::<usize>();

        FrozenBufferedUpdates {
            terms,
            queries,
            field_updates,
            num_term_deletes: updates.num_term_deletes(),
            bytes_used,
            del_gen: AtomicU64::new(UNASSIGNED_GEN),
            applied: SetOnce::new(),
            private_segment,
        }
    }

    /// Assign the delete generation.
    ///
    /// # Panics
    ///
    /// Panics if a generation was already assigned.
    pub fn set_del_gen(&self, del_gen: u64) {
        assert_ne!(del_gen, UNASSIGNED_GEN, "invalid delete generation");
        let prev = self.del_gen.compare_exchange(
            UNASSIGNED_GEN,
            del_gen,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        assert!(prev.is_ok(), "delete generation was already set");
    }

    pub fn del_gen(&self) -> Option<u64> {
        match self.del_gen.load(Ordering::Acquire) {
            UNASSIGNED_GEN => None,
            del_gen => Some(del_gen),
        }
    }

    pub fn mark_applied(&self) -> bool {
        self.applied.try_set()
    }

    pub fn is_applied(&self) -> bool {
        self.applied.get()
    }

    pub fn terms(&self) -> PrefixCodedTermsIter<'_> {
        self.terms.iter()
    }

    pub fn queries(&self) -> &[(QueryRef, u32)] {
        &self.queries
    }

    pub fn field_updates(&self) -> &[DocValuesUpdate] {
        &self.field_updates
    }

    pub fn num_unique_terms(&self) -> usize {
        self.terms.len()
    }

    pub fn num_term_deletes(&self) -> usize {
        self.num_term_deletes
    }

    pub fn private_segment(&self) -> Option<&str> {
        self.private_segment.as_deref()
    }

    pub fn any(&self) -> bool {
        !self.terms.is_empty() || !self.queries.is_empty() || !self.field_updates.is_empty()
    }

    pub fn ram_bytes_used(&self) -> usize {
        self.bytes_used
    }
}

impl fmt::Debug for FrozenBufferedUpdates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrozenBufferedUpdates")
            .field("del_gen", &self.del_gen())
            .field("unique_terms", &self.terms.len())
            .field("queries", &self.queries.len())
            .field("field_updates", &self.field_updates.len())
            .field("bytes_used", &self.bytes_used)
            .field("private_segment", &self.private_segment)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::writer::term::MatchAllDocsQuery;

    #[test]
    fn test_prefix_coded_terms_preserve_sorted_order() {
        let terms = vec![
            Term::new("body", "search"),
            Term::new("body", "searcher"),
            Term::new("body", "seat"),
            Term::new("id", "1"),
            Term::new("id", "10"),
        ];
        let coded = PrefixCodedTerms::from_sorted(&terms);
        assert_eq!(coded.len(), 5);
        let decoded: Vec<Term> = coded.iter().collect();
        assert_eq!(decoded, terms);
    }

    #[test]
    fn test_freeze_sorts_terms_and_keeps_queries() {
        let mut updates = BufferedUpdates::new("global");
        updates.add_term(Term::new("id", "b"), u32::MAX);
        updates.add_term(Term::new("id", "a"), u32::MAX);
        updates.add_query(Arc::new(MatchAllDocsQuery), 12);

        let frozen = FrozenBufferedUpdates::new(&updates, None);
        let terms: Vec<String> = frozen.terms().map(|t| t.to_string()).collect();
        assert_eq!(terms, vec!["id:a", "id:b"]);
        assert_eq!(frozen.queries().len(), 1);
        assert_eq!(frozen.queries()[0].1, 12);
        assert!(frozen.any());
        assert!(frozen.ram_bytes_used() > 0);
    }

    #[test]
    fn test_del_gen_and_applied_latch() {
        let frozen = FrozenBufferedUpdates::new(&BufferedUpdates::new("s"), None);
        assert_eq!(frozen.del_gen(), None);
        frozen.set_del_gen(3);
        assert_eq!(frozen.del_gen(), Some(3));
        assert!(frozen.mark_applied());
        assert!(!frozen.mark_applied());
        assert!(frozen.is_applied());
    }

    #[test]
    #[should_panic(expected = "delete generation was already set")]
    fn test_del_gen_set_twice_panics() {
        let frozen = FrozenBufferedUpdates::new(&BufferedUpdates::new("s"), None);
        frozen.set_del_gen(1);
        frozen.set_del_gen(2);
    }

    #[test]
    #[should_panic(expected = "segment private packets must not carry term deletes")]
    fn test_private_packet_rejects_terms() {
        let mut updates = BufferedUpdates::new("s");
        updates.add_term(Term::new("id", "1"), 1);
        let _ = FrozenBufferedUpdates::new(&updates, Some("s".to_string()));
    }
}

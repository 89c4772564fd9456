//! Mutable accumulator of buffered deletes and doc-values updates.

use std::mem;

use ahash::AHashMap;

use crate::writer::term::{DocValuesUpdate, MAX_DOC_ID_UPTO, QueryRef, Term};

// Rough logic: del doc ids are a Vec<u32> that allocates ~2X its size.
pub const BYTES_PER_DEL_DOCID: usize = 2 * mem::size_of::<u32>();

/// Rough logic: hash-map slot plus a Term holding two Vecs (2 * usize each)
/// before the term bytes themselves.
pub const BYTES_PER_DEL_TERM: usize = 6 * mem::size_of::<usize>();

/// Rough logic: hash-map slots plus the (String, (Arc<dyn Query>, u32))
/// entry; the query itself is undercounted at 28 bytes.
pub const BYTES_PER_DEL_QUERY: usize = 4 * mem::size_of::<usize>() + 28;

/// Per-update overhead of a buffered doc-values update.
pub const BYTES_PER_DV_UPDATE: usize = 6 * mem::size_of::<usize>() + 8;

/// Holds buffered deletes and updates by doc id, term or query for a single
/// in-memory segment, or for the global buffer of the delete queue.
///
/// Every delete carries a doc id ceiling: it affects documents with ids below
/// that ceiling only. Instances are accessed either through the private state
/// of a per-thread buffer or under the delete queue's global lock.
#[derive(Debug, Default)]
pub struct BufferedUpdates {
    segment_name: String,
    delete_terms: AHashMap<Term, u32>,
    // keyed by the query key; queries are shared across threads
    delete_queries: AHashMap<String, (QueryRef, u32)>,
    delete_doc_ids: Vec<u32>,
    field_updates: AHashMap<String, Vec<DocValuesUpdate>>,
    num_term_deletes: usize,
    num_field_updates: usize,
    bytes_used: usize,
    terms_bytes_used: usize,
    field_updates_bytes_used: usize,
}

impl BufferedUpdates {
    pub fn new(segment_name: impl Into<String>) -> Self {
        BufferedUpdates {
            segment_name: segment_name.into(),
            ..Default::default()
        }
    }

    pub fn segment_name(&self) -> &str {
        &self.segment_name
    }

    pub fn add_query(&mut self, query: QueryRef, doc_id_upto: u32) {
        let key = query.key();
        let key_len = key.len();
        // increment bytes used only if the query wasn't added so far.
        if self.delete_queries.insert(key, (query, doc_id_upto)).is_none() {
            self.bytes_used += BYTES_PER_DEL_QUERY + key_len;
        }
    }

    pub fn add_term(&mut self, term: Term, doc_id_upto: u32) {
        let current = self.delete_terms.get(&term).copied();
        if let Some(current) = current {
            if doc_id_upto < current {
                // Only record the new number if it's greater than the current
                // one. If several threads replace the same document at nearly
                // the same time, the thread holding the higher doc id may be
                // scheduled first; blindly replacing would index both docs.
                return;
            }
        }
        let size = term.heap_size();
        self.delete_terms.insert(term, doc_id_upto);
        // repeated deletes of a buffered term are over-counted on purpose
        self.num_term_deletes += 1;
        if current.is_none() {
            self.terms_bytes_used += BYTES_PER_DEL_TERM + size;
        }
    }

    pub fn add_doc_id(&mut self, doc_id: u32) {
        self.delete_doc_ids.push(doc_id);
        self.bytes_used += BYTES_PER_DEL_DOCID;
    }

    pub fn add_doc_values_update(&mut self, mut update: DocValuesUpdate, doc_id_upto: u32) {
        if doc_id_upto != MAX_DOC_ID_UPTO {
            // segment private update
            update.doc_id_upto = doc_id_upto;
        }
        self.field_updates_bytes_used += BYTES_PER_DV_UPDATE + update.heap_size();
        self.field_updates
            .entry(update.field.clone())
            .or_default()
            .push(update);
        self.num_field_updates += 1;
    }

    pub fn delete_terms(&self) -> impl Iterator<Item = (&Term, u32)> {
        self.delete_terms.iter().map(|(t, upto)| (t, *upto))
    }

    pub fn delete_term_limit(&self, term: &Term) -> Option<u32> {
        self.delete_terms.get(term).copied()
    }

    pub fn delete_queries(&self) -> impl Iterator<Item = (&QueryRef, u32)> {
        self.delete_queries.values().map(|(q, upto)| (q, *upto))
    }

    pub fn delete_doc_ids(&self) -> &[u32] {
        &self.delete_doc_ids
    }

    pub fn field_updates(&self) -> impl Iterator<Item = &DocValuesUpdate> {
        self.field_updates.values().flatten()
    }

    pub fn num_term_deletes(&self) -> usize {
        self.num_term_deletes
    }

    pub fn num_unique_delete_terms(&self) -> usize {
        self.delete_terms.len()
    }

    pub fn num_query_deletes(&self) -> usize {
        self.delete_queries.len()
    }

    pub fn num_field_updates(&self) -> usize {
        self.num_field_updates
    }

    /// Drop term deletes once they were resolved against the in-memory postings.
    pub fn clear_delete_terms(&mut self) {
        self.delete_terms.clear();
        self.num_term_deletes = 0;
        self.terms_bytes_used = 0;
    }

    /// Take the deleted doc ids, releasing their byte estimate.
    pub fn take_delete_doc_ids(&mut self) -> Vec<u32> {
        self.bytes_used -= self.delete_doc_ids.len() * BYTES_PER_DEL_DOCID;
        mem::take(&mut self.delete_doc_ids)
    }

    pub fn clear(&mut self) {
        self.delete_terms.clear();
        self.delete_queries.clear();
        self.delete_doc_ids.clear();
        self.field_updates.clear();
        self.num_term_deletes = 0;
        self.num_field_updates = 0;
        self.bytes_used = 0;
        self.terms_bytes_used = 0;
        self.field_updates_bytes_used = 0;
    }

    pub fn any(&self) -> bool {
        !self.delete_terms.is_empty()
            || !self.delete_doc_ids.is_empty()
            || !self.delete_queries.is_empty()
            || self.num_field_updates > 0
    }

    pub fn ram_bytes_used(&self) -> usize {
        self.bytes_used + self.terms_bytes_used + self.field_updates_bytes_used
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::writer::term::MatchAllDocsQuery;

    #[test]
    fn test_add_term_keeps_highest_limit() {
        let mut updates = BufferedUpdates::new("segment_000000");
        updates.add_term(Term::new("id", "1"), 5);
        updates.add_term(Term::new("id", "1"), 3);
        assert_eq!(updates.delete_term_limit(&Term::new("id", "1")), Some(5));
        assert_eq!(updates.num_term_deletes(), 1);

        updates.add_term(Term::new("id", "1"), 9);
        assert_eq!(updates.delete_term_limit(&Term::new("id", "1")), Some(9));
        assert_eq!(updates.num_term_deletes(), 2);
        assert_eq!(updates.num_unique_delete_terms(), 1);
    }

    #[test]
    fn test_bytes_accounting() {
        let mut updates = BufferedUpdates::new("s");
        assert_eq!(updates.ram_bytes_used(), 0);
        assert!(!updates.any());

        updates.add_term(Term::new("id", "abc"), 1);
        let after_term = updates.ram_bytes_used();
        assert_eq!(after_term, BYTES_PER_DEL_TERM + 5);

        // re-adding a buffered term does not grow the estimate
        updates.add_term(Term::new("id", "abc"), 2);
        assert_eq!(updates.ram_bytes_used(), after_term);

        updates.add_query(Arc::new(MatchAllDocsQuery), 4);
        updates.add_query(Arc::new(MatchAllDocsQuery), 6);
        assert_eq!(updates.num_query_deletes(), 1);
        assert_eq!(
            updates.ram_bytes_used(),
            after_term + BYTES_PER_DEL_QUERY + "*:*".len()
        );

        updates.add_doc_id(3);
        let ids = updates.take_delete_doc_ids();
        assert_eq!(ids, vec![3]);
        assert_eq!(
            updates.ram_bytes_used(),
            after_term + BYTES_PER_DEL_QUERY + "*:*".len()
        );

        updates.clear_delete_terms();
        assert_eq!(updates.num_term_deletes(), 0);
        assert!(updates.any());

        updates.clear();
        assert!(!updates.any());
        assert_eq!(updates.ram_bytes_used(), 0);
    }

    #[test]
    fn test_doc_values_update_gets_private_limit() {
        let mut updates = BufferedUpdates::new("s");
        updates.add_doc_values_update(DocValuesUpdate::numeric(Term::new("id", "1"), "price", 10), 7);
        updates.add_doc_values_update(
            DocValuesUpdate::numeric(Term::new("id", "2"), "price", 20),
            MAX_DOC_ID_UPTO,
        );
        let mut limits: Vec<u32> = updates.field_updates().map(|u| u.doc_id_upto).collect();
        limits.sort();
        assert_eq!(limits, vec![7, MAX_DOC_ID_UPTO]);
        assert_eq!(updates.num_field_updates(), 2);
    }
}

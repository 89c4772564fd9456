//! Terms, delete queries and doc-values updates.

use std::borrow::Cow;
use std::fmt::{self, Debug, Display};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Doc id ceiling meaning "applies to every document buffered so far".
pub const MAX_DOC_ID_UPTO: u32 = u32::MAX;

/// A field/value pair identifying indexed documents.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Term {
    pub field: String,
    pub bytes: Vec<u8>,
}

impl Term {
    pub fn new(field: impl Into<String>, text: impl AsRef<str>) -> Self {
        Term {
            field: field.into(),
            bytes: text.as_ref().as_bytes().to_vec(),
        }
    }

    pub fn from_bytes(field: impl Into<String>, bytes: Vec<u8>) -> Self {
        Term {
            field: field.into(),
            bytes,
        }
    }

    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.bytes)
    }

    /// Heap bytes held by the field name and term bytes.
    pub fn heap_size(&self) -> usize {
        self.field.len() + self.bytes.len()
    }
}

impl Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.field, self.text())
    }
}

/// A query whose matches should be deleted.
///
/// The ingestion core never evaluates queries; it only buffers them with a
/// doc id ceiling and hands them to whatever resolves deletes against
/// segments. Queries with equal keys collapse into one buffered delete.
pub trait DeleteQuery: Debug + Send + Sync {
    fn key(&self) -> String;
}

/// Matches every document.
#[derive(Debug, Clone, Default)]
pub struct MatchAllDocsQuery;

impl DeleteQuery for MatchAllDocsQuery {
    fn key(&self) -> String {
        "*:*".to_string()
    }
}

/// Matches terms of `field` within an inclusive range; open bounds are `None`.
#[derive(Debug, Clone)]
pub struct TermRangeQuery {
    pub field: String,
    pub lower: Option<String>,
    pub upper: Option<String>,
}

impl TermRangeQuery {
    pub fn new(field: impl Into<String>, lower: Option<&str>, upper: Option<&str>) -> Self {
        TermRangeQuery {
            field: field.into(),
            lower: lower.map(str::to_string),
            upper: upper.map(str::to_string),
        }
    }
}

impl DeleteQuery for TermRangeQuery {
    fn key(&self) -> String {
        format!(
            "{}:[{} TO {}]",
            self.field,
            self.lower.as_deref().unwrap_or("*"),
            self.upper.as_deref().unwrap_or("*")
        )
    }
}

pub type QueryRef = Arc<dyn DeleteQuery>;

/// New value written by a doc-values update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DocValue {
    Numeric(i64),
    Binary(Vec<u8>),
}

impl DocValue {
    fn heap_size(&self) -> usize {
        match self {
            DocValue::Numeric(_) => 8,
            DocValue::Binary(b) => b.len(),
        }
    }
}

/// Updates the doc-values field of every document matching `term`.
///
/// A `None` value resets the field for the matched documents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocValuesUpdate {
    pub term: Term,
    pub field: String,
    pub value: Option<DocValue>,
    pub doc_id_upto: u32,
}

impl DocValuesUpdate {
    pub fn numeric(term: Term, field: impl Into<String>, value: i64) -> Self {
        DocValuesUpdate {
            term,
            field: field.into(),
            value: Some(DocValue::Numeric(value)),
            doc_id_upto: MAX_DOC_ID_UPTO,
        }
    }

    pub fn binary(term: Term, field: impl Into<String>, value: Vec<u8>) -> Self {
        DocValuesUpdate {
            term,
            field: field.into(),
            value: Some(DocValue::Binary(value)),
            doc_id_upto: MAX_DOC_ID_UPTO,
        }
    }

    pub fn reset(term: Term, field: impl Into<String>) -> Self {
        DocValuesUpdate {
            term,
            field: field.into(),
            value: None,
            doc_id_upto: MAX_DOC_ID_UPTO,
        }
    }

    pub fn heap_size(&self) -> usize {
        self.term.heap_size() + self.field.len() + self.value.as_ref().map_or(0, DocValue::heap_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_term_ordering_is_field_then_bytes() {
        let mut terms = vec![
            Term::new("id", "b"),
            Term::new("body", "z"),
            Term::new("id", "a"),
        ];
        terms.sort();
        let rendered: Vec<String> = terms.iter().map(|t| t.to_string()).collect();
        assert_eq!(rendered, vec!["body:z", "id:a", "id:b"]);
    }

    #[test]
    fn test_query_keys() {
        assert_eq!(MatchAllDocsQuery.key(), "*:*");
        assert_eq!(
            TermRangeQuery::new("year", Some("2000"), None).key(),
            "year:[2000 TO *]"
        );
    }
}

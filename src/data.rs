//! Documents as handed to the writer.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// The value of one document field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DataValue {
    Null,
    Bool(bool),
    Int64(i64),
    Float64(f64),

    /// String content indexed as a single keyword term.
    String(String),

    /// Text content to be analyzed into terms.
    Text(String),

    /// Binary content, stored but not indexed.
    Bytes(Vec<u8>),

    /// List of keywords (e.g. tags), each indexed as its own term.
    List(Vec<String>),

    /// Date and time in UTC.
    DateTime(chrono::DateTime<chrono::Utc>),
}

impl DataValue {
    /// Returns the text value if this is a Text or String variant.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            DataValue::Text(s) | DataValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the integer value if this is an Int64 variant.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            DataValue::Int64(i) => Some(*i),
            _ => None,
        }
    }

    /// The value as a numeric doc value, if it has one.
    ///
    /// Floats keep their bit pattern, dates become epoch milliseconds.
    pub fn as_doc_value(&self) -> Option<i64> {
        match self {
            DataValue::Int64(v) => Some(*v),
            DataValue::Float64(v) => Some(v.to_bits() as i64),
            DataValue::Bool(v) => Some(*v as i64),
            DataValue::DateTime(dt) => Some(dt.timestamp_millis()),
            _ => None,
        }
    }

    /// Rough heap footprint of the value, used for RAM accounting.
    pub fn heap_size(&self) -> usize {
        match self {
            DataValue::String(s) | DataValue::Text(s) => s.len(),
            DataValue::Bytes(b) => b.len(),
            DataValue::List(items) => items.iter().map(|s| s.len() + 24).sum(),
            _ => 0,
        }
    }
}

impl From<String> for DataValue {
    fn from(v: String) -> Self {
        DataValue::Text(v)
    }
}

impl From<&str> for DataValue {
    fn from(v: &str) -> Self {
        DataValue::Text(v.to_string())
    }
}

impl From<i64> for DataValue {
    fn from(v: i64) -> Self {
        DataValue::Int64(v)
    }
}

impl From<f64> for DataValue {
    fn from(v: f64) -> Self {
        DataValue::Float64(v)
    }
}

impl From<bool> for DataValue {
    fn from(v: bool) -> Self {
        DataValue::Bool(v)
    }
}

impl From<chrono::DateTime<chrono::Utc>> for DataValue {
    fn from(dt: chrono::DateTime<chrono::Utc>) -> Self {
        DataValue::DateTime(dt)
    }
}

impl From<Vec<String>> for DataValue {
    fn from(v: Vec<String>) -> Self {
        DataValue::List(v)
    }
}

/// Named field values, iterated in field name order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Document {
    pub fields: BTreeMap<String, DataValue>,
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_field(mut self, name: impl Into<String>, value: impl Into<DataValue>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Add a field analyzed into terms.
    pub fn add_text(mut self, name: impl Into<String>, text: impl Into<String>) -> Self {
        self.fields
            .insert(name.into(), DataValue::Text(text.into()));
        self
    }

    /// Add a keyword field, indexed verbatim as one term.
    pub fn add_keyword(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields
            .insert(name.into(), DataValue::String(value.into()));
        self
    }

    /// Add an integer field; it is stored and kept as a doc value.
    pub fn add_integer(mut self, name: impl Into<String>, value: i64) -> Self {
        self.fields.insert(name.into(), DataValue::Int64(value));
        self
    }

    pub fn add_float(mut self, name: impl Into<String>, value: f64) -> Self {
        self.fields.insert(name.into(), DataValue::Float64(value));
        self
    }

    /// Add a field that is stored only.
    pub fn add_bytes(mut self, name: impl Into<String>, data: Vec<u8>) -> Self {
        self.fields.insert(name.into(), DataValue::Bytes(data));
        self
    }

    pub fn get(&self, name: &str) -> Option<&DataValue> {
        self.fields.get(name)
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Rough heap footprint of all field names and values.
    pub fn heap_size(&self) -> usize {
        self.fields
            .iter()
            .map(|(name, value)| name.len() + value.heap_size() + 32)
            .sum()
    }
}

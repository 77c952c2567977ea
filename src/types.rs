//! Row-level types shared across the write and read paths.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// A value as stored in a table: either bytes or a deletion marker.
///
/// An empty byte sequence is a real value, distinct from a tombstone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueDeletable {
    Value(Bytes),
    Tombstone,
}

impl ValueDeletable {
    pub fn is_tombstone(&self) -> bool {
        matches!(self, ValueDeletable::Tombstone)
    }

    /// Stored length in bytes; tombstones account for zero value bytes.
    pub fn len(&self) -> usize {
        match self {
            ValueDeletable::Value(v) => v.len(),
            ValueDeletable::Tombstone => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn into_option(self) -> Option<Bytes> {
        match self {
            ValueDeletable::Value(v) => Some(v),
            ValueDeletable::Tombstone => None,
        }
    }
}

/// A key paired with a value-or-tombstone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowEntry {
    pub key: Bytes,
    pub value: ValueDeletable,
}

impl RowEntry {
    pub fn new_value(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            value: ValueDeletable::Value(value.into()),
        }
    }

    pub fn new_tombstone(key: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            value: ValueDeletable::Tombstone,
        }
    }
}

/// A key paired with live value bytes; tombstones are filtered out before
/// this type is produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: Bytes,
    pub value: Bytes,
}

//! Cursor over a [`KVTable`].

use std::sync::Arc;

use bytes::Bytes;

use crate::error::Result;
use crate::memtable::KVTable;
use crate::merge::KeyValueIterator;
use crate::types::RowEntry;

/// Lazy, single-pass, not restartable. Tracks the last yielded key and
/// steps to the next strictly greater one, so concurrent inserts behind the
/// cursor are never re-observed and order is never violated.
pub struct KVTableIterator {
    table: Arc<KVTable>,
    last_key: Option<Bytes>,
}

impl KVTableIterator {
    pub(crate) fn new(table: Arc<KVTable>) -> Self {
        Self {
            table,
            last_key: None,
        }
    }

    pub fn next_entry(&mut self) -> Option<RowEntry> {
        let entry = self.table.range_from(self.last_key.as_ref())?;
        self.last_key = Some(entry.key.clone());
        Some(entry)
    }

    /// Next live key/value, skipping tombstones.
    pub fn next(&mut self) -> Option<crate::types::KeyValue> {
        while let Some(entry) = self.next_entry() {
            if let crate::types::ValueDeletable::Value(value) = entry.value {
                return Some(crate::types::KeyValue {
                    key: entry.key,
                    value,
                });
            }
        }
        None
    }
}

impl KeyValueIterator for KVTableIterator {
    fn next_entry(&mut self) -> Result<Option<RowEntry>> {
        Ok(KVTableIterator::next_entry(self))
    }
}

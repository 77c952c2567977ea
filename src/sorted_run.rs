//! Sorted runs: compaction output levels with disjoint-range SSTs.

use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::merge::KeyValueIterator;
use crate::sst::iter::SstIterator;
use crate::sst::SstHandle;
use crate::table_store::TableStore;
use crate::types::RowEntry;

/// An ordered list of SST handles with non-overlapping key ranges. First
/// keys ascend strictly, so a binary search on first keys locates the one
/// SST that may contain a given key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortedRun {
    pub id: u32,
    pub ssts: Vec<SstHandle>,
}

impl SortedRun {
    fn index_of_sst_with_key(&self, key: &[u8]) -> Option<usize> {
        let idx = self.ssts.partition_point(|sst| {
            match &sst.info.first_key {
                Some(first_key) => first_key.as_ref() <= key,
                None => true,
            }
        });
        idx.checked_sub(1)
    }

    /// The unique SST whose range may contain `key`, if any.
    pub fn sst_with_key(&self, key: &[u8]) -> Option<&SstHandle> {
        self.index_of_sst_with_key(key).map(|idx| &self.ssts[idx])
    }
}

/// Chains the run's SST iterators into one ordered stream.
pub struct SortedRunIterator {
    table_store: Arc<TableStore>,
    remaining: std::vec::IntoIter<SstHandle>,
    current: Option<SstIterator>,
}

impl SortedRunIterator {
    pub fn new(run: &SortedRun, table_store: Arc<TableStore>) -> Result<Self> {
        Self::from_handles(run.ssts.clone(), None, table_store)
    }

    /// Starts at the first entry with key >= `key`.
    pub fn new_from_key(
        run: &SortedRun,
        key: Bytes,
        table_store: Arc<TableStore>,
    ) -> Result<Self> {
        let start = run.index_of_sst_with_key(&key).unwrap_or(0);
        Self::from_handles(run.ssts[start..].to_vec(), Some(key), table_store)
    }

    fn from_handles(
        handles: Vec<SstHandle>,
        from_key: Option<Bytes>,
        table_store: Arc<TableStore>,
    ) -> Result<Self> {
        let mut remaining = handles.into_iter();
        let current = match remaining.next() {
            Some(handle) => Some(match from_key {
                Some(key) => SstIterator::new_from_key(handle, key, table_store.clone())?,
                None => SstIterator::new(handle, table_store.clone())?,
            }),
            None => None,
        };
        Ok(Self {
            table_store,
            remaining,
            current,
        })
    }

    pub fn next_entry(&mut self) -> Result<Option<RowEntry>> {
        loop {
            let Some(current) = self.current.as_mut() else {
                return Ok(None);
            };
            if let Some(entry) = current.next_entry()? {
                return Ok(Some(entry));
            }
            self.current = match self.remaining.next() {
                Some(handle) => Some(SstIterator::new(handle, self.table_store.clone())?),
                None => None,
            };
        }
    }
}

impl KeyValueIterator for SortedRunIterator {
    fn next_entry(&mut self) -> Result<Option<RowEntry>> {
        SortedRunIterator::next_entry(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_store::InMemoryObjectStore;
    use crate::sst::{SsTableFormat, SstId};

    fn build_run(table_store: &Arc<TableStore>, groups: &[&[&str]]) -> SortedRun {
        let mut ssts = Vec::new();
        for group in groups {
            let mut builder = table_store.table_builder();
            for key in *group {
                builder
                    .add(
                        Bytes::copy_from_slice(key.as_bytes()),
                        Some(Bytes::copy_from_slice(key.as_bytes())),
                    )
                    .expect("add");
            }
            let encoded = builder.build().expect("build");
            let handle = table_store
                .write_sst(&SstId::Compacted(ulid::Ulid::new()), encoded)
                .expect("write");
            ssts.push(handle);
        }
        SortedRun { id: 0, ssts }
    }

    fn test_table_store() -> Arc<TableStore> {
        Arc::new(TableStore::new(
            Arc::new(InMemoryObjectStore::new()),
            SsTableFormat::default(),
            "testdb",
        ))
    }

    #[test]
    fn locates_sst_by_first_key() {
        let table_store = test_table_store();
        let run = build_run(&table_store, &[&["bb", "cc"], &["ff", "gg"], &["mm"]]);

        assert!(run.sst_with_key(b"aa").is_none());
        let found = run.sst_with_key(b"cc").expect("sst");
        assert_eq!(found.info.first_key.as_deref(), Some(b"bb".as_ref()));
        let found = run.sst_with_key(b"zz").expect("sst");
        assert_eq!(found.info.first_key.as_deref(), Some(b"mm".as_ref()));
    }

    #[test]
    fn iterates_across_sst_boundaries() -> Result<()> {
        let table_store = test_table_store();
        let run = build_run(&table_store, &[&["aa", "bb"], &["cc"], &["dd", "ee"]]);

        let mut iter = SortedRunIterator::new(&run, table_store)?;
        let mut keys = Vec::new();
        while let Some(entry) = iter.next_entry()? {
            keys.push(entry.key);
        }
        assert_eq!(keys, vec!["aa", "bb", "cc", "dd", "ee"]);
        Ok(())
    }

    #[test]
    fn seeks_to_key_within_run() -> Result<()> {
        let table_store = test_table_store();
        let run = build_run(&table_store, &[&["aa", "bb"], &["cc", "dd"]]);

        let mut iter =
            SortedRunIterator::new_from_key(&run, Bytes::from_static(b"cc"), table_store)?;
        let entry = iter.next_entry()?.expect("entry");
        assert_eq!(entry.key, "cc");
        Ok(())
    }
}

//! Streaming iterator over one SST.

use bytes::Bytes;

use crate::error::Result;
use crate::merge::KeyValueIterator;
use crate::sst::{SsTableIndex, SstHandle};
use crate::table_store::TableStore;
use crate::types::RowEntry;

use std::sync::Arc;

/// Lazy, single-pass iterator; blocks are fetched from the object store one
/// at a time as the cursor crosses block boundaries.
pub struct SstIterator {
    handle: SstHandle,
    table_store: Arc<TableStore>,
    index: SsTableIndex,
    next_block: usize,
    entries: Vec<RowEntry>,
    entry_idx: usize,
    seek_key: Option<Bytes>,
}

impl SstIterator {
    pub fn new(handle: SstHandle, table_store: Arc<TableStore>) -> Result<Self> {
        let index = table_store.read_index(&handle)?;
        Ok(Self {
            handle,
            table_store,
            index,
            next_block: 0,
            entries: Vec::new(),
            entry_idx: 0,
            seek_key: None,
        })
    }

    /// Starts iteration at the first entry whose key is >= `key`.
    pub fn new_from_key(
        handle: SstHandle,
        key: Bytes,
        table_store: Arc<TableStore>,
    ) -> Result<Self> {
        let index = table_store.read_index(&handle)?;
        let next_block = index.block_for_key(&key).unwrap_or(0);
        Ok(Self {
            handle,
            table_store,
            index,
            next_block,
            entries: Vec::new(),
            entry_idx: 0,
            seek_key: Some(key),
        })
    }

    pub fn next_entry(&mut self) -> Result<Option<RowEntry>> {
        loop {
            if self.entry_idx < self.entries.len() {
                let entry = self.entries[self.entry_idx].clone();
                self.entry_idx += 1;
                return Ok(Some(entry));
            }

            if self.next_block >= self.index.blocks.len() {
                return Ok(None);
            }
            let blocks = self.table_store.read_blocks_using_index(
                &self.handle,
                self.next_block..self.next_block + 1,
                &self.index,
            )?;
            self.next_block += 1;
            let block = match blocks.into_iter().next() {
                Some(block) => block,
                None => return Ok(None),
            };
            self.entries = block.entries().to_vec();
            self.entry_idx = match self.seek_key.take() {
                Some(key) => self
                    .entries
                    .partition_point(|entry| entry.key < key),
                None => 0,
            };
        }
    }
}

impl KeyValueIterator for SstIterator {
    fn next_entry(&mut self) -> Result<Option<RowEntry>> {
        SstIterator::next_entry(self)
    }
}

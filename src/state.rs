//! Live in-memory state machine: the mutable WAL and memtable, the frozen
//! queues feeding the flushers, and the durable core recorded in the
//! manifest.
//!
//! `DbState` is guarded by a single lock in the facade; reads clone a cheap
//! `DbStateSnapshot` and resolve against it without holding the lock.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::memtable::{ImmutableMemtable, ImmutableWal, Memtable, Wal};
use crate::sorted_run::SortedRun;
use crate::sst::{SstHandle, SstId};

/// The durable fields, exactly as persisted in the manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoreState {
    /// Next id to assign to a frozen WAL.
    pub next_wal_sst_id: u64,
    /// Highest WAL SST id whose contents are fully represented in L0.
    pub last_compacted_wal_sst_id: u64,
    /// L0 SSTs, newest first.
    pub l0: Vec<SstHandle>,
    /// Newest L0 member absorbed into a sorted run (exclusive watermark).
    pub l0_last_compacted: Option<SstId>,
    /// Sorted runs, oldest to newest.
    pub compacted: Vec<SortedRun>,
}

impl CoreState {
    pub fn initial() -> Self {
        Self {
            next_wal_sst_id: 1,
            last_compacted_wal_sst_id: 0,
            l0: Vec::new(),
            l0_last_compacted: None,
            compacted: Vec::new(),
        }
    }
}

pub(crate) struct DbState {
    wal: Arc<Wal>,
    memtable: Arc<Memtable>,
    imm_wals: VecDeque<Arc<ImmutableWal>>,
    imm_memtables: VecDeque<Arc<ImmutableMemtable>>,
    core: CoreState,
}

/// Immutable view for the read path; queues are ordered newest first.
pub(crate) struct DbStateSnapshot {
    pub wal: Arc<crate::memtable::KVTable>,
    pub memtable: Arc<crate::memtable::KVTable>,
    pub imm_wals: Vec<Arc<ImmutableWal>>,
    pub imm_memtables: Vec<Arc<ImmutableMemtable>>,
    pub core: CoreState,
}

impl DbState {
    pub fn new(core: CoreState) -> Self {
        Self {
            wal: Arc::new(Wal::new()),
            memtable: Arc::new(Memtable::new()),
            imm_wals: VecDeque::new(),
            imm_memtables: VecDeque::new(),
            core,
        }
    }

    pub fn wal(&self) -> &Arc<Wal> {
        &self.wal
    }

    pub fn memtable(&self) -> &Arc<Memtable> {
        &self.memtable
    }

    pub fn core(&self) -> &CoreState {
        &self.core
    }

    pub fn snapshot(&self) -> DbStateSnapshot {
        DbStateSnapshot {
            wal: self.wal.table(),
            memtable: self.memtable.table(),
            imm_wals: self.imm_wals.iter().rev().cloned().collect(),
            imm_memtables: self.imm_memtables.iter().rev().cloned().collect(),
            core: self.core.clone(),
        }
    }

    /// Freezes the current WAL under the next dense id. No-op when the WAL
    /// is empty.
    pub fn freeze_wal(&mut self) -> Option<u64> {
        let id = self.core.next_wal_sst_id;
        let imm = self.wal.freeze(id)?;
        self.imm_wals.push_back(imm);
        self.core.next_wal_sst_id += 1;
        Some(id)
    }

    pub fn oldest_imm_wal(&self) -> Option<Arc<ImmutableWal>> {
        self.imm_wals.front().cloned()
    }

    pub fn pop_imm_wal(&mut self) {
        self.imm_wals.pop_front();
    }

    /// Freezes the memtable once it crossed the L0 size threshold.
    pub fn maybe_freeze_memtable(&mut self, l0_sst_size_bytes: u64, last_wal_id: u64) -> bool {
        if (self.memtable.size() as u64) < l0_sst_size_bytes {
            return false;
        }
        self.freeze_memtable(last_wal_id)
    }

    /// Unconditional freeze; skipped only when there is nothing to freeze.
    pub fn freeze_memtable(&mut self, last_wal_id: u64) -> bool {
        if self.memtable.is_empty() {
            return false;
        }
        let imm = self.memtable.freeze(last_wal_id);
        self.imm_memtables.push_back(imm);
        true
    }

    pub fn oldest_imm_memtable(&self) -> Option<Arc<ImmutableMemtable>> {
        self.imm_memtables.front().cloned()
    }

    /// Retires the oldest immutable memtable in favor of its flushed L0 SST
    /// and advances the WAL compaction watermark.
    pub fn move_imm_memtable_to_l0(&mut self, imm: &Arc<ImmutableMemtable>, handle: SstHandle) {
        if let Some(front) = self.imm_memtables.front() {
            if Arc::ptr_eq(front, imm) {
                self.imm_memtables.pop_front();
            }
        }
        self.core.l0.insert(0, handle);
        self.core.last_compacted_wal_sst_id =
            self.core.last_compacted_wal_sst_id.max(imm.last_wal_id());
    }

    /// Reconciles local state with a freshly loaded manifest.
    ///
    /// Durable fields follow the manifest, except that locally-added L0
    /// handles the remote has not seen yet are preserved; dropping them here
    /// would lose SSTs that are awaiting their first manifest publication.
    /// `next_wal_sst_id` takes the max of both sides, and frozen tables
    /// whose contents fall under the new WAL watermark are released.
    pub fn refresh_db_state(&mut self, remote: &CoreState) {
        let remote_ids: HashSet<SstId> = remote.l0.iter().map(|h| h.id).collect();

        // Local L0 is newest first: an unpublished prefix, then entries the
        // remote still lists, then entries a compaction already absorbed.
        // Keep only the unpublished prefix and splice the remote list in.
        let mut l0 = Vec::new();
        for handle in &self.core.l0 {
            if remote_ids.contains(&handle.id) || remote.l0_last_compacted == Some(handle.id) {
                break;
            }
            l0.push(handle.clone());
        }
        l0.extend(remote.l0.iter().cloned());

        self.core.l0 = l0;
        self.core.l0_last_compacted = remote.l0_last_compacted;
        self.core.compacted = remote.compacted.clone();
        self.core.next_wal_sst_id = self.core.next_wal_sst_id.max(remote.next_wal_sst_id);
        self.core.last_compacted_wal_sst_id = self
            .core
            .last_compacted_wal_sst_id
            .max(remote.last_compacted_wal_sst_id);

        let watermark = self.core.last_compacted_wal_sst_id;
        self.imm_wals.retain(|imm| imm.id() > watermark);
        self.imm_memtables.retain(|imm| imm.last_wal_id() > watermark);
    }

    /// Recovery hook: ensures WAL ids are never reused after a replay that
    /// observed ids at or above the manifest's `next_wal_sst_id`.
    pub fn bump_next_wal_sst_id(&mut self, floor: u64) {
        self.core.next_wal_sst_id = self.core.next_wal_sst_id.max(floor);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sst::SsTableInfo;
    use bytes::Bytes;

    fn handle(id: SstId) -> SstHandle {
        SstHandle {
            id,
            info: SsTableInfo {
                first_key: Some(Bytes::from_static(b"k")),
                index_offset: 0,
                index_len: 0,
                filter_offset: 0,
                filter_len: 0,
                compression: crate::config::CompressionCodec::None,
            },
        }
    }

    #[test]
    fn freeze_wal_assigns_dense_ids_and_skips_empty() {
        let mut state = DbState::new(CoreState::initial());
        assert_eq!(state.freeze_wal(), None);
        assert_eq!(state.core().next_wal_sst_id, 1);

        state.wal().put(Bytes::from_static(b"a"), Bytes::from_static(b"1"));
        assert_eq!(state.freeze_wal(), Some(1));
        state.wal().put(Bytes::from_static(b"b"), Bytes::from_static(b"2"));
        assert_eq!(state.freeze_wal(), Some(2));
        assert_eq!(state.core().next_wal_sst_id, 3);

        assert_eq!(state.oldest_imm_wal().map(|imm| imm.id()), Some(1));
        state.pop_imm_wal();
        assert_eq!(state.oldest_imm_wal().map(|imm| imm.id()), Some(2));
    }

    #[test]
    fn memtable_freezes_only_at_threshold() {
        let mut state = DbState::new(CoreState::initial());
        state
            .memtable()
            .insert(crate::types::RowEntry::new_value(&b"abcd"[..], &b"xy"[..]));

        assert!(!state.maybe_freeze_memtable(100, 1));
        assert!(state.maybe_freeze_memtable(6, 1));
        assert_eq!(
            state.oldest_imm_memtable().map(|imm| imm.last_wal_id()),
            Some(1)
        );
        // now empty: unconditional freeze is a no-op
        assert!(!state.freeze_memtable(2));
    }

    #[test]
    fn moving_memtable_to_l0_advances_watermark() {
        let mut state = DbState::new(CoreState::initial());
        state
            .memtable()
            .insert(crate::types::RowEntry::new_value(&b"k"[..], &b"v"[..]));
        state.freeze_memtable(5);
        let imm = state.oldest_imm_memtable().expect("imm");

        state.move_imm_memtable_to_l0(&imm, handle(SstId::Compacted(ulid::Ulid::new())));
        assert!(state.oldest_imm_memtable().is_none());
        assert_eq!(state.core().l0.len(), 1);
        assert_eq!(state.core().last_compacted_wal_sst_id, 5);
    }

    #[test]
    fn refresh_preserves_unpublished_l0_and_drops_compacted() {
        let mut state = DbState::new(CoreState::initial());

        let old_id = ulid::Ulid::from_parts(1, 1);
        let published = handle(SstId::Compacted(old_id));
        let unpublished = handle(SstId::Compacted(ulid::Ulid::from_parts(2, 2)));
        state.core.l0 = vec![unpublished.clone(), published.clone()];
        state.core.next_wal_sst_id = 4;

        // remote: a compactor absorbed `published` into a run
        let remote = CoreState {
            next_wal_sst_id: 2,
            last_compacted_wal_sst_id: 1,
            l0: vec![],
            l0_last_compacted: Some(SstId::Compacted(old_id)),
            compacted: vec![SortedRun {
                id: 1,
                ssts: vec![published],
            }],
        };
        state.refresh_db_state(&remote);

        assert_eq!(state.core().l0, vec![unpublished]);
        assert_eq!(state.core().compacted.len(), 1);
        assert_eq!(state.core().next_wal_sst_id, 4);
        assert_eq!(state.core().last_compacted_wal_sst_id, 1);
    }
}

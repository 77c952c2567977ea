//! Database facade: open, read, write, flush, close.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tracing::info;

use crate::compactor::Compactor;
use crate::config::{DbOptions, ReadLevel, ReadOptions, WriteOptions};
use crate::error::{Error, Result};
use crate::flush::{
    spawn_memtable_flush_task, spawn_wal_flush_task, MemtableFlushMsg, MemtableFlushTask,
    WalFlushTask,
};
use crate::manifest::{FenceableManifest, ManifestStore, StoredManifest};
use crate::object_store::ObjectStore;
use crate::sorted_run::SortedRun;
use crate::sst::iter::SstIterator;
use crate::sst::{SsTableFormat, SstHandle, SstId};
use crate::state::{CoreState, DbState};
use crate::table_store::TableStore;
use crate::types::ValueDeletable;

pub(crate) struct DbInner {
    pub(crate) state: RwLock<DbState>,
    pub(crate) table_store: Arc<TableStore>,
    pub(crate) options: DbOptions,
    /// Serializes freeze-and-drain cycles between the ticker and explicit
    /// `flush_wal` callers.
    pub(crate) wal_flush_lock: Mutex<()>,
    pub(crate) mem_flush_tx: crossbeam_channel::Sender<MemtableFlushMsg>,
}

/// Handle to an open database.
///
/// All durable state lives in the object store under the `path` namespace.
/// Opening claims a writer epoch on the manifest: a previous process still
/// holding the db will be fenced off its next manifest write.
pub struct Db {
    inner: Arc<DbInner>,
    wal_flush_task: Mutex<Option<WalFlushTask>>,
    mem_flush_task: Mutex<Option<MemtableFlushTask>>,
    compactor: Mutex<Option<Compactor>>,
}

impl Db {
    pub fn open(path: impl Into<String>, store: Arc<dyn ObjectStore>) -> Result<Db> {
        Self::open_with_options(path, store, DbOptions::default())
    }

    pub fn open_with_options(
        path: impl Into<String>,
        store: Arc<dyn ObjectStore>,
        options: DbOptions,
    ) -> Result<Db> {
        let root = path.into();
        let format = SsTableFormat {
            block_size: options.block_size,
            min_filter_keys: options.min_filter_keys,
            compression: options.compression_codec,
        };
        let table_store = Arc::new(TableStore::new(store.clone(), format, root.clone()));
        let manifest_store = Arc::new(ManifestStore::new(root.clone(), store));

        let stored = match StoredManifest::load(manifest_store.clone())? {
            Some(stored) => stored,
            // losing the bootstrap race to another opener is fine; adopt
            // whatever manifest won
            None => match StoredManifest::create_new(manifest_store.clone(), CoreState::initial())
            {
                Ok(stored) => stored,
                Err(Error::AlreadyExists) => StoredManifest::load(manifest_store.clone())?
                    .ok_or_else(|| {
                        Error::invalid_db_state("manifest bootstrap lost but no manifest found")
                    })?,
                Err(err) => return Err(err),
            },
        };
        let manifest = FenceableManifest::init_writer(stored)?;
        let core = manifest.db_state()?.clone();

        let mut state = DbState::new(core);
        Self::replay_wal_ssts(&mut state, &table_store, &options)?;
        let has_frozen_memtables = state.oldest_imm_memtable().is_some();

        let (mem_flush_tx, mem_flush_rx) = crossbeam_channel::unbounded();
        let inner = Arc::new(DbInner {
            state: RwLock::new(state),
            table_store: table_store.clone(),
            options: options.clone(),
            wal_flush_lock: Mutex::new(()),
            mem_flush_tx: mem_flush_tx.clone(),
        });

        let compactor = match &options.compactor_options {
            Some(compactor_options) => Some(Compactor::new(
                manifest_store,
                table_store,
                compactor_options.clone(),
            )?),
            None => None,
        };

        let wal_flush_task = spawn_wal_flush_task(inner.clone());
        let mem_flush_task = spawn_memtable_flush_task(inner.clone(), manifest, mem_flush_rx);
        if has_frozen_memtables {
            let _ = mem_flush_tx.send(MemtableFlushMsg::FlushImmMemtables { done: None });
        }

        info!(db = %root, "opened database");
        Ok(Db {
            inner,
            wal_flush_task: Mutex::new(Some(wal_flush_task)),
            mem_flush_task: Mutex::new(Some(mem_flush_task)),
            compactor: Mutex::new(compactor),
        })
    }

    /// Replays WAL SSTs newer than the manifest's compaction watermark into
    /// the memtable, freezing along the way exactly as the live write path
    /// would have.
    fn replay_wal_ssts(
        state: &mut DbState,
        table_store: &Arc<TableStore>,
        options: &DbOptions,
    ) -> Result<()> {
        let wal_ids = table_store.list_wal_ssts(state.core().last_compacted_wal_sst_id)?;
        let mut last_replayed = 0;
        for id in &wal_ids {
            let handle = table_store.open_sst(&SstId::Wal(*id))?;
            let mut iter = SstIterator::new(handle, table_store.clone())?;
            while let Some(entry) = iter.next_entry()? {
                state.memtable().insert(entry);
            }
            state.memtable().set_last_wal_id(*id);
            state.maybe_freeze_memtable(options.l0_sst_size_bytes, *id);
            last_replayed = *id;
        }
        if !wal_ids.is_empty() {
            info!(count = wal_ids.len(), "replayed wal ssts");
            state.bump_next_wal_sst_id(last_replayed + 1);
        }
        Ok(())
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.put_with_options(key, value, &WriteOptions::default())
    }

    pub fn put_with_options(
        &self,
        key: &[u8],
        value: &[u8],
        options: &WriteOptions,
    ) -> Result<()> {
        if key.is_empty() {
            return Err(Error::invalid_db_state("keys must be non-empty"));
        }
        let table = {
            let state = self.inner.state.read();
            state
                .wal()
                .put(Bytes::copy_from_slice(key), Bytes::copy_from_slice(value))
        };
        if options.await_durable {
            table.await_durable(None)?;
        }
        Ok(())
    }

    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.delete_with_options(key, &WriteOptions::default())
    }

    pub fn delete_with_options(&self, key: &[u8], options: &WriteOptions) -> Result<()> {
        if key.is_empty() {
            return Err(Error::invalid_db_state("keys must be non-empty"));
        }
        let table = {
            let state = self.inner.state.read();
            state.wal().delete(Bytes::copy_from_slice(key))
        };
        if options.await_durable {
            table.await_durable(None)?;
        }
        Ok(())
    }

    pub fn get(&self, key: &[u8]) -> Result<Bytes> {
        self.get_with_options(key, &ReadOptions::default())
    }

    /// Resolves `key` newest tier first. A tombstone anywhere along the way
    /// means the key is gone; exhausting every tier means it never existed.
    pub fn get_with_options(&self, key: &[u8], options: &ReadOptions) -> Result<Bytes> {
        let snapshot = self.inner.state.read().snapshot();

        if options.read_level == ReadLevel::Uncommitted {
            if let Some(value) = snapshot.wal.get(key) {
                return Self::resolve(value);
            }
            for imm in &snapshot.imm_wals {
                if let Some(value) = imm.get(key) {
                    return Self::resolve(value);
                }
            }
        }

        // the memtable holds only WAL-durable data: replay happens before
        // the durability notification fires
        if let Some(value) = snapshot.memtable.get(key) {
            return Self::resolve(value);
        }
        for imm in &snapshot.imm_memtables {
            if let Some(value) = imm.get(key) {
                return Self::resolve(value);
            }
        }

        for handle in &snapshot.core.l0 {
            if let Some(value) = self.sst_get(handle, key)? {
                return Self::resolve(value);
            }
        }
        for run in snapshot.core.compacted.iter().rev() {
            if let Some(value) = self.run_get(run, key)? {
                return Self::resolve(value);
            }
        }

        Err(Error::KeyNotFound)
    }

    fn resolve(value: ValueDeletable) -> Result<Bytes> {
        match value {
            ValueDeletable::Value(value) => Ok(value),
            ValueDeletable::Tombstone => Err(Error::KeyNotFound),
        }
    }

    /// Point lookup in one SST: bloom filter first, then one block via the
    /// index, then binary search within the block.
    fn sst_get(&self, handle: &SstHandle, key: &[u8]) -> Result<Option<ValueDeletable>> {
        if let Some(filter) = self.inner.table_store.read_filter(handle)? {
            if !filter.might_contain(&Bytes::copy_from_slice(key)) {
                return Ok(None);
            }
        }
        let index = self.inner.table_store.read_index(handle)?;
        let Some(block_idx) = index.block_for_key(key) else {
            return Ok(None);
        };
        let blocks = self.inner.table_store.read_blocks_using_index(
            handle,
            block_idx..block_idx + 1,
            &index,
        )?;
        Ok(blocks
            .first()
            .and_then(|block| block.find(key).cloned()))
    }

    fn run_get(&self, run: &SortedRun, key: &[u8]) -> Result<Option<ValueDeletable>> {
        match run.sst_with_key(key) {
            Some(handle) => self.sst_get(handle, key),
            None => Ok(None),
        }
    }

    /// Synchronously freezes the live WAL and drains every frozen WAL to
    /// the object store.
    pub fn flush_wal(&self) -> Result<()> {
        self.inner.flush_wal()
    }

    /// Synchronously freezes the memtable and runs one memtable flush
    /// cycle, publishing a manifest generation per flushed table.
    pub fn flush_memtable_to_l0(&self) -> Result<()> {
        {
            let mut state = self.inner.state.write();
            let last_wal_id = state.memtable().last_wal_id();
            state.freeze_memtable(last_wal_id);
        }
        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        self.inner
            .mem_flush_tx
            .send(MemtableFlushMsg::FlushImmMemtables {
                done: Some(done_tx),
            })
            .map_err(|_| Error::invalid_db_state("memtable flusher is not running"))?;
        done_rx
            .recv()
            .map_err(|_| Error::invalid_db_state("memtable flusher exited mid-flush"))?
    }

    /// Stops the background loops. The WAL flusher drains once more, then
    /// the memtable flusher publishes a final manifest generation.
    pub fn close(&self) -> Result<()> {
        if let Some(task) = self.wal_flush_task.lock().take() {
            task.close();
        }
        if let Some(task) = self.mem_flush_task.lock().take() {
            task.close();
        }
        if let Some(compactor) = self.compactor.lock().take() {
            compactor.close();
        }
        Ok(())
    }
}

impl Drop for Db {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

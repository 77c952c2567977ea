//! Background flush loops.
//!
//! The WAL flusher wakes on a ticker (or an explicit drain) and moves
//! frozen WALs to the object store, replaying each into the memtable before
//! signalling durability. The memtable flusher turns frozen memtables into
//! L0 SSTs and publishes manifest generations, polling the manifest
//! between flushes to observe foreign compaction progress.
//!
//! Both loops treat transient object-store errors as retryable on the next
//! tick; a fence is terminal.

use std::sync::Arc;
use std::thread::JoinHandle;

use tracing::{error, warn};
use ulid::Ulid;

use crate::db::DbInner;
use crate::error::{Error, Result};
use crate::manifest::FenceableManifest;
use crate::memtable::KVTableIterator;
use crate::sst::{SstHandle, SstId};
use crate::types::ValueDeletable;

impl DbInner {
    /// Freezes the live WAL and drains the immutable WAL queue.
    pub(crate) fn flush_wal(&self) -> Result<()> {
        let _guard = self.wal_flush_lock.lock();
        self.state.write().freeze_wal();
        self.flush_imm_wals()
    }

    fn flush_imm_wals(&self) -> Result<()> {
        loop {
            let Some(imm) = self.state.read().oldest_imm_wal() else {
                return Ok(());
            };

            self.flush_imm_table(&SstId::Wal(imm.id()), imm.iter())?;

            // replay into the memtable before notifying durability so the
            // data is readable at the committed level first
            let memtable = self.state.read().memtable().clone();
            let mut iter = imm.iter();
            while let Some(entry) = iter.next_entry() {
                memtable.insert(entry);
            }
            memtable.set_last_wal_id(imm.id());

            let frozen = self
                .state
                .write()
                .maybe_freeze_memtable(self.options.l0_sst_size_bytes, imm.id());
            if frozen {
                let _ = self
                    .mem_flush_tx
                    .send(MemtableFlushMsg::FlushImmMemtables { done: None });
            }

            imm.table().notify_wal_flushed();
            // popping last keeps the entries continuously readable at the
            // uncommitted level through the replay
            self.state.write().pop_imm_wal();
        }
    }

    /// Drains a frozen table into a new SST under `id`.
    pub(crate) fn flush_imm_table(
        &self,
        id: &SstId,
        mut iter: KVTableIterator,
    ) -> Result<SstHandle> {
        let mut builder = self.table_store.table_builder();
        while let Some(entry) = iter.next_entry() {
            let value = match entry.value {
                ValueDeletable::Value(value) => Some(value),
                ValueDeletable::Tombstone => None,
            };
            builder.add(entry.key, value)?;
        }
        let encoded = builder.build()?;
        self.table_store.write_sst(id, encoded)
    }
}

pub(crate) struct WalFlushTask {
    shutdown_tx: crossbeam_channel::Sender<()>,
    thread: Option<JoinHandle<()>>,
}

impl WalFlushTask {
    /// Requests a final drain and waits for the loop to exit.
    pub(crate) fn close(mut self) {
        let _ = self.shutdown_tx.send(());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

pub(crate) fn spawn_wal_flush_task(inner: Arc<DbInner>) -> WalFlushTask {
    let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded::<()>(1);
    let thread = std::thread::Builder::new()
        .name("cirrusdb-wal-flush".to_string())
        .spawn(move || {
            let ticker = crossbeam_channel::tick(inner.options.flush_interval);
            loop {
                crossbeam_channel::select! {
                    recv(ticker) -> _ => {
                        if let Err(err) = inner.flush_wal() {
                            warn!(%err, "wal flush failed; retrying next tick");
                        }
                    }
                    recv(shutdown_rx) -> _ => {
                        if let Err(err) = inner.flush_wal() {
                            warn!(%err, "final wal flush failed");
                        }
                        return;
                    }
                }
            }
        })
        .expect("spawn wal flush thread");
    WalFlushTask {
        shutdown_tx,
        thread: Some(thread),
    }
}

pub(crate) enum MemtableFlushMsg {
    Shutdown,
    FlushImmMemtables {
        done: Option<crossbeam_channel::Sender<Result<()>>>,
    },
}

pub(crate) struct MemtableFlushTask {
    tx: crossbeam_channel::Sender<MemtableFlushMsg>,
    thread: Option<JoinHandle<()>>,
}

impl MemtableFlushTask {
    pub(crate) fn close(mut self) {
        let _ = self.tx.send(MemtableFlushMsg::Shutdown);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

struct MemtableFlusher {
    inner: Arc<DbInner>,
    manifest: FenceableManifest,
}

impl MemtableFlusher {
    fn load_manifest(&mut self) -> Result<()> {
        let remote = self.manifest.refresh()?.clone();
        self.inner.state.write().refresh_db_state(&remote);
        Ok(())
    }

    fn write_manifest(&mut self) -> Result<()> {
        let core = self.inner.state.read().core().clone();
        self.manifest.update_db_state(core)
    }

    fn write_manifest_safely(&mut self) -> Result<()> {
        loop {
            self.load_manifest()?;
            match self.write_manifest() {
                Ok(()) => return Ok(()),
                Err(Error::AlreadyExists) => {
                    warn!("conflicting manifest generation; refreshing and retrying");
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn flush_imm_memtables_to_l0(&mut self) -> Result<()> {
        loop {
            let imm = match self.inner.state.read().oldest_imm_memtable() {
                Some(imm) => imm,
                None => break,
            };
            let id = SstId::Compacted(Ulid::new());
            let handle = self.inner.flush_imm_table(&id, imm.iter())?;
            self.inner.state.write().move_imm_memtable_to_l0(&imm, handle);
            self.write_manifest_safely()?;
        }
        Ok(())
    }
}

pub(crate) fn spawn_memtable_flush_task(
    inner: Arc<DbInner>,
    manifest: FenceableManifest,
    rx: crossbeam_channel::Receiver<MemtableFlushMsg>,
) -> MemtableFlushTask {
    let tx = inner.mem_flush_tx.clone();
    let poll_interval = inner.options.manifest_poll_interval;
    let thread = std::thread::Builder::new()
        .name("cirrusdb-memtable-flush".to_string())
        .spawn(move || {
            let mut flusher = MemtableFlusher { inner, manifest };
            let ticker = crossbeam_channel::tick(poll_interval);
            let mut is_shutdown = false;
            let mut fenced = false;

            // keep draining pending flush requests after a shutdown request
            while !fenced && !(is_shutdown && rx.is_empty()) {
                crossbeam_channel::select! {
                    recv(ticker) -> _ => {
                        match flusher.load_manifest() {
                            Ok(()) => {}
                            Err(Error::Fenced) => {
                                error!("memtable flusher fenced by a newer writer");
                                fenced = true;
                            }
                            Err(err) => error!(%err, "manifest poll failed"),
                        }
                    }
                    recv(rx) -> msg => match msg {
                        Ok(MemtableFlushMsg::Shutdown) | Err(_) => is_shutdown = true,
                        Ok(MemtableFlushMsg::FlushImmMemtables { done }) => {
                            let result = flusher.flush_imm_memtables_to_l0();
                            match &result {
                                Err(Error::Fenced) => {
                                    error!("memtable flusher fenced by a newer writer");
                                    fenced = true;
                                }
                                Err(err) => error!(%err, "memtable flush failed"),
                                Ok(()) => {}
                            }
                            if let Some(done) = done {
                                let _ = done.send(result);
                            }
                        }
                    }
                }
            }

            if !fenced {
                if let Err(err) = flusher.write_manifest_safely() {
                    error!(%err, "manifest write on shutdown failed");
                }
            }
        })
        .expect("spawn memtable flush thread");
    MemtableFlushTask {
        tx,
        thread: Some(thread),
    }
}

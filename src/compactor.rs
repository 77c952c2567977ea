//! Background compactor.
//!
//! The orchestrator polls the manifest on a ticker and, whenever L0 is
//! non-empty, k-way merges every L0 SST and every sorted run into a single
//! fresh sorted run, newest source winning on key collisions. The output is
//! the bottom-most level, so tombstones are dropped; output SSTs are capped
//! at `max_sst_size` and carry fresh ULID ids.
//!
//! The compactor claims its own epoch on the manifest, so a stale compactor
//! from a previous process stops publishing as soon as it observes a newer
//! one. Manifest updates merge against the remote record: the writer keeps
//! adding L0 SSTs concurrently, and those must survive the swap.

use std::sync::Arc;
use std::thread::JoinHandle;

use tracing::{error, info, warn};
use ulid::Ulid;

use crate::config::CompactorOptions;
use crate::error::{Error, Result};
use crate::manifest::{FenceableManifest, ManifestStore, StoredManifest};
use crate::merge::{KeyValueIterator, MergeIterator};
use crate::sorted_run::{SortedRun, SortedRunIterator};
use crate::sst::iter::SstIterator;
use crate::sst::{SstHandle, SstId};
use crate::state::CoreState;
use crate::table_store::TableStore;
use crate::types::ValueDeletable;

pub(crate) struct Compactor {
    shutdown_tx: crossbeam_channel::Sender<()>,
    thread: Option<JoinHandle<()>>,
}

impl Compactor {
    pub(crate) fn new(
        manifest_store: Arc<ManifestStore>,
        table_store: Arc<TableStore>,
        options: CompactorOptions,
    ) -> Result<Compactor> {
        let stored = StoredManifest::load(manifest_store)?
            .ok_or_else(|| Error::invalid_db_state("no manifest to compact against"))?;
        let manifest = FenceableManifest::init_compactor(stored)?;

        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded::<()>(1);
        let mut orchestrator = CompactorOrchestrator {
            manifest,
            table_store,
            options,
        };
        let thread = std::thread::Builder::new()
            .name("cirrusdb-compactor".to_string())
            .spawn(move || orchestrator.run(shutdown_rx))
            .expect("spawn compactor thread");
        Ok(Compactor {
            shutdown_tx,
            thread: Some(thread),
        })
    }

    pub(crate) fn close(mut self) {
        let _ = self.shutdown_tx.send(());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

struct CompactorOrchestrator {
    manifest: FenceableManifest,
    table_store: Arc<TableStore>,
    options: CompactorOptions,
}

impl CompactorOrchestrator {
    fn run(&mut self, shutdown_rx: crossbeam_channel::Receiver<()>) {
        let ticker = crossbeam_channel::tick(self.options.poll_interval);
        loop {
            crossbeam_channel::select! {
                recv(ticker) -> _ => {
                    match self.poll_and_compact() {
                        Ok(()) => {}
                        Err(Error::Fenced) => {
                            error!("compactor fenced by a newer epoch; stopping");
                            return;
                        }
                        Err(err) => error!(%err, "compaction round failed"),
                    }
                }
                recv(shutdown_rx) -> _ => return,
            }
        }
    }

    fn poll_and_compact(&mut self) -> Result<()> {
        let core = self.manifest.refresh()?.clone();
        if core.l0.is_empty() {
            return Ok(());
        }

        let output = self.compact(&core)?;
        let compacted_l0: Vec<SstId> = core.l0.iter().map(|h| h.id).collect();
        let l0_last_compacted = core.l0.first().map(|h| h.id);
        info!(
            sources = compacted_l0.len(),
            output_ssts = output.as_ref().map(|run| run.ssts.len()).unwrap_or(0),
            "compacted L0 into sorted run"
        );
        self.publish(output, &compacted_l0, l0_last_compacted)
    }

    /// Merges the given state's L0 and runs into one new sorted run.
    /// Returns `None` when every surviving entry was a tombstone.
    fn compact(&self, core: &CoreState) -> Result<Option<SortedRun>> {
        let mut sources: Vec<Box<dyn KeyValueIterator>> = Vec::new();
        for handle in &core.l0 {
            sources.push(Box::new(SstIterator::new(
                handle.clone(),
                self.table_store.clone(),
            )?));
        }
        for run in core.compacted.iter().rev() {
            sources.push(Box::new(SortedRunIterator::new(
                run,
                self.table_store.clone(),
            )?));
        }
        let mut merged = MergeIterator::new(sources)?;

        let run_id = core.compacted.last().map(|run| run.id + 1).unwrap_or(0);
        let mut ssts: Vec<SstHandle> = Vec::new();
        let mut builder = self.table_store.table_builder();
        while let Some(entry) = merged.next_entry()? {
            let value = match entry.value {
                // single-run output is the bottom-most level: no older
                // source can still hold this key
                ValueDeletable::Tombstone => continue,
                ValueDeletable::Value(value) => value,
            };
            if !builder.is_empty() && builder.estimated_size() >= self.options.max_sst_size {
                let finished = std::mem::replace(&mut builder, self.table_store.table_builder());
                ssts.push(
                    self.table_store
                        .write_sst(&SstId::Compacted(Ulid::new()), finished.build()?)?,
                );
            }
            builder.add(entry.key, Some(value))?;
        }
        if !builder.is_empty() {
            ssts.push(
                self.table_store
                    .write_sst(&SstId::Compacted(Ulid::new()), builder.build()?)?,
            );
        }

        if ssts.is_empty() {
            return Ok(None);
        }
        Ok(Some(SortedRun { id: run_id, ssts }))
    }

    /// Publishes the post-compaction state, merging with any L0 SSTs the
    /// writer added while the merge ran.
    fn publish(
        &mut self,
        output: Option<SortedRun>,
        compacted_l0: &[SstId],
        l0_last_compacted: Option<SstId>,
    ) -> Result<()> {
        loop {
            let remote = self.manifest.refresh()?.clone();
            let core = CoreState {
                next_wal_sst_id: remote.next_wal_sst_id,
                last_compacted_wal_sst_id: remote.last_compacted_wal_sst_id,
                l0: remote
                    .l0
                    .iter()
                    .filter(|handle| !compacted_l0.contains(&handle.id))
                    .cloned()
                    .collect(),
                l0_last_compacted,
                compacted: output.clone().into_iter().collect(),
            };
            match self.manifest.update_db_state(core) {
                Ok(()) => return Ok(()),
                Err(Error::AlreadyExists) => {
                    warn!("conflicting manifest generation; refreshing and retrying");
                }
                Err(err) => return Err(err),
            }
        }
    }
}

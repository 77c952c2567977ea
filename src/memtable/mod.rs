//! In-memory tables: the write-ahead log and the memtable.
//!
//! Both wrap [`KVTable`], an ordered concurrent map with byte-size
//! accounting and a one-shot durability signal. Tables are created empty,
//! mutated, frozen into an immutable wrapper, drained to an SST, then
//! dropped; ownership flows linearly from the live handle into the
//! immutable queues.

mod iter;

pub use iter::KVTableIterator;

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam_skiplist::SkipMap;
use parking_lot::{Condvar, Mutex, RwLock};

use crate::error::{Error, Result};
use crate::types::{RowEntry, ValueDeletable};

/// One-shot latch that flips false -> true exactly once. All waiters,
/// present and future, observe completion after `notify`.
#[derive(Debug, Default)]
struct DurableWatch {
    flagged: Mutex<bool>,
    cond: Condvar,
}

impl DurableWatch {
    fn notify(&self) {
        let mut flagged = self.flagged.lock();
        *flagged = true;
        self.cond.notify_all();
    }

    fn is_set(&self) -> bool {
        *self.flagged.lock()
    }

    fn wait(&self, timeout: Option<Duration>) -> Result<()> {
        let mut flagged = self.flagged.lock();
        match timeout {
            None => {
                while !*flagged {
                    self.cond.wait(&mut flagged);
                }
                Ok(())
            }
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                while !*flagged {
                    if self.cond.wait_until(&mut flagged, deadline).timed_out() {
                        return if *flagged { Ok(()) } else { Err(Error::Cancelled) };
                    }
                }
                Ok(())
            }
        }
    }
}

/// Ordered map of key -> value-or-tombstone with atomic size accounting.
///
/// Concurrent reads are always safe; writers to a single table are
/// serialized by the owning WAL/memtable lock, which keeps the size counter
/// exact.
pub struct KVTable {
    map: SkipMap<Bytes, ValueDeletable>,
    size: AtomicI64,
    durable: DurableWatch,
}

impl KVTable {
    pub fn new() -> Self {
        Self {
            map: SkipMap::new(),
            size: AtomicI64::new(0),
            durable: DurableWatch::default(),
        }
    }

    pub fn put(&self, key: Bytes, value: Bytes) {
        self.upsert(key, ValueDeletable::Value(value));
    }

    pub fn delete(&self, key: Bytes) {
        self.upsert(key, ValueDeletable::Tombstone);
    }

    pub fn insert(&self, entry: RowEntry) {
        self.upsert(entry.key, entry.value);
    }

    fn upsert(&self, key: Bytes, value: ValueDeletable) {
        let prior = self
            .map
            .get(&key)
            .map(|entry| key.len() + entry.value().len());
        let added = key.len() + value.len();
        self.map.insert(key, value);
        let delta = added as i64 - prior.unwrap_or(0) as i64;
        self.size.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn get(&self, key: &[u8]) -> Option<ValueDeletable> {
        self.map.get(key).map(|entry| entry.value().clone())
    }

    pub fn size(&self) -> i64 {
        self.size.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Ordered iterator. Entries inserted before this call are always
    /// observed; entries inserted afterwards may or may not be, but never
    /// out of key order and never by re-yielding an earlier key.
    pub fn iter(self: &Arc<Self>) -> KVTableIterator {
        KVTableIterator::new(self.clone())
    }

    pub(crate) fn range_from(&self, last: Option<&Bytes>) -> Option<RowEntry> {
        let entry = match last {
            None => self.map.front(),
            Some(last) => self.map.lower_bound(std::ops::Bound::Excluded(last)),
        };
        entry.map(|entry| RowEntry {
            key: entry.key().clone(),
            value: entry.value().clone(),
        })
    }

    /// Signals that this table's contents reached the object store.
    pub fn notify_wal_flushed(&self) {
        self.durable.notify();
    }

    pub fn is_durable(&self) -> bool {
        self.durable.is_set()
    }

    /// Blocks until the durability signal fires, or `Error::Cancelled` once
    /// the timeout elapses.
    pub fn await_durable(&self, timeout: Option<Duration>) -> Result<()> {
        self.durable.wait(timeout)
    }
}

impl Default for KVTable {
    fn default() -> Self {
        Self::new()
    }
}

/// The mutable write-ahead log. All client writes land here first.
pub struct Wal {
    table: RwLock<Arc<KVTable>>,
}

impl Wal {
    pub fn new() -> Self {
        Self {
            table: RwLock::new(Arc::new(KVTable::new())),
        }
    }

    /// Writes under the WAL write lock and returns the table the entry
    /// landed in, so the caller can await its durability signal.
    pub fn put(&self, key: Bytes, value: Bytes) -> Arc<KVTable> {
        let table = self.table.write();
        table.put(key, value);
        table.clone()
    }

    pub fn delete(&self, key: Bytes) -> Arc<KVTable> {
        let table = self.table.write();
        table.delete(key);
        table.clone()
    }

    pub fn get(&self, key: &[u8]) -> Option<ValueDeletable> {
        self.table.read().get(key)
    }

    pub fn size(&self) -> i64 {
        self.table.read().size()
    }

    pub fn is_empty(&self) -> bool {
        self.table.read().is_empty()
    }

    pub fn table(&self) -> Arc<KVTable> {
        self.table.read().clone()
    }

    pub fn iter(&self) -> KVTableIterator {
        self.table.read().iter()
    }

    /// Swaps in a fresh empty table and returns the old one frozen under
    /// `id`. No-op on an empty WAL.
    pub fn freeze(&self, id: u64) -> Option<Arc<ImmutableWal>> {
        let mut guard = self.table.write();
        if guard.is_empty() {
            return None;
        }
        let old = std::mem::replace(&mut *guard, Arc::new(KVTable::new()));
        Some(Arc::new(ImmutableWal { id, table: old }))
    }
}

impl Default for Wal {
    fn default() -> Self {
        Self::new()
    }
}

/// Frozen WAL contents awaiting upload. Reads stay valid; appends are over.
pub struct ImmutableWal {
    id: u64,
    table: Arc<KVTable>,
}

impl ImmutableWal {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn table(&self) -> &Arc<KVTable> {
        &self.table
    }

    pub fn get(&self, key: &[u8]) -> Option<ValueDeletable> {
        self.table.get(key)
    }

    pub fn iter(&self) -> KVTableIterator {
        self.table.iter()
    }
}

/// The read-optimized table fed by WAL replay; `last_wal_id` records the
/// highest immutable WAL whose contents have been merged in.
pub struct Memtable {
    table: RwLock<Arc<KVTable>>,
    last_wal_id: AtomicU64,
}

impl Memtable {
    pub fn new() -> Self {
        Self {
            table: RwLock::new(Arc::new(KVTable::new())),
            last_wal_id: AtomicU64::new(0),
        }
    }

    pub fn insert(&self, entry: RowEntry) {
        self.table.read().insert(entry);
    }

    pub fn get(&self, key: &[u8]) -> Option<ValueDeletable> {
        self.table.read().get(key)
    }

    pub fn size(&self) -> i64 {
        self.table.read().size()
    }

    pub fn is_empty(&self) -> bool {
        self.table.read().is_empty()
    }

    pub fn table(&self) -> Arc<KVTable> {
        self.table.read().clone()
    }

    pub fn set_last_wal_id(&self, id: u64) {
        self.last_wal_id.store(id, Ordering::SeqCst);
    }

    pub fn last_wal_id(&self) -> u64 {
        self.last_wal_id.load(Ordering::SeqCst)
    }

    /// Swaps in a fresh table and returns the old one frozen with the given
    /// WAL watermark.
    pub fn freeze(&self, last_wal_id: u64) -> Arc<ImmutableMemtable> {
        let mut guard = self.table.write();
        let old = std::mem::replace(&mut *guard, Arc::new(KVTable::new()));
        Arc::new(ImmutableMemtable {
            last_wal_id,
            table: old,
        })
    }
}

impl Default for Memtable {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ImmutableMemtable {
    last_wal_id: u64,
    table: Arc<KVTable>,
}

impl ImmutableMemtable {
    pub fn last_wal_id(&self) -> u64 {
        self.last_wal_id
    }

    pub fn table(&self) -> &Arc<KVTable> {
        &self.table
    }

    pub fn get(&self, key: &[u8]) -> Option<ValueDeletable> {
        self.table.get(key)
    }

    pub fn iter(&self) -> KVTableIterator {
        self.table.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_accounts_for_overwrites_and_tombstones() {
        let table = KVTable::new();
        table.put(Bytes::from_static(b"abcd"), Bytes::from_static(b"123456"));
        assert_eq!(table.size(), 10);

        table.put(Bytes::from_static(b"abcd"), Bytes::from_static(b"12"));
        assert_eq!(table.size(), 6);

        table.delete(Bytes::from_static(b"abcd"));
        assert_eq!(table.size(), 4);

        table.delete(Bytes::from_static(b"zz"));
        assert_eq!(table.size(), 6);
    }

    #[test]
    fn iterator_yields_sorted_entries() {
        let table = Arc::new(KVTable::new());
        table.put(Bytes::from_static(b"ccc"), Bytes::from_static(b"3"));
        table.put(Bytes::from_static(b"aaa"), Bytes::from_static(b"1"));
        table.delete(Bytes::from_static(b"bbb"));

        let mut iter = table.iter();
        let mut keys = Vec::new();
        while let Some(entry) = iter.next_entry() {
            keys.push(entry.key);
        }
        assert_eq!(keys, vec!["aaa", "bbb", "ccc"]);

        // the key/value view skips tombstones
        let mut iter = table.iter();
        let mut live = Vec::new();
        while let Some(kv) = iter.next() {
            live.push(kv.key);
        }
        assert_eq!(live, vec!["aaa", "ccc"]);
    }

    #[test]
    fn iterator_survives_concurrent_inserts_in_order() {
        let table = Arc::new(KVTable::new());
        table.put(Bytes::from_static(b"b"), Bytes::from_static(b"1"));
        table.put(Bytes::from_static(b"d"), Bytes::from_static(b"2"));

        let mut iter = table.iter();
        let first = iter.next_entry().expect("first entry");
        assert_eq!(first.key, "b");

        // an insert behind the cursor must not be re-observed
        table.put(Bytes::from_static(b"a"), Bytes::from_static(b"0"));
        // an insert ahead of the cursor may be observed, in order
        table.put(Bytes::from_static(b"c"), Bytes::from_static(b"3"));

        let mut rest = Vec::new();
        while let Some(entry) = iter.next_entry() {
            rest.push(entry.key);
        }
        assert_eq!(rest, vec!["c", "d"]);
    }

    #[test]
    fn durable_watch_resolves_past_and_future_waiters() {
        let table = Arc::new(KVTable::new());
        assert!(matches!(
            table.await_durable(Some(Duration::from_millis(10))),
            Err(Error::Cancelled)
        ));

        let waiter = {
            let table = table.clone();
            std::thread::spawn(move || table.await_durable(None))
        };
        table.notify_wal_flushed();
        waiter.join().expect("waiter thread").expect("durable");

        // late waiters resolve immediately
        table.await_durable(Some(Duration::from_millis(1))).unwrap();
        assert!(table.is_durable());
    }

    #[test]
    fn wal_freeze_swaps_in_fresh_table() {
        let wal = Wal::new();
        assert!(wal.freeze(1).is_none());

        wal.put(Bytes::from_static(b"k"), Bytes::from_static(b"v"));
        assert_eq!(
            wal.get(b"k"),
            Some(ValueDeletable::Value(Bytes::from_static(b"v")))
        );

        let imm = wal.freeze(1).expect("frozen");
        assert_eq!(imm.id(), 1);
        assert!(wal.is_empty());
        assert!(wal.get(b"k").is_none());
        assert_eq!(
            imm.get(b"k"),
            Some(ValueDeletable::Value(Bytes::from_static(b"v")))
        );
    }

    #[test]
    fn memtable_freeze_carries_wal_watermark() {
        let memtable = Memtable::new();
        memtable.insert(RowEntry::new_value(&b"k"[..], &b"v"[..]));
        memtable.set_last_wal_id(7);

        let imm = memtable.freeze(memtable.last_wal_id());
        assert_eq!(imm.last_wal_id(), 7);
        assert!(memtable.is_empty());
    }
}

//! Maps logical SST ids to object paths and moves table bytes in and out of
//! the object store.
//!
//! WAL-tagged tables live under `<root>/wal/<id>.sst`, compacted tables
//! under `<root>/compacted/<ulid>.sst`. Bloom filters are served from a
//! bounded in-memory cache, populated on upload and on read-through.

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use tracing::warn;

use crate::error::Result;
use crate::filter::BloomFilter;
use crate::object_store::{ObjectStore, ReadOnlyObject};
use crate::sst::{
    Block, EncodedSsTable, EncodedSsTableBuilder, SsTableFormat, SsTableIndex, SstHandle, SstId,
};

const FILTER_CACHE_ENTRIES: usize = 1000;

/// Bounded, approximately-LRU cache of per-SST bloom filters. Tables built
/// without a filter cache an explicit `None` so misses are not re-fetched.
struct FilterCache {
    inner: Mutex<LruCache<SstId, Option<Arc<BloomFilter>>>>,
}

impl FilterCache {
    fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("nonzero cache capacity");
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    fn get(&self, id: &SstId) -> Option<Option<Arc<BloomFilter>>> {
        self.inner.lock().get(id).cloned()
    }

    fn insert(&self, id: SstId, filter: Option<Arc<BloomFilter>>) {
        self.inner.lock().put(id, filter);
    }
}

pub struct TableStore {
    store: Arc<dyn ObjectStore>,
    format: SsTableFormat,
    root: String,
    filter_cache: FilterCache,
}

impl TableStore {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        format: SsTableFormat,
        root: impl Into<String>,
    ) -> Self {
        Self {
            store,
            format,
            root: root.into(),
            filter_cache: FilterCache::new(FILTER_CACHE_ENTRIES),
        }
    }

    pub fn table_builder(&self) -> EncodedSsTableBuilder {
        self.format.table_builder()
    }

    /// Uploads the encoded table as one object and primes the filter cache.
    pub fn write_sst(&self, id: &SstId, encoded: EncodedSsTable) -> Result<SstHandle> {
        let path = self.sst_path(id);
        self.store.put(&path, encoded.raw)?;
        self.filter_cache.insert(*id, encoded.filter.map(Arc::new));
        Ok(SstHandle {
            id: *id,
            info: encoded.info,
        })
    }

    /// Reads the table footer/info from the object store.
    pub fn open_sst(&self, id: &SstId) -> Result<SstHandle> {
        let info = self.format.read_info(&self.read_only_object(id))?;
        Ok(SstHandle { id: *id, info })
    }

    pub fn read_index(&self, handle: &SstHandle) -> Result<SsTableIndex> {
        self.format
            .read_index(&handle.info, &self.read_only_object(&handle.id))
    }

    pub fn read_blocks(
        &self,
        handle: &SstHandle,
        range: std::ops::Range<usize>,
    ) -> Result<Vec<Block>> {
        let obj = self.read_only_object(&handle.id);
        let index = self.format.read_index(&handle.info, &obj)?;
        self.format.read_blocks(&handle.info, &index, range, &obj)
    }

    pub fn read_blocks_using_index(
        &self,
        handle: &SstHandle,
        range: std::ops::Range<usize>,
        index: &SsTableIndex,
    ) -> Result<Vec<Block>> {
        let obj = self.read_only_object(&handle.id);
        self.format.read_blocks(&handle.info, index, range, &obj)
    }

    /// Cache-first filter lookup; a miss reads the filter section and
    /// populates the cache.
    pub fn read_filter(&self, handle: &SstHandle) -> Result<Option<Arc<BloomFilter>>> {
        if let Some(cached) = self.filter_cache.get(&handle.id) {
            return Ok(cached);
        }
        let filter = self
            .format
            .read_filter(&handle.info, &self.read_only_object(&handle.id))?
            .map(Arc::new);
        self.filter_cache.insert(handle.id, filter.clone());
        Ok(filter)
    }

    /// WAL SST ids above `above_id`, ascending.
    pub fn list_wal_ssts(&self, above_id: u64) -> Result<Vec<u64>> {
        let prefix = format!("{}/wal/", self.root);
        let mut ids = Vec::new();
        for path in self.store.list(&prefix)? {
            let Some(name) = path.rsplit('/').next() else {
                continue;
            };
            let Some(stem) = name.strip_suffix(".sst") else {
                continue;
            };
            match stem.parse::<u64>() {
                Ok(id) if id > above_id => ids.push(id),
                Ok(_) => {}
                Err(_) => warn!(%path, "ignoring wal object with unparseable id"),
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    pub(crate) fn read_only_object(&self, id: &SstId) -> ReadOnlyObject {
        ReadOnlyObject::new(self.store.clone(), self.sst_path(id))
    }

    fn sst_path(&self, id: &SstId) -> String {
        match id {
            SstId::Wal(id) => format!("{}/wal/{}.sst", self.root, id),
            SstId::Compacted(ulid) => format!("{}/compacted/{}.sst", self.root, ulid),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_store::InMemoryObjectStore;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_store() -> TableStore {
        TableStore::new(
            Arc::new(InMemoryObjectStore::new()),
            SsTableFormat::default(),
            "testdb",
        )
    }

    fn build_sst(store: &TableStore, keys: &[&str]) -> EncodedSsTable {
        let mut builder = store.table_builder();
        for key in keys {
            builder
                .add(
                    Bytes::copy_from_slice(key.as_bytes()),
                    Some(Bytes::from_static(b"v")),
                )
                .expect("add");
        }
        builder.build().expect("build")
    }

    #[test]
    fn write_then_open_round_trips_info() -> Result<()> {
        let store = test_store();
        let encoded = build_sst(&store, &["aa", "bb"]);
        let expected_info = encoded.info.clone();

        let id = SstId::Wal(1);
        let written = store.write_sst(&id, encoded)?;
        assert_eq!(written.info, expected_info);

        let opened = store.open_sst(&id)?;
        assert_eq!(opened.info, expected_info);
        assert_eq!(opened.id, id);

        let blocks = store.read_blocks(&opened, 0..1)?;
        let keys: Vec<_> = blocks
            .iter()
            .flat_map(|b| b.entries())
            .map(|entry| entry.key.clone())
            .collect();
        assert_eq!(keys, vec!["aa", "bb"]);
        Ok(())
    }

    #[test]
    fn lists_wal_ssts_above_watermark() -> Result<()> {
        let store = test_store();
        for id in [3u64, 1, 2, 10] {
            let encoded = build_sst(&store, &["k"]);
            store.write_sst(&SstId::Wal(id), encoded)?;
        }
        let encoded = build_sst(&store, &["k"]);
        store.write_sst(&SstId::Compacted(ulid::Ulid::new()), encoded)?;

        assert_eq!(store.list_wal_ssts(0)?, vec![1, 2, 3, 10]);
        assert_eq!(store.list_wal_ssts(2)?, vec![3, 10]);
        assert_eq!(store.list_wal_ssts(10)?, Vec::<u64>::new());
        Ok(())
    }

    struct CountingStore {
        inner: InMemoryObjectStore,
        range_reads: AtomicUsize,
    }

    impl ObjectStore for CountingStore {
        fn put(&self, path: &str, data: Bytes) -> Result<()> {
            self.inner.put(path, data)
        }
        fn put_if_absent(&self, path: &str, data: Bytes) -> Result<()> {
            self.inner.put_if_absent(path, data)
        }
        fn get(&self, path: &str) -> Result<Bytes> {
            self.inner.get(path)
        }
        fn get_range(&self, path: &str, range: std::ops::Range<u64>) -> Result<Bytes> {
            self.range_reads.fetch_add(1, Ordering::SeqCst);
            self.inner.get_range(path, range)
        }
        fn len(&self, path: &str) -> Result<u64> {
            self.inner.len(path)
        }
        fn list(&self, prefix: &str) -> Result<Vec<String>> {
            self.inner.list(prefix)
        }
    }

    #[test]
    fn filter_reads_are_cached() -> Result<()> {
        let counting = Arc::new(CountingStore {
            inner: InMemoryObjectStore::new(),
            range_reads: AtomicUsize::new(0),
        });
        let store = TableStore::new(counting.clone(), SsTableFormat::default(), "testdb");

        let encoded = build_sst(&store, &["aa", "bb", "cc"]);
        let handle = store.write_sst(&SstId::Wal(1), encoded)?;

        // populated on write: no object reads needed at all
        let baseline = counting.range_reads.load(Ordering::SeqCst);
        assert!(store.read_filter(&handle)?.is_some());
        assert_eq!(counting.range_reads.load(Ordering::SeqCst), baseline);

        // fresh table store: one read-through, then cached
        let cold = TableStore::new(counting.clone(), SsTableFormat::default(), "testdb");
        assert!(cold.read_filter(&handle)?.is_some());
        let after_miss = counting.range_reads.load(Ordering::SeqCst);
        assert!(after_miss > baseline);
        assert!(cold.read_filter(&handle)?.is_some());
        assert_eq!(counting.range_reads.load(Ordering::SeqCst), after_miss);
        Ok(())
    }
}

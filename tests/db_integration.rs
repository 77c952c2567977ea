use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;

use cirrusdb::manifest::{ManifestStore, StoredManifest};
use cirrusdb::sst::iter::SstIterator;
use cirrusdb::sst::SsTableFormat;
use cirrusdb::state::CoreState;
use cirrusdb::table_store::TableStore;
use cirrusdb::{Db, DbOptions, Error, InMemoryObjectStore, ReadLevel, ReadOptions, WriteOptions};

fn test_options(min_filter_keys: u32, l0_sst_size_bytes: u64) -> DbOptions {
    DbOptions {
        flush_interval: Duration::from_millis(100),
        manifest_poll_interval: Duration::from_millis(100),
        min_filter_keys,
        l0_sst_size_bytes,
        ..DbOptions::default()
    }
}

fn repeated_char(ch: u8, count: usize) -> Vec<u8> {
    vec![ch; count]
}

fn wait_for_manifest_condition(
    stored: &mut StoredManifest,
    timeout: Duration,
    cond: impl Fn(&CoreState) -> bool,
) -> CoreState {
    let start = Instant::now();
    while start.elapsed() < timeout {
        let state = stored.refresh().expect("refresh manifest");
        if cond(state) {
            return state.clone();
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    panic!("manifest condition took longer than {timeout:?}");
}

#[test]
fn put_get_delete() -> anyhow::Result<()> {
    let bucket = Arc::new(InMemoryObjectStore::new());
    let db = Db::open_with_options("test_kv_store", bucket, test_options(0, 1024))?;

    db.put(b"key1", b"value1")?;
    assert_eq!(db.get(b"key1")?, Bytes::from_static(b"value1"));

    db.put(b"key2", b"value2")?;
    db.flush_wal()?;
    assert_eq!(db.get(b"key2")?, Bytes::from_static(b"value2"));

    db.delete(b"key2")?;
    assert!(matches!(db.get(b"key2"), Err(Error::KeyNotFound)));

    db.close()?;
    Ok(())
}

#[test]
fn get_non_existing_key() -> anyhow::Result<()> {
    let bucket = Arc::new(InMemoryObjectStore::new());
    let db = Db::open("test_kv_store", bucket)?;

    db.put(b"key1", b"value1")?;
    db.flush_wal()?;
    db.flush_memtable_to_l0()?;

    assert!(matches!(db.get(b"key2"), Err(Error::KeyNotFound)));
    db.close()?;
    Ok(())
}

#[test]
fn non_durable_writes_reach_l0() -> anyhow::Result<()> {
    let bucket = Arc::new(InMemoryObjectStore::new());
    let db = Db::open("test_kv_store", bucket)?;
    let no_wait = WriteOptions {
        await_durable: false,
    };

    db.put_with_options(b"k1", b"v1", &no_wait)?;
    db.flush_wal()?;
    db.flush_memtable_to_l0()?;

    db.put_with_options(b"k0", b"v0", &no_wait)?;
    db.flush_wal()?;
    db.flush_memtable_to_l0()?;

    for read_level in [ReadLevel::Committed, ReadLevel::Uncommitted] {
        let opts = ReadOptions { read_level };
        assert_eq!(
            db.get_with_options(b"k1", &opts)?,
            Bytes::from_static(b"v1")
        );
        assert_eq!(
            db.get_with_options(b"k0", &opts)?,
            Bytes::from_static(b"v0")
        );
    }

    db.close()?;
    Ok(())
}

#[test]
fn put_empty_value() -> anyhow::Result<()> {
    let bucket = Arc::new(InMemoryObjectStore::new());
    let db = Db::open_with_options("test_kv_store", bucket, test_options(0, 1024))?;

    db.put(b"key1", b"")?;
    db.flush_wal()?;
    assert_eq!(db.get(b"key1")?, Bytes::new());

    db.close()?;
    Ok(())
}

#[test]
fn read_levels_observe_wal_writes() -> anyhow::Result<()> {
    let bucket = Arc::new(InMemoryObjectStore::new());
    let db = Db::open_with_options("test_kv_store", bucket, test_options(0, 1024))?;

    db.put(b"foo", b"bar")?;
    db.put_with_options(
        b"foo",
        b"bla",
        &WriteOptions {
            await_durable: false,
        },
    )?;

    assert_eq!(db.get(b"foo")?, Bytes::from_static(b"bar"));
    assert_eq!(
        db.get_with_options(
            b"foo",
            &ReadOptions {
                read_level: ReadLevel::Uncommitted
            }
        )?,
        Bytes::from_static(b"bla")
    );

    db.close()?;
    Ok(())
}

#[test]
fn puts_flush_memtable_to_l0_at_threshold() -> anyhow::Result<()> {
    let bucket = Arc::new(InMemoryObjectStore::new());
    let db_path = "test_kv_store";
    let db = Db::open_with_options(db_path, bucket.clone(), test_options(0, 128))?;

    let manifest_store = Arc::new(ManifestStore::new(db_path, bucket.clone()));
    let mut stored =
        StoredManifest::load(manifest_store)?.expect("manifest present after open");
    let table_store = Arc::new(TableStore::new(
        bucket,
        SsTableFormat::default(),
        db_path,
    ));

    let mut last_compacted = 0;
    for i in 0..3u64 {
        let key = repeated_char(b'a' + i as u8, 16);
        let value = repeated_char(b'b' + i as u8, 50);
        db.put(&key, &value)?;

        let key = repeated_char(b'j' + i as u8, 16);
        let value = repeated_char(b'k' + i as u8, 50);
        db.put(&key, &value)?;

        let state = wait_for_manifest_condition(&mut stored, Duration::from_secs(30), |state| {
            state.last_compacted_wal_sst_id > last_compacted
        });
        assert_eq!(state.last_compacted_wal_sst_id, i * 2 + 2);
        last_compacted = state.last_compacted_wal_sst_id;
    }

    let state = stored.refresh()?.clone();
    assert_eq!(state.l0.len(), 3);
    for i in 0..3usize {
        // L0 is newest first; iterate in insertion order
        let handle = state.l0[2 - i].clone();
        let mut iter = SstIterator::new(handle, table_store.clone())?;

        let entry = iter.next_entry()?.expect("first key of flush cycle");
        assert_eq!(entry.key, Bytes::from(repeated_char(b'a' + i as u8, 16)));
        let entry = iter.next_entry()?.expect("second key of flush cycle");
        assert_eq!(entry.key, Bytes::from(repeated_char(b'j' + i as u8, 16)));
        assert!(iter.next_entry()?.is_none());
    }

    db.close()?;
    Ok(())
}

#[test]
fn basic_restore() -> anyhow::Result<()> {
    let bucket = Arc::new(InMemoryObjectStore::new());
    let db_path = "test_kv_store";
    let db = Db::open_with_options(db_path, bucket.clone(), test_options(0, 128))?;

    // writes that fill the memtable and land in L0
    let l0_count = 3u64;
    for i in 0..l0_count {
        db.put(
            &repeated_char(b'a' + i as u8, 16),
            &repeated_char(b'b' + i as u8, 48),
        )?;
        db.put(
            &repeated_char(b'j' + i as u8, 16),
            &repeated_char(b'k' + i as u8, 48),
        )?;
    }

    // small writes that stay WAL-only
    let sst_count = 5u64;
    for i in 0..sst_count {
        let key = i.to_string();
        db.put(key.as_bytes(), key.as_bytes())?;
        db.flush_wal()?;
    }
    db.close()?;

    let restored = Db::open_with_options(db_path, bucket.clone(), test_options(0, 128))?;
    for i in 0..l0_count {
        assert_eq!(
            restored.get(&repeated_char(b'a' + i as u8, 16))?,
            Bytes::from(repeated_char(b'b' + i as u8, 48))
        );
        assert_eq!(
            restored.get(&repeated_char(b'j' + i as u8, 16))?,
            Bytes::from(repeated_char(b'k' + i as u8, 48))
        );
    }
    for i in 0..sst_count {
        let key = i.to_string();
        assert_eq!(restored.get(key.as_bytes())?, Bytes::from(key.clone()));
    }

    let manifest_store = Arc::new(ManifestStore::new(db_path, bucket));
    let stored = StoredManifest::load(manifest_store)?.expect("manifest present");
    assert_eq!(
        stored.db_state().next_wal_sst_id,
        sst_count + 2 * l0_count + 1
    );

    restored.close()?;
    Ok(())
}

#[test]
fn restore_recovers_frozen_memtables() -> anyhow::Result<()> {
    let bucket = Arc::new(InMemoryObjectStore::new());
    let db_path = "test_kv_store";
    let db = Db::open_with_options(db_path, bucket.clone(), test_options(0, 128))?;

    let key1 = repeated_char(b'a', 32);
    let value1 = repeated_char(b'b', 96);
    let key2 = repeated_char(b'c', 32);
    let value2 = repeated_char(b'd', 96);
    db.put(&key1, &value1)?;
    db.put(&key2, &value2)?;
    db.close()?;

    let db = Db::open_with_options(db_path, bucket.clone(), test_options(0, 128))?;

    let manifest_store = Arc::new(ManifestStore::new(db_path, bucket));
    let mut stored = StoredManifest::load(manifest_store)?.expect("manifest present");
    let state = stored.refresh()?.clone();
    assert_eq!(state.last_compacted_wal_sst_id, 2);
    assert_eq!(state.next_wal_sst_id, 3);
    assert_eq!(state.l0.len(), 2);

    assert_eq!(db.get(&key1)?, Bytes::from(value1));
    assert_eq!(db.get(&key2)?, Bytes::from(value2));

    db.close()?;
    Ok(())
}

#[test]
fn reopened_writer_fences_the_previous_one() -> anyhow::Result<()> {
    let bucket = Arc::new(InMemoryObjectStore::new());
    let db_path = "test_kv_store";

    let first = Db::open_with_options(db_path, bucket.clone(), test_options(0, 1024))?;
    first.put(b"k1", b"v1")?;

    // a second process takes over the same namespace
    let second = Db::open_with_options(db_path, bucket.clone(), test_options(0, 1024))?;
    assert_eq!(second.get(b"k1")?, Bytes::from_static(b"v1"));
    second.put(b"k2", b"v2")?;

    second.close()?;
    first.close()?;

    let manifest_store = Arc::new(ManifestStore::new(db_path, bucket));
    let stored = StoredManifest::load(manifest_store)?.expect("manifest present");
    assert_eq!(stored.manifest().writer_epoch, 2);
    Ok(())
}

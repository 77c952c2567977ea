//! Database configuration.

use std::time::Duration;

/// Block payload codec applied before the block checksum is computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum CompressionCodec {
    None,
    Lz4,
}

impl Default for CompressionCodec {
    fn default() -> Self {
        CompressionCodec::None
    }
}

#[derive(Debug, Clone)]
pub struct DbOptions {
    /// How often the WAL flusher freezes and uploads the live WAL.
    pub flush_interval: Duration,
    /// How often the memtable flusher re-reads the manifest to observe
    /// foreign compaction progress.
    pub manifest_poll_interval: Duration,
    /// SSTs with fewer keys than this carry no bloom filter.
    pub min_filter_keys: u32,
    /// Memtable freeze threshold in bytes.
    pub l0_sst_size_bytes: u64,
    /// Target uncompressed size of a single SST block.
    pub block_size: usize,
    pub compression_codec: CompressionCodec,
    /// Enables the background compactor when present.
    pub compactor_options: Option<CompactorOptions>,
}

impl Default for DbOptions {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_millis(100),
            manifest_poll_interval: Duration::from_millis(100),
            min_filter_keys: 0,
            l0_sst_size_bytes: 64 * 1024 * 1024,
            block_size: 4096,
            compression_codec: CompressionCodec::None,
            compactor_options: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompactorOptions {
    /// How often the compactor polls the manifest for work.
    pub poll_interval: Duration,
    /// Cap on the size of a single compaction output SST.
    pub max_sst_size: u64,
}

impl Default for CompactorOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            max_sst_size: 256 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WriteOptions {
    /// Block the writer until its WAL has been uploaded to the object store.
    pub await_durable: bool,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            await_durable: true,
        }
    }
}

/// Which writes a read is allowed to observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadLevel {
    /// Only writes whose WAL SST has reached the object store.
    Committed,
    /// Also writes still sitting in the in-memory WAL.
    Uncommitted,
}

#[derive(Debug, Clone, Copy)]
pub struct ReadOptions {
    pub read_level: ReadLevel,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            read_level: ReadLevel::Committed,
        }
    }
}

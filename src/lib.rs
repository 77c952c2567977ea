//! `cirrusdb` is a log-structured merge-tree (LSM) key-value store that keeps
//! all durable state in an object store instead of local block devices.
//!
//! This crate is intentionally opinionated about correctness first:
//! - Writes land in an in-memory WAL and become durable when the WAL is
//!   uploaded as an SST; clients can await that upload per write.
//! - Deletes are tombstones.
//! - The manifest is published as numbered generations with conditional
//!   puts, so concurrent writers fence each other instead of clobbering.
//! - Reads resolve newest-tier-first: WAL, immutable WALs, memtable,
//!   immutable memtables, L0, then compacted sorted runs.
//!
//! Background work runs on three loops: a WAL flusher (periodic and
//! on-demand), a memtable flusher (size-triggered), and an optional
//! compactor that merges L0 into sorted runs.

pub mod compactor;
pub mod config;
pub mod db;
pub mod error;
pub mod filter;
pub mod flush;
pub mod manifest;
pub mod memtable;
pub mod merge;
pub mod object_store;
pub mod sorted_run;
pub mod sst;
pub mod state;
pub mod table_store;
pub mod types;

pub use config::{
    CompactorOptions, CompressionCodec, DbOptions, ReadLevel, ReadOptions, WriteOptions,
};
pub use db::Db;
pub use error::{Error, Result};
pub use object_store::{InMemoryObjectStore, LocalObjectStore, ObjectStore, RemoteObjectStore};
pub use types::{KeyValue, RowEntry, ValueDeletable};

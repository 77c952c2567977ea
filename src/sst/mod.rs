//! SSTable (Sorted String Table) format.
//!
//! Goals:
//! - Immutable sorted tables with verifiable checksums, uploaded to the
//!   object store as a single object.
//! - Point lookups via bloom filter + block index + binary search within a
//!   block, touching as few byte ranges as possible.
//! - Streaming iteration block by block.
//!
//! Object layout:
//! ```text
//! [data blocks...]
//! [bloom filter]          (absent for tables below the filter threshold)
//! [block index]
//! [table info]
//! [info crc32c u32][info len u32][format version u16][magic]
//! ```
//!
//! Data block format (payload is compressed per the table codec, then a
//! crc32c trailer is appended over the stored payload):
//! ```text
//! [count u32]
//! repeated count times:
//!   [key_len u16][key bytes]
//!   [val_len u32][val bytes]     val_len == u32::MAX marks a tombstone
//! [crc32c u32]
//! ```
//!
//! Index entries map each block's first key to `{offset, len}` so a point
//! read binary-searches first keys and fetches one block.

pub mod iter;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::config::CompressionCodec;
use crate::error::{Error, Result};
use crate::filter::BloomFilter;
use crate::object_store::ReadOnlyObject;
use crate::types::{RowEntry, ValueDeletable};

const MAGIC: &[u8; 4] = b"CSST";
const FORMAT_VERSION: u16 = 1;
const FOOTER_TAIL_SIZE: u64 = 4 + 4 + 2 + 4;
const TOMBSTONE_LEN: u32 = u32::MAX;

/// Identifier of an SST in the object store namespace.
///
/// WAL ids are dense and engine-assigned; compacted ids are ULIDs, globally
/// unique and time-sortable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SstId {
    Wal(u64),
    Compacted(Ulid),
}

impl SstId {
    pub fn unwrap_wal_id(&self) -> u64 {
        match self {
            SstId::Wal(id) => *id,
            SstId::Compacted(_) => panic!("expected WAL SST id"),
        }
    }

    pub fn unwrap_compacted_id(&self) -> Ulid {
        match self {
            SstId::Wal(_) => panic!("expected compacted SST id"),
            SstId::Compacted(id) => *id,
        }
    }
}

impl std::fmt::Display for SstId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SstId::Wal(id) => write!(f, "wal({id})"),
            SstId::Compacted(id) => write!(f, "compacted({id})"),
        }
    }
}

/// Decoded table info held in handles and the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SsTableInfo {
    pub first_key: Option<Bytes>,
    pub index_offset: u64,
    pub index_len: u64,
    pub filter_offset: u64,
    pub filter_len: u64,
    pub compression: CompressionCodec,
}

impl SsTableInfo {
    pub fn has_filter(&self) -> bool {
        self.filter_len > 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SstHandle {
    pub id: SstId,
    pub info: SsTableInfo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMeta {
    pub first_key: Bytes,
    pub offset: u64,
    pub len: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SsTableIndex {
    pub blocks: Vec<BlockMeta>,
}

impl SsTableIndex {
    /// Index of the unique block that may contain `key`, or `None` when the
    /// key sorts before the table's first key.
    pub fn block_for_key(&self, key: &[u8]) -> Option<usize> {
        let idx = self
            .blocks
            .partition_point(|meta| meta.first_key.as_ref() <= key);
        idx.checked_sub(1)
    }
}

/// One decoded data block, entries in strictly ascending key order.
#[derive(Debug, Clone)]
pub struct Block {
    entries: Vec<RowEntry>,
}

impl Block {
    pub fn entries(&self) -> &[RowEntry] {
        &self.entries
    }

    pub fn find(&self, key: &[u8]) -> Option<&ValueDeletable> {
        self.entries
            .binary_search_by(|entry| entry.key.as_ref().cmp(key))
            .ok()
            .map(|idx| &self.entries[idx].value)
    }
}

/// A fully encoded table ready for upload.
pub struct EncodedSsTable {
    pub info: SsTableInfo,
    pub filter: Option<BloomFilter>,
    pub raw: Bytes,
}

#[derive(Debug, Clone)]
pub struct SsTableFormat {
    pub block_size: usize,
    pub min_filter_keys: u32,
    pub compression: CompressionCodec,
}

impl Default for SsTableFormat {
    fn default() -> Self {
        Self {
            block_size: 4096,
            min_filter_keys: 0,
            compression: CompressionCodec::None,
        }
    }
}

impl SsTableFormat {
    pub fn table_builder(&self) -> EncodedSsTableBuilder {
        EncodedSsTableBuilder::new(self.block_size, self.min_filter_keys, self.compression)
    }

    pub fn read_info(&self, obj: &ReadOnlyObject) -> Result<SsTableInfo> {
        let total = obj.len()?;
        if total < FOOTER_TAIL_SIZE {
            return Err(Error::invalid_db_state("sst too small for footer"));
        }
        let tail = obj.read_range(total - FOOTER_TAIL_SIZE..total)?;
        let mut tail = &tail[..];
        let info_crc = tail.get_u32_le();
        let info_len = tail.get_u32_le() as u64;
        let version = tail.get_u16_le();
        let magic = tail.copy_to_bytes(4);
        if magic.as_ref() != MAGIC {
            return Err(Error::invalid_db_state("bad sst magic"));
        }
        if version != FORMAT_VERSION {
            return Err(Error::invalid_db_state(format!(
                "unsupported sst format version {version}"
            )));
        }
        if total < FOOTER_TAIL_SIZE + info_len {
            return Err(Error::invalid_db_state("sst footer length out of bounds"));
        }

        let info_start = total - FOOTER_TAIL_SIZE - info_len;
        let info_bytes = obj.read_range(info_start..total - FOOTER_TAIL_SIZE)?;
        if crc32c::crc32c(&info_bytes) != info_crc {
            return Err(Error::Checksum("sst info checksum mismatch"));
        }
        Ok(bincode::deserialize(&info_bytes)?)
    }

    pub fn read_index(&self, info: &SsTableInfo, obj: &ReadOnlyObject) -> Result<SsTableIndex> {
        let raw = obj.read_range(info.index_offset..info.index_offset + info.index_len)?;
        Ok(bincode::deserialize(&raw)?)
    }

    pub fn read_filter(
        &self,
        info: &SsTableInfo,
        obj: &ReadOnlyObject,
    ) -> Result<Option<BloomFilter>> {
        if !info.has_filter() {
            return Ok(None);
        }
        let raw = obj.read_range(info.filter_offset..info.filter_offset + info.filter_len)?;
        Ok(Some(BloomFilter::decode(&raw)?))
    }

    /// Fetches blocks `[range.start, range.end)` in one contiguous read.
    pub fn read_blocks(
        &self,
        info: &SsTableInfo,
        index: &SsTableIndex,
        range: std::ops::Range<usize>,
        obj: &ReadOnlyObject,
    ) -> Result<Vec<Block>> {
        if range.is_empty() {
            return Ok(Vec::new());
        }
        let metas = index
            .blocks
            .get(range.clone())
            .ok_or_else(|| Error::invalid_db_state("block range outside index"))?;
        let start = metas[0].offset;
        let end = metas[metas.len() - 1].offset + metas[metas.len() - 1].len;
        let raw = obj.read_range(start..end)?;

        let mut blocks = Vec::with_capacity(metas.len());
        for meta in metas {
            let begin = (meta.offset - start) as usize;
            let stop = begin + meta.len as usize;
            blocks.push(self.decode_block(&raw[begin..stop], info.compression)?);
        }
        Ok(blocks)
    }

    fn decode_block(&self, raw: &[u8], compression: CompressionCodec) -> Result<Block> {
        if raw.len() < 4 {
            return Err(Error::invalid_db_state("block too small"));
        }
        let payload = &raw[..raw.len() - 4];
        let stored_crc = u32::from_le_bytes(raw[raw.len() - 4..].try_into().unwrap());
        if crc32c::crc32c(payload) != stored_crc {
            return Err(Error::Checksum("block checksum mismatch"));
        }

        let decompressed;
        let payload = match compression {
            CompressionCodec::None => payload,
            CompressionCodec::Lz4 => {
                decompressed = lz4_flex::decompress_size_prepended(payload)
                    .map_err(|_| Error::Checksum("block decompression failed"))?;
                &decompressed[..]
            }
        };

        let mut buf = payload;
        if buf.remaining() < 4 {
            return Err(Error::invalid_db_state("block payload too small"));
        }
        let count = buf.get_u32_le() as usize;
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            if buf.remaining() < 2 {
                return Err(Error::invalid_db_state("truncated block entry"));
            }
            let key_len = buf.get_u16_le() as usize;
            if buf.remaining() < key_len + 4 {
                return Err(Error::invalid_db_state("truncated block key"));
            }
            let key = buf.copy_to_bytes(key_len);
            let val_len = buf.get_u32_le();
            let value = if val_len == TOMBSTONE_LEN {
                ValueDeletable::Tombstone
            } else {
                if buf.remaining() < val_len as usize {
                    return Err(Error::invalid_db_state("truncated block value"));
                }
                ValueDeletable::Value(buf.copy_to_bytes(val_len as usize))
            };
            entries.push(RowEntry { key, value });
        }
        Ok(Block { entries })
    }
}

pub struct EncodedSsTableBuilder {
    block_size: usize,
    min_filter_keys: u32,
    compression: CompressionCodec,
    data: BytesMut,
    block: BytesMut,
    block_count: u32,
    block_first_key: Option<Bytes>,
    index: Vec<BlockMeta>,
    first_key: Option<Bytes>,
    last_key: Option<Bytes>,
    keys: Vec<Bytes>,
}

impl EncodedSsTableBuilder {
    fn new(block_size: usize, min_filter_keys: u32, compression: CompressionCodec) -> Self {
        Self {
            block_size,
            min_filter_keys,
            compression,
            data: BytesMut::new(),
            block: BytesMut::new(),
            block_count: 0,
            block_first_key: None,
            index: Vec::new(),
            first_key: None,
            last_key: None,
            keys: Vec::new(),
        }
    }

    /// Appends an entry; keys must arrive in strictly ascending order.
    /// `None` writes a tombstone.
    pub fn add(&mut self, key: Bytes, value: Option<Bytes>) -> Result<()> {
        if key.is_empty() {
            return Err(Error::invalid_db_state("sst keys must be non-empty"));
        }
        if let Some(last) = &self.last_key {
            if key <= *last {
                return Err(Error::invalid_db_state(
                    "sst keys must be added in strictly ascending order",
                ));
            }
        }

        if self.first_key.is_none() {
            self.first_key = Some(key.clone());
        }
        if self.block_first_key.is_none() {
            self.block_first_key = Some(key.clone());
        }
        self.last_key = Some(key.clone());
        self.keys.push(key.clone());

        let key_len: u16 = key
            .len()
            .try_into()
            .map_err(|_| Error::invalid_db_state("sst key too large"))?;
        self.block.put_u16_le(key_len);
        self.block.put_slice(&key);
        match value {
            Some(value) => {
                let val_len: u32 = value
                    .len()
                    .try_into()
                    .map_err(|_| Error::invalid_db_state("sst value too large"))?;
                if val_len == TOMBSTONE_LEN {
                    return Err(Error::invalid_db_state("sst value too large"));
                }
                self.block.put_u32_le(val_len);
                self.block.put_slice(&value);
            }
            None => self.block.put_u32_le(TOMBSTONE_LEN),
        }
        self.block_count += 1;

        if self.block.len() >= self.block_size {
            self.finish_block()?;
        }
        Ok(())
    }

    /// Bytes of finished block data so far; used to cap compaction outputs.
    pub fn estimated_size(&self) -> u64 {
        (self.data.len() + self.block.len()) as u64
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    fn finish_block(&mut self) -> Result<()> {
        if self.block_count == 0 {
            return Ok(());
        }

        let mut payload = Vec::with_capacity(4 + self.block.len());
        payload.extend_from_slice(&self.block_count.to_le_bytes());
        payload.extend_from_slice(&self.block);
        let payload = match self.compression {
            CompressionCodec::None => payload,
            CompressionCodec::Lz4 => lz4_flex::compress_prepend_size(&payload),
        };
        let crc = crc32c::crc32c(&payload);

        let offset = self.data.len() as u64;
        self.data.put_slice(&payload);
        self.data.put_u32_le(crc);

        let first_key = self
            .block_first_key
            .take()
            .ok_or_else(|| Error::invalid_db_state("block missing first key"))?;
        self.index.push(BlockMeta {
            first_key,
            offset,
            len: (payload.len() + 4) as u64,
        });

        self.block.clear();
        self.block_count = 0;
        Ok(())
    }

    pub fn build(mut self) -> Result<EncodedSsTable> {
        self.finish_block()?;

        let mut data = self.data;
        let filter = if !self.keys.is_empty() && self.keys.len() >= self.min_filter_keys as usize {
            Some(BloomFilter::build(&self.keys))
        } else {
            None
        };
        let filter_offset = data.len() as u64;
        let mut filter_len = 0u64;
        if let Some(filter) = &filter {
            let encoded = filter.encode()?;
            filter_len = encoded.len() as u64;
            data.put_slice(&encoded);
        }

        let index_offset = data.len() as u64;
        let index_bytes = bincode::serialize(&SsTableIndex { blocks: self.index })?;
        data.put_slice(&index_bytes);

        let info = SsTableInfo {
            first_key: self.first_key,
            index_offset,
            index_len: index_bytes.len() as u64,
            filter_offset,
            filter_len,
            compression: self.compression,
        };
        let info_bytes = bincode::serialize(&info)?;
        data.put_slice(&info_bytes);
        data.put_u32_le(crc32c::crc32c(&info_bytes));
        data.put_u32_le(info_bytes.len() as u32);
        data.put_u16_le(FORMAT_VERSION);
        data.put_slice(MAGIC);

        Ok(EncodedSsTable {
            info,
            filter,
            raw: data.freeze(),
        })
    }
}

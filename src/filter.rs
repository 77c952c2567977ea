//! Bloom filters for SST point lookups.
//!
//! A filter is built over every key in an SST (when the table is large
//! enough to warrant one), serialized into the table's filter section, and
//! consulted before any block is fetched on the read path.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const FALSE_POSITIVE_RATE: f64 = 0.01;

pub struct BloomFilter {
    inner: bloomfilter::Bloom<Bytes>,
}

/// Wire form: the bitmap plus the parameters needed to rebuild the filter.
#[derive(Serialize, Deserialize)]
struct EncodedFilter {
    bitmap: Vec<u8>,
    bitmap_bits: u64,
    k_num: u32,
    sip_keys: [(u64, u64); 2],
}

impl BloomFilter {
    pub fn build(keys: &[Bytes]) -> BloomFilter {
        let mut inner = bloomfilter::Bloom::new_for_fp_rate(keys.len().max(1), FALSE_POSITIVE_RATE);
        for key in keys {
            inner.set(key);
        }
        BloomFilter { inner }
    }

    pub fn might_contain(&self, key: &Bytes) -> bool {
        self.inner.check(key)
    }

    pub fn encode(&self) -> Result<Bytes> {
        let encoded = EncodedFilter {
            bitmap: self.inner.bitmap(),
            bitmap_bits: self.inner.number_of_bits(),
            k_num: self.inner.number_of_hash_functions(),
            sip_keys: self.inner.sip_keys(),
        };
        Ok(Bytes::from(bincode::serialize(&encoded)?))
    }

    pub fn decode(raw: &[u8]) -> Result<BloomFilter> {
        let encoded: EncodedFilter =
            bincode::deserialize(raw).map_err(|_| Error::Checksum("bloom filter decode"))?;
        Ok(BloomFilter {
            inner: bloomfilter::Bloom::from_existing(
                &encoded.bitmap,
                encoded.bitmap_bits,
                encoded.k_num,
                encoded.sip_keys,
            ),
        })
    }
}

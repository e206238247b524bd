// shardstream-core/src/format/shard.rs

//! Raw shard file layout.
//!
//! ```text
//! +------------------------------+
//! | Sample count (4 bytes)       |  <- u32 little-endian
//! +------------------------------+
//! | Offsets ((count + 1) x 4)    |  <- absolute u32 offsets into this file
//! +------------------------------+
//! | Sample bytes                 |  <- concatenated encoded samples
//! +------------------------------+
//! ```
//!
//! Offsets are monotonically non-decreasing and the last one equals the file
//! length, so sample `i` occupies `offsets[i]..offsets[i + 1]`.

use bytes::Bytes;

use crate::error::{Result, StreamError};

/// Bytes every shard spends on its sample count and trailing offset.
pub const SHARD_HEADER_BYTES: u64 = 4 + 4;

/// Bytes each sample adds to the offset table.
pub const OFFSET_BYTES_PER_SAMPLE: u64 = 4;

/// Builds raw shard bytes from already-encoded samples.
pub fn encode_shard(samples: &[Vec<u8>]) -> Result<Vec<u8>> {
    let count = u32::try_from(samples.len())
        .map_err(|_| StreamError::serialization("too many samples for one shard"))?;
    let header = 4 + 4 * (samples.len() + 1);
    let body: usize = samples.iter().map(Vec::len).sum();
    let total = header + body;
    if u32::try_from(total).is_err() {
        return Err(StreamError::serialization(format!(
            "shard of {total} bytes exceeds the 4 GiB offset range"
        )));
    }

    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(&count.to_le_bytes());
    let mut offset = header as u32;
    out.extend_from_slice(&offset.to_le_bytes());
    for sample in samples {
        offset += sample.len() as u32;
        out.extend_from_slice(&offset.to_le_bytes());
    }
    for sample in samples {
        out.extend_from_slice(sample);
    }
    Ok(out)
}

/// A parsed, verified raw shard held in memory.
#[derive(Debug, Clone)]
pub struct ShardBytes {
    shard: usize,
    data: Bytes,
    num_samples: usize,
}

impl ShardBytes {
    /// Parses raw shard bytes, checking the offset table for consistency.
    pub fn parse(shard: usize, data: Bytes) -> Result<Self> {
        let what = || format!("shard {shard}");
        if data.len() < 4 {
            return Err(StreamError::decode(what(), "missing sample count"));
        }
        let num_samples = read_u32(&data, 0) as usize;
        let header = num_samples
            .checked_add(1)
            .and_then(|n| n.checked_mul(4))
            .and_then(|n| n.checked_add(4))
            .filter(|h| *h <= data.len())
            .ok_or_else(|| StreamError::decode(what(), "offset table is truncated"))?;

        let mut prev = header;
        for i in 0..=num_samples {
            let offset = read_u32(&data, 4 + 4 * i) as usize;
            if i == 0 && offset != header {
                return Err(StreamError::decode(
                    what(),
                    format!("first sample starts at {offset}, expected {header}"),
                ));
            }
            if offset < prev || offset > data.len() {
                return Err(StreamError::decode(
                    what(),
                    format!("offset {i} ({offset}) is out of order or out of bounds"),
                ));
            }
            prev = offset;
        }
        if prev != data.len() {
            return Err(StreamError::decode(
                what(),
                format!("offsets end at {prev} but the shard is {} bytes", data.len()),
            ));
        }

        Ok(Self {
            shard,
            data,
            num_samples,
        })
    }

    pub fn shard(&self) -> usize {
        self.shard
    }

    pub fn num_samples(&self) -> usize {
        self.num_samples
    }

    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    /// The `num_samples + 1` entries of the offset table.
    pub fn offsets(&self) -> impl Iterator<Item = u32> + '_ {
        (0..=self.num_samples).map(|i| read_u32(&self.data, 4 + 4 * i))
    }

    /// Encoded bytes of the sample at `local` index.
    pub fn sample(&self, local: usize) -> Result<&[u8]> {
        if local >= self.num_samples {
            return Err(StreamError::decode(
                format!("shard {}", self.shard),
                format!("sample {local} out of {} samples", self.num_samples),
            ));
        }
        let start = read_u32(&self.data, 4 + 4 * local) as usize;
        let end = read_u32(&self.data, 8 + 4 * local) as usize;
        Ok(&self.data[start..end])
    }
}

fn read_u32(data: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}

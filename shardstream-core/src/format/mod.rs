// shardstream-core/src/format/mod.rs

//! On-disk shard format: column schema and sample encoding, shard layout,
//! compression and content hashes.

mod compression;
mod hash;
mod schema;
mod shard;

pub use compression::Compression;
pub use hash::{digest_all, HashAlgorithm};
pub use schema::{Column, ColumnType, Sample, Schema, Value};
pub use shard::{encode_shard, ShardBytes, OFFSET_BYTES_PER_SAMPLE, SHARD_HEADER_BYTES};

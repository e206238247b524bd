// shardstream-core/tests/end_to_end.rs

//! End-to-end tests: write a split with `ShardWriter` into a local
//! directory acting as the remote store, then stream it back through
//! `StreamingDataset`.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use shardstream_core::storage::RetryConfig;
use shardstream_core::{
    CacheOptions, Column, ColumnType, Compression, DatasetOptions, HashAlgorithm, LocalStorage,
    PlanConfig, Sample, Schema, ShardWriter, StreamingDataset, WriterOptions,
};
use tempfile::TempDir;

fn write_split(root: &Path, schema: Schema, options: WriterOptions, samples: &[Sample]) {
    let storage = LocalStorage::open(root).unwrap();
    let mut writer = ShardWriter::new(Arc::new(storage), "train", schema, options).unwrap();
    for sample in samples {
        writer.write(sample).unwrap();
    }
    writer.finish().unwrap();
}

fn open(root: &Path, cache_dir: &Path, plan: PlanConfig) -> StreamingDataset {
    let remote = Arc::new(LocalStorage::open(root).unwrap());
    let options = DatasetOptions {
        cache: CacheOptions {
            retry: RetryConfig::no_retry(),
            ..Default::default()
        },
        plan,
        prefetch_depth: 2,
    };
    StreamingDataset::open(remote, cache_dir, "train", options).unwrap()
}

fn id_schema() -> Schema {
    Schema::new(vec![Column::new("id", ColumnType::U64)]).unwrap()
}

fn id_of(sample: &Sample) -> u64 {
    sample.get("id").unwrap().as_u64().unwrap()
}

#[test]
fn test_three_words_single_shard() {
    let remote = TempDir::new().unwrap();
    let cache = TempDir::new().unwrap();

    let schema = Schema::new(vec![
        Column::new("number", ColumnType::U32),
        Column::new("words", ColumnType::Str),
    ])
    .unwrap();
    let samples: Vec<Sample> = ["zero", "one", "two"]
        .iter()
        .enumerate()
        .map(|(i, w)| Sample::new().with("number", i as u32).with("words", *w))
        .collect();
    write_split(remote.path(), schema, WriterOptions::default(), &samples);

    let dataset = open(remote.path(), cache.path(), PlanConfig::default());
    assert_eq!(dataset.len(), 3);
    assert_eq!(dataset.manifest().num_shards(), 1);

    let words: Vec<String> = dataset
        .iterate(0, 1)
        .unwrap()
        .map(|s| s.unwrap().get("words").unwrap().as_str().unwrap().to_string())
        .collect();
    assert_eq!(words, vec!["zero", "one", "two"]);
}

#[test]
fn test_round_trip_compressed_many_shards() {
    let remote = TempDir::new().unwrap();
    let cache = TempDir::new().unwrap();

    let schema = Schema::new(vec![
        Column::new("id", ColumnType::U64),
        Column::new("score", ColumnType::F64),
        Column::new("payload", ColumnType::Bytes),
        Column::new("meta", ColumnType::Json),
    ])
    .unwrap();
    let samples: Vec<Sample> = (0..500u64)
        .map(|i| {
            Sample::new()
                .with("id", i)
                .with("score", i as f64 * 0.5)
                .with("payload", vec![(i % 251) as u8; (i % 97) as usize])
                .with("meta", serde_json::json!({ "label": i % 7, "tags": ["a", "b"] }))
        })
        .collect();
    let limit = 2048;
    let options = WriterOptions {
        compression: Compression::Zstd { level: 3 },
        hashes: vec![HashAlgorithm::Sha256, HashAlgorithm::Xxh64],
        size_limit: Some(limit),
    };
    write_split(remote.path(), schema, options, &samples);

    let dataset = open(remote.path(), cache.path(), PlanConfig::default());
    let manifest = dataset.manifest();
    assert_eq!(dataset.len(), 500);
    assert!(manifest.num_shards() > 10);
    for shard in manifest.shards() {
        assert!(shard.raw.bytes <= limit || shard.samples == 1);
        assert!(shard.zip.is_some());
    }

    let read: Vec<Sample> = dataset.iterate(0, 1).unwrap().map(|s| s.unwrap()).collect();
    assert_eq!(read, samples);
    assert_eq!(dataset.cache_stats().fetches, manifest.num_shards() as u64);

    // random access agrees with streaming
    assert_eq!(dataset.get(321).unwrap(), samples[321]);
}

#[test]
fn test_ranks_cover_every_sample() {
    let remote = TempDir::new().unwrap();
    let cache = TempDir::new().unwrap();

    let samples: Vec<Sample> = (0..50u64).map(|i| Sample::new().with("id", i)).collect();
    let options = WriterOptions {
        compression: Compression::Lz4,
        size_limit: Some(8 + 12 * 6),
        ..Default::default()
    };
    write_split(remote.path(), id_schema(), options, &samples);

    let plan = PlanConfig {
        shuffle: true,
        batch_size: Some(4),
        ..Default::default()
    };
    let dataset = open(remote.path(), cache.path(), plan);
    let world = 3;
    dataset.set_epoch(2);
    let epoch_plan = dataset.plan(2, world).unwrap();

    let per_rank: Vec<Vec<u64>> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..world)
            .map(|rank| {
                let dataset = &dataset;
                scope.spawn(move || {
                    dataset
                        .iterate(rank, world)
                        .unwrap()
                        .map(|s| id_of(&s.unwrap()))
                        .collect::<Vec<u64>>()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    for (rank, ids) in per_rank.iter().enumerate() {
        assert_eq!(ids, &epoch_plan.rank(rank).unwrap());
    }

    let assigned: usize = per_rank.iter().map(Vec::len).sum();
    assert_eq!(assigned, epoch_plan.total_assigned());
    assert_eq!(assigned, 50 + epoch_plan.padding());
    assert!(epoch_plan.padding() < 4 * world);

    let union: BTreeSet<u64> = per_rank.iter().flatten().copied().collect();
    assert_eq!(union, (0..50).collect::<BTreeSet<u64>>());

    // concurrent ranks share one cache and download every shard once
    assert_eq!(
        dataset.cache_stats().fetches,
        dataset.manifest().num_shards() as u64
    );
}

#[test]
fn test_shuffled_order_independent_of_world_size() {
    let remote = TempDir::new().unwrap();
    let cache = TempDir::new().unwrap();

    let samples: Vec<Sample> = (0..24u64).map(|i| Sample::new().with("id", i)).collect();
    write_split(remote.path(), id_schema(), WriterOptions::default(), &samples);

    let plan = PlanConfig {
        shuffle: true,
        ..Default::default()
    };
    let dataset = open(remote.path(), cache.path(), plan);

    let single = dataset.plan(5, 1).unwrap().rank(0).unwrap();
    let quad = dataset.plan(5, 4).unwrap();
    let joined: Vec<u64> = (0..4).flat_map(|rank| quad.rank(rank).unwrap()).collect();
    assert_eq!(quad.samples_per_rank(), 6);
    assert_eq!(single, joined);
    assert_ne!(single, dataset.plan(6, 1).unwrap().rank(0).unwrap());
}

#[test]
fn test_corrupt_cached_shard_is_fetched_again() {
    let remote = TempDir::new().unwrap();
    let cache = TempDir::new().unwrap();

    let samples: Vec<Sample> = (0..20u64).map(|i| Sample::new().with("id", i)).collect();
    let options = WriterOptions {
        hashes: vec![HashAlgorithm::Xxh64],
        size_limit: Some(8 + 12 * 5),
        ..Default::default()
    };
    write_split(remote.path(), id_schema(), options, &samples);

    {
        let dataset = open(remote.path(), cache.path(), PlanConfig::default());
        assert_eq!(dataset.iterate(0, 1).unwrap().count(), 20);
    }

    // flip bytes inside a cached shard without changing its size
    let cached = cache.path().join("train/shard.00001.mds");
    let mut bytes = std::fs::read(&cached).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xff;
    std::fs::write(&cached, &bytes).unwrap();

    let dataset = open(remote.path(), cache.path(), PlanConfig::default());
    let ids: Vec<u64> = dataset
        .iterate(0, 1)
        .unwrap()
        .map(|s| id_of(&s.unwrap()))
        .collect();
    assert_eq!(ids, (0..20).collect::<Vec<u64>>());

    let stats = dataset.cache_stats();
    assert_eq!(stats.corrupt, 1);
    assert_eq!(stats.fetches, 1);
    assert_eq!(std::fs::read(&cached).unwrap().len(), bytes.len());
    assert_ne!(std::fs::read(&cached).unwrap(), bytes);
}

#[test]
fn test_locate_in_ten_thousand_samples() {
    let remote = TempDir::new().unwrap();
    let cache = TempDir::new().unwrap();

    // 8 byte samples plus a 4 byte offset each: 250 samples per shard
    let samples: Vec<Sample> = (0..10_000u64).map(|i| Sample::new().with("id", i)).collect();
    let options = WriterOptions {
        size_limit: Some(8 + 12 * 250),
        ..Default::default()
    };
    write_split(remote.path(), id_schema(), options, &samples);

    let dataset = open(remote.path(), cache.path(), PlanConfig::default());
    let manifest = dataset.manifest();
    assert_eq!(manifest.num_shards(), 40);
    assert_eq!(manifest.locate(7_500).unwrap(), (30, 0));
    assert_eq!(manifest.locate(7_499).unwrap(), (29, 249));
    assert_eq!(manifest.locate(9_999).unwrap(), (39, 249));
    assert!(manifest.locate(10_000).is_err());

    assert_eq!(id_of(&dataset.get(7_500).unwrap()), 7_500);
    assert_eq!(dataset.cache_stats().fetches, 1);
}

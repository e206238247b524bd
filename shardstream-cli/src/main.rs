// shardstream-cli/src/main.rs

//! Shardstream command line tool
//!
//! Inspects, verifies and plans datasets that were already written by
//! `ShardWriter`.
//!
//! # Usage
//!
//! ```bash
//! # Summarize the manifest of the train split
//! shardstream --root /data/numbers inspect
//!
//! # Fetch and verify every shard into a local cache
//! shardstream --root /data/numbers --cache-dir /tmp/cache verify
//!
//! # Show how epoch 3 is partitioned over 8 ranks in batches of 32
//! shardstream --config stream.toml plan --epoch 3 --world-size 8 --batch-size 32
//! ```

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use shardstream_core::dataset::remote_from_config;
use shardstream_core::{EpochPlan, Manifest, PlanConfig, StreamConfig, StreamingDataset};

/// Shardstream dataset tool
#[derive(Parser, Debug)]
#[command(name = "shardstream")]
#[command(about = "Inspect, verify and plan sharded streaming datasets")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Dataset root, overrides storage.base_path
    #[arg(short, long, global = true)]
    root: Option<PathBuf>,

    /// Split to operate on
    #[arg(short, long, global = true, default_value = "train")]
    split: String,

    /// Local shard cache directory, overrides cache.local_dir
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print a summary of the split's manifest
    Inspect {
        /// List every shard
        #[arg(long)]
        shards: bool,
    },
    /// Fetch, verify and cache every shard of the split
    Verify,
    /// Show the per-rank partition of one epoch
    Plan(PlanArgs),
}

#[derive(Args, Debug)]
struct PlanArgs {
    #[arg(long, default_value = "0")]
    epoch: u64,

    #[arg(short, long, default_value = "1")]
    world_size: usize,

    /// Batch size, overrides sampler.batch_size
    #[arg(short, long)]
    batch_size: Option<usize>,

    /// Shuffle seed, overrides sampler.seed
    #[arg(long)]
    seed: Option<u64>,

    /// Shuffle the global order
    #[arg(long, conflicts_with = "no_shuffle")]
    shuffle: bool,

    /// Keep the global order sequential
    #[arg(long)]
    no_shuffle: bool,

    /// Print the first N ids of every rank
    #[arg(long, default_value = "0")]
    show: usize,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = tracing_subscriber::filter::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::filter::EnvFilter::new(&cli.log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = load_config(&cli)?;

    match &cli.command {
        Command::Inspect { shards } => inspect(&config, &cli.split, *shards),
        Command::Verify => verify(&config, &cli.split),
        Command::Plan(args) => plan(&config, &cli.split, args),
    }
}

fn load_config(cli: &Cli) -> shardstream_core::Result<StreamConfig> {
    let mut config = match &cli.config {
        Some(path) => StreamConfig::from_file(path)?,
        None => StreamConfig::default(),
    }
    .with_env_overrides();

    if let Some(root) = &cli.root {
        config.storage.base_path = root.clone();
    }
    if let Some(dir) = &cli.cache_dir {
        config.cache.local_dir = dir.clone();
    }
    config.validate()?;
    Ok(config)
}

fn plan_config(config: &StreamConfig, args: &PlanArgs) -> PlanConfig {
    let mut plan = PlanConfig::from(&config.sampler);
    if args.shuffle {
        plan.shuffle = true;
    }
    if args.no_shuffle {
        plan.shuffle = false;
    }
    if let Some(seed) = args.seed {
        plan.seed = seed;
    }
    if args.batch_size.is_some() {
        plan.batch_size = args.batch_size;
    }
    plan
}

fn inspect(
    config: &StreamConfig,
    split: &str,
    list_shards: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let remote = remote_from_config(config)?;
    let manifest = Manifest::load(remote.as_ref(), split)?;

    println!("location:     {}", remote.location());
    println!("split:        {split}");
    println!("version:      {}", manifest.version());
    println!("samples:      {}", manifest.num_samples());
    println!("shards:       {}", manifest.num_shards());
    println!("compression:  {}", manifest.compression());
    let hashes: Vec<String> = manifest.hashes().iter().map(|h| h.to_string()).collect();
    println!(
        "hashes:       {}",
        if hashes.is_empty() {
            "(none)".to_string()
        } else {
            hashes.join(", ")
        }
    );
    match manifest.size_limit() {
        Some(limit) => println!("size limit:   {limit} bytes"),
        None => println!("size limit:   (none)"),
    }
    if let Some((shard, bytes)) = manifest
        .shards()
        .iter()
        .map(|d| (d.index, d.raw.bytes))
        .max_by_key(|(_, bytes)| *bytes) {
        println!("largest:      shard {shard}, {bytes} bytes raw");
    }

    println!("columns:");
    for column in manifest.schema().columns() {
        println!("  {:<20} {:?}", column.name, column.ty);
    }

    if list_shards {
        println!("{:>7} {:>10} {:>12} {:>12}  file", "shard", "samples", "raw", "remote");
        for shard in manifest.shards() {
            let remote_file = shard.remote_file();
            println!(
                "{:>7} {:>10} {:>12} {:>12}  {}",
                shard.index, shard.samples, shard.raw.bytes, remote_file.bytes, remote_file.basename
            );
        }
    }
    Ok(())
}

fn verify(config: &StreamConfig, split: &str) -> Result<(), Box<dyn std::error::Error>> {
    let dataset = StreamingDataset::from_config(config, split)?;
    let shards = dataset.manifest().num_shards();
    tracing::info!(split, shards, "Verifying shards");

    let mut failed = 0usize;
    for shard in 0..shards {
        match dataset.cache().acquire(shard) {
            Ok(handle) => {
                tracing::debug!(shard, samples = handle.num_samples(), "Shard verified");
            }
            Err(e) => {
                failed += 1;
                tracing::error!(shard, error = %e, "Shard failed verification");
            }
        }
    }

    let stats = dataset.cache_stats();
    println!(
        "verified {} of {} shards ({} fetched, {} corrupt local copies replaced)",
        shards - failed,
        shards,
        stats.fetches,
        stats.corrupt
    );

    if failed > 0 {
        return Err(format!("{failed} shard(s) failed verification").into());
    }
    Ok(())
}

fn plan(
    config: &StreamConfig,
    split: &str,
    args: &PlanArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    let remote = remote_from_config(config)?;
    let manifest = Manifest::load(remote.as_ref(), split)?;
    let plan_config = plan_config(config, args);
    let plan = EpochPlan::new(
        manifest.num_samples(),
        args.epoch,
        args.world_size,
        &plan_config,
    )?;

    println!("samples:          {}", plan.total_samples());
    println!("epoch:            {}", plan.epoch());
    println!("world size:       {}", plan.world_size());
    println!("shuffle:          {} (seed {})", plan_config.shuffle, plan_config.seed);
    match plan.batch_size() {
        Some(batch) => {
            println!("batch size:       {batch}");
            println!("batches per rank: {}", plan.batches_per_rank());
        }
        None => println!("batch size:       (none)"),
    }
    println!("samples per rank: {}", plan.samples_per_rank());
    println!("padding:          {}", plan.padding());

    for rank in 0..plan.world_size() {
        let ids = plan.rank(rank)?;
        if args.show > 0 {
            let head: Vec<String> = ids.iter().take(args.show).map(u64::to_string).collect();
            println!("rank {rank:>4}: {:>8} ids  [{}]", ids.len(), head.join(", "));
        } else {
            println!("rank {rank:>4}: {:>8} ids", ids.len());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_inspect_defaults() {
        let cli = Cli::try_parse_from(["shardstream", "inspect"]).unwrap();
        assert_eq!(cli.split, "train");
        assert_eq!(cli.log_level, "info");
        assert!(cli.config.is_none());
        assert!(matches!(cli.command, Command::Inspect { shards: false }));
    }

    #[test]
    fn test_parse_global_options_after_subcommand() {
        let cli = Cli::try_parse_from([
            "shardstream",
            "verify",
            "--root",
            "/data/numbers",
            "--split",
            "val",
            "--cache-dir",
            "/tmp/cache",
        ])
        .unwrap();
        assert!(matches!(cli.command, Command::Verify));
        assert_eq!(cli.root, Some(PathBuf::from("/data/numbers")));
        assert_eq!(cli.split, "val");
        assert_eq!(cli.cache_dir, Some(PathBuf::from("/tmp/cache")));
    }

    #[test]
    fn test_parse_plan() {
        let cli = Cli::try_parse_from([
            "shardstream",
            "plan",
            "--epoch",
            "3",
            "-w",
            "8",
            "-b",
            "32",
            "--shuffle",
        ])
        .unwrap();
        let Command::Plan(args) = cli.command else {
            panic!("expected plan");
        };
        assert_eq!(args.epoch, 3);
        assert_eq!(args.world_size, 8);
        assert_eq!(args.batch_size, Some(32));
        assert!(args.shuffle);
        assert!(!args.no_shuffle);
    }

    #[test]
    fn test_shuffle_flags_conflict() {
        let result = Cli::try_parse_from(["shardstream", "plan", "--shuffle", "--no-shuffle"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_plan_overrides_config() {
        let mut config = StreamConfig::default();
        config.sampler.shuffle = true;
        config.sampler.batch_size = Some(4);

        let cli = Cli::try_parse_from(["shardstream", "plan", "--no-shuffle", "--seed", "7"]).unwrap();
        let Command::Plan(args) = cli.command else {
            panic!("expected plan");
        };
        let plan = plan_config(&config, &args);
        assert!(!plan.shuffle);
        assert_eq!(plan.seed, 7);
        assert_eq!(plan.batch_size, Some(4));
    }

    #[test]
    fn test_load_config_applies_overrides() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("stream.toml");
        std::fs::write(
            &path,
            "[storage]\nbase_path = \"/from/file\"\n\n[cache]\nlocal_dir = \"/cache/file\"\n",
        )
        .unwrap();

        let cli = Cli::try_parse_from([
            "shardstream",
            "--config",
            path.to_str().unwrap(),
            "--root",
            "/from/cli",
            "inspect",
        ])
        .unwrap();
        let config = load_config(&cli).unwrap();
        assert_eq!(config.storage.base_path, PathBuf::from("/from/cli"));
        assert_eq!(config.cache.local_dir, PathBuf::from("/cache/file"));
    }
}

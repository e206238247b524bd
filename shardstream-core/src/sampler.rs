// shardstream-core/src/sampler.rs

//! Deterministic epoch partitioning.
//!
//! An `EpochPlan` fixes, for one epoch, the global sample order and which
//! ids every rank produces. The order depends only on `(seed, epoch)`, so
//! any number of processes computing the same plan agree on it.

use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::config::SamplerConfig;
use crate::error::{Result, StreamError};

/// Default shuffle seed.
pub const DEFAULT_SEED: u64 = 9176;

/// Ordering and batching settings for a plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanConfig {
    pub shuffle: bool,
    pub seed: u64,
    /// When set, ranks receive whole batches and only the final batch of
    /// the epoch may be partial.
    pub batch_size: Option<usize>,
}

impl Default for PlanConfig {
    fn default() -> Self {
        Self {
            shuffle: false,
            seed: DEFAULT_SEED,
            batch_size: None,
        }
    }
}

impl From<&SamplerConfig> for PlanConfig {
    fn from(config: &SamplerConfig) -> Self {
        Self {
            shuffle: config.shuffle,
            seed: config.seed,
            batch_size: config.batch_size,
        }
    }
}

/// Global sample order for `(seed, epoch)`.
///
/// Identity when `shuffle` is off; otherwise a Fisher-Yates shuffle driven
/// by a ChaCha8 generator seeded from `seed` and `epoch`.
pub fn global_order(total: u64, shuffle: bool, seed: u64, epoch: u64) -> Vec<u64> {
    let mut order: Vec<u64> = (0..total).collect();
    if shuffle {
        let mut rng = ChaCha8Rng::seed_from_u64(mix_seed(seed, epoch));
        order.shuffle(&mut rng);
    }
    order
}

// splitmix64 finalizer over the pair
fn mix_seed(seed: u64, epoch: u64) -> u64 {
    let mut z = seed ^ epoch.wrapping_add(1).wrapping_mul(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Assignment of global ids to ranks for one epoch.
///
/// Without a batch size, every rank gets a contiguous slice of
/// `ceil(total / world_size)` ids and the order is padded by repeating ids
/// from its start.
///
/// With batch size `B`, the order is cut into batches of `B`. If the batch
/// count is not a multiple of `world_size`, full batches of repeated ids
/// (taken cyclically from the start of the order) are inserted before the
/// trailing partial batch. Batch `k` goes to rank `k % world_size`, so every
/// rank gets the same number of batches and only the last batch, on the
/// last rank, can be short.
#[derive(Debug, Clone)]
pub struct EpochPlan {
    epoch: u64,
    world_size: usize,
    batch_size: Option<usize>,
    total: u64,
    /// Global order followed by any repeated ids.
    assigned: Vec<u64>,
    padding: usize,
}

impl EpochPlan {
    /// Builds the plan for `epoch` over `total` samples.
    ///
    /// # Errors
    ///
    /// Returns a config error if `world_size` or the batch size is zero.
    pub fn new(total: u64, epoch: u64, world_size: usize, config: &PlanConfig) -> Result<Self> {
        if world_size == 0 {
            return Err(StreamError::config("world_size must be greater than 0"));
        }
        if config.batch_size == Some(0) {
            return Err(StreamError::config("batch_size must be greater than 0"));
        }

        let order = global_order(total, config.shuffle, config.seed, epoch);
        let (assigned, padding) = match config.batch_size {
            None => pad_for_slices(order, world_size),
            Some(batch) => pad_for_batches(order, world_size, batch),
        };

        Ok(Self {
            epoch,
            world_size,
            batch_size: config.batch_size,
            total,
            assigned,
            padding,
        })
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    pub fn batch_size(&self) -> Option<usize> {
        self.batch_size
    }

    /// Distinct samples in the split.
    pub fn total_samples(&self) -> u64 {
        self.total
    }

    /// Number of repeated ids added to even out the ranks.
    pub fn padding(&self) -> usize {
        self.padding
    }

    /// Ids handed out across all ranks, repeats included.
    pub fn total_assigned(&self) -> usize {
        self.assigned.len()
    }

    /// Ids per rank. With a batch size this is the count for a rank whose
    /// batches are all full; the last rank may get fewer.
    pub fn samples_per_rank(&self) -> usize {
        match self.batch_size {
            None => self.assigned.len() / self.world_size,
            Some(batch) => self.batches_per_rank() * batch,
        }
    }

    /// Batches per rank, zero without a batch size.
    pub fn batches_per_rank(&self) -> usize {
        match self.batch_size {
            None => 0,
            Some(batch) => self.assigned.len().div_ceil(batch) / self.world_size,
        }
    }

    /// Ordered global ids for `rank`.
    ///
    /// # Errors
    ///
    /// Returns a config error if `rank >= world_size`.
    pub fn rank(&self, rank: usize) -> Result<Vec<u64>> {
        if rank >= self.world_size {
            return Err(StreamError::config(format!(
                "rank {rank} out of range for world size {}",
                self.world_size
            )));
        }

        match self.batch_size {
            None => {
                let per_rank = self.samples_per_rank();
                Ok(self.assigned[rank * per_rank..(rank + 1) * per_rank].to_vec())
            }
            Some(batch) => Ok(self
                .assigned
                .chunks(batch)
                .skip(rank)
                .step_by(self.world_size)
                .flatten()
                .copied()
                .collect()),
        }
    }
}

fn pad_for_slices(mut order: Vec<u64>, world_size: usize) -> (Vec<u64>, usize) {
    let total = order.len();
    let padded = total.div_ceil(world_size) * world_size;
    let padding = padded - total;
    let repeats: Vec<u64> = (0..padding).map(|i| order[i % total]).collect();
    order.extend(repeats);
    (order, padding)
}

fn pad_for_batches(order: Vec<u64>, world_size: usize, batch: usize) -> (Vec<u64>, usize) {
    let total = order.len();
    let full = total / batch;
    let tail = total % batch;
    let batches = full + usize::from(tail > 0);
    let extra_batches = batches.div_ceil(world_size) * world_size - batches;
    let padding = extra_batches * batch;

    let mut assigned = Vec::with_capacity(total + padding);
    assigned.extend_from_slice(&order[..full * batch]);
    assigned.extend((0..padding).map(|i| order[i % total]));
    assigned.extend_from_slice(&order[full * batch..]);
    (assigned, padding)
}

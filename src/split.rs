//! Stratified three-way splitting of a shard's records.
//!
//! A shard is first split into train and holdout, then the holdout is split into validation and
//! test. Both stages sample each label class separately so label frequencies carry over into
//! every partition.

use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};

use log::{debug, warn};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rustc_hash::FxHasher;
use serde::{Deserialize, Serialize};

use crate::config::{SmallClassPolicy, SplitConfig};
use crate::error::{PrepError, Result};

/// One of the three output partitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Partition {
    /// Training data.
    Train,
    /// Validation data.
    Validation,
    /// Held-out test data.
    Test,
}

impl Partition {
    /// All partitions in output order.
    pub const ALL: [Partition; 3] = [Partition::Train, Partition::Validation, Partition::Test];

    /// Directory name of the partition.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Train => "train",
            Self::Validation => "validation",
            Self::Test => "test",
        }
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Disjoint train/validation/test collections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partitions<T> {
    /// Training records.
    pub train: Vec<T>,
    /// Validation records.
    pub validation: Vec<T>,
    /// Test records.
    pub test: Vec<T>,
}

impl<T> Default for Partitions<T> {
    fn default() -> Self {
        Self {
            train: Vec::new(),
            validation: Vec::new(),
            test: Vec::new(),
        }
    }
}

impl<T> Partitions<T> {
    /// Records assigned to `partition`.
    #[must_use]
    pub fn get(&self, partition: Partition) -> &[T] {
        match partition {
            Partition::Train => &self.train,
            Partition::Validation => &self.validation,
            Partition::Test => &self.test,
        }
    }

    /// Total number of records across partitions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.train.len() + self.validation.len() + self.test.len()
    }

    /// Returns `true` when every partition is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Record counts per partition.
    #[must_use]
    pub fn counts(&self) -> SplitCounts {
        SplitCounts {
            train: self.train.len(),
            validation: self.validation.len(),
            test: self.test.len(),
        }
    }
}

/// Record counts per partition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitCounts {
    /// Training records.
    pub train: usize,
    /// Validation records.
    pub validation: usize,
    /// Test records.
    pub test: usize,
}

/// Creates the RNG used to split one shard.
///
/// With a seed, the RNG depends only on the seed and the shard key, so a shard splits the same way
/// no matter which worker picks it up or in which order shards complete.
#[must_use]
pub fn shard_rng(seed: Option<u64>, shard_key: &str) -> StdRng {
    match seed {
        Some(seed) => {
            let mut hasher = FxHasher::default();
            shard_key.hash(&mut hasher);
            StdRng::seed_from_u64(seed ^ hasher.finish())
        }
        None => StdRng::from_entropy(),
    }
}

/// Two-stage stratified splitter.
#[derive(Debug, Clone)]
pub struct StratifiedSplitter {
    cfg: SplitConfig,
}

impl StratifiedSplitter {
    /// Creates a splitter for the supplied configuration.
    #[must_use]
    pub fn new(cfg: SplitConfig) -> Self {
        Self { cfg }
    }

    /// Returns an immutable reference to the underlying configuration.
    #[must_use]
    pub fn config(&self) -> &SplitConfig {
        &self.cfg
    }

    /// Splits `records` into train, validation, and test, stratifying on `label_of`.
    pub fn split<T, F, R>(&self, records: Vec<T>, label_of: F, rng: &mut R) -> Result<Partitions<T>>
    where
        F: Fn(&T) -> i64,
        R: Rng + ?Sized,
    {
        if records.is_empty() {
            return Ok(Partitions::default());
        }
        let (train, holdout) =
            self.split_stage(records, self.cfg.holdout_fraction, &label_of, rng)?;
        let (validation, test) =
            self.split_stage(holdout, self.cfg.test_fraction, &label_of, rng)?;
        debug!(
            "split into train={} validation={} test={}",
            train.len(),
            validation.len(),
            test.len()
        );
        Ok(Partitions {
            train,
            validation,
            test,
        })
    }

    /// Splits off `fraction` of `records`, returning `(kept, split_off)`.
    fn split_stage<T, F, R>(
        &self,
        records: Vec<T>,
        fraction: f64,
        label_of: &F,
        rng: &mut R,
    ) -> Result<(Vec<T>, Vec<T>)>
    where
        F: Fn(&T) -> i64,
        R: Rng + ?Sized,
    {
        if records.is_empty() {
            return Ok((Vec::new(), Vec::new()));
        }
        let labels: Vec<i64> = records.iter().map(label_of).collect();
        let selected = match stratified_selection(&labels, fraction, rng) {
            Ok(selected) => selected,
            Err(reason) => match self.cfg.small_class_policy {
                SmallClassPolicy::Error => return Err(PrepError::Stratification(reason)),
                SmallClassPolicy::Unstratified => {
                    warn!("{reason}; falling back to an unstratified split");
                    random_selection(labels.len(), fraction, rng)
                }
            },
        };

        let mut kept = Vec::with_capacity(records.len());
        let mut split_off = Vec::new();
        for (record, take) in records.into_iter().zip(selected) {
            if take {
                split_off.push(record);
            } else {
                kept.push(record);
            }
        }
        kept.shuffle(rng);
        split_off.shuffle(rng);
        Ok((kept, split_off))
    }
}

/// Number of records split off from `total` at `fraction`, rounded up.
#[must_use]
pub fn split_off_size(total: usize, fraction: f64) -> usize {
    // Guard against products like 0.07 * 100 = 7.000000000000001 rounding up a whole record.
    let exact = (fraction * total as f64 - 1e-9).ceil();
    (exact.max(0.0) as usize).min(total)
}

fn stratified_selection<R: Rng + ?Sized>(
    labels: &[i64],
    fraction: f64,
    rng: &mut R,
) -> std::result::Result<Vec<bool>, String> {
    let total = labels.len();
    let n_split = split_off_size(total, fraction);
    let n_kept = total - n_split;

    let mut classes: BTreeMap<i64, Vec<usize>> = BTreeMap::new();
    for (idx, &label) in labels.iter().enumerate() {
        classes.entry(label).or_default().push(idx);
    }
    if let Some((label, members)) = classes.iter().find(|(_, members)| members.len() < 2) {
        return Err(format!(
            "label {label} has only {} member(s); every class needs at least 2",
            members.len()
        ));
    }
    let n_classes = classes.len();
    if n_split < n_classes || n_kept < n_classes {
        return Err(format!(
            "cannot place {n_classes} classes into subsets of {n_kept} and {n_split} records"
        ));
    }

    // Largest-remainder allocation of the split-off quota across classes.
    let capacities: Vec<usize> = classes.values().map(Vec::len).collect();
    let mut quotas = Vec::with_capacity(n_classes);
    let mut remainders = Vec::with_capacity(n_classes);
    for members in classes.values() {
        let exact = members.len() as f64 * n_split as f64 / total as f64;
        let base = exact.floor() as usize;
        quotas.push(base);
        remainders.push(exact - base as f64);
    }
    let mut leftover = n_split.saturating_sub(quotas.iter().sum());
    let mut order: Vec<usize> = (0..n_classes).collect();
    order.shuffle(rng);
    order.sort_by(|&a, &b| remainders[b].total_cmp(&remainders[a]));
    for &class in order.iter().cycle() {
        if leftover == 0 {
            break;
        }
        if quotas[class] < capacities[class] {
            quotas[class] += 1;
            leftover -= 1;
        }
    }

    let mut selected = vec![false; total];
    for (members, &quota) in classes.into_values().zip(&quotas) {
        let mut members = members;
        members.shuffle(rng);
        for &idx in members.iter().take(quota) {
            selected[idx] = true;
        }
    }
    Ok(selected)
}

fn random_selection<R: Rng + ?Sized>(total: usize, fraction: f64, rng: &mut R) -> Vec<bool> {
    let n_split = split_off_size(total, fraction);
    let mut indices: Vec<usize> = (0..total).collect();
    indices.shuffle(rng);
    let mut selected = vec![false; total];
    for &idx in indices.iter().take(n_split) {
        selected[idx] = true;
    }
    selected
}

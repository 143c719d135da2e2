//! Configuration builders controlling splitting, encoding, and shard fan-out.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::info;
use serde::{Deserialize, Serialize};

use crate::error::{PrepError, Result};

/// Default location of the processing-job resource configuration.
pub const DEFAULT_RESOURCE_CONFIG: &str = "/opt/ml/config/resourceconfig.json";
/// Host name used when no resource configuration is available.
pub const UNKNOWN_HOST: &str = "unknown";
/// Default glob selecting compressed shards inside the input directory.
pub const DEFAULT_SHARD_PATTERN: &str = "*.tsv.gz";
/// Default encoded sequence length.
pub const DEFAULT_MAX_SEQ_LENGTH: usize = 128;

/// What to do when a shard's label distribution cannot be stratified into every partition.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SmallClassPolicy {
    /// Fail the shard.
    #[default]
    Error,
    /// Fall back to a plain shuffled split with the same partition sizes.
    Unstratified,
}

/// Parameters of the two-stage stratified split.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SplitConfig {
    /// Fraction of a shard held out from training.
    pub holdout_fraction: f64,
    /// Fraction of the holdout assigned to the test partition; the rest is validation.
    pub test_fraction: f64,
    /// Base seed; `None` draws fresh entropy for every shard.
    pub seed: Option<u64>,
    /// Behaviour for label classes too small to stratify.
    pub small_class_policy: SmallClassPolicy,
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self {
            holdout_fraction: 0.10,
            test_fraction: 0.50,
            seed: None,
            small_class_policy: SmallClassPolicy::Error,
        }
    }
}

impl SplitConfig {
    /// Validates the split fractions.
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("holdout_fraction", self.holdout_fraction),
            ("test_fraction", self.test_fraction),
        ] {
            if !(value > 0.0 && value < 1.0) {
                return Err(PrepError::InvalidConfig(format!(
                    "{name} must lie strictly between 0 and 1 (got {value})"
                )));
            }
        }
        Ok(())
    }
}

/// Parameters of the feature encoder.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EncoderConfig {
    /// Exact length of every encoded sequence, special tokens included.
    pub max_seq_length: usize,
    /// Closed, ordered label set; a label's position is its class index.
    pub label_values: Vec<i64>,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            max_seq_length: DEFAULT_MAX_SEQ_LENGTH,
            label_values: vec![1, 2, 3, 4, 5],
        }
    }
}

impl EncoderConfig {
    /// Validates sequence length and label set.
    pub fn validate(&self) -> Result<()> {
        if self.max_seq_length < 2 {
            return Err(PrepError::InvalidConfig(format!(
                "max_seq_length ({}) must leave room for the [CLS] and [SEP] markers",
                self.max_seq_length
            )));
        }
        if self.label_values.is_empty() {
            return Err(PrepError::InvalidConfig(
                "label_values must not be empty".into(),
            ));
        }
        let mut sorted = self.label_values.clone();
        sorted.sort_unstable();
        sorted.dedup();
        if sorted.len() != self.label_values.len() {
            return Err(PrepError::InvalidConfig(format!(
                "label_values contains duplicates: {:?}",
                self.label_values
            )));
        }
        Ok(())
    }
}

/// Controls how shard rows are read.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ShardConfig {
    /// Header name of the free-text column.
    pub text_column: String,
    /// Header name of the ordinal label column.
    pub label_column: String,
    /// Drops exact `(text, label)` duplicates, keeping the first occurrence.
    pub drop_duplicates: bool,
}

impl Default for ShardConfig {
    fn default() -> Self {
        Self {
            text_column: "review_body".into(),
            label_column: "star_rating".into(),
            drop_duplicates: false,
        }
    }
}

/// Full configuration of a preparation run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineConfig {
    /// Directory holding the input shards.
    pub input_dir: PathBuf,
    /// Root receiving the `train`, `validation`, and `test` directories.
    pub output_root: PathBuf,
    /// Glob matched against file names in `input_dir`.
    pub pattern: String,
    /// Identifier of this host, embedded in every output file name.
    pub current_host: String,
    /// Worker pool size; `None` uses the available cores.
    pub workers: Option<usize>,
    /// Upper bound on a single shard job.
    pub job_timeout: Option<Duration>,
    /// Split parameters.
    pub split: SplitConfig,
    /// Encoder parameters.
    pub encoder: EncoderConfig,
    /// Shard reading parameters.
    pub shard: ShardConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            input_dir: PathBuf::from("/opt/ml/processing/input/data"),
            output_root: PathBuf::from("/opt/ml/processing/output/bert"),
            pattern: DEFAULT_SHARD_PATTERN.into(),
            current_host: UNKNOWN_HOST.into(),
            workers: None,
            job_timeout: None,
            split: SplitConfig::default(),
            encoder: EncoderConfig::default(),
            shard: ShardConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Returns a builder initialised with [`PipelineConfig::default`].
    #[must_use]
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::default()
    }

    /// Validates the invariants required for a run.
    pub fn validate(&self) -> Result<()> {
        self.split.validate()?;
        self.encoder.validate()?;
        glob::Pattern::new(&self.pattern).map_err(|err| {
            PrepError::InvalidConfig(format!("invalid shard pattern {:?}: {err}", self.pattern))
        })?;
        if self.current_host.is_empty() || self.current_host.contains(['/', '\\']) {
            return Err(PrepError::InvalidConfig(format!(
                "current_host {:?} cannot be used in a file name",
                self.current_host
            )));
        }
        if self.workers == Some(0) {
            return Err(PrepError::InvalidConfig(
                "workers must be greater than zero".into(),
            ));
        }
        if self.job_timeout == Some(Duration::ZERO) {
            return Err(PrepError::InvalidConfig(
                "job_timeout must be greater than zero".into(),
            ));
        }
        if self.shard.text_column.is_empty() || self.shard.label_column.is_empty() {
            return Err(PrepError::InvalidConfig(
                "text and label column names must not be empty".into(),
            ));
        }
        if self.shard.text_column == self.shard.label_column {
            return Err(PrepError::InvalidConfig(format!(
                "text and label columns must differ (both {:?})",
                self.shard.text_column
            )));
        }
        Ok(())
    }

    /// Number of workers the orchestrator will spawn.
    #[must_use]
    pub fn effective_workers(&self) -> usize {
        self.workers.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }
}

/// Builder for [`PipelineConfig`].
#[derive(Debug, Default, Clone)]
pub struct PipelineBuilder {
    cfg: PipelineConfig,
}

impl PipelineBuilder {
    /// Creates a builder with [`PipelineConfig::default`] settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the directory scanned for shards.
    #[must_use]
    pub fn input_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cfg.input_dir = dir.into();
        self
    }

    /// Sets the output root.
    #[must_use]
    pub fn output_root(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cfg.output_root = dir.into();
        self
    }

    /// Overrides the shard glob.
    #[must_use]
    pub fn pattern(mut self, pattern: impl Into<String>) -> Self {
        self.cfg.pattern = pattern.into();
        self
    }

    /// Sets the host identifier used in output names.
    #[must_use]
    pub fn current_host(mut self, host: impl Into<String>) -> Self {
        self.cfg.current_host = host.into();
        self
    }

    /// Limits the worker pool; `None` uses every available core.
    #[must_use]
    pub fn workers(mut self, workers: Option<usize>) -> Self {
        self.cfg.workers = workers;
        self
    }

    /// Bounds each shard job.
    #[must_use]
    pub fn job_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.cfg.job_timeout = timeout;
        self
    }

    /// Sets the holdout and test fractions.
    #[must_use]
    pub fn fractions(mut self, holdout: f64, test: f64) -> Self {
        self.cfg.split.holdout_fraction = holdout;
        self.cfg.split.test_fraction = test;
        self
    }

    /// Fixes the split seed for reproducible partitions.
    #[must_use]
    pub fn seed(mut self, seed: Option<u64>) -> Self {
        self.cfg.split.seed = seed;
        self
    }

    /// Sets the small-class policy.
    #[must_use]
    pub fn small_class_policy(mut self, policy: SmallClassPolicy) -> Self {
        self.cfg.split.small_class_policy = policy;
        self
    }

    /// Sets the encoded sequence length.
    #[must_use]
    pub fn max_seq_length(mut self, value: usize) -> Self {
        self.cfg.encoder.max_seq_length = value;
        self
    }

    /// Overrides the closed label set.
    #[must_use]
    pub fn label_values<I>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = i64>,
    {
        self.cfg.encoder.label_values = labels.into_iter().collect();
        self
    }

    /// Overrides the text and label column names.
    #[must_use]
    pub fn columns(mut self, text: impl Into<String>, label: impl Into<String>) -> Self {
        self.cfg.shard.text_column = text.into();
        self.cfg.shard.label_column = label.into();
        self
    }

    /// Enables exact duplicate removal before splitting.
    #[must_use]
    pub fn drop_duplicates(mut self, enabled: bool) -> Self {
        self.cfg.shard.drop_duplicates = enabled;
        self
    }

    /// Finalises the builder, returning a validated [`PipelineConfig`].
    pub fn build(self) -> Result<PipelineConfig> {
        self.cfg.validate()?;
        Ok(self.cfg)
    }
}

/// Host topology of a processing job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceConfig {
    /// All hosts participating in the job.
    #[serde(default = "default_hosts")]
    pub hosts: Vec<String>,
    /// The host running this process.
    #[serde(default = "default_host")]
    pub current_host: String,
}

fn default_hosts() -> Vec<String> {
    vec![UNKNOWN_HOST.to_string()]
}

fn default_host() -> String {
    UNKNOWN_HOST.to_string()
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            hosts: default_hosts(),
            current_host: default_host(),
        }
    }
}

impl ResourceConfig {
    /// Reads the resource configuration, falling back to the single unknown host when the file
    /// does not exist. A file that exists but cannot be parsed is an error.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(raw) => Ok(serde_json::from_str(&raw)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                info!("{} not found; current_host is unknown", path.display());
                Ok(Self::default())
            }
            Err(err) => Err(PrepError::io(err, Some(path.to_path_buf()))),
        }
    }
}

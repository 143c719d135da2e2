//! Run manifest: the per-shard outcome of a preparation run.

use std::fmt;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PrepError, Result};
use crate::shard::ShardReport;
use crate::split::SplitCounts;

/// Lifecycle of a run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Nothing has happened yet.
    Idle,
    /// Scanning the input directory.
    Discovering,
    /// Submitting shard jobs to the pool.
    Dispatching,
    /// Waiting for every job to finish or time out.
    AwaitingCompletion,
    /// Every shard succeeded.
    Complete,
    /// At least one shard failed or timed out.
    Failed,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Discovering => "discovering",
            Self::Dispatching => "dispatching",
            Self::AwaitingCompletion => "awaiting_completion",
            Self::Complete => "complete",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Outcome of one shard.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ShardStatus {
    /// All three files were written.
    Succeeded {
        /// Records per partition.
        counts: SplitCounts,
        /// Rows dropped for missing fields.
        dropped: usize,
        /// Rows dropped as duplicates.
        duplicates: usize,
        /// Processing time in seconds.
        elapsed_secs: f64,
    },
    /// The transformer returned an error or panicked.
    Failed {
        /// Rendered error.
        error: String,
    },
    /// The job outlived the per-job timeout and was abandoned.
    TimedOut {
        /// Configured limit in seconds.
        limit_secs: f64,
    },
}

/// Manifest line for one discovered shard.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ShardEntry {
    /// Shard key, or the file name when no key could be derived.
    pub shard: String,
    /// Input file.
    pub source: PathBuf,
    /// Outcome.
    #[serde(flatten)]
    pub status: ShardStatus,
}

impl ShardEntry {
    /// Entry of a successful shard.
    #[must_use]
    pub fn succeeded(report: &ShardReport) -> Self {
        Self {
            shard: report.shard.clone(),
            source: report.source.clone(),
            status: ShardStatus::Succeeded {
                counts: report.counts,
                dropped: report.dropped,
                duplicates: report.duplicates,
                elapsed_secs: report.elapsed.as_secs_f64(),
            },
        }
    }

    /// Entry of a shard whose job returned an error.
    #[must_use]
    pub fn failed(shard: impl Into<String>, source: &Path, error: &PrepError) -> Self {
        Self {
            shard: shard.into(),
            source: source.to_path_buf(),
            status: ShardStatus::Failed {
                error: error.to_string(),
            },
        }
    }

    /// Entry of an abandoned shard.
    #[must_use]
    pub fn timed_out(shard: impl Into<String>, source: &Path, limit: Duration) -> Self {
        Self {
            shard: shard.into(),
            source: source.to_path_buf(),
            status: ShardStatus::TimedOut {
                limit_secs: limit.as_secs_f64(),
            },
        }
    }

    /// Returns `true` when the shard produced its outputs.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self.status, ShardStatus::Succeeded { .. })
    }
}

/// Run-level aggregates.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunTotals {
    /// Discovered shards.
    pub shards: usize,
    /// Shards that succeeded.
    pub succeeded: usize,
    /// Shards that failed.
    pub failed: usize,
    /// Shards abandoned after the timeout.
    pub timed_out: usize,
    /// Records written per partition across successful shards.
    pub records: SplitCounts,
    /// Rows dropped for missing fields across successful shards.
    pub dropped: usize,
}

/// Persistent record of a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Manifest {
    /// Host that ran the job.
    pub host: String,
    /// Final state.
    pub state: RunState,
    /// Worker pool size.
    pub workers: usize,
    /// Per-job limit in seconds, if any.
    pub job_timeout_secs: Option<f64>,
    /// Wall-clock duration of the run in seconds.
    pub elapsed_secs: f64,
    /// Resident set size sampled at the end of the run (Linux only).
    pub rss_kb: Option<usize>,
    /// Aggregates over `shards`.
    pub totals: RunTotals,
    /// One entry per discovered shard, ordered by source path.
    pub shards: Vec<ShardEntry>,
}

impl Manifest {
    /// Creates an empty manifest in the `Idle` state.
    #[must_use]
    pub fn new(host: impl Into<String>, workers: usize, job_timeout: Option<Duration>) -> Self {
        Self {
            host: host.into(),
            state: RunState::Idle,
            workers,
            job_timeout_secs: job_timeout.map(|limit| limit.as_secs_f64()),
            elapsed_secs: 0.0,
            rss_kb: None,
            totals: RunTotals::default(),
            shards: Vec::new(),
        }
    }

    /// Location of the manifest for `host` under `output_root`.
    #[must_use]
    pub fn path_for(output_root: &Path, host: &str) -> PathBuf {
        output_root.join(format!("manifest-{host}.json"))
    }

    /// Appends an entry and updates the totals.
    pub fn record(&mut self, entry: ShardEntry) {
        self.totals.shards += 1;
        match &entry.status {
            ShardStatus::Succeeded {
                counts, dropped, ..
            } => {
                self.totals.succeeded += 1;
                self.totals.records.train += counts.train;
                self.totals.records.validation += counts.validation;
                self.totals.records.test += counts.test;
                self.totals.dropped += dropped;
            }
            ShardStatus::Failed { .. } => self.totals.failed += 1,
            ShardStatus::TimedOut { .. } => self.totals.timed_out += 1,
        }
        self.shards.push(entry);
    }

    /// Closes the manifest: sorts entries, derives the final state, and samples memory use.
    pub fn finish(&mut self, elapsed: Duration) {
        self.shards.sort_by(|a, b| a.source.cmp(&b.source));
        self.state = if self.totals.succeeded == self.totals.shards {
            RunState::Complete
        } else {
            RunState::Failed
        };
        self.elapsed_secs = elapsed.as_secs_f64();
        self.rss_kb = sample_rss_kb();
    }

    /// Writes the manifest as pretty JSON under `output_root`, returning its path.
    pub fn write(&self, output_root: &Path) -> Result<PathBuf> {
        fs::create_dir_all(output_root)
            .map_err(|err| PrepError::io(err, Some(output_root.to_path_buf())))?;
        let path = Self::path_for(output_root, &self.host);
        let tmp = path.with_extension("json.tmp");
        let file = File::create(&tmp).map_err(|err| PrepError::io(err, Some(tmp.clone())))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, self)?;
        writer
            .flush()
            .map_err(|err| PrepError::io(err, Some(tmp.clone())))?;
        drop(writer);
        fs::rename(&tmp, &path).map_err(|err| PrepError::io(err, Some(path.clone())))?;
        Ok(path)
    }

    /// Reads a manifest written by [`Manifest::write`].
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|err| PrepError::io(err, Some(path.to_path_buf())))?;
        Ok(serde_json::from_str(&raw)?)
    }
}

#[cfg(target_os = "linux")]
fn current_rss_kb() -> Option<usize> {
    use std::io::{BufRead, BufReader};

    let file = File::open("/proc/self/status").ok()?;
    for line in BufReader::new(file).lines().map_while(std::io::Result::ok) {
        if let Some(rest) = line.strip_prefix("VmRSS:") {
            return rest
                .split_whitespace()
                .find_map(|part| part.parse::<usize>().ok());
        }
    }
    None
}

#[cfg(not(target_os = "linux"))]
fn current_rss_kb() -> Option<usize> {
    None
}

/// Samples the current resident set size (RSS) on supported platforms.
pub fn sample_rss_kb() -> Option<usize> {
    current_rss_kb()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn report(shard: &str) -> ShardReport {
        ShardReport {
            shard: shard.to_string(),
            source: PathBuf::from(format!("/in/{shard}.tsv.gz")),
            counts: SplitCounts {
                train: 90,
                validation: 5,
                test: 5,
            },
            dropped: 3,
            duplicates: 0,
            outputs: Vec::new(),
            elapsed: Duration::from_millis(250),
        }
    }

    #[test]
    fn totals_follow_recorded_entries() {
        let mut manifest = Manifest::new("algo-1", 4, Some(Duration::from_secs(60)));
        manifest.record(ShardEntry::succeeded(&report("b")));
        manifest.record(ShardEntry::succeeded(&report("a")));
        manifest.finish(Duration::from_secs(1));
        assert_eq!(manifest.state, RunState::Complete);
        assert_eq!(manifest.totals.succeeded, 2);
        assert_eq!(manifest.totals.records.train, 180);
        assert_eq!(manifest.totals.dropped, 6);
        assert_eq!(manifest.shards[0].shard, "a");
    }

    #[test]
    fn any_failure_marks_the_run_failed() {
        let mut manifest = Manifest::new("algo-1", 2, Some(Duration::from_secs(5)));
        manifest.record(ShardEntry::succeeded(&report("a")));
        manifest.record(ShardEntry::timed_out(
            "b",
            Path::new("/in/b.tsv.gz"),
            Duration::from_secs(5),
        ));
        manifest.finish(Duration::from_secs(6));
        assert_eq!(manifest.state, RunState::Failed);
        assert_eq!(manifest.totals.timed_out, 1);
    }

    #[test]
    fn empty_run_is_complete() {
        let mut manifest = Manifest::new("unknown", 1, None);
        manifest.finish(Duration::ZERO);
        assert_eq!(manifest.state, RunState::Complete);
        assert!(manifest.shards.is_empty());
    }

    #[test]
    fn written_manifest_reads_back_with_status_tags() {
        let dir = tempdir().expect("tempdir");
        let mut manifest = Manifest::new("algo-2", 2, None);
        manifest.record(ShardEntry::succeeded(&report("a")));
        manifest.record(ShardEntry::failed(
            "b",
            Path::new("/in/b.tsv.gz"),
            &PrepError::Stratification("class 4 has a single member".into()),
        ));
        manifest.finish(Duration::from_secs(2));

        let path = manifest.write(dir.path()).expect("write manifest");
        assert_eq!(path, dir.path().join("manifest-algo-2.json"));
        let raw = fs::read_to_string(&path).expect("read manifest");
        assert!(raw.contains("\"status\": \"succeeded\""));
        assert!(raw.contains("\"status\": \"failed\""));
        assert_eq!(Manifest::load(&path).expect("load manifest"), manifest);
    }

    #[test]
    fn rss_sampling_does_not_panic() {
        let _ = sample_rss_kb();
    }
}

//! Fan-out of shard jobs over a worker pool.
//!
//! The orchestrator discovers shards, submits one job per shard to a dedicated rayon pool, and
//! collects completion events over a crossbeam channel. Jobs that outlive the per-job timeout are
//! recorded as timed out and no longer awaited; their threads are left behind when the pool is
//! dropped.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError};
use log::{debug, error, info, warn};

use crate::config::PipelineConfig;
use crate::corpus::discover_shards;
use crate::error::{PrepError, Result};
use crate::manifest::{Manifest, RunState, ShardEntry};
use crate::shard::{shard_key, ShardReport, ShardTransformer};
use crate::tokenizer::SubwordTokenizer;

/// Progress notifications emitted while a run advances.
#[derive(Debug)]
pub enum Progress<'a> {
    /// Discovery finished with `total` shards.
    Discovered {
        /// Number of shards to process.
        total: usize,
    },
    /// A shard reached a final status.
    ShardFinished {
        /// Manifest entry of the shard.
        entry: &'a ShardEntry,
        /// Shards finished so far, this one included.
        completed: usize,
        /// Number of shards in the run.
        total: usize,
    },
}

/// Result of a run whose manifest was written.
#[derive(Debug, Clone)]
pub struct RunSummary {
    /// Final manifest.
    pub manifest: Manifest,
    /// Where the manifest was written.
    pub manifest_path: PathBuf,
}

impl RunSummary {
    /// Final run state.
    #[must_use]
    pub fn state(&self) -> RunState {
        self.manifest.state
    }

    /// Returns `true` when every shard succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.manifest.state == RunState::Complete
    }

    /// Converts a failed run into [`PrepError::RunFailed`].
    pub fn into_result(self) -> Result<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            let totals = self.manifest.totals;
            Err(PrepError::RunFailed {
                failed: totals.failed + totals.timed_out,
                total: totals.shards,
            })
        }
    }
}

enum WorkerEvent {
    Started {
        job: usize,
        at: Instant,
    },
    Finished {
        job: usize,
        outcome: Result<ShardReport>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobState {
    Queued,
    Running { deadline: Option<Instant> },
    Abandoned,
    Done,
}

struct Job {
    key: String,
    path: PathBuf,
    state: JobState,
    /// Set by whichever side gets to the job first: the worker that runs it, or the
    /// orchestrator giving up on it while it is still queued.
    claimed: Arc<AtomicBool>,
}

impl Job {
    fn new(path: PathBuf) -> Self {
        let key = shard_key(&path).unwrap_or_else(|_| path.to_string_lossy().into_owned());
        Self {
            key,
            path,
            state: JobState::Queued,
            claimed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Returns `true` if the caller now owns the job.
    fn claim(claimed: &AtomicBool) -> bool {
        !claimed.swap(true, Ordering::AcqRel)
    }
}

fn advance(manifest: &mut Manifest, next: RunState) {
    info!("run state: {} -> {next}", manifest.state);
    manifest.state = next;
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Runs the shard transformer over every shard of the input directory.
#[derive(Debug, Clone)]
pub struct Orchestrator {
    transformer: Arc<ShardTransformer>,
}

impl Orchestrator {
    /// Creates an orchestrator; the tokenizer is shared by every worker.
    pub fn new(cfg: PipelineConfig, tokenizer: Arc<dyn SubwordTokenizer>) -> Result<Self> {
        Ok(Self {
            transformer: Arc::new(ShardTransformer::new(cfg, tokenizer)?),
        })
    }

    /// Returns an immutable reference to the underlying configuration.
    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        self.transformer.config()
    }

    /// Runs to completion without progress reporting.
    pub fn run(&self) -> Result<RunSummary> {
        self.run_with_progress(|_| {})
    }

    /// Runs to completion, reporting discovery and every finished shard to `progress`.
    ///
    /// Returns an error only for setup failures (missing input directory, pool creation,
    /// manifest IO). Shard failures are reflected in the returned summary's state.
    pub fn run_with_progress<F>(&self, mut progress: F) -> Result<RunSummary>
    where
        F: FnMut(Progress<'_>),
    {
        let cfg = self.config();
        let start = Instant::now();
        let workers = cfg.effective_workers();
        let mut manifest = Manifest::new(cfg.current_host.clone(), workers, cfg.job_timeout);

        advance(&mut manifest, RunState::Discovering);
        let shards = match discover_shards(&cfg.input_dir, &cfg.pattern) {
            Ok(shards) => shards,
            Err(err) => {
                advance(&mut manifest, RunState::Failed);
                return Err(err);
            }
        };
        info!(
            "discovered {} shard(s) matching {:?} in {}",
            shards.len(),
            cfg.pattern,
            cfg.input_dir.display()
        );
        progress(Progress::Discovered {
            total: shards.len(),
        });

        if shards.is_empty() {
            warn!("no shards to process; writing an empty manifest");
        } else {
            let mut jobs: Vec<Job> = shards.into_iter().map(Job::new).collect();
            advance(&mut manifest, RunState::Dispatching);
            let receiver = self.dispatch(&jobs, workers)?;
            advance(&mut manifest, RunState::AwaitingCompletion);
            self.await_jobs(&mut jobs, &receiver, workers, &mut manifest, &mut progress);
        }

        let previous = manifest.state;
        manifest.finish(start.elapsed());
        info!("run state: {previous} -> {}", manifest.state);
        let manifest_path = manifest.write(&cfg.output_root)?;
        info!(
            "{} of {} shard(s) succeeded in {:.2?}; manifest at {}",
            manifest.totals.succeeded,
            manifest.totals.shards,
            start.elapsed(),
            manifest_path.display()
        );
        Ok(RunSummary {
            manifest,
            manifest_path,
        })
    }

    fn dispatch(&self, jobs: &[Job], workers: usize) -> Result<Receiver<WorkerEvent>> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|idx| format!("seqprep-worker-{idx}"))
            .build()
            .map_err(|err| PrepError::Internal(format!("failed to build worker pool: {err}")))?;
        debug!("dispatching {} job(s) to {workers} worker(s)", jobs.len());

        let (sender, receiver) = channel::unbounded();
        for (idx, job) in jobs.iter().enumerate() {
            let sender = sender.clone();
            let transformer = Arc::clone(&self.transformer);
            let path = job.path.clone();
            let claimed = Arc::clone(&job.claimed);
            pool.spawn(move || {
                if !Job::claim(&claimed) {
                    debug!("skipping {}: the run already gave up on it", path.display());
                    return;
                }
                // The receiver may be gone once the run has given up on this job.
                let _ = sender.send(WorkerEvent::Started {
                    job: idx,
                    at: Instant::now(),
                });
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| transformer.transform(&path)))
                    .unwrap_or_else(|payload| {
                        Err(PrepError::Internal(format!(
                            "worker panicked: {}",
                            panic_message(payload.as_ref())
                        )))
                    });
                let _ = sender.send(WorkerEvent::Finished { job: idx, outcome });
            });
        }
        // Queued jobs keep the registry alive after the handle is dropped.
        drop(pool);
        Ok(receiver)
    }

    fn await_jobs<F>(
        &self,
        jobs: &mut [Job],
        receiver: &Receiver<WorkerEvent>,
        workers: usize,
        manifest: &mut Manifest,
        progress: &mut F,
    ) where
        F: FnMut(Progress<'_>),
    {
        let limit = self.config().job_timeout;
        let total = jobs.len();
        let mut pending = total;
        let mut stalled = 0usize;
        let mut settle = |manifest: &mut Manifest, entry: ShardEntry| {
            progress(Progress::ShardFinished {
                entry: &entry,
                completed: manifest.shards.len() + 1,
                total,
            });
            manifest.record(entry);
        };

        while pending > 0 {
            let next_deadline = jobs
                .iter()
                .filter_map(|job| match job.state {
                    JobState::Running { deadline } => deadline,
                    _ => None,
                })
                .min();
            let received = match next_deadline {
                Some(deadline) => receiver.recv_deadline(deadline),
                None => receiver.recv().map_err(|_| RecvTimeoutError::Disconnected),
            };

            match received {
                Ok(WorkerEvent::Started { job, at }) => {
                    if let Some(job) = jobs.get_mut(job).filter(|j| j.state == JobState::Queued) {
                        debug!("shard {} started", job.key);
                        job.state = JobState::Running {
                            deadline: limit.map(|limit| at + limit),
                        };
                    }
                }
                Ok(WorkerEvent::Finished { job, outcome }) => {
                    let Some(job) = jobs.get_mut(job) else {
                        continue;
                    };
                    match job.state {
                        JobState::Abandoned => {
                            stalled -= 1;
                            job.state = JobState::Done;
                            warn!(
                                "shard {} finished after it was abandoned; its outputs are left in place",
                                job.key
                            );
                        }
                        JobState::Queued | JobState::Running { .. } => {
                            job.state = JobState::Done;
                            pending -= 1;
                            let entry = match outcome {
                                Ok(report) => ShardEntry::succeeded(&report),
                                Err(err) => {
                                    error!("shard {} failed: {err}", job.key);
                                    ShardEntry::failed(job.key.clone(), &job.path, &err)
                                }
                            };
                            settle(manifest, entry);
                        }
                        JobState::Done => {}
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    let Some(limit) = limit else { continue };
                    let now = Instant::now();
                    for job in jobs.iter_mut() {
                        let overdue = matches!(
                            job.state,
                            JobState::Running { deadline: Some(deadline) } if deadline <= now
                        );
                        if overdue {
                            job.state = JobState::Abandoned;
                            pending -= 1;
                            stalled += 1;
                            warn!(
                                "{}",
                                PrepError::Timeout {
                                    shard: job.key.clone(),
                                    limit
                                }
                            );
                            settle(manifest, ShardEntry::timed_out(job.key.clone(), &job.path, limit));
                        }
                    }
                    let running = jobs
                        .iter()
                        .any(|job| matches!(job.state, JobState::Running { .. }));
                    if stalled >= workers && !running {
                        for job in jobs.iter_mut().filter(|j| j.state == JobState::Queued) {
                            if !Job::claim(&job.claimed) {
                                // A worker freed up and took it; its start event is in flight.
                                job.state = JobState::Running {
                                    deadline: Some(now + limit),
                                };
                                continue;
                            }
                            job.state = JobState::Done;
                            pending -= 1;
                            let err = PrepError::Internal(
                                "never started: every worker is held by a timed-out job".into(),
                            );
                            error!("shard {} failed: {err}", job.key);
                            settle(manifest, ShardEntry::failed(job.key.clone(), &job.path, &err));
                        }
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    for job in jobs.iter_mut().filter(|j| {
                        matches!(j.state, JobState::Queued | JobState::Running { .. })
                    }) {
                        job.state = JobState::Done;
                        let err = PrepError::Internal("worker exited without reporting".into());
                        error!("shard {} failed: {err}", job.key);
                        settle(manifest, ShardEntry::failed(job.key.clone(), &job.path, &err));
                    }
                    break;
                }
            }
        }
    }
}

/// Convenience wrapper: builds an [`Orchestrator`] and runs it, failing if any shard failed.
pub fn run_pipeline(cfg: PipelineConfig, tokenizer: Arc<dyn SubwordTokenizer>) -> Result<RunSummary> {
    Orchestrator::new(cfg, tokenizer)?.run()?.into_result()
}

/// Partition directories under `output_root`, in output order.
#[must_use]
pub fn partition_dirs(output_root: &Path) -> Vec<PathBuf> {
    crate::split::Partition::ALL
        .iter()
        .map(|partition| output_root.join(partition.as_str()))
        .collect()
}

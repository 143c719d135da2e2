use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use env_logger::Env;
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};
use serde_json::json;

use seqprep::config::{DEFAULT_RESOURCE_CONFIG, DEFAULT_SHARD_PATTERN};
use seqprep::orchestrator::partition_dirs;
use seqprep::serialization::read_examples;
use seqprep::tokenizer::DEFAULT_MODEL;
use seqprep::{
    EncoderConfig, Orchestrator, PipelineConfig, Progress, ResourceConfig, ShardConfig,
    SmallClassPolicy, SplitConfig, SubwordTokenizer, TokenizerSource,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Sharded BERT feature preparation", long_about = None)]
struct Cli {
    /// Increase verbosity (-v, -vv)
    #[arg(short = 'v', long, global = true, action = ArgAction::Count)]
    verbose: u8,

    /// Decrease verbosity (-q, -qq)
    #[arg(short = 'q', long, global = true, action = ArgAction::Count)]
    quiet: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Split, encode, and write every shard of the input directory
    Prepare(PrepareArgs),
    /// Summarise TFRecord files written by `prepare`
    Inspect(InspectArgs),
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum PolicyArg {
    /// Fail shards whose classes are too small to stratify
    Error,
    /// Fall back to an unstratified split for such shards
    Unstratified,
}

impl From<PolicyArg> for SmallClassPolicy {
    fn from(arg: PolicyArg) -> Self {
        match arg {
            PolicyArg::Error => Self::Error,
            PolicyArg::Unstratified => Self::Unstratified,
        }
    }
}

#[derive(Args, Debug)]
struct PrepareArgs {
    /// Hosts participating in the job (defaults to the resource config)
    #[arg(long, value_name = "HOST", value_delimiter = ',')]
    hosts: Option<Vec<String>>,

    /// Host running this process (defaults to the resource config)
    #[arg(long, value_name = "HOST")]
    current_host: Option<String>,

    /// Directory holding the input shards
    #[arg(long, value_name = "DIR", default_value = "/opt/ml/processing/input/data")]
    input_data: PathBuf,

    /// Root receiving the train/validation/test directories
    #[arg(long, value_name = "DIR", default_value = "/opt/ml/processing/output/bert")]
    output_data: PathBuf,

    /// Glob selecting shard files inside the input directory
    #[arg(long, value_name = "GLOB", default_value = DEFAULT_SHARD_PATTERN)]
    pattern: String,

    /// Model hub repository providing vocab.txt
    #[arg(long, value_name = "REPO", default_value = DEFAULT_MODEL)]
    model: String,

    /// Model hub revision
    #[arg(long, value_name = "REV", default_value = "main")]
    revision: String,

    /// Local vocab.txt; skips the model hub
    #[arg(long, value_name = "PATH")]
    vocab: Option<PathBuf>,

    /// Force lowercasing
    #[arg(long, conflicts_with = "cased")]
    lowercase: bool,

    /// Keep original casing
    #[arg(long)]
    cased: bool,

    /// Encoded sequence length, [CLS] and [SEP] included
    #[arg(long, value_name = "LEN")]
    max_seq_length: Option<usize>,

    /// Fraction of each shard held out from training
    #[arg(long, value_name = "FRACTION")]
    holdout: Option<f64>,

    /// Fraction of the holdout assigned to test
    #[arg(long, value_name = "FRACTION")]
    test_fraction: Option<f64>,

    /// Seed for reproducible splits
    #[arg(long, value_name = "SEED")]
    seed: Option<u64>,

    /// Worker threads (defaults to available cores)
    #[arg(long, value_name = "N")]
    threads: Option<usize>,

    /// Per-shard timeout in seconds
    #[arg(long, value_name = "SECS")]
    job_timeout: Option<u64>,

    /// Behaviour for classes too small to stratify
    #[arg(long, value_enum, default_value = "error")]
    small_class_policy: PolicyArg,

    /// Drop exact (text, label) duplicates before splitting
    #[arg(long)]
    drop_duplicates: bool,

    /// Header of the text column
    #[arg(long, value_name = "NAME")]
    text_column: Option<String>,

    /// Header of the label column
    #[arg(long, value_name = "NAME")]
    label_column: Option<String>,

    /// Closed, ordered label set
    #[arg(long, value_name = "LABEL", value_delimiter = ',', allow_negative_numbers = true)]
    labels: Option<Vec<i64>>,

    /// Disable the progress bar
    #[arg(long)]
    no_progress: bool,

    /// Host topology file
    #[arg(long, value_name = "PATH", default_value = DEFAULT_RESOURCE_CONFIG)]
    resource_config: PathBuf,
}

#[derive(Args, Debug)]
struct InspectArgs {
    /// TFRecord files to read
    #[arg(required = true)]
    files: Vec<PathBuf>,

    /// Emit JSON instead of human-readable output
    #[arg(long)]
    json: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);

    match cli.command {
        Commands::Prepare(args) => run_prepare(args),
        Commands::Inspect(args) => run_inspect(args),
    }
}

fn init_logging(verbose: u8, quiet: u8) {
    use log::LevelFilter;

    // Without -v/-q, RUST_LOG decides and falls back to info.
    let level = match (quiet, verbose) {
        (0, 0) => None,
        (1, _) => Some(LevelFilter::Warn),
        (q, _) if q > 1 => Some(LevelFilter::Error),
        (_, 1) => Some(LevelFilter::Debug),
        _ => Some(LevelFilter::Trace),
    };

    let mut builder = env_logger::Builder::from_env(Env::default().default_filter_or("info"));
    builder.format_timestamp_millis();
    if let Some(level) = level {
        builder.filter_level(level);
    }
    let _ = builder.try_init();
}

fn tokenizer_source(args: &PrepareArgs) -> TokenizerSource {
    let casing = if args.cased {
        Some(false)
    } else if args.lowercase {
        Some(true)
    } else {
        None
    };
    match &args.vocab {
        Some(vocab) => TokenizerSource::Local {
            vocab: vocab.clone(),
            lowercase: casing.unwrap_or(true),
        },
        None => TokenizerSource::Hub {
            repo: args.model.clone(),
            revision: args.revision.clone(),
            lowercase: casing,
        },
    }
}

fn pipeline_config(args: &PrepareArgs, current_host: String) -> Result<PipelineConfig> {
    let split_defaults = SplitConfig::default();
    let encoder_defaults = EncoderConfig::default();
    let shard_defaults = ShardConfig::default();
    let cfg = PipelineConfig::builder()
        .input_dir(&args.input_data)
        .output_root(&args.output_data)
        .pattern(args.pattern.clone())
        .current_host(current_host)
        .workers(args.threads)
        .job_timeout(args.job_timeout.map(Duration::from_secs))
        .fractions(
            args.holdout.unwrap_or(split_defaults.holdout_fraction),
            args.test_fraction.unwrap_or(split_defaults.test_fraction),
        )
        .seed(args.seed)
        .small_class_policy(args.small_class_policy.into())
        .max_seq_length(args.max_seq_length.unwrap_or(encoder_defaults.max_seq_length))
        .label_values(args.labels.clone().unwrap_or(encoder_defaults.label_values))
        .columns(
            args.text_column.clone().unwrap_or(shard_defaults.text_column),
            args.label_column.clone().unwrap_or(shard_defaults.label_column),
        )
        .drop_duplicates(args.drop_duplicates)
        .build()
        .context("invalid pipeline configuration")?;
    Ok(cfg)
}

fn run_prepare(args: PrepareArgs) -> Result<()> {
    let resource = ResourceConfig::load_or_default(&args.resource_config)
        .with_context(|| format!("failed to read {}", args.resource_config.display()))?;
    let hosts = args.hosts.clone().unwrap_or(resource.hosts);
    let current_host = args.current_host.clone().unwrap_or(resource.current_host);
    info!("hosts: {hosts:?}, current host: {current_host}");
    if !hosts.contains(&current_host) {
        warn!("current host {current_host} is not listed in hosts {hosts:?}");
    }

    let cfg = pipeline_config(&args, current_host)?;
    let tokenizer = tokenizer_source(&args)
        .resolve()
        .context("failed to load the tokenizer")?;
    info!(
        "tokenizer ready: {} entries, lowercase={}",
        tokenizer.vocab_size(),
        tokenizer.lowercase()
    );

    let output_root = cfg.output_root.clone();
    let orchestrator = Orchestrator::new(cfg, Arc::new(tokenizer))?;
    let bar = if args.no_progress {
        None
    } else {
        let pb = ProgressBar::new(0);
        let style = ProgressStyle::with_template("{bar:40} {pos}/{len} shards {msg} {elapsed}")
            .context("invalid progress template")?;
        pb.set_style(style);
        Some(pb)
    };

    let summary = orchestrator.run_with_progress(|event| {
        let Some(pb) = bar.as_ref() else { return };
        match event {
            Progress::Discovered { total } => pb.set_length(total as u64),
            Progress::ShardFinished { entry, .. } => {
                pb.set_message(entry.shard.clone());
                pb.inc(1);
            }
        }
    })?;
    if let Some(pb) = bar {
        pb.finish_and_clear();
    }

    list_dir(&output_root)?;
    for dir in partition_dirs(&output_root) {
        list_dir(&dir)?;
    }

    let summary = summary.into_result()?;
    let totals = summary.manifest.totals;
    info!(
        "wrote train={} validation={} test={} records from {} shard(s)",
        totals.records.train, totals.records.validation, totals.records.test, totals.shards
    );
    println!("Complete");
    Ok(())
}

fn list_dir(dir: &Path) -> Result<()> {
    println!("Listing contents of {}", dir.display());
    if !dir.exists() {
        return Ok(());
    }
    let mut names = fs::read_dir(dir)
        .with_context(|| format!("failed to list {}", dir.display()))?
        .map(|entry| entry.map(|e| e.file_name().to_string_lossy().into_owned()))
        .collect::<std::io::Result<Vec<_>>>()
        .with_context(|| format!("failed to list {}", dir.display()))?;
    names.sort();
    for name in names {
        println!("{name}");
    }
    Ok(())
}

fn run_inspect(args: InspectArgs) -> Result<()> {
    let mut reports = Vec::with_capacity(args.files.len());
    for file in &args.files {
        let examples = read_examples(file)
            .with_context(|| format!("failed to read {}", file.display()))?;
        let mut lengths = examples
            .iter()
            .map(|example| example.input_ids.len())
            .collect::<Vec<_>>();
        lengths.sort_unstable();
        lengths.dedup();
        let mut labels: BTreeMap<u32, usize> = BTreeMap::new();
        for example in &examples {
            *labels.entry(example.label_id).or_insert(0) += 1;
        }
        let real_tokens: usize = examples.iter().map(|example| example.real_length()).sum();
        let mean_length = if examples.is_empty() {
            0.0
        } else {
            real_tokens as f64 / examples.len() as f64
        };
        reports.push(json!({
            "path": file.display().to_string(),
            "records": examples.len(),
            "sequence_lengths": lengths,
            "mean_real_length": mean_length,
            "label_ids": labels,
        }));
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
        return Ok(());
    }
    for report in &reports {
        println!("File          : {}", report["path"].as_str().unwrap_or_default());
        println!("Records       : {}", report["records"]);
        println!("Sequence len  : {}", report["sequence_lengths"]);
        println!("Mean real len : {:.2}", report["mean_real_length"].as_f64().unwrap_or_default());
        let histogram = report["label_ids"]
            .as_object()
            .map(|labels| {
                labels
                    .iter()
                    .map(|(label, count)| format!("{label}={count}"))
                    .collect::<Vec<_>>()
                    .join(", ")
            })
            .unwrap_or_default();
        println!("Labels        : {}", if histogram.is_empty() { "(none)" } else { &histogram });
    }
    Ok(())
}

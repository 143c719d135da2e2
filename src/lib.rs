//! Sharded preparation of labeled text for BERT-style sequence classification.
//!
//! The crate exposes both a library API and a `seqprep` command line interface. A run scans an
//! input directory for gzip-compressed TSV shards, splits each shard into stratified
//! train/validation/test partitions, encodes every record into fixed-length WordPiece features,
//! and writes one TFRecord file per partition and shard. Shards are processed in parallel on a
//! dedicated worker pool, and the outcome of every shard is recorded in a JSON manifest.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use seqprep::{Orchestrator, PipelineConfig, TokenizerSource};
//!
//! # fn main() -> seqprep::Result<()> {
//! let cfg = PipelineConfig::builder()
//!     .input_dir("/data/reviews")
//!     .output_root("/data/bert")
//!     .current_host("algo-1")
//!     .seed(Some(42))
//!     .build()?;
//! let tokenizer = TokenizerSource::default().resolve()?;
//! let summary = Orchestrator::new(cfg, Arc::new(tokenizer))?.run()?;
//! println!("{} shards, state {}", summary.manifest.totals.shards, summary.state());
//! # Ok(())
//! # }
//! ```
//!
//! The CLI is enabled by default through the `cli` feature, and model hub downloads through the
//! `hub` feature. Users targeting the library only can disable default features:
//! `seqprep = { version = "...", default-features = false }`.

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    clippy::all,
    rust_2018_idioms,
    future_incompatible,
    unused_lifetimes,
    unreachable_pub
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::missing_panics_doc,
    clippy::missing_errors_doc,
    clippy::doc_markdown,
    clippy::multiple_crate_versions
)]

pub mod config;
pub mod corpus;
pub mod error;
pub mod features;
pub mod manifest;
pub mod orchestrator;
pub mod serialization;
pub mod shard;
pub mod split;
pub mod tokenizer;

pub use config::{
    EncoderConfig, PipelineBuilder, PipelineConfig, ResourceConfig, ShardConfig,
    SmallClassPolicy, SplitConfig,
};
pub use error::{PrepError, Result};
pub use features::{EncodedExample, FeatureEncoder, LabelMap, RawRecord};
pub use manifest::{Manifest, RunState, ShardEntry, ShardStatus};
pub use orchestrator::{run_pipeline, Orchestrator, Progress, RunSummary};
pub use shard::{ShardReport, ShardTransformer};
pub use split::{Partition, Partitions, SplitCounts, StratifiedSplitter};
pub use tokenizer::{SubwordTokenizer, TokenId, TokenizerSource, WordPieceTokenizer};

//! Per-shard transformation: load, filter, split, encode, and write three record files.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use flate2::read::MultiGzDecoder;
use log::{debug, info};
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};

use crate::config::{PipelineConfig, ShardConfig};
use crate::error::{PrepError, Result};
use crate::features::{EncodedExample, FeatureEncoder, RawRecord};
use crate::serialization::write_examples;
use crate::split::{shard_rng, Partition, SplitCounts, StratifiedSplitter};
use crate::tokenizer::SubwordTokenizer;

/// Extension of the output record files.
pub const RECORD_EXTENSION: &str = "tfrecord";

/// Field values treated as missing, mirroring the usual dataframe NA markers.
const MISSING_MARKERS: &[&str] = &["", "NA", "N/A", "NaN", "nan", "null", "NULL", "#N/A", "<NA>"];

/// Records read from one shard.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadedShard {
    /// Rows with both text and label present, in file order.
    pub records: Vec<RawRecord>,
    /// Rows dropped for a missing text or label.
    pub dropped: usize,
}

/// Outcome of a successful shard transformation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardReport {
    /// Shard key used in output names.
    pub shard: String,
    /// Input file.
    pub source: PathBuf,
    /// Records written per partition.
    pub counts: SplitCounts,
    /// Rows dropped for missing fields.
    pub dropped: usize,
    /// Rows dropped as exact duplicates.
    pub duplicates: usize,
    /// Output files, in train/validation/test order.
    pub outputs: Vec<PathBuf>,
    /// Wall-clock time spent on the shard.
    pub elapsed: Duration,
}

/// Derives the partition key of a shard by stripping its compression and format suffixes
/// (`reviews_part01.tsv.gz` becomes `reviews_part01`).
pub fn shard_key<P: AsRef<Path>>(path: P) -> Result<String> {
    let path = path.as_ref();
    let key = path
        .file_stem()
        .map(Path::new)
        .and_then(Path::file_stem)
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();
    if key.is_empty() {
        return Err(PrepError::InvalidConfig(format!(
            "cannot derive a shard key from {path:?}"
        )));
    }
    Ok(key)
}

/// Location of the record file for one `(partition, host, shard)` triple.
#[must_use]
pub fn output_path(root: &Path, partition: Partition, host: &str, shard: &str) -> PathBuf {
    root.join(partition.as_str())
        .join(format!("part-{host}-{shard}.{RECORD_EXTENSION}"))
}

fn is_missing(field: &str) -> bool {
    MISSING_MARKERS.contains(&field)
}

fn parse_label(field: &str) -> Option<i64> {
    let field = field.trim();
    if let Ok(value) = field.parse::<i64>() {
        return Some(value);
    }
    // Dataframe round trips turn integer columns with gaps into floats ("5.0").
    let value = field.parse::<f64>().ok()?;
    (value.fract() == 0.0 && value.abs() < i64::MAX as f64).then_some(value as i64)
}

/// Reads a gzip-compressed, tab-delimited shard with a header row.
///
/// Fields are taken verbatim (no quote handling). Rows whose text or label is missing, including
/// rows cut short before either column, are counted and skipped. A label that is present but not
/// an integer, a row with more fields than the header, or a header without the configured
/// columns makes the shard malformed.
pub fn load_shard<P: AsRef<Path>>(path: P, cfg: &ShardConfig) -> Result<LoadedShard> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|err| PrepError::io(err, Some(path.to_path_buf())))?;
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .quoting(false)
        .flexible(true)
        .has_headers(true)
        .from_reader(MultiGzDecoder::new(file));

    let headers = reader
        .headers()
        .map_err(|err| PrepError::malformed(path, err.to_string()))?
        .clone();
    let column = |name: &str| {
        headers
            .iter()
            .position(|header| header.trim() == name)
            .ok_or_else(|| PrepError::malformed(path, format!("missing column {name:?}")))
    };
    let text_idx = column(&cfg.text_column)?;
    let label_idx = column(&cfg.label_column)?;

    let mut loaded = LoadedShard::default();
    for (row, result) in reader.records().enumerate() {
        let record = result.map_err(|err| PrepError::malformed(path, err.to_string()))?;
        // +2: one for the header, one for 1-based line numbers.
        let line = row + 2;
        if record.len() > headers.len() {
            return Err(PrepError::malformed(
                path,
                format!(
                    "line {line}: found {} fields, header has {}",
                    record.len(),
                    headers.len()
                ),
            ));
        }
        let (Some(text), Some(label)) = (record.get(text_idx), record.get(label_idx)) else {
            loaded.dropped += 1;
            continue;
        };
        if is_missing(text) || is_missing(label.trim()) {
            loaded.dropped += 1;
            continue;
        }
        let label = parse_label(label).ok_or_else(|| {
            PrepError::malformed(path, format!("line {line}: label {label:?} is not an integer"))
        })?;
        loaded.records.push(RawRecord::new(text, label));
    }
    Ok(loaded)
}

/// Drops exact duplicates in place, keeping the first occurrence; returns the number removed.
pub fn dedup_in_place(records: &mut Vec<RawRecord>) -> usize {
    let before = records.len();
    let mut seen = FxHashSet::default();
    records.retain(|record| seen.insert(record.clone()));
    before - records.len()
}

/// Applies the splitter and encoder to one shard and writes its three record files.
///
/// Instances hold no mutable state; one transformer is shared by every worker.
#[derive(Debug, Clone)]
pub struct ShardTransformer {
    cfg: PipelineConfig,
    splitter: StratifiedSplitter,
    encoder: FeatureEncoder,
}

impl ShardTransformer {
    /// Creates a transformer around the shared tokenizer.
    pub fn new(cfg: PipelineConfig, tokenizer: Arc<dyn SubwordTokenizer>) -> Result<Self> {
        cfg.validate()?;
        let encoder = FeatureEncoder::new(tokenizer, &cfg.encoder)?;
        let splitter = StratifiedSplitter::new(cfg.split.clone());
        Ok(Self {
            cfg,
            splitter,
            encoder,
        })
    }

    /// Returns an immutable reference to the underlying configuration.
    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.cfg
    }

    /// Returns the feature encoder.
    #[must_use]
    pub fn encoder(&self) -> &FeatureEncoder {
        &self.encoder
    }

    /// Output file of `partition` for the shard `key`.
    #[must_use]
    pub fn output_path(&self, partition: Partition, key: &str) -> PathBuf {
        output_path(&self.cfg.output_root, partition, &self.cfg.current_host, key)
    }

    /// Transforms one shard. Nothing is written unless every record of every partition encodes.
    pub fn transform<P: AsRef<Path>>(&self, path: P) -> Result<ShardReport> {
        let path = path.as_ref();
        let start = Instant::now();
        let key = shard_key(path)?;
        info!("transforming shard {} ({key})", path.display());

        let LoadedShard {
            mut records,
            dropped,
        } = load_shard(path, &self.cfg.shard)?;
        let duplicates = if self.cfg.shard.drop_duplicates {
            dedup_in_place(&mut records)
        } else {
            0
        };
        debug!(
            "{key}: {} records kept, {dropped} dropped for missing fields, {duplicates} duplicates",
            records.len()
        );

        let mut rng = shard_rng(self.splitter.config().seed, &key);
        let partitions = self.splitter.split(records, |record| record.label, &mut rng)?;

        let mut encoded: Vec<(Partition, Vec<EncodedExample>)> = Vec::with_capacity(3);
        for partition in Partition::ALL {
            encoded.push((partition, self.encoder.encode_all(partitions.get(partition))?));
        }

        let mut outputs = Vec::with_capacity(encoded.len());
        for (partition, examples) in &encoded {
            let target = self.output_path(*partition, &key);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)
                    .map_err(|err| PrepError::io(err, Some(parent.to_path_buf())))?;
            }
            write_examples(&target, examples)?;
            outputs.push(target);
        }

        let report = ShardReport {
            shard: key,
            source: path.to_path_buf(),
            counts: partitions.counts(),
            dropped,
            duplicates,
            outputs,
            elapsed: start.elapsed(),
        };
        info!(
            "finished shard {}: train={} validation={} test={} in {:.2?}",
            report.shard,
            report.counts.train,
            report.counts.validation,
            report.counts.test,
            report.elapsed
        );
        Ok(report)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::io::Write;
    use std::path::Path;

    use flate2::write::GzEncoder;
    use flate2::Compression;

    /// Writes a gzip TSV shard with the default review columns.
    pub(crate) fn write_shard(path: &Path, rows: &[(&str, &str)]) {
        let file = std::fs::File::create(path).expect("create shard");
        let mut encoder = GzEncoder::new(file, Compression::fast());
        writeln!(encoder, "marketplace\treview_id\tstar_rating\treview_body").expect("header");
        for (idx, (label, text)) in rows.iter().enumerate() {
            writeln!(encoder, "US\tR{idx}\t{label}\t{text}").expect("row");
        }
        encoder.finish().expect("finish gzip");
    }

    /// `per_label` rows for each star rating 1..=5.
    pub(crate) fn uniform_rows(per_label: usize) -> Vec<(String, String)> {
        let texts = ["great product", "bad product", "this is a word", "love it", "hate it"];
        let mut rows = Vec::new();
        for label in 1..=5usize {
            for idx in 0..per_label {
                let text = format!("{} {}", texts[label - 1], "word ".repeat(idx % 7));
                rows.push((label.to_string(), text));
            }
        }
        rows
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{uniform_rows, write_shard};
    use super::*;
    use crate::serialization::read_examples;
    use crate::tokenizer::testing::fixture_tokenizer;
    use rustc_hash::FxHashMap;
    use tempfile::tempdir;

    fn borrow_rows(rows: &[(String, String)]) -> Vec<(&str, &str)> {
        rows.iter().map(|(l, t)| (l.as_str(), t.as_str())).collect()
    }

    fn transformer(output: &Path, seed: Option<u64>) -> ShardTransformer {
        let cfg = PipelineConfig::builder()
            .output_root(output)
            .current_host("algo-1")
            .max_seq_length(16)
            .seed(seed)
            .build()
            .expect("config");
        ShardTransformer::new(cfg, Arc::new(fixture_tokenizer())).expect("transformer")
    }

    #[test]
    fn shard_key_strips_two_suffixes() {
        assert_eq!(shard_key("/data/amazon_reviews_us_Books.tsv.gz").unwrap(), "amazon_reviews_us_Books");
        assert_eq!(shard_key("plain.gz").unwrap(), "plain");
        assert!(shard_key("/").is_err());
    }

    #[test]
    fn output_path_encodes_host_and_shard() {
        let path = output_path(Path::new("/out"), Partition::Validation, "algo-2", "books");
        assert_eq!(path, PathBuf::from("/out/validation/part-algo-2-books.tfrecord"));
    }

    #[test]
    fn load_shard_drops_rows_with_missing_fields() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("reviews.tsv.gz");
        write_shard(
            &path,
            &[("5", "love it"), ("", "no rating"), ("3", ""), ("4.0", "it \"quoted\" works")],
        );
        let loaded = load_shard(&path, &ShardConfig::default()).expect("load");
        assert_eq!(loaded.dropped, 2);
        assert_eq!(
            loaded.records,
            vec![
                RawRecord::new("love it", 5),
                RawRecord::new("it \"quoted\" works", 4)
            ]
        );
    }

    #[test]
    fn short_rows_are_dropped_and_whitespace_text_is_kept() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("reviews.tsv.gz");
        let file = File::create(&path).expect("create shard");
        let mut encoder = flate2::write::GzEncoder::new(file, flate2::Compression::fast());
        std::io::Write::write_all(
            &mut encoder,
            b"marketplace\treview_id\tstar_rating\treview_body\n\
              US\tR1\t5\tlove it\n\
              US\tR2\t4\n\
              US\tR3\n\
              US\tR4\t 3 \t   \n",
        )
        .expect("write rows");
        encoder.finish().expect("finish gzip");

        let loaded = load_shard(&path, &ShardConfig::default()).expect("short rows are not fatal");
        assert_eq!(loaded.dropped, 2);
        assert_eq!(
            loaded.records,
            vec![RawRecord::new("love it", 5), RawRecord::new("   ", 3)]
        );
    }

    #[test]
    fn long_row_is_malformed() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("reviews.tsv.gz");
        write_shard(&path, &[("5", "love it"), ("4", "it works\textra")]);
        let err = load_shard(&path, &ShardConfig::default()).expect_err("extra field");
        assert!(matches!(err, PrepError::MalformedShard { message, .. } if message.contains("line 3")));
    }

    #[test]
    fn non_integer_label_is_malformed() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("reviews.tsv.gz");
        write_shard(&path, &[("5", "love it"), ("five", "great")]);
        let err = load_shard(&path, &ShardConfig::default()).expect_err("bad label");
        assert!(matches!(err, PrepError::MalformedShard { message, .. } if message.contains("line 3")));
    }

    #[test]
    fn missing_column_and_plain_text_are_malformed() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("reviews.tsv.gz");
        write_shard(&path, &[("5", "love it")]);
        let cfg = ShardConfig {
            text_column: "review_headline".into(),
            ..ShardConfig::default()
        };
        assert!(matches!(
            load_shard(&path, &cfg),
            Err(PrepError::MalformedShard { .. })
        ));

        let plain = dir.path().join("plain.tsv.gz");
        fs::write(&plain, "star_rating\treview_body\n5\tlove it\n").expect("write plain");
        assert!(matches!(
            load_shard(&plain, &ShardConfig::default()),
            Err(PrepError::MalformedShard { .. })
        ));
    }

    #[test]
    fn dedup_keeps_first_occurrence() {
        let mut records = vec![
            RawRecord::new("a", 1),
            RawRecord::new("b", 1),
            RawRecord::new("a", 1),
            RawRecord::new("a", 2),
        ];
        assert_eq!(dedup_in_place(&mut records), 1);
        assert_eq!(records.len(), 3);
    }

    #[test]
    fn transform_writes_three_partitions() {
        let dir = tempdir().expect("tempdir");
        let input = dir.path().join("books.tsv.gz");
        let rows = uniform_rows(20);
        write_shard(&input, &borrow_rows(&rows));

        let output = dir.path().join("out");
        let transformer = transformer(&output, Some(3));
        let report = transformer.transform(&input).expect("transform");
        assert_eq!(report.shard, "books");
        assert_eq!(report.counts, SplitCounts { train: 90, validation: 5, test: 5 });

        for (partition, expected) in [
            (Partition::Train, 90),
            (Partition::Validation, 5),
            (Partition::Test, 5),
        ] {
            let path = output.join(partition.as_str()).join("part-algo-1-books.tfrecord");
            let examples = read_examples(&path).expect("read partition");
            assert_eq!(examples.len(), expected);
            let mut labels: FxHashMap<i64, usize> = FxHashMap::default();
            for example in &examples {
                assert_eq!(example.input_ids.len(), 16);
                let value = transformer
                    .encoder()
                    .labels()
                    .label_value(example.label_id)
                    .expect("label maps back");
                *labels.entry(value).or_insert(0) += 1;
            }
            assert_eq!(labels.len(), 5, "{partition} should hold every label");
        }
    }

    #[test]
    fn seeded_transform_is_byte_identical() {
        let dir = tempdir().expect("tempdir");
        let input = dir.path().join("books.tsv.gz");
        let rows = uniform_rows(20);
        write_shard(&input, &borrow_rows(&rows));

        let first = dir.path().join("first");
        let second = dir.path().join("second");
        transformer(&first, Some(17)).transform(&input).expect("first run");
        transformer(&second, Some(17)).transform(&input).expect("second run");
        for partition in Partition::ALL {
            let name = Path::new(partition.as_str()).join("part-algo-1-books.tfrecord");
            let a = fs::read(first.join(&name)).expect("read first");
            let b = fs::read(second.join(&name)).expect("read second");
            assert_eq!(a, b, "{partition} differs between seeded runs");
        }
    }

    #[test]
    fn unknown_label_aborts_without_outputs() {
        let dir = tempdir().expect("tempdir");
        let input = dir.path().join("books.tsv.gz");
        let mut rows = uniform_rows(20);
        for idx in 0..20 {
            rows.push(("9".to_string(), format!("odd {idx}")));
        }
        write_shard(&input, &borrow_rows(&rows));

        let output = dir.path().join("out");
        let err = transformer(&output, Some(1))
            .transform(&input)
            .expect_err("label 9 is outside the set");
        assert!(matches!(err, PrepError::UnknownLabel { label: 9, .. }));
        assert!(!output.join("train").exists());
    }
}

use assert_cmd::Command;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::Value;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const VOCAB: &[&str] = &[
    "[PAD]", "[UNK]", "[CLS]", "[SEP]", "[MASK]", "the", "a", "this", "is", "it", "great", "bad",
    "product", "love", "hate", "word", "hello", "world", "!",
];

struct Workspace {
    dir: TempDir,
}

impl Workspace {
    fn new() -> Self {
        let dir = tempfile::tempdir().expect("create tempdir");
        fs::create_dir(dir.path().join("in")).expect("create input dir");
        fs::write(dir.path().join("vocab.txt"), VOCAB.join("\n")).expect("write vocab");
        Self { dir }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    fn write_shard(&self, name: &str, rows: &[(String, String)]) {
        let file = fs::File::create(self.path("in").join(name)).expect("create shard");
        let mut encoder = GzEncoder::new(file, Compression::default());
        writeln!(encoder, "marketplace\tstar_rating\treview_body").expect("header");
        for (label, text) in rows {
            writeln!(encoder, "US\t{label}\t{text}").expect("row");
        }
        encoder.finish().expect("finish gzip");
    }

    fn prepare(&self, extra: &[&str]) -> Command {
        self.prepare_with(&["--quiet"], extra)
    }

    fn prepare_with(&self, global: &[&str], extra: &[&str]) -> Command {
        let mut cmd = Command::cargo_bin("seqprep").expect("binary exists");
        cmd.args(global);
        cmd.args([
            "prepare",
            "--input-data",
            path_str(&self.path("in")),
            "--output-data",
            path_str(&self.path("out")),
            "--vocab",
            path_str(&self.path("vocab.txt")),
            "--resource-config",
            path_str(&self.path("resourceconfig.json")),
            "--max-seq-length",
            "16",
            "--seed",
            "7",
            "--no-progress",
        ]);
        cmd.args(extra);
        cmd
    }
}

fn path_str(path: &Path) -> &str {
    path.to_str().expect("utf-8 temp path")
}

fn uniform_rows(per_label: usize) -> Vec<(String, String)> {
    let texts = ["hate it", "bad product", "this is a word", "great product", "love it!"];
    (1..=5)
        .flat_map(|label| {
            (0..per_label).map(move |idx| {
                (
                    label.to_string(),
                    format!("{} {}", texts[label - 1], "hello ".repeat(idx % 5)),
                )
            })
        })
        .collect()
}

#[test]
fn prepare_writes_partitions_manifest_and_listings() {
    let ws = Workspace::new();
    ws.write_shard("books.tsv.gz", &uniform_rows(20));
    ws.write_shard("music.tsv.gz", &uniform_rows(20));

    let output = ws
        .prepare(&["--current-host", "algo-1", "--hosts", "algo-1,algo-2"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let stdout = String::from_utf8(output).expect("stdout is UTF-8");
    assert!(stdout.contains("Listing contents of"));
    assert!(stdout.contains("part-algo-1-books.tfrecord"));
    assert!(stdout.trim_end().ends_with("Complete"));

    for partition in ["train", "validation", "test"] {
        for shard in ["books", "music"] {
            let file = ws
                .path("out")
                .join(partition)
                .join(format!("part-algo-1-{shard}.tfrecord"));
            assert!(file.exists(), "{} was written", file.display());
        }
    }

    let manifest: Value = serde_json::from_str(
        &fs::read_to_string(ws.path("out").join("manifest-algo-1.json")).expect("manifest"),
    )
    .expect("manifest is JSON");
    assert_eq!(manifest["state"], "complete");
    assert_eq!(manifest["totals"]["succeeded"], 2);
    assert_eq!(manifest["totals"]["records"]["train"], 180);

    let train = ws.path("out").join("train").join("part-algo-1-books.tfrecord");
    let inspected = Command::cargo_bin("seqprep")
        .expect("binary exists")
        .args(["--quiet", "inspect", "--json", path_str(&train)])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let reports: Value = serde_json::from_slice(&inspected).expect("inspect output is JSON");
    assert_eq!(reports[0]["records"], 90);
    assert_eq!(reports[0]["sequence_lengths"], serde_json::json!([16]));
    for label_id in ["0", "1", "2", "3", "4"] {
        assert_eq!(reports[0]["label_ids"][label_id], 18);
    }
}

#[test]
fn current_host_comes_from_resource_config() {
    let ws = Workspace::new();
    ws.write_shard("books.tsv.gz", &uniform_rows(20));
    fs::write(
        ws.path("resourceconfig.json"),
        r#"{"current_host": "algo-2", "hosts": ["algo-1", "algo-2"]}"#,
    )
    .expect("write resource config");

    ws.prepare(&[]).assert().success();
    assert!(ws
        .path("out")
        .join("test")
        .join("part-algo-2-books.tfrecord")
        .exists());
    assert!(ws.path("out").join("manifest-algo-2.json").exists());
}

#[test]
fn seeded_runs_write_identical_files() {
    let ws = Workspace::new();
    ws.write_shard("books.tsv.gz", &uniform_rows(20));

    ws.prepare(&["--current-host", "algo-1"]).assert().success();
    let first = fs::read(ws.path("out").join("train").join("part-algo-1-books.tfrecord"))
        .expect("first run output");
    ws.prepare(&["--current-host", "algo-1"]).assert().success();
    let second = fs::read(ws.path("out").join("train").join("part-algo-1-books.tfrecord"))
        .expect("second run output");
    assert_eq!(first, second);
}

#[test]
fn failed_shard_exits_non_zero_and_keeps_good_outputs() {
    let ws = Workspace::new();
    ws.write_shard("good.tsv.gz", &uniform_rows(20));
    let mut lonely = uniform_rows(20);
    lonely.push(("6".to_string(), "a single six".to_string()));
    ws.write_shard("lonely.tsv.gz", &lonely);

    let output = ws
        .prepare(&["--current-host", "algo-1"])
        .assert()
        .failure()
        .get_output()
        .stdout
        .clone();
    let stdout = String::from_utf8(output).expect("stdout is UTF-8");
    assert!(!stdout.contains("Complete"));
    assert!(ws
        .path("out")
        .join("train")
        .join("part-algo-1-good.tfrecord")
        .exists());

    let manifest: Value = serde_json::from_str(
        &fs::read_to_string(ws.path("out").join("manifest-algo-1.json")).expect("manifest"),
    )
    .expect("manifest is JSON");
    assert_eq!(manifest["state"], "failed");
    let lonely_entry = manifest["shards"]
        .as_array()
        .expect("shards array")
        .iter()
        .find(|entry| entry["shard"] == "lonely")
        .expect("lonely shard entry");
    assert_eq!(lonely_entry["status"], "failed");
}

#[test]
fn missing_input_directory_is_a_setup_error() {
    let ws = Workspace::new();
    fs::remove_dir(ws.path("in")).expect("remove input dir");
    ws.prepare(&["--current-host", "algo-1"]).assert().failure();
    assert!(!ws.path("out").join("manifest-algo-1.json").exists());
}

#[test]
fn rust_log_is_honoured_unless_verbosity_flags_are_given() {
    let ws = Workspace::new();
    ws.write_shard("books.tsv.gz", &uniform_rows(20));

    let assert = ws
        .prepare_with(&[], &["--current-host", "algo-1"])
        .env("RUST_LOG", "debug")
        .assert()
        .success();
    let stderr = String::from_utf8_lossy(&assert.get_output().stderr).into_owned();
    assert!(stderr.contains("dispatching 1 job(s)"), "stderr: {stderr}");

    let assert = ws
        .prepare(&["--current-host", "algo-1"])
        .env("RUST_LOG", "debug")
        .assert()
        .success();
    let stderr = String::from_utf8_lossy(&assert.get_output().stderr).into_owned();
    assert!(!stderr.contains("dispatching"), "stderr: {stderr}");
    assert!(!stderr.contains(" INFO "), "stderr: {stderr}");
}

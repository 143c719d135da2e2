//! Facilities for discovering input shards.

use std::path::{Path, PathBuf};

use glob::Pattern;
use walkdir::WalkDir;

use crate::error::{PrepError, Result};

/// Lists the files directly inside `input_dir` whose names match `pattern`, sorted by path.
///
/// Subdirectories are not descended into. Symlinks to files are followed so staged inputs
/// that link into a shared volume are still picked up. A missing input directory is a
/// configuration error; an empty result is not.
pub fn discover_shards<P: AsRef<Path>>(input_dir: P, pattern: &str) -> Result<Vec<PathBuf>> {
    let input_dir = input_dir.as_ref();
    if !input_dir.is_dir() {
        return Err(PrepError::InvalidConfig(format!(
            "input directory {input_dir:?} does not exist"
        )));
    }
    let matcher = Pattern::new(pattern).map_err(|err| {
        PrepError::InvalidConfig(format!("invalid shard pattern {pattern:?}: {err}"))
    })?;

    let walker = WalkDir::new(input_dir)
        .min_depth(1)
        .max_depth(1)
        .follow_links(true);
    let mut files = Vec::new();
    for entry in walker {
        let entry = entry.map_err(|err| {
            let path = err.path().map(Path::to_path_buf);
            match err.into_io_error() {
                Some(io) => PrepError::io(io, path),
                None => PrepError::Internal("directory walk failed".into()),
            }
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        if matcher.matches(&entry.file_name().to_string_lossy()) {
            files.push(entry.into_path());
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn discovers_matching_top_level_files_in_order() {
        let dir = tempdir().expect("tempdir");
        let nested = dir.path().join("nested");
        fs::create_dir(&nested).expect("create nested directory");
        for name in ["b.tsv.gz", "a.tsv.gz", "notes.txt", "c.tsv"] {
            fs::write(dir.path().join(name), b"x").expect("write file");
        }
        fs::write(nested.join("d.tsv.gz"), b"x").expect("write nested");

        let paths = discover_shards(dir.path(), "*.tsv.gz").expect("discover");
        assert_eq!(
            paths,
            vec![dir.path().join("a.tsv.gz"), dir.path().join("b.tsv.gz")]
        );
    }

    #[test]
    fn empty_directory_yields_no_shards() {
        let dir = tempdir().expect("tempdir");
        assert!(discover_shards(dir.path(), "*.tsv.gz")
            .expect("discover")
            .is_empty());
    }

    #[test]
    fn missing_directory_is_a_config_error() {
        let dir = tempdir().expect("tempdir");
        let err = discover_shards(dir.path().join("absent"), "*.tsv.gz")
            .expect_err("missing directory");
        assert!(matches!(err, PrepError::InvalidConfig(_)));
    }
}

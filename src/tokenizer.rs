//! Tokenizer provider: resolves a WordPiece vocabulary and casing policy into a subword tokenizer.
//!
//! The rest of the crate only depends on [`SubwordTokenizer`], so workers receive the tokenizer as
//! an injected capability (`Arc<dyn SubwordTokenizer>`) and tests can substitute a fixture vocab.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info};
use serde_json::Value;
use tokenizers::models::wordpiece::WordPiece;
use tokenizers::normalizers::{BertNormalizer, NormalizerWrapper};
use tokenizers::pre_tokenizers::bert::BertPreTokenizer;
use tokenizers::pre_tokenizers::PreTokenizerWrapper;
use tokenizers::Tokenizer;

use crate::error::{PrepError, Result};

/// Token identifier used throughout the crate.
pub type TokenId = u32;

/// Sequence-start marker.
pub const CLS_TOKEN: &str = "[CLS]";
/// Sequence-separator marker.
pub const SEP_TOKEN: &str = "[SEP]";
/// Padding token; id 0 is assumed when the vocabulary lacks it.
pub const PAD_TOKEN: &str = "[PAD]";
/// Replacement for out-of-vocabulary words.
pub const UNK_TOKEN: &str = "[UNK]";

/// Default model hub reference.
pub const DEFAULT_MODEL: &str = "bert-base-uncased";

/// Splits text into subword units drawn from a fixed vocabulary.
pub trait SubwordTokenizer: Send + Sync {
    /// Splits `text` into ordered subword strings, without special tokens.
    fn tokenize(&self, text: &str) -> Result<Vec<String>>;

    /// Looks up the vocabulary id of a subword string.
    fn token_to_id(&self, token: &str) -> Option<TokenId>;

    /// Whether input text is lowercased before splitting.
    fn lowercase(&self) -> bool;
}

/// BERT-style tokenizer: Bert normalizer and pre-tokenizer in front of a WordPiece model.
#[derive(Clone)]
pub struct WordPieceTokenizer {
    inner: Tokenizer,
    lowercase: bool,
}

impl fmt::Debug for WordPieceTokenizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WordPieceTokenizer")
            .field("vocab_size", &self.vocab_size())
            .field("lowercase", &self.lowercase)
            .finish()
    }
}

impl WordPieceTokenizer {
    /// Builds a tokenizer from a one-token-per-line `vocab.txt`.
    pub fn from_vocab_file<P: AsRef<Path>>(vocab: P, lowercase: bool) -> Result<Self> {
        let vocab = vocab.as_ref();
        let vocab_str = vocab.to_str().ok_or_else(|| {
            PrepError::InvalidConfig(format!("vocabulary path {vocab:?} is not valid UTF-8"))
        })?;
        if !vocab.is_file() {
            return Err(PrepError::io(
                std::io::Error::new(std::io::ErrorKind::NotFound, "vocabulary file not found"),
                Some(vocab.to_path_buf()),
            ));
        }
        let model = WordPiece::from_file(vocab_str)
            .unk_token(UNK_TOKEN.to_string())
            .continuing_subword_prefix("##".to_string())
            .max_input_chars_per_word(100)
            .build()?;

        let mut inner = Tokenizer::new(model);
        inner.with_normalizer(Some(NormalizerWrapper::BertNormalizer(
            BertNormalizer::new(true, true, None, lowercase),
        )));
        inner.with_pre_tokenizer(Some(PreTokenizerWrapper::BertPreTokenizer(
            BertPreTokenizer,
        )));

        let tokenizer = Self { inner, lowercase };
        for marker in [CLS_TOKEN, SEP_TOKEN] {
            if tokenizer.token_to_id(marker).is_none() {
                return Err(PrepError::Tokenizer(format!(
                    "vocabulary {} has no {marker} token",
                    vocab.display()
                )));
            }
        }
        debug!(
            "loaded WordPiece vocabulary from {} ({} entries, lowercase={lowercase})",
            vocab.display(),
            tokenizer.vocab_size()
        );
        Ok(tokenizer)
    }

    /// Number of entries in the vocabulary.
    #[must_use]
    pub fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(false)
    }
}

impl SubwordTokenizer for WordPieceTokenizer {
    fn tokenize(&self, text: &str) -> Result<Vec<String>> {
        let encoding = self.inner.encode(text, false)?;
        Ok(encoding.get_tokens().to_vec())
    }

    fn token_to_id(&self, token: &str) -> Option<TokenId> {
        self.inner.token_to_id(token)
    }

    fn lowercase(&self) -> bool {
        self.lowercase
    }
}

/// Where the vocabulary and casing policy come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenizerSource {
    /// A model repository on the Hugging Face Hub.
    Hub {
        /// Repository id, e.g. `bert-base-uncased`.
        repo: String,
        /// Branch, tag, or commit.
        revision: String,
        /// Casing override; `None` follows `do_lower_case` in the repository.
        lowercase: Option<bool>,
    },
    /// A local `vocab.txt`.
    Local {
        /// Path to the vocabulary file.
        vocab: PathBuf,
        /// Casing policy.
        lowercase: bool,
    },
}

impl Default for TokenizerSource {
    fn default() -> Self {
        Self::Hub {
            repo: DEFAULT_MODEL.into(),
            revision: "main".into(),
            lowercase: None,
        }
    }
}

impl TokenizerSource {
    /// Resolves the source into a ready tokenizer. Failures are fatal for the run; nothing is
    /// retried.
    pub fn resolve(&self) -> Result<WordPieceTokenizer> {
        match self {
            Self::Local { vocab, lowercase } => {
                WordPieceTokenizer::from_vocab_file(vocab, *lowercase)
            }
            Self::Hub {
                repo,
                revision,
                lowercase,
            } => {
                info!("resolving tokenizer from model hub: {repo}@{revision}");
                let (vocab, configured) = fetch_from_hub(repo, revision)?;
                WordPieceTokenizer::from_vocab_file(vocab, lowercase.unwrap_or(configured))
            }
        }
    }
}

#[cfg(feature = "hub")]
fn fetch_from_hub(repo: &str, revision: &str) -> Result<(PathBuf, bool)> {
    use hf_hub::api::sync::Api;
    use hf_hub::{Repo, RepoType};

    let api = Api::new()?;
    let repo = api.repo(Repo::with_revision(
        repo.to_string(),
        RepoType::Model,
        revision.to_string(),
    ));
    let vocab = repo.get("vocab.txt")?;
    let lowercase = match repo.get("tokenizer_config.json") {
        Ok(path) => read_do_lower_case(&path)?,
        Err(err) => {
            debug!("no tokenizer_config.json ({err}); assuming lowercase");
            true
        }
    };
    Ok((vocab, lowercase))
}

#[cfg(not(feature = "hub"))]
fn fetch_from_hub(repo: &str, _revision: &str) -> Result<(PathBuf, bool)> {
    Err(PrepError::Hub(format!(
        "cannot resolve {repo}: built without the `hub` feature; pass a local vocabulary"
    )))
}

/// Reads `do_lower_case` from a `tokenizer_config.json`, defaulting to `true`.
pub fn read_do_lower_case<P: AsRef<Path>>(path: P) -> Result<bool> {
    let path = path.as_ref();
    let raw = fs::read_to_string(path).map_err(|err| PrepError::io(err, Some(path.into())))?;
    let value: Value = serde_json::from_str(&raw)?;
    Ok(value
        .get("do_lower_case")
        .and_then(Value::as_bool)
        .unwrap_or(true))
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use tempfile::tempdir;

    pub(crate) const FIXTURE_VOCAB: &[&str] = &[
        "[PAD]", "[UNK]", "[CLS]", "[SEP]", "[MASK]", "the", "a", "this", "is", "it", "great",
        "bad", "product", "love", "hate", "word", "hello", "world", "work", "##s", "##ing", "##ed",
        ".", ",", "!",
    ];

    /// Builds an uncased tokenizer over [`FIXTURE_VOCAB`].
    pub(crate) fn fixture_tokenizer() -> WordPieceTokenizer {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("vocab.txt");
        fs::write(&path, FIXTURE_VOCAB.join("\n")).expect("write vocab");
        WordPieceTokenizer::from_vocab_file(&path, true).expect("fixture tokenizer")
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{fixture_tokenizer, FIXTURE_VOCAB};
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn tokenize_lowercases_and_splits_subwords() {
        let tokenizer = fixture_tokenizer();
        let tokens = tokenizer.tokenize("Hello WORLD, works!").expect("tokenize");
        assert_eq!(tokens, vec!["hello", "world", ",", "work", "##s", "!"]);
    }

    #[test]
    fn unknown_words_map_to_unk() {
        let tokenizer = fixture_tokenizer();
        let tokens = tokenizer.tokenize("the zebra").expect("tokenize");
        assert_eq!(tokens, vec!["the", UNK_TOKEN]);
    }

    #[test]
    fn token_ids_follow_vocab_line_order() {
        let tokenizer = fixture_tokenizer();
        assert_eq!(tokenizer.vocab_size(), FIXTURE_VOCAB.len());
        assert_eq!(tokenizer.token_to_id(PAD_TOKEN), Some(0));
        assert_eq!(tokenizer.token_to_id(CLS_TOKEN), Some(2));
        assert_eq!(tokenizer.token_to_id(SEP_TOKEN), Some(3));
        assert_eq!(tokenizer.token_to_id("nope"), None);
        assert!(tokenizer.lowercase());
    }

    #[test]
    fn vocab_without_markers_is_rejected() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("vocab.txt");
        fs::write(&path, "[PAD]\n[UNK]\nhello\n").expect("write vocab");
        let err = WordPieceTokenizer::from_vocab_file(&path, true).expect_err("missing [CLS]");
        assert!(matches!(err, PrepError::Tokenizer(message) if message.contains("[CLS]")));
    }

    #[test]
    fn missing_vocab_is_an_io_error() {
        let dir = tempdir().expect("tempdir");
        let source = TokenizerSource::Local {
            vocab: dir.path().join("absent.txt"),
            lowercase: true,
        };
        assert!(matches!(source.resolve(), Err(PrepError::Io { .. })));
    }

    #[test]
    fn do_lower_case_is_read_from_config() {
        let dir = tempdir().expect("tempdir");
        let cased = dir.path().join("cased.json");
        fs::write(&cased, r#"{"do_lower_case": false}"#).expect("write");
        let silent = dir.path().join("silent.json");
        fs::write(&silent, r#"{"model_max_length": 512}"#).expect("write");
        assert!(!read_do_lower_case(&cased).expect("parse"));
        assert!(read_do_lower_case(&silent).expect("parse"));
    }
}

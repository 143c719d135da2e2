//! Conversion of labeled text records into fixed-length BERT input features.

use std::sync::Arc;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::config::EncoderConfig;
use crate::error::{PrepError, Result};
use crate::tokenizer::{SubwordTokenizer, TokenId, CLS_TOKEN, PAD_TOKEN, SEP_TOKEN};

/// One labeled row of an input shard.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RawRecord {
    /// Content to classify.
    pub text: String,
    /// Ordinal label drawn from the configured closed set.
    pub label: i64,
}

impl RawRecord {
    /// Creates a record.
    pub fn new(text: impl Into<String>, label: i64) -> Self {
        Self {
            text: text.into(),
            label,
        }
    }
}

/// Fixed-length encoded representation of one record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodedExample {
    /// Token ids: `[CLS]`, subwords, `[SEP]`, then padding.
    pub input_ids: Vec<TokenId>,
    /// 1 for real tokens (markers included), 0 for padding.
    pub input_mask: Vec<u32>,
    /// Segment ids; all 0 for single-segment classification.
    pub segment_ids: Vec<u32>,
    /// Zero-based index of the label in the closed label set.
    pub label_id: u32,
    /// Distinguishes real examples from batch padding examples.
    pub is_real_example: bool,
}

impl EncodedExample {
    /// Number of non-padding positions.
    #[must_use]
    pub fn real_length(&self) -> usize {
        self.input_mask.iter().filter(|&&bit| bit == 1).count()
    }
}

/// Bidirectional mapping between label values and zero-based class indices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelMap {
    values: Vec<i64>,
    index: FxHashMap<i64, u32>,
}

impl LabelMap {
    /// Builds the map from an ordered, duplicate-free label set.
    pub fn new(values: &[i64]) -> Result<Self> {
        let mut index = FxHashMap::default();
        for (idx, &value) in values.iter().enumerate() {
            let idx = u32::try_from(idx)
                .map_err(|_| PrepError::InvalidConfig("too many label values".into()))?;
            if index.insert(value, idx).is_some() {
                return Err(PrepError::InvalidConfig(format!(
                    "label value {value} listed twice"
                )));
            }
        }
        if index.is_empty() {
            return Err(PrepError::InvalidConfig(
                "label set must not be empty".into(),
            ));
        }
        Ok(Self {
            values: values.to_vec(),
            index,
        })
    }

    /// Class index of `label`; labels outside the set are an error.
    pub fn label_id(&self, label: i64) -> Result<u32> {
        self.index
            .get(&label)
            .copied()
            .ok_or_else(|| PrepError::UnknownLabel {
                label,
                allowed: self.values.clone(),
            })
    }

    /// Label value of a class index.
    #[must_use]
    pub fn label_value(&self, label_id: u32) -> Option<i64> {
        self.values.get(label_id as usize).copied()
    }

    /// Ordered label values.
    #[must_use]
    pub fn values(&self) -> &[i64] {
        &self.values
    }
}

/// Converts [`RawRecord`]s into [`EncodedExample`]s using a shared tokenizer.
#[derive(Clone)]
pub struct FeatureEncoder {
    tokenizer: Arc<dyn SubwordTokenizer>,
    labels: LabelMap,
    max_seq_length: usize,
    cls_id: TokenId,
    sep_id: TokenId,
    pad_id: TokenId,
}

impl std::fmt::Debug for FeatureEncoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeatureEncoder")
            .field("labels", &self.labels.values())
            .field("max_seq_length", &self.max_seq_length)
            .finish_non_exhaustive()
    }
}

impl FeatureEncoder {
    /// Creates an encoder, resolving the marker ids from the tokenizer vocabulary.
    pub fn new(tokenizer: Arc<dyn SubwordTokenizer>, cfg: &EncoderConfig) -> Result<Self> {
        cfg.validate()?;
        let lookup = |token: &str| {
            tokenizer
                .token_to_id(token)
                .ok_or_else(|| PrepError::Tokenizer(format!("vocabulary has no {token} token")))
        };
        let cls_id = lookup(CLS_TOKEN)?;
        let sep_id = lookup(SEP_TOKEN)?;
        let pad_id = tokenizer.token_to_id(PAD_TOKEN).unwrap_or(0);
        Ok(Self {
            labels: LabelMap::new(&cfg.label_values)?,
            max_seq_length: cfg.max_seq_length,
            tokenizer,
            cls_id,
            sep_id,
            pad_id,
        })
    }

    /// Exact length of every produced sequence.
    #[must_use]
    pub fn max_seq_length(&self) -> usize {
        self.max_seq_length
    }

    /// Label mapping used by the encoder.
    #[must_use]
    pub fn labels(&self) -> &LabelMap {
        &self.labels
    }

    /// Encodes one record.
    pub fn encode(&self, record: &RawRecord) -> Result<EncodedExample> {
        let label_id = self.labels.label_id(record.label)?;

        let mut tokens = self.tokenizer.tokenize(&record.text)?;
        tokens.truncate(self.max_seq_length - 2);

        let mut input_ids = Vec::with_capacity(self.max_seq_length);
        input_ids.push(self.cls_id);
        for token in &tokens {
            let id = self.tokenizer.token_to_id(token).ok_or_else(|| {
                PrepError::Encoding(format!("token {token:?} is not in the vocabulary"))
            })?;
            input_ids.push(id);
        }
        input_ids.push(self.sep_id);

        let real = input_ids.len();
        let mut input_mask = vec![1u32; real];
        input_ids.resize(self.max_seq_length, self.pad_id);
        input_mask.resize(self.max_seq_length, 0);
        let segment_ids = vec![0u32; self.max_seq_length];

        Ok(EncodedExample {
            input_ids,
            input_mask,
            segment_ids,
            label_id,
            is_real_example: true,
        })
    }

    /// Encodes a batch of records, stopping at the first failure.
    pub fn encode_all(&self, records: &[RawRecord]) -> Result<Vec<EncodedExample>> {
        records.iter().map(|record| self.encode(record)).collect()
    }
}

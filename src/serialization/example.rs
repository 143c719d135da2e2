//! `tf.train.Example` protobuf messages and their mapping to [`EncodedExample`].
//!
//! Field numbers follow `tensorflow/core/example/{example,feature}.proto`. Features are held in a
//! `BTreeMap` so the encoded bytes do not depend on hash iteration order.

use std::collections::BTreeMap;

use crate::error::{PrepError, Result};
use crate::features::EncodedExample;

/// Feature key of the token ids.
pub const INPUT_IDS: &str = "input_ids";
/// Feature key of the attention mask.
pub const INPUT_MASK: &str = "input_mask";
/// Feature key of the segment ids.
pub const SEGMENT_IDS: &str = "segment_ids";
/// Feature key of the class index.
pub const LABEL_IDS: &str = "label_ids";
/// Feature key of the real-example flag.
pub const IS_REAL_EXAMPLE: &str = "is_real_example";

/// Repeated bytes feature.
#[derive(Clone, PartialEq, prost::Message)]
pub struct BytesList {
    /// Values.
    #[prost(bytes = "vec", repeated, tag = "1")]
    pub value: Vec<Vec<u8>>,
}

/// Repeated float feature.
#[derive(Clone, PartialEq, prost::Message)]
pub struct FloatList {
    /// Values.
    #[prost(float, repeated, tag = "1")]
    pub value: Vec<f32>,
}

/// Repeated int64 feature.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Int64List {
    /// Values.
    #[prost(int64, repeated, tag = "1")]
    pub value: Vec<i64>,
}

/// A single named feature.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Feature {
    /// Typed payload.
    #[prost(oneof = "feature::Kind", tags = "1, 2, 3")]
    pub kind: Option<feature::Kind>,
}

/// Nested types of [`Feature`].
pub mod feature {
    /// Payload variants of a feature.
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Kind {
        /// Bytes payload.
        #[prost(message, tag = "1")]
        BytesList(super::BytesList),
        /// Float payload.
        #[prost(message, tag = "2")]
        FloatList(super::FloatList),
        /// Int64 payload.
        #[prost(message, tag = "3")]
        Int64List(super::Int64List),
    }
}

/// Feature map of an example.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Features {
    /// Features by name.
    #[prost(btree_map = "string, message", tag = "1")]
    pub feature: BTreeMap<String, Feature>,
}

/// A training example.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Example {
    /// Feature map.
    #[prost(message, optional, tag = "1")]
    pub features: Option<Features>,
}

fn int64_feature<I: IntoIterator<Item = i64>>(values: I) -> Feature {
    Feature {
        kind: Some(feature::Kind::Int64List(Int64List {
            value: values.into_iter().collect(),
        })),
    }
}

/// Builds the `tf.train.Example` for an encoded record.
#[must_use]
pub fn features_to_example(example: &EncodedExample) -> Example {
    let widen = |values: &[u32]| values.iter().map(|&v| i64::from(v)).collect::<Vec<_>>();
    let mut feature = BTreeMap::new();
    feature.insert(INPUT_IDS.to_string(), int64_feature(widen(&example.input_ids)));
    feature.insert(INPUT_MASK.to_string(), int64_feature(widen(&example.input_mask)));
    feature.insert(SEGMENT_IDS.to_string(), int64_feature(widen(&example.segment_ids)));
    feature.insert(
        LABEL_IDS.to_string(),
        int64_feature([i64::from(example.label_id)]),
    );
    feature.insert(
        IS_REAL_EXAMPLE.to_string(),
        int64_feature([i64::from(example.is_real_example)]),
    );
    Example {
        features: Some(Features { feature }),
    }
}

fn int64_values<'a>(features: &'a Features, key: &str) -> Result<&'a [i64]> {
    match features.feature.get(key).and_then(|f| f.kind.as_ref()) {
        Some(feature::Kind::Int64List(list)) => Ok(&list.value),
        Some(_) => Err(PrepError::Serialization(format!(
            "feature {key} is not an int64 list"
        ))),
        None => Err(PrepError::Serialization(format!("feature {key} is missing"))),
    }
}

fn narrow(key: &str, values: &[i64]) -> Result<Vec<u32>> {
    values
        .iter()
        .map(|&v| {
            u32::try_from(v).map_err(|_| {
                PrepError::Serialization(format!("feature {key} holds out-of-range value {v}"))
            })
        })
        .collect()
}

fn single(key: &str, values: &[i64]) -> Result<i64> {
    match values {
        [value] => Ok(*value),
        _ => Err(PrepError::Serialization(format!(
            "feature {key} must hold exactly one value, found {}",
            values.len()
        ))),
    }
}

/// Recovers an [`EncodedExample`] from a decoded `tf.train.Example`.
pub fn example_to_features(example: &Example) -> Result<EncodedExample> {
    let features = example
        .features
        .as_ref()
        .ok_or_else(|| PrepError::Serialization("example has no features".into()))?;
    let input_ids = narrow(INPUT_IDS, int64_values(features, INPUT_IDS)?)?;
    let input_mask = narrow(INPUT_MASK, int64_values(features, INPUT_MASK)?)?;
    let segment_ids = narrow(SEGMENT_IDS, int64_values(features, SEGMENT_IDS)?)?;
    if input_mask.len() != input_ids.len() || segment_ids.len() != input_ids.len() {
        return Err(PrepError::Serialization(format!(
            "sequence lengths disagree: ids={} mask={} segments={}",
            input_ids.len(),
            input_mask.len(),
            segment_ids.len()
        )));
    }
    let label = single(LABEL_IDS, int64_values(features, LABEL_IDS)?)?;
    let label_id = narrow(LABEL_IDS, &[label])?[0];
    let is_real_example = single(IS_REAL_EXAMPLE, int64_values(features, IS_REAL_EXAMPLE)?)? != 0;
    Ok(EncodedExample {
        input_ids,
        input_mask,
        segment_ids,
        label_id,
        is_real_example,
    })
}

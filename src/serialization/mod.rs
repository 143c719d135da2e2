//! Helpers for (de)serialising encoded examples as TFRecord files.

pub mod example;
pub mod tfrecord;

pub use example::{example_to_features, features_to_example};
pub use tfrecord::{read_examples, write_examples, RecordReader, RecordWriter};

//! TFRecord framing.
//!
//! Each record is `u64 length | u32 masked crc32c(length) | payload | u32 masked crc32c(payload)`,
//! all little-endian.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use prost::Message;

use crate::error::{PrepError, Result};
use crate::features::EncodedExample;
use crate::serialization::example::{example_to_features, features_to_example, Example};

const MASK_DELTA: u32 = 0xa282_ead8;

/// CRC32C checksum masked the way TensorFlow stores it.
#[must_use]
pub fn masked_crc32c(data: &[u8]) -> u32 {
    crc32c::crc32c(data).rotate_right(15).wrapping_add(MASK_DELTA)
}

/// Appends framed records to a byte sink.
#[derive(Debug)]
pub struct RecordWriter<W: Write> {
    inner: W,
    records: usize,
}

impl<W: Write> RecordWriter<W> {
    /// Wraps a sink.
    pub fn new(inner: W) -> Self {
        Self { inner, records: 0 }
    }

    /// Writes one framed record.
    pub fn write_record(&mut self, payload: &[u8]) -> io::Result<()> {
        let length = (payload.len() as u64).to_le_bytes();
        self.inner.write_all(&length)?;
        self.inner.write_all(&masked_crc32c(&length).to_le_bytes())?;
        self.inner.write_all(payload)?;
        self.inner.write_all(&masked_crc32c(payload).to_le_bytes())?;
        self.records += 1;
        Ok(())
    }

    /// Serialises and writes one encoded example.
    pub fn write_example(&mut self, example: &EncodedExample) -> io::Result<()> {
        self.write_record(&features_to_example(example).encode_to_vec())
    }

    /// Number of records written so far.
    #[must_use]
    pub fn records(&self) -> usize {
        self.records
    }

    /// Flushes and returns the sink.
    pub fn into_inner(mut self) -> io::Result<W> {
        self.inner.flush()?;
        Ok(self.inner)
    }
}

/// Reads framed records from a byte source, verifying both checksums.
#[derive(Debug)]
pub struct RecordReader<R: Read> {
    inner: R,
}

impl<R: Read> RecordReader<R> {
    /// Wraps a source.
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Returns the next payload, `Ok(None)` at a clean end of input.
    pub fn next_record(&mut self) -> std::result::Result<Option<Vec<u8>>, String> {
        let mut header = [0u8; 12];
        let read = read_full(&mut self.inner, &mut header).map_err(|err| err.to_string())?;
        if read == 0 {
            return Ok(None);
        }
        if read < header.len() {
            return Err(format!("truncated record header ({read} bytes)"));
        }
        let (length_bytes, length_crc) = header.split_at(8);
        let expected = u32::from_le_bytes(length_crc.try_into().map_err(|_| "bad header")?);
        if masked_crc32c(length_bytes) != expected {
            return Err("length checksum mismatch".into());
        }
        let length = u64::from_le_bytes(length_bytes.try_into().map_err(|_| "bad header")?);
        let length = usize::try_from(length).map_err(|_| format!("record length {length} overflows"))?;

        let mut payload = vec![0u8; length];
        self.inner
            .read_exact(&mut payload)
            .map_err(|err| format!("truncated record payload: {err}"))?;
        let mut footer = [0u8; 4];
        self.inner
            .read_exact(&mut footer)
            .map_err(|err| format!("truncated record footer: {err}"))?;
        if masked_crc32c(&payload) != u32::from_le_bytes(footer) {
            return Err("payload checksum mismatch".into());
        }
        Ok(Some(payload))
    }
}

fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(filled)
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Writes `examples` to `path`, replacing any previous file only once the write has completed.
pub fn write_examples<P: AsRef<Path>>(path: P, examples: &[EncodedExample]) -> Result<usize> {
    let path = path.as_ref();
    let tmp = temp_path(path);
    let io_err = |err: io::Error| PrepError::io(err, Some(tmp.clone()));

    let file = File::create(&tmp).map_err(io_err)?;
    let mut writer = RecordWriter::new(BufWriter::new(file));
    for example in examples {
        writer.write_example(example).map_err(io_err)?;
    }
    let written = writer.records();
    let file = writer
        .into_inner()
        .map_err(io_err)?
        .into_inner()
        .map_err(|err| io_err(err.into_error()))?;
    file.sync_all().map_err(io_err)?;
    drop(file);
    fs::rename(&tmp, path).map_err(|err| PrepError::io(err, Some(path.to_path_buf())))?;
    Ok(written)
}

/// Reads every example stored in a record file.
pub fn read_examples<P: AsRef<Path>>(path: P) -> Result<Vec<EncodedExample>> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|err| PrepError::io(err, Some(path.to_path_buf())))?;
    let corrupt = |message: String| PrepError::Record {
        path: path.to_path_buf(),
        message,
    };
    let mut reader = RecordReader::new(BufReader::new(file));
    let mut examples = Vec::new();
    while let Some(payload) = reader.next_record().map_err(corrupt)? {
        let example = Example::decode(payload.as_slice())
            .map_err(|err| corrupt(format!("record {}: {err}", examples.len())))?;
        let features = example_to_features(&example)
            .map_err(|err| corrupt(format!("record {}: {err}", examples.len())))?;
        examples.push(features);
    }
    Ok(examples)
}

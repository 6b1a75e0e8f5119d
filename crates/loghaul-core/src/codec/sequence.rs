//! Length-prefixed binary record codec
//!
//! Wire format per record:
//!
//! ```text
//! +---------------+--------------+------------------+
//! | offset (u64)  | length (u32) | value bytes      |
//! | big-endian    | big-endian   | `length` bytes   |
//! +---------------+--------------+------------------+
//! ```
//!
//! Unlike the delimited codec, the record offset is stored explicitly and
//! is authoritative on read, so payloads may contain any byte sequence.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;

use super::{
    open_byte_source, read_exact_or_eof, write_after_close, ByteSink, FileCodec, RecordReader,
    RecordWriter,
};
use crate::error::{Result, ShipperError};
use crate::message::KeyValue;

/// Upper bound on a single record; larger lengths indicate corruption
const MAX_RECORD_BYTES: u32 = 256 * 1024 * 1024;

const HEADER_BYTES: usize = 8 + 4;

/// Binary key/value records with optional gzip
pub struct SequenceCodec {
    gzip: bool,
}

impl SequenceCodec {
    pub fn new(gzip: bool) -> Self {
        Self { gzip }
    }
}

impl FileCodec for SequenceCodec {
    fn open_writer(&self, path: &Path) -> Result<Box<dyn RecordWriter>> {
        let (sink, count) = ByteSink::open(path, self.gzip)?;
        Ok(Box::new(SequenceWriter {
            sink: Some(sink),
            count,
        }))
    }

    fn open_reader(&self, path: &Path, _first_offset: u64) -> Result<Box<dyn RecordReader>> {
        Ok(Box::new(SequenceReader {
            reader: open_byte_source(path, self.gzip)?,
        }))
    }
}

struct SequenceWriter {
    sink: Option<ByteSink>,
    count: Arc<AtomicU64>,
}

impl RecordWriter for SequenceWriter {
    fn write(&mut self, kv: &KeyValue) -> Result<()> {
        let sink = self.sink.as_mut().ok_or_else(write_after_close)?;
        let length = u32::try_from(kv.value.len())
            .ok()
            .filter(|l| *l <= MAX_RECORD_BYTES)
            .ok_or_else(|| {
                ShipperError::framing(format!("record of {} bytes exceeds limit", kv.value.len()))
            })?;
        sink.write_all(&kv.offset.to_be_bytes())?;
        sink.write_all(&length.to_be_bytes())?;
        sink.write_all(&kv.value)?;
        Ok(())
    }

    fn length(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    fn close(&mut self) -> Result<()> {
        if let Some(sink) = self.sink.take() {
            sink.finish()?;
        }
        Ok(())
    }
}

struct SequenceReader {
    reader: Box<dyn std::io::BufRead + Send>,
}

impl RecordReader for SequenceReader {
    fn next(&mut self) -> Result<Option<KeyValue>> {
        let mut header = [0u8; HEADER_BYTES];
        if !read_exact_or_eof(&mut self.reader, &mut header)? {
            return Ok(None);
        }
        let offset = u64::from_be_bytes(header[..8].try_into().expect("8-byte slice"));
        let length = u32::from_be_bytes(header[8..].try_into().expect("4-byte slice"));
        if length > MAX_RECORD_BYTES {
            return Err(ShipperError::framing(format!(
                "record length {} exceeds limit",
                length
            )));
        }
        let mut value = vec![0u8; length as usize];
        if !read_exact_or_eof(&mut self.reader, &mut value)? && length > 0 {
            return Err(ShipperError::framing("truncated record body"));
        }
        Ok(Some(KeyValue::new(offset, Bytes::from(value))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("0_1_00000000000000000042.seq");
        let codec = SequenceCodec::new(false);

        let mut writer = codec.open_writer(&path).unwrap();
        writer.write(&KeyValue::new(42, &b"first"[..])).unwrap();
        writer
            .write(&KeyValue::new(43, &b"with\nnewline\x00and nul"[..]))
            .unwrap();
        writer.write(&KeyValue::new(44, &b""[..])).unwrap();
        writer.close().unwrap();

        let mut reader = codec.open_reader(&path, 42).unwrap();
        assert_eq!(reader.next().unwrap(), Some(KeyValue::new(42, &b"first"[..])));
        assert_eq!(
            reader.next().unwrap(),
            Some(KeyValue::new(43, &b"with\nnewline\x00and nul"[..]))
        );
        assert_eq!(reader.next().unwrap(), Some(KeyValue::new(44, &b""[..])));
        assert_eq!(reader.next().unwrap(), None);
    }

    #[test]
    fn test_gzip_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("0_1_00000000000000000000.seq.gz");
        let codec = SequenceCodec::new(true);

        let mut writer = codec.open_writer(&path).unwrap();
        for offset in 0..10u64 {
            writer
                .write(&KeyValue::new(offset, vec![offset as u8; 32]))
                .unwrap();
        }
        writer.close().unwrap();
        assert_eq!(
            writer.length(),
            std::fs::metadata(&path).unwrap().len()
        );

        let mut reader = codec.open_reader(&path, 0).unwrap();
        for offset in 0..10u64 {
            let kv = reader.next().unwrap().unwrap();
            assert_eq!(kv.offset, offset);
            assert_eq!(kv.value.len(), 32);
        }
        assert_eq!(reader.next().unwrap(), None);
    }

    #[test]
    fn test_truncated_header_is_framing_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("0_1_00000000000000000000.seq");
        std::fs::write(&path, [0u8; 5]).unwrap();

        let codec = SequenceCodec::new(false);
        let mut reader = codec.open_reader(&path, 0).unwrap();
        assert!(matches!(
            reader.next().unwrap_err(),
            ShipperError::Framing(_)
        ));
    }

    #[test]
    fn test_truncated_body_is_framing_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("0_1_00000000000000000000.seq");
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&7u64.to_be_bytes());
        bytes.extend_from_slice(&100u32.to_be_bytes());
        bytes.extend_from_slice(b"short");
        std::fs::write(&path, bytes).unwrap();

        let codec = SequenceCodec::new(false);
        let mut reader = codec.open_reader(&path, 0).unwrap();
        assert!(matches!(
            reader.next().unwrap_err(),
            ShipperError::Framing(_)
        ));
    }

    #[test]
    fn test_absurd_length_is_framing_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("0_1_00000000000000000000.seq");
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&0u64.to_be_bytes());
        bytes.extend_from_slice(&u32::MAX.to_be_bytes());
        std::fs::write(&path, bytes).unwrap();

        let codec = SequenceCodec::new(false);
        let mut reader = codec.open_reader(&path, 0).unwrap();
        assert!(matches!(
            reader.next().unwrap_err(),
            ShipperError::Framing(_)
        ));
    }
}

//! Delimited text codec
//!
//! Records are raw payload bytes framed by a single-byte delimiter. The
//! writer appends its delimiter only when one is configured; the reader
//! treats trailing bytes without a closing delimiter as a framing error.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;

use super::{
    open_byte_source, write_after_close, ByteSink, FileCodec, RecordReader, RecordWriter,
};
use crate::error::{Result, ShipperError};
use crate::message::KeyValue;

/// Byte-framed records with optional gzip
pub struct DelimitedCodec {
    reader_delimiter: u8,
    writer_delimiter: Option<u8>,
    gzip: bool,
}

impl DelimitedCodec {
    pub fn new(reader_delimiter: u8, writer_delimiter: Option<u8>, gzip: bool) -> Self {
        Self {
            reader_delimiter,
            writer_delimiter,
            gzip,
        }
    }
}

impl FileCodec for DelimitedCodec {
    fn open_writer(&self, path: &Path) -> Result<Box<dyn RecordWriter>> {
        let (sink, count) = ByteSink::open(path, self.gzip)?;
        Ok(Box::new(DelimitedWriter {
            sink: Some(sink),
            count,
            delimiter: self.writer_delimiter,
        }))
    }

    fn open_reader(&self, path: &Path, first_offset: u64) -> Result<Box<dyn RecordReader>> {
        Ok(Box::new(DelimitedReader {
            reader: open_byte_source(path, self.gzip)?,
            delimiter: self.reader_delimiter,
            offset: first_offset,
        }))
    }
}

struct DelimitedWriter {
    sink: Option<ByteSink>,
    count: Arc<AtomicU64>,
    delimiter: Option<u8>,
}

impl RecordWriter for DelimitedWriter {
    fn write(&mut self, kv: &KeyValue) -> Result<()> {
        let sink = self.sink.as_mut().ok_or_else(write_after_close)?;
        sink.write_all(&kv.value)?;
        if let Some(delimiter) = self.delimiter {
            sink.write_all(&[delimiter])?;
        }
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

struct DelimitedReader {
    reader: Box<dyn std::io::BufRead + Send>,
    delimiter: u8,
    offset: u64,
}

impl RecordReader for DelimitedReader {
    fn next(&mut self) -> Result<Option<KeyValue>> {
        let mut buf = Vec::new();
        let read = self.reader.read_until(self.delimiter, &mut buf)?;
        if read == 0 {
            return Ok(None);
        }
        if buf.last() != Some(&self.delimiter) {
            return Err(ShipperError::framing(
                "non-empty record without delimiter at end of file",
            ));
        }
        buf.pop();
        let kv = KeyValue::new(self.offset, Bytes::from(buf));
        self.offset += 1;
        Ok(Some(kv))
    }
}

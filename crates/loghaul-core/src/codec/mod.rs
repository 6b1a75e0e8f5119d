//! File codecs
//!
//! A codec opens record readers and writers over local files. Writers
//! report their on-disk length (post-compression, via a counting stream
//! placed beneath the encoder) because the size-based flush policy cares
//! about bytes that will be uploaded, not payload bytes.
//!
//! Readers hand back records with offsets starting at the file's first
//! message offset. Columnar formats plug in through the same traits; the
//! built-in codecs are delimited text and a length-prefixed binary record
//! format, each optionally gzipped.

mod delimited;
mod sequence;

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

pub use delimited::DelimitedCodec;
pub use sequence::SequenceCodec;

use crate::config::{CodecKind, OutputConfig};
use crate::error::{Result, ShipperError};
use crate::message::KeyValue;

/// Appends records to one local file
pub trait RecordWriter: Send {
    /// Append a record
    fn write(&mut self, kv: &KeyValue) -> Result<()>;

    /// Bytes written to disk so far (post-compression; buffered bytes are
    /// not counted until flushed)
    fn length(&self) -> u64;

    /// Flush buffers, finish the encoder and release the file
    fn close(&mut self) -> Result<()>;
}

/// Reads records back from one local file
pub trait RecordReader: Send {
    /// Next record, or `None` at a clean end of file
    fn next(&mut self) -> Result<Option<KeyValue>>;
}

/// Opens readers and writers for one record format
pub trait FileCodec: Send + Sync {
    fn open_writer(&self, path: &Path) -> Result<Box<dyn RecordWriter>>;

    fn open_reader(&self, path: &Path, first_offset: u64) -> Result<Box<dyn RecordReader>>;
}

/// Build the codec selected by the output configuration.
///
/// The topic's compression codec maps onto the built-in codecs as gzip or
/// nothing; anything smarter belongs to an external codec behind
/// [`FileCodec`].
pub fn build_codec(output: &OutputConfig) -> Arc<dyn FileCodec> {
    let gzip = output.compression.is_gzip();
    match output.codec {
        CodecKind::Delimited => Arc::new(DelimitedCodec::new(
            output.reader_delimiter,
            output.writer_delimiter,
            gzip,
        )),
        CodecKind::Sequence => Arc::new(SequenceCodec::new(gzip)),
    }
}

/// Counts bytes on their way to the underlying writer
pub(crate) struct CountingWriter<W: Write> {
    inner: W,
    count: Arc<AtomicU64>,
}

impl<W: Write> CountingWriter<W> {
    fn new(inner: W, count: Arc<AtomicU64>) -> Self {
        Self { inner, count }
    }
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.count.fetch_add(written as u64, Ordering::Relaxed);
        Ok(written)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// Shared output plumbing: buffered writes over an optional gzip layer over
/// a counting stream over the file
pub(crate) enum ByteSink {
    Plain(BufWriter<CountingWriter<File>>),
    Gzip(BufWriter<GzEncoder<CountingWriter<File>>>),
}

impl ByteSink {
    pub(crate) fn open(path: &Path, gzip: bool) -> Result<(Self, Arc<AtomicU64>)> {
        let count = Arc::new(AtomicU64::new(0));
        let counting = CountingWriter::new(File::create(path)?, count.clone());
        let sink = if gzip {
            ByteSink::Gzip(BufWriter::new(GzEncoder::new(
                counting,
                Compression::default(),
            )))
        } else {
            ByteSink::Plain(BufWriter::new(counting))
        };
        Ok((sink, count))
    }

    pub(crate) fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        match self {
            ByteSink::Plain(w) => w.write_all(buf),
            ByteSink::Gzip(w) => w.write_all(buf),
        }
    }

    /// Flush and finish the stream; the file is complete afterwards
    pub(crate) fn finish(self) -> Result<()> {
        match self {
            ByteSink::Plain(mut w) => {
                w.flush()?;
            }
            ByteSink::Gzip(w) => {
                let encoder = w.into_inner().map_err(|e| e.into_error())?;
                let mut counting = encoder.finish()?;
                counting.flush()?;
            }
        }
        Ok(())
    }
}

/// Shared input plumbing matching [`ByteSink`]
pub(crate) fn open_byte_source(path: &Path, gzip: bool) -> Result<Box<dyn BufRead + Send>> {
    let file = File::open(path)?;
    if gzip {
        Ok(Box::new(BufReader::new(GzDecoder::new(file))))
    } else {
        Ok(Box::new(BufReader::new(file)))
    }
}

/// Fill `buf` entirely, or return `Ok(false)` on a clean end of stream.
/// Bytes followed by end of stream are a framing error.
pub(crate) fn read_exact_or_eof<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        let read = reader.read(&mut buf[filled..])?;
        if read == 0 {
            if filled == 0 {
                return Ok(false);
            }
            return Err(ShipperError::framing("truncated record at end of file"));
        }
        filled += read;
    }
    Ok(true)
}

pub(crate) fn write_after_close() -> ShipperError {
    ShipperError::invariant("write to a closed record writer")
}

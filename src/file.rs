//! gzip file facade
//!
//! [`GzFile`] is the handle returned by [`open`]: one type for both
//! directions, dispatching to the threaded reader or writer, or to plain
//! flate2 streams when threading is disabled.

use std::any::{self, Any};
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, Read, Write};
use std::path::Path;

use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::{Compression, GzBuilder};

use crate::config::{Access, Mode, StreamConfig, Threads};
use crate::error::{PargzError, PargzResult};
use crate::threaded_reader::ThreadedReader;
use crate::threaded_writer::ThreadedWriter;

/// A boxed stream that can be unboxed back to its concrete type
trait SourceStream: Read + Send {
    fn into_any(self: Box<Self>) -> Box<dyn Any>;
}

impl<T: Read + Send + 'static> SourceStream for T {
    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

trait SinkStream: Write + Send {
    fn into_any(self: Box<Self>) -> Box<dyn Any>;
}

impl<T: Write + Send + 'static> SinkStream for T {
    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

type Source = Box<dyn SourceStream>;
type Sink = Box<dyn SinkStream>;

enum Inner {
    ThreadedRead(ThreadedReader<Source>),
    ThreadedWrite(ThreadedWriter<Sink>),
    PlainRead(MultiGzDecoder<BufReader<Source>>),
    PlainWrite(GzEncoder<Sink>),
    Closed,
}

/// An open gzip stream
pub struct GzFile {
    inner: Inner,
    mode: Mode,
    position: u64,
}

/// Open the gzip file at `path`.
///
/// `mode` is one of `rb`, `wb`, `ab`, `rt`, `wt`, `at` (or `r`, `w`, `a`).
/// Append mode adds new gzip members after whatever the file already holds.
pub fn open<P: AsRef<Path>>(path: P, mode: &str, config: StreamConfig) -> PargzResult<GzFile> {
    GzFile::open(path, mode, config)
}

impl GzFile {
    pub fn open<P: AsRef<Path>>(path: P, mode: &str, config: StreamConfig) -> PargzResult<Self> {
        let mode: Mode = mode.parse()?;
        validate(&config)?;
        let path = path.as_ref();
        match mode.access {
            Access::Read => {
                let file = File::open(path)?;
                Self::build_reader(Box::new(file), mode, config)
            }
            Access::Write => {
                let file = File::create(path)?;
                Self::build_writer(Box::new(file), mode, config)
            }
            Access::Append => {
                let file = OpenOptions::new().append(true).create(true).open(path)?;
                Self::build_writer(Box::new(file), mode, config)
            }
        }
    }

    /// Decompress from an already open stream.
    ///
    /// [`GzFile::finish`] hands `source` back; `close` or drop releases it.
    pub fn from_reader<R: Read + Send + 'static>(
        source: R,
        mode: &str,
        config: StreamConfig,
    ) -> PargzResult<Self> {
        let mode: Mode = mode.parse()?;
        if !mode.is_read() {
            return Err(PargzError::config(format!(
                "a reader cannot be opened in write mode {:?}",
                mode
            )));
        }
        validate(&config)?;
        Self::build_reader(Box::new(source), mode, config)
    }

    /// Compress into an already open stream. See [`GzFile::from_reader`].
    pub fn from_writer<W: Write + Send + 'static>(
        sink: W,
        mode: &str,
        config: StreamConfig,
    ) -> PargzResult<Self> {
        let mode: Mode = mode.parse()?;
        if mode.is_read() {
            return Err(PargzError::config(format!(
                "a writer cannot be opened in read mode {:?}",
                mode
            )));
        }
        validate(&config)?;
        Self::build_writer(Box::new(sink), mode, config)
    }

    fn build_reader(source: Source, mode: Mode, config: StreamConfig) -> PargzResult<Self> {
        let inner = match config.threads {
            Threads::Disabled => Inner::PlainRead(MultiGzDecoder::new(BufReader::with_capacity(
                config.read_buffer_size,
                source,
            ))),
            _ => Inner::ThreadedRead(ThreadedReader::new(source, config)?),
        };
        Ok(Self {
            inner,
            mode,
            position: 0,
        })
    }

    fn build_writer(sink: Sink, mode: Mode, config: StreamConfig) -> PargzResult<Self> {
        let inner = match config.threads {
            Threads::Disabled => Inner::PlainWrite(
                GzBuilder::new()
                    .mtime(0)
                    .write(sink, Compression::new(config.level)),
            ),
            _ => Inner::ThreadedWrite(ThreadedWriter::new(sink, config)?),
        };
        Ok(Self {
            inner,
            mode,
            position: 0,
        })
    }

    pub fn closed(&self) -> bool {
        matches!(self.inner, Inner::Closed)
    }

    pub fn readable(&self) -> bool {
        !self.closed() && self.mode.is_read()
    }

    pub fn writable(&self) -> bool {
        !self.closed() && !self.mode.is_read()
    }

    pub fn is_text(&self) -> bool {
        self.mode.text
    }

    /// Uncompressed bytes read or written so far
    pub fn tell(&self) -> u64 {
        self.position
    }

    /// Write UTF-8 text, returning the number of bytes written
    pub fn write_str(&mut self, text: &str) -> PargzResult<usize> {
        if !self.mode.text {
            return Err(PargzError::unsupported("write_str() on a binary mode stream"));
        }
        self.write_all(text.as_bytes())?;
        Ok(text.len())
    }

    /// Finish the stream and release the underlying file. Idempotent.
    pub fn close(&mut self) -> PargzResult<()> {
        match std::mem::replace(&mut self.inner, Inner::Closed) {
            Inner::ThreadedRead(mut reader) => reader.close(),
            Inner::ThreadedWrite(mut writer) => writer.close(),
            Inner::PlainRead(_) | Inner::Closed => Ok(()),
            Inner::PlainWrite(encoder) => {
                let mut sink = encoder.finish()?;
                sink.flush()?;
                Ok(())
            }
        }
    }
}

fn validate(config: &StreamConfig) -> PargzResult<()> {
    match config.threads {
        Threads::Disabled => config.validate_codec(),
        _ => config.validate().map(|_| ()),
    }
}

impl GzFile {
    /// Close the stream and hand back the underlying file or stream.
    ///
    /// `S` is the type given to [`GzFile::from_reader`] or
    /// [`GzFile::from_writer`], or [`File`] for [`open`]. A writer's sink is
    /// flushed, never closed. A reader's source is returned positioned
    /// after whatever was read ahead.
    pub fn finish<S: Any>(mut self) -> PargzResult<S> {
        let stream = match std::mem::replace(&mut self.inner, Inner::Closed) {
            Inner::ThreadedRead(reader) => <dyn SourceStream>::into_any(reader.finish()?),
            Inner::PlainRead(decoder) => <dyn SourceStream>::into_any(decoder.into_inner().into_inner()),
            Inner::ThreadedWrite(writer) => <dyn SinkStream>::into_any(writer.finish()?),
            Inner::PlainWrite(encoder) => {
                let mut sink = encoder.finish()?;
                sink.flush()?;
                <dyn SinkStream>::into_any(sink)
            }
            Inner::Closed => return Err(PargzError::Closed),
        };
        stream.downcast::<S>().map(|stream| *stream).map_err(|_| {
            PargzError::config(format!(
                "underlying stream is not a {}",
                any::type_name::<S>()
            ))
        })
    }
}

impl Read for GzFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = match &mut self.inner {
            Inner::ThreadedRead(reader) => reader.read(buf)?,
            Inner::PlainRead(decoder) => decoder.read(buf)?,
            Inner::ThreadedWrite(_) | Inner::PlainWrite(_) => {
                return Err(PargzError::unsupported("read() on write-only GzFile").into())
            }
            Inner::Closed => return Err(PargzError::Closed.into()),
        };
        self.position += n as u64;
        Ok(n)
    }
}

impl Write for GzFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = match &mut self.inner {
            Inner::ThreadedWrite(writer) => writer.write(buf)?,
            Inner::PlainWrite(encoder) => encoder.write(buf)?,
            Inner::ThreadedRead(_) | Inner::PlainRead(_) => {
                return Err(PargzError::unsupported("write() on read-only GzFile").into())
            }
            Inner::Closed => return Err(PargzError::Closed.into()),
        };
        self.position += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.inner {
            Inner::ThreadedWrite(writer) => writer.flush(),
            Inner::PlainWrite(encoder) => encoder.flush(),
            Inner::ThreadedRead(_) | Inner::PlainRead(_) => Ok(()),
            Inner::Closed => Err(PargzError::Closed.into()),
        }
    }
}

impl Drop for GzFile {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!("error closing dropped GzFile: {}", e);
        }
    }
}

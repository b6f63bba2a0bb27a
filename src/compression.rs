//! Compression entry points
//!
//! One-shot helpers for in-memory data plus the streaming driver the CLI
//! uses for files and stdin.

use std::io::{self, Read, Write};

use libdeflater::{CompressionLvl, Compressor};

use crate::config::StreamConfig;
use crate::error::{PargzError, PargzResult};
use crate::file::GzFile;
use crate::threaded_writer::ThreadedWriter;

/// Compress `data` into a single gzip member.
///
/// Uses libdeflate, which writes a zero MTIME, so the output depends only
/// on `data` and `level`.
pub fn compress(data: &[u8], level: u32) -> PargzResult<Vec<u8>> {
    if level > 9 {
        return Err(PargzError::InvalidLevel(level));
    }
    let lvl = CompressionLvl::new(level as i32).map_err(|_| PargzError::InvalidLevel(level))?;
    let mut compressor = Compressor::new(lvl);
    let mut out = vec![0u8; compressor.gzip_compress_bound(data.len())];
    let len = compressor
        .gzip_compress(data, &mut out)
        .map_err(|e| PargzError::compression(format!("{:?}", e)))?;
    out.truncate(len);
    Ok(out)
}

/// Compress `data` on the threaded pipeline: one gzip member per block.
pub fn compress_threaded(data: &[u8], config: &StreamConfig) -> PargzResult<Vec<u8>> {
    let mut writer = ThreadedWriter::new(Vec::with_capacity(data.len() / 2 + 64), config.clone())?;
    writer.write_all(data).map_err(PargzError::from_io)?;
    writer.finish()
}

/// Compress everything from `input` into `output`, returning the number of
/// raw bytes consumed. `output` is flushed, not closed.
pub fn compress_stream<R, W>(mut input: R, output: W, config: StreamConfig) -> PargzResult<u64>
where
    R: Read,
    W: Write + Send + 'static,
{
    let buffer_size = config.read_buffer_size;
    let mut gz = GzFile::from_writer(output, "wb", config)?;
    let copied = copy_blocks(&mut input, &mut gz, buffer_size)?;
    gz.close()?;
    tracing::debug!(bytes = copied, "compressed stream");
    Ok(copied)
}

/// Copy `input` to `output` in `buffer_size` reads
pub(crate) fn copy_blocks<R: Read + ?Sized, W: Write + ?Sized>(
    input: &mut R,
    output: &mut W,
    buffer_size: usize,
) -> PargzResult<u64> {
    let mut buf = vec![0u8; buffer_size.max(1)];
    let mut total = 0u64;
    loop {
        let n = match input.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(PargzError::from_io(e)),
        };
        output.write_all(&buf[..n]).map_err(PargzError::from_io)?;
        total += n as u64;
    }
    Ok(total)
}

//! Decompression entry points
//!
//! Multi-member gzip in, raw bytes out. The one-shot helper walks the same
//! source cursor the threaded reader uses, on the calling thread, so both
//! paths accept and reject exactly the same inputs.

use std::io::{Read, Write};

use crate::compression::copy_blocks;
use crate::config::{StreamConfig, DEFAULT_BLOCK_SIZE};
use crate::cursor::{materialize, Claim, SourceCursor};
use crate::error::{PargzError, PargzResult};
use crate::file::GzFile;

/// Decompress a complete (possibly multi-member) gzip stream held in memory
pub fn decompress(data: &[u8]) -> PargzResult<Vec<u8>> {
    let mut cursor = SourceCursor::new(data, data.len().max(16));
    let mut out = Vec::with_capacity(data.len().saturating_mul(3));
    loop {
        match cursor.claim(DEFAULT_BLOCK_SIZE) {
            Claim::Block { segments, .. } => out.extend_from_slice(&materialize(segments)?),
            Claim::End { .. } | Claim::Exhausted => return Ok(out),
            Claim::Failed { error, .. } => return Err(error),
        }
    }
}

/// Decompress everything from `input` into `output`, returning the number
/// of raw bytes written. `output` is flushed, not closed.
pub fn decompress_stream<R, W>(input: R, mut output: W, config: StreamConfig) -> PargzResult<u64>
where
    R: Read + Send + 'static,
    W: Write,
{
    let buffer_size = config.read_buffer_size;
    let mut gz = GzFile::from_reader(input, "rb", config)?;
    let copied = copy_blocks(&mut gz, &mut output, buffer_size)?;
    output.flush().map_err(PargzError::from_io)?;
    gz.close()?;
    tracing::debug!(bytes = copied, "decompressed stream");
    Ok(copied)
}

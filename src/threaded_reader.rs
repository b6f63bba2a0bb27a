//! Threaded gzip reader
//!
//! Workers take turns on a shared [`SourceCursor`]: the one holding the
//! lock claims the next sequence number and cuts off about one block of
//! compressed input, then releases the lock and inflates it in parallel
//! with the others. The caller's thread reassembles blocks in order inside
//! `read`.
//!
//! Read-ahead is bounded by credits. A worker has to take a credit before
//! it claims a block, and the caller hands one back each time a block
//! leaves the reorder buffer, so no more than `threads * queue_size`
//! blocks are ever decoded but not yet consumed.

use std::io::{self, Read};
use std::sync::{Arc, Mutex, PoisonError};

use crossbeam_channel::{bounded, Receiver, Sender};

use crate::config::StreamConfig;
use crate::cursor::{materialize, Claim, SourceCursor};
use crate::error::{PargzError, PargzResult};
use crate::reorder::Reassembler;
use crate::scheduler::{AbortFlag, BlockResult, WorkerPool};

type SharedCursor<R> = Arc<Mutex<SourceCursor<R>>>;

/// `None` marks the end of the stream
type Decoded = Option<Vec<u8>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ReaderState {
    Open,
    Reading,
    Closed,
}

/// Field order is drop order; see [`crate::scheduler`]
struct DecompressPipeline {
    credits: Sender<()>,
    results: Receiver<BlockResult<Decoded>>,
    pool: WorkerPool,
}

/// A `Read` adapter that decompresses gzip input on a pool of worker
/// threads, prefetching ahead of the caller.
///
/// Accepts any multi-member gzip stream. Members written by
/// [`ThreadedWriter`](crate::ThreadedWriter) are inflated fully in
/// parallel; other gzip data is still read ahead but inflated one member
/// at a time. The source is handed back by [`ThreadedReader::finish`] and
/// is never closed by the reader.
pub struct ThreadedReader<R: Read + Send + 'static> {
    cursor: Option<SharedCursor<R>>,
    config: StreamConfig,
    threads: usize,
    state: ReaderState,
    pipeline: Option<DecompressPipeline>,
    reorder: Reassembler<PargzResult<Decoded>>,
    current: Vec<u8>,
    current_pos: usize,
    eof: bool,
    position: u64,
}

impl<R: Read + Send + 'static> ThreadedReader<R> {
    /// Wrap `source`. The configuration is validated here; workers start
    /// on the first read.
    pub fn new(source: R, config: StreamConfig) -> PargzResult<Self> {
        let threads = config.validate()?;
        let cursor = SourceCursor::new(source, config.read_buffer_size);
        Ok(Self {
            cursor: Some(Arc::new(Mutex::new(cursor))),
            config,
            threads,
            state: ReaderState::Open,
            pipeline: None,
            reorder: Reassembler::new(),
            current: Vec::new(),
            current_pos: 0,
            eof: false,
            position: 0,
        })
    }

    /// Raw bytes returned to the caller so far
    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn is_closed(&self) -> bool {
        self.state == ReaderState::Closed
    }

    fn start(&mut self) -> PargzResult<()> {
        let cursor = self.cursor.clone().ok_or(PargzError::Closed)?;
        let window = self.threads * self.config.reader_queue_size();
        let (credit_tx, credit_rx) = bounded(window);
        for _ in 0..window {
            // Cannot fail: the channel was sized for exactly this
            let _ = credit_tx.try_send(());
        }
        let (result_tx, results) = bounded(window);
        let abort = AbortFlag::new();
        let block_size = self.config.block_size;

        let pool = WorkerPool::spawn("inflate", self.threads, abort.clone(), |_| {
            let cursor = Arc::clone(&cursor);
            let credits = credit_rx.clone();
            let results = result_tx.clone();
            let abort = abort.clone();
            move || decompress_worker(cursor, credits, results, abort, block_size)
        })?;

        self.pipeline = Some(DecompressPipeline {
            credits: credit_tx,
            results,
            pool,
        });
        self.state = ReaderState::Reading;
        tracing::debug!(
            threads = self.threads,
            block_size,
            window,
            "threaded reader started"
        );
        Ok(())
    }

    /// Stop read-ahead and join the workers
    fn shutdown(&mut self) -> PargzResult<()> {
        let Some(pipeline) = self.pipeline.take() else {
            return Ok(());
        };
        pipeline.pool.abort();
        let DecompressPipeline {
            credits,
            results,
            pool,
        } = pipeline;
        drop(credits);
        drop(results);
        pool.join()
    }

    fn fail(&mut self, err: PargzError) -> PargzError {
        tracing::warn!("threaded reader failed: {}", err);
        if let Err(e) = self.shutdown() {
            tracing::warn!("{}", e);
        }
        self.discard();
        self.state = ReaderState::Closed;
        err
    }

    fn discard(&mut self) {
        self.reorder.clear();
        self.current = Vec::new();
        self.current_pos = 0;
    }

    /// Next decoded block in sequence order, or `None` at end of stream
    fn next_block(&mut self) -> PargzResult<Decoded> {
        let pipeline = self.pipeline.as_ref().ok_or(PargzError::Closed)?;
        loop {
            if let Some(item) = self.reorder.pop_ready() {
                // The worker that produced it may now claim another block
                let _ = pipeline.credits.try_send(());
                return item;
            }
            let result = pipeline.pool.recv(&pipeline.results)?;
            tracing::trace!(seq = result.seq, "block decoded");
            self.reorder.insert(result.seq, result.outcome);
        }
    }

    fn read_decoded(&mut self, buf: &mut [u8]) -> PargzResult<usize> {
        match self.state {
            ReaderState::Closed => return Err(PargzError::Closed),
            ReaderState::Open => self.start()?,
            ReaderState::Reading => {}
        }
        if buf.is_empty() {
            return Ok(0);
        }

        loop {
            if self.current_pos < self.current.len() {
                let n = buf.len().min(self.current.len() - self.current_pos);
                buf[..n].copy_from_slice(&self.current[self.current_pos..self.current_pos + n]);
                self.current_pos += n;
                self.position += n as u64;
                return Ok(n);
            }
            if self.eof {
                return Ok(0);
            }
            match self.next_block()? {
                Some(block) => {
                    self.current = block;
                    self.current_pos = 0;
                }
                None => {
                    self.eof = true;
                    self.shutdown()?;
                    tracing::debug!(bytes = self.position, "threaded reader reached end of stream");
                }
            }
        }
    }

    /// Stop read-ahead, join the workers and discard buffered data.
    ///
    /// Idempotent.
    pub fn close(&mut self) -> PargzResult<()> {
        if self.state == ReaderState::Closed {
            return Ok(());
        }
        self.state = ReaderState::Closed;
        self.discard();
        self.shutdown()
    }

    /// Close and hand back the source
    pub fn finish(mut self) -> PargzResult<R> {
        self.close()?;
        let cursor = self.cursor.take().ok_or(PargzError::Closed)?;
        let cursor = Arc::try_unwrap(cursor)
            .map_err(|_| PargzError::thread("source still shared with a worker"))?;
        let cursor = cursor.into_inner().unwrap_or_else(PoisonError::into_inner);
        Ok(cursor.into_source())
    }
}

fn decompress_worker<R: Read>(
    cursor: SharedCursor<R>,
    credits: Receiver<()>,
    results: Sender<BlockResult<Decoded>>,
    abort: AbortFlag,
    block_size: usize,
) {
    loop {
        if credits.recv().is_err() || abort.is_raised() {
            break;
        }

        // Only the claim happens under the lock; inflating does not
        let claim = cursor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .claim(block_size);

        let result = match claim {
            Claim::Block { seq, segments } => BlockResult {
                seq,
                outcome: materialize(segments).map(Some),
            },
            Claim::End { seq } => BlockResult {
                seq,
                outcome: Ok(None),
            },
            Claim::Failed { seq, error } => BlockResult {
                seq,
                outcome: Err(error),
            },
            Claim::Exhausted => break,
        };
        if let Err(e) = &result.outcome {
            tracing::warn!(seq = result.seq, "block failed to decode: {}", e);
        }
        if results.send(result).is_err() {
            break;
        }
    }
}

impl<R: Read + Send + 'static> Read for ThreadedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.read_decoded(buf) {
            Ok(n) => Ok(n),
            Err(PargzError::Closed) => Err(PargzError::Closed.into()),
            Err(e) => Err(self.fail(e).into()),
        }
    }
}

impl<R: Read + Send + 'static> Drop for ThreadedReader<R> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!("error closing dropped reader: {}", e);
        }
    }
}

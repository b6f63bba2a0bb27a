//! Threaded gzip writer
//!
//! The caller's thread splits written bytes into `block_size` blocks and
//! deals them round-robin onto one bounded queue per worker. Each worker
//! compresses its block into a self-contained gzip member and sends it back
//! tagged with the block's sequence number. The caller's thread puts
//! members back in order and writes them to the sink, so the sink is only
//! ever touched from one thread.
//!
//! When every worker queue is full `write` blocks, but it keeps draining
//! finished members while it waits; a worker can therefore never be stuck
//! on a full result queue while the dispatcher is stuck on a full input
//! queue.

use std::io::{self, Write};

use crossbeam_channel::{bounded, Receiver, Select, Sender};

use crate::codec::MemberEncoder;
use crate::config::StreamConfig;
use crate::error::{PargzError, PargzResult};
use crate::reorder::Reassembler;
use crate::scheduler::{AbortFlag, Block, BlockResult, WorkerPool};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum WriterState {
    Open,
    Writing,
    Closed,
}

/// Channels and workers of a running pipeline.
///
/// Field order is drop order: the senders go first so idle workers see a
/// disconnected queue, then the result receiver so busy workers fail their
/// send, and only then is the pool joined.
struct CompressPipeline {
    inputs: Vec<Sender<Block>>,
    results: Receiver<BlockResult<Vec<u8>>>,
    pool: WorkerPool,
}

/// A `Write` adapter that gzip-compresses on a pool of worker threads.
///
/// The output is a sequence of independent gzip members, one per block,
/// readable by any multi-member gzip decoder. The sink is borrowed for the
/// lifetime of the writer and handed back by [`ThreadedWriter::finish`];
/// it is flushed on close but never closed.
pub struct ThreadedWriter<W: Write> {
    sink: Option<W>,
    config: StreamConfig,
    threads: usize,
    state: WriterState,
    pending: Vec<u8>,
    pipeline: Option<CompressPipeline>,
    next_seq: u64,
    reorder: Reassembler<Vec<u8>>,
    position: u64,
}

impl<W: Write> ThreadedWriter<W> {
    /// Wrap `sink`. The configuration is validated here; no thread is
    /// started until the first write.
    pub fn new(sink: W, config: StreamConfig) -> PargzResult<Self> {
        let threads = config.validate()?;
        Ok(Self {
            sink: Some(sink),
            pending: Vec::new(),
            config,
            threads,
            state: WriterState::Open,
            pipeline: None,
            next_seq: 0,
            reorder: Reassembler::new(),
            position: 0,
        })
    }

    /// Raw bytes accepted so far
    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn is_closed(&self) -> bool {
        self.state == WriterState::Closed
    }

    pub fn get_ref(&self) -> Option<&W> {
        self.sink.as_ref()
    }

    fn start(&mut self) -> PargzResult<()> {
        let queue_size = self.config.writer_queue_size();
        let (result_tx, results) = bounded(self.threads * queue_size);
        let abort = AbortFlag::new();
        let mut inputs = Vec::with_capacity(self.threads);
        let level = self.config.level;
        let block_size = self.config.block_size;

        let pool = WorkerPool::spawn("deflate", self.threads, abort.clone(), |_| {
            let (input_tx, input_rx) = bounded(queue_size);
            inputs.push(input_tx);
            let result_tx = result_tx.clone();
            let abort = abort.clone();
            move || compress_worker(input_rx, result_tx, abort, level, block_size)
        })?;

        self.pipeline = Some(CompressPipeline {
            inputs,
            results,
            pool,
        });
        self.state = WriterState::Writing;
        tracing::debug!(
            threads = self.threads,
            block_size,
            level,
            queue_size,
            "threaded writer started"
        );
        Ok(())
    }

    fn check_open(&mut self) -> PargzResult<()> {
        match self.state {
            WriterState::Closed => Err(PargzError::Closed),
            WriterState::Open => self.start(),
            WriterState::Writing => Ok(()),
        }
    }

    /// Abort the pipeline and park the writer in its terminal state.
    fn fail(&mut self, err: PargzError) -> PargzError {
        tracing::warn!("threaded writer failed: {}", err);
        if let Some(pipeline) = self.pipeline.take() {
            pipeline.pool.abort();
            drop(pipeline);
        }
        self.pending = Vec::new();
        self.reorder.clear();
        self.state = WriterState::Closed;
        err
    }

    fn write_blocks(&mut self, mut data: &[u8]) -> PargzResult<()> {
        let block_size = self.config.block_size;
        while !data.is_empty() {
            let take = (block_size - self.pending.len()).min(data.len());
            // Grow with the data actually written, not the configured block size
            self.pending.reserve(take);
            self.pending.extend_from_slice(&data[..take]);
            data = &data[take..];
            if self.pending.len() == block_size {
                let block = std::mem::take(&mut self.pending);
                self.dispatch(block, false)?;
            }
        }
        self.drain_ready()
    }

    /// Hand one block to its worker, emitting finished members while the
    /// worker's queue is full.
    fn dispatch(&mut self, data: Vec<u8>, is_final: bool) -> PargzResult<()> {
        let seq = self.next_seq;
        let worker = (seq % self.threads as u64) as usize;
        let pipeline = self.pipeline.as_mut().ok_or(PargzError::Closed)?;
        let sink = self.sink.as_mut().ok_or(PargzError::Closed)?;
        let block = Block {
            seq,
            data,
            is_final,
        };
        tracing::trace!(seq, worker, len = block.data.len(), is_final, "dispatch block");

        loop {
            let mut select = Select::new();
            let send_index = select.send(&pipeline.inputs[worker]);
            let result_index = select.recv(&pipeline.results);
            select.recv(pipeline.pool.failures());
            let op = select.select();
            if op.index() == send_index {
                op.send(&pipeline.inputs[worker], block)
                    .map_err(|_| PargzError::thread("compression worker exited early"))?;
                break;
            }
            if op.index() != result_index {
                return Err(pipeline.pool.lost(op.recv(pipeline.pool.failures())));
            }
            let result = op
                .recv(&pipeline.results)
                .map_err(|_| PargzError::thread("compression workers exited early"))?;
            emit(&mut self.reorder, sink, result)?;
        }

        self.next_seq += 1;
        Ok(())
    }

    /// Emit whatever members are already finished, without blocking
    fn drain_ready(&mut self) -> PargzResult<()> {
        let (Some(pipeline), Some(sink)) = (self.pipeline.as_ref(), self.sink.as_mut()) else {
            return Ok(());
        };
        while let Ok(result) = pipeline.results.try_recv() {
            emit(&mut self.reorder, sink, result)?;
        }
        Ok(())
    }

    /// Block until every dispatched member has been written to the sink
    fn wait_all(&mut self) -> PargzResult<()> {
        let (Some(pipeline), Some(sink)) = (self.pipeline.as_ref(), self.sink.as_mut()) else {
            return Ok(());
        };
        while self.reorder.next_sequence() < self.next_seq {
            let result = pipeline.pool.recv(&pipeline.results)?;
            emit(&mut self.reorder, sink, result)?;
        }
        Ok(())
    }

    fn flush_blocks(&mut self) -> PargzResult<()> {
        if self.state == WriterState::Closed {
            return Err(PargzError::Closed);
        }
        if !self.pending.is_empty() {
            let block = std::mem::take(&mut self.pending);
            self.dispatch(block, false)?;
        }
        self.wait_all()?;
        if let Some(sink) = self.sink.as_mut() {
            sink.flush()?;
        }
        Ok(())
    }

    fn close_pipeline(&mut self) -> PargzResult<()> {
        if self.state == WriterState::Open {
            self.start()?;
        }
        // An untouched stream still gets one empty member
        if !self.pending.is_empty() || self.next_seq == 0 {
            let block = std::mem::take(&mut self.pending);
            self.dispatch(block, true)?;
        }

        let Some(mut pipeline) = self.pipeline.take() else {
            return Ok(());
        };
        let sink = self.sink.as_mut().ok_or(PargzError::Closed)?;
        pipeline.inputs.clear();
        for result in pipeline.results.iter() {
            emit(&mut self.reorder, sink, result)?;
        }
        pipeline.pool.join()?;

        if self.reorder.next_sequence() != self.next_seq {
            return Err(PargzError::thread(format!(
                "{} of {} blocks never came back from the workers",
                self.next_seq - self.reorder.next_sequence(),
                self.next_seq
            )));
        }
        sink.flush()?;
        tracing::debug!(blocks = self.next_seq, bytes = self.position, "threaded writer closed");
        Ok(())
    }

    /// Write the final member, join the workers and flush the sink.
    ///
    /// Closing an already closed (or failed) writer is a no-op.
    pub fn close(&mut self) -> PargzResult<()> {
        if self.state == WriterState::Closed {
            return Ok(());
        }
        match self.close_pipeline() {
            Ok(()) => {
                self.state = WriterState::Closed;
                Ok(())
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Close and hand back the sink
    pub fn finish(mut self) -> PargzResult<W> {
        self.close()?;
        self.sink.take().ok_or(PargzError::Closed)
    }

    /// Send a block past the splitter, as if one oversized block had been
    /// handed to a worker.
    #[cfg(test)]
    pub(crate) fn dispatch_raw(&mut self, data: Vec<u8>) -> PargzResult<()> {
        self.check_open()?;
        match self.dispatch(data, false) {
            Ok(()) => Ok(()),
            Err(e) => Err(self.fail(e)),
        }
    }
}

/// Release finished members to the sink in sequence order
fn emit<W: Write>(
    reorder: &mut Reassembler<Vec<u8>>,
    sink: &mut W,
    result: BlockResult<Vec<u8>>,
) -> PargzResult<()> {
    let member = result.outcome?;
    reorder.insert(result.seq, member);
    while let Some(member) = reorder.pop_ready() {
        tracing::trace!(seq = reorder.next_sequence() - 1, len = member.len(), "emit member");
        sink.write_all(&member)?;
    }
    Ok(())
}

fn compress_worker(
    blocks: Receiver<Block>,
    results: Sender<BlockResult<Vec<u8>>>,
    abort: AbortFlag,
    level: u32,
    block_size: usize,
) {
    let mut encoder = MemberEncoder::new(level, block_size);
    for block in blocks.iter() {
        // Queued blocks are dropped once the stream has failed
        if abort.is_raised() {
            continue;
        }
        let mut member = Vec::with_capacity(block.data.len() / 2 + 64);
        let outcome = encoder.encode(&block.data, &mut member).map(|_| member);
        if block.is_final {
            tracing::trace!(seq = block.seq, "final block compressed");
        }
        if let Err(e) = &outcome {
            tracing::warn!(seq = block.seq, "block failed to compress: {}", e);
            abort.raise();
        }
        if results
            .send(BlockResult {
                seq: block.seq,
                outcome,
            })
            .is_err()
        {
            break;
        }
    }
}

impl<W: Write> Write for ThreadedWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.check_open()?;
        match self.write_blocks(buf) {
            Ok(()) => {
                self.position += buf.len() as u64;
                Ok(buf.len())
            }
            Err(e) => Err(self.fail(e).into()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.flush_blocks() {
            Ok(()) => Ok(()),
            Err(PargzError::Closed) => Err(PargzError::Closed.into()),
            Err(e) => Err(self.fail(e).into()),
        }
    }
}

impl<W: Write> Drop for ThreadedWriter<W> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!("error closing dropped writer: {}", e);
        }
    }
}

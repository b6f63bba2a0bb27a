//! Worker pool shared by the threaded reader and writer
//!
//! The threading model:
//!
//! 1. N named worker threads, each running the same loop
//! 2. Bounded crossbeam channels between the stream handle and the workers
//! 3. Every result tagged with the sequence number of the block it came from
//! 4. A shared abort flag that tells workers to stop doing useful work
//!
//! Shutdown is driven by the channels: when the owning stream drops its
//! senders, workers see a disconnected queue and exit. The pool only has
//! to join them. Fields holding channel ends must therefore be dropped
//! before the pool, or the join would wait forever.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, RecvError, Select, TryRecvError};

use crate::error::{PargzError, PargzResult};

/// One block of raw (writer) work
#[derive(Debug)]
pub struct Block {
    pub seq: u64,
    pub data: Vec<u8>,
    pub is_final: bool,
}

/// A worker's output for one sequence number
#[derive(Debug)]
pub struct BlockResult<T> {
    pub seq: u64,
    pub outcome: PargzResult<T>,
}

/// Cancellation signal shared between a stream handle and its workers
#[derive(Clone, Debug, Default)]
pub struct AbortFlag(Arc<AtomicBool>);

impl AbortFlag {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn raise(&self) {
        self.0.store(true, Ordering::Release);
    }

    #[inline]
    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// A fixed set of worker threads
///
/// Joined on drop, after raising the abort flag. A worker that panics
/// raises the abort flag and posts its index on [`WorkerPool::failures`]
/// before unwinding, so whoever waits on its results can stop waiting.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    abort: AbortFlag,
    role: String,
    failures: Receiver<usize>,
}

impl WorkerPool {
    /// Spawn `threads` workers named `pargz-{role}-{index}`.
    ///
    /// `factory` is called once per worker, on the spawning thread, with the
    /// worker index; the closure it returns becomes that worker's body.
    pub fn spawn<F, B>(role: &str, threads: usize, abort: AbortFlag, mut factory: F) -> PargzResult<Self>
    where
        F: FnMut(usize) -> B,
        B: FnOnce() + Send + 'static,
    {
        let (failed_tx, failures) = bounded(threads.max(1));
        let mut pool = WorkerPool {
            handles: Vec::with_capacity(threads),
            abort,
            role: role.to_owned(),
            failures,
        };
        for index in 0..threads {
            let body = factory(index);
            let failed_tx = failed_tx.clone();
            let abort = pool.abort.clone();
            let run = move || {
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(body)) {
                    abort.raise();
                    let _ = failed_tx.try_send(index);
                    panic::resume_unwind(payload);
                }
            };
            let handle = match thread::Builder::new()
                .name(format!("pargz-{}-{}", role, index))
                .spawn(run)
            {
                Ok(handle) => handle,
                Err(e) => {
                    // Workers already running exit once the caller drops
                    // their channels; joining here could wait on them forever
                    pool.abort.raise();
                    pool.handles.clear();
                    return Err(PargzError::thread(format!("failed to spawn worker: {}", e)));
                }
            };
            pool.handles.push(handle);
        }
        tracing::debug!(role, threads, "worker pool started");
        Ok(pool)
    }

    /// Indices of workers that panicked. Disconnects once every worker
    /// has exited.
    pub fn failures(&self) -> &Receiver<usize> {
        &self.failures
    }

    /// The error to raise for a message (or disconnect) on [`WorkerPool::failures`]
    pub fn lost(&self, notice: Result<usize, RecvError>) -> PargzError {
        match notice {
            Ok(index) => PargzError::thread(format!("{} worker {} panicked", self.role, index)),
            Err(_) => PargzError::thread(format!("{} workers exited early", self.role)),
        }
    }

    /// Next result from `results`, failing instead of blocking forever if
    /// a worker dies while the rest sit idle.
    pub fn recv<T>(&self, results: &Receiver<T>) -> PargzResult<T> {
        match results.try_recv() {
            Ok(result) => return Ok(result),
            Err(TryRecvError::Disconnected) => return Err(self.lost(Err(RecvError))),
            Err(TryRecvError::Empty) => {}
        }
        let mut select = Select::new();
        let result_index = select.recv(results);
        select.recv(&self.failures);
        let op = select.select();
        if op.index() == result_index {
            return op.recv(results).map_err(|e| self.lost(Err(e)));
        }
        match op.recv(&self.failures) {
            Ok(index) => Err(self.lost(Ok(index))),
            // Every worker is gone; anything they sent is already queued
            Err(_) => results.recv().map_err(|e| self.lost(Err(e))),
        }
    }

    /// Ask workers to stop at their next check
    pub fn abort(&self) {
        self.abort.raise();
    }

    /// Wait for every worker to exit.
    ///
    /// A panicked worker is reported as a thread error once all others
    /// have been joined.
    pub fn join(mut self) -> PargzResult<()> {
        self.join_all()
    }

    fn join_all(&mut self) -> PargzResult<()> {
        let mut panicked = 0;
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                panicked += 1;
            }
        }
        if panicked > 0 {
            return Err(PargzError::thread(format!("{} worker(s) panicked", panicked)));
        }
        Ok(())
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if self.handles.is_empty() {
            return;
        }
        self.abort.raise();
        if let Err(e) = self.join_all() {
            tracing::warn!("{}", e);
        }
    }
}

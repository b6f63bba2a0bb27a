//! Stream configuration and open-mode parsing
//!
//! All tunables live on [`StreamConfig`], fixed when a stream is
//! constructed. Validation runs before any worker thread is spawned so
//! that a bad configuration never leaves half-started threads behind.

use std::str::FromStr;

use crate::error::{PargzError, PargzResult};

/// Default raw bytes per block (one gzip member per block on the write side)
pub const DEFAULT_BLOCK_SIZE: usize = 1024 * 1024;

/// Default compression level, zlib's speed/size tradeoff
pub const DEFAULT_LEVEL: u32 = 6;

/// Default size of each read issued against the underlying source
pub const DEFAULT_READ_BUFFER_SIZE: usize = 128 * 1024;

/// Largest accepted block (and read buffer). A member for a block this
/// size, including deflate headroom, still fits the 32-bit size marker.
pub const MAX_BLOCK_SIZE: usize = 1 << 30;

/// Largest accepted per-worker queue depth
pub const MAX_QUEUE_SIZE: usize = 1024;

/// Cap on `threads * queue_size`: channel slots are allocated up front
pub const MAX_BLOCKS_IN_FLIGHT: usize = 1 << 16;

/// How many worker threads a stream uses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Threads {
    /// No pipeline: the single-threaded flate2 path handles the stream
    Disabled,
    /// A fixed number of workers
    Count(usize),
    /// One worker per available core
    AllCores,
}

impl Threads {
    /// Resolve to a concrete worker count.
    ///
    /// `Disabled` resolves to 0; callers that need a pipeline reject it.
    pub fn resolve(self) -> usize {
        match self {
            Threads::Disabled => 0,
            Threads::Count(n) => n,
            Threads::AllCores => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
        }
    }
}

/// `0` disables threading, negative values mean "all cores".
impl From<i64> for Threads {
    fn from(n: i64) -> Self {
        match n {
            0 => Threads::Disabled,
            n if n < 0 => Threads::AllCores,
            n => Threads::Count(n as usize),
        }
    }
}

/// Configuration shared by the threaded reader, writer and file facade
#[derive(Clone, Debug)]
pub struct StreamConfig {
    pub threads: Threads,
    pub block_size: usize,
    pub level: u32,
    /// Capacity of each bounded queue. `None` picks the per-direction
    /// default: 1 block per writer queue, 2 blocks of read-ahead per reader worker.
    pub queue_size: Option<usize>,
    pub read_buffer_size: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            threads: Threads::Count(1),
            block_size: DEFAULT_BLOCK_SIZE,
            level: DEFAULT_LEVEL,
            queue_size: None,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
        }
    }
}

impl StreamConfig {
    pub fn with_threads(mut self, threads: Threads) -> Self {
        self.threads = threads;
        self
    }

    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn with_level(mut self, level: u32) -> Self {
        self.level = level;
        self
    }

    pub fn with_queue_size(mut self, queue_size: usize) -> Self {
        self.queue_size = Some(queue_size);
        self
    }

    pub fn with_read_buffer_size(mut self, read_buffer_size: usize) -> Self {
        self.read_buffer_size = read_buffer_size;
        self
    }

    pub(crate) fn writer_queue_size(&self) -> usize {
        self.queue_size.unwrap_or(1)
    }

    pub(crate) fn reader_queue_size(&self) -> usize {
        self.queue_size.unwrap_or(2)
    }

    /// Check everything that does not depend on the thread count
    pub fn validate_codec(&self) -> PargzResult<()> {
        if self.level > 9 {
            return Err(PargzError::InvalidLevel(self.level));
        }
        check_range("block_size", self.block_size, MAX_BLOCK_SIZE)?;
        if let Some(queue_size) = self.queue_size {
            check_range("queue_size", queue_size, MAX_QUEUE_SIZE)?;
        }
        check_range("read_buffer_size", self.read_buffer_size, MAX_BLOCK_SIZE)?;
        Ok(())
    }

    /// Validate for use by a threaded pipeline and return the worker count.
    pub fn validate(&self) -> PargzResult<usize> {
        self.validate_codec()?;
        let threads = self.threads.resolve();
        if threads < 1 {
            return Err(PargzError::config(format!(
                "threads should be at least 1, got {}",
                threads
            )));
        }
        // The reader's default depth is the deeper of the two directions
        let in_flight = threads.checked_mul(self.reader_queue_size());
        match in_flight {
            Some(n) if n <= MAX_BLOCKS_IN_FLIGHT => Ok(threads),
            _ => Err(PargzError::config(format!(
                "threads * queue_size should be at most {}, got {} * {}",
                MAX_BLOCKS_IN_FLIGHT,
                threads,
                self.reader_queue_size()
            ))),
        }
    }
}

fn check_range(name: &str, value: usize, max: usize) -> PargzResult<()> {
    if value == 0 {
        return Err(PargzError::config(format!("{} should be at least 1", name)));
    }
    if value > max {
        return Err(PargzError::config(format!(
            "{} should be at most {}, got {}",
            name, max, value
        )));
    }
    Ok(())
}

/// Direction of an opened stream
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
    Append,
}

/// Parsed open mode such as `"rb"` or `"at"`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Mode {
    pub access: Access,
    pub text: bool,
}

impl Mode {
    pub fn is_read(&self) -> bool {
        self.access == Access::Read
    }
}

impl FromStr for Mode {
    type Err = PargzError;

    fn from_str(s: &str) -> PargzResult<Self> {
        let (access, text) = match s {
            "r" | "rb" => (Access::Read, false),
            "rt" => (Access::Read, true),
            "w" | "wb" => (Access::Write, false),
            "wt" => (Access::Write, true),
            "a" | "ab" => (Access::Append, false),
            "at" => (Access::Append, true),
            other => return Err(PargzError::config(format!("Invalid mode: {:?}", other))),
        };
        Ok(Mode { access, text })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threads_from_int() {
        assert_eq!(Threads::from(0i64), Threads::Disabled);
        assert_eq!(Threads::from(3i64), Threads::Count(3));
        assert_eq!(Threads::from(-1i64), Threads::AllCores);
        assert!(Threads::AllCores.resolve() >= 1);
        assert_eq!(Threads::Disabled.resolve(), 0);
    }

    #[test]
    fn test_validate_rejects_bad_level() {
        let config = StreamConfig::default().with_level(42);
        let err = config.validate().unwrap_err();
        assert!(matches!(err, PargzError::InvalidLevel(42)));
        assert!(err.to_string().contains("Bad compression level"));
    }

    #[test]
    fn test_validate_rejects_zero_threads() {
        let config = StreamConfig::default().with_threads(Threads::Disabled);
        let err = config.validate().unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("threads"));
        assert!(msg.contains("at least 1"));
    }

    #[test]
    fn test_validate_rejects_zero_sizes() {
        assert!(StreamConfig::default().with_block_size(0).validate().is_err());
        assert!(StreamConfig::default().with_queue_size(0).validate().is_err());
        assert!(StreamConfig::default()
            .with_read_buffer_size(0)
            .validate()
            .is_err());
    }

    #[test]
    fn test_validate_rejects_oversized_values() {
        let err = StreamConfig::default()
            .with_queue_size(usize::MAX)
            .validate()
            .unwrap_err();
        assert!(matches!(err, PargzError::Config(_)));
        assert!(err.to_string().contains("queue_size"));

        for block_size in [MAX_BLOCK_SIZE + 1, u32::MAX as usize + 1, usize::MAX / 2] {
            let err = StreamConfig::default()
                .with_block_size(block_size)
                .validate()
                .unwrap_err();
            assert!(err.to_string().contains("block_size should be at most"));
        }
        assert!(StreamConfig::default()
            .with_read_buffer_size(usize::MAX)
            .validate()
            .is_err());
        assert!(StreamConfig::default()
            .with_block_size(MAX_BLOCK_SIZE)
            .validate()
            .is_ok());
    }

    #[test]
    fn test_validate_bounds_blocks_in_flight() {
        // Would overflow the multiplication without the checked product
        let config = StreamConfig::default()
            .with_threads(Threads::Count(usize::MAX / 2))
            .with_queue_size(MAX_QUEUE_SIZE);
        assert!(matches!(config.validate(), Err(PargzError::Config(_))));

        let config = StreamConfig::default()
            .with_threads(Threads::Count(MAX_BLOCKS_IN_FLIGHT))
            .with_queue_size(2);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("threads * queue_size"));

        let config = StreamConfig::default()
            .with_threads(Threads::Count(MAX_BLOCKS_IN_FLIGHT / MAX_QUEUE_SIZE))
            .with_queue_size(MAX_QUEUE_SIZE);
        assert_eq!(config.validate().unwrap(), MAX_BLOCKS_IN_FLIGHT / MAX_QUEUE_SIZE);
    }

    #[test]
    fn test_defaults() {
        let config = StreamConfig::default();
        assert_eq!(config.validate().unwrap(), 1);
        assert_eq!(config.writer_queue_size(), 1);
        assert_eq!(config.reader_queue_size(), 2);
        assert_eq!(config.with_queue_size(4).writer_queue_size(), 4);
    }

    #[test]
    fn test_mode_parsing() {
        let m: Mode = "rb".parse().unwrap();
        assert_eq!(m, Mode { access: Access::Read, text: false });
        let m: Mode = "at".parse().unwrap();
        assert_eq!(m, Mode { access: Access::Append, text: true });
        let m: Mode = "w".parse().unwrap();
        assert_eq!(m.access, Access::Write);
        assert!("rw".parse::<Mode>().is_err());
        assert!("x".parse::<Mode>().is_err());
    }
}

//! pargz - threaded gzip streams
//!
//! Compression splits the input into blocks and deflates each block on a
//! worker thread as an independent gzip member; the members are written in
//! order, so the result is an ordinary multi-member gzip file. Decompression
//! reads ahead on worker threads and hands back bytes in order through a
//! plain `Read` interface.
//!
//! ```no_run
//! use std::io::{Read, Write};
//! use pargz::{StreamConfig, Threads};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = StreamConfig::default().with_threads(Threads::AllCores);
//! let mut f = pargz::open("data.gz", "wb", config.clone())?;
//! f.write_all(b"hello")?;
//! f.close()?;
//!
//! let mut f = pargz::open("data.gz", "rb", config)?;
//! let mut text = String::new();
//! f.read_to_string(&mut text)?;
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod compression;
pub mod config;
pub mod cursor;
pub mod decompression;
pub mod error;
pub mod file;
pub mod reorder;
pub mod scheduler;
pub mod threaded_reader;
pub mod threaded_writer;

#[cfg(test)]
mod pipeline_tests;

pub use compression::{compress, compress_stream, compress_threaded};
pub use config::{Mode, StreamConfig, Threads, DEFAULT_BLOCK_SIZE, DEFAULT_LEVEL};
pub use decompression::{decompress, decompress_stream};
pub use error::{PargzError, PargzResult};
pub use file::{open, GzFile};
pub use threaded_reader::ThreadedReader;
pub use threaded_writer::ThreadedWriter;

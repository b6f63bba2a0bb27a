//! Command line arguments

use std::path::{Path, PathBuf};

use clap::{ArgAction, ArgGroup, Parser};
use pargz::config::DEFAULT_READ_BUFFER_SIZE;
use pargz::{PargzError, PargzResult, StreamConfig, Threads, DEFAULT_BLOCK_SIZE, DEFAULT_LEVEL};

const GZ_SUFFIX: &str = ".gz";

#[derive(Debug, Parser)]
#[command(
    name = "pargz",
    version,
    about = "Compress or decompress a file with gzip, using multiple threads. Acts like gzip."
)]
#[command(group(ArgGroup::new("level").multiple(false)))]
pub struct PargzArgs {
    /// File to compress or decompress (stdin when omitted or "-")
    #[arg(value_name = "FILE")]
    pub file: Option<PathBuf>,

    /// Use compression level 1
    #[arg(short = '1', long = "fast", group = "level")]
    fast: bool,
    /// Use compression level 2
    #[arg(short = '2', group = "level")]
    level_2: bool,
    /// Use compression level 3
    #[arg(short = '3', group = "level")]
    level_3: bool,
    /// Use compression level 4
    #[arg(short = '4', group = "level")]
    level_4: bool,
    /// Use compression level 5
    #[arg(short = '5', group = "level")]
    level_5: bool,
    /// Use compression level 6
    #[arg(short = '6', group = "level")]
    level_6: bool,
    /// Use compression level 7
    #[arg(short = '7', group = "level")]
    level_7: bool,
    /// Use compression level 8
    #[arg(short = '8', group = "level")]
    level_8: bool,
    /// Use compression level 9
    #[arg(short = '9', long = "best", group = "level")]
    best: bool,

    /// Decompress the file instead of compressing
    #[arg(short = 'd', long, conflicts_with = "level")]
    pub decompress: bool,

    /// Write on standard output
    #[arg(short = 'c', long, conflicts_with = "output")]
    pub stdout: bool,

    /// Write to this output file
    #[arg(short = 'o', long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Do not save or restore the original name and timestamp
    #[arg(short = 'n', long)]
    pub no_name: bool,

    /// Overwrite output without prompting
    #[arg(short = 'f', long)]
    pub force: bool,

    /// Worker threads; 0 runs single-threaded, negative uses every core
    #[arg(
        short = 'p',
        long = "processes",
        value_name = "THREADS",
        default_value_t = -1,
        allow_negative_numbers = true
    )]
    pub processes: i64,

    /// Raw bytes per compressed block
    #[arg(long, value_name = "BYTES", default_value_t = DEFAULT_BLOCK_SIZE)]
    pub block_size: usize,

    #[arg(short = 'b', long, default_value_t = DEFAULT_READ_BUFFER_SIZE, hide = true)]
    pub buffer_size: usize,

    /// More log output on stderr (-v info, -vv debug, -vvv trace)
    #[arg(short = 'v', long, action = ArgAction::Count)]
    pub verbose: u8,
}

impl PargzArgs {
    pub fn level(&self) -> u32 {
        let flags = [
            self.fast,
            self.level_2,
            self.level_3,
            self.level_4,
            self.level_5,
            self.level_6,
            self.level_7,
            self.level_8,
            self.best,
        ];
        flags
            .iter()
            .position(|&set| set)
            .map_or(DEFAULT_LEVEL, |i| i as u32 + 1)
    }

    pub fn stream_config(&self) -> StreamConfig {
        StreamConfig::default()
            .with_threads(Threads::from(self.processes))
            .with_level(self.level())
            .with_block_size(self.block_size)
            .with_read_buffer_size(self.buffer_size)
    }

    /// Input file, or `None` for stdin
    pub fn input_file(&self) -> Option<&Path> {
        self.file.as_deref().filter(|path| *path != Path::new("-"))
    }

    /// Where output goes: `None` is stdout.
    pub fn output_path(&self) -> PargzResult<Option<PathBuf>> {
        if let Some(output) = &self.output {
            return Ok(Some(output.clone()));
        }
        if self.stdout {
            return Ok(None);
        }
        let Some(input) = self.input_file() else {
            return Ok(None);
        };
        if !self.decompress {
            let mut name = input.as_os_str().to_owned();
            name.push(GZ_SUFFIX);
            return Ok(Some(PathBuf::from(name)));
        }
        match input.to_str().and_then(|name| name.strip_suffix(GZ_SUFFIX)) {
            Some(stem) if !stem.is_empty() => Ok(Some(PathBuf::from(stem))),
            _ => Err(PargzError::config(format!(
                "filename doesn't end in .gz: {}. Cannot determine output filename.",
                input.display()
            ))),
        }
    }
}

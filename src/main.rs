//! pargz - gzip on every core
//!
//! A gzip-like front end for the pargz library: compresses into multi-member
//! gzip files on a pool of worker threads and decompresses any gzip file
//! with threaded read-ahead.

use std::fs::File;
use std::io::{self, BufWriter, Cursor, IsTerminal, Read, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Mutex;

use clap::Parser;
use memmap2::Mmap;
use pargz::{compress_stream, decompress_stream, PargzError, PargzResult};
use tracing_subscriber::EnvFilter;

mod cli;

use cli::PargzArgs;

/// Partially written output, removed if the process is interrupted.
static OUTPUT_FILE: Mutex<Option<PathBuf>> = Mutex::new(None);

fn set_output_file(path: Option<PathBuf>) {
    if let Ok(mut guard) = OUTPUT_FILE.lock() {
        *guard = path;
    }
}

fn install_signal_handlers() {
    unsafe {
        for &sig in &[libc::SIGINT, libc::SIGTERM, libc::SIGHUP] {
            libc::signal(sig, signal_handler as *const () as libc::sighandler_t);
        }
        // Piping into `head` should end quietly
        libc::signal(libc::SIGPIPE, libc::SIG_DFL);
    }
}

extern "C" fn signal_handler(sig: libc::c_int) {
    // try_lock: the interrupted thread may hold the lock
    if let Ok(guard) = OUTPUT_FILE.try_lock() {
        if let Some(ref path) = *guard {
            let _ = std::fs::remove_file(path);
        }
    }

    // Re-raise with the default action so the parent sees the signal
    unsafe {
        libc::signal(sig, libc::SIG_DFL);
        libc::raise(sig);
    }
}

fn init_logging(verbosity: u8) {
    let default = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

fn main() {
    install_signal_handlers();
    let args = PargzArgs::parse();
    init_logging(args.verbose);

    match run(&args) {
        Ok(()) => process::exit(0),
        Err(e) => {
            eprintln!("pargz: {}", e);
            process::exit(1);
        }
    }
}

fn run(args: &PargzArgs) -> PargzResult<()> {
    let config = args.stream_config();
    let output_path = args.output_path()?;
    if args.no_name {
        tracing::debug!("-n has no effect: headers never carry a name or timestamp");
    }

    if let Some(path) = &output_path {
        if path.exists() && !args.force {
            confirm_overwrite(path)?;
        }
    }

    let input: Box<dyn Read + Send> = match args.input_file() {
        Some(path) => open_input(path)?,
        None => Box::new(io::stdin()),
    };
    let output: Box<dyn Write + Send> = match &output_path {
        Some(path) => {
            set_output_file(Some(path.clone()));
            Box::new(BufWriter::with_capacity(
                config.read_buffer_size,
                File::create(path)?,
            ))
        }
        None => {
            if !args.decompress && !args.force && io::stdout().is_terminal() {
                return Err(PargzError::config(
                    "compressed data not written to a terminal. Use -f to force compression.",
                ));
            }
            Box::new(BufWriter::with_capacity(config.read_buffer_size, io::stdout()))
        }
    };

    tracing::info!(
        decompress = args.decompress,
        level = config.level,
        threads = ?config.threads,
        input = ?args.input_file(),
        output = ?output_path,
        "starting"
    );
    let result = if args.decompress {
        decompress_stream(input, output, config)
    } else {
        compress_stream(input, output, config)
    };

    match result {
        Ok(bytes) => {
            set_output_file(None);
            tracing::info!(bytes, "done");
            Ok(())
        }
        Err(e) => {
            set_output_file(None);
            if let Some(path) = &output_path {
                let _ = std::fs::remove_file(path);
            }
            Err(e)
        }
    }
}

/// Ask before clobbering an existing file; refuse outright when stdin is
/// not a terminal.
fn confirm_overwrite(path: &Path) -> PargzResult<()> {
    if !io::stdin().is_terminal() {
        return Err(PargzError::config(format!(
            "{} already exists",
            path.display()
        )));
    }
    eprint!(
        "{} already exists; do you wish to overwrite (y/n)? ",
        path.display()
    );
    let mut response = String::new();
    io::stdin().read_line(&mut response)?;
    match response.trim() {
        "y" | "Y" | "yes" => Ok(()),
        _ => Err(PargzError::config("not overwritten")),
    }
}

/// Map regular files into memory; fall back to plain reads for empty files
/// and anything that cannot be mapped.
fn open_input(path: &Path) -> PargzResult<Box<dyn Read + Send>> {
    let file = File::open(path)?;
    if file.metadata()?.len() == 0 {
        return Ok(Box::new(file));
    }
    // SAFETY: the file is only read, and pargz does not modify its input
    match unsafe { Mmap::map(&file) } {
        Ok(mmap) => Ok(Box::new(Cursor::new(mmap))),
        Err(e) => {
            tracing::debug!("mmap of {} failed, reading instead: {}", path.display(), e);
            Ok(Box::new(file))
        }
    }
}

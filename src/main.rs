//! nbwrite - copy lines through a non-blocking writer.
//!
//! Reads a file (or stdin), splits it into lines and hands each line to a
//! [`NonBlockWriter`] whose worker thread writes to the output file (or
//! stdout). The sink can be slowed down or made to fail, which makes the
//! writer's backpressure, error policy and cancellation observable.
//!
//! # Usage
//!
//! ```bash
//! # Copy a file through the writer
//! nbwrite input.log -o copy.log
//!
//! # Slow sink with a small queue: producers block on backpressure
//! nbwrite input.log -o copy.log --capacity 4 --delay-ms 5 --progress
//!
//! # Fail the third write and stop immediately
//! nbwrite input.log --fail-at 3 --fail-fast
//!
//! # Give up on whatever is not written after one second
//! nbwrite input.log --delay-ms 100 --timeout-ms 1000
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use memmap2::{Mmap, MmapOptions};
use nonblock_writer::{CancelToken, NonBlockWriter};
use rayon::prelude::*;
use std::fs::File;
use std::io::{self, Read};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{info, warn, Level};

mod sink;
use sink::{open_output, SimulatedSink};

/// Command-line arguments for nbwrite.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Input file (reads stdin when omitted)
    input: Option<PathBuf>,

    /// Output file (writes to stdout when omitted)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Queue capacity in buffers (0 = default of 32767)
    #[arg(short, long, default_value_t = 0)]
    capacity: usize,

    /// Delay every sink write by this many milliseconds
    #[arg(long, default_value_t = 0)]
    delay_ms: u64,

    /// Make the n-th sink write fail (1-based)
    #[arg(long)]
    fail_at: Option<usize>,

    /// Stop at the first sink error and discard everything still queued
    #[arg(long)]
    fail_fast: bool,

    /// Cancel the writer after this many milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Number of producer threads (line order is only kept with 1)
    #[arg(short = 'j', long, default_value_t = 1)]
    producers: usize,

    /// Show a progress bar on stderr
    #[arg(long)]
    progress: bool,

    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

/// Input bytes, memory-mapped when read from a file.
enum Input {
    Mapped(Mmap),
    Owned(Vec<u8>),
}

impl AsRef<[u8]> for Input {
    fn as_ref(&self) -> &[u8] {
        match self {
            Input::Mapped(mmap) => mmap,
            Input::Owned(data) => data,
        }
    }
}

fn load_input(path: Option<&PathBuf>) -> Result<Input> {
    let Some(path) = path else {
        let mut data = Vec::new();
        io::stdin()
            .read_to_end(&mut data)
            .context("Failed to read stdin")?;
        return Ok(Input::Owned(data));
    };

    let file = File::open(path).context("Failed to open input file")?;
    // Zero-length files cannot be mapped.
    if file.metadata().context("Failed to stat input file")?.len() == 0 {
        return Ok(Input::Owned(Vec::new()));
    }
    let mmap = unsafe {
        MmapOptions::new()
            .map(&file)
            .context("Failed to mmap input file")?
    };
    Ok(Input::Mapped(mmap))
}

/// Splits `data` into lines, keeping each line's terminating newline.
fn split_lines(data: &[u8]) -> Vec<&[u8]> {
    let mut lines = Vec::new();
    let mut start = 0;
    for end in memchr::memchr_iter(b'\n', data) {
        lines.push(&data[start..=end]);
        start = end + 1;
    }
    if start < data.len() {
        lines.push(&data[start..]);
    }
    lines
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(io::stderr)
        .init();
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let input = load_input(args.input.as_ref())?;
    let lines = split_lines(input.as_ref());

    let out = open_output(args.output.as_deref())?;
    let sink = SimulatedSink::new(out, Duration::from_millis(args.delay_ms), args.fail_at);

    let fail_fast = args.fail_fast;
    let mut builder = NonBlockWriter::builder(sink)
        .capacity(args.capacity)
        .thread_name("nbwrite-sink")
        .on_error(move |err| {
            warn!(error = %err, fail_fast, "sink write failed");
            fail_fast
        });
    if let Some(ms) = args.timeout_ms {
        builder = builder.cancel_token(CancelToken::with_timeout(Duration::from_millis(ms)));
    }
    let writer = builder.spawn().context("Failed to start writer thread")?;

    let pb = if args.progress {
        ProgressBar::with_draw_target(Some(lines.len() as u64), ProgressDrawTarget::stderr())
    } else {
        ProgressBar::hidden()
    };
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} lines ({eta})")
            .context("Invalid progress bar template")?
            .progress_chars("#>-"),
    );

    let start = Instant::now();
    let produced = if args.producers <= 1 {
        let mut produced = 0usize;
        for line in &lines {
            if let Err(err) = writer.write(line) {
                warn!(error = %err, "writer stopped accepting lines");
                break;
            }
            produced += 1;
            pb.inc(1);
        }
        produced
    } else {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(args.producers)
            .build()
            .context("Failed to build producer thread pool")?;
        pool.install(|| {
            lines
                .par_iter()
                .map(|line| {
                    let accepted = writer.write(line).is_ok();
                    pb.inc(1);
                    usize::from(accepted)
                })
                .sum::<usize>()
        })
    };
    pb.finish_and_clear();

    info!(
        lines = lines.len(),
        produced,
        elapsed = ?start.elapsed(),
        "input queued, waiting for writer to drain"
    );
    let result = writer.close();
    let last = writer.last_result();
    info!(elapsed = ?start.elapsed(), last_written = last.written, "writer closed");

    result.context("Output is incomplete")
}

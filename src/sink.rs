//! Output sinks for nbwrite.
//!
//! The real destination (a file or stdout) is wrapped in a [`SimulatedSink`]
//! that can slow down or fail individual writes, which is how the CLI
//! demonstrates backpressure and the error policy.

use anyhow::{Context, Result};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::thread;
use std::time::Duration;

/// Opens the destination: `path` when given, stdout otherwise.
pub fn open_output(path: Option<&Path>) -> Result<Box<dyn Write + Send>> {
    let out: Box<dyn Write + Send> = match path {
        Some(path) => Box::new(BufWriter::new(
            File::create(path).with_context(|| format!("Failed to create {}", path.display()))?,
        )),
        None => Box::new(BufWriter::new(io::stdout())),
    };
    Ok(out)
}

/// Wrapper that delays every write and can fail a chosen one.
pub struct SimulatedSink<W> {
    inner: W,
    delay: Duration,
    /// 1-based index of the write that fails.
    fail_at: Option<usize>,
    calls: usize,
}

impl<W: Write> SimulatedSink<W> {
    pub fn new(inner: W, delay: Duration, fail_at: Option<usize>) -> Self {
        Self {
            inner,
            delay,
            fail_at,
            calls: 0,
        }
    }
}

impl<W: Write> Write for SimulatedSink<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        self.calls += 1;
        if self.fail_at == Some(self.calls) {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("simulated failure on write {}", self.calls),
            ));
        }
        self.inner.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

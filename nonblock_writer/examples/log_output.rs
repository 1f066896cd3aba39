//! Routes log output through a `NonBlockWriter` backed by a slow sink that
//! fails on its fifth write. The error policy stops the worker on the first
//! failure, so the remaining lines are discarded and `close` reports it.
//!
//! Run with `cargo run -p nonblock_writer --example log_output`.

use anyhow::Result;
use nonblock_writer::NonBlockWriter;
use std::io::{self, Write};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

struct SlowFailingSink<W> {
    inner: W,
    calls: usize,
    fail_on: usize,
}

impl<W: Write> Write for SlowFailingSink<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        thread::sleep(Duration::from_millis(300));
        self.calls += 1;
        if self.calls == self.fail_on {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("sink failed on write {}", self.calls),
            ));
        }
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

fn main() -> Result<()> {
    eprintln!("example start");

    let sink = SlowFailingSink {
        inner: io::stdout(),
        calls: 0,
        fail_on: 5,
    };
    let writer = Arc::new(
        NonBlockWriter::builder(sink)
            .capacity(0)
            .on_error(|_| true)
            .spawn()?,
    );

    let subscriber = tracing_subscriber::fmt()
        .with_writer(Arc::clone(&writer))
        .with_ansi(false)
        .finish();
    tracing::subscriber::with_default(subscriber, || {
        for i in 1..=16 {
            tracing::info!("{}", i);
        }
    });
    eprintln!("example end, {} lines still queued", writer.queued());

    if let Err(err) = writer.close() {
        eprintln!("{}", err);
    }
    eprintln!("OK");
    Ok(())
}

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use nonblock_writer::NonBlockWriter;
use std::io::{self, Write};
use std::sync::{Arc, Mutex};

#[derive(Debug, Arbitrary)]
struct Plan {
    capacity: u8,
    chunks: Vec<Vec<u8>>,
    fail_at: Option<u8>,
    fail_fast: bool,
}

#[derive(Clone, Default)]
struct Recorder {
    delivered: Arc<Mutex<Vec<Vec<u8>>>>,
    calls: usize,
    fail_at: Option<usize>,
}

impl Write for Recorder {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.calls += 1;
        if self.fail_at == Some(self.calls) {
            return Err(io::Error::new(io::ErrorKind::Other, "fuzz failure"));
        }
        self.delivered.lock().unwrap().push(buf.to_vec());
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fuzz_target!(|plan: Plan| {
    // Keep runs short
    if plan.chunks.len() > 256 {
        return;
    }

    let fail_at = plan.fail_at.map(usize::from).filter(|n| *n > 0);
    let recorder = Recorder {
        fail_at,
        ..Recorder::default()
    };
    let delivered = Arc::clone(&recorder.delivered);
    let fail_fast = plan.fail_fast;
    let writer = NonBlockWriter::builder(recorder)
        .capacity(usize::from(plan.capacity).max(1))
        .on_error(move |_| fail_fast)
        .spawn()
        .unwrap();

    let mut accepted = Vec::new();
    for chunk in &plan.chunks {
        match writer.write(chunk) {
            Ok(n) => {
                assert_eq!(n, chunk.len());
                if !chunk.is_empty() {
                    accepted.push(chunk.clone());
                }
            }
            Err(err) => assert!(err.is_closed()),
        }
    }
    let closed = writer.close();

    let delivered = delivered.lock().unwrap().clone();
    let accepted_len = accepted.len();
    let failed_at = fail_at.filter(|n| *n <= accepted_len);

    // The sink sees the accepted writes in order, minus the failing one,
    // and nothing after it when the policy stops the worker.
    let mut expected = accepted;
    if let Some(n) = failed_at {
        expected.remove(n - 1);
        if fail_fast {
            expected.truncate(n - 1);
        }
    }
    assert_eq!(delivered, expected);

    match failed_at {
        Some(n) if fail_fast || n == accepted_len => assert!(closed.is_err()),
        _ => assert!(closed.is_ok()),
    }
});

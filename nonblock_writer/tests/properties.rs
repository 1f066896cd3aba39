use std::io::{self, Write};
use std::sync::{Arc, Mutex};

use nonblock_writer::NonBlockWriter;
use proptest::prelude::*;

#[derive(Clone, Default)]
struct Collector(Arc<Mutex<Vec<Vec<u8>>>>);

impl Write for Collector {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().push(buf.to_vec());
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_sink_sees_writes_in_order(
        bufs in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..64), 0..100),
        capacity in 0usize..8,
    ) {
        let sink = Collector::default();
        let writer = NonBlockWriter::new(sink.clone(), capacity).unwrap();
        for buf in &bufs {
            prop_assert_eq!(writer.write(buf).unwrap(), buf.len());
        }
        prop_assert!(writer.close().is_ok());

        let expected: Vec<Vec<u8>> = bufs.into_iter().filter(|b| !b.is_empty()).collect();
        prop_assert_eq!(sink.0.lock().unwrap().clone(), expected);
    }

    #[test]
    fn prop_reused_scratch_buffer_is_copied(
        lines in prop::collection::vec("[a-z]{1,16}", 1..50),
    ) {
        let sink = Collector::default();
        let writer = NonBlockWriter::new(sink.clone(), 4).unwrap();

        let mut scratch = Vec::new();
        for line in &lines {
            scratch.clear();
            scratch.extend_from_slice(line.as_bytes());
            writer.write(&scratch).unwrap();
            scratch.iter_mut().for_each(|b| *b = b'#');
        }
        prop_assert!(writer.close().is_ok());

        let got: Vec<Vec<u8>> = sink.0.lock().unwrap().clone();
        let expected: Vec<Vec<u8>> = lines.iter().map(|l| l.as_bytes().to_vec()).collect();
        prop_assert_eq!(got, expected);
    }
}

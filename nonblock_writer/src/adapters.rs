//! Pass-through [`io::Write`] decorators.

use std::io::{self, Write};

/// Runs a check against the wrapped writer before every write.
///
/// If the check fails its error is returned and nothing is written.
pub struct CheckWriter<W, F> {
    writer: W,
    check: F,
}

impl<W, F> CheckWriter<W, F>
where
    W: Write,
    F: FnMut(&mut W) -> io::Result<()>,
{
    /// Wraps `writer`; `check` runs before every write.
    pub fn new(writer: W, check: F) -> Self {
        Self { writer, check }
    }

    /// The wrapped writer.
    pub fn get_ref(&self) -> &W {
        &self.writer
    }

    /// Unwraps the writer, dropping the check.
    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W, F> Write for CheckWriter<W, F>
where
    W: Write,
    F: FnMut(&mut W) -> io::Result<()>,
{
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (self.check)(&mut self.writer)?;
        self.writer.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

/// Discards writes when no writer is configured.
///
/// With `None` every write reports the full length as written.
#[derive(Debug, Default)]
pub struct NilWriter<W> {
    writer: Option<W>,
}

impl<W: Write> NilWriter<W> {
    /// Wraps `writer`; `None` discards everything written.
    pub fn new(writer: Option<W>) -> Self {
        Self { writer }
    }

    /// The wrapped writer, if any.
    pub fn get_ref(&self) -> Option<&W> {
        self.writer.as_ref()
    }
}

impl<W: Write> Write for NilWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.writer.as_mut() {
            Some(writer) => writer.write(buf),
            None => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.writer.as_mut() {
            Some(writer) => writer.flush(),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nil_writer_without_writer() {
        let mut w: NilWriter<Vec<u8>> = NilWriter::new(None);
        assert_eq!(w.write(b"test").unwrap(), 4);
        assert!(w.get_ref().is_none());
        w.flush().unwrap();
    }

    #[test]
    fn test_nil_writer_with_writer() {
        let mut w = NilWriter::new(Some(Vec::new()));
        assert_eq!(w.write(b"test").unwrap(), 4);
        assert_eq!(w.get_ref().map(Vec::len), Some(4));
    }

    #[test]
    fn test_check_writer_passes() {
        let mut calls = 0;
        let mut w = CheckWriter::new(Vec::new(), |_: &mut Vec<u8>| {
            calls += 1;
            Ok(())
        });
        w.write_all(b"abc").unwrap();
        w.write_all(b"def").unwrap();
        assert_eq!(w.get_ref().as_slice(), b"abcdef");
        drop(w);
        assert_eq!(calls, 2);
    }

    #[test]
    fn test_check_writer_rejects() {
        let mut w = CheckWriter::new(Vec::new(), |inner: &mut Vec<u8>| {
            if inner.len() >= 3 {
                Err(io::Error::new(io::ErrorKind::WriteZero, "limit reached"))
            } else {
                Ok(())
            }
        });
        assert_eq!(w.write(b"abc").unwrap(), 3);
        let err = w.write(b"d").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WriteZero);
        assert_eq!(w.into_inner(), b"abc");
    }
}

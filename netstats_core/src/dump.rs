//! Line-indenting writer for diagnostic dumps

use std::io::{self, Write};

const INDENT: &[u8] = b"  ";

/// Wraps a writer, prefixing every line with the current indent.
#[derive(Debug)]
pub struct IndentingWriter<W> {
    inner: W,
    depth: usize,
    at_line_start: bool,
}

impl<W: Write> IndentingWriter<W> {
    /// Wrap `inner` with zero indent
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            depth: 0,
            at_line_start: true,
        }
    }

    /// Indent following lines one more level
    pub fn increase_indent(&mut self) {
        self.depth += 1;
    }

    /// Indent following lines one fewer level
    pub fn decrease_indent(&mut self) {
        self.depth = self.depth.saturating_sub(1);
    }

    /// Recover the wrapped writer
    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for IndentingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        for line in buf.split_inclusive(|&b| b == b'\n') {
            if self.at_line_start && line != b"\n" {
                for _ in 0..self.depth {
                    self.inner.write_all(INDENT)?;
                }
            }
            self.inner.write_all(line)?;
            self.at_line_start = line.ends_with(b"\n");
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

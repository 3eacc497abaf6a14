//! Big-endian primitives shared by the on-disk formats
//!
//! Every persisted structure in this crate is a sequence of fixed-width,
//! network-order integers. Writes go through [`bytes::BufMut`] on a `Vec<u8>`
//! and reads through [`Reader`], which refuses to read past the end of its
//! input rather than panicking the way a bare [`bytes::Buf`] would.

use bytes::{Buf, BufMut};

/// Errors produced by [`Reader`]
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Input ended before a complete value could be read
    #[error("truncated input reading {context}: needed {needed} bytes, {remaining} remain")]
    Truncated {
        /// What was being read
        context: &'static str,
        /// Bytes required for the value
        needed: usize,
        /// Bytes left in the input
        remaining: usize,
    },
    /// A length prefix or count was negative
    #[error("negative length {value} reading {context}")]
    NegativeLength {
        /// What was being read
        context: &'static str,
        /// The offending value
        value: i32,
    },
    /// A string payload was not valid UTF-8
    #[error("invalid utf-8 reading {context}")]
    Utf8 {
        /// What was being read
        context: &'static str,
    },
}

/// Cursor over a borrowed byte slice.
#[derive(Debug)]
pub struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    /// Create a new reader over `buf`
    #[must_use]
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    /// Bytes not yet consumed
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    fn ensure(&self, needed: usize, context: &'static str) -> Result<(), Error> {
        let remaining = self.buf.remaining();
        if remaining < needed {
            return Err(Error::Truncated {
                context,
                needed,
                remaining,
            });
        }
        Ok(())
    }

    pub(crate) fn u8(&mut self, context: &'static str) -> Result<u8, Error> {
        self.ensure(1, context)?;
        Ok(self.buf.get_u8())
    }

    pub(crate) fn bool(&mut self, context: &'static str) -> Result<bool, Error> {
        Ok(self.u8(context)? != 0)
    }

    pub(crate) fn i32(&mut self, context: &'static str) -> Result<i32, Error> {
        self.ensure(4, context)?;
        Ok(self.buf.get_i32())
    }

    pub(crate) fn i64(&mut self, context: &'static str) -> Result<i64, Error> {
        self.ensure(8, context)?;
        Ok(self.buf.get_i64())
    }

    /// Read an `i32` that must be a non-negative count.
    pub(crate) fn count(&mut self, context: &'static str) -> Result<usize, Error> {
        let value = self.i32(context)?;
        usize::try_from(value).map_err(|_| Error::NegativeLength { context, value })
    }

    /// Read a presence byte followed, when present, by a `u16` length and
    /// UTF-8 payload.
    pub(crate) fn optional_string(
        &mut self,
        context: &'static str,
    ) -> Result<Option<String>, Error> {
        if !self.bool(context)? {
            return Ok(None);
        }
        self.ensure(2, context)?;
        let len = usize::from(self.buf.get_u16());
        self.ensure(len, context)?;
        let (head, tail) = self.buf.split_at(len);
        let value = std::str::from_utf8(head)
            .map_err(|_| Error::Utf8 { context })?
            .to_string();
        self.buf = tail;
        Ok(Some(value))
    }
}

pub(crate) fn put_bool(out: &mut Vec<u8>, value: bool) {
    out.put_u8(u8::from(value));
}

/// Write a count as `i32`, saturating at `i32::MAX`.
pub(crate) fn put_count(out: &mut Vec<u8>, count: usize) {
    out.put_i32(i32::try_from(count).unwrap_or(i32::MAX));
}

pub(crate) fn put_optional_string(out: &mut Vec<u8>, value: Option<&str>) {
    match value {
        Some(s) => {
            put_bool(out, true);
            let bytes = s.as_bytes();
            let len = u16::try_from(bytes.len()).unwrap_or(u16::MAX);
            out.put_u16(len);
            out.put_slice(&bytes[..usize::from(len)]);
        }
        None => put_bool(out, false),
    }
}

/// Convert a stored counter to its signed on-disk form.
pub(crate) fn counter_to_disk(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Convert a signed on-disk counter back, clamping corrupt negatives to zero.
pub(crate) fn counter_from_disk(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

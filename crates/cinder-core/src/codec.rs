//! Bounds-checked big-endian reader for the binary wire formats.
//!
//! `bytes::Buf` panics on underflow; every read here checks `remaining()`
//! first and turns a short buffer into `InvalidMessage`. Length prefixes are
//! written through [`put_len_u16`] and [`put_len_u32`]; the types that own
//! variable fields refuse oversized values before they are encoded.

use bytes::{Buf, BufMut};

use crate::E2eeError;

/// Write a `u16` length prefix.
pub(crate) fn put_len_u16(buf: &mut impl BufMut, len: usize) {
    debug_assert!(u16::try_from(len).is_ok(), "length {len} overflows a u16 prefix");
    buf.put_u16(len as u16);
}

/// Write a `u32` length prefix.
pub(crate) fn put_len_u32(buf: &mut impl BufMut, len: usize) {
    debug_assert!(u32::try_from(len).is_ok(), "length {len} overflows a u32 prefix");
    buf.put_u32(len as u32);
}

/// Cursor over untrusted input.
pub(crate) struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn ensure(&self, len: usize) -> Result<(), E2eeError> {
        if self.buf.remaining() < len {
            tracing::debug!(needed = len, remaining = self.buf.remaining(), "truncated input");
            return Err(E2eeError::InvalidMessage);
        }
        Ok(())
    }

    pub(crate) fn u8(&mut self) -> Result<u8, E2eeError> {
        self.ensure(1)?;
        Ok(self.buf.get_u8())
    }

    pub(crate) fn u16(&mut self) -> Result<u16, E2eeError> {
        self.ensure(2)?;
        Ok(self.buf.get_u16())
    }

    pub(crate) fn u32(&mut self) -> Result<u32, E2eeError> {
        self.ensure(4)?;
        Ok(self.buf.get_u32())
    }

    pub(crate) fn u64(&mut self) -> Result<u64, E2eeError> {
        self.ensure(8)?;
        Ok(self.buf.get_u64())
    }

    /// Borrow the next `len` bytes.
    pub(crate) fn bytes(&mut self, len: usize) -> Result<&'a [u8], E2eeError> {
        self.ensure(len)?;
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    /// Fail unless the input was consumed exactly.
    pub(crate) fn finish(self) -> Result<(), E2eeError> {
        if self.buf.has_remaining() {
            tracing::debug!(trailing = self.buf.remaining(), "trailing bytes after message");
            return Err(E2eeError::InvalidMessage);
        }
        Ok(())
    }
}

/// Map a key-parsing failure inside wire data to `InvalidMessage`.
pub(crate) fn malformed(err: cinder_crypto::CryptoError) -> E2eeError {
    tracing::debug!(error = %err, "malformed key in message");
    E2eeError::InvalidMessage
}

/// Largest value that fits a 24-bit key id.
pub(crate) const MAX_KEY_ID: u32 = 0x00FF_FFFF;

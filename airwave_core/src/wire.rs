//! Bounds-checked big-endian field codec.

use crate::error::ProtocolError;
use crate::types::Position;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Cursor over a received buffer. Every read checks the remaining length
/// first, so a short buffer yields `TruncatedMessage` instead of a panic.
pub(crate) struct WireReader<'a> {
    buf: &'a [u8],
}

impl<'a> WireReader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    fn ensure(&self, needed: usize) -> Result<(), ProtocolError> {
        if self.buf.remaining() < needed {
            return Err(ProtocolError::TruncatedMessage {
                needed,
                available: self.buf.remaining(),
            });
        }
        Ok(())
    }

    pub(crate) fn u32(&mut self) -> Result<u32, ProtocolError> {
        self.ensure(4)?;
        Ok(self.buf.get_u32())
    }

    pub(crate) fn u64(&mut self) -> Result<u64, ProtocolError> {
        self.ensure(8)?;
        Ok(self.buf.get_u64())
    }

    pub(crate) fn f64(&mut self) -> Result<f64, ProtocolError> {
        self.ensure(8)?;
        Ok(self.buf.get_f64())
    }

    pub(crate) fn position(&mut self) -> Result<Position, ProtocolError> {
        Ok(Position::new(self.f64()?, self.f64()?, self.f64()?))
    }

    /// Reads a `u32` length prefix followed by that many bytes.
    pub(crate) fn sized_bytes(&mut self) -> Result<Bytes, ProtocolError> {
        let len = self.u32()? as usize;
        self.ensure(len)?;
        Ok(self.buf.copy_to_bytes(len))
    }

    /// Fails with `SizeMismatch` if bytes are left over.
    pub(crate) fn finish(self, declared: u32) -> Result<(), ProtocolError> {
        if self.buf.has_remaining() {
            return Err(ProtocolError::SizeMismatch {
                declared,
                actual: declared as usize + self.buf.remaining(),
            });
        }
        Ok(())
    }
}

pub(crate) fn put_position(buf: &mut BytesMut, position: &Position) {
    buf.put_f64(position.x);
    buf.put_f64(position.y);
    buf.put_f64(position.z);
}

pub(crate) fn put_sized_bytes(buf: &mut BytesMut, bytes: &[u8]) {
    buf.put_u32(bytes.len() as u32);
    buf.put_slice(bytes);
}

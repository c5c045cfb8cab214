//! Little-endian field reader shared by the header and payload decoders.

use crate::{WireError, WireResult};

/// Sequential reader over a byte slice.
///
/// Every read is bounds-checked and fails with the error given at
/// construction, so callers can tell a short header from a short payload.
pub(crate) struct WireReader<'a> {
    rest: &'a [u8],
    err: WireError,
}

impl<'a> WireReader<'a> {
    pub(crate) fn new(buf: &'a [u8], err: WireError) -> Self {
        Self { rest: buf, err }
    }

    pub(crate) fn bytes<const N: usize>(&mut self) -> WireResult<[u8; N]> {
        if self.rest.len() < N {
            return Err(self.err.clone());
        }
        let (head, tail) = self.rest.split_at(N);
        self.rest = tail;
        head.try_into().map_err(|_| self.err.clone())
    }

    pub(crate) fn u8(&mut self) -> WireResult<u8> {
        let [b] = self.bytes::<1>()?;
        Ok(b)
    }

    pub(crate) fn u16(&mut self) -> WireResult<u16> {
        self.bytes().map(u16::from_le_bytes)
    }

    pub(crate) fn i16(&mut self) -> WireResult<i16> {
        self.bytes().map(i16::from_le_bytes)
    }

    pub(crate) fn u32(&mut self) -> WireResult<u32> {
        self.bytes().map(u32::from_le_bytes)
    }

    pub(crate) fn u64(&mut self) -> WireResult<u64> {
        self.bytes().map(u64::from_le_bytes)
    }

    pub(crate) fn f32(&mut self) -> WireResult<f32> {
        self.bytes().map(f32::from_le_bytes)
    }
}

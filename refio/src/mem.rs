// SPDX-License-Identifier: MIT

#[cfg(all(not(feature = "std"), feature = "alloc"))]
use alloc::vec::Vec;

use crate::{BlockIO, BlockIOError, BlockIOResult};

/// In-memory implementation of `BlockIO`.
///
/// Useful for tests and RAM-backed images. The buffer grows on writes past
/// the current end, up to an optional capacity limit; a limited backend
/// reports `OutOfSpace` like a full disk would.
#[derive(Debug, Default)]
pub struct MemBlockIO {
    buffer: Vec<u8>,
    capacity_limit: Option<u64>,
}

impl MemBlockIO {
    /// Creates an empty, unbounded backend.
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            capacity_limit: None,
        }
    }

    /// Creates a backend over an existing image buffer.
    pub fn from_vec(buffer: Vec<u8>) -> Self {
        Self {
            buffer,
            capacity_limit: None,
        }
    }

    /// Creates a backend that refuses to grow past `limit` bytes.
    pub fn with_capacity_limit(limit: u64) -> Self {
        Self {
            buffer: Vec::new(),
            capacity_limit: Some(limit),
        }
    }

    /// Consumes the backend and returns the image buffer.
    pub fn into_inner(self) -> Vec<u8> {
        self.buffer
    }

    /// Borrows the image buffer.
    pub fn as_slice(&self) -> &[u8] {
        &self.buffer
    }

    fn grow_to(&mut self, end: u64) -> BlockIOResult {
        if let Some(limit) = self.capacity_limit
            && end > limit
        {
            return Err(BlockIOError::OutOfSpace);
        }
        if end > self.buffer.len() as u64 {
            self.buffer.resize(end as usize, 0);
        }
        Ok(())
    }
}

impl BlockIO for MemBlockIO {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> BlockIOResult {
        let end = (offset as usize).saturating_add(buf.len());
        if end > self.buffer.len() {
            return Err(BlockIOError::OutOfBounds);
        }
        buf.copy_from_slice(&self.buffer[offset as usize..end]);
        Ok(())
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> BlockIOResult {
        let end = offset
            .checked_add(data.len() as u64)
            .ok_or(BlockIOError::OutOfBounds)?;
        self.grow_to(end)?;
        self.buffer[offset as usize..end as usize].copy_from_slice(data);
        Ok(())
    }

    fn write_sync_at(&mut self, offset: u64, data: &[u8]) -> BlockIOResult {
        self.write_at(offset, data)
    }

    fn discard(&mut self, offset: u64, len: u64) -> BlockIOResult {
        // Discarded ranges read back as zeroes, like a hole-punched file.
        let start = (offset as usize).min(self.buffer.len());
        let end = (offset.saturating_add(len) as usize).min(self.buffer.len());
        self.buffer[start..end].fill(0);
        Ok(())
    }

    fn truncate(&mut self, len: u64) -> BlockIOResult {
        if let Some(limit) = self.capacity_limit
            && len > limit
        {
            return Err(BlockIOError::OutOfSpace);
        }
        self.buffer.resize(len as usize, 0);
        Ok(())
    }

    fn length(&mut self) -> BlockIOResult<u64> {
        Ok(self.buffer.len() as u64)
    }

    fn flush(&mut self) -> BlockIOResult {
        Ok(())
    }
}

#[cfg(all(test, feature = "std"))]
mod test {
    use crate::prelude::*;

    #[test]
    fn test_rw() {
        let mut io = MemBlockIO::new();
        io.write_at(10, &[1, 2, 3, 4]).unwrap();

        let mut output = [0u8; 4];
        io.read_at(10, &mut output).unwrap();
        assert_eq!(output, [1, 2, 3, 4]);
    }

    #[test]
    fn test_write_grows() {
        let mut io = MemBlockIO::new();
        io.write_at(100, &[0xAB; 8]).unwrap();
        assert_eq!(io.length().unwrap(), 108);
    }

    #[test]
    fn test_read_past_end_fails() {
        let mut io = MemBlockIO::new();
        io.truncate(16).unwrap();
        let mut buf = [0u8; 8];
        assert!(io.read_at(12, &mut buf).is_err());
    }

    #[test]
    fn test_capacity_limit() {
        let mut io = MemBlockIO::with_capacity_limit(64);
        io.write_at(0, &[0u8; 64]).unwrap();
        assert_eq!(io.write_at(60, &[0u8; 8]), Err(BlockIOError::OutOfSpace));
    }

    #[test]
    fn test_discard_zeroes() {
        let mut io = MemBlockIO::new();
        io.write_at(0, &[0xFF; 32]).unwrap();
        io.discard(8, 8).unwrap();

        let mut buf = [0u8; 32];
        io.read_at(0, &mut buf).unwrap();
        assert_eq!(&buf[8..16], &[0u8; 8]);
        assert_eq!(&buf[0..8], &[0xFF; 8]);
    }

    #[test]
    fn test_truncate_extends_with_zeroes() {
        let mut io = MemBlockIO::new();
        io.write_at(0, &[0xFF; 4]).unwrap();
        io.truncate(8).unwrap();

        let mut buf = [0u8; 8];
        io.read_at(0, &mut buf).unwrap();
        assert_eq!(buf, [0xFF, 0xFF, 0xFF, 0xFF, 0, 0, 0, 0]);
    }

    #[test]
    fn test_zero_fill() {
        let mut io = MemBlockIO::new();
        io.write_at(0, &[0xFF; 64]).unwrap();
        io.zero_fill(10, 8).unwrap();

        let mut output = [0xAA; 8];
        io.read_at(10, &mut output).unwrap();
        assert_eq!(output, [0u8; 8]);
    }

    #[test]
    fn test_primitive_be_rw() {
        let mut io = MemBlockIO::new();
        io.write_u64_be_at(0, 0x0102_0304_0506_0708).unwrap();

        let mut raw = [0u8; 8];
        io.read_at(0, &mut raw).unwrap();
        assert_eq!(raw, [1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(io.read_u64_be_at(0).unwrap(), 0x0102_0304_0506_0708);
        assert_eq!(io.read_u16_be_at(0).unwrap(), 0x0102);
    }
}

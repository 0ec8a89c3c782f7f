// SPDX-License-Identifier: MIT
#![cfg_attr(not(feature = "std"), no_std)]

#[cfg(all(not(feature = "std"), feature = "alloc"))]
extern crate alloc;

// === Core modules ===
pub mod error;
mod macros;

// === Backend modules ===
#[cfg(feature = "mem")]
mod mem;

#[cfg(feature = "std")]
mod std;

// === Prelude re-exports (central entrypoint) ===
pub mod prelude {
    pub use super::BlockIO;
    pub use super::BlockIOExt;
    pub use super::BlockIOStructExt;
    pub use super::error::*;

    #[cfg(feature = "mem")]
    pub use super::mem::MemBlockIO;

    #[cfg(feature = "std")]
    pub use super::std::StdBlockIO;
}

#[cfg(feature = "mem")]
pub use mem::MemBlockIO;
#[cfg(feature = "std")]
pub use std::StdBlockIO;

// === Internal use ===
use error::*;
#[allow(clippy::single_component_path_imports)]
use paste;

// === Constants ===
/// Maximum size of internal scratch buffer (used for chunked ops)
const BLOCK_BUF_SIZE: usize = 8192;

// === Traits ===

/// Block IO abstraction trait.
///
/// Byte-addressed read/write/sync/discard/truncate on an image file.
/// Implementations may target RAM, files, block devices, etc. Writes past
/// the current end grow the backing storage; a backend that cannot grow
/// reports [`BlockIOError::OutOfSpace`].
pub trait BlockIO {
    /// Reads `buf.len()` bytes into `buf` from `offset` (absolute).
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> BlockIOResult;

    /// Writes `data` at `offset` (absolute).
    fn write_at(&mut self, offset: u64, data: &[u8]) -> BlockIOResult;

    /// Writes `data` at `offset`; the data is durable when this returns.
    fn write_sync_at(&mut self, offset: u64, data: &[u8]) -> BlockIOResult;

    /// Hints that `[offset, offset + len)` is no longer needed. Best-effort:
    /// a backend may do nothing.
    fn discard(&mut self, offset: u64, len: u64) -> BlockIOResult {
        let _ = (offset, len);
        Ok(())
    }

    /// Resizes the backing storage to exactly `len` bytes.
    fn truncate(&mut self, len: u64) -> BlockIOResult;

    /// Current length of the backing storage in bytes.
    fn length(&mut self) -> BlockIOResult<u64>;

    /// Flushes any buffered data (may be a no-op).
    fn flush(&mut self) -> BlockIOResult;
}

/// Extension helpers for BlockIO.
///
/// Provides optimized or convenient helpers:
/// - chunked reads/writes
/// - zero fill
/// - big-endian primitive access (`read_u16_be_at`, `write_u64_be_at`, ...)
pub trait BlockIOExt: BlockIO {
    /// Reads `buf.len()` bytes from `offset` in chunks of `chunk_size` or less.
    #[inline(always)]
    fn read_in_chunks(&mut self, offset: u64, buf: &mut [u8], chunk_size: usize) -> BlockIOResult {
        let mut remaining = buf.len();
        let mut off = offset;
        let mut pos = 0;

        while remaining > 0 {
            let to_read = remaining.min(chunk_size);
            self.read_at(off, &mut buf[pos..pos + to_read])?;
            off += to_read as u64;
            pos += to_read;
            remaining -= to_read;
        }

        Ok(())
    }

    /// Writes `buf.len()` bytes at `offset` in chunks of `chunk_size` or less.
    #[inline(always)]
    fn write_in_chunks(&mut self, offset: u64, buf: &[u8], chunk_size: usize) -> BlockIOResult {
        let mut remaining = buf.len();
        let mut off = offset;
        let mut pos = 0;

        while remaining > 0 {
            let to_write = remaining.min(chunk_size);
            self.write_at(off, &buf[pos..pos + to_write])?;
            off += to_write as u64;
            pos += to_write;
            remaining -= to_write;
        }

        Ok(())
    }

    /// Fills a region with zeroes.
    ///
    /// Used for cluster clearing and image formatting.
    #[inline(always)]
    fn zero_fill(&mut self, offset: u64, len: usize) -> BlockIOResult {
        const ZERO_BUF: [u8; BLOCK_BUF_SIZE] = [0u8; BLOCK_BUF_SIZE];
        let mut remaining = len;
        let mut off = offset;
        while remaining > 0 {
            let chunk = remaining.min(ZERO_BUF.len());
            self.write_at(off, &ZERO_BUF[..chunk])?;
            off += chunk as u64;
            remaining -= chunk;
        }
        Ok(())
    }

    // Implements big-endian read/write helpers for primitive types
    blockio_impl_primitive_rw!(u16, u32, u64);
}

impl<T: BlockIO + ?Sized> BlockIOExt for T {}

/// Extension trait for reading and writing structs using zerocopy.
///
/// Requires the struct to implement zerocopy traits for safe conversion.
pub trait BlockIOStructExt: BlockIO {
    /// Reads a struct of type `T` from the given offset.
    fn read_struct<T: zerocopy::FromBytes + zerocopy::KnownLayout + zerocopy::Immutable>(
        &mut self,
        offset: u64,
    ) -> BlockIOResult<T> {
        let size = core::mem::size_of::<T>();
        assert!(size <= BLOCK_BUF_SIZE, "read_struct: type too large");
        let mut buf = [0u8; BLOCK_BUF_SIZE];
        self.read_at(offset, &mut buf[..size])?;
        T::read_from_bytes(&buf[..size]).map_err(|_| BlockIOError::Error("read_struct failed"))
    }

    /// Writes a struct of type `T` at the given offset.
    fn write_struct<T: zerocopy::IntoBytes + zerocopy::KnownLayout + zerocopy::Immutable>(
        &mut self,
        offset: u64,
        val: &T,
    ) -> BlockIOResult {
        let bytes = val.as_bytes();
        self.write_at(offset, bytes)
    }
}

impl<T: BlockIO + ?Sized> BlockIOStructExt for T {}

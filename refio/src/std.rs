// SPDX-License-Identifier: MIT

use std::fs::File;
use std::io::{Error, ErrorKind, Read, Seek, SeekFrom, Write};

use crate::{BlockIO, BlockIOError, BlockIOResult};

/// `std::fs::File` implementation of `BlockIO`.
///
/// Writes past the current end grow the file, matching the sparse-image
/// allocation model. `write_sync_at` is durable via `sync_data`.
#[derive(Debug)]
pub struct StdBlockIO<'a> {
    file: &'a mut File,
}

impl<'a> StdBlockIO<'a> {
    #[inline]
    pub fn new(file: &'a mut File) -> Self {
        Self { file }
    }
}

impl<'a> BlockIO for StdBlockIO<'a> {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> BlockIOResult {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> BlockIOResult {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)?;
        Ok(())
    }

    fn write_sync_at(&mut self, offset: u64, data: &[u8]) -> BlockIOResult {
        self.write_at(offset, data)?;
        self.file.sync_data()?;
        Ok(())
    }

    fn discard(&mut self, _offset: u64, _len: u64) -> BlockIOResult {
        // Best-effort by contract. Hole punching is platform specific;
        // skipping it is always correct.
        Ok(())
    }

    fn truncate(&mut self, len: u64) -> BlockIOResult {
        self.file.set_len(len)?;
        Ok(())
    }

    fn length(&mut self) -> BlockIOResult<u64> {
        let len = self.file.seek(SeekFrom::End(0))?;
        Ok(len)
    }

    fn flush(&mut self) -> BlockIOResult {
        self.file.flush()?;
        Ok(())
    }
}

impl From<Error> for BlockIOError {
    #[cold]
    #[inline(never)]
    fn from(e: Error) -> Self {
        match e.kind() {
            ErrorKind::UnexpectedEof => BlockIOError::OutOfBounds,
            ErrorKind::StorageFull => BlockIOError::OutOfSpace,
            _ => {
                // Leak the string to produce a 'static str. Acceptable for error mapping.
                let leaked_str: &'static str = Box::leak(e.to_string().into_boxed_str());
                BlockIOError::Error(leaked_str)
            }
        }
    }
}

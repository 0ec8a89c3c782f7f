// SPDX-License-Identifier: MIT

use core::fmt;

/// Result type for BlockIO operations.
pub type BlockIOResult<T = ()> = core::result::Result<T, BlockIOError>;

/// Error type for BlockIO operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockIOError {
    /// Underlying device I/O error.
    Error(&'static str),

    /// Attempted to read out of bounds.
    OutOfBounds,

    /// The backend refused to grow the storage.
    OutOfSpace,

    /// Unsupported operation for this backend.
    Unsupported,
}

impl BlockIOError {
    pub fn msg(&self) -> &'static str {
        match self {
            BlockIOError::Error(msg) => msg,
            BlockIOError::OutOfBounds => "Out of bounds",
            BlockIOError::OutOfSpace => "Out of space",
            BlockIOError::Unsupported => "Unsupported operation",
        }
    }
}

impl fmt::Display for BlockIOError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.msg())
    }
}

#[cfg(feature = "std")]
impl std::error::Error for BlockIOError {}

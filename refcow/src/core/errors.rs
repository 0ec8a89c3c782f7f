// SPDX-License-Identifier: MIT

use core::fmt;

pub use refio::error::*;

/// Errors from the refcount store and the cluster allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefcountError {
    IO(BlockIOError),
    /// A structural invariant is violated on disk. The image is marked
    /// unusable for further writes.
    Corrupt(&'static str),
    InvalidArgument(&'static str),
    /// The allocator cannot represent another cluster offset.
    OutOfSpace,
    /// Reftable growth would exceed the configured maximum.
    TooBig,
    /// Internal: metadata allocation may have consumed the caller's
    /// clusters; restart the search. Never surfaces through the public API.
    RetryAlloc,
    Other(&'static str),
}

impl RefcountError {
    pub fn msg(&self) -> &'static str {
        match self {
            RefcountError::IO(_) => "IO error",
            RefcountError::Corrupt(msg) => msg,
            RefcountError::InvalidArgument(msg) => msg,
            RefcountError::OutOfSpace => "Out of space",
            RefcountError::TooBig => "Reftable would grow past its maximum size",
            RefcountError::RetryAlloc => "Retry allocation",
            RefcountError::Other(msg) => msg,
        }
    }

    pub fn source(&self) -> Option<ImageError> {
        match self {
            RefcountError::IO(e) => Some(ImageError::IO(*e)),
            _ => None,
        }
    }
}

impl fmt::Display for RefcountError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.msg())?;
        let mut current = self.source();
        while let Some(src) = current {
            write!(f, "\n  caused by: {}", src.msg())?;
            current = src.source();
        }
        Ok(())
    }
}

/// Errors from the snapshot refcount walker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotError {
    IO(BlockIOError),
    Refcount(RefcountError),
    Invalid(&'static str),
    Other(&'static str),
}

impl SnapshotError {
    pub fn msg(&self) -> &'static str {
        match self {
            SnapshotError::IO(_) => "IO error",
            SnapshotError::Refcount(_) => "Refcount error",
            SnapshotError::Invalid(msg) => msg,
            SnapshotError::Other(msg) => msg,
        }
    }

    pub fn source(&self) -> Option<ImageError> {
        match self {
            SnapshotError::IO(e) => Some(ImageError::IO(*e)),
            SnapshotError::Refcount(e) => Some(ImageError::Refcount(*e)),
            _ => None,
        }
    }
}

impl fmt::Display for SnapshotError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.msg())?;
        let mut current = self.source();
        while let Some(src) = current {
            write!(f, "\n  caused by: {}", src.msg())?;
            current = src.source();
        }
        Ok(())
    }
}

/// Errors from the consistency checker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckError {
    IO(BlockIOError),
    Refcount(RefcountError),
    /// The in-memory refcount table could not be grown.
    OutOfMemory,
    Invalid(&'static str),
    Other(&'static str),
}

impl CheckError {
    pub fn msg(&self) -> &'static str {
        match self {
            CheckError::IO(_) => "IO error",
            CheckError::Refcount(_) => "Refcount error",
            CheckError::OutOfMemory => "Out of memory",
            CheckError::Invalid(msg) => msg,
            CheckError::Other(msg) => msg,
        }
    }

    pub fn source(&self) -> Option<ImageError> {
        match self {
            CheckError::IO(e) => Some(ImageError::IO(*e)),
            CheckError::Refcount(e) => Some(ImageError::Refcount(*e)),
            _ => None,
        }
    }
}

impl fmt::Display for CheckError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.msg())?;
        let mut current = self.source();
        while let Some(src) = current {
            write!(f, "\n  caused by: {}", src.msg())?;
            current = src.source();
        }
        Ok(())
    }
}

/// Top-level error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageError {
    IO(BlockIOError),
    Refcount(RefcountError),
    Snapshot(SnapshotError),
    Check(CheckError),
    Invalid(&'static str),
    Other(&'static str),
}

impl ImageError {
    pub fn msg(&self) -> &'static str {
        match self {
            ImageError::IO(e) => e.msg(),
            ImageError::Refcount(e) => e.msg(),
            ImageError::Snapshot(e) => e.msg(),
            ImageError::Check(e) => e.msg(),
            ImageError::Invalid(msg) => msg,
            ImageError::Other(msg) => msg,
        }
    }

    pub fn source(&self) -> Option<ImageError> {
        match self {
            ImageError::Refcount(e) => e.source(),
            ImageError::Snapshot(e) => e.source(),
            ImageError::Check(e) => e.source(),
            ImageError::IO(_) => None,
            ImageError::Invalid(_) => None,
            ImageError::Other(_) => None,
        }
    }
}

impl fmt::Display for ImageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.msg())?;
        let mut current = self.source();
        while let Some(src) = current {
            write!(f, "\n  caused by: {}", src.msg())?;
            current = src.source();
        }
        Ok(())
    }
}

// type aliases

pub type ImageResult<T = ()> = Result<T, ImageError>;
pub type RefcountResult<T = ()> = Result<T, RefcountError>;
pub type SnapshotResult<T = ()> = Result<T, SnapshotError>;
pub type CheckResult<T = ()> = Result<T, CheckError>;

crate::image_error_wiring! {
    top => ImageError {
        BlockIOError  : IO,
        RefcountError : Refcount,
        SnapshotError : Snapshot,
        CheckError    : Check,
    },
    str_into => [
        RefcountError,
        SnapshotError,
        CheckError,
    ],
    sub => {
        BlockIOError  => [ RefcountError::IO, SnapshotError::IO, CheckError::IO ],
        RefcountError => [ SnapshotError::Refcount, CheckError::Refcount ]
    },
}

// std::error::Error implementations
// These are only available when the `std` feature is enabled, providing
// interoperability with the standard library error handling ecosystem.

#[cfg(feature = "std")]
mod std_error_impls {
    use super::*;

    impl std::error::Error for RefcountError {
        fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
            match self {
                RefcountError::IO(e) => Some(e),
                _ => None,
            }
        }
    }

    impl std::error::Error for SnapshotError {
        fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
            match self {
                SnapshotError::IO(e) => Some(e),
                SnapshotError::Refcount(e) => Some(e),
                _ => None,
            }
        }
    }

    impl std::error::Error for CheckError {
        fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
            match self {
                CheckError::IO(e) => Some(e),
                CheckError::Refcount(e) => Some(e),
                _ => None,
            }
        }
    }

    impl std::error::Error for ImageError {
        fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
            match self {
                ImageError::IO(e) => Some(e),
                ImageError::Refcount(e) => Some(e),
                ImageError::Snapshot(e) => Some(e),
                ImageError::Check(e) => Some(e),
                _ => None,
            }
        }
    }
}

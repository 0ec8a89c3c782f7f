#![cfg_attr(not(feature = "std"), no_std)]

//! Refcount engine for a sparse, cluster-addressed copy-on-write disk
//! image with internal snapshots and compressed clusters.
//!
//! The engine is the sole authority for allocating and freeing clusters on
//! the backing file: it maintains the two-level refcount structure
//! (reftable -> refblocks -> 16-bit counts), which describes every live
//! cluster including its own, walks snapshot L1 trees to adjust counts and
//! only-copy bits, audits the whole image against ground truth, and guards
//! metadata against overlapping writes.
//!
//! See [`Image`] for the public surface.

#[cfg(feature = "alloc")]
#[macro_use]
extern crate alloc;

// Core Modules
pub mod core;
pub mod image;

// Error types
pub use crate::core::errors::{
    CheckError, ImageError, ImageResult, RefcountError, SnapshotError,
};

// Checker report types
pub use crate::core::report::{CheckReport, Finding, FragInfo, RepairFlags, Severity};

// Engine surface
pub use image::meta::ImageMeta;
pub use image::{
    CorruptionEvent, DiscardKind, Image, ImageOptions, L1Ref, MetadataKind, SnapshotInfo,
};

/// Re-exports for downstream crates and tests.
pub mod prelude {
    pub use crate::core::errors::*;
    pub use crate::core::report::{CheckReport, Finding, FragInfo, RepairFlags, Severity};
    pub use crate::image::types::{
        cluster_kind, ClusterKind, FLAG_COMPRESSED, FLAG_COPIED, FLAG_ZERO, OFFSET_MASK,
    };
    pub use crate::image::{
        DiscardKind, Image, ImageMeta, ImageOptions, L1Ref, MetadataKind, SnapshotInfo,
    };
    pub use refio::prelude::*;
}

// SPDX-License-Identifier: MIT

use zerocopy::byteorder::big_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

pub const HEADER_MAGIC: u32 = 0x5243_4F57; // "RCOW"
pub const HEADER_VERSION: u32 = 2;
pub const HEADER_SIZE: usize = 72;

/// Byte offset of the `reftable_offset` field inside the header. The
/// `(reftable_offset, reftable_clusters)` pair that starts here is rewritten
/// as one durable 12-byte write when the reftable moves.
pub const HEADER_REFTABLE_FIELD: u64 = 0x28;

/// On-disk image header, big-endian, in cluster 0.
#[derive(IntoBytes, FromBytes, KnownLayout, Immutable, Unaligned, Copy, Clone, Debug)]
#[repr(C)]
pub struct ImageHeader {
    pub magic: U32,
    pub version: U32,
    pub cluster_bits: U32,
    pub _pad0: U32,
    pub disk_size: U64,
    pub l1_size: U32,
    pub _pad1: U32,
    pub l1_table_offset: U64,
    pub reftable_offset: U64,
    pub reftable_clusters: U32,
    pub snapshots_count: U32,
    pub snapshots_offset: U64,
    pub snapshot_table_size: U32,
    pub _pad2: U32,
}

const _: () = assert!(core::mem::size_of::<ImageHeader>() == HEADER_SIZE);

/// On-disk snapshot table record: the per-snapshot `(l1_offset, l1_size)`
/// pair the engine reads. Records are packed back to back at
/// `snapshots_offset`.
#[derive(IntoBytes, FromBytes, KnownLayout, Immutable, Unaligned, Copy, Clone, Debug)]
#[repr(C)]
pub struct SnapshotRecord {
    pub l1_table_offset: U64,
    pub l1_size: U32,
    pub _pad: U32,
}

pub const SNAPSHOT_RECORD_SIZE: usize = 16;

const _: () = assert!(core::mem::size_of::<SnapshotRecord>() == SNAPSHOT_RECORD_SIZE);

// SPDX-License-Identifier: MIT

use refio::prelude::*;
use zerocopy::byteorder::big_endian::{U32, U64};

use crate::core::{RefcountError, RefcountResult};
use crate::image::types::*;

pub const MIN_CLUSTER_BITS: u32 = 9;
pub const MAX_CLUSTER_BITS: u32 = 21;

/// Upper bound on the reftable itself. With the ×3/2+1 growth policy the
/// table approaches this asymptotically; crossing it is `TooBig`.
pub const MAX_REFTABLE_BYTES: u64 = 8 * 1024 * 1024;

/// Derived geometry and the header fields the engine persists.
///
/// Everything here is host order; conversion to the big-endian on-disk
/// representation happens in [`ImageMeta::to_header`] and at the store's IO
/// boundary.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageMeta {
    pub cluster_bits: u32,
    pub cluster_size: u64,
    /// Cluster indices covered by one refblock: `cluster_size / 2`.
    pub refblock_entries: u64,
    pub refblock_bits: u32,

    pub disk_size: u64,

    pub l1_size: u32,
    pub l1_table_offset: u64,

    pub reftable_offset: u64,
    pub reftable_clusters: u32,

    pub snapshots_count: u32,
    pub snapshots_offset: u64,
    pub snapshot_table_size: u32,

    // Compressed-entry split, fixed per image by cluster_bits.
    pub csize_shift: u32,
    pub csize_mask: u64,
    pub compressed_offset_mask: u64,
}

impl ImageMeta {
    pub fn new(cluster_bits: u32, disk_size: u64) -> RefcountResult<Self> {
        if !(MIN_CLUSTER_BITS..=MAX_CLUSTER_BITS).contains(&cluster_bits) {
            return Err(RefcountError::InvalidArgument(
                "cluster_bits outside supported range",
            ));
        }
        let cluster_size = 1u64 << cluster_bits;
        let csize_shift = 62 - (cluster_bits - 8);
        Ok(Self {
            cluster_bits,
            cluster_size,
            refblock_entries: cluster_size / 2,
            refblock_bits: cluster_bits - 1,
            disk_size,
            l1_size: 0,
            l1_table_offset: 0,
            reftable_offset: 0,
            reftable_clusters: 0,
            snapshots_count: 0,
            snapshots_offset: 0,
            snapshot_table_size: 0,
            csize_shift,
            csize_mask: (1u64 << (cluster_bits - 8)) - 1,
            compressed_offset_mask: (1u64 << csize_shift) - 1,
        })
    }

    pub fn from_header(hdr: &ImageHeader) -> RefcountResult<Self> {
        if hdr.magic.get() != HEADER_MAGIC {
            return Err(RefcountError::Corrupt("bad image magic"));
        }
        if hdr.version.get() != HEADER_VERSION {
            return Err(RefcountError::Corrupt("unsupported image version"));
        }
        let mut meta = Self::new(hdr.cluster_bits.get(), hdr.disk_size.get())
            .map_err(|_| RefcountError::Corrupt("cluster_bits outside supported range"))?;

        meta.l1_size = hdr.l1_size.get();
        meta.l1_table_offset = hdr.l1_table_offset.get();
        meta.reftable_offset = hdr.reftable_offset.get();
        meta.reftable_clusters = hdr.reftable_clusters.get();
        meta.snapshots_count = hdr.snapshots_count.get();
        meta.snapshots_offset = hdr.snapshots_offset.get();
        meta.snapshot_table_size = hdr.snapshot_table_size.get();

        crate::ensure!(
            meta.is_cluster_aligned(meta.l1_table_offset),
            RefcountError::Corrupt("l1 table offset misaligned")
        );
        crate::ensure!(
            meta.is_cluster_aligned(meta.reftable_offset),
            RefcountError::Corrupt("reftable offset misaligned")
        );
        crate::ensure!(
            meta.is_cluster_aligned(meta.snapshots_offset),
            RefcountError::Corrupt("snapshot table offset misaligned")
        );
        crate::ensure!(
            meta.reftable_offset != 0 && meta.reftable_clusters != 0,
            RefcountError::Corrupt("image has no reftable")
        );
        crate::ensure!(
            meta.reftable_clusters as u64 <= meta.max_reftable_clusters(),
            RefcountError::Corrupt("reftable larger than the configured maximum")
        );

        Ok(meta)
    }

    pub fn to_header(&self) -> ImageHeader {
        ImageHeader {
            magic: U32::new(HEADER_MAGIC),
            version: U32::new(HEADER_VERSION),
            cluster_bits: U32::new(self.cluster_bits),
            _pad0: U32::new(0),
            disk_size: U64::new(self.disk_size),
            l1_size: U32::new(self.l1_size),
            _pad1: U32::new(0),
            l1_table_offset: U64::new(self.l1_table_offset),
            reftable_offset: U64::new(self.reftable_offset),
            reftable_clusters: U32::new(self.reftable_clusters),
            snapshots_count: U32::new(self.snapshots_count),
            snapshots_offset: U64::new(self.snapshots_offset),
            snapshot_table_size: U32::new(self.snapshot_table_size),
            _pad2: U32::new(0),
        }
    }

    #[inline]
    pub fn cluster_offset(&self, cluster: u64) -> u64 {
        cluster << self.cluster_bits
    }

    #[inline]
    pub fn cluster_index(&self, offset: u64) -> u64 {
        offset >> self.cluster_bits
    }

    #[inline]
    pub fn start_of_cluster(&self, offset: u64) -> u64 {
        offset & !(self.cluster_size - 1)
    }

    #[inline]
    pub fn is_cluster_aligned(&self, offset: u64) -> bool {
        offset & (self.cluster_size - 1) == 0
    }

    #[inline]
    pub fn size_to_clusters(&self, bytes: u64) -> u64 {
        bytes.div_ceil(self.cluster_size)
    }

    /// Reftable slot covering `cluster`.
    #[inline]
    pub fn reftable_index(&self, cluster: u64) -> u64 {
        cluster >> self.refblock_bits
    }

    /// Slot of `cluster` inside its refblock.
    #[inline]
    pub fn refblock_slot(&self, cluster: u64) -> usize {
        (cluster & (self.refblock_entries - 1)) as usize
    }

    /// Number of entries the current reftable can hold.
    #[inline]
    pub fn reftable_entries(&self) -> u64 {
        self.reftable_clusters as u64 * (self.cluster_size / 8)
    }

    #[inline]
    pub fn max_reftable_clusters(&self) -> u64 {
        MAX_REFTABLE_BYTES / self.cluster_size
    }

    /// Decodes a compressed L2 entry into its host byte offset and
    /// additional 512-byte sector count.
    pub fn compressed_range(&self, entry: u64) -> (u64, u64) {
        let offset = entry & self.compressed_offset_mask;
        let sectors = ((entry >> self.csize_shift) & self.csize_mask) + 1;
        (offset, sectors)
    }

    /// Writes the full header to `io` (cluster 0).
    pub fn write_header<B: BlockIO>(&self, io: &mut B) -> RefcountResult<()> {
        io.write_struct(0, &self.to_header())?;
        Ok(())
    }

    /// Commits a reftable move: one durable 12-byte write of
    /// `(reftable_offset, reftable_clusters)`. This is the linearisation
    /// point of reftable growth.
    pub fn commit_reftable_pointer<B: BlockIO>(
        &mut self,
        io: &mut B,
        offset: u64,
        clusters: u32,
    ) -> RefcountResult<()> {
        let mut buf = [0u8; 12];
        buf[..8].copy_from_slice(&offset.to_be_bytes());
        buf[8..].copy_from_slice(&clusters.to_be_bytes());
        io.write_sync_at(HEADER_REFTABLE_FIELD, &buf)?;
        self.reftable_offset = offset;
        self.reftable_clusters = clusters;
        Ok(())
    }
}

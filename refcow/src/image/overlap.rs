// SPDX-License-Identifier: MIT

//! Overlap sentinel: "would this write clobber known metadata?"
//!
//! All eight metadata kinds are enumerated as typed `(kind, offset, len)`
//! regions from one traversal, then tested against the caller's mask. Only
//! the inactive-L2 kind costs disk reads (each snapshot L1 must be
//! loaded); callers that cannot afford that put it in the ignore mask.

#[cfg(all(not(feature = "std"), feature = "alloc"))]
use alloc::vec::Vec;

use bitflags::bitflags;
use refio::prelude::*;

use crate::core::{RefcountError, RefcountResult};
use crate::image::types::OFFSET_MASK;
use crate::image::Image;

bitflags! {
    /// The metadata region kinds the sentinel knows about.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct MetadataKind: u32 {
        const HEADER         = 1 << 0;
        const ACTIVE_L1      = 1 << 1;
        const ACTIVE_L2      = 1 << 2;
        const REFTABLE       = 1 << 3;
        const REFBLOCK       = 1 << 4;
        const SNAPSHOT_TABLE = 1 << 5;
        const INACTIVE_L1    = 1 << 6;
        const INACTIVE_L2    = 1 << 7;
    }
}

#[inline]
fn ranges_overlap(a_off: u64, a_len: u64, b_off: u64, b_len: u64) -> bool {
    a_off < b_off + b_len && b_off < a_off + a_len
}

impl<B: BlockIO> Image<B> {
    /// Returns the kind of the first known metadata region intersecting
    /// `[offset, offset + size)`, or the empty set. Kinds in `ignore` are
    /// skipped.
    pub fn overlap_check(
        &mut self,
        ignore: MetadataKind,
        offset: u64,
        size: u64,
    ) -> RefcountResult<MetadataKind> {
        if size == 0 {
            return Ok(MetadataKind::empty());
        }
        let check = MetadataKind::all() - ignore;

        for (kind, r_off, r_len) in self.metadata_regions(check)? {
            if ranges_overlap(offset, size, r_off, r_len) {
                return Ok(kind);
            }
        }
        Ok(MetadataKind::empty())
    }

    /// Refuses a write that would clobber metadata: on overlap, signals a
    /// fatal corruption and fails with `Corrupt`.
    pub fn pre_write_overlap(
        &mut self,
        ignore: MetadataKind,
        offset: u64,
        size: u64,
    ) -> RefcountResult<()> {
        let hit = self.overlap_check(ignore, offset, size)?;
        if !hit.is_empty() {
            self.signal_corruption(true, offset, size, "write would overwrite live metadata");
            return Err(RefcountError::Corrupt("write overlaps live metadata"));
        }
        Ok(())
    }

    /// Enumerates the metadata regions of the kinds selected in `wanted`.
    fn metadata_regions(
        &mut self,
        wanted: MetadataKind,
    ) -> RefcountResult<Vec<(MetadataKind, u64, u64)>> {
        let s = self.meta.cluster_size;
        let mut regions = Vec::new();

        if wanted.contains(MetadataKind::HEADER) {
            regions.push((MetadataKind::HEADER, 0, s));
        }
        if wanted.contains(MetadataKind::ACTIVE_L1) && self.meta.l1_table_offset != 0 {
            regions.push((
                MetadataKind::ACTIVE_L1,
                self.meta.l1_table_offset,
                self.meta.l1_size as u64 * 8,
            ));
        }
        if wanted.contains(MetadataKind::ACTIVE_L2) {
            for &entry in &self.active_l1 {
                let l2 = entry & OFFSET_MASK;
                if l2 != 0 {
                    regions.push((MetadataKind::ACTIVE_L2, l2, s));
                }
            }
        }
        if wanted.contains(MetadataKind::REFTABLE) {
            regions.push((
                MetadataKind::REFTABLE,
                self.meta.reftable_offset,
                self.meta.reftable_clusters as u64 * s,
            ));
        }
        if wanted.contains(MetadataKind::REFBLOCK) {
            for &block in &self.reftable {
                if block != 0 {
                    regions.push((MetadataKind::REFBLOCK, block, s));
                }
            }
        }
        if wanted.contains(MetadataKind::SNAPSHOT_TABLE) && self.meta.snapshots_offset != 0 {
            regions.push((
                MetadataKind::SNAPSHOT_TABLE,
                self.meta.snapshots_offset,
                self.meta.snapshot_table_size as u64,
            ));
        }
        if wanted.contains(MetadataKind::INACTIVE_L1) {
            for snap in &self.snapshots {
                regions.push((
                    MetadataKind::INACTIVE_L1,
                    snap.l1_table_offset,
                    snap.l1_size as u64 * 8,
                ));
            }
        }
        if wanted.contains(MetadataKind::INACTIVE_L2) {
            // The only kind that costs reads: every snapshot L1 comes from
            // disk.
            let snapshots = self.snapshots.clone();
            for snap in snapshots {
                let mut raw = vec![0u8; snap.l1_size as usize * 8];
                self.io
                    .read_in_chunks(snap.l1_table_offset, &mut raw, 8192)
                    .map_err(RefcountError::IO)?;
                for chunk in raw.chunks_exact(8) {
                    let entry = u64::from_be_bytes(chunk.try_into().unwrap());
                    let l2 = entry & OFFSET_MASK;
                    if l2 != 0 {
                        regions.push((MetadataKind::INACTIVE_L2, l2, s));
                    }
                }
            }
        }

        Ok(regions)
    }
}

#[cfg(all(test, feature = "mem"))]
mod tests {
    use super::*;
    use crate::image::ImageOptions;

    fn fresh() -> Image<MemBlockIO> {
        Image::create(MemBlockIO::new(), 1 << 26, 9, ImageOptions::default()).unwrap()
    }

    #[test]
    fn test_header_and_refcount_structures_detected() {
        let mut img = fresh();
        let s = img.meta().cluster_size;
        assert_eq!(
            img.overlap_check(MetadataKind::empty(), 0, 1).unwrap(),
            MetadataKind::HEADER
        );
        assert_eq!(
            img.overlap_check(MetadataKind::empty(), s, 8).unwrap(),
            MetadataKind::REFTABLE
        );
        assert_eq!(
            img.overlap_check(MetadataKind::empty(), 2 * s + 10, 2).unwrap(),
            MetadataKind::REFBLOCK
        );
    }

    #[test]
    fn test_free_space_is_clear() {
        let mut img = fresh();
        let s = img.meta().cluster_size;
        assert_eq!(
            img.overlap_check(MetadataKind::empty(), 10 * s, s).unwrap(),
            MetadataKind::empty()
        );
    }

    #[test]
    fn test_ignore_mask_skips_kind() {
        let mut img = fresh();
        assert_eq!(
            img.overlap_check(MetadataKind::HEADER, 0, 1).unwrap(),
            MetadataKind::empty()
        );
    }

    #[test]
    fn test_pre_write_overlap_fatalises() {
        let mut img = fresh();
        assert_eq!(
            img.pre_write_overlap(MetadataKind::empty(), 0, 8),
            Err(RefcountError::Corrupt("write overlaps live metadata"))
        );
        assert!(img.is_corrupt());
        // Every further mutation fails fast.
        assert_eq!(
            img.alloc_clusters(512),
            Err(RefcountError::Corrupt("image is marked corrupt"))
        );
    }

    #[test]
    fn test_active_l1_and_l2_detected() {
        let mut img = fresh();
        let s = img.meta().cluster_size;
        let l2_off = img.alloc_clusters(s).unwrap();
        let l1_off = img.alloc_clusters(s).unwrap();
        img.set_active_l1(l1_off, vec![l2_off | crate::image::types::FLAG_COPIED])
            .unwrap();

        assert_eq!(
            img.overlap_check(MetadataKind::empty(), l1_off, 8).unwrap(),
            MetadataKind::ACTIVE_L1
        );
        assert_eq!(
            img.overlap_check(MetadataKind::empty(), l2_off, 8).unwrap(),
            MetadataKind::ACTIVE_L2
        );
    }
}

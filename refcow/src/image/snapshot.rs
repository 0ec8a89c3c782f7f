// SPDX-License-Identifier: MIT

//! Snapshot refcount walker.
//!
//! Walks one L1 table (the active one or a stored snapshot L1) and applies
//! ±1 to every cluster it reaches, maintaining the only-copy bit on the
//! way: after the walk, an entry carries the bit iff its target's refcount
//! is exactly one. A delta of zero recomputes the bits without touching
//! counts.

#[cfg(all(not(feature = "std"), feature = "alloc"))]
use alloc::{vec, vec::Vec};

use refio::prelude::*;

use crate::core::{RefcountResult, SnapshotError, SnapshotResult};
use crate::image::cache::CacheKind;
use crate::image::types::{cluster_kind, ClusterKind, FLAG_COPIED, OFFSET_MASK};
use crate::image::{DiscardKind, Image};

/// Which L1 table the walker reads. The active table lives in memory;
/// a stored one is read from disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum L1Ref {
    Active,
    Stored { offset: u64, entries: u32 },
}

impl<B: BlockIO> Image<B> {
    /// Applies `addend ∈ {−1, 0, +1}` to every cluster reachable from the
    /// given L1 and refreshes the only-copy bits. Discards triggered by
    /// zeroed counts are batched and only issued if the walk succeeds.
    pub fn adjust_snapshot_refcounts(&mut self, l1: L1Ref, addend: i64) -> SnapshotResult<()> {
        if !(-1..=1).contains(&addend) {
            return Err(SnapshotError::Invalid("addend must be -1, 0 or +1"));
        }
        self.ensure_writable().map_err(SnapshotError::Refcount)?;

        self.begin_discard_batch();
        let result = self.walk_l1(l1, addend);
        self.end_discard_batch(result.is_ok());
        result
    }

    fn walk_l1(&mut self, l1: L1Ref, addend: i64) -> SnapshotResult<()> {
        let (mut l1_table, l1_offset, is_active) = match l1 {
            L1Ref::Active => (
                self.active_l1.clone(),
                self.meta.l1_table_offset,
                true,
            ),
            L1Ref::Stored { offset, entries } => {
                if !self.meta.is_cluster_aligned(offset) {
                    return Err(SnapshotError::Invalid("snapshot L1 offset misaligned"));
                }
                let mut raw = vec![0u8; entries as usize * 8];
                self.io.read_in_chunks(offset, &mut raw, 8192)?;
                let table = raw
                    .chunks_exact(8)
                    .map(|c| u64::from_be_bytes(c.try_into().unwrap()))
                    .collect();
                (table, offset, false)
            }
        };

        let mut l1_modified = false;
        for idx in 0..l1_table.len() {
            let l1_entry = l1_table[idx];
            let l2_offset = l1_entry & OFFSET_MASK;
            if l2_offset == 0 {
                continue;
            }
            if !self.meta.is_cluster_aligned(l2_offset) {
                self.signal_corruption(true, l2_offset, 8, "L1 entry misaligned");
                return Err(SnapshotError::Refcount(
                    crate::core::RefcountError::Corrupt("L1 entry misaligned"),
                ));
            }

            self.walk_l2(l2_offset, addend)?;

            // The L2 cluster itself is a reference like any other.
            let l2_cluster = self.meta.cluster_index(l2_offset);
            let refcount = self.entry_refcount(l2_cluster, addend, DiscardKind::Snapshot)?;
            let new_l1 = if refcount == 1 {
                l1_entry | FLAG_COPIED
            } else {
                l1_entry & !FLAG_COPIED
            };
            if new_l1 != l1_entry {
                l1_table[idx] = new_l1;
                l1_modified = true;
            }
        }

        if l1_modified {
            // Deletion does not rewrite the table: the snapshot record is
            // about to go away anyway.
            if addend >= 0 {
                self.write_l1_table(l1_offset, &l1_table)
                    .map_err(SnapshotError::Refcount)?;
            }
            if is_active {
                self.active_l1 = l1_table;
            }
        }

        Ok(())
    }

    fn walk_l2(&mut self, l2_offset: u64, addend: i64) -> SnapshotResult<()> {
        let entries = (self.meta.cluster_size / 8) as usize;
        let handle = self.l2_cache_get(l2_offset)?;

        for slot in 0..entries {
            let entry = {
                let buf = self.l2_cache.buf(handle);
                u64::from_be_bytes(buf[slot * 8..slot * 8 + 8].try_into().unwrap())
            };

            let new_entry = match cluster_kind(entry) {
                ClusterKind::Unallocated | ClusterKind::ZeroPlain => continue,
                ClusterKind::Compressed => {
                    if addend != 0 {
                        let (coffset, sectors) = self.meta.compressed_range(entry);
                        match self.update_refcount_retrying(
                            coffset & !511,
                            sectors * 512,
                            addend,
                            DiscardKind::Snapshot,
                        ) {
                            Ok(()) => {}
                            Err(e) => {
                                self.l2_cache.put(handle);
                                return Err(SnapshotError::Refcount(e));
                            }
                        }
                    }
                    // Compressed clusters are shared by convention.
                    entry & !FLAG_COPIED
                }
                ClusterKind::Normal | ClusterKind::ZeroAlloc => {
                    let offset = entry & OFFSET_MASK;
                    if !self.meta.is_cluster_aligned(offset) {
                        self.l2_cache.put(handle);
                        self.signal_corruption(true, offset, 8, "L2 entry misaligned");
                        return Err(SnapshotError::Refcount(
                            crate::core::RefcountError::Corrupt("L2 entry misaligned"),
                        ));
                    }
                    let cluster = self.meta.cluster_index(offset);
                    let refcount =
                        match self.entry_refcount(cluster, addend, DiscardKind::Snapshot) {
                            Ok(r) => r,
                            Err(e) => {
                                self.l2_cache.put(handle);
                                return Err(e);
                            }
                        };
                    if refcount == 1 {
                        entry | FLAG_COPIED
                    } else {
                        entry & !FLAG_COPIED
                    }
                }
            };

            if new_entry != entry {
                let buf = self.l2_cache.buf_mut(handle);
                buf[slot * 8..slot * 8 + 8].copy_from_slice(&new_entry.to_be_bytes());
                self.l2_cache.mark_dirty(handle);
                if addend > 0 {
                    // The L2 entry must not reach disk before the refcount
                    // that justifies it. Deletion need not wait.
                    if let Err(e) = self.set_cache_dependency(CacheKind::L2, CacheKind::Refblock) {
                        self.l2_cache.put(handle);
                        return Err(SnapshotError::Refcount(e));
                    }
                }
            }
        }

        self.l2_cache.put(handle);
        Ok(())
    }

    /// Refcount of `cluster` after applying `addend` (a read when zero).
    fn entry_refcount(
        &mut self,
        cluster: u64,
        addend: i64,
        kind: DiscardKind,
    ) -> SnapshotResult<u16> {
        let r: RefcountResult<u16> = if addend == 0 {
            self.get_refcount(cluster)
        } else {
            self.update_cluster_refcount(cluster, addend, kind)
        };
        r.map_err(SnapshotError::Refcount)
    }
}

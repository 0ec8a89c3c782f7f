// SPDX-License-Identifier: MIT

//! Consistency checker.
//!
//! Rebuilds the true reference counts from the mapping structures (header,
//! L1/L2 trees, snapshot table, reftable) into an in-memory table, compares
//! them against the on-disk refcount store, and repairs divergences when
//! asked. Ground truth is read straight from the back-end; the store is
//! only touched through its public API.

#[cfg(all(not(feature = "std"), feature = "alloc"))]
use alloc::{vec, vec::Vec};

use refio::prelude::*;

use crate::core::{CheckError, CheckReport, CheckResult, Finding, RepairFlags};
use crate::image::cache::CacheKind;
use crate::image::types::{cluster_kind, ClusterKind, FLAG_COPIED, OFFSET_MASK};
use crate::image::{DiscardKind, Image, MetadataKind};

mod rebuild;

/// In-memory refcount table: the checker's ground truth. Grows on the fly;
/// growth failures surface as `OutOfMemory` instead of aborting.
pub(crate) struct Imrt {
    counts: Vec<u16>,
}

impl Imrt {
    pub(crate) fn new() -> Self {
        Self { counts: Vec::new() }
    }

    pub(crate) fn ensure(&mut self, clusters: u64) -> CheckResult<()> {
        let clusters = clusters as usize;
        if clusters > self.counts.len() {
            self.counts
                .try_reserve(clusters - self.counts.len())
                .map_err(|_| CheckError::OutOfMemory)?;
            self.counts.resize(clusters, 0);
        }
        Ok(())
    }

    #[inline]
    pub(crate) fn len(&self) -> u64 {
        self.counts.len() as u64
    }

    #[inline]
    pub(crate) fn get(&self, cluster: u64) -> u16 {
        self.counts.get(cluster as usize).copied().unwrap_or(0)
    }

    #[inline]
    pub(crate) fn set(&mut self, cluster: u64, value: u16) {
        self.counts[cluster as usize] = value;
    }

    pub(crate) fn inc(&mut self, cluster: u64, rep: &mut CheckReport) -> CheckResult<()> {
        self.ensure(cluster + 1)?;
        let c = &mut self.counts[cluster as usize];
        if *c == u16::MAX {
            rep.corruptions += 1;
            rep.push(Finding::err(
                "REF.TRUTH",
                format!("reference count overflow on cluster {cluster}"),
            ));
        } else {
            *c += 1;
        }
        Ok(())
    }
}

impl<B: BlockIO> Image<B> {
    /// Runs the full consistency check; `flags` selects what may be
    /// repaired. A clean (or cleanly repaired) result lifts the sticky
    /// corruption mark.
    pub fn check(&mut self, flags: RepairFlags) -> CheckResult<CheckReport> {
        // The checker reads ground truth from the back-end; cached dirty
        // metadata must be on disk first.
        self.flush_cache(CacheKind::L2).map_err(CheckError::Refcount)?;
        self.flush_cache(CacheKind::Refblock)
            .map_err(CheckError::Refcount)?;

        // Repairs go through the ordinary update paths, which a sticky
        // corruption mark would veto. Lift it for the duration; a clean
        // result clears it for good.
        let was_corrupt = core::mem::replace(&mut self.corrupt, false);
        let result = self.run_check(flags);
        match &result {
            Ok(rep) if rep.corruptions == 0 && rep.check_errors == 0 && !self.corrupt => {
                self.corrupt = false;
            }
            _ => self.corrupt |= was_corrupt,
        }
        result
    }

    fn run_check(&mut self, flags: RepairFlags) -> CheckResult<CheckReport> {
        let mut rep = CheckReport::default();
        let file_len = self.io.length().map_err(CheckError::IO)?;
        rep.image_end_offset = file_len;
        rep.frag.total_clusters = self.meta.size_to_clusters(file_len);

        let mut table = Imrt::new();
        table.ensure(self.meta.size_to_clusters(file_len))?;
        let mut need_rebuild = false;

        // Phase 1: ground truth from the mapping structures.
        self.calculate_refcounts(&mut table, &mut rep, file_len, true)?;

        // Phase 2: the reftable/refblock structure itself.
        self.check_refblock_structure(&mut table, &mut rep, flags, &mut need_rebuild)?;

        // Phase 3: compare disk counts against the truth.
        self.compare_refcounts(
            &table,
            &mut rep,
            flags.contains(RepairFlags::FIX_ERRORS),
            flags.contains(RepairFlags::FIX_LEAKS),
            &mut need_rebuild,
        )?;

        // Phase 4: regenerate the structure when it is beyond point fixes.
        if need_rebuild && flags.contains(RepairFlags::FIX_ERRORS) {
            self.rebuild_refcount_structure(&mut table, &mut rep)?;
            rep.corruptions_fixed += rep.corruptions;
            rep.corruptions = 0;
            // Whatever structural fault was signalled on the way here lived
            // in the structure that was just regenerated.
            self.corrupt = false;

            // The swap orphaned the old reftable and refblocks; recompute
            // the truth and run a leak-only pass to release them.
            let file_len = self.io.length().map_err(CheckError::IO)?;
            let mut table = Imrt::new();
            table.ensure(self.meta.size_to_clusters(file_len))?;
            let mut scratch = CheckReport::default();
            self.calculate_refcounts(&mut table, &mut scratch, file_len, false)?;
            let mut dummy = false;
            self.check_refblock_structure(
                &mut table,
                &mut scratch,
                RepairFlags::empty(),
                &mut dummy,
            )?;
            self.compare_refcounts(&table, &mut rep, false, true, &mut dummy)?;
        }

        // Phase 5: only-copy flags.
        self.check_copied_flags(&mut rep, flags)?;

        // Phase 5 repairs L2 tables behind the cache; drop the clean
        // entries so later reads see the disk.
        self.l2_cache.empty();

        Ok(rep)
    }

    /// Phase 1. Counts every live reference: header, active L1 tree,
    /// snapshot L1 trees, snapshot table, reftable.
    fn calculate_refcounts(
        &mut self,
        table: &mut Imrt,
        rep: &mut CheckReport,
        file_len: u64,
        frag_stats: bool,
    ) -> CheckResult<()> {
        // Header.
        table.inc(0, rep)?;

        // Active L1 tree.
        if self.meta.l1_table_offset != 0 {
            self.count_l1_tree(
                self.meta.l1_table_offset,
                self.meta.l1_size,
                table,
                rep,
                file_len,
                frag_stats,
            )?;
        }

        // Snapshot L1 trees.
        let snapshots = self.snapshots.clone();
        for snap in snapshots {
            if !self.meta.is_cluster_aligned(snap.l1_table_offset) {
                rep.corruptions += 1;
                rep.push(Finding::err(
                    "SNAP.L1",
                    format!("snapshot L1 offset {:#x} misaligned", snap.l1_table_offset),
                ));
                continue;
            }
            self.count_l1_tree(snap.l1_table_offset, snap.l1_size, table, rep, file_len, false)?;
        }

        // Snapshot table region.
        if self.meta.snapshots_offset != 0 {
            self.count_range(
                self.meta.snapshots_offset,
                self.meta.snapshot_table_size as u64,
                table,
                rep,
            )?;
        }

        // Reftable region.
        self.count_range(
            self.meta.reftable_offset,
            self.meta.reftable_clusters as u64 * self.meta.cluster_size,
            table,
            rep,
        )?;

        Ok(())
    }

    fn count_range(
        &mut self,
        offset: u64,
        bytes: u64,
        table: &mut Imrt,
        rep: &mut CheckReport,
    ) -> CheckResult<()> {
        if bytes == 0 {
            return Ok(());
        }
        let first = self.meta.cluster_index(offset);
        let last = self.meta.cluster_index(offset + bytes - 1);
        for cluster in first..=last {
            table.inc(cluster, rep)?;
        }
        Ok(())
    }

    /// Counts one L1 table region and everything reachable from it.
    fn count_l1_tree(
        &mut self,
        l1_offset: u64,
        l1_entries: u32,
        table: &mut Imrt,
        rep: &mut CheckReport,
        file_len: u64,
        frag_stats: bool,
    ) -> CheckResult<()> {
        self.count_range(l1_offset, l1_entries as u64 * 8, table, rep)?;
        if l1_entries == 0 {
            return Ok(());
        }

        let mut raw = vec![0u8; l1_entries as usize * 8];
        if let Err(e) = self.io.read_in_chunks(l1_offset, &mut raw, 8192) {
            rep.check_errors += 1;
            rep.push(Finding::err(
                "L1.READ",
                format!("cannot read L1 table at {l1_offset:#x}: {e}"),
            ));
            return Ok(());
        }

        let mut prev_data_offset: Option<u64> = None;
        for chunk in raw.chunks_exact(8) {
            let entry = u64::from_be_bytes(chunk.try_into().unwrap());
            let l2_offset = entry & OFFSET_MASK;
            if l2_offset == 0 {
                continue;
            }
            if !self.meta.is_cluster_aligned(l2_offset) {
                rep.corruptions += 1;
                rep.push(Finding::err(
                    "L1.ALIGN",
                    format!("L2 table offset {l2_offset:#x} misaligned"),
                ));
                continue;
            }
            if l2_offset + self.meta.cluster_size > file_len {
                rep.corruptions += 1;
                rep.push(Finding::err(
                    "L1.RANGE",
                    format!("L2 table at {l2_offset:#x} outside image"),
                ));
                continue;
            }
            table.inc(self.meta.cluster_index(l2_offset), rep)?;
            self.count_l2_table(
                l2_offset,
                table,
                rep,
                file_len,
                frag_stats,
                &mut prev_data_offset,
            )?;
        }
        Ok(())
    }

    fn count_l2_table(
        &mut self,
        l2_offset: u64,
        table: &mut Imrt,
        rep: &mut CheckReport,
        file_len: u64,
        frag_stats: bool,
        prev_data_offset: &mut Option<u64>,
    ) -> CheckResult<()> {
        let s = self.meta.cluster_size;
        let mut raw = vec![0u8; s as usize];
        if let Err(e) = self.io.read_at(l2_offset, &mut raw) {
            rep.check_errors += 1;
            rep.push(Finding::err(
                "L2.READ",
                format!("cannot read L2 table at {l2_offset:#x}: {e}"),
            ));
            return Ok(());
        }

        for chunk in raw.chunks_exact(8) {
            let entry = u64::from_be_bytes(chunk.try_into().unwrap());
            match cluster_kind(entry) {
                ClusterKind::Unallocated | ClusterKind::ZeroPlain => {}
                ClusterKind::Normal | ClusterKind::ZeroAlloc => {
                    let offset = entry & OFFSET_MASK;
                    if !self.meta.is_cluster_aligned(offset) {
                        rep.corruptions += 1;
                        rep.push(Finding::err(
                            "L2.ALIGN",
                            format!("data cluster offset {offset:#x} misaligned"),
                        ));
                        continue;
                    }
                    if offset + s > file_len {
                        rep.corruptions += 1;
                        rep.push(Finding::err(
                            "L2.RANGE",
                            format!("data cluster at {offset:#x} outside image"),
                        ));
                        continue;
                    }
                    table.inc(self.meta.cluster_index(offset), rep)?;
                    if frag_stats {
                        rep.frag.allocated_clusters += 1;
                        if let Some(prev) = *prev_data_offset
                            && offset != prev + s
                        {
                            rep.frag.fragmented_clusters += 1;
                        }
                        *prev_data_offset = Some(offset);
                    }
                }
                ClusterKind::Compressed => {
                    let (coffset, sectors) = self.meta.compressed_range(entry);
                    self.count_range(coffset & !511, sectors * 512, table, rep)?;
                    if frag_stats {
                        rep.frag.allocated_clusters += 1;
                        rep.frag.compressed_clusters += 1;
                    }
                }
            }
        }
        Ok(())
    }

    /// Phase 2. Validates the reftable slots and counts the refblock
    /// clusters themselves. A refblock pointing outside the image is
    /// repairable by growing the file (the block then reads as all-zero);
    /// anything structurally worse flags a rebuild.
    fn check_refblock_structure(
        &mut self,
        table: &mut Imrt,
        rep: &mut CheckReport,
        flags: RepairFlags,
        need_rebuild: &mut bool,
    ) -> CheckResult<()> {
        let s = self.meta.cluster_size;
        let mut file_len = self.io.length().map_err(CheckError::IO)?;

        let reftable = self.reftable.clone();
        for (t, &offset) in reftable.iter().enumerate() {
            if offset == 0 {
                continue;
            }
            if !self.meta.is_cluster_aligned(offset) {
                rep.corruptions += 1;
                *need_rebuild = true;
                rep.push(Finding::err(
                    "RB.ALIGN",
                    format!("refblock for span {t} at {offset:#x} misaligned"),
                ));
                continue;
            }
            if offset + s > file_len {
                if flags.contains(RepairFlags::FIX_ERRORS) {
                    // Growing the file makes the refblock readable as
                    // all-zero, which matches a span with no allocations.
                    self.io.truncate(offset + s).map_err(CheckError::IO)?;
                    file_len = offset + s;
                    rep.image_end_offset = file_len;
                    rep.corruptions_fixed += 1;
                    rep.push(Finding::warn(
                        "RB.RANGE",
                        format!("refblock for span {t} outside image, file resized"),
                    ));
                    table.inc(self.meta.cluster_index(offset), rep)?;
                } else {
                    rep.corruptions += 1;
                    *need_rebuild = true;
                    rep.push(Finding::err(
                        "RB.RANGE",
                        format!("refblock for span {t} at {offset:#x} outside image"),
                    ));
                }
                continue;
            }

            let cluster = self.meta.cluster_index(offset);
            table.inc(cluster, rep)?;
            if table.get(cluster) != 1 {
                rep.corruptions += 1;
                *need_rebuild = true;
                rep.push(Finding::err(
                    "RB.SHARED",
                    format!(
                        "refblock cluster {cluster} has {} references",
                        table.get(cluster)
                    ),
                ));
            }
        }
        Ok(())
    }

    /// Phase 3. Compares on-disk counts against the truth and repairs per
    /// the mismatch table.
    fn compare_refcounts(
        &mut self,
        table: &Imrt,
        rep: &mut CheckReport,
        fix_errors: bool,
        fix_leaks: bool,
        need_rebuild: &mut bool,
    ) -> CheckResult<()> {
        let file_len = self.io.length().map_err(CheckError::IO)?;
        let total = self.meta.size_to_clusters(file_len).max(table.len());

        for cluster in 0..total {
            let r_disk = match self.get_refcount(cluster) {
                Ok(r) => r as i64,
                Err(e) => {
                    rep.check_errors += 1;
                    rep.push(Finding::err(
                        "REF.READ",
                        format!("cannot read refcount of cluster {cluster}: {e}"),
                    ));
                    continue;
                }
            };
            let r_truth = table.get(cluster) as i64;
            if r_disk == r_truth {
                continue;
            }

            if r_disk == 0 && r_truth > 0 {
                // A live reference with a zero refcount usually means the
                // covering refblock is gone.
                *need_rebuild = true;
            }

            let fixable = if r_disk < r_truth { fix_errors } else { fix_leaks };
            if fixable {
                let kind = if r_disk > r_truth {
                    DiscardKind::Always
                } else {
                    DiscardKind::Never
                };
                match self.update_refcount_retrying(
                    self.meta.cluster_offset(cluster),
                    self.meta.cluster_size,
                    r_truth - r_disk,
                    kind,
                ) {
                    Ok(()) => {
                        if r_disk < r_truth {
                            rep.corruptions_fixed += 1;
                        } else {
                            rep.leaks_fixed += 1;
                        }
                        continue;
                    }
                    Err(e) => {
                        rep.check_errors += 1;
                        rep.push(Finding::err(
                            "REF.FIX",
                            format!("repairing cluster {cluster} failed: {e}"),
                        ));
                    }
                }
            }

            if r_disk < r_truth {
                rep.corruptions += 1;
                rep.push(Finding::err(
                    "REF.UNDER",
                    format!("cluster {cluster} refcount {r_disk}, expected {r_truth}"),
                ));
            } else {
                rep.leaks += 1;
                rep.push(Finding::warn(
                    "REF.LEAK",
                    format!("cluster {cluster} refcount {r_disk}, expected {r_truth}"),
                ));
            }
        }
        Ok(())
    }

    /// Phase 5. The only-copy bit must be set exactly when the target's
    /// refcount is one. Only the active L1 tree is audited: readers never
    /// trust the bit in snapshot tables.
    fn check_copied_flags(&mut self, rep: &mut CheckReport, flags: RepairFlags) -> CheckResult<()> {
        let repair = flags.contains(RepairFlags::FIX_ERRORS)
            || (flags.contains(RepairFlags::FIX_LEAKS)
                && rep.check_errors == 0
                && rep.corruptions == 0);

        let s = self.meta.cluster_size;
        let l1 = self.active_l1.clone();
        for (idx, &entry) in l1.iter().enumerate() {
            let l2_offset = entry & OFFSET_MASK;
            if l2_offset == 0 {
                continue;
            }

            // The L1 entry's own bit.
            let refcount = match self.get_refcount(self.meta.cluster_index(l2_offset)) {
                Ok(r) => r,
                Err(e) => {
                    rep.check_errors += 1;
                    rep.push(Finding::err("OFLAG.L1", format!("{e}")));
                    continue;
                }
            };
            let expect = refcount == 1;
            let has = entry & FLAG_COPIED != 0;
            if has != expect {
                if repair {
                    let fixed = if expect {
                        entry | FLAG_COPIED
                    } else {
                        entry & !FLAG_COPIED
                    };
                    self.io
                        .write_u64_be_at(self.meta.l1_table_offset + idx as u64 * 8, fixed)
                        .map_err(CheckError::IO)?;
                    self.active_l1[idx] = fixed;
                    rep.corruptions_fixed += 1;
                    rep.push(Finding::warn(
                        "OFLAG.L1",
                        format!("repaired only-copy bit of L1 entry {idx}"),
                    ));
                } else {
                    rep.corruptions += 1;
                    rep.push(Finding::err(
                        "OFLAG.L1",
                        format!("L1 entry {idx} only-copy bit wrong (refcount {refcount})"),
                    ));
                }
            }

            // The L2 entries.
            let mut raw = vec![0u8; s as usize];
            if let Err(e) = self.io.read_at(l2_offset, &mut raw) {
                rep.check_errors += 1;
                rep.push(Finding::err(
                    "OFLAG.L2",
                    format!("cannot read L2 table at {l2_offset:#x}: {e}"),
                ));
                continue;
            }
            let mut l2_dirty = false;
            for slot in 0..(s / 8) as usize {
                let entry =
                    u64::from_be_bytes(raw[slot * 8..slot * 8 + 8].try_into().unwrap());
                let expect = match cluster_kind(entry) {
                    ClusterKind::Normal | ClusterKind::ZeroAlloc => {
                        let cluster = self.meta.cluster_index(entry & OFFSET_MASK);
                        match self.get_refcount(cluster) {
                            Ok(r) => r == 1,
                            Err(e) => {
                                rep.check_errors += 1;
                                rep.push(Finding::err("OFLAG.L2", format!("{e}")));
                                continue;
                            }
                        }
                    }
                    // Compressed entries never carry the bit.
                    ClusterKind::Compressed => false,
                    ClusterKind::Unallocated | ClusterKind::ZeroPlain => continue,
                };
                let has = entry & FLAG_COPIED != 0;
                if has != expect {
                    if repair {
                        let fixed = if expect {
                            entry | FLAG_COPIED
                        } else {
                            entry & !FLAG_COPIED
                        };
                        raw[slot * 8..slot * 8 + 8].copy_from_slice(&fixed.to_be_bytes());
                        l2_dirty = true;
                        rep.corruptions_fixed += 1;
                    } else {
                        rep.corruptions += 1;
                        rep.push(Finding::err(
                            "OFLAG.L2",
                            format!("L2 entry {slot} at {l2_offset:#x} only-copy bit wrong"),
                        ));
                    }
                }
            }
            if l2_dirty {
                self.pre_write_overlap(
                    MetadataKind::ACTIVE_L2 | MetadataKind::INACTIVE_L2,
                    l2_offset,
                    s,
                )
                .map_err(CheckError::Refcount)?;
                self.io.write_at(l2_offset, &raw).map_err(CheckError::IO)?;
                rep.push(Finding::warn(
                    "OFLAG.L2",
                    format!("repaired only-copy bits in L2 table at {l2_offset:#x}"),
                ));
            }
        }
        Ok(())
    }
}

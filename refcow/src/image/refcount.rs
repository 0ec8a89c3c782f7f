// SPDX-License-Identifier: MIT

//! The refcount store: a two-level on-disk structure (reftable ->
//! refblocks -> 16-bit counts) that also describes its own clusters.
//!
//! The delicate part is refblock allocation. A refblock that should
//! describe cluster range R may itself land inside R (self-describing) or
//! outside it (cross-describing, charged through one bounded recursion).
//! Either way the caller's own cluster search may have been invalidated by
//! the metadata allocation, which the internal `RetryAlloc` error reports;
//! public entry points restart their scan in a bounded loop.

#[cfg(all(not(feature = "std"), feature = "alloc"))]
use alloc::{vec, vec::Vec};

use refio::prelude::*;

use crate::core::{RefcountError, RefcountResult};
use crate::image::cache::{CacheHandle, CacheKind};
use crate::image::{DiscardKind, Image, MetadataKind};

/// Bound on `RetryAlloc` restarts. Two refblock allocations per span plus a
/// reftable growth is the worst real chain; anything past this is a bug.
pub(crate) const MAX_ALLOC_RETRIES: usize = 16;

#[inline]
pub(crate) fn read_count(buf: &[u8], slot: usize) -> u16 {
    u16::from_be_bytes([buf[slot * 2], buf[slot * 2 + 1]])
}

#[inline]
pub(crate) fn write_count(buf: &mut [u8], slot: usize, value: u16) {
    buf[slot * 2..slot * 2 + 2].copy_from_slice(&value.to_be_bytes());
}

impl<B: BlockIO> Image<B> {
    /// Refcount of one cluster. Absent refblocks read as zero.
    pub fn get_refcount(&mut self, cluster: u64) -> RefcountResult<u16> {
        let t = self.meta.reftable_index(cluster);
        if t >= self.reftable.len() as u64 {
            return Ok(0);
        }
        let refblock_offset = self.reftable[t as usize];
        if refblock_offset == 0 {
            return Ok(0);
        }
        if !self.meta.is_cluster_aligned(refblock_offset) {
            self.signal_corruption(
                true,
                refblock_offset,
                self.meta.cluster_size,
                "refblock offset misaligned",
            );
            return Err(RefcountError::Corrupt("refblock offset misaligned"));
        }

        let h = self.refblock_cache_get(refblock_offset)?;
        let count = read_count(self.refblock_cache.buf(h), self.meta.refblock_slot(cluster));
        self.refblock_cache.put(h);
        Ok(count)
    }

    /// Adds `addend` to one cluster's refcount and returns the new count.
    /// `addend` must be −1 or +1; the multi-delta form is internal to the
    /// checker.
    pub fn update_cluster_refcount(
        &mut self,
        cluster: u64,
        addend: i64,
        kind: DiscardKind,
    ) -> RefcountResult<u16> {
        crate::ensure!(
            addend == 1 || addend == -1,
            RefcountError::InvalidArgument("addend must be -1 or +1")
        );
        self.update_refcount_retrying(self.meta.cluster_offset(cluster), self.meta.cluster_size, addend, kind)?;
        self.get_refcount(cluster)
    }

    /// `update_refcount` wrapped in the bounded retry loop, for callers that
    /// are not themselves allocators.
    pub(crate) fn update_refcount_retrying(
        &mut self,
        offset: u64,
        length: u64,
        addend: i64,
        kind: DiscardKind,
    ) -> RefcountResult<()> {
        for _ in 0..MAX_ALLOC_RETRIES {
            match self.update_refcount(offset, length, addend, kind) {
                Err(RefcountError::RetryAlloc) => continue,
                other => return other,
            }
        }
        Err(RefcountError::Other("refblock allocation kept retrying"))
    }

    /// Applies `addend` to every cluster intersecting `[offset, offset +
    /// length)`. On any error the deltas already applied are undone best
    /// effort and the original error returns; no partial success is
    /// reported. May fail with the internal `RetryAlloc` after hooking a
    /// new refblock into the reftable.
    pub(crate) fn update_refcount(
        &mut self,
        offset: u64,
        length: u64,
        addend: i64,
        kind: DiscardKind,
    ) -> RefcountResult<()> {
        if length == 0 {
            return Ok(());
        }
        self.ensure_writable()?;
        debug_assert!(addend != 0);

        if addend < 0 {
            // A freed cluster's L2 unhook must reach disk before the
            // refcount write that releases it.
            self.set_cache_dependency(CacheKind::Refblock, CacheKind::L2)?;
        }

        let first = self.meta.cluster_index(self.meta.start_of_cluster(offset));
        let last = self.meta.cluster_index(offset + length - 1);

        let mut applied: u64 = 0;
        let mut result = Ok(());

        'outer: for cluster in first..=last {
            let handle = match self.load_or_alloc_refblock(cluster) {
                Ok(h) => h,
                Err(e) => {
                    result = Err(e);
                    break 'outer;
                }
            };
            let slot = self.meta.refblock_slot(cluster);
            let old = read_count(self.refblock_cache.buf(handle), slot) as i64;
            let new = old + addend;
            if !(0..=u16::MAX as i64).contains(&new) {
                self.refblock_cache.put(handle);
                result = Err(RefcountError::Corrupt("refcount outside [0, 0xffff]"));
                break 'outer;
            }

            write_count(self.refblock_cache.buf_mut(handle), slot, new as u16);
            self.refblock_cache.mark_dirty(handle);
            self.refblock_cache.put(handle);
            applied += 1;

            if new == 0 {
                if cluster < self.free_cluster_hint {
                    self.free_cluster_hint = cluster;
                }
                if self.opts.discard_enabled(kind) {
                    self.discards
                        .enqueue(self.meta.cluster_offset(cluster), self.meta.cluster_size);
                }
            }
        }

        if result.is_err() && applied > 0 {
            self.undo_refcount_delta(first, applied, addend);
        }

        if !self.cache_discards {
            let ok = result.is_ok();
            if let Err(e) = self.discards.flush(&mut self.io, ok) {
                log::warn!("discard flush failed: {e}");
            }
        }

        result
    }

    /// Best-effort rollback of `update_refcount`: re-applies `-addend` to
    /// the `applied` clusters starting at `first`, in reverse. Failures here
    /// are logged and swallowed; the caller returns the original error.
    fn undo_refcount_delta(&mut self, first: u64, applied: u64, addend: i64) {
        for cluster in (first..first + applied).rev() {
            let handle = match self.load_or_alloc_refblock(cluster) {
                Ok(h) => h,
                Err(e) => {
                    log::warn!("refcount rollback failed for cluster {cluster}: {e}");
                    continue;
                }
            };
            let slot = self.meta.refblock_slot(cluster);
            let old = read_count(self.refblock_cache.buf(handle), slot) as i64;
            let new = old - addend;
            if (0..=u16::MAX as i64).contains(&new) {
                write_count(self.refblock_cache.buf_mut(handle), slot, new as u16);
                self.refblock_cache.mark_dirty(handle);
            } else {
                log::warn!("refcount rollback overflow for cluster {cluster}");
            }
            self.refblock_cache.put(handle);
        }
    }

    /// Loads the refblock covering `cluster`, allocating (and hooking) it
    /// if the reftable slot is empty and growing the reftable if the slot
    /// does not exist. Both mutating paths end in `RetryAlloc`.
    fn load_or_alloc_refblock(&mut self, cluster: u64) -> RefcountResult<CacheHandle> {
        let t = self.meta.reftable_index(cluster);

        if t >= self.reftable.len() as u64 {
            self.grow_reftable(t)?;
            return Err(RefcountError::RetryAlloc);
        }

        let existing = self.reftable[t as usize];
        if existing != 0 {
            if !self.meta.is_cluster_aligned(existing) {
                self.signal_corruption(
                    true,
                    existing,
                    self.meta.cluster_size,
                    "refblock offset misaligned",
                );
                return Err(RefcountError::Corrupt("refblock offset misaligned"));
            }
            return self.refblock_cache_get(existing);
        }

        // The slot is empty: allocate a cluster for the new refblock. L2
        // entries may depend on refcount writes, so settle them first.
        self.flush_cache(CacheKind::L2)?;

        let new_block = self.alloc_clusters_raw(1)?;
        let new_offset = self.meta.cluster_offset(new_block);
        // Inactive L2 tables are skipped here: auditing them re-reads every
        // snapshot L1 and a free cluster cannot be one of them anyway.
        self.pre_write_overlap(MetadataKind::INACTIVE_L2, new_offset, self.meta.cluster_size)?;

        let self_describing = self.meta.reftable_index(new_block) == t;
        if self_describing {
            // The refblock describes its own cluster: count it inside
            // itself, no recursion needed.
            let h = self.refblock_cache_get_empty(new_offset)?;
            self.refblock_cache.buf_mut(h).fill(0);
            write_count(
                self.refblock_cache.buf_mut(h),
                self.meta.refblock_slot(new_block),
                1,
            );
            self.refblock_cache.mark_dirty(h);
            self.refblock_cache.put(h);
        } else {
            // Cross-describing: charge the new refblock through the normal
            // path. The recursion terminates at the second level: that
            // allocation scans from the free hint and lands in the span it
            // describes.
            self.update_refcount(new_offset, self.meta.cluster_size, 1, DiscardKind::Never)?;

            let h = self.refblock_cache_get_empty(new_offset)?;
            self.refblock_cache.buf_mut(h).fill(0);
            self.refblock_cache.mark_dirty(h);
            self.refblock_cache.put(h);
        }

        // The refblock content must be durably orderable before anything
        // references it.
        self.flush_cache(CacheKind::Refblock)?;

        // Hook it into the reftable: on disk first (durable), then in
        // memory. After this, the caller's own cluster search is stale.
        self.io
            .write_sync_at(self.meta.reftable_offset + t * 8, &new_offset.to_be_bytes())
            .map_err(RefcountError::IO)?;
        self.reftable[t as usize] = new_offset;

        log::debug!("allocated refblock for span {t} at {new_offset:#x}");
        Err(RefcountError::RetryAlloc)
    }

    /// Grows the reftable so that slot `min_index` exists.
    ///
    /// The new reftable, and refblocks describing every cluster of the new
    /// metadata area, are built in memory and written past the current
    /// image end, so nothing live is touched. The single durable 12-byte
    /// header write of `(offset, clusters)` is the linearisation point: a
    /// crash before it leaves the old structure current (new clusters
    /// leak), a crash after it leaves the new structure current (the old
    /// reftable's clusters leak). A follow-up check recovers either.
    fn grow_reftable(&mut self, min_index: u64) -> RefcountResult<()> {
        let rb = self.meta.refblock_entries;
        let table_entry_bytes = 8u64;
        let entries_per_cluster = self.meta.cluster_size / table_entry_bytes;

        // ×3/2+1 growth, amortising repeated extension.
        let mut entries = (self.reftable.len() as u64).max(1);
        while entries <= min_index {
            entries = entries * 3 / 2 + 1;
        }

        let file_len = self.io.length().map_err(RefcountError::IO)?;
        let area_start = self.meta.size_to_clusters(file_len);

        // Fixed point: the table, plus the refblocks describing the table
        // and themselves, must all fit in the area and be covered by the
        // table.
        let (table_clusters, new_blocks, area_end) = loop {
            let table_clusters = entries.div_ceil(entries_per_cluster);
            crate::ensure!(
                table_clusters <= self.meta.max_reftable_clusters(),
                RefcountError::TooBig
            );

            let mut blocks: u64 = 0;
            let blocks = loop {
                let area_end = area_start + table_clusters + blocks;
                let needed = self.count_uncovered_spans(area_start, area_end);
                if needed == blocks {
                    break blocks;
                }
                blocks = needed;
            };
            let area_end = area_start + table_clusters + blocks;

            let last_span = (area_end - 1) / rb;
            if last_span >= entries {
                entries = entries * 3 / 2 + 1;
                continue;
            }
            break (table_clusters, blocks, area_end);
        };

        // Layout: new refblocks first, then the table.
        let blocks_base = area_start;
        let table_base = area_start + new_blocks;
        let table_offset = self.meta.cluster_offset(table_base);

        self.pre_write_overlap(
            MetadataKind::INACTIVE_L2,
            self.meta.cluster_offset(area_start),
            self.meta.cluster_offset(area_end) - self.meta.cluster_offset(area_start),
        )?;

        // Build the new table: old entries carry over, uncovered spans of
        // the area get the freshly placed refblocks, in span order.
        let mut new_table = vec![0u64; (table_clusters * entries_per_cluster) as usize];
        new_table[..self.reftable.len()].copy_from_slice(&self.reftable);

        let mut next_block = blocks_base;
        for span in area_start / rb..=(area_end - 1) / rb {
            if new_table[span as usize] == 0 {
                new_table[span as usize] = self.meta.cluster_offset(next_block);
                next_block += 1;
            }
        }
        debug_assert_eq!(next_block, blocks_base + new_blocks);

        // Area clusters in spans that already have a refblock are charged
        // through the live structure; visible through both the old and the
        // new reftable, so a crash on either side stays consistent.
        let mut covered_run_start: Option<u64> = None;
        for cluster in area_start..=area_end {
            let covered = cluster < area_end
                && (cluster / rb) < self.reftable.len() as u64
                && self.reftable[(cluster / rb) as usize] != 0;
            match (covered, covered_run_start) {
                (true, None) => covered_run_start = Some(cluster),
                (false, Some(start)) => {
                    self.update_refcount(
                        self.meta.cluster_offset(start),
                        self.meta.cluster_offset(cluster) - self.meta.cluster_offset(start),
                        1,
                        DiscardKind::Never,
                    )?;
                    covered_run_start = None;
                }
                _ => {}
            }
        }
        self.flush_cache(CacheKind::Refblock)?;

        // Write the new refblocks: each covers one span; count 1 for every
        // area cluster falling inside it.
        let mut block_buf = vec![0u8; self.meta.cluster_size as usize];
        for (i, block_cluster) in (blocks_base..blocks_base + new_blocks).enumerate() {
            // Find the span this block was assigned to.
            let span = self
                .area_span_of_new_block(&new_table, blocks_base, i)
                .ok_or(RefcountError::Other("reftable growth bookkeeping broken"))?;
            block_buf.fill(0);
            for cluster in area_start..area_end {
                if cluster / rb == span {
                    write_count(&mut block_buf, (cluster % rb) as usize, 1);
                }
            }
            self.io
                .write_at(self.meta.cluster_offset(block_cluster), &block_buf)
                .map_err(RefcountError::IO)?;
        }

        // Write the new table.
        let mut table_buf = vec![0u8; (table_clusters * self.meta.cluster_size) as usize];
        for (i, entry) in new_table.iter().enumerate() {
            table_buf[i * 8..i * 8 + 8].copy_from_slice(&entry.to_be_bytes());
        }
        self.io
            .write_in_chunks(table_offset, &table_buf, self.meta.cluster_size as usize)
            .map_err(RefcountError::IO)?;

        // Linearisation point.
        let old_offset = self.meta.reftable_offset;
        let old_clusters = self.meta.reftable_clusters;
        self.meta
            .commit_reftable_pointer(&mut self.io, table_offset, table_clusters as u32)?;
        self.reftable = new_table;

        log::debug!(
            "reftable grown to {} entries at {table_offset:#x} ({new_blocks} new refblocks)",
            self.reftable.len()
        );

        // The old reftable is garbage now; release it through the ordinary
        // free path (enqueues discards).
        self.free_clusters(
            old_offset,
            old_clusters as u64 * self.meta.cluster_size,
            DiscardKind::Other,
        );

        Ok(())
    }

    /// Number of spans intersecting `[area_start, area_end)` that have no
    /// refblock yet.
    fn count_uncovered_spans(&self, area_start: u64, area_end: u64) -> u64 {
        let rb = self.meta.refblock_entries;
        let mut count = 0;
        for span in area_start / rb..=(area_end - 1) / rb {
            let covered =
                span < self.reftable.len() as u64 && self.reftable[span as usize] != 0;
            if !covered {
                count += 1;
            }
        }
        count
    }

    /// Span index the `i`-th new refblock of a growth area was assigned to.
    fn area_span_of_new_block(
        &self,
        new_table: &[u64],
        blocks_base: u64,
        i: usize,
    ) -> Option<u64> {
        let target = self.meta.cluster_offset(blocks_base + i as u64);
        new_table
            .iter()
            .position(|&e| e == target)
            .map(|span| span as u64)
    }
}

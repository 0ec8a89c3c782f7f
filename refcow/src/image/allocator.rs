// SPDX-License-Identifier: MIT

//! Cluster allocation: linear scan over the refcount store, driven by a
//! free-cluster hint.

use refio::prelude::*;

use crate::core::{RefcountError, RefcountResult};
use crate::image::cache::CacheKind;
use crate::image::refcount::MAX_ALLOC_RETRIES;
use crate::image::types::{cluster_kind, ClusterKind, OFFSET_MASK};
use crate::image::{DiscardKind, Image};

impl<B: BlockIO> Image<B> {
    /// Finds `n` contiguous free clusters and advances the hint past them
    /// WITHOUT touching their refcounts. This is the primitive the refblock
    /// allocator itself uses; everyone else wants [`Image::alloc_clusters`].
    pub(crate) fn alloc_clusters_raw(&mut self, n: u64) -> RefcountResult<u64> {
        debug_assert!(n > 0);

        // A queued discard covers a freed cluster this scan may hand back
        // out; settle the queue so the back-end cannot discard live data.
        if !self.discards.is_empty() {
            self.discards
                .flush(&mut self.io, true)
                .map_err(RefcountError::IO)?;
        }

        let mut start = self.free_cluster_hint;
        let mut run: u64 = 0;
        loop {
            let cluster = start + run;
            // The resulting offsets must fit the entry offset field.
            crate::ensure!(
                self.meta.cluster_offset(cluster + 1) <= OFFSET_MASK,
                RefcountError::OutOfSpace
            );
            if self.get_refcount(cluster)? != 0 {
                // Restart just past the collision, never from the
                // beginning: guarantees forward progress.
                start = cluster + 1;
                run = 0;
                continue;
            }
            run += 1;
            if run == n {
                self.free_cluster_hint = start + n;
                return Ok(start);
            }
        }
    }

    /// Allocates `size` bytes of clusters and returns the byte offset of
    /// the run. Restarts the search whenever refblock allocation consumed
    /// candidate clusters.
    pub fn alloc_clusters(&mut self, size: u64) -> RefcountResult<u64> {
        self.ensure_writable()?;
        crate::ensure!(size > 0, RefcountError::InvalidArgument("size must be > 0"));
        let n = self.meta.size_to_clusters(size);

        for _ in 0..MAX_ALLOC_RETRIES {
            let first = self.alloc_clusters_raw(n)?;
            let offset = self.meta.cluster_offset(first);
            match self.update_refcount(offset, n * self.meta.cluster_size, 1, DiscardKind::Never) {
                Err(RefcountError::RetryAlloc) => continue,
                Err(e) => return Err(e),
                Ok(()) => return Ok(offset),
            }
        }
        Err(RefcountError::Other("cluster allocation kept retrying"))
    }

    /// Claims up to `n` clusters at exactly `offset`: counts how many of
    /// them are currently free, increments that prefix, and returns how
    /// many were claimed. Used when restoring a known layout.
    pub fn alloc_clusters_at(&mut self, offset: u64, n: u64) -> RefcountResult<u64> {
        self.ensure_writable()?;
        crate::ensure!(
            self.meta.is_cluster_aligned(offset),
            RefcountError::InvalidArgument("offset misaligned")
        );
        if n == 0 {
            return Ok(0);
        }

        let first = self.meta.cluster_index(offset);
        let mut free_n = 0u64;
        while free_n < n && self.get_refcount(first + free_n)? == 0 {
            free_n += 1;
        }
        if free_n == 0 {
            return Ok(0);
        }

        self.update_refcount_retrying(
            offset,
            free_n * self.meta.cluster_size,
            1,
            DiscardKind::Never,
        )?;
        Ok(free_n)
    }

    /// Allocates `size` bytes (at most one cluster) for a compressed
    /// payload, packing consecutive allocations into shared clusters via a
    /// bump pointer.
    ///
    /// The contiguity reuse is advisory: when the fresh cluster does not
    /// immediately follow the open partial cluster, the partial cluster's
    /// tail is abandoned and leaks until the next check repairs it.
    pub fn alloc_bytes(&mut self, size: u64) -> RefcountResult<u64> {
        self.ensure_writable()?;
        crate::ensure!(
            size > 0 && size <= self.meta.cluster_size,
            RefcountError::InvalidArgument("size outside (0, cluster_size]")
        );

        let s = self.meta.cluster_size;
        let free_in_cluster = if self.free_byte_offset == 0 {
            0
        } else {
            s - (self.free_byte_offset & (s - 1))
        };

        let offset;
        if self.free_byte_offset != 0 && size <= free_in_cluster {
            // Fits in the open partial cluster: share it.
            offset = self.free_byte_offset;
            self.free_byte_offset += size;
            self.update_cluster_refcount(self.meta.cluster_index(offset), 1, DiscardKind::Never)?;
        } else {
            let fresh = self.alloc_clusters(s)?;
            if self.free_byte_offset != 0
                && fresh == self.meta.start_of_cluster(self.free_byte_offset) + s
            {
                // The fresh cluster is the immediate neighbour: the payload
                // may span the boundary. The fresh cluster already counts 1
                // from the allocation; the shared tail costs one more on
                // the old cluster.
                offset = self.free_byte_offset;
                self.free_byte_offset = offset + size;
                self.update_cluster_refcount(
                    self.meta.cluster_index(offset),
                    1,
                    DiscardKind::Never,
                )?;
            } else {
                offset = fresh;
                self.free_byte_offset = fresh + size;
            }
        }
        if self.free_byte_offset & (s - 1) == 0 {
            self.free_byte_offset = 0;
        }

        // The L2 entry referencing this payload may only reach disk after
        // the refcounts above.
        self.set_cache_dependency(CacheKind::L2, CacheKind::Refblock)?;
        Ok(offset)
    }

    /// Decrements the refcount of every cluster intersecting `[offset,
    /// offset + length)`. Errors are logged, never returned: the only
    /// callers are release paths that cannot abort, and a leak is
    /// preferable to a dangling reference. The next check recovers the
    /// space.
    pub fn free_clusters(&mut self, offset: u64, length: u64, kind: DiscardKind) {
        if length == 0 {
            return;
        }
        if let Err(e) = self.update_refcount_retrying(offset, length, -1, kind) {
            log::error!(
                "failed to free {length:#x} bytes at {offset:#x}: {e}; space leaked until next check"
            );
        }
    }

    /// Frees whatever an L2 entry references: the sub-cluster range of a
    /// compressed entry, `n_clusters` clusters of a normal or zero-alloc
    /// entry, nothing for the rest.
    pub fn free_by_l2_entry(&mut self, entry: u64, n_clusters: u64, kind: DiscardKind) {
        match cluster_kind(entry) {
            ClusterKind::Compressed => {
                let (coffset, sectors) = self.meta.compressed_range(entry);
                self.free_clusters(coffset & !511, sectors * 512, kind);
            }
            ClusterKind::Normal | ClusterKind::ZeroAlloc => {
                let offset = entry & OFFSET_MASK;
                if !self.meta.is_cluster_aligned(offset) {
                    self.signal_corruption(
                        false,
                        offset,
                        n_clusters * self.meta.cluster_size,
                        "freeing misaligned L2 entry",
                    );
                    return;
                }
                self.free_clusters(offset, n_clusters * self.meta.cluster_size, kind);
            }
            ClusterKind::ZeroPlain | ClusterKind::Unallocated => {}
        }
    }

    /// Clusters currently holding a non-zero refcount, by linear scan.
    /// Test and statistics helper; O(image size).
    pub fn allocated_clusters(&mut self) -> RefcountResult<u64> {
        let file_len = self.io.length().map_err(RefcountError::IO)?;
        let total = self.meta.size_to_clusters(file_len);
        let mut used = 0;
        for cluster in 0..total {
            if self.get_refcount(cluster)? != 0 {
                used += 1;
            }
        }
        Ok(used)
    }
}

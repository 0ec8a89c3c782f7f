// SPDX-License-Identifier: MIT

#[cfg(all(not(feature = "std"), feature = "alloc"))]
use alloc::{vec, vec::Vec};

use refio::prelude::*;

pub mod cache;
pub mod discard;
pub mod meta;
pub mod types;

mod allocator;
mod checker;
mod overlap;
mod refcount;
mod snapshot;

pub use meta::ImageMeta;
pub use overlap::MetadataKind;
pub use snapshot::L1Ref;

use crate::core::{ImageError, ImageResult, RefcountError, RefcountResult};
use cache::{CacheHandle, CacheKind, MetaCache};
use discard::DiscardQueue;
use types::*;

/// Why a range is being freed. [`ImageOptions`] decides which classes are
/// forwarded to the back-end as discards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardKind {
    /// Never discard.
    Never,
    /// Always discard, regardless of configuration.
    Always,
    /// Guest-requested discard.
    Request,
    /// Freed by snapshot deletion.
    Snapshot,
    /// Any other metadata release.
    Other,
}

/// Engine configuration. Plain data; everything has a working default.
#[derive(Debug, Clone)]
pub struct ImageOptions {
    pub refblock_cache_entries: usize,
    pub l2_cache_entries: usize,
    pub discard_request: bool,
    pub discard_snapshot: bool,
    pub discard_other: bool,
}

impl Default for ImageOptions {
    fn default() -> Self {
        Self {
            refblock_cache_entries: 16,
            l2_cache_entries: 16,
            discard_request: true,
            discard_snapshot: false,
            discard_other: false,
        }
    }
}

impl ImageOptions {
    fn discard_enabled(&self, kind: DiscardKind) -> bool {
        match kind {
            DiscardKind::Never => false,
            DiscardKind::Always => true,
            DiscardKind::Request => self.discard_request,
            DiscardKind::Snapshot => self.discard_snapshot,
            DiscardKind::Other => self.discard_other,
        }
    }
}

/// One snapshot's `(l1_offset, l1_size)` pair from the snapshot table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotInfo {
    pub l1_table_offset: u64,
    pub l1_size: u32,
}

/// A corruption signal. Handed to the installed sink (if any) and mirrored
/// through the log; a fatal event marks the image unusable for writes.
#[derive(Debug, Clone, Copy)]
pub struct CorruptionEvent<'a> {
    pub fatal: bool,
    pub offset: u64,
    pub size: u64,
    pub description: &'a str,
}

#[cfg(feature = "std")]
type CorruptionSink = Box<dyn FnMut(&CorruptionEvent<'_>) + Send>;

/// The refcount engine of one copy-on-write cluster image.
///
/// Owns the back-end, the in-memory reftable and active L1, both metadata
/// caches and the discard queue. Exactly one logical executor drives it;
/// nothing here is shared across threads.
pub struct Image<B: BlockIO> {
    io: B,
    meta: ImageMeta,
    opts: ImageOptions,

    reftable: Vec<u64>,
    active_l1: Vec<u64>,
    snapshots: Vec<SnapshotInfo>,

    refblock_cache: MetaCache,
    l2_cache: MetaCache,
    discards: DiscardQueue,

    /// Cluster index at or before the lowest known free cluster.
    free_cluster_hint: u64,
    /// Bump pointer inside a partially used cluster for sub-cluster
    /// (compressed) allocations; 0 when none is open.
    free_byte_offset: u64,

    /// Suppresses automatic discard flushing for the span of one batch.
    cache_discards: bool,
    /// Sticky: set by a fatal corruption signal; all further mutations fail.
    corrupt: bool,

    #[cfg(feature = "std")]
    corruption_sink: Option<CorruptionSink>,
}

impl<B: BlockIO> Image<B> {
    /// Opens an existing image: validates the header and loads the
    /// reftable, the active L1 and the snapshot table into memory.
    pub fn open(mut io: B, opts: ImageOptions) -> ImageResult<Self> {
        let hdr: ImageHeader = io.read_struct(0)?;
        let meta = ImageMeta::from_header(&hdr)?;

        let reftable = Self::load_reftable(&mut io, &meta)?;
        let active_l1 = Self::load_l1(&mut io, meta.l1_table_offset, meta.l1_size)?;
        let snapshots = Self::load_snapshot_table(&mut io, &meta)?;

        Ok(Self::assemble(
            io, meta, opts, reftable, active_l1, snapshots,
        ))
    }

    /// Creates a fresh minimal image: the header in cluster 0, a one-cluster
    /// reftable in cluster 1 and one refblock in cluster 2 describing all
    /// three. No L1 table is allocated; the data path above grows one on
    /// first write.
    pub fn create(mut io: B, disk_size: u64, cluster_bits: u32, opts: ImageOptions) -> ImageResult<Self> {
        let mut meta = ImageMeta::new(cluster_bits, disk_size)?;
        let s = meta.cluster_size;
        meta.reftable_offset = s;
        meta.reftable_clusters = 1;

        io.truncate(3 * s)?;

        // Refblock in cluster 2: clusters 0..=2 are in use.
        let mut refblock = vec![0u8; s as usize];
        for slot in 0..3 {
            refblock[slot * 2..slot * 2 + 2].copy_from_slice(&1u16.to_be_bytes());
        }
        io.write_at(2 * s, &refblock)?;

        // Reftable in cluster 1: slot 0 points at the refblock.
        io.zero_fill(s, s as usize)?;
        io.write_u64_be_at(s, 2 * s)?;

        meta.write_header(&mut io)?;
        io.flush()?;

        let mut reftable = vec![0u64; meta.reftable_entries() as usize];
        reftable[0] = 2 * s;

        Ok(Self::assemble(io, meta, opts, reftable, Vec::new(), Vec::new()))
    }

    fn assemble(
        io: B,
        meta: ImageMeta,
        opts: ImageOptions,
        reftable: Vec<u64>,
        active_l1: Vec<u64>,
        snapshots: Vec<SnapshotInfo>,
    ) -> Self {
        let block = meta.cluster_size as usize;
        let refblock_cache = MetaCache::new("refblock", block, opts.refblock_cache_entries);
        let l2_cache = MetaCache::new("l2", block, opts.l2_cache_entries);
        Self {
            io,
            meta,
            opts,
            reftable,
            active_l1,
            snapshots,
            refblock_cache,
            l2_cache,
            discards: DiscardQueue::new(),
            free_cluster_hint: 0,
            free_byte_offset: 0,
            cache_discards: false,
            corrupt: false,
            #[cfg(feature = "std")]
            corruption_sink: None,
        }
    }

    fn load_reftable(io: &mut B, meta: &ImageMeta) -> ImageResult<Vec<u64>> {
        let entries = meta.reftable_entries() as usize;
        let mut raw = vec![0u8; entries * 8];
        io.read_in_chunks(meta.reftable_offset, &mut raw, meta.cluster_size as usize)?;

        let mut table = Vec::with_capacity(entries);
        for chunk in raw.chunks_exact(8) {
            let entry = u64::from_be_bytes(chunk.try_into().unwrap());
            crate::ensure!(
                entry & REFTABLE_RESERVED_MASK == 0,
                ImageError::Refcount(RefcountError::Corrupt(
                    "reftable entry has reserved bits set"
                ))
            );
            crate::ensure!(
                meta.is_cluster_aligned(entry),
                ImageError::Refcount(RefcountError::Corrupt("refblock offset misaligned"))
            );
            table.push(entry);
        }
        Ok(table)
    }

    fn load_l1(io: &mut B, offset: u64, entries: u32) -> ImageResult<Vec<u64>> {
        if offset == 0 || entries == 0 {
            return Ok(Vec::new());
        }
        let mut raw = vec![0u8; entries as usize * 8];
        io.read_in_chunks(offset, &mut raw, 8192)?;
        Ok(raw
            .chunks_exact(8)
            .map(|c| u64::from_be_bytes(c.try_into().unwrap()))
            .collect())
    }

    fn load_snapshot_table(io: &mut B, meta: &ImageMeta) -> ImageResult<Vec<SnapshotInfo>> {
        if meta.snapshots_offset == 0 || meta.snapshots_count == 0 {
            return Ok(Vec::new());
        }
        let mut list = Vec::with_capacity(meta.snapshots_count as usize);
        for i in 0..meta.snapshots_count as u64 {
            let rec: SnapshotRecord =
                io.read_struct(meta.snapshots_offset + i * SNAPSHOT_RECORD_SIZE as u64)?;
            let info = SnapshotInfo {
                l1_table_offset: rec.l1_table_offset.get(),
                l1_size: rec.l1_size.get(),
            };
            crate::ensure!(
                meta.is_cluster_aligned(info.l1_table_offset),
                ImageError::Refcount(RefcountError::Corrupt("snapshot L1 offset misaligned"))
            );
            list.push(info);
        }
        Ok(list)
    }

    /// Flushes both caches and the pending discards, then the back-end.
    /// Returns the back-end.
    pub fn close(mut self) -> ImageResult<B> {
        self.flush_cache(CacheKind::L2)?;
        self.flush_cache(CacheKind::Refblock)?;
        self.discards.flush(&mut self.io, true)?;
        self.io.flush()?;
        Ok(self.io)
    }

    // === Accessors ===

    pub fn meta(&self) -> &ImageMeta {
        &self.meta
    }

    pub fn options(&self) -> &ImageOptions {
        &self.opts
    }

    /// In-memory reftable (host order refblock offsets).
    pub fn reftable(&self) -> &[u64] {
        &self.reftable
    }

    pub fn active_l1(&self) -> &[u64] {
        &self.active_l1
    }

    pub fn snapshots(&self) -> &[SnapshotInfo] {
        &self.snapshots
    }

    pub fn free_cluster_hint(&self) -> u64 {
        self.free_cluster_hint
    }

    pub fn is_corrupt(&self) -> bool {
        self.corrupt
    }

    /// Direct back-end access. Intended for the layers above the engine
    /// (data path, tests); the engine's own invariants only hold for the
    /// metadata ranges it owns.
    pub fn io_mut(&mut self) -> &mut B {
        &mut self.io
    }

    /// Tears the engine down WITHOUT flushing caches or discards,
    /// abandoning unwritten metadata. This is the crash model: what close
    /// would have made durable is lost, what already reached the back-end
    /// stays.
    pub fn into_io(self) -> B {
        self.io
    }

    /// Byte ranges currently queued for discard.
    pub fn pending_discards(&self) -> usize {
        self.discards.len()
    }

    /// Installs a sink for corruption events.
    #[cfg(feature = "std")]
    pub fn set_corruption_sink(&mut self, sink: CorruptionSink) {
        self.corruption_sink = Some(sink);
    }

    // === Active L1 / snapshot table maintenance ===

    /// Installs a new active L1 table: writes it big-endian at `offset`
    /// (which the caller allocated) and persists the header fields.
    pub fn set_active_l1(&mut self, offset: u64, entries: Vec<u64>) -> ImageResult<()> {
        self.ensure_writable()?;
        crate::ensure!(
            self.meta.is_cluster_aligned(offset),
            ImageError::Refcount(RefcountError::InvalidArgument("L1 offset misaligned"))
        );
        self.write_l1_table(offset, &entries)?;
        self.meta.l1_table_offset = offset;
        self.meta.l1_size = entries.len() as u32;
        self.meta.write_header(&mut self.io)?;
        self.active_l1 = entries;
        Ok(())
    }

    pub(crate) fn write_l1_table(&mut self, offset: u64, entries: &[u64]) -> RefcountResult<()> {
        let mut raw = vec![0u8; entries.len() * 8];
        for (i, e) in entries.iter().enumerate() {
            raw[i * 8..i * 8 + 8].copy_from_slice(&e.to_be_bytes());
        }
        self.io.write_in_chunks(offset, &raw, 8192)?;
        Ok(())
    }

    /// Appends a snapshot record, growing the on-disk snapshot table.
    /// The table is rewritten in a freshly allocated region, the header is
    /// persisted, and the old region is freed.
    pub fn register_snapshot(&mut self, info: SnapshotInfo) -> ImageResult<()> {
        self.ensure_writable()?;
        crate::ensure!(
            self.meta.is_cluster_aligned(info.l1_table_offset),
            ImageError::Refcount(RefcountError::InvalidArgument(
                "snapshot L1 offset misaligned"
            ))
        );

        let mut records = self.snapshots.clone();
        records.push(info);
        self.rewrite_snapshot_table(&records)?;
        Ok(())
    }

    /// Drops the snapshot record at `index`. The caller walks the snapshot
    /// first (`adjust_snapshot_refcounts` with −1) to release its clusters.
    pub fn remove_snapshot(&mut self, index: usize) -> ImageResult<()> {
        self.ensure_writable()?;
        crate::ensure!(
            index < self.snapshots.len(),
            ImageError::Invalid("snapshot index out of range")
        );
        let mut records = self.snapshots.clone();
        records.remove(index);
        self.rewrite_snapshot_table(&records)?;
        Ok(())
    }

    fn rewrite_snapshot_table(&mut self, records: &[SnapshotInfo]) -> ImageResult<()> {
        let old_offset = self.meta.snapshots_offset;
        let old_size = self.meta.snapshot_table_size;

        let (new_offset, new_size) = if records.is_empty() {
            (0, 0)
        } else {
            let size = (records.len() * SNAPSHOT_RECORD_SIZE) as u64;
            let offset = self.alloc_clusters(size)?;
            for (i, rec) in records.iter().enumerate() {
                let on_disk = SnapshotRecord {
                    l1_table_offset: zerocopy::byteorder::big_endian::U64::new(
                        rec.l1_table_offset,
                    ),
                    l1_size: zerocopy::byteorder::big_endian::U32::new(rec.l1_size),
                    _pad: zerocopy::byteorder::big_endian::U32::new(0),
                };
                self.io
                    .write_struct(offset + (i * SNAPSHOT_RECORD_SIZE) as u64, &on_disk)?;
            }
            (offset, size as u32)
        };

        self.meta.snapshots_offset = new_offset;
        self.meta.snapshot_table_size = new_size;
        self.meta.snapshots_count = records.len() as u32;
        self.meta.write_header(&mut self.io)?;
        self.snapshots = records.to_vec();

        if old_offset != 0 {
            self.free_clusters(old_offset, old_size as u64, DiscardKind::Other);
        }
        Ok(())
    }

    // === Cache orchestration ===

    pub(crate) fn flush_cache(&mut self, kind: CacheKind) -> RefcountResult<()> {
        let dep = match kind {
            CacheKind::Refblock => self.refblock_cache.dependency(),
            CacheKind::L2 => self.l2_cache.dependency(),
        };
        if let Some(d) = dep {
            debug_assert!(d != kind);
            // The edge is only dropped once the dependency actually hit the
            // back-end; a failed flush must keep the ordering constraint.
            self.flush_cache(d)?;
            match kind {
                CacheKind::Refblock => self.refblock_cache.take_dependency(),
                CacheKind::L2 => self.l2_cache.take_dependency(),
            };
        }
        match kind {
            CacheKind::Refblock => self.refblock_cache.flush(&mut self.io),
            CacheKind::L2 => self.l2_cache.flush(&mut self.io),
        }
    }

    /// Records "`dependent` may not write before `on` has been flushed".
    /// If the reverse edge already exists, `on` is flushed now to keep the
    /// dependency graph acyclic.
    pub(crate) fn set_cache_dependency(
        &mut self,
        dependent: CacheKind,
        on: CacheKind,
    ) -> RefcountResult<()> {
        debug_assert!(dependent != on);
        let reverse = match on {
            CacheKind::Refblock => self.refblock_cache.dependency() == Some(dependent),
            CacheKind::L2 => self.l2_cache.dependency() == Some(dependent),
        };
        if reverse {
            self.flush_cache(on)?;
        }
        match dependent {
            CacheKind::Refblock => self.refblock_cache.set_dependency(on),
            CacheKind::L2 => self.l2_cache.set_dependency(on),
        }
        Ok(())
    }

    /// `get` on the refblock cache. A miss may evict a dirty entry, so any
    /// pending write-ordering dependency is settled first.
    pub(crate) fn refblock_cache_get(&mut self, offset: u64) -> RefcountResult<CacheHandle> {
        if let Some(h) = self.refblock_cache.lookup_pin(offset) {
            return Ok(h);
        }
        if self.refblock_cache.dependency().is_some() {
            self.flush_cache(CacheKind::Refblock)?;
        }
        self.refblock_cache.get(&mut self.io, offset)
    }

    pub(crate) fn refblock_cache_get_empty(&mut self, offset: u64) -> RefcountResult<CacheHandle> {
        if self.refblock_cache.dependency().is_some() {
            self.flush_cache(CacheKind::Refblock)?;
        }
        self.refblock_cache.get_empty(&mut self.io, offset)
    }

    pub(crate) fn l2_cache_get(&mut self, offset: u64) -> RefcountResult<CacheHandle> {
        if let Some(h) = self.l2_cache.lookup_pin(offset) {
            return Ok(h);
        }
        if self.l2_cache.dependency().is_some() {
            self.flush_cache(CacheKind::L2)?;
        }
        self.l2_cache.get(&mut self.io, offset)
    }

    // === Discard batching ===

    pub(crate) fn begin_discard_batch(&mut self) {
        self.cache_discards = true;
    }

    pub(crate) fn end_discard_batch(&mut self, ok: bool) {
        self.cache_discards = false;
        if let Err(e) = self.discards.flush(&mut self.io, ok) {
            log::warn!("discard batch flush failed: {e}");
        }
    }

    // === Corruption handling ===

    pub(crate) fn ensure_writable(&self) -> RefcountResult<()> {
        crate::ensure!(
            !self.corrupt,
            RefcountError::Corrupt("image is marked corrupt")
        );
        Ok(())
    }

    pub(crate) fn signal_corruption(
        &mut self,
        fatal: bool,
        offset: u64,
        size: u64,
        description: &str,
    ) {
        log::error!(
            "image corruption: {description} (offset {offset:#x}, size {size:#x}, fatal: {fatal})"
        );
        let event = CorruptionEvent {
            fatal,
            offset,
            size,
            description,
        };
        #[cfg(feature = "std")]
        if let Some(sink) = self.corruption_sink.as_mut() {
            sink(&event);
        }
        #[cfg(not(feature = "std"))]
        let _ = event;

        if fatal {
            self.corrupt = true;
        }
    }
}

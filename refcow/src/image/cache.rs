// SPDX-License-Identifier: MIT

//! Write-back cache for cluster-sized metadata blocks (refblocks, L2
//! tables), keyed by file offset.
//!
//! Entries live in a fixed arena; callers hold [`CacheHandle`] indices and
//! must `put` every handle they `get`. A pinned entry is never evicted;
//! replacing a dirty entry writes it back first. Cross-cache write ordering
//! is tracked as a dependency the owning image resolves before flushing.

#[cfg(all(not(feature = "std"), feature = "alloc"))]
use alloc::{vec, vec::Vec};

use refio::prelude::*;

use crate::core::{RefcountError, RefcountResult};

/// Opaque pinned reference to a cache entry. Valid until the matching
/// [`MetaCache::put`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheHandle(usize);

/// Identifies one of the image's two metadata caches, for dependency
/// bookkeeping between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheKind {
    Refblock,
    L2,
}

const INVALID_OFFSET: u64 = u64::MAX;

#[derive(Debug)]
struct CacheEntry {
    offset: u64,
    buf: Vec<u8>,
    pins: u32,
    dirty: bool,
    lru: u64,
}

#[derive(Debug)]
pub struct MetaCache {
    name: &'static str,
    entries: Vec<CacheEntry>,
    block_size: usize,
    lru_clock: u64,
    /// The other cache must be flushed before this one writes anything.
    dependency: Option<CacheKind>,
}

impl MetaCache {
    pub fn new(name: &'static str, block_size: usize, num_entries: usize) -> Self {
        debug_assert!(num_entries > 0);
        let entries = (0..num_entries)
            .map(|_| CacheEntry {
                offset: INVALID_OFFSET,
                buf: vec![0u8; block_size],
                pins: 0,
                dirty: false,
                lru: 0,
            })
            .collect();
        Self {
            name,
            entries,
            block_size,
            lru_clock: 0,
            dependency: None,
        }
    }

    #[inline]
    pub fn dependency(&self) -> Option<CacheKind> {
        self.dependency
    }

    #[inline]
    pub fn set_dependency(&mut self, on: CacheKind) {
        self.dependency = Some(on);
    }

    #[inline]
    pub fn take_dependency(&mut self) -> Option<CacheKind> {
        self.dependency.take()
    }

    pub fn has_dirty(&self) -> bool {
        self.entries
            .iter()
            .any(|e| e.offset != INVALID_OFFSET && e.dirty)
    }

    /// Pins the entry for `offset` if it is resident.
    pub fn lookup_pin(&mut self, offset: u64) -> Option<CacheHandle> {
        self.lru_clock += 1;
        let lru = self.lru_clock;
        for (i, e) in self.entries.iter_mut().enumerate() {
            if e.offset == offset {
                e.pins += 1;
                e.lru = lru;
                return Some(CacheHandle(i));
            }
        }
        None
    }

    /// Returns a pinned entry holding the on-disk content at `offset`,
    /// reading it if not resident. Any cross-cache dependency must be
    /// settled by the caller before this may evict a dirty entry.
    pub fn get<B: BlockIO + ?Sized>(
        &mut self,
        io: &mut B,
        offset: u64,
    ) -> RefcountResult<CacheHandle> {
        self.fill(io, offset, true)
    }

    /// Returns a pinned entry whose buffer content is undefined; no read is
    /// issued. The caller overwrites the whole block.
    pub fn get_empty<B: BlockIO + ?Sized>(
        &mut self,
        io: &mut B,
        offset: u64,
    ) -> RefcountResult<CacheHandle> {
        self.fill(io, offset, false)
    }

    fn fill<B: BlockIO + ?Sized>(
        &mut self,
        io: &mut B,
        offset: u64,
        read: bool,
    ) -> RefcountResult<CacheHandle> {
        debug_assert!(offset != INVALID_OFFSET);
        if let Some(h) = self.lookup_pin(offset) {
            return Ok(h);
        }

        let victim = self.choose_victim()?;
        {
            let e = &mut self.entries[victim];
            if e.offset != INVALID_OFFSET && e.dirty {
                io.write_at(e.offset, &e.buf)?;
                e.dirty = false;
            }
            if read {
                io.read_at(offset, &mut e.buf)?;
            }
            e.offset = offset;
            e.pins = 1;
            e.dirty = false;
        }
        self.lru_clock += 1;
        self.entries[victim].lru = self.lru_clock;
        Ok(CacheHandle(victim))
    }

    fn choose_victim(&self) -> RefcountResult<usize> {
        let mut best: Option<usize> = None;
        for (i, e) in self.entries.iter().enumerate() {
            if e.pins != 0 {
                continue;
            }
            if e.offset == INVALID_OFFSET {
                return Ok(i);
            }
            match best {
                Some(b) if self.entries[b].lru <= e.lru => {}
                _ => best = Some(i),
            }
        }
        best.ok_or(RefcountError::Other("metadata cache exhausted"))
    }

    /// Releases a pinned handle.
    pub fn put(&mut self, handle: CacheHandle) {
        let e = &mut self.entries[handle.0];
        debug_assert!(e.pins > 0, "unbalanced cache put");
        e.pins -= 1;
    }

    pub fn mark_dirty(&mut self, handle: CacheHandle) {
        self.entries[handle.0].dirty = true;
    }

    #[inline]
    pub fn buf(&self, handle: CacheHandle) -> &[u8] {
        &self.entries[handle.0].buf
    }

    #[inline]
    pub fn buf_mut(&mut self, handle: CacheHandle) -> &mut [u8] {
        &mut self.entries[handle.0].buf
    }

    /// Writes all dirty entries back and clears their dirty flags. The
    /// caller resolves any cross-cache dependency first.
    pub fn flush<B: BlockIO + ?Sized>(&mut self, io: &mut B) -> RefcountResult<()> {
        for e in self.entries.iter_mut() {
            if e.offset != INVALID_OFFSET && e.dirty {
                io.write_at(e.offset, &e.buf)?;
                e.dirty = false;
            }
        }
        Ok(())
    }

    /// Drops every entry without writing anything. Only valid while no
    /// handle is pinned; used when the on-disk structure is rebuilt from
    /// scratch and cached content went stale.
    pub fn empty(&mut self) {
        for e in self.entries.iter_mut() {
            debug_assert!(e.pins == 0, "emptying {} cache with pinned entry", self.name);
            e.offset = INVALID_OFFSET;
            e.dirty = false;
            e.pins = 0;
        }
        self.dependency = None;
    }

    #[inline]
    pub fn block_size(&self) -> usize {
        self.block_size
    }
}

#[cfg(all(test, feature = "mem"))]
mod tests {
    use super::*;

    fn mem(len: u64) -> MemBlockIO {
        let mut io = MemBlockIO::new();
        io.truncate(len).unwrap();
        io
    }

    #[test]
    fn test_get_reads_backing() {
        let mut io = mem(1024);
        io.write_at(512, &[7u8; 512]).unwrap();

        let mut cache = MetaCache::new("test", 512, 2);
        let h = cache.get(&mut io, 512).unwrap();
        assert_eq!(cache.buf(h), &[7u8; 512][..]);
        cache.put(h);
    }

    #[test]
    fn test_dirty_written_back_on_flush() {
        let mut io = mem(1024);
        let mut cache = MetaCache::new("test", 512, 2);

        let h = cache.get(&mut io, 0).unwrap();
        cache.buf_mut(h)[0] = 0xAB;
        cache.mark_dirty(h);
        cache.put(h);

        cache.flush(&mut io).unwrap();
        let mut b = [0u8; 1];
        io.read_at(0, &mut b).unwrap();
        assert_eq!(b[0], 0xAB);
    }

    #[test]
    fn test_eviction_writes_back_dirty_entry() {
        let mut io = mem(2048);
        let mut cache = MetaCache::new("test", 512, 1);

        let h = cache.get(&mut io, 0).unwrap();
        cache.buf_mut(h)[0] = 0xCD;
        cache.mark_dirty(h);
        cache.put(h);

        // Single-entry cache: this get must evict and write back.
        let h2 = cache.get(&mut io, 512).unwrap();
        cache.put(h2);

        let mut b = [0u8; 1];
        io.read_at(0, &mut b).unwrap();
        assert_eq!(b[0], 0xCD);
    }

    #[test]
    fn test_pinned_entry_never_evicted() {
        let mut io = mem(2048);
        let mut cache = MetaCache::new("test", 512, 1);

        let h = cache.get(&mut io, 0).unwrap();
        assert_eq!(
            cache.get(&mut io, 512),
            Err(RefcountError::Other("metadata cache exhausted"))
        );
        cache.put(h);
    }

    #[test]
    fn test_empty_discards_dirty_content() {
        let mut io = mem(1024);
        let mut cache = MetaCache::new("test", 512, 2);

        let h = cache.get(&mut io, 0).unwrap();
        cache.buf_mut(h)[0] = 0xEE;
        cache.mark_dirty(h);
        cache.put(h);

        cache.empty();
        cache.flush(&mut io).unwrap();

        let mut b = [0u8; 1];
        io.read_at(0, &mut b).unwrap();
        assert_eq!(b[0], 0);
    }
}

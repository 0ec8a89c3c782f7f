// SPDX-License-Identifier: MIT

//! End-to-end scenarios for the refcount engine: allocation, free,
//! refblock-span crossing, reftable growth, checker repair, and crash
//! safety of the growth path under injected write failures.

use refcow::prelude::*;

fn create(cluster_bits: u32) -> Image<MemBlockIO> {
    Image::create(
        MemBlockIO::new(),
        1 << 26,
        cluster_bits,
        ImageOptions::default(),
    )
    .unwrap()
}

fn assert_clean(img: &mut Image<MemBlockIO>) {
    let rep = img.check(RepairFlags::empty()).unwrap();
    assert!(
        rep.is_clean(),
        "image not clean: corruptions={} leaks={} check_errors={}\n{}",
        rep.corruptions,
        rep.leaks,
        rep.check_errors,
        rep
    );
}

#[test]
fn fresh_image_one_allocation() {
    // 64 KiB clusters: header in cluster 0, reftable in cluster 1 at
    // 0x10000, refblock in cluster 2 at 0x20000.
    let mut img = create(16);
    assert_eq!(img.meta().reftable_offset, 0x10000);
    assert_eq!(img.reftable()[0], 0x20000);
    for c in 0..3 {
        assert_eq!(img.get_refcount(c).unwrap(), 1);
    }

    let off = img.alloc_clusters(0x10000).unwrap();
    assert_eq!(off, 0x30000);
    assert_eq!(img.get_refcount(3).unwrap(), 1);

    // No mapping references the fresh cluster yet, so a read-only check
    // sees exactly one leak and no corruption.
    let rep = img.check(RepairFlags::empty()).unwrap();
    assert_eq!(rep.corruptions, 0, "{rep}");
    assert_eq!(rep.leaks, 1, "{rep}");

    img.free_clusters(off, 0x10000, DiscardKind::Never);
    assert_clean(&mut img);
}

#[test]
fn free_returns_cluster_and_resets_hint() {
    let mut img = create(16);
    let off = img.alloc_clusters(0x10000).unwrap();
    assert_eq!(off, 0x30000);

    // Leave a marker so the discard is observable.
    img.io_mut().write_at(off, &[0xAA; 64]).unwrap();

    img.free_clusters(off, 0x10000, DiscardKind::Always);
    assert_eq!(img.get_refcount(3).unwrap(), 0);
    assert_eq!(img.free_cluster_hint(), 3);

    // DiscardKind::Always reached the back-end; the range reads zero.
    let mut buf = [0u8; 64];
    img.io_mut().read_at(off, &mut buf).unwrap();
    assert_eq!(buf, [0u8; 64]);

    assert_clean(&mut img);
}

#[test]
fn discard_class_routing() {
    let opts = ImageOptions {
        discard_request: false,
        ..ImageOptions::default()
    };
    let mut img = Image::create(MemBlockIO::new(), 1 << 26, 16, opts).unwrap();
    let off = img.alloc_clusters(0x10000).unwrap();
    img.io_mut().write_at(off, &[0xBB; 64]).unwrap();

    // Request discards are disabled: the data must survive the free.
    img.free_clusters(off, 0x10000, DiscardKind::Request);
    let mut buf = [0u8; 64];
    img.io_mut().read_at(off, &mut buf).unwrap();
    assert_eq!(buf, [0xBB; 64]);
}

#[test]
fn allocation_crosses_refblock_span() {
    // 512-byte clusters: one refblock covers 256 clusters. Fill span 0 so
    // the next allocation lands in span 1, which has no refblock yet.
    let mut img = create(9);
    let s = img.meta().cluster_size;
    let rb = img.meta().refblock_entries;

    for c in 3..rb {
        img.update_cluster_refcount(c, 1, DiscardKind::Never).unwrap();
    }
    assert_eq!(img.reftable()[1], 0);

    let off = img.alloc_clusters(s).unwrap();
    let cluster = img.meta().cluster_index(off);
    assert!(cluster >= rb, "allocation must land in the second span");

    // The second refblock exists, describes itself and the allocation.
    let block_offset = img.reftable()[1];
    assert_ne!(block_offset, 0);
    let block_cluster = img.meta().cluster_index(block_offset);
    assert_eq!(img.get_refcount(block_cluster).unwrap(), 1);
    assert_eq!(img.get_refcount(cluster).unwrap(), 1);

    // The manually filled span plus the allocation is exactly what a
    // read-only check expects to see referenced... except the fill has no
    // mapping references, so drop it again first.
    for c in 3..rb {
        img.update_cluster_refcount(c, -1, DiscardKind::Never).unwrap();
    }
    img.free_clusters(off, s, DiscardKind::Never);
    assert_clean(&mut img);
}

#[test]
fn reftable_grows_in_place() {
    // 512-byte clusters: the initial one-cluster reftable covers 64 spans
    // of 256 clusters. Touching a cluster past that coverage forces the
    // grow path.
    let mut img = create(9);
    let covered = img.meta().reftable_entries() * img.meta().refblock_entries;
    assert_eq!(covered, 64 * 256);

    let old_offset = img.meta().reftable_offset;
    let new_count = img
        .update_cluster_refcount(covered, 1, DiscardKind::Never)
        .unwrap();
    assert_eq!(new_count, 1);

    // The table moved and got bigger; the old table's cluster was freed.
    assert!(img.meta().reftable_offset != old_offset);
    assert!(img.meta().reftable_clusters > 1);
    assert_eq!(
        img.get_refcount(img.meta().cluster_index(old_offset)).unwrap(),
        0
    );
    assert_eq!(img.get_refcount(covered).unwrap(), 1);

    // The bumped cluster has no mapping reference: exactly one leak, no
    // corruption, and fixing it leaves the image clean.
    let rep = img.check(RepairFlags::empty()).unwrap();
    assert_eq!(rep.corruptions, 0, "{rep}");
    assert_eq!(rep.leaks, 1, "{rep}");

    let rep = img.check(RepairFlags::FIX_LEAKS).unwrap();
    assert_eq!(rep.leaks_fixed, 1, "{rep}");
    assert_clean(&mut img);
}

#[test]
fn grown_image_reopens() {
    let mut img = create(9);
    let covered = img.meta().reftable_entries() * img.meta().refblock_entries;
    img.update_cluster_refcount(covered, 1, DiscardKind::Never)
        .unwrap();
    img.update_cluster_refcount(covered, -1, DiscardKind::Never)
        .unwrap();

    let io = img.close().unwrap();
    let mut img = Image::open(io, ImageOptions::default()).unwrap();
    assert!(img.meta().reftable_clusters > 1);
    assert_clean(&mut img);
}

#[test]
fn checker_repairs_refblock_beyond_image_end() {
    let mut img = create(9);
    let s = img.meta().cluster_size;
    let reftable_offset = img.meta().reftable_offset;

    // Point the span-1 slot at an aligned offset past the end of the file.
    let mut io = img.close().unwrap();
    let len = io.length().unwrap();
    let bogus = len.div_ceil(s) * s + 4 * s;
    io.write_u64_be_at(reftable_offset + 8, bogus).unwrap();

    let mut img = Image::open(io, ImageOptions::default()).unwrap();
    let rep = img.check(RepairFlags::FIX_ERRORS).unwrap();
    assert_eq!(rep.corruptions, 0, "{rep}");
    assert!(rep.corruptions_fixed >= 1, "{rep}");

    // The file was grown to cover the refblock, which reads all-zero.
    assert_eq!(img.io_mut().length().unwrap(), bogus + s);
    assert_clean(&mut img);
}

#[test]
fn checker_detects_and_fixes_leak() {
    let mut img = create(9);
    let s = img.meta().cluster_size;
    let off = img.alloc_clusters(s).unwrap();

    // An allocation with no mapping reference is a leak by definition.
    let rep = img.check(RepairFlags::empty()).unwrap();
    assert_eq!(rep.leaks, 1);
    assert_eq!(rep.corruptions, 0);

    let rep = img.check(RepairFlags::FIX_LEAKS).unwrap();
    assert_eq!(rep.leaks_fixed, 1);
    assert_eq!(img.get_refcount(img.meta().cluster_index(off)).unwrap(), 0);

    // Repair is idempotent.
    let rep = img.check(RepairFlags::FIX_ERRORS | RepairFlags::FIX_LEAKS).unwrap();
    assert_eq!(rep.corruptions_fixed, 0, "{rep}");
    assert_eq!(rep.leaks_fixed, 0, "{rep}");
}

#[test]
fn checker_fixes_undercount() {
    let mut img = create(9);
    let s = img.meta().cluster_size;

    // Build a real mapping: L1 -> L2 -> data, then sabotage the data
    // cluster's refcount behind the store's back.
    let data = img.alloc_clusters(s).unwrap();
    let l2 = img.alloc_clusters(s).unwrap();
    let l1 = img.alloc_clusters(s).unwrap();
    let mut l2_buf = vec![0u8; s as usize];
    l2_buf[..8].copy_from_slice(&(data | FLAG_COPIED).to_be_bytes());
    img.io_mut().write_at(l2, &l2_buf).unwrap();
    img.set_active_l1(l1, vec![l2 | FLAG_COPIED]).unwrap();
    assert_clean(&mut img);

    // Zero the count of the data cluster directly in the refblock.
    let data_cluster = img.meta().cluster_index(data);
    let refblock = img.reftable()[0];
    let mut io = img.close().unwrap();
    io.write_u16_be_at(refblock + data_cluster * 2, 0).unwrap();

    let mut img = Image::open(io, ImageOptions::default()).unwrap();
    let rep = img.check(RepairFlags::empty()).unwrap();
    assert!(rep.corruptions >= 1, "{rep}");

    let rep = img
        .check(RepairFlags::FIX_ERRORS | RepairFlags::FIX_LEAKS)
        .unwrap();
    assert!(rep.corruptions_fixed >= 1, "{rep}");
    assert_clean(&mut img);
    assert_eq!(img.get_refcount(data_cluster).unwrap(), 1);
}

#[test]
fn checker_rebuild_recovers_clobbered_reftable() {
    let mut img = create(9);
    let s = img.meta().cluster_size;

    let data = img.alloc_clusters(s).unwrap();
    let l2 = img.alloc_clusters(s).unwrap();
    let l1 = img.alloc_clusters(s).unwrap();
    let mut l2_buf = vec![0u8; s as usize];
    l2_buf[..8].copy_from_slice(&(data | FLAG_COPIED).to_be_bytes());
    img.io_mut().write_at(l2, &l2_buf).unwrap();
    img.set_active_l1(l1, vec![l2 | FLAG_COPIED]).unwrap();
    assert_clean(&mut img);

    // Clobber the refblock wholesale: every count reads zero.
    let refblock = img.reftable()[0];
    let mut io = img.close().unwrap();
    io.zero_fill(refblock, s as usize).unwrap();

    let mut img = Image::open(io, ImageOptions::default()).unwrap();
    let rep = img
        .check(RepairFlags::FIX_ERRORS | RepairFlags::FIX_LEAKS)
        .unwrap();
    assert_eq!(rep.corruptions, 0, "{rep}");
    assert_clean(&mut img);

    // The mapping survived the rebuild.
    assert_eq!(img.get_refcount(img.meta().cluster_index(data)).unwrap(), 1);
    assert_eq!(img.get_refcount(img.meta().cluster_index(l2)).unwrap(), 1);
}

#[test]
fn alloc_bytes_accounts_shared_clusters() {
    let mut img = create(9);
    let a = img.alloc_bytes(300).unwrap();
    let b = img.alloc_bytes(100).unwrap();
    assert_eq!(b, a + 300);

    let cluster = img.meta().cluster_index(a);
    assert_eq!(img.get_refcount(cluster).unwrap(), 2);

    img.free_clusters(a, 300, DiscardKind::Never);
    img.free_clusters(b, 100, DiscardKind::Never);
    assert_eq!(img.get_refcount(cluster).unwrap(), 0);
    assert_clean(&mut img);
}

// === Crash safety of reftable growth (P5) ===

/// Back-end that fails every write after a budget is exhausted; models a
/// crash at an arbitrary point inside a metadata operation.
#[derive(Debug)]
struct FaultyIO {
    inner: MemBlockIO,
    writes_left: Option<u64>,
}

impl FaultyIO {
    fn new(inner: MemBlockIO, writes_left: Option<u64>) -> Self {
        Self { inner, writes_left }
    }

    fn consume(&mut self) -> BlockIOResult {
        match &mut self.writes_left {
            None => Ok(()),
            Some(0) => Err(BlockIOError::Error("injected write failure")),
            Some(n) => {
                *n -= 1;
                Ok(())
            }
        }
    }
}

impl BlockIO for FaultyIO {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> BlockIOResult {
        self.inner.read_at(offset, buf)
    }
    fn write_at(&mut self, offset: u64, data: &[u8]) -> BlockIOResult {
        self.consume()?;
        self.inner.write_at(offset, data)
    }
    fn write_sync_at(&mut self, offset: u64, data: &[u8]) -> BlockIOResult {
        self.consume()?;
        self.inner.write_sync_at(offset, data)
    }
    fn discard(&mut self, offset: u64, len: u64) -> BlockIOResult {
        self.inner.discard(offset, len)
    }
    fn truncate(&mut self, len: u64) -> BlockIOResult {
        self.consume()?;
        self.inner.truncate(len)
    }
    fn length(&mut self) -> BlockIOResult<u64> {
        self.inner.length()
    }
    fn flush(&mut self) -> BlockIOResult {
        self.inner.flush()
    }
}

/// For every possible failure point inside a grow-triggering operation,
/// the reopened image must show leaks at worst, never corruption.
#[test]
fn grow_is_crash_safe_at_every_write() {
    // Baseline run to learn how many writes the operation issues.
    let mut img = Image::create(
        FaultyIO::new(MemBlockIO::new(), None),
        1 << 26,
        9,
        ImageOptions::default(),
    )
    .unwrap();
    let covered = img.meta().reftable_entries() * img.meta().refblock_entries;
    img.update_cluster_refcount(covered, 1, DiscardKind::Never)
        .unwrap();
    let baseline = img.close().unwrap().inner.into_inner();

    // Replay with the write budget set to every prefix length.
    let pristine = {
        let img = Image::create(MemBlockIO::new(), 1 << 26, 9, ImageOptions::default()).unwrap();
        img.close().unwrap().into_inner()
    };
    assert!(!baseline.is_empty());

    for budget in 0..64 {
        let io = FaultyIO::new(MemBlockIO::from_vec(pristine.clone()), Some(budget));
        let mut img = Image::open(io, ImageOptions::default()).unwrap();
        let covered = img.meta().reftable_entries() * img.meta().refblock_entries;
        let result = img.update_cluster_refcount(covered, 1, DiscardKind::Never);

        // Crash: drop the engine without flushing, reopen what hit disk.
        let buffer = img.into_io().inner.into_inner();
        let mut img = Image::open(MemBlockIO::from_vec(buffer), ImageOptions::default())
            .expect("image must stay openable after a crash");

        let rep = img
            .check(RepairFlags::FIX_ERRORS | RepairFlags::FIX_LEAKS)
            .unwrap();
        assert_eq!(
            rep.corruptions, 0,
            "budget {budget} (op result {result:?}) left corruption:\n{rep}"
        );
        assert_clean(&mut img);
    }
}

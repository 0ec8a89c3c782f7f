// SPDX-License-Identifier: MIT

//! Snapshot refcount walking and only-copy bit maintenance, end to end.

use refcow::prelude::*;

/// Image with an active L1 -> L2 -> data cluster mapping, all only-copy.
fn image_with_mapping() -> (Image<MemBlockIO>, u64, u64, u64) {
    let mut img = Image::create(MemBlockIO::new(), 1 << 26, 9, ImageOptions::default()).unwrap();
    let s = img.meta().cluster_size;

    let data = img.alloc_clusters(s).unwrap();
    let l2 = img.alloc_clusters(s).unwrap();
    let l1 = img.alloc_clusters(s).unwrap();

    let mut l2_buf = vec![0u8; s as usize];
    l2_buf[..8].copy_from_slice(&(data | FLAG_COPIED).to_be_bytes());
    img.io_mut().write_at(l2, &l2_buf).unwrap();
    img.set_active_l1(l1, vec![l2 | FLAG_COPIED]).unwrap();

    (img, data, l2, l1)
}

fn read_be_u64(img: &mut Image<MemBlockIO>, offset: u64) -> u64 {
    img.io_mut().read_u64_be_at(offset).unwrap()
}

#[test]
fn snapshot_increment_shares_everything() {
    let (mut img, data, l2, _l1) = image_with_mapping();
    let s = img.meta().cluster_size;

    // Store a snapshot L1 identical to the active one.
    let snap_l1 = img.alloc_clusters(s).unwrap();
    img.io_mut()
        .write_u64_be_at(snap_l1, l2 | FLAG_COPIED)
        .unwrap();
    img.register_snapshot(SnapshotInfo {
        l1_table_offset: snap_l1,
        l1_size: 1,
    })
    .unwrap();

    // Walk the snapshot with +1: every reachable cluster gains a
    // reference and loses its only-copy status.
    img.adjust_snapshot_refcounts(
        L1Ref::Stored {
            offset: snap_l1,
            entries: 1,
        },
        1,
    )
    .unwrap();

    assert_eq!(img.get_refcount(img.meta().cluster_index(data)).unwrap(), 2);
    assert_eq!(img.get_refcount(img.meta().cluster_index(l2)).unwrap(), 2);

    // The stored snapshot L1 was rewritten with the bit cleared.
    let snap_entry = read_be_u64(&mut img, snap_l1);
    assert_eq!(snap_entry & FLAG_COPIED, 0);
    assert_eq!(snap_entry & OFFSET_MASK, l2);

    // The active L1 still carries a stale bit; a zero-delta walk refreshes
    // it without touching any count.
    img.adjust_snapshot_refcounts(L1Ref::Active, 0).unwrap();
    assert_eq!(img.active_l1()[0] & FLAG_COPIED, 0);
    assert_eq!(img.get_refcount(img.meta().cluster_index(data)).unwrap(), 2);

    // Full audit: bits match counts everywhere.
    let rep = img.check(RepairFlags::empty()).unwrap();
    assert!(rep.is_clean(), "{rep}");
}

#[test]
fn snapshot_delete_returns_references() {
    let (mut img, data, l2, _l1) = image_with_mapping();
    let s = img.meta().cluster_size;

    let snap_l1 = img.alloc_clusters(s).unwrap();
    img.io_mut()
        .write_u64_be_at(snap_l1, l2 | FLAG_COPIED)
        .unwrap();
    img.register_snapshot(SnapshotInfo {
        l1_table_offset: snap_l1,
        l1_size: 1,
    })
    .unwrap();
    let l1_ref = L1Ref::Stored {
        offset: snap_l1,
        entries: 1,
    };
    img.adjust_snapshot_refcounts(l1_ref, 1).unwrap();

    // Delete: walk with -1, drop the record, free the snapshot L1 cluster.
    img.adjust_snapshot_refcounts(l1_ref, -1).unwrap();
    img.remove_snapshot(0).unwrap();
    img.free_clusters(snap_l1, s, DiscardKind::Snapshot);

    assert_eq!(img.get_refcount(img.meta().cluster_index(data)).unwrap(), 1);
    assert_eq!(img.get_refcount(img.meta().cluster_index(l2)).unwrap(), 1);

    // The active tree is the only owner again.
    img.adjust_snapshot_refcounts(L1Ref::Active, 0).unwrap();
    assert_ne!(img.active_l1()[0] & FLAG_COPIED, 0);
    let rep = img.check(RepairFlags::empty()).unwrap();
    assert!(rep.is_clean(), "{rep}");
}

#[test]
fn snapshot_walk_failure_drops_queued_discards() {
    // 4 KiB clusters so an entry can be 512-aligned yet cluster-misaligned.
    let opts = ImageOptions {
        discard_snapshot: true,
        ..ImageOptions::default()
    };
    let mut img = Image::create(MemBlockIO::new(), 1 << 26, 12, opts).unwrap();
    let s = img.meta().cluster_size;

    let data = img.alloc_clusters(s).unwrap();
    let l2 = img.alloc_clusters(s).unwrap();
    let mut l2_buf = vec![0u8; s as usize];
    l2_buf[..8].copy_from_slice(&(data | FLAG_COPIED).to_be_bytes());
    img.io_mut().write_at(l2, &l2_buf).unwrap();
    img.io_mut().write_at(data, &[0xEE; 64]).unwrap();

    // Stored L1: a valid entry first, then a misaligned one. Walking with
    // -1 frees the data cluster (queueing a discard) before hitting the
    // bad entry; the failed batch must drop the queue without issuing.
    let bad_l1 = img.alloc_clusters(s).unwrap();
    img.io_mut().write_u64_be_at(bad_l1, l2).unwrap();
    img.io_mut().write_u64_be_at(bad_l1 + 8, l2 + 512).unwrap();

    let result = img.adjust_snapshot_refcounts(
        L1Ref::Stored {
            offset: bad_l1,
            entries: 2,
        },
        -1,
    );
    assert!(result.is_err());
    assert_eq!(img.pending_discards(), 0);

    // The discard never reached the back-end.
    let mut marker = [0u8; 64];
    img.io_mut().read_at(data, &mut marker).unwrap();
    assert_eq!(marker, [0xEE; 64]);
}

#[test]
fn compressed_entries_stay_shared() {
    let mut img = Image::create(MemBlockIO::new(), 1 << 26, 9, ImageOptions::default()).unwrap();
    let s = img.meta().cluster_size;
    let meta = img.meta().clone();

    // A compressed payload of 3 extra sectors at a sub-cluster offset.
    let payload = img.alloc_bytes(400).unwrap();
    let sectors_minus_one = 0u64;
    let compressed_entry =
        FLAG_COMPRESSED | (sectors_minus_one << meta.csize_shift) | payload;

    let l2 = img.alloc_clusters(s).unwrap();
    let l1 = img.alloc_clusters(s).unwrap();
    img.io_mut().write_u64_be_at(l2, compressed_entry).unwrap();
    img.set_active_l1(l1, vec![l2 | FLAG_COPIED]).unwrap();

    // A zero-delta walk must not set only-copy on the compressed entry.
    img.adjust_snapshot_refcounts(L1Ref::Active, 0).unwrap();
    let img_l2 = {
        let mut raw = [0u8; 8];
        img.io_mut().read_at(l2, &mut raw).unwrap();
        u64::from_be_bytes(raw)
    };
    assert_eq!(img_l2 & FLAG_COPIED, 0);

    // Freeing through the entry decodes the sub-cluster range.
    let cluster = meta.cluster_index(payload);
    let before = img.get_refcount(cluster).unwrap();
    img.free_by_l2_entry(compressed_entry, 1, DiscardKind::Never);
    assert_eq!(img.get_refcount(cluster).unwrap(), before - 1);
}

#[test]
fn snapshot_table_region_is_metadata() {
    let (mut img, _data, _l2, _l1) = image_with_mapping();
    let s = img.meta().cluster_size;

    let snap_l1 = img.alloc_clusters(s).unwrap();
    img.io_mut().write_u64_be_at(snap_l1, 0).unwrap();
    img.register_snapshot(SnapshotInfo {
        l1_table_offset: snap_l1,
        l1_size: 1,
    })
    .unwrap();

    let table_off = img.meta().snapshots_offset;
    assert_ne!(table_off, 0);
    assert_eq!(
        img.overlap_check(MetadataKind::empty(), table_off, 8).unwrap(),
        MetadataKind::SNAPSHOT_TABLE
    );
    assert_eq!(
        img.overlap_check(MetadataKind::empty(), snap_l1, 8).unwrap(),
        MetadataKind::INACTIVE_L1
    );

    // Reopen: the record round-trips through the on-disk table.
    let io = img.close().unwrap();
    let img = Image::open(io, ImageOptions::default()).unwrap();
    assert_eq!(
        img.snapshots(),
        &[SnapshotInfo {
            l1_table_offset: snap_l1,
            l1_size: 1
        }]
    );
}

#[test]
fn file_backed_image_roundtrip() {
    let mut file = tempfile::tempfile().unwrap();
    let (reftable_offset, alloc_off) = {
        let io = StdBlockIO::new(&mut file);
        let mut img = Image::create(io, 1 << 26, 9, ImageOptions::default()).unwrap();
        let off = img.alloc_clusters(img.meta().cluster_size).unwrap();
        let reftable = img.meta().reftable_offset;
        img.close().unwrap();
        (reftable, off)
    };

    let io = StdBlockIO::new(&mut file);
    let mut img = Image::open(io, ImageOptions::default()).unwrap();
    assert_eq!(img.meta().reftable_offset, reftable_offset);
    assert_eq!(
        img.get_refcount(img.meta().cluster_index(alloc_off)).unwrap(),
        1
    );

    let rep = img.check(RepairFlags::empty()).unwrap();
    assert_eq!(rep.corruptions, 0, "{rep}");
    assert_eq!(rep.leaks, 1, "{rep}"); // the unreferenced allocation
}

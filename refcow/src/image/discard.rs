// SPDX-License-Identifier: MIT

#[cfg(all(not(feature = "std"), feature = "alloc"))]
use alloc::vec::Vec;

use refio::prelude::*;

/// Deferred, coalesced discards.
///
/// Freed cluster ranges accumulate here instead of reaching the back-end
/// one by one; adjacent and overlapping ranges merge. The queue drains at
/// operation boundaries, either issuing every range or dropping them all.
#[derive(Debug, Default)]
pub struct DiscardQueue {
    ranges: Vec<DiscardRange>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscardRange {
    pub offset: u64,
    pub bytes: u64,
}

impl DiscardRange {
    #[inline]
    fn end(&self) -> u64 {
        self.offset + self.bytes
    }

    #[inline]
    fn touches(&self, other: &DiscardRange) -> bool {
        self.offset <= other.end() && other.offset <= self.end()
    }
}

impl DiscardQueue {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn ranges(&self) -> &[DiscardRange] {
        &self.ranges
    }

    /// Queues `[offset, offset + bytes)`, merging with any adjacent or
    /// overlapping range already queued.
    pub fn enqueue(&mut self, offset: u64, bytes: u64) {
        if bytes == 0 {
            return;
        }
        let mut merged = DiscardRange { offset, bytes };

        // Absorbing one range can make another adjacent; rescan until the
        // merged range is disjoint from everything left.
        loop {
            let mut changed = false;
            let mut i = 0;
            while i < self.ranges.len() {
                if merged.touches(&self.ranges[i]) {
                    let r = self.ranges.swap_remove(i);
                    let start = merged.offset.min(r.offset);
                    let end = merged.end().max(r.end());
                    merged = DiscardRange {
                        offset: start,
                        bytes: end - start,
                    };
                    changed = true;
                } else {
                    i += 1;
                }
            }
            if !changed {
                break;
            }
        }

        self.ranges.push(merged);
    }

    /// Empties the queue. Issues `discard` for each range when `ok`;
    /// otherwise the ranges are simply dropped.
    pub fn flush<B: BlockIO + ?Sized>(&mut self, io: &mut B, ok: bool) -> BlockIOResult {
        let mut result = Ok(());
        for r in self.ranges.drain(..) {
            if ok && result.is_ok() {
                // Discards are best-effort; remember the first failure but
                // keep draining.
                result = io.discard(r.offset, r.bytes);
            }
        }
        result
    }
}

#[cfg(all(test, feature = "mem"))]
mod tests {
    use super::*;

    #[test]
    fn test_adjacent_ranges_merge() {
        let mut q = DiscardQueue::new();
        q.enqueue(0, 512);
        q.enqueue(512, 512);
        assert_eq!(q.len(), 1);
        assert_eq!(
            q.ranges()[0],
            DiscardRange {
                offset: 0,
                bytes: 1024
            }
        );
    }

    #[test]
    fn test_disjoint_ranges_stay_separate() {
        let mut q = DiscardQueue::new();
        q.enqueue(0, 512);
        q.enqueue(2048, 512);
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn test_bridging_range_collapses_all() {
        let mut q = DiscardQueue::new();
        q.enqueue(0, 512);
        q.enqueue(1024, 512);
        q.enqueue(512, 512);
        assert_eq!(q.len(), 1);
        assert_eq!(
            q.ranges()[0],
            DiscardRange {
                offset: 0,
                bytes: 1536
            }
        );
    }

    #[test]
    fn test_flush_not_ok_drops_ranges() {
        let mut io = MemBlockIO::new();
        io.write_at(0, &[0xFF; 1024]).unwrap();

        let mut q = DiscardQueue::new();
        q.enqueue(0, 512);
        q.flush(&mut io, false).unwrap();
        assert!(q.is_empty());

        let mut b = [0u8; 512];
        io.read_at(0, &mut b).unwrap();
        assert_eq!(b, [0xFF; 512]);
    }

    #[test]
    fn test_flush_ok_issues_discards() {
        let mut io = MemBlockIO::new();
        io.write_at(0, &[0xFF; 1024]).unwrap();

        let mut q = DiscardQueue::new();
        q.enqueue(0, 512);
        q.flush(&mut io, true).unwrap();
        assert!(q.is_empty());

        let mut b = [0u8; 512];
        io.read_at(0, &mut b).unwrap();
        assert_eq!(b, [0u8; 512]);
    }
}

// SPDX-License-Identifier: MIT

//! Refcount structure rebuild.
//!
//! When the reftable or a refblock is structurally damaged, point repairs
//! cannot help: the whole structure is regenerated from the in-memory
//! ground truth. New refblocks and a new reftable are written to clusters
//! the truth table says are free (past the highest live cluster), then the
//! header's 12-byte reftable pointer commits the swap atomically. The old
//! structure becomes unreferenced garbage; the caller sweeps it with a
//! leak-only pass.

#[cfg(all(not(feature = "std"), feature = "alloc"))]
use alloc::{vec, vec::Vec};

use refio::prelude::*;

use crate::core::{CheckError, CheckReport, CheckResult, Finding};
use crate::image::checker::Imrt;
use crate::image::refcount::write_count;
use crate::image::Image;

/// Allocator over the in-memory refcount table: finds `n` contiguous free
/// clusters at or after `hint`, marks them used, grows the table when the
/// scan runs past its end.
fn alloc_imrt(table: &mut Imrt, n: u64, hint: &mut u64) -> CheckResult<u64> {
    let mut start = *hint;
    let mut run = 0u64;
    loop {
        let cluster = start + run;
        table.ensure(cluster + 1)?;
        if table.get(cluster) != 0 {
            start = cluster + 1;
            run = 0;
            continue;
        }
        run += 1;
        if run == n {
            for c in start..start + n {
                table.set(c, 1);
            }
            *hint = start + n;
            return Ok(start);
        }
    }
}

impl<B: BlockIO> Image<B> {
    pub(crate) fn rebuild_refcount_structure(
        &mut self,
        table: &mut Imrt,
        rep: &mut CheckReport,
    ) -> CheckResult<()> {
        let s = self.meta.cluster_size;
        let rb = self.meta.refblock_entries;
        let entries_per_cluster = s / 8;

        // Cached refblocks describe the structure being thrown away.
        self.refblock_cache.empty();

        // New metadata goes past everything the truth table knows about.
        let mut hint = (0..table.len())
            .rev()
            .find(|&c| table.get(c) != 0)
            .map_or(0, |c| c + 1);

        // Fixed point: every occupied span needs a refblock, the reftable
        // must cover every span, and both kinds of new cluster occupy spans
        // themselves.
        let mut refblocks: Vec<u64> = Vec::new();
        let mut table_run: Option<(u64, u64)> = None; // (first cluster, clusters)
        loop {
            // Give every occupied span a refblock.
            loop {
                let spans_total = table.len().div_ceil(rb) as usize;
                if refblocks.len() < spans_total {
                    refblocks.resize(spans_total, 0);
                }
                let mut changed = false;
                for span in 0..refblocks.len() {
                    if refblocks[span] != 0 {
                        continue;
                    }
                    let lo = span as u64 * rb;
                    let hi = ((span as u64 + 1) * rb).min(table.len());
                    if (lo..hi).any(|c| table.get(c) != 0) {
                        let block = alloc_imrt(table, 1, &mut hint)?;
                        refblocks[span] = self.meta.cluster_offset(block);
                        changed = true;
                    }
                }
                if !changed {
                    break;
                }
            }

            // Size the reftable for the spans seen so far.
            let table_clusters = (refblocks.len() as u64)
                .max(1)
                .div_ceil(entries_per_cluster);
            if let Some((_, have)) = table_run
                && have >= table_clusters
            {
                break;
            }
            if let Some((old_start, old_n)) = table_run.take() {
                for c in old_start..old_start + old_n {
                    table.set(c, 0);
                }
            }
            let start = alloc_imrt(table, table_clusters, &mut hint)?;
            table_run = Some((start, table_clusters));
            // The run occupies spans; loop back to cover them.
        }
        let (table_start, table_clusters) = table_run.unwrap();
        let table_offset = self.meta.cluster_offset(table_start);

        // Write the refblocks from the truth table.
        let mut block_buf = vec![0u8; s as usize];
        for (span, &offset) in refblocks.iter().enumerate() {
            if offset == 0 {
                continue;
            }
            block_buf.fill(0);
            let lo = span as u64 * rb;
            let hi = ((span as u64 + 1) * rb).min(table.len());
            for c in lo..hi {
                write_count(&mut block_buf, (c - lo) as usize, table.get(c));
            }
            self.io.write_at(offset, &block_buf).map_err(CheckError::IO)?;
        }

        // Write the reftable.
        let mut table_buf = vec![0u8; (table_clusters * s) as usize];
        for (span, &offset) in refblocks.iter().enumerate() {
            table_buf[span * 8..span * 8 + 8].copy_from_slice(&offset.to_be_bytes());
        }
        self.io
            .write_in_chunks(table_offset, &table_buf, s as usize)
            .map_err(CheckError::IO)?;

        // Linearisation point: the 12-byte header pointer swap.
        self.meta
            .commit_reftable_pointer(&mut self.io, table_offset, table_clusters as u32)
            .map_err(CheckError::Refcount)?;

        let mut new_reftable = vec![0u64; (table_clusters * entries_per_cluster) as usize];
        new_reftable[..refblocks.len()].copy_from_slice(&refblocks);
        self.reftable = new_reftable;
        self.free_cluster_hint = 0;

        let span_count = refblocks.iter().filter(|&&o| o != 0).count();
        log::info!("refcount structure rebuilt: {span_count} refblocks, reftable at {table_offset:#x}");
        rep.push(Finding::warn(
            "REF.REBUILD",
            format!("refcount structure rebuilt ({span_count} spans, reftable at {table_offset:#x})"),
        ));
        Ok(())
    }
}

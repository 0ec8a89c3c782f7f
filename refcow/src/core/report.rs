// SPDX-License-Identifier: MIT

#[cfg(all(not(feature = "std"), feature = "alloc"))]
use alloc::{string::String, vec::Vec};
use core::cmp::Ordering;
use core::fmt;

use bitflags::bitflags;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warn,
    Error,
}

impl PartialOrd for Severity {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Severity {
    fn cmp(&self, other: &Self) -> Ordering {
        use Severity::*;
        fn rank(s: Severity) -> u8 {
            match s {
                Info => 0,
                Warn => 1,
                Error => 2,
            }
        }
        rank(*self).cmp(&rank(*other))
    }
}

#[derive(Clone, Debug)]
pub struct Finding {
    pub sev: Severity,
    pub code: &'static str,
    pub msg: String,
}

impl Finding {
    pub fn info(code: &'static str, msg: impl Into<String>) -> Self {
        Self {
            sev: Severity::Info,
            code,
            msg: msg.into(),
        }
    }
    pub fn warn(code: &'static str, msg: impl Into<String>) -> Self {
        Self {
            sev: Severity::Warn,
            code,
            msg: msg.into(),
        }
    }
    pub fn err(code: &'static str, msg: impl Into<String>) -> Self {
        Self {
            sev: Severity::Error,
            code,
            msg: msg.into(),
        }
    }
}

bitflags! {
    /// Which divergences the checker may repair.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct RepairFlags: u32 {
        /// Fix under-counts and structural corruption (may trigger a
        /// full refcount rebuild).
        const FIX_ERRORS = 1 << 0;
        /// Fix over-counts by freeing leaked clusters.
        const FIX_LEAKS  = 1 << 1;
    }
}

/// Fragmentation statistics gathered while walking the mapping tables.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FragInfo {
    pub allocated_clusters: u64,
    pub total_clusters: u64,
    pub fragmented_clusters: u64,
    pub compressed_clusters: u64,
}

/// Result record of a consistency check.
#[derive(Clone, Debug, Default)]
pub struct CheckReport {
    pub findings: Vec<Finding>,
    /// Internal errors that prevented part of the check from completing.
    pub check_errors: u64,
    pub corruptions: u64,
    pub corruptions_fixed: u64,
    pub leaks: u64,
    pub leaks_fixed: u64,
    pub image_end_offset: u64,
    pub frag: FragInfo,
}

impl CheckReport {
    pub fn push(&mut self, f: Finding) {
        self.findings.push(f)
    }

    /// True when no divergence remains unrepaired.
    pub fn is_clean(&self) -> bool {
        self.check_errors == 0 && self.corruptions == 0 && self.leaks == 0
    }

    pub fn has_error(&self) -> bool {
        self.findings
            .iter()
            .any(|f| matches!(f.sev, Severity::Error))
    }

    pub fn count(&self, s: Severity) -> usize {
        self.findings.iter().filter(|f| f.sev == s).count()
    }
}

impl fmt::Display for CheckReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for it in &self.findings {
            let tag = match it.sev {
                Severity::Info => "INFO",
                Severity::Warn => "WARN",
                Severity::Error => "ERR ",
            };
            writeln!(f, "{tag}: {:<12} {}", it.code, it.msg)?;
        }
        writeln!(
            f,
            "Summary: corruptions={} (fixed {})  leaks={} (fixed {})  check_errors={}",
            self.corruptions, self.corruptions_fixed, self.leaks, self.leaks_fixed, self.check_errors
        )?;
        writeln!(
            f,
            "Clusters: {}/{} allocated, {} fragmented, {} compressed, image end {:#x}",
            self.frag.allocated_clusters,
            self.frag.total_clusters,
            self.frag.fragmented_clusters,
            self.frag.compressed_clusters,
            self.image_end_offset
        )?;
        Ok(())
    }
}

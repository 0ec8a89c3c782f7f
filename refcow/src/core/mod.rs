// === Sub-modules ===
pub mod errors;
mod macros;
pub mod report;

// === Error types ===
pub use errors::*;

// === Checker report types ===
pub use report::{CheckReport, Finding, FragInfo, RepairFlags, Severity};

//! Incremental EBML codec: variable-length integers (VINTs) shared by
//! element IDs and data sizes, typed scalar elements, and a framer that
//! back-patches container sizes.

pub mod matroska;
pub mod reader;
pub mod writer;

/// Sentinel for a data size whose payload bits are all ones ("unknown",
/// used by streaming Segments that never declare their length).
pub const UNKNOWN_SIZE: u64 = u64::MAX;

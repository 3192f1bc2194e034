//! Purpose: Persistent memory-mapped append-only message logs ("piles").
//! Exports: `core` (mapped file/regions, rolling pointers, framing, errors).
//! Role: Library backing single-writer/multi-reader IPC over a shared file.
//! Invariants: One appender per pile; readers never observe partial frames.
//! Invariants: Region size is a construction-time constant per file.
pub mod core;

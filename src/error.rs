//! Typed errors for the recoverable outcomes the engine can produce.
//!
//! Contract violations (type mismatches, out-of-range indices, capacity
//! overflow on insert) are bugs in the caller and are never represented
//! here — they surface as panics via `assert!`/`debug_assert!` at the call
//! site, matching the original reference implementation's `assert()`
//! macro. Only "out of space" and "corruption" are recoverable, per the
//! taxonomy the engine is specified against.

use thiserror::Error;

/// Recoverable errors surfaced by the storage engine to its caller.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("out of space: cannot grow backing region past {attempted_offset} bytes")]
    OutOfSpace { attempted_offset: i64 },

    #[error("corruption at offset {offset}: {detail}")]
    Corruption { offset: i64, detail: String },

    #[error("key {key:#x} has the reserved top bit set (blob indirection is not implemented)")]
    ReservedKeyBit { key: u64 },
}

pub type Result<T> = std::result::Result<T, EngineError>;

//! Internal invariant failures — bugs, not user-facing diagnostics.
//!
//! Everything a user can cause by wiring a bad patch is a `Diagnostic`
//! (see `diagnostics`). This enum is reserved for the handful of conditions
//! the design notes call "truly unrecoverable": an index the compiler itself
//! allocated turning out to be out of range, a topological sort that failed
//! to terminate, a state slot that disappeared between two passes of the
//! same compile. None of these should ever happen; when they do, propagate
//! the error rather than panic so callers (tests, the CLI) can report it.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum InternalError {
    #[error("slot {0} out of range (ValueStore has {1} slots)")]
    SlotOutOfRange(usize, usize),

    #[error("state slot '{0}' missing from stateStore")]
    StateSlotMissing(String),

    #[error("topological sort did not terminate: patch graph retains a cycle after E_CYCLE_DETECTED should have fired")]
    TopoSortDidNotTerminate,

    #[error("IR builder invariant broken: {0}")]
    BuilderInvariant(String),

    #[error("buffer pool exhausted for (payload={0:?}, capacity={1})")]
    BufferPoolExhausted(crate::types::Payload, usize),
}

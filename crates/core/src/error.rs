//! Error taxonomy for the block-management core.
//!
//! Every variant maps to one row of the error-handling table: most are
//! surfaced to the job bridge as a job-level failure reason; `ConfigInvalid`
//! is the only one that is fatal at startup.

use thiserror::Error;

use crate::common::Coord;

/// A human-readable, job-visible failure reason of the form
/// `"select_bluegene: <cause> [SLURM@<timestamp>]"`, built from a
/// [`CoreError`] by [`CoreError::job_reason`].
pub fn job_reason(cause: &str, timestamp: i64) -> String {
    format!("select_bluegene: {cause} [SLURM@{timestamp}]")
}

/// Errors raised anywhere in the block-management core.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CoreError {
    /// A configuration file or invariant violation detected at startup. Fatal.
    #[error("configuration invalid: {0}")]
    ConfigInvalid(String),

    /// A controller-bridge call failed.
    #[error("controller bridge call {call} failed: {detail}")]
    BridgeFailure { call: &'static str, detail: String },

    /// `create_block`/`modify_block` returned `INCOMPATIBLE_STATE`.
    #[error("block {0} is in an incompatible state for this transition")]
    IncompatibleState(String),

    /// The allocator could not place the request right now, but could later.
    #[error("no block is free for this request yet")]
    ResourcesBusy,

    /// The allocator proved the request can never be satisfied by this machine.
    #[error("requested geometry is impossible on this machine")]
    GeometryImpossible,

    /// The requested midplane set is already committed to another block.
    #[error("midplane set conflicts with an already-used block")]
    GeometryConflict,

    /// No switch path exists through the requested dimensions.
    #[error("no wiring path satisfies the requested connection type")]
    WiringConflict,

    /// The rectangle requires passing through a midplane excluded by `DenyPassthrough`.
    #[error("requested rectangle requires a denied pass-through hop")]
    PassthroughDenied,

    /// `create_block` failed to bring the block up.
    #[error("block {0} failed to boot")]
    BootFailed(String),

    /// `set_block_owner` failed during job handover.
    #[error("failed to set owner on block {0}")]
    OwnerSetFailed(String),

    /// A midplane, nodecard, or switch reported non-`up` state.
    #[error("hardware down at {0}: {1}")]
    HardwareDown(Coord, String),

    /// The block named by an action ticket no longer exists in `main`.
    #[error("block {0} no longer exists in the registry")]
    BlockVanished(String),

    /// A checkpoint record failed to decode (short read, bad length prefix, ...).
    #[error("checkpoint decode error: {0}")]
    CheckpointCorrupt(String),

    /// I/O failure while reading/writing the checkpoint or heartbeat file.
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for CoreError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl CoreError {
    /// Formats this error the way a job's `FAILED` reason string is rendered.
    pub fn job_reason(&self, timestamp: i64) -> String {
        job_reason(&self.to_string(), timestamp)
    }

    /// True if the reference implementation treats this as retryable with back-off.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::IncompatibleState(_))
    }
}

/// Result alias used throughout the core.
pub type Result<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_reason_has_expected_shape() {
        let r = job_reason("BLOCK_ERROR", 1_700_000_000);
        assert!(r.starts_with("select_bluegene: BLOCK_ERROR"));
        assert!(r.ends_with("[SLURM@1700000000]"));
    }

    #[test]
    fn incompatible_state_is_the_only_retryable_kind() {
        assert!(CoreError::IncompatibleState("RMP000".into()).is_retryable());
        assert!(!CoreError::ResourcesBusy.is_retryable());
    }
}

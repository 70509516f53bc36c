//! System-wide constants mirrored from the reference controller.

/// Pseudo job-id meaning "nothing is running on this block".
pub const NO_JOB: i64 = -1;
/// Pseudo job-id meaning the block's hardware is in an error state.
pub const BLOCK_ERROR: i64 = -3;
/// Pseudo job-id meaning an administrator forced the block into error.
pub const ADMIN_ERROR: i64 = -4;

/// Upper bound on concurrently active lifecycle workers (free/destroy/boot).
pub const MAX_WORKERS: usize = 30;

/// Retries for a `create_block`/`modify_block` call that returns `INCOMPATIBLE_STATE`.
pub const MAX_ADD_RETRY: u32 = 2;
/// Back-off between `INCOMPATIBLE_STATE` retries.
pub const ADD_RETRY_BACKOFF_MS: u64 = 3_000;

/// Poll interval used by the free-block busy-wait loop.
pub const FREE_POLL_INTERVAL_MS: u64 = 1_000;
/// Number of free-poll iterations before escalating to `SIGTERM`.
pub const MAX_POLL_RETRIES: u32 = 30;

/// Block-state poller period on real hardware.
pub const BLOCK_POLL_INTERVAL_SECS: u64 = 3;
/// MMCS (switch/nodecard) poller period.
pub const MMCS_POLL_INTERVAL_SECS: u64 = 30;

/// Checkpoint format version written by this build.
pub const BLOCK_STATE_VERSION: &str = "VER002";
/// Legacy checkpoint version still accepted by no migration path (ignored, not upgraded).
pub const BLOCK_STATE_VERSION_LEGACY: &str = "VER001";

/// Sizes for which a pre-computed valid-ionode-range bitmap is cached.
pub const SMALL_BLOCK_SIZES: [u32; 4] = [32, 64, 128, 256];
/// Restricted size family used when `LegacySmallBlocks` is set.
pub const LEGACY_SMALL_BLOCK_SIZES: [u32; 2] = [32, 128];

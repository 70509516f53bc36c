//! Common types shared across the block-management subsystem.
//!
//! 1. **Coordinates:** `Coord` and `Dimensions`, the 3-D midplane grid address space.
//! 2. **Constants:** pseudo job-ids, worker/retry/poll bounds, checkpoint version strings.

/// Midplane coordinates and grid dimensions.
pub mod coord;

/// Shared numeric constants.
pub mod constants;

pub use coord::{Coord, Dimensions};

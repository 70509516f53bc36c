//! The 3-D midplane grid (C1).
//!
//! 1. **Switches:** `switch` models one midplane's per-dimension axis switch.
//! 2. **Grid:** `grid` is the machine-wide `Topology`: reservation, rectangle
//!    search, and path finding.
//! 3. **Ionodes:** `ionode` caches the legal small-block sizes and their
//!    ionode ranges, derived from the configured I/O ratio.

pub mod grid;
pub mod ionode;
pub mod switch;

pub use grid::{DenyPass, Rectangle, Topology};
pub use ionode::{IonodeRange, ValidSmallRanges};

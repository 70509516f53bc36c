//! The allocator (C6): one of three layout strategies, chosen once at
//! startup from [`crate::config::LayoutMode`] and never changed for the
//! life of the process. See spec.md §4.5.

mod dynamic_alloc;
mod overlap_alloc;
mod static_alloc;

pub use dynamic_alloc::DynamicAllocator;
pub use overlap_alloc::OverlapAllocator;
pub use static_alloc::StaticAllocator;

use std::sync::Mutex;

use crate::block::{Block, ConnType, Images};
use crate::common::constants::{LEGACY_SMALL_BLOCK_SIZES, SMALL_BLOCK_SIZES};
use crate::config::Config;
use crate::error::Result;
use crate::registry::Registry;
use crate::topology::Topology;

/// What a caller asks the allocator for, before normalization.
#[derive(Clone, Debug)]
pub struct Request {
    pub node_count: u32,
    pub conn_type: ConnType,
    pub geometry_hint: (u16, u16, u16),
    pub rotate: bool,
    pub reboot: bool,
    pub images: Option<Images>,
}

/// A request after rounding, per spec.md §4.5's closing paragraph: node
/// count rounded up to the nearest legal small-block size or midplane
/// multiple, `max_cpus` derived, `rotate`/`reboot` preserved.
#[derive(Clone, Debug)]
pub struct NormalizedRequest {
    pub node_count: u32,
    pub max_cpus: u32,
    pub conn_type: ConnType,
    pub geometry_hint: (u16, u16, u16),
    pub rotate: bool,
    pub reboot: bool,
    pub images: Images,
}

/// Rounds `req` up to something the machine can actually build, per
/// spec.md §4.5.
pub fn normalize(req: &Request, cfg: &Config) -> NormalizedRequest {
    let midplane_size = cfg.bp_node_cnt.max(1);
    let node_count = if req.node_count < midplane_size {
        let smallest = cfg.smallest_block_size();
        let sizes: &[u32] =
            if cfg.legacy_small_blocks { &LEGACY_SMALL_BLOCK_SIZES } else { &SMALL_BLOCK_SIZES };
        sizes
            .iter()
            .copied()
            .filter(|&s| s >= smallest && s >= req.node_count)
            .min()
            .unwrap_or(midplane_size)
    } else {
        midplane_size * req.node_count.div_ceil(midplane_size)
    };
    NormalizedRequest {
        node_count,
        max_cpus: node_count * cfg.cpus_per_node,
        conn_type: req.conn_type,
        geometry_hint: req.geometry_hint,
        rotate: req.rotate,
        reboot: req.reboot,
        images: req.images.clone().unwrap_or_else(|| cfg.default_images.clone()),
    }
}

/// The outcome of [`Allocator::place`].
#[derive(Clone, Debug)]
pub enum Placement {
    /// Reuse an already-configured block, identified by id.
    Existing(String),
    /// Synthesize this new block (dynamic layout only), destroying `evict`
    /// first if any of them occupy the midplanes it needs.
    New { block: Block, evict: Vec<String> },
    /// Nothing fits right now; retry no sooner than `est_start`.
    WillRun { est_start: i64 },
    /// This machine can never satisfy the request.
    Impossible,
}

/// Everything an [`Allocator`] needs besides the request itself.
pub struct AllocatorContext<'a> {
    pub registry: &'a Registry,
    pub topology: &'a Mutex<Topology>,
    pub config: &'a Config,
    /// Estimated completion time of a running job, supplied by the caller
    /// (job accounting is out of this crate's scope per spec.md §1).
    pub job_end_time: &'a dyn Fn(u32) -> i64,
    pub now: i64,
}

/// A placement strategy, selected once at startup and never switched.
pub trait Allocator: Send + Sync {
    fn place(&self, req: &NormalizedRequest, ctx: &AllocatorContext<'_>) -> Result<Placement>;
}

/// Configured blocks whose size and connection type could satisfy `req`,
/// ascending by `node_cnt` then id (the order `Registry::list` already
/// returns), shared by the static and overlap strategies.
pub(crate) fn candidates(registry: &Registry, req: &NormalizedRequest) -> Vec<Block> {
    registry
        .list(crate::registry::ListFilter::Main)
        .into_iter()
        .filter(|b| {
            b.node_cnt >= req.node_count
                && (req.conn_type == ConnType::Nav || b.conn_type == req.conn_type)
        })
        .collect()
}

/// Job ids that must finish before `block` could take `req`: the block's
/// own job (if any) plus every overlapping block's job. Static layout's
/// invariant 3(a): no block may start while it, or anything it overlaps,
/// is running a job.
pub(crate) fn blocking_jobs(registry: &Registry, block: &Block) -> Vec<u32> {
    let mut jobs: Vec<u32> = block.job_running.job_id().into_iter().collect();
    for ov in registry.overlapping(block) {
        if let Some(j) = ov.job_running.job_id() {
            jobs.push(j);
        }
    }
    jobs
}

/// Job ids running on blocks that overlap `block`, excluding `block`
/// itself — the relaxed overlap-layout check (spec.md §4.5).
pub(crate) fn overlapping_jobs(registry: &Registry, block: &Block) -> Vec<u32> {
    registry.overlapping(block).into_iter().filter_map(|b| b.job_running.job_id()).collect()
}

/// The earliest moment any of `jobs` is expected to finish; `ctx.now` if
/// `jobs` is empty (nothing to wait on).
pub(crate) fn earliest_end(ctx: &AllocatorContext<'_>, jobs: &[u32]) -> i64 {
    jobs.iter().map(|&j| (ctx.job_end_time)(j)).min().unwrap_or(ctx.now)
}

/// The latest moment all of `jobs` are expected to have finished — the
/// point at which every blocking job has cleared.
pub(crate) fn latest_end(ctx: &AllocatorContext<'_>, jobs: &[u32]) -> i64 {
    jobs.iter().map(|&j| (ctx.job_end_time)(j)).max().unwrap_or(ctx.now)
}

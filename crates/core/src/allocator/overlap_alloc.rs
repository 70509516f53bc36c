//! The `overlap` layout: the same pre-configured blocks as `static`, but
//! invariant 3(a) is relaxed — a block may start as long as nothing it
//! overlaps is currently running a job (spec.md §4.5).

use std::sync::PoisonError;

use super::{candidates, latest_end, overlapping_jobs, Allocator, AllocatorContext, NormalizedRequest, Placement};
use crate::error::Result;
use crate::registry::ListFilter;
use crate::topology::Topology;

/// Picks among the pre-configured blocks, permitting a block to start
/// alongside an idle sibling it physically overlaps.
#[derive(Default)]
pub struct OverlapAllocator;

impl OverlapAllocator {
    pub fn new() -> Self {
        Self
    }
}

/// A scratch topology with every currently-running block's nodes already
/// reserved, so a candidate's wiring can be checked against what is
/// actually committed right now rather than against an empty grid.
fn topology_with_running_reservations(ctx: &AllocatorContext<'_>) -> Topology {
    let dims = ctx.topology.lock().unwrap_or_else(PoisonError::into_inner).dims();
    let mut scratch = Topology::new(dims);
    for running in ctx.registry.list(ListFilter::JobRunning) {
        let _ = scratch.reserve(&running.nodes, running.conn_type, ctx.config.deny_passthrough);
    }
    scratch
}

impl Allocator for OverlapAllocator {
    fn place(&self, req: &NormalizedRequest, ctx: &AllocatorContext<'_>) -> Result<Placement> {
        let candidates = candidates(ctx.registry, req);
        let scratch = topology_with_running_reservations(ctx);

        for block in &candidates {
            if block.job_running.is_running() || !overlapping_jobs(ctx.registry, block).is_empty() {
                continue;
            }
            // The new block must also still be simultaneously wireable
            // alongside every block currently running a job (spec.md §4.5).
            if scratch.can_reserve(&block.nodes, block.conn_type, ctx.config.deny_passthrough) {
                return Ok(Placement::Existing(block.id.clone()));
            }
        }

        let est_start = candidates
            .iter()
            .map(|b| {
                let mut jobs = overlapping_jobs(ctx.registry, b);
                jobs.extend(b.job_running.job_id());
                latest_end(ctx, &jobs)
            })
            .min();

        match est_start {
            Some(est_start) => Ok(Placement::WillRun { est_start }),
            None => Ok(Placement::Impossible),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{BlockState, BootState, ConnType, Images, JobRunning};
    use crate::common::{Coord, Dimensions};
    use crate::config::Config;
    use crate::registry::Registry;
    use crate::topology::Topology;
    use std::sync::Mutex;

    fn block(id: &str, job: JobRunning) -> crate::block::Block {
        crate::block::Block {
            id: id.into(),
            nodes: vec![Coord::new(0, 0, 0)],
            ionodes: None,
            geometry: (1, 1, 1),
            start: Coord::new(0, 0, 0),
            conn_type: ConnType::Torus,
            node_cnt: 512,
            cpu_cnt: 2048,
            images: Images::default(),
            state: if job.is_running() { BlockState::Busy } else { BlockState::Free },
            boot_state: BootState::Idle,
            boot_count: 0,
            job_running: job,
            user_name: None,
            target_name: None,
            modifying: false,
            full_block: false,
        }
    }

    fn request() -> NormalizedRequest {
        NormalizedRequest {
            node_count: 512,
            max_cpus: 2048,
            conn_type: ConnType::Torus,
            geometry_hint: (1, 1, 1),
            rotate: false,
            reboot: false,
            images: Images::default(),
        }
    }

    #[test]
    fn idle_sibling_of_a_busy_overlap_is_not_a_blocker() {
        let registry = Registry::new();
        registry.insert(block("RMP000", JobRunning::None));
        let topology = Mutex::new(Topology::new(Dimensions::new(1, 1, 1)));
        let cfg = Config::default();
        let ctx = AllocatorContext {
            registry: &registry,
            topology: &topology,
            config: &cfg,
            job_end_time: &|_| 1_700_001_000,
            now: 1_700_000_000,
        };
        let placement = OverlapAllocator::new().place(&request(), &ctx).unwrap();
        assert!(matches!(placement, Placement::Existing(id) if id == "RMP000"));
    }

    #[test]
    fn overlapping_running_job_blocks_placement() {
        let registry = Registry::new();
        registry.insert(block("RMP000", JobRunning::None));
        let mut busy_sibling = block("RMP001", JobRunning::Job(9));
        busy_sibling.nodes = vec![Coord::new(0, 0, 0)];
        registry.insert(busy_sibling);
        let topology = Mutex::new(Topology::new(Dimensions::new(1, 1, 1)));
        let cfg = Config::default();
        let ctx = AllocatorContext {
            registry: &registry,
            topology: &topology,
            config: &cfg,
            job_end_time: &|_| 1_700_001_000,
            now: 1_700_000_000,
        };
        let placement = OverlapAllocator::new().place(&request(), &ctx).unwrap();
        assert!(matches!(placement, Placement::WillRun { est_start: 1_700_001_000 }));
    }

    #[test]
    fn a_non_overlapping_running_block_still_blocks_a_conflicting_passthrough() {
        // Dims(4,1,1): torus wrap makes midplane 1 the passthrough hop a
        // block at midplane 0 needs. A running job at midplane 1 does not
        // node-overlap a candidate at midplane 0, but the two can't be
        // simultaneously wired (spec.md §4.5's overlap feasibility check).
        let registry = Registry::new();
        let mut running = block("RMP-RUNNING", JobRunning::Job(9));
        running.nodes = vec![Coord::new(1, 0, 0)];
        registry.insert(running);

        let mut candidate = block("RMP-CANDIDATE", JobRunning::None);
        candidate.nodes = vec![Coord::new(0, 0, 0)];
        registry.insert(candidate);

        let topology = Mutex::new(Topology::new(Dimensions::new(4, 1, 1)));
        let cfg = Config::default();
        let ctx = AllocatorContext {
            registry: &registry,
            topology: &topology,
            config: &cfg,
            job_end_time: &|_| 1_700_001_000,
            now: 1_700_000_000,
        };
        let placement = OverlapAllocator::new().place(&request(), &ctx).unwrap();
        assert!(
            !matches!(placement, Placement::Existing(ref id) if id == "RMP-CANDIDATE"),
            "candidate should have been rejected for an unwireable passthrough, got {placement:?}"
        );
    }
}

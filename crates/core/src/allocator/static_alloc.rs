//! The `static` layout: only the blocks named in the configuration exist;
//! placement never creates or destroys anything (spec.md §4.5).

use super::{blocking_jobs, candidates, latest_end, Allocator, AllocatorContext, NormalizedRequest, Placement};
use crate::error::Result;

/// Picks among the pre-configured blocks; never synthesizes one.
#[derive(Default)]
pub struct StaticAllocator;

impl StaticAllocator {
    pub fn new() -> Self {
        Self
    }
}

impl Allocator for StaticAllocator {
    fn place(&self, req: &NormalizedRequest, ctx: &AllocatorContext<'_>) -> Result<Placement> {
        let candidates = candidates(ctx.registry, req);

        for block in &candidates {
            if blocking_jobs(ctx.registry, block).is_empty() {
                return Ok(Placement::Existing(block.id.clone()));
            }
        }

        let est_start = candidates
            .iter()
            .map(|b| latest_end(ctx, &blocking_jobs(ctx.registry, b)))
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

    fn block(id: &str, node_cnt: u32, job: JobRunning) -> crate::block::Block {
        crate::block::Block {
            id: id.into(),
            nodes: vec![Coord::new(0, 0, 0)],
            ionodes: None,
            geometry: (1, 1, 1),
            start: Coord::new(0, 0, 0),
            conn_type: ConnType::Torus,
            node_cnt,
            cpu_cnt: node_cnt * 4,
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

    fn ctx<'a>(registry: &'a Registry, topology: &'a Mutex<Topology>, cfg: &'a Config) -> AllocatorContext<'a> {
        AllocatorContext { registry, topology, config: cfg, job_end_time: &|_| 1_700_001_000, now: 1_700_000_000 }
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
    fn picks_the_first_free_candidate() {
        let registry = Registry::new();
        registry.insert(block("RMP000", 512, JobRunning::None));
        let topology = Mutex::new(Topology::new(Dimensions::new(1, 1, 1)));
        let cfg = Config::default();
        let placement = StaticAllocator::new().place(&request(), &ctx(&registry, &topology, &cfg)).unwrap();
        assert!(matches!(placement, Placement::Existing(id) if id == "RMP000"));
    }

    #[test]
    fn busy_block_yields_will_run() {
        let registry = Registry::new();
        registry.insert(block("RMP000", 512, JobRunning::Job(7)));
        let topology = Mutex::new(Topology::new(Dimensions::new(1, 1, 1)));
        let cfg = Config::default();
        let placement = StaticAllocator::new().place(&request(), &ctx(&registry, &topology, &cfg)).unwrap();
        assert!(matches!(placement, Placement::WillRun { est_start: 1_700_001_000 }));
    }

    #[test]
    fn no_matching_block_is_impossible() {
        let registry = Registry::new();
        let topology = Mutex::new(Topology::new(Dimensions::new(1, 1, 1)));
        let cfg = Config::default();
        let placement = StaticAllocator::new().place(&request(), &ctx(&registry, &topology, &cfg)).unwrap();
        assert!(matches!(placement, Placement::Impossible));
    }
}

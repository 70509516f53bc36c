//! The `dynamic` layout: blocks are synthesized (and tore down) on demand
//! rather than picked from a fixed configuration (spec.md §4.5).

use std::sync::atomic::{AtomicU32, Ordering};

use super::{candidates, earliest_end, Allocator, AllocatorContext, NormalizedRequest, Placement};
use crate::block::{Block, BlockState, BootState, ConnType, IonodeBitmap, JobRunning};
use crate::common::{Coord, Dimensions};
use crate::config::Config;
use crate::error::Result;
use crate::registry::ListFilter;
use crate::topology::{IonodeRange, ValidSmallRanges};

/// Synthesizes a new block when nothing already configured fits.
pub struct DynamicAllocator {
    ranges: ValidSmallRanges,
    midplane_size: u32,
    next_id: AtomicU32,
}

impl DynamicAllocator {
    pub fn new(cfg: &Config) -> Self {
        let ranges = ValidSmallRanges::build(
            cfg.smallest_block_size(),
            cfg.bp_node_cnt,
            cfg.ionodes_per_midplane(),
            cfg.legacy_small_blocks,
        );
        Self { ranges, midplane_size: cfg.bp_node_cnt.max(1), next_id: AtomicU32::new(0) }
    }

    /// A placeholder id, replaced by the controller's real id once
    /// `create_block` acks (spec.md §4.5, step 3).
    fn placeholder_id(&self) -> String {
        format!("PENDING-{:06}", self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Finds a midplane (ascending `(x,y,z)`, spec.md §4.5's tie-break) that
    /// can host a `size`-node small block: one not wholly committed to a
    /// running non-small job, with a cached ionode range of exactly `size`
    /// disjoint from every small block already resident there (invariant
    /// 3(b) — two small blocks on one midplane coexist iff their ionode
    /// bitmaps don't overlap, spec.md §8 scenario 4). Returns the midplane,
    /// the chosen range, and any idle full-midplane block that must be
    /// evicted first to free it.
    fn pick_small_placement(
        &self,
        ctx: &AllocatorContext<'_>,
        dims: Dimensions,
        size: u32,
    ) -> Option<(Coord, &IonodeRange, Vec<String>)> {
        let resident = ctx.registry.list(ListFilter::Main);
        for coord in dims.iter() {
            let here: Vec<&Block> = resident.iter().filter(|b| b.nodes.contains(&coord)).collect();
            if here.iter().any(|b| !b.conn_type.is_small() && b.job_running.is_running()) {
                continue;
            }

            let mut used = IonodeBitmap::new(ctx.config.ionodes_per_midplane());
            for small in here.iter().filter(|b| b.conn_type.is_small()) {
                if let Some(bits) = &small.ionodes {
                    for i in 0..bits.len() {
                        if bits.is_set(i) {
                            used.set(i);
                        }
                    }
                }
            }

            let range = self
                .ranges
                .ranges_at_least(size)
                .into_iter()
                .filter(|r| r.size == size)
                .find(|r| !self.ranges.bitmap_for(r).intersects(&used));
            if let Some(range) = range {
                let evict = here
                    .iter()
                    .filter(|b| !b.conn_type.is_small() && !b.job_running.is_running())
                    .map(|b| b.id.clone())
                    .collect();
                return Some((coord, range, evict));
            }
        }
        None
    }
}

impl Allocator for DynamicAllocator {
    fn place(&self, req: &NormalizedRequest, ctx: &AllocatorContext<'_>) -> Result<Placement> {
        for block in candidates(ctx.registry, req) {
            if !block.job_running.is_running() && super::blocking_jobs(ctx.registry, &block).is_empty() {
                return Ok(Placement::Existing(block.id));
            }
        }

        let topology = ctx.topology.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let busy: Vec<crate::common::Coord> = ctx
            .registry
            .list(ListFilter::JobRunning)
            .into_iter()
            .flat_map(|b| b.nodes)
            .collect();

        if req.node_count >= self.midplane_size {
            let midplanes_needed = req.node_count / self.midplane_size;
            let hint_count = u32::from(req.geometry_hint.0)
                * u32::from(req.geometry_hint.1)
                * u32::from(req.geometry_hint.2);
            let geometry_hint =
                if hint_count == midplanes_needed { req.geometry_hint } else { (midplanes_needed as u16, 1, 1) };

            if let Some(rect) = topology.find_rectangle_ignoring_wiring(
                midplanes_needed,
                midplanes_needed,
                geometry_hint,
                req.rotate,
                &busy,
            ) {
                let nodes = rect.coords();
                let evict = evictable_occupants(ctx, &nodes);
                let full_block = rect.midplane_count() == topology.dims().total_midplanes();
                let block = Block {
                    id: self.placeholder_id(),
                    nodes,
                    ionodes: None,
                    geometry: rect.geometry,
                    start: rect.start,
                    conn_type: req.conn_type,
                    node_cnt: req.node_count,
                    cpu_cnt: req.max_cpus,
                    images: req.images.clone(),
                    state: BlockState::Free,
                    boot_state: BootState::Idle,
                    boot_count: 0,
                    job_running: JobRunning::None,
                    user_name: None,
                    target_name: None,
                    modifying: false,
                    full_block,
                };
                return Ok(Placement::New { block, evict });
            }
        } else if let Some((coord, range, evict)) =
            self.pick_small_placement(ctx, topology.dims(), req.node_count)
        {
            let block = Block {
                id: self.placeholder_id(),
                nodes: vec![coord],
                ionodes: Some(self.ranges.bitmap_for(range)),
                geometry: (1, 1, 1),
                start: coord,
                conn_type: ConnType::Small,
                node_cnt: range.size,
                cpu_cnt: range.size * ctx.config.cpus_per_node,
                images: req.images.clone(),
                state: BlockState::Free,
                boot_state: BootState::Idle,
                boot_count: 0,
                job_running: JobRunning::None,
                user_name: None,
                target_name: None,
                modifying: false,
                full_block: false,
            };
            return Ok(Placement::New { block, evict });
        }

        let blocking: Vec<u32> = ctx
            .registry
            .list(ListFilter::JobRunning)
            .into_iter()
            .filter(|b| b.node_cnt >= req.node_count)
            .filter_map(|b| b.job_running.job_id())
            .collect();

        if blocking.is_empty() {
            Ok(Placement::Impossible)
        } else {
            Ok(Placement::WillRun { est_start: earliest_end(ctx, &blocking) })
        }
    }
}

/// Configured blocks (free and not running a job) whose nodes intersect
/// `nodes` — step 4 of spec.md §4.5's dynamic layout.
fn evictable_occupants(ctx: &AllocatorContext<'_>, nodes: &[crate::common::Coord]) -> Vec<String> {
    ctx.registry
        .list(ListFilter::Main)
        .into_iter()
        .filter(|b| !b.job_running.is_running() && b.nodes.iter().any(|n| nodes.contains(n)))
        .map(|b| b.id)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::Images;
    use crate::common::{Coord, Dimensions};
    use crate::registry::Registry;
    use crate::topology::Topology;
    use std::sync::Mutex;

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

    fn ctx<'a>(registry: &'a Registry, topology: &'a Mutex<Topology>, cfg: &'a Config) -> AllocatorContext<'a> {
        AllocatorContext { registry, topology, config: cfg, job_end_time: &|_| 1_700_001_000, now: 1_700_000_000 }
    }

    #[test]
    fn synthesizes_a_full_midplane_block_on_an_empty_machine() {
        let registry = Registry::new();
        let topology = Mutex::new(Topology::new(Dimensions::new(2, 1, 1)));
        let cfg = Config::default();
        let alloc = DynamicAllocator::new(&cfg);
        let placement = alloc.place(&request(), &ctx(&registry, &topology, &cfg)).unwrap();
        match placement {
            Placement::New { block, evict } => {
                assert_eq!(block.node_cnt, 512);
                assert!(evict.is_empty());
                assert_eq!(block.state, BlockState::Free);
            }
            other => panic!("expected New, got {other:?}"),
        }
    }

    #[test]
    fn reuses_an_idle_block_already_synthesized() {
        let registry = Registry::new();
        registry.insert(Block {
            id: "PENDING-000000".into(),
            nodes: vec![Coord::new(0, 0, 0)],
            ionodes: None,
            geometry: (1, 1, 1),
            start: Coord::new(0, 0, 0),
            conn_type: ConnType::Torus,
            node_cnt: 512,
            cpu_cnt: 2048,
            images: Images::default(),
            state: BlockState::Free,
            boot_state: BootState::Idle,
            boot_count: 0,
            job_running: JobRunning::None,
            user_name: None,
            target_name: None,
            modifying: false,
            full_block: false,
        });
        let topology = Mutex::new(Topology::new(Dimensions::new(1, 1, 1)));
        let cfg = Config::default();
        let alloc = DynamicAllocator::new(&cfg);
        let placement = alloc.place(&request(), &ctx(&registry, &topology, &cfg)).unwrap();
        assert!(matches!(placement, Placement::Existing(id) if id == "PENDING-000000"));
    }

    #[test]
    fn full_machine_busy_yields_will_run() {
        let registry = Registry::new();
        registry.insert(Block {
            id: "RMP000".into(),
            nodes: vec![Coord::new(0, 0, 0)],
            ionodes: None,
            geometry: (1, 1, 1),
            start: Coord::new(0, 0, 0),
            conn_type: ConnType::Torus,
            node_cnt: 512,
            cpu_cnt: 2048,
            images: Images::default(),
            state: BlockState::Busy,
            boot_state: BootState::Idle,
            boot_count: 0,
            job_running: JobRunning::Job(3),
            user_name: None,
            target_name: None,
            modifying: false,
            full_block: true,
        });
        let topology = Mutex::new(Topology::new(Dimensions::new(1, 1, 1)));
        let cfg = Config::default();
        let alloc = DynamicAllocator::new(&cfg);
        let placement = alloc.place(&request(), &ctx(&registry, &topology, &cfg)).unwrap();
        assert!(matches!(placement, Placement::WillRun { est_start: 1_700_001_000 }));
    }

    #[test]
    fn second_small_block_coexists_with_a_running_sibling_on_the_same_midplane() {
        // spec.md §8 scenario 4 / invariant 3(b): a midplane already hosting
        // a running 32-node small block on ionode 0 must still accept a
        // second, disjoint 32-node small block rather than being treated as
        // wholly unavailable.
        let registry = Registry::new();
        let mut resident_bits = crate::block::IonodeBitmap::new(8);
        resident_bits.set(0);
        registry.insert(Block {
            id: "RMP000-S000".into(),
            nodes: vec![Coord::new(0, 0, 0)],
            ionodes: Some(resident_bits),
            geometry: (1, 1, 1),
            start: Coord::new(0, 0, 0),
            conn_type: ConnType::Small,
            node_cnt: 32,
            cpu_cnt: 128,
            images: Images::default(),
            state: BlockState::Busy,
            boot_state: BootState::Idle,
            boot_count: 0,
            job_running: JobRunning::Job(1),
            user_name: None,
            target_name: None,
            modifying: false,
            full_block: false,
        });
        let topology = Mutex::new(Topology::new(Dimensions::new(1, 1, 1)));
        let cfg = Config::default();
        let alloc = DynamicAllocator::new(&cfg);
        let req = NormalizedRequest {
            node_count: 32,
            max_cpus: 128,
            conn_type: ConnType::Small,
            geometry_hint: (1, 1, 1),
            rotate: false,
            reboot: false,
            images: Images::default(),
        };
        let placement = alloc.place(&req, &ctx(&registry, &topology, &cfg)).unwrap();
        match placement {
            Placement::New { block, evict } => {
                assert!(evict.is_empty());
                assert_eq!(block.nodes, vec![Coord::new(0, 0, 0)]);
                let bits = block.ionodes.expect("small block must carry an ionode bitmap");
                assert!(!bits.is_set(0), "must not reuse the resident sibling's ionode");
                assert!(bits.is_set(1));
            }
            other => panic!("expected New on the same midplane, got {other:?}"),
        }
    }
}

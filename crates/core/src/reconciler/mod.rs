//! The startup reconciler (C5): before any RPC is accepted, match every
//! configured block against what the hardware controller actually has,
//! adopt or discard whatever the controller knows that the configuration
//! doesn't, and drain anything the controller reports as `error`.
//! See spec.md §4.4.

use crate::block::{Block, BlockState, BootState, ConnType, JobRunning};
use crate::bridge::{ControllerBlock, ControllerBridge};
use crate::config::{Config, LayoutMode};
use crate::error::Result;
use crate::registry::{ListFilter, Registry};

/// Tallies one reconciliation pass, for the startup log line.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub matched: u32,
    pub adopted: u32,
    pub deleted: u32,
    pub errored: u32,
}

/// Runs the startup reconciliation procedure once against `registry`.
pub fn run(bridge: &dyn ControllerBridge, registry: &Registry, cfg: &Config) -> Result<ReconcileReport> {
    let mut orphans: Vec<ControllerBlock> = bridge.get_bg()?;
    let mut report = ReconcileReport::default();

    let configured_list = registry.list(ListFilter::Main);
    let mut matched_ids = std::collections::HashSet::new();
    for configured in &configured_list {
        let Some(pos) = orphans.iter().position(|live| matches(configured, live, cfg.legacy_small_blocks))
        else {
            continue;
        };
        let live = orphans.remove(pos);
        matched_ids.insert(configured.id.clone());
        adopt_identity(registry, &configured.id, live, &mut report);
    }

    // The full-system block is rescued even without a pass-1 match, so it
    // is never needlessly torn down and recreated.
    if let Some(full) = configured_list.iter().find(|b| b.full_block && !matched_ids.contains(&b.id)) {
        if let Some(pos) = orphans.iter().position(|live| live.nodes.len() == full.nodes.len()) {
            let live = orphans.remove(pos);
            adopt_identity(registry, &full.id, live, &mut report);
        }
    }

    for live in orphans {
        let is_error = live.state == BlockState::Error;
        if cfg.layout_mode == LayoutMode::Dynamic {
            let block = from_controller(live, cfg);
            registry.insert(block);
            report.adopted += 1;
        } else {
            bridge.remove_block(&live.id)?;
            report.deleted += 1;
        }
        if is_error {
            report.errored += 1;
        }
    }

    Ok(report)
}

/// True if `live` is the hardware counterpart of `configured`: same
/// midplane set, same ionode bitmap, same connection type, and (outside
/// legacy hardware) matching boot images.
fn matches(configured: &Block, live: &ControllerBlock, legacy: bool) -> bool {
    if configured.nodes.len() != live.nodes.len()
        || !configured.nodes.iter().all(|n| live.nodes.contains(n))
        || configured.conn_type != live.conn_type
    {
        return false;
    }
    if configured.ionodes != live.ionodes {
        return false;
    }
    legacy || configured.images == live.images
}

/// Renames `configured_id` to the live block's id and, if the controller
/// reports it down, drops it into the local `BLOCK_ERROR` pseudo-state.
fn adopt_identity(registry: &Registry, configured_id: &str, live: ControllerBlock, report: &mut ReconcileReport) {
    let is_error = live.state == BlockState::Error;
    if live.id != configured_id {
        if registry.rename(configured_id, live.id.clone()).is_err() {
            return;
        }
    }
    if is_error {
        registry.mutate(&live.id, |b| {
            b.job_running = JobRunning::BlockError;
            b.state = BlockState::Error;
        });
        report.errored += 1;
    }
    report.matched += 1;
}

/// Builds a registry record for a block the controller knows about but the
/// configuration doesn't — only reachable under the `dynamic` layout.
fn from_controller(live: ControllerBlock, cfg: &Config) -> Block {
    let node_cnt = live.nodes.len() as u32 * cfg.bp_node_cnt;
    let node_cnt = match &live.ionodes {
        Some(bits) if live.conn_type.is_small() => {
            (bits.popcount() * cfg.bp_node_cnt) / cfg.ionodes_per_midplane().max(1)
        }
        _ => node_cnt,
    };
    Block {
        id: live.id,
        nodes: live.nodes,
        ionodes: live.ionodes,
        geometry: (1, 1, 1),
        start: crate::common::Coord::new(0, 0, 0),
        conn_type: live.conn_type,
        node_cnt,
        cpu_cnt: node_cnt * cfg.cpus_per_node,
        images: live.images,
        state: live.state,
        boot_state: BootState::Idle,
        boot_count: 0,
        job_running: JobRunning::None,
        user_name: None,
        target_name: None,
        modifying: false,
        full_block: false,
    }
}

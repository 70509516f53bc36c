//! Turns the `BPs=` lines of a parsed [`Config`] into the initial set of
//! configured [`Block`] records the reconciler matches against the
//! hardware controller at startup (spec.md §4.4, §6).
//!
//! Static and overlap layouts have no other source of blocks: every block
//! that will ever exist under those layouts is named here. Dynamic layout
//! also calls this (a machine can mix a few pinned blocks with on-demand
//! carving), but treats the reconciler's orphan-adoption path as its main
//! source of blocks.

use crate::block::{Block, BlockState, BootState, ConnType, IonodeBitmap, JobRunning};
use crate::common::Coord;
use crate::config::{Config, StaticBlockSpec};
use crate::error::{CoreError, Result};
use crate::topology::ValidSmallRanges;

/// Parses a `BPs=Nodes=<lower>x<upper>` range into every midplane
/// coordinate it spans, inclusive on both ends.
fn parse_nodes_range(range: &str) -> Result<Vec<Coord>> {
    let (lo, hi) = range
        .split_once('x')
        .or_else(|| range.split_once('X'))
        .ok_or_else(|| CoreError::ConfigInvalid(format!("malformed Nodes range: '{range}'")))?;
    let lo = Coord::parse(lo)
        .ok_or_else(|| CoreError::ConfigInvalid(format!("bad coordinate '{lo}' in Nodes range")))?;
    let hi = Coord::parse(hi)
        .ok_or_else(|| CoreError::ConfigInvalid(format!("bad coordinate '{hi}' in Nodes range")))?;
    if lo.x > hi.x || lo.y > hi.y || lo.z > hi.z {
        return Err(CoreError::ConfigInvalid(format!("Nodes range '{range}' is not lower<=upper")));
    }
    let mut coords = Vec::new();
    for x in lo.x..=hi.x {
        for y in lo.y..=hi.y {
            for z in lo.z..=hi.z {
                coords.push(Coord::new(x, y, z));
            }
        }
    }
    Ok(coords)
}

/// Builds the full-midplane block for one `BPs=` line.
fn full_block(idx: usize, nodes: Vec<Coord>, spec: &StaticBlockSpec, cfg: &Config) -> Block {
    let node_cnt = nodes.len() as u32 * cfg.bp_node_cnt;
    Block {
        id: format!("CFG-{idx:03}"),
        nodes,
        ionodes: None,
        geometry: (1, 1, 1),
        start: Coord::new(0, 0, 0),
        conn_type: spec.conn_type,
        node_cnt,
        cpu_cnt: node_cnt * cfg.cpus_per_node,
        images: cfg.default_images.clone(),
        state: BlockState::Free,
        boot_state: BootState::Idle,
        boot_count: 0,
        job_running: JobRunning::None,
        user_name: None,
        target_name: None,
        modifying: false,
        full_block: nodes_cover_machine(spec, cfg),
    }
}

fn nodes_cover_machine(spec: &StaticBlockSpec, cfg: &Config) -> bool {
    spec.nodes_range
        .split_once('x')
        .or_else(|| spec.nodes_range.split_once('X'))
        .and_then(|(lo, hi)| Coord::parse(lo).zip(Coord::parse(hi)))
        .is_some_and(|(lo, hi)| {
            lo == Coord::new(0, 0, 0)
                && hi.x + 1 == cfg.dims.x
                && hi.y + 1 == cfg.dims.y
                && hi.z + 1 == cfg.dims.z
        })
}

/// Builds the small (sub-midplane) blocks declared by a `BPs=` line's
/// `<size>CNBlockCnt=N` fields, carved out of the first midplane in
/// `nodes` (a small-block declaration is only meaningful for a
/// single-midplane `BPs=` line).
fn small_blocks(idx: usize, nodes: &[Coord], spec: &StaticBlockSpec, cfg: &Config) -> Result<Vec<Block>> {
    if spec.small_block_cnt.is_empty() {
        return Ok(Vec::new());
    }
    let Some(&midplane) = nodes.first() else { return Ok(Vec::new()) };
    let ranges = ValidSmallRanges::build(
        cfg.smallest_block_size(),
        cfg.bp_node_cnt,
        cfg.ionodes_per_midplane(),
        cfg.legacy_small_blocks,
    );
    let mut out = Vec::new();
    let mut used = IonodeBitmap::new(cfg.ionodes_per_midplane());
    let mut n = 0usize;
    for (&size, &count) in &spec.small_block_cnt {
        let mut available = ranges.ranges_at_least(size).into_iter().filter(|r| r.size == size);
        for _ in 0..count {
            let Some(range) = available.find(|r| {
                let candidate = ranges.bitmap_for(r);
                !candidate.intersects(&used)
            }) else {
                return Err(CoreError::ConfigInvalid(format!(
                    "not enough ionode capacity for {size}CNBlockCnt on {}",
                    spec.nodes_range
                )));
            };
            let bitmap = ranges.bitmap_for(range);
            for i in 0..bitmap.len() {
                if bitmap.is_set(i) {
                    used.set(i);
                }
            }
            out.push(Block {
                id: format!("CFG-{idx:03}-S{n:03}"),
                nodes: vec![midplane],
                ionodes: Some(bitmap),
                geometry: (1, 1, 1),
                start: midplane,
                conn_type: ConnType::Small,
                node_cnt: size,
                cpu_cnt: size * cfg.cpus_per_node,
                images: cfg.default_images.clone(),
                state: BlockState::Free,
                boot_state: BootState::Idle,
                boot_count: 0,
                job_running: JobRunning::None,
                user_name: None,
                target_name: None,
                modifying: false,
                full_block: false,
            });
            n += 1;
        }
    }
    Ok(out)
}

/// Materializes every `BPs=` line in `cfg` into `Block` records, in
/// configuration order (the reconciler's tie-break when more than one
/// configured block could match the same live one).
pub fn materialize_static_blocks(cfg: &Config) -> Result<Vec<Block>> {
    let mut blocks = Vec::new();
    for (idx, spec) in cfg.static_blocks.iter().enumerate() {
        let nodes = parse_nodes_range(&spec.nodes_range)?;
        if spec.small_block_cnt.is_empty() {
            blocks.push(full_block(idx, nodes, spec, cfg));
        } else {
            blocks.extend(small_blocks(idx, &nodes, spec, cfg)?);
        }
    }
    Ok(blocks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LayoutMode;

    fn cfg_with(bps: &str) -> Config {
        Config::parse(&format!("LayoutMode=static\nDimensions=2x2x2\n{bps}")).unwrap()
    }

    #[test]
    fn full_block_spans_the_declared_range() {
        let cfg = cfg_with("BPs=Nodes=000x111 Type=torus\n");
        let blocks = materialize_static_blocks(&cfg).unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].nodes.len(), 8);
        assert!(blocks[0].full_block);
        assert_eq!(cfg.layout_mode, LayoutMode::Static);
    }

    #[test]
    fn single_midplane_range_is_not_full_block() {
        let cfg = cfg_with("BPs=Nodes=000x000 Type=mesh\n");
        let blocks = materialize_static_blocks(&cfg).unwrap();
        assert_eq!(blocks[0].nodes, vec![Coord::new(0, 0, 0)]);
        assert!(!blocks[0].full_block);
    }

    #[test]
    fn small_block_declarations_carve_disjoint_ionode_ranges() {
        let cfg = cfg_with("BPs=Nodes=000x000 Type=torus 32CNBlockCnt=2\n");
        let blocks = materialize_static_blocks(&cfg).unwrap();
        assert_eq!(blocks.len(), 2);
        assert!(blocks.iter().all(|b| b.conn_type == ConnType::Small));
        let a = blocks[0].ionodes.as_ref().unwrap();
        let b = blocks[1].ionodes.as_ref().unwrap();
        assert!(!a.intersects(b));
    }

    #[test]
    fn bad_range_is_config_invalid() {
        let cfg = cfg_with("BPs=Nodes=111x000 Type=torus\n");
        let err = materialize_static_blocks(&cfg).unwrap_err();
        assert!(matches!(err, CoreError::ConfigInvalid(_)));
    }
}

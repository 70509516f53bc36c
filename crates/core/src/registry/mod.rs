//! The block registry (C3): the process-wide mapping from block id to block
//! record, plus the `main`/`booted`/`job_running`/`freeing` derived index
//! views, all guarded by one mutex.
//!
//! Per spec.md §4.2, no public operation here blocks while the mutex is
//! held. The two operations that must straddle a controller-bridge call
//! (`free_block`, `boot_block`) live in the lifecycle engine: they drop the
//! guard returned here, make the call, then re-acquire and re-validate via
//! [`Registry::find`] before touching the record again — the record may
//! have been removed from `main` while the bridge call was in flight.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::block::{Block, BlockState, IonodeBitmap, JobRunning};
use crate::common::Coord;
use crate::error::{CoreError, Result};

/// Which derived view [`Registry::list`] should return.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ListFilter {
    /// Every configured block.
    Main,
    /// Blocks whose state is `ready` or `configuring`.
    Booted,
    /// Blocks with a positive `job_running`.
    JobRunning,
    /// Blocks currently in `deallocating`.
    Freeing,
}

struct Inner {
    blocks: HashMap<String, Block>,
}

/// The registry. Cheap to clone a handle to (it's an `Arc` internally via
/// the caller holding a `&Registry` for the `Engine`'s lifetime); here it
/// simply owns its mutex directly since it is constructed once per process.
pub struct Registry {
    inner: Mutex<Inner>,
}

impl Registry {
    pub fn new() -> Self {
        Self { inner: Mutex::new(Inner { blocks: HashMap::new() }) }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn insert(&self, block: Block) {
        let mut inner = self.lock();
        inner.blocks.insert(block.id.clone(), block);
    }

    pub fn remove(&self, id: &str) -> Option<Block> {
        let mut inner = self.lock();
        inner.blocks.remove(id)
    }

    pub fn find(&self, id: &str) -> Option<Block> {
        let inner = self.lock();
        inner.blocks.get(id).cloned()
    }

    /// True iff `id` is still present in `main` — the re-validation check
    /// named in spec.md §4.2.
    pub fn still_resident(&self, id: &str) -> bool {
        self.lock().blocks.contains_key(id)
    }

    /// Finds a configured block with exactly this midplane set and (if
    /// small) ionode bitmap, used by the reconciler to match live blocks.
    pub fn find_by_geometry(&self, nodes: &[Coord], ionodes: Option<&IonodeBitmap>) -> Option<Block> {
        let inner = self.lock();
        inner
            .blocks
            .values()
            .find(|b| {
                b.nodes.len() == nodes.len()
                    && nodes.iter().all(|n| b.nodes.contains(n))
                    && match (&b.ionodes, ionodes) {
                        (Some(a), Some(want)) => a == want,
                        (None, None) => true,
                        _ => false,
                    }
            })
            .cloned()
    }

    /// Renames a block's key (e.g. a dynamic block's placeholder id being
    /// replaced by the controller's real id once it acks creation).
    pub fn rename(&self, old_id: &str, new_id: String) -> Result<()> {
        let mut inner = self.lock();
        let mut block = inner
            .blocks
            .remove(old_id)
            .ok_or_else(|| CoreError::BlockVanished(old_id.to_string()))?;
        block.id = new_id.clone();
        inner.blocks.insert(new_id, block);
        Ok(())
    }

    /// Applies `f` to the block named `id` under the mutex, returning its
    /// result, or `None` if the block is no longer resident.
    pub fn mutate<F, R>(&self, id: &str, f: F) -> Option<R>
    where
        F: FnOnce(&mut Block) -> R,
    {
        let mut inner = self.lock();
        inner.blocks.get_mut(id).map(f)
    }

    /// Every block overlapping `block`, excluding `block` itself.
    pub fn overlapping(&self, block: &Block) -> Vec<Block> {
        let inner = self.lock();
        inner
            .blocks
            .values()
            .filter(|b| b.id != block.id && b.overlaps(block))
            .cloned()
            .collect()
    }

    /// Ascending by `node_cnt`, then by id, per spec.md §4.2's sort rule.
    pub fn list(&self, filter: ListFilter) -> Vec<Block> {
        let inner = self.lock();
        let mut out: Vec<Block> = inner
            .blocks
            .values()
            .filter(|b| match filter {
                ListFilter::Main => true,
                ListFilter::Booted => matches!(b.state, BlockState::Ready | BlockState::Configuring),
                ListFilter::JobRunning => b.job_running.is_running(),
                ListFilter::Freeing => b.state == BlockState::Deallocating,
            })
            .cloned()
            .collect();
        out.sort_by(|a, b| a.node_cnt.cmp(&b.node_cnt).then_with(|| a.id.cmp(&b.id)));
        out
    }

    /// Invariant 4: the total `cpu_cnt` across running blocks plus the
    /// unused count equals `total_cpus`. Returns the current running sum.
    pub fn running_cpu_total(&self) -> u32 {
        let inner = self.lock();
        inner.blocks.values().filter(|b| b.job_running.is_running()).map(|b| b.cpu_cnt).sum()
    }

    /// Drains every block touching `midplane`: forces `job_running` to
    /// `BlockError` and `state` to `Error`, returning their ids so the
    /// caller can fail the corresponding jobs (spec.md §4.7, scenario 6).
    pub fn drain_midplane(&self, midplane: Coord) -> Vec<String> {
        let mut inner = self.lock();
        let mut affected = Vec::new();
        for b in inner.blocks.values_mut() {
            if b.nodes.contains(&midplane) {
                b.job_running = JobRunning::BlockError;
                b.state = BlockState::Error;
                affected.push(b.id.clone());
            }
        }
        affected
    }

    /// Drains blocks whose small-block ionode bitmap intersects the range
    /// owned by a failed nodecard on `midplane`.
    pub fn drain_nodecard(&self, midplane: Coord, ionodes: &IonodeBitmap) -> Vec<String> {
        let mut inner = self.lock();
        let mut affected = Vec::new();
        for b in inner.blocks.values_mut() {
            if !b.nodes.contains(&midplane) {
                continue;
            }
            let touches = match &b.ionodes {
                Some(bits) => bits.intersects(ionodes),
                None => true,
            };
            if touches {
                b.job_running = JobRunning::BlockError;
                b.state = BlockState::Error;
                affected.push(b.id.clone());
            }
        }
        affected
    }

    /// Reverses a drain once the MMCS poller reports a midplane (or the
    /// nodecard owning `ionodes`, if given) back `up`. The job that was
    /// running there is gone regardless (it was already failed when the
    /// drain happened) — this only clears the block back to `free` so it
    /// can be reused, it does not resurrect `job_running`.
    pub fn resume_nodecard(&self, midplane: Coord, ionodes: Option<&IonodeBitmap>) -> Vec<String> {
        let mut inner = self.lock();
        let mut affected = Vec::new();
        for b in inner.blocks.values_mut() {
            if b.state != BlockState::Error || !b.nodes.contains(&midplane) {
                continue;
            }
            let touches = match (&b.ionodes, ionodes) {
                (Some(bits), Some(want)) => bits.intersects(want),
                _ => true,
            };
            if touches {
                b.job_running = JobRunning::None;
                b.state = BlockState::Free;
                affected.push(b.id.clone());
            }
        }
        affected
    }

    pub fn len(&self) -> usize {
        self.lock().blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().blocks.is_empty()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{ConnType, Images};

    fn block(id: &str, nodes: Vec<Coord>, job: JobRunning) -> Block {
        Block {
            id: id.into(),
            nodes,
            ionodes: None,
            geometry: (1, 1, 1),
            start: Coord::new(0, 0, 0),
            conn_type: ConnType::Torus,
            node_cnt: 512,
            cpu_cnt: 2048,
            images: Images::default(),
            state: BlockState::Free,
            boot_state: crate::block::BootState::Idle,
            boot_count: 0,
            job_running: job,
            user_name: None,
            target_name: None,
            modifying: false,
            full_block: false,
        }
    }

    #[test]
    fn insert_then_find_roundtrips() {
        let r = Registry::new();
        r.insert(block("A", vec![Coord::new(0, 0, 0)], JobRunning::None));
        assert!(r.find("A").is_some());
        assert!(r.find("B").is_none());
    }

    #[test]
    fn list_sorts_by_node_cnt_then_id() {
        let r = Registry::new();
        let mut big = block("B", vec![Coord::new(1, 0, 0)], JobRunning::None);
        big.node_cnt = 1024;
        let small = block("A", vec![Coord::new(0, 0, 0)], JobRunning::None);
        r.insert(big);
        r.insert(small);
        let listed = r.list(ListFilter::Main);
        assert_eq!(listed[0].id, "A");
        assert_eq!(listed[1].id, "B");
    }

    #[test]
    fn drain_midplane_marks_block_error() {
        let r = Registry::new();
        r.insert(block("A", vec![Coord::new(0, 0, 0)], JobRunning::Job(7)));
        let affected = r.drain_midplane(Coord::new(0, 0, 0));
        assert_eq!(affected, vec!["A".to_string()]);
        let b = r.find("A").unwrap();
        assert_eq!(b.job_running, JobRunning::BlockError);
        assert_eq!(b.state, BlockState::Error);
    }

    #[test]
    fn rename_moves_the_key() {
        let r = Registry::new();
        r.insert(block("PENDING-1", vec![Coord::new(0, 0, 0)], JobRunning::None));
        r.rename("PENDING-1", "RMP000".to_string()).unwrap();
        assert!(r.find("PENDING-1").is_none());
        assert_eq!(r.find("RMP000").unwrap().id, "RMP000");
    }

    #[test]
    fn resume_nodecard_clears_a_drained_block_back_to_free() {
        let r = Registry::new();
        r.insert(block("A", vec![Coord::new(0, 0, 0)], JobRunning::Job(7)));
        r.drain_midplane(Coord::new(0, 0, 0));
        let resumed = r.resume_nodecard(Coord::new(0, 0, 0), None);
        assert_eq!(resumed, vec!["A".to_string()]);
        let b = r.find("A").unwrap();
        assert_eq!(b.state, BlockState::Free);
        assert_eq!(b.job_running, JobRunning::None);
    }

    #[test]
    fn still_resident_reflects_removal() {
        let r = Registry::new();
        r.insert(block("A", vec![Coord::new(0, 0, 0)], JobRunning::None));
        assert!(r.still_resident("A"));
        r.remove("A");
        assert!(!r.still_resident("A"));
    }
}

//! The health poller (C8): two background threads that watch the
//! controller for state the block-management core did not itself cause —
//! a boot that finished or failed, a midplane or nodecard going down or
//! coming back — and fold it into the registry. See spec.md §4.7.
//!
//! Mirrors the teacher's background-thread-plus-channel shape
//! (`crates/hardware/src/soc/devices/uart.rs`'s stdin reader thread), but
//! uses the channel as a cancellable sleep (`recv_timeout`) rather than a
//! data pipe: each poller blocks on its own stop channel for one poll
//! period, waking early only when `HealthPoller::shutdown` sends on it.

use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::block::{Block, BlockState, BootState, JobRunning};
use crate::bridge::{ControllerBridge, HardwareStatus};
use crate::common::constants::{BLOCK_POLL_INTERVAL_SECS, MMCS_POLL_INTERVAL_SECS};
use crate::common::Coord;
use crate::error::job_reason;
use crate::lifecycle::JobEffects;
use crate::registry::{ListFilter, Registry};

fn now() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map_or(0, |d| d.as_secs() as i64)
}

struct Poll {
    registry: Arc<Registry>,
    bridge: Arc<dyn ControllerBridge>,
    effects: Arc<dyn JobEffects>,
}

/// Owns the two poller threads; dropping without calling [`shutdown`] would
/// leak them, so `shutdown` consumes `self` and joins both.
///
/// [`shutdown`]: HealthPoller::shutdown
pub struct HealthPoller {
    block_stop: Sender<()>,
    mmcs_stop: Sender<()>,
    threads: Vec<JoinHandle<()>>,
}

impl HealthPoller {
    pub fn start(
        registry: Arc<Registry>,
        bridge: Arc<dyn ControllerBridge>,
        effects: Arc<dyn JobEffects>,
    ) -> Self {
        let (block_stop, block_stop_rx) = mpsc::channel();
        let (mmcs_stop, mmcs_stop_rx) = mpsc::channel();

        let block_poll =
            Poll { registry: Arc::clone(&registry), bridge: Arc::clone(&bridge), effects: Arc::clone(&effects) };
        let block_thread = thread::spawn(move || block_poll_loop(&block_poll, &block_stop_rx));

        let mmcs_poll = Poll { registry, bridge, effects };
        let mmcs_thread = thread::spawn(move || mmcs_poll_loop(&mmcs_poll, &mmcs_stop_rx));

        Self { block_stop, mmcs_stop, threads: vec![block_thread, mmcs_thread] }
    }

    /// Signals both pollers and waits for them to exit their current loop
    /// iteration.
    pub fn shutdown(mut self) {
        let _ = self.block_stop.send(());
        let _ = self.mmcs_stop.send(());
        for t in self.threads.drain(..) {
            let _ = t.join();
        }
    }
}

/// True if `recv_timeout` says to keep polling: timed out with no stop
/// signal. A disconnected sender is treated the same as an explicit stop.
fn should_continue(stop: &Receiver<()>, period: Duration) -> bool {
    matches!(stop.recv_timeout(period), Err(mpsc::RecvTimeoutError::Timeout))
}

fn block_poll_loop(poll: &Poll, stop: &Receiver<()>) {
    loop {
        for configured in poll.registry.list(ListFilter::Booted) {
            match poll.bridge.get_block(&configured.id) {
                Ok(Some(live)) => apply_block_observation(poll, &configured, live.state),
                Ok(None) => mark_vanished(poll, &configured),
                Err(e) => {
                    tracing::warn!(block_id = %configured.id, error = %e, "block poll failed");
                }
            }
        }
        if !should_continue(stop, Duration::from_secs(BLOCK_POLL_INTERVAL_SECS)) {
            return;
        }
    }
}

fn mmcs_poll_loop(poll: &Poll, stop: &Receiver<()>) {
    loop {
        match poll.bridge.get_hardware_status() {
            Ok(statuses) => {
                for status in statuses {
                    apply_hardware_status(poll, &status);
                }
            }
            Err(e) => tracing::warn!(error = %e, "MMCS poll failed"),
        }
        if !should_continue(stop, Duration::from_secs(MMCS_POLL_INTERVAL_SECS)) {
            return;
        }
    }
}

/// Folds one `get_block` observation into the registry. A transition the
/// state machine doesn't allow (spec.md §4.6) is logged and otherwise
/// ignored rather than forced through — a desynced controller report is a
/// bug to investigate, not license to corrupt local state.
fn apply_block_observation(poll: &Poll, configured: &Block, observed: BlockState) {
    if observed == configured.state {
        return;
    }
    if !configured.state.can_transition_to(observed) {
        tracing::warn!(
            block_id = %configured.id,
            from = ?configured.state,
            to = ?observed,
            "ignoring controller-observed transition the state machine forbids"
        );
        return;
    }

    poll.registry.mutate(&configured.id, |b| {
        b.state = observed;
        b.boot_state = match observed {
            BlockState::Ready => BootState::Idle,
            BlockState::Error => BootState::Failed,
            _ => b.boot_state,
        };
    });

    if observed == BlockState::Error {
        if let Some(job_id) = configured.job_running.job_id() {
            poll.effects.fail(job_id, job_reason(&format!("block {} failed to boot", configured.id), now()));
        }
        poll.registry.mutate(&configured.id, |b| b.job_running = JobRunning::BlockError);
    }
}

/// The controller no longer knows about a block this registry still
/// considers booted — treated the same as a boot-time error.
fn mark_vanished(poll: &Poll, configured: &Block) {
    if let Some(job_id) = configured.job_running.job_id() {
        poll.effects.fail(job_id, job_reason(&format!("block {} disappeared from the controller", configured.id), now()));
    }
    poll.registry.mutate(&configured.id, |b| {
        b.state = BlockState::Error;
        b.job_running = JobRunning::BlockError;
    });
}

fn jobs_running_on(registry: &Registry, midplane: Coord) -> HashMap<String, u32> {
    registry
        .list(ListFilter::Main)
        .into_iter()
        .filter(|b| b.nodes.contains(&midplane))
        .filter_map(|b| b.job_running.job_id().map(|j| (b.id, j)))
        .collect()
}

fn fail_drained(poll: &Poll, affected: &[String], prior_jobs: &HashMap<String, u32>, reason: &str) {
    let ts = now();
    for id in affected {
        if let Some(&job_id) = prior_jobs.get(id) {
            poll.effects.fail(job_id, job_reason(&format!("{reason} ({id})"), ts));
        }
    }
}

/// One midplane's worth of `get_hardware_status`: drains whatever is down,
/// resumes whatever the controller now reports `up` again (spec.md §8
/// scenario 6).
fn apply_hardware_status(poll: &Poll, status: &HardwareStatus) {
    let prior_jobs = jobs_running_on(&poll.registry, status.midplane);

    if status.midplane_up {
        let resumed = poll.registry.resume_nodecard(status.midplane, None);
        if !resumed.is_empty() {
            tracing::info!(midplane = ?status.midplane, blocks = ?resumed, "midplane back up, cleared drained blocks");
        }
    } else {
        let affected = poll.registry.drain_midplane(status.midplane);
        fail_drained(poll, &affected, &prior_jobs, "MMCS switch not UP");
    }

    for nodecard in &status.down_nodecards {
        let affected = poll.registry.drain_nodecard(status.midplane, nodecard);
        fail_drained(poll, &affected, &prior_jobs, "nodecard down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{ConnType, Images, IonodeBitmap};
    use crate::bridge::{BlockCreateSpec, ControllerBlock, ModifyField, Signal};
    use crate::error::Result;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration as StdDuration;

    #[derive(Default)]
    struct RecordingEffects {
        failed: StdMutex<Vec<(u32, String)>>,
    }

    impl JobEffects for RecordingEffects {
        fn requeue(&self, _job_id: u32) {}
        fn fail(&self, job_id: u32, reason: String) {
            self.failed.lock().unwrap().push((job_id, reason));
        }
    }

    /// A bridge whose `get_block`/`get_hardware_status` answers can be
    /// rewritten mid-test.
    struct ScriptedBridge {
        block_states: StdMutex<HashMap<String, BlockState>>,
        hardware: StdMutex<Vec<HardwareStatus>>,
    }

    impl ScriptedBridge {
        fn new() -> Self {
            Self { block_states: StdMutex::new(HashMap::new()), hardware: StdMutex::new(Vec::new()) }
        }

        fn set_block_state(&self, id: &str, state: Option<BlockState>) {
            let mut map = self.block_states.lock().unwrap();
            match state {
                Some(s) => {
                    map.insert(id.to_string(), s);
                }
                None => {
                    map.remove(id);
                }
            }
        }

        fn set_hardware(&self, statuses: Vec<HardwareStatus>) {
            *self.hardware.lock().unwrap() = statuses;
        }
    }

    impl ControllerBridge for ScriptedBridge {
        fn get_bg(&self) -> Result<Vec<ControllerBlock>> {
            Ok(Vec::new())
        }
        fn get_block(&self, id: &str) -> Result<Option<ControllerBlock>> {
            Ok(self.block_states.lock().unwrap().get(id).map(|&state| ControllerBlock {
                id: id.to_string(),
                nodes: vec![Coord::new(0, 0, 0)],
                ionodes: None,
                conn_type: ConnType::Torus,
                images: Images::default(),
                state,
            }))
        }
        fn get_hardware_status(&self) -> Result<Vec<HardwareStatus>> {
            Ok(self.hardware.lock().unwrap().clone())
        }
        fn create_block(&self, _spec: &BlockCreateSpec) -> Result<String> {
            Ok("RMP999".to_string())
        }
        fn destroy_block(&self, _id: &str) -> Result<()> {
            Ok(())
        }
        fn remove_block(&self, _id: &str) -> Result<()> {
            Ok(())
        }
        fn modify_block(&self, _id: &str, _field: ModifyField, _value: &str) -> Result<()> {
            Ok(())
        }
        fn set_block_owner(&self, _id: &str, _user: &str) -> Result<()> {
            Ok(())
        }
        fn remove_block_user(&self, _id: &str, _user: &str) -> Result<()> {
            Ok(())
        }
        fn signal_job(&self, _job_id: u32, _signal: Signal) -> Result<()> {
            Ok(())
        }
    }

    fn configuring_block(id: &str) -> Block {
        Block {
            id: id.into(),
            nodes: vec![Coord::new(0, 0, 0)],
            ionodes: None,
            geometry: (1, 1, 1),
            start: Coord::new(0, 0, 0),
            conn_type: ConnType::Torus,
            node_cnt: 512,
            cpu_cnt: 2048,
            images: Images::default(),
            state: BlockState::Configuring,
            boot_state: BootState::Booting,
            boot_count: 1,
            job_running: JobRunning::None,
            user_name: None,
            target_name: None,
            modifying: false,
            full_block: false,
        }
    }

    fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            thread::sleep(StdDuration::from_millis(10));
        }
        panic!("condition never became true");
    }

    #[test]
    fn block_poller_applies_configuring_to_ready() {
        let registry = Arc::new(Registry::new());
        registry.insert(configuring_block("RMP000"));
        let bridge = Arc::new(ScriptedBridge::new());
        bridge.set_block_state("RMP000", Some(BlockState::Ready));
        let effects = Arc::new(RecordingEffects::default());

        let poller = HealthPoller::start(Arc::clone(&registry), bridge, effects);
        wait_until(|| registry.find("RMP000").unwrap().state == BlockState::Ready);
        assert_eq!(registry.find("RMP000").unwrap().boot_state, BootState::Idle);
        poller.shutdown();
    }

    #[test]
    fn block_poller_fails_the_job_when_boot_errors() {
        let registry = Arc::new(Registry::new());
        let mut block = configuring_block("RMP000");
        block.job_running = JobRunning::Job(11);
        registry.insert(block);
        let bridge = Arc::new(ScriptedBridge::new());
        bridge.set_block_state("RMP000", Some(BlockState::Error));
        let effects = Arc::new(RecordingEffects::default());

        let poller = HealthPoller::start(Arc::clone(&registry), bridge, Arc::clone(&effects));
        wait_until(|| !effects.failed.lock().unwrap().is_empty());
        assert_eq!(effects.failed.lock().unwrap()[0].0, 11);
        assert_eq!(registry.find("RMP000").unwrap().job_running, JobRunning::BlockError);
        poller.shutdown();
    }

    #[test]
    fn block_poller_errors_a_block_the_controller_forgot() {
        let registry = Arc::new(Registry::new());
        registry.insert(configuring_block("RMP000"));
        let bridge = Arc::new(ScriptedBridge::new());
        let effects = Arc::new(RecordingEffects::default());

        let poller = HealthPoller::start(Arc::clone(&registry), bridge, effects);
        wait_until(|| registry.find("RMP000").unwrap().state == BlockState::Error);
        poller.shutdown();
    }

    #[test]
    fn mmcs_poller_drains_and_then_resumes_a_midplane() {
        let registry = Arc::new(Registry::new());
        let mut block = configuring_block("RMP000");
        block.state = BlockState::Busy;
        block.job_running = JobRunning::Job(5);
        registry.insert(block);
        let bridge = Arc::new(ScriptedBridge::new());
        bridge.set_hardware(vec![HardwareStatus {
            midplane: Coord::new(0, 0, 0),
            midplane_up: false,
            down_nodecards: Vec::new(),
        }]);
        let effects = Arc::new(RecordingEffects::default());

        let poller = HealthPoller::start(Arc::clone(&registry), Arc::clone(&bridge), Arc::clone(&effects));
        wait_until(|| registry.find("RMP000").unwrap().state == BlockState::Error);
        assert_eq!(effects.failed.lock().unwrap()[0].0, 5);
        poller.shutdown();

        bridge.set_hardware(vec![HardwareStatus {
            midplane: Coord::new(0, 0, 0),
            midplane_up: true,
            down_nodecards: Vec::new(),
        }]);
        let poller = HealthPoller::start(Arc::clone(&registry), bridge, effects);
        wait_until(|| registry.find("RMP000").unwrap().state == BlockState::Free);
        poller.shutdown();
    }

    #[test]
    fn mmcs_poller_drains_a_single_nodecard_without_touching_the_rest() {
        let registry = Arc::new(Registry::new());
        let mut untouched = configuring_block("RMP001");
        untouched.state = BlockState::Busy;
        untouched.conn_type = ConnType::Small;
        untouched.ionodes = Some(IonodeBitmap::with_range(8, 4, 2));
        registry.insert(untouched);

        let mut touched = configuring_block("RMP000");
        touched.state = BlockState::Busy;
        touched.conn_type = ConnType::Small;
        touched.ionodes = Some(IonodeBitmap::with_range(8, 0, 2));
        registry.insert(touched);

        let bridge = Arc::new(ScriptedBridge::new());
        bridge.set_hardware(vec![HardwareStatus {
            midplane: Coord::new(0, 0, 0),
            midplane_up: true,
            down_nodecards: vec![IonodeBitmap::with_range(8, 0, 2)],
        }]);
        let effects = Arc::new(RecordingEffects::default());

        let poller = HealthPoller::start(Arc::clone(&registry), bridge, effects);
        wait_until(|| registry.find("RMP000").unwrap().state == BlockState::Error);
        assert_eq!(registry.find("RMP001").unwrap().state, BlockState::Busy);
        poller.shutdown();
    }
}

//! The job bridge (C9): the thin adapter an RPC layer calls into. Exposes
//! exactly the five operations spec.md §4.8 names — nothing else, per
//! spec.md §1's exclusion of the RPC transport itself.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::allocator::{normalize, Allocator, AllocatorContext, Placement, Request};
use crate::block::{BlockState, Images};
use crate::config::Config;
use crate::error::{CoreError, Result};
use crate::lifecycle::{Action, JobBinding, JobSpec, LifecycleEngine};
use crate::registry::Registry;
use crate::topology::Topology;

/// A job as the bridge sees it: just enough to place, start, and later
/// identify it. Accounting, priority, and step launch are out of scope
/// (spec.md §1).
#[derive(Clone, Debug)]
pub struct Job {
    pub id: u32,
    pub user: String,
    pub images: Option<Images>,
}

/// `submit_job`'s `mode` parameter: `TestOnly` evaluates placement but
/// commits nothing, for a scheduler's "would this fit" probe.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubmitMode {
    Normal,
    TestOnly,
}

/// `submit_job`'s `(block_id, est_start, err)` return, named per field
/// rather than as a bare tuple.
#[derive(Clone, Debug, Default)]
pub struct SubmitOutcome {
    pub block_id: Option<String>,
    pub est_start: Option<i64>,
    pub error: Option<CoreError>,
}

/// `job_ready`'s three-way answer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobReadyState {
    NotReady,
    Ready,
    Error,
}

/// The five-operation surface of spec.md §4.8. Holds the job→block
/// mapping `job_ready`/`term_job` need — the allocator and lifecycle
/// engine both work in terms of block ids, not job ids, so the bridge is
/// the one place that remembers which job owns which block.
pub struct JobBridge {
    registry: Arc<Registry>,
    topology: Arc<Mutex<Topology>>,
    config: Config,
    allocator: Arc<dyn Allocator>,
    lifecycle: Arc<LifecycleEngine>,
    job_end_time: Arc<dyn Fn(u32) -> i64 + Send + Sync>,
    now: Arc<dyn Fn() -> i64 + Send + Sync>,
    pending: Mutex<HashMap<u32, String>>,
}

impl JobBridge {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<Registry>,
        topology: Arc<Mutex<Topology>>,
        config: Config,
        allocator: Arc<dyn Allocator>,
        lifecycle: Arc<LifecycleEngine>,
        job_end_time: Arc<dyn Fn(u32) -> i64 + Send + Sync>,
        now: Arc<dyn Fn() -> i64 + Send + Sync>,
    ) -> Self {
        Self {
            registry,
            topology,
            config,
            allocator,
            lifecycle,
            job_end_time,
            now,
            pending: Mutex::new(HashMap::new()),
        }
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<u32, String>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// `submit_job(job, bitmap, min, max, req, mode)`: the bitmap/min/max
    /// geometry negotiation named in spec.md §4.8 is the RPC layer's job
    /// (out of scope per spec.md §1); by the time it reaches here it has
    /// already been folded into `request`.
    pub fn submit_job(&self, job: &Job, request: &Request, mode: SubmitMode) -> SubmitOutcome {
        let normalized = normalize(request, &self.config);
        let now = (self.now)();
        let ctx = AllocatorContext {
            registry: &self.registry,
            topology: &self.topology,
            config: &self.config,
            job_end_time: self.job_end_time.as_ref(),
            now,
        };

        let placement = match self.allocator.place(&normalized, &ctx) {
            Ok(p) => p,
            Err(e) => return SubmitOutcome { block_id: None, est_start: None, error: Some(e) },
        };

        match placement {
            Placement::Existing(block_id) => {
                if mode == SubmitMode::Normal {
                    self.pending().insert(job.id, block_id.clone());
                }
                SubmitOutcome { block_id: Some(block_id), est_start: Some(now), error: None }
            }
            Placement::New { block, evict } => {
                let block_id = block.id.clone();
                if mode == SubmitMode::Normal {
                    for victim in evict {
                        self.lifecycle.enqueue(victim, Action::Destroy);
                    }
                    self.registry.insert(block);
                    self.pending().insert(job.id, block_id.clone());
                }
                SubmitOutcome { block_id: Some(block_id), est_start: Some(now), error: None }
            }
            Placement::WillRun { est_start } => {
                SubmitOutcome { block_id: None, est_start: Some(est_start), error: Some(CoreError::ResourcesBusy) }
            }
            Placement::Impossible => {
                SubmitOutcome { block_id: None, est_start: None, error: Some(CoreError::GeometryImpossible) }
            }
        }
    }

    /// `start_job(job)`: enqueues a `start` action and returns immediately
    /// — the block reaching `ready` is observed later via `job_ready`.
    pub fn start_job(&self, job: &Job) -> Result<()> {
        let block_id = self
            .pending()
            .get(&job.id)
            .cloned()
            .ok_or_else(|| CoreError::BlockVanished(format!("job {} has no submitted block", job.id)))?;
        let spec = JobSpec { id: job.id, user: job.user.clone(), images: job.images.clone() };
        self.lifecycle.enqueue(block_id, Action::StartJob { job: spec });
        Ok(())
    }

    /// `job_ready(job) -> {not_ready, ready, error}`.
    pub fn job_ready(&self, job_id: u32) -> JobReadyState {
        let Some(block_id) = self.pending().get(&job_id).cloned() else {
            return JobReadyState::NotReady;
        };
        match self.registry.find(&block_id) {
            Some(b) if matches!(b.state, BlockState::Ready | BlockState::Busy) => JobReadyState::Ready,
            Some(b) if b.state == BlockState::Error => JobReadyState::Error,
            _ => JobReadyState::NotReady,
        }
    }

    /// `term_job(job)`: enqueues a `terminate` action (free users on the
    /// block, tear down ionodes if small).
    pub fn term_job(&self, job_id: u32) {
        if let Some(block_id) = self.pending().remove(&job_id) {
            self.lifecycle.enqueue(block_id, Action::TermJob { job_id });
        }
    }

    /// `sync_jobs(joblist)`: startup-only, per spec.md §4.6. `bindings` is
    /// whatever the (out-of-scope) accounting system reports as currently
    /// running; every job here is recorded so later `job_ready`/`term_job`
    /// calls resolve, and every binding is handed to the lifecycle engine
    /// to rebind, with unreferenced blocks destroyed as orphans.
    pub fn sync_jobs(&self, bindings: Vec<(Job, String)>) {
        let mut ticket_bindings = Vec::with_capacity(bindings.len());
        {
            let mut pending = self.pending();
            for (job, block_id) in bindings {
                pending.insert(job.id, block_id.clone());
                ticket_bindings.push(JobBinding {
                    job: JobSpec { id: job.id, user: job.user, images: job.images },
                    block_id,
                });
            }
        }
        self.lifecycle.sync_jobs(&ticket_bindings);
    }
}

//! Partition/block management core for a torus-connected HPC scheduler.
//!
//! Nine components, each owning one piece of spec.md's design: the 3-D
//! midplane grid (`topology`), the block record (`block`), the process-wide
//! registry (`registry`), checkpoint persistence (`persistence`), the
//! startup reconciler (`reconciler`), the three placement strategies
//! (`allocator`), the lifecycle engine (`lifecycle`), the health poller
//! (`health`), and the job-bridge RPC surface (`job_bridge`). [`Engine`]
//! wires all nine together into the one aggregate a caller constructs.

pub mod allocator;
pub mod block;
pub mod bootstrap;
pub mod bridge;
pub mod common;
pub mod config;
pub mod error;
pub mod health;
pub mod job_bridge;
pub mod lifecycle;
pub mod persistence;
pub mod reconciler;
pub mod registry;
pub mod topology;

use std::sync::{Arc, Mutex};

use allocator::{Allocator, DynamicAllocator, OverlapAllocator, StaticAllocator};
use bridge::ControllerBridge;
use config::{Config, LayoutMode};
use error::Result;
use health::HealthPoller;
use job_bridge::JobBridge;
use lifecycle::{JobEffects, LifecycleEngine};
use registry::Registry;
use reconciler::ReconcileReport;
use topology::Topology;

/// Lifecycle worker count used when the caller has no stronger opinion.
/// [`LifecycleEngine::start`] clamps this to `MAX_WORKERS` regardless.
const DEFAULT_LIFECYCLE_WORKERS: usize = 8;

/// The fully-wired core: one `Engine` per process, built once at startup
/// and handed to whatever RPC transport the caller provides (out of scope
/// here per spec.md §1).
///
/// Construction runs the startup reconciler (C5) before returning, so by
/// the time an `Engine` exists the registry already reflects what the
/// controller actually has — no RPC should be accepted before this point.
pub struct Engine {
    config: Config,
    registry: Arc<Registry>,
    topology: Arc<Mutex<Topology>>,
    bridge: Arc<dyn ControllerBridge>,
    allocator: Arc<dyn Allocator>,
    lifecycle: Arc<LifecycleEngine>,
    health: Option<HealthPoller>,
    job_bridge: JobBridge,
}

impl Engine {
    /// Builds every component, materializes the configured static/overlap
    /// blocks (`bootstrap`), runs the reconciler once against `bridge`, then
    /// starts the lifecycle workers and the two health-poller threads.
    ///
    /// `job_end_time`/`now` are the allocator/job-bridge's only windows onto
    /// job accounting, which this crate does not itself track (spec.md §1).
    pub fn start(
        config: Config,
        bridge: Arc<dyn ControllerBridge>,
        effects: Arc<dyn JobEffects>,
        job_end_time: Arc<dyn Fn(u32) -> i64 + Send + Sync>,
        now: Arc<dyn Fn() -> i64 + Send + Sync>,
    ) -> Result<(Self, ReconcileReport)> {
        let registry = Arc::new(Registry::new());
        for block in bootstrap::materialize_static_blocks(&config)? {
            registry.insert(block);
        }

        let report = reconciler::run(bridge.as_ref(), &registry, &config)?;

        let topology = Arc::new(Mutex::new(Topology::new(config.dims)));
        let allocator: Arc<dyn Allocator> = match config.layout_mode {
            LayoutMode::Static => Arc::new(StaticAllocator::new()),
            LayoutMode::Overlap => Arc::new(OverlapAllocator::new()),
            LayoutMode::Dynamic => Arc::new(DynamicAllocator::new(&config)),
        };

        let lifecycle = Arc::new(LifecycleEngine::start(
            Arc::clone(&registry),
            Arc::clone(&bridge),
            config.clone(),
            Arc::clone(&effects),
            DEFAULT_LIFECYCLE_WORKERS,
        ));

        let health = HealthPoller::start(Arc::clone(&registry), Arc::clone(&bridge), effects);

        let job_bridge = JobBridge::new(
            Arc::clone(&registry),
            Arc::clone(&topology),
            config.clone(),
            Arc::clone(&allocator),
            Arc::clone(&lifecycle),
            job_end_time,
            now,
        );

        Ok((
            Self {
                config,
                registry,
                topology,
                bridge,
                allocator,
                lifecycle,
                health: Some(health),
                job_bridge,
            },
            report,
        ))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn topology(&self) -> &Mutex<Topology> {
        &self.topology
    }

    pub fn job_bridge(&self) -> &JobBridge {
        &self.job_bridge
    }

    /// Re-runs the startup reconciliation procedure against the live
    /// controller, for an operator-triggered resync (spec.md §4.4 does not
    /// restrict this to startup, only to running before the first RPC).
    pub fn reconcile(&self) -> Result<ReconcileReport> {
        reconciler::run(self.bridge.as_ref(), &self.registry, &self.config)
    }

    /// Stops the health poller and lifecycle workers in turn. Blocks until
    /// both have joined; queued-but-not-started lifecycle actions are
    /// dropped, per `LifecycleEngine::shutdown`'s drain-then-exit contract.
    pub fn shutdown(self) {
        let Self { lifecycle, mut health, job_bridge, .. } = self;
        if let Some(health) = health.take() {
            health.shutdown();
        }
        drop(job_bridge);
        match Arc::try_unwrap(lifecycle) {
            Ok(engine) => engine.shutdown(),
            Err(shared) => {
                tracing::warn!("lifecycle engine still has outstanding handles at shutdown");
                drop(shared);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge::EmulatedBridge;

    struct NoopEffects;
    impl JobEffects for NoopEffects {
        fn requeue(&self, _job_id: u32) {}
        fn fail(&self, _job_id: u32, _reason: String) {}
    }

    #[test]
    fn start_reconciles_an_empty_controller_cleanly() {
        let config = Config::parse("LayoutMode=static\nDimensions=2x2x2\nBPs=Nodes=000x111 Type=torus\n")
            .unwrap();
        let bridge: Arc<dyn ControllerBridge> = Arc::new(EmulatedBridge::new());
        let (engine, report) = Engine::start(
            config,
            bridge,
            Arc::new(NoopEffects),
            Arc::new(|_job_id: u32| 0_i64),
            Arc::new(|| 1_000_i64),
        )
        .unwrap();

        assert_eq!(report.matched, 0);
        assert_eq!(engine.registry().list(registry::ListFilter::Main).len(), 1);

        engine.shutdown();
    }
}

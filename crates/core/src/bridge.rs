//! The hardware-controller bridge (out of scope per spec.md §1, consumed
//! here only through this trait): `create_block`, `destroy_block`,
//! `remove_block`, `modify_block`, `set_block_owner`, `remove_block_user`,
//! `signal_job`, and the `get_*` enumerators the reconciler and health
//! poller use.

use crate::block::{BlockState, ConnType, Images, IonodeBitmap};
use crate::common::Coord;
use crate::error::Result;

/// A signal the job bridge can ask the controller to deliver.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Signal {
    Term,
    Kill,
}

/// Which block field `modify_block` rewrites.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModifyField {
    Mloader,
    Cnload,
    Ioload,
    Blrts,
}

/// What `create_block` is asked to build.
#[derive(Clone, Debug)]
pub struct BlockCreateSpec {
    pub nodes: Vec<Coord>,
    pub ionodes: Option<IonodeBitmap>,
    pub conn_type: ConnType,
    pub images: Images,
}

/// The controller's view of one block, as returned by `get_bg`/`get_blocks`.
#[derive(Clone, Debug)]
pub struct ControllerBlock {
    pub id: String,
    pub nodes: Vec<Coord>,
    pub ionodes: Option<IonodeBitmap>,
    pub conn_type: ConnType,
    pub images: Images,
    pub state: BlockState,
}

/// Non-`up` hardware observed by the MMCS poller.
#[derive(Clone, Debug)]
pub struct HardwareStatus {
    pub midplane: Coord,
    pub midplane_up: bool,
    pub down_nodecards: Vec<IonodeBitmap>,
}

/// The external interface this core consumes; production code is backed
/// by the real bridge library (out of scope here), tests and emulated
/// systems by [`EmulatedBridge`].
pub trait ControllerBridge: Send + Sync {
    /// Every block currently known to the controller.
    fn get_bg(&self) -> Result<Vec<ControllerBlock>>;

    /// One block by id, or `None` if the controller has never heard of it.
    fn get_block(&self, id: &str) -> Result<Option<ControllerBlock>>;

    /// Current hardware status for every configured midplane.
    fn get_hardware_status(&self) -> Result<Vec<HardwareStatus>>;

    /// Requests the controller create a block; blocks until it acks or
    /// fails. Returns the controller-assigned id.
    fn create_block(&self, spec: &BlockCreateSpec) -> Result<String>;

    /// Frees the block's current job/owner without removing it from the
    /// controller's inventory.
    fn destroy_block(&self, id: &str) -> Result<()>;

    /// Removes the block from the controller's inventory entirely.
    fn remove_block(&self, id: &str) -> Result<()>;

    /// Rewrites one boot-image field on an existing block.
    fn modify_block(&self, id: &str, field: ModifyField, value: &str) -> Result<()>;

    /// Changes the OS-visible owner of a booted block.
    fn set_block_owner(&self, id: &str, user: &str) -> Result<()>;

    /// Removes one user from a block without changing its current owner.
    fn remove_block_user(&self, id: &str, user: &str) -> Result<()>;

    /// Delivers a signal to the process running a job.
    fn signal_job(&self, job_id: u32, signal: Signal) -> Result<()>;
}

/// A fully in-process implementation of [`ControllerBridge`], for emulated
/// systems (no real hardware attached) and for tests. Every call succeeds
/// immediately; `create_block` assigns ids from a monotone counter.
pub mod emulated {
    use super::{BlockCreateSpec, ControllerBlock, ControllerBridge, HardwareStatus, ModifyField, Signal};
    use crate::error::Result;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// In-memory stand-in controller; see [`super::ControllerBridge`].
    pub struct EmulatedBridge {
        next_id: AtomicU32,
        blocks: Mutex<Vec<ControllerBlock>>,
    }

    impl EmulatedBridge {
        pub fn new() -> Self {
            Self { next_id: AtomicU32::new(0), blocks: Mutex::new(Vec::new()) }
        }

        fn lock(&self) -> std::sync::MutexGuard<'_, Vec<ControllerBlock>> {
            self.blocks.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
        }
    }

    impl Default for EmulatedBridge {
        fn default() -> Self {
            Self::new()
        }
    }

    impl ControllerBridge for EmulatedBridge {
        fn get_bg(&self) -> Result<Vec<ControllerBlock>> {
            Ok(self.lock().clone())
        }

        fn get_block(&self, id: &str) -> Result<Option<ControllerBlock>> {
            Ok(self.lock().iter().find(|b| b.id == id).cloned())
        }

        fn get_hardware_status(&self) -> Result<Vec<HardwareStatus>> {
            Ok(Vec::new())
        }

        fn create_block(&self, spec: &BlockCreateSpec) -> Result<String> {
            let id = format!("RMP{:03}", self.next_id.fetch_add(1, Ordering::SeqCst));
            self.lock().push(ControllerBlock {
                id: id.clone(),
                nodes: spec.nodes.clone(),
                ionodes: spec.ionodes.clone(),
                conn_type: spec.conn_type,
                images: spec.images.clone(),
                state: crate::block::BlockState::Ready,
            });
            Ok(id)
        }

        fn destroy_block(&self, _id: &str) -> Result<()> {
            Ok(())
        }

        fn remove_block(&self, id: &str) -> Result<()> {
            self.lock().retain(|b| b.id != id);
            Ok(())
        }

        fn modify_block(&self, id: &str, field: ModifyField, value: &str) -> Result<()> {
            let mut blocks = self.lock();
            if let Some(b) = blocks.iter_mut().find(|b| b.id == id) {
                match field {
                    ModifyField::Mloader => b.images.mloader = value.to_string(),
                    ModifyField::Cnload => b.images.cnload = value.to_string(),
                    ModifyField::Ioload => b.images.ioload = value.to_string(),
                    ModifyField::Blrts => b.images.blrts = value.to_string(),
                }
            }
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
}

pub use emulated::EmulatedBridge;

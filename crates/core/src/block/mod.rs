//! The block record (C2): the value type describing one allocated rectangle
//! of midplanes, or a sub-midplane "small block" within one.

use std::collections::BTreeSet;

use crate::common::{constants, Coord};

/// Connection type a block was booted with.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ConnType {
    Mesh,
    Torus,
    Small,
    HtcS,
    HtcD,
    HtcV,
    HtcL,
    /// Unspecified / "any" — used only in requests, never on a committed block.
    Nav,
}

impl ConnType {
    /// Tie-break ordering used by rectangle search: torus before mesh before small.
    pub fn search_rank(self) -> u8 {
        match self {
            Self::Torus => 0,
            Self::Mesh => 1,
            Self::Small => 2,
            Self::HtcS | Self::HtcD | Self::HtcV | Self::HtcL => 3,
            Self::Nav => 4,
        }
    }

    pub fn is_small(self) -> bool {
        matches!(self, Self::Small | Self::HtcS | Self::HtcD | Self::HtcV | Self::HtcL)
    }
}

/// Lifecycle state of a block, per the state machine in spec.md §4.6.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum BlockState {
    Free,
    Configuring,
    Ready,
    Deallocating,
    Error,
    Rebooting,
    Busy,
}

impl BlockState {
    /// Whether `to` is a legal direct transition from `self`, per the diagram
    /// in spec.md §4.6. Transitions not shown there are forbidden.
    pub fn can_transition_to(self, to: Self) -> bool {
        use BlockState::{Busy, Configuring, Deallocating, Error, Free, Ready, Rebooting};
        matches!(
            (self, to),
            (Free, Configuring)
                | (Configuring, Ready)
                | (Configuring, Error)
                | (Ready, Deallocating)
                | (Ready, Rebooting)
                | (Ready, Busy)
                | (Busy, Ready)
                | (Busy, Deallocating)
                | (Rebooting, Free)
                | (Rebooting, Error)
                | (Deallocating, Free)
                | (Deallocating, Error)
                | (Free, Error)
                | (Error, Free)
        )
    }
}

/// `boot_state` field: idle, in flight, or failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum BootState {
    Idle,
    Booting,
    Failed,
}

/// Current vs. desired owning job for a block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum JobRunning {
    /// A positive job id is running on this block.
    Job(u32),
    /// No job is running.
    None,
    /// The block's hardware is in an error state.
    BlockError,
    /// An administrator forced the block into an error state.
    AdminError,
}

impl JobRunning {
    pub fn as_i64(self) -> i64 {
        match self {
            Self::Job(id) => i64::from(id),
            Self::None => constants::NO_JOB,
            Self::BlockError => constants::BLOCK_ERROR,
            Self::AdminError => constants::ADMIN_ERROR,
        }
    }

    pub fn from_i64(v: i64) -> Self {
        match v {
            constants::NO_JOB => Self::None,
            constants::BLOCK_ERROR => Self::BlockError,
            constants::ADMIN_ERROR => Self::AdminError,
            v if v > 0 => Self::Job(v as u32),
            _ => Self::None,
        }
    }

    pub fn job_id(self) -> Option<u32> {
        match self {
            Self::Job(id) => Some(id),
            _ => None,
        }
    }

    pub fn is_running(self) -> bool {
        matches!(self, Self::Job(_))
    }
}

/// The four boot image names a block is configured with.
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Images {
    pub mloader: String,
    /// `CnloadImage` on current hardware, `LinuxImage` under the legacy name.
    pub cnload: String,
    /// `IoloadImage` on current hardware, `RamDiskImage` under the legacy name.
    pub ioload: String,
    /// Legacy BLRTS image; empty on non-legacy hardware.
    pub blrts: String,
}

/// A bitmap of ionodes owned by a small block, fixed at the configured
/// per-midplane ionode count.
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct IonodeBitmap {
    bits: BTreeSet<u32>,
    len: u32,
}

impl IonodeBitmap {
    pub fn new(len: u32) -> Self {
        Self { bits: BTreeSet::new(), len }
    }

    pub fn with_range(len: u32, start: u32, count: u32) -> Self {
        let mut b = Self::new(len);
        for i in start..start + count {
            b.bits.insert(i);
        }
        b
    }

    pub fn set(&mut self, i: u32) {
        if i < self.len {
            self.bits.insert(i);
        }
    }

    pub fn is_set(&self, i: u32) -> bool {
        self.bits.contains(&i)
    }

    pub fn popcount(&self) -> u32 {
        self.bits.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    pub fn intersects(&self, other: &Self) -> bool {
        self.bits.intersection(&other.bits).next().is_some()
    }

    pub fn len(&self) -> u32 {
        self.len
    }
}

/// A single allocated (or configured) block. See spec.md §3 for field
/// semantics; invariants 1–6 there are enforced by the registry, not here.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct Block {
    /// Opaque id assigned by the hardware controller (empty until acked for
    /// a freshly synthesized dynamic block).
    pub id: String,
    /// Ordered midplane coordinates making up this block.
    pub nodes: Vec<Coord>,
    /// Owned ionodes, only meaningful when `conn_type.is_small()`.
    pub ionodes: Option<IonodeBitmap>,
    pub geometry: (u16, u16, u16),
    pub start: Coord,
    pub conn_type: ConnType,
    pub node_cnt: u32,
    pub cpu_cnt: u32,
    pub images: Images,
    pub state: BlockState,
    pub boot_state: BootState,
    pub boot_count: u32,
    pub job_running: JobRunning,
    pub user_name: Option<String>,
    pub target_name: Option<String>,
    pub modifying: bool,
    pub full_block: bool,
}

impl Block {
    /// True iff this block's midplane set and (if small) ionode bitmap
    /// overlap `other`'s.
    pub fn overlaps(&self, other: &Block) -> bool {
        let shared_midplanes: Vec<Coord> =
            self.nodes.iter().copied().filter(|c| other.nodes.contains(c)).collect();
        if shared_midplanes.is_empty() {
            return false;
        }
        match (&self.ionodes, &other.ionodes) {
            (Some(a), Some(b)) if self.nodes.len() == 1 && other.nodes.len() == 1 => a.intersects(b),
            _ => true,
        }
    }

    /// Invariant 5: a small block is strictly smaller than a midplane and
    /// has a nonempty ionode set; a non-small block has no ionode bitmap
    /// and a node count that is a whole multiple of `nodes_per_midplane`.
    pub fn satisfies_size_invariant(&self, nodes_per_midplane: u32) -> bool {
        if self.conn_type.is_small() {
            self.node_cnt < nodes_per_midplane
                && self.ionodes.as_ref().is_some_and(|b| !b.is_empty())
        } else {
            self.ionodes.is_none() && self.node_cnt % nodes_per_midplane == 0
        }
    }
}

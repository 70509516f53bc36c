//! The 3-D midplane grid (C1): per-midplane axis switches, reservation, and
//! rectangle/path search.

use crate::block::ConnType;
use crate::common::{Coord, Dimensions};
use crate::error::{CoreError, Result};

use super::switch::{AxisSwitch, PORT_LOCAL_IN, PORT_LOCAL_OUT, PORT_MINUS_IN, PORT_MINUS_OUT, PORT_PLUS_IN, PORT_PLUS_OUT};

/// Axis excluded from pass-through routing by `DenyPassthrough`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DenyPass {
    None,
    X,
    Y,
    Z,
    All,
}

impl DenyPass {
    fn denies(self, dim: usize) -> bool {
        matches!(
            (self, dim),
            (Self::All, _) | (Self::X, 0) | (Self::Y, 1) | (Self::Z, 2)
        )
    }
}

struct MidplaneState {
    used: bool,
    switches: [AxisSwitch; 3],
}

/// A rectangle of midplanes found by [`Topology::find_rectangle`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rectangle {
    pub start: Coord,
    pub geometry: (u16, u16, u16),
}

impl Rectangle {
    pub fn midplane_count(&self) -> u32 {
        u32::from(self.geometry.0) * u32::from(self.geometry.1) * u32::from(self.geometry.2)
    }

    /// Every coordinate in the rectangle, ascending `(x, y, z)`.
    pub fn coords(&self) -> Vec<Coord> {
        let mut out = Vec::with_capacity(self.midplane_count() as usize);
        for dx in 0..self.geometry.0 {
            for dy in 0..self.geometry.1 {
                for dz in 0..self.geometry.2 {
                    out.push(self.start.offset(dx, dy, dz));
                }
            }
        }
        out
    }
}

/// The full machine's midplane grid.
pub struct Topology {
    dims: Dimensions,
    midplanes: Vec<MidplaneState>,
}

impl Topology {
    /// Builds a fresh, all-unused grid of the configured dimensions, wiring
    /// each midplane's three axis switches from the permutation of
    /// neighbors implied by the torus cabling.
    pub fn new(dims: Dimensions) -> Self {
        let mut midplanes = Vec::with_capacity(dims.total_midplanes() as usize);
        for c in dims.iter() {
            let switches = [
                AxisSwitch::new(0, c, dims.x),
                AxisSwitch::new(1, c, dims.y),
                AxisSwitch::new(2, c, dims.z),
            ];
            midplanes.push(MidplaneState { used: false, switches });
        }
        Self { dims, midplanes }
    }

    pub fn dims(&self) -> Dimensions {
        self.dims
    }

    fn index(&self, c: Coord) -> usize {
        (u32::from(c.x) * u32::from(self.dims.y) * u32::from(self.dims.z)
            + u32::from(c.y) * u32::from(self.dims.z)
            + u32::from(c.z)) as usize
    }

    /// Marks every midplane and every switch internal wire unused.
    pub fn reset(&mut self) {
        for mp in &mut self.midplanes {
            mp.used = false;
            for sw in &mut mp.switches {
                sw.reset();
            }
        }
    }

    pub fn is_used(&self, c: Coord) -> bool {
        self.midplanes[self.index(c)].used
    }

    /// Attempts to mark `nodes` used with the requested connection type.
    ///
    /// Fails with [`CoreError::GeometryConflict`] if any midplane in `nodes`
    /// is already used, [`CoreError::WiringConflict`] if no switch path
    /// through the requested dimensions exists, or
    /// [`CoreError::PassthroughDenied`] if the set requires passing through
    /// a midplane excluded by `deny_pass`. On success every traversed
    /// switch records the path.
    pub fn reserve(&mut self, nodes: &[Coord], conn_type: ConnType, deny_pass: DenyPass) -> Result<()> {
        let passthrough_points = self.check_geometry(nodes, conn_type, deny_pass)?;
        self.commit(nodes, &passthrough_points)
    }

    /// Releases `nodes`' own switches back to unused. Pass-through hops a
    /// torus reservation borrowed on a neighboring midplane are not
    /// individually tracked on the block record, so they are not released
    /// here; a full `reset` is needed to clear those.
    pub fn release(&mut self, nodes: &[Coord]) {
        for &c in nodes {
            let idx = self.index(c);
            self.midplanes[idx].used = false;
            for sw in &mut self.midplanes[idx].switches {
                sw.reset();
            }
        }
    }

    /// Read-only version of [`Topology::reserve`]'s checks, used by the
    /// overlap allocator to prove a configured block is simultaneously
    /// wireable with whatever is currently reserved, without mutating state.
    pub fn can_reserve(&self, nodes: &[Coord], conn_type: ConnType, deny_pass: DenyPass) -> bool {
        self.check_geometry(nodes, conn_type, deny_pass).is_ok()
    }

    /// Validates `nodes` against current usage and, for `Torus`, against
    /// pass-through availability, returning the pass-through midplanes the
    /// caller must also reserve. Mutates nothing.
    fn check_geometry(
        &self,
        nodes: &[Coord],
        conn_type: ConnType,
        deny_pass: DenyPass,
    ) -> Result<Vec<(usize, Coord)>> {
        for &c in nodes {
            if self.midplanes[self.index(c)].used {
                return Err(CoreError::GeometryConflict);
            }
        }

        let bbox = bounding_box(nodes).ok_or(CoreError::GeometryConflict)?;
        let mut passthrough_points: Vec<(usize, Coord)> = Vec::new();
        if conn_type == ConnType::Torus {
            for dim in 0..3 {
                let extent = self.dims.axis(dim);
                let geom = bbox.geometry_axis(dim);
                if geom < extent {
                    let before = self.neighbor_along(bbox.start, dim, -1);
                    let after = self.neighbor_along(bbox.end_inclusive(dim), dim, 1);
                    for p in [before, after] {
                        if deny_pass.denies(dim) && !nodes.contains(&p) {
                            return Err(CoreError::PassthroughDenied);
                        }
                        if !nodes.contains(&p) {
                            if self.midplanes[self.index(p)].used {
                                return Err(CoreError::WiringConflict);
                            }
                            passthrough_points.push((dim, p));
                        }
                    }
                }
            }
        }
        Ok(passthrough_points)
    }

    /// Marks the ports and midplanes `check_geometry` validated as used.
    fn commit(&mut self, nodes: &[Coord], passthrough_points: &[(usize, Coord)]) -> Result<()> {
        // Reserve the local tap plus both axis directions on every midplane
        // actually in the block, for every dimension it spans.
        for &c in nodes {
            let idx = self.index(c);
            for dim in 0..3 {
                let ok = self.midplanes[idx].switches[dim]
                    .reserve_ports(&[PORT_LOCAL_IN, PORT_LOCAL_OUT, PORT_MINUS_IN, PORT_MINUS_OUT, PORT_PLUS_IN, PORT_PLUS_OUT]);
                if !ok {
                    return Err(CoreError::WiringConflict);
                }
            }
        }
        for (dim, p) in &passthrough_points {
            let idx = self.index(*p);
            let ok = self.midplanes[idx].switches[*dim]
                .reserve_ports(&[PORT_MINUS_IN, PORT_MINUS_OUT, PORT_PLUS_IN, PORT_PLUS_OUT]);
            if !ok {
                return Err(CoreError::WiringConflict);
            }
        }

        for &c in nodes {
            self.midplanes[self.index(c)].used = true;
        }
        Ok(())
    }

    fn neighbor_along(&self, c: Coord, dim: usize, dir: i32) -> Coord {
        let extent = i32::from(self.dims.axis(dim));
        let cur = i32::from(c.axis(dim));
        let next = ((cur + dir).rem_euclid(extent.max(1))) as u16;
        match dim {
            0 => Coord::new(next, c.y, c.z),
            1 => Coord::new(c.x, next, c.z),
            2 => Coord::new(c.x, c.y, next),
            _ => unreachable!(),
        }
    }

    /// Searches for a rectangle of midplanes in `[min, max]` whose aspect
    /// matches `geometry_hint`, possibly under any axis permutation if
    /// `rotate`. Ties break smaller-first, then lexicographic lower corner.
    pub fn find_rectangle(
        &self,
        min: u32,
        max: u32,
        geometry_hint: (u16, u16, u16),
        rotate: bool,
    ) -> Option<Rectangle> {
        self.find_rectangle_avoiding(min, max, geometry_hint, rotate, |c| self.is_used(c))
    }

    fn find_rectangle_avoiding(
        &self,
        min: u32,
        max: u32,
        geometry_hint: (u16, u16, u16),
        rotate: bool,
        avoid: impl Fn(Coord) -> bool,
    ) -> Option<Rectangle> {
        let candidates = if rotate { permutations(geometry_hint) } else { vec![geometry_hint] };
        let mut best: Option<Rectangle> = None;
        for start in self.dims.iter() {
            for &geom in &candidates {
                if geom.0 == 0 || geom.1 == 0 || geom.2 == 0 {
                    continue;
                }
                if start.x as u32 + u32::from(geom.0) > u32::from(self.dims.x)
                    || start.y as u32 + u32::from(geom.1) > u32::from(self.dims.y)
                    || start.z as u32 + u32::from(geom.2) > u32::from(self.dims.z)
                {
                    continue;
                }
                let rect = Rectangle { start, geometry: geom };
                let count = rect.midplane_count();
                if count < min || count > max {
                    continue;
                }
                if rect.coords().iter().any(|c| avoid(*c)) {
                    continue;
                }
                best = Some(match best {
                    None => rect,
                    Some(cur) => pick_better(cur, rect, geometry_hint),
                });
            }
        }
        best
    }

    /// As [`Topology::find_rectangle`], but ignores `is_used` and instead
    /// avoids only the midplanes in `busy` — used by the dynamic allocator
    /// to find a rectangle among blocks that are merely configured (not
    /// currently running a job), so their host blocks can be evicted rather
    /// than treated as permanently unavailable.
    pub fn find_rectangle_ignoring_wiring(
        &self,
        min: u32,
        max: u32,
        geometry_hint: (u16, u16, u16),
        rotate: bool,
        busy: &[Coord],
    ) -> Option<Rectangle> {
        self.find_rectangle_avoiding(min, max, geometry_hint, rotate, |c| busy.contains(&c))
    }

    /// Ordered switch ports a signal traverses from `start` to `target`
    /// along `dim`, via the external wire table; empty if no path (e.g.
    /// the axis switch's neighbor does not lead toward `target`).
    pub fn path(&self, start: Coord, target: Coord, dim: usize) -> Vec<usize> {
        if start == target {
            return Vec::new();
        }
        let extent = i32::from(self.dims.axis(dim));
        if extent == 0 {
            return Vec::new();
        }
        let mut ports = Vec::new();
        let mut cur = start;
        let mut guard = 0u32;
        while cur != target && guard <= extent as u32 {
            let idx = self.index(cur);
            let sw = &self.midplanes[idx].switches[dim];
            let plus_dist = (i32::from(target.axis(dim)) - i32::from(cur.axis(dim))).rem_euclid(extent);
            let (port, next) = if plus_dist <= extent - plus_dist {
                (PORT_PLUS_OUT, sw.neighbor(PORT_PLUS_OUT))
            } else {
                (PORT_MINUS_OUT, sw.neighbor(PORT_MINUS_OUT))
            };
            let Some(next) = next else { return Vec::new() };
            ports.push(port);
            cur = next;
            guard += 1;
        }
        if cur == target {
            ports
        } else {
            Vec::new()
        }
    }
}

struct BBox {
    start: Coord,
    geometry: (u16, u16, u16),
}

impl BBox {
    fn geometry_axis(&self, dim: usize) -> u16 {
        match dim {
            0 => self.geometry.0,
            1 => self.geometry.1,
            _ => self.geometry.2,
        }
    }

    fn end_inclusive(&self, dim: usize) -> Coord {
        let g = self.geometry_axis(dim);
        self.start.offset(
            if dim == 0 { g.saturating_sub(1) } else { 0 },
            if dim == 1 { g.saturating_sub(1) } else { 0 },
            if dim == 2 { g.saturating_sub(1) } else { 0 },
        )
    }
}

fn bounding_box(nodes: &[Coord]) -> Option<BBox> {
    let first = *nodes.first()?;
    let (mut xmin, mut ymin, mut zmin) = (first.x, first.y, first.z);
    let (mut xmax, mut ymax, mut zmax) = (first.x, first.y, first.z);
    for c in nodes {
        xmin = xmin.min(c.x);
        ymin = ymin.min(c.y);
        zmin = zmin.min(c.z);
        xmax = xmax.max(c.x);
        ymax = ymax.max(c.y);
        zmax = zmax.max(c.z);
    }
    Some(BBox {
        start: Coord::new(xmin, ymin, zmin),
        geometry: (xmax - xmin + 1, ymax - ymin + 1, zmax - zmin + 1),
    })
}

fn permutations(g: (u16, u16, u16)) -> Vec<(u16, u16, u16)> {
    let (a, b, c) = g;
    let mut perms = vec![(a, b, c), (a, c, b), (b, a, c), (b, c, a), (c, a, b), (c, b, a)];
    perms.sort();
    perms.dedup();
    perms
}

/// Tie-break: smaller total first, then lexicographic lower corner, then
/// geometry closer to the request (sum of absolute differences).
fn pick_better(a: Rectangle, b: Rectangle, hint: (u16, u16, u16)) -> Rectangle {
    let ca = a.midplane_count();
    let cb = b.midplane_count();
    if ca != cb {
        return if ca < cb { a } else { b };
    }
    if a.start != b.start {
        return if a.start < b.start { a } else { b };
    }
    if geom_distance(a.geometry, hint) <= geom_distance(b.geometry, hint) {
        a
    } else {
        b
    }
}

fn geom_distance(g: (u16, u16, u16), hint: (u16, u16, u16)) -> u32 {
    u32::from(g.0.abs_diff(hint.0)) + u32::from(g.1.abs_diff(hint.1)) + u32::from(g.2.abs_diff(hint.2))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_clears_every_midplane_and_switch() {
        let mut t = Topology::new(Dimensions::new(2, 2, 2));
        t.reserve(&[Coord::new(0, 0, 0)], ConnType::Mesh, DenyPass::None).unwrap();
        t.reset();
        assert!(!t.is_used(Coord::new(0, 0, 0)));
    }

    #[test]
    fn reserving_an_already_used_midplane_conflicts() {
        let mut t = Topology::new(Dimensions::new(2, 2, 2));
        t.reserve(&[Coord::new(0, 0, 0)], ConnType::Mesh, DenyPass::None).unwrap();
        let err = t.reserve(&[Coord::new(0, 0, 0)], ConnType::Mesh, DenyPass::None).unwrap_err();
        assert_eq!(err, CoreError::GeometryConflict);
    }

    #[test]
    fn full_wrap_torus_needs_no_passthrough() {
        let mut t = Topology::new(Dimensions::new(2, 1, 1));
        let nodes = vec![Coord::new(0, 0, 0), Coord::new(1, 0, 0)];
        assert!(t.reserve(&nodes, ConnType::Torus, DenyPass::None).is_ok());
    }

    #[test]
    fn sub_range_torus_denies_passthrough_when_configured() {
        let mut t = Topology::new(Dimensions::new(4, 1, 1));
        let nodes = vec![Coord::new(1, 0, 0), Coord::new(2, 0, 0)];
        let err = t.reserve(&nodes, ConnType::Torus, DenyPass::X).unwrap_err();
        assert_eq!(err, CoreError::PassthroughDenied);
    }

    #[test]
    fn find_rectangle_picks_smallest_then_lexicographic() {
        let t = Topology::new(Dimensions::new(4, 4, 4));
        let rect = t.find_rectangle(1, 64, (1, 1, 1), false).unwrap();
        assert_eq!(rect.start, Coord::new(0, 0, 0));
        assert_eq!(rect.geometry, (1, 1, 1));
    }

    #[test]
    fn find_rectangle_skips_used_midplanes() {
        let mut t = Topology::new(Dimensions::new(2, 1, 1));
        t.reserve(&[Coord::new(0, 0, 0)], ConnType::Mesh, DenyPass::None).unwrap();
        let rect = t.find_rectangle(1, 1, (1, 1, 1), false).unwrap();
        assert_eq!(rect.start, Coord::new(1, 0, 0));
    }

    #[test]
    fn release_frees_a_midplane_for_reuse() {
        let mut t = Topology::new(Dimensions::new(1, 1, 1));
        t.reserve(&[Coord::new(0, 0, 0)], ConnType::Mesh, DenyPass::None).unwrap();
        t.release(&[Coord::new(0, 0, 0)]);
        assert!(!t.is_used(Coord::new(0, 0, 0)));
        assert!(t.reserve(&[Coord::new(0, 0, 0)], ConnType::Mesh, DenyPass::None).is_ok());
    }

    #[test]
    fn find_rectangle_ignoring_wiring_skips_only_busy_midplanes() {
        let mut t = Topology::new(Dimensions::new(2, 1, 1));
        t.reserve(&[Coord::new(0, 0, 0)], ConnType::Mesh, DenyPass::None).unwrap();
        // Strict search treats midplane 0 as unavailable (still wired).
        assert_eq!(t.find_rectangle(1, 1, (1, 1, 1), false).unwrap().start, Coord::new(1, 0, 0));
        // Ignoring-wiring search, with nothing actually busy, may reclaim it.
        let rect = t.find_rectangle_ignoring_wiring(1, 1, (1, 1, 1), false, &[]).unwrap();
        assert_eq!(rect.start, Coord::new(0, 0, 0));
    }

    #[test]
    fn can_reserve_reports_conflicts_without_mutating() {
        let mut t = Topology::new(Dimensions::new(2, 1, 1));
        t.reserve(&[Coord::new(0, 0, 0)], ConnType::Mesh, DenyPass::None).unwrap();
        assert!(!t.can_reserve(&[Coord::new(0, 0, 0)], ConnType::Mesh, DenyPass::None));
        assert!(t.can_reserve(&[Coord::new(1, 0, 0)], ConnType::Mesh, DenyPass::None));
        assert!(!t.is_used(Coord::new(1, 0, 0)));
    }

    #[test]
    fn path_reaches_target_by_shortest_ring_direction() {
        let t = Topology::new(Dimensions::new(4, 1, 1));
        let ports = t.path(Coord::new(0, 0, 0), Coord::new(1, 0, 0), 0);
        assert!(!ports.is_empty());
    }
}

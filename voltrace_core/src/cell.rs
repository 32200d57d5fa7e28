//! Detected objects and the per-frame registry.
//!
//! A [`Cell`] is one connected blob reported by the segmentation stage
//! for one (frame, brick) pair. It carries only running accumulators,
//! never raw voxel data, so that merging two cells is O(1) no matter
//! how many voxels they cover. Derived statistics (mean, standard
//! deviation, center of mass) are cached behind a dirty flag and
//! recomputed on demand.

use std::collections::{BTreeSet, HashMap};

use nalgebra::{Point3, Vector3};
use serde::{Deserialize, Serialize};

use crate::geometry::{Aabb, ShapeMoments};

// ============================================================================
// COMPOSITE KEY
// ============================================================================

/// Composite cell key: `(brick_id << 32) | id`.
///
/// Label ids are only unique within one spatial partition ("brick"), so
/// the registry keys cells by the brick/id pair packed into 64 bits.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct CellKey(u64);

impl CellKey {
    pub fn new(id: u32, brick_id: u32) -> Self {
        Self(((brick_id as u64) << 32) | id as u64)
    }

    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn id(self) -> u32 {
        (self.0 & 0xffff_ffff) as u32
    }

    pub fn brick_id(self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for CellKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.brick_id(), self.id())
    }
}

/// A transient selection of cells, by key.
///
/// Ordered so that traversals and emitted geometry are deterministic.
pub type CellSelection = BTreeSet<CellKey>;

// ============================================================================
// SEGMENTATION INPUT
// ============================================================================

/// Pre-summed statistics for one blob, as reported by the segmentation
/// stage. This core consumes the accumulators as-is; how they were
/// computed is not its concern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellSeed {
    pub id: u32,
    pub brick_id: u32,
    pub voxel_count: u32,
    pub weighted_sum: f64,
    pub sum_sq: f64,
    pub min: f64,
    pub max: f64,
    pub position_sum: Vector3<f64>,
    pub bounds: Aabb,
    /// Halo/boundary voxels, distinct from the core size.
    pub ext_voxels: u32,
    pub ext_weighted: f64,
    /// Ambiguous voxels at low/high segmentation confidence.
    pub count_lo: u32,
    pub count_hi: u32,
}

// ============================================================================
// CELL
// ============================================================================

/// One detected object instance in one (frame, brick) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cell {
    id: u32,
    brick_id: u32,
    // size
    use_weighted: bool,
    size_voxels: u32,
    size_weighted: f64,
    // extended (halo) size
    ext_voxels: u32,
    ext_weighted: f64,
    // distribution accumulators
    sum_sq_weighted: f64,
    min_weighted: f64,
    max_weighted: f64,
    // geometry accumulators
    pos_sum: Vector3<f64>,
    bounds: Aabb,
    shape: ShapeMoments,
    // per-channel colocalization sizes
    co_voxels: Vec<u32>,
    co_weighted: Vec<f64>,
    // uncertainty counters from segmentation
    count_lo: u32,
    count_hi: u32,
    // lineage back-reference, validated on every lookup
    vertex_id: Option<u32>,
    // cached derivations
    dirty: bool,
    mean: f64,
    std_dev: f64,
    center: Point3<f64>,
}

impl Cell {
    /// Blank cell with zeroed accumulators.
    pub fn new(id: u32, brick_id: u32) -> Self {
        Self {
            id,
            brick_id,
            use_weighted: true,
            size_voxels: 0,
            size_weighted: 0.0,
            ext_voxels: 0,
            ext_weighted: 0.0,
            sum_sq_weighted: 0.0,
            min_weighted: f64::INFINITY,
            max_weighted: f64::NEG_INFINITY,
            pos_sum: Vector3::zeros(),
            bounds: Aabb::new(),
            shape: ShapeMoments::new(),
            co_voxels: Vec::new(),
            co_weighted: Vec::new(),
            count_lo: 0,
            count_hi: 0,
            vertex_id: None,
            dirty: true,
            mean: 0.0,
            std_dev: 0.0,
            center: Point3::origin(),
        }
    }

    /// Cell seeded from segmentation output. The seed's center of mass
    /// is fed to the shape accumulator as its first sample.
    pub fn from_seed(seed: &CellSeed, scale: &Vector3<f64>) -> Self {
        let mut cell = Self::new(seed.id, seed.brick_id);
        cell.size_voxels = seed.voxel_count;
        cell.size_weighted = seed.weighted_sum;
        cell.ext_voxels = seed.ext_voxels;
        cell.ext_weighted = seed.ext_weighted;
        cell.sum_sq_weighted = seed.sum_sq;
        cell.min_weighted = seed.min;
        cell.max_weighted = seed.max;
        cell.pos_sum = seed.position_sum;
        cell.bounds = seed.bounds;
        cell.count_lo = seed.count_lo;
        cell.count_hi = seed.count_hi;
        if seed.voxel_count > 0 {
            let center = Point3::from(seed.position_sum / seed.voxel_count as f64);
            cell.shape.add_point_scaled(center, scale);
        }
        cell
    }

    // ------------------------------------------------------------------
    // identity
    // ------------------------------------------------------------------

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn brick_id(&self) -> u32 {
        self.brick_id
    }

    pub fn key(&self) -> CellKey {
        CellKey::new(self.id, self.brick_id)
    }

    pub(crate) fn rekey(&mut self, new_id: u32) {
        self.id = new_id;
    }

    pub fn vertex_id(&self) -> Option<u32> {
        self.vertex_id
    }

    pub(crate) fn set_vertex_id(&mut self, vertex_id: Option<u32>) {
        self.vertex_id = vertex_id;
    }

    // ------------------------------------------------------------------
    // accumulation
    // ------------------------------------------------------------------

    /// Add one voxel's contribution.
    pub fn inc_voxel(&mut self, p: Point3<f64>, value: f64) {
        self.size_voxels += 1;
        self.size_weighted += value;
        self.sum_sq_weighted += value * value;
        self.min_weighted = self.min_weighted.min(value);
        self.max_weighted = self.max_weighted.max(value);
        self.pos_sum += p.coords;
        self.bounds.extend(p);
        self.dirty = true;
    }

    /// Add one halo voxel's contribution.
    pub fn inc_ext(&mut self, value: f64) {
        self.ext_voxels += 1;
        self.ext_weighted += value;
        self.dirty = true;
    }

    /// Fold a pre-summed fragment in, with a representative point fed to
    /// the shape accumulator.
    pub fn inc_fragment(
        &mut self,
        size_voxels: u32,
        size_weighted: f64,
        ext_voxels: u32,
        p: Point3<f64>,
        scale: &Vector3<f64>,
    ) {
        self.size_voxels += size_voxels;
        self.size_weighted += size_weighted;
        self.ext_voxels += ext_voxels;
        self.ext_weighted += size_weighted * ext_voxels as f64;
        self.sum_sq_weighted += size_weighted * size_weighted;
        self.min_weighted = self.min_weighted.min(size_weighted);
        self.max_weighted = self.max_weighted.max(size_weighted);
        self.pos_sum += p.coords;
        self.bounds.extend(p);
        self.shape.add_point_scaled(p, scale);
        self.dirty = true;
    }

    /// Merge another cell's accumulators into this one.
    ///
    /// All running sums combine additively, min/max pairwise, bounds by
    /// union, per-channel lists element-wise. The other cell's raw
    /// source data is never consulted; this is what keeps combine and
    /// partition reunification O(1).
    pub fn merge(&mut self, other: &Cell) {
        self.size_voxels += other.size_voxels;
        self.size_weighted += other.size_weighted;
        self.ext_voxels += other.ext_voxels;
        self.ext_weighted += other.ext_weighted;

        self.sum_sq_weighted += other.sum_sq_weighted;
        self.min_weighted = self.min_weighted.min(other.min_weighted);
        self.max_weighted = self.max_weighted.max(other.max_weighted);

        self.pos_sum += other.pos_sum;
        self.bounds.union(&other.bounds);
        self.shape.add(&other.shape);

        if self.co_voxels.len() < other.co_voxels.len() {
            self.co_voxels.resize(other.co_voxels.len(), 0);
        }
        for (i, v) in other.co_voxels.iter().enumerate() {
            self.co_voxels[i] += v;
        }
        if self.co_weighted.len() < other.co_weighted.len() {
            self.co_weighted.resize(other.co_weighted.len(), 0.0);
        }
        for (i, v) in other.co_weighted.iter().enumerate() {
            self.co_weighted[i] += v;
        }

        self.count_lo += other.count_lo;
        self.count_hi += other.count_hi;

        self.dirty = true;
    }

    /// Copy of this cell's statistics under a fresh id, detached from
    /// any lineage.
    pub fn duplicate(&self, new_id: u32) -> Cell {
        let mut copy = self.clone();
        copy.id = new_id;
        copy.vertex_id = None;
        copy
    }

    // ------------------------------------------------------------------
    // derived statistics
    // ------------------------------------------------------------------

    /// Recompute mean, standard deviation and center of mass from the
    /// accumulators. A cell with no voxels yields zeros.
    pub fn recompute(&mut self) {
        if !self.dirty {
            return;
        }
        if self.size_voxels == 0 {
            self.mean = 0.0;
            self.std_dev = 0.0;
            self.center = Point3::origin();
        } else {
            let n = self.size_voxels as f64;
            self.mean = self.size_weighted / n;
            let var = self.sum_sq_weighted / n - self.mean * self.mean;
            self.std_dev = var.max(0.0).sqrt();
            self.center = Point3::from(self.pos_sum / n);
        }
        self.dirty = false;
    }

    /// Mean intensity, scaled by a caller-supplied unit multiplier.
    pub fn mean(&mut self, scale: f64) -> f64 {
        self.recompute();
        self.mean * scale
    }

    /// Intensity standard deviation, scaled.
    pub fn std_dev(&mut self, scale: f64) -> f64 {
        self.recompute();
        self.std_dev * scale
    }

    /// Center of mass in voxel coordinates.
    pub fn center(&mut self) -> Point3<f64> {
        self.recompute();
        self.center
    }

    /// Center of mass in physical units.
    pub fn center_scaled(&mut self, scale: &Vector3<f64>) -> Point3<f64> {
        let c = self.center();
        Point3::new(c.x * scale.x, c.y * scale.y, c.z * scale.z)
    }

    // ------------------------------------------------------------------
    // size accessors
    // ------------------------------------------------------------------

    /// Display size: weighted or plain voxel count depending on the
    /// display mode flag.
    pub fn size(&self, scale: f64) -> f64 {
        if self.use_weighted {
            self.size_weighted * scale
        } else {
            self.size_voxels as f64
        }
    }

    pub fn size_voxels(&self) -> u32 {
        self.size_voxels
    }

    pub fn size_weighted(&self, scale: f64) -> f64 {
        self.size_weighted * scale
    }

    pub fn ext(&self, scale: f64) -> f64 {
        if self.use_weighted {
            self.ext_weighted * scale
        } else {
            self.ext_voxels as f64
        }
    }

    pub fn ext_voxels(&self) -> u32 {
        self.ext_voxels
    }

    pub fn ext_weighted(&self, scale: f64) -> f64 {
        self.ext_weighted * scale
    }

    pub fn min(&self, scale: f64) -> f64 {
        if self.size_voxels == 0 {
            0.0
        } else {
            self.min_weighted * scale
        }
    }

    pub fn max(&self, scale: f64) -> f64 {
        if self.size_voxels == 0 {
            0.0
        } else {
            self.max_weighted * scale
        }
    }

    pub fn set_use_weighted(&mut self, value: bool) {
        self.use_weighted = value;
    }

    // ------------------------------------------------------------------
    // geometry / channels / counters
    // ------------------------------------------------------------------

    pub fn bounds(&self) -> &Aabb {
        &self.bounds
    }

    pub fn bounds_scaled(&self, scale: &Vector3<f64>) -> Aabb {
        self.bounds.scaled(scale)
    }

    pub fn shape(&self) -> &ShapeMoments {
        &self.shape
    }

    /// Colocalized voxel count in `channel`, zero if the channel was
    /// never populated.
    pub fn co_voxels(&self, channel: usize) -> u32 {
        self.co_voxels.get(channel).copied().unwrap_or(0)
    }

    pub fn co_weighted(&self, channel: usize) -> f64 {
        self.co_weighted.get(channel).copied().unwrap_or(0.0)
    }

    pub fn set_colocal(&mut self, co_voxels: Vec<u32>, co_weighted: Vec<f64>) {
        self.co_voxels = co_voxels;
        self.co_weighted = co_weighted;
        self.dirty = true;
    }

    pub fn count_lo(&self) -> u32 {
        self.count_lo
    }

    pub fn count_hi(&self) -> u32 {
        self.count_hi
    }

    pub fn set_counts(&mut self, lo: u32, hi: u32) {
        self.count_lo = lo;
        self.count_hi = hi;
    }
}

// ============================================================================
// CELL LIST (per-frame registry)
// ============================================================================

/// Per-frame cell registry: composite key to cell, plus the id bounds
/// of the frame's labels and the physical spacing used to convert voxel
/// sizes into physical units on demand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellList {
    cells: HashMap<CellKey, Cell>,
    min_id: u32,
    max_id: u32,
    scale: Vector3<f64>,
}

impl Default for CellList {
    fn default() -> Self {
        Self::new()
    }
}

impl CellList {
    pub fn new() -> Self {
        Self {
            cells: HashMap::new(),
            min_id: 0,
            max_id: 0,
            scale: Vector3::new(1.0, 1.0, 1.0),
        }
    }

    pub fn with_scale(scale: Vector3<f64>) -> Self {
        Self {
            scale,
            ..Self::new()
        }
    }

    /// Insert under the cell's own key; returns the displaced cell on
    /// key collision.
    pub fn insert(&mut self, cell: Cell) -> Option<Cell> {
        let id = cell.id();
        if self.cells.is_empty() {
            self.min_id = id;
            self.max_id = id;
        } else {
            self.min_id = self.min_id.min(id);
            self.max_id = self.max_id.max(id);
        }
        self.cells.insert(cell.key(), cell)
    }

    pub fn get(&self, key: &CellKey) -> Option<&Cell> {
        self.cells.get(key)
    }

    pub fn get_mut(&mut self, key: &CellKey) -> Option<&mut Cell> {
        self.cells.get_mut(key)
    }

    pub fn remove(&mut self, key: &CellKey) -> Option<Cell> {
        self.cells.remove(key)
    }

    pub fn contains_key(&self, key: &CellKey) -> bool {
        self.cells.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&CellKey, &Cell)> {
        self.cells.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &CellKey> {
        self.cells.keys()
    }

    pub fn values(&self) -> impl Iterator<Item = &Cell> {
        self.cells.values()
    }

    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut Cell> {
        self.cells.values_mut()
    }

    pub fn clear(&mut self) {
        self.cells.clear();
        self.min_id = 0;
        self.max_id = 0;
    }

    /// Whether any cell of this frame lives in `brick_id`.
    pub fn find_brick(&self, brick_id: u32) -> bool {
        self.cells.keys().any(|k| k.brick_id() == brick_id)
    }

    /// Smallest unused label id in `brick_id` that is greater than
    /// `from_id`.
    pub fn next_free_id(&self, brick_id: u32, from_id: u32) -> u32 {
        let mut candidate = from_id.wrapping_add(1).max(1);
        while self.cells.contains_key(&CellKey::new(candidate, brick_id)) {
            candidate = candidate.wrapping_add(1).max(1);
        }
        candidate
    }

    pub fn min_id(&self) -> u32 {
        self.min_id
    }

    pub fn max_id(&self) -> u32 {
        self.max_id
    }

    pub fn scale(&self) -> Vector3<f64> {
        self.scale
    }

    pub fn set_scale(&mut self, scale: Vector3<f64>) {
        self.scale = scale;
    }
}

// ============================================================================
// TESTS
// ============================================================================

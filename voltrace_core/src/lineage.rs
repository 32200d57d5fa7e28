//! Lineage nodes.
//!
//! A [`Vertex`] is the persistent identity of one tracked object within
//! a frame: the group of cells (usually one, several after a partition
//! split or a pending merge) that together make up the object. Identity
//! continuity across frames is expressed by the boundary linkage graph,
//! which refers to vertices by id. Cells refer back to their vertex by
//! id as well; a lookup that misses simply means "no lineage".

use std::collections::HashMap;

use nalgebra::Point3;
use serde::{Deserialize, Serialize};

use crate::cell::{CellKey, CellList};
use crate::geometry::Aabb;

/// Per-frame registry of lineage nodes, keyed by vertex id.
pub type VertexList = HashMap<u32, Vertex>;

/// One tracked identity within a frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vertex {
    id: u32,
    // aggregates over the member cells, refreshed by `update`
    size_voxels: u32,
    size_weighted: f64,
    center: Point3<f64>,
    bounds: Aabb,
    /// Member cells; the first entry is the primary cell whose id names
    /// the identity.
    cells: Vec<CellKey>,
}

impl Vertex {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            size_voxels: 0,
            size_weighted: 0.0,
            center: Point3::origin(),
            bounds: Aabb::new(),
            cells: Vec::new(),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn size_voxels(&self) -> u32 {
        self.size_voxels
    }

    pub fn size_weighted(&self) -> f64 {
        self.size_weighted
    }

    pub fn center(&self) -> Point3<f64> {
        self.center
    }

    pub fn bounds(&self) -> &Aabb {
        &self.bounds
    }

    /// Append a member cell.
    pub fn add_cell(&mut self, key: CellKey) {
        if !self.cells.contains(&key) {
            self.cells.push(key);
        }
    }

    /// Insert a member cell at the front, making it the primary.
    pub fn add_cell_primary(&mut self, key: CellKey) {
        self.cells.retain(|k| *k != key);
        self.cells.insert(0, key);
    }

    /// Swap a member key in place, preserving its position. Used when
    /// a cell is re-keyed.
    pub fn replace_cell(&mut self, old: CellKey, new: CellKey) -> bool {
        match self.cells.iter().position(|k| *k == old) {
            Some(i) => {
                self.cells[i] = new;
                true
            }
            None => false,
        }
    }

    /// Drop a member cell; `true` if it was present.
    pub fn remove_cell(&mut self, key: CellKey) -> bool {
        let before = self.cells.len();
        self.cells.retain(|k| *k != key);
        self.cells.len() != before
    }

    pub fn cell_count(&self) -> usize {
        self.cells.len()
    }

    pub fn cells(&self) -> &[CellKey] {
        &self.cells
    }

    pub fn contains(&self, key: CellKey) -> bool {
        self.cells.contains(&key)
    }

    pub fn primary_cell(&self) -> Option<CellKey> {
        self.cells.first().copied()
    }

    /// Refresh the aggregates from the member cells. Members missing
    /// from the registry are skipped.
    pub fn update(&mut self, cells: &mut CellList) {
        self.size_voxels = 0;
        self.size_weighted = 0.0;
        self.bounds = Aabb::new();
        let mut weighted_center = nalgebra::Vector3::zeros();

        for key in &self.cells {
            let Some(cell) = cells.get_mut(key) else {
                continue;
            };
            let n = cell.size_voxels();
            self.size_voxels += n;
            self.size_weighted += cell.size_weighted(1.0);
            self.bounds.union(cell.bounds());
            weighted_center += cell.center().coords * n as f64;
        }

        if self.size_voxels > 0 {
            self.center = Point3::from(weighted_center / self.size_voxels as f64);
        } else {
            self.center = Point3::origin();
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::Cell;
    use approx::assert_relative_eq;

    fn cell_at(id: u32, x: f64, voxels: u32) -> Cell {
        let mut cell = Cell::new(id, 0);
        for _ in 0..voxels {
            cell.inc_voxel(Point3::new(x, 0.0, 0.0), 1.0);
        }
        cell
    }

    #[test]
    fn test_membership_is_deduplicated() {
        let mut v = Vertex::new(1);
        let key = CellKey::new(1, 0);
        v.add_cell(key);
        v.add_cell(key);
        assert_eq!(v.cell_count(), 1);
        assert!(v.remove_cell(key));
        assert!(!v.remove_cell(key));
        assert_eq!(v.cell_count(), 0);
    }

    #[test]
    fn test_primary_cell_moves_to_front() {
        let mut v = Vertex::new(1);
        let (a, b) = (CellKey::new(1, 0), CellKey::new(2, 0));
        v.add_cell(a);
        v.add_cell(b);
        assert_eq!(v.primary_cell(), Some(a));
        v.add_cell_primary(b);
        assert_eq!(v.primary_cell(), Some(b));
        assert_eq!(v.cell_count(), 2);
    }

    #[test]
    fn test_update_aggregates_members() {
        let mut list = CellList::new();
        list.insert(cell_at(1, 0.0, 10));
        list.insert(cell_at(2, 4.0, 30));

        let mut v = Vertex::new(1);
        v.add_cell(CellKey::new(1, 0));
        v.add_cell(CellKey::new(2, 0));
        // a stale member should be skipped, not fail
        v.add_cell(CellKey::new(99, 0));
        v.update(&mut list);

        assert_eq!(v.size_voxels(), 40);
        assert_relative_eq!(v.size_weighted(), 40.0);
        // center weighted 10:30 between x=0 and x=4
        assert_relative_eq!(v.center().x, 3.0);
    }
}

//! The per-dataset track map.
//!
//! A [`TrackMap`] owns everything tracked for one dataset: per frame, a
//! cell registry, a lineage vertex list and the intra-frame adjacency
//! graph, and between each pair of consecutive frames one boundary
//! linkage graph. It is a passive container (all mutation goes through
//! [`TrackMapProcessor`](crate::processor::TrackMapProcessor)) and its
//! frame indices are contiguous `[0, frame_count)` by construction.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::adjacency::CellGraph;
use crate::cell::{Cell, CellKey, CellList, CellSeed};
use crate::error::TrackError;
use crate::lineage::VertexList;
use crate::linkage::InterGraph;

/// One frame's worth of segmentation output, the input contract of this
/// core. The voxel scanning that produced the seeds happened upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentedFrame {
    pub frame: usize,
    /// Physical spacing of the frame's voxel grid.
    pub scale: Vector3<f64>,
    pub cells: Vec<CellSeed>,
}

#[derive(Debug, Default)]
pub(crate) struct Frame {
    pub(crate) cells: CellList,
    pub(crate) vertices: VertexList,
    pub(crate) adjacency: CellGraph,
}

/// Container of all frames' registries and boundary graphs.
#[derive(Debug, Default)]
pub struct TrackMap {
    /// Dataset-level processing counter, round-tripped by persistence.
    counter: u32,
    frames: Vec<Frame>,
    boundaries: Vec<InterGraph>,
}

impl TrackMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    pub fn counter(&self) -> u32 {
        self.counter
    }

    pub fn set_counter(&mut self, counter: u32) {
        self.counter = counter;
    }

    /// Grow the map so that `frame` is a valid index. Each appended
    /// frame brings the boundary graph to its predecessor with it.
    pub fn extend_to(&mut self, frame: usize) {
        while self.frames.len() <= frame {
            self.frames.push(Frame::default());
            let n = self.frames.len();
            if n >= 2 && self.boundaries.len() < n - 1 {
                self.boundaries.push(InterGraph::new(n - 2));
            }
        }
    }

    /// Drop everything.
    pub fn clear(&mut self) {
        self.frames.clear();
        self.boundaries.clear();
        self.counter = 0;
    }

    // ------------------------------------------------------------------
    // per-frame access
    // ------------------------------------------------------------------

    pub fn cells_at(&self, frame: usize) -> Option<&CellList> {
        self.frames.get(frame).map(|f| &f.cells)
    }

    pub fn cells_at_mut(&mut self, frame: usize) -> Option<&mut CellList> {
        self.frames.get_mut(frame).map(|f| &mut f.cells)
    }

    pub fn vertices_at(&self, frame: usize) -> Option<&VertexList> {
        self.frames.get(frame).map(|f| &f.vertices)
    }

    pub fn vertices_at_mut(&mut self, frame: usize) -> Option<&mut VertexList> {
        self.frames.get_mut(frame).map(|f| &mut f.vertices)
    }

    pub fn adjacency_at(&self, frame: usize) -> Option<&CellGraph> {
        self.frames.get(frame).map(|f| &f.adjacency)
    }

    pub fn adjacency_at_mut(&mut self, frame: usize) -> Option<&mut CellGraph> {
        self.frames.get_mut(frame).map(|f| &mut f.adjacency)
    }

    pub(crate) fn frame(&self, frame: usize) -> Option<&Frame> {
        self.frames.get(frame)
    }

    pub(crate) fn frame_mut(&mut self, frame: usize) -> Option<&mut Frame> {
        self.frames.get_mut(frame)
    }

    // ------------------------------------------------------------------
    // boundary access
    // ------------------------------------------------------------------

    /// Boundary graph number `index` (between frames `index` and
    /// `index + 1`).
    pub fn boundary_at(&self, index: usize) -> Option<&InterGraph> {
        self.boundaries.get(index)
    }

    pub fn boundary_at_mut(&mut self, index: usize) -> Option<&mut InterGraph> {
        self.boundaries.get_mut(index)
    }

    /// The linkage graph between two adjacent frames; `None` if the
    /// frames are not adjacent or out of range.
    pub fn inter_graph_between(&self, frame1: usize, frame2: usize) -> Option<&InterGraph> {
        if frame1.abs_diff(frame2) != 1 {
            return None;
        }
        self.boundaries.get(frame1.min(frame2))
    }

    pub fn inter_graph_between_mut(
        &mut self,
        frame1: usize,
        frame2: usize,
    ) -> Option<&mut InterGraph> {
        if frame1.abs_diff(frame2) != 1 {
            return None;
        }
        self.boundaries.get_mut(frame1.min(frame2))
    }

    // ------------------------------------------------------------------
    // segmentation input
    // ------------------------------------------------------------------

    /// Consume one frame of segmentation output, constructing the
    /// frame's cells. Fails without touching the map if any seed would
    /// collide with an existing key or with another seed of the batch.
    pub fn add_frame(&mut self, input: SegmentedFrame) -> Result<(), TrackError> {
        let mut batch = std::collections::HashSet::new();
        for seed in &input.cells {
            let key = CellKey::new(seed.id, seed.brick_id);
            let existing = self
                .cells_at(input.frame)
                .map(|list| list.contains_key(&key))
                .unwrap_or(false);
            if existing || !batch.insert(key) {
                return Err(TrackError::KeyCollision {
                    key,
                    frame: input.frame,
                });
            }
        }

        self.extend_to(input.frame);
        let cells = &mut self.frames[input.frame].cells;
        cells.set_scale(input.scale);
        for seed in &input.cells {
            cells.insert(Cell::from_seed(seed, &input.scale));
        }
        debug!(
            frame = input.frame,
            cells = input.cells.len(),
            "segmented frame ingested"
        );
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Aabb;
    use nalgebra::Point3;

    fn seed(id: u32, brick: u32) -> CellSeed {
        CellSeed {
            id,
            brick_id: brick,
            voxel_count: 8,
            weighted_sum: 8.0,
            sum_sq: 8.0,
            min: 1.0,
            max: 1.0,
            position_sum: Vector3::new(8.0, 8.0, 8.0),
            bounds: Aabb::from_corners(Point3::new(0.0, 0.0, 0.0), Point3::new(2.0, 2.0, 2.0)),
            ext_voxels: 0,
            ext_weighted: 0.0,
            count_lo: 0,
            count_hi: 0,
        }
    }

    fn frame_input(frame: usize, ids: &[(u32, u32)]) -> SegmentedFrame {
        SegmentedFrame {
            frame,
            scale: Vector3::new(1.0, 1.0, 1.0),
            cells: ids.iter().map(|&(id, brick)| seed(id, brick)).collect(),
        }
    }

    #[test]
    fn test_extend_keeps_boundaries_in_step() {
        let mut map = TrackMap::new();
        map.extend_to(0);
        assert_eq!(map.frame_count(), 1);
        assert!(map.boundary_at(0).is_none());

        map.extend_to(3);
        assert_eq!(map.frame_count(), 4);
        assert!(map.boundary_at(2).is_some());
        assert!(map.boundary_at(3).is_none());
        assert_eq!(map.boundary_at(1).unwrap().index(), 1);
    }

    #[test]
    fn test_inter_graph_requires_adjacent_frames() {
        let mut map = TrackMap::new();
        map.extend_to(3);
        assert!(map.inter_graph_between(1, 2).is_some());
        assert!(map.inter_graph_between(2, 1).is_some());
        assert!(map.inter_graph_between(1, 3).is_none());
        assert!(map.inter_graph_between(2, 2).is_none());
    }

    #[test]
    fn test_add_frame_ingests_seeds() {
        let mut map = TrackMap::new();
        map.add_frame(frame_input(0, &[(1, 0), (2, 0), (1, 1)])).unwrap();
        let cells = map.cells_at(0).unwrap();
        assert_eq!(cells.len(), 3);
        assert!(cells.contains_key(&CellKey::new(1, 1)));
    }

    #[test]
    fn test_add_frame_rejects_collisions_without_mutation() {
        let mut map = TrackMap::new();
        map.add_frame(frame_input(0, &[(1, 0)])).unwrap();

        // duplicate against the registry
        let err = map.add_frame(frame_input(0, &[(1, 0)])).unwrap_err();
        assert!(matches!(err, TrackError::KeyCollision { .. }));
        assert_eq!(map.cells_at(0).unwrap().len(), 1);

        // duplicate within the batch, on a frame that does not exist yet
        let err = map.add_frame(frame_input(2, &[(5, 0), (5, 0)])).unwrap_err();
        assert!(matches!(err, TrackError::KeyCollision { .. }));
        assert_eq!(map.frame_count(), 1, "failed ingest must not extend the map");
    }
}

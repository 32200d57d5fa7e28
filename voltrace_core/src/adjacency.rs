//! Intra-frame adjacency graph.
//!
//! The volume of a frame is processed in spatial partitions ("bricks"),
//! so a single physical object can be reported as several cells, one
//! per brick it crosses. This graph records observed contacts between
//! such cells and recovers the connected component of a seed cell so
//! the fragments can be treated as one object again.
//!
//! Vertices and edges live in slotmap arenas; graph payloads hold
//! generational keys, never references, and a cell with no vertex here
//! simply never touched a brick boundary.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use slotmap::{new_key_type, SlotMap};

use crate::cell::{CellKey, CellSelection};

new_key_type! {
    /// Handle of a vertex in a [`CellGraph`] arena.
    pub struct AdjVertexKey;
}

new_key_type! {
    /// Handle of an edge in a [`CellGraph`] arena.
    pub struct AdjEdgeKey;
}

/// Contact observed between two cells of the same frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ContactEdge {
    /// Number of voxel-level contacts observed.
    pub contact_voxels: u32,
    /// Contact size weighted by intensity.
    pub contact_weighted: f64,
    /// Distance measured on the voxel grid.
    pub dist_voxel: f64,
    /// Distance measured in spatial coordinates.
    pub dist_spatial: f64,
}

impl ContactEdge {
    fn single_contact() -> Self {
        Self {
            contact_voxels: 1,
            contact_weighted: 0.0,
            dist_voxel: 0.0,
            dist_spatial: 0.0,
        }
    }
}

#[derive(Debug, Clone)]
struct AdjVertex {
    cell: CellKey,
    visited: bool,
    adj: Vec<(AdjVertexKey, AdjEdgeKey)>,
}

#[derive(Debug, Clone)]
struct AdjEdge {
    ends: [AdjVertexKey; 2],
    data: ContactEdge,
}

/// Per-frame undirected contact graph over cells.
#[derive(Debug, Clone, Default)]
pub struct CellGraph {
    verts: SlotMap<AdjVertexKey, AdjVertex>,
    edges: SlotMap<AdjEdgeKey, AdjEdge>,
    lookup: HashMap<CellKey, AdjVertexKey>,
}

impl CellGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn vertex_count(&self) -> usize {
        self.verts.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Handle of the vertex standing for `cell`, if it ever contacted
    /// another cell.
    pub fn vertex_for(&self, cell: CellKey) -> Option<AdjVertexKey> {
        self.lookup.get(&cell).copied()
    }

    fn ensure_vertex(&mut self, cell: CellKey) -> AdjVertexKey {
        if let Some(&v) = self.lookup.get(&cell) {
            return v;
        }
        let v = self.verts.insert(AdjVertex {
            cell,
            visited: false,
            adj: Vec::new(),
        });
        self.lookup.insert(cell, v);
        v
    }

    fn edge_between(&self, a: AdjVertexKey, b: AdjVertexKey) -> Option<AdjEdgeKey> {
        let va = self.verts.get(a)?;
        va.adj.iter().find(|(n, _)| *n == b).map(|(_, e)| *e)
    }

    /// Record one observed contact between `a` and `b`, inserting both
    /// vertices lazily. Repeated calls accumulate the contact count on
    /// the single connecting edge.
    pub fn link(&mut self, a: CellKey, b: CellKey) {
        if a == b {
            return;
        }
        let va = self.ensure_vertex(a);
        let vb = self.ensure_vertex(b);
        match self.edge_between(va, vb) {
            Some(e) => self.edges[e].data.contact_voxels += 1,
            None => {
                let e = self.edges.insert(AdjEdge {
                    ends: [va, vb],
                    data: ContactEdge::single_contact(),
                });
                self.verts[va].adj.push((vb, e));
                self.verts[vb].adj.push((va, e));
            }
        }
    }

    /// Insert an edge with a fully specified payload. Returns `false`
    /// without touching the payload if the edge already exists (the
    /// import path treats that as a duplicate record).
    pub fn add_edge(&mut self, a: CellKey, b: CellKey, data: ContactEdge) -> bool {
        if a == b {
            return false;
        }
        let va = self.ensure_vertex(a);
        let vb = self.ensure_vertex(b);
        if self.edge_between(va, vb).is_some() {
            return false;
        }
        let e = self.edges.insert(AdjEdge { ends: [va, vb], data });
        self.verts[va].adj.push((vb, e));
        self.verts[vb].adj.push((va, e));
        true
    }

    /// Contact payload between two cells, if the edge exists.
    pub fn contact(&self, a: CellKey, b: CellKey) -> Option<&ContactEdge> {
        let va = self.vertex_for(a)?;
        let vb = self.vertex_for(b)?;
        let e = self.edge_between(va, vb)?;
        Some(&self.edges[e].data)
    }

    /// Reset all traversal flags.
    pub fn clear_visited(&mut self) {
        for v in self.verts.values_mut() {
            v.visited = false;
        }
    }

    /// Connected component of `seed`, following only edges whose
    /// contact count is at least `threshold`.
    ///
    /// A seed with no vertex in the graph is its own single-element
    /// component. A seed whose vertex was already visited by an earlier
    /// traversal yields nothing; visited flags guarantee termination on
    /// cyclic adjacency.
    pub fn linked_components(&mut self, seed: CellKey, threshold: u32) -> Vec<CellKey> {
        let start = match self.vertex_for(seed) {
            Some(v) => v,
            None => return vec![seed],
        };
        if self.verts[start].visited {
            return Vec::new();
        }

        let mut out = Vec::new();
        let mut stack = vec![start];
        self.verts[start].visited = true;
        while let Some(v) = stack.pop() {
            out.push(self.verts[v].cell);
            let neighbors: Vec<(AdjVertexKey, AdjEdgeKey)> = self.verts[v].adj.clone();
            for (n, e) in neighbors {
                if self.edges[e].data.contact_voxels < threshold {
                    continue;
                }
                if !self.verts[n].visited {
                    self.verts[n].visited = true;
                    stack.push(n);
                }
            }
        }
        out
    }

    /// Batch form: clears all visited flags, then folds the traversal
    /// over every seed. Seeds swallowed by an earlier seed's component
    /// are benign no-ops.
    pub fn linked_components_batch(
        &mut self,
        seeds: &CellSelection,
        threshold: u32,
    ) -> CellSelection {
        self.clear_visited();
        let mut out = CellSelection::new();
        for &seed in seeds {
            out.extend(self.linked_components(seed, threshold));
        }
        out
    }

    /// Drop a cell's vertex together with its incident edges.
    pub fn remove_cell(&mut self, cell: CellKey) {
        let Some(v) = self.lookup.remove(&cell) else {
            return;
        };
        let adj = self.verts[v].adj.clone();
        for (n, e) in adj {
            self.edges.remove(e);
            if let Some(nv) = self.verts.get_mut(n) {
                nv.adj.retain(|(_, ne)| *ne != e);
            }
        }
        self.verts.remove(v);
    }

    /// Re-key a vertex after a cell id replacement.
    pub fn rekey_cell(&mut self, old: CellKey, new: CellKey) -> bool {
        let Some(v) = self.lookup.remove(&old) else {
            return false;
        };
        self.verts[v].cell = new;
        self.lookup.insert(new, v);
        true
    }

    /// All edges as `(cell_a, cell_b, payload)` records.
    pub fn edges(&self) -> impl Iterator<Item = (CellKey, CellKey, &ContactEdge)> {
        self.edges.values().map(|e| {
            (
                self.verts[e.ends[0]].cell,
                self.verts[e.ends[1]].cell,
                &e.data,
            )
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn key(id: u32, brick: u32) -> CellKey {
        CellKey::new(id, brick)
    }

    #[test]
    fn test_link_accumulates_contacts() {
        let mut g = CellGraph::new();
        let (a, b) = (key(1, 0), key(1, 1));
        g.link(a, b);
        g.link(a, b);
        g.link(a, b);
        assert_eq!(g.vertex_count(), 2);
        assert_eq!(g.edge_count(), 1);
        assert_eq!(g.contact(a, b).unwrap().contact_voxels, 3);
    }

    #[test]
    fn test_self_link_is_a_noop() {
        let mut g = CellGraph::new();
        g.link(key(1, 0), key(1, 0));
        assert_eq!(g.vertex_count(), 0);
        assert_eq!(g.edge_count(), 0);
    }

    #[test]
    fn test_missing_vertex_is_own_component() {
        let mut g = CellGraph::new();
        let lone = key(9, 0);
        assert_eq!(g.linked_components(lone, 1), vec![lone]);
    }

    #[test]
    fn test_threshold_filters_weak_contacts() {
        let mut g = CellGraph::new();
        let (a, b, c) = (key(1, 0), key(1, 1), key(1, 2));
        for _ in 0..5 {
            g.link(a, b);
        }
        g.link(b, c); // single weak contact

        g.clear_visited();
        let comp = g.linked_components(a, 5);
        assert!(comp.contains(&a));
        assert!(comp.contains(&b));
        assert!(!comp.contains(&c));
    }

    #[test]
    fn test_cycle_terminates_and_is_seed_independent() {
        let mut g = CellGraph::new();
        let ks = [key(1, 0), key(1, 1), key(1, 2)];
        g.link(ks[0], ks[1]);
        g.link(ks[1], ks[2]);
        g.link(ks[2], ks[0]);

        let mut sets = Vec::new();
        for &seed in &ks {
            g.clear_visited();
            let mut comp = g.linked_components(seed, 1);
            comp.sort();
            sets.push(comp);
        }
        assert_eq!(sets[0], sets[1]);
        assert_eq!(sets[1], sets[2]);
        assert_eq!(sets[0].len(), 3);
    }

    #[test]
    fn test_batch_with_overlapping_seeds() {
        let mut g = CellGraph::new();
        let (a, b) = (key(1, 0), key(1, 1));
        let lone = key(7, 0);
        g.link(a, b);

        let seeds: CellSelection = [a, b, lone].into_iter().collect();
        let comp = g.linked_components_batch(&seeds, 1);
        // b is swallowed by a's traversal, lone has no vertex
        assert_eq!(comp.len(), 3);
        assert!(comp.contains(&lone));
    }

    #[test]
    fn test_remove_cell_drops_incident_edges() {
        let mut g = CellGraph::new();
        let (a, b, c) = (key(1, 0), key(1, 1), key(1, 2));
        g.link(a, b);
        g.link(b, c);
        g.remove_cell(b);
        assert_eq!(g.edge_count(), 0);
        assert!(g.vertex_for(b).is_none());
        assert!(g.vertex_for(a).is_some());
    }

    #[test]
    fn test_rekey_cell_preserves_edges() {
        let mut g = CellGraph::new();
        let (a, b, a2) = (key(1, 0), key(1, 1), key(42, 0));
        g.link(a, b);
        assert!(g.rekey_cell(a, a2));
        assert!(g.vertex_for(a).is_none());
        assert_eq!(g.contact(a2, b).unwrap().contact_voxels, 1);
    }
}

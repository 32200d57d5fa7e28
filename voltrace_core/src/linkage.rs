//! Frame-boundary linkage graph.
//!
//! One [`InterGraph`] sits between each pair of consecutive frames and
//! connects lineage vertices of the earlier frame with those of the
//! later one. An edge records how strongly the two identities overlap;
//! its `link` flag is what actually asserts "same object". Unlinking
//! clears the flag but keeps the edge, so the overlap evidence stays
//! available for diagnostics.
//!
//! Vertices are addressed by `(frame, vertex_id)` through a lookup map;
//! a missing entry means the identity was never linked at this
//! boundary, which every caller treats as "no lineage" rather than an
//! error.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use slotmap::{new_key_type, SlotMap};

new_key_type! {
    /// Handle of a vertex in an [`InterGraph`] arena.
    pub struct LinkVertexKey;
}

new_key_type! {
    /// Handle of an edge in an [`InterGraph`] arena.
    pub struct LinkEdgeKey;
}

/// Linkage evidence between two lineage vertices across one boundary.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LinkEdge {
    /// Voxel overlap observed between the two identities.
    pub overlap_voxels: u32,
    /// Overlap weighted by intensity.
    pub overlap_weighted: f64,
    /// Distance between the two identities' centers.
    pub dist: f64,
    /// Whether the two identities are considered the same object.
    pub link: bool,
    /// Uncertainty counter: how often this pairing was revisited.
    pub count: u32,
}

/// One lineage vertex as seen by a boundary graph.
#[derive(Debug, Clone)]
pub struct LinkVertex {
    vertex_id: u32,
    frame: usize,
    count: u32,
    adj: Vec<(LinkVertexKey, LinkEdgeKey)>,
}

impl LinkVertex {
    pub fn vertex_id(&self) -> u32 {
        self.vertex_id
    }

    pub fn frame(&self) -> usize {
        self.frame
    }

    /// Uncertainty counter for this identity at this boundary.
    pub fn count(&self) -> u32 {
        self.count
    }
}

#[derive(Debug, Clone)]
struct EdgeSlot {
    ends: [LinkVertexKey; 2],
    data: LinkEdge,
}

/// Undirected linkage graph for the boundary between frame `index` and
/// frame `index + 1`.
#[derive(Debug, Clone)]
pub struct InterGraph {
    index: usize,
    /// Processing-pass counter, round-tripped through persistence.
    counter: u32,
    verts: SlotMap<LinkVertexKey, LinkVertex>,
    edges: SlotMap<LinkEdgeKey, EdgeSlot>,
    lookup: HashMap<(usize, u32), LinkVertexKey>,
}

impl InterGraph {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            counter: 0,
            verts: SlotMap::with_key(),
            edges: SlotMap::with_key(),
            lookup: HashMap::new(),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn counter(&self) -> u32 {
        self.counter
    }

    pub fn set_counter(&mut self, counter: u32) {
        self.counter = counter;
    }

    pub fn vertex_count(&self) -> usize {
        self.verts.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    // ------------------------------------------------------------------
    // vertices
    // ------------------------------------------------------------------

    pub fn vertex_for(&self, frame: usize, vertex_id: u32) -> Option<LinkVertexKey> {
        self.lookup.get(&(frame, vertex_id)).copied()
    }

    pub fn vertex(&self, key: LinkVertexKey) -> Option<&LinkVertex> {
        self.verts.get(key)
    }

    /// Insert-or-find the vertex for `(frame, vertex_id)`.
    pub fn ensure_vertex(
        &mut self,
        frame: usize,
        vertex_id: u32,
        initial_count: u32,
    ) -> LinkVertexKey {
        if let Some(&v) = self.lookup.get(&(frame, vertex_id)) {
            return v;
        }
        let v = self.verts.insert(LinkVertex {
            vertex_id,
            frame,
            count: initial_count,
            adj: Vec::new(),
        });
        self.lookup.insert((frame, vertex_id), v);
        v
    }

    pub fn set_vertex_uncertainty(&mut self, key: LinkVertexKey, count: u32) {
        if let Some(v) = self.verts.get_mut(key) {
            v.count = count;
        }
    }

    /// Drop a vertex together with its incident edges.
    pub fn remove_vertex(&mut self, key: LinkVertexKey) {
        let Some(v) = self.verts.get(key) else {
            return;
        };
        self.lookup.remove(&(v.frame, v.vertex_id));
        let adj = v.adj.clone();
        for (n, e) in adj {
            self.edges.remove(e);
            if let Some(nv) = self.verts.get_mut(n) {
                nv.adj.retain(|(_, ne)| *ne != e);
            }
        }
        self.verts.remove(key);
    }

    // ------------------------------------------------------------------
    // edges
    // ------------------------------------------------------------------

    pub fn edge(&self, key: LinkEdgeKey) -> Option<&LinkEdge> {
        self.edges.get(key).map(|e| &e.data)
    }

    pub fn edge_between(&self, a: LinkVertexKey, b: LinkVertexKey) -> Option<LinkEdgeKey> {
        let va = self.verts.get(a)?;
        va.adj.iter().find(|(n, _)| *n == b).map(|(_, e)| *e)
    }

    /// Incident edges of `key` as `(neighbor, edge)` pairs.
    pub fn adjacent(&self, key: LinkVertexKey) -> impl Iterator<Item = (LinkVertexKey, LinkEdgeKey)> + '_ {
        self.verts
            .get(key)
            .map(|v| v.adj.as_slice())
            .unwrap_or(&[])
            .iter()
            .copied()
    }

    /// Number of `link`-marked edges incident to `key`.
    pub fn linked_degree(&self, key: LinkVertexKey) -> usize {
        self.adjacent(key)
            .filter(|(_, e)| self.edges[*e].data.link)
            .count()
    }

    fn insert_edge(&mut self, a: LinkVertexKey, b: LinkVertexKey, data: LinkEdge) -> LinkEdgeKey {
        let e = self.edges.insert(EdgeSlot { ends: [a, b], data });
        self.verts[a].adj.push((b, e));
        self.verts[b].adj.push((a, e));
        e
    }

    /// Assert continuity between two vertices: the connecting edge is
    /// created if needed, its overlap evidence overwritten, and its
    /// `link` flag raised. The uncertainty counters reset; this is a
    /// deliberate user decision, not an automatic guess.
    pub fn force_link(
        &mut self,
        a: LinkVertexKey,
        b: LinkVertexKey,
        overlap_voxels: u32,
        overlap_weighted: f64,
        dist: f64,
    ) -> LinkEdgeKey {
        match self.edge_between(a, b) {
            Some(e) => {
                let data = &mut self.edges[e].data;
                data.overlap_voxels = overlap_voxels;
                data.overlap_weighted = overlap_weighted;
                data.link = true;
                data.count = 0;
                e
            }
            None => self.insert_edge(
                a,
                b,
                LinkEdge {
                    overlap_voxels,
                    overlap_weighted,
                    dist,
                    link: true,
                    count: 0,
                },
            ),
        }
    }

    /// Clear the `link` flag between two vertices, keeping the edge.
    /// Returns whether a linked edge was actually cleared.
    pub fn unlink(&mut self, a: LinkVertexKey, b: LinkVertexKey) -> bool {
        if let Some(v) = self.verts.get_mut(a) {
            v.count = 0;
        }
        if let Some(v) = self.verts.get_mut(b) {
            v.count = 0;
        }
        match self.edge_between(a, b) {
            Some(e) => {
                let data = &mut self.edges[e].data;
                let was = data.link;
                data.link = false;
                data.count = 0;
                was
            }
            None => false,
        }
    }

    /// Clear the `link` flag on every edge incident to `key`.
    pub fn isolate(&mut self, key: LinkVertexKey) {
        let Some(v) = self.verts.get_mut(key) else {
            return;
        };
        v.count = 0;
        let adj = v.adj.clone();
        for (_, e) in adj {
            let data = &mut self.edges[e].data;
            if data.link {
                data.link = false;
                data.count = 0;
            }
        }
    }

    /// Import path: ensure both vertices (overwriting their uncertainty
    /// counters) and insert the edge record. Returns `false` if the
    /// edge already existed; only its counter is updated in that case.
    #[allow(clippy::too_many_arguments)]
    pub fn add_edge_record(
        &mut self,
        frame1: usize,
        id1: u32,
        count1: u32,
        frame2: usize,
        id2: u32,
        count2: u32,
        data: LinkEdge,
    ) -> bool {
        let a = self.ensure_vertex(frame1, id1, count1);
        self.verts[a].count = count1;
        let b = self.ensure_vertex(frame2, id2, count2);
        self.verts[b].count = count2;
        match self.edge_between(a, b) {
            Some(e) => {
                self.edges[e].data.count = data.count;
                false
            }
            None => {
                self.insert_edge(a, b, data);
                true
            }
        }
    }

    /// Re-point every edge of `(frame, from_id)` onto `(frame, to_id)`,
    /// merging payloads additively where the target already has an edge
    /// to the same neighbor, then drop the old vertex. Used when an
    /// identity is absorbed by another (combine).
    pub fn relink(&mut self, frame: usize, from_id: u32, to_id: u32, reset: bool) {
        let Some(from) = self.vertex_for(frame, from_id) else {
            return;
        };
        let to = self.ensure_vertex(frame, to_id, 0);
        if reset {
            self.verts[to].count = 0;
        } else {
            self.verts[to].count += self.verts[from].count;
        }

        let adj = self.verts[from].adj.clone();
        for (n, e) in adj {
            if n == to {
                continue;
            }
            let data = self.edges[e].data;
            match self.edge_between(to, n) {
                Some(e0) => {
                    let existing = &mut self.edges[e0].data;
                    existing.overlap_voxels += data.overlap_voxels;
                    existing.overlap_weighted += data.overlap_weighted;
                    existing.count += data.count;
                    existing.link |= data.link;
                }
                None => {
                    self.insert_edge(to, n, data);
                }
            }
        }
        self.remove_vertex(from);
    }

    /// Copy `from`'s edges onto `to` with the `link` flag cleared. Used
    /// when an identity splits: the new identities keep the adjacency
    /// evidence but the caller must re-link explicitly.
    pub fn copy_edges_unlinked(&mut self, from: LinkVertexKey, to: LinkVertexKey) {
        if !self.verts.contains_key(from) || !self.verts.contains_key(to) {
            return;
        }
        let adj = self.verts[from].adj.clone();
        for (n, e) in adj {
            if n == to || self.edge_between(to, n).is_some() {
                continue;
            }
            let mut data = self.edges[e].data;
            data.link = false;
            data.count = 0;
            self.insert_edge(to, n, data);
        }
    }

    /// All edges as `(lower-frame vertex, higher-frame vertex, payload)`
    /// triples.
    pub fn edges(&self) -> impl Iterator<Item = (&LinkVertex, &LinkVertex, &LinkEdge)> {
        self.edges.values().map(|e| {
            let a = &self.verts[e.ends[0]];
            let b = &self.verts[e.ends[1]];
            if a.frame <= b.frame {
                (a, b, &e.data)
            } else {
                (b, a, &e.data)
            }
        })
    }

    /// All vertices.
    pub fn vertices(&self) -> impl Iterator<Item = &LinkVertex> {
        self.verts.values()
    }
}

// ============================================================================
// TESTS
// ============================================================================

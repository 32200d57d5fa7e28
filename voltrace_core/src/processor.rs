//! Editing and query façade over a track map.
//!
//! A [`TrackMapProcessor`] borrows one [`TrackMap`] mutably for the
//! duration of an editing session and funnels every mutation through
//! validated operations. Out-of-range frames and key collisions fail
//! without side effects; empty selections are silent no-ops, since the
//! interactive caller routinely passes incidentally-empty selections.

use std::collections::BTreeMap;

use nalgebra::Point3;
use tracing::debug;

use crate::cell::{Cell, CellKey, CellSelection};
use crate::error::TrackError;
use crate::lineage::Vertex;
use crate::persist;
use crate::track_map::TrackMap;

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Thresholds applied by the processor's queries.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Minimum voxel size for a lineage vertex to appear in link-list
    /// diagnostics.
    pub size_threshold: u32,

    /// Minimum contact count for an adjacency edge to be followed when
    /// recovering partition-split components.
    pub contact_threshold: u32,

    /// Minimum boundary-graph revisit count for a cell to be reported
    /// as uncertain.
    pub uncertainty_low: u32,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            size_threshold: 25,
            contact_threshold: 5,
            uncertainty_low: 2,
        }
    }
}

/// Orphan/multi classification of a frame's lineage vertices, by id.
///
/// "In" refers to the boundary towards the previous frame, "out" to the
/// boundary towards the next. Degree counts only `link`-marked edges:
/// zero puts a vertex in an orphan list, two or more in a multi list
/// (unresolved merge/split candidates for the user to untangle).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkLists {
    pub in_orphans: Vec<u32>,
    pub out_orphans: Vec<u32>,
    pub in_multi: Vec<u32>,
    pub out_multi: Vec<u32>,
}

/// Aggregates of one lineage vertex, captured while the registries are
/// borrowed so the boundary graph can be edited afterwards.
#[derive(Debug, Clone)]
struct VertexInfo {
    id: u32,
    size_voxels: u32,
    size_weighted: f64,
    center: Point3<f64>,
}

// ============================================================================
// PROCESSOR
// ============================================================================

/// Stateful editing façade bound to one track map.
pub struct TrackMapProcessor<'a> {
    map: &'a mut TrackMap,
    config: ProcessorConfig,
}

impl<'a> TrackMapProcessor<'a> {
    pub fn new(map: &'a mut TrackMap) -> Self {
        Self {
            map,
            config: ProcessorConfig::default(),
        }
    }

    pub fn with_config(map: &'a mut TrackMap, config: ProcessorConfig) -> Self {
        Self { map, config }
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut ProcessorConfig {
        &mut self.config
    }

    // ------------------------------------------------------------------
    // validation helpers
    // ------------------------------------------------------------------

    fn check_frame(&self, frame: usize) -> Result<(), TrackError> {
        if frame >= self.map.frame_count() {
            return Err(TrackError::FrameOutOfRange {
                frame,
                frame_count: self.map.frame_count(),
            });
        }
        Ok(())
    }

    /// Both frames in range and exactly one apart. Also rejects
    /// self-links, which share the failure mode.
    fn check_adjacent(&self, frame1: usize, frame2: usize) -> Result<(), TrackError> {
        self.check_frame(frame1)?;
        self.check_frame(frame2)?;
        if frame1.abs_diff(frame2) != 1 {
            return Err(TrackError::FramesNotAdjacent { frame1, frame2 });
        }
        Ok(())
    }

    /// The validated lineage vertex id of a cell, or `None` when the
    /// cell is missing, unassigned, or points at a vertex that no
    /// longer exists.
    fn vertex_of_cell(&self, frame: usize, key: CellKey) -> Option<u32> {
        let cell = self.map.cells_at(frame)?.get(&key)?;
        let vid = cell.vertex_id()?;
        self.map.vertices_at(frame)?.contains_key(&vid).then_some(vid)
    }

    /// Find-or-create the lineage vertex backing `key`, seeding it from
    /// the cell's statistics. The vertex id is the cell's label id when
    /// free, otherwise the next free id.
    fn ensure_cell_vertex(&mut self, frame: usize, key: CellKey) -> Option<u32> {
        if let Some(vid) = self.vertex_of_cell(frame, key) {
            return Some(vid);
        }
        let fr = self.map.frame_mut(frame)?;
        fr.cells.get(&key)?;

        let mut vid = key.id();
        while fr.vertices.contains_key(&vid) {
            vid = vid.wrapping_add(1).max(1);
        }
        let mut vertex = Vertex::new(vid);
        vertex.add_cell(key);
        vertex.update(&mut fr.cells);
        fr.vertices.insert(vid, vertex);
        fr.cells.get_mut(&key)?.set_vertex_id(Some(vid));
        Some(vid)
    }

    /// Resolve a selection to its existing lineage vertices, without
    /// creating any. Deduplicated, deterministic order.
    fn selection_vertices(&self, frame: usize, sel: &CellSelection) -> Vec<u32> {
        let mut out: Vec<u32> = sel
            .iter()
            .filter_map(|&key| self.vertex_of_cell(frame, key))
            .collect();
        out.sort_unstable();
        out.dedup();
        out
    }

    /// Ensure vertices for a selection and capture their refreshed
    /// aggregates for boundary-graph edits.
    fn prepare_vertices(&mut self, frame: usize, sel: &CellSelection) -> Vec<VertexInfo> {
        let mut infos: BTreeMap<u32, VertexInfo> = BTreeMap::new();
        for &key in sel {
            let Some(vid) = self.ensure_cell_vertex(frame, key) else {
                continue;
            };
            if infos.contains_key(&vid) {
                continue;
            }
            let fr = self.map.frame_mut(frame).expect("frame checked by caller");
            let Some(vertex) = fr.vertices.get_mut(&vid) else {
                continue;
            };
            vertex.update(&mut fr.cells);
            infos.insert(
                vid,
                VertexInfo {
                    id: vid,
                    size_voxels: vertex.size_voxels(),
                    size_weighted: vertex.size_weighted(),
                    center: vertex.center(),
                },
            );
        }
        infos.into_values().collect()
    }

    // ------------------------------------------------------------------
    // cell bookkeeping
    // ------------------------------------------------------------------

    /// Duplicate a registry cell under a fresh label id in its brick.
    /// The copy gets its own lineage vertex and no links.
    pub fn add_cell_duplicate(
        &mut self,
        key: CellKey,
        frame: usize,
    ) -> Result<CellKey, TrackError> {
        self.check_frame(frame)?;
        let cells = self.map.cells_at(frame).expect("frame checked");
        let Some(cell) = cells.get(&key) else {
            return Err(TrackError::CellNotFound { key, frame });
        };
        let new_id = cells.next_free_id(key.brick_id(), cells.max_id());
        let copy = cell.duplicate(new_id);
        let new_key = copy.key();

        self.map
            .cells_at_mut(frame)
            .expect("frame checked")
            .insert(copy);
        self.ensure_cell_vertex(frame, new_key);
        debug!(%key, %new_key, frame, "cell duplicated");
        Ok(new_key)
    }

    /// Insert externally created cells (each with its own new lineage
    /// vertex). Cells whose key is already taken are skipped.
    pub fn add_cells(&mut self, cells: Vec<Cell>, frame: usize) -> Result<(), TrackError> {
        self.check_frame(frame)?;
        for mut cell in cells {
            cell.set_vertex_id(None);
            let key = cell.key();
            let registry = self.map.cells_at_mut(frame).expect("frame checked");
            if registry.contains_key(&key) {
                continue;
            }
            registry.insert(cell);
            self.ensure_cell_vertex(frame, key);
        }
        Ok(())
    }

    /// Remove cells from the registry, dropping emptied lineage
    /// vertices and their boundary-graph presence.
    pub fn remove_cells(&mut self, sel: &CellSelection, frame: usize) -> Result<(), TrackError> {
        self.check_frame(frame)?;
        let mut dead_vertices: Vec<u32> = Vec::new();

        let fr = self.map.frame_mut(frame).expect("frame checked");
        for &key in sel {
            let Some(cell) = fr.cells.remove(&key) else {
                continue;
            };
            fr.adjacency.remove_cell(key);
            let Some(vid) = cell.vertex_id() else {
                continue;
            };
            if let Some(vertex) = fr.vertices.get_mut(&vid) {
                vertex.remove_cell(key);
                if vertex.cell_count() == 0 {
                    fr.vertices.remove(&vid);
                    dead_vertices.push(vid);
                }
            }
        }

        for boundary in Self::boundaries_of(frame, self.map.frame_count()) {
            let Some(graph) = self.map.boundary_at_mut(boundary) else {
                continue;
            };
            for &vid in &dead_vertices {
                if let Some(v) = graph.vertex_for(frame, vid) {
                    graph.remove_vertex(v);
                }
            }
        }
        Ok(())
    }

    /// Boundary indices touching `frame`: towards the previous frame
    /// and towards the next.
    fn boundaries_of(frame: usize, frame_count: usize) -> Vec<usize> {
        let mut out = Vec::with_capacity(2);
        if frame > 0 {
            out.push(frame - 1);
        }
        if frame + 1 < frame_count {
            out.push(frame);
        }
        out
    }

    // ------------------------------------------------------------------
    // linking
    // ------------------------------------------------------------------

    /// Mark every pairing of the two selections' lineage vertices as
    /// the same object across the boundary. With `exclusive`, any other
    /// `link` incident to either side is cleared first, enforcing
    /// at-most-one continuous identity per object on that boundary.
    pub fn link_cells(
        &mut self,
        sel1: &CellSelection,
        sel2: &CellSelection,
        frame1: usize,
        frame2: usize,
        exclusive: bool,
    ) -> Result<(), TrackError> {
        self.check_adjacent(frame1, frame2)?;
        let infos1 = self.prepare_vertices(frame1, sel1);
        let infos2 = self.prepare_vertices(frame2, sel2);
        if infos1.is_empty() || infos2.is_empty() {
            return Ok(());
        }

        let boundary = frame1.min(frame2);
        let Some(graph) = self.map.boundary_at_mut(boundary) else {
            return Ok(());
        };

        if exclusive {
            for (frame, infos) in [(frame1, &infos1), (frame2, &infos2)] {
                for info in infos {
                    if let Some(v) = graph.vertex_for(frame, info.id) {
                        graph.isolate(v);
                    }
                }
            }
        }

        for a in &infos1 {
            for b in &infos2 {
                let va = graph.ensure_vertex(frame1, a.id, 0);
                let vb = graph.ensure_vertex(frame2, b.id, 0);
                graph.force_link(
                    va,
                    vb,
                    a.size_voxels.max(b.size_voxels),
                    a.size_weighted.max(b.size_weighted),
                    (a.center - b.center).norm(),
                );
            }
        }
        debug!(
            frame1,
            frame2,
            pairs = infos1.len() * infos2.len(),
            exclusive,
            "cells linked"
        );
        Ok(())
    }

    /// Clear the `link` flag between every pairing of the selections'
    /// vertices. Edges stay for diagnostics.
    pub fn unlink_cells(
        &mut self,
        sel1: &CellSelection,
        sel2: &CellSelection,
        frame1: usize,
        frame2: usize,
    ) -> Result<(), TrackError> {
        self.check_adjacent(frame1, frame2)?;
        let vids1 = self.selection_vertices(frame1, sel1);
        let vids2 = self.selection_vertices(frame2, sel2);
        if vids1.is_empty() || vids2.is_empty() {
            return Ok(());
        }

        let boundary = frame1.min(frame2);
        let Some(graph) = self.map.boundary_at_mut(boundary) else {
            return Ok(());
        };
        for &id1 in &vids1 {
            for &id2 in &vids2 {
                let (Some(v1), Some(v2)) = (
                    graph.vertex_for(frame1, id1),
                    graph.vertex_for(frame2, id2),
                ) else {
                    continue;
                };
                graph.unlink(v1, v2);
            }
        }
        debug!(frame1, frame2, "cells unlinked");
        Ok(())
    }

    /// Sever the selected cells from their lineage: clear every `link`
    /// on every incident edge at both adjacent boundaries.
    pub fn isolate_cells(&mut self, sel: &CellSelection, frame: usize) -> Result<(), TrackError> {
        self.check_frame(frame)?;
        let vids = self.selection_vertices(frame, sel);
        if vids.is_empty() {
            return Ok(());
        }

        for boundary in Self::boundaries_of(frame, self.map.frame_count()) {
            let Some(graph) = self.map.boundary_at_mut(boundary) else {
                continue;
            };
            for &vid in &vids {
                if let Some(v) = graph.vertex_for(frame, vid) {
                    graph.isolate(v);
                }
            }
        }
        debug!(frame, vertices = vids.len(), "cells isolated");
        Ok(())
    }

    // ------------------------------------------------------------------
    // combine / group / divide
    // ------------------------------------------------------------------

    /// Fold every selected cell into `target` via the O(1) accumulator
    /// merge, dropping the absorbed cells and re-pointing their
    /// boundary-graph edges onto the target's vertex.
    pub fn combine_cells(
        &mut self,
        target: CellKey,
        sel: &CellSelection,
        frame: usize,
    ) -> Result<(), TrackError> {
        self.check_frame(frame)?;
        if !self
            .map
            .cells_at(frame)
            .expect("frame checked")
            .contains_key(&target)
        {
            return Err(TrackError::CellNotFound { key: target, frame });
        }
        let target_vid = self
            .ensure_cell_vertex(frame, target)
            .expect("target existence checked");

        let mut relinked: Vec<u32> = Vec::new();
        {
            let fr = self.map.frame_mut(frame).expect("frame checked");
            for &key in sel {
                if key == target {
                    continue;
                }
                let Some(absorbed) = fr.cells.remove(&key) else {
                    continue;
                };
                fr.adjacency.remove_cell(key);
                fr.cells
                    .get_mut(&target)
                    .expect("target stays resident")
                    .merge(&absorbed);

                if let Some(vid) = absorbed.vertex_id() {
                    if let Some(vertex) = fr.vertices.get_mut(&vid) {
                        vertex.remove_cell(key);
                        if vertex.cell_count() == 0 {
                            fr.vertices.remove(&vid);
                            relinked.push(vid);
                        }
                    }
                }
            }
        }

        for boundary in Self::boundaries_of(frame, self.map.frame_count()) {
            let Some(graph) = self.map.boundary_at_mut(boundary) else {
                continue;
            };
            for &vid in &relinked {
                graph.relink(frame, vid, target_vid, true);
            }
        }

        let fr = self.map.frame_mut(frame).expect("frame checked");
        if let Some(vertex) = fr.vertices.get_mut(&target_vid) {
            vertex.update(&mut fr.cells);
        }
        debug!(%target, frame, absorbed = sel.len(), "cells combined");
        Ok(())
    }

    /// Merge the selections' lineage vertices into one identity without
    /// touching the cells themselves: the first selected cell's vertex
    /// absorbs the others' members and boundary edges. This is how
    /// partition-split fragments recovered from the adjacency graph are
    /// declared to be one object.
    pub fn group_cells(&mut self, sel: &CellSelection, frame: usize) -> Result<(), TrackError> {
        self.check_frame(frame)?;
        let mut vids: Vec<u32> = Vec::new();
        for &key in sel {
            if let Some(vid) = self.ensure_cell_vertex(frame, key) {
                if !vids.contains(&vid) {
                    vids.push(vid);
                }
            }
        }
        let Some((&keeper, rest)) = vids.split_first() else {
            return Ok(());
        };
        if rest.is_empty() {
            return Ok(());
        }

        for boundary in Self::boundaries_of(frame, self.map.frame_count()) {
            let Some(graph) = self.map.boundary_at_mut(boundary) else {
                continue;
            };
            for &vid in rest {
                graph.relink(frame, vid, keeper, false);
            }
        }

        let fr = self.map.frame_mut(frame).expect("frame checked");
        for &vid in rest {
            let Some(vertex) = fr.vertices.remove(&vid) else {
                continue;
            };
            for &member in vertex.cells() {
                if let Some(cell) = fr.cells.get_mut(&member) {
                    cell.set_vertex_id(Some(keeper));
                }
                if let Some(kv) = fr.vertices.get_mut(&keeper) {
                    kv.add_cell_primary(member);
                }
            }
        }
        if let Some(kv) = fr.vertices.get_mut(&keeper) {
            kv.update(&mut fr.cells);
        }
        debug!(frame, keeper, merged = rest.len(), "lineage grouped");
        Ok(())
    }

    /// Split a multi-cell identity: every selected cell except the
    /// largest member leaves its vertex and becomes an independent
    /// identity. Boundary edges are fanned out to the new vertices with
    /// `link` left unset; re-linking is an explicit follow-up decision.
    pub fn divide_cells(&mut self, sel: &CellSelection, frame: usize) -> Result<(), TrackError> {
        self.check_frame(frame)?;

        // group the listed cells by their current identity
        let mut groups: BTreeMap<u32, Vec<CellKey>> = BTreeMap::new();
        for &key in sel {
            if let Some(vid) = self.vertex_of_cell(frame, key) {
                groups.entry(vid).or_default().push(key);
            }
        }

        let mut fanouts: Vec<(u32, u32)> = Vec::new(); // (old vid, new vid)
        {
            let fr = self.map.frame_mut(frame).expect("frame checked");
            for (vid, members) in &groups {
                if members.len() < 2 {
                    continue;
                }
                let keep = members
                    .iter()
                    .copied()
                    .max_by_key(|k| fr.cells.get(k).map(|c| c.size_voxels()).unwrap_or(0))
                    .expect("group is non-empty");

                for &key in members {
                    if key == keep {
                        continue;
                    }
                    if let Some(vertex) = fr.vertices.get_mut(vid) {
                        vertex.remove_cell(key);
                    }
                    // the split-off identity is named after its cell,
                    // reusing an existing vertex of that id if present
                    let new_vid = key.id();
                    let vertex = fr
                        .vertices
                        .entry(new_vid)
                        .or_insert_with(|| Vertex::new(new_vid));
                    vertex.add_cell_primary(key);
                    if let Some(cell) = fr.cells.get_mut(&key) {
                        cell.set_vertex_id(Some(new_vid));
                    }
                    vertex.update(&mut fr.cells);
                    fanouts.push((*vid, new_vid));
                }
                if let Some(vertex) = fr.vertices.get_mut(vid) {
                    vertex.update(&mut fr.cells);
                }
            }
        }

        for boundary in Self::boundaries_of(frame, self.map.frame_count()) {
            let Some(graph) = self.map.boundary_at_mut(boundary) else {
                continue;
            };
            for &(old_vid, new_vid) in &fanouts {
                let Some(old_v) = graph.vertex_for(frame, old_vid) else {
                    continue;
                };
                let new_v = graph.ensure_vertex(frame, new_vid, 0);
                graph.copy_edges_unlinked(old_v, new_v);
            }
        }
        debug!(frame, split = fanouts.len(), "cells divided");
        Ok(())
    }

    // ------------------------------------------------------------------
    // re-identification
    // ------------------------------------------------------------------

    /// Re-key a cell to a new label id within its brick, updating the
    /// registry, its lineage membership and the adjacency graph. Fails
    /// on key collision.
    pub fn replace_cell_id(
        &mut self,
        old_key: CellKey,
        new_id: u32,
        frame: usize,
    ) -> Result<(), TrackError> {
        self.check_frame(frame)?;
        let new_key = CellKey::new(new_id, old_key.brick_id());
        let fr = self.map.frame_mut(frame).expect("frame checked");
        if fr.cells.contains_key(&new_key) {
            return Err(TrackError::KeyCollision {
                key: new_key,
                frame,
            });
        }
        let Some(mut cell) = fr.cells.remove(&old_key) else {
            return Err(TrackError::CellNotFound {
                key: old_key,
                frame,
            });
        };
        cell.rekey(new_id);
        let vid = cell.vertex_id();
        fr.cells.insert(cell);

        if let Some(vid) = vid {
            if let Some(vertex) = fr.vertices.get_mut(&vid) {
                vertex.replace_cell(old_key, new_key);
            }
        }
        fr.adjacency.rekey_cell(old_key, new_key);
        debug!(%old_key, %new_key, frame, "cell re-keyed");
        Ok(())
    }

    /// After an external re-segmentation of `frame`: drop the replaced
    /// cells, insert their replacements, and re-attach each replacement
    /// to the closest identity with intersecting bounds on each
    /// adjacent frame.
    pub fn relink_cells(
        &mut self,
        replaced: &CellSelection,
        replacements: Vec<Cell>,
        frame: usize,
    ) -> Result<(), TrackError> {
        self.check_frame(frame)?;
        let new_keys: Vec<CellKey> = replacements.iter().map(|c| c.key()).collect();
        self.remove_cells(replaced, frame)?;
        self.add_cells(replacements, frame)?;

        for &key in &new_keys {
            let Some(vid) = self.vertex_of_cell(frame, key) else {
                continue;
            };
            let (center, bounds) = {
                let fr = self.map.frame_mut(frame).expect("frame checked");
                let Some(vertex) = fr.vertices.get_mut(&vid) else {
                    continue;
                };
                vertex.update(&mut fr.cells);
                (vertex.center(), *vertex.bounds())
            };
            let (size_voxels, size_weighted) = {
                let fr = self.map.frame(frame).expect("frame checked");
                let v = &fr.vertices[&vid];
                (v.size_voxels(), v.size_weighted())
            };

            let frame_count = self.map.frame_count();
            for neighbor in [frame.checked_sub(1), Some(frame + 1)]
                .into_iter()
                .flatten()
                .filter(|&f| f < frame_count)
            {
                // closest identity in the neighbor frame whose bounds
                // touch the replacement's
                let candidate = self
                    .map
                    .vertices_at(neighbor)
                    .expect("neighbor in range")
                    .values()
                    .filter(|v| v.bounds().intersects(&bounds))
                    .map(|v| {
                        let d = (v.center() - center).norm();
                        (v.id(), v.size_voxels(), v.size_weighted(), d)
                    })
                    .min_by(|a, b| a.3.partial_cmp(&b.3).unwrap_or(std::cmp::Ordering::Equal));
                let Some((nid, nsize_v, nsize_w, dist)) = candidate else {
                    continue;
                };

                let boundary = frame.min(neighbor);
                let Some(graph) = self.map.boundary_at_mut(boundary) else {
                    continue;
                };
                let va = graph.ensure_vertex(frame, vid, 0);
                let vb = graph.ensure_vertex(neighbor, nid, 0);
                graph.force_link(
                    va,
                    vb,
                    size_voxels.max(nsize_v),
                    size_weighted.max(nsize_w),
                    dist,
                );
            }
        }
        debug!(frame, replaced = replaced.len(), added = new_keys.len(), "cells relinked");
        Ok(())
    }

    // ------------------------------------------------------------------
    // queries
    // ------------------------------------------------------------------

    /// Propagate a selection across one boundary: every member cell of
    /// every identity reachable over a `link`-marked edge.
    pub fn get_mapped_cells(
        &self,
        sel: &CellSelection,
        frame1: usize,
        frame2: usize,
    ) -> Result<CellSelection, TrackError> {
        self.check_adjacent(frame1, frame2)?;
        let mut out = CellSelection::new();
        let Some(graph) = self.map.inter_graph_between(frame1, frame2) else {
            return Ok(out);
        };
        let Some(target_cells) = self.map.cells_at(frame2) else {
            return Ok(out);
        };
        let Some(target_vertices) = self.map.vertices_at(frame2) else {
            return Ok(out);
        };

        for &key in sel {
            let Some(vid) = self.vertex_of_cell(frame1, key) else {
                continue;
            };
            let Some(v1) = graph.vertex_for(frame1, vid) else {
                continue;
            };
            for (n, e) in graph.adjacent(v1) {
                if !graph.edge(e).map(|d| d.link).unwrap_or(false) {
                    continue;
                }
                let Some(nv) = graph.vertex(n) else {
                    continue;
                };
                if nv.frame() != frame2 {
                    continue;
                }
                let Some(vertex2) = target_vertices.get(&nv.vertex_id()) else {
                    continue;
                };
                for &member in vertex2.cells() {
                    if target_cells.contains_key(&member) {
                        out.insert(member);
                    }
                }
            }
        }
        Ok(out)
    }

    /// Classify the frame's identities by linked degree on both
    /// adjacent boundaries. Identities below the size threshold are
    /// ignored.
    pub fn get_link_lists(&self, frame: usize) -> Result<LinkLists, TrackError> {
        self.check_frame(frame)?;
        let vertices = self.map.vertices_at(frame).expect("frame checked");
        let mut lists = LinkLists::default();

        let classify = |boundary: usize, orphans: &mut Vec<u32>, multi: &mut Vec<u32>| {
            let Some(graph) = self.map.boundary_at(boundary) else {
                return;
            };
            for vertex in vertices.values() {
                if vertex.size_voxels() < self.config.size_threshold {
                    continue;
                }
                match graph.vertex_for(frame, vertex.id()) {
                    None => orphans.push(vertex.id()),
                    Some(v) => match graph.linked_degree(v) {
                        0 => orphans.push(vertex.id()),
                        1 => {}
                        _ => multi.push(vertex.id()),
                    },
                }
            }
        };

        if frame > 0 {
            classify(frame - 1, &mut lists.in_orphans, &mut lists.in_multi);
        }
        if frame + 1 < self.map.frame_count() {
            classify(frame, &mut lists.out_orphans, &mut lists.out_multi);
        }
        for list in [
            &mut lists.in_orphans,
            &mut lists.out_orphans,
            &mut lists.in_multi,
            &mut lists.out_multi,
        ] {
            list.sort_unstable();
        }
        Ok(lists)
    }

    /// Cells whose identity was revisited at least `uncertainty_low`
    /// times on some adjacent boundary, i.e. merge/split decisions the
    /// automatic passes kept flip-flopping on.
    pub fn cells_by_uncertainty(&self, frame: usize) -> Result<CellSelection, TrackError> {
        self.check_frame(frame)?;
        let vertices = self.map.vertices_at(frame).expect("frame checked");
        let mut out = CellSelection::new();
        for vertex in vertices.values() {
            let uncertain = Self::boundaries_of(frame, self.map.frame_count())
                .into_iter()
                .filter_map(|b| self.map.boundary_at(b))
                .filter_map(|g| g.vertex_for(frame, vertex.id()).and_then(|v| g.vertex(v)))
                .any(|v| v.count() >= self.config.uncertainty_low);
            if uncertain {
                out.extend(vertex.cells().iter().copied());
            }
        }
        Ok(out)
    }

    /// Recover the partition-split component of every selected cell via
    /// the frame's adjacency graph, using the configured contact
    /// threshold.
    pub fn linked_components(
        &mut self,
        sel: &CellSelection,
        frame: usize,
    ) -> Result<CellSelection, TrackError> {
        self.check_frame(frame)?;
        let threshold = self.config.contact_threshold;
        let graph = self
            .map
            .adjacency_at_mut(frame)
            .expect("frame checked");
        Ok(graph.linked_components_batch(sel, threshold))
    }

    // ------------------------------------------------------------------
    // persistence
    // ------------------------------------------------------------------

    /// Write the whole map to a self-contained track file.
    pub fn export(&self, path: &std::path::Path) -> Result<(), TrackError> {
        persist::save(self.map, path)
    }

    /// Replace the whole map with the contents of a track file.
    pub fn import(&mut self, path: &std::path::Path) -> Result<(), TrackError> {
        let loaded = persist::load(path)?;
        *self.map = loaded;
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::CellSeed;
    use crate::geometry::Aabb;
    use crate::track_map::SegmentedFrame;
    use nalgebra::Vector3;

    /// Seed with its center at `center` and the given voxel count.
    fn seed(id: u32, size: u32, center: (f64, f64, f64)) -> CellSeed {
        let n = size as f64;
        let c = Point3::new(center.0, center.1, center.2);
        CellSeed {
            id,
            brick_id: 0,
            voxel_count: size,
            weighted_sum: n,
            sum_sq: n,
            min: 1.0,
            max: 1.0,
            position_sum: c.coords * n,
            bounds: Aabb::from_corners(
                Point3::new(c.x - 1.0, c.y - 1.0, c.z - 1.0),
                Point3::new(c.x + 1.0, c.y + 1.0, c.z + 1.0),
            ),
            ext_voxels: 0,
            ext_weighted: 0.0,
            count_lo: 0,
            count_hi: 0,
        }
    }

    fn key(id: u32) -> CellKey {
        CellKey::new(id, 0)
    }

    fn sel(ids: &[u32]) -> CellSelection {
        ids.iter().map(|&id| key(id)).collect()
    }

    /// Frame 0: A(id 1, size 10, center origin), B(id 2, size 5,
    /// center (1,0,0)); frame 1: C(id 3, size 14).
    fn scenario_map() -> TrackMap {
        let mut map = TrackMap::new();
        map.add_frame(SegmentedFrame {
            frame: 0,
            scale: Vector3::new(1.0, 1.0, 1.0),
            cells: vec![seed(1, 10, (0.0, 0.0, 0.0)), seed(2, 5, (1.0, 0.0, 0.0))],
        })
        .unwrap();
        map.add_frame(SegmentedFrame {
            frame: 1,
            scale: Vector3::new(1.0, 1.0, 1.0),
            cells: vec![seed(3, 14, (0.5, 0.0, 0.0))],
        })
        .unwrap();
        map
    }

    #[test]
    fn test_out_of_range_frame_is_rejected() {
        let mut map = scenario_map();
        let mut proc = TrackMapProcessor::new(&mut map);
        let err = proc
            .link_cells(&sel(&[1]), &sel(&[3]), 0, 2, false)
            .unwrap_err();
        assert!(matches!(err, TrackError::FrameOutOfRange { .. }));
    }

    #[test]
    fn test_self_link_is_rejected() {
        let mut map = scenario_map();
        let mut proc = TrackMapProcessor::new(&mut map);
        let err = proc
            .link_cells(&sel(&[1]), &sel(&[1]), 0, 0, false)
            .unwrap_err();
        assert!(matches!(err, TrackError::FramesNotAdjacent { .. }));
    }

    #[test]
    fn test_empty_selection_is_silent_noop() {
        let mut map = scenario_map();
        let mut proc = TrackMapProcessor::new(&mut map);
        proc.link_cells(&sel(&[]), &sel(&[3]), 0, 1, false).unwrap();
        assert_eq!(map.boundary_at(0).unwrap().edge_count(), 0);
    }

    #[test]
    fn test_scenario_link_map_combine() {
        let mut map = scenario_map();
        let mut proc = TrackMapProcessor::new(&mut map);

        // two link=true edges: A-C and B-C
        proc.link_cells(&sel(&[1, 2]), &sel(&[3]), 0, 1, false)
            .unwrap();
        {
            let graph = map.boundary_at(0).unwrap();
            assert_eq!(graph.edge_count(), 2);
            let vc = graph.vertex_for(1, 3).unwrap();
            assert_eq!(graph.linked_degree(vc), 2);
        }

        // selection propagates to C
        let mut proc = TrackMapProcessor::new(&mut map);
        let mapped = proc.get_mapped_cells(&sel(&[1, 2]), 0, 1).unwrap();
        assert_eq!(mapped, sel(&[3]));

        // and back to A and B
        let mapped_back = proc.get_mapped_cells(&sel(&[3]), 1, 0).unwrap();
        assert_eq!(mapped_back, sel(&[1, 2]));

        // combining B into A sums the voxel counts
        proc.combine_cells(key(1), &sel(&[2]), 0).unwrap();
        let cells = map.cells_at(0).unwrap();
        assert_eq!(cells.get(&key(1)).unwrap().size_voxels(), 15);
        assert!(!cells.contains_key(&key(2)));
    }

    #[test]
    fn test_combine_repoints_boundary_edges() {
        let mut map = scenario_map();
        let mut proc = TrackMapProcessor::new(&mut map);
        proc.link_cells(&sel(&[1, 2]), &sel(&[3]), 0, 1, false)
            .unwrap();
        proc.combine_cells(key(1), &sel(&[2]), 0).unwrap();

        let graph = map.boundary_at(0).unwrap();
        // B's vertex is gone, its edge was merged into A-C
        assert!(graph.vertex_for(0, 2).is_none());
        assert_eq!(graph.edge_count(), 1);
        let va = graph.vertex_for(0, 1).unwrap();
        assert_eq!(graph.linked_degree(va), 1);
    }

    #[test]
    fn test_scenario_isolate_clears_both_edges() {
        let mut map = scenario_map();
        let mut proc = TrackMapProcessor::new(&mut map);
        proc.link_cells(&sel(&[1, 2]), &sel(&[3]), 0, 1, false)
            .unwrap();
        proc.isolate_cells(&sel(&[1]), 0).unwrap();

        let mapped = {
            let proc = TrackMapProcessor::new(&mut map);
            proc.get_mapped_cells(&sel(&[1]), 0, 1).unwrap()
        };
        assert!(mapped.is_empty());

        // B's link survives
        let proc = TrackMapProcessor::new(&mut map);
        assert_eq!(proc.get_mapped_cells(&sel(&[2]), 0, 1).unwrap(), sel(&[3]));
    }

    #[test]
    fn test_link_exclusivity() {
        let mut map = TrackMap::new();
        map.add_frame(SegmentedFrame {
            frame: 0,
            scale: Vector3::new(1.0, 1.0, 1.0),
            cells: vec![seed(1, 10, (0.0, 0.0, 0.0))],
        })
        .unwrap();
        map.add_frame(SegmentedFrame {
            frame: 1,
            scale: Vector3::new(1.0, 1.0, 1.0),
            cells: vec![seed(3, 6, (0.0, 0.0, 0.0)), seed(4, 7, (2.0, 0.0, 0.0))],
        })
        .unwrap();

        let mut proc = TrackMapProcessor::new(&mut map);
        proc.link_cells(&sel(&[1]), &sel(&[3, 4]), 0, 1, false)
            .unwrap();
        {
            let graph = map.boundary_at(0).unwrap();
            let va = graph.vertex_for(0, 1).unwrap();
            assert_eq!(graph.linked_degree(va), 2);
        }

        let mut proc = TrackMapProcessor::new(&mut map);
        proc.link_cells(&sel(&[1]), &sel(&[3]), 0, 1, true).unwrap();
        let graph = map.boundary_at(0).unwrap();
        let va = graph.vertex_for(0, 1).unwrap();
        assert_eq!(graph.linked_degree(va), 1, "exactly one link after exclusive");
        // the A-D edge still exists, merely unlinked
        assert_eq!(graph.edge_count(), 2);
    }

    #[test]
    fn test_unlink_keeps_edges_for_diagnostics() {
        let mut map = scenario_map();
        let mut proc = TrackMapProcessor::new(&mut map);
        proc.link_cells(&sel(&[1]), &sel(&[3]), 0, 1, false).unwrap();
        proc.unlink_cells(&sel(&[1]), &sel(&[3]), 0, 1).unwrap();

        let graph = map.boundary_at(0).unwrap();
        assert_eq!(graph.edge_count(), 1);
        let va = graph.vertex_for(0, 1).unwrap();
        assert_eq!(graph.linked_degree(va), 0);
    }

    #[test]
    fn test_group_then_divide_restores_sizes() {
        let mut map = scenario_map();
        let mut proc = TrackMapProcessor::new(&mut map);
        proc.link_cells(&sel(&[1]), &sel(&[3]), 0, 1, false).unwrap();

        // declare A and B one identity, then split them apart again
        proc.group_cells(&sel(&[1, 2]), 0).unwrap();
        {
            let vertices = map.vertices_at(0).unwrap();
            assert_eq!(vertices.len(), 1);
            assert_eq!(vertices.values().next().unwrap().cell_count(), 2);
        }

        let mut proc = TrackMapProcessor::new(&mut map);
        proc.divide_cells(&sel(&[1, 2]), 0).unwrap();
        let vertices = map.vertices_at(0).unwrap();
        assert_eq!(vertices.len(), 2);
        // statistics were never touched
        let cells = map.cells_at(0).unwrap();
        assert_eq!(cells.get(&key(1)).unwrap().size_voxels(), 10);
        assert_eq!(cells.get(&key(2)).unwrap().size_voxels(), 5);
        // the split-off identity inherited the boundary edge, unlinked
        let graph = map.boundary_at(0).unwrap();
        let split_vid = map
            .cells_at(0)
            .unwrap()
            .get(&key(2))
            .unwrap()
            .vertex_id()
            .unwrap();
        let vs = graph.vertex_for(0, split_vid).unwrap();
        assert_eq!(graph.adjacent(vs).count(), 1);
        assert_eq!(graph.linked_degree(vs), 0);
    }

    #[test]
    fn test_add_cell_duplicate_gets_fresh_key() {
        let mut map = scenario_map();
        let mut proc = TrackMapProcessor::new(&mut map);
        let new_key = proc.add_cell_duplicate(key(1), 0).unwrap();
        assert_ne!(new_key, key(1));

        let cells = map.cells_at(0).unwrap();
        assert_eq!(cells.len(), 3);
        assert_eq!(cells.get(&new_key).unwrap().size_voxels(), 10);
        // duplicate has its own lineage
        let vid_orig = map.cells_at(0).unwrap().get(&key(1)).unwrap().vertex_id();
        let vid_copy = map.cells_at(0).unwrap().get(&new_key).unwrap().vertex_id();
        assert!(vid_copy.is_some());
        assert_ne!(vid_orig, vid_copy);
    }

    #[test]
    fn test_add_cell_duplicate_out_of_range() {
        let mut map = scenario_map();
        let mut proc = TrackMapProcessor::new(&mut map);
        assert!(proc.add_cell_duplicate(key(1), 9).is_err());
    }

    #[test]
    fn test_replace_cell_id() {
        let mut map = scenario_map();
        let mut proc = TrackMapProcessor::new(&mut map);
        proc.link_cells(&sel(&[1]), &sel(&[3]), 0, 1, false).unwrap();

        proc.replace_cell_id(key(1), 77, 0).unwrap();
        let cells = map.cells_at(0).unwrap();
        assert!(cells.contains_key(&key(77)));
        assert!(!cells.contains_key(&key(1)));
        // lineage membership follows the new key
        let vid = cells.get(&key(77)).unwrap().vertex_id().unwrap();
        assert!(map.vertices_at(0).unwrap()[&vid].contains(key(77)));

        // collision is rejected
        let mut proc = TrackMapProcessor::new(&mut map);
        let err = proc.replace_cell_id(key(77), 2, 0).unwrap_err();
        assert!(matches!(err, TrackError::KeyCollision { .. }));
    }

    #[test]
    fn test_get_link_lists_classification() {
        let mut map = TrackMap::new();
        map.add_frame(SegmentedFrame {
            frame: 0,
            scale: Vector3::new(1.0, 1.0, 1.0),
            cells: vec![
                seed(1, 100, (0.0, 0.0, 0.0)),
                seed(2, 100, (5.0, 0.0, 0.0)),
                seed(9, 100, (9.0, 0.0, 0.0)),
            ],
        })
        .unwrap();
        map.add_frame(SegmentedFrame {
            frame: 1,
            scale: Vector3::new(1.0, 1.0, 1.0),
            cells: vec![seed(3, 100, (0.0, 0.0, 0.0)), seed(4, 100, (5.0, 0.0, 0.0))],
        })
        .unwrap();

        let mut proc = TrackMapProcessor::new(&mut map);
        // 1 → {3, 4} (multi), 2 → 3; 9 stays orphan
        proc.link_cells(&sel(&[1]), &sel(&[3, 4]), 0, 1, false)
            .unwrap();
        proc.link_cells(&sel(&[2]), &sel(&[3]), 0, 1, false).unwrap();

        let lists = proc.get_link_lists(0).unwrap();
        assert_eq!(lists.out_orphans, vec![9]);
        assert_eq!(lists.out_multi, vec![1]);
        assert!(lists.in_orphans.is_empty(), "frame 0 has no in-boundary");

        let lists1 = proc.get_link_lists(1).unwrap();
        // vertex 3 is linked from both 1 and 2
        assert_eq!(lists1.in_multi, vec![3]);
        assert!(lists1.in_orphans.is_empty());
    }

    #[test]
    fn test_link_lists_respect_size_threshold() {
        let mut map = TrackMap::new();
        map.add_frame(SegmentedFrame {
            frame: 0,
            scale: Vector3::new(1.0, 1.0, 1.0),
            cells: vec![seed(1, 3, (0.0, 0.0, 0.0))], // below default threshold
        })
        .unwrap();
        map.add_frame(SegmentedFrame {
            frame: 1,
            scale: Vector3::new(1.0, 1.0, 1.0),
            cells: vec![],
        })
        .unwrap();
        let mut proc = TrackMapProcessor::new(&mut map);
        // give the small cell a vertex so it could be classified
        proc.link_cells(&sel(&[1]), &sel(&[]), 0, 1, false).unwrap();
        let lists = proc.get_link_lists(0).unwrap();
        assert!(lists.out_orphans.is_empty());
    }

    #[test]
    fn test_relink_cells_reattaches_replacements() {
        let mut map = scenario_map();
        let mut proc = TrackMapProcessor::new(&mut map);
        proc.link_cells(&sel(&[1]), &sel(&[3]), 0, 1, false).unwrap();

        // re-segment frame 0: cell 1 replaced by cell 11 at the same place
        let replacement = {
            let src = map.cells_at(0).unwrap().get(&key(1)).unwrap().clone();
            src.duplicate(11)
        };
        let mut proc = TrackMapProcessor::new(&mut map);
        proc.relink_cells(&sel(&[1]), vec![replacement], 0).unwrap();

        let cells = map.cells_at(0).unwrap();
        assert!(!cells.contains_key(&key(1)));
        assert!(cells.contains_key(&key(11)));

        // the replacement is linked to C again
        let proc = TrackMapProcessor::new(&mut map);
        assert_eq!(proc.get_mapped_cells(&sel(&[11]), 0, 1).unwrap(), sel(&[3]));
    }

    #[test]
    fn test_cells_by_uncertainty_consumes_counters() {
        let mut map = scenario_map();
        let mut proc = TrackMapProcessor::new(&mut map);
        proc.link_cells(&sel(&[1]), &sel(&[3]), 0, 1, false).unwrap();

        // mark A's boundary vertex as heavily revisited
        {
            let graph = map.boundary_at_mut(0).unwrap();
            let va = graph.vertex_for(0, 1).unwrap();
            graph.set_vertex_uncertainty(va, 5);
        }
        let proc = TrackMapProcessor::new(&mut map);
        let uncertain = proc.cells_by_uncertainty(0).unwrap();
        assert_eq!(uncertain, sel(&[1]));
    }
}

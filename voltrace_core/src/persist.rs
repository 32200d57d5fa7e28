//! Track file import/export.
//!
//! A track file is a self-contained snapshot of a whole [`TrackMap`]:
//! an eight-byte magic, a little-endian format version, and a bincode
//! body with fixed-width integers. Round-tripping a map through
//! export/import reproduces the full data model: registries, lineage,
//! adjacency and boundary graphs, uncertainty counters.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::adjacency::ContactEdge;
use crate::cell::{CellKey, CellList};
use crate::error::TrackError;
use crate::lineage::Vertex;
use crate::linkage::LinkEdge;
use crate::track_map::TrackMap;

const MAGIC: &[u8; 8] = b"VOLTRACE";
const VERSION: u32 = 1;

fn track_config() -> impl bincode::config::Config {
    bincode::config::standard()
        .with_fixed_int_encoding()
        .with_little_endian()
}

// ============================================================================
// FILE MODEL
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct TrackFile {
    counter: u32,
    frames: Vec<FrameRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct FrameRecord {
    /// The full registry, including cells that never joined a lineage.
    /// Carries the frame's physical scale and id bounds with it.
    cells: CellList,
    vertices: Vec<Vertex>,
    adjacency: Vec<AdjEdgeRecord>,
    /// Boundary graph towards the previous frame; absent for frame 0.
    boundary: Option<BoundaryRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct AdjEdgeRecord {
    a: CellKey,
    b: CellKey,
    data: ContactEdge,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct BoundaryRecord {
    index: usize,
    counter: u32,
    vertices: Vec<InterVertexRecord>,
    edges: Vec<InterEdgeRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct InterVertexRecord {
    frame: usize,
    id: u32,
    count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct InterEdgeRecord {
    /// Lower-frame endpoint id.
    id1: u32,
    /// Higher-frame endpoint id.
    id2: u32,
    data: LinkEdge,
}

// ============================================================================
// ENCODE
// ============================================================================

fn snapshot(map: &TrackMap) -> TrackFile {
    let mut frames = Vec::with_capacity(map.frame_count());
    for f in 0..map.frame_count() {
        let cells = map.cells_at(f).cloned().unwrap_or_default();

        let mut vertices: Vec<Vertex> = map
            .vertices_at(f)
            .map(|list| list.values().cloned().collect())
            .unwrap_or_default();
        vertices.sort_by_key(|v| v.id());

        let mut adjacency: Vec<AdjEdgeRecord> = map
            .adjacency_at(f)
            .map(|graph| {
                graph
                    .edges()
                    .map(|(a, b, data)| AdjEdgeRecord { a, b, data: *data })
                    .collect()
            })
            .unwrap_or_default();
        adjacency.sort_by_key(|e| (e.a, e.b));

        let boundary = if f == 0 {
            None
        } else {
            map.boundary_at(f - 1).map(|graph| {
                let mut vertices: Vec<InterVertexRecord> = graph
                    .vertices()
                    .map(|v| InterVertexRecord {
                        frame: v.frame(),
                        id: v.vertex_id(),
                        count: v.count(),
                    })
                    .collect();
                vertices.sort_by_key(|v| (v.frame, v.id));

                let mut edges: Vec<InterEdgeRecord> = graph
                    .edges()
                    .map(|(a, b, data)| InterEdgeRecord {
                        id1: a.vertex_id(),
                        id2: b.vertex_id(),
                        data: *data,
                    })
                    .collect();
                edges.sort_by_key(|e| (e.id1, e.id2));

                BoundaryRecord {
                    index: graph.index(),
                    counter: graph.counter(),
                    vertices,
                    edges,
                }
            })
        };

        frames.push(FrameRecord {
            cells,
            vertices,
            adjacency,
            boundary,
        });
    }
    TrackFile {
        counter: map.counter(),
        frames,
    }
}

/// Serialize a whole map into track-file bytes.
pub fn encode(map: &TrackMap) -> Result<Vec<u8>, TrackError> {
    let file = snapshot(map);
    let body = bincode::serde::encode_to_vec(&file, track_config())?;
    let mut out = Vec::with_capacity(MAGIC.len() + 4 + body.len());
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&VERSION.to_le_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

// ============================================================================
// DECODE
// ============================================================================

fn rebuild(file: TrackFile) -> TrackMap {
    let mut map = TrackMap::new();
    map.set_counter(file.counter);
    let frame_count = file.frames.len();
    if frame_count > 0 {
        map.extend_to(frame_count - 1);
    }

    for (f, record) in file.frames.into_iter().enumerate() {
        {
            let fr = map.frame_mut(f).expect("frame extended above");
            fr.cells = record.cells;
            for vertex in record.vertices {
                fr.vertices.insert(vertex.id(), vertex);
            }
            for edge in record.adjacency {
                fr.adjacency.add_edge(edge.a, edge.b, edge.data);
            }
        }

        if let Some(boundary) = record.boundary {
            let graph = map
                .boundary_at_mut(f - 1)
                .expect("boundary exists for frame > 0");
            graph.set_counter(boundary.counter);
            for v in &boundary.vertices {
                let key = graph.ensure_vertex(v.frame, v.id, v.count);
                graph.set_vertex_uncertainty(key, v.count);
            }
            for e in boundary.edges {
                graph.add_edge_record(
                    f - 1,
                    e.id1,
                    vertex_count(&boundary.vertices, f - 1, e.id1),
                    f,
                    e.id2,
                    vertex_count(&boundary.vertices, f, e.id2),
                    e.data,
                );
            }
        }
    }
    map
}

fn vertex_count(vertices: &[InterVertexRecord], frame: usize, id: u32) -> u32 {
    vertices
        .iter()
        .find(|v| v.frame == frame && v.id == id)
        .map(|v| v.count)
        .unwrap_or(0)
}

/// Deserialize track-file bytes into a fresh map.
pub fn decode(bytes: &[u8]) -> Result<TrackMap, TrackError> {
    if bytes.len() < MAGIC.len() + 4 || &bytes[..MAGIC.len()] != MAGIC {
        return Err(TrackError::BadHeader);
    }
    let version = u32::from_le_bytes(
        bytes[MAGIC.len()..MAGIC.len() + 4]
            .try_into()
            .expect("slice length checked"),
    );
    if version != VERSION {
        return Err(TrackError::UnsupportedVersion(version));
    }

    let body = &bytes[MAGIC.len() + 4..];
    let (file, read) = bincode::serde::decode_from_slice::<TrackFile, _>(body, track_config())?;
    if read != body.len() {
        return Err(TrackError::TrailingBytes(body.len() - read));
    }
    debug!(frames = file.frames.len(), "track file decoded");
    Ok(rebuild(file))
}

// ============================================================================
// FILE I/O
// ============================================================================

/// Write `map` to a track file at `path`.
pub fn save(map: &TrackMap, path: &Path) -> Result<(), TrackError> {
    let bytes = encode(map)?;
    std::fs::write(path, &bytes)?;
    debug!(?path, bytes = bytes.len(), "track file written");
    Ok(())
}

/// Load a track file from `path`.
pub fn load(path: &Path) -> Result<TrackMap, TrackError> {
    let bytes = std::fs::read(path)?;
    decode(&bytes)
}

// ============================================================================
// TESTS
// ============================================================================

//! Voltrace Core - Cell Lineage Tracking for Volumetric Time Series
//!
//! Tracks segmented objects ("cells": connected voxel blobs produced by
//! an external segmentation stage) across a time series of volumetric
//! frames, and answers the interactive queries behind ghost-trail
//! rendering. Three structures carry the model:
//! 1. **Adjacency graph**: per-frame contact graph reuniting one
//!    physical object split across spatial partitions ("bricks")
//! 2. **Boundary linkage graph**: per frame-pair graph whose
//!    `link`-marked edges define identity continuity over time
//! 3. **Incremental cell statistics**: O(1) merge/split bookkeeping,
//!    no raw voxel data retained
//!
//! Editing goes through [`TrackMapProcessor`], trail geometry through
//! [`TrackTrails`]; both take the [`TrackMap`] they operate on
//! explicitly.

pub mod adjacency;
pub mod cell;
pub mod color;
pub mod error;
pub mod geometry;
pub mod lineage;
pub mod linkage;
pub mod persist;
pub mod processor;
pub mod track_map;
pub mod trails;

// Re-export key types for convenience
pub use adjacency::CellGraph;
pub use cell::{Cell, CellKey, CellList, CellSeed, CellSelection};
pub use error::TrackError;
pub use lineage::{Vertex, VertexList};
pub use linkage::InterGraph;
pub use processor::{LinkLists, ProcessorConfig, TrackMapProcessor};
pub use track_map::{SegmentedFrame, TrackMap};
pub use trails::{TrackTrails, TrailPath};

//! Geometry primitives shared by the tracking core.
//!
//! - [`Aabb`]: axis-aligned bounding box with cheap extend/union,
//!   accumulated incrementally as voxels are added to a cell.
//! - [`ShapeMoments`]: running second-moment accumulator describing a
//!   cell's shape, fed with anisotropically scaled sample points.

use nalgebra::{Matrix3, Point3, Vector3};
use serde::{Deserialize, Serialize};

// ============================================================================
// AXIS-ALIGNED BOUNDING BOX
// ============================================================================

/// Axis-aligned bounding box in voxel coordinates.
///
/// A default-constructed box is empty: extending it with the first point
/// collapses both corners onto that point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Aabb {
    min: Point3<f64>,
    max: Point3<f64>,
    empty: bool,
}

impl Default for Aabb {
    fn default() -> Self {
        Self {
            min: Point3::origin(),
            max: Point3::origin(),
            empty: true,
        }
    }
}

impl Aabb {
    /// Empty box.
    pub fn new() -> Self {
        Self::default()
    }

    /// Box spanning two corners.
    pub fn from_corners(min: Point3<f64>, max: Point3<f64>) -> Self {
        Self {
            min,
            max,
            empty: false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.empty
    }

    /// Lower corner; the origin for an empty box.
    pub fn min(&self) -> Point3<f64> {
        self.min
    }

    /// Upper corner; the origin for an empty box.
    pub fn max(&self) -> Point3<f64> {
        self.max
    }

    /// Grow the box to contain `p`.
    pub fn extend(&mut self, p: Point3<f64>) {
        if self.empty {
            self.min = p;
            self.max = p;
            self.empty = false;
            return;
        }
        self.min = Point3::new(
            self.min.x.min(p.x),
            self.min.y.min(p.y),
            self.min.z.min(p.z),
        );
        self.max = Point3::new(
            self.max.x.max(p.x),
            self.max.y.max(p.y),
            self.max.z.max(p.z),
        );
    }

    /// Grow the box to contain all of `other`.
    pub fn union(&mut self, other: &Aabb) {
        if other.empty {
            return;
        }
        self.extend(other.min);
        self.extend(other.max);
    }

    /// Whether the two boxes overlap (inclusive on faces).
    pub fn intersects(&self, other: &Aabb) -> bool {
        if self.empty || other.empty {
            return false;
        }
        self.min.x <= other.max.x
            && self.max.x >= other.min.x
            && self.min.y <= other.max.y
            && self.max.y >= other.min.y
            && self.min.z <= other.max.z
            && self.max.z >= other.min.z
    }

    /// Copy of the box with both corners multiplied component-wise by
    /// `scale` (voxel units to physical units).
    pub fn scaled(&self, scale: &Vector3<f64>) -> Aabb {
        if self.empty {
            return *self;
        }
        Aabb::from_corners(
            Point3::new(
                self.min.x * scale.x,
                self.min.y * scale.y,
                self.min.z * scale.z,
            ),
            Point3::new(
                self.max.x * scale.x,
                self.max.y * scale.y,
                self.max.z * scale.z,
            ),
        )
    }

    pub fn diagonal(&self) -> Vector3<f64> {
        if self.empty {
            Vector3::zeros()
        } else {
            self.max - self.min
        }
    }
}

// ============================================================================
// SHAPE MOMENTS
// ============================================================================

/// Running first/second moments of a point set.
///
/// Samples are scaled component-wise before accumulation so that shape
/// descriptors come out in physical units even on anisotropic voxel
/// grids. Two accumulators combine additively, which is what keeps cell
/// merging O(1).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ShapeMoments {
    count: u64,
    sum: Vector3<f64>,
    /// Sum of outer products of the scaled samples.
    outer: Matrix3<f64>,
}

impl ShapeMoments {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accumulate one sample, scaled component-wise.
    pub fn add_point_scaled(&mut self, p: Point3<f64>, scale: &Vector3<f64>) {
        let s = Vector3::new(p.x * scale.x, p.y * scale.y, p.z * scale.z);
        self.count += 1;
        self.sum += s;
        self.outer += s * s.transpose();
    }

    /// Fold another accumulator into this one.
    pub fn add(&mut self, other: &ShapeMoments) {
        self.count += other.count;
        self.sum += other.sum;
        self.outer += other.outer;
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    /// Mean of the scaled samples; zero for an empty accumulator.
    pub fn mean(&self) -> Vector3<f64> {
        if self.count == 0 {
            return Vector3::zeros();
        }
        self.sum / self.count as f64
    }

    /// Sample covariance of the scaled points; zero for fewer than two
    /// samples.
    pub fn covariance(&self) -> Matrix3<f64> {
        if self.count < 2 {
            return Matrix3::zeros();
        }
        let n = self.count as f64;
        let mean = self.sum / n;
        (self.outer - mean * self.sum.transpose()) / (n - 1.0)
    }

    /// Principal axis lengths, largest first (square roots of the
    /// covariance eigenvalues, clamped at zero).
    pub fn principal_lengths(&self) -> Vector3<f64> {
        let eigen = self.covariance().symmetric_eigen();
        let mut vals: Vec<f64> = eigen.eigenvalues.iter().map(|v| v.max(0.0).sqrt()).collect();
        vals.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
        Vector3::new(vals[0], vals[1], vals[2])
    }
}

// ============================================================================
// TESTS
// ============================================================================

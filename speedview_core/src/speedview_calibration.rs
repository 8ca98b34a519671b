//! The "CALIBRATION" Engine - Planar Homography from a Four-Point Zone
//!
//! Maps pixel coordinates on the road plane to metric coordinates by solving
//! the standard 4-point correspondence system:
//! - front-left  → (0, 0)
//! - front-right → (length, 0)
//! - back-right  → (length, width)
//! - back-left   → (0, width)
//!
//! The 8×8 system is assembled on Hartley-normalised coordinates so that the
//! determinant test for ill-conditioning does not depend on the pixel scale.

use nalgebra::{Matrix3, SMatrix, SVector, Vector3};
use serde::{Deserialize, Serialize};

use crate::detection::PixelPoint;
use crate::error::EngineError;

/// Number of corners in a calibration zone.
pub const ZONE_POINTS: usize = 4;

/// |det| of the normalised 8×8 system below which it is treated as singular.
const DET_EPSILON: f64 = 1e-9;

/// Twice the triangle area, relative to the squared zone extent, below which
/// three corners count as collinear.
const COLLINEAR_TOLERANCE: f64 = 1e-6;

/// Homogeneous weight below which a projected point is at infinity.
const W_EPSILON: f64 = 1e-12;

/// A calibration corner in pixel space.
pub type CalibrationPoint = PixelPoint;

/// A point on the road plane, in metres from the front-left corner.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct MetricPoint {
    /// Along the front-left → front-right edge ("length").
    pub x: f64,
    /// Along the front-left → back-left edge ("width").
    pub y: f64,
}

impl MetricPoint {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    #[inline]
    pub fn distance_to(&self, other: &MetricPoint) -> f64 {
        (self.x - other.x).hypot(self.y - other.y)
    }
}

// ============================================================================
// HOMOGRAPHY
// ============================================================================

/// A solved pixel → metric projective transform and its inverse.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Homography {
    forward: Matrix3<f64>,
    inverse: Matrix3<f64>,
}

impl Homography {
    /// Solve the homography for four ordered pixel corners and a metric rectangle.
    pub fn solve(
        points: &[PixelPoint; ZONE_POINTS],
        length: f64,
        width: f64,
    ) -> Result<Self, EngineError> {
        check_dimensions(length, width)?;
        check_geometry(points)?;

        let metric = [
            PixelPoint::new(0.0, 0.0),
            PixelPoint::new(length, 0.0),
            PixelPoint::new(length, width),
            PixelPoint::new(0.0, width),
        ];

        let t_src = normalisation_transform(points)?;
        let t_dst = normalisation_transform(&metric)?;

        let src_n = points.map(|p| apply(&t_src, &p));
        let dst_n = metric.map(|p| apply(&t_dst, &p));

        // Two rows per correspondence, h33 fixed to 1:
        //   [x y 1 0 0 0 -ux -uy] h = u
        //   [0 0 0 x y 1 -vx -vy] h = v
        let mut a = SMatrix::<f64, 8, 8>::zeros();
        let mut b = SVector::<f64, 8>::zeros();
        for (i, (s, d)) in src_n.iter().zip(dst_n.iter()).enumerate() {
            let r = 2 * i;
            a[(r, 0)] = s.x;
            a[(r, 1)] = s.y;
            a[(r, 2)] = 1.0;
            a[(r, 6)] = -d.x * s.x;
            a[(r, 7)] = -d.x * s.y;
            b[r] = d.x;

            a[(r + 1, 3)] = s.x;
            a[(r + 1, 4)] = s.y;
            a[(r + 1, 5)] = 1.0;
            a[(r + 1, 6)] = -d.y * s.x;
            a[(r + 1, 7)] = -d.y * s.y;
            b[r + 1] = d.y;
        }

        let lu = a.lu();
        let det = lu.determinant();
        if !det.is_finite() || det.abs() < DET_EPSILON {
            return Err(EngineError::degenerate(format!(
                "correspondence system is singular (det = {:e})",
                det
            )));
        }
        let h = lu
            .solve(&b)
            .ok_or_else(|| EngineError::degenerate("correspondence system has no solution"))?;

        let h_norm = Matrix3::new(h[0], h[1], h[2], h[3], h[4], h[5], h[6], h[7], 1.0);
        let t_dst_inv = t_dst
            .try_inverse()
            .ok_or_else(|| EngineError::degenerate("metric normalisation is singular"))?;

        let mut forward = t_dst_inv * h_norm * t_src;
        let scale = forward[(2, 2)];
        if scale.abs() > W_EPSILON {
            forward /= scale;
        }
        let inverse = forward
            .try_inverse()
            .ok_or_else(|| EngineError::degenerate("homography is not invertible"))?;

        let homography = Self { forward, inverse };

        // Reject results that do not reproduce the corners (near-singular solves).
        let tolerance = 1e-6 * length.max(width);
        for (p, m) in points.iter().zip(metric.iter()) {
            let q = homography.project(p)?;
            if (q.x - m.x).abs() > tolerance || (q.y - m.y).abs() > tolerance {
                return Err(EngineError::degenerate("homography does not reproduce corners"));
            }
        }

        Ok(homography)
    }

    /// The 3×3 pixel → metric matrix (h33 = 1).
    pub fn matrix(&self) -> &Matrix3<f64> {
        &self.forward
    }

    /// Pixel → metric.
    pub fn project(&self, p: &PixelPoint) -> Result<MetricPoint, EngineError> {
        let (x, y) = transform(&self.forward, p.x, p.y).ok_or(EngineError::PointAtInfinity {
            x: p.x,
            y: p.y,
        })?;
        Ok(MetricPoint::new(x, y))
    }

    /// Metric → pixel.
    pub fn unproject(&self, q: &MetricPoint) -> Result<PixelPoint, EngineError> {
        let (x, y) = transform(&self.inverse, q.x, q.y).ok_or(EngineError::PointAtInfinity {
            x: q.x,
            y: q.y,
        })?;
        Ok(PixelPoint::new(x, y))
    }
}

fn transform(m: &Matrix3<f64>, x: f64, y: f64) -> Option<(f64, f64)> {
    let v = m * Vector3::new(x, y, 1.0);
    if !v.z.is_finite() || v.z.abs() < W_EPSILON {
        return None;
    }
    let (u, w) = (v.x / v.z, v.y / v.z);
    (u.is_finite() && w.is_finite()).then_some((u, w))
}

fn apply(t: &Matrix3<f64>, p: &PixelPoint) -> PixelPoint {
    let v = t * Vector3::new(p.x, p.y, 1.0);
    PixelPoint::new(v.x / v.z, v.y / v.z)
}

/// Similarity transform moving the centroid to the origin with mean distance √2.
fn normalisation_transform(points: &[PixelPoint; ZONE_POINTS]) -> Result<Matrix3<f64>, EngineError> {
    let n = points.len() as f64;
    let cx = points.iter().map(|p| p.x).sum::<f64>() / n;
    let cy = points.iter().map(|p| p.y).sum::<f64>() / n;
    let mean_dist = points
        .iter()
        .map(|p| (p.x - cx).hypot(p.y - cy))
        .sum::<f64>()
        / n;
    if !mean_dist.is_finite() || mean_dist <= f64::EPSILON {
        return Err(EngineError::degenerate("all points coincide"));
    }
    let s = std::f64::consts::SQRT_2 / mean_dist;
    Ok(Matrix3::new(s, 0.0, -s * cx, 0.0, s, -s * cy, 0.0, 0.0, 1.0))
}

fn check_dimensions(length: f64, width: f64) -> Result<(), EngineError> {
    if !(length.is_finite() && length > 0.0) {
        return Err(EngineError::invalid_dimension(format!("length must be > 0, got {}", length)));
    }
    if !(width.is_finite() && width > 0.0) {
        return Err(EngineError::invalid_dimension(format!("width must be > 0, got {}", width)));
    }
    Ok(())
}

/// Signed doubled area of triangle (a, b, c).
#[inline]
fn orient(a: &PixelPoint, b: &PixelPoint, c: &PixelPoint) -> f64 {
    (b.x - a.x) * (c.y - a.y) - (b.y - a.y) * (c.x - a.x)
}

fn segments_cross(a: &PixelPoint, b: &PixelPoint, c: &PixelPoint, d: &PixelPoint) -> bool {
    let o1 = orient(a, b, c);
    let o2 = orient(a, b, d);
    let o3 = orient(c, d, a);
    let o4 = orient(c, d, b);
    o1 * o2 < 0.0 && o3 * o4 < 0.0
}

/// Rejects non-finite, collinear, self-intersecting and concave corner sets.
fn check_geometry(points: &[PixelPoint; ZONE_POINTS]) -> Result<(), EngineError> {
    if !points.iter().all(PixelPoint::is_finite) {
        return Err(EngineError::degenerate("non-finite calibration point"));
    }

    let mut extent: f64 = 0.0;
    for i in 0..ZONE_POINTS {
        for j in (i + 1)..ZONE_POINTS {
            extent = extent.max(points[i].distance_to(&points[j]));
        }
    }
    if extent <= f64::EPSILON {
        return Err(EngineError::degenerate("all points coincide"));
    }

    let threshold = COLLINEAR_TOLERANCE * extent * extent;
    for skip in 0..ZONE_POINTS {
        let tri: Vec<&PixelPoint> = points
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != skip)
            .map(|(_, p)| p)
            .collect();
        if orient(tri[0], tri[1], tri[2]).abs() <= threshold {
            return Err(EngineError::degenerate("three calibration points are collinear"));
        }
    }

    // Opposite edges must not cross: (0-1 vs 2-3) and (1-2 vs 3-0).
    if segments_cross(&points[0], &points[1], &points[2], &points[3])
        || segments_cross(&points[1], &points[2], &points[3], &points[0])
    {
        return Err(EngineError::degenerate("calibration quadrilateral is self-intersecting"));
    }

    // Every corner must turn the same way; a concave zone puts the horizon inside it.
    let turns: Vec<f64> = (0..ZONE_POINTS)
        .map(|i| {
            orient(
                &points[i],
                &points[(i + 1) % ZONE_POINTS],
                &points[(i + 2) % ZONE_POINTS],
            )
        })
        .collect();
    if !(turns.iter().all(|&t| t > 0.0) || turns.iter().all(|&t| t < 0.0)) {
        return Err(EngineError::degenerate("calibration quadrilateral is concave"));
    }

    Ok(())
}

// ============================================================================
// CALIBRATION STATUS / SNAPSHOT
// ============================================================================

/// Observable state of a calibration zone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum CalibrationStatus {
    /// No points placed.
    Empty,
    /// `n` points placed; `Partial(4)` means the zone still needs dimensions.
    Partial(usize),
    /// Four points and dimensions, but the geometry is degenerate.
    Invalid,
    /// A homography is installed.
    Valid(Homography),
}

impl CalibrationStatus {
    pub fn is_valid(&self) -> bool {
        matches!(self, CalibrationStatus::Valid(_))
    }

    pub fn name(&self) -> &'static str {
        match self {
            CalibrationStatus::Empty => "empty",
            CalibrationStatus::Partial(_) => "partial",
            CalibrationStatus::Invalid => "invalid",
            CalibrationStatus::Valid(_) => "valid",
        }
    }
}

/// The caller-persistable part of a zone: corners plus dimensions.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CalibrationSnapshot {
    pub points: Vec<CalibrationPoint>,
    pub real_length: Option<f64>,
    pub real_width: Option<f64>,
}

// ============================================================================
// CALIBRATION ENGINE
// ============================================================================

/// Owned calibration zone, mutated only through its operations.
///
/// Edits to a zone that is not yet valid are always recorded; the status then
/// reports `Invalid` if the completed geometry is degenerate. Edits that would
/// turn a valid zone invalid are rejected and leave it untouched.
#[derive(Debug, Clone, Default)]
pub struct CalibrationEngine {
    points: Vec<CalibrationPoint>,
    real_length: Option<f64>,
    real_width: Option<f64>,
    homography: Option<Homography>,
}

impl CalibrationEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a zone from persisted corners and dimensions.
    pub fn from_snapshot(snapshot: &CalibrationSnapshot) -> Result<Self, EngineError> {
        let mut engine = Self::new();
        for p in &snapshot.points {
            engine.add_point(*p)?;
        }
        if let (Some(length), Some(width)) = (snapshot.real_length, snapshot.real_width) {
            engine.set_dimensions(length, width)?;
        }
        Ok(engine)
    }

    pub fn snapshot(&self) -> CalibrationSnapshot {
        CalibrationSnapshot {
            points: self.points.clone(),
            real_length: self.real_length,
            real_width: self.real_width,
        }
    }

    /// Append the next corner in `[front-left, front-right, back-right, back-left]` order.
    pub fn add_point(&mut self, p: CalibrationPoint) -> Result<CalibrationStatus, EngineError> {
        if self.points.len() >= ZONE_POINTS {
            return Err(EngineError::CapacityExceeded { max: ZONE_POINTS });
        }
        if !p.is_finite() {
            return Err(EngineError::degenerate("non-finite calibration point"));
        }
        self.points.push(p);
        self.refresh();
        Ok(self.status())
    }

    /// Move an existing corner.
    pub fn set_point(
        &mut self,
        index: usize,
        p: CalibrationPoint,
    ) -> Result<CalibrationStatus, EngineError> {
        if index >= self.points.len() {
            return Err(EngineError::IndexOutOfRange {
                index,
                len: self.points.len(),
            });
        }
        if !p.is_finite() {
            return Err(EngineError::degenerate("non-finite calibration point"));
        }
        if self.homography.is_some() {
            let mut candidate = self.corners().ok_or(EngineError::Uncalibrated)?;
            candidate[index] = p;
            let (length, width) = self.dimensions().ok_or(EngineError::Uncalibrated)?;
            let homography = Homography::solve(&candidate, length, width)?;
            self.points[index] = p;
            self.homography = Some(homography);
        } else {
            self.points[index] = p;
            self.refresh();
        }
        Ok(self.status())
    }

    /// Set the metric size of the zone; both values must be finite and > 0.
    pub fn set_dimensions(
        &mut self,
        length: f64,
        width: f64,
    ) -> Result<CalibrationStatus, EngineError> {
        check_dimensions(length, width)?;
        if self.homography.is_some() {
            let corners = self.corners().ok_or(EngineError::Uncalibrated)?;
            let homography = Homography::solve(&corners, length, width)?;
            self.homography = Some(homography);
        }
        self.real_length = Some(length);
        self.real_width = Some(width);
        if self.homography.is_none() {
            self.refresh();
        }
        Ok(self.status())
    }

    /// Solve the homography for the current corners and dimensions.
    ///
    /// Does not modify the zone; the engine keeps its own installed transform
    /// in sync on every edit.
    pub fn compute_homography(&self) -> Result<Homography, EngineError> {
        let corners = self.corners().ok_or(EngineError::Uncalibrated)?;
        let (length, width) = self.dimensions().ok_or(EngineError::Uncalibrated)?;
        Homography::solve(&corners, length, width)
    }

    pub fn pixel_to_metric(&self, p: &PixelPoint) -> Result<MetricPoint, EngineError> {
        self.homography
            .as_ref()
            .ok_or(EngineError::Uncalibrated)?
            .project(p)
    }

    pub fn metric_to_pixel(&self, q: &MetricPoint) -> Result<PixelPoint, EngineError> {
        self.homography
            .as_ref()
            .ok_or(EngineError::Uncalibrated)?
            .unproject(q)
    }

    /// Discard all points and the homography. Dimensions are kept.
    pub fn reset(&mut self) {
        self.points.clear();
        self.homography = None;
    }

    pub fn status(&self) -> CalibrationStatus {
        if let Some(h) = self.homography {
            return CalibrationStatus::Valid(h);
        }
        match self.points.len() {
            0 => CalibrationStatus::Empty,
            ZONE_POINTS if self.dimensions().is_some() => CalibrationStatus::Invalid,
            n => CalibrationStatus::Partial(n),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.homography.is_some()
    }

    pub fn points(&self) -> &[CalibrationPoint] {
        &self.points
    }

    pub fn dimensions(&self) -> Option<(f64, f64)> {
        self.real_length.zip(self.real_width)
    }

    pub fn homography(&self) -> Option<&Homography> {
        self.homography.as_ref()
    }

    fn corners(&self) -> Option<[CalibrationPoint; ZONE_POINTS]> {
        self.points.as_slice().try_into().ok()
    }

    fn refresh(&mut self) {
        self.homography = match self.compute_homography() {
            Ok(h) => {
                tracing::info!("calibration zone valid");
                Some(h)
            }
            Err(EngineError::Uncalibrated) => None,
            Err(e) => {
                tracing::info!("calibration zone invalid: {}", e);
                None
            }
        };
    }
}

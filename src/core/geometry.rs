//! Coordinate geometry shared by every pipeline stage.
//!
//! Detection stages work in the normalized pixel grid produced by the
//! normalizer. Every [`Region`] carries the affine map back to the original
//! document grid so it can always be re-expressed there.

use serde::{Deserialize, Serialize};

/// A 2D point in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    #[inline]
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn distance(&self, other: &Point) -> f32 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }
}

/// Affine map `x' = a*x + b*y + c`, `y' = d*x + e*y + f`.
///
/// Stored in `f64` so that composing a rotation, a rescale and their inverse
/// stays well inside sub-pixel tolerance.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AffineTransform {
    m: [f64; 6],
}

impl AffineTransform {
    pub const IDENTITY: Self = Self {
        m: [1.0, 0.0, 0.0, 0.0, 1.0, 0.0],
    };

    pub fn new(a: f64, b: f64, c: f64, d: f64, e: f64, f: f64) -> Self {
        Self { m: [a, b, c, d, e, f] }
    }

    pub fn translate(tx: f64, ty: f64) -> Self {
        Self::new(1.0, 0.0, tx, 0.0, 1.0, ty)
    }

    pub fn scale(sx: f64, sy: f64) -> Self {
        Self::new(sx, 0.0, 0.0, 0.0, sy, 0.0)
    }

    /// Rotation by `theta` radians in image coordinates (y axis pointing
    /// down), i.e. clockwise on screen for positive angles.
    pub fn rotate(theta: f64) -> Self {
        let (sin, cos) = theta.sin_cos();
        Self::new(cos, -sin, 0.0, sin, cos, 0.0)
    }

    /// Composite that applies `self` first, then `next`.
    pub fn then(&self, next: &AffineTransform) -> AffineTransform {
        let [a1, b1, c1, d1, e1, f1] = self.m;
        let [a2, b2, c2, d2, e2, f2] = next.m;
        AffineTransform::new(
            a2 * a1 + b2 * d1,
            a2 * b1 + b2 * e1,
            a2 * c1 + b2 * f1 + c2,
            d2 * a1 + e2 * d1,
            d2 * b1 + e2 * e1,
            d2 * c1 + e2 * f1 + f2,
        )
    }

    pub fn apply(&self, p: Point) -> Point {
        let (x, y) = (p.x as f64, p.y as f64);
        let [a, b, c, d, e, f] = self.m;
        Point::new((a * x + b * y + c) as f32, (d * x + e * y + f) as f32)
    }

    pub fn determinant(&self) -> f64 {
        self.m[0] * self.m[4] - self.m[1] * self.m[3]
    }

    /// Exact analytic inverse. `None` for degenerate (non-invertible) maps.
    pub fn inverse(&self) -> Option<AffineTransform> {
        let det = self.determinant();
        if det.abs() < 1e-12 || !det.is_finite() {
            return None;
        }
        let [a, b, c, d, e, f] = self.m;
        let ia = e / det;
        let ib = -b / det;
        let id = -d / det;
        let ie = a / det;
        Some(AffineTransform::new(
            ia,
            ib,
            -(ia * c + ib * f),
            id,
            ie,
            -(id * c + ie * f),
        ))
    }

    pub fn is_identity(&self) -> bool {
        self.m
            .iter()
            .zip(Self::IDENTITY.m.iter())
            .all(|(a, b)| (a - b).abs() < 1e-12)
    }

    /// Row-major 3x3 homogeneous matrix, as expected by
    /// `imageproc::geometric_transformations::Projection::from_matrix`.
    pub fn to_projection_matrix(&self) -> [f32; 9] {
        let [a, b, c, d, e, f] = self.m;
        [
            a as f32, b as f32, c as f32, d as f32, e as f32, f as f32, 0.0, 0.0, 1.0,
        ]
    }
}

impl Default for AffineTransform {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// Axis-aligned box `[x_min, y_min, x_max, y_max]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    pub x_min: f32,
    pub y_min: f32,
    pub x_max: f32,
    pub y_max: f32,
}

impl BBox {
    /// Builds a box from two corners in any order.
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self {
            x_min: x1.min(x2),
            y_min: y1.min(y2),
            x_max: x1.max(x2),
            y_max: y1.max(y2),
        }
    }

    pub fn from_points(points: &[Point]) -> Option<Self> {
        let first = points.first()?;
        let mut bbox = BBox::new(first.x, first.y, first.x, first.y);
        for p in &points[1..] {
            bbox.x_min = bbox.x_min.min(p.x);
            bbox.y_min = bbox.y_min.min(p.y);
            bbox.x_max = bbox.x_max.max(p.x);
            bbox.y_max = bbox.y_max.max(p.y);
        }
        Some(bbox)
    }

    pub fn width(&self) -> f32 {
        self.x_max - self.x_min
    }

    pub fn height(&self) -> f32 {
        self.y_max - self.y_min
    }

    pub fn area(&self) -> f32 {
        self.width().max(0.0) * self.height().max(0.0)
    }

    pub fn corners(&self) -> [Point; 4] {
        [
            Point::new(self.x_min, self.y_min),
            Point::new(self.x_max, self.y_min),
            Point::new(self.x_max, self.y_max),
            Point::new(self.x_min, self.y_max),
        ]
    }

    pub fn intersection_area(&self, other: &BBox) -> f32 {
        let x_min = self.x_min.max(other.x_min);
        let y_min = self.y_min.max(other.y_min);
        let x_max = self.x_max.min(other.x_max);
        let y_max = self.y_max.min(other.y_max);

        if x_min >= x_max || y_min >= y_max {
            return 0.0;
        }
        (x_max - x_min) * (y_max - y_min)
    }

    /// Intersection over union. 0.0 when either box is empty.
    pub fn iou(&self, other: &BBox) -> f32 {
        let inter = self.intersection_area(other);
        if inter <= 0.0 {
            return 0.0;
        }
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            return 0.0;
        }
        inter / union
    }

    /// Clamps the box to `[0, width] x [0, height]`.
    pub fn clamp_to(&self, width: u32, height: u32) -> BBox {
        let (w, h) = (width as f32, height as f32);
        BBox {
            x_min: self.x_min.clamp(0.0, w),
            y_min: self.y_min.clamp(0.0, h),
            x_max: self.x_max.clamp(0.0, w),
            y_max: self.y_max.clamp(0.0, h),
        }
    }

    /// Integer crop rectangle `(x, y, w, h)` inside an image, or `None` when
    /// the clamped box is empty.
    pub fn crop_rect(&self, width: u32, height: u32) -> Option<(u32, u32, u32, u32)> {
        let clamped = self.clamp_to(width, height);
        let x = clamped.x_min.floor() as u32;
        let y = clamped.y_min.floor() as u32;
        let x2 = (clamped.x_max.ceil() as u32).min(width);
        let y2 = (clamped.y_max.ceil() as u32).min(height);
        if x2 <= x || y2 <= y {
            return None;
        }
        Some((x, y, x2 - x, y2 - y))
    }

    /// Bit-exact identity used to drop duplicate model outputs.
    pub fn bit_key(&self) -> [u32; 4] {
        [
            self.x_min.to_bits(),
            self.y_min.to_bits(),
            self.x_max.to_bits(),
            self.y_max.to_bits(),
        ]
    }
}

/// Shape of a region in normalized coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Shape {
    Rect(BBox),
    Polygon { points: Vec<Point> },
}

/// An area in normalized coordinates together with the map back to the
/// original document grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Region {
    shape: Shape,
    to_original: AffineTransform,
}

/// A region re-expressed in original document coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectedRegion {
    /// Outline in original coordinates. Rectangles become quadrilaterals
    /// when the page was deskewed.
    pub polygon: Vec<Point>,
    pub bbox: BBox,
}

impl Region {
    pub fn rect(bbox: BBox, to_original: AffineTransform) -> Self {
        Self {
            shape: Shape::Rect(bbox),
            to_original,
        }
    }

    /// Polygonal region. Returns `None` for fewer than three points.
    pub fn polygon(points: Vec<Point>, to_original: AffineTransform) -> Option<Self> {
        if points.len() < 3 {
            return None;
        }
        Some(Self {
            shape: Shape::Polygon { points },
            to_original,
        })
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn to_original_transform(&self) -> &AffineTransform {
        &self.to_original
    }

    /// Axis-aligned bounds in normalized coordinates.
    pub fn bounds(&self) -> BBox {
        match &self.shape {
            Shape::Rect(bbox) => *bbox,
            Shape::Polygon { points } => {
                BBox::from_points(points).unwrap_or(BBox::new(0.0, 0.0, 0.0, 0.0))
            }
        }
    }

    pub fn area(&self) -> f32 {
        self.bounds().area()
    }

    /// IoU over axis-aligned bounds.
    pub fn iou(&self, other: &Region) -> f32 {
        self.bounds().iou(&other.bounds())
    }

    fn outline(&self) -> Vec<Point> {
        match &self.shape {
            Shape::Rect(bbox) => bbox.corners().to_vec(),
            Shape::Polygon { points } => points.clone(),
        }
    }

    /// Projects the region into original document coordinates.
    pub fn project(&self) -> ProjectedRegion {
        let polygon: Vec<Point> = self
            .outline()
            .into_iter()
            .map(|p| self.to_original.apply(p))
            .collect();
        let bbox = BBox::from_points(&polygon).unwrap_or(BBox::new(0.0, 0.0, 0.0, 0.0));
        ProjectedRegion { polygon, bbox }
    }

    /// Bit-exact identity of the region's shape.
    pub fn shape_key(&self) -> Vec<u32> {
        match &self.shape {
            Shape::Rect(bbox) => bbox.bit_key().to_vec(),
            Shape::Polygon { points } => points
                .iter()
                .flat_map(|p| [p.x.to_bits(), p.y.to_bits()])
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::PI;

    #[test]
    fn test_inverse_round_trip() {
        let forward = AffineTransform::translate(-400.0, -300.0)
            .then(&AffineTransform::rotate(3.5_f64.to_radians()))
            .then(&AffineTransform::translate(420.0, 310.0))
            .then(&AffineTransform::scale(0.37, 0.41));
        let inverse = forward.inverse().unwrap();

        for &(x, y) in &[(0.0, 0.0), (799.0, 599.0), (123.4, 456.7), (-10.0, 900.0)] {
            let p = Point::new(x, y);
            let back = inverse.apply(forward.apply(p));
            assert!(p.distance(&back) < 1e-3, "{:?} -> {:?}", p, back);
        }
    }

    #[test]
    fn test_quarter_turn_rotation() {
        let rot = AffineTransform::rotate(PI / 2.0);
        let p = rot.apply(Point::new(1.0, 0.0));
        assert!((p.x - 0.0).abs() < 1e-6);
        assert!((p.y - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_degenerate_inverse() {
        assert!(AffineTransform::scale(0.0, 1.0).inverse().is_none());
        assert!(AffineTransform::IDENTITY.inverse().unwrap().is_identity());
    }

    #[test]
    fn test_iou() {
        let a = BBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BBox::new(5.0, 0.0, 15.0, 10.0);
        assert!((a.iou(&b) - 50.0 / 150.0).abs() < 1e-6);
        assert_eq!(a.iou(&BBox::new(20.0, 20.0, 30.0, 30.0)), 0.0);
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_crop_rect_clamps() {
        let bbox = BBox::new(-5.0, 2.5, 50.0, 40.2);
        assert_eq!(bbox.crop_rect(30, 30), Some((0, 2, 30, 28)));
        assert_eq!(BBox::new(40.0, 40.0, 50.0, 50.0).crop_rect(30, 30), None);
    }

    #[test]
    fn test_region_projection_uses_transform() {
        let to_original = AffineTransform::scale(2.0, 2.0);
        let region = Region::rect(BBox::new(10.0, 10.0, 20.0, 30.0), to_original);
        let projected = region.project();
        assert_eq!(projected.bbox, BBox::new(20.0, 20.0, 40.0, 60.0));
        assert_eq!(projected.polygon.len(), 4);
    }

    #[test]
    fn test_polygon_requires_three_points() {
        let pts = vec![Point::new(0.0, 0.0), Point::new(1.0, 1.0)];
        assert!(Region::polygon(pts, AffineTransform::IDENTITY).is_none());
    }
}

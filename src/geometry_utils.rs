use nalgebra::{Point2, Point3, Rotation2, Vector2};

use crate::Point2D;

pub fn centroid(points: &[Point2D]) -> Option<Point2D> {
    let count = points.len();
    points
        .iter()
        .cloned()
        .reduce(|acc, el| (acc.0 + el.0, acc.1 + el.1))
        .map(|(x, y)| (x / count as f32, y / count as f32))
}

/// Area of the triangle (a, b, c) in 3D space, i.e. |AB x AC| / 2
pub fn triangle_area(a: &Point3<f32>, b: &Point3<f32>, c: &Point3<f32>) -> f32 {
    let ab = *b - *a;
    let ac = *c - *a;
    ab.cross(&ac).norm() / 2.
}

/// Rotate a point (in the sensor's local top-down plane) about the sensor
/// origin by `rotation_degrees`, then translate it by `offset`.
pub fn register_point(point: Point2D, rotation_degrees: f32, offset: Point2D) -> Point2D {
    let rotation = Rotation2::new(rotation_degrees.to_radians());
    let rotated = rotation * Point2::new(point.0, point.1);
    let registered = rotated + Vector2::new(offset.0, offset.1);
    (registered.x, registered.y)
}

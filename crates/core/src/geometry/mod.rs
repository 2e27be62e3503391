use serde::{Deserialize, Serialize};

/// Point in image coordinates. Depth is not part of the joint-angle model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Point2D {
    pub x: f64,
    pub y: f64,
}

impl Point2D {
    /// Creates a point from normalised image coordinates.
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Interior angle at vertex `b` between the rays `b -> a` and `b -> c`, in
/// degrees within `[0, 180]`.
///
/// Coincident points produce `atan2(0, 0) = 0` bearings and therefore a finite
/// angle. Non-finite coordinates propagate as NaN.
pub fn angle_degrees(a: Point2D, b: Point2D, c: Point2D) -> f64 {
    let radians = (c.y - b.y).atan2(c.x - b.x) - (a.y - b.y).atan2(a.x - b.x);
    let angle = radians.to_degrees().abs();
    if angle > 180.0 {
        360.0 - angle
    } else {
        angle
    }
}

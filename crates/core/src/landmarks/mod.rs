//! Body landmark model shared by the classifier and the transport layer.
//!
//! Frames follow the 33-point full-body numbering used by common pose
//! estimators. The index of a point inside a [`LandmarkFrame`] is its
//! [`Landmark`] discriminant.

use serde::{Deserialize, Serialize};

use crate::geometry::Point2D;

/// Number of keypoints in a complete frame.
pub const LANDMARK_COUNT: usize = 33;

/// Named anatomical keypoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Landmark {
    Nose = 0,
    LeftEyeInner,
    LeftEye,
    LeftEyeOuter,
    RightEyeInner,
    RightEye,
    RightEyeOuter,
    LeftEar,
    RightEar,
    MouthLeft,
    MouthRight,
    LeftShoulder,
    RightShoulder,
    LeftElbow,
    RightElbow,
    LeftWrist,
    RightWrist,
    LeftPinky,
    RightPinky,
    LeftIndex,
    RightIndex,
    LeftThumb,
    RightThumb,
    LeftHip,
    RightHip,
    LeftKnee,
    RightKnee,
    LeftAnkle,
    RightAnkle,
    LeftHeel,
    RightHeel,
    LeftFootIndex,
    RightFootIndex,
}

impl Landmark {
    pub const ALL: [Landmark; LANDMARK_COUNT] = [
        Landmark::Nose,
        Landmark::LeftEyeInner,
        Landmark::LeftEye,
        Landmark::LeftEyeOuter,
        Landmark::RightEyeInner,
        Landmark::RightEye,
        Landmark::RightEyeOuter,
        Landmark::LeftEar,
        Landmark::RightEar,
        Landmark::MouthLeft,
        Landmark::MouthRight,
        Landmark::LeftShoulder,
        Landmark::RightShoulder,
        Landmark::LeftElbow,
        Landmark::RightElbow,
        Landmark::LeftWrist,
        Landmark::RightWrist,
        Landmark::LeftPinky,
        Landmark::RightPinky,
        Landmark::LeftIndex,
        Landmark::RightIndex,
        Landmark::LeftThumb,
        Landmark::RightThumb,
        Landmark::LeftHip,
        Landmark::RightHip,
        Landmark::LeftKnee,
        Landmark::RightKnee,
        Landmark::LeftAnkle,
        Landmark::RightAnkle,
        Landmark::LeftHeel,
        Landmark::RightHeel,
        Landmark::LeftFootIndex,
        Landmark::RightFootIndex,
    ];

    /// Position of this landmark inside a frame.
    pub const fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }
}

/// Single keypoint as reported by the pose estimator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LandmarkPoint {
    pub x: f64,
    pub y: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub z: Option<f64>,
    /// Estimator confidence in `[0, 1]`, when it reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visibility: Option<f32>,
}

impl LandmarkPoint {
    pub const fn new(x: f64, y: f64) -> Self {
        Self {
            x,
            y,
            z: None,
            visibility: None,
        }
    }

    pub fn with_visibility(mut self, visibility: f32) -> Self {
        self.visibility = Some(visibility);
        self
    }

    pub fn position(&self) -> Point2D {
        Point2D::new(self.x, self.y)
    }
}

/// One capture tick worth of keypoints. An empty frame means the estimator
/// did not find a pose.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LandmarkFrame {
    points: Vec<LandmarkPoint>,
}

impl LandmarkFrame {
    /// Wraps estimator output ordered by landmark index.
    pub fn new(points: Vec<LandmarkPoint>) -> Self {
        Self { points }
    }

    /// Frame for a tick where no body was detected.
    pub fn no_pose() -> Self {
        Self::default()
    }

    /// Builds a frame from an optional point list, `None` meaning no pose.
    pub fn from_detection(points: Option<Vec<LandmarkPoint>>) -> Self {
        points.map(Self::new).unwrap_or_default()
    }

    /// Returns `true` when the estimator reported a body.
    pub fn has_pose(&self) -> bool {
        !self.points.is_empty()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Point for `landmark`, if the frame is long enough to contain it.
    pub fn point(&self, landmark: Landmark) -> Option<&LandmarkPoint> {
        self.points.get(landmark.index())
    }

    /// All points in landmark order.
    pub fn points(&self) -> &[LandmarkPoint] {
        &self.points
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indices_follow_full_body_numbering() {
        assert_eq!(Landmark::LeftShoulder.index(), 11);
        assert_eq!(Landmark::LeftElbow.index(), 13);
        assert_eq!(Landmark::LeftWrist.index(), 15);
        assert_eq!(Landmark::LeftHip.index(), 23);
        assert_eq!(Landmark::LeftKnee.index(), 25);
        assert_eq!(Landmark::LeftAnkle.index(), 27);
        assert_eq!(Landmark::RightFootIndex.index(), LANDMARK_COUNT - 1);

        for (index, landmark) in Landmark::ALL.iter().enumerate() {
            assert_eq!(Landmark::from_index(index), Some(*landmark));
        }
        assert_eq!(Landmark::from_index(LANDMARK_COUNT), None);
    }

    #[test]
    fn frame_deserializes_from_point_array() {
        let json = r#"[{"x": 0.1, "y": 0.2}, {"x": 0.3, "y": 0.4, "z": -0.5, "visibility": 0.9}]"#;
        let frame: LandmarkFrame = serde_json::from_str(json).unwrap();

        assert_eq!(frame.len(), 2);
        let eye = frame.point(Landmark::LeftEyeInner).unwrap();
        assert_eq!(eye.visibility, Some(0.9));
        assert_eq!(eye.position(), Point2D::new(0.3, 0.4));
        assert!(frame.point(Landmark::LeftShoulder).is_none());
    }

    #[test]
    fn missing_detection_is_an_empty_frame() {
        let frame = LandmarkFrame::from_detection(None);
        assert!(!frame.has_pose());
        assert_eq!(frame, LandmarkFrame::no_pose());
    }
}

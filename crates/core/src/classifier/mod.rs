use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::{
    geometry::{angle_degrees, Point2D},
    ExercisePolicy, LandmarkFrame, PolicyRegistry, Result, WorkoutError,
};

/// Points reported below this confidence are treated as not detected.
pub const DEFAULT_MIN_VISIBILITY: f32 = 0.3;

/// Outcome of classifying one frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub angle_deg: f64,
    pub is_correct: bool,
}

/// Turns landmark frames into joint angles and a correct/incorrect verdict.
/// Holds no per-stream state.
#[derive(Debug, Clone)]
pub struct FrameClassifier {
    registry: PolicyRegistry,
    min_visibility: f32,
}

impl FrameClassifier {
    pub fn new(registry: PolicyRegistry) -> Self {
        Self {
            registry,
            min_visibility: DEFAULT_MIN_VISIBILITY,
        }
    }

    pub fn with_min_visibility(mut self, min_visibility: f32) -> Self {
        self.min_visibility = min_visibility;
        self
    }

    pub fn registry(&self) -> &PolicyRegistry {
        &self.registry
    }

    pub fn classify(&self, frame: &LandmarkFrame, exercise_id: &str) -> Result<Classification> {
        let policy = self.registry.lookup(exercise_id)?;
        self.classify_with(frame, &policy)
    }

    /// Classifies against a policy the caller already resolved, e.g. the
    /// snapshot held by an [`ExerciseSelector`].
    pub fn classify_with(
        &self,
        frame: &LandmarkFrame,
        policy: &ExercisePolicy,
    ) -> Result<Classification> {
        if !frame.has_pose() {
            return Err(WorkoutError::InsufficientLandmarks);
        }

        let mut positions = [Point2D::default(); 3];
        for (slot, landmark) in positions.iter_mut().zip(policy.landmarks()) {
            let point = frame
                .point(landmark)
                .ok_or(WorkoutError::InsufficientLandmarks)?;
            if point
                .visibility
                .is_some_and(|visibility| visibility < self.min_visibility)
            {
                return Err(WorkoutError::InsufficientLandmarks);
            }
            *slot = point.position();
        }

        let [a, b, c] = positions;
        let angle_deg = angle_degrees(a, b, c);
        Ok(Classification {
            angle_deg,
            is_correct: policy.accepts(angle_deg),
        })
    }
}

/// The exercise a stream currently classifies against.
///
/// Clones share the cell. Readers always get a complete policy snapshot.
#[derive(Debug, Clone)]
pub struct ExerciseSelector {
    current: Arc<RwLock<Arc<ExercisePolicy>>>,
}

impl ExerciseSelector {
    pub fn new(policy: Arc<ExercisePolicy>) -> Self {
        Self {
            current: Arc::new(RwLock::new(policy)),
        }
    }

    /// Selector initialised with the registry entry for `exercise_id`.
    pub fn for_exercise(registry: &PolicyRegistry, exercise_id: &str) -> Result<Self> {
        registry.lookup(exercise_id).map(Self::new)
    }

    pub fn current(&self) -> Result<Arc<ExercisePolicy>> {
        self.current
            .read()
            .map(|policy| policy.clone())
            .map_err(|_| WorkoutError::msg("exercise selector has been poisoned"))
    }

    /// Switches to `exercise_id`. Unknown ids leave the selection unchanged.
    pub fn select(&self, registry: &PolicyRegistry, exercise_id: &str) -> Result<Arc<ExercisePolicy>> {
        let policy = registry.lookup(exercise_id)?;
        let mut slot = self
            .current
            .write()
            .map_err(|_| WorkoutError::msg("exercise selector has been poisoned"))?;
        *slot = policy.clone();
        Ok(policy)
    }
}

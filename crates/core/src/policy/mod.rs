use std::{collections::HashMap, sync::Arc};

use serde::{Deserialize, Serialize};

use crate::{Landmark, Result, WorkoutError};

pub const PUSHUPS: &str = "pushups";
pub const SQUATS: &str = "squats";
pub const PULLUPS: &str = "pullups";

/// Landmark triple and acceptable joint angle for one exercise. The angle is
/// measured at `point_b`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExercisePolicy {
    pub id: String,
    pub point_a: Landmark,
    pub point_b: Landmark,
    pub point_c: Landmark,
    pub min_angle_deg: f64,
    pub max_angle_deg: f64,
}

impl ExercisePolicy {
    /// Builds a validated policy.
    pub fn new(
        id: impl Into<String>,
        [point_a, point_b, point_c]: [Landmark; 3],
        min_angle_deg: f64,
        max_angle_deg: f64,
    ) -> Result<Self> {
        let policy = Self {
            id: id.into(),
            point_a,
            point_b,
            point_c,
            min_angle_deg,
            max_angle_deg,
        };
        policy.validate()?;
        Ok(policy)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| WorkoutError::InvalidPolicy {
            id: self.id.clone(),
            reason: reason.to_string(),
        };

        if self.id.trim().is_empty() {
            return Err(invalid("exercise id must not be empty"));
        }
        if !(self.min_angle_deg.is_finite() && self.max_angle_deg.is_finite()) {
            return Err(invalid("angle bounds must be finite"));
        }
        if !(0.0 <= self.min_angle_deg
            && self.min_angle_deg <= self.max_angle_deg
            && self.max_angle_deg <= 180.0)
        {
            return Err(invalid("angle bounds must satisfy 0 <= min <= max <= 180"));
        }
        Ok(())
    }

    pub fn landmarks(&self) -> [Landmark; 3] {
        [self.point_a, self.point_b, self.point_c]
    }

    /// Inclusive range check. NaN is never accepted.
    pub fn accepts(&self, angle_deg: f64) -> bool {
        self.min_angle_deg <= angle_deg && angle_deg <= self.max_angle_deg
    }
}

fn builtin_policies() -> [ExercisePolicy; 3] {
    use Landmark::*;

    [
        ExercisePolicy {
            id: PUSHUPS.to_string(),
            point_a: LeftShoulder,
            point_b: LeftElbow,
            point_c: LeftWrist,
            min_angle_deg: 80.0,
            max_angle_deg: 100.0,
        },
        ExercisePolicy {
            id: SQUATS.to_string(),
            point_a: LeftHip,
            point_b: LeftKnee,
            point_c: LeftAnkle,
            min_angle_deg: 70.0,
            max_angle_deg: 110.0,
        },
        ExercisePolicy {
            id: PULLUPS.to_string(),
            point_a: LeftShoulder,
            point_b: LeftElbow,
            point_c: LeftWrist,
            min_angle_deg: 120.0,
            max_angle_deg: 150.0,
        },
    ]
}

/// Immutable exercise table. Clones share the same map.
#[derive(Debug, Clone)]
pub struct PolicyRegistry {
    policies: Arc<HashMap<String, Arc<ExercisePolicy>>>,
}

impl Default for PolicyRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl PolicyRegistry {
    /// Registry with the push-up, squat and pull-up policies.
    pub fn builtin() -> Self {
        let policies = builtin_policies()
            .into_iter()
            .map(|policy| (policy.id.clone(), Arc::new(policy)))
            .collect();
        Self {
            policies: Arc::new(policies),
        }
    }

    /// Built-in policies extended (or overridden by id) with `extra`.
    pub fn with_policies(extra: impl IntoIterator<Item = ExercisePolicy>) -> Result<Self> {
        let mut policies: HashMap<_, _> = builtin_policies()
            .into_iter()
            .map(|policy| (policy.id.clone(), Arc::new(policy)))
            .collect();

        for policy in extra {
            policy.validate()?;
            tracing::debug!(exercise = %policy.id, "registering exercise policy");
            policies.insert(policy.id.clone(), Arc::new(policy));
        }

        Ok(Self {
            policies: Arc::new(policies),
        })
    }

    /// Policy registered under `exercise_id`, or `InvalidExercise`.
    pub fn lookup(&self, exercise_id: &str) -> Result<Arc<ExercisePolicy>> {
        self.policies
            .get(exercise_id)
            .cloned()
            .ok_or_else(|| WorkoutError::InvalidExercise(exercise_id.to_string()))
    }

    /// Returns `true` when `exercise_id` names a registered policy.
    pub fn is_valid(&self, exercise_id: &str) -> bool {
        self.policies.contains_key(exercise_id)
    }

    /// Registered exercise ids in alphabetical order.
    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.policies.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    /// Registered policies in id order.
    pub fn policies(&self) -> Vec<Arc<ExercisePolicy>> {
        self.ids()
            .into_iter()
            .filter_map(|id| self.policies.get(id).cloned())
            .collect()
    }
}

//! Workout session lifecycle and running accuracy statistics.
//!
//! [`SessionStore`] is the only component that mutates sessions. Every
//! session has its own async mutex; a sample append holds it for the duration
//! of the persisted write so the counter triple (`total_count`,
//! `correct_count`, `accuracy_pct`) always moves as one unit.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize, Serializer};
use tokio::sync::Mutex;

use crate::{store::WorkoutStore, PolicyRegistry, Result, WorkoutError};

/// Identifier generated by the persistence backend.
pub type SessionId = i64;

/// Number of sessions returned by history queries without an explicit limit.
pub const DEFAULT_HISTORY_LIMIT: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Ended,
}

/// Statistics and lifecycle fields of one workout session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: SessionId,
    pub exercise_id: String,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_sec: Option<i64>,
    pub total_count: u64,
    pub correct_count: u64,
    /// Unrounded ratio; serialised with one decimal.
    #[serde(serialize_with = "serialize_one_decimal")]
    pub accuracy_pct: f64,
}

impl SessionSummary {
    /// Fresh, active session with zeroed counters.
    pub fn new(id: SessionId, exercise_id: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            id,
            exercise_id: exercise_id.into(),
            status: SessionStatus::Active,
            started_at,
            ended_at: None,
            duration_sec: None,
            total_count: 0,
            correct_count: 0,
            accuracy_pct: 0.0,
        }
    }

    pub fn is_ended(&self) -> bool {
        self.status == SessionStatus::Ended
    }

    /// Counts one classified frame and recomputes the accuracy from the
    /// post-increment pair.
    pub fn apply_sample(&mut self, is_correct: bool) {
        self.total_count += 1;
        if is_correct {
            self.correct_count += 1;
        }
        self.accuracy_pct = accuracy_pct(self.correct_count, self.total_count);
    }

    /// Marks the session ended at `ended_at`. No-op on an ended session.
    pub fn finish(&mut self, ended_at: DateTime<Utc>) {
        if self.is_ended() {
            return;
        }
        self.status = SessionStatus::Ended;
        self.ended_at = Some(ended_at);
        self.duration_sec = Some((ended_at - self.started_at).num_seconds().max(0));
    }
}

/// `correct * 100 / total`, or 0 for an empty session.
pub fn accuracy_pct(correct_count: u64, total_count: u64) -> f64 {
    if total_count == 0 {
        0.0
    } else {
        correct_count as f64 * 100.0 / total_count as f64
    }
}

fn serialize_one_decimal<S: Serializer>(value: &f64, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_f64((value * 10.0).round() / 10.0)
}

/// One classified frame attached to a session. Never updated once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub session_id: SessionId,
    pub timestamp: DateTime<Utc>,
    pub angle_deg: f64,
    pub is_correct: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDetail {
    pub stats: SessionSummary,
    pub samples: Vec<Sample>,
}

type SessionCell = Arc<Mutex<SessionSummary>>;

/// Wall clock truncated to the microsecond precision the backends persist.
fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Owner of all workout sessions and the aggregation of their samples.
#[derive(Debug)]
pub struct SessionStore {
    registry: PolicyRegistry,
    backend: Arc<dyn WorkoutStore>,
    sessions: RwLock<HashMap<SessionId, SessionCell>>,
}

impl SessionStore {
    pub fn new(registry: PolicyRegistry, backend: Arc<dyn WorkoutStore>) -> Self {
        Self {
            registry,
            backend,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Exercises sessions may be created for.
    pub fn registry(&self) -> &PolicyRegistry {
        &self.registry
    }

    /// Starts a new active session for `exercise_id`.
    pub async fn create_session(&self, exercise_id: &str) -> Result<SessionId> {
        if !self.registry.is_valid(exercise_id) {
            return Err(WorkoutError::InvalidExercise(exercise_id.to_string()));
        }

        let started_at = now();
        let id = self.backend.insert_session(exercise_id, started_at).await?;
        let summary = SessionSummary::new(id, exercise_id, started_at);
        self.sessions_write()?
            .insert(id, Arc::new(Mutex::new(summary)));

        tracing::info!(session = id, exercise = exercise_id, "workout session started");
        Ok(id)
    }

    /// Appends one sample and returns the updated statistics.
    ///
    /// The in-memory counters only change after the backend accepted the
    /// write, so a store failure leaves the session exactly as it was.
    pub async fn record_sample(
        &self,
        session_id: SessionId,
        angle_deg: f64,
        is_correct: bool,
    ) -> Result<SessionSummary> {
        let cell = self.cell(session_id).await?;
        let mut current = cell.lock().await;
        if current.is_ended() {
            return Err(WorkoutError::SessionAlreadyEnded(session_id));
        }

        let sample = Sample {
            session_id,
            timestamp: now(),
            angle_deg,
            is_correct,
        };
        let mut next = current.clone();
        next.apply_sample(is_correct);

        self.backend.append_sample(&sample, &next).await?;
        *current = next;

        tracing::debug!(
            session = session_id,
            angle = angle_deg,
            is_correct,
            total = current.total_count,
            "sample recorded"
        );
        Ok(current.clone())
    }

    /// Ends the session. Repeated calls return the summary finalised by the
    /// first one.
    pub async fn end_session(&self, session_id: SessionId) -> Result<SessionSummary> {
        let cell = self.cell(session_id).await?;
        let mut current = cell.lock().await;
        if current.is_ended() {
            return Ok(current.clone());
        }

        let mut next = current.clone();
        next.finish(now());
        self.backend.finish_session(&next).await?;
        *current = next;
        // Ended sessions are immutable; later reads go to the backend.
        self.sessions_write()?.remove(&session_id);

        tracing::info!(
            session = session_id,
            duration = current.duration_sec,
            total = current.total_count,
            correct = current.correct_count,
            "workout session ended"
        );
        Ok(current.clone())
    }

    /// Current statistics of one session.
    pub async fn session(&self, session_id: SessionId) -> Result<SessionSummary> {
        let cell = self.cell(session_id).await?;
        let current = cell.lock().await;
        Ok(current.clone())
    }

    /// Statistics plus every sample, read under the session lock so both
    /// halves describe the same point in time.
    pub async fn get_session_detail(&self, session_id: SessionId) -> Result<SessionDetail> {
        let cell = self.cell(session_id).await?;
        let current = cell.lock().await;
        let samples = self.backend.samples(session_id).await?;
        Ok(SessionDetail {
            stats: current.clone(),
            samples,
        })
    }

    /// Most recently started sessions first.
    pub async fn list_recent_sessions(&self, limit: usize) -> Result<Vec<SessionSummary>> {
        self.backend.recent_sessions(limit).await
    }

    /// Resolves the cell for `session_id`, loading it from the backend when
    /// it is not cached. Only active sessions are cached.
    async fn cell(&self, session_id: SessionId) -> Result<SessionCell> {
        let cached = self.sessions_read()?.get(&session_id).cloned();
        if let Some(cell) = cached {
            return Ok(cell);
        }

        let summary = self
            .backend
            .load_session(session_id)
            .await?
            .ok_or(WorkoutError::UnknownSession(session_id))?;
        if summary.is_ended() {
            return Ok(Arc::new(Mutex::new(summary)));
        }

        let mut sessions = self.sessions_write()?;
        let cell = sessions
            .entry(session_id)
            .or_insert_with(|| Arc::new(Mutex::new(summary)));
        Ok(cell.clone())
    }

    fn sessions_read(
        &self,
    ) -> Result<std::sync::RwLockReadGuard<'_, HashMap<SessionId, SessionCell>>> {
        self.sessions
            .read()
            .map_err(|_| WorkoutError::msg("session table has been poisoned"))
    }

    fn sessions_write(
        &self,
    ) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<SessionId, SessionCell>>> {
        self.sessions
            .write()
            .map_err(|_| WorkoutError::msg("session table has been poisoned"))
    }
}

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex, MutexGuard,
    },
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::WorkoutStore;
use crate::{
    session::{Sample, SessionId, SessionSummary},
    Result, WorkoutError,
};

#[derive(Debug, Default)]
struct Tables {
    workouts: BTreeMap<SessionId, SessionSummary>,
    angles: Vec<Sample>,
    last_id: SessionId,
}

/// Process-local store. Writes are atomic per call; nothing survives a
/// restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates an outage: while set, every call fails with
    /// [`WorkoutError::StoreUnavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn lock(&self) -> Result<MutexGuard<'_, Tables>> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(WorkoutError::StoreUnavailable(
                "memory store is offline".to_string(),
            ));
        }
        self.tables
            .lock()
            .map_err(|_| WorkoutError::msg("memory store has been poisoned"))
    }
}

#[async_trait]
impl WorkoutStore for MemoryStore {
    async fn insert_session(&self, exercise_id: &str, started_at: DateTime<Utc>) -> Result<SessionId> {
        let mut tables = self.lock()?;
        tables.last_id += 1;
        let id = tables.last_id;
        tables
            .workouts
            .insert(id, SessionSummary::new(id, exercise_id, started_at));
        Ok(id)
    }

    async fn load_session(&self, id: SessionId) -> Result<Option<SessionSummary>> {
        Ok(self.lock()?.workouts.get(&id).cloned())
    }

    async fn append_sample(&self, sample: &Sample, updated: &SessionSummary) -> Result<()> {
        let mut tables = self.lock()?;
        let row = tables
            .workouts
            .get_mut(&sample.session_id)
            .ok_or(WorkoutError::UnknownSession(sample.session_id))?;
        *row = updated.clone();
        tables.angles.push(sample.clone());
        Ok(())
    }

    async fn finish_session(&self, summary: &SessionSummary) -> Result<()> {
        let mut tables = self.lock()?;
        let row = tables
            .workouts
            .get_mut(&summary.id)
            .ok_or(WorkoutError::UnknownSession(summary.id))?;
        *row = summary.clone();
        Ok(())
    }

    async fn samples(&self, id: SessionId) -> Result<Vec<Sample>> {
        Ok(self
            .lock()?
            .angles
            .iter()
            .filter(|sample| sample.session_id == id)
            .cloned()
            .collect())
    }

    async fn recent_sessions(&self, limit: usize) -> Result<Vec<SessionSummary>> {
        let tables = self.lock()?;
        let mut sessions: Vec<SessionSummary> = tables.workouts.values().cloned().collect();
        sessions.sort_by(|a, b| b.started_at.cmp(&a.started_at).then(b.id.cmp(&a.id)));
        sessions.truncate(limit);
        Ok(sessions)
    }
}

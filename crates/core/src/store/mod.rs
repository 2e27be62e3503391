//! Persistence boundary for sessions and samples.
//!
//! Two logical tables back the engine: `workouts` (one row per session) and
//! `angles` (one row per sample). [`MemoryStore`] keeps them in process,
//! [`SqliteStore`] in a SQLite database.

mod memory;
mod sqlite;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    session::{Sample, SessionId, SessionSummary},
    Result,
};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Durable storage used by [`crate::SessionStore`].
#[async_trait]
pub trait WorkoutStore: Send + Sync + std::fmt::Debug {
    /// Inserts a new session row and returns its generated id.
    async fn insert_session(&self, exercise_id: &str, started_at: DateTime<Utc>) -> Result<SessionId>;

    async fn load_session(&self, id: SessionId) -> Result<Option<SessionSummary>>;

    /// Appends `sample` and stores `updated` counters in a single transaction.
    async fn append_sample(&self, sample: &Sample, updated: &SessionSummary) -> Result<()>;

    /// Persists the end timestamp and duration of a finished session.
    async fn finish_session(&self, summary: &SessionSummary) -> Result<()>;

    /// Samples of one session in append order.
    async fn samples(&self, id: SessionId) -> Result<Vec<Sample>>;

    /// Sessions ordered by start time, newest first.
    async fn recent_sessions(&self, limit: usize) -> Result<Vec<SessionSummary>>;
}

/// Opens the SQLite database at `path`, or an in-memory store when no path
/// is configured.
pub async fn open(path: Option<&Path>) -> Result<Arc<dyn WorkoutStore>> {
    match path {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            tracing::info!(path = %path.display(), "opening sqlite workout store");
            Ok(Arc::new(SqliteStore::open(path).await?))
        }
        None => {
            tracing::info!("using in-memory workout store");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

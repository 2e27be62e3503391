use std::{path::Path, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow},
    Row, SqlitePool,
};

use super::WorkoutStore;
use crate::{
    session::{accuracy_pct, Sample, SessionId, SessionStatus, SessionSummary},
    Result, WorkoutError,
};

const SCHEMA: [&str; 3] = [
    "CREATE TABLE IF NOT EXISTS workouts (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        exercise_type TEXT NOT NULL,
        start_time TEXT NOT NULL,
        end_time TEXT,
        duration INTEGER,
        correct_count INTEGER NOT NULL DEFAULT 0,
        total_count INTEGER NOT NULL DEFAULT 0,
        accuracy REAL NOT NULL DEFAULT 0
    )",
    "CREATE TABLE IF NOT EXISTS angles (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        workout_id INTEGER NOT NULL REFERENCES workouts(id),
        timestamp TEXT NOT NULL,
        angle REAL NOT NULL,
        is_correct BOOLEAN NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_angles_workout ON angles (workout_id, id)",
];

// Counters are recomputed from `angles` on every read; the stored columns are
// kept in step for external readers of the table.
const SESSION_SELECT: &str = "SELECT w.id, w.exercise_type, w.start_time, w.end_time, w.duration,
        (SELECT COUNT(*) FROM angles a WHERE a.workout_id = w.id) AS total_count,
        (SELECT COUNT(*) FROM angles a WHERE a.workout_id = w.id AND a.is_correct) AS correct_count
    FROM workouts w";

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite-backed store using the `workouts` / `angles` layout.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Opens (creating if needed) the database file at `path`. Every pooled
    /// connection runs in WAL mode with a 5 s busy timeout.
    pub async fn open(path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        Self::with_pool(pool).await
    }

    /// Private in-memory database. The pool is pinned to one connection that
    /// is never recycled, since the data lives inside it.
    pub async fn in_memory() -> Result<Self> {
        let options = "sqlite::memory:"
            .parse::<SqliteConnectOptions>()?
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        Self::with_pool(pool).await
    }

    async fn with_pool(pool: SqlitePool) -> Result<Self> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }
        Ok(Self { pool })
    }
}

fn format_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|timestamp| timestamp.with_timezone(&Utc))
        .map_err(|err| WorkoutError::msg(format!("malformed timestamp `{value}`: {err}")))
}

fn session_from_row(row: &SqliteRow) -> Result<SessionSummary> {
    let started_at = parse_timestamp(&row.try_get::<String, _>("start_time")?)?;
    let ended_at = row
        .try_get::<Option<String>, _>("end_time")?
        .map(|value| parse_timestamp(&value))
        .transpose()?;
    let total_count = row.try_get::<i64, _>("total_count")?.max(0) as u64;
    let correct_count = row.try_get::<i64, _>("correct_count")?.max(0) as u64;

    Ok(SessionSummary {
        id: row.try_get("id")?,
        exercise_id: row.try_get("exercise_type")?,
        status: if ended_at.is_some() {
            SessionStatus::Ended
        } else {
            SessionStatus::Active
        },
        started_at,
        ended_at,
        duration_sec: row.try_get("duration")?,
        total_count,
        correct_count,
        accuracy_pct: accuracy_pct(correct_count, total_count),
    })
}

fn sample_from_row(row: &SqliteRow) -> Result<Sample> {
    Ok(Sample {
        session_id: row.try_get("workout_id")?,
        timestamp: parse_timestamp(&row.try_get::<String, _>("timestamp")?)?,
        angle_deg: row.try_get("angle")?,
        is_correct: row.try_get("is_correct")?,
    })
}

#[async_trait]
impl WorkoutStore for SqliteStore {
    async fn insert_session(&self, exercise_id: &str, started_at: DateTime<Utc>) -> Result<SessionId> {
        let result = sqlx::query("INSERT INTO workouts (exercise_type, start_time) VALUES (?, ?)")
            .bind(exercise_id)
            .bind(format_timestamp(&started_at))
            .execute(&self.pool)
            .await?;
        Ok(result.last_insert_rowid())
    }

    async fn load_session(&self, id: SessionId) -> Result<Option<SessionSummary>> {
        let sql = format!("{SESSION_SELECT} WHERE w.id = ?");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(session_from_row).transpose()
    }

    async fn append_sample(&self, sample: &Sample, updated: &SessionSummary) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("INSERT INTO angles (workout_id, timestamp, angle, is_correct) VALUES (?, ?, ?, ?)")
            .bind(sample.session_id)
            .bind(format_timestamp(&sample.timestamp))
            .bind(sample.angle_deg)
            .bind(sample.is_correct)
            .execute(&mut *tx)
            .await?;

        let updated_rows = sqlx::query(
            "UPDATE workouts SET total_count = ?, correct_count = ?, accuracy = ? WHERE id = ?",
        )
        .bind(updated.total_count as i64)
        .bind(updated.correct_count as i64)
        .bind(updated.accuracy_pct)
        .bind(updated.id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated_rows == 0 {
            tx.rollback().await?;
            return Err(WorkoutError::UnknownSession(updated.id));
        }

        tx.commit().await?;
        Ok(())
    }

    async fn finish_session(&self, summary: &SessionSummary) -> Result<()> {
        let updated_rows = sqlx::query("UPDATE workouts SET end_time = ?, duration = ? WHERE id = ?")
            .bind(summary.ended_at.as_ref().map(format_timestamp))
            .bind(summary.duration_sec)
            .bind(summary.id)
            .execute(&self.pool)
            .await?
            .rows_affected();

        if updated_rows == 0 {
            return Err(WorkoutError::UnknownSession(summary.id));
        }
        Ok(())
    }

    async fn samples(&self, id: SessionId) -> Result<Vec<Sample>> {
        let rows = sqlx::query(
            "SELECT workout_id, timestamp, angle, is_correct FROM angles WHERE workout_id = ? ORDER BY id",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(sample_from_row).collect()
    }

    async fn recent_sessions(&self, limit: usize) -> Result<Vec<SessionSummary>> {
        let sql = format!("{SESSION_SELECT} ORDER BY w.start_time DESC, w.id DESC LIMIT ?");
        let rows = sqlx::query(&sql)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(session_from_row).collect()
    }
}

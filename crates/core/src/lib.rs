//! Core library for RepCheck, the exercise-session engine.
//!
//! Landmark frames from a pose estimator are turned into joint angles
//! ([`geometry`]), judged against per-exercise policies ([`policy`],
//! [`classifier`]), aggregated into workout sessions ([`session`]) backed by
//! a relational store ([`store`]), and streamed to observers ([`stream`]).

pub mod classifier;
pub mod config;
pub mod error;
pub mod geometry;
pub mod landmarks;
pub mod policy;
pub mod session;
pub mod store;
pub mod stream;

pub use classifier::{Classification, ExerciseSelector, FrameClassifier};
pub use config::{AppConfig, DatabaseConfig, HistoryConfig, ServerConfig, StreamConfig};
pub use error::{Result, WorkoutError};
pub use geometry::{angle_degrees, Point2D};
pub use landmarks::{Landmark, LandmarkFrame, LandmarkPoint, LANDMARK_COUNT};
pub use policy::{ExercisePolicy, PolicyRegistry};
pub use session::{
    Sample, SessionDetail, SessionId, SessionStatus, SessionStore, SessionSummary,
    DEFAULT_HISTORY_LIMIT,
};
pub use store::{MemoryStore, SqliteStore, WorkoutStore};
pub use stream::{FramePipeline, FrameQueue, FrameSource, StreamCoordinator, StreamEvent, VecSource};

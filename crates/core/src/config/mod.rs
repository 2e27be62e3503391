use std::{net::SocketAddr, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    classifier::DEFAULT_MIN_VISIBILITY, session::DEFAULT_HISTORY_LIMIT,
    stream::DEFAULT_QUEUE_CAPACITY, ExercisePolicy, PolicyRegistry, Result,
};

/// Top-level configuration structure for the application.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub stream: StreamConfig,
    pub history: HistoryConfig,
    /// Policies added to (or replacing) the built-in exercises.
    pub exercises: Vec<ExercisePolicy>,
}

impl AppConfig {
    /// Reads a JSON configuration file. Missing sections take their defaults.
    pub fn load(path: &std::path::Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.policy_registry()?;
        Ok(config)
    }

    /// Registry with the built-in exercises plus the configured ones.
    pub fn policy_registry(&self) -> Result<PolicyRegistry> {
        PolicyRegistry::with_policies(self.exercises.iter().cloned())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 5000)),
        }
    }
}

/// Where workouts are persisted. No path means an in-memory store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: Option<PathBuf>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: Some(PathBuf::from("instance/workouts.db")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub queue_capacity: usize,
    pub capture_fps: u32,
    pub min_visibility: f32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            capture_fps: 30,
            min_visibility: DEFAULT_MIN_VISIBILITY,
        }
    }
}

impl StreamConfig {
    /// Capture period for the configured frame rate.
    pub fn capture_interval(&self) -> Duration {
        frame_interval(self.capture_fps)
    }
}

/// Period between frames at `fps`, clamped to at least one frame per second.
pub fn frame_interval(fps: u32) -> Duration {
    Duration::from_secs(1) / fps.max(1)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    pub default_limit: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            default_limit: DEFAULT_HISTORY_LIMIT,
        }
    }
}

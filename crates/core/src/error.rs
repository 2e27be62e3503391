use crate::session::SessionId;

/// Result alias that carries the custom [`WorkoutError`] type.
pub type Result<T> = std::result::Result<T, WorkoutError>;

/// Common error type for the core crate.
#[derive(Debug, thiserror::Error)]
pub enum WorkoutError {
    /// The exercise id does not name a registered policy.
    #[error("unknown exercise `{0}`")]
    InvalidExercise(String),
    #[error("workout session {0} does not exist")]
    UnknownSession(SessionId),
    #[error("workout session {0} has already ended")]
    SessionAlreadyEnded(SessionId),
    /// The pose estimator found no body, or the landmarks the policy needs are
    /// missing or not visible enough. The frame is dropped.
    #[error("no pose detected in frame")]
    InsufficientLandmarks,
    /// Persistence failure. The core never retries; callers decide.
    #[error("workout store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("invalid exercise policy `{id}`: {reason}")]
    InvalidPolicy { id: String, reason: String },
    #[error("a stream is already running")]
    AlreadyRunning,
    #[error("no stream is running")]
    StreamNotRunning,
    /// Internal faults such as poisoned locks.
    #[error("{0}")]
    Message(String),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Json(#[from] serde_json::Error),
}

impl WorkoutError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }

    /// Returns true for errors caused by the caller's input rather than by the
    /// engine or its collaborators.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidExercise(_)
                | Self::UnknownSession(_)
                | Self::SessionAlreadyEnded(_)
                | Self::InsufficientLandmarks
                | Self::InvalidPolicy { .. }
                | Self::AlreadyRunning
                | Self::StreamNotRunning
                | Self::Json(_)
        )
    }
}

impl From<sqlx::Error> for WorkoutError {
    fn from(value: sqlx::Error) -> Self {
        Self::StoreUnavailable(value.to_string())
    }
}

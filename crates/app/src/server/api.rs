use std::path::PathBuf;

use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection, QueryRejection},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use repcheck_core::{
    config::frame_interval, ExercisePolicy, LandmarkFrame, LandmarkPoint, SessionId, WorkoutError,
};
use serde::Deserialize;
use serde_json::{json, Value};

use super::AppState;
use crate::replay::JsonLinesSource;

type ApiResult = Result<Json<Value>, ApiError>;

/// Error body `{"status": "error", "message": …}` with a matching status code.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl From<WorkoutError> for ApiError {
    fn from(err: WorkoutError) -> Self {
        let status = match &err {
            WorkoutError::InvalidExercise(_)
            | WorkoutError::InsufficientLandmarks
            | WorkoutError::Json(_) => StatusCode::BAD_REQUEST,
            WorkoutError::UnknownSession(_) => StatusCode::NOT_FOUND,
            WorkoutError::SessionAlreadyEnded(_)
            | WorkoutError::AlreadyRunning
            | WorkoutError::StreamNotRunning => StatusCode::CONFLICT,
            WorkoutError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(status = %self.status, message = %self.message, "request failed");
        } else {
            tracing::debug!(status = %self.status, message = %self.message, "request rejected");
        }
        let body = json!({ "status": "error", "message": self.message });
        (self.status, Json(body)).into_response()
    }
}

fn success(mut body: Value) -> ApiResult {
    if let Value::Object(map) = &mut body {
        map.insert("status".into(), "success".into());
    }
    Ok(Json(body))
}

#[derive(Debug, Deserialize)]
pub struct StartWorkout {
    exercise_type: String,
}

pub async fn start_workout(
    State(state): State<AppState>,
    payload: Result<Json<StartWorkout>, JsonRejection>,
) -> ApiResult {
    let Json(request) = payload?;
    let workout_id = state.sessions.create_session(&request.exercise_type).await?;
    success(json!({ "workout_id": workout_id }))
}

#[derive(Debug, Deserialize)]
pub struct SaveAngle {
    workout_id: SessionId,
    angle: f64,
    is_correct: bool,
}

pub async fn save_angle(
    State(state): State<AppState>,
    payload: Result<Json<SaveAngle>, JsonRejection>,
) -> ApiResult {
    let Json(request) = payload?;
    let stats = state
        .sessions
        .record_sample(request.workout_id, request.angle, request.is_correct)
        .await?;
    success(json!({ "stats": stats }))
}

#[derive(Debug, Deserialize)]
pub struct ProcessFrame {
    workout_id: SessionId,
    #[serde(default)]
    landmarks: Option<Vec<LandmarkPoint>>,
}

pub async fn process_frame(
    State(state): State<AppState>,
    payload: Result<Json<ProcessFrame>, JsonRejection>,
) -> ApiResult {
    let Json(request) = payload?;
    // Each workout is judged by its own exercise, whatever the shared stream
    // has selected.
    let session = state.sessions.session(request.workout_id).await?;
    let policy = state.registry().lookup(&session.exercise_id)?;
    let frame = LandmarkFrame::from_detection(request.landmarks);
    let event = state
        .pipeline
        .process(request.workout_id, &frame, &policy)
        .await?;
    success(json!({ "event": event }))
}

#[derive(Debug, Deserialize)]
pub struct EndWorkout {
    workout_id: SessionId,
}

pub async fn end_workout(
    State(state): State<AppState>,
    payload: Result<Json<EndWorkout>, JsonRejection>,
) -> ApiResult {
    let Json(request) = payload?;
    let workout = state.sessions.end_session(request.workout_id).await?;
    success(json!({ "workout": workout }))
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    limit: Option<usize>,
}

pub async fn workout_history(
    State(state): State<AppState>,
    query: Result<Query<HistoryQuery>, QueryRejection>,
) -> ApiResult {
    let Query(query) = query?;
    let limit = query.limit.unwrap_or(state.config.history.default_limit);
    let workouts = state.sessions.list_recent_sessions(limit).await?;
    success(json!({ "workouts": workouts }))
}

pub async fn workout_details(
    State(state): State<AppState>,
    id: Result<Path<SessionId>, PathRejection>,
) -> ApiResult {
    let Path(id) = id?;
    let detail = state.sessions.get_session_detail(id).await?;
    success(json!({ "stats": detail.stats, "samples": detail.samples }))
}

#[derive(Debug, Deserialize)]
pub struct SetExercise {
    exercise_type: String,
}

pub async fn set_exercise(
    State(state): State<AppState>,
    payload: Result<Json<SetExercise>, JsonRejection>,
) -> ApiResult {
    let Json(request) = payload?;
    let policy = state.coordinator.select_exercise(&request.exercise_type)?;
    success(json!({ "exercise_type": policy.id }))
}

pub async fn exercises(State(state): State<AppState>) -> ApiResult {
    let policies = state.registry().policies();
    let exercises: Vec<&ExercisePolicy> = policies.iter().map(|policy| &**policy).collect();
    success(json!({ "exercises": exercises }))
}

#[derive(Debug, Deserialize)]
pub struct StreamStart {
    workout_id: SessionId,
    /// JSON-lines landmark recording to play back instead of pushed frames.
    replay: Option<PathBuf>,
    fps: Option<u32>,
}

pub async fn stream_start(
    State(state): State<AppState>,
    payload: Result<Json<StreamStart>, JsonRejection>,
) -> ApiResult {
    let Json(request) = payload?;
    match request.replay {
        Some(path) => {
            let source = JsonLinesSource::open(&path).await?;
            let interval = request
                .fps
                .map(frame_interval)
                .unwrap_or_else(|| state.config.stream.capture_interval());
            state
                .coordinator
                .start_with_source(request.workout_id, Box::new(source), interval)
                .await?;
        }
        None => state.coordinator.start(request.workout_id).await?,
    }
    success(json!({ "workout_id": request.workout_id }))
}

#[derive(Debug, Deserialize)]
pub struct StreamFrame {
    #[serde(default)]
    landmarks: Option<Vec<LandmarkPoint>>,
}

pub async fn stream_frame(
    State(state): State<AppState>,
    payload: Result<Json<StreamFrame>, JsonRejection>,
) -> ApiResult {
    let Json(request) = payload?;
    let dropped = state
        .coordinator
        .submit(LandmarkFrame::from_detection(request.landmarks))
        .await?;
    success(json!({ "dropped_oldest": dropped }))
}

pub async fn stream_stop(State(state): State<AppState>) -> ApiResult {
    state.coordinator.stop().await?;
    success(json!({}))
}

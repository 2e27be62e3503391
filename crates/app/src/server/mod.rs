//! HTTP and WebSocket transport over the workout engine.
//!
//! The process-wide [`StreamCoordinator`] backs the `/api/stream/*` routes
//! and `/ws/events`. Each `/ws/session/:id` connection gets a coordinator of
//! its own, and `/api/process_frame` classifies against the workout's own
//! exercise.

mod api;
mod ws;

use std::{future::Future, net::SocketAddr, sync::Arc};

use axum::{
    routing::{get, post},
    Router,
};
use repcheck_core::{
    policy::PUSHUPS, store, AppConfig, ExerciseSelector, FrameClassifier, FramePipeline,
    PolicyRegistry, Result, SessionStore, StreamCoordinator, WorkoutError, WorkoutStore,
};

/// Shared handles given to every request handler.
#[derive(Debug, Clone)]
pub struct AppState {
    pub sessions: Arc<SessionStore>,
    pub pipeline: Arc<FramePipeline>,
    pub coordinator: Arc<StreamCoordinator>,
    pub config: Arc<AppConfig>,
}

impl AppState {
    /// Opens the configured store and builds the engine around it.
    pub async fn from_config(config: &AppConfig) -> Result<Self> {
        let backend = store::open(config.database.path.as_deref()).await?;
        Self::with_backend(config.clone(), backend)
    }

    pub fn with_backend(config: AppConfig, backend: Arc<dyn WorkoutStore>) -> Result<Self> {
        let registry = config.policy_registry()?;
        let sessions = Arc::new(SessionStore::new(registry.clone(), backend));
        let classifier = FrameClassifier::new(registry.clone())
            .with_min_visibility(config.stream.min_visibility);
        let pipeline = Arc::new(FramePipeline::new(classifier, sessions.clone()));
        let selector = ExerciseSelector::for_exercise(&registry, PUSHUPS)?;
        let coordinator = Arc::new(StreamCoordinator::new(
            pipeline.clone(),
            selector,
            config.stream.queue_capacity,
        ));

        Ok(Self {
            sessions,
            pipeline,
            coordinator,
            config: Arc::new(config),
        })
    }

    pub fn registry(&self) -> &PolicyRegistry {
        self.sessions.registry()
    }

    /// A fresh coordinator for a per-connection stream.
    pub fn session_coordinator(&self, exercise_id: &str) -> Result<StreamCoordinator> {
        let selector = ExerciseSelector::for_exercise(self.registry(), exercise_id)?;
        Ok(StreamCoordinator::new(
            self.pipeline.clone(),
            selector,
            self.config.stream.queue_capacity,
        ))
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/start_workout", post(api::start_workout))
        .route("/api/save_angle", post(api::save_angle))
        .route("/api/process_frame", post(api::process_frame))
        .route("/api/end_workout", post(api::end_workout))
        .route("/api/workout_history", get(api::workout_history))
        .route("/api/workout_details/:id", get(api::workout_details))
        .route("/api/set_exercise", post(api::set_exercise))
        .route("/api/exercises", get(api::exercises))
        .route("/api/stream/start", post(api::stream_start))
        .route("/api/stream/frame", post(api::stream_frame))
        .route("/api/stream/stop", post(api::stream_stop))
        .route("/ws/events", get(ws::events))
        .route("/ws/session/:id", get(ws::session))
        .with_state(state)
}

/// Serves until `shutdown` resolves, then stops the process-wide stream.
pub async fn serve<F>(listener: tokio::net::TcpListener, state: AppState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let local_addr: SocketAddr = listener.local_addr()?;
    tracing::info!(%local_addr, "workout server listening");

    let coordinator = state.coordinator.clone();
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|err| WorkoutError::msg(format!("server error: {err}")))?;

    coordinator.stop().await?;
    tracing::info!("workout server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::{SinkExt, StreamExt};
    use repcheck_core::{Landmark, LandmarkPoint, MemoryStore, LANDMARK_COUNT};
    use serde_json::{json, Value};
    use tokio::{sync::oneshot, task::JoinHandle};
    use tokio_tungstenite::tungstenite::Message;

    use super::*;

    struct TestServer {
        addr: SocketAddr,
        client: reqwest::Client,
        shutdown: Option<oneshot::Sender<()>>,
        task: Option<JoinHandle<Result<()>>>,
    }

    impl TestServer {
        async fn start() -> Self {
            let mut config = AppConfig::default();
            config.database.path = None;
            let state = AppState::with_backend(config, Arc::new(MemoryStore::new())).unwrap();

            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let (tx, rx) = oneshot::channel::<()>();
            let task = tokio::spawn(serve(listener, state, async move {
                let _ = rx.await;
            }));

            Self {
                addr,
                client: reqwest::Client::new(),
                shutdown: Some(tx),
                task: Some(task),
            }
        }

        fn url(&self, path: &str) -> String {
            format!("http://{}{}", self.addr, path)
        }

        async fn post(&self, path: &str, body: Value) -> (u16, Value) {
            let response = self
                .client
                .post(self.url(path))
                .json(&body)
                .send()
                .await
                .unwrap();
            let status = response.status().as_u16();
            (status, response.json().await.unwrap())
        }

        async fn get(&self, path: &str) -> (u16, Value) {
            let response = self.client.get(self.url(path)).send().await.unwrap();
            let status = response.status().as_u16();
            (status, response.json().await.unwrap())
        }

        async fn start_workout(&self, exercise: &str) -> i64 {
            let (status, body) = self
                .post("/api/start_workout", json!({ "exercise_type": exercise }))
                .await;
            assert_eq!(status, 200, "{body}");
            body["workout_id"].as_i64().unwrap()
        }

        async fn shutdown(mut self) {
            if let Some(tx) = self.shutdown.take() {
                let _ = tx.send(());
            }
            if let Some(task) = self.task.take() {
                task.await.unwrap().unwrap();
            }
        }
    }

    /// Full frame with the joint at the origin and its two neighbours
    /// `angle` degrees apart.
    fn joint_at(angle: f64, start: Landmark, end: Landmark) -> Value {
        let radians = angle.to_radians();
        let mut points = vec![LandmarkPoint::new(0.0, 0.0).with_visibility(0.9); LANDMARK_COUNT];
        points[start.index()] = LandmarkPoint::new(1.0, 0.0).with_visibility(0.9);
        points[end.index()] = LandmarkPoint::new(radians.cos(), radians.sin()).with_visibility(0.9);
        serde_json::to_value(points).unwrap()
    }

    fn arm_at(angle: f64) -> Value {
        joint_at(angle, Landmark::LeftShoulder, Landmark::LeftWrist)
    }

    fn leg_at(angle: f64) -> Value {
        joint_at(angle, Landmark::LeftHip, Landmark::LeftAnkle)
    }

    #[tokio::test]
    async fn workout_lifecycle_over_http() {
        let server = TestServer::start().await;
        let id = server.start_workout("squats").await;
        assert_eq!(id, 1);

        for is_correct in [true, true, false] {
            let (status, body) = server
                .post(
                    "/api/save_angle",
                    json!({ "workout_id": id, "angle": 90.0, "is_correct": is_correct }),
                )
                .await;
            assert_eq!(status, 200);
            assert_eq!(body["status"], "success");
        }

        let (status, details) = server.get(&format!("/api/workout_details/{id}")).await;
        assert_eq!(status, 200);
        assert_eq!(details["stats"]["correct_count"], 2);
        assert_eq!(details["stats"]["total_count"], 3);
        assert_eq!(details["stats"]["accuracy_pct"], 66.7);
        assert_eq!(details["samples"].as_array().unwrap().len(), 3);

        let (status, ended) = server.post("/api/end_workout", json!({ "workout_id": id })).await;
        assert_eq!(status, 200);
        assert_eq!(ended["workout"]["status"], "ended");
        assert_eq!(ended["workout"]["correct_count"], 2);
        assert!(ended["workout"]["duration_sec"].as_i64().unwrap() >= 0);

        let (status, body) = server
            .post(
                "/api/save_angle",
                json!({ "workout_id": id, "angle": 90.0, "is_correct": true }),
            )
            .await;
        assert_eq!(status, 409);
        assert_eq!(body["status"], "error");

        server.shutdown().await;
    }

    #[tokio::test]
    async fn errors_map_to_status_codes() {
        let server = TestServer::start().await;

        let (status, body) = server
            .post("/api/start_workout", json!({ "exercise_type": "burpees" }))
            .await;
        assert_eq!(status, 400);
        assert_eq!(body["status"], "error");
        assert!(body["message"].as_str().unwrap().contains("burpees"));

        let (status, _) = server.get("/api/workout_details/42").await;
        assert_eq!(status, 404);

        let (status, body) = server.post("/api/start_workout", json!({})).await;
        assert_eq!(status, 400);
        assert_eq!(body["status"], "error");

        let (status, _) = server
            .post("/api/stream/frame", json!({ "landmarks": null }))
            .await;
        assert_eq!(status, 409);

        server.shutdown().await;
    }

    #[tokio::test]
    async fn history_is_newest_first_and_limited() {
        let server = TestServer::start().await;
        for exercise in ["pushups", "squats", "pullups"] {
            server.start_workout(exercise).await;
        }

        let (status, body) = server.get("/api/workout_history?limit=2").await;
        assert_eq!(status, 200);
        let workouts = body["workouts"].as_array().unwrap();
        assert_eq!(workouts.len(), 2);
        assert_eq!(workouts[0]["id"], 3);
        assert_eq!(workouts[1]["id"], 2);

        let (_, body) = server.get("/api/workout_history").await;
        assert_eq!(body["workouts"].as_array().unwrap().len(), 3);

        let (_, body) = server.get("/api/exercises").await;
        let ids: Vec<_> = body["exercises"]
            .as_array()
            .unwrap()
            .iter()
            .map(|policy| policy["id"].as_str().unwrap().to_owned())
            .collect();
        assert_eq!(ids, ["pullups", "pushups", "squats"]);

        server.shutdown().await;
    }

    #[tokio::test]
    async fn process_frame_judges_each_workout_by_its_own_exercise() {
        let server = TestServer::start().await;
        let squats = server.start_workout("squats").await;
        let pushups = server.start_workout("pushups").await;
        let (status, _) = server
            .post("/api/set_exercise", json!({ "exercise_type": "pullups" }))
            .await;
        assert_eq!(status, 200);

        let (status, body) = server
            .post("/api/process_frame", json!({ "workout_id": squats, "landmarks": leg_at(90.0) }))
            .await;
        assert_eq!(status, 200);
        assert_eq!(body["event"]["event"], "classified");
        assert_eq!(body["event"]["session_id"], squats);
        assert_eq!(body["event"]["exercise_id"], "squats");
        assert_eq!(body["event"]["is_correct"], true);

        let (_, body) = server
            .post("/api/process_frame", json!({ "workout_id": pushups, "landmarks": arm_at(90.0) }))
            .await;
        assert_eq!(body["event"]["exercise_id"], "pushups");
        assert_eq!(body["event"]["is_correct"], true);

        // Correct for pull-ups, which only the shared stream has selected.
        let (_, body) = server
            .post("/api/process_frame", json!({ "workout_id": pushups, "landmarks": arm_at(135.0) }))
            .await;
        assert_eq!(body["event"]["exercise_id"], "pushups");
        assert_eq!(body["event"]["is_correct"], false);
        assert_eq!(body["event"]["total_count"], 2);

        let (status, body) = server
            .post("/api/process_frame", json!({ "workout_id": squats, "landmarks": null }))
            .await;
        assert_eq!(status, 200);
        assert_eq!(body["event"]["event"], "no_detection");
        assert_eq!(body["event"]["exercise_id"], "squats");

        let (_, details) = server.get(&format!("/api/workout_details/{squats}")).await;
        assert_eq!(details["stats"]["total_count"], 1);
        assert_eq!(details["stats"]["correct_count"], 1);

        let (status, _) = server
            .post("/api/process_frame", json!({ "workout_id": 99, "landmarks": null }))
            .await;
        assert_eq!(status, 404);

        server.shutdown().await;
    }

    #[tokio::test]
    async fn process_wide_stream_can_be_started_and_stopped() {
        let server = TestServer::start().await;
        let id = server.start_workout("pushups").await;

        let (status, _) = server
            .post("/api/stream/start", json!({ "workout_id": id }))
            .await;
        assert_eq!(status, 200);
        let (status, _) = server
            .post("/api/stream/start", json!({ "workout_id": id }))
            .await;
        assert_eq!(status, 409);

        let (status, _) = server
            .post("/api/stream/frame", json!({ "landmarks": arm_at(95.0) }))
            .await;
        assert_eq!(status, 200);

        let (status, _) = server.post("/api/stream/stop", json!({})).await;
        assert_eq!(status, 200);
        let (status, _) = server.post("/api/stream/stop", json!({})).await;
        assert_eq!(status, 200);

        // Frames still queued when the stream stops are discarded.
        let (_, details) = server.get(&format!("/api/workout_details/{id}")).await;
        assert!(details["stats"]["total_count"].as_u64().unwrap() <= 1);

        server.shutdown().await;
    }

    #[tokio::test]
    async fn session_socket_streams_events() {
        let server = TestServer::start().await;
        let id = server.start_workout("pushups").await;

        let url = format!("ws://{}/ws/session/{id}", server.addr);
        let (mut socket, _) = tokio_tungstenite::connect_async(url).await.unwrap();

        socket
            .send(Message::Text(
                json!({ "type": "frame", "landmarks": arm_at(90.0) }).to_string(),
            ))
            .await
            .unwrap();
        let event = read_event(&mut socket).await;
        assert_eq!(event["event"], "classified");
        assert_eq!(event["session_id"], id);
        assert_eq!(event["total_count"], 1);

        socket
            .send(Message::Text(
                json!({ "type": "set_exercise", "exercise_type": "squats" }).to_string(),
            ))
            .await
            .unwrap();
        let event = read_event(&mut socket).await;
        assert_eq!(event["event"], "exercise_selected");
        assert_eq!(event["exercise_id"], "squats");

        socket
            .send(Message::Text(json!({ "type": "frame", "landmarks": null }).to_string()))
            .await
            .unwrap();
        let event = read_event(&mut socket).await;
        assert_eq!(event["event"], "no_detection");
        assert_eq!(event["exercise_id"], "squats");

        socket.close(None).await.unwrap();
        server.shutdown().await;
    }

    #[tokio::test]
    async fn event_socket_mirrors_the_shared_stream() {
        let server = TestServer::start().await;
        let url = format!("ws://{}/ws/events", server.addr);
        let (mut socket, _) = tokio_tungstenite::connect_async(url).await.unwrap();

        let (status, _) = server
            .post("/api/set_exercise", json!({ "exercise_type": "squats" }))
            .await;
        assert_eq!(status, 200);

        let event = read_event(&mut socket).await;
        assert_eq!(event["event"], "exercise_selected");
        assert_eq!(event["exercise_id"], "squats");

        socket.close(None).await.unwrap();
        server.shutdown().await;
    }

    async fn read_event<S>(socket: &mut S) -> Value
    where
        S: futures::Stream<Item = std::result::Result<Message, tokio_tungstenite::tungstenite::Error>>
            + Unpin,
    {
        loop {
            let message = tokio::time::timeout(Duration::from_secs(5), socket.next())
                .await
                .expect("timed out waiting for event")
                .expect("socket closed")
                .unwrap();
            if let Message::Text(text) = message {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }
}

//! Live ingestion: frames flow through a bounded queue into the classifier,
//! the session aggregator and finally a broadcast channel of
//! [`StreamEvent`]s.
//!
//! A [`StreamCoordinator`] is one stream context. It owns its
//! [`ExerciseSelector`], so several streams can classify different exercises
//! concurrently without sharing a global "current exercise".

mod queue;

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::{
    sync::{broadcast, watch, Mutex},
    task::JoinHandle,
    time::MissedTickBehavior,
};

use crate::{
    session::SessionId, ExercisePolicy, ExerciseSelector, FrameClassifier, LandmarkFrame, Result,
    SessionStore, WorkoutError,
};

pub use queue::{FrameQueue, DEFAULT_QUEUE_CAPACITY};

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Result of one frame as published to stream observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StreamEvent {
    Classified {
        session_id: SessionId,
        exercise_id: String,
        angle_deg: f64,
        is_correct: bool,
        total_count: u64,
        correct_count: u64,
        accuracy_pct: f64,
    },
    /// The pose estimator found no usable body in the frame.
    NoDetection {
        session_id: SessionId,
        exercise_id: String,
    },
    /// The frame could not be recorded; the stream keeps running.
    Rejected {
        session_id: SessionId,
        message: String,
    },
    ExerciseSelected {
        exercise_id: String,
    },
}

/// Producer side of a capture loop, e.g. a camera wired to a pose estimator.
#[async_trait]
pub trait FrameSource: Send {
    /// Next captured frame, or `None` once the source is exhausted.
    async fn next_frame(&mut self) -> Option<LandmarkFrame>;
}

/// Frames from a prepared list. Useful for replays and tests.
#[derive(Debug, Default)]
pub struct VecSource {
    frames: std::collections::VecDeque<LandmarkFrame>,
}

impl VecSource {
    pub fn new(frames: impl IntoIterator<Item = LandmarkFrame>) -> Self {
        Self {
            frames: frames.into_iter().collect(),
        }
    }
}

#[async_trait]
impl FrameSource for VecSource {
    async fn next_frame(&mut self) -> Option<LandmarkFrame> {
        self.frames.pop_front()
    }
}

/// Classify-then-record unit shared by streams and request handlers.
#[derive(Debug, Clone)]
pub struct FramePipeline {
    classifier: FrameClassifier,
    sessions: Arc<SessionStore>,
}

impl FramePipeline {
    pub fn new(classifier: FrameClassifier, sessions: Arc<SessionStore>) -> Self {
        Self {
            classifier,
            sessions,
        }
    }

    pub fn classifier(&self) -> &FrameClassifier {
        &self.classifier
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    /// Classifies `frame` against `policy` and records the sample.
    ///
    /// A frame without a usable pose yields [`StreamEvent::NoDetection`] and
    /// leaves the session untouched. Every other failure is returned.
    pub async fn process(
        &self,
        session_id: SessionId,
        frame: &LandmarkFrame,
        policy: &ExercisePolicy,
    ) -> Result<StreamEvent> {
        let classification = match self.classifier.classify_with(frame, policy) {
            Ok(classification) => classification,
            Err(WorkoutError::InsufficientLandmarks) => {
                return Ok(StreamEvent::NoDetection {
                    session_id,
                    exercise_id: policy.id.clone(),
                })
            }
            Err(err) => return Err(err),
        };

        let stats = self
            .sessions
            .record_sample(
                session_id,
                classification.angle_deg,
                classification.is_correct,
            )
            .await?;

        Ok(StreamEvent::Classified {
            session_id,
            exercise_id: policy.id.clone(),
            angle_deg: classification.angle_deg,
            is_correct: classification.is_correct,
            total_count: stats.total_count,
            correct_count: stats.correct_count,
            accuracy_pct: stats.accuracy_pct,
        })
    }
}

#[derive(Debug)]
struct ActiveStream {
    session_id: SessionId,
    queue: Arc<FrameQueue>,
    shutdown: watch::Sender<bool>,
    consumer: JoinHandle<()>,
    producer: Option<JoinHandle<()>>,
}

impl ActiveStream {
    fn is_running(&self) -> bool {
        !self.consumer.is_finished()
    }
}

/// Start/stop control and fan-out for one stream of frames.
#[derive(Debug)]
pub struct StreamCoordinator {
    pipeline: Arc<FramePipeline>,
    selector: ExerciseSelector,
    queue_capacity: usize,
    events: broadcast::Sender<StreamEvent>,
    active: Mutex<Option<ActiveStream>>,
}

impl StreamCoordinator {
    pub fn new(pipeline: Arc<FramePipeline>, selector: ExerciseSelector, queue_capacity: usize) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            pipeline,
            selector,
            queue_capacity,
            events,
            active: Mutex::new(None),
        }
    }

    /// Exercise cell consulted for every frame of this stream.
    pub fn selector(&self) -> &ExerciseSelector {
        &self.selector
    }

    /// Receiver for every event published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<StreamEvent> {
        self.events.subscribe()
    }

    /// Changes the exercise used for subsequent frames of this stream.
    pub fn select_exercise(&self, exercise_id: &str) -> Result<Arc<ExercisePolicy>> {
        let registry = self.pipeline.classifier().registry();
        let policy = self.selector.select(registry, exercise_id)?;
        tracing::info!(exercise = exercise_id, "stream exercise selected");
        let _ = self.events.send(StreamEvent::ExerciseSelected {
            exercise_id: policy.id.clone(),
        });
        Ok(policy)
    }

    /// Returns `true` while the processing stage is alive.
    pub async fn is_running(&self) -> bool {
        self.active
            .lock()
            .await
            .as_ref()
            .is_some_and(ActiveStream::is_running)
    }

    /// Session the running stream records into, if any.
    pub async fn session_id(&self) -> Option<SessionId> {
        self.active
            .lock()
            .await
            .as_ref()
            .filter(|stream| stream.is_running())
            .map(|stream| stream.session_id)
    }

    /// Starts the processing stage for frames pushed with
    /// [`submit`](Self::submit). The selector is reset to the session's
    /// exercise.
    pub async fn start(&self, session_id: SessionId) -> Result<()> {
        self.launch(session_id, None).await
    }

    /// Starts the processing stage plus a capture loop that pulls from
    /// `source` at most once per `interval`. The stream finishes on its own
    /// once the source is exhausted and the queue drained.
    pub async fn start_with_source(
        &self,
        session_id: SessionId,
        source: Box<dyn FrameSource>,
        interval: Duration,
    ) -> Result<()> {
        self.launch(session_id, Some((source, interval))).await
    }

    /// Pushes one frame into the running stream. Returns `true` when an older
    /// undelivered frame was dropped to make room.
    pub async fn submit(&self, frame: LandmarkFrame) -> Result<bool> {
        let active = self.active.lock().await;
        match active.as_ref().filter(|stream| stream.is_running()) {
            Some(stream) => {
                let evicted = stream.queue.push(frame);
                if evicted {
                    tracing::warn!(session = stream.session_id, "stream queue full, dropped oldest frame");
                }
                Ok(evicted)
            }
            None => Err(WorkoutError::StreamNotRunning),
        }
    }

    /// Stops the stream and waits for its tasks. Stopping an idle coordinator
    /// succeeds without doing anything.
    pub async fn stop(&self) -> Result<()> {
        let Some(stream) = self.active.lock().await.take() else {
            return Ok(());
        };

        let _ = stream.shutdown.send(true);
        stream.queue.close();
        if let Some(producer) = stream.producer {
            producer
                .await
                .map_err(|err| WorkoutError::msg(format!("capture loop failed: {err}")))?;
        }
        stream
            .consumer
            .await
            .map_err(|err| WorkoutError::msg(format!("stream processing failed: {err}")))?;

        tracing::info!(
            session = stream.session_id,
            dropped = stream.queue.dropped(),
            "stream stopped"
        );
        Ok(())
    }

    async fn launch(
        &self,
        session_id: SessionId,
        source: Option<(Box<dyn FrameSource>, Duration)>,
    ) -> Result<()> {
        let mut active = self.active.lock().await;
        if active.as_ref().is_some_and(ActiveStream::is_running) {
            return Err(WorkoutError::AlreadyRunning);
        }
        // The session must exist, and the stream starts on its exercise.
        let session = self.pipeline.sessions().session(session_id).await?;
        self.selector
            .select(self.pipeline.classifier().registry(), &session.exercise_id)?;

        let queue = Arc::new(FrameQueue::new(self.queue_capacity));
        let (shutdown, shutdown_rx) = watch::channel(false);

        let consumer = tokio::spawn(run_processing(
            session_id,
            self.pipeline.clone(),
            self.selector.clone(),
            queue.clone(),
            self.events.clone(),
            shutdown_rx.clone(),
        ));
        let producer = source.map(|(source, interval)| {
            tokio::spawn(run_capture(source, interval, queue.clone(), shutdown_rx))
        });

        tracing::info!(session = session_id, pull = producer.is_some(), "stream started");
        *active = Some(ActiveStream {
            session_id,
            queue,
            shutdown,
            consumer,
            producer,
        });
        Ok(())
    }
}

/// Consumer loop. Each frame's classify/record pair runs outside the
/// `select!`, so shutdown is only observed between frames.
async fn run_processing(
    session_id: SessionId,
    pipeline: Arc<FramePipeline>,
    selector: ExerciseSelector,
    queue: Arc<FrameQueue>,
    events: broadcast::Sender<StreamEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }
        let frame = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            frame = queue.pop() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        let event = match selector.current() {
            Ok(policy) => match pipeline.process(session_id, &frame, &policy).await {
                Ok(event) => event,
                Err(err) => {
                    tracing::warn!(session = session_id, error = %err, "frame rejected");
                    StreamEvent::Rejected {
                        session_id,
                        message: err.to_string(),
                    }
                }
            },
            Err(err) => StreamEvent::Rejected {
                session_id,
                message: err.to_string(),
            },
        };
        tracing::trace!(session = session_id, ?event, "frame processed");
        let _ = events.send(event);
    }
}

/// Timer-driven producer loop.
async fn run_capture(
    mut source: Box<dyn FrameSource>,
    interval: Duration,
    queue: Arc<FrameQueue>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
        }
        let frame = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            frame = source.next_frame() => frame,
        };
        match frame {
            Some(frame) => {
                if queue.push(frame) {
                    tracing::debug!("capture outpaced processing, dropped oldest frame");
                }
            }
            None => {
                tracing::debug!("frame source exhausted");
                break;
            }
        }
    }
    queue.close();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        policy::{PUSHUPS, SQUATS},
        session::{Sample, SessionSummary},
        Landmark, LandmarkPoint, MemoryStore, PolicyRegistry, WorkoutStore, LANDMARK_COUNT,
    };

    fn arm_at(angle: f64) -> LandmarkFrame {
        let radians = angle.to_radians();
        let mut points = vec![LandmarkPoint::new(0.0, 0.0); LANDMARK_COUNT];
        points[Landmark::LeftShoulder.index()] = LandmarkPoint::new(1.0, 0.0);
        points[Landmark::LeftWrist.index()] = LandmarkPoint::new(radians.cos(), radians.sin());
        LandmarkFrame::new(points)
    }

    async fn fixture(exercise: &str) -> (Arc<SessionStore>, StreamCoordinator, SessionId) {
        let registry = PolicyRegistry::builtin();
        let sessions = Arc::new(SessionStore::new(
            registry.clone(),
            Arc::new(MemoryStore::new()),
        ));
        let pipeline = Arc::new(FramePipeline::new(
            FrameClassifier::new(registry.clone()),
            sessions.clone(),
        ));
        let selector = ExerciseSelector::for_exercise(&registry, exercise).unwrap();
        let coordinator = StreamCoordinator::new(pipeline, selector, 16);
        let id = sessions.create_session(exercise).await.unwrap();
        (sessions, coordinator, id)
    }

    async fn next_event(rx: &mut broadcast::Receiver<StreamEvent>) -> StreamEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for stream event")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn pipeline_reports_missing_pose_without_recording() {
        let (sessions, coordinator, id) = fixture(PUSHUPS).await;
        let policy = coordinator.selector().current().unwrap();

        let event = coordinator
            .pipeline
            .process(id, &LandmarkFrame::no_pose(), &policy)
            .await
            .unwrap();
        assert!(matches!(event, StreamEvent::NoDetection { session_id, .. } if session_id == id));
        assert_eq!(sessions.session(id).await.unwrap().total_count, 0);
    }

    #[tokio::test]
    async fn pushed_frames_are_classified_and_published() {
        let (sessions, coordinator, id) = fixture(PUSHUPS).await;
        let mut events = coordinator.subscribe();
        coordinator.start(id).await.unwrap();
        assert_eq!(coordinator.session_id().await, Some(id));

        coordinator.submit(arm_at(90.0)).await.unwrap();
        match next_event(&mut events).await {
            StreamEvent::Classified {
                is_correct,
                total_count,
                accuracy_pct,
                ..
            } => {
                assert!(is_correct);
                assert_eq!(total_count, 1);
                assert_eq!(accuracy_pct, 100.0);
            }
            other => panic!("unexpected event {other:?}"),
        }

        coordinator.submit(LandmarkFrame::no_pose()).await.unwrap();
        assert!(matches!(
            next_event(&mut events).await,
            StreamEvent::NoDetection { .. }
        ));

        coordinator.submit(arm_at(160.0)).await.unwrap();
        assert!(matches!(
            next_event(&mut events).await,
            StreamEvent::Classified { is_correct: false, .. }
        ));

        coordinator.stop().await.unwrap();
        let stats = sessions.session(id).await.unwrap();
        assert_eq!((stats.total_count, stats.correct_count), (2, 1));
    }

    #[tokio::test]
    async fn start_is_exclusive_and_stop_is_idempotent() {
        let (_, coordinator, id) = fixture(SQUATS).await;

        coordinator.stop().await.unwrap();
        assert!(matches!(
            coordinator.submit(LandmarkFrame::no_pose()).await,
            Err(WorkoutError::StreamNotRunning)
        ));

        coordinator.start(id).await.unwrap();
        assert!(matches!(
            coordinator.start(id).await,
            Err(WorkoutError::AlreadyRunning)
        ));

        coordinator.stop().await.unwrap();
        coordinator.stop().await.unwrap();
        assert!(!coordinator.is_running().await);

        coordinator.start(id).await.unwrap();
        coordinator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn unknown_session_cannot_start() {
        let (_, coordinator, id) = fixture(SQUATS).await;
        assert!(matches!(
            coordinator.start(id + 1).await,
            Err(WorkoutError::UnknownSession(_))
        ));
        assert!(!coordinator.is_running().await);
    }

    #[tokio::test]
    async fn capture_loop_drains_the_source() {
        let (sessions, coordinator, id) = fixture(PUSHUPS).await;
        let mut events = coordinator.subscribe();
        let source = VecSource::new([arm_at(85.0), arm_at(95.0), LandmarkFrame::no_pose(), arm_at(10.0)]);

        coordinator
            .start_with_source(id, Box::new(source), Duration::from_millis(1))
            .await
            .unwrap();

        let mut received = Vec::new();
        for _ in 0..4 {
            received.push(next_event(&mut events).await);
        }
        assert_eq!(
            received
                .iter()
                .filter(|event| matches!(event, StreamEvent::Classified { .. }))
                .count(),
            3
        );

        coordinator.stop().await.unwrap();
        let stats = sessions.session(id).await.unwrap();
        assert_eq!((stats.total_count, stats.correct_count), (3, 2));
    }

    #[tokio::test]
    async fn ended_session_rejects_frames_but_stream_survives() {
        let (sessions, coordinator, id) = fixture(PUSHUPS).await;
        let mut events = coordinator.subscribe();
        coordinator.start(id).await.unwrap();
        sessions.end_session(id).await.unwrap();

        coordinator.submit(arm_at(90.0)).await.unwrap();
        assert!(matches!(
            next_event(&mut events).await,
            StreamEvent::Rejected { .. }
        ));
        assert!(coordinator.is_running().await);

        coordinator.submit(LandmarkFrame::no_pose()).await.unwrap();
        assert!(matches!(
            next_event(&mut events).await,
            StreamEvent::NoDetection { .. }
        ));
        coordinator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn selecting_an_exercise_changes_classification() {
        let (_, coordinator, id) = fixture(PUSHUPS).await;
        let mut events = coordinator.subscribe();
        coordinator.start(id).await.unwrap();

        coordinator.select_exercise(crate::policy::PULLUPS).unwrap();
        assert!(matches!(
            next_event(&mut events).await,
            StreamEvent::ExerciseSelected { exercise_id } if exercise_id == "pullups"
        ));
        assert!(coordinator.select_exercise("burpees").is_err());

        coordinator.submit(arm_at(135.0)).await.unwrap();
        match next_event(&mut events).await {
            StreamEvent::Classified {
                exercise_id,
                is_correct,
                ..
            } => {
                assert_eq!(exercise_id, "pullups");
                assert!(is_correct);
            }
            other => panic!("unexpected event {other:?}"),
        }
        coordinator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn start_selects_the_session_exercise() {
        let (sessions, coordinator, _) = fixture(PUSHUPS).await;
        let squats = sessions.create_session(SQUATS).await.unwrap();

        coordinator.start(squats).await.unwrap();
        assert_eq!(coordinator.selector().current().unwrap().id, SQUATS);
        coordinator.stop().await.unwrap();
    }

    /// Memory backend whose sample appends take `delay` and announce
    /// themselves on `appending`.
    #[derive(Debug)]
    struct SlowStore {
        inner: MemoryStore,
        delay: Duration,
        appending: tokio::sync::Notify,
    }

    #[async_trait]
    impl WorkoutStore for SlowStore {
        async fn insert_session(
            &self,
            exercise_id: &str,
            started_at: chrono::DateTime<chrono::Utc>,
        ) -> Result<SessionId> {
            self.inner.insert_session(exercise_id, started_at).await
        }

        async fn load_session(&self, id: SessionId) -> Result<Option<SessionSummary>> {
            self.inner.load_session(id).await
        }

        async fn append_sample(&self, sample: &Sample, updated: &SessionSummary) -> Result<()> {
            self.appending.notify_one();
            tokio::time::sleep(self.delay).await;
            self.inner.append_sample(sample, updated).await
        }

        async fn finish_session(&self, summary: &SessionSummary) -> Result<()> {
            self.inner.finish_session(summary).await
        }

        async fn samples(&self, id: SessionId) -> Result<Vec<Sample>> {
            self.inner.samples(id).await
        }

        async fn recent_sessions(&self, limit: usize) -> Result<Vec<SessionSummary>> {
            self.inner.recent_sessions(limit).await
        }
    }

    #[tokio::test]
    async fn stop_waits_for_the_frame_in_flight_and_skips_the_rest() {
        let registry = PolicyRegistry::builtin();
        let backend = Arc::new(SlowStore {
            inner: MemoryStore::new(),
            delay: Duration::from_millis(200),
            appending: tokio::sync::Notify::new(),
        });
        let sessions = Arc::new(SessionStore::new(registry.clone(), backend.clone()));
        let pipeline = Arc::new(FramePipeline::new(
            FrameClassifier::new(registry.clone()),
            sessions.clone(),
        ));
        let selector = ExerciseSelector::for_exercise(&registry, PUSHUPS).unwrap();
        let coordinator = StreamCoordinator::new(pipeline, selector, 16);
        let id = sessions.create_session(PUSHUPS).await.unwrap();

        let mut events = coordinator.subscribe();
        coordinator.start(id).await.unwrap();
        coordinator.submit(arm_at(90.0)).await.unwrap();
        coordinator.submit(arm_at(95.0)).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), backend.appending.notified())
            .await
            .expect("first frame never reached the store");
        coordinator.stop().await.unwrap();
        assert!(!coordinator.is_running().await);

        let mut published = 0;
        while let Ok(event) = events.try_recv() {
            assert!(matches!(event, StreamEvent::Classified { total_count: 1, .. }));
            published += 1;
        }
        let stats = sessions.session(id).await.unwrap();
        assert_eq!(published, 1);
        assert_eq!((stats.total_count, stats.correct_count), (1, 1));
        assert_eq!(backend.samples(id).await.unwrap().len(), 1);
    }

    #[test]
    fn events_serialise_with_a_tag() {
        let event = StreamEvent::NoDetection {
            session_id: 3,
            exercise_id: "squats".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "no_detection");
        assert_eq!(json["session_id"], 3);
    }
}

mod replay;
mod server;

use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
};

use clap::{Parser, Subcommand};
use repcheck_core::{
    config::frame_interval, store, AppConfig, ExerciseSelector, FrameClassifier, FramePipeline,
    SessionStore, StreamCoordinator, StreamEvent,
};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

use crate::{replay::JsonLinesSource, server::AppState};

#[tokio::main]
async fn main() -> repcheck_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            config,
            bind,
            database,
            memory,
        } => {
            let mut config = load_config(config.as_deref())?;
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            apply_database_flags(&mut config, database, memory);
            run_serve(config).await
        }
        Commands::Replay {
            input,
            exercise,
            fps,
            config,
            database,
        } => {
            let mut config = load_config(config.as_deref())?;
            apply_database_flags(&mut config, database, false);
            run_replay(config, &input, &exercise, fps).await
        }
    }
}

async fn run_serve(config: AppConfig) -> repcheck_core::Result<()> {
    tracing::info!(bind = %config.server.bind, "starting workout server");

    let state = AppState::from_config(&config).await?;
    let listener = tokio::net::TcpListener::bind(config.server.bind).await?;
    server::serve(listener, state, shutdown_signal()).await
}

async fn run_replay(
    config: AppConfig,
    input: &Path,
    exercise: &str,
    fps: Option<u32>,
) -> repcheck_core::Result<()> {
    tracing::info!(?input, exercise, "replaying landmark recording");

    let registry = config.policy_registry()?;
    let backend = store::open(config.database.path.as_deref()).await?;
    let sessions = Arc::new(SessionStore::new(registry.clone(), backend));
    let classifier = FrameClassifier::new(registry.clone())
        .with_min_visibility(config.stream.min_visibility);
    let pipeline = Arc::new(FramePipeline::new(classifier, sessions.clone()));
    let selector = ExerciseSelector::for_exercise(&registry, exercise)?;
    let coordinator = StreamCoordinator::new(pipeline, selector, config.stream.queue_capacity);

    let session_id = sessions.create_session(exercise).await?;
    let mut events = coordinator.subscribe();
    let source = JsonLinesSource::open(input).await?;
    let interval = fps
        .map(frame_interval)
        .unwrap_or_else(|| config.stream.capture_interval());
    coordinator
        .start_with_source(session_id, Box::new(source), interval)
        .await?;

    // The stream ends by itself once the recording is exhausted.
    let mut no_detection = 0usize;
    loop {
        match tokio::time::timeout(interval * 4, events.recv()).await {
            Ok(Ok(StreamEvent::NoDetection { .. })) => no_detection += 1,
            Ok(Ok(event)) => tracing::debug!(?event, "replayed frame"),
            Ok(Err(RecvError::Lagged(missed))) => {
                tracing::warn!(missed, "replay events lagged")
            }
            Ok(Err(RecvError::Closed)) => break,
            Err(_) => {
                if !coordinator.is_running().await {
                    break;
                }
            }
        }
    }
    coordinator.stop().await?;

    let summary = sessions.end_session(session_id).await?;
    tracing::info!(session = session_id, no_detection, "replay finished");
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn load_config(path: Option<&Path>) -> repcheck_core::Result<AppConfig> {
    match path {
        Some(path) => {
            tracing::info!(?path, "loading configuration");
            AppConfig::load(path)
        }
        None => Ok(AppConfig::default()),
    }
}

fn apply_database_flags(config: &mut AppConfig, database: Option<PathBuf>, memory: bool) {
    if memory {
        config.database.path = None;
    } else if let Some(path) = database {
        config.database.path = Some(path);
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Exercise form tracking with per-session accuracy", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the HTTP and WebSocket server.
    Serve {
        /// JSON configuration file.
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Address to listen on, overriding the configuration.
        #[arg(short, long)]
        bind: Option<SocketAddr>,
        /// SQLite database file, overriding the configuration.
        #[arg(long, conflicts_with = "memory")]
        database: Option<PathBuf>,
        /// Keep workouts in memory only.
        #[arg(long)]
        memory: bool,
    },
    /// Score a recorded landmark stream as one workout session.
    Replay {
        /// JSON-lines file with one landmark array (or `null`) per frame.
        #[arg(short, long)]
        input: PathBuf,
        /// Exercise the recording shows.
        #[arg(short, long)]
        exercise: String,
        /// Playback rate, defaulting to the configured capture rate.
        #[arg(long)]
        fps: Option<u32>,
        /// JSON configuration file.
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// SQLite database file, overriding the configuration.
        #[arg(long)]
        database: Option<PathBuf>,
    },
}

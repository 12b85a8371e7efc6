mod routes;
mod stream;
mod summary;

use std::path::PathBuf;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use frame_watch_capture::source::CameraOpener;
use frame_watch_capture::{
    open_camera, FrameSource, MotionTrigger, RunningAverageDetector, SnapshotWriter,
};
use frame_watch_common::config::Config;
use frame_watch_common::SharedFrameBuffer;
use tokio::sync::{watch, Mutex};
use tracing::{error, info};

use crate::routes::AppState;
use crate::summary::VideoCompiler;

#[tokio::main]
async fn main() {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = match Config::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {e}", config_path.display());
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.parse().unwrap_or_default()),
        )
        .init();

    info!(
        camera = ?config.camera.kind,
        device = config.camera.device,
        images_dir = %config.snapshot.images_dir.display(),
        "starting frame-watch"
    );

    let buffer = Arc::new(SharedFrameBuffer::new());

    let writer = match SnapshotWriter::new(
        &config.snapshot.images_dir,
        config.snapshot.jpeg_quality,
        config.snapshot.queue_depth,
    ) {
        Ok(w) => w,
        Err(e) => {
            error!(error = %e, "failed to start snapshot writer");
            std::process::exit(1);
        }
    };
    let detector = Box::new(RunningAverageDetector::new(&config.motion));
    let trigger = MotionTrigger::new(detector, writer, &config.motion);

    let camera_config = config.camera.clone();
    let opener: CameraOpener = Box::new(move || open_camera(&camera_config));

    let source = FrameSource::new(opener, trigger, Arc::clone(&buffer), config.capture.clone());
    let capture = match source.spawn() {
        Ok(handle) => handle,
        Err(e) => {
            error!(error = %e, "failed to start capture thread");
            std::process::exit(1);
        }
    };

    let placeholder = match stream::placeholder_chunk(config.camera.width, config.camera.height) {
        Ok(chunk) => chunk,
        Err(e) => {
            error!(error = %e, "failed to render placeholder frame");
            std::process::exit(1);
        }
    };

    let (shutdown, _) = watch::channel(false);
    let state = Arc::new(AppState {
        buffer,
        capture: capture.status(),
        stream_quality: config.stream.jpeg_quality,
        placeholder,
        images_dir: config.snapshot.images_dir.clone(),
        videos_dir: config.summary.videos_dir.clone(),
        compiler: VideoCompiler::new(config.summary.ffmpeg.clone(), config.summary.fps),
        compile_lock: Mutex::new(()),
        viewers_total: AtomicU64::new(0),
        active_viewers: Arc::new(AtomicU64::new(0)),
        shutdown,
    });

    let app = routes::router(Arc::clone(&state), &config.server.static_dir);

    let addr = config.bind_addr();
    info!(addr, "frame-watch server starting");

    let listener = tokio::net::TcpListener::bind(&addr).await.unwrap_or_else(|e| {
        eprintln!("Failed to bind to {addr}: {e}");
        std::process::exit(1);
    });

    let signal_state = Arc::clone(&state);
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
            info!("shutdown requested, closing viewer streams");
            signal_state.shutdown.send_replace(true);
        })
        .await;
    if let Err(e) = served {
        error!(error = %e, "server error");
    }

    // Joining waits out the current poll slice, keep it off the runtime threads.
    if tokio::task::spawn_blocking(move || capture.stop()).await.is_err() {
        error!("capture shutdown task failed");
    }
    info!("frame-watch stopped");
}

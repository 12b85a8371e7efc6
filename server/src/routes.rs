use std::convert::Infallible;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use bytes::Bytes;
use chrono::Local;
use frame_watch_capture::CaptureStatus;
use frame_watch_common::SharedFrameBuffer;
use futures_util::Stream;
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::stream::{StreamEncoder, MJPEG_CONTENT_TYPE};
use crate::summary::{day_stamp, list_files, snapshots_for_day, video_path, VideoCompiler};

// ---------------------------------------------------------------------------
// App state
// ---------------------------------------------------------------------------

pub struct AppState {
    pub buffer: Arc<SharedFrameBuffer>,
    pub capture: Arc<CaptureStatus>,
    pub stream_quality: u8,
    pub placeholder: Bytes,
    pub images_dir: PathBuf,
    pub videos_dir: PathBuf,
    pub compiler: VideoCompiler,
    pub compile_lock: Mutex<()>,
    pub viewers_total: AtomicU64,
    pub active_viewers: Arc<AtomicU64>,
    pub shutdown: watch::Sender<bool>,
}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct Health {
    capture: &'static str,
    frames: u64,
    restarts: u64,
    stale: bool,
    frame_version: u64,
    viewers: u64,
}

#[derive(Debug, Serialize)]
struct Summary {
    video: String,
    frames: usize,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// GET /video_feed: endless multipart JPEG stream of the live frame.
async fn video_feed(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let id = state.viewers_total.fetch_add(1, Ordering::Relaxed) + 1;
    let encoder = StreamEncoder::new(
        Arc::clone(&state.buffer),
        state.stream_quality,
        state.placeholder.clone(),
        id,
        Arc::clone(&state.active_viewers),
    );
    let body = Body::from_stream(encoder.into_stream(state.shutdown.subscribe()));
    (
        [
            (header::CONTENT_TYPE, MJPEG_CONTENT_TYPE),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        body,
    )
}

/// GET /make_summary: compile today's snapshots into one video.
async fn make_summary(State(state): State<Arc<AppState>>) -> Response {
    let Ok(_running) = state.compile_lock.try_lock() else {
        return (StatusCode::CONFLICT, "summary compile already running").into_response();
    };

    let day = day_stamp(&Local::now());
    let images_dir = state.images_dir.clone();
    let listed_day = day.clone();
    let images =
        match tokio::task::spawn_blocking(move || snapshots_for_day(&images_dir, &listed_day))
            .await
        {
            Ok(Ok(images)) => images,
            Ok(Err(e)) => {
                error!(error = %e, "failed to list snapshots");
                return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
            }
            Err(e) => {
                error!(error = %e, "spawn_blocking failed");
                return StatusCode::INTERNAL_SERVER_ERROR.into_response();
            }
        };

    if images.is_empty() {
        return (StatusCode::NOT_FOUND, format!("no snapshots for {day}")).into_response();
    }

    let output = video_path(&state.videos_dir, &day);
    info!(day, frames = images.len(), "compiling video summary");
    match state.compiler.make_video(&images, &output).await {
        Ok(video) => Json(Summary {
            video: static_path(&state.videos_dir, &video.path),
            frames: video.frame_count,
        })
        .into_response(),
        Err(e) => {
            error!(error = %e, day, "video summary failed");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

/// GET /progress: synthetic 0..=100 counter as server-sent events.
async fn progress() -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let events = futures_util::stream::unfold(0u32, |x| async move {
        if x > 100 {
            return None;
        }
        if x > 0 {
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        Some((Ok(Event::default().data(x.to_string())), x + 10))
    });
    Sse::new(events)
}

/// GET /snapshots
async fn snapshots(State(state): State<Arc<AppState>>) -> Response {
    listing(state.images_dir.clone(), "jpg").await
}

/// GET /videos
async fn videos(State(state): State<Arc<AppState>>) -> Response {
    listing(state.videos_dir.clone(), "mp4").await
}

/// GET /health
async fn health(State(state): State<Arc<AppState>>) -> Json<Health> {
    Json(Health {
        capture: state.capture.state().as_str(),
        frames: state.capture.frames(),
        restarts: state.capture.restarts(),
        stale: state.buffer.is_stale(),
        frame_version: state.buffer.version(),
        viewers: state.active_viewers.load(Ordering::Relaxed),
    })
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Sorted `dirname/file` entries, relative to the static root.
async fn listing(dir: PathBuf, ext: &'static str) -> Response {
    let result = tokio::task::spawn_blocking(move || {
        list_files(&dir, ext).map(|names| {
            names
                .into_iter()
                .map(|name| static_path(&dir, &dir.join(name)))
                .collect::<Vec<_>>()
        })
    })
    .await;

    match result {
        Ok(Ok(entries)) => Json(entries).into_response(),
        Ok(Err(e)) => {
            error!(error = %e, "directory listing failed");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
        Err(e) => {
            error!(error = %e, "spawn_blocking failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

fn static_path(dir: &Path, file: &Path) -> String {
    let dir_name = dir.file_name().and_then(|n| n.to_str()).unwrap_or_default();
    let file_name = file.file_name().and_then(|n| n.to_str()).unwrap_or_default();
    if dir_name.is_empty() {
        file_name.to_string()
    } else {
        format!("{dir_name}/{file_name}")
    }
}

pub fn router(state: Arc<AppState>, static_dir: &Path) -> Router {
    Router::new()
        .route("/video_feed", get(video_feed))
        .route("/make_summary", get(make_summary))
        .route("/progress", get(progress))
        .route("/snapshots", get(snapshots))
        .route("/videos", get(videos))
        .route("/health", get(health))
        .nest_service("/static", ServeDir::new(static_dir))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

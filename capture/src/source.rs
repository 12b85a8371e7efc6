use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use frame_watch_common::config::CaptureConfig;
use frame_watch_common::{Frame, SharedFrameBuffer};
use image::RgbImage;
use tracing::{debug, error, info, warn};

use crate::camera::{Camera, CameraError};
use crate::motion::MotionTrigger;

/// Opens a fresh camera. Called once at startup and again after every failure.
pub type CameraOpener = Box<dyn FnMut() -> Result<Box<dyn Camera>, CameraError> + Send>;

/// Granularity of interruptible sleeps, so `stop()` is honored promptly.
const STOP_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CaptureState {
    Starting = 0,
    Running = 1,
    /// The camera failed; the supervisor is waiting to reopen it.
    Unavailable = 2,
    Stopped = 3,
}

impl CaptureState {
    pub fn as_str(self) -> &'static str {
        match self {
            CaptureState::Starting => "starting",
            CaptureState::Running => "running",
            CaptureState::Unavailable => "unavailable",
            CaptureState::Stopped => "stopped",
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => CaptureState::Starting,
            1 => CaptureState::Running,
            2 => CaptureState::Unavailable,
            _ => CaptureState::Stopped,
        }
    }
}

/// Lock-free view of the capture thread's health, shared with the web side.
#[derive(Debug)]
pub struct CaptureStatus {
    state: AtomicU8,
    frames: AtomicU64,
    restarts: AtomicU64,
}

impl Default for CaptureStatus {
    fn default() -> Self {
        Self {
            state: AtomicU8::new(CaptureState::Starting as u8),
            frames: AtomicU64::new(0),
            restarts: AtomicU64::new(0),
        }
    }
}

impl CaptureStatus {
    pub fn state(&self) -> CaptureState {
        CaptureState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Frames published since the process started.
    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    /// Times the camera has been reopened after a failure.
    pub fn restarts(&self) -> u64 {
        self.restarts.load(Ordering::Relaxed)
    }

    fn set_state(&self, state: CaptureState) -> CaptureState {
        CaptureState::from_u8(self.state.swap(state as u8, Ordering::AcqRel))
    }
}

/// Exponential backoff between `initial` and `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            current: initial,
        }
    }

    /// Delay to use now; doubles the next one.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// Owns a camera on a helper thread and performs one read per request, so
/// the capture loop can give up on a read that never returns.
struct CameraWorker {
    name: String,
    requests: SyncSender<()>,
    replies: Receiver<Result<RgbImage, CameraError>>,
}

impl CameraWorker {
    fn spawn(mut camera: Box<dyn Camera>) -> Result<Self, CameraError> {
        let name = camera.name().to_string();
        let (requests, request_rx) = mpsc::sync_channel::<()>(1);
        let (reply_tx, replies) = mpsc::sync_channel(1);
        std::thread::Builder::new()
            .name("camera-read".into())
            .spawn(move || {
                for () in request_rx {
                    if reply_tx.send(camera.read()).is_err() {
                        break;
                    }
                }
            })
            .map_err(CameraError::Io)?;
        Ok(Self {
            name,
            requests,
            replies,
        })
    }
}

/// Why a camera session ended.
enum SessionEnd {
    Stopped,
    Failed { error: CameraError, produced: bool },
}

/// The capture loop: pulls frames from the camera, runs the motion trigger on
/// each, and publishes them to the shared buffer. Owns the camera exclusively
/// and runs on its own thread.
pub struct FrameSource {
    opener: CameraOpener,
    trigger: MotionTrigger,
    buffer: Arc<SharedFrameBuffer>,
    policy: CaptureConfig,
    status: Arc<CaptureStatus>,
    stop: Arc<AtomicBool>,
    seq: u64,
}

impl FrameSource {
    pub fn new(
        opener: CameraOpener,
        trigger: MotionTrigger,
        buffer: Arc<SharedFrameBuffer>,
        policy: CaptureConfig,
    ) -> Self {
        Self {
            opener,
            trigger,
            buffer,
            policy,
            status: Arc::new(CaptureStatus::default()),
            stop: Arc::new(AtomicBool::new(false)),
            seq: 0,
        }
    }

    /// Start the capture thread.
    pub fn spawn(self) -> std::io::Result<CaptureHandle> {
        let stop = Arc::clone(&self.stop);
        let status = Arc::clone(&self.status);
        let thread = std::thread::Builder::new()
            .name("capture".into())
            .spawn(move || self.run())?;
        Ok(CaptureHandle {
            stop,
            status,
            thread: Some(thread),
        })
    }

    fn run(mut self) {
        let mut restart = Backoff::new(self.policy.restart_initial(), self.policy.restart_max());

        while !self.stopped() {
            self.status.set_state(CaptureState::Starting);
            match (self.opener)().and_then(CameraWorker::spawn) {
                Ok(worker) => {
                    info!(camera = worker.name, "camera opened");
                    match self.pump(&worker) {
                        SessionEnd::Stopped => break,
                        SessionEnd::Failed { error, produced } => {
                            error!(camera = worker.name, error = %error, "camera failed");
                            if produced {
                                restart.reset();
                            }
                        }
                    }
                }
                Err(e) => {
                    error!(error = %e, "failed to open camera");
                }
            }

            self.buffer.mark_stale();
            self.status.restarts.fetch_add(1, Ordering::Relaxed);
            self.status.set_state(CaptureState::Unavailable);

            let delay = restart.next_delay();
            warn!(delay = ?delay, "capture unavailable, reopening camera after delay");
            if !self.sleep_unless_stopped(delay) {
                break;
            }
        }

        self.status.set_state(CaptureState::Stopped);
        info!(frames = self.status.frames(), "capture loop stopped");
    }

    /// Read until the camera fails hard, transient failures pile up past the
    /// limit, or a stop is requested.
    fn pump(&mut self, camera: &CameraWorker) -> SessionEnd {
        let mut retry = Backoff::new(self.policy.retry_initial(), self.policy.retry_max());
        let mut failures: u32 = 0;
        let mut produced = false;

        while !self.stopped() {
            let Some(read) = self.read_frame(camera) else {
                return SessionEnd::Stopped;
            };
            match read {
                Ok(image) => {
                    failures = 0;
                    retry.reset();
                    if self.status.set_state(CaptureState::Running) != CaptureState::Running {
                        info!(
                            camera = camera.name,
                            width = image.width(),
                            height = image.height(),
                            "capture running"
                        );
                    }
                    produced = true;
                    self.seq += 1;
                    self.process(Frame::new(image, self.seq));
                }
                Err(error) if error.is_transient() => {
                    failures += 1;
                    if failures >= self.policy.max_consecutive_failures {
                        warn!(failures, "too many consecutive read failures");
                        return SessionEnd::Failed { error, produced };
                    }
                    let delay = retry.next_delay();
                    debug!(
                        failures,
                        error = %error,
                        delay = ?delay,
                        "transient read failure, retrying"
                    );
                    if !self.sleep_unless_stopped(delay) {
                        return SessionEnd::Stopped;
                    }
                }
                Err(error) => return SessionEnd::Failed { error, produced },
            }
        }
        SessionEnd::Stopped
    }

    /// One read through the worker, bounded by the stall timeout. `None` means
    /// a stop was requested while waiting.
    fn read_frame(&self, camera: &CameraWorker) -> Option<Result<RgbImage, CameraError>> {
        if camera.requests.send(()).is_err() {
            return Some(Err(reader_gone()));
        }
        let stall = self.policy.stall_timeout();
        let deadline = Instant::now() + stall;
        loop {
            if self.stopped() {
                return None;
            }
            let now = Instant::now();
            if now >= deadline {
                warn!(
                    camera = camera.name,
                    timeout = ?stall,
                    "camera read stalled, abandoning it"
                );
                return Some(Err(CameraError::Timeout(stall)));
            }
            match camera.replies.recv_timeout((deadline - now).min(STOP_POLL)) {
                Ok(read) => return Some(read),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return Some(Err(reader_gone())),
            }
        }
    }

    fn process(&mut self, mut frame: Frame) {
        let started = Instant::now();
        let evaluation = self.trigger.evaluate(&mut frame, started);
        let seq = frame.seq;
        self.buffer.set(Arc::new(frame));
        self.status.frames.fetch_add(1, Ordering::Relaxed);
        debug!(
            seq,
            total_area = evaluation.event.total_area,
            elapsed_us = started.elapsed().as_micros() as u64,
            "frame published"
        );
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Sleep for `total`, waking early on stop. Returns false if stopped.
    fn sleep_unless_stopped(&self, total: Duration) -> bool {
        let deadline = Instant::now() + total;
        loop {
            if self.stopped() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep((deadline - now).min(STOP_POLL));
        }
    }
}

fn reader_gone() -> CameraError {
    CameraError::Io(std::io::Error::other("camera reader thread exited"))
}

/// Handle to the running capture thread.
pub struct CaptureHandle {
    stop: Arc<AtomicBool>,
    status: Arc<CaptureStatus>,
    thread: Option<JoinHandle<()>>,
}

impl CaptureHandle {
    pub fn status(&self) -> Arc<CaptureStatus> {
        Arc::clone(&self.status)
    }

    /// Ask the capture thread to stop and wait for it. A camera read still in
    /// flight is abandoned to its helper thread.
    pub fn stop(mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("capture thread panicked");
            }
        }
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
    }
}

//! Capture side of the pipeline: camera strategies, per-frame motion policy,
//! snapshot persistence, and the supervised capture thread that feeds the
//! shared frame buffer.

pub mod camera;
pub mod motion;
pub mod snapshot;
pub mod source;

pub use camera::{open_camera, Camera, CameraError};
pub use motion::{MotionDetector, MotionTrigger, RunningAverageDetector};
pub use snapshot::{SnapshotRecord, SnapshotWriter};
pub use source::{CaptureHandle, CaptureState, CaptureStatus, FrameSource};

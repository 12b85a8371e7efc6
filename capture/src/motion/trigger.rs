use std::time::{Duration, Instant};

use frame_watch_common::config::MotionConfig;
use frame_watch_common::overlay::{draw_rect, RED};
use frame_watch_common::Frame;
use tracing::{debug, info, warn};

use super::{MotionDetector, MotionEvent};
use crate::snapshot::{SnapshotRecord, SnapshotWriter};

/// Minimum wall-clock spacing between two triggered side effects.
#[derive(Debug, Clone)]
pub struct Cooldown {
    interval: Duration,
    last: Option<Instant>,
}

impl Cooldown {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    /// True if nothing has fired yet or at least `interval` has passed.
    pub fn ready(&self, now: Instant) -> bool {
        match self.last {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.interval,
        }
    }

    pub fn mark(&mut self, now: Instant) {
        self.last = Some(now);
    }
}

/// Result of evaluating one frame.
#[derive(Debug)]
pub struct Evaluation {
    pub event: MotionEvent,
    pub snapshot: Option<SnapshotRecord>,
}

/// Per-frame snapshot policy: feed the detector, outline what moved, and save
/// a snapshot when enough area changed and the cool-down has elapsed.
pub struct MotionTrigger {
    detector: Box<dyn MotionDetector>,
    writer: SnapshotWriter,
    cooldown: Cooldown,
    min_area: u64,
    blur_sigma: f32,
}

impl MotionTrigger {
    pub fn new(
        detector: Box<dyn MotionDetector>,
        writer: SnapshotWriter,
        config: &MotionConfig,
    ) -> Self {
        info!(
            detector = detector.name(),
            min_area = config.min_area,
            cooldown_secs = config.cooldown_secs,
            images_dir = %writer.images_dir().display(),
            "motion trigger ready"
        );
        Self {
            detector,
            writer,
            cooldown: Cooldown::new(config.cooldown()),
            min_area: config.min_area,
            blur_sigma: config.blur_sigma,
        }
    }

    /// Evaluate `frame` at time `now`. Boxes are drawn onto the frame whether
    /// or not a snapshot is taken.
    pub fn evaluate(&mut self, frame: &mut Frame, now: Instant) -> Evaluation {
        let mut gray = frame.grayscale();
        if self.blur_sigma > 0.0 {
            gray = image::imageops::blur(&gray, self.blur_sigma);
        }

        self.detector.update(&gray);
        let detection = self.detector.detect(&gray);
        let event = MotionEvent::from_boxes(detection.boxes);

        for b in event.boxes.iter().filter(|b| b.area() > 0) {
            draw_rect(&mut frame.image, b.x0, b.y0, b.x1 - 1, b.y1 - 1, RED);
        }

        let mut snapshot = None;
        if event.total_area > self.min_area {
            if self.cooldown.ready(now) {
                match self.writer.save(frame) {
                    Ok(record) => {
                        self.cooldown.mark(now);
                        info!(
                            path = %record.path.display(),
                            total_area = event.total_area,
                            boxes = event.boxes.len(),
                            "motion snapshot saved"
                        );
                        snapshot = Some(record);
                    }
                    Err(e) => {
                        warn!(error = %e, seq = frame.seq, "failed to queue snapshot");
                    }
                }
            } else {
                debug!(
                    total_area = event.total_area,
                    seq = frame.seq,
                    "motion within cool-down, not saving"
                );
            }
        }

        Evaluation { event, snapshot }
    }
}

pub mod background;
pub mod trigger;

use image::GrayImage;

pub use background::RunningAverageDetector;
pub use trigger::{Cooldown, Evaluation, MotionTrigger};

/// Motion-detection capability consumed by the trigger.
///
/// Implementations keep an adaptive model of the static scene. The trigger
/// calls `update` and then `detect` with the same preprocessed grayscale frame.
pub trait MotionDetector: Send {
    /// Fold the frame into the background model.
    fn update(&mut self, gray: &GrayImage);

    /// Difference mask and changed regions for the frame. `boxes` may be empty.
    fn detect(&mut self, gray: &GrayImage) -> Detection;

    /// Human-readable name for logging.
    fn name(&self) -> &str {
        "unnamed"
    }
}

#[derive(Debug, Clone)]
pub struct Detection {
    pub mask: GrayImage,
    pub boxes: Vec<BoundingBox>,
}

impl Detection {
    pub fn empty(width: u32, height: u32) -> Self {
        Self {
            mask: GrayImage::new(width, height),
            boxes: Vec::new(),
        }
    }
}

/// Axis-aligned box in pixel coordinates, `(x0, y0)` inclusive to `(x1, y1)`
/// exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundingBox {
    pub x0: u32,
    pub y0: u32,
    pub x1: u32,
    pub y1: u32,
}

impl BoundingBox {
    pub fn new(x0: u32, y0: u32, x1: u32, y1: u32) -> Self {
        Self { x0, y0, x1, y1 }
    }

    pub fn area(&self) -> u64 {
        u64::from(self.x1.saturating_sub(self.x0)) * u64::from(self.y1.saturating_sub(self.y0))
    }
}

/// Motion found in one frame. Computed, acted on, and discarded.
#[derive(Debug, Clone, Default)]
pub struct MotionEvent {
    pub boxes: Vec<BoundingBox>,
    pub total_area: u64,
}

impl MotionEvent {
    pub fn from_boxes(boxes: Vec<BoundingBox>) -> Self {
        let total_area = boxes.iter().map(BoundingBox::area).sum();
        Self { boxes, total_area }
    }
}

use frame_watch_common::config::MotionConfig;
use image::{GrayImage, Luma};
use tracing::debug;

use super::{BoundingBox, Detection, MotionDetector};

/// Running-average background subtraction.
///
/// The background is an exponentially weighted mean of past frames. Pixels
/// that differ from it by more than `delta_threshold` form the mask; the mask
/// is bucketed into `cell_size` squares and 4-connected busy cells are merged
/// into one box each.
pub struct RunningAverageDetector {
    background: Option<Background>,
    accum_weight: f32,
    delta_threshold: u8,
    cell_size: u32,
    min_cell_pixels: u32,
}

struct Background {
    width: u32,
    height: u32,
    mean: Vec<f32>,
}

impl RunningAverageDetector {
    pub fn new(config: &MotionConfig) -> Self {
        Self {
            background: None,
            accum_weight: config.accum_weight.clamp(0.0, 1.0),
            delta_threshold: config.delta_threshold,
            cell_size: config.cell_size.max(1),
            min_cell_pixels: config.min_cell_pixels.max(1),
        }
    }

    fn mask(&self, gray: &GrayImage, bg: &Background) -> GrayImage {
        let threshold = f32::from(self.delta_threshold);
        let mut mask = GrayImage::new(gray.width(), gray.height());
        for (i, (px, out)) in gray.pixels().zip(mask.pixels_mut()).enumerate() {
            if (f32::from(px.0[0]) - bg.mean[i]).abs() > threshold {
                *out = Luma([255]);
            }
        }
        mask
    }

    fn boxes(&self, mask: &GrayImage) -> Vec<BoundingBox> {
        let (w, h) = mask.dimensions();
        let cell = self.cell_size;
        let grid_w = w.div_ceil(cell) as usize;
        let grid_h = h.div_ceil(cell) as usize;

        let mut counts = vec![0u32; grid_w * grid_h];
        for (x, y, px) in mask.enumerate_pixels() {
            if px.0[0] != 0 {
                counts[(y / cell) as usize * grid_w + (x / cell) as usize] += 1;
            }
        }
        let mut busy: Vec<bool> = counts.iter().map(|&c| c >= self.min_cell_pixels).collect();

        let mut boxes = Vec::new();
        let mut stack = Vec::new();
        for start in 0..busy.len() {
            if !busy[start] {
                continue;
            }
            busy[start] = false;
            stack.push(start);
            let (mut min_x, mut min_y) = (usize::MAX, usize::MAX);
            let (mut max_x, mut max_y) = (0usize, 0usize);

            while let Some(idx) = stack.pop() {
                let (cx, cy) = (idx % grid_w, idx / grid_w);
                min_x = min_x.min(cx);
                min_y = min_y.min(cy);
                max_x = max_x.max(cx);
                max_y = max_y.max(cy);

                let mut visit = |n: usize| {
                    if busy[n] {
                        busy[n] = false;
                        stack.push(n);
                    }
                };
                if cx > 0 {
                    visit(idx - 1);
                }
                if cx + 1 < grid_w {
                    visit(idx + 1);
                }
                if cy > 0 {
                    visit(idx - grid_w);
                }
                if cy + 1 < grid_h {
                    visit(idx + grid_w);
                }
            }

            boxes.push(BoundingBox::new(
                min_x as u32 * cell,
                min_y as u32 * cell,
                ((max_x as u32 + 1) * cell).min(w),
                ((max_y as u32 + 1) * cell).min(h),
            ));
        }
        boxes
    }
}

impl MotionDetector for RunningAverageDetector {
    fn update(&mut self, gray: &GrayImage) {
        let (width, height) = gray.dimensions();
        match &mut self.background {
            Some(bg) if bg.width == width && bg.height == height => {
                let w = self.accum_weight;
                for (mean, px) in bg.mean.iter_mut().zip(gray.pixels()) {
                    *mean = w * f32::from(px.0[0]) + (1.0 - w) * *mean;
                }
            }
            _ => {
                debug!(width, height, "seeding background model");
                self.background = Some(Background {
                    width,
                    height,
                    mean: gray.pixels().map(|p| f32::from(p.0[0])).collect(),
                });
            }
        }
    }

    fn detect(&mut self, gray: &GrayImage) -> Detection {
        let (width, height) = gray.dimensions();
        let Some(bg) = self
            .background
            .as_ref()
            .filter(|bg| bg.width == width && bg.height == height)
        else {
            return Detection::empty(width, height);
        };

        let mask = self.mask(gray, bg);
        let boxes = self.boxes(&mask);
        Detection { mask, boxes }
    }

    fn name(&self) -> &str {
        "running-average"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector() -> RunningAverageDetector {
        RunningAverageDetector::new(&MotionConfig::default())
    }

    fn flat(value: u8) -> GrayImage {
        GrayImage::from_pixel(64, 64, Luma([value]))
    }

    #[test]
    fn no_background_means_no_boxes() {
        let mut d = detector();
        let detection = d.detect(&flat(10));
        assert!(detection.boxes.is_empty());
    }

    #[test]
    fn static_scene_has_no_motion() {
        let mut d = detector();
        for _ in 0..5 {
            d.update(&flat(50));
        }
        d.update(&flat(50));
        let detection = d.detect(&flat(50));
        assert!(detection.boxes.is_empty());
        assert!(detection.mask.pixels().all(|p| p.0[0] == 0));
    }

    #[test]
    fn bright_block_yields_one_cell_aligned_box() {
        let mut d = detector();
        for _ in 0..5 {
            d.update(&flat(50));
        }

        let mut frame = flat(50);
        for y in 16..32 {
            for x in 16..32 {
                frame.put_pixel(x, y, Luma([200]));
            }
        }
        d.update(&frame);
        let detection = d.detect(&frame);
        assert_eq!(detection.boxes, vec![BoundingBox::new(16, 16, 32, 32)]);
        assert_eq!(detection.mask.get_pixel(20, 20).0[0], 255);
        assert_eq!(detection.mask.get_pixel(5, 5).0[0], 0);
    }

    #[test]
    fn separate_regions_give_separate_boxes() {
        let mut d = detector();
        d.update(&flat(0));
        let mut frame = flat(0);
        for y in 0..8 {
            for x in 0..8 {
                frame.put_pixel(x, y, Luma([255]));
                frame.put_pixel(x + 48, y + 48, Luma([255]));
            }
        }
        let detection = d.detect(&frame);
        assert_eq!(
            detection.boxes,
            vec![BoundingBox::new(0, 0, 8, 8), BoundingBox::new(48, 48, 56, 56)]
        );
    }

    #[test]
    fn resolution_change_reseeds_model() {
        let mut d = detector();
        d.update(&flat(0));
        let other = GrayImage::from_pixel(32, 16, Luma([255]));
        assert!(d.detect(&other).boxes.is_empty());
        d.update(&other);
        assert!(d.detect(&other).boxes.is_empty());
    }
}

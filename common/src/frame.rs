use image::codecs::jpeg::JpegEncoder;
use image::{GrayImage, RgbImage};

/// A decoded camera frame with capture metadata.
///
/// Pixels are 8-bit RGB, row-major (height × width × 3). A frame is owned by
/// the capture thread until it is published to the shared buffer; after that it
/// is only ever read through an `Arc<Frame>`.
#[derive(Debug, Clone)]
pub struct Frame {
    pub image: RgbImage,
    /// Wall-clock capture time, Unix millis.
    pub captured_at_ms: i64,
    /// Monotonic sequence number assigned by the capture loop.
    pub seq: u64,
}

impl Frame {
    /// Wrap a freshly captured image, stamping it with the current time.
    pub fn new(image: RgbImage, seq: u64) -> Self {
        Self::with_timestamp(image, chrono::Utc::now().timestamp_millis(), seq)
    }

    pub fn with_timestamp(image: RgbImage, captured_at_ms: i64, seq: u64) -> Self {
        Self {
            image,
            captured_at_ms,
            seq,
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Luma view of the frame, used as motion-detector input.
    pub fn grayscale(&self) -> GrayImage {
        image::imageops::grayscale(&self.image)
    }

    /// Encode the frame as a baseline JPEG.
    pub fn to_jpeg(&self, quality: u8) -> Result<Vec<u8>, FrameError> {
        encode_jpeg(&self.image, quality)
    }
}

/// Encode an RGB image as JPEG. Quality is clamped to 1..=100.
pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>, FrameError> {
    if image.width() == 0 || image.height() == 0 {
        return Err(FrameError::Empty);
    }
    let mut buf = Vec::with_capacity((image.width() * image.height()) as usize / 4);
    JpegEncoder::new_with_quality(&mut buf, quality.clamp(1, 100))
        .encode_image(image)
        .map_err(FrameError::Encode)?;
    Ok(buf)
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame has zero width or height")]
    Empty,
    #[error("JPEG encode failed: {0}")]
    Encode(image::ImageError),
}

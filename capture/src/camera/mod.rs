pub mod csi;
pub mod mjpeg;
pub mod usb;

use frame_watch_common::config::{CameraConfig, CameraKind};
use image::{ImageFormat, RgbImage};

pub use csi::CsiCamera;
pub use usb::UsbCamera;

/// A source of raw frames. Implementations own the device handle and are
/// driven from the single capture thread.
pub trait Camera: Send {
    /// Block until the next frame is available.
    fn read(&mut self) -> Result<RgbImage, CameraError>;

    /// Human-readable name for logging.
    fn name(&self) -> &str {
        "unnamed"
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CameraError {
    #[error("failed to start `{command}`: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },
    #[error("camera read failed: {0}")]
    Io(std::io::Error),
    #[error("camera stream ended")]
    EndOfStream,
    #[error("no frame from camera within {0:?}")]
    Timeout(std::time::Duration),
    #[error("corrupt frame: {0}")]
    Corrupt(String),
}

impl CameraError {
    /// Transient errors lose one frame; everything else loses the device.
    pub fn is_transient(&self) -> bool {
        matches!(self, CameraError::Corrupt(_))
    }
}

/// Open the camera strategy named in the config. Called once per (re)start.
pub fn open_camera(config: &CameraConfig) -> Result<Box<dyn Camera>, CameraError> {
    match config.kind {
        CameraKind::Usb => Ok(Box::new(UsbCamera::open(config)?)),
        CameraKind::Csi => Ok(Box::new(CsiCamera::open(config)?)),
    }
}

pub(crate) fn decode_jpeg(jpeg: &[u8]) -> Result<RgbImage, CameraError> {
    image::load_from_memory_with_format(jpeg, ImageFormat::Jpeg)
        .map(|img| img.to_rgb8())
        .map_err(|e| CameraError::Corrupt(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_corrupt_frames_are_transient() {
        assert!(CameraError::Corrupt("bad huffman".into()).is_transient());
        assert!(!CameraError::EndOfStream.is_transient());
        assert!(!CameraError::Timeout(std::time::Duration::from_secs(3)).is_transient());
        assert!(!CameraError::Io(std::io::Error::other("gone")).is_transient());
    }

    #[test]
    fn decode_rejects_garbage() {
        let err = decode_jpeg(&[0xFF, 0xD8, 0x00, 0xFF, 0xD9]).unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn decode_round_trips_encoded_frame() {
        let img = RgbImage::from_pixel(16, 8, image::Rgb([0, 128, 255]));
        let jpeg = frame_watch_common::frame::encode_jpeg(&img, 90).unwrap();
        let decoded = decode_jpeg(&jpeg).unwrap();
        assert_eq!(decoded.dimensions(), (16, 8));
    }
}

use std::time::{Duration, Instant};

use frame_watch_common::config::CameraConfig;
use image::RgbImage;
use tracing::{debug, info};

use super::mjpeg::MjpegPipe;
use super::{decode_jpeg, Camera, CameraError};

/// Ribbon-cable CSI sensor driven by `rpicam-vid`.
///
/// The sensor needs time for exposure and white balance to settle, so frames
/// produced during the warm-up window are read and thrown away.
pub struct CsiCamera {
    pipe: MjpegPipe,
    warm_until: Option<Instant>,
}

impl CsiCamera {
    pub fn open(config: &CameraConfig) -> Result<Self, CameraError> {
        let args = rpicam_args(config);
        info!(
            width = config.width,
            height = config.height,
            framerate = config.framerate,
            warmup_ms = config.warmup_ms,
            "opening CSI camera"
        );
        let pipe = MjpegPipe::spawn(&config.csi_command, &args, config.read_timeout())?;
        Ok(Self {
            pipe,
            warm_until: Some(Instant::now() + Duration::from_millis(config.warmup_ms)),
        })
    }
}

impl Camera for CsiCamera {
    fn read(&mut self) -> Result<RgbImage, CameraError> {
        loop {
            let jpeg = self.pipe.next_jpeg()?;
            if let Some(deadline) = self.warm_until {
                if Instant::now() < deadline {
                    debug!("discarding warm-up frame");
                    continue;
                }
                self.warm_until = None;
            }
            return decode_jpeg(&jpeg);
        }
    }

    fn name(&self) -> &str {
        "csi"
    }
}

fn rpicam_args(config: &CameraConfig) -> Vec<String> {
    vec![
        "-t".into(),
        "0".into(),
        "-n".into(),
        "--codec".into(),
        "mjpeg".into(),
        "--width".into(),
        config.width.to_string(),
        "--height".into(),
        config.height.to_string(),
        "--framerate".into(),
        config.framerate.to_string(),
        "-o".into(),
        "-".into(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rpicam_streams_mjpeg_to_stdout() {
        let config = CameraConfig {
            width: 640,
            height: 480,
            framerate: 10,
            ..CameraConfig::default()
        };
        let args = rpicam_args(&config).join(" ");
        assert!(args.contains("--codec mjpeg"));
        assert!(args.contains("--width 640 --height 480"));
        assert!(args.contains("--framerate 10"));
        assert!(args.ends_with("-o -"));
    }
}

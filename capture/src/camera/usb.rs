use frame_watch_common::config::CameraConfig;
use image::RgbImage;
use tracing::info;

use super::mjpeg::MjpegPipe;
use super::{decode_jpeg, Camera, CameraError};

/// Generic USB/V4L2 camera, read through `ffmpeg -f v4l2` re-muxed as MJPEG.
pub struct UsbCamera {
    pipe: MjpegPipe,
    name: String,
}

impl UsbCamera {
    pub fn open(config: &CameraConfig) -> Result<Self, CameraError> {
        let args = ffmpeg_args(config);
        info!(
            device = config.device,
            width = config.width,
            height = config.height,
            "opening USB camera"
        );
        let pipe = MjpegPipe::spawn(&config.usb_command, &args, config.read_timeout())?;
        Ok(Self {
            pipe,
            name: format!("usb:{}", config.device),
        })
    }
}

impl Camera for UsbCamera {
    fn read(&mut self) -> Result<RgbImage, CameraError> {
        let jpeg = self.pipe.next_jpeg()?;
        decode_jpeg(&jpeg)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

fn ffmpeg_args(config: &CameraConfig) -> Vec<String> {
    vec![
        "-hide_banner".into(),
        "-loglevel".into(),
        "error".into(),
        "-f".into(),
        "v4l2".into(),
        "-framerate".into(),
        config.framerate.to_string(),
        "-video_size".into(),
        format!("{}x{}", config.width, config.height),
        "-i".into(),
        config.device.clone(),
        "-f".into(),
        "mjpeg".into(),
        "-q:v".into(),
        "3".into(),
        "pipe:1".into(),
    ]
}

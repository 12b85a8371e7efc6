use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub camera: CameraConfig,
    pub capture: CaptureConfig,
    pub motion: MotionConfig,
    pub snapshot: SnapshotConfig,
    pub stream: StreamConfig,
    pub summary: SummaryConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Directory served under `/static`.
    pub static_dir: PathBuf,
}

/// Which physical camera strategy drives capture. Chosen once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraKind {
    /// Generic USB/V4L2 capture device.
    Usb,
    /// Ribbon-cable CSI sensor (Raspberry Pi camera module).
    Csi,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub kind: CameraKind,
    pub device: String,
    pub width: u32,
    pub height: u32,
    pub framerate: u32,
    pub warmup_ms: u64,
    pub usb_command: String,
    pub csi_command: String,
    /// Longest wait for one frame from the capture process. Unset means ten
    /// frame intervals plus two seconds.
    pub read_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Consecutive failed reads before the camera is declared unavailable.
    pub max_consecutive_failures: u32,
    pub retry_initial_ms: u64,
    pub retry_max_ms: u64,
    pub restart_initial_secs: u64,
    pub restart_max_secs: u64,
    /// A single camera read that takes longer than this ends the session.
    /// Must cover the CSI warm-up.
    pub stall_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MotionConfig {
    /// Summed box area (px²) that must be exceeded to trigger a snapshot.
    pub min_area: u64,
    pub cooldown_secs: f64,
    pub accum_weight: f32,
    pub delta_threshold: u8,
    pub blur_sigma: f32,
    pub cell_size: u32,
    pub min_cell_pixels: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    pub images_dir: PathBuf,
    pub jpeg_quality: u8,
    pub queue_depth: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub jpeg_quality: u8,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SummaryConfig {
    pub videos_dir: PathBuf,
    pub fps: u32,
    pub ffmpeg: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8887,
            static_dir: PathBuf::from("./static"),
        }
    }
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            kind: CameraKind::Usb,
            device: "/dev/video0".into(),
            width: 640,
            height: 480,
            framerate: 10,
            warmup_ms: 2000,
            usb_command: "ffmpeg".into(),
            csi_command: "rpicam-vid".into(),
            read_timeout_ms: None,
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            max_consecutive_failures: 50,
            retry_initial_ms: 10,
            retry_max_ms: 1000,
            restart_initial_secs: 2,
            restart_max_secs: 30,
            stall_timeout_ms: 10_000,
        }
    }
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            min_area: 500,
            cooldown_secs: 3.0,
            accum_weight: 0.5,
            delta_threshold: 5,
            blur_sigma: 1.5,
            cell_size: 8,
            min_cell_pixels: 4,
        }
    }
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            images_dir: PathBuf::from("./static/images"),
            jpeg_quality: 90,
            queue_depth: 8,
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self { jpeg_quality: 80 }
    }
}

impl Default for SummaryConfig {
    fn default() -> Self {
        Self {
            videos_dir: PathBuf::from("./static/video_summary"),
            fps: 2,
            ffmpeg: "ffmpeg".into(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFile(path.display().to_string(), e))?;
        let config = Self::parse(&content)?;
        tracing::debug!(path = %path.display(), "config loaded");
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// `host:port` string suitable for `TcpListener::bind`.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

impl CameraConfig {
    pub fn read_timeout(&self) -> Duration {
        match self.read_timeout_ms {
            Some(ms) => Duration::from_millis(ms),
            None => {
                let interval = Duration::from_secs(1) / self.framerate.max(1);
                interval * 10 + Duration::from_secs(2)
            }
        }
    }
}

impl MotionConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs_f64(self.cooldown_secs.max(0.0))
    }
}

impl CaptureConfig {
    pub fn retry_initial(&self) -> Duration {
        Duration::from_millis(self.retry_initial_ms)
    }

    pub fn retry_max(&self) -> Duration {
        Duration::from_millis(self.retry_max_ms)
    }

    pub fn restart_initial(&self) -> Duration {
        Duration::from_secs(self.restart_initial_secs)
    }

    pub fn restart_max(&self) -> Duration {
        Duration::from_secs(self.restart_max_secs)
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_millis(self.stall_timeout_ms.max(1))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    ReadFile(String, std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(String),
}

fn default_log_level() -> String {
    "info".into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.server.port, 8887);
        assert_eq!(config.camera.kind, CameraKind::Usb);
        assert_eq!(config.motion.min_area, 500);
        assert_eq!(config.motion.cooldown(), Duration::from_secs(3));
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.bind_addr(), "0.0.0.0:8887");
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = Config::parse(
            r#"
            [server]
            port = 9000

            [camera]
            kind = "csi"
            width = 1280
            "#,
        )
        .unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.camera.kind, CameraKind::Csi);
        assert_eq!(config.camera.width, 1280);
        assert_eq!(config.camera.height, 480);
    }

    #[test]
    fn read_timeout_follows_framerate_unless_set() {
        let mut camera = CameraConfig {
            framerate: 10,
            ..CameraConfig::default()
        };
        assert_eq!(camera.read_timeout(), Duration::from_secs(3));
        camera.framerate = 0;
        assert_eq!(camera.read_timeout(), Duration::from_secs(12));

        let config = Config::parse("[camera]\nread_timeout_ms = 750\n").unwrap();
        assert_eq!(config.camera.read_timeout(), Duration::from_millis(750));
        assert_eq!(config.capture.stall_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn unknown_camera_kind_is_rejected() {
        let err = Config::parse("[camera]\nkind = \"firewire\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn missing_file_reports_path() {
        let err = Config::load(Path::new("/nonexistent/frame-watch.toml")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/frame-watch.toml"));
    }
}

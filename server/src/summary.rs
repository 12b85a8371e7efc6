use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, error, info, warn};

/// Day stamp used in snapshot names and video file names: `MM_DD_YYYY`.
pub fn day_stamp(at: &DateTime<Local>) -> String {
    at.format("%m_%d_%Y").to_string()
}

/// `videos_dir/MM_DD_YYYY.mp4`
pub fn video_path(videos_dir: &Path, day: &str) -> PathBuf {
    videos_dir.join(format!("{day}.mp4"))
}

/// Sorted names of the files in `dir` ending in `.{ext}`. A missing directory
/// lists as empty.
pub fn list_files(dir: &Path, ext: &str) -> std::io::Result<Vec<String>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let mut names = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some(ext) {
            continue;
        }
        if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
            names.push(name.to_string());
        }
    }
    names.sort();
    Ok(names)
}

/// Snapshot files taken on `day`, in capture order.
pub fn snapshots_for_day(images_dir: &Path, day: &str) -> std::io::Result<Vec<PathBuf>> {
    Ok(list_files(images_dir, "jpg")?
        .into_iter()
        .filter(|name| name.starts_with(day))
        .map(|name| images_dir.join(name))
        .collect())
}

#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    #[error("no snapshots to compile")]
    NoImages,
    #[error("failed to create output directory: {0}")]
    CreateDir(std::io::Error),
    #[error("failed to spawn ffmpeg: {0}")]
    Spawn(String),
    #[error("failed to read snapshot {0}: {1}")]
    ReadInput(String, std::io::Error),
    #[error("failed to write frame to ffmpeg stdin: {0}")]
    Write(String),
    #[error("failed to wait for ffmpeg: {0}")]
    Wait(String),
    #[error("ffmpeg exited with non-zero status: {0}")]
    FfmpegFailed(String),
}

#[derive(Debug)]
pub struct CompiledVideo {
    pub path: PathBuf,
    pub frame_count: usize,
}

/// Builds one video from an ordered list of still images by piping them into
/// an `ffmpeg` subprocess.
#[derive(Debug, Clone)]
pub struct VideoCompiler {
    ffmpeg: String,
    fps: u32,
}

impl VideoCompiler {
    pub fn new(ffmpeg: impl Into<String>, fps: u32) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            fps: fps.max(1),
        }
    }

    fn args(&self, output: &Path) -> Vec<std::ffi::OsString> {
        let mut args: Vec<std::ffi::OsString> = [
            "-hide_banner",
            "-loglevel",
            "error",
            "-f",
            "image2pipe",
            "-vcodec",
            "mjpeg",
            "-r",
        ]
        .into_iter()
        .map(Into::into)
        .collect();
        args.push(self.fps.to_string().into());
        for arg in [
            "-i",
            "pipe:0",
            "-c:v",
            "libx264",
            "-pix_fmt",
            "yuv420p",
            "-movflags",
            "+faststart",
            "-y",
        ] {
            args.push(arg.into());
        }
        args.push(output.as_os_str().to_owned());
        args
    }

    pub async fn make_video(
        &self,
        images: &[PathBuf],
        output: &Path,
    ) -> Result<CompiledVideo, CompileError> {
        if images.is_empty() {
            return Err(CompileError::NoImages);
        }
        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(CompileError::CreateDir)?;
        }

        let mut child = Command::new(&self.ffmpeg)
            .args(self.args(output))
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| CompileError::Spawn(e.to_string()))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| CompileError::Spawn("could not get stdin handle".into()))?;

        debug!(
            frames = images.len(),
            fps = self.fps,
            output = %output.display(),
            "ffmpeg compile started"
        );

        for path in images {
            let jpeg = tokio::fs::read(path)
                .await
                .map_err(|e| CompileError::ReadInput(path.display().to_string(), e))?;
            stdin
                .write_all(&jpeg)
                .await
                .map_err(|e| CompileError::Write(e.to_string()))?;
        }

        // Close stdin so ffmpeg knows there are no more frames.
        drop(stdin);

        let result = child
            .wait_with_output()
            .await
            .map_err(|e| CompileError::Wait(e.to_string()))?;

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            error!(stderr = %stderr, "ffmpeg exited with error");
            if let Err(e) = tokio::fs::remove_file(output).await {
                warn!(path = %output.display(), error = %e, "failed to remove partial video");
            }
            return Err(CompileError::FfmpegFailed(stderr.into_owned()));
        }

        info!(
            frames = images.len(),
            output = %output.display(),
            "video summary compiled"
        );

        Ok(CompiledVideo {
            path: output.to_path_buf(),
            frame_count: images.len(),
        })
    }
}

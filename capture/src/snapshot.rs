use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::thread::JoinHandle;

use chrono::{DateTime, Local};
use frame_watch_common::frame::encode_jpeg;
use frame_watch_common::overlay::{draw_label, RED};
use frame_watch_common::Frame;
use image::RgbImage;
use tracing::{debug, error, info, warn};

const SAVING_LABEL: &str = "Saving frame";

/// File-name timestamp: `MM_DD_YYYY-HH:MM:SS`. Lexical order is chronological
/// within a day.
pub const SNAPSHOT_TIME_FORMAT: &str = "%m_%d_%Y-%H:%M:%S";

/// A snapshot the writer has committed to persisting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRecord {
    pub taken_at: DateTime<Local>,
    pub path: PathBuf,
}

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("failed to create snapshot directory {0}: {1}")]
    CreateDir(String, std::io::Error),
    #[error("failed to start snapshot writer thread: {0}")]
    Spawn(std::io::Error),
    #[error("snapshot queue is full")]
    QueueFull,
    #[error("snapshot writer thread has exited")]
    WorkerGone,
}

struct WriteJob {
    path: PathBuf,
    image: RgbImage,
}

/// Persists annotated frames as JPEG files named by local capture time.
///
/// Naming and bookkeeping happen on the caller's thread; encoding and disk I/O
/// run on a dedicated writer thread fed through a bounded queue, so a slow
/// disk never delays the next capture. Only the capture thread calls `save`.
pub struct SnapshotWriter {
    images_dir: PathBuf,
    tx: Option<SyncSender<WriteJob>>,
    worker: Option<JoinHandle<()>>,
    last_stem: Option<String>,
    last_suffix: u32,
}

impl SnapshotWriter {
    pub fn new(
        images_dir: &Path,
        jpeg_quality: u8,
        queue_depth: usize,
    ) -> Result<Self, SnapshotError> {
        std::fs::create_dir_all(images_dir)
            .map_err(|e| SnapshotError::CreateDir(images_dir.display().to_string(), e))?;

        let (tx, rx) = mpsc::sync_channel(queue_depth.max(1));
        let worker = std::thread::Builder::new()
            .name("snapshot-writer".into())
            .spawn(move || run_writer(rx, jpeg_quality))
            .map_err(SnapshotError::Spawn)?;

        info!(dir = %images_dir.display(), queue_depth, "snapshot writer started");

        Ok(Self {
            images_dir: images_dir.to_path_buf(),
            tx: Some(tx),
            worker: Some(worker),
            last_stem: None,
            last_suffix: 0,
        })
    }

    pub fn images_dir(&self) -> &Path {
        &self.images_dir
    }

    /// Queue `frame` for writing and stamp "Saving frame" onto it.
    pub fn save(&mut self, frame: &mut Frame) -> Result<SnapshotRecord, SnapshotError> {
        self.save_at(frame, Local::now())
    }

    pub fn save_at(
        &mut self,
        frame: &mut Frame,
        taken_at: DateTime<Local>,
    ) -> Result<SnapshotRecord, SnapshotError> {
        let path = self.next_path(&taken_at);
        let tx = self.tx.as_ref().ok_or(SnapshotError::WorkerGone)?;

        // The file gets the frame as it was before the label is drawn.
        let job = WriteJob {
            path: path.clone(),
            image: frame.image.clone(),
        };
        match tx.try_send(job) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => return Err(SnapshotError::QueueFull),
            Err(TrySendError::Disconnected(_)) => return Err(SnapshotError::WorkerGone),
        }

        draw_label(&mut frame.image, 2, 2, SAVING_LABEL, RED, 1);
        Ok(SnapshotRecord { taken_at, path })
    }

    /// Drain the queue and wait for the writer thread to finish.
    pub fn shutdown(mut self) {
        self.stop_worker();
    }

    /// Pick a path for `taken_at`. A second save in the same second, or a name
    /// already on disk, gets `_1`, `_2`, ... appended to the stem.
    fn next_path(&mut self, taken_at: &DateTime<Local>) -> PathBuf {
        let stem = snapshot_stem(taken_at);
        let mut suffix = match &self.last_stem {
            Some(last) if *last == stem => self.last_suffix + 1,
            _ => 0,
        };
        let path = loop {
            let candidate = self.images_dir.join(snapshot_file_name(&stem, suffix));
            if !candidate.exists() {
                break candidate;
            }
            suffix += 1;
        };
        if suffix > 0 {
            debug!(stem, suffix, "snapshot name collision");
        }
        self.last_stem = Some(stem);
        self.last_suffix = suffix;
        path
    }

    fn stop_worker(&mut self) {
        drop(self.tx.take());
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("snapshot writer thread panicked");
            }
        }
    }
}

impl Drop for SnapshotWriter {
    fn drop(&mut self) {
        self.stop_worker();
    }
}

pub fn snapshot_stem(taken_at: &DateTime<Local>) -> String {
    taken_at.format(SNAPSHOT_TIME_FORMAT).to_string()
}

fn snapshot_file_name(stem: &str, suffix: u32) -> String {
    if suffix == 0 {
        format!("{stem}.jpg")
    } else {
        format!("{stem}_{suffix}.jpg")
    }
}

fn run_writer(rx: Receiver<WriteJob>, quality: u8) {
    for job in rx {
        let result = encode_jpeg(&job.image, quality)
            .map_err(|e| e.to_string())
            .and_then(|jpeg| {
                std::fs::write(&job.path, &jpeg)
                    .map(|()| jpeg.len())
                    .map_err(|e| e.to_string())
            });
        match result {
            Ok(bytes) => debug!(path = %job.path.display(), bytes, "snapshot written"),
            Err(e) => warn!(path = %job.path.display(), error = e, "failed to write snapshot"),
        }
    }
    debug!("snapshot writer exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use image::Rgb;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 4, 5, h, m, s).single().unwrap()
    }

    fn frame() -> Frame {
        Frame::new(RgbImage::from_pixel(48, 32, Rgb([0, 40, 0])), 3)
    }

    #[test]
    fn stem_uses_month_day_year_time() {
        assert_eq!(snapshot_stem(&at(13, 7, 9)), "04_05_2024-13:07:09");
    }

    #[test]
    fn saves_in_same_second_get_distinct_names() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = SnapshotWriter::new(dir.path(), 80, 4).unwrap();
        let first = writer.save_at(&mut frame(), at(9, 0, 0)).unwrap();
        let second = writer.save_at(&mut frame(), at(9, 0, 0)).unwrap();
        let third = writer.save_at(&mut frame(), at(9, 0, 1)).unwrap();

        assert_eq!(first.path, dir.path().join("04_05_2024-09:00:00.jpg"));
        assert_eq!(second.path, dir.path().join("04_05_2024-09:00:00_1.jpg"));
        assert_eq!(third.path, dir.path().join("04_05_2024-09:00:01.jpg"));

        writer.shutdown();
        for record in [first, second, third] {
            let img = image::open(&record.path).unwrap();
            assert_eq!(img.width(), 48);
        }
    }

    #[test]
    fn existing_file_is_not_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("04_05_2024-10:00:00.jpg"), b"old").unwrap();
        let mut writer = SnapshotWriter::new(dir.path(), 80, 4).unwrap();
        let record = writer.save_at(&mut frame(), at(10, 0, 0)).unwrap();
        assert_eq!(record.path, dir.path().join("04_05_2024-10:00:00_1.jpg"));
        writer.shutdown();
        assert_eq!(
            std::fs::read(dir.path().join("04_05_2024-10:00:00.jpg")).unwrap(),
            b"old"
        );
    }

    #[test]
    fn suffixed_names_sort_after_base() {
        let base = snapshot_file_name("04_05_2024-09:00:00", 0);
        let next = snapshot_file_name("04_05_2024-09:00:00", 1);
        assert!(base < next);
    }

    #[test]
    fn label_goes_on_live_frame_not_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = SnapshotWriter::new(dir.path(), 100, 4).unwrap();
        let mut live = frame();
        let record = writer.save_at(&mut live, at(11, 0, 0)).unwrap();
        assert!(live.image.pixels().any(|p| *p == RED));

        writer.shutdown();
        let saved = image::open(&record.path).unwrap().to_rgb8();
        // JPEG is lossy; a red label would push the red channel far above zero.
        assert!(saved.pixels().all(|p| p.0[0] < 64));
    }

    #[test]
    fn creates_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("static").join("images");
        let writer = SnapshotWriter::new(&nested, 80, 1).unwrap();
        assert!(nested.is_dir());
        assert_eq!(writer.images_dir(), nested.as_path());
    }
}

use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use frame_watch_common::frame::{encode_jpeg, FrameError};
use frame_watch_common::overlay::{draw_label, label_height, label_width, WHITE};
use frame_watch_common::{Published, SharedFrameBuffer};
use futures_util::{Stream, StreamExt};
use image::{Rgb, RgbImage};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// `Content-Type` of the `/video_feed` response.
pub const MJPEG_CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

const PART_HEADER: &[u8] = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n";
const PART_TRAILER: &[u8] = b"\r\n";

const PLACEHOLDER_LABEL: &str = "Camera unavailable";

/// Wrap one JPEG as a multipart part.
pub fn frame_chunk(jpeg: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(PART_HEADER.len() + jpeg.len() + PART_TRAILER.len());
    buf.extend_from_slice(PART_HEADER);
    buf.extend_from_slice(jpeg);
    buf.extend_from_slice(PART_TRAILER);
    buf.freeze()
}

/// Pre-framed part shown to viewers while the camera is unavailable.
pub fn placeholder_chunk(width: u32, height: u32) -> Result<Bytes, FrameError> {
    let (width, height) = (width.max(1), height.max(1));
    let mut image = RgbImage::from_pixel(width, height, Rgb([48, 48, 48]));
    let scale = if width >= 320 { 2 } else { 1 };
    let x = width.saturating_sub(label_width(PLACEHOLDER_LABEL, scale)) / 2;
    let y = height.saturating_sub(label_height(scale)) / 2;
    draw_label(&mut image, x, y, PLACEHOLDER_LABEL, WHITE, scale);
    Ok(frame_chunk(&encode_jpeg(&image, 80)?))
}

/// Counts viewers and logs their lifetime.
struct ViewerGuard {
    id: u64,
    active: Arc<AtomicU64>,
}

impl Drop for ViewerGuard {
    fn drop(&mut self) {
        let remaining = self.active.fetch_sub(1, Ordering::Relaxed).saturating_sub(1);
        info!(viewer = self.id, remaining, "viewer disconnected");
    }
}

/// One viewer's MJPEG producer.
///
/// Waits for a frame newer than the last one it sent, encodes it off the
/// async executor, and yields it as a multipart part. Viewers that fall
/// behind skip straight to the newest frame; nothing here can slow capture.
pub struct StreamEncoder {
    buffer: Arc<SharedFrameBuffer>,
    quality: u8,
    placeholder: Bytes,
    seen: u64,
    viewer: ViewerGuard,
}

impl StreamEncoder {
    pub fn new(
        buffer: Arc<SharedFrameBuffer>,
        quality: u8,
        placeholder: Bytes,
        id: u64,
        active: Arc<AtomicU64>,
    ) -> Self {
        let now_active = active.fetch_add(1, Ordering::Relaxed) + 1;
        info!(viewer = id, active = now_active, "viewer connected");
        Self {
            buffer,
            quality,
            placeholder,
            seen: 0,
            viewer: ViewerGuard { id, active },
        }
    }

    /// Next part to send. Encode failures drop the frame and keep waiting.
    pub async fn next_chunk(&mut self) -> Bytes {
        loop {
            let published = self.buffer.wait_newer(self.seen).await;
            self.seen = published.version();

            let frame = match published {
                Published::Stale { .. } => return self.placeholder.clone(),
                Published::Frame { frame, .. } => frame,
            };

            let seq = frame.seq;
            let quality = self.quality;
            match tokio::task::spawn_blocking(move || frame.to_jpeg(quality)).await {
                Ok(Ok(jpeg)) => return frame_chunk(&jpeg),
                Ok(Err(e)) => {
                    debug!(
                        viewer = self.viewer.id,
                        seq,
                        error = %e,
                        "dropping frame that failed to encode"
                    );
                }
                Err(e) => {
                    warn!(viewer = self.viewer.id, seq, error = %e, "encode task failed");
                }
            }
        }
    }

    /// Endless part stream that ends when `shutdown` flips to true or the
    /// consumer drops it.
    pub fn into_stream(
        self,
        mut shutdown: watch::Receiver<bool>,
    ) -> impl Stream<Item = Result<Bytes, Infallible>> + Send + 'static {
        futures_util::stream::unfold(self, |mut encoder| async move {
            let chunk = encoder.next_chunk().await;
            Some((Ok(chunk), encoder))
        })
        .take_until(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
    }
}

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

use crate::frame::Frame;

/// Single-slot, latest-wins hand-off between the capture thread and viewers.
///
/// One mutex guards the slot. Writers replace the `Arc` in O(1); readers clone
/// the `Arc` out and drop the lock before doing anything expensive with it, so
/// a reader can never observe a half-written frame and never stalls the writer
/// for longer than a pointer swap.
///
/// Every change bumps a version counter. Viewers remember the last version they
/// saw and park on [`SharedFrameBuffer::wait_newer`] instead of polling.
#[derive(Default)]
pub struct SharedFrameBuffer {
    slot: Mutex<Slot>,
    changed: Notify,
}

#[derive(Default)]
struct Slot {
    frame: Option<Arc<Frame>>,
    version: u64,
    stale: bool,
}

/// What a viewer gets back from [`SharedFrameBuffer::wait_newer`].
#[derive(Debug, Clone)]
pub enum Published {
    Frame { frame: Arc<Frame>, version: u64 },
    /// The capture side gave up on the camera; no fresh frames are coming.
    Stale { version: u64 },
}

impl Published {
    pub fn version(&self) -> u64 {
        match self {
            Published::Frame { version, .. } | Published::Stale { version } => *version,
        }
    }
}

impl SharedFrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a new frame, replacing whatever was there. Clears staleness.
    pub fn set(&self, frame: Arc<Frame>) {
        {
            let mut slot = self.lock();
            slot.frame = Some(frame);
            slot.version += 1;
            slot.stale = false;
        }
        self.changed.notify_waiters();
    }

    /// Current frame, if any. Never blocks on anything but the slot lock.
    pub fn get(&self) -> Option<Arc<Frame>> {
        self.lock().frame.clone()
    }

    /// Flag the buffer as stale. The last frame is kept for `get`, but viewers
    /// waiting for news are told the feed is gone. Repeated calls while already
    /// stale are no-ops.
    pub fn mark_stale(&self) {
        {
            let mut slot = self.lock();
            if slot.stale {
                return;
            }
            slot.stale = true;
            slot.version += 1;
        }
        self.changed.notify_waiters();
    }

    pub fn is_stale(&self) -> bool {
        self.lock().stale
    }

    pub fn version(&self) -> u64 {
        self.lock().version
    }

    /// Non-blocking check for anything published after `seen`.
    pub fn newer_than(&self, seen: u64) -> Option<Published> {
        let slot = self.lock();
        if slot.version <= seen {
            return None;
        }
        if slot.stale {
            return Some(Published::Stale {
                version: slot.version,
            });
        }
        slot.frame.as_ref().map(|frame| Published::Frame {
            frame: Arc::clone(frame),
            version: slot.version,
        })
    }

    /// Wait until something newer than `seen` is published and return it.
    ///
    /// Intermediate versions are skipped: the caller always gets the latest.
    pub async fn wait_newer(&self, seen: u64) -> Published {
        loop {
            let notified = self.changed.notified();
            let mut notified = std::pin::pin!(notified);
            // Register before checking so a `set` between the check and the
            // await cannot be missed.
            notified.as_mut().enable();

            if let Some(published) = self.newer_than(seen) {
                return published;
            }
            notified.await;
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        // A panic while holding the lock cannot leave a torn slot: every
        // mutation is a plain field store.
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use std::time::Duration;

    fn solid_frame(seq: u64, size: u32) -> Arc<Frame> {
        let value = (seq % 251) as u8;
        Arc::new(Frame::with_timestamp(
            RgbImage::from_pixel(size, size, Rgb([value, value, value])),
            seq as i64,
            seq,
        ))
    }

    #[test]
    fn starts_empty() {
        let buffer = SharedFrameBuffer::new();
        assert!(buffer.get().is_none());
        assert_eq!(buffer.version(), 0);
        assert!(!buffer.is_stale());
        assert!(buffer.newer_than(0).is_none());
    }

    #[test]
    fn latest_set_wins() {
        let buffer = SharedFrameBuffer::new();
        buffer.set(solid_frame(1, 4));
        buffer.set(solid_frame(2, 4));
        assert_eq!(buffer.get().unwrap().seq, 2);
        assert_eq!(buffer.version(), 2);

        match buffer.newer_than(0).unwrap() {
            Published::Frame { frame, version } => {
                assert_eq!(frame.seq, 2);
                assert_eq!(version, 2);
            }
            other => panic!("expected frame, got {other:?}"),
        }
        assert!(buffer.newer_than(2).is_none());
    }

    #[test]
    fn stale_is_reported_once_and_cleared_by_set() {
        let buffer = SharedFrameBuffer::new();
        buffer.set(solid_frame(1, 4));
        buffer.mark_stale();
        buffer.mark_stale();
        assert!(buffer.is_stale());
        assert_eq!(buffer.version(), 2);
        assert!(matches!(
            buffer.newer_than(1),
            Some(Published::Stale { version: 2 })
        ));
        // Last frame is still readable.
        assert_eq!(buffer.get().unwrap().seq, 1);

        buffer.set(solid_frame(3, 4));
        assert!(!buffer.is_stale());
        assert!(matches!(
            buffer.newer_than(2),
            Some(Published::Frame { version: 3, .. })
        ));
    }

    #[test]
    fn readers_never_observe_partial_frames() {
        let buffer = Arc::new(SharedFrameBuffer::new());
        let writer = {
            let buffer = Arc::clone(&buffer);
            std::thread::spawn(move || {
                for seq in 1..=500u64 {
                    // Alternate sizes so a torn write would show mismatched dims.
                    let size = if seq % 2 == 0 { 16 } else { 24 };
                    buffer.set(solid_frame(seq, size));
                }
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let buffer = Arc::clone(&buffer);
                std::thread::spawn(move || {
                    for _ in 0..2000 {
                        if let Some(frame) = buffer.get() {
                            let expected = if frame.seq % 2 == 0 { 16 } else { 24 };
                            assert_eq!(frame.width(), expected);
                            assert_eq!(frame.height(), expected);
                            let value = (frame.seq % 251) as u8;
                            assert!(frame.image.pixels().all(|p| p.0 == [value; 3]));
                        }
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
        assert_eq!(buffer.get().unwrap().seq, 500);
    }

    #[tokio::test]
    async fn wait_newer_wakes_on_set() {
        let buffer = Arc::new(SharedFrameBuffer::new());
        let waiter = {
            let buffer = Arc::clone(&buffer);
            tokio::spawn(async move { buffer.wait_newer(0).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        buffer.set(solid_frame(9, 4));
        let published = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
        assert_eq!(published.version(), 1);
    }

    #[tokio::test]
    async fn wait_newer_returns_immediately_when_behind() {
        let buffer = SharedFrameBuffer::new();
        buffer.set(solid_frame(1, 4));
        buffer.set(solid_frame(2, 4));
        let published = tokio::time::timeout(Duration::from_millis(100), buffer.wait_newer(0))
            .await
            .unwrap();
        match published {
            Published::Frame { frame, .. } => assert_eq!(frame.seq, 2),
            other => panic!("expected frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn wait_newer_wakes_on_stale() {
        let buffer = Arc::new(SharedFrameBuffer::new());
        let waiter = {
            let buffer = Arc::clone(&buffer);
            tokio::spawn(async move { buffer.wait_newer(0).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        buffer.mark_stale();
        let published = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(published, Published::Stale { version: 1 }));
    }
}

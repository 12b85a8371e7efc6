use bytes::{Bytes, BytesMut};
use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::time::Duration;
use tracing::{debug, warn};

use super::CameraError;

const SOI: &[u8] = &[0xFF, 0xD8];
const EOI: &[u8] = &[0xFF, 0xD9];

/// A single JPEG larger than this means we lost sync with the stream.
const MAX_JPEG_BYTES: usize = 16 * 1024 * 1024;

/// Parse state for a raw concatenated-JPEG byte stream.
enum ParseState {
    /// Looking for the start-of-image marker `FF D8`.
    SeekingStart,
    /// Inside a JPEG, looking for the end-of-image marker `FF D9`.
    CollectingJpeg,
}

/// Splits a byte stream of back-to-back JPEG images (what `ffmpeg -f mjpeg`
/// and `rpicam-vid --codec mjpeg` write to stdout) into whole images.
///
/// Entropy-coded JPEG data stuffs every `FF` with a following `00`, so the
/// first `FF D9` after a `FF D8` is the end of that image.
pub struct JpegSplitter {
    buffer: BytesMut,
    state: ParseState,
    /// Offset to resume the EOI scan from, to avoid re-scanning old data.
    scan_from: usize,
}

impl Default for JpegSplitter {
    fn default() -> Self {
        Self::new()
    }
}

impl JpegSplitter {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(256 * 1024),
            state: ParseState::SeekingStart,
            scan_from: 0,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Pop the next complete JPEG, if one is buffered.
    pub fn next_jpeg(&mut self) -> Option<Bytes> {
        loop {
            match self.state {
                ParseState::SeekingStart => {
                    if let Some(pos) = find_subsequence(&self.buffer, SOI) {
                        // Discard garbage before the marker
                        let _ = self.buffer.split_to(pos);
                        self.scan_from = SOI.len();
                        self.state = ParseState::CollectingJpeg;
                    } else {
                        // Keep the last byte in case the marker spans chunks
                        if self.buffer.len() > 1 {
                            let _ = self.buffer.split_to(self.buffer.len() - 1);
                        }
                        return None;
                    }
                }
                ParseState::CollectingJpeg => {
                    if let Some(pos) = find_subsequence(&self.buffer[self.scan_from..], EOI) {
                        let end = self.scan_from + pos + EOI.len();
                        let jpeg = self.buffer.split_to(end).freeze();
                        self.state = ParseState::SeekingStart;
                        self.scan_from = 0;
                        return Some(jpeg);
                    }
                    if self.buffer.len() > MAX_JPEG_BYTES {
                        warn!(
                            bytes = self.buffer.len(),
                            "no end-of-image marker within limit, resyncing"
                        );
                        self.buffer.clear();
                        self.state = ParseState::SeekingStart;
                        self.scan_from = 0;
                        return None;
                    }
                    self.scan_from = self.buffer.len().saturating_sub(1).max(SOI.len());
                    return None;
                }
            }
        }
    }
}

/// Pulls whole JPEGs out of any byte reader.
pub struct JpegStream<R> {
    reader: R,
    splitter: JpegSplitter,
    chunk: Vec<u8>,
}

impl<R: Read> JpegStream<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            splitter: JpegSplitter::new(),
            chunk: vec![0; 64 * 1024],
        }
    }

    /// Block until the next full JPEG arrives. EOF is fatal.
    pub fn next_jpeg(&mut self) -> Result<Bytes, CameraError> {
        loop {
            if let Some(jpeg) = self.splitter.next_jpeg() {
                return Ok(jpeg);
            }
            let n = self.reader.read(&mut self.chunk).map_err(CameraError::Io)?;
            if n == 0 {
                return Err(CameraError::EndOfStream);
            }
            self.splitter.push(&self.chunk[..n]);
        }
    }
}

/// A capture subprocess whose stdout is a concatenated-JPEG stream.
///
/// A reader thread splits stdout and hands images over a small channel, so a
/// process that stays alive but stops writing surfaces as
/// [`CameraError::Timeout`] instead of blocking the caller. The child is killed
/// when the pipe is dropped, which also ends the reader thread.
pub struct MjpegPipe {
    child: Child,
    frames: Receiver<Result<Bytes, CameraError>>,
    read_timeout: Duration,
}

impl MjpegPipe {
    pub fn spawn(
        program: &str,
        args: &[String],
        read_timeout: Duration,
    ) -> Result<Self, CameraError> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|source| CameraError::Spawn {
                command: program.to_string(),
                source,
            })?;

        let Some(stdout) = child.stdout.take() else {
            reap(&mut child);
            return Err(CameraError::Spawn {
                command: program.to_string(),
                source: std::io::Error::other("could not get stdout handle"),
            });
        };

        let (tx, frames) = mpsc::sync_channel(2);
        let mut stream = JpegStream::new(stdout);
        let reader = std::thread::Builder::new()
            .name("mjpeg-pipe".into())
            .spawn(move || loop {
                let next = stream.next_jpeg();
                let failed = next.is_err();
                if tx.send(next).is_err() || failed {
                    break;
                }
            });
        if let Err(e) = reader {
            reap(&mut child);
            return Err(CameraError::Io(e));
        }

        debug!(
            program,
            ?args,
            pid = child.id(),
            read_timeout = ?read_timeout,
            "capture subprocess started"
        );

        Ok(Self {
            child,
            frames,
            read_timeout,
        })
    }

    /// Next whole JPEG, or `Timeout` if none arrives within the read timeout.
    pub fn next_jpeg(&mut self) -> Result<Bytes, CameraError> {
        match self.frames.recv_timeout(self.read_timeout) {
            Ok(next) => next,
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    pid = self.child.id(),
                    timeout = ?self.read_timeout,
                    "capture subprocess stalled"
                );
                Err(CameraError::Timeout(self.read_timeout))
            }
            Err(RecvTimeoutError::Disconnected) => Err(CameraError::EndOfStream),
        }
    }
}

impl Drop for MjpegPipe {
    fn drop(&mut self) {
        reap(&mut self.child);
    }
}

fn reap(child: &mut Child) {
    if let Err(e) = child.kill() {
        debug!(error = %e, "capture subprocess already gone");
    }
    let _ = child.wait();
}

/// Find the position of `needle` in `haystack`.
fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

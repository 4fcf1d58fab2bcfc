// MJPEG stream source
//
// Splits a concatenated MJPEG byte stream (what `ffmpeg -f mjpeg -`,
// `rpicam-vid --codec mjpeg -o -` and most webcams emit) into individual
// JPEG frames. The stream is read on a dedicated thread so a slow consumer
// never stalls the capture pipe for longer than the hand-off channel allows.

use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};

use super::{wall_clock_secs, Frame, FrameEncoding, FrameSource, IngestError};

const SOI: [u8; 2] = [0xFF, 0xD8];
const EOI: [u8; 2] = [0xFF, 0xD9];

/// Largest JPEG we are willing to accumulate before giving up on a frame
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Frames buffered between the reader thread and the ingest lane
const HANDOFF_CAPACITY: usize = 8;

const READ_CHUNK: usize = 64 * 1024;

/// Start of scan: entropy-coded data follows this segment
const SOS: u8 = 0xDA;

/// Where the splitter is within the frame at the front of its buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Progress {
    /// Walking marker segments; the next one starts at this offset
    Header(usize),
    /// Searching for EOI from this offset
    Scan(usize),
}

/// Result of walking the marker segments that precede the image data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Segments {
    /// Image data (or something that is not a marker) starts here
    Scan(usize),
    /// The segment at this offset is not complete yet
    Incomplete(usize),
}

/// Skip marker segments by their length fields, starting at `pos`.
///
/// APPn segments can carry a whole JPEG thumbnail (EXIF), so an EOI inside
/// them must not end the frame. Anything that does not look like a marker
/// falls back to a plain EOI search from that point.
fn skip_segments(buf: &[u8], mut pos: usize) -> Segments {
    loop {
        if pos >= buf.len() {
            return Segments::Incomplete(pos);
        }
        if buf[pos] != 0xFF {
            return Segments::Scan(pos);
        }
        // Fill bytes
        let mut marker_at = pos;
        while buf.get(marker_at + 1) == Some(&0xFF) {
            marker_at += 1;
        }
        let Some(&marker) = buf.get(marker_at + 1) else {
            return Segments::Incomplete(pos);
        };
        match marker {
            0xD9 => return Segments::Scan(marker_at),
            // Standalone markers carry no length
            0x01 | 0xD0..=0xD7 => {
                pos = marker_at + 2;
                continue;
            }
            _ => {}
        }
        let (Some(&hi), Some(&lo)) = (buf.get(marker_at + 2), buf.get(marker_at + 3)) else {
            return Segments::Incomplete(pos);
        };
        let length = usize::from(u16::from_be_bytes([hi, lo]));
        if length < 2 {
            return Segments::Scan(marker_at);
        }
        let next = marker_at + 2 + length;
        if marker == SOS {
            return if next <= buf.len() {
                Segments::Scan(next)
            } else {
                Segments::Incomplete(pos)
            };
        }
        pos = next;
    }
}

/// Incremental SOI..EOI splitter
pub struct MjpegSplitter {
    buf: Vec<u8>,
    progress: Progress,
    max_frame_bytes: usize,
    /// Bytes discarded because they were not inside a JPEG
    pub skipped_bytes: u64,
}

impl MjpegSplitter {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            buf: Vec::with_capacity(READ_CHUNK),
            progress: Progress::Header(SOI.len()),
            max_frame_bytes,
            skipped_bytes: 0,
        }
    }

    /// Feed more stream bytes; complete JPEGs are appended to `out`.
    pub fn push(&mut self, data: &[u8], out: &mut Vec<Vec<u8>>) {
        self.buf.extend_from_slice(data);

        loop {
            if !self.buf.starts_with(&SOI) {
                match find(&self.buf, &SOI, 0) {
                    Some(start) => {
                        log::warn!("MJPEG stream: {} bytes before JPEG start marker, skipping", start);
                        self.discard_front(start);
                    }
                    None => {
                        // Keep a trailing 0xFF: it may be the first half of the next SOI
                        let keep = usize::from(self.buf.last() == Some(&0xFF));
                        let drop = self.buf.len() - keep;
                        self.discard_front(drop);
                        return;
                    }
                }
            }

            if let Progress::Header(pos) = self.progress {
                match skip_segments(&self.buf, pos) {
                    Segments::Scan(at) => self.progress = Progress::Scan(at),
                    Segments::Incomplete(at) => {
                        self.progress = Progress::Header(at);
                        self.drop_if_oversized();
                        return;
                    }
                }
            }
            let Progress::Scan(scan_from) = self.progress else { return };

            match find(&self.buf, &EOI, scan_from) {
                Some(end) => {
                    let frame_len = end + EOI.len();
                    let rest = self.buf.split_off(frame_len);
                    out.push(std::mem::replace(&mut self.buf, rest));
                    self.progress = Progress::Header(SOI.len());
                }
                None => {
                    // Resume one byte early in case EOI straddles two reads
                    self.progress = Progress::Scan(self.buf.len().saturating_sub(1).max(scan_from));
                    self.drop_if_oversized();
                    return;
                }
            }
        }
    }

    fn drop_if_oversized(&mut self) {
        if self.buf.len() > self.max_frame_bytes {
            log::warn!(
                "MJPEG stream: no end marker within {} bytes, dropping partial frame",
                self.max_frame_bytes
            );
            let len = self.buf.len();
            self.discard_front(len);
        }
    }

    fn discard_front(&mut self, n: usize) {
        self.buf.drain(..n);
        self.skipped_bytes += n as u64;
        self.progress = Progress::Header(SOI.len());
    }
}

fn find(haystack: &[u8], needle: &[u8; 2], from: usize) -> Option<usize> {
    if from >= haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(2)
        .position(|w| w == needle)
        .map(|p| p + from)
}

/// `FrameSource` over an MJPEG byte stream
pub struct MjpegStreamSource {
    receiver: Receiver<Result<Frame, IngestError>>,
    reader_thread: Option<std::thread::JoinHandle<()>>,
    child: Option<Child>,
}

impl MjpegStreamSource {
    /// Read frames from any byte stream (stdin, a file, a socket).
    pub fn from_reader<R: Read + Send + 'static>(reader: R) -> Result<Self, IngestError> {
        let (sender, receiver) = bounded(HANDOFF_CAPACITY);

        let reader_thread = std::thread::Builder::new()
            .name("lookout-mjpeg-reader".into())
            .spawn(move || {
                let mut reader = reader;
                let mut splitter = MjpegSplitter::new(MAX_FRAME_BYTES);
                let mut chunk = vec![0u8; READ_CHUNK];
                let mut frames = Vec::new();

                loop {
                    let n = match reader.read(&mut chunk) {
                        Ok(0) => break,
                        Ok(n) => n,
                        Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                        Err(e) => {
                            let _ = sender.send(Err(IngestError::Io(e)));
                            break;
                        }
                    };

                    splitter.push(&chunk[..n], &mut frames);
                    for jpeg in frames.drain(..) {
                        let frame = Frame::new(wall_clock_secs(), jpeg, FrameEncoding::Jpeg);
                        if sender.send(Ok(frame)).is_err() {
                            return;
                        }
                    }
                }

                log::info!(
                    "MJPEG stream ended ({} stray bytes skipped)",
                    splitter.skipped_bytes
                );
            })?;

        Ok(Self {
            receiver,
            reader_thread: Some(reader_thread),
            child: None,
        })
    }

    /// Spawn a capture command and read MJPEG from its stdout.
    pub fn spawn_command(command: &[String]) -> Result<Self, IngestError> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| IngestError::Spawn("empty capture command".into()))?;

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| IngestError::Spawn(format!("{}: {}", program, e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| IngestError::Spawn("capture command has no stdout".into()))?;

        log::info!("Capture command started: {} (pid {})", command.join(" "), child.id());

        let mut source = Self::from_reader(stdout)?;
        source.child = Some(child);
        Ok(source)
    }
}

impl FrameSource for MjpegStreamSource {
    fn next_frame(&mut self, timeout: Duration) -> Result<Option<Frame>, IngestError> {
        match self.receiver.recv_timeout(timeout) {
            Ok(Ok(frame)) => Ok(Some(frame)),
            Ok(Err(e)) => Err(e),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(IngestError::EndOfStream),
        }
    }
}

impl Drop for MjpegStreamSource {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
        // With the child gone its stdout hits EOF and the reader exits. A
        // plain reader (e.g. stdin) may still be blocked, so don't wait on it.
        if let Some(handle) = self.reader_thread.take() {
            if handle.is_finished() {
                let _ = handle.join();
            }
        }
    }
}

//! External encoder processes
//!
//! Every stream of a segment (the "before" pre-roll and the live "after"
//! part) is written by its own encoder process. The recording lane feeds
//! frame payloads straight into the process's stdin.
//!
//! ## Lifecycle
//! - [`EncodingPipeline::start`] spawns the process and returns an
//!   [`EncoderHandle`] bound to exactly one output file
//! - [`EncoderHandle::feed`] writes one frame, strictly in timestamp order.
//!   An ffmpeg stream hands frames to a stdin writer thread through a short
//!   queue; a frame that cannot be queued within the write timeout is
//!   reported as backpressure, so a stalled encoder never blocks the caller
//!   for longer than that.
//! - [`EncoderHandle::finish`] closes stdin and waits for the process to
//!   exit; [`EncoderHandle::abort`] kills it. Both consume the handle, so a
//!   stream cannot be written to after it was closed.
//! - Dropping a handle that was neither finished nor aborted kills the process.

use std::collections::VecDeque;
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{SendTimeoutError, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::{ffmpeg_input_args, ContainerFormat, OutputCodec};
use crate::config::EncoderSettings;
use crate::video::{Frame, FrameEncoding};

/// Lines of encoder stderr kept for error messages
const STDERR_TAIL_LINES: usize = 20;

/// How often a finishing encoder is polled for exit
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Frames queued for an encoder's stdin before writes start to wait
const STDIN_QUEUE_FRAMES: usize = 4;

/// Used when the configured write timeout is not a usable duration
const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(2);

/// Error type for encoder operations
#[derive(Debug, thiserror::Error)]
pub enum EncoderError {
    #[error("Failed to start encoder: {0}")]
    Spawn(String),

    #[error("Encoder executable not found: {0}")]
    FfmpegNotFound(PathBuf),

    #[error("Encoder accepted {accepted} of {submitted} bytes")]
    Backpressure { submitted: usize, accepted: usize },

    #[error("Frame at {timestamp:.3} is not after the previous frame at {previous:.3}")]
    OutOfOrder { previous: f64, timestamp: f64 },

    #[error("Stream expects {expected} frames, got {actual}")]
    EncodingMismatch { expected: FrameEncoding, actual: FrameEncoding },

    #[error("Encoder exited while being fed: {0}")]
    EncoderExited(String),

    #[error("Encoder failed ({status}): {stderr}")]
    EncoderFailed { status: String, stderr: String },

    #[error("Encoder did not exit within {0:?} and was killed")]
    FinishTimeout(Duration),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, EncoderError>;

/// Which half of a segment a stream holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SegmentPart {
    /// Pre-roll, written from the buffer when the segment closes
    Before,
    /// Live footage from the motion trigger onwards
    After,
}

impl SegmentPart {
    pub fn suffix(&self) -> &'static str {
        match self {
            SegmentPart::Before => "before",
            SegmentPart::After => "after",
        }
    }
}

impl std::fmt::Display for SegmentPart {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.suffix())
    }
}

/// Everything an encoder needs to know about one stream
#[derive(Debug, Clone)]
pub struct StreamRequest {
    pub segment_id: String,
    pub part: SegmentPart,
    pub output_path: PathBuf,
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    /// Encoding of every frame that will be fed
    pub input: FrameEncoding,
}

/// Statistics from one encoded stream
#[derive(Debug, Clone, Default)]
pub struct EncoderStats {
    pub frames_encoded: u64,
    pub bytes_written: u64,
    pub encoding_duration: Duration,
    pub average_fps: f64,
    pub first_timestamp: Option<f64>,
    pub last_timestamp: Option<f64>,
}

impl EncoderStats {
    /// Span of frame timestamps covered by the stream
    pub fn media_secs(&self) -> f64 {
        match (self.first_timestamp, self.last_timestamp) {
            (Some(first), Some(last)) => last - first,
            _ => 0.0,
        }
    }
}

/// Factory for encoder streams
pub trait EncodingPipeline: Send + Sync {
    /// Start an encoder writing to `request.output_path`.
    fn start(&self, request: &StreamRequest) -> Result<EncoderHandle>;

    /// Container the pipeline produces for `input` frames
    fn container(&self, input: FrameEncoding) -> ContainerFormat;

    /// Join a finished before/after pair into `output`, before first.
    fn concat(&self, before: &Path, after: &Path, output: &Path) -> Result<()>;
}

/// A running encoder process as seen by [`EncoderHandle`]
pub trait EncoderProcess: Send {
    /// One write attempt on the process input; returns the bytes accepted.
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize>;

    /// Close the input and wait for a clean exit, killing the process if it
    /// has not exited after `grace` (`None` waits indefinitely).
    fn finish(&mut self, grace: Option<Duration>) -> Result<()>;

    /// Kill the process and release its resources without waiting for a drain.
    fn abort(&mut self);

    /// Recent diagnostic output, for error messages
    fn diagnostics(&self) -> String {
        String::new()
    }
}

/// One running encoder bound to one output file
pub struct EncoderHandle {
    process: Option<Box<dyn EncoderProcess>>,
    segment_id: String,
    part: SegmentPart,
    output_path: PathBuf,
    input: FrameEncoding,
    started: Instant,
    stats: EncoderStats,
}

impl EncoderHandle {
    pub fn new(request: &StreamRequest, process: Box<dyn EncoderProcess>) -> Self {
        Self {
            process: Some(process),
            segment_id: request.segment_id.clone(),
            part: request.part,
            output_path: request.output_path.clone(),
            input: request.input,
            started: Instant::now(),
            stats: EncoderStats::default(),
        }
    }

    /// Write one frame to the encoder.
    ///
    /// The payload goes out in a single write; if the encoder accepts fewer
    /// bytes than submitted (none at all when its queue stayed full for the
    /// write timeout) this returns [`EncoderError::Backpressure`] and the
    /// caller decides what happens to the stream.
    pub fn feed(&mut self, frame: &Frame) -> Result<()> {
        if frame.encoding != self.input {
            return Err(EncoderError::EncodingMismatch {
                expected: self.input,
                actual: frame.encoding,
            });
        }
        if let Some(previous) = self.stats.last_timestamp {
            if frame.timestamp <= previous {
                return Err(EncoderError::OutOfOrder {
                    previous,
                    timestamp: frame.timestamp,
                });
            }
        }

        let process = self
            .process
            .as_mut()
            .ok_or_else(|| EncoderError::EncoderExited("stream already closed".into()))?;

        let submitted = frame.payload.len();
        let accepted = loop {
            match process.write(&frame.payload) {
                Ok(n) => break n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == ErrorKind::BrokenPipe => {
                    return Err(EncoderError::EncoderExited(process.diagnostics()));
                }
                Err(e) => return Err(EncoderError::Io(e)),
            }
        };
        if accepted < submitted {
            return Err(EncoderError::Backpressure { submitted, accepted });
        }

        self.stats.frames_encoded += 1;
        self.stats.bytes_written += submitted as u64;
        self.stats.first_timestamp.get_or_insert(frame.timestamp);
        self.stats.last_timestamp = Some(frame.timestamp);
        Ok(())
    }

    /// Close the input and wait for the encoder to exit.
    pub fn finish(self) -> Result<EncoderStats> {
        self.close(None)
    }

    /// Like [`finish`](Self::finish), but kill the encoder if it takes longer than `grace`.
    pub fn finish_within(self, grace: Duration) -> Result<EncoderStats> {
        self.close(Some(grace))
    }

    fn close(mut self, grace: Option<Duration>) -> Result<EncoderStats> {
        let mut process = self
            .process
            .take()
            .ok_or_else(|| EncoderError::EncoderExited("stream already closed".into()))?;
        process.finish(grace)?;

        let mut stats = std::mem::take(&mut self.stats);
        stats.encoding_duration = self.started.elapsed();
        let secs = stats.encoding_duration.as_secs_f64();
        stats.average_fps = if secs > 0.0 {
            stats.frames_encoded as f64 / secs
        } else {
            0.0
        };

        log::info!(
            "[{}] {} stream finished: {} frames, {} bytes -> {}",
            self.segment_id,
            self.part,
            stats.frames_encoded,
            stats.bytes_written,
            self.output_path.display()
        );
        Ok(stats)
    }

    /// Kill the encoder without waiting for it to drain.
    pub fn abort(mut self) {
        if let Some(mut process) = self.process.take() {
            process.abort();
            log::warn!("[{}] {} stream aborted", self.segment_id, self.part);
        }
    }

    /// Frames and bytes accepted so far
    pub fn stats(&self) -> (u64, u64) {
        (self.stats.frames_encoded, self.stats.bytes_written)
    }
}

impl Drop for EncoderHandle {
    fn drop(&mut self) {
        if let Some(mut process) = self.process.take() {
            log::warn!(
                "[{}] {} stream dropped without finish, killing encoder",
                self.segment_id,
                self.part
            );
            process.abort();
        }
    }
}

// ============================================================================
// ffmpeg
// ============================================================================

/// Runs one ffmpeg process per stream, reading frames from stdin
pub struct FfmpegPipeline {
    ffmpeg_path: PathBuf,
    output_codec: OutputCodec,
    preset_level: u8,
    write_timeout: Duration,
}

impl FfmpegPipeline {
    pub fn new(settings: &EncoderSettings) -> Self {
        Self {
            ffmpeg_path: settings.ffmpeg_path.clone(),
            output_codec: settings.output_codec,
            preset_level: settings.preset_level,
            write_timeout: Duration::try_from_secs_f64(settings.write_timeout_secs)
                .ok()
                .filter(|t| !t.is_zero())
                .unwrap_or(DEFAULT_WRITE_TIMEOUT),
        }
    }

    /// Full ffmpeg argument list for a stream
    pub fn build_args(&self, request: &StreamRequest) -> Vec<String> {
        let mut args: Vec<String> = ["-hide_banner", "-nostdin", "-loglevel", "warning", "-y"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        args.extend(ffmpeg_input_args(
            request.input,
            request.width,
            request.height,
            request.frame_rate,
        ));
        args.extend(
            self.output_codec
                .ffmpeg_codec_args(self.preset_level, request.frame_rate),
        );
        args.extend(self.container(request.input).ffmpeg_muxer_args());
        args.push(request.output_path.to_string_lossy().into_owned());
        args
    }
}

impl EncodingPipeline for FfmpegPipeline {
    fn start(&self, request: &StreamRequest) -> Result<EncoderHandle> {
        if let Some(parent) = request.output_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut command = Command::new(&self.ffmpeg_path);
        command.args(self.build_args(request));
        let process = FfmpegProcess::spawn(command, self.write_timeout).map_err(|e| match e {
            EncoderError::Io(io) if io.kind() == ErrorKind::NotFound => {
                EncoderError::FfmpegNotFound(self.ffmpeg_path.clone())
            }
            EncoderError::Io(io) => EncoderError::Spawn(format!("{}: {}", self.ffmpeg_path.display(), io)),
            other => other,
        })?;

        log::info!(
            "[{}] {} stream started ({} {}x{}@{} -> {:?}): {}",
            request.segment_id,
            request.part,
            request.input,
            request.width,
            request.height,
            request.frame_rate,
            self.output_codec,
            request.output_path.display()
        );
        Ok(EncoderHandle::new(request, Box::new(process)))
    }

    fn container(&self, input: FrameEncoding) -> ContainerFormat {
        self.output_codec.container(input)
    }

    fn concat(&self, before: &Path, after: &Path, output: &Path) -> Result<()> {
        concat_segments(&self.ffmpeg_path, before, after, output)
    }
}

/// A spawned encoder child with a stdin writer thread and a stderr tail
pub struct FfmpegProcess {
    child: Child,
    /// Dropping the sender lets the writer drain and then close stdin
    stdin_tx: Option<Sender<Vec<u8>>>,
    stdin_thread: Option<std::thread::JoinHandle<()>>,
    write_timeout: Duration,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
    stderr_thread: Option<std::thread::JoinHandle<()>>,
}

impl FfmpegProcess {
    /// Spawn `command` with stdin fed from a writer thread and stderr collected.
    ///
    /// A [`write`](EncoderProcess::write) that cannot queue its data within
    /// `write_timeout` accepts nothing.
    pub fn spawn(mut command: Command, write_timeout: Duration) -> Result<Self> {
        let mut child = command
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;

        let Some(mut stdin) = child.stdin.take() else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(EncoderError::Spawn("encoder stdin was not piped".into()));
        };
        let stderr_tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));
        let stderr_thread = match child.stderr.take() {
            Some(stderr) => {
                let tail = stderr_tail.clone();
                let pid = child.id();
                let spawned = std::thread::Builder::new()
                    .name("lookout-encoder-stderr".into())
                    .spawn(move || {
                        for line in BufReader::new(stderr).lines() {
                            let Ok(line) = line else { break };
                            log::debug!("[encoder {}] {}", pid, line);
                            let mut tail = tail.lock();
                            if tail.len() == STDERR_TAIL_LINES {
                                tail.pop_front();
                            }
                            tail.push_back(line);
                        }
                    });
                match spawned {
                    Ok(handle) => Some(handle),
                    Err(e) => {
                        let _ = child.kill();
                        let _ = child.wait();
                        return Err(EncoderError::Spawn(format!("stderr reader thread: {}", e)));
                    }
                }
            }
            None => None,
        };

        let (stdin_tx, stdin_rx) = crossbeam_channel::bounded::<Vec<u8>>(STDIN_QUEUE_FRAMES);
        let pid = child.id();
        let spawned = std::thread::Builder::new()
            .name("lookout-encoder-stdin".into())
            .spawn(move || {
                for data in stdin_rx {
                    if let Err(e) = stdin.write_all(&data) {
                        log::debug!("[encoder {}] stdin closed: {}", pid, e);
                        break;
                    }
                }
            });
        let stdin_thread = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                if let Some(handle) = stderr_thread {
                    let _ = handle.join();
                }
                return Err(EncoderError::Spawn(format!("stdin writer thread: {}", e)));
            }
        };

        Ok(Self {
            child,
            stdin_tx: Some(stdin_tx),
            stdin_thread: Some(stdin_thread),
            write_timeout,
            stderr_tail,
            stderr_thread,
        })
    }

    fn wait_with_deadline(&mut self, grace: Option<Duration>) -> std::io::Result<Option<ExitStatus>> {
        let Some(grace) = grace else {
            return self.child.wait().map(Some);
        };
        let deadline = Instant::now() + grace;
        loop {
            if let Some(status) = self.child.try_wait()? {
                return Ok(Some(status));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            std::thread::sleep(EXIT_POLL_INTERVAL);
        }
    }

    /// Join the helper threads once the child has exited
    fn join_threads(&mut self) {
        if let Some(handle) = self.stdin_thread.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.stderr_thread.take() {
            let _ = handle.join();
        }
    }

    fn stderr_text(&self) -> String {
        self.stderr_tail
            .lock()
            .iter()
            .cloned()
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl EncoderProcess for FfmpegProcess {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        let tx = self
            .stdin_tx
            .as_ref()
            .ok_or_else(|| std::io::Error::from(ErrorKind::BrokenPipe))?;
        match tx.send_timeout(data.to_vec(), self.write_timeout) {
            Ok(()) => Ok(data.len()),
            Err(SendTimeoutError::Timeout(_)) => Ok(0),
            // The writer only stops early when stdin broke
            Err(SendTimeoutError::Disconnected(_)) => Err(std::io::Error::from(ErrorKind::BrokenPipe)),
        }
    }

    fn finish(&mut self, grace: Option<Duration>) -> Result<()> {
        // Closing stdin (once the queue is written) is the end-of-stream signal
        drop(self.stdin_tx.take());

        match self.wait_with_deadline(grace)? {
            Some(status) => {
                self.join_threads();
                if status.success() {
                    Ok(())
                } else {
                    Err(EncoderError::EncoderFailed {
                        status: status.to_string(),
                        stderr: self.stderr_text(),
                    })
                }
            }
            None => {
                self.abort();
                Err(EncoderError::FinishTimeout(grace.unwrap_or_default()))
            }
        }
    }

    fn abort(&mut self) {
        drop(self.stdin_tx.take());
        let _ = self.child.kill();
        let _ = self.child.wait();
        self.join_threads();
    }

    fn diagnostics(&self) -> String {
        self.stderr_text()
    }
}

/// ffmpeg concat demuxer list with `before` strictly first
pub fn concat_list(before: &Path, after: &Path) -> String {
    let quote = |p: &Path| p.to_string_lossy().replace('\'', r"'\''");
    format!("file '{}'\nfile '{}'\n", quote(before), quote(after))
}

/// Join a before/after pair into `output` with stream copy.
pub fn concat_segments(ffmpeg: &Path, before: &Path, after: &Path, output: &Path) -> Result<()> {
    let list_path = output.with_extension("concat.txt");
    std::fs::write(&list_path, concat_list(before, after))?;

    let result = Command::new(ffmpeg)
        .args(["-hide_banner", "-nostdin", "-loglevel", "error", "-y"])
        .args(["-f", "concat", "-safe", "0", "-i"])
        .arg(&list_path)
        .args(["-c", "copy"])
        .arg(output)
        .stdin(Stdio::null())
        .output();
    let _ = std::fs::remove_file(&list_path);

    let output_result = result.map_err(|e| {
        if e.kind() == ErrorKind::NotFound {
            EncoderError::FfmpegNotFound(ffmpeg.to_path_buf())
        } else {
            EncoderError::Io(e)
        }
    })?;

    if !output_result.status.success() {
        return Err(EncoderError::EncoderFailed {
            status: output_result.status.to_string(),
            stderr: String::from_utf8_lossy(&output_result.stderr).trim().to_string(),
        });
    }

    log::info!("Combined {} + {} -> {}", before.display(), after.display(), output.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(input: FrameEncoding, path: PathBuf) -> StreamRequest {
        StreamRequest {
            segment_id: "20240101120000_640x480x30".into(),
            part: SegmentPart::After,
            output_path: path,
            width: 640,
            height: 480,
            frame_rate: 30,
            input,
        }
    }

    /// In-process encoder stand-in that accepts at most `limit` bytes per write
    struct LimitedProcess {
        limit: usize,
        written: Arc<Mutex<Vec<u8>>>,
        finished: Arc<Mutex<bool>>,
    }

    impl EncoderProcess for LimitedProcess {
        fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
            let n = data.len().min(self.limit);
            self.written.lock().extend_from_slice(&data[..n]);
            Ok(n)
        }

        fn finish(&mut self, _grace: Option<Duration>) -> Result<()> {
            *self.finished.lock() = true;
            Ok(())
        }

        fn abort(&mut self) {}
    }

    fn limited(limit: usize) -> (EncoderHandle, Arc<Mutex<Vec<u8>>>, Arc<Mutex<bool>>) {
        let written = Arc::new(Mutex::new(Vec::new()));
        let finished = Arc::new(Mutex::new(false));
        let process = LimitedProcess {
            limit,
            written: written.clone(),
            finished: finished.clone(),
        };
        let handle = EncoderHandle::new(
            &request(FrameEncoding::Jpeg, PathBuf::from("out.mkv")),
            Box::new(process),
        );
        (handle, written, finished)
    }

    #[test]
    fn test_feed_and_finish_counts() {
        let (mut handle, written, finished) = limited(usize::MAX);
        handle.feed(&Frame::new(1.0, vec![1; 10], FrameEncoding::Jpeg)).unwrap();
        handle.feed(&Frame::new(1.5, vec![2; 5], FrameEncoding::Jpeg)).unwrap();
        let stats = handle.finish().unwrap();
        assert_eq!(stats.frames_encoded, 2);
        assert_eq!(stats.bytes_written, 15);
        assert_eq!(stats.media_secs(), 0.5);
        assert_eq!(written.lock().len(), 15);
        assert!(*finished.lock());
    }

    #[test]
    fn test_short_write_reports_backpressure() {
        let (mut handle, _, _) = limited(7);
        let err = handle
            .feed(&Frame::new(1.0, vec![0; 10], FrameEncoding::Jpeg))
            .unwrap_err();
        assert!(matches!(err, EncoderError::Backpressure { submitted: 10, accepted: 7 }));
        assert_eq!(handle.stats(), (0, 0));
    }

    #[test]
    fn test_order_and_encoding_checks() {
        let (mut handle, _, _) = limited(usize::MAX);
        handle.feed(&Frame::new(2.0, vec![0; 4], FrameEncoding::Jpeg)).unwrap();
        assert!(matches!(
            handle.feed(&Frame::new(2.0, vec![0; 4], FrameEncoding::Jpeg)),
            Err(EncoderError::OutOfOrder { previous, timestamp }) if previous == 2.0 && timestamp == 2.0
        ));
        assert!(matches!(
            handle.feed(&Frame::new(3.0, vec![0; 4], FrameEncoding::RawBgr)),
            Err(EncoderError::EncodingMismatch { expected: FrameEncoding::Jpeg, actual: FrameEncoding::RawBgr })
        ));
        handle.abort();
    }

    #[test]
    fn test_ffmpeg_args() {
        let settings = EncoderSettings {
            output_codec: OutputCodec::H264,
            ..EncoderSettings::default()
        };
        let pipeline = FfmpegPipeline::new(&settings);
        let args = pipeline.build_args(&request(FrameEncoding::RawBgr, PathBuf::from("/tmp/x_after.mp4")));
        let joined = args.join(" ");
        assert!(joined.contains("-f rawvideo -pixel_format bgr24 -video_size 640x480 -framerate 30 -i pipe:0"));
        assert!(joined.contains("-c:v libx264"));
        assert!(joined.contains("-f mp4"));
        assert_eq!(args.last().map(String::as_str), Some("/tmp/x_after.mp4"));

        let copy = FfmpegPipeline::new(&EncoderSettings::default());
        let args = copy.build_args(&request(FrameEncoding::Jpeg, PathBuf::from("a.mkv"))).join(" ");
        assert!(args.contains("-f mjpeg -framerate 30 -i pipe:0 -c:v copy -f matroska a.mkv"));
    }

    #[test]
    fn test_missing_ffmpeg() {
        let dir = tempfile::tempdir().unwrap();
        let settings = EncoderSettings {
            ffmpeg_path: dir.path().join("no-such-ffmpeg"),
            ..EncoderSettings::default()
        };
        let pipeline = FfmpegPipeline::new(&settings);
        let result = pipeline.start(&request(FrameEncoding::Jpeg, dir.path().join("out.mkv")));
        assert!(matches!(result, Err(EncoderError::FfmpegNotFound(_))));
    }

    #[test]
    fn test_concat_list_quotes_paths() {
        let list = concat_list(Path::new("/v/a_before.mkv"), Path::new("/v/it's_after.mkv"));
        assert_eq!(list, "file '/v/a_before.mkv'\nfile '/v/it'\\''s_after.mkv'\n");
    }

    #[cfg(unix)]
    const TIMEOUT: Duration = Duration::from_secs(2);

    #[cfg(unix)]
    fn shell(script: &str) -> Command {
        let mut command = Command::new("sh");
        command.args(["-c", script]);
        command
    }

    #[cfg(unix)]
    #[test]
    fn test_process_finish_clean_exit() {
        let process = FfmpegProcess::spawn(shell("cat > /dev/null"), TIMEOUT).unwrap();
        let mut handle = EncoderHandle::new(
            &request(FrameEncoding::Jpeg, PathBuf::from("unused")),
            Box::new(process),
        );
        handle.feed(&Frame::new(0.0, vec![7; 1024], FrameEncoding::Jpeg)).unwrap();
        let stats = handle.finish_within(Duration::from_secs(10)).unwrap();
        assert_eq!(stats.frames_encoded, 1);
    }

    #[cfg(unix)]
    #[test]
    fn test_process_failure_carries_stderr() {
        let mut process = FfmpegProcess::spawn(shell("cat > /dev/null; echo boom >&2; exit 3"), TIMEOUT).unwrap();
        match process.finish(Some(Duration::from_secs(10))) {
            Err(EncoderError::EncoderFailed { stderr, .. }) => assert!(stderr.contains("boom")),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_process_finish_timeout_kills() {
        let mut process = FfmpegProcess::spawn(shell("exec sleep 30"), TIMEOUT).unwrap();
        let started = Instant::now();
        let result = process.finish(Some(Duration::from_millis(100)));
        assert!(matches!(result, Err(EncoderError::FinishTimeout(_))));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[cfg(unix)]
    #[test]
    fn test_write_after_exit_is_encoder_exited() {
        let process = FfmpegProcess::spawn(shell("exit 0"), TIMEOUT).unwrap();
        let mut handle = EncoderHandle::new(
            &request(FrameEncoding::Jpeg, PathBuf::from("unused")),
            Box::new(process),
        );
        // Give the shell time to exit and close its end of the pipe
        std::thread::sleep(Duration::from_millis(200));
        let mut result = Ok(());
        for i in 0..50 {
            result = handle.feed(&Frame::new(i as f64, vec![0; 65536], FrameEncoding::Jpeg));
            if result.is_err() {
                break;
            }
        }
        assert!(matches!(result, Err(EncoderError::EncoderExited(_))));
        handle.abort();
    }

    #[cfg(unix)]
    #[test]
    fn test_encoder_that_stops_reading_reports_backpressure() {
        // Never reads stdin: the pipe and the writer queue fill, then feed gives up
        let process = FfmpegProcess::spawn(shell("exec sleep 30"), Duration::from_millis(200)).unwrap();
        let mut handle = EncoderHandle::new(
            &request(FrameEncoding::Jpeg, PathBuf::from("unused")),
            Box::new(process),
        );
        let started = Instant::now();
        let mut result = Ok(());
        for i in 0..64 {
            result = handle.feed(&Frame::new(i as f64, vec![0; 65536], FrameEncoding::Jpeg));
            if result.is_err() {
                break;
            }
        }
        assert!(matches!(result, Err(EncoderError::Backpressure { submitted: 65536, accepted: 0 })));
        assert!(started.elapsed() < Duration::from_secs(10));

        let aborting = Instant::now();
        handle.abort();
        assert!(aborting.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_pipeline_write_timeout_from_settings() {
        let settings = EncoderSettings {
            write_timeout_secs: 0.5,
            ..EncoderSettings::default()
        };
        assert_eq!(FfmpegPipeline::new(&settings).write_timeout, Duration::from_millis(500));

        let settings = EncoderSettings {
            write_timeout_secs: f64::NAN,
            ..EncoderSettings::default()
        };
        assert_eq!(FfmpegPipeline::new(&settings).write_timeout, DEFAULT_WRITE_TIMEOUT);
    }
}

// End-to-end runs of the monitor lanes with a synthetic source and the
// scripted encoding pipeline

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use lookout_lib::config::Config;
use lookout_lib::encoding::scripted::StreamOutcome;
use lookout_lib::encoding::{
    ContainerFormat, EncoderError, EncoderHandle, EncodingPipeline, ScriptedPipeline, SegmentPart, StreamRequest,
};
use lookout_lib::recording::{Monitor, RecordingStatus};
use lookout_lib::status::StatusSnapshot;
use lookout_lib::video::{Frame, FrameEncoding, FrameSource, IngestError};

const W: u32 = 16;
const H: u32 = 16;
const PACE: Duration = Duration::from_millis(10);

fn raw(ts: f64, luma: u8) -> Frame {
    Frame::new(ts, vec![luma; (W * H * 3) as usize], FrameEncoding::RawBgr)
}

/// Like `raw`, with the timestamp in tenths stored in the first byte. One
/// pixel is far below the detection cutoff.
fn tagged(ts: f64, luma: u8) -> Frame {
    let mut frame = raw(ts, luma);
    frame.payload[0] = (ts * 10.0).round() as u8;
    frame
}

fn tags(payloads: &[Vec<u8>]) -> Vec<u8> {
    payloads.iter().map(|p| p[0]).collect()
}

/// Scripted pipeline whose "after" streams are slow to start, which puts
/// the recording lane behind the detection lane
struct SlowStartPipeline {
    inner: ScriptedPipeline,
    delay: Duration,
}

impl EncodingPipeline for SlowStartPipeline {
    fn start(&self, request: &StreamRequest) -> Result<EncoderHandle, EncoderError> {
        if request.part == SegmentPart::After {
            std::thread::sleep(self.delay);
        }
        self.inner.start(request)
    }

    fn container(&self, input: FrameEncoding) -> ContainerFormat {
        self.inner.container(input)
    }

    fn concat(&self, before: &Path, after: &Path, output: &Path) -> Result<(), EncoderError> {
        self.inner.concat(before, after, output)
    }
}

/// Plays a fixed list of frames, then either ends or keeps producing
/// frames from `tail` (or nothing at all if `tail` is `None`).
struct SyntheticSource {
    frames: VecDeque<Frame>,
    tail: Option<Box<dyn FnMut(f64) -> Option<Frame> + Send>>,
    next_ts: f64,
}

impl SyntheticSource {
    fn finite(frames: Vec<Frame>) -> Self {
        Self {
            frames: frames.into(),
            tail: None,
            next_ts: 0.0,
        }
    }

    fn endless(frames: Vec<Frame>, tail: impl FnMut(f64) -> Option<Frame> + Send + 'static) -> Self {
        let next_ts = frames.last().map_or(0.0, |f| f.timestamp + 0.1);
        Self {
            frames: frames.into(),
            tail: Some(Box::new(tail)),
            next_ts,
        }
    }
}

impl FrameSource for SyntheticSource {
    fn next_frame(&mut self, timeout: Duration) -> Result<Option<Frame>, IngestError> {
        std::thread::sleep(PACE.min(timeout));
        if let Some(frame) = self.frames.pop_front() {
            return Ok(Some(frame));
        }
        match self.tail.as_mut() {
            Some(tail) => {
                let frame = tail(self.next_ts);
                if frame.is_some() {
                    self.next_ts += 0.1;
                }
                Ok(frame)
            }
            None => Err(IngestError::EndOfStream),
        }
    }
}

fn config(dir: &Path) -> Config {
    Config {
        storage_path: dir.to_path_buf(),
        width: W,
        height: H,
        frame_rate: 10,
        input_encoding: FrameEncoding::RawBgr,
        sensitivity_percentage: 5.0,
        seconds_between_detection_checks: 0.0,
        pre_roll_secs: 1.0,
        pre_roll_headroom_secs: 1.0,
        post_motion_grace_secs: 0.5,
        min_free_disk_mb: 0,
        shutdown_grace_secs: 1.0,
        ..Config::default()
    }
}

fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    condition()
}

#[test]
fn test_scene_change_records_one_segment() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = ScriptedPipeline::new();

    // 2s dark, then the lights come on and stay on
    let frames: Vec<Frame> = (0..70)
        .map(|i| raw(i as f64 * 0.1, if i < 20 { 0 } else { 200 }))
        .collect();
    let source = SyntheticSource::finite(frames);

    let mut monitor = Monitor::start(&config(dir.path()), Box::new(source), Arc::new(pipeline.clone())).unwrap();
    monitor.wait();

    let streams = pipeline.streams();
    let after: Vec<_> = streams.iter().filter(|s| s.request.part == SegmentPart::After).collect();
    let before: Vec<_> = streams.iter().filter(|s| s.request.part == SegmentPart::Before).collect();
    assert_eq!(after.len(), 1);
    assert_eq!(before.len(), 1);
    assert!(streams.iter().all(|s| s.outcome == StreamOutcome::Finished));
    assert!(!after[0].payloads.is_empty());
    assert!(!before[0].payloads.is_empty());

    let report = monitor.status().last_segment().unwrap();
    assert!(report.after_path.exists());
    assert!(report.before_path.unwrap().exists());
    assert!(report.after_path.starts_with(dir.path()));
    assert_eq!(monitor.status().recording(), RecordingStatus::Idle);
}

#[test]
fn test_shutdown_closes_open_segment() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = ScriptedPipeline::new();

    // Flicker forever: every frame differs from the last
    let mut bright = false;
    let source = SyntheticSource::endless(vec![raw(0.0, 0)], move |ts| {
        bright = !bright;
        Some(raw(ts, if bright { 220 } else { 0 }))
    });

    let mut monitor = Monitor::start(&config(dir.path()), Box::new(source), Arc::new(pipeline.clone())).unwrap();
    let status = monitor.status().clone();
    assert!(wait_for(Duration::from_secs(5), || status.recording() == RecordingStatus::Recording));

    monitor.shutdown();

    let streams = pipeline.streams();
    assert!(!streams.is_empty());
    assert!(streams.iter().all(|s| s.outcome == StreamOutcome::Finished));
    assert!(status.last_segment().is_some());
    assert_eq!(status.recording(), RecordingStatus::Idle);
}

#[test]
fn test_lagging_recording_lane_covers_whole_event() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());
    config.frame_queue_capacity = 256;
    config.detection_queue_capacity = 256;
    let scripted = ScriptedPipeline::new();
    let pipeline = SlowStartPipeline {
        inner: scripted.clone(),
        delay: Duration::from_millis(300),
    };

    // One bright frame at 2.0: motion at 2.0 and 2.1 (back to dark), so
    // with a 0.5s grace the event runs until 2.6
    let frames: Vec<Frame> = (0..40)
        .map(|i| tagged(i as f64 * 0.1, if i == 20 { 220 } else { 0 }))
        .collect();
    let mut monitor = Monitor::start(&config, Box::new(SyntheticSource::finite(frames)), Arc::new(pipeline)).unwrap();
    monitor.wait();

    let streams = scripted.streams();
    let after: Vec<_> = streams.iter().filter(|s| s.request.part == SegmentPart::After).collect();
    let before: Vec<_> = streams.iter().filter(|s| s.request.part == SegmentPart::Before).collect();
    assert_eq!(after.len(), 1);
    assert_eq!(before.len(), 1);
    assert!(streams.iter().all(|s| s.outcome == StreamOutcome::Finished));

    let after_tags = tags(&after[0].payloads);
    let before_tags = tags(&before[0].payloads);
    // Pre-roll reaches back to motion_at - pre_roll_secs
    assert!(before_tags[0] <= 11, "before starts at {}", before_tags[0]);
    // Frames up to stop_recording_after_timestamp stay in the segment even
    // though detection had long cleared the flag when they were recorded
    assert!(*after_tags.last().unwrap() >= 26, "after ends at {:?}", after_tags.last());
    let covered: Vec<u8> = before_tags.iter().chain(after_tags.iter()).copied().collect();
    assert!(covered.windows(2).all(|w| w[1] == w[0] + 1), "gap in {:?}", covered);
}

/// Encoder that never reads its input
#[cfg(unix)]
struct StalledEncoderPipeline;

#[cfg(unix)]
impl EncodingPipeline for StalledEncoderPipeline {
    fn start(&self, request: &StreamRequest) -> Result<EncoderHandle, EncoderError> {
        let mut command = std::process::Command::new("sh");
        command.args(["-c", "exec sleep 300"]);
        let process = lookout_lib::encoding::FfmpegProcess::spawn(command, Duration::from_millis(500))?;
        Ok(EncoderHandle::new(request, Box::new(process)))
    }

    fn container(&self, _input: FrameEncoding) -> ContainerFormat {
        ContainerFormat::Mkv
    }

    fn concat(&self, _before: &Path, _after: &Path, _output: &Path) -> Result<(), EncoderError> {
        Ok(())
    }
}

#[cfg(unix)]
#[test]
fn test_shutdown_with_stalled_encoder_is_bounded() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());
    config.width = 64;
    config.height = 64;
    let frame_bytes = (config.width * config.height * 3) as usize;

    let mut bright = false;
    let source = SyntheticSource::endless(vec![Frame::new(0.0, vec![0; frame_bytes], FrameEncoding::RawBgr)], move |ts| {
        bright = !bright;
        Some(Frame::new(ts, vec![if bright { 220 } else { 0 }; frame_bytes], FrameEncoding::RawBgr))
    });

    let mut monitor = Monitor::start(&config, Box::new(source), Arc::new(StalledEncoderPipeline)).unwrap();
    let status = monitor.status().clone();
    assert!(wait_for(Duration::from_secs(5), || status.recording() == RecordingStatus::Recording));

    let started = Instant::now();
    monitor.shutdown();
    assert!(
        started.elapsed() < Duration::from_secs(10),
        "shutdown took {:?}",
        started.elapsed()
    );
    assert_eq!(status.recording(), RecordingStatus::Idle);
}

#[test]
fn test_stall_is_reported_not_treated_as_quiet() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());
    config.ingest_stall_secs = 0.2;

    let source = SyntheticSource::endless(vec![raw(0.0, 0), raw(0.1, 0)], |_| None);
    let mut monitor = Monitor::start(&config, Box::new(source), Arc::new(ScriptedPipeline::new())).unwrap();
    let status = monitor.status().clone();

    assert!(wait_for(Duration::from_secs(5), || status.snapshot().ingest_stalled));
    assert!(!status.snapshot().motion);
    monitor.shutdown();
}

#[test]
fn test_status_file_written() {
    let dir = tempfile::tempdir().unwrap();
    let status_path = dir.path().join("status.json");
    let mut config = config(dir.path());
    config.status_file = Some(status_path.clone());

    let frames: Vec<Frame> = (0..10).map(|i| raw(i as f64 * 0.1, 0)).collect();
    let mut monitor = Monitor::start(&config, Box::new(SyntheticSource::finite(frames)), Arc::new(ScriptedPipeline::new())).unwrap();
    monitor.wait();

    let written: StatusSnapshot = serde_json::from_str(&std::fs::read_to_string(&status_path).unwrap()).unwrap();
    assert!(!written.motion);
    assert_eq!(written.recording, RecordingStatus::Idle);
}

#[test]
fn test_invalid_config_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());
    config.ignore_regions = vec![[0, 0, W + 1, 4]];

    let source = SyntheticSource::finite(Vec::new());
    assert!(Monitor::start(&config, Box::new(source), Arc::new(ScriptedPipeline::new())).is_err());
}

// Segment lifecycle: decides when to open and close segments
//
// Idle: frames go into the pre-roll buffer.
// Motion starts: the "after" stream is opened and fed the triggering frame.
// Motion continues: frames go to the "after" stream, including every frame
// stamped at or before `stop_recording_after_timestamp`, even if detection
// has already cleared the flag.
// Motion ends: the "after" stream is finished, then the pre-roll from
// `motion_at - pre_roll_secs` is drained into the "before" stream. Only one
// segment is ever open; a new one can only start once the previous one is
// fully closed.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, TimeZone};
use serde::{Deserialize, Serialize};

use super::motion::MotionState;
use super::preroll::PreRollBuffer;
use super::RecordingStatus;
use crate::config::Config;
use crate::encoding::{EncoderError, EncoderHandle, EncoderStats, EncodingPipeline, SegmentPart, StreamRequest};
use crate::status::StatusHandle;
use crate::video::{Frame, FrameEncoding};

/// Log the first warning of a kind, then every Nth
const WARN_EVERY: u64 = 30;

/// What the orchestrator needs from the configuration
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub storage_path: PathBuf,
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub pre_roll_secs: f64,
    pub pre_roll_headroom_secs: f64,
    pub pre_roll_max_bytes: usize,
    pub combine_segments: bool,
    /// 0 disables the free space check
    pub min_free_disk_mb: u64,
}

impl From<&Config> for OrchestratorSettings {
    fn from(config: &Config) -> Self {
        Self {
            storage_path: config.storage_path.clone(),
            width: config.width,
            height: config.height,
            frame_rate: config.frame_rate,
            pre_roll_secs: config.pre_roll_secs,
            pre_roll_headroom_secs: config.pre_roll_headroom_secs,
            pre_roll_max_bytes: config.pre_roll_max_bytes,
            combine_segments: config.combine_segments,
            min_free_disk_mb: config.min_free_disk_mb,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentState {
    /// Created, "after" stream not yet fed
    Buffering,
    Recording,
    /// Encoders are being finished
    Closing,
}

/// The one open segment
pub struct Segment {
    pub id: String,
    pub state: SegmentState,
    pub motion_at_timestamp: f64,
    pub before_path: PathBuf,
    pub after_path: PathBuf,
    input: FrameEncoding,
    after: Option<EncoderHandle>,
}

/// Summary of a closed segment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentReport {
    pub id: String,
    pub motion_at_timestamp: f64,
    /// `None` when there was no pre-roll or writing it failed
    pub before_path: Option<PathBuf>,
    pub after_path: PathBuf,
    /// Set once the before/after pair has been joined
    pub combined_path: Option<PathBuf>,
    pub before_frames: u64,
    pub after_frames: u64,
    pub before_secs: f64,
    pub after_secs: f64,
}

/// Segment id: local start time plus geometry, e.g. `20240611143005_1920x1088x30`
pub fn segment_id(timestamp: f64, width: u32, height: u32, frame_rate: u32) -> String {
    let secs = timestamp.floor() as i64;
    let stamp = Local
        .timestamp_opt(secs, 0)
        .single()
        .map(|t| t.format("%Y%m%d%H%M%S").to_string())
        .unwrap_or_else(|| format!("{:014}", secs.max(0)));
    format!("{}_{}x{}x{}", stamp, width, height, frame_rate)
}

/// Free space in MiB on the filesystem holding `path`
fn available_disk_mb(path: &Path) -> Option<u64> {
    let mut target = path.to_path_buf();
    while !target.exists() {
        target = target.parent()?.to_path_buf();
    }
    let target = target.canonicalize().ok()?;

    let disks = sysinfo::Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .filter(|disk| target.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| disk.available_space() / (1024 * 1024))
}

/// Delete what an aborted stream left behind
fn remove_partial(id: &str, path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            log::warn!("[{}] Failed to remove partial {}: {}", id, path.display(), e);
        }
    }
}

pub struct RecordingOrchestrator {
    settings: OrchestratorSettings,
    pipeline: Arc<dyn EncodingPipeline>,
    status: StatusHandle,
    preroll: PreRollBuffer,
    segment: Option<Segment>,
    /// A segment for the current motion event failed; wait for motion to clear
    suppressed: bool,
    last_timestamp: Option<f64>,
    out_of_order_drops: u64,
    overflow_reports: u64,
    concat_threads: Vec<std::thread::JoinHandle<()>>,
}

impl RecordingOrchestrator {
    pub fn new(settings: OrchestratorSettings, pipeline: Arc<dyn EncodingPipeline>, status: StatusHandle) -> Self {
        let preroll = PreRollBuffer::new(
            settings.pre_roll_secs,
            settings.pre_roll_headroom_secs,
            settings.pre_roll_max_bytes,
        );
        Self {
            settings,
            pipeline,
            status,
            preroll,
            segment: None,
            suppressed: false,
            last_timestamp: None,
            out_of_order_drops: 0,
            overflow_reports: 0,
            concat_threads: Vec::new(),
        }
    }

    /// Handle one frame together with the motion state it was seen under.
    ///
    /// Returns the report of a segment this frame closed.
    pub fn on_frame(&mut self, frame: Arc<Frame>, motion: MotionState) -> Option<SegmentReport> {
        if let Some(last) = self.last_timestamp {
            if frame.timestamp <= last {
                self.out_of_order_drops += 1;
                if self.out_of_order_drops == 1 || self.out_of_order_drops % WARN_EVERY == 0 {
                    log::warn!(
                        "Dropping frame at {:.3}: not after previous frame at {:.3} ({} dropped so far)",
                        frame.timestamp,
                        last,
                        self.out_of_order_drops
                    );
                }
                return None;
            }
        }
        self.last_timestamp = Some(frame.timestamp);

        let in_motion = Self::within_motion(&frame, &motion);
        if self.segment.is_none() {
            if !in_motion {
                self.suppressed = false;
            } else if !self.suppressed {
                self.open_segment(frame, motion);
                return None;
            }
            self.buffer(frame);
            return None;
        }

        if in_motion {
            self.feed_after(frame);
            None
        } else {
            let report = self.close_segment(None);
            // The frame that ended the segment starts the next pre-roll
            self.buffer(frame);
            report
        }
    }

    /// Whether `frame` belongs to a motion event: the flag is set, or the
    /// frame is stamped inside the published event even though detection
    /// has since cleared the flag.
    fn within_motion(frame: &Frame, motion: &MotionState) -> bool {
        motion.motion_detected
            || (motion.motion_at_timestamp > 0.0
                && frame.timestamp >= motion.motion_at_timestamp
                && frame.timestamp <= motion.stop_recording_after_timestamp)
    }

    fn buffer(&mut self, frame: Arc<Frame>) {
        if let Some(overflow) = self.preroll.append(frame) {
            self.overflow_reports += 1;
            if self.overflow_reports == 1 || self.overflow_reports % WARN_EVERY == 0 {
                log::warn!("{} ({} times so far)", overflow, self.overflow_reports);
            }
        }
    }

    fn request(&self, id: &str, part: SegmentPart, output_path: PathBuf, input: FrameEncoding) -> StreamRequest {
        StreamRequest {
            segment_id: id.to_string(),
            part,
            output_path,
            width: self.settings.width,
            height: self.settings.height,
            frame_rate: self.settings.frame_rate,
            input,
        }
    }

    /// Output paths for a new segment, made unique within the day directory
    fn segment_paths(&self, motion_at: f64, input: FrameEncoding) -> (String, PathBuf, PathBuf) {
        let base = segment_id(motion_at, self.settings.width, self.settings.height, self.settings.frame_rate);
        let day_dir = self.settings.storage_path.join(&base[..8.min(base.len())]);
        let ext = self.pipeline.container(input).extension();

        let mut id = base.clone();
        let mut n = 1;
        while day_dir.join(format!("{}_after.{}", id, ext)).exists() {
            n += 1;
            id = format!("{}-{}", base, n);
        }
        let before = day_dir.join(format!("{}_before.{}", id, ext));
        let after = day_dir.join(format!("{}_after.{}", id, ext));
        (id, before, after)
    }

    fn open_segment(&mut self, frame: Arc<Frame>, motion: MotionState) {
        let motion_at = if motion.motion_at_timestamp > 0.0 {
            motion.motion_at_timestamp
        } else {
            frame.timestamp
        };
        let (id, before_path, after_path) = self.segment_paths(motion_at, frame.encoding);

        if self.settings.min_free_disk_mb > 0 {
            if let Some(free_mb) = available_disk_mb(&self.settings.storage_path) {
                if free_mb < self.settings.min_free_disk_mb {
                    log::warn!(
                        "[{}] Not recording: {} MiB free, need {} MiB",
                        id,
                        free_mb,
                        self.settings.min_free_disk_mb
                    );
                    self.suppressed = true;
                    self.buffer(frame);
                    return;
                }
            }
        }

        let request = self.request(&id, SegmentPart::After, after_path.clone(), frame.encoding);
        let handle = match self.pipeline.start(&request) {
            Ok(handle) => handle,
            Err(e) => {
                log::warn!("[{}] Could not open segment, skipping this motion event: {}", id, e);
                self.suppressed = true;
                self.buffer(frame);
                return;
            }
        };

        log::info!("[{}] Motion detected, recording to {}", id, after_path.display());
        self.segment = Some(Segment {
            id,
            state: SegmentState::Buffering,
            motion_at_timestamp: motion_at,
            before_path,
            after_path,
            input: frame.encoding,
            after: Some(handle),
        });
        self.status.set_recording(RecordingStatus::Recording);
        self.feed_after(frame);
    }

    fn feed_after(&mut self, frame: Arc<Frame>) {
        let result = match self.segment.as_mut() {
            Some(segment) => match segment.after.as_mut() {
                Some(handle) => {
                    let result = handle.feed(&frame);
                    if result.is_ok() {
                        segment.state = SegmentState::Recording;
                    }
                    result
                }
                None => Ok(()),
            },
            None => Ok(()),
        };

        if let Err(e) = result {
            self.fail_segment(e);
            self.buffer(frame);
        }
    }

    /// Abort the open segment after a feed failure and wait for motion to clear.
    fn fail_segment(&mut self, error: EncoderError) {
        let Some(mut segment) = self.segment.take() else { return };
        log::warn!("[{}] Segment aborted: {}", segment.id, error);

        if let Some(handle) = segment.after.take() {
            handle.abort();
        }
        remove_partial(&segment.id, &segment.after_path);

        self.preroll.clear();
        self.suppressed = true;
        self.status.set_recording(RecordingStatus::Idle);
    }

    fn finish_handle(handle: EncoderHandle, grace: Option<Duration>) -> Result<EncoderStats, EncoderError> {
        match grace {
            Some(grace) => handle.finish_within(grace),
            None => handle.finish(),
        }
    }

    /// Write the pre-roll into the "before" stream.
    fn write_before(&mut self, segment: &Segment, grace: Option<Duration>) -> Option<EncoderStats> {
        if self.preroll.is_empty() {
            return None;
        }

        let request = self.request(&segment.id, SegmentPart::Before, segment.before_path.clone(), segment.input);
        let mut handle = match self.pipeline.start(&request) {
            Ok(handle) => handle,
            Err(e) => {
                log::warn!("[{}] Pre-roll lost, could not open before stream: {}", segment.id, e);
                self.preroll.clear();
                return None;
            }
        };

        let window_start = segment.motion_at_timestamp - self.settings.pre_roll_secs;
        match self.preroll.drain_to(window_start, |frame| handle.feed(frame)) {
            Ok(0) => {
                handle.abort();
                remove_partial(&segment.id, &segment.before_path);
                None
            }
            Ok(_) => match Self::finish_handle(handle, grace) {
                Ok(stats) => Some(stats),
                Err(e) => {
                    log::warn!("[{}] Before stream failed to finish: {}", segment.id, e);
                    None
                }
            },
            Err(e) => {
                log::warn!("[{}] Pre-roll lost while writing: {}", segment.id, e);
                handle.abort();
                remove_partial(&segment.id, &segment.before_path);
                None
            }
        }
    }

    /// Finish the open segment: "after" first, then the pre-roll as "before".
    fn close_segment(&mut self, grace: Option<Duration>) -> Option<SegmentReport> {
        let mut segment = self.segment.take()?;
        segment.state = SegmentState::Closing;
        self.status.set_recording(RecordingStatus::Stopping);
        log::info!("[{}] Motion over, closing segment", segment.id);

        let mut after_frames = 0;
        let mut after_secs = 0.0;
        if let Some(handle) = segment.after.take() {
            after_frames = handle.stats().0;
            match Self::finish_handle(handle, grace) {
                Ok(stats) => after_secs = stats.media_secs(),
                Err(e) => log::warn!("[{}] After stream did not finish cleanly: {}", segment.id, e),
            }
        }

        let before = self.write_before(&segment, grace);
        let report = SegmentReport {
            id: segment.id.clone(),
            motion_at_timestamp: segment.motion_at_timestamp,
            before_path: before.as_ref().map(|_| segment.before_path.clone()),
            after_path: segment.after_path.clone(),
            combined_path: None,
            before_frames: before.as_ref().map_or(0, |s| s.frames_encoded),
            after_frames,
            before_secs: before.as_ref().map_or(0.0, |s| s.media_secs()),
            after_secs,
        };

        log::info!(
            "[{}] Segment closed: {} before frames ({:.1}s), {} after frames ({:.1}s)",
            report.id,
            report.before_frames,
            report.before_secs,
            report.after_frames,
            report.after_secs
        );

        self.status.set_last_segment(report.clone());
        if self.settings.combine_segments && report.before_path.is_some() {
            self.spawn_concat(&report, segment.input);
        }
        self.status.set_recording(RecordingStatus::Idle);
        Some(report)
    }

    fn spawn_concat(&mut self, report: &SegmentReport, input: FrameEncoding) {
        self.reap_concat_threads();

        let Some(before) = report.before_path.clone() else { return };
        let after = report.after_path.clone();
        let ext = self.pipeline.container(input).extension();
        let combined = after.with_file_name(format!("{}.{}", report.id, ext));
        let pipeline = self.pipeline.clone();
        let status = self.status.clone();
        let mut report = report.clone();

        let spawned = std::thread::Builder::new()
            .name("lookout-concat".into())
            .spawn(move || match pipeline.concat(&before, &after, &combined) {
                Ok(()) => {
                    report.combined_path = Some(combined);
                    if status.last_segment().map_or(false, |last| last.id == report.id) {
                        status.set_last_segment(report);
                    }
                }
                Err(e) => log::warn!("[{}] Failed to combine before and after: {}", report.id, e),
            });

        match spawned {
            Ok(handle) => self.concat_threads.push(handle),
            Err(e) => log::warn!("Failed to spawn concat thread: {}", e),
        }
    }

    fn reap_concat_threads(&mut self) {
        let (finished, running): (Vec<_>, Vec<_>) =
            self.concat_threads.drain(..).partition(|handle| handle.is_finished());
        for handle in finished {
            let _ = handle.join();
        }
        self.concat_threads = running;
    }

    /// Close any open segment, giving each encoder `grace` to flush before it
    /// is killed, and wait for pending concatenations.
    pub fn shutdown(&mut self, grace: Duration) -> Option<SegmentReport> {
        let report = self.close_segment(Some(grace));
        for handle in self.concat_threads.drain(..) {
            let _ = handle.join();
        }
        self.status.set_recording(RecordingStatus::Idle);
        report
    }

    pub fn is_recording(&self) -> bool {
        self.segment.is_some()
    }

    pub fn segment(&self) -> Option<&Segment> {
        self.segment.as_ref()
    }

    pub fn preroll(&self) -> &PreRollBuffer {
        &self.preroll
    }
}

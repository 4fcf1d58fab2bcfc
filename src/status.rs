// Read-only status for external monitoring (HTTP layer, status file)

use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::recording::motion::SharedMotionState;
use crate::recording::orchestrator::SegmentReport;
use crate::recording::RecordingStatus;
use crate::video::Frame;

/// Point-in-time status, serialized as `{"motion": .., "motionAtTimestamp": .., ...}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub motion: bool,
    pub motion_at_timestamp: f64,
    pub recording: RecordingStatus,
    pub ingest_stalled: bool,
}

#[derive(Default)]
struct StatusInner {
    recording: RecordingStatus,
    ingest_stalled: bool,
    last_segment: Option<SegmentReport>,
    latest_still: Option<Arc<Frame>>,
}

/// Shared status handle. Lanes write, everyone else reads.
#[derive(Clone, Default)]
pub struct StatusHandle {
    motion: SharedMotionState,
    inner: Arc<RwLock<StatusInner>>,
}

impl StatusHandle {
    pub fn new(motion: SharedMotionState) -> Self {
        Self {
            motion,
            inner: Arc::default(),
        }
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let motion = self.motion.snapshot();
        let inner = self.inner.read();
        StatusSnapshot {
            motion: motion.motion_detected,
            motion_at_timestamp: motion.motion_at_timestamp,
            recording: inner.recording,
            ingest_stalled: inner.ingest_stalled,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(&self.snapshot())
    }

    /// Write the snapshot as JSON, replacing `path` atomically.
    pub fn write_json(&self, path: &Path) -> std::io::Result<()> {
        let json = self.to_json().map_err(std::io::Error::other)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)
    }

    /// Raw bytes of the most recent sampled frame
    pub fn latest_still(&self) -> Option<Arc<Frame>> {
        self.inner.read().latest_still.clone()
    }

    pub fn last_segment(&self) -> Option<SegmentReport> {
        self.inner.read().last_segment.clone()
    }

    pub fn motion(&self) -> &SharedMotionState {
        &self.motion
    }

    pub fn recording(&self) -> RecordingStatus {
        self.inner.read().recording
    }

    pub fn set_recording(&self, status: RecordingStatus) {
        self.inner.write().recording = status;
    }

    pub fn set_ingest_stalled(&self, stalled: bool) {
        self.inner.write().ingest_stalled = stalled;
    }

    pub fn set_latest_still(&self, frame: Arc<Frame>) {
        self.inner.write().latest_still = Some(frame);
    }

    pub fn set_last_segment(&self, report: SegmentReport) {
        self.inner.write().last_segment = Some(report);
    }
}

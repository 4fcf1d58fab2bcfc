// Recording modules

pub mod monitor;
pub mod motion;
pub mod orchestrator;
pub mod preroll;

pub use monitor::{CancellationToken, Monitor};
pub use motion::{DetectError, IgnoreMask, MotionDetector, MotionState, SharedMotionState};
pub use orchestrator::{RecordingOrchestrator, SegmentReport};
pub use preroll::{BufferOverflow, PreRollBuffer};

use serde::{Deserialize, Serialize};

/// Current recording state
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RecordingStatus {
    /// Waiting for motion, filling the pre-roll
    #[default]
    Idle,
    /// Currently recording
    Recording,
    /// Closing a segment (finishing encoders, writing the pre-roll)
    Stopping,
}

// Video frame types and frame ingest
//
// A `Frame` is produced once by a `FrameSource` and then shared read-only
// (as `Arc<Frame>`) between the detection lane, the pre-roll buffer and the
// encoder. Nothing downstream mutates a frame.

pub mod decode;
pub mod mjpeg;

pub use mjpeg::MjpegStreamSource;

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Encoding of a frame's payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameEncoding {
    /// Packed 8-bit BGR, `width * height * 3` bytes
    RawBgr,
    /// One complete JPEG image (SOI .. EOI)
    Jpeg,
    /// One H.264 access unit in Annex B byte-stream format
    H264Unit,
}

impl FrameEncoding {
    /// Whether every frame of this encoding can be decoded on its own
    pub fn is_intra_only(&self) -> bool {
        match self {
            FrameEncoding::RawBgr | FrameEncoding::Jpeg => true,
            FrameEncoding::H264Unit => false,
        }
    }
}

impl fmt::Display for FrameEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FrameEncoding::RawBgr => "raw-bgr",
            FrameEncoding::Jpeg => "jpeg",
            FrameEncoding::H264Unit => "h264",
        };
        f.write_str(name)
    }
}

/// A single captured frame
#[derive(Debug, Clone)]
pub struct Frame {
    /// Capture time in seconds. Sources in this crate use wall-clock seconds
    /// since the UNIX epoch; downstream only relies on them never decreasing.
    pub timestamp: f64,
    /// Encoded (or raw) frame bytes
    pub payload: Vec<u8>,
    pub encoding: FrameEncoding,
    /// Whether a decoder can start at this frame. Always true for intra-only
    /// encodings; for H.264 it marks an IDR access unit.
    pub keyframe: bool,
}

impl Frame {
    /// `keyframe` is derived from the payload: always set for intra-only
    /// encodings, set for H.264 when the access unit carries an IDR or SPS.
    pub fn new(timestamp: f64, payload: Vec<u8>, encoding: FrameEncoding) -> Self {
        let keyframe = encoding.is_intra_only() || h264_contains_idr(&payload);
        Self {
            timestamp,
            payload,
            encoding,
            keyframe,
        }
    }

    /// An H.264 access unit
    pub fn h264(timestamp: f64, payload: Vec<u8>) -> Self {
        Self::new(timestamp, payload, FrameEncoding::H264Unit)
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Scan an Annex B byte stream for an IDR slice (NAL type 5) or SPS (type 7).
fn h264_contains_idr(data: &[u8]) -> bool {
    let mut i = 0;
    while i + 3 < data.len() {
        let start_code_len = if data[i..].starts_with(&[0, 0, 1]) {
            3
        } else if data[i..].starts_with(&[0, 0, 0, 1]) {
            4
        } else {
            i += 1;
            continue;
        };
        if let Some(header) = data.get(i + start_code_len) {
            let nal_type = header & 0x1F;
            if nal_type == 5 || nal_type == 7 {
                return true;
            }
        }
        i += start_code_len;
    }
    false
}

/// Current wall-clock time as fractional seconds since the UNIX epoch
pub fn wall_clock_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Error type for frame ingest
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("Frame source reached end of stream")]
    EndOfStream,

    #[error("Failed to start capture command: {0}")]
    Spawn(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A continuous sequence of timestamped frames.
///
/// Implementations must not block longer than `timeout`; returning
/// `Ok(None)` means no frame arrived in time (the ingest lane turns a run of
/// those into an ingest-stall report, never into "no motion").
pub trait FrameSource: Send {
    fn next_frame(&mut self, timeout: Duration) -> Result<Option<Frame>, IngestError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_h264_keyframe_detection() {
        // SPS + IDR slice
        let idr = vec![0, 0, 0, 1, 0x67, 0x42, 0, 0, 0, 1, 0x65, 0x88];
        assert!(Frame::h264(0.0, idr).keyframe);

        // Non-IDR slice only
        let p_frame = vec![0, 0, 0, 1, 0x41, 0x9a, 0x00];
        assert!(!Frame::h264(0.0, p_frame).keyframe);

        // Three-byte start code
        let short = vec![0, 0, 1, 0x65, 0x11];
        assert!(Frame::h264(0.0, short).keyframe);
    }

    #[test]
    fn test_intra_only_encodings() {
        assert!(FrameEncoding::RawBgr.is_intra_only());
        assert!(FrameEncoding::Jpeg.is_intra_only());
        assert!(!FrameEncoding::H264Unit.is_intra_only());
        assert!(Frame::new(1.0, vec![1, 2, 3], FrameEncoding::Jpeg).keyframe);
        // Payload bytes that look like an H.264 slice do not matter for JPEG
        assert!(Frame::new(1.0, vec![0, 0, 1, 0x41], FrameEncoding::Jpeg).keyframe);
        // H.264 keyframes are derived the same way through either constructor
        assert!(!Frame::new(1.0, vec![0, 0, 1, 0x41, 0x9a], FrameEncoding::H264Unit).keyframe);
        assert!(Frame::new(1.0, vec![0, 0, 1, 0x65, 0x88], FrameEncoding::H264Unit).keyframe);
    }
}

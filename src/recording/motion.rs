// Frame-differencing motion detection
//
// Each sampled frame is reduced to a luma plane and compared with a reference
// plane. Pixels whose brightness moved by more than PIXEL_DELTA_THRESHOLD
// count as changed (value 255); ignored pixels never count. Motion is
// signalled when the sum of changed values exceeds the cutoff.
//
// The reference plane is replaced only when motion is signalled. A scene that
// changes slowly (dusk, clouds) therefore accumulates difference against a
// stale reference until it crosses the cutoff once, after which the
// reference catches up. Sub-threshold drift spread over many frames is never
// reported on its own.

use std::sync::Arc;

use ndarray::{Array2, Zip};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::config::{check_region, Config, ConfigError, Region};
use crate::video::{decode, Frame, FrameEncoding};

/// A pixel changed if its luma moved by more than this (0-255 scale)
pub const PIXEL_DELTA_THRESHOLD: u8 = 25;

/// Value of a changed pixel after thresholding
const CHANGED: u64 = 255;

/// Error type for per-frame detection failures
#[derive(Debug, thiserror::Error)]
pub enum DetectError {
    #[error("Frames encoded as {0} cannot be decoded for detection")]
    UnsupportedEncoding(FrameEncoding),

    #[error("Raw frame is {actual} bytes, expected {expected}")]
    PayloadSize { expected: usize, actual: usize },

    #[error("Frame is {actual_width}x{actual_height}, detector configured for {expected_width}x{expected_height}")]
    DimensionMismatch {
        expected_width: u32,
        expected_height: u32,
        actual_width: u32,
        actual_height: u32,
    },

    #[error("Failed to decode frame: {0}")]
    Decode(String),
}

/// Pixels that take part in motion detection (`false` = ignored)
#[derive(Debug, Clone)]
pub struct IgnoreMask(Array2<bool>);

impl IgnoreMask {
    /// Build a `height x width` mask with every region switched off.
    pub fn build(width: u32, height: u32, regions: &[Region]) -> Result<Self, ConfigError> {
        if width == 0 || height == 0 {
            return Err(ConfigError::InvalidGeometry { width, height });
        }
        let mut mask = Array2::from_elem((height as usize, width as usize), true);
        for region in regions {
            check_region(region, width, height)?;
            let [x0, y0, x1, y1] = region.map(|v| v as usize);
            mask.slice_mut(ndarray::s![y0..y1, x0..x1]).fill(false);
        }
        Ok(Self(mask))
    }

    /// Number of pixels that take part in detection
    pub fn active_pixels(&self) -> usize {
        self.0.iter().filter(|&&keep| keep).count()
    }

    pub fn is_active(&self, x: usize, y: usize) -> bool {
        self.0[[y, x]]
    }

    pub fn as_array(&self) -> &Array2<bool> {
        &self.0
    }
}

/// Motion bookkeeping published to the rest of the pipeline
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MotionState {
    pub motion_detected: bool,
    /// Timestamp of the last frame that showed motion (0 until the first one)
    pub motion_at_timestamp: f64,
    /// Motion is considered over once a frame is observed after this time
    pub stop_recording_after_timestamp: f64,
}

/// Lock-protected `MotionState` shared between the detection lane (writer)
/// and everyone else (readers). Always read and written as a whole.
#[derive(Debug, Clone, Default)]
pub struct SharedMotionState(Arc<RwLock<MotionState>>);

impl SharedMotionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MotionState {
        *self.0.read()
    }

    pub fn publish(&self, state: MotionState) {
        *self.0.write() = state;
    }
}

pub struct MotionDetector {
    width: u32,
    height: u32,
    mask: IgnoreMask,
    cutoff: u64,
    stop_delay_secs: f64,
    /// Luma of the last frame that showed motion (or the first frame)
    reference: Array2<u8>,
    has_reference: bool,
    /// Decode target for the frame under test, swapped with `reference` on motion
    scratch: Array2<u8>,
    state: MotionState,
}

impl MotionDetector {
    /// Build a detector for `width x height` frames.
    ///
    /// `sensitivity_percentage` is the share of all pixels (0-100) that must
    /// change for a frame to count as motion. `stop_delay_secs` is how long
    /// motion stays signalled after the last frame that showed it.
    pub fn configure(
        width: u32,
        height: u32,
        ignore_regions: &[Region],
        sensitivity_percentage: f64,
        stop_delay_secs: f64,
    ) -> Result<Self, ConfigError> {
        if !(0.0..=100.0).contains(&sensitivity_percentage) {
            return Err(ConfigError::Sensitivity(sensitivity_percentage));
        }
        if !stop_delay_secs.is_finite() || stop_delay_secs < 0.0 {
            return Err(ConfigError::InvalidField {
                field: "post_motion_grace_secs",
                reason: format!("{} is not a non-negative number of seconds", stop_delay_secs),
            });
        }

        let mask = IgnoreMask::build(width, height, ignore_regions)?;
        let pixels = width as u64 * height as u64;
        let cutoff = (pixels as f64 * sensitivity_percentage / 100.0).floor() as u64 * CHANGED;
        let shape = (height as usize, width as usize);

        log::debug!(
            "Motion detector {}x{}: cutoff {} ({} changed pixels), {} of {} pixels active",
            width,
            height,
            cutoff,
            cutoff / CHANGED,
            mask.active_pixels(),
            pixels
        );

        Ok(Self {
            width,
            height,
            mask,
            cutoff,
            stop_delay_secs,
            reference: Array2::zeros(shape),
            has_reference: false,
            scratch: Array2::zeros(shape),
            state: MotionState::default(),
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        Self::configure(
            config.width,
            config.height,
            &config.ignore_regions,
            config.sensitivity_percentage,
            config.post_motion_grace_secs,
        )
    }

    /// Decode `frame` and run one detection step. Returns whether motion is
    /// currently signalled.
    pub fn observe(&mut self, frame: &Frame) -> Result<bool, DetectError> {
        decode::decode_luma_into(frame, &mut self.scratch)?;
        Ok(self.step(frame.timestamp))
    }

    /// Run one detection step on an already decoded luma plane.
    pub fn observe_luma(&mut self, timestamp: f64, luma: &Array2<u8>) -> Result<bool, DetectError> {
        if luma.dim() != self.scratch.dim() {
            let (actual_height, actual_width) = luma.dim();
            return Err(DetectError::DimensionMismatch {
                expected_width: self.width,
                expected_height: self.height,
                actual_width: actual_width as u32,
                actual_height: actual_height as u32,
            });
        }
        self.scratch.assign(luma);
        Ok(self.step(timestamp))
    }

    fn step(&mut self, now: f64) -> bool {
        if !self.has_reference {
            std::mem::swap(&mut self.reference, &mut self.scratch);
            self.has_reference = true;
            return false;
        }

        let changed = self.changed_sum();
        if changed > self.cutoff {
            self.state.motion_detected = true;
            self.state.motion_at_timestamp = self.state.motion_at_timestamp.max(now);
            self.state.stop_recording_after_timestamp = now + self.stop_delay_secs;
            std::mem::swap(&mut self.reference, &mut self.scratch);
            log::debug!("Motion at {:.3}: {} > {}", now, changed, self.cutoff);
        } else if self.state.motion_detected && now > self.state.stop_recording_after_timestamp {
            self.state.motion_detected = false;
            log::debug!("Motion cleared at {:.3}", now);
        }

        self.state.motion_detected
    }

    /// Sum of thresholded differences between scratch and reference
    fn changed_sum(&self) -> u64 {
        Zip::from(&self.reference)
            .and(&self.scratch)
            .and(self.mask.as_array())
            .fold(0u64, |sum, &reference, &current, &active| {
                if active && reference.abs_diff(current) > PIXEL_DELTA_THRESHOLD {
                    sum + CHANGED
                } else {
                    sum
                }
            })
    }

    pub fn state(&self) -> MotionState {
        self.state
    }

    /// Sum of thresholded pixel values that must be exceeded
    pub fn cutoff(&self) -> u64 {
        self.cutoff
    }

    pub fn mask(&self) -> &IgnoreMask {
        &self.mask
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const W: u32 = 10;
    const H: u32 = 10;

    /// 5% of 100 pixels: cutoff is 5 * 255
    fn detector(regions: &[Region]) -> MotionDetector {
        MotionDetector::configure(W, H, regions, 5.0, 2.0).unwrap()
    }

    fn plane(value: u8) -> Array2<u8> {
        Array2::from_elem((H as usize, W as usize), value)
    }

    /// Copy of `base` with the first `n` pixels (row-major) brightened by 100
    fn with_changed(base: &Array2<u8>, n: usize) -> Array2<u8> {
        let mut out = base.clone();
        for v in out.iter_mut().take(n) {
            *v = v.saturating_add(100);
        }
        out
    }

    #[test]
    fn test_cutoff_formula() {
        assert_eq!(detector(&[]).cutoff(), 5 * 255);
        // floor(1920 * 1088 * 0.2 / 100) = 4177
        let d = MotionDetector::configure(1920, 1088, &[], 0.2, 2.0).unwrap();
        assert_eq!(d.cutoff(), 4177 * 255);
    }

    #[test]
    fn test_first_frame_is_reference() {
        let mut d = detector(&[]);
        assert!(!d.observe_luma(0.0, &plane(0)).unwrap());
        assert!(!d.state().motion_detected);
    }

    #[test]
    fn test_static_scene_never_triggers() {
        let mut d = detector(&[]);
        let base = plane(80);
        for i in 0..20 {
            assert!(!d.observe_luma(i as f64 * 0.1, &base).unwrap());
        }
    }

    #[test]
    fn test_boundary_is_exact() {
        let base = plane(40);
        let mut d = detector(&[]);
        d.observe_luma(0.0, &base).unwrap();
        assert!(!d.observe_luma(0.1, &with_changed(&base, 5)).unwrap());

        let mut d = detector(&[]);
        d.observe_luma(0.0, &base).unwrap();
        assert!(d.observe_luma(0.1, &with_changed(&base, 6)).unwrap());
    }

    #[test]
    fn test_delta_threshold_is_strict() {
        let base = plane(100);
        let mut d = detector(&[]);
        d.observe_luma(0.0, &base).unwrap();
        // Every pixel moved by exactly 25: not a change
        assert!(!d.observe_luma(0.1, &plane(125)).unwrap());
        assert!(d.observe_luma(0.2, &plane(126)).unwrap());
    }

    #[test]
    fn test_ignored_region_never_triggers() {
        // Top three rows ignored
        let mut d = detector(&[[0, 0, W, 3]]);
        let base = plane(0);
        d.observe_luma(0.0, &base).unwrap();

        let mut noisy = base.clone();
        noisy.slice_mut(ndarray::s![0..3, ..]).fill(255);
        for i in 1..10 {
            assert!(!d.observe_luma(i as f64, &noisy).unwrap());
        }

        // Row 3 is outside the half-open region
        noisy.slice_mut(ndarray::s![3, ..]).fill(255);
        assert!(d.observe_luma(10.0, &noisy).unwrap());
    }

    #[test]
    fn test_mask_is_half_open() {
        let d = detector(&[[2, 1, 4, 3]]);
        let mask = d.mask();
        assert!(!mask.is_active(2, 1));
        assert!(!mask.is_active(3, 2));
        assert!(mask.is_active(4, 2));
        assert!(mask.is_active(2, 3));
        assert_eq!(mask.active_pixels(), 100 - 4);
    }

    #[test]
    fn test_region_out_of_bounds_rejected() {
        assert!(matches!(
            MotionDetector::configure(W, H, &[[0, 0, W + 1, 1]], 5.0, 2.0),
            Err(ConfigError::RegionOutOfBounds { .. })
        ));
        assert!(matches!(
            MotionDetector::configure(W, H, &[], 101.0, 2.0),
            Err(ConfigError::Sensitivity(_))
        ));
    }

    #[test]
    fn test_idempotent_without_motion() {
        let base = plane(10);
        let below = with_changed(&base, 3);
        let mut d = detector(&[]);
        d.observe_luma(0.0, &base).unwrap();
        let first = d.observe_luma(0.1, &below).unwrap();
        let second = d.observe_luma(0.2, &below).unwrap();
        assert_eq!(first, second);
        assert!(!first);
    }

    #[test]
    fn test_grace_period_and_motion_at() {
        let base = plane(0);
        let moved = plane(200);
        let mut d = detector(&[]);
        d.observe_luma(0.0, &base).unwrap();
        assert!(d.observe_luma(1.0, &moved).unwrap());
        assert_eq!(d.state().motion_at_timestamp, 1.0);
        assert_eq!(d.state().stop_recording_after_timestamp, 3.0);

        // Reference is now `moved`; identical frames keep motion on until the grace ends
        assert!(d.observe_luma(2.0, &moved).unwrap());
        assert!(d.observe_luma(3.0, &moved).unwrap());
        assert!(!d.observe_luma(3.01, &moved).unwrap());

        let state = d.state();
        assert!(!state.motion_detected);
        assert_eq!(state.motion_at_timestamp, 1.0);
    }

    #[test]
    fn test_new_motion_extends_grace() {
        let mut d = detector(&[]);
        d.observe_luma(0.0, &plane(0)).unwrap();
        assert!(d.observe_luma(1.0, &plane(200)).unwrap());
        assert!(d.observe_luma(2.5, &plane(0)).unwrap());
        assert_eq!(d.state().stop_recording_after_timestamp, 4.5);
        assert!(d.observe_luma(4.0, &plane(0)).unwrap());
        assert!(!d.observe_luma(4.6, &plane(0)).unwrap());
    }

    #[test]
    fn test_reference_only_updates_on_motion() {
        let base = plane(50);
        let mut d = detector(&[]);
        d.observe_luma(0.0, &base).unwrap();
        // Drift of 20 per step: each step is below the per-pixel threshold
        // against its predecessor, but the second one is not against `base`
        assert!(!d.observe_luma(0.1, &plane(70)).unwrap());
        assert!(d.observe_luma(0.2, &plane(90)).unwrap());
        // Reference caught up to 90, so 110 is no change and the grace runs out
        assert!(!d.observe_luma(3.0, &plane(110)).unwrap());
    }

    #[test]
    fn test_dimension_mismatch() {
        let mut d = detector(&[]);
        let err = d.observe_luma(0.0, &Array2::zeros((4, 4))).unwrap_err();
        assert!(matches!(err, DetectError::DimensionMismatch { actual_width: 4, .. }));
    }

    #[test]
    fn test_observe_raw_frame() {
        let mut d = detector(&[]);
        let black = Frame::new(0.0, vec![0u8; (W * H * 3) as usize], FrameEncoding::RawBgr);
        let white = Frame::new(0.5, vec![255u8; (W * H * 3) as usize], FrameEncoding::RawBgr);
        assert!(!d.observe(&black).unwrap());
        assert!(d.observe(&white).unwrap());
        assert!(matches!(
            d.observe(&Frame::h264(1.0, vec![0, 0, 1, 0x65])),
            Err(DetectError::UnsupportedEncoding(FrameEncoding::H264Unit))
        ));
    }

    #[test]
    fn test_shared_state_snapshot() {
        let shared = SharedMotionState::new();
        let reader = shared.clone();
        let state = MotionState {
            motion_detected: true,
            motion_at_timestamp: 12.5,
            stop_recording_after_timestamp: 14.5,
        };
        shared.publish(state);
        assert_eq!(reader.snapshot(), state);
    }
}

//! Encoder preset system for real-time video encoding
//!
//! This module provides 5 quality preset levels (1–5) for every encoder the
//! recorder can drive through ffmpeg. All presets are designed for real-time
//! encoding on the capture host:
//!
//! - **Level 1**: Lightest, minimal CPU load, lowest quality
//! - **Level 2**: Light, low resource usage, acceptable quality
//! - **Level 3**: Balanced, moderate resources, good quality (default)
//! - **Level 4**: Quality, higher resource usage, very good quality
//! - **Level 5**: Maximum, highest quality feasible in real-time
//!
//! ## Adding presets for a new encoder
//!
//! 1. Add a new `<encoder>_args()` function in this file, following the
//!    pattern of existing ones (match on `level`, emit ffmpeg options).
//! 2. Call it from [`crate::encoding::OutputCodec::ffmpeg_codec_args`].
//! 3. Each level must keep up with real-time encoding at common resolutions
//!    (720p–1080p, 30 fps) on a small single-board computer at level 1.

/// Minimum preset level (lightest computational load)
pub const MIN_PRESET: u8 = 1;
/// Maximum preset level (highest quality, most intensive)
pub const MAX_PRESET: u8 = 5;
/// Default preset level (balanced)
pub const DEFAULT_PRESET: u8 = 3;

/// Get a human-readable label for a preset level.
pub fn preset_label(level: u8) -> &'static str {
    match level.clamp(MIN_PRESET, MAX_PRESET) {
        1 => "Lightest",
        2 => "Light",
        3 => "Balanced",
        4 => "Quality",
        5 => "Maximum",
        _ => "Balanced",
    }
}

/// Software H.264 via libx264
///
/// Options used:
/// - `-preset`: ultrafast (level 1) to medium (level 5)
/// - `-tune zerolatency`: no lookahead, frames leave the encoder immediately
/// - `-crf`: constant quality, lower is better
/// - `-g`: keyframe interval, one per second so segments can be cut cleanly
pub fn x264_args(level: u8, frame_rate: u32) -> Vec<String> {
    let (preset, crf) = match level.clamp(MIN_PRESET, MAX_PRESET) {
        1 => ("ultrafast", 30u8),
        2 => ("superfast", 27),
        3 => ("veryfast", 23),
        4 => ("faster", 21),
        _ => ("medium", 19),
    };

    vec![
        "-preset".into(),
        preset.into(),
        "-tune".into(),
        "zerolatency".into(),
        "-crf".into(),
        crf.to_string(),
        "-g".into(),
        frame_rate.max(1).to_string(),
    ]
}

/// Motion JPEG via ffmpeg's native encoder
///
/// Options used:
/// - `-q:v`: JPEG quantizer, 2 (best) to 31 (worst)
pub fn mjpeg_args(level: u8) -> Vec<String> {
    let quality = match level.clamp(MIN_PRESET, MAX_PRESET) {
        1 => 12u8,
        2 => 8,
        3 => 5,
        4 => 3,
        _ => 2,
    };

    vec!["-q:v".into(), quality.to_string()]
}

// Video encoding and container format support
//
// Segments are written by an external ffmpeg process. This module maps the
// configured output codec and the incoming frame encoding to ffmpeg
// arguments and a container.
// To add a new output codec:
// 1. Add variant to OutputCodec enum
// 2. Add container mapping in container()
// 3. Add the ffmpeg encoder arguments in ffmpeg_codec_args()
// 4. Add presets in presets.rs if the encoder has tunables

pub mod encoder;
pub mod presets;
pub mod scripted;

pub use encoder::{
    concat_segments, EncoderError, EncoderHandle, EncoderProcess, EncoderStats, EncodingPipeline,
    FfmpegPipeline, FfmpegProcess, SegmentPart, StreamRequest,
};
pub use scripted::ScriptedPipeline;

use serde::{Deserialize, Serialize};

use crate::video::FrameEncoding;

/// What ffmpeg does with the frames it is fed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputCodec {
    /// Stream copy - the payload is muxed as-is (H.264 and MJPEG cameras)
    Copy,
    /// Re-encode with libx264
    H264,
    /// Re-encode as Motion JPEG
    Mjpeg,
}

impl Default for OutputCodec {
    fn default() -> Self {
        Self::Copy
    }
}

impl OutputCodec {
    /// Get the appropriate container format for this codec fed with `input`
    pub fn container(&self, input: FrameEncoding) -> ContainerFormat {
        match (self, input) {
            (OutputCodec::Copy, FrameEncoding::H264Unit) => ContainerFormat::Mp4,
            (OutputCodec::Copy, _) => ContainerFormat::Mkv,
            (OutputCodec::H264, _) => ContainerFormat::Mp4,
            (OutputCodec::Mjpeg, _) => ContainerFormat::Mkv,
        }
    }

    /// ffmpeg `-c:v ...` arguments for this codec at the given preset level
    pub fn ffmpeg_codec_args(&self, preset_level: u8, frame_rate: u32) -> Vec<String> {
        match self {
            OutputCodec::Copy => vec!["-c:v".into(), "copy".into()],
            OutputCodec::H264 => {
                let mut args = vec!["-c:v".into(), "libx264".into()];
                args.extend(presets::x264_args(preset_level, frame_rate));
                args.extend(["-pix_fmt".into(), "yuv420p".into()]);
                args
            }
            OutputCodec::Mjpeg => {
                let mut args = vec!["-c:v".into(), "mjpeg".into()];
                args.extend(presets::mjpeg_args(preset_level));
                args
            }
        }
    }

    /// Human-readable display name
    pub fn display_name(&self) -> &'static str {
        match self {
            OutputCodec::Copy => "Passthrough",
            OutputCodec::H264 => "H.264",
            OutputCodec::Mjpeg => "MJPEG",
        }
    }
}

/// Supported container formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerFormat {
    /// Matroska (.mkv) - flexible, supports any codec
    Mkv,
    /// MP4 (.mp4) - widely compatible, good for H.264
    Mp4,
}

impl ContainerFormat {
    /// Get the file extension for this container
    pub fn extension(&self) -> &'static str {
        match self {
            ContainerFormat::Mkv => "mkv",
            ContainerFormat::Mp4 => "mp4",
        }
    }

    /// ffmpeg muxer arguments
    pub fn ffmpeg_muxer_args(&self) -> Vec<String> {
        match self {
            ContainerFormat::Mkv => vec!["-f".into(), "matroska".into()],
            // Fragmented so an aborted segment is still playable up to the
            // last complete fragment
            ContainerFormat::Mp4 => vec![
                "-f".into(),
                "mp4".into(),
                "-movflags".into(),
                "+frag_keyframe+empty_moov".into(),
            ],
        }
    }
}

/// ffmpeg demuxer arguments for reading `input` frames from a pipe
pub fn ffmpeg_input_args(input: FrameEncoding, width: u32, height: u32, frame_rate: u32) -> Vec<String> {
    let mut args = match input {
        FrameEncoding::RawBgr => vec![
            "-f".to_string(),
            "rawvideo".into(),
            "-pixel_format".into(),
            "bgr24".into(),
            "-video_size".into(),
            format!("{}x{}", width, height),
        ],
        FrameEncoding::Jpeg => vec!["-f".into(), "mjpeg".into()],
        FrameEncoding::H264Unit => vec!["-f".into(), "h264".into()],
    };
    args.extend(["-framerate".into(), frame_rate.to_string()]);
    args.extend(["-i".into(), "pipe:0".into()]);
    args
}

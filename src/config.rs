// Configuration management for Lookout

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::encoding::presets::{DEFAULT_PRESET, MAX_PRESET, MIN_PRESET};
use crate::encoding::OutputCodec;
use crate::video::FrameEncoding;

/// A rectangular region `[x0, y0, x1, y1]`, half-open on the right and bottom
pub type Region = [u32; 4];

/// Recorder configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory where segments are stored (one subdirectory per day)
    #[serde(default = "default_storage_path")]
    pub storage_path: PathBuf,

    /// Nominal camera frame rate, used for segment names and encoder input
    #[serde(default = "default_frame_rate")]
    pub frame_rate: u32,

    /// Frame width in pixels
    #[serde(default = "default_width")]
    pub width: u32,

    /// Frame height in pixels
    #[serde(default = "default_height")]
    pub height: u32,

    /// Encoding of the frames delivered by the source
    #[serde(default = "default_input_encoding")]
    pub input_encoding: FrameEncoding,

    /// Percentage (0-100) of pixels that must change to count as motion
    #[serde(default = "default_sensitivity_percentage")]
    pub sensitivity_percentage: f64,

    /// Minimum interval between detection checks, in frame-timestamp seconds
    #[serde(default = "default_seconds_between_detection_checks")]
    pub seconds_between_detection_checks: f64,

    /// Run detection on every Nth frame at most
    #[serde(default = "default_detection_frame_stride")]
    pub detection_frame_stride: u32,

    /// Regions excluded from motion detection
    #[serde(default)]
    pub ignore_regions: Vec<Region>,

    /// Seconds of footage kept from before motion started
    #[serde(default = "default_pre_roll_secs")]
    pub pre_roll_secs: f64,

    /// Extra retention beyond `pre_roll_secs` so a keyframe is always available
    #[serde(default = "default_pre_roll_headroom_secs")]
    pub pre_roll_headroom_secs: f64,

    /// Hard memory cap for the pre-roll buffer
    #[serde(default = "default_pre_roll_max_bytes")]
    pub pre_roll_max_bytes: usize,

    /// Seconds without motion before a segment is closed
    #[serde(default = "default_post_motion_grace_secs")]
    pub post_motion_grace_secs: f64,

    /// Capacity of the ingest -> recording queue (frames)
    #[serde(default = "default_frame_queue_capacity")]
    pub frame_queue_capacity: usize,

    /// Capacity of the ingest -> detection queue (frames)
    #[serde(default = "default_detection_queue_capacity")]
    pub detection_queue_capacity: usize,

    /// What the ingest lane does when the recording queue is full
    #[serde(default)]
    pub overflow_policy: OverflowPolicy,

    /// External encoder settings
    #[serde(default)]
    pub encoder: EncoderSettings,

    /// Join before and after files into one file once a segment closes
    #[serde(default)]
    pub combine_segments: bool,

    /// Do not open a segment when less free space than this remains
    #[serde(default = "default_min_free_disk_mb")]
    pub min_free_disk_mb: u64,

    /// Time each encoder gets to flush on shutdown before it is killed
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: f64,

    /// Seconds without any frame before an ingest stall is reported
    #[serde(default = "default_ingest_stall_secs")]
    pub ingest_stall_secs: f64,

    /// Where frames come from
    #[serde(default)]
    pub source: SourceConfig,

    /// Rewritten with the current status as JSON about once a second
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_file: Option<PathBuf>,
}

/// Overflow policy for the bounded recording queue
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Evict the oldest queued frame to make room for the new one
    DropOldest,
    /// Discard the incoming frame
    DropNewest,
}

impl Default for OverflowPolicy {
    fn default() -> Self {
        Self::DropOldest
    }
}

/// External encoder settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncoderSettings {
    /// ffmpeg executable (name on PATH or absolute path)
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: PathBuf,

    /// Output codec
    #[serde(default)]
    pub output_codec: OutputCodec,

    /// Encoder quality preset level (1=lightest, 5=highest quality)
    /// See [`crate::encoding::presets`] for per-encoder parameter details.
    #[serde(default = "default_preset_level")]
    pub preset_level: u8,

    /// How long a frame may wait for a busy encoder before the stream is
    /// treated as backed up and aborted
    #[serde(default = "default_write_timeout_secs")]
    pub write_timeout_secs: f64,
}

impl Default for EncoderSettings {
    fn default() -> Self {
        Self {
            ffmpeg_path: default_ffmpeg_path(),
            output_codec: OutputCodec::default(),
            preset_level: DEFAULT_PRESET,
            write_timeout_secs: default_write_timeout_secs(),
        }
    }
}

/// Frame source settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Capture command writing MJPEG to stdout, e.g.
    /// `["ffmpeg", "-f", "v4l2", "-i", "/dev/video0", "-c:v", "mjpeg", "-f", "mjpeg", "-"]`.
    /// When unset, MJPEG is read from our own stdin.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid frame geometry {width}x{height}")]
    InvalidGeometry { width: u32, height: u32 },

    #[error("Ignore region {region:?} is outside the {width}x{height} frame")]
    RegionOutOfBounds { region: Region, width: u32, height: u32 },

    #[error("Sensitivity {0} is not a percentage between 0 and 100")]
    Sensitivity(f64),

    #[error("Invalid value for {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_path: default_storage_path(),
            frame_rate: default_frame_rate(),
            width: default_width(),
            height: default_height(),
            input_encoding: default_input_encoding(),
            sensitivity_percentage: default_sensitivity_percentage(),
            seconds_between_detection_checks: default_seconds_between_detection_checks(),
            detection_frame_stride: default_detection_frame_stride(),
            ignore_regions: Vec::new(),
            pre_roll_secs: default_pre_roll_secs(),
            pre_roll_headroom_secs: default_pre_roll_headroom_secs(),
            pre_roll_max_bytes: default_pre_roll_max_bytes(),
            post_motion_grace_secs: default_post_motion_grace_secs(),
            frame_queue_capacity: default_frame_queue_capacity(),
            detection_queue_capacity: default_detection_queue_capacity(),
            overflow_policy: OverflowPolicy::default(),
            encoder: EncoderSettings::default(),
            combine_segments: false,
            min_free_disk_mb: default_min_free_disk_mb(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            ingest_stall_secs: default_ingest_stall_secs(),
            source: SourceConfig::default(),
            status_file: None,
        }
    }
}

impl Config {
    /// Load config from a TOML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load config from disk or return default
    pub fn load_or_default(path: &Path) -> Self {
        if path.exists() {
            match Self::load(path) {
                Ok(config) => return config,
                Err(e) => {
                    log::warn!("Failed to load config {}: {}", path.display(), e);
                }
            }
        }

        Self::default()
    }

    /// Save config to a TOML file
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Check everything that would otherwise fail mid-run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.width == 0 || self.height == 0 {
            return Err(ConfigError::InvalidGeometry {
                width: self.width,
                height: self.height,
            });
        }
        for region in &self.ignore_regions {
            check_region(region, self.width, self.height)?;
        }
        if !(0.0..=100.0).contains(&self.sensitivity_percentage) {
            return Err(ConfigError::Sensitivity(self.sensitivity_percentage));
        }
        if self.frame_rate == 0 {
            return Err(invalid("frame_rate", "must be at least 1"));
        }
        if self.detection_frame_stride == 0 {
            return Err(invalid("detection_frame_stride", "must be at least 1"));
        }
        if self.frame_queue_capacity == 0 {
            return Err(invalid("frame_queue_capacity", "must be at least 1"));
        }
        if self.detection_queue_capacity == 0 {
            return Err(invalid("detection_queue_capacity", "must be at least 1"));
        }
        if self.pre_roll_max_bytes == 0 {
            return Err(invalid("pre_roll_max_bytes", "must be non-zero"));
        }
        if !(MIN_PRESET..=MAX_PRESET).contains(&self.encoder.preset_level) {
            return Err(invalid(
                "encoder.preset_level",
                format!("must be between {} and {}", MIN_PRESET, MAX_PRESET),
            ));
        }
        if !(self.encoder.write_timeout_secs.is_finite() && self.encoder.write_timeout_secs > 0.0) {
            return Err(invalid("encoder.write_timeout_secs", "must be a positive number of seconds"));
        }
        for (field, value) in [
            ("seconds_between_detection_checks", self.seconds_between_detection_checks),
            ("pre_roll_secs", self.pre_roll_secs),
            ("pre_roll_headroom_secs", self.pre_roll_headroom_secs),
            ("post_motion_grace_secs", self.post_motion_grace_secs),
            ("shutdown_grace_secs", self.shutdown_grace_secs),
            ("ingest_stall_secs", self.ingest_stall_secs),
        ] {
            check_seconds(field, value)?;
        }
        if let Some(command) = &self.source.command {
            if command.is_empty() {
                return Err(invalid("source.command", "must name a program"));
            }
        }
        Ok(())
    }
}

/// Check that a region is well-formed and lies inside a `width x height` frame.
pub fn check_region(region: &Region, width: u32, height: u32) -> Result<(), ConfigError> {
    let [x0, y0, x1, y1] = *region;
    if x0 > x1 || y0 > y1 || x1 > width || y1 > height {
        return Err(ConfigError::RegionOutOfBounds {
            region: *region,
            width,
            height,
        });
    }
    Ok(())
}

fn check_seconds(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if !value.is_finite() || value < 0.0 {
        return Err(invalid(field, format!("{} is not a non-negative number of seconds", value)));
    }
    Ok(())
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidField {
        field,
        reason: reason.into(),
    }
}

/// Get the default config file path
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("lookout")
        .join("config.toml")
}

/// Get the default storage path for segments
fn default_storage_path() -> PathBuf {
    dirs::video_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join("Videos")))
        .unwrap_or_else(|| PathBuf::from("."))
        .join("Lookout")
}

fn default_frame_rate() -> u32 {
    30
}

fn default_width() -> u32 {
    1920
}

// 1088 rather than 1080: H.264 encoders pad height to a multiple of 16
fn default_height() -> u32 {
    1088
}

fn default_input_encoding() -> FrameEncoding {
    FrameEncoding::Jpeg
}

fn default_sensitivity_percentage() -> f64 {
    0.2
}

fn default_seconds_between_detection_checks() -> f64 {
    0.3
}

fn default_detection_frame_stride() -> u32 {
    1
}

fn default_pre_roll_secs() -> f64 {
    2.0
}

fn default_pre_roll_headroom_secs() -> f64 {
    2.0
}

fn default_pre_roll_max_bytes() -> usize {
    64 * 1024 * 1024
}

fn default_post_motion_grace_secs() -> f64 {
    2.0
}

fn default_frame_queue_capacity() -> usize {
    90
}

fn default_detection_queue_capacity() -> usize {
    4
}

fn default_ffmpeg_path() -> PathBuf {
    PathBuf::from("ffmpeg")
}

fn default_preset_level() -> u8 {
    DEFAULT_PRESET
}

fn default_write_timeout_secs() -> f64 {
    2.0
}

fn default_min_free_disk_mb() -> u64 {
    256
}

fn default_shutdown_grace_secs() -> f64 {
    5.0
}

fn default_ingest_stall_secs() -> f64 {
    5.0
}

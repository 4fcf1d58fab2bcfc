//! Lookout - motion-triggered surveillance recorder
//!
//! Usage:
//!   lookout [OPTIONS]
//!
//! Options:
//!   --config <path>           Config file (default: <config dir>/lookout/config.toml)
//!   --write-default-config    Write a default config to the config path and exit
//!   --dry-run                 Detect and segment as usual, but write raw payloads
//!                             instead of running ffmpeg
//!   --verbose                 Extra debug output
//!
//! Frames are read as MJPEG from `source.command` if configured, otherwise
//! from stdin, e.g.
//!   ffmpeg -f v4l2 -i /dev/video0 -c:v mjpeg -f mjpeg - | lookout

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};

use lookout_lib::config::{default_config_path, Config};
use lookout_lib::encoding::presets::preset_label;
use lookout_lib::encoding::{EncodingPipeline, FfmpegPipeline, ScriptedPipeline};
use lookout_lib::recording::Monitor;
use lookout_lib::video::{FrameEncoding, FrameSource, MjpegStreamSource};

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();

    let verbose = args.iter().any(|a| a == "--verbose");
    let dry_run = args.iter().any(|a| a == "--dry-run");
    let write_default = args.iter().any(|a| a == "--write-default-config");
    let config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(PathBuf::from)
        .unwrap_or_else(default_config_path);

    let log_level = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    if write_default {
        if config_path.exists() {
            bail!("{} already exists, not overwriting", config_path.display());
        }
        Config::default()
            .save(&config_path)
            .with_context(|| format!("Failed to write {}", config_path.display()))?;
        println!("Wrote default config to {}", config_path.display());
        return Ok(());
    }

    let config = if config_path.exists() {
        Config::load(&config_path).with_context(|| format!("Failed to load {}", config_path.display()))?
    } else {
        log::info!("No config at {}, using defaults", config_path.display());
        Config::default()
    };
    config.validate().context("Invalid configuration")?;

    let source: Box<dyn FrameSource> = match config.input_encoding {
        FrameEncoding::Jpeg => match &config.source.command {
            Some(command) => Box::new(MjpegStreamSource::spawn_command(command)?),
            None => Box::new(MjpegStreamSource::from_reader(std::io::stdin())?),
        },
        other => bail!(
            "No stream reader for {} input; use jpeg, or drive the library with your own FrameSource",
            other
        ),
    };

    let pipeline: Arc<dyn EncodingPipeline> = if dry_run {
        log::info!("Dry run: segments contain raw frame payloads");
        Arc::new(ScriptedPipeline::new())
    } else {
        log::info!(
            "Encoding with ffmpeg: {}, {} preset",
            config.encoder.output_codec.display_name(),
            preset_label(config.encoder.preset_level)
        );
        Arc::new(FfmpegPipeline::new(&config.encoder))
    };

    let mut monitor = Monitor::start(&config, source, pipeline)?;

    let token = monitor.cancellation_token();
    ctrlc::set_handler(move || {
        log::info!("Shutting down...");
        token.cancel();
    })
    .context("Failed to install signal handler")?;

    monitor.wait();

    if let Some(report) = monitor.status().last_segment() {
        log::info!("Last segment: {} -> {}", report.id, report.after_path.display());
    }
    Ok(())
}

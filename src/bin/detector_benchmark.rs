//! Lookout Detector Benchmark
//!
//! Measures motion detection throughput using the recorder's actual detector
//! (same decode path, ignore mask and thresholding) on synthetic frames.
//!
//! Usage:
//!   cargo run --release --bin detector_benchmark [-- [OPTIONS]]
//!
//! Options:
//!   --width <px>          Frame width (default: 1920)
//!   --height <px>         Frame height (default: 1088)
//!   --frames <n>          Frames per encoding (default: 300)
//!   --sensitivity <pct>   Sensitivity percentage (default: 0.2)
//!   --verbose             Extra debug output

use std::io::Cursor;
use std::time::{Duration, Instant};

use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, ImageEncoder};

use lookout_lib::recording::MotionDetector;
use lookout_lib::video::{Frame, FrameEncoding};

const DEFAULT_WIDTH: u32 = 1920;
const DEFAULT_HEIGHT: u32 = 1088;
const DEFAULT_FRAMES: usize = 300;
const DEFAULT_SENSITIVITY: f64 = 0.2;
const CAMERA_FPS: f64 = 30.0;
const JPEG_QUALITY: u8 = 85;

/// Result for one encoding
struct BenchmarkResult {
    encoding: FrameEncoding,
    frames: usize,
    motion_frames: usize,
    elapsed: Duration,
    error: Option<String>,
}

fn parse_arg<T: std::str::FromStr>(args: &[String], name: &str) -> Option<T> {
    args.iter()
        .position(|a| a == name)
        .and_then(|i| args.get(i + 1))
        .and_then(|s| s.parse::<T>().ok())
}

fn main() {
    let args: Vec<String> = std::env::args().collect();

    let verbose = args.iter().any(|a| a == "--verbose");
    let width = parse_arg(&args, "--width").unwrap_or(DEFAULT_WIDTH);
    let height = parse_arg(&args, "--height").unwrap_or(DEFAULT_HEIGHT);
    let frames = parse_arg(&args, "--frames").unwrap_or(DEFAULT_FRAMES);
    let sensitivity = parse_arg(&args, "--sensitivity").unwrap_or(DEFAULT_SENSITIVITY);

    let log_level = if verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    println!("\n=== Lookout Detector Benchmark ===\n");
    println!("  Resolution:  {}x{}", width, height);
    println!("  Frames:      {} per encoding", frames);
    println!("  Sensitivity: {}%", sensitivity);
    println!();

    let results: Vec<BenchmarkResult> = [FrameEncoding::RawBgr, FrameEncoding::Jpeg]
        .into_iter()
        .map(|encoding| {
            println!("  Running {}...", encoding);
            run_benchmark(encoding, width, height, frames, sensitivity)
        })
        .collect();

    print_summary(&results);
}

/// Synthetic BGR frame: a static gradient with a bright square that moves
/// every 30 frames, so both the motion and no-motion paths are exercised.
fn generate_bgr_frame(width: u32, height: u32, frame_index: usize) -> Vec<u8> {
    let w = width as usize;
    let h = height as usize;
    let side = (w.min(h) / 8).max(1);
    let step = frame_index / 30;
    let box_x = (step * side) % w.saturating_sub(side).max(1);
    let box_y = h / 3;

    let mut data = vec![0u8; w * h * 3];
    for row in 0..h {
        for col in 0..w {
            let inside = (box_x..box_x + side).contains(&col) && (box_y..box_y + side).contains(&row);
            let luma = if inside {
                250
            } else {
                (col * 160 / w + row * 60 / h) as u8
            };
            let px = (row * w + col) * 3;
            data[px..px + 3].fill(luma);
        }
    }
    data
}

fn encode_jpeg(bgr: &[u8], width: u32, height: u32) -> Result<Vec<u8>, String> {
    // Gray BGR pixels are valid RGB pixels too
    let mut out = Cursor::new(Vec::new());
    JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY)
        .write_image(bgr, width, height, ExtendedColorType::Rgb8)
        .map_err(|e| format!("JPEG encode failed: {}", e))?;
    Ok(out.into_inner())
}

fn run_benchmark(
    encoding: FrameEncoding,
    width: u32,
    height: u32,
    frames: usize,
    sensitivity: f64,
) -> BenchmarkResult {
    let mut result = BenchmarkResult {
        encoding,
        frames: 0,
        motion_frames: 0,
        elapsed: Duration::ZERO,
        error: None,
    };

    let mut detector = match MotionDetector::configure(width, height, &[], sensitivity, 1.0) {
        Ok(d) => d,
        Err(e) => {
            result.error = Some(e.to_string());
            return result;
        }
    };

    // Generate everything up front so only detection is timed
    let mut inputs = Vec::with_capacity(frames);
    for i in 0..frames {
        let bgr = generate_bgr_frame(width, height, i);
        let payload = match encoding {
            FrameEncoding::Jpeg => match encode_jpeg(&bgr, width, height) {
                Ok(jpeg) => jpeg,
                Err(e) => {
                    result.error = Some(e);
                    return result;
                }
            },
            _ => bgr,
        };
        inputs.push(Frame::new(i as f64 / CAMERA_FPS, payload, encoding));
    }

    let start = Instant::now();
    for frame in &inputs {
        match detector.observe(frame) {
            Ok(true) => result.motion_frames += 1,
            Ok(false) => {}
            Err(e) => {
                result.error = Some(e.to_string());
                break;
            }
        }
        result.frames += 1;
    }
    result.elapsed = start.elapsed();
    result
}

fn print_summary(results: &[BenchmarkResult]) {
    println!("\n  {:<10} {:>8} {:>10} {:>10} {:>10} {:>8}", "Encoding", "Frames", "ms/frame", "fps", "realtime", "motion");
    println!("  {}", "-".repeat(61));
    for r in results {
        if let Some(ref err) = r.error {
            println!("  {:<10} FAILED: {}", r.encoding.to_string(), err);
            continue;
        }
        let secs = r.elapsed.as_secs_f64();
        let fps = if secs > 0.0 { r.frames as f64 / secs } else { 0.0 };
        let ms_per_frame = if r.frames > 0 { secs * 1000.0 / r.frames as f64 } else { 0.0 };
        println!(
            "  {:<10} {:>8} {:>10.2} {:>10.1} {:>9.2}x {:>8}",
            r.encoding.to_string(),
            r.frames,
            ms_per_frame,
            fps,
            fps / CAMERA_FPS,
            r.motion_frames
        );
    }
    println!();
}

// Monitor: runs the ingest, detection and recording lanes
//
// ingest ──try_send──► detection queue (drop newest) ──► MotionDetector
//        └─try_send──► recording queue (overflow policy) ──► RecordingOrchestrator
//
// Only the detection lane writes the shared motion state; the recording lane
// reads it once per frame. Shutdown goes ingest -> detection -> recording so
// every frame already queued still reaches the orchestrator before the open
// segment is closed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};

use super::motion::{MotionDetector, SharedMotionState};
use super::orchestrator::{OrchestratorSettings, RecordingOrchestrator};
use crate::config::{Config, OverflowPolicy};
use crate::encoding::EncodingPipeline;
use crate::status::StatusHandle;
use crate::video::{Frame, FrameSource, IngestError};

/// How long the ingest lane waits for a frame before re-checking cancellation
const INGEST_POLL: Duration = Duration::from_millis(100);

const STATUS_FILE_INTERVAL: Duration = Duration::from_secs(1);

const WARN_EVERY: u64 = 30;

/// Cooperative stop flag shared by all lanes
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Decides which frames the detection lane gets to see
#[derive(Debug)]
pub(crate) struct DetectionSampler {
    interval_secs: f64,
    stride: u32,
    since_check: u32,
    last_check: Option<f64>,
}

impl DetectionSampler {
    pub(crate) fn new(interval_secs: f64, stride: u32) -> Self {
        Self {
            interval_secs,
            stride: stride.max(1),
            since_check: 0,
            last_check: None,
        }
    }

    pub(crate) fn should_check(&mut self, timestamp: f64) -> bool {
        self.since_check = self.since_check.saturating_add(1);
        if self.since_check < self.stride {
            return false;
        }
        if let Some(last) = self.last_check {
            if timestamp - last < self.interval_secs {
                return false;
            }
        }
        self.since_check = 0;
        self.last_check = Some(timestamp);
        true
    }
}

/// Put `frame` on the recording queue. Returns false if a frame was lost.
pub(crate) fn enqueue(
    tx: &Sender<Arc<Frame>>,
    evict: &Receiver<Arc<Frame>>,
    frame: Arc<Frame>,
    policy: OverflowPolicy,
) -> bool {
    match tx.try_send(frame) {
        Ok(()) => true,
        Err(TrySendError::Disconnected(_)) => false,
        Err(TrySendError::Full(frame)) => match policy {
            OverflowPolicy::DropNewest => false,
            OverflowPolicy::DropOldest => {
                let _ = evict.try_recv();
                // The consumer may have raced us; either way only one frame is lost
                let _ = tx.try_send(frame);
                false
            }
        },
    }
}

/// Running recorder
pub struct Monitor {
    cancel: CancellationToken,
    status: StatusHandle,
    ingest_handle: Option<JoinHandle<()>>,
    detection_handle: Option<JoinHandle<()>>,
    recording_handle: Option<JoinHandle<()>>,
    status_file_handle: Option<JoinHandle<()>>,
}

impl Monitor {
    /// Validate `config` and start all lanes.
    pub fn start(
        config: &Config,
        source: Box<dyn FrameSource>,
        pipeline: Arc<dyn EncodingPipeline>,
    ) -> anyhow::Result<Self> {
        config.validate()?;

        let cancel = CancellationToken::new();
        let motion = SharedMotionState::new();
        let status = StatusHandle::new(motion.clone());
        let detector = MotionDetector::from_config(config)?;
        let orchestrator =
            RecordingOrchestrator::new(OrchestratorSettings::from(config), pipeline, status.clone());

        let mut monitor = Self {
            cancel: cancel.clone(),
            status: status.clone(),
            ingest_handle: None,
            detection_handle: None,
            recording_handle: None,
            status_file_handle: None,
        };

        // Declared after `monitor` so an early return drops the senders first
        // and the lanes already running can exit
        let (detect_tx, detect_rx) = crossbeam_channel::bounded::<Arc<Frame>>(config.detection_queue_capacity);
        let (record_tx, record_rx) = crossbeam_channel::bounded::<Arc<Frame>>(config.frame_queue_capacity);

        let shutdown_grace = Duration::from_secs_f64(config.shutdown_grace_secs);
        let recording_status = status.clone();
        let recording_rx = record_rx.clone();
        monitor.recording_handle = Some(
            std::thread::Builder::new()
                .name("lookout-recording".into())
                .spawn(move || {
                    run_recording(orchestrator, recording_rx, recording_status.motion().clone(), shutdown_grace)
                })?,
        );

        let detection_status = status.clone();
        monitor.detection_handle = Some(
            std::thread::Builder::new()
                .name("lookout-detection".into())
                .spawn(move || run_detection(detector, detect_rx, motion, detection_status))?,
        );

        let ingest = IngestLane {
            source,
            cancel: cancel.clone(),
            status: status.clone(),
            sampler: DetectionSampler::new(config.seconds_between_detection_checks, config.detection_frame_stride),
            policy: config.overflow_policy,
            stall_after: Duration::from_secs_f64(config.ingest_stall_secs),
            detect_tx,
            record_tx,
            evict: record_rx,
        };
        monitor.ingest_handle = Some(
            std::thread::Builder::new()
                .name("lookout-ingest".into())
                .spawn(move || ingest.run())?,
        );

        if let Some(path) = config.status_file.clone() {
            let status = status.clone();
            let cancel = cancel.clone();
            monitor.status_file_handle = Some(
                std::thread::Builder::new()
                    .name("lookout-status".into())
                    .spawn(move || {
                        while !cancel.is_cancelled() {
                            if let Err(e) = status.write_json(&path) {
                                log::warn!("Failed to write status file {}: {}", path.display(), e);
                            }
                            std::thread::sleep(STATUS_FILE_INTERVAL);
                        }
                        let _ = status.write_json(&path);
                    })?,
            );
        }

        log::info!(
            "Monitoring {}x{} @ {} fps, saving to {}",
            config.width,
            config.height,
            config.frame_rate,
            config.storage_path.display()
        );
        Ok(monitor)
    }

    pub fn status(&self) -> &StatusHandle {
        &self.status
    }

    /// Token that stops the monitor when cancelled (e.g. from a signal handler)
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Block until the lanes have stopped, either because the source ended
    /// or because the monitor was cancelled.
    pub fn wait(&mut self) {
        for handle in [
            self.ingest_handle.take(),
            self.detection_handle.take(),
            self.recording_handle.take(),
        ]
        .into_iter()
        .flatten()
        {
            if handle.join().is_err() {
                log::error!("A monitor lane panicked");
            }
        }
        // Ingest cancels on end of stream, but a panic might not have
        self.cancel.cancel();
        if let Some(handle) = self.status_file_handle.take() {
            let _ = handle.join();
        }
    }

    /// Stop ingesting, close any open segment and wait for everything to exit.
    pub fn shutdown(&mut self) {
        self.cancel.cancel();
        self.wait();
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct IngestLane {
    source: Box<dyn FrameSource>,
    cancel: CancellationToken,
    status: StatusHandle,
    sampler: DetectionSampler,
    policy: OverflowPolicy,
    stall_after: Duration,
    detect_tx: Sender<Arc<Frame>>,
    record_tx: Sender<Arc<Frame>>,
    evict: Receiver<Arc<Frame>>,
}

impl IngestLane {
    fn run(mut self) {
        let mut last_frame = Instant::now();
        let mut stalled = false;
        let mut record_drops: u64 = 0;
        let mut detect_drops: u64 = 0;

        while !self.cancel.is_cancelled() {
            let frame = match self.source.next_frame(INGEST_POLL) {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    if !stalled && last_frame.elapsed() >= self.stall_after {
                        stalled = true;
                        self.status.set_ingest_stalled(true);
                        log::warn!("No frames for {:.1}s, source stalled", last_frame.elapsed().as_secs_f64());
                    }
                    continue;
                }
                Err(IngestError::EndOfStream) => {
                    log::info!("Frame source ended");
                    break;
                }
                Err(e) => {
                    log::error!("Frame source failed: {}", e);
                    break;
                }
            };

            last_frame = Instant::now();
            if stalled {
                stalled = false;
                self.status.set_ingest_stalled(false);
                log::info!("Frames flowing again");
            }

            let frame = Arc::new(frame);
            if self.sampler.should_check(frame.timestamp) {
                if let Err(TrySendError::Full(_)) = self.detect_tx.try_send(frame.clone()) {
                    detect_drops += 1;
                    if detect_drops == 1 || detect_drops % WARN_EVERY == 0 {
                        log::warn!("Detection is behind, skipped {} frames", detect_drops);
                    }
                }
            }

            if !enqueue(&self.record_tx, &self.evict, frame, self.policy) {
                record_drops += 1;
                if record_drops == 1 || record_drops % WARN_EVERY == 0 {
                    log::warn!(
                        "Recording queue full ({:?}), {} frames lost so far",
                        self.policy,
                        record_drops
                    );
                }
            }
        }

        // Senders drop here; the other lanes drain their queues and exit
        self.cancel.cancel();
        log::debug!("Ingest stopped");
    }
}

fn run_detection(
    mut detector: MotionDetector,
    rx: Receiver<Arc<Frame>>,
    motion: SharedMotionState,
    status: StatusHandle,
) {
    let mut failures: u64 = 0;
    for frame in rx.iter() {
        match detector.observe(&frame) {
            Ok(_) => {
                motion.publish(detector.state());
                status.set_latest_still(frame);
            }
            Err(e) => {
                failures += 1;
                if failures == 1 || failures % WARN_EVERY == 0 {
                    log::warn!("Skipping frame at {:.3} for detection: {} ({} so far)", frame.timestamp, e, failures);
                }
            }
        }
    }
    log::debug!("Detection stopped");
}

fn run_recording(
    mut orchestrator: RecordingOrchestrator,
    rx: Receiver<Arc<Frame>>,
    motion: SharedMotionState,
    shutdown_grace: Duration,
) {
    loop {
        match rx.recv_timeout(INGEST_POLL) {
            Ok(frame) => {
                orchestrator.on_frame(frame, motion.snapshot());
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    if let Some(report) = orchestrator.shutdown(shutdown_grace) {
        log::info!("[{}] Closed on shutdown", report.id);
    }
    log::debug!("Recording stopped");
}

// Scripted in-process encoding pipeline
//
// Stands in for ffmpeg in tests and dry runs: every stream writes the raw
// payloads it is fed to its output file, and failures (spawn errors, short
// writes, encoder exits) can be scheduled per segment part.

use std::fs::File;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::encoder::{EncoderError, EncoderHandle, EncoderProcess, EncodingPipeline, Result, SegmentPart, StreamRequest};
use super::ContainerFormat;
use crate::video::FrameEncoding;

/// How a recorded stream ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOutcome {
    Open,
    Finished,
    Aborted,
}

/// Everything a scripted stream saw
#[derive(Debug, Clone)]
pub struct RecordedStream {
    pub request: StreamRequest,
    /// Payloads in the order they were accepted
    pub payloads: Vec<Vec<u8>>,
    pub outcome: StreamOutcome,
}

#[derive(Debug, Clone, Copy)]
enum WriteFault {
    /// Accept only this many bytes
    Short(usize),
    /// Behave as if the encoder died
    Exit,
}

#[derive(Debug, Clone, Copy)]
struct ScheduledFault {
    part: SegmentPart,
    /// 1-based write number within the stream
    on_write: usize,
    fault: WriteFault,
}

#[derive(Default)]
struct Script {
    failing_starts: Vec<SegmentPart>,
    faults: Vec<ScheduledFault>,
    streams: Vec<RecordedStream>,
    concatenated: Vec<PathBuf>,
}

/// [`EncodingPipeline`] that records streams instead of running an encoder
#[derive(Clone, Default)]
pub struct ScriptedPipeline {
    script: Arc<Mutex<Script>>,
}

impl ScriptedPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next start of a `part` stream fail with a spawn error.
    pub fn fail_next_start(&self, part: SegmentPart) {
        self.script.lock().failing_starts.push(part);
    }

    /// Make write number `on_write` of the next `part` stream accept only
    /// `accepted` bytes.
    pub fn short_write(&self, part: SegmentPart, on_write: usize, accepted: usize) {
        self.script.lock().faults.push(ScheduledFault {
            part,
            on_write,
            fault: WriteFault::Short(accepted),
        });
    }

    /// Make write number `on_write` of the next `part` stream fail as if the
    /// encoder had exited.
    pub fn exit_on_write(&self, part: SegmentPart, on_write: usize) {
        self.script.lock().faults.push(ScheduledFault {
            part,
            on_write,
            fault: WriteFault::Exit,
        });
    }

    /// Snapshot of every stream started so far
    pub fn streams(&self) -> Vec<RecordedStream> {
        self.script.lock().streams.clone()
    }

    /// Outputs produced by [`EncodingPipeline::concat`]
    pub fn concatenated(&self) -> Vec<PathBuf> {
        self.script.lock().concatenated.clone()
    }
}

impl EncodingPipeline for ScriptedPipeline {
    fn start(&self, request: &StreamRequest) -> Result<EncoderHandle> {
        let mut script = self.script.lock();
        if let Some(pos) = script.failing_starts.iter().position(|&p| p == request.part) {
            script.failing_starts.remove(pos);
            return Err(EncoderError::Spawn("scripted start failure".into()));
        }

        if let Some(parent) = request.output_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::create(&request.output_path)?;

        let fault = script
            .faults
            .iter()
            .position(|f| f.part == request.part)
            .map(|pos| script.faults.remove(pos));

        script.streams.push(RecordedStream {
            request: request.clone(),
            payloads: Vec::new(),
            outcome: StreamOutcome::Open,
        });
        let index = script.streams.len() - 1;

        let process = ScriptedProcess {
            script: self.script.clone(),
            index,
            file: Some(file),
            writes: 0,
            fault,
        };
        Ok(EncoderHandle::new(request, Box::new(process)))
    }

    fn container(&self, _input: FrameEncoding) -> ContainerFormat {
        ContainerFormat::Mkv
    }

    fn concat(&self, before: &Path, after: &Path, output: &Path) -> Result<()> {
        let mut joined = std::fs::read(before)?;
        joined.extend(std::fs::read(after)?);
        std::fs::write(output, joined)?;
        self.script.lock().concatenated.push(output.to_path_buf());
        Ok(())
    }
}

struct ScriptedProcess {
    script: Arc<Mutex<Script>>,
    index: usize,
    file: Option<File>,
    writes: usize,
    fault: Option<ScheduledFault>,
}

impl ScriptedProcess {
    fn set_outcome(&self, outcome: StreamOutcome) {
        if let Some(stream) = self.script.lock().streams.get_mut(self.index) {
            stream.outcome = outcome;
        }
    }
}

impl EncoderProcess for ScriptedProcess {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        self.writes += 1;
        let accepted = match self.fault {
            Some(f) if f.on_write == self.writes => match f.fault {
                WriteFault::Short(n) => n.min(data.len()),
                WriteFault::Exit => return Err(std::io::Error::from(ErrorKind::BrokenPipe)),
            },
            _ => data.len(),
        };

        let file = self
            .file
            .as_mut()
            .ok_or_else(|| std::io::Error::from(ErrorKind::BrokenPipe))?;
        file.write_all(&data[..accepted])?;
        if accepted == data.len() {
            if let Some(stream) = self.script.lock().streams.get_mut(self.index) {
                stream.payloads.push(data.to_vec());
            }
        }
        Ok(accepted)
    }

    fn finish(&mut self, _grace: Option<Duration>) -> Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush()?;
        }
        self.set_outcome(StreamOutcome::Finished);
        Ok(())
    }

    fn abort(&mut self) {
        self.file = None;
        self.set_outcome(StreamOutcome::Aborted);
    }
}

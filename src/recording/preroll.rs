// Pre-roll buffer
// Maintains a rolling window of recent frames to write out as the "before"
// part of a segment once motion starts

use std::collections::VecDeque;
use std::sync::Arc;

use crate::video::Frame;

/// Reported when the byte cap forced frames out before their time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferOverflow {
    pub evicted_frames: usize,
    pub evicted_bytes: usize,
    pub max_bytes: usize,
}

impl std::fmt::Display for BufferOverflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "pre-roll exceeded {} bytes, evicted {} frames ({} bytes) early",
            self.max_bytes, self.evicted_frames, self.evicted_bytes
        )
    }
}

/// Pre-roll buffer for frames
///
/// Retains `window + headroom` seconds of frames (by frame timestamp) so that
/// a keyframe at or before the start of the window is normally still present
/// when the buffer is drained. `drain_to` writes out everything from the
/// given window start, which the caller anchors on the motion timestamp
/// rather than on the newest frame.
pub struct PreRollBuffer {
    frames: VecDeque<Arc<Frame>>,
    window_secs: f64,
    /// Extra retention beyond the window for keyframe alignment and jitter
    headroom_secs: f64,
    /// Maximum buffer size in bytes (to prevent unbounded memory usage)
    max_bytes: usize,
    current_bytes: usize,
}

impl PreRollBuffer {
    pub fn new(window_secs: f64, headroom_secs: f64, max_bytes: usize) -> Self {
        Self {
            frames: VecDeque::new(),
            window_secs: window_secs.max(0.0),
            headroom_secs: headroom_secs.max(0.0),
            max_bytes,
            current_bytes: 0,
        }
    }

    /// Push a new frame, trimming old frames if necessary
    pub fn append(&mut self, frame: Arc<Frame>) -> Option<BufferOverflow> {
        self.current_bytes += frame.len();
        self.frames.push_back(frame);
        self.trim_by_time();
        self.trim_by_bytes()
    }

    fn trim_by_time(&mut self) {
        let newest = match self.frames.back() {
            Some(frame) => frame.timestamp,
            None => return,
        };
        let cutoff = newest - (self.window_secs + self.headroom_secs);
        while let Some(front) = self.frames.front() {
            if front.timestamp < cutoff {
                self.pop_front();
            } else {
                break;
            }
        }
    }

    /// Evict oldest frames until under the byte cap, always keeping the newest.
    fn trim_by_bytes(&mut self) -> Option<BufferOverflow> {
        let mut evicted_frames = 0;
        let mut evicted_bytes = 0;
        while self.current_bytes > self.max_bytes && self.frames.len() > 1 {
            if let Some(removed) = self.pop_front() {
                evicted_frames += 1;
                evicted_bytes += removed.len();
            }
        }

        (evicted_frames > 0).then_some(BufferOverflow {
            evicted_frames,
            evicted_bytes,
            max_bytes: self.max_bytes,
        })
    }

    fn pop_front(&mut self) -> Option<Arc<Frame>> {
        let removed = self.frames.pop_front()?;
        self.current_bytes = self.current_bytes.saturating_sub(removed.len());
        Some(removed)
    }

    /// Index of the first frame to write out: the first frame at or after
    /// `window_start` if it is a keyframe, otherwise the latest keyframe
    /// before it, otherwise the first keyframe after it.
    fn drain_start(&self, window_start: f64) -> Option<usize> {
        let first_in_window = self.frames.iter().position(|f| f.timestamp >= window_start)?;

        (0..=first_in_window)
            .rev()
            .find(|&i| self.frames[i].keyframe)
            .or_else(|| (first_in_window..self.frames.len()).find(|&i| self.frames[i].keyframe))
    }

    /// Write the retained frames from `window_start` onwards to `sink` in
    /// timestamp order and clear the buffer. The buffer is cleared even when
    /// `sink` fails part-way.
    ///
    /// Returns the number of frames written.
    pub fn drain_to<E, F>(&mut self, window_start: f64, mut sink: F) -> Result<usize, E>
    where
        F: FnMut(&Frame) -> Result<(), E>,
    {
        let start = self.drain_start(window_start);
        let frames = std::mem::take(&mut self.frames);
        self.current_bytes = 0;

        let start = match start {
            Some(start) => start,
            None => {
                if !frames.is_empty() {
                    log::warn!("Pre-roll holds {} frames but no keyframe, nothing to write", frames.len());
                }
                return Ok(0);
            }
        };

        let mut written = 0;
        for frame in frames.iter().skip(start) {
            sink(frame)?;
            written += 1;
        }
        Ok(written)
    }

    /// Get the duration of buffered content
    pub fn duration(&self) -> f64 {
        match (self.frames.front(), self.frames.back()) {
            (Some(first), Some(last)) => last.timestamp - first.timestamp,
            _ => 0.0,
        }
    }

    pub fn window(&self) -> f64 {
        self.window_secs
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Bytes currently held
    pub fn bytes(&self) -> usize {
        self.current_bytes
    }

    /// Check if buffer is empty
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Clear all buffered frames
    pub fn clear(&mut self) {
        self.frames.clear();
        self.current_bytes = 0;
    }
}

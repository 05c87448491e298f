//! Decoder for ffmpeg's `-progress` stream
//!
//! ffmpeg writes blocks of `key=value` lines, each block terminated by a
//! `progress=continue` or `progress=end` line. Reads from the pipe can cut
//! lines anywhere, so partial lines are buffered between chunks.

use std::collections::HashMap;

/// Whether more progress blocks will follow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressState {
    Continue,
    End,
}

/// One decoded progress block
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSample {
    /// Output timestamp reached so far, in seconds
    pub out_time: f64,
    /// Bytes written to the output so far
    pub total_size: u64,
    pub state: ProgressState,
}

impl ProgressSample {
    /// Percentage of `duration` covered, clamped to 0..=100
    pub fn percentage(&self, duration: f64) -> Option<f64> {
        if duration > 0.0 && self.out_time.is_finite() {
            Some((self.out_time / duration * 100.0).clamp(0.0, 100.0))
        } else {
            None
        }
    }
}

/// Incremental progress stream parser
#[derive(Debug, Default)]
pub struct ProgressParser {
    partial: Vec<u8>,
    fields: HashMap<String, String>,
}

impl ProgressParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a raw chunk, returning every sample completed by it
    ///
    /// Blocks whose fields are missing or not numeric (ffmpeg prints `N/A`
    /// while warming up) yield nothing.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<ProgressSample> {
        self.partial.extend_from_slice(chunk);

        let mut samples = Vec::new();
        while let Some(newline) = self.partial.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.partial.drain(..=newline).collect();
            if let Some(sample) = self.line(&String::from_utf8_lossy(&line)) {
                samples.push(sample);
            }
        }
        samples
    }

    fn line(&mut self, line: &str) -> Option<ProgressSample> {
        let (key, value) = line.trim().split_once('=')?;
        let (key, value) = (key.trim(), value.trim());

        if key != "progress" {
            self.fields.insert(key.to_string(), value.to_string());
            return None;
        }

        let state = match value {
            "continue" => ProgressState::Continue,
            "end" => ProgressState::End,
            _ => {
                self.fields.clear();
                return None;
            }
        };

        let sample = self.sample(state);
        self.fields.clear();
        sample
    }

    fn sample(&self, state: ProgressState) -> Option<ProgressSample> {
        let total_size = self.fields.get("total_size")?.parse::<u64>().ok()?;
        // out_time_ms is microseconds as well, a long-standing ffmpeg quirk
        let micros = self
            .fields
            .get("out_time_us")
            .or_else(|| self.fields.get("out_time_ms"))?
            .parse::<i64>()
            .ok()?;

        Some(ProgressSample {
            out_time: micros.max(0) as f64 / 1_000_000.0,
            total_size,
            state,
        })
    }
}

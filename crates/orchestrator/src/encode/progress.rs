//! Parser for ffmpeg `-progress` output.
//!
//! ffmpeg writes `key=value` lines and closes every block with
//! `progress=continue` or `progress=end`. A block only becomes a sample once
//! that marker arrives, so a half written block is never reported.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One progress observation of a running transcode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ProgressSample {
    /// Position in the output, seconds
    pub out_time_secs: f64,
    /// 0..=100 when the source duration is known
    pub percent: Option<f64>,
    pub fps: Option<f64>,
    /// Encode speed relative to real time
    pub speed: Option<f64>,
    /// Set on the final `progress=end` block
    pub finished: bool,
}

/// Incremental line parser.
#[derive(Debug, Clone)]
pub struct ProgressParser {
    duration_secs: f64,
    pending: HashMap<String, String>,
}

impl ProgressParser {
    /// `duration_secs` of the source; 0 disables percentages.
    pub fn new(duration_secs: f64) -> Self {
        Self {
            duration_secs,
            pending: HashMap::new(),
        }
    }

    /// Feed one line; returns a sample when the line closes a block.
    pub fn feed_line(&mut self, line: &str) -> Option<ProgressSample> {
        let (key, value) = line.trim().split_once('=')?;
        let key = key.trim();
        let value = value.trim();

        if key != "progress" {
            self.pending.insert(key.to_string(), value.to_string());
            return None;
        }

        let block = std::mem::take(&mut self.pending);
        Some(sample_from_block(&block, value == "end", self.duration_secs))
    }
}

fn sample_from_block(block: &HashMap<String, String>, finished: bool, duration_secs: f64) -> ProgressSample {
    let out_time_secs = out_time_secs(block).unwrap_or(0.0).max(0.0);

    let percent = if finished && duration_secs > 0.0 {
        Some(100.0)
    } else if duration_secs > 0.0 {
        Some((out_time_secs / duration_secs * 100.0).clamp(0.0, 100.0))
    } else {
        None
    };

    ProgressSample {
        out_time_secs,
        percent,
        fps: block.get("fps").and_then(|v| v.parse::<f64>().ok()),
        speed: block
            .get("speed")
            .and_then(|v| v.trim_end_matches('x').trim().parse::<f64>().ok()),
        finished,
    }
}

// `out_time_ms` is in microseconds despite its name
fn out_time_secs(block: &HashMap<String, String>) -> Option<f64> {
    for key in ["out_time_us", "out_time_ms"] {
        if let Some(us) = block.get(key).and_then(|v| v.parse::<i64>().ok()) {
            return Some(us as f64 / 1_000_000.0);
        }
    }
    block.get("out_time").and_then(|v| parse_timestamp(v))
}

/// Parses `HH:MM:SS.micro`.
fn parse_timestamp(value: &str) -> Option<f64> {
    let mut parts = value.trim().split(':');
    let hours: f64 = parts.next()?.parse().ok()?;
    let minutes: f64 = parts.next()?.parse().ok()?;
    let seconds: f64 = parts.next()?.parse().ok()?;
    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}

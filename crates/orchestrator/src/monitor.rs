//! In-process progress monitor
//!
//! Periodically renders the status board to the log. It only ever takes a
//! short read lock on the board and never drives the run.

use crate::encode::ProgressSample;
use crate::report::format_signed_size;
use crate::state::{SharedStatus, SlotPhase, SlotStatus, StatusBoard};
use log::info;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Default redraw interval
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);

/// Ticks a redraw may be held back while a worker is preparing
pub const MAX_SUSPEND_TICKS: u32 = 3;

/// Read-only periodic renderer of a [`StatusBoard`].
pub struct ProgressMonitor {
    status: SharedStatus,
    interval: Duration,
    suspended_ticks: u32,
}

impl ProgressMonitor {
    pub fn new(status: SharedStatus, interval: Duration) -> Self {
        Self {
            status,
            interval,
            suspended_ticks: 0,
        }
    }

    /// Render one frame, or `None` while redrawing is suspended.
    ///
    /// A slot that is still preparing is printing its plan to the log, so the
    /// frame is held back until progress shows up, for at most
    /// [`MAX_SUSPEND_TICKS`] ticks in a row.
    pub async fn tick(&mut self) -> Option<Vec<String>> {
        let board = self.status.read().await.clone();

        if board.any_preparing() && self.suspended_ticks < MAX_SUSPEND_TICKS {
            self.suspended_ticks += 1;
            return None;
        }
        self.suspended_ticks = 0;
        Some(render(&board))
    }

    /// Log a frame every interval until the task is aborted
    pub fn spawn(mut self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Some(lines) = self.tick().await {
                    for line in lines {
                        info!("{}", line);
                    }
                }
            }
        })
    }
}

/// Text frame for a board: one overview line plus one line per busy slot
pub fn render(board: &StatusBoard) -> Vec<String> {
    let q = &board.queue;
    let mut lines = Vec::with_capacity(board.slots.len() + 1);
    lines.push(format!(
        "Total {} | active {} | pending {} | kept {} | skipped {} | saved {}",
        q.total,
        q.active,
        q.pending(),
        q.processed,
        q.skipped,
        format_signed_size(q.saved_bytes)
    ));
    lines.extend(board.slots.values().map(render_slot));
    lines
}

pub fn render_slot(slot: &SlotStatus) -> String {
    let phase = match slot.phase {
        SlotPhase::Preparing => "preparing",
        SlotPhase::Encoding => "encoding",
        SlotPhase::Finalizing => "finalizing",
    };
    match &slot.progress {
        Some(sample) => format!(
            "[slot {}] {} {} {}",
            slot.slot,
            slot.label,
            phase,
            format_sample(sample)
        ),
        None => format!("[slot {}] {} {}", slot.slot, slot.label, phase),
    }
}

/// `45.2% 00:10:23 48 fps 1.80x`, leaving out unknown fields
pub fn format_sample(sample: &ProgressSample) -> String {
    let mut parts = Vec::with_capacity(4);
    if let Some(percent) = sample.percent {
        parts.push(format!("{:.1}%", percent));
    }
    let secs = sample.out_time_secs as u64;
    parts.push(format!("{:02}:{:02}:{:02}", secs / 3600, secs / 60 % 60, secs % 60));
    if let Some(fps) = sample.fps {
        parts.push(format!("{:.0} fps", fps));
    }
    if let Some(speed) = sample.speed {
        parts.push(format!("{:.2}x", speed));
    }
    parts.join(" ")
}

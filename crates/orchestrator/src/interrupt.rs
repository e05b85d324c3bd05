//! Ctrl-C handling
//!
//! The first interrupt drains the queue: nothing new is dispatched and the
//! running encodes finish. A second interrupt inside the escalation window
//! aborts everything. Once the window has lapsed, an interrupt counts as a
//! fresh first one.

use log::{error, warn};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Two interrupts closer than this escalate to an abort
pub const ESCALATION_WINDOW: Duration = Duration::from_secs(3);

/// Exit status of an aborted run (128 + SIGINT)
pub const ABORT_EXIT_CODE: u8 = 130;

/// What the scheduler and workers should be doing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunControl {
    Running,
    /// No new dispatches; running encodes finish
    Draining,
    /// Terminate every transcode now
    Abort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptState {
    Idle,
    /// A further interrupt before this instant escalates
    ArmedUntil(Instant),
    Escalated,
}

/// Decision for a single interrupt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptAction {
    StopAfterCurrent,
    AbortQueue,
}

/// State machine over interrupt events.
#[derive(Debug, Clone)]
pub struct InterruptController {
    state: InterruptState,
    interrupt_count: u32,
    last_interrupt: Option<Instant>,
    window: Duration,
}

impl Default for InterruptController {
    fn default() -> Self {
        Self::new()
    }
}

impl InterruptController {
    pub fn new() -> Self {
        Self::with_window(ESCALATION_WINDOW)
    }

    pub fn with_window(window: Duration) -> Self {
        Self {
            state: InterruptState::Idle,
            interrupt_count: 0,
            last_interrupt: None,
            window,
        }
    }

    pub fn state(&self) -> InterruptState {
        self.state
    }

    /// Interrupts counted since the last reset
    pub fn interrupt_count(&self) -> u32 {
        self.interrupt_count
    }

    pub fn last_interrupt(&self) -> Option<Instant> {
        self.last_interrupt
    }

    /// Register an interrupt received at `now`.
    pub fn on_interrupt(&mut self, now: Instant) -> InterruptAction {
        self.last_interrupt = Some(now);

        match self.state {
            InterruptState::Escalated => {
                self.interrupt_count += 1;
                InterruptAction::AbortQueue
            }
            InterruptState::ArmedUntil(deadline) if now <= deadline => {
                self.interrupt_count += 1;
                self.state = InterruptState::Escalated;
                InterruptAction::AbortQueue
            }
            InterruptState::Idle | InterruptState::ArmedUntil(_) => {
                self.interrupt_count = 1;
                self.state = InterruptState::ArmedUntil(now + self.window);
                InterruptAction::StopAfterCurrent
            }
        }
    }
}

/// Apply an interrupt decision to the run control channel.
pub fn apply_action(control: &watch::Sender<RunControl>, action: InterruptAction) {
    match action {
        InterruptAction::StopAfterCurrent => {
            control.send_if_modified(|current| {
                if *current == RunControl::Running {
                    *current = RunControl::Draining;
                    true
                } else {
                    false
                }
            });
        }
        InterruptAction::AbortQueue => {
            control.send_replace(RunControl::Abort);
        }
    }
}

/// Listen for Ctrl-C for the lifetime of the run.
///
/// The returned task never finishes on its own; abort it once the run is over.
pub fn spawn_interrupt_listener(control: watch::Sender<RunControl>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut controller = InterruptController::new();
        loop {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Unable to listen for Ctrl-C: {}", e);
                return;
            }
            let action = controller.on_interrupt(Instant::now());
            match action {
                InterruptAction::StopAfterCurrent => warn!(
                    "Interrupt received: finishing running encodes, no new files will start. \
                     Press Ctrl-C again within {}s to abort",
                    ESCALATION_WINDOW.as_secs()
                ),
                InterruptAction::AbortQueue => {
                    error!("Second interrupt received: aborting all encodes")
                }
            }
            apply_action(&control, action);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_first_interrupt_drains() {
        let mut ctl = InterruptController::new();
        let t0 = Instant::now();
        assert_eq!(ctl.on_interrupt(t0), InterruptAction::StopAfterCurrent);
        assert_eq!(ctl.state(), InterruptState::ArmedUntil(t0 + ESCALATION_WINDOW));
        assert_eq!(ctl.interrupt_count(), 1);
    }

    #[test]
    fn test_quick_second_interrupt_escalates() {
        let mut ctl = InterruptController::new();
        let t0 = Instant::now();
        ctl.on_interrupt(t0);
        assert_eq!(
            ctl.on_interrupt(t0 + Duration::from_millis(2500)),
            InterruptAction::AbortQueue
        );
        assert_eq!(ctl.state(), InterruptState::Escalated);
        assert_eq!(ctl.interrupt_count(), 2);
        // stays escalated
        assert_eq!(
            ctl.on_interrupt(t0 + Duration::from_secs(60)),
            InterruptAction::AbortQueue
        );
    }

    #[test]
    fn test_late_second_interrupt_resets() {
        let mut ctl = InterruptController::new();
        let t0 = Instant::now();
        ctl.on_interrupt(t0);
        let t1 = t0 + Duration::from_secs(4);
        assert_eq!(ctl.on_interrupt(t1), InterruptAction::StopAfterCurrent);
        assert_eq!(ctl.interrupt_count(), 1);
        assert_eq!(ctl.state(), InterruptState::ArmedUntil(t1 + ESCALATION_WINDOW));
        assert_eq!(ctl.last_interrupt(), Some(t1));
    }

    #[test]
    fn test_apply_action_transitions() {
        let (tx, rx) = watch::channel(RunControl::Running);
        apply_action(&tx, InterruptAction::StopAfterCurrent);
        assert_eq!(*rx.borrow(), RunControl::Draining);
        apply_action(&tx, InterruptAction::AbortQueue);
        assert_eq!(*rx.borrow(), RunControl::Abort);
        // a late drain never downgrades an abort
        apply_action(&tx, InterruptAction::StopAfterCurrent);
        assert_eq!(*rx.borrow(), RunControl::Abort);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_double_interrupt_law(gap_ms in 0u64..10_000) {
            let mut ctl = InterruptController::new();
            let t0 = Instant::now();
            ctl.on_interrupt(t0);
            let action = ctl.on_interrupt(t0 + Duration::from_millis(gap_ms));
            if gap_ms <= 3000 {
                prop_assert_eq!(action, InterruptAction::AbortQueue);
            } else {
                prop_assert_eq!(action, InterruptAction::StopAfterCurrent);
                prop_assert_eq!(ctl.interrupt_count(), 1);
            }
        }
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The minor-cycle controller: iteration counters, thresholds, the
//! major-cycle predicate, the append-only summary log, and the one blocking
//! suspension point in the whole core (the interactive-input wait).

use std::sync::{Arc, Condvar, Mutex};

use crossbeam_utils::atomic::AtomicCell;
use log::warn;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The lifecycle of a controller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControllerState {
    Idle,
    CycleActive,
    AwaitingInteraction,
    Done,
}

/// The per-cycle knobs handed to the deconvolver.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct MinorCycleControls {
    /// The iteration budget for this cycle.
    pub cycle_niter: u32,

    /// Stop the cycle when the absolute peak residual reaches this \[Jy\].
    pub cycle_threshold: f64,

    /// The fraction of the peak removed per iteration.
    pub loop_gain: f32,
}

impl MinorCycleControls {
    pub fn validate(&self) -> Result<(), ControlError> {
        if self.cycle_niter == 0 {
            return Err(ControlError::InvalidCycleNiter);
        }
        if !self.cycle_threshold.is_finite() || self.cycle_threshold < 0.0 {
            return Err(ControlError::InvalidThreshold(self.cycle_threshold));
        }
        if !(self.loop_gain > 0.0 && self.loop_gain <= 1.0) {
            return Err(ControlError::InvalidLoopGain(self.loop_gain));
        }
        Ok(())
    }
}

/// One row of the summary log, appended after every minor-cycle set.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct SummaryRow {
    /// The lifetime iteration count at the time of the append.
    pub iteration: u64,
    pub peak_residual: f64,
    pub model_flux: f64,
    pub cycle_threshold: f64,
    pub deconvolver_id: usize,
    pub subimage_id: usize,
}

/// An append-only table of [`SummaryRow`]s. Rows are never mutated or
/// removed during a run.
#[derive(Clone, Debug, Default, Serialize)]
pub struct SummaryLog {
    rows: Vec<SummaryRow>,
}

impl SummaryLog {
    pub fn push(&mut self, row: SummaryRow) {
        self.rows.push(row);
    }

    pub fn rows(&self) -> &[SummaryRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// The channel through which an external actor (GUI or automation) feeds
/// updated controls to a blocked controller, and through which an operator
/// abort unblocks it.
///
/// The wait is a plain condvar block: no timeout, no polling. The
/// cancellation token is checked both before and after the block so an abort
/// can never be missed.
#[derive(Default)]
pub struct InteractiveGate {
    pending: Mutex<Option<MinorCycleControls>>,
    notified: Condvar,
    cancelled: AtomicCell<bool>,
}

impl InteractiveGate {
    pub fn new() -> Arc<InteractiveGate> {
        Arc::new(InteractiveGate::default())
    }

    /// Supply new controls and wake the waiting controller.
    pub fn post_controls(&self, controls: MinorCycleControls) {
        *self.pending.lock().expect("gate mutex is never poisoned") = Some(controls);
        self.notified.notify_all();
    }

    /// Abort the run: wakes any waiter, which returns
    /// [`ControlError::Aborted`].
    pub fn cancel(&self) {
        self.cancelled.store(true);
        self.notified.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load()
    }

    /// Block until controls are posted or the run is aborted.
    fn wait(&self) -> Result<MinorCycleControls, ControlError> {
        if self.cancelled.load() {
            return Err(ControlError::Aborted);
        }
        let mut pending = self.pending.lock().expect("gate mutex is never poisoned");
        loop {
            if let Some(controls) = pending.take() {
                return Ok(controls);
            }
            if self.cancelled.load() {
                return Err(ControlError::Aborted);
            }
            pending = self
                .notified
                .wait(pending)
                .expect("gate mutex is never poisoned");
        }
    }
}

/// The stateful minor-cycle loop driver for one field.
pub struct MinorCycleController {
    state: ControllerState,
    controls: MinorCycleControls,

    /// Iterations done in the current cycle. Reset by `set_cycle_controls`.
    cycle_iter_done: u32,

    /// Iterations done over the whole run. Never reset.
    total_iter_done: u64,

    /// How many consecutive step reports made no progress.
    stagnant_steps: u32,

    summary: SummaryLog,

    interactive: bool,
    gate: Arc<InteractiveGate>,
}

impl MinorCycleController {
    pub fn new(gate: Arc<InteractiveGate>) -> MinorCycleController {
        MinorCycleController {
            state: ControllerState::Idle,
            controls: MinorCycleControls {
                cycle_niter: 1,
                cycle_threshold: 0.0,
                loop_gain: 0.1,
            },
            cycle_iter_done: 0,
            total_iter_done: 0,
            stagnant_steps: 0,
            summary: SummaryLog::default(),
            interactive: false,
            gate,
        }
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn controls(&self) -> MinorCycleControls {
        self.controls
    }

    pub fn total_iterations(&self) -> u64 {
        self.total_iter_done
    }

    pub fn cycle_iterations(&self) -> u32 {
        self.cycle_iter_done
    }

    pub fn summary(&self) -> &SummaryLog {
        &self.summary
    }

    pub fn set_interactive(&mut self, interactive: bool) {
        self.interactive = interactive;
    }

    /// Begin a cycle: validate and install the controls and reset the
    /// per-cycle counter. The lifetime counter is untouched.
    pub fn set_cycle_controls(&mut self, controls: MinorCycleControls) -> Result<(), ControlError> {
        controls.validate()?;
        self.controls = controls;
        self.cycle_iter_done = 0;
        self.state = ControllerState::CycleActive;
        Ok(())
    }

    /// Record iterations reported by the deconvolver after a
    /// `take_one_step`. Two consecutive empty reports earn a stagnation
    /// warning (non-fatal; the run continues).
    pub fn increment_minor_cycle_count(&mut self, iterations: u32) {
        self.cycle_iter_done += iterations;
        self.total_iter_done += u64::from(iterations);
        if iterations == 0 {
            self.stagnant_steps += 1;
            if self.stagnant_steps == 2 {
                warn!(
                    "Two consecutive minor-cycle steps made no progress; \
                     the deconvolution may have stagnated"
                );
            }
        } else {
            self.stagnant_steps = 0;
        }
    }

    /// The sole minor-to-major transition test: true when the cycle budget
    /// is exhausted or the peak residual has reached the cycle threshold.
    ///
    /// A pure predicate: no side effects, same answer no matter how often it
    /// is asked.
    pub fn major_cycle_required(&self, current_peak_residual: f64) -> bool {
        self.cycle_iter_done >= self.controls.cycle_niter
            || current_peak_residual.abs() <= self.controls.cycle_threshold
    }

    /// Append one row to the summary log.
    pub fn add_summary_minor(
        &mut self,
        deconvolver_id: usize,
        subimage_id: usize,
        model_flux: f64,
        peak_residual: f64,
    ) {
        self.summary.push(SummaryRow {
            iteration: self.total_iter_done,
            peak_residual,
            model_flux,
            cycle_threshold: self.controls.cycle_threshold,
            deconvolver_id,
            subimage_id,
        });
    }

    /// Whether the driver should pause for interactive input at the next
    /// cycle boundary.
    pub fn interactive_input_required(&self) -> bool {
        self.interactive && !self.gate.is_cancelled()
    }

    /// Block the calling thread until an external actor posts updated
    /// controls (which are installed as the new cycle controls) or aborts
    /// the run.
    pub fn wait_for_interactive_input(&mut self) -> Result<MinorCycleControls, ControlError> {
        self.state = ControllerState::AwaitingInteraction;
        let result = self.gate.wait();
        match result {
            Ok(controls) => {
                self.set_cycle_controls(controls)?;
                Ok(controls)
            }
            Err(e) => {
                self.state = ControllerState::Done;
                Err(e)
            }
        }
    }

    /// Install controls from an external record without blocking (the
    /// non-interactive path of `setControlsFromRecord`).
    pub fn set_controls_from_record(
        &mut self,
        controls: MinorCycleControls,
    ) -> Result<(), ControlError> {
        controls.validate()?;
        self.gate.post_controls(controls);
        Ok(())
    }

    /// Mark the whole run finished.
    pub fn mark_done(&mut self) {
        self.state = ControllerState::Done;
    }
}

/// The cycle-threshold policy: how deep the minor cycles may clean before a
/// major cycle is forced. The worst PSF sidelobe times the current peak,
/// scaled by the cycle factor, floored at the global threshold and capped at
/// the peak itself.
pub fn compute_cycle_threshold(
    cycle_factor: f32,
    max_psf_sidelobe: f64,
    peak_residual: f64,
    threshold: f64,
) -> f64 {
    let peak = peak_residual.abs();
    (f64::from(cycle_factor) * max_psf_sidelobe * peak).clamp(threshold, peak.max(threshold))
}

#[derive(Error, Debug)]
pub enum ControlError {
    #[error("cycleniter must be at least 1")]
    InvalidCycleNiter,

    #[error("Threshold must be finite and non-negative, got {0}")]
    InvalidThreshold(f64),

    #[error("Loop gain must be in (0, 1], got {0}")]
    InvalidLoopGain(f32),

    #[error("niter must be at least 1")]
    InvalidNiter,

    #[error("cyclefactor must be positive and finite, got {0}")]
    InvalidCycleFactor(f32),

    #[error("An iteration session needs at least one field")]
    NoFields,

    #[error("Could not understand the controls record: {0}")]
    BadRecord(String),

    #[error("The run was aborted by the operator")]
    Aborted,
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use approx::assert_abs_diff_eq;

    use super::*;

    fn controls(niter: u32, threshold: f64, gain: f32) -> MinorCycleControls {
        MinorCycleControls {
            cycle_niter: niter,
            cycle_threshold: threshold,
            loop_gain: gain,
        }
    }

    #[test]
    fn test_control_validation() {
        assert!(controls(100, 0.01, 0.1).validate().is_ok());
        assert!(matches!(
            controls(0, 0.01, 0.1).validate(),
            Err(ControlError::InvalidCycleNiter)
        ));
        assert!(matches!(
            controls(100, -0.5, 0.1).validate(),
            Err(ControlError::InvalidThreshold(_))
        ));
        assert!(matches!(
            controls(100, 0.01, 0.0).validate(),
            Err(ControlError::InvalidLoopGain(_))
        ));
        assert!(matches!(
            controls(100, 0.01, 1.5).validate(),
            Err(ControlError::InvalidLoopGain(_))
        ));
    }

    #[test]
    fn test_cycle_counters() {
        let mut controller = MinorCycleController::new(InteractiveGate::new());
        controller.set_cycle_controls(controls(50, 0.5, 0.1)).unwrap();
        controller.increment_minor_cycle_count(20);
        controller.increment_minor_cycle_count(15);
        assert_eq!(controller.cycle_iterations(), 35);
        assert_eq!(controller.total_iterations(), 35);

        // A new cycle resets the per-cycle counter, not the lifetime one.
        controller.set_cycle_controls(controls(50, 0.5, 0.1)).unwrap();
        assert_eq!(controller.cycle_iterations(), 0);
        assert_eq!(controller.total_iterations(), 35);
    }

    #[test]
    fn test_major_cycle_predicate_is_pure() {
        let mut controller = MinorCycleController::new(InteractiveGate::new());
        controller.set_cycle_controls(controls(50, 0.5, 0.1)).unwrap();
        controller.increment_minor_cycle_count(20);

        // Same inputs, same answer, any number of times, with no effect on
        // the counters.
        for _ in 0..5 {
            assert!(!controller.major_cycle_required(2.0));
            assert!(controller.major_cycle_required(0.4));
            assert!(controller.major_cycle_required(-0.3));
        }
        assert_eq!(controller.cycle_iterations(), 20);

        // Budget exhaustion also trips it.
        controller.increment_minor_cycle_count(30);
        assert!(controller.major_cycle_required(2.0));
    }

    #[test]
    fn test_summary_is_append_only() {
        let mut controller = MinorCycleController::new(InteractiveGate::new());
        controller.set_cycle_controls(controls(50, 0.5, 0.1)).unwrap();

        for i in 0..100 {
            controller.increment_minor_cycle_count(1);
            controller.add_summary_minor(0, 0, i as f64, 10.0 - i as f64);
        }
        assert_eq!(controller.summary().len(), 100);

        // Rows hold what they were given, in order.
        let rows = controller.summary().rows();
        assert_abs_diff_eq!(rows[0].model_flux, 0.0);
        assert_abs_diff_eq!(rows[99].model_flux, 99.0);
        assert_eq!(rows[99].iteration, 100);
    }

    #[test]
    fn test_stagnation_warning_counts() {
        let mut controller = MinorCycleController::new(InteractiveGate::new());
        controller.set_cycle_controls(controls(50, 0.5, 0.1)).unwrap();
        controller.increment_minor_cycle_count(0);
        assert_eq!(controller.stagnant_steps, 1);
        controller.increment_minor_cycle_count(0);
        assert_eq!(controller.stagnant_steps, 2);
        controller.increment_minor_cycle_count(3);
        assert_eq!(controller.stagnant_steps, 0);
    }

    #[test]
    fn test_cycle_threshold_policy() {
        // 10 Jy peak, 30% sidelobes, cycle factor 1.5: clean down to 4.5 Jy.
        assert_abs_diff_eq!(compute_cycle_threshold(1.5, 0.3, 10.0, 0.01), 4.5);
        // Floored at the global threshold.
        assert_abs_diff_eq!(compute_cycle_threshold(1.0, 0.001, 10.0, 0.5), 0.5);
        // Never above the current peak.
        assert_abs_diff_eq!(compute_cycle_threshold(10.0, 0.9, 10.0, 0.01), 10.0);
    }

    #[test]
    fn test_interactive_wait_receives_controls() {
        let gate = InteractiveGate::new();
        let mut controller = MinorCycleController::new(Arc::clone(&gate));
        controller.set_interactive(true);
        assert!(controller.interactive_input_required());

        let poster = {
            let gate = Arc::clone(&gate);
            thread::spawn(move || {
                // Give the waiter time to actually block.
                thread::sleep(Duration::from_millis(50));
                gate.post_controls(controls(123, 0.25, 0.2));
            })
        };

        let received = controller.wait_for_interactive_input().unwrap();
        assert_eq!(received.cycle_niter, 123);
        assert_eq!(controller.state(), ControllerState::CycleActive);
        assert_eq!(controller.controls().cycle_niter, 123);
        poster.join().unwrap();
    }

    #[test]
    fn test_interactive_wait_cancellation() {
        let gate = InteractiveGate::new();
        let mut controller = MinorCycleController::new(Arc::clone(&gate));
        controller.set_interactive(true);

        let canceller = {
            let gate = Arc::clone(&gate);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                gate.cancel();
            })
        };

        assert!(matches!(
            controller.wait_for_interactive_input(),
            Err(ControlError::Aborted)
        ));
        assert_eq!(controller.state(), ControllerState::Done);
        // Once cancelled, no further interaction is required.
        assert!(!controller.interactive_input_required());
        canceller.join().unwrap();
    }

    #[test]
    fn test_cancelled_gate_never_blocks() {
        let gate = InteractiveGate::new();
        gate.cancel();
        let mut controller = MinorCycleController::new(Arc::clone(&gate));
        controller.set_interactive(true);
        // The pre-block cancellation check fires; this returns immediately.
        assert!(matches!(
            controller.wait_for_interactive_input(),
            Err(ControlError::Aborted)
        ));
    }
}

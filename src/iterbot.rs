// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The outward-facing iteration session.
//!
//! An [`IterationBot`] owns one [`MinorCycleController`] per field, turns the
//! user's global controls into per-cycle budgets, counts major cycles, and
//! exposes serialisable summaries plus the interaction hooks an external GUI
//! or automation client drives.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use vec1::Vec1;

use crate::controller::{
    compute_cycle_threshold, ControlError, InteractiveGate, MinorCycleControls,
    MinorCycleController, SummaryRow,
};

/// The user-facing iteration controls, in the shape external clients send
/// them.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct IterationControls {
    /// The total iteration budget across all fields and major cycles.
    pub niter: u64,

    /// The global stopping flux \[Jy\].
    pub threshold: f64,

    /// The fraction of the peak removed per minor-cycle iteration.
    #[serde(rename = "loopgain")]
    pub loop_gain: f32,

    /// The per-major-cycle iteration budget. Zero means "no extra cap": the
    /// remaining global budget is used.
    #[serde(rename = "cycleniter")]
    pub cycle_niter: u32,

    /// Scales how deep minor cycles clean before a major cycle is forced.
    #[serde(rename = "cyclefactor")]
    pub cycle_factor: f32,
}

impl Default for IterationControls {
    fn default() -> Self {
        IterationControls {
            niter: 500,
            threshold: 0.0,
            loop_gain: 0.1,
            cycle_niter: 0,
            cycle_factor: 1.0,
        }
    }
}

impl IterationControls {
    pub fn validate(&self) -> Result<(), ControlError> {
        if self.niter == 0 {
            return Err(ControlError::InvalidNiter);
        }
        if !self.threshold.is_finite() || self.threshold < 0.0 {
            return Err(ControlError::InvalidThreshold(self.threshold));
        }
        if !(self.loop_gain > 0.0 && self.loop_gain <= 1.0) {
            return Err(ControlError::InvalidLoopGain(self.loop_gain));
        }
        if !self.cycle_factor.is_finite() || self.cycle_factor <= 0.0 {
            return Err(ControlError::InvalidCycleFactor(self.cycle_factor));
        }
        Ok(())
    }
}

/// A partial controls record: any subset of the recognised keys, merged over
/// the current controls.
#[derive(Debug, Default, Deserialize)]
struct ControlRecord {
    niter: Option<u64>,
    threshold: Option<f64>,
    loopgain: Option<f32>,
    cycleniter: Option<u32>,
    cyclefactor: Option<f32>,
}

struct FieldState {
    controller: MinorCycleController,
    max_psf_sidelobe: f64,
}

/// A serialisable snapshot of where the iteration stands.
#[derive(Clone, Debug, Serialize)]
pub struct IterationSummary {
    pub controls: IterationControls,
    pub iterations_done: u64,
    pub major_cycles_done: u32,
    pub fields: Vec<FieldIterationSummary>,
}

#[derive(Clone, Debug, Serialize)]
pub struct FieldIterationSummary {
    pub field: usize,
    pub iterations_done: u64,
    pub peak_residual: Option<f64>,
    pub model_flux: Option<f64>,
}

/// A snapshot taken at each major-cycle boundary.
#[derive(Clone, Debug, Serialize)]
pub struct MajorCycleRecord {
    pub major_cycle: u32,
    pub iterations_done: u64,
}

pub struct IterationBot {
    controls: IterationControls,
    fields: Vec1<FieldState>,
    gate: Arc<InteractiveGate>,
    interactive: bool,
    major_done: u32,
    major_records: Vec<MajorCycleRecord>,
}

impl IterationBot {
    pub fn new(controls: IterationControls, num_fields: usize) -> Result<IterationBot, ControlError> {
        controls.validate()?;
        let gate = InteractiveGate::new();
        let fields = Vec1::try_from_vec(
            (0..num_fields)
                .map(|_| FieldState {
                    controller: MinorCycleController::new(Arc::clone(&gate)),
                    max_psf_sidelobe: 0.0,
                })
                .collect(),
        )
        .map_err(|_| ControlError::NoFields)?;
        Ok(IterationBot {
            controls,
            fields,
            gate,
            interactive: false,
            major_done: 0,
            major_records: Vec::new(),
        })
    }

    pub fn controls(&self) -> IterationControls {
        self.controls
    }

    pub fn num_fields(&self) -> usize {
        self.fields.len()
    }

    /// The shared gate an external client uses to post controls or abort.
    pub fn gate(&self) -> Arc<InteractiveGate> {
        Arc::clone(&self.gate)
    }

    /// Toggle whether cycle boundaries pause for user interaction. A
    /// pass-through flag; no new logic.
    pub fn set_interactive_mode(&mut self, interactive: bool) {
        self.interactive = interactive;
        for field in self.fields.iter_mut() {
            field.controller.set_interactive(interactive);
        }
    }

    pub fn interactive_mode(&self) -> bool {
        self.interactive
    }

    /// Record the worst PSF sidelobe of a field, used by the cycle-threshold
    /// policy.
    pub fn set_field_psf_sidelobe(&mut self, field: usize, max_psf_sidelobe: f64) {
        self.fields[field].max_psf_sidelobe = max_psf_sidelobe;
    }

    pub fn controller(&self, field: usize) -> &MinorCycleController {
        &self.fields[field].controller
    }

    pub fn controller_mut(&mut self, field: usize) -> &mut MinorCycleController {
        &mut self.fields[field].controller
    }

    /// Ingest a (possibly partial) controls record from an external client.
    /// Unknown values fail validation fail-fast; nothing is installed on
    /// error. The merged controls are also posted to the gate so a blocked
    /// interactive wait resumes with them.
    pub fn set_controls_from_record(
        &mut self,
        record: &serde_json::Value,
    ) -> Result<IterationControls, ControlError> {
        let record: ControlRecord = serde_json::from_value(record.clone())
            .map_err(|e| ControlError::BadRecord(e.to_string()))?;
        let mut merged = self.controls;
        if let Some(niter) = record.niter {
            merged.niter = niter;
        }
        if let Some(threshold) = record.threshold {
            merged.threshold = threshold;
        }
        if let Some(loop_gain) = record.loopgain {
            merged.loop_gain = loop_gain;
        }
        if let Some(cycle_niter) = record.cycleniter {
            merged.cycle_niter = cycle_niter;
        }
        if let Some(cycle_factor) = record.cyclefactor {
            merged.cycle_factor = cycle_factor;
        }
        merged.validate()?;
        self.controls = merged;

        self.gate.post_controls(MinorCycleControls {
            cycle_niter: self.effective_cycle_budget(),
            cycle_threshold: merged.threshold,
            loop_gain: merged.loop_gain,
        });
        Ok(merged)
    }

    /// The iteration budget available to the next cycle.
    fn effective_cycle_budget(&self) -> u32 {
        let remaining = self
            .controls
            .niter
            .saturating_sub(self.total_iterations())
            .max(1);
        let remaining = u32::try_from(remaining).unwrap_or(u32::MAX);
        if self.controls.cycle_niter == 0 {
            remaining
        } else {
            self.controls.cycle_niter.min(remaining)
        }
    }

    /// Compute and install this cycle's budget and threshold on a field's
    /// controller, returning them for the deconvolver.
    pub fn begin_minor_cycle(
        &mut self,
        field: usize,
        peak_residual: f64,
    ) -> Result<MinorCycleControls, ControlError> {
        let cycle_controls = MinorCycleControls {
            cycle_niter: self.effective_cycle_budget(),
            cycle_threshold: compute_cycle_threshold(
                self.controls.cycle_factor,
                self.fields[field].max_psf_sidelobe,
                peak_residual,
                self.controls.threshold,
            ),
            loop_gain: self.controls.loop_gain,
        };
        self.fields[field]
            .controller
            .set_cycle_controls(cycle_controls)?;
        Ok(cycle_controls)
    }

    /// Iterations done so far, over all fields.
    pub fn total_iterations(&self) -> u64 {
        self.fields
            .iter()
            .map(|f| f.controller.total_iterations())
            .sum()
    }

    /// Whether the run has converged: the global iteration budget is spent,
    /// or every field's peak residual is at or below the global threshold.
    pub fn run_complete(&self, peak_residuals: &[f64]) -> bool {
        if self.total_iterations() >= self.controls.niter {
            return true;
        }
        !peak_residuals.is_empty()
            && peak_residuals
                .iter()
                .all(|p| p.abs() <= self.controls.threshold)
    }

    /// Close out a major cycle: bump the cross-field counter and snapshot
    /// the totals.
    pub fn end_major_cycle(&mut self) {
        self.major_done += 1;
        self.major_records.push(MajorCycleRecord {
            major_cycle: self.major_done,
            iterations_done: self.total_iterations(),
        });
    }

    pub fn major_cycles_done(&self) -> u32 {
        self.major_done
    }

    /// Pause at a cycle boundary when interactive mode asks for it. Returns
    /// the freshly-posted controls, or `None` when no pause was needed.
    pub fn pause_for_user_interaction(
        &mut self,
        field: usize,
    ) -> Result<Option<MinorCycleControls>, ControlError> {
        if !self.fields[field].controller.interactive_input_required() {
            return Ok(None);
        }
        let controls = self.fields[field].controller.wait_for_interactive_input()?;
        // Keep the session controls in step with what the client posted.
        self.controls.loop_gain = controls.loop_gain;
        Ok(Some(controls))
    }

    /// Abort the run: unblocks any interactive wait and makes
    /// [`IterationBot::aborted`] true. Cancellation is only observed at
    /// cycle boundaries.
    pub fn abort(&self) {
        self.gate.cancel();
    }

    pub fn aborted(&self) -> bool {
        self.gate.is_cancelled()
    }

    /// A compact serialisable summary for external display.
    pub fn get_iteration_summary(&self) -> IterationSummary {
        IterationSummary {
            controls: self.controls,
            iterations_done: self.total_iterations(),
            major_cycles_done: self.major_done,
            fields: self
                .fields
                .iter()
                .enumerate()
                .map(|(i, f)| {
                    let last = f.controller.summary().rows().last();
                    FieldIterationSummary {
                        field: i,
                        iterations_done: f.controller.total_iterations(),
                        peak_residual: last.map(|r| r.peak_residual),
                        model_flux: last.map(|r| r.model_flux),
                    }
                })
                .collect(),
        }
    }

    /// The full iteration history: every summary row of every field plus the
    /// major-cycle records, as one JSON value.
    pub fn get_iteration_details(&self) -> serde_json::Value {
        let per_field: Vec<&[SummaryRow]> = self
            .fields
            .iter()
            .map(|f| f.controller.summary().rows())
            .collect();
        serde_json::json!({
            "summary": self.get_iteration_summary(),
            "major_cycles": self.major_records,
            "minor_cycle_log": per_field,
        })
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;
    use serde_json::json;

    use super::*;

    #[test]
    fn test_new_validates_controls() {
        let mut controls = IterationControls::default();
        controls.niter = 0;
        assert!(matches!(
            IterationBot::new(controls, 1),
            Err(ControlError::InvalidNiter)
        ));
        assert!(matches!(
            IterationBot::new(IterationControls::default(), 0),
            Err(ControlError::NoFields)
        ));
    }

    #[test]
    fn test_record_merging() {
        let mut bot = IterationBot::new(IterationControls::default(), 1).unwrap();
        let merged = bot
            .set_controls_from_record(&json!({"niter": 1000, "threshold": 0.05}))
            .unwrap();
        assert_eq!(merged.niter, 1000);
        assert_abs_diff_eq!(merged.threshold, 0.05);
        // Untouched keys keep their previous values.
        assert_abs_diff_eq!(merged.loop_gain, 0.1);

        // A bad record installs nothing.
        assert!(bot
            .set_controls_from_record(&json!({"loopgain": 7.0}))
            .is_err());
        assert_abs_diff_eq!(bot.controls().loop_gain, 0.1);
        assert!(bot
            .set_controls_from_record(&json!({"niter": "many"}))
            .is_err());
    }

    #[test]
    fn test_cycle_budget_respects_global_niter() {
        let controls = IterationControls {
            niter: 100,
            cycle_niter: 40,
            ..Default::default()
        };
        let mut bot = IterationBot::new(controls, 1).unwrap();
        bot.set_field_psf_sidelobe(0, 0.1);

        let cycle = bot.begin_minor_cycle(0, 10.0).unwrap();
        assert_eq!(cycle.cycle_niter, 40);

        // After 80 iterations only 20 remain of the global budget.
        bot.controller_mut(0).increment_minor_cycle_count(80);
        let cycle = bot.begin_minor_cycle(0, 10.0).unwrap();
        assert_eq!(cycle.cycle_niter, 20);

        // cycleniter == 0 means "whatever remains".
        let controls = IterationControls {
            niter: 100,
            cycle_niter: 0,
            ..Default::default()
        };
        let mut bot = IterationBot::new(controls, 1).unwrap();
        let cycle = bot.begin_minor_cycle(0, 10.0).unwrap();
        assert_eq!(cycle.cycle_niter, 100);
    }

    #[test]
    fn test_cycle_threshold_uses_field_sidelobe() {
        let mut bot = IterationBot::new(IterationControls::default(), 2).unwrap();
        bot.set_field_psf_sidelobe(0, 0.3);
        bot.set_field_psf_sidelobe(1, 0.05);

        let cycle0 = bot.begin_minor_cycle(0, 10.0).unwrap();
        let cycle1 = bot.begin_minor_cycle(1, 10.0).unwrap();
        assert_abs_diff_eq!(cycle0.cycle_threshold, 3.0);
        assert_abs_diff_eq!(cycle1.cycle_threshold, 0.5);
    }

    #[test]
    fn test_run_completion() {
        let controls = IterationControls {
            niter: 50,
            threshold: 0.5,
            ..Default::default()
        };
        let mut bot = IterationBot::new(controls, 2).unwrap();

        assert!(!bot.run_complete(&[3.0, 1.0]));
        // All fields under threshold.
        assert!(bot.run_complete(&[0.4, -0.2]));
        // Budget spent.
        bot.controller_mut(0).increment_minor_cycle_count(30);
        bot.controller_mut(1).increment_minor_cycle_count(25);
        assert!(bot.run_complete(&[3.0, 1.0]));
    }

    #[test]
    fn test_major_cycle_snapshots() {
        let mut bot = IterationBot::new(IterationControls::default(), 1).unwrap();
        bot.controller_mut(0).increment_minor_cycle_count(10);
        bot.end_major_cycle();
        bot.controller_mut(0).increment_minor_cycle_count(7);
        bot.end_major_cycle();

        assert_eq!(bot.major_cycles_done(), 2);
        let details = bot.get_iteration_details();
        let majors = details["major_cycles"].as_array().unwrap();
        assert_eq!(majors.len(), 2);
        assert_eq!(majors[0]["iterations_done"], 10);
        assert_eq!(majors[1]["iterations_done"], 17);
    }

    #[test]
    fn test_summary_serialises() {
        let mut bot = IterationBot::new(IterationControls::default(), 1).unwrap();
        bot.begin_minor_cycle(0, 5.0).unwrap();
        bot.controller_mut(0).increment_minor_cycle_count(3);
        bot.controller_mut(0).add_summary_minor(0, 0, 1.5, 3.5);

        let summary = bot.get_iteration_summary();
        assert_eq!(summary.iterations_done, 3);
        assert_abs_diff_eq!(summary.fields[0].peak_residual.unwrap(), 3.5);

        // It must round-trip through JSON for external clients.
        let value = serde_json::to_value(&summary).unwrap();
        assert_eq!(value["fields"][0]["iterations_done"], 3);
        assert_eq!(value["controls"]["loopgain"], 0.1_f32 as f64);
    }
}

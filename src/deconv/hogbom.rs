// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Hogbom CLEAN: greedy peak search and full-PSF subtraction.

use ndarray::prelude::*;

use super::{StepStatus, WorkingSet};

/// Run up to `cycle_niter` Hogbom iterations. Returns (iterations done, peak
/// residual, status).
pub(super) fn step(
    working: &mut WorkingSet,
    loop_gain: f32,
    cycle_niter: u32,
    cycle_threshold: f64,
) -> (u32, f64, StepStatus) {
    let initial_peak = working.peak().map(|(v, _)| f64::from(v.abs())).unwrap_or(0.0);
    let mut iterations = 0;

    loop {
        let Some((peak, pos)) = working.peak() else {
            // An all-masked field has nothing to clean.
            return (iterations, 0.0, StepStatus::ThresholdReached);
        };
        let abs_peak = f64::from(peak.abs());

        if !abs_peak.is_finite() || abs_peak > runaway_limit(initial_peak) {
            return (iterations, f64::from(peak), StepStatus::Diverged);
        }
        if abs_peak <= cycle_threshold {
            return (iterations, f64::from(peak), StepStatus::ThresholdReached);
        }
        if iterations >= cycle_niter {
            return (iterations, f64::from(peak), StepStatus::BudgetExhausted);
        }

        let delta = loop_gain * peak;
        let (i_chan, i_pol, y, x) = pos;
        working.model[pos] += delta;
        super::subtract_shifted(
            working.residual.slice_mut(s![i_chan, i_pol, .., ..]),
            working.psf.slice(s![i_chan, i_pol, .., ..]),
            working.psf_centre,
            (y, x),
            delta,
        );
        iterations += 1;
    }
}

/// A residual growing past this is treated as divergent rather than cleaned
/// harder.
pub(super) fn runaway_limit(initial_peak: f64) -> f64 {
    10.0 * initial_peak.max(f64::MIN_POSITIVE)
}

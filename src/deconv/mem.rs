// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Maximum-entropy deconvolution.
//!
//! Maximises H = -sum m log(m / q) against the data misfit, stepping the
//! model with a diagonal-Hessian Newton update on J = H - alpha * chi^2 / 2
//! and keeping every model pixel positive. The alpha weighting is fixed per
//! run; the step length is scaled by the loop gain.

use ndarray::prelude::*;

use super::{convolve_planes, StepStatus, WorkingSet};
use crate::gridding::fft::Fft2D;
use crate::math::masked_abs_peak;

#[derive(Clone, Debug)]
pub struct MemSettings {
    /// The default pixel level q the entropy measures against \[Jy/pixel\].
    pub default_level: f32,

    /// The weight of the data misfit against the entropy.
    pub alpha: f64,
}

impl Default for MemSettings {
    fn default() -> Self {
        MemSettings {
            default_level: 1e-4,
            alpha: 1.0,
        }
    }
}

pub(super) struct MemState {
    settings: MemSettings,
    /// Per-plane sum of squared PSF values: the diagonal of the chi^2
    /// Hessian.
    psf_sq_sum: Array2<f64>,
    initial_peak: f64,
    previous_chisq: f64,
    growth_count: u8,
}

impl MemState {
    pub(super) fn init(working: &mut WorkingSet, settings: &MemSettings) -> MemState {
        // Entropy needs a strictly positive model; an empty model starts at
        // the default level.
        let floor = settings.default_level * 1e-6;
        let default_level = settings.default_level;
        working.model.mapv_inplace(|m| m.max(floor));
        if working.model.iter().all(|&m| m <= floor) {
            working.model.fill(default_level);
        }

        let (num_chans, num_pols, _, _) = working.psf.dim();
        let mut psf_sq_sum = Array2::zeros((num_chans, num_pols));
        for i_chan in 0..num_chans {
            for i_pol in 0..num_pols {
                psf_sq_sum[(i_chan, i_pol)] = working
                    .psf
                    .slice(s![i_chan, i_pol, .., ..])
                    .iter()
                    .map(|&v| f64::from(v) * f64::from(v))
                    .sum();
            }
        }

        let initial_peak = working.peak().map(|(v, _)| f64::from(v.abs())).unwrap_or(0.0);
        MemState {
            settings: settings.clone(),
            psf_sq_sum,
            initial_peak,
            previous_chisq: f64::INFINITY,
            growth_count: 0,
        }
    }

    pub(super) fn step(
        &mut self,
        working: &mut WorkingSet,
        fft: &mut Fft2D,
        loop_gain: f32,
        cycle_niter: u32,
        cycle_threshold: f64,
    ) -> (u32, f64, StepStatus) {
        let (num_chans, num_pols, _, _) = working.residual.dim();
        let floor = f64::from(self.settings.default_level) * 1e-6;
        let q = f64::from(self.settings.default_level);
        let alpha = self.settings.alpha;
        let gain = f64::from(loop_gain);
        let mut iterations = 0;

        loop {
            let peak = masked_abs_peak(working.residual.view(), Some(working.mask.view()))
                .map(|(v, _)| f64::from(v))
                .unwrap_or(0.0);
            if !peak.is_finite() || peak.abs() > super::hogbom::runaway_limit(self.initial_peak) {
                return (iterations, peak, StepStatus::Diverged);
            }
            if peak.abs() <= cycle_threshold {
                return (iterations, peak, StepStatus::ThresholdReached);
            }
            if iterations >= cycle_niter {
                return (iterations, peak, StepStatus::BudgetExhausted);
            }

            // One entropy iteration over every plane.
            let mut chisq = 0.0;
            for i_chan in 0..num_chans {
                for i_pol in 0..num_pols {
                    let hessian_chisq = self.psf_sq_sum[(i_chan, i_pol)];
                    let residual_plane = working.residual.slice(s![i_chan, i_pol, .., ..]);
                    let psf_plane = working.psf.slice(s![i_chan, i_pol, .., ..]);

                    // The gradient of chi^2 against each model pixel is the
                    // residual convolved with the PSF.
                    let grad_chisq =
                        convolve_planes(residual_plane, psf_plane, working.psf_centre, fft);

                    let (_, _, num_y, num_x) = working.residual.dim();
                    let mut delta = Array2::<f32>::zeros((num_y, num_x));
                    {
                        let model_plane = working.model.slice(s![i_chan, i_pol, .., ..]);
                        let mask_plane = working.mask.slice(s![i_chan, i_pol, .., ..]);
                        for y in 0..num_y {
                            for x in 0..num_x {
                                if mask_plane[(y, x)] <= 0.0 {
                                    continue;
                                }
                                let m = f64::from(model_plane[(y, x)]).max(floor);
                                let grad_entropy = -(m / q).ln();
                                let grad = grad_entropy + alpha * f64::from(grad_chisq[(y, x)]);
                                let hessian = 1.0 / m + alpha * hessian_chisq;
                                let step = gain * grad / hessian;
                                // Keep the model positive.
                                let new_m = (m + step).max(floor);
                                delta[(y, x)] = (new_m - m) as f32;
                            }
                        }
                    }

                    let mut model_plane = working.model.slice_mut(s![i_chan, i_pol, .., ..]);
                    model_plane += &delta;

                    // The residual loses the newly-modelled emission.
                    let delta_conv =
                        convolve_planes(delta.view(), psf_plane, working.psf_centre, fft);
                    let mut residual_plane = working.residual.slice_mut(s![i_chan, i_pol, .., ..]);
                    residual_plane -= &delta_conv;

                    chisq += residual_plane
                        .iter()
                        .map(|&v| f64::from(v) * f64::from(v))
                        .sum::<f64>();
                }
            }
            iterations += 1;

            // A misfit that keeps growing means the entropy step is fighting
            // the data; stop and let the controller force a major cycle.
            if chisq > self.previous_chisq * 1.05 {
                self.growth_count += 1;
            } else {
                self.growth_count = 0;
            }
            self.previous_chisq = chisq;
            if self.growth_count >= 3 {
                let peak = masked_abs_peak(working.residual.view(), Some(working.mask.view()))
                    .map(|(v, _)| f64::from(v))
                    .unwrap_or(0.0);
                return (iterations, peak, StepStatus::Diverged);
            }
        }
    }
}

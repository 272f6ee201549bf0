// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Clark CLEAN.
//!
//! Each pass gathers the pixels above a flux limit derived from the PSF's
//! worst sidelobe into an active list, cleans greedily against a truncated
//! PSF patch within that list, then reconciles the full residual with one
//! FFT convolution of the accumulated components.

use ndarray::prelude::*;

use super::{convolve_planes, hogbom::runaway_limit, StepStatus, WorkingSet};
use crate::gridding::fft::Fft2D;
use crate::math::PixelPos;

#[derive(Clone, Debug)]
pub struct ClarkSettings {
    /// The most pixels an active list may hold; the strongest win.
    pub max_active_pixels: usize,

    /// Half-width of the truncated PSF patch used inside the inner loop
    /// \[pixels\].
    pub patch_support: usize,
}

impl Default for ClarkSettings {
    fn default() -> Self {
        ClarkSettings {
            max_active_pixels: 5000,
            patch_support: 10,
        }
    }
}

struct ActivePixel {
    pos: PixelPos,
    value: f32,
}

#[allow(clippy::too_many_arguments)]
pub(super) fn step(
    working: &mut WorkingSet,
    settings: &ClarkSettings,
    max_psf_sidelobe: f64,
    fft: &mut Fft2D,
    loop_gain: f32,
    cycle_niter: u32,
    cycle_threshold: f64,
) -> (u32, f64, StepStatus) {
    let initial_peak = working.peak().map(|(v, _)| f64::from(v.abs())).unwrap_or(0.0);
    let shape = working.residual.dim();
    let mut iterations = 0;

    loop {
        let Some((peak, _)) = working.peak() else {
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

        // Everything above the worst sidelobe of the current peak can be
        // cleaned before stale sidelobes poison the list.
        let flux_limit = (abs_peak * max_psf_sidelobe).max(cycle_threshold) as f32;
        let mut active = gather_active_pixels(working, flux_limit, settings.max_active_pixels);
        if active.is_empty() {
            return (iterations, f64::from(peak), StepStatus::ThresholdReached);
        }

        // Inner loop: greedy cleaning against the active list only, with the
        // truncated PSF patch.
        let mut delta_model: Array4<f32> = Array4::zeros(shape);
        let patch = settings.patch_support as isize;
        let iterations_at_pass_start = iterations;
        while iterations < cycle_niter {
            let Some(i_best) = active
                .iter()
                .enumerate()
                .max_by(|(_, a), (_, b)| {
                    a.value
                        .abs()
                        .partial_cmp(&b.value.abs())
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .map(|(i, _)| i)
            else {
                break;
            };
            let best_value = active[i_best].value;
            if best_value.abs() <= flux_limit {
                break;
            }

            let delta = loop_gain * best_value;
            let best_pos = active[i_best].pos;
            delta_model[best_pos] += delta;

            let (i_chan, i_pol, best_y, best_x) = best_pos;
            let (centre_y, centre_x) = working.psf_centre;
            for pixel in active.iter_mut() {
                let (p_chan, p_pol, p_y, p_x) = pixel.pos;
                if p_chan != i_chan || p_pol != i_pol {
                    continue;
                }
                let dy = p_y as isize - best_y as isize;
                let dx = p_x as isize - best_x as isize;
                if dy.abs() > patch || dx.abs() > patch {
                    continue;
                }
                let psf_y = centre_y as isize + dy;
                let psf_x = centre_x as isize + dx;
                let (_, _, psf_ny, psf_nx) = working.psf.dim();
                if psf_y < 0 || psf_y >= psf_ny as isize || psf_x < 0 || psf_x >= psf_nx as isize
                {
                    continue;
                }
                pixel.value -=
                    delta * working.psf[(i_chan, i_pol, psf_y as usize, psf_x as usize)];
            }
            iterations += 1;
        }

        // A pass that cannot subtract anything would spin forever; hand
        // control back so the driver can run a major cycle instead.
        if iterations == iterations_at_pass_start {
            return (iterations, f64::from(peak), StepStatus::BudgetExhausted);
        }

        // Reconcile the full residual with the components found in this
        // pass: residual -= delta_model (*) psf, model += delta_model.
        let (num_chans, num_pols, _, _) = shape;
        for i_chan in 0..num_chans {
            for i_pol in 0..num_pols {
                let delta_plane = delta_model.slice(s![i_chan, i_pol, .., ..]);
                if delta_plane.iter().all(|&v| v == 0.0) {
                    continue;
                }
                let convolved = convolve_planes(
                    delta_plane,
                    working.psf.slice(s![i_chan, i_pol, .., ..]),
                    working.psf_centre,
                    fft,
                );
                let mut residual_plane = working.residual.slice_mut(s![i_chan, i_pol, .., ..]);
                residual_plane -= &convolved;
            }
        }
        working.model += &delta_model;
    }
}

/// All masked-in pixels at or above the flux limit, strongest first, capped.
fn gather_active_pixels(
    working: &WorkingSet,
    flux_limit: f32,
    max_pixels: usize,
) -> Vec<ActivePixel> {
    let mut active: Vec<ActivePixel> = working
        .residual
        .indexed_iter()
        .filter(|&(pos, &value)| working.mask[pos] > 0.0 && value.abs() >= flux_limit)
        .map(|(pos, &value)| ActivePixel { pos, value })
        .collect();
    active.sort_unstable_by(|a, b| {
        b.value
            .abs()
            .partial_cmp(&a.value.abs())
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    active.truncate(max_pixels);
    active
}

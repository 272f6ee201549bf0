// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Multi-scale CLEAN.
//!
//! The residual is smoothed by a tapered-quadratic kernel per scale, and the
//! PSF by every pair of scales. Each iteration picks the scale and position
//! with the strongest (bias-weighted) smoothed residual, adds a scale-shaped
//! component to the model, and updates every smoothed residual with the
//! matching cross-scale PSF. Scale zero is a delta, so its smoothed residual
//! is the residual itself.

use ndarray::prelude::*;

use super::{convolve_planes, subtract_shifted, DeconvolveError, StepStatus, WorkingSet};
use crate::gridding::fft::Fft2D;
use crate::math::{masked_abs_peak, PixelPos};

#[derive(Clone, Debug)]
pub struct MultiScaleSettings {
    /// Scale radii \[pixels\]. A zero (point) scale is always included.
    pub scales: Vec<f64>,

    /// How strongly small scales are preferred when scales tie. 0 disables
    /// the bias.
    pub small_scale_bias: f32,
}

impl Default for MultiScaleSettings {
    fn default() -> Self {
        MultiScaleSettings {
            scales: vec![0.0, 3.0, 10.0],
            small_scale_bias: 0.6,
        }
    }
}

pub(super) struct MultiScaleState {
    scales: Vec<f64>,
    /// Unit-sum component kernels, one per scale.
    kernels: Vec<Array2<f32>>,
    /// The residual smoothed by each scale's kernel. Index 0 is the point
    /// scale and mirrors the working residual.
    smoothed: Vec<Array4<f32>>,
    /// The PSF smoothed by every ordered pair of scales; index `s * n + t`.
    cross_psf: Vec<Array4<f32>>,
    /// The centre value of `psf (*) k_s (*) k_s` per (channel, polarisation):
    /// the normalisation from smoothed peak to component amplitude.
    norms: Vec<Array2<f32>>,
    /// The scale preference weights.
    bias: Vec<f32>,
    initial_peak: f64,
}

impl MultiScaleState {
    pub(super) fn init(
        working: &mut WorkingSet,
        settings: &MultiScaleSettings,
        fft: &mut Fft2D,
    ) -> Result<MultiScaleState, DeconvolveError> {
        if settings.scales.is_empty() {
            return Err(DeconvolveError::NoScales);
        }
        let mut scales = settings.scales.clone();
        scales.sort_unstable_by(|a, b| a.partial_cmp(b).expect("scale sizes are finite"));
        scales.dedup();
        if scales[0] != 0.0 {
            scales.insert(0, 0.0);
        }

        let (_, _, num_y, num_x) = working.residual.dim();
        let kernels: Vec<Array2<f32>> = scales
            .iter()
            .map(|&scale| scale_kernel(num_y, num_x, working.psf_centre, scale))
            .collect();

        let num_scales = scales.len();
        let largest = scales[num_scales - 1].max(1.0);
        let bias: Vec<f32> = scales
            .iter()
            .map(|&s| 1.0 - settings.small_scale_bias * (s / largest) as f32)
            .collect();

        let mut state = MultiScaleState {
            scales,
            kernels,
            smoothed: Vec::new(),
            cross_psf: Vec::new(),
            norms: Vec::new(),
            bias,
            initial_peak: 0.0,
        };
        state.build_smoothed(working, fft);
        state.build_cross_psfs(working, fft)?;
        state.initial_peak = state.best_peak(working).map(|p| f64::from(p.value.abs())).unwrap_or(0.0);
        Ok(state)
    }

    /// Rebuild the smoothed residuals after a major cycle replaced the
    /// residual. The cross-scale PSFs depend only on the PSF and stay.
    pub(super) fn residual_replaced(
        &mut self,
        working: &WorkingSet,
        fft: &mut Fft2D,
    ) -> Result<(), DeconvolveError> {
        self.build_smoothed(working, fft);
        Ok(())
    }

    fn build_smoothed(&mut self, working: &WorkingSet, fft: &mut Fft2D) {
        let (num_chans, num_pols, _, _) = working.residual.dim();
        self.smoothed = self
            .kernels
            .iter()
            .enumerate()
            .map(|(i_scale, kernel)| {
                if i_scale == 0 {
                    return working.residual.clone();
                }
                let mut out = working.residual.clone();
                for i_chan in 0..num_chans {
                    for i_pol in 0..num_pols {
                        let plane = convolve_planes(
                            working.residual.slice(s![i_chan, i_pol, .., ..]),
                            kernel.view(),
                            working.psf_centre,
                            fft,
                        );
                        out.slice_mut(s![i_chan, i_pol, .., ..]).assign(&plane);
                    }
                }
                out
            })
            .collect();
    }

    fn build_cross_psfs(
        &mut self,
        working: &WorkingSet,
        fft: &mut Fft2D,
    ) -> Result<(), DeconvolveError> {
        let (num_chans, num_pols, _, _) = working.psf.dim();
        let num_scales = self.scales.len();

        // psf (*) k_s for each scale, then (*) k_t for each pair.
        let psf_s: Vec<Array4<f32>> = self
            .kernels
            .iter()
            .enumerate()
            .map(|(i_scale, kernel)| {
                convolve_cube(&working.psf, kernel, working.psf_centre, i_scale == 0, fft)
            })
            .collect();

        self.cross_psf = Vec::with_capacity(num_scales * num_scales);
        for i_s in 0..num_scales {
            for i_t in 0..num_scales {
                self.cross_psf.push(convolve_cube(
                    &psf_s[i_s],
                    &self.kernels[i_t],
                    working.psf_centre,
                    i_t == 0,
                    fft,
                ));
            }
        }

        // The per-plane peak response of a scale-s component through the
        // scale-s smoothed PSF. Non-positive values mean that scale cannot be
        // cleaned; step() reports divergence if it gets picked.
        let (centre_y, centre_x) = working.psf_centre;
        self.norms = (0..num_scales)
            .map(|i_s| {
                let psf_ss = &self.cross_psf[i_s * num_scales + i_s];
                let mut norm = Array2::zeros((num_chans, num_pols));
                for i_chan in 0..num_chans {
                    for i_pol in 0..num_pols {
                        norm[(i_chan, i_pol)] = psf_ss[(i_chan, i_pol, centre_y, centre_x)];
                    }
                }
                norm
            })
            .collect();
        Ok(())
    }

    fn best_peak(&self, working: &WorkingSet) -> Option<ScalePeak> {
        let mut best: Option<ScalePeak> = None;
        for (i_scale, smoothed) in self.smoothed.iter().enumerate() {
            let Some((value, pos)) = masked_abs_peak(smoothed.view(), Some(working.mask.view()))
            else {
                continue;
            };
            let weighted = value.abs() * self.bias[i_scale];
            if best
                .as_ref()
                .map(|b| weighted > b.weighted)
                .unwrap_or(true)
            {
                best = Some(ScalePeak {
                    i_scale,
                    pos,
                    value,
                    weighted,
                });
            }
        }
        best
    }

    pub(super) fn step(
        &mut self,
        working: &mut WorkingSet,
        loop_gain: f32,
        cycle_niter: u32,
        cycle_threshold: f64,
    ) -> (u32, f64, StepStatus) {
        let num_scales = self.scales.len();
        let mut iterations = 0;

        loop {
            // The reported peak is always the point-scale (true) residual.
            let point_peak = masked_abs_peak(self.smoothed[0].view(), Some(working.mask.view()))
                .map(|(v, _)| f64::from(v))
                .unwrap_or(0.0);
            if !point_peak.is_finite()
                || point_peak.abs() > super::hogbom::runaway_limit(self.initial_peak)
            {
                self.sync_residual(working);
                return (iterations, point_peak, StepStatus::Diverged);
            }
            if point_peak.abs() <= cycle_threshold {
                self.sync_residual(working);
                return (iterations, point_peak, StepStatus::ThresholdReached);
            }
            if iterations >= cycle_niter {
                self.sync_residual(working);
                return (iterations, point_peak, StepStatus::BudgetExhausted);
            }

            let Some(peak) = self.best_peak(working) else {
                self.sync_residual(working);
                return (iterations, 0.0, StepStatus::ThresholdReached);
            };
            let (i_chan, i_pol, y, x) = peak.pos;
            let norm = self.norms[peak.i_scale][(i_chan, i_pol)];
            if norm <= 0.0 || !norm.is_finite() {
                // A non-positive smoothed-PSF centre: this scale cannot
                // converge. Report it; the controller will force a major
                // cycle or abort.
                self.sync_residual(working);
                return (iterations, point_peak, StepStatus::Diverged);
            }

            let amp = loop_gain * peak.value / norm;

            // The component enters the model with its scale's shape.
            subtract_shifted(
                working.model.slice_mut(s![i_chan, i_pol, .., ..]),
                self.kernels[peak.i_scale].view(),
                working.psf_centre,
                (y, x),
                -amp,
            );

            // Every smoothed residual sees the component through the
            // matching cross-scale PSF.
            for i_t in 0..num_scales {
                let cross = &self.cross_psf[peak.i_scale * num_scales + i_t];
                subtract_shifted(
                    self.smoothed[i_t].slice_mut(s![i_chan, i_pol, .., ..]),
                    cross.slice(s![i_chan, i_pol, .., ..]),
                    working.psf_centre,
                    (y, x),
                    amp,
                );
            }
            iterations += 1;
        }
    }

    /// Copy the point-scale smoothed residual back into the working
    /// residual.
    fn sync_residual(&self, working: &mut WorkingSet) {
        working.residual.assign(&self.smoothed[0]);
    }
}

struct ScalePeak {
    i_scale: usize,
    pos: PixelPos,
    value: f32,
    weighted: f32,
}

/// A unit-sum tapered-quadratic component kernel, centred like the PSF. The
/// zero scale is a delta.
fn scale_kernel(num_y: usize, num_x: usize, centre: (usize, usize), scale: f64) -> Array2<f32> {
    let mut kernel = Array2::zeros((num_y, num_x));
    if scale <= 0.0 {
        kernel[centre] = 1.0;
        return kernel;
    }
    let mut sum = 0.0;
    for y in 0..num_y {
        for x in 0..num_x {
            let dy = y as f64 - centre.0 as f64;
            let dx = x as f64 - centre.1 as f64;
            let r = (dy * dy + dx * dx).sqrt() / scale;
            if r < 1.0 {
                let value = 1.0 - r * r;
                kernel[(y, x)] = value as f32;
                sum += value;
            }
        }
    }
    kernel.mapv_inplace(|v| v / sum as f32);
    kernel
}

/// Convolve each plane of a cube with a kernel; a delta kernel is an
/// identity.
fn convolve_cube(
    cube: &Array4<f32>,
    kernel: &Array2<f32>,
    centre: (usize, usize),
    is_delta: bool,
    fft: &mut Fft2D,
) -> Array4<f32> {
    if is_delta {
        return cube.clone();
    }
    let (num_chans, num_pols, _, _) = cube.dim();
    let mut out = cube.clone();
    for i_chan in 0..num_chans {
        for i_pol in 0..num_pols {
            let plane = convolve_planes(
                cube.slice(s![i_chan, i_pol, .., ..]),
                kernel.view(),
                centre,
                fft,
            );
            out.slice_mut(s![i_chan, i_pol, .., ..]).assign(&plane);
        }
    }
    out
}

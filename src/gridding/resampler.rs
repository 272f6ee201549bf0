// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Scatter (gridding) and gather (degridding) between visibility chunks and
//! uv-grid accumulators.

use std::sync::Arc;

use itertools::izip;
use marlu::constants::VEL_C;
use ndarray::prelude::*;
use num_complex::Complex;

use super::cf::{grid_correction, CfStore};
use super::fft::{fftshift, ifftshift, Fft2D};
use super::GridError;
use crate::context::ImagingContext;
use crate::image::{CoordSystem, Image};
use crate::vis::VisibilityChunk;

/// Counts of what happened to the samples of one resampling pass.
///
/// Per-sample anomalies (off-grid support patches, non-finite values) are
/// recovered locally; they are reported here and logged by the caller, never
/// turned into errors.
#[derive(Clone, Copy, Debug, Default)]
pub struct GridReport {
    /// Samples successfully gridded or degridded.
    pub gridded: usize,

    /// Samples ignored because they were flagged or had non-positive weight.
    pub flagged: usize,

    /// Samples whose support patch fell partly or fully off the grid.
    pub skipped_offgrid: usize,

    /// Samples with non-finite visibility or weight.
    pub skipped_nonfinite: usize,
}

impl std::ops::AddAssign for GridReport {
    fn add_assign(&mut self, rhs: GridReport) {
        self.gridded += rhs.gridded;
        self.flagged += rhs.flagged;
        self.skipped_offgrid += rhs.skipped_offgrid;
        self.skipped_nonfinite += rhs.skipped_nonfinite;
    }
}

/// A uv-grid accumulator: the complex grid plus its sum-of-weights matrix.
///
/// Created empty at the start of a major cycle, scatter-added into during
/// gridding, then finalised into an image and discarded.
#[derive(Clone, Debug)]
pub struct GriddedAccumulator {
    /// The gridded visibilities, axes (channel, polarisation, v, u).
    pub grid_cpvu: Array4<Complex<f64>>,

    /// The summed weights per (channel, polarisation).
    pub sum_weights_cp: Array2<f64>,
}

impl GriddedAccumulator {
    /// Allocate an empty accumulator matching the imaging context. The
    /// allocation is fallible: on failure the caller is told how much memory
    /// was needed rather than the process aborting.
    pub fn new(ctx: &ImagingContext) -> Result<GriddedAccumulator, GridError> {
        let shape = ctx.cube_shape();
        let num_elems = shape.0 * shape.1 * shape.2 * shape.3;
        let mut elems: Vec<Complex<f64>> = Vec::new();
        if elems.try_reserve_exact(num_elems).is_err() {
            return Err(GridError::InsufficientMemory {
                shape,
                need_mib: (num_elems * std::mem::size_of::<Complex<f64>>()) as u64 / 1024 / 1024,
            });
        }
        elems.resize(num_elems, Complex::default());
        let grid_cpvu =
            Array4::from_shape_vec(shape, elems).expect("shape matches reserved length");
        Ok(GriddedAccumulator {
            grid_cpvu,
            sum_weights_cp: Array2::zeros((shape.0, shape.1)),
        })
    }

    pub fn shape(&self) -> (usize, usize, usize, usize) {
        self.grid_cpvu.dim()
    }

    /// Zero the grid and weights for reuse in the next major cycle.
    pub fn reset(&mut self) {
        self.grid_cpvu.fill(Complex::default());
        self.sum_weights_cp.fill(0.0);
    }

    /// Element-wise sum another accumulator into this one. Addition is
    /// commutative up to floating-point rounding, so the order in which
    /// worker accumulators are merged does not matter.
    pub fn merge_from(&mut self, other: &GriddedAccumulator) -> Result<(), GridError> {
        if self.shape() != other.shape() {
            return Err(GridError::AccumulatorShapeMismatch {
                expected: self.shape(),
                got: other.shape(),
            });
        }
        self.grid_cpvu += &other.grid_cpvu;
        self.sum_weights_cp += &other.sum_weights_cp;
        Ok(())
    }

    /// The total summed weight over all channels and polarisations.
    pub fn total_weight(&self) -> f64 {
        self.sum_weights_cp.sum()
    }

    /// Transform the grid into an image: inverse FFT each plane, normalise by
    /// the summed weights, and divide out the gridding function's image-plane
    /// taper. Planes with zero weight come out as zeros.
    pub fn finalize(&self, ctx: &ImagingContext, fft: &mut Fft2D) -> Result<Image, GridError> {
        let (num_chans, num_pols, num_y, num_x) = self.shape();
        if self.shape() != ctx.cube_shape() {
            return Err(GridError::AccumulatorShapeMismatch {
                expected: ctx.cube_shape(),
                got: self.shape(),
            });
        }
        let corr_y = grid_correction(num_y);
        let corr_x = grid_correction(num_x);

        let mut data = Array4::zeros(self.shape());
        for i_chan in 0..num_chans {
            for i_pol in 0..num_pols {
                let sum_weight = self.sum_weights_cp[(i_chan, i_pol)];
                if sum_weight <= 0.0 {
                    continue;
                }
                let plane = self
                    .grid_cpvu
                    .slice(s![i_chan, i_pol, .., ..])
                    .to_owned();
                let mut plane = ifftshift(&plane);
                fft.inverse(&mut plane);
                let plane = fftshift(&plane);

                let mut out = data.slice_mut(s![i_chan, i_pol, .., ..]);
                for y in 0..num_y {
                    for x in 0..num_x {
                        let value = plane[(y, x)].re / sum_weight;
                        out[(y, x)] = (value / (corr_y[y] * corr_x[x])) as f32;
                    }
                }
            }
        }

        Ok(Image::new(data, CoordSystem::from_context(ctx)))
    }

    /// Fill the grid with the Fourier transform of a model image, ready for
    /// degridding. The image is pre-divided by the gridding function's taper
    /// so that the taper applied during the gather cancels out.
    pub fn load_model(
        &mut self,
        model: &Image,
        ctx: &ImagingContext,
        fft: &mut Fft2D,
    ) -> Result<(), GridError> {
        let (num_chans, num_pols, num_y, num_x) = self.shape();
        if model.shape() != self.shape() {
            return Err(GridError::ImageShapeMismatch {
                expected: self.shape(),
                got: model.shape(),
            });
        }
        if self.shape() != ctx.cube_shape() {
            return Err(GridError::AccumulatorShapeMismatch {
                expected: ctx.cube_shape(),
                got: self.shape(),
            });
        }
        let corr_y = grid_correction(num_y);
        let corr_x = grid_correction(num_x);

        let model_data = model.view();
        for i_chan in 0..num_chans {
            for i_pol in 0..num_pols {
                let mut plane = Array2::default((num_y, num_x));
                for y in 0..num_y {
                    for x in 0..num_x {
                        let value =
                            f64::from(model_data[(i_chan, i_pol, y, x)]) / (corr_y[y] * corr_x[x]);
                        plane[(y, x)] = Complex::new(value, 0.0);
                    }
                }
                let mut plane = ifftshift(&plane);
                fft.forward(&mut plane);
                let plane = fftshift(&plane);
                self.grid_cpvu
                    .slice_mut(s![i_chan, i_pol, .., ..])
                    .assign(&plane);
            }
        }
        self.sum_weights_cp.fill(0.0);
        Ok(())
    }
}

/// The single-threaded resampling kernel. Pure numerics: no iteration state,
/// no locks; the convolution-function store is shared read-only.
#[derive(Clone)]
pub struct VisibilityResampler {
    ctx: ImagingContext,
    cf_store: Arc<CfStore>,
    /// Grid cells per wavelength along u and v.
    u_scale: f64,
    v_scale: f64,
}

impl VisibilityResampler {
    pub fn new(ctx: &ImagingContext, cf_store: Arc<CfStore>) -> VisibilityResampler {
        VisibilityResampler {
            u_scale: 1.0 / ctx.uv_cell_u(),
            v_scale: 1.0 / ctx.uv_cell_v(),
            ctx: ctx.clone(),
            cf_store,
        }
    }

    /// Scatter a chunk onto the accumulator. With `compute_psf`, the weights
    /// are gridded in place of the visibilities, producing the sampling
    /// function whose transform is the PSF.
    pub fn data_to_grid(
        &self,
        acc: &mut GriddedAccumulator,
        chunk: &VisibilityChunk,
        compute_psf: bool,
    ) -> Result<GridReport, GridError> {
        chunk.validate(self.ctx.num_chans, self.ctx.num_pols)?;
        if acc.shape() != self.ctx.cube_shape() {
            return Err(GridError::AccumulatorShapeMismatch {
                expected: self.ctx.cube_shape(),
                got: acc.shape(),
            });
        }
        Ok(self.grid_rows(acc, chunk, 0..chunk.num_rows(), compute_psf))
    }

    /// The adjoint: gather predicted visibilities off a model grid into the
    /// chunk's model slot.
    pub fn grid_to_data(
        &self,
        chunk: &mut VisibilityChunk,
        acc: &GriddedAccumulator,
    ) -> Result<GridReport, GridError> {
        chunk.validate(self.ctx.num_chans, self.ctx.num_pols)?;
        if acc.shape() != self.ctx.cube_shape() {
            return Err(GridError::AccumulatorShapeMismatch {
                expected: self.ctx.cube_shape(),
                got: acc.shape(),
            });
        }
        let num_rows = chunk.num_rows();
        let mut model = std::mem::replace(&mut chunk.model_rcp, Array3::zeros((0, 0, 0)));
        let report = self.degrid_rows(chunk, 0..num_rows, model.view_mut(), acc);
        chunk.model_rcp = model;
        Ok(report)
    }

    /// Grid a contiguous block of chunk rows. The chunk must already have
    /// been validated.
    pub(super) fn grid_rows(
        &self,
        acc: &mut GriddedAccumulator,
        chunk: &VisibilityChunk,
        rows: std::ops::Range<usize>,
        compute_psf: bool,
    ) -> GridReport {
        let mut report = GridReport::default();
        let num_pols = chunk.num_pols();

        for i_row in rows {
            let uvw = chunk.uvws[i_row];
            for (i_chan, (&freq, &img_chan)) in
                izip!(&chunk.freqs, &chunk.chan_map).enumerate()
            {
                let inv_lambda = freq / VEL_C;
                let cf = self
                    .cf_store
                    .get(self.cf_store.class_for(uvw.w * inv_lambda))
                    .expect("class_for only returns valid classes");

                // Fractional grid positions of the sample and its Hermitian
                // conjugate.
                let Some(direct) = self.locate(uvw.u * inv_lambda, uvw.v * inv_lambda, cf) else {
                    report.skipped_offgrid += num_pols;
                    continue;
                };
                let Some(mirror) = self.locate(-uvw.u * inv_lambda, -uvw.v * inv_lambda, cf)
                else {
                    // Keep the grid strictly Hermitian: if either of the pair
                    // is unusable, grid neither.
                    report.skipped_offgrid += num_pols;
                    continue;
                };

                for (i_pol, &img_pol) in chunk.pol_map.iter().enumerate() {
                    if chunk.flags_rcp[(i_row, i_chan, i_pol)] {
                        report.flagged += 1;
                        continue;
                    }
                    let weight = chunk.weights_rcp[(i_row, i_chan, i_pol)];
                    if weight <= 0.0 {
                        report.flagged += 1;
                        continue;
                    }
                    let vis = if compute_psf {
                        Complex::new(1.0, 0.0)
                    } else {
                        let v = chunk.vis_rcp[(i_row, i_chan, i_pol)];
                        Complex::new(f64::from(v.re), f64::from(v.im))
                    };
                    if !vis.re.is_finite() || !vis.im.is_finite() || !weight.is_finite() {
                        report.skipped_nonfinite += 1;
                        continue;
                    }

                    let weighted = vis * f64::from(weight);
                    let mut plane = acc.grid_cpvu.slice_mut(s![img_chan, img_pol, .., ..]);
                    scatter_patch(&mut plane, cf, &direct, weighted);
                    scatter_patch(&mut plane, cf, &mirror, weighted.conj());
                    acc.sum_weights_cp[(img_chan, img_pol)] += 2.0 * f64::from(weight);
                    report.gridded += 1;
                }
            }
        }

        report
    }

    /// Degrid a contiguous block of chunk rows into `model_block`, whose row
    /// 0 corresponds to chunk row `rows.start`. The chunk must already have
    /// been validated.
    pub(super) fn degrid_rows(
        &self,
        chunk: &VisibilityChunk,
        rows: std::ops::Range<usize>,
        mut model_block: ArrayViewMut3<Complex<f32>>,
        acc: &GriddedAccumulator,
    ) -> GridReport {
        let mut report = GridReport::default();
        let num_pols = chunk.num_pols();
        let row_offset = rows.start;

        for i_row in rows {
            let uvw = chunk.uvws[i_row];
            for (i_chan, (&freq, &img_chan)) in
                izip!(&chunk.freqs, &chunk.chan_map).enumerate()
            {
                let inv_lambda = freq / VEL_C;
                let cf = self
                    .cf_store
                    .get(self.cf_store.class_for(uvw.w * inv_lambda))
                    .expect("class_for only returns valid classes");

                let Some(loc) = self.locate(uvw.u * inv_lambda, uvw.v * inv_lambda, cf) else {
                    report.skipped_offgrid += num_pols;
                    continue;
                };

                for (i_pol, &img_pol) in chunk.pol_map.iter().enumerate() {
                    if chunk.flags_rcp[(i_row, i_chan, i_pol)] {
                        report.flagged += 1;
                        continue;
                    }

                    let plane = acc.grid_cpvu.slice(s![img_chan, img_pol, .., ..]);
                    let mut sum = Complex::default();
                    let mut tap_sum = 0.0;
                    for i_tap_v in 0..=2 * cf.support {
                        let tap_v = cf.tap(loc.offset_v, i_tap_v);
                        let y = (loc.v - cf.support as isize + i_tap_v as isize) as usize;
                        for i_tap_u in 0..=2 * cf.support {
                            let tap = tap_v * cf.tap(loc.offset_u, i_tap_u);
                            let x = (loc.u - cf.support as isize + i_tap_u as isize) as usize;
                            sum += plane[(y, x)] * tap;
                            tap_sum += tap;
                        }
                    }
                    let predicted = if tap_sum > 0.0 { sum / tap_sum } else { sum };
                    model_block[(i_row - row_offset, i_chan, i_pol)] =
                        Complex::new(predicted.re as f32, predicted.im as f32);
                    report.gridded += 1;
                }
            }
        }

        report
    }

    /// Find where a (u, v) \[wavelengths\] sample lands on the grid. `None`
    /// if the support patch does not fit entirely on the grid; such samples
    /// are skipped, not clipped.
    fn locate(
        &self,
        u_lambda: f64,
        v_lambda: f64,
        cf: &super::cf::ConvolutionFunction,
    ) -> Option<PatchLocation> {
        let pos_u = u_lambda * self.u_scale + self.ctx.num_x as f64 / 2.0;
        let pos_v = v_lambda * self.v_scale + self.ctx.num_y as f64 / 2.0;
        let nearest_u = pos_u.round();
        let nearest_v = pos_v.round();
        let support = cf.support as isize;

        let u = nearest_u as isize;
        let v = nearest_v as isize;
        if u - support < 0
            || u + support >= self.ctx.num_x as isize
            || v - support < 0
            || v + support >= self.ctx.num_y as isize
        {
            return None;
        }

        Some(PatchLocation {
            u,
            v,
            offset_u: cf.offset_index(pos_u - nearest_u),
            offset_v: cf.offset_index(pos_v - nearest_v),
        })
    }
}

/// A support patch's centre cell and fractional-offset bins.
struct PatchLocation {
    u: isize,
    v: isize,
    offset_u: usize,
    offset_v: usize,
}

fn scatter_patch(
    plane: &mut ArrayViewMut2<Complex<f64>>,
    cf: &super::cf::ConvolutionFunction,
    loc: &PatchLocation,
    weighted_vis: Complex<f64>,
) {
    for i_tap_v in 0..=2 * cf.support {
        let tap_v = cf.tap(loc.offset_v, i_tap_v);
        let y = (loc.v - cf.support as isize + i_tap_v as isize) as usize;
        for i_tap_u in 0..=2 * cf.support {
            let tap = tap_v * cf.tap(loc.offset_u, i_tap_u);
            let x = (loc.u - cf.support as isize + i_tap_u as isize) as usize;
            plane[(y, x)] += weighted_vis * tap;
        }
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! 2-D FFTs between the uv grid and the image plane.
//!
//! Transforms are unnormalised in both directions; callers apply whatever
//! scaling their operation needs (the accumulator normalises by
//! sum-of-weights, prediction needs none).

use ndarray::prelude::*;
use num_complex::Complex;
use num_traits::Zero;
use rustfft::{Fft, FftPlanner};
use std::sync::Arc;

/// A 2-D FFT helper that owns its planner so plans are reused across planes
/// and major cycles.
pub struct Fft2D {
    planner: FftPlanner<f64>,
}

impl Default for Fft2D {
    fn default() -> Self {
        Self::new()
    }
}

impl Fft2D {
    pub fn new() -> Fft2D {
        Fft2D {
            planner: FftPlanner::new(),
        }
    }

    /// In-place forward transform (image plane to uv plane).
    pub fn forward(&mut self, plane: &mut Array2<Complex<f64>>) {
        let (ny, nx) = plane.dim();
        let row_fft = self.planner.plan_fft_forward(nx);
        let col_fft = self.planner.plan_fft_forward(ny);
        transform_2d(plane, row_fft, col_fft);
    }

    /// In-place inverse transform (uv plane to image plane).
    pub fn inverse(&mut self, plane: &mut Array2<Complex<f64>>) {
        let (ny, nx) = plane.dim();
        let row_fft = self.planner.plan_fft_inverse(nx);
        let col_fft = self.planner.plan_fft_inverse(ny);
        transform_2d(plane, row_fft, col_fft);
    }
}

/// Transform all rows, then all columns (via a transpose so the column pass
/// also runs on contiguous data).
fn transform_2d(
    plane: &mut Array2<Complex<f64>>,
    row_fft: Arc<dyn Fft<f64>>,
    col_fft: Arc<dyn Fft<f64>>,
) {
    for mut row in plane.rows_mut() {
        let slice = row
            .as_slice_mut()
            .expect("rows of a standard-layout array are contiguous");
        row_fft.process(slice);
    }

    let mut transposed = plane.t().as_standard_layout().into_owned();
    for mut row in transposed.rows_mut() {
        let slice = row
            .as_slice_mut()
            .expect("rows of a standard-layout array are contiguous");
        col_fft.process(slice);
    }
    plane.assign(&transposed.t());
}

/// Cyclically shift a plane so that the centre pixel moves to (0, 0).
pub fn ifftshift(plane: &Array2<Complex<f64>>) -> Array2<Complex<f64>> {
    let (ny, nx) = plane.dim();
    roll(plane, ny.div_ceil(2), nx.div_ceil(2))
}

/// Cyclically shift a plane so that pixel (0, 0) moves to the centre.
pub fn fftshift(plane: &Array2<Complex<f64>>) -> Array2<Complex<f64>> {
    let (ny, nx) = plane.dim();
    roll(plane, ny / 2, nx / 2)
}

fn roll(plane: &Array2<Complex<f64>>, shift_y: usize, shift_x: usize) -> Array2<Complex<f64>> {
    let (ny, nx) = plane.dim();
    let mut out = Array2::from_elem((ny, nx), Complex::zero());
    for y in 0..ny {
        for x in 0..nx {
            out[((y + shift_y) % ny, (x + shift_x) % nx)] = plane[(y, x)];
        }
    }
    out
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Anti-aliasing convolution functions and their lookup store.
//!
//! Taps are pre-oversampled; at gridding time the resampler does a
//! nearest-oversampled-tap lookup and nothing else. This is a fixed,
//! documented approximation, not numerical interpolation.

use ndarray::prelude::*;

use super::GridError;

/// The standard prolate-spheroidal wave function approximation (m = 6,
/// alpha = 1), evaluated at `nu` in \[-1, 1\]. Zero outside that interval.
///
/// This is the Schwab rational approximation used by the classic gridders.
pub fn spheroidal(nu: f64) -> f64 {
    const P1: [f64; 5] = [
        8.203343e-2,
        -3.644705e-1,
        6.278660e-1,
        -5.335581e-1,
        2.312756e-1,
    ];
    const Q1: [f64; 3] = [1.0, 8.212018e-1, 2.078043e-1];
    const P2: [f64; 5] = [
        4.028559e-3,
        -3.697768e-2,
        1.021332e-1,
        -1.201436e-1,
        6.412774e-2,
    ];
    const Q2: [f64; 3] = [1.0, 9.599102e-1, 2.918724e-1];

    let nu = nu.abs();
    let (p, q, end) = if nu <= 0.75 {
        (&P1, &Q1, 0.75)
    } else if nu <= 1.0 {
        (&P2, &Q2, 1.0)
    } else {
        return 0.0;
    };

    let delnusq = nu * nu - end * end;
    let mut top = 0.0;
    let mut dns_pow = 1.0;
    for &c in p {
        top += c * dns_pow;
        dns_pow *= delnusq;
    }
    let mut bot = 0.0;
    dns_pow = 1.0;
    for &c in q {
        bot += c * dns_pow;
        dns_pow *= delnusq;
    }
    top / bot
}

/// The image-plane correction for the spheroidal gridding function, along one
/// axis of `n` pixels, normalised to 1 at the reference pixel. Images made by
/// gridding are divided by the outer product of two of these.
pub fn grid_correction(n: usize) -> Array1<f64> {
    let centre = n as f64 / 2.0;
    let norm = spheroidal(0.0);
    Array1::from_iter((0..n).map(|i| {
        let nu = (i as f64 - centre) / centre;
        spheroidal(nu) / norm
    }))
}

/// One oversampled, separable anti-aliasing kernel.
///
/// `taps` holds, for each fractional-offset bin, the kernel evaluated at each
/// of the `2 * support + 1` cells a sample touches along one axis. Each
/// offset's taps are normalised to sum to 1 so that gridding conserves flux.
#[derive(Clone, Debug)]
pub struct ConvolutionFunction {
    /// Half-width of the support patch \[grid cells\].
    pub support: usize,

    /// Number of fractional-offset bins per grid cell.
    pub oversampling: usize,

    taps: Array2<f64>,
}

impl ConvolutionFunction {
    /// Build the prolate-spheroidal anti-aliasing kernel.
    pub fn anti_aliasing(support: usize, oversampling: usize) -> ConvolutionFunction {
        assert!(support >= 1);
        assert!(oversampling >= 1);
        let width = 2 * support + 1;
        let half_width = support as f64 + 0.5;
        let mut taps = Array2::zeros((oversampling, width));
        for i_offset in 0..oversampling {
            // Cell-centred fractional offset in [-0.5, 0.5).
            let frac = (i_offset as f64 + 0.5) / oversampling as f64 - 0.5;
            let mut row = taps.row_mut(i_offset);
            let mut sum = 0.0;
            for i_tap in 0..width {
                let dist = (i_tap as f64 - support as f64) - frac;
                let nu = dist / half_width;
                let value = (1.0 - nu * nu).max(0.0) * spheroidal(nu);
                row[i_tap] = value;
                sum += value;
            }
            row.mapv_inplace(|t| t / sum);
        }
        ConvolutionFunction {
            support,
            oversampling,
            taps,
        }
    }

    /// The offset bin for a fractional grid position in \[-0.5, 0.5).
    #[inline]
    pub fn offset_index(&self, frac: f64) -> usize {
        let i = ((frac + 0.5) * self.oversampling as f64) as usize;
        i.min(self.oversampling - 1)
    }

    /// The tap for cell `i_tap` (0 ..= 2 * support) at offset bin `i_offset`.
    #[inline]
    pub fn tap(&self, i_offset: usize, i_tap: usize) -> f64 {
        self.taps[(i_offset, i_tap)]
    }
}

/// A read-only lookup of convolution functions by baseline class.
///
/// Baselines are classified by |w|: longer w-terms smear the response over
/// more grid cells, so higher classes carry wider supports. The store is
/// built once per imaging run and shared read-only by all resampler workers.
#[derive(Clone, Debug)]
pub struct CfStore {
    cfs: Vec<ConvolutionFunction>,
    /// |w| (in wavelengths) at which the last class is reached.
    w_max: f64,
}

impl CfStore {
    /// A store with a single class; every baseline uses the same kernel.
    pub fn single(support: usize, oversampling: usize) -> CfStore {
        CfStore {
            cfs: vec![ConvolutionFunction::anti_aliasing(support, oversampling)],
            w_max: 0.0,
        }
    }

    /// A store with `num_classes` classes of increasing support, reaching
    /// `base_support + num_classes - 1` at `w_max` wavelengths.
    pub fn w_classed(
        base_support: usize,
        oversampling: usize,
        num_classes: usize,
        w_max: f64,
    ) -> CfStore {
        assert!(num_classes >= 1);
        let cfs = (0..num_classes)
            .map(|i| ConvolutionFunction::anti_aliasing(base_support + i, oversampling))
            .collect();
        CfStore { cfs, w_max }
    }

    pub fn num_classes(&self) -> usize {
        self.cfs.len()
    }

    /// The widest support of any class, for patch-fits-on-grid checks.
    pub fn max_support(&self) -> usize {
        self.cfs.iter().map(|cf| cf.support).max().unwrap_or(0)
    }

    /// The class for a baseline with the given |w| \[wavelengths\].
    pub fn class_for(&self, w_lambda: f64) -> usize {
        if self.cfs.len() == 1 || self.w_max <= 0.0 {
            return 0;
        }
        let frac = (w_lambda.abs() / self.w_max).min(1.0);
        ((frac * self.cfs.len() as f64) as usize).min(self.cfs.len() - 1)
    }

    pub fn get(&self, class: usize) -> Result<&ConvolutionFunction, GridError> {
        self.cfs.get(class).ok_or(GridError::UnknownCfClass {
            class,
            num_classes: self.cfs.len(),
        })
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Metadata on an imaging run.
//!
//! One [`ImagingContext`] is created per deconvolution run and passed by
//! reference into every component that needs grid geometry; there is no
//! process-wide imaging state.

use marlu::RADec;
use thiserror::Error;

/// The geometry of the image grid and the observation metadata needed to map
/// visibilities onto it.
#[derive(Clone, Debug)]
pub struct ImagingContext {
    /// The number of frequency channels in the image cube.
    pub num_chans: usize,

    /// The number of polarisations in the image cube.
    pub num_pols: usize,

    /// The image height \[pixels\].
    pub num_y: usize,

    /// The image width \[pixels\].
    pub num_x: usize,

    /// The angular size of a pixel along l \[radians\].
    pub cell_l: f64,

    /// The angular size of a pixel along m \[radians\].
    pub cell_m: f64,

    /// The phase centre of the observation.
    pub phase_centre: RADec,

    /// The centroid frequency of each image channel \[Hz\].
    pub freqs: Vec<f64>,
}

impl ImagingContext {
    /// Validate the supplied geometry. This is the fail-fast check for the
    /// whole imaging run; all downstream code may assume a valid context.
    pub fn new(
        num_chans: usize,
        num_pols: usize,
        num_y: usize,
        num_x: usize,
        cell_l: f64,
        cell_m: f64,
        phase_centre: RADec,
        freqs: Vec<f64>,
    ) -> Result<ImagingContext, ContextError> {
        if num_x < 2 || num_y < 2 {
            return Err(ContextError::ImageTooSmall { num_x, num_y });
        }
        if !(cell_l.is_finite() && cell_m.is_finite()) || cell_l <= 0.0 || cell_m <= 0.0 {
            return Err(ContextError::BadCellSize { cell_l, cell_m });
        }
        if freqs.len() != num_chans {
            return Err(ContextError::FreqCountMismatch {
                num_chans,
                num_freqs: freqs.len(),
            });
        }
        if num_pols == 0 || num_chans == 0 {
            return Err(ContextError::EmptyCube);
        }
        Ok(ImagingContext {
            num_chans,
            num_pols,
            num_y,
            num_x,
            cell_l,
            cell_m,
            phase_centre,
            freqs,
        })
    }

    /// The size of a uv-grid cell along u \[wavelengths\].
    pub fn uv_cell_u(&self) -> f64 {
        1.0 / (self.num_x as f64 * self.cell_l)
    }

    /// The size of a uv-grid cell along v \[wavelengths\].
    pub fn uv_cell_v(&self) -> f64 {
        1.0 / (self.num_y as f64 * self.cell_m)
    }

    /// The shape of the image cube as (channel, polarisation, y, x).
    pub fn cube_shape(&self) -> (usize, usize, usize, usize) {
        (self.num_chans, self.num_pols, self.num_y, self.num_x)
    }
}

#[derive(Error, Debug)]
pub enum ContextError {
    #[error("Image dimensions {num_x}x{num_y} are too small to grid onto")]
    ImageTooSmall { num_x: usize, num_y: usize },

    #[error("Pixel sizes must be positive and finite, got ({cell_l}, {cell_m}) rad")]
    BadCellSize { cell_l: f64, cell_m: f64 },

    #[error("{num_freqs} channel frequencies were supplied for {num_chans} image channels")]
    FreqCountMismatch { num_chans: usize, num_freqs: usize },

    #[error("An image cube needs at least one channel and one polarisation")]
    EmptyCube,
}

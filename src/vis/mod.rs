// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Visibility data as consumed and produced by the resampling engine.
//!
//! A [`VisibilityChunk`] is one batch of rows from a visibility source (e.g. a
//! measurement-set iterator). The resampler reads the observed visibilities
//! and writes predicted ones into the chunk's model slot; nothing else in the
//! chunk is ever mutated by this crate.

mod error;
pub mod simulate;

pub use error::VisError;

use marlu::UVW;
use ndarray::prelude::*;
use num_complex::Complex;

/// One batch of visibility samples. All arrays have axes (row, channel,
/// polarisation); the suffix on each name spells this out.
#[derive(Clone, Debug)]
pub struct VisibilityChunk {
    /// Baseline coordinates, one per row \[metres\].
    pub uvws: Vec<UVW>,

    /// The first antenna of each row's baseline.
    pub ant1: Vec<usize>,

    /// The second antenna of each row's baseline.
    pub ant2: Vec<usize>,

    /// The centroid frequency of each chunk channel \[Hz\].
    pub freqs: Vec<f64>,

    /// For each chunk channel, the image channel it contributes to.
    pub chan_map: Vec<usize>,

    /// For each chunk polarisation, the image polarisation it contributes to.
    pub pol_map: Vec<usize>,

    /// Observed visibilities.
    pub vis_rcp: Array3<Complex<f32>>,

    /// Predicted (degridded) visibilities. Written by
    /// [`grid_to_data`](crate::gridding::VisibilityResampler::grid_to_data).
    pub model_rcp: Array3<Complex<f32>>,

    /// Visibility weights. Non-positive weights are treated as flags.
    pub weights_rcp: Array3<f32>,

    /// Visibility flags. Flagged samples are never gridded or degridded.
    pub flags_rcp: Array3<bool>,
}

impl VisibilityChunk {
    /// An all-zero chunk with consistent shapes, ready to be filled.
    pub fn zeros(
        num_rows: usize,
        freqs: Vec<f64>,
        chan_map: Vec<usize>,
        pol_map: Vec<usize>,
    ) -> VisibilityChunk {
        let num_chans = freqs.len();
        let num_pols = pol_map.len();
        let shape = (num_rows, num_chans, num_pols);
        VisibilityChunk {
            uvws: vec![UVW::default(); num_rows],
            ant1: vec![0; num_rows],
            ant2: vec![0; num_rows],
            freqs,
            chan_map,
            pol_map,
            vis_rcp: Array3::zeros(shape),
            model_rcp: Array3::zeros(shape),
            weights_rcp: Array3::zeros(shape),
            flags_rcp: Array3::from_elem(shape, false),
        }
    }

    pub fn num_rows(&self) -> usize {
        self.vis_rcp.len_of(Axis(0))
    }

    pub fn num_chans(&self) -> usize {
        self.vis_rcp.len_of(Axis(1))
    }

    pub fn num_pols(&self) -> usize {
        self.vis_rcp.len_of(Axis(2))
    }

    /// Check that every per-row, per-channel and per-polarisation collection
    /// agrees with the data array's shape, and that the channel/polarisation
    /// maps stay within an image cube of `num_image_chans` ×
    /// `num_image_pols`. This runs before any sample is processed; a chunk
    /// that fails here has had no work done on it.
    pub fn validate(&self, num_image_chans: usize, num_image_pols: usize) -> Result<(), VisError> {
        let (num_rows, num_chans, num_pols) = self.vis_rcp.dim();
        if num_rows == 0 {
            return Err(VisError::EmptyChunk);
        }
        for (len, what) in [
            (self.uvws.len(), "uvws"),
            (self.ant1.len(), "ant1"),
            (self.ant2.len(), "ant2"),
        ] {
            if len != num_rows {
                return Err(VisError::RowCountMismatch {
                    what,
                    expected: num_rows,
                    got: len,
                });
            }
        }
        if self.freqs.len() != num_chans {
            return Err(VisError::ChanCountMismatch {
                what: "freqs",
                expected: num_chans,
                got: self.freqs.len(),
            });
        }
        if self.chan_map.len() != num_chans {
            return Err(VisError::ChanCountMismatch {
                what: "chan_map",
                expected: num_chans,
                got: self.chan_map.len(),
            });
        }
        if self.pol_map.len() != num_pols {
            return Err(VisError::PolCountMismatch {
                expected: num_pols,
                got: self.pol_map.len(),
            });
        }
        if let Some(&bad) = self.chan_map.iter().find(|&&c| c >= num_image_chans) {
            return Err(VisError::ChanMapOutOfBounds {
                index: bad,
                num_image_chans,
            });
        }
        if let Some(&bad) = self.pol_map.iter().find(|&&p| p >= num_image_pols) {
            return Err(VisError::PolMapOutOfBounds {
                index: bad,
                num_image_pols,
            });
        }
        for (shape, what) in [
            (self.model_rcp.dim(), "model"),
            (self.weights_rcp.dim(), "weights"),
        ] {
            if shape != (num_rows, num_chans, num_pols) {
                return Err(VisError::ArrayShapeMismatch {
                    what,
                    expected: (num_rows, num_chans, num_pols),
                    got: shape,
                });
            }
        }
        if self.flags_rcp.dim() != (num_rows, num_chans, num_pols) {
            return Err(VisError::ArrayShapeMismatch {
                what: "flags",
                expected: (num_rows, num_chans, num_pols),
                got: self.flags_rcp.dim(),
            });
        }
        Ok(())
    }

    /// The total weight of all unflagged samples.
    pub fn total_weight(&self) -> f64 {
        let mut total = 0.0;
        for (pos, &w) in self.weights_rcp.indexed_iter() {
            if !self.flags_rcp[pos] && w > 0.0 {
                total += f64::from(w);
            }
        }
        total
    }
}

/// The pull-style contract between the major-cycle driver and whatever
/// supplies visibility data. One pass over the data visits every chunk once;
/// [`VisibilitySource::reset`] rewinds for the next major cycle.
pub trait VisibilitySource {
    /// The next chunk, or `None` once the pass is complete.
    fn next_chunk(&mut self) -> Result<Option<VisibilityChunk>, VisError>;

    /// Rewind to the start of the data.
    fn reset(&mut self);
}

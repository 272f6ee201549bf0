// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use thiserror::Error;

use super::DeconvolverState;

#[derive(Error, Debug)]
pub enum DeconvolveError {
    #[error("Cannot {operation} a deconvolver in state {state:?}")]
    InvalidState {
        operation: &'static str,
        state: DeconvolverState,
    },

    #[error("The {what} image has shape {got:?}, but the residual has {expected:?}")]
    ShapeMismatch {
        what: &'static str,
        expected: (usize, usize, usize, usize),
        got: (usize, usize, usize, usize),
    },

    #[error("The PSF has no positive peak; nothing can be deconvolved with it")]
    BadPsf,

    #[error("The deconvolution mask sums to zero and the empty-mask policy is to reject")]
    EmptyMask,

    #[error("Loop gain must be in (0, 1], got {0}")]
    InvalidLoopGain(f32),

    #[error("Cycle threshold must be finite and non-negative, got {0}")]
    InvalidCycleThreshold(f64),

    #[error("Multi-scale needs at least one scale size")]
    NoScales,

    #[error(transparent)]
    Image(#[from] crate::image::ImageError),
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum GridError {
    #[error("Convolution-function class {class} requested, but the store has {num_classes}")]
    UnknownCfClass { class: usize, num_classes: usize },

    #[error("Accumulator has grid shape {got:?}, expected {expected:?}")]
    AccumulatorShapeMismatch {
        expected: (usize, usize, usize, usize),
        got: (usize, usize, usize, usize),
    },

    #[error(
        "Insufficient memory for a {shape:?} gridding accumulator; need {need_mib} MiB. \
         Reducing the resampler parallelism or the image size lowers this requirement."
    )]
    InsufficientMemory {
        shape: (usize, usize, usize, usize),
        need_mib: u64,
    },

    #[error("Image has shape {got:?}, expected {expected:?}")]
    ImageShapeMismatch {
        expected: (usize, usize, usize, usize),
        got: (usize, usize, usize, usize),
    },

    #[error(transparent)]
    Vis(#[from] crate::vis::VisError),
}

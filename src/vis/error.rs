// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum VisError {
    #[error("Visibility chunk has no rows")]
    EmptyChunk,

    #[error("Chunk {what} has {got} entries but the data array has {expected} rows")]
    RowCountMismatch {
        what: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("Chunk {what} has {got} entries but the data array has {expected} channels")]
    ChanCountMismatch {
        what: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("Chunk pol_map has {got} entries but the data array has {expected} polarisations")]
    PolCountMismatch { expected: usize, got: usize },

    #[error("Chunk chan_map refers to image channel {index}, but the image has {num_image_chans}")]
    ChanMapOutOfBounds {
        index: usize,
        num_image_chans: usize,
    },

    #[error("Chunk pol_map refers to image polarisation {index}, but the image has {num_image_pols}")]
    PolMapOutOfBounds {
        index: usize,
        num_image_pols: usize,
    },

    #[error("Chunk {what} array has shape {got:?}, expected {expected:?}")]
    ArrayShapeMismatch {
        what: &'static str,
        expected: (usize, usize, usize),
        got: (usize, usize, usize),
    },
}

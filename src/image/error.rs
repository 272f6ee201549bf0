// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use thiserror::Error;

use super::ImageKind;

#[derive(Error, Debug)]
pub enum ImageError {
    #[error("No {kind:?} image has been stored")]
    Missing { kind: ImageKind },

    #[error("Replacement {kind:?} image has shape {got:?}, expected {expected:?}")]
    ShapeMismatch {
        kind: ImageKind,
        expected: (usize, usize, usize, usize),
        got: (usize, usize, usize, usize),
    },

    #[error("A deconvolution mask must never grow after initialisation")]
    MaskGrew,
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The top-level error type, wrapping every module's own.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum VelaError {
    #[error(transparent)]
    Context(#[from] crate::context::ContextError),

    #[error(transparent)]
    Vis(#[from] crate::vis::VisError),

    #[error(transparent)]
    Grid(#[from] crate::gridding::GridError),

    #[error(transparent)]
    Image(#[from] crate::image::ImageError),

    #[error(transparent)]
    Deconvolve(#[from] crate::deconv::DeconvolveError),

    #[error(transparent)]
    Control(#[from] crate::controller::ControlError),

    #[error(transparent)]
    IO(#[from] std::io::Error),
}

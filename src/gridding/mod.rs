// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The visibility resampling engine.
//!
//! [`VisibilityResampler`] scatters visibility samples onto a uv grid
//! (`data_to_grid`) and gathers predicted visibilities back off it
//! (`grid_to_data`) through an anti-aliasing convolution function.
//! [`MultiThreadedVisibilityResampler`] runs the same operations across a
//! fixed pool of workers, each with a private accumulator, merged by an
//! explicit gather step.

mod cf;
mod error;
pub mod fft;
mod resampler;
#[cfg(test)]
mod tests;
mod threaded;

pub use cf::{spheroidal, CfStore, ConvolutionFunction};
pub use error::GridError;
pub use resampler::{GridReport, GriddedAccumulator, VisibilityResampler};
pub use threaded::MultiThreadedVisibilityResampler;

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Synthesis imaging for radio interferometry: visibility
//! gridding/degridding and CLEAN-family deconvolution with
//! major/minor-cycle control.

pub mod cli;
pub mod context;
pub mod controller;
pub mod deconv;
mod error;
pub mod gridding;
pub mod image;
pub mod imager;
pub mod iterbot;
pub(crate) mod math;
pub mod vis;

// Re-exports.
pub use context::ImagingContext;
pub use controller::{MinorCycleController, SummaryLog};
pub use deconv::{AlgorithmKind, Deconvolver};
pub use error::VelaError;
pub use gridding::{MultiThreadedVisibilityResampler, VisibilityResampler};
pub use imager::{CleanOutcome, Imager, ImagerParams};
pub use iterbot::{IterationBot, IterationControls};
pub use vis::{VisibilityChunk, VisibilitySource};

use crossbeam_utils::atomic::AtomicCell;

/// Are progress bars being drawn? Only the CLI sets this.
pub static PROGRESS_BARS: AtomicCell<bool> = AtomicCell::new(false);

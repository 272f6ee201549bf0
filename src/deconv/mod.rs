// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! CLEAN-family deconvolution.
//!
//! A [`Deconvolver`] owns one field's working images and steps one of a
//! closed set of algorithms (Hogbom, Clark, multi-scale, maximum entropy)
//! through the lifecycle `initialize` → `take_one_step`* → `finalize`.
//! Arithmetic trouble inside a step is reported as a [`StepStatus`], never a
//! panic or an error: the minor-cycle controller decides whether to continue,
//! force a major cycle, or abort.

mod clark;
mod error;
mod hogbom;
mod mem;
mod multiscale;
#[cfg(test)]
mod tests;

pub use clark::ClarkSettings;
pub use error::DeconvolveError;
pub use mem::MemSettings;
pub use multiscale::MultiScaleSettings;

use log::warn;
use ndarray::prelude::*;
use num_complex::Complex;
use strum_macros::{Display, EnumIter, EnumString};

use crate::gridding::fft::Fft2D;
use crate::image::{CoordSystem, Image, ImageKind, ImageStore};
use crate::math::{image_sum, masked_abs_peak, PixelPos};

/// The lifecycle of a deconvolver, per field.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeconvolverState {
    Uninitialized,
    Ready,
    Stepping,
    Finalized,
}

/// The closed set of algorithm variants.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display, EnumIter, EnumString)]
#[strum(serialize_all = "kebab-case")]
pub enum AlgorithmKind {
    Hogbom,
    Clark,
    MultiScale,
    Mem,
}

/// Per-variant settings; each variant carries its own state struct once
/// initialised.
#[derive(Clone, Debug)]
pub enum AlgorithmSettings {
    Hogbom,
    Clark(ClarkSettings),
    MultiScale(MultiScaleSettings),
    Mem(MemSettings),
}

impl AlgorithmSettings {
    /// Defaults for a named variant.
    pub fn defaults_for(kind: AlgorithmKind) -> AlgorithmSettings {
        match kind {
            AlgorithmKind::Hogbom => AlgorithmSettings::Hogbom,
            AlgorithmKind::Clark => AlgorithmSettings::Clark(ClarkSettings::default()),
            AlgorithmKind::MultiScale => {
                AlgorithmSettings::MultiScale(MultiScaleSettings::default())
            }
            AlgorithmKind::Mem => AlgorithmSettings::Mem(MemSettings::default()),
        }
    }

    pub fn kind(&self) -> AlgorithmKind {
        match self {
            AlgorithmSettings::Hogbom => AlgorithmKind::Hogbom,
            AlgorithmSettings::Clark(_) => AlgorithmKind::Clark,
            AlgorithmSettings::MultiScale(_) => AlgorithmKind::MultiScale,
            AlgorithmSettings::Mem(_) => AlgorithmKind::Mem,
        }
    }
}

/// What to do when a deconvolution mask sums to zero at initialisation.
///
/// The historical behaviour is to fill the mask with ones and continue with a
/// diagnostic; that stays the default. `Reject` turns the same condition into
/// a fail-fast configuration error instead.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum EmptyMaskPolicy {
    #[default]
    FillOnes,
    Reject,
}

/// How a step ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepStatus {
    /// The peak residual dropped to (or below) the cycle threshold.
    ThresholdReached,

    /// The per-cycle iteration budget was used up.
    BudgetExhausted,

    /// The step produced a non-finite or runaway residual. The working
    /// images are left at the last sane state.
    Diverged,
}

/// The outcome of one `take_one_step` call.
#[derive(Clone, Copy, Debug)]
pub struct StepReport {
    /// Iterations actually performed; may be less than the budget when the
    /// threshold (or trouble) is reached first.
    pub iterations_done: u32,

    /// The peak residual after the step.
    pub peak_residual: f64,

    /// The total model flux after the step.
    pub model_flux: f64,

    pub status: StepStatus,
}

/// One field's working images, loaded at `initialize` and written back at
/// `finalize`.
pub(crate) struct WorkingSet {
    pub(crate) residual: Array4<f32>,
    pub(crate) model: Array4<f32>,
    pub(crate) psf: Array4<f32>,
    pub(crate) mask: Array4<f32>,
    pub(crate) coords: CoordSystem,
    /// The (y, x) position of the PSF peak, common to all planes.
    pub(crate) psf_centre: (usize, usize),
}

impl WorkingSet {
    pub(crate) fn peak(&self) -> Option<(f32, PixelPos)> {
        masked_abs_peak(self.residual.view(), Some(self.mask.view()))
    }
}

enum VariantState {
    Hogbom,
    Clark(ClarkSettings),
    MultiScale(multiscale::MultiScaleState),
    Mem(mem::MemState),
}

/// A deconvolver for one field.
pub struct Deconvolver {
    state: DeconvolverState,
    settings: AlgorithmSettings,
    empty_mask_policy: EmptyMaskPolicy,
    variant: Option<VariantState>,
    working: Option<WorkingSet>,
    fft: Fft2D,
    peak_residual: f64,
    model_flux: f64,
    max_psf_sidelobe: f64,
}

impl Deconvolver {
    pub fn new(settings: AlgorithmSettings, empty_mask_policy: EmptyMaskPolicy) -> Deconvolver {
        Deconvolver {
            state: DeconvolverState::Uninitialized,
            settings,
            empty_mask_policy,
            variant: None,
            working: None,
            fft: Fft2D::new(),
            peak_residual: 0.0,
            model_flux: 0.0,
            max_psf_sidelobe: 0.0,
        }
    }

    pub fn state(&self) -> DeconvolverState {
        self.state
    }

    pub fn algorithm(&self) -> AlgorithmKind {
        self.settings.kind()
    }

    /// The peak residual as of the last initialise/step.
    pub fn peak_residual(&self) -> f64 {
        self.peak_residual
    }

    /// The total model flux as of the last initialise/step.
    pub fn model_flux(&self) -> f64 {
        self.model_flux
    }

    /// The largest PSF sidelobe magnitude, relative to the PSF peak.
    pub fn max_psf_sidelobe(&self) -> f64 {
        self.max_psf_sidelobe
    }

    /// Load the field's images into working arrays and prepare the variant.
    ///
    /// Transitions Uninitialized → Ready.
    pub fn initialize(&mut self, store: &dyn ImageStore) -> Result<(), DeconvolveError> {
        if self.state != DeconvolverState::Uninitialized {
            return Err(DeconvolveError::InvalidState {
                operation: "initialize",
                state: self.state,
            });
        }

        let residual_image = store.get(ImageKind::Residual)?;
        let coords = residual_image.coords().clone();
        let shape = residual_image.shape();
        let residual = residual_image.into_data();
        let model = store.get(ImageKind::Model)?.into_data();
        let psf = store.get(ImageKind::Psf)?.into_data();
        for (what, got) in [("model", model.dim()), ("psf", psf.dim())] {
            if got != shape {
                return Err(DeconvolveError::ShapeMismatch {
                    what,
                    expected: shape,
                    got,
                });
            }
        }

        // A missing mask means "deconvolve everywhere". An existing mask that
        // sums to zero is governed by the empty-mask policy.
        let mut mask = match store.get(ImageKind::Mask) {
            Ok(image) => {
                if image.shape() != shape {
                    return Err(DeconvolveError::ShapeMismatch {
                        what: "mask",
                        expected: shape,
                        got: image.shape(),
                    });
                }
                image.into_data()
            }
            Err(_) => Array4::ones(shape),
        };
        if image_sum(mask.view()) <= 0.0 {
            match self.empty_mask_policy {
                EmptyMaskPolicy::FillOnes => {
                    warn!(
                        "The deconvolution mask sums to zero; filling it with ones. \
                         If this is not what you want, check the mask configuration."
                    );
                    mask.fill(1.0);
                }
                EmptyMaskPolicy::Reject => return Err(DeconvolveError::EmptyMask),
            }
        }

        // The PSF must peak positively; all subtraction arithmetic assumes a
        // unit peak, so normalise if the input isn't.
        let (psf_peak, psf_peak_pos) = masked_abs_peak(psf.view(), None)
            .filter(|&(peak, _)| peak > 0.0)
            .ok_or(DeconvolveError::BadPsf)?;
        let mut psf = psf;
        if (f64::from(psf_peak) - 1.0).abs() > 1e-3 {
            warn!("PSF peak is {psf_peak}, not 1; normalising");
            psf.mapv_inplace(|v| v / psf_peak);
        }
        let psf_centre = (psf_peak_pos.2, psf_peak_pos.3);

        let mut working = WorkingSet {
            residual,
            model,
            psf,
            mask,
            coords,
            psf_centre,
        };
        self.max_psf_sidelobe = max_psf_sidelobe(&working);

        self.variant = Some(match &self.settings {
            AlgorithmSettings::Hogbom => VariantState::Hogbom,
            AlgorithmSettings::Clark(settings) => VariantState::Clark(settings.clone()),
            AlgorithmSettings::MultiScale(settings) => VariantState::MultiScale(
                multiscale::MultiScaleState::init(&mut working, settings, &mut self.fft)?,
            ),
            AlgorithmSettings::Mem(settings) => {
                VariantState::Mem(mem::MemState::init(&mut working, settings))
            }
        });

        self.peak_residual = working.peak().map(|(v, _)| f64::from(v)).unwrap_or(0.0);
        self.model_flux = image_sum(working.model.view());
        self.working = Some(working);
        self.state = DeconvolverState::Ready;
        Ok(())
    }

    /// Run up to `cycle_niter` iterations, stopping early at
    /// `cycle_threshold` on the absolute peak residual.
    ///
    /// Transitions Ready/Stepping → Stepping. Resumable: after a major cycle
    /// replaces the residual (via [`Deconvolver::update_residual`]), calling
    /// this again continues from the new residual.
    pub fn take_one_step(
        &mut self,
        loop_gain: f32,
        cycle_niter: u32,
        cycle_threshold: f64,
    ) -> Result<StepReport, DeconvolveError> {
        if !matches!(
            self.state,
            DeconvolverState::Ready | DeconvolverState::Stepping
        ) {
            return Err(DeconvolveError::InvalidState {
                operation: "take_one_step",
                state: self.state,
            });
        }
        if !(0.0..=1.0).contains(&loop_gain) || loop_gain == 0.0 {
            return Err(DeconvolveError::InvalidLoopGain(loop_gain));
        }
        if !cycle_threshold.is_finite() || cycle_threshold < 0.0 {
            return Err(DeconvolveError::InvalidCycleThreshold(cycle_threshold));
        }

        let working = self.working.as_mut().expect("initialised above");
        let variant = self.variant.as_mut().expect("initialised above");
        let (iterations_done, peak_residual, status) = match variant {
            VariantState::Hogbom => {
                hogbom::step(working, loop_gain, cycle_niter, cycle_threshold)
            }
            VariantState::Clark(settings) => clark::step(
                working,
                settings,
                self.max_psf_sidelobe,
                &mut self.fft,
                loop_gain,
                cycle_niter,
                cycle_threshold,
            ),
            VariantState::MultiScale(state) => {
                state.step(working, loop_gain, cycle_niter, cycle_threshold)
            }
            VariantState::Mem(state) => state.step(
                working,
                &mut self.fft,
                loop_gain,
                cycle_niter,
                cycle_threshold,
            ),
        };

        self.peak_residual = peak_residual;
        self.model_flux = image_sum(working.model.view());
        self.state = DeconvolverState::Stepping;
        Ok(StepReport {
            iterations_done,
            peak_residual,
            model_flux: self.model_flux,
            status,
        })
    }

    /// A snapshot of the working model, for the major-cycle driver to
    /// predict visibilities from. Non-destructive; stepping may continue.
    pub fn current_model(&self) -> Result<Image, DeconvolveError> {
        let working = self.working.as_ref().ok_or(DeconvolveError::InvalidState {
            operation: "current_model",
            state: self.state,
        })?;
        Ok(Image::new(working.model.clone(), working.coords.clone()))
    }

    /// Replace the working residual with a freshly-computed one (the product
    /// of a major cycle). The model is untouched.
    pub fn update_residual(&mut self, residual: &Image) -> Result<(), DeconvolveError> {
        let working = self.working.as_mut().ok_or(DeconvolveError::InvalidState {
            operation: "update_residual",
            state: self.state,
        })?;
        if residual.shape() != working.residual.dim() {
            return Err(DeconvolveError::ShapeMismatch {
                what: "residual",
                expected: working.residual.dim(),
                got: residual.shape(),
            });
        }
        working.residual.assign(&residual.view());
        if let Some(VariantState::MultiScale(state)) = self.variant.as_mut() {
            state.residual_replaced(working, &mut self.fft)?;
        }
        self.peak_residual = working.peak().map(|(v, _)| f64::from(v)).unwrap_or(0.0);
        Ok(())
    }

    /// Write the working model and residual back to the field's image store.
    ///
    /// Transitions Ready/Stepping → Finalized.
    pub fn finalize(&mut self, store: &mut dyn ImageStore) -> Result<(), DeconvolveError> {
        if !matches!(
            self.state,
            DeconvolverState::Ready | DeconvolverState::Stepping
        ) {
            return Err(DeconvolveError::InvalidState {
                operation: "finalize",
                state: self.state,
            });
        }
        let working = self.working.as_ref().expect("initialised above");
        store.put(
            ImageKind::Model,
            Image::new(working.model.clone(), working.coords.clone()),
        )?;
        store.put(
            ImageKind::Residual,
            Image::new(working.residual.clone(), working.coords.clone()),
        )?;
        self.state = DeconvolverState::Finalized;
        Ok(())
    }
}

/// The largest PSF sidelobe magnitude outside the main lobe, as a fraction of
/// the (unit) peak. Used for Clark flux limits and cycle-threshold policy.
fn max_psf_sidelobe(working: &WorkingSet) -> f64 {
    let (num_chans, num_pols, num_y, num_x) = working.psf.dim();
    let (centre_y, centre_x) = working.psf_centre;
    // The main lobe is taken as a small box about the peak.
    let exclusion = 3_isize;
    let mut max_sidelobe = 0.0_f64;
    for i_chan in 0..num_chans {
        for i_pol in 0..num_pols {
            for y in 0..num_y {
                for x in 0..num_x {
                    let dy = y as isize - centre_y as isize;
                    let dx = x as isize - centre_x as isize;
                    if dy.abs() <= exclusion && dx.abs() <= exclusion {
                        continue;
                    }
                    let v = f64::from(working.psf[(i_chan, i_pol, y, x)]).abs();
                    if v > max_sidelobe {
                        max_sidelobe = v;
                    }
                }
            }
        }
    }
    max_sidelobe
}

/// `image_plane -= amp * kernel_plane` with the kernel's `centre` aligned to
/// `pos`, clipped to the overlap.
pub(crate) fn subtract_shifted(
    mut image_plane: ArrayViewMut2<f32>,
    kernel_plane: ArrayView2<f32>,
    centre: (usize, usize),
    pos: (usize, usize),
    amp: f32,
) {
    let (num_y, num_x) = image_plane.dim();
    let (kernel_y, kernel_x) = kernel_plane.dim();
    let offset_y = pos.0 as isize - centre.0 as isize;
    let offset_x = pos.1 as isize - centre.1 as isize;

    let y_start = offset_y.max(0) as usize;
    let y_end = ((kernel_y as isize + offset_y).min(num_y as isize)).max(0) as usize;
    let x_start = offset_x.max(0) as usize;
    let x_end = ((kernel_x as isize + offset_x).min(num_x as isize)).max(0) as usize;

    for y in y_start..y_end {
        let ky = (y as isize - offset_y) as usize;
        for x in x_start..x_end {
            let kx = (x as isize - offset_x) as usize;
            image_plane[(y, x)] -= amp * kernel_plane[(ky, kx)];
        }
    }
}

/// Cyclic convolution of two planes via the FFT, with the kernel's centre at
/// `kernel_centre`. The result has the same shape as the inputs.
pub(crate) fn convolve_planes(
    image_plane: ArrayView2<f32>,
    kernel_plane: ArrayView2<f32>,
    kernel_centre: (usize, usize),
    fft: &mut Fft2D,
) -> Array2<f32> {
    let (num_y, num_x) = image_plane.dim();

    let mut a: Array2<Complex<f64>> = image_plane.mapv(|v| Complex::new(f64::from(v), 0.0));
    // Roll the kernel so its centre sits at the origin; the transform then
    // applies no phase gradient.
    let mut b: Array2<Complex<f64>> = Array2::default((num_y, num_x));
    for y in 0..num_y {
        for x in 0..num_x {
            let src_y = (y + kernel_centre.0) % num_y;
            let src_x = (x + kernel_centre.1) % num_x;
            b[(y, x)] = Complex::new(f64::from(kernel_plane[(src_y, src_x)]), 0.0);
        }
    }

    fft.forward(&mut a);
    fft.forward(&mut b);
    let mut c: Array2<Complex<f64>> = &a * &b;
    fft.inverse(&mut c);

    let norm = (num_y * num_x) as f64;
    c.mapv(|v| (v.re / norm) as f32)
}

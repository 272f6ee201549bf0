// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The major-cycle driver.
//!
//! Ties the resampling engine, the deconvolver and the iteration session
//! together: make the PSF and the dirty image, then alternate minor-cycle
//! stepping with full regrid-predict-subtract major cycles until the run
//! converges, the budget runs out, or the operator aborts. Cancellation is
//! observed at cycle boundaries only; an aborted run still carries valid
//! (if unconverged) model and residual images.

use std::num::NonZeroUsize;
use std::sync::Arc;

use crossbeam_channel::bounded;
use crossbeam_utils::atomic::AtomicCell;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use log::{debug, info, warn};
use scopeguard::defer_on_unwind;
use std::thread;

use crate::context::ImagingContext;
use crate::controller::ControlError;
use crate::deconv::{
    AlgorithmSettings, Deconvolver, EmptyMaskPolicy, StepStatus,
};
use crate::error::VelaError;
use crate::gridding::fft::Fft2D;
use crate::gridding::{
    CfStore, GridReport, GriddedAccumulator, MultiThreadedVisibilityResampler,
};
use crate::image::{Image, ImageKind, ImageStore, MemoryImageStore};
use crate::iterbot::{IterationBot, IterationControls};
use crate::vis::{VisError, VisibilitySource};
use crate::PROGRESS_BARS;

/// Everything needed to set up an imaging run.
pub struct ImagerParams {
    pub ctx: ImagingContext,

    /// Convolution-function half-support \[grid cells\].
    pub cf_support: usize,

    /// Convolution-function oversampling per grid cell.
    pub cf_oversampling: usize,

    /// Number of w-classes in the convolution-function store. 1 disables
    /// w-dependent kernels.
    pub cf_w_classes: usize,

    /// The |w| \[wavelengths\] mapped to the widest class.
    pub cf_w_max: f64,

    /// Resampler worker count; `None` uses the rayon thread count.
    pub num_workers: Option<NonZeroUsize>,

    pub algorithm: AlgorithmSettings,
    pub empty_mask_policy: EmptyMaskPolicy,
    pub iteration: IterationControls,
    pub interactive: bool,
}

/// What a finished (or aborted) run hands back.
pub struct CleanOutcome {
    pub iterations_done: u64,
    pub major_cycles_done: u32,
    pub final_peak_residual: f64,
    pub model_flux: f64,
    pub aborted: bool,

    /// The full iteration history, serialisable for external clients.
    pub details: serde_json::Value,

    pub model: Image,
    pub residual: Image,
    pub psf: Image,
}

pub struct Imager<S> {
    ctx: ImagingContext,
    source: S,
    resampler: MultiThreadedVisibilityResampler,
    fft: Fft2D,
    store: MemoryImageStore,
    deconvolver: Deconvolver,
    iterbot: IterationBot,
}

impl<S: VisibilitySource + Send> Imager<S> {
    pub fn new(params: ImagerParams, source: S) -> Result<Imager<S>, VelaError> {
        let cf_store = Arc::new(if params.cf_w_classes > 1 {
            CfStore::w_classed(
                params.cf_support,
                params.cf_oversampling,
                params.cf_w_classes,
                params.cf_w_max,
            )
        } else {
            CfStore::single(params.cf_support, params.cf_oversampling)
        });
        let resampler =
            MultiThreadedVisibilityResampler::new(&params.ctx, cf_store, params.num_workers)?;
        let mut iterbot = IterationBot::new(params.iteration, 1)?;
        iterbot.set_interactive_mode(params.interactive);

        Ok(Imager {
            ctx: params.ctx,
            source,
            resampler,
            fft: Fft2D::new(),
            store: MemoryImageStore::new(),
            deconvolver: Deconvolver::new(params.algorithm, params.empty_mask_policy),
            iterbot,
        })
    }

    /// The iteration session, for external clients that want to watch or
    /// steer the run.
    pub fn iterbot(&self) -> &IterationBot {
        &self.iterbot
    }

    pub fn iterbot_mut(&mut self) -> &mut IterationBot {
        &mut self.iterbot
    }

    /// Run the whole imaging loop.
    pub fn run(&mut self) -> Result<CleanOutcome, VelaError> {
        info!(
            "Imaging {}x{} pixels, {} channels, {} polarisations with {} workers",
            self.ctx.num_x,
            self.ctx.num_y,
            self.ctx.num_chans,
            self.ctx.num_pols,
            self.resampler.num_workers(),
        );

        // The PSF and the first (dirty) residual.
        info!("Gridding the point-spread function");
        let psf = self.grid_pass(true, None)?;
        self.store.put(ImageKind::Psf, psf.clone())?;

        info!("Gridding the dirty image");
        let dirty = self.grid_pass(false, None)?;
        self.store.put(ImageKind::Residual, dirty)?;
        self.store.put(ImageKind::Model, Image::zeros(&self.ctx))?;

        self.deconvolver.initialize(&self.store)?;
        self.iterbot
            .set_field_psf_sidelobe(0, self.deconvolver.max_psf_sidelobe());
        info!(
            "{} deconvolution; initial peak residual {:+.6e} Jy, worst PSF sidelobe {:.3}",
            self.deconvolver.algorithm(),
            self.deconvolver.peak_residual(),
            self.deconvolver.max_psf_sidelobe(),
        );

        let progress = ProgressBar::with_draw_target(
            Some(self.iterbot.controls().niter),
            if PROGRESS_BARS.load() {
                ProgressDrawTarget::stdout()
            } else {
                ProgressDrawTarget::hidden()
            },
        )
        .with_style(
            ProgressStyle::default_bar()
                .template("{msg:18}: [{wide_bar:.blue}] {pos:6}/{len:6} iterations")
                .unwrap()
                .progress_chars("=> "),
        )
        .with_message("Deconvolving");

        let mut aborted = false;
        let mut iterations_before_cycle = 0;
        loop {
            let peak = self.deconvolver.peak_residual();
            if self.iterbot.run_complete(&[peak]) {
                info!("Reached the iteration budget or the threshold; stopping");
                break;
            }
            if self.iterbot.major_cycles_done() > 0
                && self.iterbot.total_iterations() == iterations_before_cycle
            {
                warn!("A whole major cycle made no progress; stopping early");
                break;
            }
            iterations_before_cycle = self.iterbot.total_iterations();
            if self.iterbot.aborted() {
                aborted = true;
                break;
            }

            // The one place an interactive client gets to change the
            // controls mid-run.
            match self.iterbot.pause_for_user_interaction(0) {
                Ok(Some(new_controls)) => {
                    info!("Interactive controls received: {new_controls:?}")
                }
                Ok(None) => (),
                Err(ControlError::Aborted) => {
                    aborted = true;
                    break;
                }
                Err(e) => return Err(e.into()),
            }

            let cycle = self.iterbot.begin_minor_cycle(0, peak)?;
            debug!(
                "Minor cycle set: budget {} iterations, threshold {:.6e} Jy",
                cycle.cycle_niter, cycle.cycle_threshold
            );

            // Minor-cycle stepping until the controller demands a major
            // cycle.
            let mut diverged = false;
            loop {
                let remaining = cycle
                    .cycle_niter
                    .saturating_sub(self.iterbot.controller(0).cycle_iterations());
                if remaining == 0 {
                    break;
                }
                let report = self.deconvolver.take_one_step(
                    cycle.loop_gain,
                    remaining,
                    cycle.cycle_threshold,
                )?;
                let controller = self.iterbot.controller_mut(0);
                controller.increment_minor_cycle_count(report.iterations_done);
                controller.add_summary_minor(0, 0, report.model_flux, report.peak_residual);
                progress.inc(u64::from(report.iterations_done));

                if report.status == StepStatus::Diverged {
                    warn!(
                        "Deconvolution reported divergence at peak {:+.6e} Jy; \
                         forcing a major cycle",
                        report.peak_residual
                    );
                    diverged = true;
                    break;
                }
                if self
                    .iterbot
                    .controller(0)
                    .major_cycle_required(report.peak_residual)
                {
                    break;
                }
            }

            // A full major cycle: predict the model, subtract, regrid.
            self.execute_major_cycle()?;
            let controller = self.iterbot.controller(0);
            debug!(
                "Major cycle {} done after {} total iterations{}",
                self.iterbot.major_cycles_done() + 1,
                controller.total_iterations(),
                if diverged { " (divergence recovery)" } else { "" },
            );
            self.iterbot.end_major_cycle();
            info!(
                "Major cycle {:>3}: peak residual {:+.6e} Jy, model flux {:.6e} Jy",
                self.iterbot.major_cycles_done(),
                self.deconvolver.peak_residual(),
                self.deconvolver.model_flux(),
            );
        }
        progress.abandon();

        // Whatever state we stopped in is written back whole; an aborted run
        // is incomplete, never corrupt.
        self.deconvolver.finalize(&mut self.store)?;
        self.iterbot.controller_mut(0).mark_done();

        Ok(CleanOutcome {
            iterations_done: self.iterbot.total_iterations(),
            major_cycles_done: self.iterbot.major_cycles_done(),
            final_peak_residual: self.deconvolver.peak_residual(),
            model_flux: self.deconvolver.model_flux(),
            aborted,
            details: self.iterbot.get_iteration_details(),
            model: self.store.get(ImageKind::Model)?,
            residual: self.store.get(ImageKind::Residual)?,
            psf: self.store.get(ImageKind::Psf)?,
        })
    }

    /// Degrid the current model into predicted visibilities, subtract them
    /// from the data, and grid the difference into a fresh residual.
    fn execute_major_cycle(&mut self) -> Result<(), VelaError> {
        let model = self.deconvolver.current_model()?;
        let mut model_acc = GriddedAccumulator::new(&self.ctx)?;
        model_acc.load_model(&model, &self.ctx, &mut self.fft)?;

        let residual = self.grid_pass(false, Some(&model_acc))?;
        self.store.put(ImageKind::Residual, residual.clone())?;
        self.deconvolver.update_residual(&residual)?;
        Ok(())
    }

    /// One full pass over the visibility source: read chunks on a dedicated
    /// thread, (optionally) degrid-and-subtract the model, scatter across
    /// the worker pool, then gather and finalise into an image.
    fn grid_pass(
        &mut self,
        compute_psf: bool,
        model_acc: Option<&GriddedAccumulator>,
    ) -> Result<Image, VelaError> {
        self.resampler.reset();
        self.source.reset();

        let source = &mut self.source;
        let resampler = &mut self.resampler;
        let error = AtomicCell::new(false);
        let error = &error;
        let (tx, rx) = bounded(4);

        let mut report = GridReport::default();
        let mut num_chunks = 0_usize;
        thread::scope(|scope| -> Result<(), VelaError> {
            // Visibility-reading thread.
            let read_handle = thread::Builder::new()
                .name("read".to_string())
                .spawn_scoped(scope, move || -> Result<(), VisError> {
                    defer_on_unwind! { error.store(true); }
                    loop {
                        if error.load() {
                            return Ok(());
                        }
                        match source.next_chunk() {
                            Ok(Some(chunk)) => {
                                // A send fails only when the gridding side
                                // has already bailed out.
                                if tx.send(chunk).is_err() {
                                    return Ok(());
                                }
                            }
                            Ok(None) => return Ok(()),
                            Err(e) => {
                                error.store(true);
                                return Err(e);
                            }
                        }
                    }
                })
                .expect("OS can create threads");

            // Gridding happens on the calling thread.
            for mut chunk in rx.iter() {
                let chunk_result = (|| -> Result<GridReport, VelaError> {
                    let mut chunk_report = GridReport::default();
                    if let Some(acc) = model_acc {
                        chunk_report += resampler.degrid(&mut chunk, acc)?;
                        // The difference between observed and predicted is
                        // what lands on the residual grid.
                        chunk
                            .vis_rcp
                            .zip_mut_with(&chunk.model_rcp, |vis, &model| *vis -= model);
                    }
                    chunk_report += resampler.scatter(&chunk, compute_psf)?;
                    Ok(chunk_report)
                })();
                match chunk_result {
                    Ok(chunk_report) => {
                        report += chunk_report;
                        num_chunks += 1;
                    }
                    Err(e) => {
                        error.store(true);
                        // Drain so the reader can finish and join.
                        for _ in rx.iter() {}
                        read_handle.join().expect("reader does not panic").ok();
                        return Err(e);
                    }
                }
            }

            read_handle
                .join()
                .expect("reader does not panic")
                .map_err(VelaError::from)
        })?;

        debug!(
            "Pass complete: {num_chunks} chunks, {} samples gridded, {} flagged",
            report.gridded, report.flagged
        );
        if report.skipped_nonfinite > 0 {
            warn!(
                "{} samples had non-finite visibilities or weights and were skipped",
                report.skipped_nonfinite
            );
        }
        if report.skipped_offgrid > 0 {
            debug!(
                "{} samples fell (partly) off the grid and were skipped",
                report.skipped_offgrid
            );
        }

        let mut final_acc = GriddedAccumulator::new(&self.ctx)?;
        self.resampler.gather(&mut final_acc)?;
        Ok(final_acc.finalize(&self.ctx, &mut self.fft)?)
    }
}

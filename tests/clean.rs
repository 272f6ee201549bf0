// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! End-to-end imaging tests: simulate a track, grid it, CLEAN it through
//! real major cycles, and check what comes out.

use std::num::NonZeroUsize;

use marlu::RADec;

use vela::context::ImagingContext;
use vela::deconv::{AlgorithmSettings, EmptyMaskPolicy};
use vela::imager::{Imager, ImagerParams};
use vela::iterbot::IterationControls;
use vela::vis::simulate::{PointSource, SimulateVisParams, SimulatedVis};

fn test_context(size: usize) -> ImagingContext {
    // 30 arcsec pixels at 150 MHz over a few-hundred-metre array.
    ImagingContext::new(
        1,
        1,
        size,
        size,
        1.454e-4,
        1.454e-4,
        RADec::from_degrees(0.0, -27.0),
        vec![150e6],
    )
    .unwrap()
}

fn test_source(sources: Vec<PointSource>) -> SimulatedVis {
    SimulatedVis::new(SimulateVisParams {
        antennas_enh: vec![
            (0.0, 0.0, 0.0),
            (120.0, 30.0, 0.0),
            (-60.0, 200.0, 1.0),
            (300.0, -150.0, 2.0),
            (50.0, 90.0, 0.0),
            (-200.0, -80.0, 0.0),
        ],
        num_timesteps: 12,
        int_time: 120.0,
        ha_start: -0.3,
        dec: -0.47,
        freqs: vec![150e6],
        num_pols: 1,
        sources,
    })
    .unwrap()
}

fn imager_params(ctx: ImagingContext, niter: u64, threshold: f64) -> ImagerParams {
    ImagerParams {
        ctx,
        cf_support: 4,
        cf_oversampling: 100,
        cf_w_classes: 1,
        cf_w_max: 1000.0,
        num_workers: NonZeroUsize::new(2),
        algorithm: AlgorithmSettings::Hogbom,
        empty_mask_policy: EmptyMaskPolicy::default(),
        iteration: IterationControls {
            niter,
            threshold,
            loop_gain: 0.1,
            cycle_niter: 50,
            cycle_factor: 1.0,
        },
        interactive: false,
    }
}

#[test]
fn test_clean_recovers_centred_point_source() {
    let flux = 2.0;
    let source = test_source(vec![PointSource::at_offset(0.0, 0.0, flux)]);
    let mut imager = Imager::new(imager_params(test_context(64), 500, 0.02), source).unwrap();

    let outcome = imager.run().unwrap();
    assert!(!outcome.aborted);
    assert!(outcome.iterations_done > 0);
    assert!(outcome.major_cycles_done >= 1);

    // The run either hit the threshold or spent the whole budget; either
    // way the source must be mostly cleaned.
    assert!(
        outcome.final_peak_residual.abs() < 0.25 * flux,
        "final peak {} too high",
        outcome.final_peak_residual
    );
    assert!(
        (outcome.model_flux - flux).abs() < 0.3 * flux,
        "model flux {} is far from the injected {flux}",
        outcome.model_flux
    );

    // The model's peak sits where the source was injected.
    let mut model = outcome.model;
    let stats = model.stats();
    assert_eq!((stats.peak_pos.2, stats.peak_pos.3), (32, 32));
}

#[test]
fn test_clean_offset_source_lands_on_right_pixel() {
    // 10 pixels east, 5 pixels north of the phase centre.
    let ctx = test_context(64);
    let l = 10.0 * ctx.cell_l;
    let m = 5.0 * ctx.cell_m;
    let source = test_source(vec![PointSource::at_offset(l, m, 1.5)]);
    let mut imager = Imager::new(imager_params(ctx, 300, 0.05), source).unwrap();

    let outcome = imager.run().unwrap();
    let mut model = outcome.model;
    let stats = model.stats();
    assert_eq!((stats.peak_pos.2, stats.peak_pos.3), (37, 42));
    assert!(stats.peak > 0.0);
}

#[test]
fn test_iteration_details_are_recorded() {
    let source = test_source(vec![PointSource::at_offset(0.0, 0.0, 1.0)]);
    let mut imager = Imager::new(imager_params(test_context(64), 100, 0.01), source).unwrap();

    let outcome = imager.run().unwrap();
    let details = outcome.details;

    // The summary must be a well-formed record an external client can
    // consume: per-field state plus one minor-cycle log row per step.
    assert_eq!(details["summary"]["iterations_done"], outcome.iterations_done);
    let rows = details["minor_cycle_log"][0].as_array().unwrap();
    assert!(!rows.is_empty());
    let majors = details["major_cycles"].as_array().unwrap();
    assert_eq!(majors.len(), outcome.major_cycles_done as usize);

    // Iteration counts in the log never decrease (the summary is
    // append-only).
    let mut last = 0;
    for row in rows {
        let iteration = row["iteration"].as_u64().unwrap();
        assert!(iteration >= last);
        last = iteration;
    }
}

#[test]
fn test_aborted_run_leaves_valid_images() {
    let source = test_source(vec![PointSource::at_offset(0.0, 0.0, 1.0)]);
    let mut imager = Imager::new(imager_params(test_context(64), 100_000, 0.0), source).unwrap();

    // Abort before the run starts: the loop must stop at the first cycle
    // boundary and still hand back whole images.
    imager.iterbot().abort();
    let outcome = imager.run().unwrap();
    assert!(outcome.aborted);

    let mut residual = outcome.residual;
    // The residual is the (valid, unconverged) dirty image.
    assert!(residual.stats().peak > 0.0);
    assert!(residual.view().iter().all(|v| v.is_finite()));
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use approx::assert_abs_diff_eq;
use marlu::RADec;
use ndarray::prelude::*;

use super::*;
use crate::context::ImagingContext;
use crate::image::{Image, ImageKind, MemoryImageStore};

/// A field holding the dirty image of a single positive point source: the
/// PSF is a 5-pixel-wide separable triangle (peak 1.0, no negative
/// sidelobes), and the residual is that PSF scaled to `peak` — a single peak
/// at the image centre, zero everywhere beyond the PSF support.
fn point_source_store(size: usize, peak: f32) -> MemoryImageStore {
    let ctx = ImagingContext::new(
        1,
        1,
        size,
        size,
        4.848e-6,
        4.848e-6,
        RADec::from_degrees(0.0, -27.0),
        vec![150e6],
    )
    .unwrap();
    let centre = size / 2;

    let mut psf = Image::zeros(&ctx);
    {
        let data = psf.data_mut();
        for dy in -2_isize..=2 {
            for dx in -2_isize..=2 {
                let y = (centre as isize + dy) as usize;
                let x = (centre as isize + dx) as usize;
                let value = (1.0 - dy.abs() as f32 / 3.0) * (1.0 - dx.abs() as f32 / 3.0);
                data[(0, 0, y, x)] = value;
            }
        }
    }

    let mut residual = Image::zeros(&ctx);
    residual
        .data_mut()
        .zip_mut_with(&psf.view(), |r, &p| *r = peak * p);

    let mut store = MemoryImageStore::new();
    store.put(ImageKind::Residual, residual).unwrap();
    store.put(ImageKind::Model, Image::zeros(&ctx)).unwrap();
    store.put(ImageKind::Psf, psf).unwrap();
    store
}

#[test]
fn test_lifecycle_state_machine() {
    let mut deconvolver = Deconvolver::new(AlgorithmSettings::Hogbom, EmptyMaskPolicy::default());
    assert_eq!(deconvolver.state(), DeconvolverState::Uninitialized);

    // Stepping or finalising before initialisation is a caller error.
    assert!(matches!(
        deconvolver.take_one_step(0.1, 10, 0.0),
        Err(DeconvolveError::InvalidState { .. })
    ));
    let mut store = point_source_store(100, 10.0);
    assert!(matches!(
        deconvolver.finalize(&mut store),
        Err(DeconvolveError::InvalidState { .. })
    ));

    deconvolver.initialize(&store).unwrap();
    assert_eq!(deconvolver.state(), DeconvolverState::Ready);
    assert!(matches!(
        deconvolver.initialize(&store),
        Err(DeconvolveError::InvalidState { .. })
    ));

    deconvolver.take_one_step(0.1, 5, 0.0).unwrap();
    assert_eq!(deconvolver.state(), DeconvolverState::Stepping);

    deconvolver.finalize(&mut store).unwrap();
    assert_eq!(deconvolver.state(), DeconvolverState::Finalized);
    assert!(matches!(
        deconvolver.take_one_step(0.1, 5, 0.0),
        Err(DeconvolveError::InvalidState { .. })
    ));
}

#[test]
fn test_invalid_controls_are_rejected() {
    let mut deconvolver = Deconvolver::new(AlgorithmSettings::Hogbom, EmptyMaskPolicy::default());
    let store = point_source_store(100, 10.0);
    deconvolver.initialize(&store).unwrap();

    assert!(matches!(
        deconvolver.take_one_step(0.0, 10, 0.5),
        Err(DeconvolveError::InvalidLoopGain(_))
    ));
    assert!(matches!(
        deconvolver.take_one_step(1.5, 10, 0.5),
        Err(DeconvolveError::InvalidLoopGain(_))
    ));
    assert!(matches!(
        deconvolver.take_one_step(0.1, 10, -1.0),
        Err(DeconvolveError::InvalidCycleThreshold(_))
    ));
}

// The concrete acceptance scenario: 100x100 single-plane image, PSF peak 1.0
// with 5-pixel support, residual peak 10.0 at (50, 50), gain 0.1,
// cycle_niter 50, cycle_threshold 0.5.
#[test]
fn test_hogbom_acceptance_scenario() {
    let mut deconvolver = Deconvolver::new(AlgorithmSettings::Hogbom, EmptyMaskPolicy::default());
    let store = point_source_store(100, 10.0);
    deconvolver.initialize(&store).unwrap();
    assert_abs_diff_eq!(deconvolver.peak_residual(), 10.0, epsilon = 1e-6);

    let report = deconvolver.take_one_step(0.1, 50, 0.5).unwrap();
    assert!(report.peak_residual.abs() <= 0.5 || report.iterations_done == 50);
    assert!(report.model_flux > 0.0);
    assert!(report.model_flux <= 10.0);
    assert_eq!(report.status, StepStatus::ThresholdReached);
}

#[test]
fn test_hogbom_monotonic_convergence() {
    let mut deconvolver = Deconvolver::new(AlgorithmSettings::Hogbom, EmptyMaskPolicy::default());
    let store = point_source_store(100, 10.0);
    deconvolver.initialize(&store).unwrap();

    // For a positive-definite field, repeated stepping must give
    // non-decreasing model flux and non-increasing peak residual.
    let mut last_peak = f64::INFINITY;
    let mut last_flux = 0.0;
    loop {
        let report = deconvolver.take_one_step(0.1, 5, 0.5).unwrap();
        assert!(report.peak_residual.abs() <= last_peak + 1e-9);
        assert!(report.model_flux >= last_flux - 1e-9);
        last_peak = report.peak_residual.abs();
        last_flux = report.model_flux;
        match report.status {
            StepStatus::BudgetExhausted => continue,
            StepStatus::ThresholdReached => break,
            StepStatus::Diverged => panic!("point source must not diverge"),
        }
    }
    assert!(last_peak <= 0.5);
    assert!(last_flux > 0.0 && last_flux <= 10.0);
}

#[test]
fn test_step_resumes_after_residual_update() {
    let mut deconvolver = Deconvolver::new(AlgorithmSettings::Hogbom, EmptyMaskPolicy::default());
    let store = point_source_store(100, 10.0);
    deconvolver.initialize(&store).unwrap();

    let first = deconvolver.take_one_step(0.1, 5, 0.0).unwrap();
    assert_eq!(first.iterations_done, 5);

    // Pretend a major cycle recomputed the residual the minor cycle left
    // behind; stepping must continue from it, not start over.
    let mut fresh = point_source_store(100, 10.0)
        .get(ImageKind::Residual)
        .unwrap();
    let scale = first.peak_residual as f32 / 10.0;
    fresh.data_mut().mapv_inplace(|v| v * scale);
    deconvolver.update_residual(&fresh).unwrap();

    let second = deconvolver.take_one_step(0.1, 5, 0.0).unwrap();
    assert!(second.peak_residual.abs() < first.peak_residual.abs());
    assert!(second.model_flux > first.model_flux);
}

#[test]
fn test_finalize_writes_back() {
    let mut deconvolver = Deconvolver::new(AlgorithmSettings::Hogbom, EmptyMaskPolicy::default());
    let mut store = point_source_store(100, 10.0);
    deconvolver.initialize(&store).unwrap();
    let report = deconvolver.take_one_step(0.1, 50, 0.5).unwrap();
    deconvolver.finalize(&mut store).unwrap();

    let mut model = store.get(ImageKind::Model).unwrap();
    let mut residual = store.get(ImageKind::Residual).unwrap();
    assert_abs_diff_eq!(
        model.stats().total_flux,
        report.model_flux,
        epsilon = 1e-6
    );
    assert_abs_diff_eq!(
        f64::from(residual.stats().peak),
        report.peak_residual,
        epsilon = 1e-6
    );
}

#[test]
fn test_empty_mask_fill_ones_continues() {
    let mut store = point_source_store(100, 10.0);
    let zero_mask = {
        let residual = store.get(ImageKind::Residual).unwrap();
        Image::new(Array4::zeros(residual.shape()), residual.coords().clone())
    };
    store.put(ImageKind::Mask, zero_mask).unwrap();

    let mut deconvolver = Deconvolver::new(AlgorithmSettings::Hogbom, EmptyMaskPolicy::FillOnes);
    deconvolver.initialize(&store).unwrap();
    // With the mask filled to ones, the peak is visible.
    assert_abs_diff_eq!(deconvolver.peak_residual(), 10.0, epsilon = 1e-6);
}

#[test]
fn test_empty_mask_reject_fails_fast() {
    let mut store = point_source_store(100, 10.0);
    let zero_mask = {
        let residual = store.get(ImageKind::Residual).unwrap();
        Image::new(Array4::zeros(residual.shape()), residual.coords().clone())
    };
    store.put(ImageKind::Mask, zero_mask).unwrap();

    let mut deconvolver = Deconvolver::new(AlgorithmSettings::Hogbom, EmptyMaskPolicy::Reject);
    assert!(matches!(
        deconvolver.initialize(&store),
        Err(DeconvolveError::EmptyMask)
    ));
}

#[test]
fn test_clark_converges_on_point_source() {
    let mut deconvolver = Deconvolver::new(
        AlgorithmSettings::Clark(ClarkSettings::default()),
        EmptyMaskPolicy::default(),
    );
    let store = point_source_store(100, 10.0);
    deconvolver.initialize(&store).unwrap();

    let report = deconvolver.take_one_step(0.1, 200, 0.5).unwrap();
    assert!(report.peak_residual.abs() <= 0.5);
    assert!(report.model_flux > 0.0 && report.model_flux <= 10.0);
}

#[test]
fn test_multiscale_reduces_point_source() {
    let mut deconvolver = Deconvolver::new(
        AlgorithmSettings::MultiScale(MultiScaleSettings::default()),
        EmptyMaskPolicy::default(),
    );
    let store = point_source_store(100, 10.0);
    deconvolver.initialize(&store).unwrap();

    let report = deconvolver.take_one_step(0.1, 50, 0.5).unwrap();
    assert!(report.iterations_done > 0);
    assert!(report.peak_residual.abs() < 10.0);
    assert!(report.model_flux > 0.0);
    assert_ne!(report.status, StepStatus::Diverged);
}

#[test]
fn test_mem_reduces_point_source() {
    let mut deconvolver = Deconvolver::new(
        AlgorithmSettings::Mem(MemSettings::default()),
        EmptyMaskPolicy::default(),
    );
    let store = point_source_store(64, 5.0);
    deconvolver.initialize(&store).unwrap();

    let report = deconvolver.take_one_step(0.5, 10, 0.1).unwrap();
    assert!(report.iterations_done > 0);
    assert!(report.peak_residual.abs() < 5.0);
    assert!(report.model_flux > 0.0);
}

#[test]
fn test_algorithm_kind_parses() {
    use std::str::FromStr;
    assert_eq!(AlgorithmKind::from_str("hogbom").unwrap(), AlgorithmKind::Hogbom);
    assert_eq!(AlgorithmKind::from_str("clark").unwrap(), AlgorithmKind::Clark);
    assert_eq!(
        AlgorithmKind::from_str("multi-scale").unwrap(),
        AlgorithmKind::MultiScale
    );
    assert_eq!(AlgorithmKind::from_str("mem").unwrap(), AlgorithmKind::Mem);
    assert!(AlgorithmKind::from_str("hogbomm").is_err());
}

#[test]
fn test_max_psf_sidelobe_is_measured() {
    let mut deconvolver = Deconvolver::new(AlgorithmSettings::Hogbom, EmptyMaskPolicy::default());
    let store = point_source_store(100, 10.0);
    deconvolver.initialize(&store).unwrap();
    // The triangular PSF has no structure beyond the central 5x5 box, so the
    // worst "sidelobe" outside the 3-pixel exclusion zone is zero.
    assert_abs_diff_eq!(deconvolver.max_psf_sidelobe(), 0.0);
}

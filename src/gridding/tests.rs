// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::num::NonZeroUsize;
use std::sync::Arc;

use approx::{assert_abs_diff_eq, assert_relative_eq};
use marlu::{RADec, UVW};

use super::*;
use crate::context::ImagingContext;
use crate::image::Image;
use crate::vis::simulate::{PointSource, SimulateVisParams, SimulatedVis};
use crate::vis::{VisibilityChunk, VisibilitySource};

fn test_context() -> ImagingContext {
    // 64x64 image of 30 arcsec pixels at 150 MHz: uv cells of ~107
    // wavelengths, plenty for a few-hundred-metre array.
    ImagingContext::new(
        1,
        1,
        64,
        64,
        1.454e-4,
        1.454e-4,
        RADec::from_degrees(0.0, -27.0),
        vec![150e6],
    )
    .unwrap()
}

fn test_track(sources: Vec<PointSource>) -> SimulatedVis {
    SimulatedVis::new(SimulateVisParams {
        antennas_enh: vec![
            (0.0, 0.0, 0.0),
            (120.0, 30.0, 0.0),
            (-60.0, 200.0, 1.0),
            (300.0, -150.0, 2.0),
            (50.0, 90.0, 0.0),
        ],
        num_timesteps: 8,
        int_time: 60.0,
        ha_start: -0.2,
        dec: -0.47,
        freqs: vec![150e6],
        num_pols: 1,
        sources,
    })
    .unwrap()
}

fn cf_store() -> Arc<CfStore> {
    Arc::new(CfStore::single(4, 128))
}

#[test]
fn test_spheroidal_endpoints() {
    // Positive at the centre, zero beyond the support edge, symmetric.
    assert!(spheroidal(0.0) > 0.0);
    assert_abs_diff_eq!(spheroidal(1.2), 0.0);
    assert_abs_diff_eq!(spheroidal(0.3), spheroidal(-0.3));
    // Monotonically decreasing away from the centre.
    assert!(spheroidal(0.0) > spheroidal(0.5));
    assert!(spheroidal(0.5) > spheroidal(0.9));
}

#[test]
fn test_cf_taps_sum_to_one() {
    let cf = ConvolutionFunction::anti_aliasing(4, 64);
    for i_offset in [0, 13, 63] {
        let sum: f64 = (0..=8).map(|i| cf.tap(i_offset, i)).sum();
        assert_abs_diff_eq!(sum, 1.0, epsilon = 1e-12);
    }
}

#[test]
fn test_cf_store_w_classes() {
    let store = CfStore::w_classed(3, 32, 4, 1000.0);
    assert_eq!(store.num_classes(), 4);
    assert_eq!(store.max_support(), 6);
    assert_eq!(store.class_for(0.0), 0);
    assert_eq!(store.class_for(2000.0), 3);
    assert!(store.class_for(600.0) > 0);
    assert!(store.get(7).is_err());

    let single = CfStore::single(3, 32);
    assert_eq!(single.class_for(1e6), 0);
}

#[test]
fn test_data_to_grid_rejects_bad_chunk() {
    let ctx = test_context();
    let resampler = VisibilityResampler::new(&ctx, cf_store());
    let mut acc = GriddedAccumulator::new(&ctx).unwrap();

    let mut chunk = VisibilityChunk::zeros(4, vec![150e6], vec![0], vec![0]);
    chunk.chan_map = vec![3];

    // Fail-fast: the accumulator is untouched.
    assert!(resampler.data_to_grid(&mut acc, &chunk, false).is_err());
    assert_abs_diff_eq!(acc.total_weight(), 0.0);
}

#[test]
fn test_off_grid_samples_are_skipped() {
    let ctx = test_context();
    let resampler = VisibilityResampler::new(&ctx, cf_store());
    let mut acc = GriddedAccumulator::new(&ctx).unwrap();

    let mut chunk = VisibilityChunk::zeros(1, vec![150e6], vec![0], vec![0]);
    // 100 km baseline: way beyond the 64-cell grid.
    chunk.uvws[0] = UVW {
        u: 100e3,
        v: 0.0,
        w: 0.0,
    };
    chunk.weights_rcp.fill(1.0);

    let report = resampler.data_to_grid(&mut acc, &chunk, false).unwrap();
    assert_eq!(report.gridded, 0);
    assert_eq!(report.skipped_offgrid, 1);
    assert_abs_diff_eq!(acc.total_weight(), 0.0);
}

#[test]
fn test_nonfinite_samples_are_skipped_not_fatal() {
    let ctx = test_context();
    let resampler = VisibilityResampler::new(&ctx, cf_store());
    let mut acc = GriddedAccumulator::new(&ctx).unwrap();

    let mut chunk = VisibilityChunk::zeros(2, vec![150e6], vec![0], vec![0]);
    chunk.uvws[0] = UVW {
        u: 50.0,
        v: 20.0,
        w: 0.0,
    };
    chunk.uvws[1] = UVW {
        u: -30.0,
        v: 70.0,
        w: 0.0,
    };
    chunk.weights_rcp.fill(1.0);
    chunk.vis_rcp[(0, 0, 0)] = num_complex::Complex::new(f32::NAN, 0.0);
    chunk.vis_rcp[(1, 0, 0)] = num_complex::Complex::new(1.0, 0.0);

    let report = resampler.data_to_grid(&mut acc, &chunk, false).unwrap();
    assert_eq!(report.skipped_nonfinite, 1);
    assert_eq!(report.gridded, 1);
    // Only the finite sample contributes weight.
    assert_abs_diff_eq!(acc.total_weight(), 2.0);
}

#[test]
fn test_psf_peaks_at_one() {
    let ctx = test_context();
    let resampler = VisibilityResampler::new(&ctx, cf_store());
    let mut acc = GriddedAccumulator::new(&ctx).unwrap();
    let mut fft = fft::Fft2D::new();

    let mut track = test_track(vec![PointSource::at_offset(0.0, 0.0, 1.0)]);
    while let Some(chunk) = track.next_chunk().unwrap() {
        resampler.data_to_grid(&mut acc, &chunk, true).unwrap();
    }

    let mut psf = acc.finalize(&ctx, &mut fft).unwrap();
    let stats = psf.stats();
    assert_relative_eq!(stats.peak, 1.0, max_relative = 1e-3);
    assert_eq!(stats.peak_pos, (0, 0, 32, 32));
}

#[test]
fn test_dirty_image_recovers_centred_source() {
    let ctx = test_context();
    let resampler = VisibilityResampler::new(&ctx, cf_store());
    let mut acc = GriddedAccumulator::new(&ctx).unwrap();
    let mut fft = fft::Fft2D::new();

    let flux = 2.5;
    let mut track = test_track(vec![PointSource::at_offset(0.0, 0.0, flux)]);
    while let Some(chunk) = track.next_chunk().unwrap() {
        resampler.data_to_grid(&mut acc, &chunk, false).unwrap();
    }

    let mut dirty = acc.finalize(&ctx, &mut fft).unwrap();
    let stats = dirty.stats();
    assert_eq!(stats.peak_pos, (0, 0, 32, 32));
    assert_relative_eq!(stats.peak, flux as f32, max_relative = 0.02);
}

#[test]
fn test_weight_conservation_across_worker_counts() {
    let ctx = test_context();
    let sources = vec![PointSource::at_offset(0.0, 0.0, 1.0)];

    // Reference: single-threaded.
    let resampler = VisibilityResampler::new(&ctx, cf_store());
    let mut reference = GriddedAccumulator::new(&ctx).unwrap();
    let mut track = test_track(sources.clone());
    while let Some(chunk) = track.next_chunk().unwrap() {
        resampler.data_to_grid(&mut reference, &chunk, false).unwrap();
    }
    let reference_weight = reference.total_weight();
    assert!(reference_weight > 0.0);

    for num_workers in [1, 2, 4, 8] {
        let mut multi = MultiThreadedVisibilityResampler::new(
            &ctx,
            cf_store(),
            Some(NonZeroUsize::new(num_workers).unwrap()),
        )
        .unwrap();
        let mut track = test_track(sources.clone());
        while let Some(chunk) = track.next_chunk().unwrap() {
            multi.scatter(&chunk, false).unwrap();
        }
        let mut gathered = GriddedAccumulator::new(&ctx).unwrap();
        multi.gather(&mut gathered).unwrap();

        assert_abs_diff_eq!(gathered.total_weight(), reference_weight, epsilon = 1e-9);

        // The gathered grid matches the single-threaded grid to within
        // floating-point reassociation.
        for (a, b) in gathered.grid_cpvu.iter().zip(reference.grid_cpvu.iter()) {
            assert_abs_diff_eq!(a.re, b.re, epsilon = 1e-9);
            assert_abs_diff_eq!(a.im, b.im, epsilon = 1e-9);
        }
    }
}

#[test]
fn test_degrid_round_trip_recovers_point_source() {
    // Load a model with a delta at the phase centre and degrid it: every
    // predicted visibility should be close to the source flux, up to the
    // convolution function's smoothing.
    let ctx = test_context();
    let resampler = VisibilityResampler::new(&ctx, cf_store());
    let mut acc = GriddedAccumulator::new(&ctx).unwrap();
    let mut fft = fft::Fft2D::new();

    let flux = 3.0;
    let mut model = Image::zeros(&ctx);
    model.data_mut()[(0, 0, 32, 32)] = flux;
    acc.load_model(&model, &ctx, &mut fft).unwrap();

    let mut track = test_track(vec![PointSource::at_offset(0.0, 0.0, flux as f64)]);
    let mut chunk = track.next_chunk().unwrap().unwrap();
    let report = resampler.grid_to_data(&mut chunk, &acc).unwrap();
    assert_eq!(report.gridded, chunk.num_rows());

    for (predicted, observed) in chunk.model_rcp.iter().zip(chunk.vis_rcp.iter()) {
        assert_relative_eq!(predicted.re, observed.re, max_relative = 0.05);
        assert_abs_diff_eq!(predicted.im, observed.im, epsilon = 0.15);
    }
}

#[test]
fn test_threaded_degrid_matches_single() {
    let ctx = test_context();
    let resampler = VisibilityResampler::new(&ctx, cf_store());
    let multi =
        MultiThreadedVisibilityResampler::new(&ctx, cf_store(), NonZeroUsize::new(4)).unwrap();
    let mut acc = GriddedAccumulator::new(&ctx).unwrap();
    let mut fft = fft::Fft2D::new();

    let mut model = Image::zeros(&ctx);
    model.data_mut()[(0, 0, 30, 35)] = 1.5;
    acc.load_model(&model, &ctx, &mut fft).unwrap();

    let mut track = test_track(vec![PointSource::at_offset(0.0, 0.0, 1.0)]);
    let mut chunk_single = track.next_chunk().unwrap().unwrap();
    let mut chunk_multi = chunk_single.clone();

    resampler.grid_to_data(&mut chunk_single, &acc).unwrap();
    multi.degrid(&mut chunk_multi, &acc).unwrap();

    for (a, b) in chunk_multi.model_rcp.iter().zip(chunk_single.model_rcp.iter()) {
        assert_abs_diff_eq!(a.re, b.re);
        assert_abs_diff_eq!(a.im, b.im);
    }
}

#[test]
fn test_accumulator_merge_rejects_shape_mismatch() {
    let ctx = test_context();
    let small_ctx = ImagingContext::new(
        1,
        1,
        32,
        32,
        1.454e-4,
        1.454e-4,
        RADec::from_degrees(0.0, -27.0),
        vec![150e6],
    )
    .unwrap();

    let mut acc = GriddedAccumulator::new(&ctx).unwrap();
    let other = GriddedAccumulator::new(&small_ctx).unwrap();
    assert!(matches!(
        acc.merge_from(&other),
        Err(GridError::AccumulatorShapeMismatch { .. })
    ));
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Some helper mathematics.


use ndarray::prelude::*;

/// The position of a pixel within a (channel, polarisation, y, x) image cube.
pub type PixelPos = (usize, usize, usize, usize);

/// Find the largest-magnitude pixel of an image cube, optionally restricted to
/// pixels where the mask is positive. Returns the (signed) value at that
/// pixel and its position. `None` if no pixel is selected by the mask.
pub fn masked_abs_peak(
    image_cpyx: ArrayView4<f32>,
    mask_cpyx: Option<ArrayView4<f32>>,
) -> Option<(f32, PixelPos)> {
    let mut peak: Option<(f32, PixelPos)> = None;
    for (pos, &v) in image_cpyx.indexed_iter() {
        if let Some(mask) = mask_cpyx {
            if mask[pos] <= 0.0 {
                continue;
            }
        }
        match peak {
            Some((best, _)) if v.abs() <= best.abs() => (),
            _ => peak = Some((v, pos)),
        }
    }
    peak
}

/// The RMS over all pixels of an image cube.
pub fn image_rms(image_cpyx: ArrayView4<f32>) -> f64 {
    let n = image_cpyx.len();
    if n == 0 {
        return 0.0;
    }
    let sum_sq: f64 = image_cpyx.iter().map(|&v| f64::from(v) * f64::from(v)).sum();
    (sum_sq / n as f64).sqrt()
}

/// The sum of all pixels of an image cube, in f64 to avoid accumulating f32
/// rounding over large images.
pub fn image_sum(image_cpyx: ArrayView4<f32>) -> f64 {
    image_cpyx.iter().map(|&v| f64::from(v)).sum()
}

/// Split `n` items into `num_blocks` contiguous index ranges, as evenly as
/// possible. Blocks may be empty when there are more blocks than items.
pub fn row_blocks(n: usize, num_blocks: usize) -> Vec<std::ops::Range<usize>> {
    assert!(num_blocks > 0);
    let base = n / num_blocks;
    let extra = n % num_blocks;
    let mut blocks = Vec::with_capacity(num_blocks);
    let mut start = 0;
    for i in 0..num_blocks {
        let len = base + usize::from(i < extra);
        blocks.push(start..start + len);
        start += len;
    }
    blocks
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Image cubes and the store the deconvolver reads them from.
//!
//! Every image is a (channel, polarisation, y, x) cube with an attached
//! coordinate system. The cube caches its own statistics; any mutable access
//! invalidates the cache.

mod error;

pub use error::ImageError;

use marlu::RADec;
use ndarray::prelude::*;

use crate::context::ImagingContext;
use crate::math::{image_sum, masked_abs_peak, PixelPos};

/// The pixel-to-world mapping of an image cube.
#[derive(Clone, Debug)]
pub struct CoordSystem {
    /// The angular size of a pixel along l \[radians\].
    pub cell_l: f64,

    /// The angular size of a pixel along m \[radians\].
    pub cell_m: f64,

    /// The x pixel coordinate of the phase centre.
    pub ref_x: f64,

    /// The y pixel coordinate of the phase centre.
    pub ref_y: f64,

    /// The phase centre.
    pub phase_centre: RADec,

    /// The centroid frequency of each channel \[Hz\].
    pub freqs: Vec<f64>,
}

impl CoordSystem {
    pub fn from_context(ctx: &ImagingContext) -> CoordSystem {
        CoordSystem {
            cell_l: ctx.cell_l,
            cell_m: ctx.cell_m,
            ref_x: ctx.num_x as f64 / 2.0,
            ref_y: ctx.num_y as f64 / 2.0,
            phase_centre: ctx.phase_centre,
            freqs: ctx.freqs.clone(),
        }
    }

    /// The (l, m) direction cosines of a pixel.
    pub fn pixel_to_lm(&self, x: f64, y: f64) -> (f64, f64) {
        (
            (x - self.ref_x) * self.cell_l,
            (y - self.ref_y) * self.cell_m,
        )
    }

    /// The (possibly fractional) pixel coordinates of a direction.
    pub fn lm_to_pixel(&self, l: f64, m: f64) -> (f64, f64) {
        (l / self.cell_l + self.ref_x, m / self.cell_m + self.ref_y)
    }
}

/// Cached statistics of an image cube.
#[derive(Clone, Copy, Debug)]
pub struct ImageStats {
    /// The largest-magnitude pixel value (signed).
    pub peak: f32,

    /// The position of the peak.
    pub peak_pos: PixelPos,

    /// The sum of all pixels.
    pub total_flux: f64,
}

/// An image cube with a coordinate system and cached statistics.
#[derive(Clone, Debug)]
pub struct Image {
    data: Array4<f32>,
    coords: CoordSystem,
    stats: Option<ImageStats>,
}

impl Image {
    pub fn new(data: Array4<f32>, coords: CoordSystem) -> Image {
        Image {
            data,
            coords,
            stats: None,
        }
    }

    pub fn zeros(ctx: &ImagingContext) -> Image {
        Image::new(Array4::zeros(ctx.cube_shape()), CoordSystem::from_context(ctx))
    }

    pub fn view(&self) -> ArrayView4<f32> {
        self.data.view()
    }

    pub fn coords(&self) -> &CoordSystem {
        &self.coords
    }

    pub fn shape(&self) -> (usize, usize, usize, usize) {
        self.data.dim()
    }

    /// Mutable access to the pixels. Invalidates the cached statistics.
    pub fn data_mut(&mut self) -> &mut Array4<f32> {
        self.stats = None;
        &mut self.data
    }

    /// Consume the image, returning the pixel array.
    pub fn into_data(self) -> Array4<f32> {
        self.data
    }

    /// The image statistics, computed on first use and cached until the next
    /// mutable access.
    pub fn stats(&mut self) -> ImageStats {
        if let Some(stats) = self.stats {
            return stats;
        }
        let (peak, peak_pos) =
            masked_abs_peak(self.data.view(), None).unwrap_or((0.0, (0, 0, 0, 0)));
        let stats = ImageStats {
            peak,
            peak_pos,
            total_flux: image_sum(self.data.view()),
        };
        self.stats = Some(stats);
        stats
    }
}

/// The kinds of image a deconvolution field owns.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ImageKind {
    Residual,
    Model,
    Psf,
    Mask,
    Weight,
}

/// The seam between the core and whatever stores images. Whole-array
/// snapshots only; partial-tile access is the store's own concern.
pub trait ImageStore {
    /// A snapshot of the named image.
    fn get(&self, kind: ImageKind) -> Result<Image, ImageError>;

    /// Replace the named image.
    fn put(&mut self, kind: ImageKind, image: Image) -> Result<(), ImageError>;
}

/// An in-memory [`ImageStore`] holding one field's images.
#[derive(Clone, Debug, Default)]
pub struct MemoryImageStore {
    residual: Option<Image>,
    model: Option<Image>,
    psf: Option<Image>,
    mask: Option<Image>,
    weight: Option<Image>,
}

impl MemoryImageStore {
    pub fn new() -> MemoryImageStore {
        MemoryImageStore::default()
    }

    fn slot(&self, kind: ImageKind) -> &Option<Image> {
        match kind {
            ImageKind::Residual => &self.residual,
            ImageKind::Model => &self.model,
            ImageKind::Psf => &self.psf,
            ImageKind::Mask => &self.mask,
            ImageKind::Weight => &self.weight,
        }
    }

    fn slot_mut(&mut self, kind: ImageKind) -> &mut Option<Image> {
        match kind {
            ImageKind::Residual => &mut self.residual,
            ImageKind::Model => &mut self.model,
            ImageKind::Psf => &mut self.psf,
            ImageKind::Mask => &mut self.mask,
            ImageKind::Weight => &mut self.weight,
        }
    }
}

impl ImageStore for MemoryImageStore {
    fn get(&self, kind: ImageKind) -> Result<Image, ImageError> {
        self.slot(kind)
            .clone()
            .ok_or(ImageError::Missing { kind })
    }

    fn put(&mut self, kind: ImageKind, image: Image) -> Result<(), ImageError> {
        if let Some(existing) = self.slot(kind) {
            if existing.shape() != image.shape() {
                return Err(ImageError::ShapeMismatch {
                    kind,
                    expected: existing.shape(),
                    got: image.shape(),
                });
            }
            // A deconvolution mask may shrink but never grow after it has
            // been initialised.
            if kind == ImageKind::Mask {
                let grew = existing
                    .view()
                    .iter()
                    .zip(image.view().iter())
                    .any(|(&old, &new)| new > old && old <= 0.0);
                if grew {
                    return Err(ImageError::MaskGrew);
                }
            }
        }
        *self.slot_mut(kind) = Some(image);
        Ok(())
    }
}

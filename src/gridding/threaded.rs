// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The multi-threaded visibility resampler.
//!
//! N workers each own a private resampler and accumulator; `scatter` hands
//! each a contiguous block of chunk rows, and `gather` is a
//! join-all-then-sum barrier. There is no shared mutable state on the hot
//! path, only the read-only convolution-function store, so no locks are
//! needed anywhere.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::thread;

use ndarray::prelude::*;

use super::cf::CfStore;
use super::resampler::{GridReport, GriddedAccumulator, VisibilityResampler};
use super::GridError;
use crate::context::ImagingContext;
use crate::math::row_blocks;
use crate::vis::VisibilityChunk;

struct Worker {
    resampler: VisibilityResampler,
    acc: GriddedAccumulator,
}

pub struct MultiThreadedVisibilityResampler {
    workers: Vec<Worker>,
    ctx: ImagingContext,
}

impl MultiThreadedVisibilityResampler {
    /// Build a pool of `num_workers` resamplers (default: rayon's thread
    /// count). Each worker allocates a full private accumulator, so failure
    /// here reports the memory needed; retrying with fewer workers is the
    /// expected recovery.
    pub fn new(
        ctx: &ImagingContext,
        cf_store: Arc<CfStore>,
        num_workers: Option<NonZeroUsize>,
    ) -> Result<MultiThreadedVisibilityResampler, GridError> {
        let num_workers = num_workers
            .map(NonZeroUsize::get)
            .unwrap_or_else(rayon::current_num_threads)
            .max(1);
        let workers = (0..num_workers)
            .map(|_| {
                Ok(Worker {
                    resampler: VisibilityResampler::new(ctx, Arc::clone(&cf_store)),
                    acc: GriddedAccumulator::new(ctx)?,
                })
            })
            .collect::<Result<Vec<_>, GridError>>()?;
        Ok(MultiThreadedVisibilityResampler {
            workers,
            ctx: ctx.clone(),
        })
    }

    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    /// Grid a chunk across all workers. Rows are partitioned into contiguous
    /// blocks; which worker grids which row is not specified, but the total
    /// gridded weight is identical for any worker count.
    pub fn scatter(
        &mut self,
        chunk: &VisibilityChunk,
        compute_psf: bool,
    ) -> Result<GridReport, GridError> {
        chunk.validate(self.ctx.num_chans, self.ctx.num_pols)?;

        let blocks = row_blocks(chunk.num_rows(), self.workers.len());
        let mut report = GridReport::default();
        thread::scope(|scope| {
            let handles: Vec<_> = self
                .workers
                .iter_mut()
                .zip(blocks)
                .map(|(worker, rows)| {
                    scope.spawn(move || {
                        worker
                            .resampler
                            .grid_rows(&mut worker.acc, chunk, rows, compute_psf)
                    })
                })
                .collect();
            for handle in handles {
                report += handle.join().expect("gridding workers do not panic");
            }
        });
        Ok(report)
    }

    /// Degrid a chunk across all workers against a shared read-only grid.
    /// Each worker writes its own block of the chunk's model slot.
    pub fn degrid(
        &self,
        chunk: &mut VisibilityChunk,
        acc: &GriddedAccumulator,
    ) -> Result<GridReport, GridError> {
        chunk.validate(self.ctx.num_chans, self.ctx.num_pols)?;
        if acc.shape() != self.ctx.cube_shape() {
            return Err(GridError::AccumulatorShapeMismatch {
                expected: self.ctx.cube_shape(),
                got: acc.shape(),
            });
        }

        let blocks = row_blocks(chunk.num_rows(), self.workers.len());
        let mut model = std::mem::replace(&mut chunk.model_rcp, Array3::zeros((0, 0, 0)));
        let chunk_meta: &VisibilityChunk = chunk;
        let mut report = GridReport::default();
        thread::scope(|scope| {
            let mut handles = Vec::with_capacity(self.workers.len());
            let mut remainder = model.view_mut();
            for (worker, rows) in self.workers.iter().zip(blocks) {
                let (block, rest) = remainder.split_at(Axis(0), rows.len());
                remainder = rest;
                handles.push(scope.spawn(move || {
                    worker.resampler.degrid_rows(chunk_meta, rows, block, acc)
                }));
            }
            for handle in handles {
                report += handle.join().expect("degridding workers do not panic");
            }
        });
        chunk.model_rcp = model;
        Ok(report)
    }

    /// The gather barrier: sum every worker's private accumulator into the
    /// caller's. All workers have already joined by the time this runs, so
    /// this is the only sequencing point in the resampler.
    pub fn gather(&self, final_acc: &mut GriddedAccumulator) -> Result<(), GridError> {
        for worker in &self.workers {
            final_acc.merge_from(&worker.acc)?;
        }
        Ok(())
    }

    /// Zero all worker accumulators for the next major cycle.
    pub fn reset(&mut self) {
        for worker in &mut self.workers {
            worker.acc.reset();
        }
    }
}

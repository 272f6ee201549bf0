// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Point-source visibility simulation.
//!
//! An earth-rotation synthesis track for a small array layout, evaluated with
//! the direct measurement equation. This is the in-repo stand-in for an
//! external measurement-set iterator: it implements [`VisibilitySource`] and
//! is what the CLI and the integration tests image.

use marlu::{constants::VEL_C, LMN, UVW};
use num_complex::Complex;

use super::{VisError, VisibilityChunk, VisibilitySource};

/// Earth's rotation rate \[radians/second\].
const EARTH_ROTATION_RATE: f64 = 7.292115e-5;

/// A point source offset from the phase centre.
#[derive(Clone, Copy, Debug)]
pub struct PointSource {
    /// Direction cosines relative to the phase centre.
    pub lmn: LMN,

    /// Flux density \[Jy\], constant over frequency.
    pub flux_jy: f64,
}

impl PointSource {
    /// A source at a small (l, m) offset \[radians\] from the phase centre.
    pub fn at_offset(l: f64, m: f64, flux_jy: f64) -> PointSource {
        let n = (1.0 - l * l - m * m).sqrt();
        PointSource {
            lmn: LMN { l, m, n },
            flux_jy,
        }
    }
}

/// Parameters for a simulated observation.
#[derive(Clone, Debug)]
pub struct SimulateVisParams {
    /// Antenna positions as (east, north, height) \[metres\].
    pub antennas_enh: Vec<(f64, f64, f64)>,

    /// The number of integrations in the track. One chunk is produced per
    /// integration.
    pub num_timesteps: usize,

    /// Integration time \[seconds\].
    pub int_time: f64,

    /// The hour angle of the phase centre at the first integration
    /// \[radians\].
    pub ha_start: f64,

    /// The declination of the phase centre \[radians\].
    pub dec: f64,

    /// Channel centroid frequencies \[Hz\]. Channel i maps to image channel
    /// i.
    pub freqs: Vec<f64>,

    /// The number of polarisations to emit. Unpolarised sources; every
    /// polarisation gets the same visibility.
    pub num_pols: usize,

    /// The sky.
    pub sources: Vec<PointSource>,
}

/// A [`VisibilitySource`] that generates the simulated track chunk by chunk.
pub struct SimulatedVis {
    params: SimulateVisParams,
    next_timestep: usize,
}

impl SimulatedVis {
    pub fn new(params: SimulateVisParams) -> Result<SimulatedVis, VisError> {
        // Build and validate a prototype chunk up front so a bad
        // configuration fails before the imaging loop starts.
        let sim = SimulatedVis {
            params,
            next_timestep: 0,
        };
        let num_chans = sim.params.freqs.len();
        let num_pols = sim.params.num_pols;
        sim.chunk_for_timestep(0).validate(num_chans, num_pols)?;
        Ok(sim)
    }

    pub fn num_baselines(&self) -> usize {
        let n = self.params.antennas_enh.len();
        if n < 2 {
            return 0;
        }
        n * (n - 1) / 2
    }

    fn chunk_for_timestep(&self, timestep: usize) -> VisibilityChunk {
        let params = &self.params;
        let num_chans = params.freqs.len();
        let chan_map = (0..num_chans).collect();
        let pol_map = (0..params.num_pols).collect();
        let mut chunk = VisibilityChunk::zeros(
            self.num_baselines(),
            params.freqs.clone(),
            chan_map,
            pol_map,
        );

        let hour_angle =
            params.ha_start + EARTH_ROTATION_RATE * params.int_time * timestep as f64;
        let (s_ha, c_ha) = hour_angle.sin_cos();
        let (s_dec, c_dec) = params.dec.sin_cos();

        let mut i_row = 0;
        for i_ant1 in 0..params.antennas_enh.len() {
            for i_ant2 in i_ant1 + 1..params.antennas_enh.len() {
                let (e1, n1, h1) = params.antennas_enh[i_ant1];
                let (e2, n2, h2) = params.antennas_enh[i_ant2];
                let (de, dn, dh) = (e2 - e1, n2 - n1, h2 - h1);

                // Equation 4.1 of TMS, with the baseline expressed in local
                // east/north/up.
                let uvw = UVW {
                    u: de * s_ha + dn * c_ha,
                    v: -de * s_dec * c_ha + dn * s_dec * s_ha + dh * c_dec,
                    w: de * c_dec * c_ha - dn * c_dec * s_ha + dh * s_dec,
                };
                chunk.uvws[i_row] = uvw;
                chunk.ant1[i_row] = i_ant1;
                chunk.ant2[i_row] = i_ant2;

                for (i_chan, &freq) in params.freqs.iter().enumerate() {
                    let uvw_lambda = uvw * (freq / VEL_C);
                    let mut vis: Complex<f64> = Complex::default();
                    for source in &params.sources {
                        let phase = -source.lmn.dot(uvw_lambda);
                        vis += Complex::from_polar(source.flux_jy, phase);
                    }
                    let vis = Complex::new(vis.re as f32, vis.im as f32);
                    for i_pol in 0..params.num_pols {
                        chunk.vis_rcp[(i_row, i_chan, i_pol)] = vis;
                        chunk.weights_rcp[(i_row, i_chan, i_pol)] = 1.0;
                    }
                }

                i_row += 1;
            }
        }

        chunk
    }
}

impl VisibilitySource for SimulatedVis {
    fn next_chunk(&mut self) -> Result<Option<VisibilityChunk>, VisError> {
        if self.next_timestep >= self.params.num_timesteps {
            return Ok(None);
        }
        let chunk = self.chunk_for_timestep(self.next_timestep);
        self.next_timestep += 1;
        Ok(Some(chunk))
    }

    fn reset(&mut self) {
        self.next_timestep = 0;
    }
}

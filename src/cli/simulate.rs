// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The `vis-simulate` subcommand: generate and describe a simulated
//! visibility set without imaging it.

use std::path::PathBuf;

use clap::Parser;
use log::info;
use serde::{Deserialize, Serialize};

use super::CliError;
use crate::vis::simulate::{PointSource, SimulateVisParams, SimulatedVis};
use crate::vis::VisibilitySource;

#[derive(Debug, Clone, Parser, Serialize, Deserialize)]
pub(super) struct VisSimulateArgs {
    /// The observing frequency [MHz].
    #[clap(long)]
    freq_mhz: Option<f64>,

    /// The number of antennas in the simulated ring array.
    #[clap(long)]
    num_antennas: Option<usize>,

    /// The radius of the simulated ring array [m].
    #[clap(long)]
    array_radius: Option<f64>,

    /// The number of integrations in the simulated track.
    #[clap(long)]
    num_timesteps: Option<usize>,

    /// The integration time [s].
    #[clap(long)]
    int_time: Option<f64>,

    /// The declination of the phase centre [deg].
    #[clap(long)]
    dec_deg: Option<f64>,

    /// Point sources as "l_arcsec,m_arcsec,flux_jy" triples.
    #[clap(long, multiple_values(true))]
    sources: Option<Vec<String>>,

    /// All of the arguments to vis-simulate may be specified in a toml
    /// file. Any CLI arguments override parameters set in the file.
    #[clap(name = "ARGUMENTS_FILE", parse(from_os_str))]
    #[serde(skip)]
    args_file: Option<PathBuf>,
}

impl VisSimulateArgs {
    pub(super) fn merge(self) -> Result<VisSimulateArgs, CliError> {
        let Some(args_file) = &self.args_file else {
            return Ok(self);
        };
        let file: VisSimulateArgs = toml::from_str(&std::fs::read_to_string(args_file)?)?;
        Ok(VisSimulateArgs {
            freq_mhz: self.freq_mhz.or(file.freq_mhz),
            num_antennas: self.num_antennas.or(file.num_antennas),
            array_radius: self.array_radius.or(file.array_radius),
            num_timesteps: self.num_timesteps.or(file.num_timesteps),
            int_time: self.int_time.or(file.int_time),
            dec_deg: self.dec_deg.or(file.dec_deg),
            sources: self.sources.or(file.sources),
            args_file: None,
        })
    }

    pub(super) fn run(self, dry_run: bool) -> Result<(), CliError> {
        let freq_hz = self.freq_mhz.unwrap_or(150.0) * 1e6;
        let dec_deg = self.dec_deg.unwrap_or(-27.0);
        let num_antennas = self.num_antennas.unwrap_or(12);
        let num_timesteps = self.num_timesteps.unwrap_or(16);

        let sources = match &self.sources {
            Some(strings) => super::clean::parse_sources(Some(strings.as_slice()))?,
            None => vec![PointSource::at_offset(0.0, 0.0, 1.0)],
        };

        info!(
            "Simulating {num_timesteps} integrations of a {num_antennas}-antenna array at {} MHz",
            freq_hz / 1e6
        );
        if dry_run {
            info!("Dry run requested; stopping before simulation");
            return Ok(());
        }

        let mut sim = SimulatedVis::new(SimulateVisParams {
            antennas_enh: super::clean::ring_array(
                num_antennas,
                self.array_radius.unwrap_or(300.0),
            ),
            num_timesteps,
            int_time: self.int_time.unwrap_or(60.0),
            ha_start: -0.2,
            dec: dec_deg.to_radians(),
            freqs: vec![freq_hz],
            num_pols: 1,
            sources,
        })?;

        let mut num_chunks = 0_usize;
        let mut num_rows = 0_usize;
        let mut total_weight = 0.0;
        let mut max_uv = 0.0_f64;
        while let Some(chunk) = sim.next_chunk()? {
            num_chunks += 1;
            num_rows += chunk.num_rows();
            total_weight += chunk.total_weight();
            for uvw in &chunk.uvws {
                max_uv = max_uv.max(uvw.u.hypot(uvw.v));
            }
        }

        info!("{num_chunks} chunks, {num_rows} rows ({} baselines)", sim.num_baselines());
        info!("Total unflagged weight: {total_weight}");
        info!("Longest projected baseline: {max_uv:.1} m");
        Ok(())
    }
}

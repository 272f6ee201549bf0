// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The `clean` subcommand: image a simulated observation end to end.

use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::str::FromStr;

use clap::Parser;
use log::info;
use marlu::RADec;
use serde::{Deserialize, Serialize};

use super::CliError;
use crate::context::ImagingContext;
use crate::deconv::{AlgorithmKind, AlgorithmSettings, EmptyMaskPolicy, MultiScaleSettings};
use crate::imager::{Imager, ImagerParams};
use crate::iterbot::IterationControls;
use crate::vis::simulate::{PointSource, SimulateVisParams, SimulatedVis};

pub(super) const ARCSEC_TO_RAD: f64 = std::f64::consts::PI / 180.0 / 3600.0;

#[derive(Debug, Clone, Parser, Serialize, Deserialize)]
pub(super) struct CleanArgs {
    /// The image size along each axis [pixels].
    #[clap(short = 's', long)]
    image_size: Option<usize>,

    /// The angular size of a pixel [arcsec].
    #[clap(long)]
    cell_arcsec: Option<f64>,

    /// The observing frequency [MHz].
    #[clap(long)]
    freq_mhz: Option<f64>,

    /// The deconvolution algorithm (hogbom, clark, multi-scale, mem).
    #[clap(short, long)]
    algorithm: Option<String>,

    /// Multi-scale scale radii [pixels].
    #[clap(long, multiple_values(true))]
    scales: Option<Vec<f64>>,

    /// The total CLEAN iteration budget.
    #[clap(short, long)]
    niter: Option<u64>,

    /// Stop cleaning when the peak residual reaches this [Jy].
    #[clap(short, long)]
    threshold: Option<f64>,

    /// The fraction of the peak removed per iteration.
    #[clap(short = 'g', long)]
    loop_gain: Option<f32>,

    /// The per-major-cycle iteration cap (0: no cap).
    #[clap(long)]
    cycle_niter: Option<u32>,

    /// How aggressively minor cycles run before a major cycle is forced.
    #[clap(long)]
    cycle_factor: Option<f32>,

    /// The convolution-function half-support [grid cells].
    #[clap(long)]
    cf_support: Option<usize>,

    /// The convolution-function oversampling per grid cell.
    #[clap(long)]
    cf_oversampling: Option<usize>,

    /// The number of w-classes in the convolution-function store.
    #[clap(long)]
    w_classes: Option<usize>,

    /// The |w| [wavelengths] of the widest w-class.
    #[clap(long)]
    w_max: Option<f64>,

    /// The number of gridding workers. Defaults to the number of cores.
    #[clap(long)]
    num_workers: Option<usize>,

    /// Point sources as "l_arcsec,m_arcsec,flux_jy" triples.
    #[clap(long, multiple_values(true))]
    sources: Option<Vec<String>>,

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

    /// If specified, write the full iteration details to this JSON file.
    #[clap(short = 'o', long)]
    summary_json: Option<PathBuf>,

    /// All of the arguments to clean may be specified in a toml file. Any
    /// CLI arguments override parameters set in the file.
    #[clap(name = "ARGUMENTS_FILE", parse(from_os_str))]
    #[serde(skip)]
    args_file: Option<PathBuf>,
}

impl CleanArgs {
    /// Merge these arguments with whatever is in the arguments file, CLI
    /// taking precedence.
    pub(super) fn merge(self) -> Result<CleanArgs, CliError> {
        let Some(args_file) = &self.args_file else {
            return Ok(self);
        };
        let file: CleanArgs = toml::from_str(&std::fs::read_to_string(args_file)?)?;
        Ok(CleanArgs {
            image_size: self.image_size.or(file.image_size),
            cell_arcsec: self.cell_arcsec.or(file.cell_arcsec),
            freq_mhz: self.freq_mhz.or(file.freq_mhz),
            algorithm: self.algorithm.or(file.algorithm),
            scales: self.scales.or(file.scales),
            niter: self.niter.or(file.niter),
            threshold: self.threshold.or(file.threshold),
            loop_gain: self.loop_gain.or(file.loop_gain),
            cycle_niter: self.cycle_niter.or(file.cycle_niter),
            cycle_factor: self.cycle_factor.or(file.cycle_factor),
            cf_support: self.cf_support.or(file.cf_support),
            cf_oversampling: self.cf_oversampling.or(file.cf_oversampling),
            w_classes: self.w_classes.or(file.w_classes),
            w_max: self.w_max.or(file.w_max),
            num_workers: self.num_workers.or(file.num_workers),
            sources: self.sources.or(file.sources),
            num_antennas: self.num_antennas.or(file.num_antennas),
            array_radius: self.array_radius.or(file.array_radius),
            num_timesteps: self.num_timesteps.or(file.num_timesteps),
            int_time: self.int_time.or(file.int_time),
            dec_deg: self.dec_deg.or(file.dec_deg),
            summary_json: self.summary_json.or(file.summary_json),
            args_file: None,
        })
    }

    pub(super) fn run(self, dry_run: bool) -> Result<(), CliError> {
        let image_size = self.image_size.unwrap_or(256);
        let cell_arcsec = self.cell_arcsec.unwrap_or(8.0);
        let freq_hz = self.freq_mhz.unwrap_or(150.0) * 1e6;
        let dec_deg = self.dec_deg.unwrap_or(-27.0);

        let algorithm = match &self.algorithm {
            Some(name) => AlgorithmKind::from_str(name)
                .map_err(|_| CliError::BadArgument(format!("Unknown algorithm '{name}'")))?,
            None => AlgorithmKind::Hogbom,
        };
        let algorithm_settings = match (algorithm, &self.scales) {
            (AlgorithmKind::MultiScale, Some(scales)) => {
                AlgorithmSettings::MultiScale(MultiScaleSettings {
                    scales: scales.clone(),
                    ..Default::default()
                })
            }
            _ => AlgorithmSettings::defaults_for(algorithm),
        };

        let iteration = IterationControls {
            niter: self.niter.unwrap_or(1000),
            threshold: self.threshold.unwrap_or(0.0),
            loop_gain: self.loop_gain.unwrap_or(0.1),
            cycle_niter: self.cycle_niter.unwrap_or(0),
            cycle_factor: self.cycle_factor.unwrap_or(1.0),
        };

        let ctx = ImagingContext::new(
            1,
            1,
            image_size,
            image_size,
            cell_arcsec * ARCSEC_TO_RAD,
            cell_arcsec * ARCSEC_TO_RAD,
            RADec::from_degrees(0.0, dec_deg),
            vec![freq_hz],
        )
        .map_err(crate::VelaError::from)?;

        let sources = parse_sources(self.sources.as_deref())?;
        let sim_params = SimulateVisParams {
            antennas_enh: ring_array(
                self.num_antennas.unwrap_or(12),
                self.array_radius.unwrap_or(300.0),
            ),
            num_timesteps: self.num_timesteps.unwrap_or(16),
            int_time: self.int_time.unwrap_or(60.0),
            ha_start: -0.2,
            dec: dec_deg.to_radians(),
            freqs: vec![freq_hz],
            num_pols: 1,
            sources,
        };

        info!(
            "Cleaning a {image_size}x{image_size} image ({cell_arcsec}\" pixels) with {algorithm}"
        );
        info!(
            "niter {}, threshold {:.3e} Jy, gain {}, cycleniter {}, cyclefactor {}",
            iteration.niter,
            iteration.threshold,
            iteration.loop_gain,
            iteration.cycle_niter,
            iteration.cycle_factor
        );
        if dry_run {
            info!("Dry run requested; stopping before imaging");
            return Ok(());
        }

        let source = SimulatedVis::new(sim_params)?;
        let mut imager = Imager::new(
            ImagerParams {
                ctx,
                cf_support: self.cf_support.unwrap_or(4),
                cf_oversampling: self.cf_oversampling.unwrap_or(100),
                cf_w_classes: self.w_classes.unwrap_or(1),
                cf_w_max: self.w_max.unwrap_or(1000.0),
                num_workers: self.num_workers.and_then(NonZeroUsize::new),
                algorithm: algorithm_settings,
                empty_mask_policy: EmptyMaskPolicy::default(),
                iteration,
                interactive: false,
            },
            source,
        )?;
        let outcome = imager.run()?;

        info!(
            "Done: {} iterations over {} major cycles",
            outcome.iterations_done, outcome.major_cycles_done
        );
        info!(
            "Final peak residual {:+.6e} Jy, model flux {:.6e} Jy",
            outcome.final_peak_residual, outcome.model_flux
        );
        if let Some(path) = &self.summary_json {
            std::fs::write(path, serde_json::to_string_pretty(&outcome.details)?)?;
            info!("Iteration details written to {}", path.display());
        }
        Ok(())
    }
}

/// Parse "l_arcsec,m_arcsec,flux_jy" triples. No sources means a single
/// 1 Jy source at the phase centre.
pub(super) fn parse_sources(sources: Option<&[String]>) -> Result<Vec<PointSource>, CliError> {
    let Some(sources) = sources else {
        return Ok(vec![PointSource::at_offset(0.0, 0.0, 1.0)]);
    };
    sources
        .iter()
        .map(|s| {
            let fields: Vec<&str> = s.split(',').collect();
            let parsed: Option<PointSource> = match fields.as_slice() {
                [l, m, flux] => {
                    match (f64::from_str(l), f64::from_str(m), f64::from_str(flux)) {
                        (Ok(l), Ok(m), Ok(flux)) => Some(PointSource::at_offset(
                            l * ARCSEC_TO_RAD,
                            m * ARCSEC_TO_RAD,
                            flux,
                        )),
                        _ => None,
                    }
                }
                _ => None,
            };
            parsed.ok_or_else(|| {
                CliError::BadArgument(format!(
                    "Source '{s}' is not an 'l_arcsec,m_arcsec,flux_jy' triple"
                ))
            })
        })
        .collect()
}

/// A ring of antennas, plus one at the centre.
pub(super) fn ring_array(num_antennas: usize, radius: f64) -> Vec<(f64, f64, f64)> {
    let mut antennas = vec![(0.0, 0.0, 0.0)];
    for i in 0..num_antennas.saturating_sub(1) {
        let azimuth = std::f64::consts::TAU * i as f64 / (num_antennas - 1) as f64;
        antennas.push((radius * azimuth.sin(), radius * azimuth.cos(), 0.0));
    }
    antennas
}

//! Batch positioner parameter fitting.
//!
//! Each positioner is an independent job; jobs run on the rayon thread pool
//! and results come back in input order.

use anyhow::{Context, Result};
use fpcal_core::{
    default_bounds, default_nominals, BoundsMap, FitMode, KinematicModel, ParamKey, ParamMap,
    ParamSet,
};
use fpcal_optim::posparams::{PosparamsError, PosparamsFit, PosparamsFitter, PosparamsRequest};
use fpcal_optim::{BoundedMinimizer, SolveOptions};
use log::{info, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::tables::{group_samples, read_csv, PosSamples, SampleRow};

/// JSON configuration for positioner fits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PosparamsConfig {
    /// Passes to run in order; each pass starts from the previous result.
    pub passes: Vec<FitMode>,
    /// Overrides of the default nominal values.
    pub nominals: ParamMap,
    /// Overrides of the default bounds.
    pub bounds: BoundsMap,
    pub keep_fixed: Vec<ParamKey>,
    pub solver: SolveOptions,
}

impl Default for PosparamsConfig {
    fn default() -> Self {
        Self {
            passes: vec![FitMode::Static, FitMode::Dynamic],
            nominals: ParamMap::new(),
            bounds: BoundsMap::new(),
            keep_fixed: Vec::new(),
            solver: SolveOptions::default(),
        }
    }
}

impl PosparamsConfig {
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        serde_json::from_str(&data).with_context(|| format!("parsing config {}", path.display()))
    }

    /// Default nominals with the configured overrides applied.
    pub fn nominals(&self) -> ParamMap {
        let mut map = default_nominals();
        map.extend(&self.nominals);
        map
    }

    /// Default bounds with the configured overrides applied.
    pub fn bounds(&self) -> BoundsMap {
        let mut map = default_bounds();
        map.extend(&self.bounds);
        map
    }

    /// Request for one pass over `samples`, seeded with the configured nominals.
    pub fn request(&self, samples: &PosSamples, mode: FitMode) -> PosparamsRequest {
        PosparamsRequest::new(
            &samples.posint,
            &samples.ptl,
            mode,
            self.nominals(),
            self.bounds(),
        )
        .with_keep_fixed(self.keep_fixed.iter().copied())
        .with_label(samples.pos_id.clone())
    }
}

/// Result of every pass for one positioner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionerFit {
    pub pos_id: String,
    /// Parameters after the last pass.
    pub params: ParamSet,
    pub passes: Vec<PosparamsFit>,
}

/// Run independent fit jobs concurrently.
///
/// The output has one entry per request, in request order.
pub fn fit_params_batch<M, B>(
    fitter: &PosparamsFitter<M, B>,
    requests: &[PosparamsRequest],
) -> Vec<Result<PosparamsFit, PosparamsError>>
where
    M: KinematicModel + Sync,
    B: BoundedMinimizer + Sync,
{
    requests.par_iter().map(|req| fitter.fit(req)).collect()
}

/// Run the configured passes for one positioner.
pub fn fit_positioner<M, B>(
    fitter: &PosparamsFitter<M, B>,
    samples: &PosSamples,
    config: &PosparamsConfig,
) -> Result<PositionerFit, PosparamsError>
where
    M: KinematicModel,
    B: BoundedMinimizer,
{
    let mut nominals = config.nominals();
    let mut passes = Vec::with_capacity(config.passes.len());
    for &mode in &config.passes {
        let mut req = config.request(samples, mode);
        req.nominals = nominals.clone();
        let fit = fitter.fit(&req)?;
        if !fit.report.converged {
            warn!(
                "{} {} pass did not converge (err {:.4})",
                samples.pos_id, mode, fit.err
            );
        }
        nominals = fit.params.to_map();
        passes.push(fit);
    }

    let params = ParamSet::from_map(&nominals).map_err(PosparamsError::MissingNominal)?;
    Ok(PositionerFit {
        pos_id: samples.pos_id.clone(),
        params,
        passes,
    })
}

/// Fit every positioner in parallel with the default model and solver.
pub fn fit_positioners(
    groups: &[PosSamples],
    config: &PosparamsConfig,
) -> Vec<Result<PositionerFit, PosparamsError>> {
    let fitter: PosparamsFitter = PosparamsFitter::default().with_options(config.solver);
    info!(
        "fitting {} positioners, passes {:?}",
        groups.len(),
        config.passes
    );
    groups
        .par_iter()
        .map(|samples| fit_positioner(&fitter, samples, config))
        .collect()
}

/// Read a sample table and group it by positioner.
pub fn load_samples(path: &Path) -> Result<Vec<PosSamples>> {
    let rows: Vec<SampleRow> =
        read_csv(path).with_context(|| format!("reading samples {}", path.display()))?;
    Ok(group_samples(&rows))
}

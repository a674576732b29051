//! Positioner kinematic parameter fit.
//!
//! Given commanded internal angles `(t, p)` and externally measured positions
//! `(x, y)`, recover the parameters of a [`KinematicModel`] by bounded least
//! squares. Two mutually exclusive modes exist:
//!
//! - [`FitMode::Static`]: geometry (arm lengths and offsets) is free, the
//!   scale factors are held at their nominal values. Predictions transform
//!   the commanded angles directly.
//! - [`FitMode::Dynamic`]: only `SCALE_T`/`SCALE_P` are free. Each measured
//!   point becomes the reference for the next move; the commanded delta,
//!   scaled by the free factors, is added to it and compared against the next
//!   measured point.
//!
//! Every input check happens before the minimizer is invoked.

use crate::{Bound, BoundedMinimizer, BoundedProblem, LmBackend, SolveOptions, SolveReport};
use fpcal_core::{
    wrap_at_180, BoundsMap, FitMode, KinematicModel, ParamKey, ParamMap, ParamSet, PosTransforms,
    RangeWrap, Real, UnknownFitMode, UnknownParamKey, Vec2,
};
use log::debug;
use nalgebra::DVector;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Input-contract violations of a positioner fit.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PosparamsError {
    #[error(
        "sample sequences differ in length: posint_t={posint_t}, posint_p={posint_p}, \
         ptl_x={ptl_x}, ptl_y={ptl_y}"
    )]
    LengthMismatch {
        posint_t: usize,
        posint_p: usize,
        ptl_x: usize,
        ptl_y: usize,
    },
    #[error("non-finite value in {field}[{index}]")]
    NonFinite { field: &'static str, index: usize },
    #[error("no nominal value for {0}")]
    MissingNominal(ParamKey),
    #[error("nominal value for {0} is not finite ({1})")]
    InvalidNominal(ParamKey, Real),
    #[error("no bounds for {0}")]
    MissingBound(ParamKey),
    #[error("invalid bounds for {key}: [{min}, {max}]")]
    InvalidBound { key: ParamKey, min: Real, max: Real },
    #[error(transparent)]
    UnknownKey(#[from] UnknownParamKey),
    #[error(transparent)]
    UnknownMode(#[from] UnknownFitMode),
}

/// One fit job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PosparamsRequest {
    pub posint_t: Vec<Real>,
    pub posint_p: Vec<Real>,
    pub ptl_x: Vec<Real>,
    pub ptl_y: Vec<Real>,
    pub mode: FitMode,
    pub nominals: ParamMap,
    pub bounds: BoundsMap,
    /// Keys held at their nominal value in addition to those the mode fixes.
    #[serde(default)]
    pub keep_fixed: Vec<ParamKey>,
    /// Opaque job label, returned unchanged.
    #[serde(default)]
    pub label: String,
}

impl PosparamsRequest {
    pub fn new(
        posint: &[Vec2],
        ptl: &[Vec2],
        mode: FitMode,
        nominals: ParamMap,
        bounds: BoundsMap,
    ) -> Self {
        Self {
            posint_t: posint.iter().map(|tp| tp.x).collect(),
            posint_p: posint.iter().map(|tp| tp.y).collect(),
            ptl_x: ptl.iter().map(|xy| xy.x).collect(),
            ptl_y: ptl.iter().map(|xy| xy.y).collect(),
            mode,
            nominals,
            bounds,
            keep_fixed: Vec::new(),
            label: String::new(),
        }
    }

    pub fn with_keep_fixed(mut self, keys: impl IntoIterator<Item = ParamKey>) -> Self {
        self.keep_fixed = keys.into_iter().collect();
        self
    }

    /// Like [`with_keep_fixed`](Self::with_keep_fixed), from key names.
    pub fn with_keep_fixed_names<I, S>(self, names: I) -> Result<Self, PosparamsError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let keys = names
            .into_iter()
            .map(|name| name.as_ref().parse::<ParamKey>())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(self.with_keep_fixed(keys))
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    fn check_samples(&self) -> Result<(), PosparamsError> {
        let n = self.posint_t.len();
        if self.posint_p.len() != n || self.ptl_x.len() != n || self.ptl_y.len() != n {
            return Err(PosparamsError::LengthMismatch {
                posint_t: n,
                posint_p: self.posint_p.len(),
                ptl_x: self.ptl_x.len(),
                ptl_y: self.ptl_y.len(),
            });
        }
        let fields = [
            ("posint_t", &self.posint_t),
            ("posint_p", &self.posint_p),
            ("ptl_x", &self.ptl_x),
            ("ptl_y", &self.ptl_y),
        ];
        for (field, values) in fields {
            if let Some(index) = values.iter().position(|v| !v.is_finite()) {
                return Err(PosparamsError::NonFinite { field, index });
            }
        }
        Ok(())
    }

    fn nominal_set(&self) -> Result<ParamSet, PosparamsError> {
        let set = ParamSet::from_map(&self.nominals).map_err(PosparamsError::MissingNominal)?;
        let bad = set.iter().find(|(_, v)| !v.is_finite());
        match bad {
            Some((key, v)) => Err(PosparamsError::InvalidNominal(key, v)),
            None => Ok(set),
        }
    }

    fn bound(&self, key: ParamKey) -> Result<Bound, PosparamsError> {
        let &(min, max) = self
            .bounds
            .get(&key)
            .ok_or(PosparamsError::MissingBound(key))?;
        let bound = Bound::new(min, max);
        if bound.is_valid() {
            Ok(bound)
        } else {
            Err(PosparamsError::InvalidBound { key, min, max })
        }
    }

    /// Free keys in lexicographic order.
    pub fn free_keys(&self) -> Vec<ParamKey> {
        let forced = self.mode.forced_fixed();
        ParamKey::ALL
            .into_iter()
            .filter(|key| !forced.contains(key) && !self.keep_fixed.contains(key))
            .collect()
    }

    fn posint(&self) -> impl Iterator<Item = Vec2> + '_ {
        self.posint_t
            .iter()
            .zip(&self.posint_p)
            .map(|(&t, &p)| Vec2::new(t, p))
    }

    fn ptl(&self) -> impl Iterator<Item = Vec2> + '_ {
        self.ptl_x
            .iter()
            .zip(&self.ptl_y)
            .map(|(&x, &y)| Vec2::new(x, y))
    }
}

/// Result of one fit job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PosparamsFit {
    /// All eight parameters: fitted values for free keys, nominals otherwise.
    pub params: ParamSet,
    /// RMS distance between predicted and measured points at the optimum.
    pub err: Real,
    pub label: String,
    pub report: SolveReport,
}

/// How predictions are formed for each residual point.
#[derive(Debug, Clone)]
enum Predictor {
    /// Transform the commanded angles.
    Static { posint: Vec<Vec2> },
    /// Add the scaled commanded delta to the angles of the previous
    /// measured point.
    Dynamic {
        reference: Vec<Vec2>,
        delta: Vec<Vec2>,
    },
}

/// Immutable objective: fixed parameters live in `model`, free values are
/// injected into a private copy on every evaluation.
struct PosparamsObjective<'a, M> {
    model: &'a M,
    free: &'a [ParamKey],
    predictor: Predictor,
    /// Measured points in the flat frame, one per residual point.
    measured: Vec<Vec2>,
}

impl<'a, M: KinematicModel> PosparamsObjective<'a, M> {
    fn new(model: &'a M, free: &'a [ParamKey], mode: FitMode, posint: &[Vec2], ptl: &[Vec2]) -> Self {
        let flat: Vec<Vec2> = ptl.iter().map(|&xy| model.ptl_xy_to_flat_xy(xy)).collect();
        match mode {
            FitMode::Static => Self {
                model,
                free,
                predictor: Predictor::Static {
                    posint: posint.to_vec(),
                },
                measured: flat,
            },
            FitMode::Dynamic => {
                // Depends only on fixed static parameters.
                let reference = flat
                    .iter()
                    .take(flat.len().saturating_sub(1))
                    .map(|&xy| model.flat_xy_to_posint_tp(xy).0)
                    .collect();
                let delta = posint
                    .windows(2)
                    .map(|w| model.delta_posint_tp(w[1], w[0], RangeWrap::None))
                    .collect();
                Self {
                    model,
                    free,
                    predictor: Predictor::Dynamic { reference, delta },
                    measured: flat.into_iter().skip(1).collect(),
                }
            }
        }
    }

    fn model_at(&self, x: &DVector<Real>) -> M {
        let mut model = self.model.clone();
        for (&key, &value) in self.free.iter().zip(x.iter()) {
            model.set_param(key, value);
        }
        model
    }

    fn predict(&self, x: &DVector<Real>) -> Vec<Vec2> {
        let model = self.model_at(x);
        match &self.predictor {
            Predictor::Static { posint } => posint
                .iter()
                .map(|&tp| model.posint_tp_to_flat_xy(tp))
                .collect(),
            Predictor::Dynamic { reference, delta } => {
                let params = model.params();
                let scale = Vec2::new(params.get(ParamKey::ScaleT), params.get(ParamKey::ScaleP));
                reference
                    .iter()
                    .zip(delta)
                    .map(|(&tp0, d)| {
                        let tp = model.addto_posint_tp(tp0, d.component_mul(&scale), RangeWrap::None);
                        model.posint_tp_to_flat_xy(tp)
                    })
                    .collect()
            }
        }
    }
}

impl<M: KinematicModel> BoundedProblem for PosparamsObjective<'_, M> {
    fn num_params(&self) -> usize {
        self.free.len()
    }

    fn num_residuals(&self) -> usize {
        2 * self.measured.len()
    }

    fn residuals(&self, x: &DVector<Real>) -> DVector<Real> {
        let predicted = self.predict(x);
        let mut r = DVector::zeros(self.num_residuals());
        for (i, (p, m)) in predicted.iter().zip(&self.measured).enumerate() {
            r[2 * i] = p.x - m.x;
            r[2 * i + 1] = p.y - m.y;
        }
        r
    }

    /// RMS point distance; zero when there are no points.
    fn objective(&self, x: &DVector<Real>) -> Real {
        let n = self.measured.len();
        if n == 0 {
            return 0.0;
        }
        (self.residuals(x).norm_squared() / n as Real).sqrt()
    }
}

/// Fits positioner parameters with an injected model and minimizer.
#[derive(Debug, Clone)]
pub struct PosparamsFitter<M = PosTransforms, B = LmBackend> {
    model: M,
    minimizer: B,
    opts: SolveOptions,
}

impl Default for PosparamsFitter {
    fn default() -> Self {
        Self::new(PosTransforms::default(), LmBackend)
    }
}

impl<M: KinematicModel, B: BoundedMinimizer> PosparamsFitter<M, B> {
    /// `model` supplies everything except the parameters (surface, limits).
    pub fn new(model: M, minimizer: B) -> Self {
        Self {
            model,
            minimizer,
            opts: SolveOptions::default(),
        }
    }

    pub fn with_options(mut self, opts: SolveOptions) -> Self {
        self.opts = opts;
        self
    }

    pub fn minimizer(&self) -> &B {
        &self.minimizer
    }

    pub fn fit(&self, req: &PosparamsRequest) -> Result<PosparamsFit, PosparamsError> {
        req.check_samples()?;
        let nominal = req.nominal_set()?;
        for key in ParamKey::ALL {
            req.bound(key)?;
        }

        let free = req.free_keys();
        let bounds = free
            .iter()
            .map(|&key| req.bound(key))
            .collect::<Result<Vec<_>, _>>()?;
        let x0 = DVector::from_iterator(free.len(), free.iter().map(|&key| nominal.get(key)));
        debug!(
            "posparams fit {:?} ({} mode): free = {:?}",
            req.label, req.mode, free
        );

        let mut model = self.model.clone();
        model.set_params(&nominal);
        let posint: Vec<Vec2> = req.posint().collect();
        let ptl: Vec<Vec2> = req.ptl().collect();
        let objective = PosparamsObjective::new(&model, &free, req.mode, &posint, &ptl);

        let (x_opt, report) = self.minimizer.minimize(&objective, x0, &bounds, &self.opts);
        let err = objective.objective(&x_opt);

        let mut params = nominal;
        for (&key, &value) in free.iter().zip(x_opt.iter()) {
            params.set(key, value);
        }
        params.set(ParamKey::OffsetT, wrap_at_180(params.get(ParamKey::OffsetT)));

        debug!(
            "posparams fit {:?}: err = {:.3e} after {} evaluations ({})",
            req.label, err, report.iterations, report.termination
        );

        Ok(PosparamsFit {
            params,
            err,
            label: req.label.clone(),
            report,
        })
    }
}

/// Fit with the default model and solver.
pub fn fit_params(req: &PosparamsRequest) -> Result<PosparamsFit, PosparamsError> {
    let fitter: PosparamsFitter = PosparamsFitter::default();
    fitter.fit(req)
}

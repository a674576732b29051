//! Integration tests for the positioner parameter fit.
//!
//! Covers:
//! 1. Recovery of static geometry and dynamic scale factors from synthetic data
//! 2. Mode exclusivity and explicitly fixed keys
//! 3. Fits whose optimum lies outside a bound
//! 4. The degenerate empty free set
//! 5. Input-contract violations, which must fail before the minimizer runs

use fpcal_core::synthetic::{dynamic_samples, posint_sweep, static_samples, UniformNoise};
use fpcal_core::{
    default_bounds, default_nominals, FitMode, KinematicModel, ParamKey, ParamSet, PosTransforms,
    Real, Vec2,
};
use fpcal_optim::posparams::*;
use fpcal_optim::{Bound, BoundedMinimizer, BoundedProblem, LmBackend, SolveOptions, SolveReport};
use nalgebra::DVector;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Delegates to [`LmBackend`] and counts invocations.
#[derive(Debug, Default)]
struct CountingMinimizer {
    calls: AtomicUsize,
}

impl CountingMinimizer {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl BoundedMinimizer for CountingMinimizer {
    fn minimize<P: BoundedProblem + ?Sized>(
        &self,
        problem: &P,
        x0: DVector<Real>,
        bounds: &[Bound],
        opts: &SolveOptions,
    ) -> (DVector<Real>, SolveReport) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        LmBackend.minimize(problem, x0, bounds, opts)
    }
}

/// Problem wrapper that counts evaluations landing outside `bounds`.
struct BoundsChecked<'a, P: ?Sized> {
    inner: &'a P,
    bounds: &'a [Bound],
    evaluations: &'a AtomicUsize,
    outside: &'a AtomicUsize,
}

impl<P: BoundedProblem + ?Sized> BoundsChecked<'_, P> {
    fn record(&self, x: &DVector<Real>) {
        self.evaluations.fetch_add(1, Ordering::SeqCst);
        if x.iter().zip(self.bounds).any(|(&xi, b)| !b.contains(xi)) {
            self.outside.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl<P: BoundedProblem + ?Sized> BoundedProblem for BoundsChecked<'_, P> {
    fn num_params(&self) -> usize {
        self.inner.num_params()
    }

    fn num_residuals(&self) -> usize {
        self.inner.num_residuals()
    }

    fn residuals(&self, x: &DVector<Real>) -> DVector<Real> {
        self.record(x);
        self.inner.residuals(x)
    }

    fn objective(&self, x: &DVector<Real>) -> Real {
        self.record(x);
        self.inner.objective(x)
    }
}

/// Delegates to [`LmBackend`] through a [`BoundsChecked`] problem.
#[derive(Debug, Default)]
struct BoundsCheckingMinimizer {
    evaluations: AtomicUsize,
    outside: AtomicUsize,
}

impl BoundedMinimizer for BoundsCheckingMinimizer {
    fn minimize<P: BoundedProblem + ?Sized>(
        &self,
        problem: &P,
        x0: DVector<Real>,
        bounds: &[Bound],
        opts: &SolveOptions,
    ) -> (DVector<Real>, SolveReport) {
        let checked = BoundsChecked {
            inner: problem,
            bounds,
            evaluations: &self.evaluations,
            outside: &self.outside,
        };
        LmBackend.minimize(&checked, x0, bounds, opts)
    }
}

fn counting_fitter() -> PosparamsFitter<PosTransforms, CountingMinimizer> {
    PosparamsFitter::new(PosTransforms::default(), CountingMinimizer::default())
}

fn true_geometry() -> ParamSet {
    let mut params = ParamSet::nominal();
    params.set(ParamKey::LengthR1, 3.05);
    params.set(ParamKey::LengthR2, 2.95);
    params.set(ParamKey::OffsetT, 30.0);
    params.set(ParamKey::OffsetP, 2.0);
    params.set(ParamKey::OffsetX, 10.5);
    params.set(ParamKey::OffsetY, -20.3);
    params
}

fn static_request() -> PosparamsRequest {
    let truth = PosTransforms::stateless(true_geometry());
    let posint = posint_sweep(12, 4);
    let ptl = static_samples(&truth, &posint, &UniformNoise::none());

    let mut nominals = default_nominals();
    nominals.insert(ParamKey::OffsetT, 25.0);
    nominals.insert(ParamKey::OffsetX, 10.0);
    nominals.insert(ParamKey::OffsetY, -20.0);
    PosparamsRequest::new(&posint, &ptl, FitMode::Static, nominals, default_bounds())
        .with_label("M00001")
}

#[test]
fn static_fit_recovers_geometry() {
    let fit = fit_params(&static_request()).unwrap();
    let truth = true_geometry();

    assert!(fit.err < 1e-6, "err = {}", fit.err);
    for key in ParamKey::STATIC {
        let (est, gt) = (fit.params.get(key), truth.get(key));
        assert!((est - gt).abs() < 1e-5, "{key}: {est} vs {gt}");
    }
    assert_eq!(fit.label, "M00001");
    assert!(fit.report.converged, "{:?}", fit.report);
}

#[test]
fn static_fit_holds_scales_at_nominal() {
    let mut req = static_request();
    req.nominals.insert(ParamKey::ScaleT, 0.7);
    req.nominals.insert(ParamKey::ScaleP, 0.4);
    let req = req.with_keep_fixed([ParamKey::LengthR2, ParamKey::OffsetP]);

    let fit = fit_params(&req).unwrap();
    assert_eq!(fit.params.get(ParamKey::ScaleT), 0.7);
    assert_eq!(fit.params.get(ParamKey::ScaleP), 0.4);
    assert_eq!(fit.params.get(ParamKey::LengthR2), 3.0);
    assert_eq!(fit.params.get(ParamKey::OffsetP), 0.0);
    assert_eq!(fit.params.to_map().len(), 8);
}

#[test]
fn dynamic_fit_recovers_scales_and_holds_geometry() {
    let geometry = true_geometry();
    let truth = PosTransforms::stateless(geometry);
    let commanded: Vec<Vec2> = (0..30)
        .map(|i| {
            let i = i as Real;
            Vec2::new(-150.0 + 11.0 * i, 30.0 + 4.0 * i + 10.0 * (0.7 * i).sin())
        })
        .collect();
    let ptl = dynamic_samples(&truth, &commanded, Vec2::new(0.95, 0.9), &UniformNoise::none());

    let req = PosparamsRequest::new(
        &commanded,
        &ptl,
        FitMode::Dynamic,
        geometry.to_map(),
        default_bounds(),
    );
    let fit = fit_params(&req).unwrap();

    assert!(fit.err < 1e-6, "err = {}", fit.err);
    assert!((fit.params.get(ParamKey::ScaleT) - 0.95).abs() < 1e-6);
    assert!((fit.params.get(ParamKey::ScaleP) - 0.9).abs() < 1e-6);
    for key in ParamKey::STATIC {
        assert_eq!(fit.params.get(key), geometry.get(key), "{key} moved");
    }
}

#[test]
fn offset_t_is_wrapped_once_on_output() {
    let mut req = static_request().with_keep_fixed(ParamKey::STATIC);
    req.nominals.insert(ParamKey::OffsetT, 190.0);
    req.bounds.insert(ParamKey::OffsetT, (-400.0, 400.0));
    let fit = fit_params(&req).unwrap();
    assert_eq!(fit.params.get(ParamKey::OffsetT), -170.0);
}

#[test]
fn arm_length_beyond_its_bound_matches_pinned_fit() {
    let mut geometry = true_geometry();
    geometry.set(ParamKey::LengthR1, 3.8);
    let truth = PosTransforms::stateless(geometry);
    let posint = posint_sweep(12, 4);
    let ptl = static_samples(&truth, &posint, &UniformNoise::none());
    let nominals = static_request().nominals;

    let fitter = PosparamsFitter::new(PosTransforms::default(), BoundsCheckingMinimizer::default());
    let req = PosparamsRequest::new(
        &posint,
        &ptl,
        FitMode::Static,
        nominals.clone(),
        default_bounds(),
    );
    let free = fitter.fit(&req).unwrap();
    let checker = fitter.minimizer();
    assert!(checker.evaluations.load(Ordering::SeqCst) > 0);
    assert_eq!(checker.outside.load(Ordering::SeqCst), 0);
    assert!(
        (free.params.get(ParamKey::LengthR1) - 3.5).abs() < 1e-6,
        "LENGTH_R1 = {}",
        free.params.get(ParamKey::LengthR1)
    );

    let mut pinned_nominals = nominals;
    pinned_nominals.insert(ParamKey::LengthR1, 3.5);
    let req = PosparamsRequest::new(
        &posint,
        &ptl,
        FitMode::Static,
        pinned_nominals,
        default_bounds(),
    )
    .with_keep_fixed([ParamKey::LengthR1]);
    let pinned = fit_params(&req).unwrap();

    assert!(pinned.err > 1e-3, "pinned err = {}", pinned.err);
    assert!(
        (free.err - pinned.err).abs() < 1e-6,
        "free err {} vs pinned err {}",
        free.err,
        pinned.err
    );
    for key in ParamKey::STATIC {
        let (a, b) = (free.params.get(key), pinned.params.get(key));
        assert!((a - b).abs() < 1e-3, "{key}: {a} vs {b}");
    }
}

#[test]
fn empty_free_set_returns_nominals() {
    let fitter = counting_fitter();
    let req = static_request().with_keep_fixed(ParamKey::ALL);
    let fit = fitter.fit(&req).unwrap();

    let nominal = ParamSet::from_map(&req.nominals).unwrap();
    assert_eq!(fit.params, nominal);
    assert!(fit.err.is_finite() && fit.err > 0.0);
    assert_eq!(fit.report.iterations, 0);
    assert_eq!(fitter.minimizer().calls(), 1);
}

#[test]
fn empty_sample_set_returns_nominals() {
    let req = PosparamsRequest::new(
        &[],
        &[],
        FitMode::Static,
        default_nominals(),
        default_bounds(),
    );
    let fit = fit_params(&req).unwrap();
    assert_eq!(fit.params, ParamSet::nominal());
    assert_eq!(fit.err, 0.0);

    let one = [Vec2::new(10.0, 90.0)];
    let xy = [PosTransforms::default().posint_tp_to_flat_xy(one[0])];
    let req = PosparamsRequest::new(&one, &xy, FitMode::Dynamic, default_nominals(), default_bounds());
    assert_eq!(fit_params(&req).unwrap().err, 0.0);
}

#[test]
fn length_mismatch_fails_before_solving() {
    let fitter = counting_fitter();
    let mut req = static_request();
    req.ptl_y.pop();
    assert!(matches!(
        fitter.fit(&req),
        Err(PosparamsError::LengthMismatch { ptl_y: 47, .. })
    ));
    assert_eq!(fitter.minimizer().calls(), 0);
}

#[test]
fn nan_fails_before_solving() {
    let fitter = counting_fitter();
    for field in 0..4 {
        let mut req = static_request();
        let column = match field {
            0 => &mut req.posint_t,
            1 => &mut req.posint_p,
            2 => &mut req.ptl_x,
            _ => &mut req.ptl_y,
        };
        column[5] = Real::NAN;
        assert!(matches!(
            fitter.fit(&req),
            Err(PosparamsError::NonFinite { index: 5, .. })
        ));
    }
    assert_eq!(fitter.minimizer().calls(), 0);
}

#[test]
fn incomplete_or_invalid_tables_fail_before_solving() {
    let fitter = counting_fitter();

    let mut req = static_request();
    req.nominals.remove(&ParamKey::ScaleP);
    assert_eq!(
        fitter.fit(&req),
        Err(PosparamsError::MissingNominal(ParamKey::ScaleP))
    );

    let mut req = static_request();
    req.nominals.insert(ParamKey::OffsetP, Real::NAN);
    assert!(matches!(
        fitter.fit(&req),
        Err(PosparamsError::InvalidNominal(ParamKey::OffsetP, v)) if v.is_nan()
    ));

    let mut req = static_request();
    req.bounds.remove(&ParamKey::OffsetY);
    assert_eq!(
        fitter.fit(&req),
        Err(PosparamsError::MissingBound(ParamKey::OffsetY))
    );

    let mut req = static_request();
    req.bounds.insert(ParamKey::LengthR1, (3.5, 2.5));
    assert!(matches!(
        fitter.fit(&req),
        Err(PosparamsError::InvalidBound {
            key: ParamKey::LengthR1,
            ..
        })
    ));

    assert_eq!(fitter.minimizer().calls(), 0);
}

#[test]
fn unknown_key_and_mode_are_rejected() {
    let err = static_request()
        .with_keep_fixed_names(["LENGTH_R1", "BOGUS"])
        .unwrap_err();
    assert!(matches!(err, PosparamsError::UnknownKey(_)));

    let err: PosparamsError = "both".parse::<FitMode>().unwrap_err().into();
    assert!(matches!(err, PosparamsError::UnknownMode(_)));

    let mut json = serde_json::to_value(static_request()).unwrap();
    json["mode"] = "both".into();
    assert!(serde_json::from_value::<PosparamsRequest>(json.clone()).is_err());
    json["mode"] = "static".into();
    json["keep_fixed"] = serde_json::json!(["BOGUS"]);
    assert!(serde_json::from_value::<PosparamsRequest>(json.clone()).is_err());
    json["keep_fixed"] = serde_json::json!(["OFFSET_X"]);
    let req: PosparamsRequest = serde_json::from_value(json).unwrap();
    assert_eq!(req.keep_fixed, vec![ParamKey::OffsetX]);
}

#[test]
fn fit_result_serializes_with_key_names() {
    let fit = fit_params(&static_request()).unwrap();
    let json = serde_json::to_value(&fit).unwrap();
    assert!(json["params"]["LENGTH_R1"].is_f64());
    assert_eq!(json["label"], "M00001");
    let back: PosparamsFit = serde_json::from_value(json).unwrap();
    assert_eq!(back.params, fit.params);
}

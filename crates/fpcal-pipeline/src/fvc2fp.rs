//! Fiber View Camera pixel <-> focal-plane transform.
//!
//! Pixels are reduced to `[-1, 1]`, mapped through a similarity and a
//! Zhao-Burge correction, then expanded to focal-plane millimetres. Fitting
//! uses the fiducial spots of one image and the surveyed fiducial metrology.

use fpcal_core::reduced::{expand_xyfp, expand_xyfvc, reduce_xyfp, reduce_xyfvc};
use fpcal_core::zhaoburge::{transform, ZB_LEGACY_POLIDS};
use fpcal_core::{Real, Similarity, Vec2, ZbCorrection, ZbCorrectionError};
use fpcal_linear::{fit_scale_rotation_offset, ZbFitError, ZhaoBurgeFitOptions};
use log::{error, info};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::tables::{read_csv, MetrologyRow, PinholeKey, Spot};

/// `method` tag of the persisted format.
pub const ZB_METHOD: &str = "Zhao-Burge";
/// `version` written by [`FvcFpZhaoBurge::to_json`].
pub const ZB_VERSION: &str = "2";

/// Where [`FvcFpZhaoBurge::fit`] looks for metrology when none is passed.
///
/// No table is shipped at this path; override it with
/// [`FvcFpZhaoBurge::with_metrology_path`] or pass metrology explicitly.
pub const DEFAULT_METROLOGY_PATH: &str =
    concat!(env!("CARGO_MANIFEST_DIR"), "/data/fp-metrology.csv");

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("cannot find metrology file {}", .0.display())]
    MetrologyNotFound(PathBuf),
    #[error("failed to read metrology {}: {source}", path.display())]
    MetrologyRead {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("spot/metrology join mismatch at row {index}: spot {spot:?} vs metrology {metrology:?}")]
    Consistency {
        index: usize,
        spot: Option<PinholeKey>,
        metrology: Option<PinholeKey>,
    },
    #[error("unknown transform method {0:?}")]
    UnknownMethod(String),
    #[error("don't know version {0:?}")]
    UnknownVersion(String),
    #[error("version {version} payload is missing {field}")]
    MissingField {
        version: String,
        field: &'static str,
    },
    #[error("version 1 payload needs {expected} coefficients, got {got}")]
    LegacyCoefficients { expected: usize, got: usize },
    #[error(transparent)]
    Correction(#[from] ZbCorrectionError),
    #[error(transparent)]
    Fit(#[from] ZbFitError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Distance between transformed fiducials and their metrology, mm.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FitQuality {
    pub n_fiducials: usize,
    pub mean: Real,
    pub median: Real,
    pub rms: Real,
}

impl FitQuality {
    fn from_distances(mut dr: Vec<Real>) -> Self {
        let n = dr.len();
        if n == 0 {
            return Self {
                n_fiducials: 0,
                mean: 0.0,
                median: 0.0,
                rms: 0.0,
            };
        }
        let mean = dr.iter().sum::<Real>() / n as Real;
        let rms = (dr.iter().map(|d| d * d).sum::<Real>() / n as Real).sqrt();
        dr.sort_by(|a, b| a.total_cmp(b));
        let median = if n % 2 == 1 {
            dr[n / 2]
        } else {
            0.5 * (dr[n / 2 - 1] + dr[n / 2])
        };
        Self {
            n_fiducials: n,
            mean,
            median,
            rms,
        }
    }
}

#[derive(Serialize)]
struct ZbJsonOut<'a> {
    method: &'a str,
    version: &'a str,
    scale: Real,
    rotation: Real,
    offset_x: Real,
    offset_y: Real,
    zbpolids: &'a [u32],
    zbcoeffs: &'a [Real],
}

#[derive(Deserialize)]
struct ZbJsonIn {
    method: String,
    version: String,
    scale: Real,
    rotation: Real,
    offset_x: Real,
    offset_y: Real,
    /// Left untyped: version "1" ignores it.
    #[serde(default)]
    zbpolids: Option<serde_json::Value>,
    zbcoeffs: Vec<Real>,
}

/// FVC <-> FP transform: similarity plus Zhao-Burge correction.
///
/// `fit` replaces the transform; `fvc2fp`/`fp2fvc` only read it.
#[derive(Debug, Clone)]
pub struct FvcFpZhaoBurge {
    similarity: Similarity,
    correction: ZbCorrection,
    metrology: Option<Vec<MetrologyRow>>,
    metrology_path: PathBuf,
    fit_options: ZhaoBurgeFitOptions,
}

impl Default for FvcFpZhaoBurge {
    fn default() -> Self {
        Self {
            similarity: Similarity::default(),
            correction: ZbCorrection::empty(),
            metrology: None,
            metrology_path: PathBuf::from(DEFAULT_METROLOGY_PATH),
            fit_options: ZhaoBurgeFitOptions::default(),
        }
    }
}

impl FvcFpZhaoBurge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_parts(similarity: Similarity, correction: ZbCorrection) -> Self {
        Self {
            similarity,
            correction,
            ..Default::default()
        }
    }

    pub fn with_metrology_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.metrology_path = path.into();
        self
    }

    pub fn with_fit_options(mut self, opts: ZhaoBurgeFitOptions) -> Self {
        self.fit_options = opts;
        self
    }

    pub fn similarity(&self) -> &Similarity {
        &self.similarity
    }

    pub fn correction(&self) -> &ZbCorrection {
        &self.correction
    }

    /// Metrology used by the last fit.
    pub fn metrology(&self) -> Option<&[MetrologyRow]> {
        self.metrology.as_deref()
    }

    pub fn metrology_path(&self) -> &Path {
        &self.metrology_path
    }

    fn load_metrology(&self) -> Result<Vec<MetrologyRow>, TransformError> {
        let path = &self.metrology_path;
        if !path.is_file() {
            error!("cannot find {}", path.display());
            return Err(TransformError::MetrologyNotFound(path.clone()));
        }
        info!("reading fiducials metrology in {}", path.display());
        read_csv(path).map_err(|source| TransformError::MetrologyRead {
            path: path.clone(),
            source,
        })
    }

    /// Fit the transform to the fiducial spots of `spots`.
    ///
    /// Without `metrology`, the table at the metrology path is read. With
    /// `update_spots`, every spot gets `X_FP`/`Y_FP` from the new transform
    /// and the fiducials used in the fit get their metrology attached; every
    /// other row gets zeros.
    pub fn fit(
        &mut self,
        spots: &mut [Spot],
        metrology: Option<&[MetrologyRow]>,
        update_spots: bool,
    ) -> Result<FitQuality, TransformError> {
        let metrology = match metrology {
            Some(rows) => rows.to_vec(),
            None => self.load_metrology()?,
        };

        let metro_keys: HashSet<PinholeKey> = metrology.iter().map(MetrologyRow::key).collect();
        let mut fidspots: Vec<&Spot> = spots
            .iter()
            .filter(|s| s.is_fiducial() && metro_keys.contains(&s.key()))
            .collect();
        let spot_keys: HashSet<PinholeKey> = fidspots.iter().map(|s| s.key()).collect();
        let mut matched: Vec<&MetrologyRow> = metrology
            .iter()
            .filter(|m| spot_keys.contains(&m.key()))
            .collect();

        fidspots.sort_by_key(|s| s.key());
        matched.sort_by_key(|m| m.key());
        check_join(
            fidspots.iter().map(|s| s.key()),
            matched.iter().map(|m| m.key()),
        )?;

        let src: Vec<Vec2> = fidspots.iter().map(|s| reduce_xyfvc(s.pix())).collect();
        let dst: Vec<Vec2> = matched.iter().map(|m| reduce_xyfp(m.xy())).collect();
        let fit = fit_scale_rotation_offset(&src, &dst, &self.fit_options)?;
        self.similarity = fit.similarity;
        self.correction = fit.correction;

        let measured = self.fvc2fp(&fidspots.iter().map(|s| s.pix()).collect::<Vec<_>>());
        let dr = measured
            .iter()
            .zip(&matched)
            .map(|(p, m)| (m.xy() - p).norm())
            .collect();
        let quality = FitQuality::from_distances(dr);
        info!(
            "Mean, median, RMS distance = {:.1}, {:.1}, {:.1} um",
            1000.0 * quality.mean,
            1000.0 * quality.median,
            1000.0 * quality.rms
        );

        let matched: Vec<MetrologyRow> = matched.into_iter().cloned().collect();
        if update_spots {
            self.update_spots(spots, &matched)?;
        }
        self.metrology = Some(metrology);
        Ok(quality)
    }

    /// Write transformed positions to every spot and attach metrology to the
    /// fiducials in `matched` (sorted by key).
    fn update_spots(&self, spots: &mut [Spot], matched: &[MetrologyRow]) -> Result<(), TransformError> {
        let xy_fp = self.fvc2fp(&spots.iter().map(Spot::pix).collect::<Vec<_>>());
        for (spot, xy) in spots.iter_mut().zip(xy_fp) {
            spot.x_fp = xy.x;
            spot.y_fp = xy.y;
            spot.x_fp_metro = 0.0;
            spot.y_fp_metro = 0.0;
            spot.z_fp_metro = 0.0;
        }

        // fiducial rows in table order, then ranked by key
        let metro_keys: HashSet<PinholeKey> = matched.iter().map(MetrologyRow::key).collect();
        let mut fid_rows: Vec<usize> = (0..spots.len())
            .filter(|&i| spots[i].is_fiducial() && metro_keys.contains(&spots[i].key()))
            .collect();
        fid_rows.sort_by_key(|&i| spots[i].key());
        check_join(
            fid_rows.iter().map(|&i| spots[i].key()),
            matched.iter().map(MetrologyRow::key),
        )?;

        for (&row, metro) in fid_rows.iter().zip(matched) {
            let spot = &mut spots[row];
            spot.x_fp_metro = metro.x_fp;
            spot.y_fp_metro = metro.y_fp;
            spot.z_fp_metro = metro.z_fp;
        }
        Ok(())
    }

    /// FVC pixels -> focal-plane mm.
    pub fn fvc2fp(&self, pix: &[Vec2]) -> Vec<Vec2> {
        let reduced: Vec<Vec2> = pix.iter().map(|&p| reduce_xyfvc(p)).collect();
        transform(&reduced, &self.similarity, &self.correction)
            .into_iter()
            .map(expand_xyfp)
            .collect()
    }

    /// Focal-plane mm -> FVC pixels, inverting the correction by fixed-point
    /// iteration.
    pub fn fp2fvc(&self, fp: &[Vec2]) -> Vec<Vec2> {
        let reduced: Vec<Vec2> = fp.iter().map(|&p| reduce_xyfp(p)).collect();
        self.correction
            .remove(&reduced)
            .into_iter()
            .map(|p| expand_xyfvc(self.similarity.invert(p)))
            .collect()
    }

    pub fn to_json(&self) -> Result<String, TransformError> {
        let out = ZbJsonOut {
            method: ZB_METHOD,
            version: ZB_VERSION,
            scale: self.similarity.scale,
            rotation: self.similarity.rotation,
            offset_x: self.similarity.offset.x,
            offset_y: self.similarity.offset.y,
            zbpolids: self.correction.polids(),
            zbcoeffs: self.correction.coeffs(),
        };
        Ok(serde_json::to_string(&out)?)
    }

    /// Parse a persisted transform.
    ///
    /// Version "1" payloads always use the legacy 8-term list, whatever their
    /// `zbpolids` says.
    pub fn from_json(json: &str) -> Result<Self, TransformError> {
        let params: ZbJsonIn = serde_json::from_str(json)?;
        if params.method != ZB_METHOD {
            return Err(TransformError::UnknownMethod(params.method));
        }
        let polids: Vec<u32> = match params.version.as_str() {
            "1" => {
                if params.zbcoeffs.len() != ZB_LEGACY_POLIDS.len() {
                    return Err(TransformError::LegacyCoefficients {
                        expected: ZB_LEGACY_POLIDS.len(),
                        got: params.zbcoeffs.len(),
                    });
                }
                ZB_LEGACY_POLIDS.to_vec()
            }
            "2" => match params.zbpolids {
                Some(value) => serde_json::from_value(value)?,
                None => {
                    return Err(TransformError::MissingField {
                        version: params.version,
                        field: "zbpolids",
                    })
                }
            },
            _ => return Err(TransformError::UnknownVersion(params.version)),
        };

        let similarity = Similarity {
            scale: params.scale,
            rotation: params.rotation,
            offset: Vec2::new(params.offset_x, params.offset_y),
        };
        let correction = ZbCorrection::new(polids, params.zbcoeffs)?;
        Ok(Self::from_parts(similarity, correction))
    }
}

/// Both key sequences must agree element by element.
fn check_join(
    spot_keys: impl Iterator<Item = PinholeKey>,
    metro_keys: impl Iterator<Item = PinholeKey>,
) -> Result<(), TransformError> {
    let mut spot_keys = spot_keys.fuse();
    let mut metro_keys = metro_keys.fuse();
    let mut index = 0;
    loop {
        match (spot_keys.next(), metro_keys.next()) {
            (None, None) => return Ok(()),
            (spot, metrology) if spot != metrology => {
                return Err(TransformError::Consistency {
                    index,
                    spot,
                    metrology,
                })
            }
            _ => index += 1,
        }
    }
}

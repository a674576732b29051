use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use fpcal_core::{Real, Vec2};
use fpcal_pipeline::posparams::load_samples;
use fpcal_pipeline::tables::{read_csv, write_csv};
use fpcal_pipeline::{fit_positioners, FvcFpZhaoBurge, MetrologyRow, PositionerFit, PosparamsConfig, Spot};
use log::{error, info};
use serde::{Deserialize, Serialize};

/// Fiber positioner and FVC calibration tools.
#[derive(Debug, Parser)]
#[command(author, version, about = "Fiber positioner and FVC calibration")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Fit kinematic parameters per positioner from a CSV of samples
    /// (POS_ID, POS_T, POS_P, X_PTL, Y_PTL).
    FitPosparams {
        #[arg(long)]
        samples: PathBuf,
        /// JSON PosparamsConfig. Defaults are used if omitted.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Write the JSON results here instead of stdout.
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Fit the FVC -> FP transform from a CSV of spots.
    FitFvc2fp {
        #[arg(long)]
        spots: PathBuf,
        /// Metrology CSV. If omitted, the table is read from the default
        /// metrology path `<fpcal-pipeline>/data/fp-metrology.csv`, which is
        /// not shipped and must be provided there.
        #[arg(long)]
        metrology: Option<PathBuf>,
        /// Write the transform JSON here instead of stdout.
        #[arg(long)]
        output: Option<PathBuf>,
        /// Also write the spots, with transformed and metrology columns.
        #[arg(long)]
        updated_spots: Option<PathBuf>,
    },
    /// Apply a stored transform to XPIX/YPIX columns.
    Fvc2fp {
        #[arg(long)]
        transform: PathBuf,
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        output: PathBuf,
    },
    /// Apply the inverse of a stored transform to X_FP/Y_FP columns.
    Fp2fvc {
        #[arg(long)]
        transform: PathBuf,
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        output: PathBuf,
    },
}

/// Row of a point table for `fvc2fp`/`fp2fvc`; the missing side is filled in.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PointRow {
    #[serde(rename = "XPIX", default)]
    xpix: Option<Real>,
    #[serde(rename = "YPIX", default)]
    ypix: Option<Real>,
    #[serde(rename = "X_FP", default)]
    x_fp: Option<Real>,
    #[serde(rename = "Y_FP", default)]
    y_fp: Option<Real>,
}

fn write_or_print(json: &str, output: Option<&Path>) -> Result<()> {
    match output {
        Some(path) => {
            fs::write(path, json).with_context(|| format!("writing {}", path.display()))?;
            info!("wrote {}", path.display());
        }
        None => println!("{json}"),
    }
    Ok(())
}

fn load_transform(path: &Path) -> Result<FvcFpZhaoBurge> {
    let json =
        fs::read_to_string(path).with_context(|| format!("reading transform {}", path.display()))?;
    FvcFpZhaoBurge::from_json(&json).with_context(|| format!("parsing transform {}", path.display()))
}

fn fit_posparams_from_files(samples: &Path, config: Option<&Path>) -> Result<String> {
    let groups = load_samples(samples)?;
    let config = match config {
        Some(path) => PosparamsConfig::from_json_file(path)?,
        None => PosparamsConfig::default(),
    };

    let mut fits: Vec<PositionerFit> = Vec::with_capacity(groups.len());
    for (group, result) in groups.iter().zip(fit_positioners(&groups, &config)) {
        match result {
            Ok(fit) => fits.push(fit),
            Err(err) => error!("{}: {err}", group.pos_id),
        }
    }
    if fits.is_empty() && !groups.is_empty() {
        bail!("every positioner fit failed");
    }
    Ok(serde_json::to_string_pretty(&fits)?)
}

fn fit_fvc2fp_from_files(
    spots_path: &Path,
    metrology: Option<&Path>,
    updated_spots: Option<&Path>,
) -> Result<String> {
    let mut spots: Vec<Spot> =
        read_csv(spots_path).with_context(|| format!("reading spots {}", spots_path.display()))?;
    let metrology: Option<Vec<MetrologyRow>> = metrology
        .map(|path| {
            read_csv(path).with_context(|| format!("reading metrology {}", path.display()))
        })
        .transpose()?;

    let mut tx = FvcFpZhaoBurge::new();
    tx.fit(&mut spots, metrology.as_deref(), updated_spots.is_some())?;

    if let Some(path) = updated_spots {
        write_csv(path, &spots).with_context(|| format!("writing {}", path.display()))?;
    }
    Ok(tx.to_json()?)
}

fn apply_transform(transform: &Path, input: &Path, output: &Path, inverse: bool) -> Result<()> {
    let tx = load_transform(transform)?;
    let mut rows: Vec<PointRow> =
        read_csv(input).with_context(|| format!("reading points {}", input.display()))?;

    let take = |x: Option<Real>, y: Option<Real>, idx: usize, cols: &str| match (x, y) {
        (Some(x), Some(y)) => Ok(Vec2::new(x, y)),
        _ => bail!("row {idx} is missing {cols}"),
    };
    if inverse {
        let fp = rows
            .iter()
            .enumerate()
            .map(|(i, r)| take(r.x_fp, r.y_fp, i, "X_FP/Y_FP"))
            .collect::<Result<Vec<_>>>()?;
        for (row, pix) in rows.iter_mut().zip(tx.fp2fvc(&fp)) {
            row.xpix = Some(pix.x);
            row.ypix = Some(pix.y);
        }
    } else {
        let pix = rows
            .iter()
            .enumerate()
            .map(|(i, r)| take(r.xpix, r.ypix, i, "XPIX/YPIX"))
            .collect::<Result<Vec<_>>>()?;
        for (row, fp) in rows.iter_mut().zip(tx.fvc2fp(&pix)) {
            row.x_fp = Some(fp.x);
            row.y_fp = Some(fp.y);
        }
    }

    write_csv(output, &rows).with_context(|| format!("writing {}", output.display()))?;
    info!("transformed {} points into {}", rows.len(), output.display());
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    if let Err(err) = try_main() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn try_main() -> Result<()> {
    match Args::parse().command {
        Command::FitPosparams {
            samples,
            config,
            output,
        } => {
            let json = fit_posparams_from_files(&samples, config.as_deref())?;
            write_or_print(&json, output.as_deref())
        }
        Command::FitFvc2fp {
            spots,
            metrology,
            output,
            updated_spots,
        } => {
            let json =
                fit_fvc2fp_from_files(&spots, metrology.as_deref(), updated_spots.as_deref())?;
            write_or_print(&json, output.as_deref())
        }
        Command::Fvc2fp {
            transform,
            input,
            output,
        } => apply_transform(&transform, &input, &output, false),
        Command::Fp2fvc {
            transform,
            input,
            output,
        } => apply_transform(&transform, &input, &output, true),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fpcal_core::{ParamKey, Similarity, ZbCorrection};
    use fpcal_pipeline::fvc2fp::DEFAULT_METROLOGY_PATH;
    use fpcal_pipeline::SampleRow;
    use tempfile::tempdir;

    #[test]
    fn parses_subcommands() {
        let args = Args::try_parse_from([
            "fpcal",
            "fit-fvc2fp",
            "--spots",
            "spots.csv",
            "--updated-spots",
            "out.csv",
        ])
        .unwrap();
        assert!(matches!(
            args.command,
            Command::FitFvc2fp {
                metrology: None,
                updated_spots: Some(_),
                ..
            }
        ));
        assert!(Args::try_parse_from(["fpcal", "fit-posparams"]).is_err());
    }

    #[test]
    fn fit_posparams_helper_smoke_test() {
        let dir = tempdir().unwrap();
        let samples = dir.path().join("samples.csv");
        let rows: Vec<SampleRow> = (0..24)
            .map(|i| {
                let (t, p) = (-160.0 + 14.0 * i as Real, 35.0 + 5.0 * i as Real);
                let (tr, tpr) = (t.to_radians(), (t + p).to_radians());
                SampleRow {
                    pos_id: "M01234".to_string(),
                    pos_t: t,
                    pos_p: p,
                    x_ptl: 3.0 * tr.cos() + 3.0 * tpr.cos() + 5.0,
                    y_ptl: 3.0 * tr.sin() + 3.0 * tpr.sin() - 2.0,
                }
            })
            .collect();
        write_csv(&samples, &rows).unwrap();

        let json = fit_posparams_from_files(&samples, None).expect("cli helper should succeed");
        let fits: Vec<PositionerFit> = serde_json::from_str(&json).unwrap();
        assert_eq!(fits.len(), 1);
        assert_eq!(fits[0].pos_id, "M01234");
        assert!((fits[0].params.get(ParamKey::OffsetX) - 5.0).abs() < 1e-5);
        assert!((fits[0].params.get(ParamKey::OffsetY) + 2.0).abs() < 1e-5);
    }

    #[test]
    fn fit_fvc2fp_without_metrology_reads_default_path() {
        let dir = tempdir().unwrap();
        let spots_path = dir.path().join("spots.csv");
        write_csv(&spots_path, &[Spot::new(1, 1, 1000.0, 2000.0)]).unwrap();

        let err = fit_fvc2fp_from_files(&spots_path, None, None).unwrap_err();
        let msg = format!("{err:#}");
        assert!(msg.contains("cannot find metrology file"), "{msg}");
        assert!(msg.contains(DEFAULT_METROLOGY_PATH), "{msg}");
    }

    #[test]
    fn transform_helpers_round_trip_points() {
        let dir = tempdir().unwrap();
        let tx = FvcFpZhaoBurge::from_parts(
            Similarity {
                scale: 0.9,
                rotation: 0.01,
                offset: Vec2::new(0.01, 0.0),
            },
            ZbCorrection::new(vec![3, 6], vec![1e-4, -2e-4]).unwrap(),
        );
        let tx_path = dir.path().join("tx.json");
        fs::write(&tx_path, tx.to_json().unwrap()).unwrap();

        let pix_path = dir.path().join("pix.csv");
        let rows = vec![
            PointRow {
                xpix: Some(1500.0),
                ypix: Some(4000.0),
                ..Default::default()
            },
            PointRow {
                xpix: Some(3000.0),
                ypix: Some(3000.0),
                ..Default::default()
            },
        ];
        write_csv(&pix_path, &rows).unwrap();

        let fp_path = dir.path().join("fp.csv");
        apply_transform(&tx_path, &pix_path, &fp_path, false).unwrap();
        let mut fp_rows: Vec<PointRow> = read_csv(&fp_path).unwrap();
        for row in &mut fp_rows {
            row.xpix = None;
            row.ypix = None;
        }
        write_csv(&fp_path, &fp_rows).unwrap();

        let back_path = dir.path().join("back.csv");
        apply_transform(&tx_path, &fp_path, &back_path, true).unwrap();
        let back: Vec<PointRow> = read_csv(&back_path).unwrap();
        for (a, b) in rows.iter().zip(&back) {
            assert!((a.xpix.unwrap() - b.xpix.unwrap()).abs() < 1e-6);
            assert!((a.ypix.unwrap() - b.ypix.unwrap()).abs() < 1e-6);
        }
    }
}

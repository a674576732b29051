//! Row types for the CSV tables exchanged with the rest of the system.
//!
//! Column names are upper case; unknown columns are ignored on read.

use fpcal_core::{Real, Vec2};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Composite fiducial key `(LOCATION, PINHOLE_ID)`.
pub type PinholeKey = (i64, i64);

/// One detected spot on an FVC image.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Spot {
    /// Fiducial location, `<= 0` when the spot is not matched to a fiducial.
    #[serde(rename = "LOCATION", default)]
    pub location: i64,
    /// Pinhole within the fiducial, `<= 0` for positioner spots.
    #[serde(rename = "PINHOLE_ID", default)]
    pub pinhole_id: i64,
    #[serde(rename = "XPIX")]
    pub xpix: Real,
    #[serde(rename = "YPIX")]
    pub ypix: Real,
    #[serde(rename = "X_FP", default)]
    pub x_fp: Real,
    #[serde(rename = "Y_FP", default)]
    pub y_fp: Real,
    #[serde(rename = "X_FP_METRO", default)]
    pub x_fp_metro: Real,
    #[serde(rename = "Y_FP_METRO", default)]
    pub y_fp_metro: Real,
    #[serde(rename = "Z_FP_METRO", default)]
    pub z_fp_metro: Real,
}

impl Spot {
    pub fn new(location: i64, pinhole_id: i64, xpix: Real, ypix: Real) -> Self {
        Self {
            location,
            pinhole_id,
            xpix,
            ypix,
            ..Default::default()
        }
    }

    /// Located at a known fiducial and tagged with a pinhole.
    pub fn is_fiducial(&self) -> bool {
        self.location > 0 && self.pinhole_id > 0
    }

    pub fn key(&self) -> PinholeKey {
        (self.location, self.pinhole_id)
    }

    pub fn pix(&self) -> Vec2 {
        Vec2::new(self.xpix, self.ypix)
    }
}

/// Surveyed position of one fiducial pinhole, focal-plane mm.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MetrologyRow {
    #[serde(rename = "LOCATION")]
    pub location: i64,
    #[serde(rename = "PINHOLE_ID")]
    pub pinhole_id: i64,
    #[serde(rename = "X_FP")]
    pub x_fp: Real,
    #[serde(rename = "Y_FP")]
    pub y_fp: Real,
    #[serde(rename = "Z_FP", default)]
    pub z_fp: Real,
}

impl MetrologyRow {
    pub fn key(&self) -> PinholeKey {
        (self.location, self.pinhole_id)
    }

    pub fn xy(&self) -> Vec2 {
        Vec2::new(self.x_fp, self.y_fp)
    }
}

/// One positioner measurement: commanded internal angles and measured
/// position in petal coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleRow {
    #[serde(rename = "POS_ID")]
    pub pos_id: String,
    #[serde(rename = "POS_T")]
    pub pos_t: Real,
    #[serde(rename = "POS_P")]
    pub pos_p: Real,
    #[serde(rename = "X_PTL")]
    pub x_ptl: Real,
    #[serde(rename = "Y_PTL")]
    pub y_ptl: Real,
}

/// All samples of one positioner, in table order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PosSamples {
    pub pos_id: String,
    pub posint: Vec<Vec2>,
    pub ptl: Vec<Vec2>,
}

/// Group rows by `POS_ID`, keeping first-appearance order of positioners
/// and table order of samples within each.
pub fn group_samples(rows: &[SampleRow]) -> Vec<PosSamples> {
    let mut index: HashMap<&str, usize> = HashMap::new();
    let mut groups: Vec<PosSamples> = Vec::new();
    for row in rows {
        let slot = *index.entry(row.pos_id.as_str()).or_insert_with(|| {
            groups.push(PosSamples {
                pos_id: row.pos_id.clone(),
                ..Default::default()
            });
            groups.len() - 1
        });
        groups[slot].posint.push(Vec2::new(row.pos_t, row.pos_p));
        groups[slot].ptl.push(Vec2::new(row.x_ptl, row.y_ptl));
    }
    groups
}

/// Read every row of a headed CSV file.
pub fn read_csv<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, csv::Error> {
    let mut reader = csv::Reader::from_path(path)?;
    reader.deserialize().collect()
}

/// Write rows to a headed CSV file, replacing it.
pub fn write_csv<T: Serialize>(path: &Path, rows: &[T]) -> Result<(), csv::Error> {
    let mut writer = csv::Writer::from_path(path)?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}

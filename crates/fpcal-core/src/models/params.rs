use crate::Real;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A recognized positioner calibration parameter.
///
/// Variants are declared in lexicographic order of their names, so the derived
/// `Ord` (and therefore every `BTreeMap`/`BTreeSet` keyed by `ParamKey`) iterates
/// in the same order as sorting the names as strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ParamKey {
    /// Length of the theta (central) arm.
    #[serde(rename = "LENGTH_R1")]
    LengthR1,
    /// Length of the phi (eccentric) arm.
    #[serde(rename = "LENGTH_R2")]
    LengthR2,
    /// Phi zero-point offset, degrees.
    #[serde(rename = "OFFSET_P")]
    OffsetP,
    /// Theta zero-point offset, degrees.
    #[serde(rename = "OFFSET_T")]
    OffsetT,
    /// Centre x offset in the flat frame.
    #[serde(rename = "OFFSET_X")]
    OffsetX,
    /// Centre y offset in the flat frame.
    #[serde(rename = "OFFSET_Y")]
    OffsetY,
    /// Ratio of achieved to commanded phi rotation.
    #[serde(rename = "SCALE_P")]
    ScaleP,
    /// Ratio of achieved to commanded theta rotation.
    #[serde(rename = "SCALE_T")]
    ScaleT,
}

impl ParamKey {
    /// All keys, in lexicographic name order.
    pub const ALL: [ParamKey; 8] = [
        ParamKey::LengthR1,
        ParamKey::LengthR2,
        ParamKey::OffsetP,
        ParamKey::OffsetT,
        ParamKey::OffsetX,
        ParamKey::OffsetY,
        ParamKey::ScaleP,
        ParamKey::ScaleT,
    ];

    /// Slowly varying geometry of one arm.
    pub const STATIC: [ParamKey; 6] = [
        ParamKey::LengthR1,
        ParamKey::LengthR2,
        ParamKey::OffsetT,
        ParamKey::OffsetP,
        ParamKey::OffsetX,
        ParamKey::OffsetY,
    ];

    /// Multipliers on delta motion. They have no meaning in absolute coordinates.
    pub const DYNAMIC: [ParamKey; 2] = [ParamKey::ScaleT, ParamKey::ScaleP];

    /// Canonical upper-case name.
    pub fn name(self) -> &'static str {
        match self {
            ParamKey::LengthR1 => "LENGTH_R1",
            ParamKey::LengthR2 => "LENGTH_R2",
            ParamKey::OffsetP => "OFFSET_P",
            ParamKey::OffsetT => "OFFSET_T",
            ParamKey::OffsetX => "OFFSET_X",
            ParamKey::OffsetY => "OFFSET_Y",
            ParamKey::ScaleP => "SCALE_P",
            ParamKey::ScaleT => "SCALE_T",
        }
    }

    #[inline]
    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for ParamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A parameter name that is not one of the eight recognized keys.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown parameter key {0:?}")]
pub struct UnknownParamKey(pub String);

impl FromStr for ParamKey {
    type Err = UnknownParamKey;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ParamKey::ALL
            .into_iter()
            .find(|key| key.name() == s)
            .ok_or_else(|| UnknownParamKey(s.to_string()))
    }
}

/// Which partition of the parameters a fit may vary.
///
/// The natural order of usage is two passes: `Static` first, then `Dynamic`
/// seeded with the static results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FitMode {
    /// Fit the geometry; `SCALE_T`/`SCALE_P` are held at their nominal values.
    Static,
    /// Fit the scale factors from consecutive moves; the geometry is held fixed.
    Dynamic,
}

impl FitMode {
    /// Keys held fixed by this mode regardless of the caller's request.
    pub fn forced_fixed(self) -> &'static [ParamKey] {
        match self {
            FitMode::Static => &ParamKey::DYNAMIC,
            FitMode::Dynamic => &ParamKey::STATIC,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            FitMode::Static => "static",
            FitMode::Dynamic => "dynamic",
        }
    }
}

impl fmt::Display for FitMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A fit mode string other than `"static"` or `"dynamic"`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown fit mode {0:?} (expected \"static\" or \"dynamic\")")]
pub struct UnknownFitMode(pub String);

impl FromStr for FitMode {
    type Err = UnknownFitMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "static" => Ok(FitMode::Static),
            "dynamic" => Ok(FitMode::Dynamic),
            other => Err(UnknownFitMode(other.to_string())),
        }
    }
}

/// Partial name -> value mapping, as supplied by callers.
pub type ParamMap = BTreeMap<ParamKey, Real>;

/// Partial name -> `(min, max)` mapping, as supplied by callers.
pub type BoundsMap = BTreeMap<ParamKey, (Real, Real)>;

/// A complete set of the eight positioner parameters.
///
/// Serializes as a JSON object keyed by parameter name. Deserialization fails
/// if any key is missing.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "ParamMap", into = "ParamMap")]
pub struct ParamSet {
    values: [Real; 8],
}

impl ParamSet {
    /// Default nominal values: 3 mm arms, zero offsets, unit scales.
    pub fn nominal() -> Self {
        let mut set = Self { values: [0.0; 8] };
        set.set(ParamKey::LengthR1, 3.0);
        set.set(ParamKey::LengthR2, 3.0);
        set.set(ParamKey::ScaleT, 1.0);
        set.set(ParamKey::ScaleP, 1.0);
        set
    }

    /// Build a complete set from a partial map.
    ///
    /// Returns the first missing key (in lexicographic order) on failure.
    pub fn from_map(map: &ParamMap) -> Result<Self, ParamKey> {
        let mut values = [0.0; 8];
        for key in ParamKey::ALL {
            values[key.index()] = *map.get(&key).ok_or(key)?;
        }
        Ok(Self { values })
    }

    pub fn to_map(&self) -> ParamMap {
        self.iter().collect()
    }

    #[inline]
    pub fn get(&self, key: ParamKey) -> Real {
        self.values[key.index()]
    }

    #[inline]
    pub fn set(&mut self, key: ParamKey, value: Real) {
        self.values[key.index()] = value;
    }

    /// Iterate `(key, value)` pairs in lexicographic key order.
    pub fn iter(&self) -> impl Iterator<Item = (ParamKey, Real)> + '_ {
        ParamKey::ALL.into_iter().map(move |key| (key, self.get(key)))
    }
}

impl Default for ParamSet {
    fn default() -> Self {
        Self::nominal()
    }
}

/// Error produced when deserializing an incomplete [`ParamSet`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("parameter set is missing key {0}")]
pub struct MissingParamKey(pub ParamKey);

impl TryFrom<ParamMap> for ParamSet {
    type Error = MissingParamKey;

    fn try_from(map: ParamMap) -> Result<Self, Self::Error> {
        ParamSet::from_map(&map).map_err(MissingParamKey)
    }
}

impl From<ParamSet> for ParamMap {
    fn from(set: ParamSet) -> Self {
        set.to_map()
    }
}

/// Default nominal values as a caller-facing map.
pub fn default_nominals() -> ParamMap {
    ParamSet::nominal().to_map()
}

/// Default search bounds for every key.
pub fn default_bounds() -> BoundsMap {
    BoundsMap::from([
        (ParamKey::LengthR1, (2.5, 3.5)),
        (ParamKey::LengthR2, (2.5, 3.5)),
        (ParamKey::OffsetT, (-200.0, 200.0)),
        (ParamKey::OffsetP, (-30.0, 30.0)),
        (ParamKey::OffsetX, (-500.0, 500.0)),
        (ParamKey::OffsetY, (-500.0, 500.0)),
        (ParamKey::ScaleT, (0.0, 1.0)),
        (ParamKey::ScaleP, (0.0, 1.0)),
    ])
}

// Calibration records and unit conversions
//
// A record maps raw encoder ticks to engineering units:
//
// 1. subtract `homing_offset` and wrap into one revolution (raw tick → homed tick)
// 2. bound the homed tick to `[range_min, range_max]`
// 3. rescale to the device's `NormMode`
// 4. mirror the result when the drive mode is inverted
//
// `denormalize` runs the same steps backwards and rounds to the nearest
// tick, so a round trip is exact up to that rounding.
//
// Records are stored as a flat JSON object keyed by motor id:
//
// ```json
// { "1": { "drive_mode": "normal", "homing_offset": 1024, "range_min": 900, "range_max": 3100 } }
// ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use super::error::{MotorBusError, Result};

/// Unit a device's position-like registers are exposed in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NormMode {
    /// -100..100 across the calibrated range
    #[serde(rename = "range_m100_100")]
    RangeM100To100,
    /// 0..100 across the calibrated range
    #[serde(rename = "range_0_100")]
    Range0To100,
    /// Degrees relative to the middle of the calibrated range
    Degrees,
    /// Register value untouched
    #[default]
    Raw,
}

/// Direction convention of a joint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriveMode {
    #[default]
    Normal,
    Inverted,
}

/// What to do with values outside the calibrated range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RangePolicy {
    /// Saturate at the range bounds
    #[default]
    Clamp,
    /// Fail with `CalibrationRange`
    Reject,
}

/// Calibration for a single motor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MotorCalibration {
    #[serde(skip)]
    pub id: u8,
    #[serde(default)]
    pub drive_mode: DriveMode,
    pub homing_offset: i32,
    pub range_min: i32,
    pub range_max: i32,
}

impl MotorCalibration {
    pub fn new(
        id: u8,
        drive_mode: DriveMode,
        homing_offset: i32,
        range_min: i32,
        range_max: i32,
    ) -> Result<Self> {
        let calibration = Self {
            id,
            drive_mode,
            homing_offset,
            range_min,
            range_max,
        };
        calibration.validate()?;
        Ok(calibration)
    }

    /// Record with only a homing offset, spanning a full revolution
    pub fn with_homing(id: u8, homing_offset: i32, resolution: u32) -> Self {
        Self {
            id,
            drive_mode: DriveMode::Normal,
            homing_offset,
            range_min: 0,
            range_max: resolution as i32 - 1,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.range_min >= self.range_max {
            return Err(MotorBusError::InvalidCalibration {
                id: self.id,
                drive_mode: self.drive_mode,
                reason: format!(
                    "range_min {} must be below range_max {}",
                    self.range_min, self.range_max
                ),
            });
        }
        Ok(())
    }

    /// Midpoint of the calibrated range, in homed ticks
    pub fn center(&self) -> f64 {
        (self.range_min as f64 + self.range_max as f64) / 2.0
    }

    fn span(&self) -> f64 {
        (self.range_max - self.range_min) as f64
    }

    fn inverted(&self) -> bool {
        self.drive_mode == DriveMode::Inverted
    }

    fn range_error(&self, value: f64) -> MotorBusError {
        MotorBusError::CalibrationRange {
            id: self.id,
            value,
            min: self.range_min,
            max: self.range_max,
        }
    }

    fn bound(&self, homed: f64, policy: RangePolicy) -> Result<f64> {
        if !homed.is_finite() {
            return Err(self.range_error(homed));
        }
        let (min, max) = (self.range_min as f64, self.range_max as f64);
        if (min..=max).contains(&homed) {
            return Ok(homed);
        }
        match policy {
            RangePolicy::Clamp => Ok(homed.clamp(min, max)),
            RangePolicy::Reject => Err(self.range_error(homed)),
        }
    }
}

/// Convert a raw register value to the device's unit
pub fn normalize(
    raw: i64,
    calibration: &MotorCalibration,
    mode: NormMode,
    resolution: u32,
    policy: RangePolicy,
) -> Result<f64> {
    if mode == NormMode::Raw {
        return Ok(raw as f64);
    }

    let homed = (raw - calibration.homing_offset as i64).rem_euclid(resolution as i64);
    let homed = calibration.bound(homed as f64, policy)?;
    let min = calibration.range_min as f64;

    let value = match mode {
        NormMode::RangeM100To100 => {
            let value = (homed - min) / calibration.span() * 200.0 - 100.0;
            if calibration.inverted() { -value } else { value }
        }
        NormMode::Range0To100 => {
            let value = (homed - min) / calibration.span() * 100.0;
            if calibration.inverted() { 100.0 - value } else { value }
        }
        NormMode::Degrees => {
            let value = (homed - calibration.center()) * 360.0 / resolution as f64;
            if calibration.inverted() { -value } else { value }
        }
        NormMode::Raw => unreachable!("raw mode returns early"),
    };
    Ok(value)
}

/// Convert a value in the device's unit back to a raw register value
pub fn denormalize(
    value: f64,
    calibration: &MotorCalibration,
    mode: NormMode,
    resolution: u32,
    policy: RangePolicy,
) -> Result<i64> {
    if !value.is_finite() {
        return Err(calibration.range_error(value));
    }
    let min = calibration.range_min as f64;

    let homed = match mode {
        NormMode::Raw => return Ok(value.round() as i64),
        NormMode::RangeM100To100 => {
            let value = if calibration.inverted() { -value } else { value };
            (value + 100.0) / 200.0 * calibration.span() + min
        }
        NormMode::Range0To100 => {
            let value = if calibration.inverted() { 100.0 - value } else { value };
            value / 100.0 * calibration.span() + min
        }
        NormMode::Degrees => {
            let value = if calibration.inverted() { -value } else { value };
            value * resolution as f64 / 360.0 + calibration.center()
        }
    };

    let homed = calibration.bound(homed, policy).map_err(|_| MotorBusError::CalibrationRange {
        id: calibration.id,
        value,
        min: calibration.range_min,
        max: calibration.range_max,
    })?;
    Ok((homed.round() as i64 + calibration.homing_offset as i64).rem_euclid(resolution as i64))
}

/// Calibration records for every motor on a bus
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CalibrationFile {
    records: BTreeMap<u8, MotorCalibration>,
}

impl CalibrationFile {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load and validate every record. Nothing is returned unless the whole
    /// file is valid.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut file: CalibrationFile =
            serde_json::from_str(&contents).map_err(|source| MotorBusError::CalibrationFile {
                path: path.to_path_buf(),
                source,
            })?;
        for (id, record) in file.records.iter_mut() {
            record.id = *id;
            record.validate()?;
        }
        Ok(file)
    }

    /// Write through a temporary sibling and rename it into place
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).map_err(|source| {
            MotorBusError::CalibrationFile {
                path: path.to_path_buf(),
                source,
            }
        })?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn insert(&mut self, record: MotorCalibration) {
        self.records.insert(record.id, record);
    }

    pub fn remove(&mut self, id: u8) -> Option<MotorCalibration> {
        self.records.remove(&id)
    }

    pub fn get(&self, id: u8) -> Option<&MotorCalibration> {
        self.records.get(&id)
    }

    pub fn contains(&self, id: u8) -> bool {
        self.records.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MotorCalibration> {
        self.records.values()
    }
}

impl FromIterator<MotorCalibration> for CalibrationFile {
    fn from_iter<I: IntoIterator<Item = MotorCalibration>>(iter: I) -> Self {
        Self {
            records: iter.into_iter().map(|r| (r.id, r)).collect(),
        }
    }
}

//! Threshold classification of vitals records.
//!
//! Everything here is a pure function of the record. The only side effect is
//! the warning [`verdict`] and [`classify`] log for records that fail validation.

use std::fmt;

use vitals_api::vitals::json_type_name;
use vitals_api::{VitalField, VitalsRecord};

/// Acceptable range for one measurement. Bounds are inclusive.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Threshold {
    pub field: VitalField,
    pub min: f64,
    /// `None` = no upper bound.
    pub max: Option<f64>,
}

impl Threshold {
    const fn between(field: VitalField, min: f64, max: f64) -> Self {
        Self { field, min, max: Some(max) }
    }

    const fn at_least(field: VitalField, min: f64) -> Self {
        Self { field, min, max: None }
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && self.max.is_none_or(|max| value <= max)
    }
}

/// Fixed physiological ranges. A record is healthy only if every reading
/// falls inside its range.
pub const THRESHOLDS: [Threshold; 7] = [
    Threshold::between(VitalField::BodyTemp, 97.0, 99.0),
    Threshold::between(VitalField::HeartRate, 60.0, 100.0),
    Threshold::between(VitalField::Systolic, 90.0, 120.0),
    Threshold::between(VitalField::Diastolic, 60.0, 80.0),
    Threshold::between(VitalField::Breaths, 12.0, 20.0),
    Threshold::at_least(VitalField::Oxygen, 94.0),
    Threshold::between(VitalField::Glucose, 70.0, 140.0),
];

/// Outcome of classifying one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Healthy,
    Unhealthy,
    /// A recognized field is missing or not a number.
    Invalid,
}

impl Verdict {
    pub fn is_healthy(&self) -> bool {
        matches!(self, Verdict::Healthy)
    }
}

/// Outbound stream a record is forwarded to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    Healthy,
    Unhealthy,
}

impl From<Verdict> for Destination {
    /// Invalid records are routed with the unhealthy ones.
    fn from(verdict: Verdict) -> Self {
        match verdict {
            Verdict::Healthy => Destination::Healthy,
            Verdict::Unhealthy | Verdict::Invalid => Destination::Unhealthy,
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Healthy => f.write_str("healthy"),
            Destination::Unhealthy => f.write_str("unhealthy"),
        }
    }
}

/// Why a record could not be evaluated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidReason {
    Missing,
    NonNumeric { found: &'static str },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidVitals {
    pub field: VitalField,
    pub reason: InvalidReason,
}

impl fmt::Display for InvalidVitals {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.reason {
            InvalidReason::Missing => write!(f, "field '{}' is missing", self.field),
            InvalidReason::NonNumeric { found } => {
                write!(f, "field '{}' must be numeric, got {found}", self.field)
            }
        }
    }
}

impl std::error::Error for InvalidVitals {}

/// The seven readings of a valid record, in [`VitalField::ALL`] order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Readings([f64; 7]);

impl Readings {
    pub fn get(&self, field: VitalField) -> f64 {
        let idx = VitalField::ALL.iter().position(|f| *f == field).unwrap_or_default();
        self.0[idx]
    }

    /// Fields whose reading lies outside its threshold.
    pub fn out_of_range(&self) -> Vec<VitalField> {
        THRESHOLDS
            .iter()
            .filter(|t| !t.contains(self.get(t.field)))
            .map(|t| t.field)
            .collect()
    }

    pub fn is_healthy(&self) -> bool {
        THRESHOLDS.iter().all(|t| t.contains(self.get(t.field)))
    }
}

/// Extract all seven readings, or report the first field that is unusable.
pub fn validate(record: &VitalsRecord) -> Result<Readings, InvalidVitals> {
    let mut values = [0.0; 7];
    for (slot, field) in values.iter_mut().zip(VitalField::ALL) {
        let value = record.get(field).ok_or(InvalidVitals {
            field,
            reason: InvalidReason::Missing,
        })?;
        *slot = record.numeric(field).ok_or(InvalidVitals {
            field,
            reason: InvalidReason::NonNumeric { found: json_type_name(value) },
        })?;
    }
    Ok(Readings(values))
}

/// Three-way verdict without logging.
pub fn evaluate(record: &VitalsRecord) -> Verdict {
    match validate(record) {
        Ok(readings) if readings.is_healthy() => Verdict::Healthy,
        Ok(_) => Verdict::Unhealthy,
        Err(_) => Verdict::Invalid,
    }
}

/// Three-way verdict, logging a warning for invalid records.
pub fn verdict(record: &VitalsRecord) -> Verdict {
    match validate(record) {
        Ok(readings) if readings.is_healthy() => Verdict::Healthy,
        Ok(readings) => {
            tracing::debug!(out_of_range = ?readings.out_of_range(), "vitals outside thresholds");
            Verdict::Unhealthy
        }
        Err(invalid) => {
            tracing::warn!(
                field = %invalid.field,
                reason = %invalid,
                record = %record,
                "invalid vitals data, all values must be numeric"
            );
            Verdict::Invalid
        }
    }
}

/// `true` if the record is healthy.
///
/// A record with a missing or non-numeric field is not healthy; a warning
/// naming the record and the field is logged and `false` is returned.
pub fn classify(record: &VitalsRecord) -> bool {
    verdict(record).is_healthy()
}

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::TransportError;

/// The seven measurements a vitals record must carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VitalField {
    BodyTemp,
    HeartRate,
    Systolic,
    Diastolic,
    Breaths,
    Oxygen,
    Glucose,
}

impl VitalField {
    /// All recognized fields, in wire order.
    pub const ALL: [VitalField; 7] = [
        VitalField::BodyTemp,
        VitalField::HeartRate,
        VitalField::Systolic,
        VitalField::Diastolic,
        VitalField::Breaths,
        VitalField::Oxygen,
        VitalField::Glucose,
    ];

    /// JSON key of the field.
    pub fn name(&self) -> &'static str {
        match self {
            VitalField::BodyTemp => "body_temp",
            VitalField::HeartRate => "heart_rate",
            VitalField::Systolic => "systolic",
            VitalField::Diastolic => "diastolic",
            VitalField::Breaths => "breaths",
            VitalField::Oxygen => "oxygen",
            VitalField::Glucose => "glucose",
        }
    }
}

impl fmt::Display for VitalField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A vitals reading as received: field name → JSON value.
///
/// Unrecognized keys are kept so the record is forwarded unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VitalsRecord {
    fields: Map<String, Value>,
}

impl VitalsRecord {
    pub fn new(fields: Map<String, Value>) -> Self {
        Self { fields }
    }

    /// Decode a UTF-8 JSON object payload.
    pub fn from_payload(payload: &[u8]) -> Result<Self, TransportError> {
        let text = std::str::from_utf8(payload)?;
        match serde_json::from_str::<Value>(text)? {
            Value::Object(fields) => Ok(Self { fields }),
            other => Err(TransportError::format(format!(
                "vitals payload must be a JSON object, got {}",
                json_type_name(&other)
            ))),
        }
    }

    /// Encode back to a UTF-8 JSON payload.
    pub fn to_payload(&self) -> Result<Vec<u8>, TransportError> {
        Ok(serde_json::to_vec(&self.fields)?)
    }

    /// Raw value of a recognized field, if present.
    pub fn get(&self, field: VitalField) -> Option<&Value> {
        self.fields.get(field.name())
    }

    /// Numeric value of a field. `None` if missing or not a JSON number.
    pub fn numeric(&self, field: VitalField) -> Option<f64> {
        match self.get(field)? {
            Value::Number(n) => n.as_f64(),
            _ => None,
        }
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn into_fields(self) -> Map<String, Value> {
        self.fields
    }
}

impl fmt::Display for VitalsRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(&self.fields) {
            Ok(s) => f.write_str(&s),
            Err(_) => f.write_str("<unprintable record>"),
        }
    }
}

/// Short JSON type name for diagnostics.
pub fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

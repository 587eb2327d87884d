//! Core telemetry types for groundlink.
//!
//! A deployment flies exactly one [`Schema`]. Every decoded line becomes a
//! [`Reading`] of that schema, and the link stamps it into a
//! [`TelemetryFrame`] with the wall-clock time it was captured.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// The field layout flown by the flight computer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Schema {
    /// Yaw, pitch, roll, velocity and altitude.
    #[default]
    Attitude,
    /// Altitude, temperature, pressure, acceleration and yaw vector.
    Environmental,
}

impl Schema {
    /// Fields of this schema, in positional (CSV) order.
    #[must_use]
    pub fn fields(self) -> &'static [Field] {
        match self {
            Self::Attitude => &[
                Field::Yaw,
                Field::Pitch,
                Field::Roll,
                Field::Velocity,
                Field::Altitude,
            ],
            Self::Environmental => &[
                Field::Altitude,
                Field::Temperature,
                Field::Pressure,
                Field::AccelX,
                Field::AccelY,
                Field::AccelZ,
                Field::YawX,
                Field::YawY,
                Field::YawZ,
            ],
        }
    }

    /// Check whether `field` belongs to this schema.
    #[must_use]
    pub fn contains(self, field: Field) -> bool {
        self.fields().contains(&field)
    }
}

impl std::fmt::Display for Schema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Attitude => write!(f, "attitude"),
            Self::Environmental => write!(f, "environmental"),
        }
    }
}

impl FromStr for Schema {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "attitude" => Ok(Self::Attitude),
            "environmental" => Ok(Self::Environmental),
            other => Err(Error::UnknownSchema(other.to_string())),
        }
    }
}

/// A single numeric telemetry field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    /// Heading angle in degrees.
    Yaw,
    /// Pitch angle in degrees.
    Pitch,
    /// Roll angle in degrees.
    Roll,
    /// Vertical velocity in m/s.
    Velocity,
    /// Altitude in metres.
    Altitude,
    /// Temperature in degrees Celsius.
    Temperature,
    /// Raw barometric pressure.
    Pressure,
    /// Acceleration, X axis.
    AccelX,
    /// Acceleration, Y axis.
    AccelY,
    /// Acceleration, Z axis.
    AccelZ,
    /// Yaw vector, X component.
    YawX,
    /// Yaw vector, Y component.
    YawY,
    /// Yaw vector, Z component.
    YawZ,
}

impl Field {
    /// The key used for this field in encoded frames and structured input.
    #[must_use]
    pub fn key(self) -> &'static str {
        match self {
            Self::Yaw => "yaw",
            Self::Pitch => "pitch",
            Self::Roll => "roll",
            Self::Velocity => "vel",
            Self::Altitude => "alt",
            Self::Temperature => "temp",
            Self::Pressure => "pres",
            Self::AccelX => "acc_x",
            Self::AccelY => "acc_y",
            Self::AccelZ => "acc_z",
            Self::YawX => "yaw_x",
            Self::YawY => "yaw_y",
            Self::YawZ => "yaw_z",
        }
    }
}

impl std::fmt::Display for Field {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.key())
    }
}

/// Attitude-oriented readings.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Attitude {
    /// Yaw in degrees.
    pub yaw: f64,
    /// Pitch in degrees.
    pub pitch: f64,
    /// Roll in degrees.
    pub roll: f64,
    /// Velocity in m/s.
    #[serde(rename = "vel")]
    pub velocity: f64,
    /// Altitude in metres.
    #[serde(rename = "alt")]
    pub altitude: f64,
}

/// Environmental readings.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Environmental {
    /// Altitude in metres.
    #[serde(rename = "alt")]
    pub altitude: f64,
    /// Temperature in degrees Celsius.
    #[serde(rename = "temp")]
    pub temperature: f64,
    /// Raw barometric pressure.
    #[serde(rename = "pres")]
    pub pressure: f64,
    /// Acceleration, X axis.
    #[serde(rename = "acc_x")]
    pub accel_x: f64,
    /// Acceleration, Y axis.
    #[serde(rename = "acc_y")]
    pub accel_y: f64,
    /// Acceleration, Z axis.
    #[serde(rename = "acc_z")]
    pub accel_z: f64,
    /// Yaw vector, X component.
    pub yaw_x: f64,
    /// Yaw vector, Y component.
    pub yaw_y: f64,
    /// Yaw vector, Z component.
    pub yaw_z: f64,
}

/// One decoded sample, tagged with the schema it belongs to.
///
/// Every field always carries a value. A field missing from the source line
/// reads as `0.0`, exactly like one sent as zero.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "schema", rename_all = "snake_case")]
pub enum Reading {
    /// An attitude-schema sample.
    Attitude(Attitude),
    /// An environmental-schema sample.
    Environmental(Environmental),
}

impl Default for Reading {
    fn default() -> Self {
        Self::zeroed(Schema::default())
    }
}

impl Reading {
    /// An all-zero reading of the given schema.
    #[must_use]
    pub fn zeroed(schema: Schema) -> Self {
        match schema {
            Schema::Attitude => Self::Attitude(Attitude::default()),
            Schema::Environmental => Self::Environmental(Environmental::default()),
        }
    }

    /// The schema of this reading.
    #[must_use]
    pub fn schema(&self) -> Schema {
        match self {
            Self::Attitude(_) => Schema::Attitude,
            Self::Environmental(_) => Schema::Environmental,
        }
    }

    /// Check whether every field is zero.
    #[must_use]
    pub fn is_zeroed(&self) -> bool {
        *self == Self::zeroed(self.schema())
    }

    /// Set a field. Returns `false` (and changes nothing) if the field is not
    /// part of this reading's schema.
    pub fn set(&mut self, field: Field, value: f64) -> bool {
        match self.slot_mut(field) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    /// Read a field, or `None` if it is not part of this reading's schema.
    #[must_use]
    pub fn get(&self, field: Field) -> Option<f64> {
        let mut copy = *self;
        copy.slot_mut(field).map(|slot| *slot)
    }

    /// All fields of the schema with their values, in positional order.
    #[must_use]
    pub fn values(&self) -> Vec<(Field, f64)> {
        self.schema()
            .fields()
            .iter()
            .filter_map(|&field| self.get(field).map(|value| (field, value)))
            .collect()
    }

    fn slot_mut(&mut self, field: Field) -> Option<&mut f64> {
        match self {
            Self::Attitude(a) => match field {
                Field::Yaw => Some(&mut a.yaw),
                Field::Pitch => Some(&mut a.pitch),
                Field::Roll => Some(&mut a.roll),
                Field::Velocity => Some(&mut a.velocity),
                Field::Altitude => Some(&mut a.altitude),
                _ => None,
            },
            Self::Environmental(e) => match field {
                Field::Altitude => Some(&mut e.altitude),
                Field::Temperature => Some(&mut e.temperature),
                Field::Pressure => Some(&mut e.pressure),
                Field::AccelX => Some(&mut e.accel_x),
                Field::AccelY => Some(&mut e.accel_y),
                Field::AccelZ => Some(&mut e.accel_z),
                Field::YawX => Some(&mut e.yaw_x),
                Field::YawY => Some(&mut e.yaw_y),
                Field::YawZ => Some(&mut e.yaw_z),
                _ => None,
            },
        }
    }
}

/// A decoded reading stamped with the time the ground station captured it.
///
/// Encodes as a flat, self-describing JSON object:
/// `{"ts":"…","schema":"attitude","yaw":10.0,…}`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TelemetryFrame {
    /// When the line was read off the link.
    #[serde(rename = "ts")]
    pub captured_at: DateTime<Utc>,

    /// The decoded values.
    #[serde(flatten)]
    pub reading: Reading,
}

impl TelemetryFrame {
    /// Stamp a reading with the current time.
    #[must_use]
    pub fn new(reading: Reading) -> Self {
        Self::at(reading, Utc::now())
    }

    /// Stamp a reading with an explicit capture time.
    #[must_use]
    pub fn at(reading: Reading, captured_at: DateTime<Utc>) -> Self {
        Self {
            captured_at,
            reading,
        }
    }

    /// A zero-valued frame of the given schema, stamped now.
    #[must_use]
    pub fn initial(schema: Schema) -> Self {
        Self::new(Reading::zeroed(schema))
    }

    /// Encode this frame as a single line of JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails, which does not happen for
    /// finite values.
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_display_and_parse() {
        assert_eq!(Schema::Attitude.to_string(), "attitude");
        assert_eq!(Schema::Environmental.to_string(), "environmental");
        assert_eq!("Attitude".parse::<Schema>().unwrap(), Schema::Attitude);
        assert_eq!(
            " environmental ".parse::<Schema>().unwrap(),
            Schema::Environmental
        );
        assert!(matches!(
            "orbital".parse::<Schema>(),
            Err(Error::UnknownSchema(_))
        ));
    }

    #[test]
    fn test_schema_fields_are_disjoint_except_altitude() {
        let attitude = Schema::Attitude.fields();
        let environmental = Schema::Environmental.fields();
        assert_eq!(attitude.len(), 5);
        assert_eq!(environmental.len(), 9);
        let shared: Vec<_> = attitude
            .iter()
            .filter(|f| environmental.contains(f))
            .collect();
        assert_eq!(shared, vec![&Field::Altitude]);
    }

    #[test]
    fn test_reading_zeroed() {
        let reading = Reading::zeroed(Schema::Environmental);
        assert_eq!(reading.schema(), Schema::Environmental);
        assert!(reading.is_zeroed());
        assert!(reading.values().iter().all(|(_, v)| *v == 0.0));
    }

    #[test]
    fn test_reading_set_and_get() {
        let mut reading = Reading::zeroed(Schema::Attitude);
        assert!(reading.set(Field::Yaw, 12.5));
        assert!(reading.set(Field::Altitude, 300.0));
        assert_eq!(reading.get(Field::Yaw), Some(12.5));
        assert_eq!(reading.get(Field::Altitude), Some(300.0));
        assert!(!reading.is_zeroed());
    }

    #[test]
    fn test_reading_rejects_foreign_fields() {
        let mut reading = Reading::zeroed(Schema::Attitude);
        assert!(!reading.set(Field::Temperature, 27.5));
        assert_eq!(reading.get(Field::Temperature), None);
        assert!(reading.is_zeroed());
    }

    #[test]
    fn test_reading_values_positional_order() {
        let mut reading = Reading::zeroed(Schema::Attitude);
        reading.set(Field::Roll, 3.0);
        let fields: Vec<Field> = reading.values().into_iter().map(|(f, _)| f).collect();
        assert_eq!(fields, Schema::Attitude.fields());
        assert_eq!(reading.values()[2], (Field::Roll, 3.0));
    }

    #[test]
    fn test_frame_encoding_is_flat_and_self_describing() {
        let mut reading = Reading::zeroed(Schema::Environmental);
        reading.set(Field::Temperature, 27.5);
        let frame = TelemetryFrame::new(reading);

        let value: serde_json::Value = serde_json::from_str(&frame.encode().unwrap()).unwrap();
        assert_eq!(value["schema"], "environmental");
        assert_eq!(value["temp"], 27.5);
        assert_eq!(value["acc_x"], 0.0);
        assert!(value.get("ts").is_some());
        assert!(value.get("yaw").is_none());
    }

    #[test]
    fn test_frame_serialization_roundtrip() {
        let mut reading = Reading::zeroed(Schema::Attitude);
        reading.set(Field::Velocity, 5.0);
        let frame = TelemetryFrame::new(reading);

        let json = serde_json::to_string(&frame).unwrap();
        let decoded: TelemetryFrame = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_initial_frame_is_zeroed() {
        let frame = TelemetryFrame::initial(Schema::Attitude);
        assert!(frame.reading.is_zeroed());
        assert!(frame.captured_at <= Utc::now());
    }
}

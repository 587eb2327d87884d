//! Decoding of raw telemetry lines.
//!
//! The flight computer has gone through several firmware revisions, each
//! printing its samples differently. [`FrameParser`] accepts all of them and
//! never fails: a line it cannot make sense of decodes to an all-zero
//! [`Reading`] so the ingestion loop simply moves on to the next line.
//!
//! Formats are tried in priority order, first match wins:
//!
//! 1. structured object: `{"yaw":10.0,"pitch":20.0,"roll":30.0}`
//! 2. labeled segment: `YPR: 10.0,20.0,30.0;VEL:5.0;ALT:100.0`
//! 3. delimited label-value: `Data: A-450;T-27.5;P-1;X-200;YX-1`
//! 4. positional CSV: `10.0,20.0,30.0,5.0,100.0`

use std::sync::OnceLock;

use regex::Regex;
use serde_json::{Map, Value};
use tracing::{debug, trace};

use crate::telemetry::{Field, Reading, Schema};

/// Minimum number of tokens for a positional line.
const MIN_POSITIONAL_TOKENS: usize = 3;

/// Optional prefix carried by delimited label-value lines.
const DELIMITED_PREFIX: &str = "Data:";

/// The textual encoding a line was decoded from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LineFormat {
    /// A JSON object of field names to numbers.
    Object,
    /// A `YPR:` triple with optional `VEL:` / `ALT:` labels.
    Labeled,
    /// `;`-separated `KEY-value` segments.
    Delimited,
    /// Bare comma/whitespace separated numbers.
    Positional,
}

impl std::fmt::Display for LineFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Object => write!(f, "object"),
            Self::Labeled => write!(f, "labeled"),
            Self::Delimited => write!(f, "delimited"),
            Self::Positional => write!(f, "positional"),
        }
    }
}

/// Stateless decoder for one deployment's [`Schema`].
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameParser {
    schema: Schema,
}

impl FrameParser {
    /// Create a parser that fills readings of `schema`.
    #[must_use]
    pub fn new(schema: Schema) -> Self {
        Self { schema }
    }

    /// The schema this parser produces.
    #[must_use]
    pub fn schema(&self) -> Schema {
        self.schema
    }

    /// Decode a line. Unrecognized input yields an all-zero reading.
    #[must_use]
    pub fn parse(&self, line: &str) -> Reading {
        self.decode(line).0
    }

    /// Decode a line and report which format matched, if any.
    #[must_use]
    pub fn decode(&self, line: &str) -> (Reading, Option<LineFormat>) {
        let line = line.trim();

        let decoded = self
            .parse_object(line)
            .map(|r| (r, LineFormat::Object))
            .or_else(|| self.parse_labeled(line).map(|r| (r, LineFormat::Labeled)))
            .or_else(|| self.parse_delimited(line).map(|r| (r, LineFormat::Delimited)))
            .or_else(|| {
                self.parse_positional(line)
                    .map(|r| (r, LineFormat::Positional))
            });

        match decoded {
            Some((reading, format)) => {
                trace!(%format, schema = %self.schema, "decoded telemetry line");
                (reading, Some(format))
            }
            None => {
                debug!(line, schema = %self.schema, "unrecognized telemetry line");
                (Reading::zeroed(self.schema), None)
            }
        }
    }

    fn parse_object(&self, line: &str) -> Option<Reading> {
        if !(line.starts_with('{') && line.ends_with('}')) {
            return None;
        }
        let object: Map<String, Value> = serde_json::from_str(line).ok()?;

        let mut reading = Reading::zeroed(self.schema);
        for (key, value) in &object {
            if let Some(field) = object_field(key) {
                reading.set(field, coerce_value(value));
            }
        }
        Some(reading)
    }

    fn parse_labeled(&self, line: &str) -> Option<Reading> {
        // Only the attitude firmware ever printed a labeled triple.
        if self.schema != Schema::Attitude {
            return None;
        }
        let captures = ypr_pattern().captures(line)?;

        let mut reading = Reading::zeroed(self.schema);
        for (index, field) in [Field::Yaw, Field::Pitch, Field::Roll].into_iter().enumerate() {
            let value = captures.get(index + 1).map_or(0.0, |m| coerce_str(m.as_str()));
            reading.set(field, value);
        }

        let rest = &line[captures.get(0).map_or(0, |m| m.end())..];
        for (pattern, field) in [
            (vel_pattern(), Field::Velocity),
            (alt_pattern(), Field::Altitude),
        ] {
            if let Some(m) = pattern.captures(rest).and_then(|c| c.get(1)) {
                reading.set(field, coerce_str(m.as_str()));
            }
        }
        Some(reading)
    }

    fn parse_delimited(&self, line: &str) -> Option<Reading> {
        let body = line.strip_prefix(DELIMITED_PREFIX).unwrap_or(line);

        let mut reading = Reading::zeroed(self.schema);
        let mut recognized = false;
        for segment in body.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            let Some((key, value)) = segment.split_once('-') else {
                continue;
            };
            if let Some(field) = label_field(self.schema, key.trim()) {
                reading.set(field, coerce_str(value));
                recognized = true;
            }
        }
        recognized.then_some(reading)
    }

    fn parse_positional(&self, line: &str) -> Option<Reading> {
        let tokens: Vec<&str> = line
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|t| !t.is_empty())
            .collect();
        if tokens.len() < MIN_POSITIONAL_TOKENS {
            return None;
        }

        let values = tokens
            .iter()
            .map(|t| parse_finite(t))
            .collect::<Option<Vec<f64>>>()?;

        let mut reading = Reading::zeroed(self.schema);
        for (&field, value) in self.schema.fields().iter().zip(values) {
            reading.set(field, value);
        }
        Some(reading)
    }
}

/// Map a structured-object key to a field.
fn object_field(key: &str) -> Option<Field> {
    let field = match key {
        "yaw" => Field::Yaw,
        "pitch" => Field::Pitch,
        "roll" => Field::Roll,
        "vel" | "velocity" => Field::Velocity,
        "alt" | "altitude" => Field::Altitude,
        "temp" | "temperature" => Field::Temperature,
        "pres" | "pressure" => Field::Pressure,
        "acc_x" => Field::AccelX,
        "acc_y" => Field::AccelY,
        "acc_z" => Field::AccelZ,
        "yaw_x" => Field::YawX,
        "yaw_y" => Field::YawY,
        "yaw_z" => Field::YawZ,
        _ => return None,
    };
    Some(field)
}

/// Map a delimited segment label to a field of `schema`.
fn label_field(schema: Schema, label: &str) -> Option<Field> {
    let field = match (schema, label) {
        (Schema::Environmental, "A") | (Schema::Attitude, "ALT") => Field::Altitude,
        (Schema::Environmental, "T") => Field::Temperature,
        (Schema::Environmental, "P") => Field::Pressure,
        (Schema::Environmental, "X") => Field::AccelX,
        (Schema::Environmental, "Y") => Field::AccelY,
        (Schema::Environmental, "Z") => Field::AccelZ,
        (Schema::Environmental, "YX") => Field::YawX,
        (Schema::Environmental, "YY") => Field::YawY,
        (Schema::Environmental, "YZ") => Field::YawZ,
        (Schema::Attitude, "YAW") => Field::Yaw,
        (Schema::Attitude, "PITCH") => Field::Pitch,
        (Schema::Attitude, "ROLL") => Field::Roll,
        (Schema::Attitude, "VEL") => Field::Velocity,
        _ => return None,
    };
    Some(field)
}

fn parse_finite(s: &str) -> Option<f64> {
    s.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Coerce a textual value, falling back to zero for this field only.
fn coerce_str(s: &str) -> f64 {
    parse_finite(s).unwrap_or(0.0)
}

fn coerce_value(value: &Value) -> f64 {
    match value {
        Value::Number(n) => n.as_f64().filter(|v| v.is_finite()).unwrap_or(0.0),
        Value::String(s) => coerce_str(s),
        _ => 0.0,
    }
}

const NUMBER: &str = r"([-+0-9.eE]+)";

fn ypr_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(&format!(r"YPR\s*:\s*{NUMBER}\s*,\s*{NUMBER}\s*,\s*{NUMBER}"))
            .expect("YPR pattern is valid")
    })
}

fn vel_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(&format!(r"VEL\s*:\s*{NUMBER}")).expect("VEL pattern is valid"))
}

fn alt_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(&format!(r"ALT\s*:\s*{NUMBER}")).expect("ALT pattern is valid"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::{Attitude, Environmental};

    fn attitude(line: &str) -> Attitude {
        match FrameParser::new(Schema::Attitude).parse(line) {
            Reading::Attitude(a) => a,
            other => panic!("expected attitude reading, got {other:?}"),
        }
    }

    fn environmental(line: &str) -> Environmental {
        match FrameParser::new(Schema::Environmental).parse(line) {
            Reading::Environmental(e) => e,
            other => panic!("expected environmental reading, got {other:?}"),
        }
    }

    #[test]
    fn test_labeled_segment_line() {
        let a = attitude("YPR: 10,20,30;VEL:5;ALT:100");
        assert_eq!(
            a,
            Attitude {
                yaw: 10.0,
                pitch: 20.0,
                roll: 30.0,
                velocity: 5.0,
                altitude: 100.0,
            }
        );
    }

    #[test]
    fn test_labeled_segment_with_decimals_and_spacing() {
        let a = attitude("  YPR : -1.5e1 , 2.25,+3 ; ALT : 99.5 ");
        assert_eq!(a.yaw, -15.0);
        assert_eq!(a.pitch, 2.25);
        assert_eq!(a.roll, 3.0);
        assert_eq!(a.velocity, 0.0);
        assert_eq!(a.altitude, 99.5);
    }

    #[test]
    fn test_labeled_aux_before_triple_is_ignored() {
        let a = attitude("ALT:500;YPR:1,2,3");
        assert_eq!(a.altitude, 0.0);
        assert_eq!(a.yaw, 1.0);
    }

    #[test]
    fn test_positional_three_tokens() {
        let a = attitude("1,2,3");
        assert_eq!(
            a,
            Attitude {
                yaw: 1.0,
                pitch: 2.0,
                roll: 3.0,
                velocity: 0.0,
                altitude: 0.0,
            }
        );
    }

    #[test]
    fn test_positional_five_tokens_mixed_separators() {
        let a = attitude("10.0, 20.0 30.0,5.0   100.0");
        assert_eq!(a.velocity, 5.0);
        assert_eq!(a.altitude, 100.0);
    }

    #[test]
    fn test_positional_non_numeric_token_yields_zero() {
        let reading = FrameParser::new(Schema::Attitude).parse("1,2,x");
        assert!(reading.is_zeroed());
    }

    #[test]
    fn test_positional_too_few_tokens_yields_zero() {
        let (reading, format) = FrameParser::new(Schema::Attitude).decode("1,2");
        assert!(reading.is_zeroed());
        assert_eq!(format, None);
    }

    #[test]
    fn test_object_partial_fields() {
        let a = attitude(r#"{"yaw":5,"pitch":0}"#);
        assert_eq!(
            a,
            Attitude {
                yaw: 5.0,
                ..Attitude::default()
            }
        );
    }

    #[test]
    fn test_object_coerces_numeric_strings_and_ignores_unknown_keys() {
        let a = attitude(r#"{"roll":"12.5","vel":"fast","battery":3.7,"alt":250}"#);
        assert_eq!(a.roll, 12.5);
        assert_eq!(a.velocity, 0.0);
        assert_eq!(a.altitude, 250.0);
    }

    #[test]
    fn test_object_ignores_fields_of_other_schema() {
        let a = attitude(r#"{"temp":27.5,"yaw":1}"#);
        assert_eq!(a.yaw, 1.0);
        assert_eq!(a.altitude, 0.0);
    }

    #[test]
    fn test_invalid_object_falls_through() {
        let (reading, format) = FrameParser::new(Schema::Attitude).decode("{1,2,3}");
        assert!(reading.is_zeroed());
        assert_eq!(format, None);
    }

    #[test]
    fn test_delimited_line() {
        let e = environmental("Data: A-450; T-27.5; X-5");
        assert_eq!(
            e,
            Environmental {
                altitude: 450.0,
                temperature: 27.5,
                accel_x: 5.0,
                ..Environmental::default()
            }
        );
    }

    #[test]
    fn test_delimited_full_line() {
        let e = environmental("Data: A-450;T-27.5;P-1;X-200;Y-500;Z-450;YX-1;YY-2;YZ-3");
        assert_eq!(e.pressure, 1.0);
        assert_eq!(e.accel_y, 500.0);
        assert_eq!(e.accel_z, 450.0);
        assert_eq!(e.yaw_x, 1.0);
        assert_eq!(e.yaw_y, 2.0);
        assert_eq!(e.yaw_z, 3.0);
    }

    #[test]
    fn test_delimited_without_prefix_tolerates_team_segment() {
        let e = environmental("CAN-TI-34; A-450; T-27.5;");
        assert_eq!(e.altitude, 450.0);
        assert_eq!(e.temperature, 27.5);
    }

    #[test]
    fn test_delimited_bad_value_zeroes_only_that_field() {
        let e = environmental("Data: A-abc; T-27.5");
        assert_eq!(e.altitude, 0.0);
        assert_eq!(e.temperature, 27.5);
    }

    #[test]
    fn test_delimited_negative_value() {
        let e = environmental("Data: A--12.5; Z--9.81");
        assert_eq!(e.altitude, -12.5);
        assert_eq!(e.accel_z, -9.81);
    }

    #[test]
    fn test_environmental_positional_and_object() {
        let e = environmental("450,27.5,1013");
        assert_eq!(e.altitude, 450.0);
        assert_eq!(e.temperature, 27.5);
        assert_eq!(e.pressure, 1013.0);

        let e = environmental(r#"{"alt":10,"acc_z":-9.8,"yaw_y":0.5}"#);
        assert_eq!(e.altitude, 10.0);
        assert_eq!(e.accel_z, -9.8);
        assert_eq!(e.yaw_y, 0.5);
    }

    #[test]
    fn test_schemas_are_never_mixed() {
        // Environmental labels mean nothing to the attitude schema, and vice versa.
        assert!(FrameParser::new(Schema::Attitude)
            .parse("Data: A-450; T-27.5; X-5")
            .is_zeroed());
        assert!(FrameParser::new(Schema::Environmental)
            .parse("YPR: 10,20,30;VEL:5;ALT:100")
            .is_zeroed());
    }

    #[test]
    fn test_garbage_yields_zeroed_reading() {
        for line in ["garbage!!", "", "   ", ";;;", "{", "YPR:", "NaN,inf,1", "\u{fffd}\u{fffd}"] {
            for schema in [Schema::Attitude, Schema::Environmental] {
                let (reading, format) = FrameParser::new(schema).decode(line);
                assert!(reading.is_zeroed(), "{line:?} decoded to {reading:?}");
                assert_eq!(reading.schema(), schema);
                assert_eq!(format, None);
            }
        }
    }

    #[test]
    fn test_decode_reports_format() {
        let parser = FrameParser::new(Schema::Attitude);
        assert_eq!(parser.decode(r#"{"yaw":1}"#).1, Some(LineFormat::Object));
        assert_eq!(parser.decode("YPR:1,2,3").1, Some(LineFormat::Labeled));
        assert_eq!(parser.decode("YAW-1;PITCH-2").1, Some(LineFormat::Delimited));
        assert_eq!(parser.decode("1 2 3").1, Some(LineFormat::Positional));
    }

    #[test]
    fn test_object_takes_priority_over_positional() {
        let a = attitude(r#"{"yaw":7}"#);
        assert_eq!(a.yaw, 7.0);
        assert_eq!(a.pitch, 0.0);
    }
}

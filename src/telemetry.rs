//! Parsed vehicle telemetry records.
//!
//! One line of the telemetry file maps to one [`TelemetryRecord`]:
//!
//! ```text
//! type,date,vehicleCode,lineId,latitudeMicro,longitudeMicro,speed,routeId,state,eventId,timestamp,sequence
//! 0,28-MAY-19,1234,131,3451234,-76512345,32,131,1,1559066083,2019-05-28 18:14:43,42
//! ```
//!
//! Coordinates arrive as integer micro-degrees (degrees × 1,000,000).

use chrono::{NaiveDate, NaiveDateTime};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Number of comma-separated fields in a telemetry line.
pub const FIELD_COUNT: usize = 12;

const MICRO_TO_DEGREES: f64 = 1_000_000.0;
const DATE_FORMAT: &str = "%d-%b-%y";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TelemetryParseError {
    #[error("expected {expected} fields, got {found}")]
    FieldCount { expected: usize, found: usize },
    #[error("invalid value for field `{field}`: {value:?}")]
    InvalidField { field: &'static str, value: String },
}

/// A single GPS/speed sample reported by a vehicle.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryRecord {
    pub kind: i32,
    pub date: NaiveDate,
    pub vehicle_code: i32,
    pub line_id: i32,
    pub latitude_micro: i32,
    pub longitude_micro: i32,
    /// Reported speed in km/h.
    pub speed: i32,
    pub route_id: i32,
    pub state: i32,
    pub event_id: i64,
    pub timestamp: NaiveDateTime,
    pub sequence: i32,
}

impl TelemetryRecord {
    pub fn latitude(&self) -> f64 {
        self.latitude_micro as f64 / MICRO_TO_DEGREES
    }

    pub fn longitude(&self) -> f64 {
        self.longitude_micro as f64 / MICRO_TO_DEGREES
    }

    pub fn has_valid_vehicle(&self) -> bool {
        self.vehicle_code > 0
    }

    pub fn has_valid_line(&self) -> bool {
        self.line_id > 0
    }

    /// Hemisphere sanity check only: north of the equator, west of Greenwich.
    pub fn has_valid_coordinates(&self) -> bool {
        self.latitude_micro > 0 && self.longitude_micro < 0
    }

    pub fn is_valid(&self) -> bool {
        self.has_valid_vehicle() && self.has_valid_line() && self.has_valid_coordinates()
    }

    /// Parses one telemetry line. Surrounding whitespace on each field is ignored
    /// and fields past the twelfth are tolerated.
    ///
    /// # Errors
    ///
    /// Returns an error if the line has fewer than [`FIELD_COUNT`] fields or any
    /// field fails to parse.
    pub fn from_csv_line(line: &str) -> Result<Self, TelemetryParseError> {
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        if fields.len() < FIELD_COUNT {
            return Err(TelemetryParseError::FieldCount {
                expected: FIELD_COUNT,
                found: fields.len(),
            });
        }

        Ok(TelemetryRecord {
            kind: parse_field("type", fields[0])?,
            date: parse_date(fields[1])?,
            vehicle_code: parse_field("vehicleCode", fields[2])?,
            line_id: parse_field("lineId", fields[3])?,
            latitude_micro: parse_field("latitudeMicro", fields[4])?,
            longitude_micro: parse_field("longitudeMicro", fields[5])?,
            speed: parse_field("speed", fields[6])?,
            route_id: parse_field("routeId", fields[7])?,
            state: parse_field("state", fields[8])?,
            event_id: parse_field("eventId", fields[9])?,
            timestamp: NaiveDateTime::parse_from_str(fields[10], TIMESTAMP_FORMAT).map_err(
                |_| TelemetryParseError::InvalidField {
                    field: "timestamp",
                    value: fields[10].to_string(),
                },
            )?,
            sequence: parse_field("sequence", fields[11])?,
        })
    }

    /// Formats the record back into a telemetry line, fields in file order.
    pub fn to_csv_line(&self) -> String {
        format!(
            "{},{},{},{},{},{},{},{},{},{},{},{}",
            self.kind,
            self.date.format(DATE_FORMAT).to_string().to_uppercase(),
            self.vehicle_code,
            self.line_id,
            self.latitude_micro,
            self.longitude_micro,
            self.speed,
            self.route_id,
            self.state,
            self.event_id,
            self.timestamp.format(TIMESTAMP_FORMAT),
            self.sequence
        )
    }
}

impl FromStr for TelemetryRecord {
    type Err = TelemetryParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_csv_line(s)
    }
}

impl fmt::Display for TelemetryRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Telemetry[vehicle={}, line={}, route={}, lat={:.6}, lon={:.6}, speed={}, time={}]",
            self.vehicle_code,
            self.line_id,
            self.route_id,
            self.latitude(),
            self.longitude(),
            self.speed,
            self.timestamp
        )
    }
}

fn parse_field<T: FromStr>(field: &'static str, value: &str) -> Result<T, TelemetryParseError> {
    value.parse().map_err(|_| TelemetryParseError::InvalidField {
        field,
        value: value.to_string(),
    })
}

// "28-MAY-19": month abbreviations match case-insensitively, "19" is 2019.
fn parse_date(value: &str) -> Result<NaiveDate, TelemetryParseError> {
    NaiveDate::parse_from_str(value, DATE_FORMAT).map_err(|_| TelemetryParseError::InvalidField {
        field: "date",
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str =
        "0,28-MAY-19,1234,131,3451234,-76512345,32,131,1,1559066083,2019-05-28 18:14:43,42";

    #[test]
    fn test_parse_valid_line() {
        let record = TelemetryRecord::from_csv_line(SAMPLE).unwrap();

        assert_eq!(record.kind, 0);
        assert_eq!(record.date, NaiveDate::from_ymd_opt(2019, 5, 28).unwrap());
        assert_eq!(record.vehicle_code, 1234);
        assert_eq!(record.line_id, 131);
        assert_eq!(record.speed, 32);
        assert_eq!(record.route_id, 131);
        assert_eq!(record.event_id, 1559066083);
        assert_eq!(record.sequence, 42);
        assert!((record.latitude() - 3.451234).abs() < 1e-9);
        assert!((record.longitude() + 76.512345).abs() < 1e-9);
        assert!(record.is_valid());
    }

    #[test]
    fn test_parse_trims_fields() {
        let padded = SAMPLE.replace(',', " , ");
        let record: TelemetryRecord = padded.parse().unwrap();
        assert_eq!(record.vehicle_code, 1234);
    }

    #[test]
    fn test_parse_too_few_fields() {
        let err = TelemetryRecord::from_csv_line("0,28-MAY-19,1234").unwrap_err();
        assert_eq!(
            err,
            TelemetryParseError::FieldCount {
                expected: 12,
                found: 3
            }
        );
    }

    #[test]
    fn test_parse_bad_number_names_field() {
        let line = SAMPLE.replace("1234", "abc");
        let err = TelemetryRecord::from_csv_line(&line).unwrap_err();
        assert!(matches!(
            err,
            TelemetryParseError::InvalidField {
                field: "vehicleCode",
                ..
            }
        ));
    }

    #[test]
    fn test_parse_bad_month() {
        let line = SAMPLE.replace("MAY", "XYZ");
        let err = TelemetryRecord::from_csv_line(&line).unwrap_err();
        assert!(matches!(err, TelemetryParseError::InvalidField { field: "date", .. }));
    }

    #[test]
    fn test_header_line_is_not_a_record() {
        let header = "type,date,vehicleCode,lineId,latitudeMicro,longitudeMicro,speed,routeId,state,eventId,timestamp,sequence";
        assert!(TelemetryRecord::from_csv_line(header).is_err());
    }

    #[test]
    fn test_validity_rules() {
        let base = TelemetryRecord::from_csv_line(SAMPLE).unwrap();

        let mut r = base.clone();
        r.vehicle_code = 0;
        assert!(!r.is_valid());

        let mut r = base.clone();
        r.line_id = -1;
        assert!(!r.is_valid());

        let mut r = base.clone();
        r.latitude_micro = 0;
        assert!(!r.is_valid());

        let mut r = base.clone();
        r.longitude_micro = 76_512_345;
        assert!(!r.is_valid());

        // Speed plays no part in validity.
        let mut r = base;
        r.speed = -5;
        assert!(r.is_valid());
    }

    #[test]
    fn test_csv_line_round_trip() {
        let record = TelemetryRecord::from_csv_line(SAMPLE).unwrap();
        let line = record.to_csv_line();

        assert_eq!(line, SAMPLE);
        assert_eq!(TelemetryRecord::from_csv_line(&line).unwrap(), record);
    }
}

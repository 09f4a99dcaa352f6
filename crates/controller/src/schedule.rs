//! Watering schedule message from the server.
//!
//! Unit contract for the incoming JSON:
//!
//! | field                 | unit    |
//! |-----------------------|---------|
//! | `time_until_watering` | seconds |
//! | `watering_time`       | minutes |
//! | `sleep_time`          | seconds |
//!
//! Everything is normalised to whole milliseconds. `valve_on_duration_minutes`
//! is accepted as an alias of `watering_time`.

use serde_json::{Map, Value};
use std::fmt;
use std::time::Duration;

const MS_PER_SECOND: f64 = 1_000.0;
const MS_PER_MINUTE: f64 = 60_000.0;

const WATERING_TIME_ALIAS: &str = "valve_on_duration_minutes";

/// A validated schedule. Immutable; one per fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Schedule {
    pub(crate) time_until_watering: Duration,
    pub(crate) watering_duration: Duration,
    pub(crate) sleep_interval: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ParseError {
    /// Not a JSON object.
    Malformed(String),
    MissingField(&'static str),
    /// Present but not a finite number.
    InvalidField { field: &'static str, found: String },
    Negative { field: &'static str, value: f64 },
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Malformed(detail) => write!(f, "malformed schedule message: {detail}"),
            Self::MissingField(field) => write!(f, "schedule is missing field '{field}'"),
            Self::InvalidField { field, found } => {
                write!(f, "schedule field '{field}' is not a number (got {found})")
            }
            Self::Negative { field, value } => {
                write!(f, "schedule field '{field}' is negative ({value})")
            }
        }
    }
}

impl std::error::Error for ParseError {}

/// Parse and normalise a raw schedule message. Pure.
pub(crate) fn parse(raw: &str) -> Result<Schedule, ParseError> {
    let value: Value =
        serde_json::from_str(raw.trim()).map_err(|e| ParseError::Malformed(e.to_string()))?;
    let Value::Object(obj) = value else {
        return Err(ParseError::Malformed("expected a JSON object".to_string()));
    };

    let time_until = field(&obj, "time_until_watering", None)?;
    let watering = field(&obj, "watering_time", Some(WATERING_TIME_ALIAS))?;
    let sleep = field(&obj, "sleep_time", None)?;

    Ok(Schedule {
        time_until_watering: to_millis(time_until, MS_PER_SECOND),
        watering_duration: to_millis(watering, MS_PER_MINUTE),
        sleep_interval: to_millis(sleep, MS_PER_SECOND),
    })
}

/// Look up a non-negative finite number. `null` counts as missing.
fn field(
    obj: &Map<String, Value>,
    name: &'static str,
    alias: Option<&'static str>,
) -> Result<f64, ParseError> {
    let value = obj
        .get(name)
        .or_else(|| alias.and_then(|a| obj.get(a)))
        .filter(|v| !v.is_null())
        .ok_or(ParseError::MissingField(name))?;

    let n = value
        .as_f64()
        .filter(|n| n.is_finite())
        .ok_or_else(|| ParseError::InvalidField {
            field: name,
            found: value.to_string(),
        })?;

    if n < 0.0 {
        return Err(ParseError::Negative { field: name, value: n });
    }
    Ok(n)
}

fn to_millis(value: f64, ms_per_unit: f64) -> Duration {
    Duration::from_millis((value * ms_per_unit).round() as u64)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    // -- happy path ---------------------------------------------------------

    #[test]
    fn parses_and_normalises_units() {
        let s = parse(r#"{"time_until_watering":5,"watering_time":5,"sleep_time":14400}"#).unwrap();
        assert_eq!(
            s,
            Schedule {
                time_until_watering: ms(5_000),
                watering_duration: ms(300_000),
                sleep_interval: ms(14_400_000),
            }
        );
    }

    #[test]
    fn repeated_parses_are_identical() {
        let raw = r#"{"time_until_watering":5,"watering_time":5,"sleep_time":14400}"#;
        let first = parse(raw).unwrap();
        for _ in 0..10 {
            assert_eq!(parse(raw).unwrap(), first);
        }
    }

    #[test]
    fn zero_time_until_watering_is_allowed() {
        let s = parse(r#"{"time_until_watering":0,"watering_time":2,"sleep_time":3600}"#).unwrap();
        assert_eq!(s.time_until_watering, Duration::ZERO);
    }

    #[test]
    fn fractional_values_round_to_millis() {
        let s = parse(r#"{"time_until_watering":1.5,"watering_time":0.5,"sleep_time":0.0004}"#)
            .unwrap();
        assert_eq!(s.time_until_watering, ms(1_500));
        assert_eq!(s.watering_duration, ms(30_000));
        assert_eq!(s.sleep_interval, ms(0));
    }

    #[test]
    fn accepts_valve_on_duration_alias() {
        let s = parse(
            r#"{"time_until_watering":10,"valve_on_duration_minutes":3,"sleep_time":60}"#,
        )
        .unwrap();
        assert_eq!(s.watering_duration, ms(180_000));
    }

    #[test]
    fn extra_fields_ignored() {
        let s = parse(
            r#"{"time_until_watering":1,"watering_time":1,"sleep_time":1,"current_time":"12:00"}"#,
        )
        .unwrap();
        assert_eq!(s.sleep_interval, ms(1_000));
    }

    #[test]
    fn surrounding_whitespace_ignored() {
        assert!(parse("\n  {\"time_until_watering\":1,\"watering_time\":1,\"sleep_time\":1}\r\n").is_ok());
    }

    // -- malformed ----------------------------------------------------------

    #[test]
    fn truncated_message_is_malformed() {
        let err = parse(r#"{"time_until_watering":5,"watering_ti"#).unwrap_err();
        assert!(matches!(err, ParseError::Malformed(_)), "got {err:?}");
    }

    #[test]
    fn empty_message_is_malformed() {
        assert!(matches!(parse(""), Err(ParseError::Malformed(_))));
    }

    #[test]
    fn non_object_is_malformed() {
        assert!(matches!(parse("[1,2,3]"), Err(ParseError::Malformed(_))));
        assert!(matches!(parse("42"), Err(ParseError::Malformed(_))));
    }

    #[test]
    fn http_error_body_is_malformed() {
        assert!(matches!(parse("error"), Err(ParseError::Malformed(_))));
    }

    // -- missing / invalid fields ------------------------------------------

    #[test]
    fn missing_each_field_reported_by_name() {
        assert_eq!(
            parse(r#"{"watering_time":1,"sleep_time":1}"#),
            Err(ParseError::MissingField("time_until_watering"))
        );
        assert_eq!(
            parse(r#"{"time_until_watering":1,"sleep_time":1}"#),
            Err(ParseError::MissingField("watering_time"))
        );
        assert_eq!(
            parse(r#"{"time_until_watering":1,"watering_time":1}"#),
            Err(ParseError::MissingField("sleep_time"))
        );
    }

    #[test]
    fn null_counts_as_missing() {
        assert_eq!(
            parse(r#"{"time_until_watering":null,"watering_time":1,"sleep_time":1}"#),
            Err(ParseError::MissingField("time_until_watering"))
        );
    }

    #[test]
    fn string_number_is_invalid() {
        let err = parse(r#"{"time_until_watering":"5","watering_time":1,"sleep_time":1}"#)
            .unwrap_err();
        assert!(
            matches!(err, ParseError::InvalidField { field: "time_until_watering", .. }),
            "got {err:?}"
        );
    }

    #[test]
    fn negative_value_rejected_not_defaulted() {
        let err = parse(r#"{"time_until_watering":-30,"watering_time":1,"sleep_time":1}"#)
            .unwrap_err();
        assert_eq!(
            err,
            ParseError::Negative {
                field: "time_until_watering",
                value: -30.0
            }
        );
    }

    #[test]
    fn negative_watering_time_rejected() {
        assert!(matches!(
            parse(r#"{"time_until_watering":1,"watering_time":-1,"sleep_time":1}"#),
            Err(ParseError::Negative { field: "watering_time", .. })
        ));
    }

    // -- display ------------------------------------------------------------

    #[test]
    fn display_names_the_field() {
        let msg = ParseError::MissingField("sleep_time").to_string();
        assert!(msg.contains("sleep_time"), "{msg}");
    }
}

use crate::error::{FlatbaseError, Result};
use crate::schema::{ConversionStrategy, FieldType};
use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use serde_json::{Number, Value};

const DATE_FORMAT: &str = "%Y-%m-%d";
const NAIVE_DATETIME_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

/// Parse an ISO 8601 date-time. Values without an offset are taken as UTC.
pub fn parse_datetime(input: &str) -> Option<DateTime<Utc>> {
    let trimmed = input.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(dt.with_timezone(&Utc));
    }
    NAIVE_DATETIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(trimmed, fmt).ok())
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// Parse an ISO 8601 calendar date (`YYYY-MM-DD`).
pub fn parse_date(input: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(input.trim(), DATE_FORMAT).ok()
}

/// Parse `true`/`false`/`1`/`0`, ignoring case and surrounding whitespace.
pub fn parse_bool(input: &str) -> Option<bool> {
    match input.trim().to_ascii_lowercase().as_str() {
        "true" | "1" => Some(true),
        "false" | "0" => Some(false),
        _ => None,
    }
}

pub fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

pub fn format_date(date: &NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

/// Numeric view of a value: numbers as-is, numeric strings parsed. Booleans,
/// nulls and containers have no numeric value.
pub fn to_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|f| f.is_finite()),
        _ => None,
    }
}

/// Text form used for grouping keys and for writing cells.
pub fn to_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Array(_) | Value::Object(_) => Some(value.to_string()),
    }
}

pub(crate) fn type_name(value: &Value) -> &'static str {
    match FieldType::of_value(value) {
        Some(t) => t.as_str(),
        None => "null",
    }
}

/// Coerces dynamic values to schema types. Stateless apart from the string
/// length limit applied by `ConversionStrategy::Truncate`.
#[derive(Debug, Clone, Default)]
pub struct TypeConverter {
    max_string_length: Option<usize>,
}

impl TypeConverter {
    pub fn new(max_string_length: Option<usize>) -> Self {
        TypeConverter { max_string_length }
    }

    /// Convert `value` (of type `from`, or null when `None`) to `to`.
    /// Only `FailOnError` can fail; the other strategies degrade to null.
    pub fn convert(
        &self,
        field: &str,
        value: &Value,
        from: Option<FieldType>,
        to: FieldType,
        strategy: ConversionStrategy,
    ) -> Result<Value> {
        if value.is_null() {
            return Ok(Value::Null);
        }

        let converted = match strategy {
            ConversionStrategy::Truncate => self.truncate(value, to).or_else(|| cast(value, to)),
            _ => cast(value, to),
        };

        match converted {
            Some(v) => Ok(v),
            None if strategy == ConversionStrategy::FailOnError => {
                Err(FlatbaseError::Conversion {
                    field: field.to_string(),
                    value: value.to_string(),
                    from: from.map(|t| t.to_string()).unwrap_or_else(|| "null".into()),
                    to: to.to_string(),
                })
            }
            None => Ok(Value::Null),
        }
    }

    /// Convert using the value's own JSON shape as the source type.
    pub fn convert_value(
        &self,
        field: &str,
        value: &Value,
        to: FieldType,
        strategy: ConversionStrategy,
    ) -> Result<Value> {
        self.convert(field, value, FieldType::of_value(value), to, strategy)
    }

    fn truncate(&self, value: &Value, to: FieldType) -> Option<Value> {
        match to {
            FieldType::String => {
                let text = cast(value, FieldType::String)?;
                match (text, self.max_string_length) {
                    (Value::String(s), Some(max)) if s.chars().count() > max => {
                        Some(Value::String(s.chars().take(max).collect()))
                    }
                    (text, _) => Some(text),
                }
            }
            FieldType::Integer => {
                let f = match value {
                    Value::Number(n) => n.as_f64()?,
                    Value::String(s) => s.trim().parse::<f64>().ok()?,
                    _ => return None,
                };
                if f.is_nan() {
                    return None;
                }
                // `as` saturates at the i64 bounds and drops the fraction.
                Some(Value::from(f as i64))
            }
            FieldType::Float => {
                let f = match value {
                    Value::Number(n) => n.as_f64()?,
                    Value::String(s) => s.trim().parse::<f64>().ok()?,
                    _ => return None,
                };
                if f.is_nan() {
                    return None;
                }
                Number::from_f64(f.clamp(f64::MIN, f64::MAX)).map(Value::Number)
            }
            _ => None,
        }
    }
}

fn cast(value: &Value, to: FieldType) -> Option<Value> {
    match to {
        FieldType::String => to_text(value).map(Value::String),
        FieldType::Integer => cast_integer(value).map(Value::from),
        FieldType::Float => {
            let f = match value {
                Value::Bool(b) => {
                    if *b {
                        1.0
                    } else {
                        0.0
                    }
                }
                other => to_f64(other)?,
            };
            Number::from_f64(f).map(Value::Number)
        }
        FieldType::Boolean => match value {
            Value::Bool(b) => Some(Value::Bool(*b)),
            Value::String(s) => parse_bool(s).map(Value::Bool),
            Value::Number(n) => match n.as_i64() {
                Some(1) => Some(Value::Bool(true)),
                Some(0) => Some(Value::Bool(false)),
                _ => None,
            },
            _ => None,
        },
        FieldType::DateTime => {
            let s = value.as_str()?;
            parse_datetime(s)
                .or_else(|| {
                    parse_date(s)
                        .and_then(|d| d.and_hms_opt(0, 0, 0))
                        .map(|naive| Utc.from_utc_datetime(&naive))
                })
                .map(|dt| Value::String(format_datetime(&dt)))
        }
        FieldType::Date => {
            let s = value.as_str()?;
            parse_date(s)
                .or_else(|| parse_datetime(s).map(|dt| dt.date_naive()))
                .map(|d| Value::String(format_date(&d)))
        }
        FieldType::Array => match value {
            Value::Array(_) => Some(value.clone()),
            Value::String(s) => match serde_json::from_str::<Value>(s) {
                Ok(parsed @ Value::Array(_)) => Some(parsed),
                _ => None,
            },
            _ => None,
        },
        FieldType::Object => match value {
            Value::Object(_) => Some(value.clone()),
            Value::String(s) => match serde_json::from_str::<Value>(s) {
                Ok(parsed @ Value::Object(_)) => Some(parsed),
                _ => None,
            },
            _ => None,
        },
    }
}

fn cast_integer(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().and_then(integral)),
        Value::String(s) => {
            let trimmed = s.trim();
            trimmed
                .parse::<i64>()
                .ok()
                .or_else(|| trimmed.parse::<f64>().ok().and_then(integral))
        }
        Value::Bool(b) => Some(i64::from(*b)),
        _ => None,
    }
}

/// Lossless float to integer: only whole numbers inside the i64 range.
fn integral(f: f64) -> Option<i64> {
    if f.is_finite() && f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64 {
        Some(f as i64)
    } else {
        None
    }
}

//! # Filter expressions
//!
//! A filter is a JSON object. Plain `field: value` entries match by
//! equality; `field: {"$op": operand}` entries apply one comparison
//! operator; `$and`, `$or` and `$not` combine sub-filters. Several entries in
//! one object must all hold.

use crate::convert::{parse_bool, parse_date, parse_datetime, to_f64};
use crate::error::{FlatbaseError, Result};
use crate::schema::ID_FIELD;
use crate::store::Record;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};
use std::cmp::Ordering;

/// Comparison applied to one field
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// Bare scalar: a missing field never matches.
    Equals(Value),
    Eq(Value),
    Ne(Value),
    Gt(Value),
    Gte(Value),
    Lt(Value),
    Lte(Value),
    In(Vec<Value>),
    Nin(Vec<Value>),
}

/// A parsed filter tree
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Matches every record.
    All,
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    Field { field: String, condition: Condition },
}

impl Filter {
    /// Parse the JSON filter syntax. `null` and `{}` match everything.
    pub fn parse(value: &Value) -> Result<Filter> {
        match value {
            Value::Null => Ok(Filter::All),
            Value::Object(map) => parse_object(map),
            other => Err(FlatbaseError::Request(format!(
                "Filter must be an object, got {other}"
            ))),
        }
    }

    /// Create an equality filter
    pub fn eq(field: impl Into<String>, value: Value) -> Self {
        Filter::Field {
            field: field.into(),
            condition: Condition::Equals(value),
        }
    }

    /// Check if a record matches this filter. `$and`/`$or` stop at the first
    /// decisive operand.
    pub fn matches(&self, record: &Record) -> bool {
        match self {
            Filter::All => true,
            Filter::And(filters) => filters.iter().all(|f| f.matches(record)),
            Filter::Or(filters) => filters.iter().any(|f| f.matches(record)),
            Filter::Not(inner) => !inner.matches(record),
            Filter::Field { field, condition } => {
                let value = field_value(record, field);
                condition.holds(value.as_ref())
            }
        }
    }
}

impl<'de> Deserialize<'de> for Filter {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        Filter::parse(&value).map_err(serde::de::Error::custom)
    }
}

/// Evaluate an optional filter; absence matches every record.
pub fn evaluate(record: &Record, filter: Option<&Filter>) -> bool {
    filter.map(|f| f.matches(record)).unwrap_or(true)
}

fn parse_object(map: &Map<String, Value>) -> Result<Filter> {
    let mut clauses = Vec::with_capacity(map.len());
    for (key, value) in map {
        let clause = match key.as_str() {
            "$and" => Filter::And(parse_list(key, value)?),
            "$or" => Filter::Or(parse_list(key, value)?),
            "$not" => {
                if !value.is_object() {
                    return Err(FlatbaseError::Request(
                        "$not expects a single filter object".into(),
                    ));
                }
                Filter::Not(Box::new(Filter::parse(value)?))
            }
            op if op.starts_with('$') => {
                return Err(FlatbaseError::Request(format!(
                    "Unknown logical operator '{op}'"
                )));
            }
            field => Filter::Field {
                field: field.to_string(),
                condition: parse_condition(field, value)?,
            },
        };
        clauses.push(clause);
    }

    Ok(match clauses.len() {
        0 => Filter::All,
        1 => clauses.remove(0),
        _ => Filter::And(clauses),
    })
}

fn parse_list(key: &str, value: &Value) -> Result<Vec<Filter>> {
    value
        .as_array()
        .ok_or_else(|| FlatbaseError::Request(format!("{key} expects an array of filters")))?
        .iter()
        .map(Filter::parse)
        .collect()
}

fn parse_condition(field: &str, value: &Value) -> Result<Condition> {
    let ops = match value {
        Value::Object(map) if map.keys().any(|k| k.starts_with('$')) => map,
        other => return Ok(Condition::Equals(other.clone())),
    };

    let mut entries = ops.iter();
    let (op, operand) = match (entries.next(), entries.next()) {
        (Some(entry), None) => entry,
        _ => {
            return Err(FlatbaseError::Request(format!(
                "Operator object for '{field}' must contain exactly one operator"
            )))
        }
    };
    let operand = operand.clone();

    Ok(match op.as_str() {
        "$eq" => Condition::Eq(operand),
        "$ne" => Condition::Ne(operand),
        "$gt" => Condition::Gt(operand),
        "$gte" => Condition::Gte(operand),
        "$lt" => Condition::Lt(operand),
        "$lte" => Condition::Lte(operand),
        "$in" | "$nin" => {
            let list = match operand {
                Value::Array(items) => items,
                _ => {
                    return Err(FlatbaseError::Request(format!(
                        "{op} on '{field}' expects an array"
                    )))
                }
            };
            if op == "$in" {
                Condition::In(list)
            } else {
                Condition::Nin(list)
            }
        }
        other => {
            return Err(FlatbaseError::Request(format!(
                "Unknown operator '{other}' on '{field}'"
            )))
        }
    })
}

fn field_value(record: &Record, field: &str) -> Option<Value> {
    if field == ID_FIELD {
        return Some(Value::String(record.id.clone()));
    }
    record.data.get(field).cloned()
}

impl Condition {
    fn holds(&self, value: Option<&Value>) -> bool {
        let null = Value::Null;
        let value = match (self, value) {
            (Condition::Equals(_), None) => return false,
            (_, Some(v)) => v,
            (_, None) => &null,
        };

        match self {
            Condition::Equals(expected) | Condition::Eq(expected) => values_equal(value, expected),
            Condition::Ne(expected) => !values_equal(value, expected),
            Condition::Gt(bound) => compare_values(value, bound) == Some(Ordering::Greater),
            Condition::Gte(bound) => matches!(
                compare_values(value, bound),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            Condition::Lt(bound) => compare_values(value, bound) == Some(Ordering::Less),
            Condition::Lte(bound) => matches!(
                compare_values(value, bound),
                Some(Ordering::Less | Ordering::Equal)
            ),
            Condition::In(list) => list.iter().any(|item| values_equal(value, item)),
            Condition::Nin(list) => !list.iter().any(|item| values_equal(value, item)),
        }
    }
}

/// Equality after coercing both sides to a common comparable type.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Array(_), _) | (_, Value::Array(_)) | (Value::Object(_), _) | (_, Value::Object(_)) => {
            a == b
        }
        _ => compare_values(a, b) == Some(Ordering::Equal),
    }
}

/// Order two scalar values. Numbers compare numerically (numeric strings
/// included), date strings chronologically, other strings lexically.
/// `None` when the values have no common comparable type.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        (Value::Null, _) | (_, Value::Null) => None,
        (Value::Number(_), Value::Number(_))
        | (Value::Number(_), Value::String(_))
        | (Value::String(_), Value::Number(_)) => to_f64(a)?.partial_cmp(&to_f64(b)?),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::String(s)) => parse_bool(s).map(|y| x.cmp(&y)),
        (Value::String(s), Value::Bool(y)) => parse_bool(s).map(|x| x.cmp(y)),
        (Value::String(x), Value::String(y)) => match (as_instant(x), as_instant(y)) {
            (Some(dx), Some(dy)) => Some(dx.cmp(&dy)),
            _ => Some(x.cmp(y)),
        },
        (Value::Array(_), _) | (_, Value::Array(_)) | (Value::Object(_), _) | (_, Value::Object(_)) => {
            if a == b {
                Some(Ordering::Equal)
            } else {
                None
            }
        }
        _ => None,
    }
}

fn as_instant(s: &str) -> Option<DateTime<Utc>> {
    parse_datetime(s).or_else(|| {
        parse_date(s)
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|naive| Utc.from_utc_datetime(&naive))
    })
}

use crate::convert::to_text;
use crate::error::{FlatbaseError, Result};
use crate::filter::{evaluate, Filter};
use crate::schema::ID_FIELD;
use crate::store::Record;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use std::collections::{BTreeMap, HashMap};

/// Group key used for missing or null values in summaries. Empty strings
/// are stored as null, so no stored value stringifies to it.
pub const NULL_GROUP: &str = "";

/// Aggregate function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateFunction {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

impl AggregateFunction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AggregateFunction::Count => "count",
            AggregateFunction::Sum => "sum",
            AggregateFunction::Avg => "avg",
            AggregateFunction::Min => "min",
            AggregateFunction::Max => "max",
        }
    }
}

/// One `{field, function, alias}` column of an aggregate query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateSpec {
    /// Ignored by `count`.
    #[serde(default)]
    pub field: String,
    pub function: AggregateFunction,
    #[serde(default)]
    pub alias: Option<String>,
}

impl AggregateSpec {
    pub fn new(function: AggregateFunction, field: impl Into<String>, alias: impl Into<String>) -> Self {
        AggregateSpec {
            field: field.into(),
            function,
            alias: Some(alias.into()),
        }
    }

    /// Output key: the alias, or `<function>_<field>` when none was given.
    pub fn output_name(&self) -> String {
        match &self.alias {
            Some(alias) if !alias.is_empty() => alias.clone(),
            _ if self.function == AggregateFunction::Count && self.field.is_empty() => "count".into(),
            _ => format!("{}_{}", self.function.as_str(), self.field),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateRequest {
    #[serde(default)]
    pub group_by: Option<Vec<String>>,
    #[serde(default)]
    pub aggregates: Vec<AggregateSpec>,
    #[serde(default)]
    pub filter: Option<Filter>,
}

impl AggregateRequest {
    pub fn check(&self) -> Result<()> {
        if self.aggregates.is_empty() {
            return Err(FlatbaseError::Request(
                "Aggregate request must name at least one aggregate".into(),
            ));
        }
        for spec in &self.aggregates {
            if spec.function != AggregateFunction::Count && spec.field.is_empty() {
                return Err(FlatbaseError::Request(format!(
                    "Aggregate '{}' needs a field",
                    spec.function.as_str()
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AggregateResult {
    pub data: Vec<Map<String, Value>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SummaryResult {
    pub counts: BTreeMap<String, usize>,
}

/// Count records per stringified value of `field`. Missing and null values
/// share the [`NULL_GROUP`] key.
pub fn summarize(records: &[Record], field: &str) -> SummaryResult {
    let mut counts = BTreeMap::new();
    for record in records {
        let key = lookup(record, field)
            .and_then(|v| to_text(&v))
            .unwrap_or_else(|| NULL_GROUP.to_string());
        *counts.entry(key).or_insert(0) += 1;
    }
    SummaryResult { counts }
}

/// Filter, group and aggregate. Groups come out in first-encountered order.
pub fn aggregate(records: &[Record], request: &AggregateRequest) -> Result<AggregateResult> {
    request.check()?;
    let group_by: &[String] = request.group_by.as_deref().unwrap_or(&[]);

    let mut groups: Vec<(Vec<Value>, Vec<&Record>)> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    if group_by.is_empty() {
        // Without grouping there is exactly one group, even when nothing matches.
        groups.push((Vec::new(), Vec::new()));
        index.insert(Value::Array(Vec::new()).to_string(), 0);
    }

    for record in records {
        if !evaluate(record, request.filter.as_ref()) {
            continue;
        }
        let key_values: Vec<Value> = group_by
            .iter()
            .map(|field| lookup(record, field).unwrap_or(Value::Null))
            .collect();
        let key = Value::Array(key_values.clone()).to_string();
        let slot = *index.entry(key).or_insert_with(|| {
            groups.push((key_values, Vec::new()));
            groups.len() - 1
        });
        groups[slot].1.push(record);
    }

    let data = groups
        .into_iter()
        .map(|(key_values, members)| {
            let mut row = Map::new();
            for (field, value) in group_by.iter().zip(key_values) {
                row.insert(field.clone(), value);
            }
            for spec in &request.aggregates {
                row.insert(spec.output_name(), compute(spec, &members));
            }
            row
        })
        .collect();

    Ok(AggregateResult { data })
}

fn lookup(record: &Record, field: &str) -> Option<Value> {
    if field == ID_FIELD {
        return Some(Value::String(record.id.clone()));
    }
    record.data.get(field).filter(|v| !v.is_null()).cloned()
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Numeric {
    Int(i64),
    Float(f64),
}

impl Numeric {
    fn of(value: &Value) -> Option<Numeric> {
        match value {
            Value::Number(n) => match n.as_i64() {
                Some(i) => Some(Numeric::Int(i)),
                None => n.as_f64().map(Numeric::Float),
            },
            Value::String(s) => {
                let trimmed = s.trim();
                if let Ok(i) = trimmed.parse::<i64>() {
                    Some(Numeric::Int(i))
                } else {
                    trimmed
                        .parse::<f64>()
                        .ok()
                        .filter(|f| f.is_finite())
                        .map(Numeric::Float)
                }
            }
            _ => None,
        }
    }

    fn as_f64(self) -> f64 {
        match self {
            Numeric::Int(i) => i as f64,
            Numeric::Float(f) => f,
        }
    }

    fn into_value(self) -> Value {
        match self {
            Numeric::Int(i) => Value::from(i),
            Numeric::Float(f) => float_value(f),
        }
    }
}

fn float_value(f: f64) -> Value {
    Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
}

fn compute(spec: &AggregateSpec, members: &[&Record]) -> Value {
    // Values that fail numeric coercion are skipped.
    let numbers: Vec<Numeric> = members
        .iter()
        .filter_map(|r| lookup(r, &spec.field))
        .filter_map(|v| Numeric::of(&v))
        .collect();

    match spec.function {
        AggregateFunction::Count => Value::from(members.len()),
        AggregateFunction::Sum => sum(&numbers),
        AggregateFunction::Avg => {
            if numbers.is_empty() {
                Value::Null
            } else {
                let total: f64 = numbers.iter().map(|n| n.as_f64()).sum();
                float_value(total / numbers.len() as f64)
            }
        }
        AggregateFunction::Min => extreme(&numbers, |candidate, best| candidate < best),
        AggregateFunction::Max => extreme(&numbers, |candidate, best| candidate > best),
    }
}

fn sum(numbers: &[Numeric]) -> Value {
    let mut int_total: Option<i64> = Some(0);
    for n in numbers {
        int_total = match (int_total, n) {
            (Some(total), Numeric::Int(i)) => total.checked_add(*i),
            _ => None,
        };
        if int_total.is_none() {
            break;
        }
    }
    match int_total {
        Some(total) => Value::from(total),
        None => float_value(numbers.iter().map(|n| n.as_f64()).sum()),
    }
}

fn extreme(numbers: &[Numeric], better: impl Fn(f64, f64) -> bool) -> Value {
    let mut best: Option<Numeric> = None;
    for n in numbers {
        best = match best {
            Some(current) if !better(n.as_f64(), current.as_f64()) => Some(current),
            _ => Some(*n),
        };
    }
    best.map(Numeric::into_value).unwrap_or(Value::Null)
}

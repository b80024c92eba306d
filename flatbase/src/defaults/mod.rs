use crate::schema::{FieldDefinition, FieldType};
use crate::store::Record;
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::OnceLock;

/// How a value for a missing field is derived
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefaultGenerationStrategy {
    /// The schema declares an explicit default.
    UserSpecified,
    /// The field name follows a recognised naming convention.
    PatternMatch,
    /// The most frequent value among existing records.
    ContextAnalysis,
    /// A neutral value for the field's type.
    TypeBased,
}

/// Records already in the collection, consulted by `ContextAnalysis`.
#[derive(Debug, Clone, Copy, Default)]
pub struct GenerationContext<'a> {
    pub existing_records: &'a [Record],
}

impl<'a> GenerationContext<'a> {
    pub fn new(existing_records: &'a [Record]) -> Self {
        GenerationContext { existing_records }
    }
}

struct NamingPattern {
    regex: Regex,
    value: fn() -> Value,
}

fn naming_patterns() -> &'static [NamingPattern] {
    static PATTERNS: OnceLock<Vec<NamingPattern>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        let pattern = |re: &str, value: fn() -> Value| NamingPattern {
            regex: Regex::new(re).expect("naming pattern regex is valid"),
            value,
        };
        vec![
            pattern(r"^(is|has)_", || Value::Bool(false)),
            pattern(r"_(count|total)$", || Value::from(0)),
            pattern(r"_(at|date)$", || Value::Null),
        ]
    })
}

fn pattern_default(field_name: &str) -> Option<Value> {
    naming_patterns()
        .iter()
        .find(|p| p.regex.is_match(field_name))
        .map(|p| (p.value)())
}

/// Pick the strategy for a field. Deterministic: explicit default, then
/// naming pattern, then existing records, then the field type.
pub fn determine_strategy(
    field: &FieldDefinition,
    context: &GenerationContext<'_>,
) -> DefaultGenerationStrategy {
    if field.default.is_some() {
        DefaultGenerationStrategy::UserSpecified
    } else if pattern_default(&field.name).is_some() {
        DefaultGenerationStrategy::PatternMatch
    } else if !context.existing_records.is_empty() {
        DefaultGenerationStrategy::ContextAnalysis
    } else {
        DefaultGenerationStrategy::TypeBased
    }
}

/// Value for `field` when a new record does not supply it.
pub fn generate_default(field: &FieldDefinition, context: &GenerationContext<'_>) -> Value {
    match determine_strategy(field, context) {
        DefaultGenerationStrategy::UserSpecified => field.default.clone().unwrap_or(Value::Null),
        DefaultGenerationStrategy::PatternMatch => {
            pattern_default(&field.name).unwrap_or(Value::Null)
        }
        DefaultGenerationStrategy::ContextAnalysis => most_frequent(&field.name, context)
            .unwrap_or_else(|| type_default(field.field_type)),
        DefaultGenerationStrategy::TypeBased => type_default(field.field_type),
    }
}

/// Neutral value per type
pub fn type_default(field_type: FieldType) -> Value {
    match field_type {
        FieldType::String => Value::String(String::new()),
        FieldType::Integer => Value::from(0),
        FieldType::Float => Value::from(0.0),
        FieldType::Boolean => Value::Bool(false),
        FieldType::DateTime | FieldType::Date => Value::Null,
        FieldType::Array => Value::Array(Vec::new()),
        FieldType::Object => Value::Object(serde_json::Map::new()),
    }
}

/// Most frequent non-null value of `field_name`; ties go to the value seen first.
fn most_frequent(field_name: &str, context: &GenerationContext<'_>) -> Option<Value> {
    let mut counts: HashMap<String, (usize, usize)> = HashMap::new();
    let mut seen: Vec<&Value> = Vec::new();

    for record in context.existing_records {
        let value = match record.data.get(field_name) {
            Some(v) if !v.is_null() => v,
            _ => continue,
        };
        let key = value.to_string();
        let next_index = seen.len();
        let entry = counts.entry(key).or_insert_with(|| (0, next_index));
        if entry.1 == next_index {
            seen.push(value);
        }
        entry.0 += 1;
    }

    counts
        .values()
        .max_by(|(count_a, first_a), (count_b, first_b)| {
            count_a.cmp(count_b).then(first_b.cmp(first_a))
        })
        .map(|(_, first)| seen[*first].clone())
}

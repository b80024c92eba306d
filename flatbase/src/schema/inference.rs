use super::parser::DeclaredSchema;
use super::types::{CollectionSchema, FieldDefinition, FieldType, ID_FIELD};
use crate::convert::{parse_date, parse_datetime};

/// Per-column tally of which types every non-empty sample satisfies.
#[derive(Debug, Clone, Default)]
struct TypeCandidate {
    non_empty: usize,
    empty: usize,
    integer_matches: usize,
    float_matches: usize,
    boolean_matches: usize,
    datetime_matches: usize,
    date_matches: usize,
    array_matches: usize,
    object_matches: usize,
}

impl TypeCandidate {
    fn update(&mut self, value: &str) {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            self.empty += 1;
            return;
        }
        self.non_empty += 1;

        if trimmed.parse::<i64>().is_ok() {
            self.integer_matches += 1;
        }
        if trimmed.parse::<f64>().map(|f| f.is_finite()).unwrap_or(false) {
            self.float_matches += 1;
        }
        if trimmed.eq_ignore_ascii_case("true") || trimmed.eq_ignore_ascii_case("false") {
            self.boolean_matches += 1;
        }
        if parse_datetime(trimmed).is_some() {
            self.datetime_matches += 1;
        }
        if parse_date(trimmed).is_some() {
            self.date_matches += 1;
        }
        match trimmed.as_bytes()[0] {
            b'[' => {
                if matches!(serde_json::from_str::<serde_json::Value>(trimmed), Ok(serde_json::Value::Array(_))) {
                    self.array_matches += 1;
                }
            }
            b'{' => {
                if matches!(serde_json::from_str::<serde_json::Value>(trimmed), Ok(serde_json::Value::Object(_))) {
                    self.object_matches += 1;
                }
            }
            _ => {}
        }
    }

    /// Narrowest type every sample parses as; `None` when nothing was sampled.
    fn decide(&self) -> Option<FieldType> {
        if self.non_empty == 0 {
            return None;
        }
        let all = |count: usize| count == self.non_empty;
        let decided = if all(self.integer_matches) {
            FieldType::Integer
        } else if all(self.float_matches) {
            FieldType::Float
        } else if all(self.boolean_matches) {
            FieldType::Boolean
        } else if all(self.datetime_matches) {
            FieldType::DateTime
        } else if all(self.date_matches) {
            FieldType::Date
        } else if all(self.array_matches) {
            FieldType::Array
        } else if all(self.object_matches) {
            FieldType::Object
        } else {
            FieldType::String
        };
        Some(decided)
    }
}

/// Type inferred for a single column of textual samples.
pub fn infer_value_type<'a>(samples: impl IntoIterator<Item = &'a str>) -> Option<FieldType> {
    let mut candidate = TypeCandidate::default();
    for sample in samples {
        candidate.update(sample);
    }
    candidate.decide()
}

/// Build a collection schema from a file's header and every data row.
/// Declared fields win over inference; declared fields missing from the
/// header are appended after the header columns.
pub fn infer_schema(
    name: &str,
    headers: &[String],
    rows: &[Vec<String>],
    declared: Option<&DeclaredSchema>,
) -> CollectionSchema {
    let mut candidates = vec![TypeCandidate::default(); headers.len()];
    for row in rows {
        for (idx, candidate) in candidates.iter_mut().enumerate() {
            candidate.update(row.get(idx).map(String::as_str).unwrap_or(""));
        }
    }

    let mut fields: Vec<FieldDefinition> = headers
        .iter()
        .zip(candidates)
        .filter(|(header, _)| header.as_str() != ID_FIELD)
        .map(|(header, candidate)| {
            if let Some(field) = declared.and_then(|d| d.field(header)) {
                return field.clone();
            }
            match candidate.decide() {
                Some(field_type) => {
                    let mut field = FieldDefinition::new(header.clone(), field_type);
                    field.nullable = candidate.empty > 0;
                    field
                }
                None => FieldDefinition::unsettled(header.clone()),
            }
        })
        .collect();

    if let Some(declared) = declared {
        for field in &declared.fields {
            if !field.is_id() && !headers.iter().any(|h| h == &field.name) {
                fields.push(field.clone());
            }
        }
    }

    log::debug!(
        "Inferred schema for '{name}' from {} rows: {}",
        rows.len(),
        fields
            .iter()
            .map(|f| format!("{}:{}", f.name, f.field_type))
            .collect::<Vec<_>>()
            .join(", ")
    );

    CollectionSchema::new(name, fields)
}

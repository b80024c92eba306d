use serde::{Deserialize, Serialize};
use std::fmt;

/// Name of the identifier column every collection file starts with.
pub const ID_FIELD: &str = "id";

/// Field type enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    String,
    Integer,
    Float,
    Boolean,
    #[serde(rename = "datetime", alias = "date_time")]
    DateTime,
    Date,
    Array,
    Object,
}

impl FieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Integer => "integer",
            FieldType::Float => "float",
            FieldType::Boolean => "boolean",
            FieldType::DateTime => "datetime",
            FieldType::Date => "date",
            FieldType::Array => "array",
            FieldType::Object => "object",
        }
    }

    /// The type a dynamic value carries by its JSON shape alone.
    /// Strings stay strings; dates are only recognised through a schema.
    pub fn of_value(value: &serde_json::Value) -> Option<FieldType> {
        match value {
            serde_json::Value::Null => None,
            serde_json::Value::Bool(_) => Some(FieldType::Boolean),
            serde_json::Value::Number(n) => {
                if n.is_i64() || n.is_u64() {
                    Some(FieldType::Integer)
                } else {
                    Some(FieldType::Float)
                }
            }
            serde_json::Value::String(_) => Some(FieldType::String),
            serde_json::Value::Array(_) => Some(FieldType::Array),
            serde_json::Value::Object(_) => Some(FieldType::Object),
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, FieldType::Integer | FieldType::Float)
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How an untyped value is coerced when it does not already match its schema type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversionStrategy {
    /// Reinterpret directly; a failed cast yields null.
    #[default]
    Cast,
    /// Clip strings to the configured maximum length and clamp numbers into range.
    Truncate,
    /// Raise a conversion error instead of losing the value.
    FailOnError,
    /// Any failure yields null.
    SetNull,
}

/// Definition of a single field in a collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDefinition {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
    /// False while the column has neither samples nor a declaration; the first
    /// value written to it then fixes the type.
    #[serde(skip, default = "default_settled")]
    pub(crate) settled: bool,
}

fn default_nullable() -> bool {
    true
}

fn default_settled() -> bool {
    true
}

impl FieldDefinition {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        FieldDefinition {
            name: name.into(),
            field_type,
            nullable: true,
            default: None,
            settled: true,
        }
    }

    pub fn required(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn with_default(mut self, default: serde_json::Value) -> Self {
        self.default = Some(default);
        self
    }

    pub(crate) fn unsettled(name: impl Into<String>) -> Self {
        FieldDefinition {
            settled: false,
            ..FieldDefinition::new(name, FieldType::String)
        }
    }

    pub fn is_id(&self) -> bool {
        self.name == ID_FIELD
    }
}

/// Ordered field definitions for one collection. Field order is column order
/// on disk; the `id` field always comes first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionSchema {
    pub name: String,
    pub fields: Vec<FieldDefinition>,
}

impl CollectionSchema {
    pub fn new(name: impl Into<String>, fields: Vec<FieldDefinition>) -> Self {
        let mut all = vec![FieldDefinition::new(ID_FIELD, FieldType::String).required()];
        all.extend(fields.into_iter().filter(|f| !f.is_id()));
        CollectionSchema {
            name: name.into(),
            fields: all,
        }
    }

    pub fn field(&self, name: &str) -> Option<&FieldDefinition> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub(crate) fn field_mut(&mut self, name: &str) -> Option<&mut FieldDefinition> {
        self.fields.iter_mut().find(|f| f.name == name)
    }

    /// Field names in column order, `id` included.
    pub fn field_names(&self) -> Vec<&str> {
        self.fields.iter().map(|f| f.name.as_str()).collect()
    }

    /// Fields that carry record data (everything except `id`).
    pub fn data_fields(&self) -> impl Iterator<Item = &FieldDefinition> {
        self.fields.iter().filter(|f| !f.is_id())
    }

    /// Fold unknown keys of `data` into the schema as trailing nullable columns,
    /// and fix the type of unsettled columns from the values supplied.
    pub(crate) fn absorb(&mut self, data: &serde_json::Map<String, serde_json::Value>) {
        for (key, value) in data {
            if key == ID_FIELD {
                continue;
            }
            let observed = FieldType::of_value(value);
            match self.field_mut(key) {
                Some(field) => {
                    if !field.settled {
                        if let Some(field_type) = observed {
                            field.field_type = field_type;
                            field.settled = true;
                        }
                    }
                }
                None => {
                    let mut field =
                        FieldDefinition::new(key.clone(), observed.unwrap_or(FieldType::String));
                    field.settled = observed.is_some();
                    self.fields.push(field);
                }
            }
        }
    }
}

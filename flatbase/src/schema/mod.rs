mod inference;
mod parser;
mod types;

pub use inference::{infer_schema, infer_value_type};
pub use parser::{parse_declared_schema, parse_declared_schema_str, render_declared_schema, DeclaredSchema};
pub use types::{CollectionSchema, ConversionStrategy, FieldDefinition, FieldType, ID_FIELD};

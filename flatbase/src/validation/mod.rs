use crate::convert::{type_name, TypeConverter};
use crate::error::{FlatbaseError, Result};
use crate::schema::{CollectionSchema, ConversionStrategy, FieldDefinition};
use serde_json::{Map, Value};

/// Validate a complete candidate record against its collection schema.
///
/// Every non-nullable field must be present and non-null, and every present
/// value must convert to its declared type without loss. Keys the schema
/// does not know pass through unchecked.
pub fn validate_record(
    converter: &TypeConverter,
    schema: &CollectionSchema,
    record: &Map<String, Value>,
) -> Result<()> {
    for field in schema.data_fields() {
        match record.get(&field.name) {
            None | Some(Value::Null) => check_nullable(field)?,
            Some(value) => check_type(converter, field, value)?,
        }
    }
    Ok(())
}

/// Validate only the fields an update supplies.
pub fn validate_changes(
    converter: &TypeConverter,
    schema: &CollectionSchema,
    changes: &Map<String, Value>,
) -> Result<()> {
    for (name, value) in changes {
        let field = match schema.field(name) {
            Some(f) if !f.is_id() => f,
            _ => continue,
        };
        if value.is_null() {
            check_nullable(field)?;
        } else {
            check_type(converter, field, value)?;
        }
    }
    Ok(())
}

fn check_nullable(field: &FieldDefinition) -> Result<()> {
    if field.nullable {
        Ok(())
    } else {
        Err(FlatbaseError::validation(
            &field.name,
            format!("Required field '{}' is missing", field.name),
        ))
    }
}

fn check_type(converter: &TypeConverter, field: &FieldDefinition, value: &Value) -> Result<()> {
    // Columns without samples take their type from the first value.
    if !field.settled {
        return Ok(());
    }
    converter
        .convert_value(&field.name, value, field.field_type, ConversionStrategy::FailOnError)
        .map(|_| ())
        .map_err(|_| {
            FlatbaseError::validation(
                &field.name,
                format!(
                    "Field '{}' expected {}, got {} {}",
                    field.name,
                    field.field_type,
                    type_name(value),
                    value
                ),
            )
        })
}

//! Flat-file codec for collection files.
//!
//! A collection file is CSV: the header row holds the field names in schema
//! order with `id` first, and each following row is one record. Cells are
//! text; an empty cell is null.

use crate::cancel::CancelToken;
use crate::convert::TypeConverter;
use crate::error::{FlatbaseError, Result};
use crate::schema::{CollectionSchema, ConversionStrategy, FieldType, ID_FIELD};
use crate::store::Record;
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Undecoded contents of a collection file
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawTable {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl RawTable {
    fn id_column(&self) -> Option<usize> {
        self.headers.iter().position(|h| h == ID_FIELD)
    }
}

/// Parse collection file bytes. An empty file is a table with no columns.
pub fn parse_table(bytes: &[u8]) -> Result<RawTable> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(bytes);

    let headers: Vec<String> = reader
        .headers()?
        .iter()
        .enumerate()
        .map(|(idx, h)| {
            let h = if idx == 0 { h.trim_start_matches('\u{feff}') } else { h };
            h.trim().to_string()
        })
        .collect();

    let mut rows = Vec::new();
    for row in reader.records() {
        let row = row?;
        rows.push(row.iter().map(str::to_string).collect());
    }

    Ok(RawTable { headers, rows })
}

/// Check the shape an imported file must have: an `id` column, no
/// duplicate header names and unique, non-empty ids.
pub fn check_table(table: &RawTable) -> Result<()> {
    let id_idx = table.id_column().ok_or_else(|| {
        FlatbaseError::Request(format!("File has no '{ID_FIELD}' column"))
    })?;

    let mut names = HashSet::new();
    for header in &table.headers {
        if header.is_empty() {
            return Err(FlatbaseError::Request("File has an empty column name".into()));
        }
        if !names.insert(header.as_str()) {
            return Err(FlatbaseError::Request(format!("Duplicate column '{header}'")));
        }
    }

    let mut ids = HashSet::new();
    for (line, row) in table.rows.iter().enumerate() {
        let id = row.get(id_idx).map(String::as_str).unwrap_or("");
        if id.is_empty() {
            return Err(FlatbaseError::Request(format!("Row {} has no id", line + 1)));
        }
        if !ids.insert(id) {
            return Err(FlatbaseError::Request(format!("Duplicate id '{id}'")));
        }
    }
    Ok(())
}

/// Decode rows into records, typing each cell by its schema field.
pub fn decode_records(
    schema: &CollectionSchema,
    table: &RawTable,
    converter: &TypeConverter,
) -> Result<Vec<Record>> {
    let id_idx = table.id_column().ok_or_else(|| {
        FlatbaseError::Storage(format!(
            "Collection '{}' has no '{ID_FIELD}' column",
            schema.name
        ))
    })?;

    let columns: Vec<(usize, &str, FieldType)> = table
        .headers
        .iter()
        .enumerate()
        .filter(|(idx, _)| *idx != id_idx)
        .map(|(idx, name)| {
            let field_type = match schema.field(name) {
                Some(field) if field.settled => field.field_type,
                _ => FieldType::String,
            };
            (idx, name.as_str(), field_type)
        })
        .collect();

    let mut records = Vec::with_capacity(table.rows.len());
    for row in &table.rows {
        let id = match row.get(id_idx) {
            Some(id) if !id.is_empty() => id.clone(),
            _ => {
                log::warn!("Skipping row without id in '{}'", schema.name);
                continue;
            }
        };
        let mut data = Map::new();
        for (idx, name, field_type) in &columns {
            let cell = row.get(*idx).map(String::as_str).unwrap_or("");
            data.insert(name.to_string(), decode_cell(converter, name, cell, *field_type));
        }
        records.push(Record { id, data });
    }
    Ok(records)
}

fn decode_cell(converter: &TypeConverter, name: &str, cell: &str, field_type: FieldType) -> Value {
    if cell.is_empty() {
        return Value::Null;
    }
    let raw = Value::String(cell.to_string());
    if field_type == FieldType::String {
        return raw;
    }
    // Cells that do not parse as their column type keep their text.
    match converter.convert(name, &raw, Some(FieldType::String), field_type, ConversionStrategy::Cast) {
        Ok(Value::Null) | Err(_) => raw,
        Ok(value) => value,
    }
}

/// Encode `records` as file bytes with one column per schema field.
pub fn encode_table(schema: &CollectionSchema, records: &[Record]) -> Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(schema.field_names())?;

    for record in records {
        let row: Vec<String> = schema
            .fields
            .iter()
            .map(|field| {
                if field.is_id() {
                    record.id.clone()
                } else {
                    encode_cell(record.data.get(&field.name))
                }
            })
            .collect();
        writer.write_record(&row)?;
    }

    writer
        .into_inner()
        .map_err(|e| FlatbaseError::Storage(format!("Failed to flush collection data: {e}")))
}

fn encode_cell(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

/// Read a collection file. `Ok(None)` when it does not exist.
pub async fn read_file(path: &Path) -> Result<Option<Vec<u8>>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(FlatbaseError::Storage(format!(
            "Failed to read {}: {e}",
            path.display()
        ))),
    }
}

/// Replace `path` with `bytes` through a hidden temporary file and a rename.
/// The cancel token is checked last, before the rename; a cancelled or
/// failed write removes the temporary file and leaves `path` untouched.
pub async fn write_atomic(path: &Path, bytes: &[u8], cancel: &CancelToken) -> Result<()> {
    let temp_path = temp_path_for(path)?;

    if let Err(e) = tokio::fs::write(&temp_path, bytes).await {
        remove_temp(&temp_path).await;
        return Err(FlatbaseError::Storage(format!(
            "Failed to write {}: {e}",
            temp_path.display()
        )));
    }

    if let Err(e) = cancel.check() {
        remove_temp(&temp_path).await;
        return Err(e);
    }

    if let Err(e) = tokio::fs::rename(&temp_path, path).await {
        remove_temp(&temp_path).await;
        return Err(FlatbaseError::Storage(format!(
            "Failed to replace {}: {e}",
            path.display()
        )));
    }
    Ok(())
}

fn temp_path_for(path: &Path) -> Result<PathBuf> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| FlatbaseError::Storage(format!("Invalid file path {}", path.display())))?;
    let temp_name = format!(".{file_name}.{}.tmp", uuid::Uuid::new_v4().simple());
    Ok(path.with_file_name(temp_name))
}

async fn remove_temp(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            log::warn!("Failed to remove temporary file {}: {e}", path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::cancel_pair;
    use crate::schema::FieldDefinition;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tempfile::TempDir;

    fn schema() -> CollectionSchema {
        CollectionSchema::new(
            "items",
            vec![
                FieldDefinition::new("name", FieldType::String),
                FieldDefinition::new("qty", FieldType::Integer),
                FieldDefinition::new("price", FieldType::Float),
                FieldDefinition::new("tags", FieldType::Array),
                FieldDefinition::new("active", FieldType::Boolean),
            ],
        )
    }

    fn record(id: &str, data: Value) -> Record {
        Record {
            id: id.to_string(),
            data: data.as_object().cloned().unwrap_or_default(),
        }
    }

    #[test]
    fn test_parse_table() {
        let table = parse_table(b"\xEF\xBB\xBFid,name\n1,\"Smith, Ann\"\n2\n").unwrap();
        assert_eq!(table.headers, vec!["id", "name"]);
        assert_eq!(table.rows, vec![vec!["1", "Smith, Ann"], vec!["2"]]);
    }

    #[test]
    fn test_parse_empty_file() {
        let table = parse_table(b"").unwrap();
        assert!(table.headers.is_empty());
        assert!(table.rows.is_empty());
    }

    #[test]
    fn test_decode_types_cells() {
        let table = parse_table(b"id,name,qty,price,tags,active\na,Pen,3,1.5,\"[\"\"x\"\"]\",true\nb,,many,,,\n").unwrap();
        let records = decode_records(&schema(), &table, &TypeConverter::default()).unwrap();

        assert_eq!(
            records[0],
            record("a", json!({"name": "Pen", "qty": 3, "price": 1.5, "tags": ["x"], "active": true}))
        );
        // "many" does not parse as an integer and is kept as text.
        assert_eq!(
            records[1],
            record("b", json!({"name": null, "qty": "many", "price": null, "tags": null, "active": null}))
        );
    }

    #[test]
    fn test_encode_writes_schema_order_and_empty_nulls() {
        let records = vec![record(
            "a",
            json!({"active": false, "tags": ["x", 1], "qty": 2, "name": "Pen, blue", "price": null}),
        )];
        let bytes = encode_table(&schema(), &records).unwrap();
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            "id,name,qty,price,tags,active\na,\"Pen, blue\",2,,\"[\"\"x\"\",1]\",false\n"
        );
    }

    #[test]
    fn test_check_table() {
        check_table(&parse_table(b"id,a\n1,x\n2,y\n").unwrap()).unwrap();

        let bad_files: [&[u8]; 4] = [
            b"a,b\n1,2\n",
            b"id,a\n1,x\n1,y\n",
            b"id,a\n,x\n",
            b"id,a,a\n1,2,3\n",
        ];
        for bad in bad_files {
            let err = check_table(&parse_table(bad).unwrap()).unwrap_err();
            assert!(matches!(err, FlatbaseError::Request(_)));
        }
    }

    #[tokio::test]
    async fn test_write_atomic_replaces_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("items.csv");
        tokio::fs::write(&path, b"old").await.unwrap();

        write_atomic(&path, b"new", &CancelToken::never()).await.unwrap();
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"new");
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_write_leaves_file_untouched() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("items.csv");
        tokio::fs::write(&path, b"old").await.unwrap();

        let (handle, token) = cancel_pair();
        handle.cancel();
        let err = write_atomic(&path, b"new", &token).await.unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"old");
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_read_missing_file() {
        let tmp = TempDir::new().unwrap();
        assert_eq!(read_file(&tmp.path().join("nope.csv")).await.unwrap(), None);
    }
}

mod bulk;
mod types;

pub use types::{
    BulkAction, BulkOperationItemResult, BulkOperationRequest, BulkResult, CreateResult,
    ListResult, QueryOptions, Record,
};

use crate::aggregate::{self, AggregateRequest, AggregateResult, SummaryResult};
use crate::cancel::CancelToken;
use crate::config::{StoreConfig, CONFIG_FILE};
use crate::convert::TypeConverter;
use crate::defaults::{generate_default, GenerationContext};
use crate::error::{FlatbaseError, Result};
use crate::filter::{compare_values, evaluate};
use crate::schema::{
    infer_schema, parse_declared_schema, render_declared_schema, CollectionSchema,
    DeclaredSchema, FieldDefinition, ID_FIELD,
};
use crate::table::{self, RawTable};
use crate::validation;
use crate::watcher::WatcherEvent;
use dashmap::DashMap;
use regex::Regex;
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

const SCHEMA_SUFFIX: &str = ".schema.yaml";

/// The adapter over a directory of collection files.
///
/// One instance is shared by every caller. It owns the schema cache and a
/// reader-writer lock per collection; reads take the shared side, mutations
/// hold the exclusive side from reading the file until the rewrite commits.
pub struct Store {
    config: StoreConfig,
    converter: TypeConverter,
    schemas: DashMap<String, CollectionSchema>,
    locks: DashMap<String, Arc<RwLock<()>>>,
}

/// A collection read from disk
struct Loaded {
    schema: CollectionSchema,
    records: Vec<Record>,
}

impl Store {
    /// Open the store at `path`, reading `flatbase.yaml` from it when present.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let config = StoreConfig::load(path.as_ref())?;
        Self::with_config(config)
    }

    pub fn with_config(config: StoreConfig) -> Result<Self> {
        if !config.data_dir.is_dir() {
            return Err(FlatbaseError::Storage(format!(
                "Data directory does not exist: {}",
                config.data_dir.display()
            )));
        }
        let converter = TypeConverter::new(config.max_string_length);
        Ok(Store {
            config,
            converter,
            schemas: DashMap::new(),
            locks: DashMap::new(),
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn data_dir(&self) -> &Path {
        &self.config.data_dir
    }

    // ── Queries ────────────────────────────────────────────────────

    /// Filter, sort and page through a collection.
    pub async fn list(
        &self,
        collection: &str,
        options: &QueryOptions,
        cancel: &CancelToken,
    ) -> Result<ListResult> {
        let lock = self.lock_for(collection)?;
        let _guard = read_lock(&lock, cancel).await?;
        let Loaded { records, .. } = self.load(collection).await?;

        let mut matching: Vec<Record> = records
            .into_iter()
            .filter(|r| evaluate(r, options.filter.as_ref()))
            .collect();
        let total = matching.len();

        if let Some(sort) = &options.sort {
            let (field, descending) = parse_sort(sort)?;
            matching.sort_by(|a, b| {
                let ord = sort_order(sort_key(a, field).as_ref(), sort_key(b, field).as_ref());
                if descending {
                    ord.reverse()
                } else {
                    ord
                }
            });
        }

        let limit = options.limit.unwrap_or(self.config.default_limit);
        let mut data: Vec<Record> = matching
            .into_iter()
            .skip(options.offset)
            .take(limit)
            .collect();

        if let Some(fields) = &options.fields {
            let keep: HashSet<&str> = fields.iter().map(String::as_str).collect();
            for record in &mut data {
                record.data.retain(|key, _| keep.contains(key.as_str()));
            }
        }

        let more = options.offset + data.len() < total;
        log::debug!(
            "list {collection}: {} of {total} (offset {}, limit {limit})",
            data.len(),
            options.offset
        );
        Ok(ListResult { data, total, more })
    }

    pub async fn get(&self, collection: &str, id: &str, cancel: &CancelToken) -> Result<Record> {
        let lock = self.lock_for(collection)?;
        let _guard = read_lock(&lock, cancel).await?;
        let Loaded { records, .. } = self.load(collection).await?;
        records
            .into_iter()
            .find(|r| r.id == id)
            .ok_or_else(|| record_not_found(collection, id))
    }

    /// The collection's schema, inferred from its file on first access.
    pub async fn get_schema(
        &self,
        collection: &str,
        cancel: &CancelToken,
    ) -> Result<CollectionSchema> {
        let lock = self.lock_for(collection)?;
        let _guard = read_lock(&lock, cancel).await?;
        let Loaded { schema, .. } = self.load(collection).await?;
        Ok(schema)
    }

    /// Names of every collection file in the data directory, sorted.
    pub async fn list_collections(&self, cancel: &CancelToken) -> Result<Vec<String>> {
        cancel.check()?;
        let suffix = format!(".{}", self.config.extension);
        let mut entries = tokio::fs::read_dir(&self.config.data_dir).await.map_err(|e| {
            FlatbaseError::Storage(format!(
                "Failed to read {}: {e}",
                self.config.data_dir.display()
            ))
        })?;

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            if file_name == CONFIG_FILE || file_name.ends_with(SCHEMA_SUFFIX) {
                continue;
            }
            if let Some(name) = file_name.strip_suffix(suffix.as_str()) {
                if is_valid_name(name) {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    /// Count records per distinct value of `field`.
    pub async fn get_summary(
        &self,
        collection: &str,
        field: &str,
        cancel: &CancelToken,
    ) -> Result<SummaryResult> {
        let lock = self.lock_for(collection)?;
        let _guard = read_lock(&lock, cancel).await?;
        let Loaded { records, .. } = self.load(collection).await?;
        Ok(aggregate::summarize(&records, field))
    }

    pub async fn aggregate(
        &self,
        collection: &str,
        request: &AggregateRequest,
        cancel: &CancelToken,
    ) -> Result<AggregateResult> {
        request.check()?;
        let lock = self.lock_for(collection)?;
        let _guard = read_lock(&lock, cancel).await?;
        let Loaded { records, .. } = self.load(collection).await?;
        aggregate::aggregate(&records, request)
    }

    // ── Mutations ──────────────────────────────────────────────────

    /// Insert a new record. A caller-supplied `id` is ignored.
    pub async fn create(
        &self,
        collection: &str,
        data: &Map<String, Value>,
        cancel: &CancelToken,
    ) -> Result<CreateResult> {
        let lock = self.lock_for(collection)?;
        let _guard = write_lock(&lock, cancel).await?;
        let Loaded {
            mut schema,
            mut records,
        } = self.load(collection).await?;

        let record = self.prepare_create(&mut schema, &records, data)?;
        records.push(record.clone());
        self.persist(collection, schema, &records, cancel).await?;

        log::debug!("Created {collection}/{}", record.id);
        Ok(CreateResult {
            id: record.id.clone(),
            record,
        })
    }

    /// Merge `data` into an existing record. Keys not supplied are untouched.
    pub async fn update(
        &self,
        collection: &str,
        id: &str,
        data: &Map<String, Value>,
        cancel: &CancelToken,
    ) -> Result<Record> {
        let lock = self.lock_for(collection)?;
        let _guard = write_lock(&lock, cancel).await?;
        let Loaded {
            mut schema,
            mut records,
        } = self.load(collection).await?;

        let idx = position(collection, &records, id)?;
        let updated = self.prepare_update(&mut schema, &records[idx], data)?;
        records[idx] = updated.clone();
        self.persist(collection, schema, &records, cancel).await?;

        log::debug!("Updated {collection}/{id}");
        Ok(updated)
    }

    pub async fn delete(&self, collection: &str, id: &str, cancel: &CancelToken) -> Result<()> {
        let lock = self.lock_for(collection)?;
        let _guard = write_lock(&lock, cancel).await?;
        let Loaded {
            schema,
            mut records,
        } = self.load(collection).await?;

        let idx = position(collection, &records, id)?;
        records.remove(idx);
        self.persist(collection, schema, &records, cancel).await?;

        log::debug!("Deleted {collection}/{id}");
        Ok(())
    }

    // ── Collection management ──────────────────────────────────────

    /// Create an empty collection with declared fields. The declarations are
    /// saved to a `<name>.schema.yaml` sidecar.
    pub async fn create_collection(
        &self,
        name: &str,
        fields: Vec<FieldDefinition>,
        cancel: &CancelToken,
    ) -> Result<CollectionSchema> {
        let lock = self.lock_for(name)?;
        let _guard = write_lock(&lock, cancel).await?;

        let path = self.collection_path(name);
        if table::read_file(&path).await?.is_some() {
            return Err(FlatbaseError::Request(format!(
                "Collection '{name}' already exists"
            )));
        }

        let schema = CollectionSchema::new(name, fields);
        let declared = DeclaredSchema {
            fields: schema.data_fields().cloned().collect(),
        };
        let sidecar = render_declared_schema(&declared)?;
        self.persist(name, schema.clone(), &[], cancel).await?;
        let written = table::write_atomic(&self.schema_path(name), sidecar.as_bytes(), cancel).await;
        if let Err(e) = written {
            // Roll back the data file.
            self.invalidate_schema(name);
            if let Err(remove_err) = tokio::fs::remove_file(&path).await {
                log::warn!("Failed to remove '{}': {remove_err}", path.display());
            }
            return Err(e);
        }

        log::info!("Created collection '{name}' with {} fields", schema.fields.len());
        Ok(schema)
    }

    /// Replace (or create) a collection from raw file bytes. The file must
    /// have an `id` column with unique ids. Returns the number of records.
    pub async fn import_collection(
        &self,
        name: &str,
        bytes: &[u8],
        cancel: &CancelToken,
    ) -> Result<usize> {
        let lock = self.lock_for(name)?;
        let _guard = write_lock(&lock, cancel).await?;

        let parsed = table::parse_table(bytes)
            .map_err(|e| FlatbaseError::Request(format!("Unreadable file: {e}")))?;
        table::check_table(&parsed)?;

        table::write_atomic(&self.collection_path(name), bytes, cancel).await?;
        self.invalidate_schema(name);

        log::info!("Imported {} records into '{name}'", parsed.rows.len());
        Ok(parsed.rows.len())
    }

    /// Drop the cached schema; the next access re-infers it from disk.
    pub fn invalidate_schema(&self, collection: &str) {
        if self.schemas.remove(collection).is_some() {
            log::debug!("Invalidated schema cache for '{collection}'");
        }
    }

    /// React to an external change reported by the file watcher.
    pub fn apply_watcher_event(&self, event: &WatcherEvent) {
        log::debug!("{:?} {}", event.kind, event.collection);
        self.invalidate_schema(&event.collection);
    }

    // ── Record pipeline ────────────────────────────────────────────

    /// Default-fill, validate and convert `data` into a new record. On
    /// success the schema has absorbed any new fields; on failure neither
    /// argument is changed.
    pub(crate) fn prepare_create(
        &self,
        schema: &mut CollectionSchema,
        existing: &[Record],
        data: &Map<String, Value>,
    ) -> Result<Record> {
        let mut data = data.clone();
        data.remove(ID_FIELD);

        let context = GenerationContext::new(existing);
        for field in schema.data_fields() {
            if !data.contains_key(&field.name) {
                data.insert(field.name.clone(), generate_default(field, &context));
            }
        }

        blank_to_null(&mut data);
        validation::validate_record(&self.converter, schema, &data)?;
        self.convert_fields(schema, &mut data)?;
        schema.absorb(&data);

        let id = loop {
            let candidate = self.config.id_strategy.generate();
            if !existing.iter().any(|r| r.id == candidate) {
                break candidate;
            }
        };
        Ok(Record { id, data })
    }

    /// Validate and convert `changes`, then merge them into a copy of `existing`.
    pub(crate) fn prepare_update(
        &self,
        schema: &mut CollectionSchema,
        existing: &Record,
        changes: &Map<String, Value>,
    ) -> Result<Record> {
        let mut changes = changes.clone();
        changes.remove(ID_FIELD);

        blank_to_null(&mut changes);
        validation::validate_changes(&self.converter, schema, &changes)?;
        self.convert_fields(schema, &mut changes)?;
        schema.absorb(&changes);

        let mut updated = existing.clone();
        updated.data.extend(changes);
        Ok(updated)
    }

    fn convert_fields(&self, schema: &CollectionSchema, data: &mut Map<String, Value>) -> Result<()> {
        for (name, value) in data.iter_mut() {
            if let Some(field) = schema.field(name).filter(|f| f.settled) {
                *value = self.converter.convert_value(
                    name,
                    value,
                    field.field_type,
                    self.config.conversion_strategy,
                )?;
                if matches!(value, Value::String(s) if s.is_empty()) {
                    *value = Value::Null;
                }
                if value.is_null() && !field.nullable {
                    return Err(FlatbaseError::validation(
                        name.as_str(),
                        format!("Required field '{name}' converted to an empty value"),
                    ));
                }
            }
        }
        Ok(())
    }

    // ── Storage ────────────────────────────────────────────────────

    fn lock_for(&self, collection: &str) -> Result<Arc<RwLock<()>>> {
        check_name(collection)?;
        Ok(self
            .locks
            .entry(collection.to_string())
            .or_default()
            .value()
            .clone())
    }

    fn collection_path(&self, name: &str) -> PathBuf {
        self.config
            .data_dir
            .join(format!("{name}.{}", self.config.extension))
    }

    fn schema_path(&self, name: &str) -> PathBuf {
        self.config.data_dir.join(format!("{name}{SCHEMA_SUFFIX}"))
    }

    /// Read and decode a collection. Callers hold its lock.
    async fn load(&self, collection: &str) -> Result<Loaded> {
        let bytes = table::read_file(&self.collection_path(collection))
            .await?
            .ok_or_else(|| FlatbaseError::CollectionNotFound {
                collection: collection.to_string(),
            })?;

        let mut raw = table::parse_table(&bytes)?;
        if raw.headers.is_empty() {
            raw.headers.push(ID_FIELD.to_string());
        }

        let cached = self
            .schemas
            .get(collection)
            .map(|entry| entry.value().clone())
            .filter(|schema| matches_header(schema, &raw));

        let schema = match cached {
            Some(schema) => schema,
            None => {
                let declared = self.read_declared(collection).await?;
                let schema = infer_schema(collection, &raw.headers, &raw.rows, declared.as_ref());
                log::info!(
                    "Inferred schema for '{collection}' ({} fields, {} rows)",
                    schema.fields.len(),
                    raw.rows.len()
                );
                self.schemas.insert(collection.to_string(), schema.clone());
                schema
            }
        };

        let records = table::decode_records(&schema, &raw, &self.converter)?;
        Ok(Loaded { schema, records })
    }

    async fn read_declared(&self, collection: &str) -> Result<Option<DeclaredSchema>> {
        match parse_declared_schema(&self.schema_path(collection)).await {
            Ok(declared) => Ok(Some(declared)),
            Err(FlatbaseError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Rewrite the collection file, then publish the schema it was written with.
    async fn persist(
        &self,
        collection: &str,
        schema: CollectionSchema,
        records: &[Record],
        cancel: &CancelToken,
    ) -> Result<()> {
        let bytes = table::encode_table(&schema, records)?;
        table::write_atomic(&self.collection_path(collection), &bytes, cancel).await?;
        self.schemas.insert(collection.to_string(), schema);
        Ok(())
    }
}

async fn read_lock<'a>(
    lock: &'a RwLock<()>,
    cancel: &CancelToken,
) -> Result<RwLockReadGuard<'a, ()>> {
    cancel.check()?;
    tokio::select! {
        guard = lock.read() => Ok(guard),
        _ = cancel.cancelled() => Err(FlatbaseError::Cancelled),
    }
}

async fn write_lock<'a>(
    lock: &'a RwLock<()>,
    cancel: &CancelToken,
) -> Result<RwLockWriteGuard<'a, ()>> {
    cancel.check()?;
    tokio::select! {
        guard = lock.write() => Ok(guard),
        _ = cancel.cancelled() => Err(FlatbaseError::Cancelled),
    }
}

fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_.-]*$").expect("collection name regex is valid")
    })
}

fn is_valid_name(name: &str) -> bool {
    name_pattern().is_match(name) && !name.ends_with(".schema")
}

fn check_name(name: &str) -> Result<()> {
    if is_valid_name(name) {
        Ok(())
    } else {
        Err(FlatbaseError::Request(format!(
            "Invalid collection name '{name}'"
        )))
    }
}

/// A cached schema is usable while its leading fields are the file's columns.
fn matches_header(schema: &CollectionSchema, raw: &RawTable) -> bool {
    schema.fields.len() >= raw.headers.len()
        && schema
            .fields
            .iter()
            .zip(&raw.headers)
            .all(|(field, header)| &field.name == header)
}

fn record_not_found(collection: &str, id: &str) -> FlatbaseError {
    FlatbaseError::RecordNotFound {
        collection: collection.to_string(),
        id: id.to_string(),
    }
}

fn position(collection: &str, records: &[Record], id: &str) -> Result<usize> {
    records
        .iter()
        .position(|r| r.id == id)
        .ok_or_else(|| record_not_found(collection, id))
}

/// Split `field[:asc|:desc]`.
fn parse_sort(spec: &str) -> Result<(&str, bool)> {
    let (field, direction) = match spec.rsplit_once(':') {
        Some((field, direction)) => (field, direction),
        None => (spec, "asc"),
    };
    if field.is_empty() {
        return Err(FlatbaseError::Request(format!("Invalid sort '{spec}'")));
    }
    match direction.to_ascii_lowercase().as_str() {
        "asc" => Ok((field, false)),
        "desc" => Ok((field, true)),
        _ => Err(FlatbaseError::Request(format!(
            "Invalid sort direction in '{spec}'"
        ))),
    }
}

fn sort_key(record: &Record, field: &str) -> Option<Value> {
    if field == ID_FIELD {
        Some(Value::String(record.id.clone()))
    } else {
        record.data.get(field).filter(|v| !v.is_null()).cloned()
    }
}

/// Empty cells read back as null, so empty strings are stored as null.
fn blank_to_null(data: &mut Map<String, Value>) {
    for value in data.values_mut() {
        if matches!(value, Value::String(s) if s.is_empty()) {
            *value = Value::Null;
        }
    }
}

/// Nulls first, then values by `compare_values`; values with no common type
/// fall back to their JSON text.
fn sort_order(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => {
            compare_values(a, b).unwrap_or_else(|| a.to_string().cmp(&b.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::AggregateFunction;
    use crate::cancel::cancel_pair;
    use crate::filter::Filter;
    use crate::schema::FieldType;
    use crate::watcher::ChangeKind;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tempfile::TempDir;

    const PEOPLE: &str = "id,name,age,city\np1,Ann,41,Oslo\np2,Bob,17,Rome\np3,Cid,29,Rome\n";

    fn setup_test_store() -> (TempDir, Store) {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("people.csv"), PEOPLE).unwrap();
        let store = Store::open(tmp.path()).unwrap();
        (tmp, store)
    }

    fn map(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    fn never() -> CancelToken {
        CancelToken::never()
    }

    async fn count(store: &Store, collection: &str) -> usize {
        store
            .list(collection, &QueryOptions::default(), &never())
            .await
            .unwrap()
            .total
    }

    #[test]
    fn test_open_missing_dir() {
        let tmp = TempDir::new().unwrap();
        let err = Store::open(tmp.path().join("missing")).err().unwrap();
        assert!(err.is_storage());
    }

    #[tokio::test]
    async fn test_get_existing_record() {
        let (_tmp, store) = setup_test_store();
        let record = store.get("people", "p2", &never()).await.unwrap();
        assert_eq!(record.data, map(json!({"name": "Bob", "age": 17, "city": "Rome"})));
    }

    #[tokio::test]
    async fn test_create_then_get_round_trip() {
        let (_tmp, store) = setup_test_store();
        let created = store
            .create("people", &map(json!({"name": "Dee", "age": "35"})), &never())
            .await
            .unwrap();

        assert_eq!(created.record.data["age"], json!(35));
        // Absent field filled from the most frequent existing value.
        assert_eq!(created.record.data["city"], json!("Rome"));

        let fetched = store.get("people", &created.id, &never()).await.unwrap();
        assert_eq!(fetched, created.record);
    }

    #[tokio::test]
    async fn test_create_ignores_supplied_id() {
        let (_tmp, store) = setup_test_store();
        let created = store
            .create("people", &map(json!({"id": "p1", "name": "Dee", "age": 3})), &never())
            .await
            .unwrap();
        assert_ne!(created.id, "p1");
        assert_eq!(count(&store, "people").await, 4);
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_value() {
        let (tmp, store) = setup_test_store();
        let err = store
            .create("people", &map(json!({"name": "Eve", "age": "old"})), &never())
            .await
            .unwrap_err();
        match err {
            FlatbaseError::Validation { field, .. } => assert_eq!(field, "age"),
            other => panic!("expected validation error, got {other:?}"),
        }
        assert_eq!(std::fs::read_to_string(tmp.path().join("people.csv")).unwrap(), PEOPLE);
    }

    #[tokio::test]
    async fn test_create_appends_unknown_field_column() {
        let (tmp, store) = setup_test_store();
        let created = store
            .create(
                "people",
                &map(json!({"name": "Dee", "age": 30, "nickname": "D"})),
                &never(),
            )
            .await
            .unwrap();

        let schema = store.get_schema("people", &never()).await.unwrap();
        assert_eq!(schema.field_names(), vec!["id", "name", "age", "city", "nickname"]);
        assert!(schema.field("nickname").unwrap().nullable);

        let content = std::fs::read_to_string(tmp.path().join("people.csv")).unwrap();
        assert!(content.starts_with("id,name,age,city,nickname\n"));
        assert!(content.contains("p1,Ann,41,Oslo,\n"));

        let old = store.get("people", "p1", &never()).await.unwrap();
        assert_eq!(old.data["nickname"], Value::Null);
        let new = store.get("people", &created.id, &never()).await.unwrap();
        assert_eq!(new.data["nickname"], json!("D"));
    }

    #[tokio::test]
    async fn test_update_merges_supplied_fields() {
        let (_tmp, store) = setup_test_store();
        let updated = store
            .update("people", "p2", &map(json!({"age": "18", "id": "other"})), &never())
            .await
            .unwrap();
        assert_eq!(updated.id, "p2");
        assert_eq!(updated.data, map(json!({"name": "Bob", "age": 18, "city": "Rome"})));

        let fetched = store.get("people", "p2", &never()).await.unwrap();
        assert_eq!(fetched, updated);
    }

    #[tokio::test]
    async fn test_update_rejects_null_on_required_field() {
        let (_tmp, store) = setup_test_store();
        let err = store
            .update("people", "p2", &map(json!({"name": null})), &never())
            .await
            .unwrap_err();
        assert!(matches!(err, FlatbaseError::Validation { .. }));
    }

    #[tokio::test]
    async fn test_blank_required_string_is_rejected() {
        let (tmp, store) = setup_test_store();
        store
            .create_collection(
                "tags",
                vec![FieldDefinition::new("label", FieldType::String).required()],
                &never(),
            )
            .await
            .unwrap();

        for data in [json!({"label": ""}), json!({})] {
            let err = store.create("tags", &map(data), &never()).await.unwrap_err();
            match err {
                FlatbaseError::Validation { field, .. } => assert_eq!(field, "label"),
                other => panic!("expected validation error, got {other:?}"),
            }
        }
        assert_eq!(count(&store, "tags").await, 0);

        let err = store
            .update("people", "p1", &map(json!({"name": ""})), &never())
            .await
            .unwrap_err();
        match err {
            FlatbaseError::Validation { field, .. } => assert_eq!(field, "name"),
            other => panic!("expected validation error, got {other:?}"),
        }
        assert_eq!(std::fs::read_to_string(tmp.path().join("people.csv")).unwrap(), PEOPLE);
    }

    #[tokio::test]
    async fn test_blank_optional_string_is_stored_as_null() {
        let (_tmp, store) = setup_test_store();
        let created = store
            .create("people", &map(json!({"name": "Dee", "age": 5, "nickname": ""})), &never())
            .await
            .unwrap();
        assert_eq!(created.record.data["nickname"], Value::Null);
        let fetched = store.get("people", &created.id, &never()).await.unwrap();
        assert_eq!(fetched, created.record);
    }

    #[tokio::test]
    async fn test_delete_then_get() {
        let (_tmp, store) = setup_test_store();
        store.delete("people", "p1", &never()).await.unwrap();
        let err = store.get("people", "p1", &never()).await.unwrap_err();
        assert!(matches!(err, FlatbaseError::RecordNotFound { .. }));
        assert_eq!(count(&store, "people").await, 2);
    }

    #[tokio::test]
    async fn test_not_found_mapping() {
        let (_tmp, store) = setup_test_store();
        for err in [
            store.get("people", "nope", &never()).await.unwrap_err(),
            store.update("people", "nope", &Map::new(), &never()).await.unwrap_err(),
            store.delete("people", "nope", &never()).await.unwrap_err(),
        ] {
            assert!(matches!(err, FlatbaseError::RecordNotFound { .. }), "{err}");
        }

        for err in [
            store.get("ghosts", "p1", &never()).await.unwrap_err(),
            store.list("ghosts", &QueryOptions::default(), &never()).await.unwrap_err(),
            store.delete("ghosts", "p1", &never()).await.unwrap_err(),
            store.get_schema("ghosts", &never()).await.unwrap_err(),
        ] {
            assert!(matches!(err, FlatbaseError::CollectionNotFound { .. }), "{err}");
        }
    }

    #[tokio::test]
    async fn test_invalid_collection_name() {
        let (_tmp, store) = setup_test_store();
        let err = store.get("../people", "p1", &never()).await.unwrap_err();
        assert!(matches!(err, FlatbaseError::Request(_)));
    }

    #[tokio::test]
    async fn test_pagination() {
        let (_tmp, store) = setup_test_store();
        let options = QueryOptions::default().with_sort("age:asc").with_offset(1).with_limit(2);
        let page = store.list("people", &options, &never()).await.unwrap();
        let ids: Vec<&str> = page.data.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["p3", "p1"]);
        assert_eq!(page.total, 3);
        assert!(!page.more);

        let page = store
            .list("people", &QueryOptions::default().with_limit(1), &never())
            .await
            .unwrap();
        assert_eq!(page.data.len(), 1);
        assert!(page.more);

        let page = store
            .list("people", &QueryOptions::default().with_offset(10), &never())
            .await
            .unwrap();
        assert!(page.data.is_empty());
        assert_eq!(page.total, 3);
        assert!(!page.more);
    }

    #[tokio::test]
    async fn test_default_limit_from_config() {
        let tmp = TempDir::new().unwrap();
        let rows: String = (0..15).map(|i| format!("r{i},{i}\n")).collect();
        std::fs::write(tmp.path().join("nums.csv"), format!("id,n\n{rows}")).unwrap();
        let store = Store::open(tmp.path()).unwrap();

        let page = store.list("nums", &QueryOptions::default(), &never()).await.unwrap();
        assert_eq!(page.data.len(), 10);
        assert_eq!(page.total, 15);
        assert!(page.more);
    }

    #[tokio::test]
    async fn test_filter_sort_and_projection() {
        let (_tmp, store) = setup_test_store();
        let options = QueryOptions::default()
            .with_filter(Filter::parse(&json!({"age": {"$gt": 15}, "city": "Rome"})).unwrap())
            .with_sort("age:desc")
            .with_fields(vec!["name".to_string()]);
        let page = store.list("people", &options, &never()).await.unwrap();

        assert_eq!(page.total, 2);
        assert_eq!(
            page.data,
            vec![
                Record::new("p3", map(json!({"name": "Cid"}))),
                Record::new("p2", map(json!({"name": "Bob"}))),
            ]
        );
    }

    #[tokio::test]
    async fn test_sort_puts_nulls_first() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("t.csv"), "id,v\na,2\nb,\nc,1\n").unwrap();
        let store = Store::open(tmp.path()).unwrap();

        let page = store
            .list("t", &QueryOptions::default().with_sort("v"), &never())
            .await
            .unwrap();
        let ids: Vec<&str> = page.data.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c", "a"]);

        let err = store
            .list("t", &QueryOptions::default().with_sort("v:sideways"), &never())
            .await
            .unwrap_err();
        assert!(matches!(err, FlatbaseError::Request(_)));
    }

    #[tokio::test]
    async fn test_schema_inference() {
        let (_tmp, store) = setup_test_store();
        let schema = store.get_schema("people", &never()).await.unwrap();
        assert_eq!(schema.name, "people");
        assert_eq!(schema.field_names(), vec!["id", "name", "age", "city"]);
        assert_eq!(schema.field("age").unwrap().field_type, FieldType::Integer);
        assert!(!schema.field("age").unwrap().nullable);
    }

    #[tokio::test]
    async fn test_schema_cache_heals_after_external_rewrite() {
        let (tmp, store) = setup_test_store();
        store.get_schema("people", &never()).await.unwrap();

        std::fs::write(tmp.path().join("people.csv"), "id,score\nx,1.5\n").unwrap();
        let schema = store.get_schema("people", &never()).await.unwrap();
        assert_eq!(schema.field_names(), vec!["id", "score"]);
        assert_eq!(schema.field("score").unwrap().field_type, FieldType::Float);
    }

    #[tokio::test]
    async fn test_watcher_event_invalidates_cached_schema() {
        let (tmp, store) = setup_test_store();
        let before = store.get_schema("people", &never()).await.unwrap();
        assert_eq!(before.field("age").unwrap().field_type, FieldType::Integer);

        std::fs::write(
            tmp.path().join("people.schema.yaml"),
            "fields:\n  - { name: age, type: string }\n",
        )
        .unwrap();
        // Header unchanged, so the cache still serves the old schema.
        let cached = store.get_schema("people", &never()).await.unwrap();
        assert_eq!(cached.field("age").unwrap().field_type, FieldType::Integer);

        store.apply_watcher_event(&WatcherEvent {
            collection: "people".to_string(),
            kind: ChangeKind::Modified,
        });
        let after = store.get_schema("people", &never()).await.unwrap();
        assert_eq!(after.field("age").unwrap().field_type, FieldType::String);
        let record = store.get("people", "p1", &never()).await.unwrap();
        assert_eq!(record.data["age"], json!("41"));
    }

    #[tokio::test]
    async fn test_list_collections() {
        let (tmp, store) = setup_test_store();
        std::fs::write(tmp.path().join(".people.csv.abc.tmp"), "").unwrap();
        std::fs::write(tmp.path().join("notes.txt"), "").unwrap();
        std::fs::create_dir(tmp.path().join("nested.csv")).unwrap();
        store
            .create_collection("tasks", vec![], &never())
            .await
            .unwrap();

        let names = store.list_collections(&never()).await.unwrap();
        assert_eq!(names, vec!["people", "tasks"]);
    }

    #[tokio::test]
    async fn test_create_collection_with_declared_fields() {
        let (tmp, store) = setup_test_store();
        let fields = vec![
            FieldDefinition::new("title", FieldType::String).required(),
            FieldDefinition::new("priority", FieldType::Integer).with_default(json!(3)),
            FieldDefinition::new("is_done", FieldType::Boolean),
        ];
        store.create_collection("tasks", fields, &never()).await.unwrap();
        assert_eq!(
            std::fs::read_to_string(tmp.path().join("tasks.csv")).unwrap(),
            "id,title,priority,is_done\n"
        );
        assert!(tmp.path().join("tasks.schema.yaml").exists());

        // A fresh store sees the declarations through the sidecar.
        let store = Store::open(tmp.path()).unwrap();
        let created = store
            .create("tasks", &map(json!({"title": "Write docs"})), &never())
            .await
            .unwrap();
        assert_eq!(created.record.data["priority"], json!(3));
        assert_eq!(created.record.data["is_done"], json!(false));

        let err = store
            .create_collection("tasks", vec![], &never())
            .await
            .unwrap_err();
        assert!(matches!(err, FlatbaseError::Request(_)));
    }

    #[tokio::test]
    async fn test_create_collection_leaves_nothing_when_sidecar_fails() {
        let (tmp, store) = setup_test_store();
        // A directory in the sidecar's place makes the final rename fail.
        std::fs::create_dir(tmp.path().join("tasks.schema.yaml")).unwrap();

        let fields = vec![FieldDefinition::new("title", FieldType::String).required()];
        store
            .create_collection("tasks", fields, &never())
            .await
            .unwrap_err();

        assert!(!tmp.path().join("tasks.csv").exists());
        let err = store.get_schema("tasks", &never()).await.unwrap_err();
        assert!(matches!(err, FlatbaseError::CollectionNotFound { .. }));
    }

    #[tokio::test]
    async fn test_unsettled_column_takes_first_written_type() {
        let (_tmp, store) = setup_test_store();
        store
            .import_collection("log", b"id,level\n", &never())
            .await
            .unwrap();
        store
            .create("log", &map(json!({"level": 2})), &never())
            .await
            .unwrap();
        let schema = store.get_schema("log", &never()).await.unwrap();
        assert_eq!(schema.field("level").unwrap().field_type, FieldType::Integer);
    }

    #[tokio::test]
    async fn test_import_replaces_collection() {
        let (_tmp, store) = setup_test_store();
        store.get_schema("people", &never()).await.unwrap();

        let imported = store
            .import_collection("people", b"id,score\nx,1\ny,2\n", &never())
            .await
            .unwrap();
        assert_eq!(imported, 2);
        let schema = store.get_schema("people", &never()).await.unwrap();
        assert_eq!(schema.field_names(), vec!["id", "score"]);

        let err = store
            .import_collection("people", b"score\n1\n", &never())
            .await
            .unwrap_err();
        assert!(matches!(err, FlatbaseError::Request(_)));
        assert_eq!(count(&store, "people").await, 2);
    }

    #[tokio::test]
    async fn test_summary_and_aggregate() {
        let (_tmp, store) = setup_test_store();
        let summary = store.get_summary("people", "city", &never()).await.unwrap();
        assert_eq!(summary.counts.get("Rome"), Some(&2));
        assert_eq!(summary.counts.get("Oslo"), Some(&1));

        let request = AggregateRequest {
            group_by: Some(vec!["city".to_string()]),
            aggregates: vec![crate::aggregate::AggregateSpec::new(
                AggregateFunction::Avg,
                "age",
                "mean_age",
            )],
            filter: None,
        };
        let result = store.aggregate("people", &request, &never()).await.unwrap();
        assert_eq!(result.data.len(), 2);
        assert_eq!(result.data[0]["city"], json!("Oslo"));
        assert_eq!(result.data[1]["mean_age"].as_f64(), Some(23.0));

        let err = store
            .aggregate("people", &AggregateRequest::default(), &never())
            .await
            .unwrap_err();
        assert!(matches!(err, FlatbaseError::Request(_)));
    }

    #[tokio::test]
    async fn test_concurrent_creates() {
        let (_tmp, store) = setup_test_store();
        let a = map(json!({"name": "A", "age": 1}));
        let b = map(json!({"name": "B", "age": 2}));
        let token = never();
        let (first, second) = tokio::join!(
            store.create("people", &a, &token),
            store.create("people", &b, &token)
        );
        let (first, second) = (first.unwrap(), second.unwrap());
        assert_ne!(first.id, second.id);

        let all = store
            .list("people", &QueryOptions::default(), &token)
            .await
            .unwrap();
        assert_eq!(all.total, 5);
        assert!(all.data.iter().any(|r| r.id == first.id));
        assert!(all.data.iter().any(|r| r.id == second.id));
    }

    #[tokio::test]
    async fn test_cancelled_before_start_has_no_effect() {
        let (tmp, store) = setup_test_store();
        let (handle, token) = cancel_pair();
        handle.cancel();

        let err = store
            .create("people", &map(json!({"name": "Z", "age": 1})), &token)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert!(!err.is_storage());
        let err = store.delete("people", "p1", &token).await.unwrap_err();
        assert!(err.is_cancelled());
        let err = store.list_collections(&token).await.unwrap_err();
        assert!(err.is_cancelled());

        assert_eq!(std::fs::read_to_string(tmp.path().join("people.csv")).unwrap(), PEOPLE);
    }

    #[tokio::test]
    async fn test_cancel_while_waiting_for_lock() {
        let (_tmp, store) = setup_test_store();
        let lock = store.lock_for("people").unwrap();
        let guard = lock.write().await;

        let (handle, token) = cancel_pair();
        let cancel_later = async {
            tokio::task::yield_now().await;
            handle.cancel();
        };
        let (result, ()) = tokio::join!(store.get("people", "p1", &token), cancel_later);
        assert!(result.unwrap_err().is_cancelled());
        drop(guard);
    }

    #[tokio::test]
    async fn test_ulid_ids_from_config() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join(CONFIG_FILE), "id_strategy: ulid\n").unwrap();
        std::fs::write(tmp.path().join("t.csv"), "id,v\n").unwrap();
        let store = Store::open(tmp.path()).unwrap();
        let created = store.create("t", &map(json!({"v": 1})), &never()).await.unwrap();
        assert_eq!(created.id.len(), 26);
        assert_eq!(created.id, created.id.to_lowercase());
    }
}

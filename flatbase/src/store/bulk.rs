use super::{
    position, write_lock, BulkAction, BulkOperationItemResult, BulkOperationRequest, BulkResult,
    Loaded, Record, Store,
};
use crate::cancel::CancelToken;
use crate::convert::to_text;
use crate::error::{FlatbaseError, Result};
use crate::schema::{CollectionSchema, ID_FIELD};
use serde_json::{Map, Value};

impl Store {
    /// Apply many creates, updates or deletes under one exclusive lock.
    ///
    /// Atomic requests stage every item in memory and write nothing unless
    /// all of them succeed. Best-effort requests report each item on its own
    /// and write the successful ones in a single rewrite.
    pub async fn bulk_operation(
        &self,
        collection: &str,
        request: &BulkOperationRequest,
        cancel: &CancelToken,
    ) -> Result<BulkResult> {
        let lock = self.lock_for(collection)?;
        let _guard = write_lock(&lock, cancel).await?;
        let Loaded {
            mut schema,
            mut records,
        } = self.load(collection).await?;

        let result = if request.atomic {
            self.bulk_atomic(collection, request, &mut schema, &mut records)
        } else {
            self.bulk_best_effort(collection, request, &mut schema, &mut records)
        };

        if result.succeeded > 0 {
            self.persist(collection, schema, &records, cancel).await?;
        }

        log::debug!(
            "Bulk {:?} on {collection} (atomic: {}): {} succeeded, {} failed",
            request.action,
            request.atomic,
            result.succeeded,
            result.failed
        );
        Ok(result)
    }

    fn bulk_atomic(
        &self,
        collection: &str,
        request: &BulkOperationRequest,
        schema: &mut CollectionSchema,
        records: &mut Vec<Record>,
    ) -> BulkResult {
        // The caller only persists when something succeeded, so a failure
        // leaves the staged state unwritten.
        let mut ids = Vec::with_capacity(request.records.len());

        for (index, entry) in request.records.iter().enumerate() {
            match self.apply_item(collection, request, entry, schema, records) {
                Ok(id) => ids.push(id),
                Err(e) => {
                    return BulkResult {
                        success: false,
                        succeeded: 0,
                        failed: request.records.len(),
                        error: Some(format!("Bulk operation rolled back at index {index}")),
                        failed_index: Some(index),
                        failed_error: Some(e.to_string()),
                        ..BulkResult::default()
                    };
                }
            }
        }

        BulkResult {
            success: true,
            succeeded: ids.len(),
            failed: 0,
            ids: (request.action == BulkAction::Create).then_some(ids),
            ..BulkResult::default()
        }
    }

    fn bulk_best_effort(
        &self,
        collection: &str,
        request: &BulkOperationRequest,
        schema: &mut CollectionSchema,
        records: &mut Vec<Record>,
    ) -> BulkResult {
        let mut results = Vec::with_capacity(request.records.len());
        let mut ids = Vec::new();

        for (index, entry) in request.records.iter().enumerate() {
            let item = match self.apply_item(collection, request, entry, schema, records) {
                Ok(id) => {
                    ids.push(id.clone());
                    BulkOperationItemResult {
                        index,
                        id: Some(id),
                        success: true,
                        error: None,
                    }
                }
                Err(e) => BulkOperationItemResult {
                    index,
                    id: entry_id(entry),
                    success: false,
                    error: Some(e.to_string()),
                },
            };
            results.push(item);
        }

        let failed = results.iter().filter(|r| !r.success).count();
        BulkResult {
            success: failed == 0,
            succeeded: results.len() - failed,
            failed,
            results: Some(results),
            ids: (request.action == BulkAction::Create).then_some(ids),
            ..BulkResult::default()
        }
    }

    /// Run one item through the single-record pipeline. Leaves `schema` and
    /// `records` untouched when it fails.
    fn apply_item(
        &self,
        collection: &str,
        request: &BulkOperationRequest,
        entry: &Map<String, Value>,
        schema: &mut CollectionSchema,
        records: &mut Vec<Record>,
    ) -> Result<String> {
        match request.action {
            BulkAction::Create => {
                let record = self.prepare_create(schema, records, entry)?;
                let id = record.id.clone();
                records.push(record);
                Ok(id)
            }
            BulkAction::Update => {
                let id = required_id(entry)?;
                let idx = position(collection, records, &id)?;
                let changes = request.update_data.as_ref().unwrap_or(entry);
                let updated = self.prepare_update(schema, &records[idx], changes)?;
                records[idx] = updated;
                Ok(id)
            }
            BulkAction::Delete => {
                let id = required_id(entry)?;
                let idx = position(collection, records, &id)?;
                records.remove(idx);
                Ok(id)
            }
        }
    }
}

fn entry_id(entry: &Map<String, Value>) -> Option<String> {
    entry.get(ID_FIELD).and_then(to_text).filter(|id| !id.is_empty())
}

fn required_id(entry: &Map<String, Value>) -> Result<String> {
    entry_id(entry).ok_or_else(|| FlatbaseError::Request("Record is missing an 'id'".into()))
}

#[cfg(test)]
mod tests {
    use super::super::QueryOptions;
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tempfile::TempDir;

    const PEOPLE: &str = "id,name,age\np1,Ann,41\np2,Bob,17\np3,Cid,29\n";

    fn setup_test_store() -> (TempDir, Store) {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("people.csv"), PEOPLE).unwrap();
        let store = Store::open(tmp.path()).unwrap();
        (tmp, store)
    }

    fn request(value: Value) -> BulkOperationRequest {
        BulkOperationRequest::from_value(&value).unwrap()
    }

    async fn total(store: &Store) -> usize {
        store
            .list("people", &QueryOptions::default(), &CancelToken::never())
            .await
            .unwrap()
            .total
    }

    fn creates(atomic: bool) -> BulkOperationRequest {
        request(json!({
            "action": "create",
            "atomic": atomic,
            "records": [
                {"name": "Dee", "age": 30},
                {"name": "Eve", "age": "not a number"},
                {"name": "Fay", "age": 22}
            ]
        }))
    }

    #[tokio::test]
    async fn test_atomic_create_rolls_back_on_failure() {
        let (tmp, store) = setup_test_store();
        let result = store
            .bulk_operation("people", &creates(true), &CancelToken::never())
            .await
            .unwrap();

        assert!(!result.success);
        assert_eq!(result.failed_index, Some(1));
        assert_eq!(result.succeeded, 0);
        assert_eq!(result.failed, 3);
        assert!(result.failed_error.unwrap().contains("age"));
        assert_eq!(total(&store).await, 3);
        assert_eq!(std::fs::read_to_string(tmp.path().join("people.csv")).unwrap(), PEOPLE);
    }

    #[tokio::test]
    async fn test_best_effort_create_counts_each_item() {
        let (_tmp, store) = setup_test_store();
        let result = store
            .bulk_operation("people", &creates(false), &CancelToken::never())
            .await
            .unwrap();

        assert!(!result.success);
        assert_eq!(result.succeeded, 2);
        assert_eq!(result.failed, 1);
        let results = result.results.unwrap();
        assert_eq!(results.len(), 3);
        assert!(results[0].success && results[2].success);
        assert_eq!(results[1].index, 1);
        assert!(!results[1].success);
        assert!(results[1].error.is_some());
        assert_eq!(total(&store).await, 5);

        for id in result.ids.unwrap() {
            store.get("people", &id, &CancelToken::never()).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_atomic_create_commits_all() {
        let (_tmp, store) = setup_test_store();
        let result = store
            .bulk_operation(
                "people",
                &request(json!({
                    "action": "create",
                    "atomic": true,
                    "records": [{"name": "Dee", "age": 30}, {"name": "Fay", "age": 22}]
                })),
                &CancelToken::never(),
            )
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.succeeded, 2);
        assert_eq!(result.ids.as_ref().map(Vec::len), Some(2));
        assert_eq!(total(&store).await, 5);
    }

    #[tokio::test]
    async fn test_update_with_shared_update_data() {
        let (_tmp, store) = setup_test_store();
        let result = store
            .bulk_operation(
                "people",
                &request(json!({
                    "action": "update",
                    "atomic": true,
                    "records": [{"id": "p1"}, {"id": "p3"}],
                    "updateData": {"age": 50}
                })),
                &CancelToken::never(),
            )
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.ids, None);

        let never = CancelToken::never();
        assert_eq!(store.get("people", "p1", &never).await.unwrap().data["age"], json!(50));
        assert_eq!(store.get("people", "p2", &never).await.unwrap().data["age"], json!(17));
        assert_eq!(store.get("people", "p3", &never).await.unwrap().data["name"], json!("Cid"));
    }

    #[tokio::test]
    async fn test_update_with_per_record_fields() {
        let (_tmp, store) = setup_test_store();
        let result = store
            .bulk_operation(
                "people",
                &request(json!({
                    "action": "update",
                    "records": [{"id": "p1", "name": "Annie"}, {"id": "nope", "name": "X"}, {"name": "Y"}]
                })),
                &CancelToken::never(),
            )
            .await
            .unwrap();

        assert_eq!((result.succeeded, result.failed), (1, 2));
        let results = result.results.unwrap();
        assert_eq!(results[1].id.as_deref(), Some("nope"));
        assert_eq!(results[2].id, None);
        let record = store.get("people", "p1", &CancelToken::never()).await.unwrap();
        assert_eq!(record.data["name"], json!("Annie"));
    }

    #[tokio::test]
    async fn test_atomic_delete_with_unknown_id_keeps_everything() {
        let (_tmp, store) = setup_test_store();
        let result = store
            .bulk_operation(
                "people",
                &request(json!({
                    "action": "delete",
                    "atomic": true,
                    "records": [{"id": "p1"}, {"id": "p9"}]
                })),
                &CancelToken::never(),
            )
            .await
            .unwrap();

        assert_eq!(result.failed_index, Some(1));
        assert!(result.failed_error.unwrap().contains("p9"));
        assert_eq!(total(&store).await, 3);
    }

    #[tokio::test]
    async fn test_best_effort_delete() {
        let (_tmp, store) = setup_test_store();
        let result = store
            .bulk_operation(
                "people",
                &request(json!({"action": "delete", "records": [{"id": "p1"}, {"id": "p2"}]})),
                &CancelToken::never(),
            )
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.succeeded, 2);
        assert_eq!(total(&store).await, 1);
    }

    #[tokio::test]
    async fn test_bulk_on_missing_collection() {
        let (_tmp, store) = setup_test_store();
        let err = store
            .bulk_operation("ghosts", &creates(false), &CancelToken::never())
            .await
            .unwrap_err();
        assert!(matches!(err, FlatbaseError::CollectionNotFound { .. }));
    }

    #[tokio::test]
    async fn test_cancelled_bulk_writes_nothing() {
        let (tmp, store) = setup_test_store();
        let (handle, token) = crate::cancel::cancel_pair();
        handle.cancel();
        let err = store
            .bulk_operation("people", &creates(false), &token)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(std::fs::read_to_string(tmp.path().join("people.csv")).unwrap(), PEOPLE);
    }
}

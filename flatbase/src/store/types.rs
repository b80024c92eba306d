use crate::error::{FlatbaseError, Result};
use crate::filter::Filter;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// An identified, dynamically typed field map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    #[serde(default)]
    pub data: Map<String, Value>,
}

impl Record {
    pub fn new(id: impl Into<String>, data: Map<String, Value>) -> Self {
        Record {
            id: id.into(),
            data,
        }
    }
}

/// Options for `Store::list`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct QueryOptions {
    /// Projection. `id` is always kept.
    pub fields: Option<Vec<String>>,
    pub filter: Option<Filter>,
    /// Page size; the store's configured default when `None`.
    pub limit: Option<usize>,
    pub offset: usize,
    /// `field`, `field:asc` or `field:desc`.
    pub sort: Option<String>,
}

impl QueryOptions {
    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn with_sort(mut self, sort: impl Into<String>) -> Self {
        self.sort = Some(sort.into());
        self
    }

    pub fn with_fields(mut self, fields: Vec<String>) -> Self {
        self.fields = Some(fields);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ListResult {
    pub data: Vec<Record>,
    /// Matching records before pagination.
    pub total: usize,
    pub more: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CreateResult {
    pub id: String,
    pub record: Record,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BulkAction {
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkOperationRequest {
    pub action: BulkAction,
    #[serde(default)]
    pub atomic: bool,
    #[serde(default)]
    pub records: Vec<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_data: Option<Map<String, Value>>,
}

impl BulkOperationRequest {
    /// Parse a request body. A null body or an unsupported action is a
    /// request error.
    pub fn from_value(value: &Value) -> Result<Self> {
        if value.is_null() {
            return Err(FlatbaseError::Request("Bulk request body is required".into()));
        }
        serde_json::from_value(value.clone())
            .map_err(|e| FlatbaseError::Request(format!("Invalid bulk request: {e}")))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkOperationItemResult {
    pub index: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkResult {
    pub success: bool,
    pub succeeded: usize,
    pub failed: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results: Option<Vec<BulkOperationItemResult>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_index: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_error: Option<String>,
}

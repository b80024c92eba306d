use thiserror::Error;

#[derive(Error, Debug)]
pub enum FlatbaseError {
    #[error("Collection not found: {collection}")]
    CollectionNotFound { collection: String },

    #[error("Record not found: {collection}/{id}")]
    RecordNotFound { collection: String, id: String },

    #[error("Validation error on field '{field}': {message}")]
    Validation { field: String, message: String },

    #[error("Cannot convert field '{field}' value {value} from {from} to {to}")]
    Conversion {
        field: String,
        value: String,
        from: String,
        to: String,
    },

    #[error("Invalid request: {0}")]
    Request(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Watcher error: {0}")]
    Watch(#[from] notify::Error),

    #[error("Operation cancelled")]
    Cancelled,
}

impl FlatbaseError {
    /// True for failures of the underlying files (I/O, codec, unreadable state).
    pub fn is_storage(&self) -> bool {
        matches!(
            self,
            FlatbaseError::Storage(_) | FlatbaseError::Io(_) | FlatbaseError::Csv(_)
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            FlatbaseError::CollectionNotFound { .. } | FlatbaseError::RecordNotFound { .. }
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, FlatbaseError::Cancelled)
    }

    pub(crate) fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        FlatbaseError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, FlatbaseError>;

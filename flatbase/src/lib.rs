pub mod aggregate;
pub mod cancel;
pub mod config;
pub mod convert;
pub mod defaults;
pub mod error;
pub mod filter;
pub mod schema;
pub mod store;
pub mod table;
pub mod validation;
pub mod watcher;

pub use aggregate::{AggregateFunction, AggregateRequest, AggregateResult, AggregateSpec, SummaryResult};
pub use cancel::{cancel_pair, CancelHandle, CancelToken};
pub use config::{IdStrategy, StoreConfig};
pub use error::{FlatbaseError, Result};
pub use filter::Filter;
pub use schema::{CollectionSchema, ConversionStrategy, FieldDefinition, FieldType};
pub use store::{
    BulkAction, BulkOperationItemResult, BulkOperationRequest, BulkResult, CreateResult,
    ListResult, QueryOptions, Record, Store,
};
pub use watcher::{ChangeKind, FileWatcher, WatcherEvent};

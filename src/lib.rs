pub mod core;

pub use crate::core::config::StoreConfig;
pub use crate::core::errors::{StoreError, TaskError};
pub use crate::core::model::{TaskId, TaskRecord, TaskState};
pub use crate::core::snapshot::SnapshotCodec;
pub use crate::core::store::{SqliteStore, TaskStore};

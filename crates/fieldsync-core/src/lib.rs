pub mod config;
pub mod identity;
pub mod logging;
pub mod model;
pub mod store;

pub use config::Settings;
pub use model::{
    BulkMode, LayerId, Owner, Partition, PartitionKind, Record, RecordId, Strategy, UserId,
};
pub use store::{JsonDirStore, MemoryStore, PartitionStore, StoreError};

pub mod bucket;
pub mod engine;
pub mod file_db;
pub mod memory;
pub mod persistence;
pub mod store;

pub use bucket::Bucket;
pub use engine::Database;
pub use file_db::{FileDatabase, FileDatabaseConfig};
pub use memory::MemoryDatabase;
pub use persistence::DurabilityMode;
pub use store::{BucketStore, StoreOptions, StoreStats};

pub mod memory;
pub mod models;
pub mod sqlite;
pub mod store;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use store::{Store, WatchCriteria};

pub mod cache;
pub mod filestore;
pub mod memory;

pub use cache::PersistentCache;
pub use filestore::FileCacheBackend;
pub use memory::MemoryCacheBackend;
pub use synccore::store::error::{Result, StoreError};
pub use synccore::store::traits::CacheBackend;
pub use synccore::store::{CacheEntry, CacheScope};

use crate::store::error::Result;
use async_trait::async_trait;

/// Raw key-value storage behind the persistent cache.
///
/// Each `put` replaces the whole value for its key.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
    /// All keys starting with `prefix`.
    async fn keys(&self, prefix: &str) -> Result<Vec<String>>;
}

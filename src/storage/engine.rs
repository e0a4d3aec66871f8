use crate::core::Result;
use async_trait::async_trait;

/// Key-value store primitive - one per storage tier.
///
/// Values are opaque bytes; the facade owns serialization.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Human-readable tier name used in logs and errors.
    fn name(&self) -> &str;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()>;

    /// Removing a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    async fn clear(&self) -> Result<()>;

    async fn keys(&self) -> Result<Vec<String>>;

    /// Total bytes currently held (keys + values).
    async fn size_bytes(&self) -> Result<u64>;
}

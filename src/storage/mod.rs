pub mod broadcast;
pub mod cache;
pub mod chunking;
pub mod engine;
pub mod facade;
pub mod memory;
pub mod persistence;
pub mod strategy;

pub use broadcast::{BroadcastChangeBus, ChangeBus, ChangeEvent};
pub use cache::VolatileCache;
pub use chunking::{ChunkManifest, chunk_key, manifest_key};
pub use engine::KvStore;
pub use facade::{
    ReadOptions, StorageFacade, StorageStats, StorageTiers, SubscriberCallback, SubscriptionId,
    Tier,
};
pub use memory::{KvStoreStats, MemoryKvStore};
pub use persistence::FileKvStore;
pub use strategy::{WriteFlags, WriteStrategy, check_payload_cap, select_strategy};

//! Impls - QueueStore / KeyValueStore の実装
//!
//! - **ListStore**: in-memory の ready list + delayed set（デフォルト）
//! - **IndexStore**: 任意の KeyValueStore 上に record + id index を載せる
//!   - **MemoryKv**: テスト・開発用
//!   - **FileKv**: ディレクトリに 1 key = 1 file
//! - **RedisStore**: feature `redis`。複数プロセスで共有できる

pub mod file_kv;
pub mod index_store;
pub mod list_store;
pub mod memory_kv;
#[cfg(feature = "redis")]
pub mod redis_store;

pub use self::file_kv::FileKv;
pub use self::index_store::IndexStore;
pub use self::list_store::ListStore;
pub use self::memory_kv::MemoryKv;
#[cfg(feature = "redis")]
pub use self::redis_store::RedisStore;

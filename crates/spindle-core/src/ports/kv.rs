//! KeyValueStore port - flat key space used by `IndexStore`.
//!
//! 値は文字列（JSON）。どのコードからでも `{prefix}{job_id}` で record を
//! 引けるようにするためのフラットなキー空間。

use async_trait::async_trait;

use crate::domain::QueueError;

/// Exclusive section over a kv backend, released on drop.
#[derive(Default)]
pub struct KvLock {
    _held: Option<Box<dyn Send + Sync>>,
}

impl KvLock {
    /// Guard for backends that live in one process; the caller's own mutex
    /// is all the exclusion they need.
    pub fn local() -> Self {
        Self::default()
    }

    /// Keep `held` alive until the guard drops.
    pub fn holding(held: impl Send + Sync + 'static) -> Self {
        Self {
            _held: Some(Box::new(held)),
        }
    }
}

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, QueueError>;

    async fn set(&self, key: &str, value: String) -> Result<(), QueueError>;

    /// Returns whether the key existed.
    async fn delete(&self, key: &str) -> Result<bool, QueueError>;

    /// Exclude every other holder of `name`, including other processes
    /// sharing the backend.
    async fn lock(&self, _name: &str) -> Result<KvLock, QueueError> {
        Ok(KvLock::local())
    }
}

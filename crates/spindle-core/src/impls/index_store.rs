//! Index + record store over a plain key/value backend.
//!
//! record は `{prefix}{id}` に JSON で置き、queue ごとの順序は id の index で持つ:
//! - `{prefix}list:{queue}`     ready な id の配列（FIFO）
//! - `{prefix}delayed:{queue}`  `{id, run_at}` の配列（run_at 昇順、同時刻は push 順）
//! - `{prefix}reserved:{queue}` pop 済みで delete / release 待ちの `{id, until}`
//! - `{prefix}lock:{queue}`     queue の排他に使う名前（`KeyValueStore::lock`）
//!
//! index の read-modify-write は queue ごとに、インスタンス内の async mutex と
//! backend のロック（FileKv ならファイルロック）の両方を取ってから行う。
//! 同じディレクトリを複数プロセスで共有しても二重配送しない。

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use super::list_store::{reserved_until, run_at_after};
use crate::domain::{JobId, JobRecord, QueueError, QueueName};
use crate::ports::{Clock, KeyValueStore, KvLock, QueueStore, SystemClock};

pub const DEFAULT_PREFIX: &str = "spindle:queue:";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DelayedEntry {
    id: JobId,
    run_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ReservedEntry {
    id: JobId,
    until: DateTime<Utc>,
}

/// Both halves of a queue's exclusion. The backend lock is released first.
struct QueueGuard {
    _shared: KvLock,
    _local: OwnedMutexGuard<()>,
}

pub struct IndexStore<K> {
    kv: K,
    prefix: String,
    clock: Arc<dyn Clock>,
    locks: Mutex<HashMap<QueueName, Arc<AsyncMutex<()>>>>,
}

impl<K: KeyValueStore> IndexStore<K> {
    pub fn new(kv: K) -> Self {
        Self::with_clock(kv, Arc::new(SystemClock))
    }

    pub fn with_clock(kv: K, clock: Arc<dyn Clock>) -> Self {
        Self {
            kv,
            prefix: DEFAULT_PREFIX.to_string(),
            clock,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn kv(&self) -> &K {
        &self.kv
    }

    fn record_key(&self, id: JobId) -> String {
        format!("{}{}", self.prefix, id)
    }

    fn list_key(&self, queue: &QueueName) -> String {
        format!("{}list:{}", self.prefix, queue)
    }

    fn delayed_key(&self, queue: &QueueName) -> String {
        format!("{}delayed:{}", self.prefix, queue)
    }

    fn reserved_key(&self, queue: &QueueName) -> String {
        format!("{}reserved:{}", self.prefix, queue)
    }

    fn lock_key(&self, queue: &QueueName) -> String {
        format!("{}lock:{}", self.prefix, queue)
    }

    fn queue_lock(&self, queue: &QueueName) -> Result<Arc<AsyncMutex<()>>, QueueError> {
        let mut locks = self
            .locks
            .lock()
            .map_err(|_| QueueError::Unavailable("lock poisoned".to_string()))?;
        Ok(Arc::clone(locks.entry(queue.clone()).or_default()))
    }

    /// Serialize index updates of `queue` within this process and across
    /// every other user of the backend.
    async fn lock_queue(&self, queue: &QueueName) -> Result<QueueGuard, QueueError> {
        let local = self.queue_lock(queue)?.lock_owned().await;
        let shared = self.kv.lock(&self.lock_key(queue)).await?;
        Ok(QueueGuard {
            _shared: shared,
            _local: local,
        })
    }

    async fn load<T: serde::de::DeserializeOwned>(&self, key: &str) -> Result<Vec<T>, QueueError> {
        match self.kv.get(key).await? {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(Vec::new()),
        }
    }

    async fn save<T: Serialize>(&self, key: &str, items: &[T]) -> Result<(), QueueError> {
        if items.is_empty() {
            self.kv.delete(key).await?;
        } else {
            self.kv.set(key, serde_json::to_string(items)?).await?;
        }
        Ok(())
    }

    async fn load_record(&self, id: JobId) -> Result<Option<JobRecord>, QueueError> {
        match self.kv.get(&self.record_key(id)).await? {
            Some(raw) => Ok(Some(JobRecord::from_json(&raw)?)),
            None => Ok(None),
        }
    }

    async fn save_record(&self, record: &JobRecord) -> Result<(), QueueError> {
        self.kv
            .set(&self.record_key(record.id), record.to_json()?)
            .await
    }

    /// Index `record` as ready or delayed. Caller holds the queue lock and
    /// has already written the record.
    async fn place(&self, record: &JobRecord, now: DateTime<Utc>) -> Result<(), QueueError> {
        match record.run_at {
            Some(run_at) if run_at > now => {
                let key = self.delayed_key(&record.queue);
                let mut delayed: Vec<DelayedEntry> = self.load(&key).await?;
                // 同時刻のものより後ろに入れて push 順を保つ
                let at = delayed.partition_point(|e| e.run_at <= run_at);
                delayed.insert(
                    at,
                    DelayedEntry {
                        id: record.id,
                        run_at,
                    },
                );
                self.save(&key, &delayed).await
            }
            _ => {
                let key = self.list_key(&record.queue);
                let mut ready: Vec<JobId> = self.load(&key).await?;
                ready.push(record.id);
                self.save(&key, &ready).await
            }
        }
    }

    /// Move due delayed jobs and expired reservations to the ready list.
    /// Caller holds the queue lock.
    async fn promote_locked(
        &self,
        queue: &QueueName,
        now: DateTime<Utc>,
    ) -> Result<usize, QueueError> {
        let delayed_key = self.delayed_key(queue);
        let mut delayed: Vec<DelayedEntry> = self.load(&delayed_key).await?;
        let due = delayed.partition_point(|e| e.run_at <= now);

        let reserved_key = self.reserved_key(queue);
        let mut reserved: Vec<ReservedEntry> = self.load(&reserved_key).await?;
        reserved.sort_by_key(|e| e.until);
        let expired = reserved.partition_point(|e| e.until <= now);

        if due == 0 && expired == 0 {
            return Ok(0);
        }

        let list_key = self.list_key(queue);
        let mut ready: Vec<JobId> = self.load(&list_key).await?;
        ready.extend(delayed.drain(..due).map(|e| e.id));
        ready.extend(reserved.drain(..expired).map(|e| e.id));

        // ready 側を先に書く。途中で落ちても job は消えない（重複はしうる）
        self.save(&list_key, &ready).await?;
        if due > 0 {
            self.save(&delayed_key, &delayed).await?;
        }
        if expired > 0 {
            self.save(&reserved_key, &reserved).await?;
        }
        Ok(due + expired)
    }
}

#[async_trait]
impl<K: KeyValueStore> QueueStore for IndexStore<K> {
    async fn push(&self, job: JobRecord) -> Result<JobId, QueueError> {
        let now = self.clock.now();
        let _guard = self.lock_queue(&job.queue).await?;

        self.save_record(&job).await?;
        self.place(&job, now).await?;
        Ok(job.id)
    }

    async fn pop(&self, queue: &QueueName) -> Result<Option<JobRecord>, QueueError> {
        let now = self.clock.now();
        let _guard = self.lock_queue(queue).await?;

        self.promote_locked(queue, now).await?;

        let list_key = self.list_key(queue);
        let mut ready: Vec<JobId> = self.load(&list_key).await?;
        let mut taken = None;
        let mut consumed = 0;
        for id in &ready {
            consumed += 1;
            // index だけ残って record がないものは読み飛ばす
            if let Some(record) = self.load_record(*id).await? {
                taken = Some(record);
                break;
            }
        }
        if consumed == 0 {
            return Ok(None);
        }
        ready.drain(..consumed);

        let Some(mut record) = taken else {
            self.save(&list_key, &ready).await?;
            return Ok(None);
        };

        record.start_attempt();
        self.save_record(&record).await?;

        let reserved_key = self.reserved_key(queue);
        let mut reserved: Vec<ReservedEntry> = self.load(&reserved_key).await?;
        reserved.push(ReservedEntry {
            id: record.id,
            until: reserved_until(now, &record),
        });
        self.save(&reserved_key, &reserved).await?;
        self.save(&list_key, &ready).await?;

        Ok(Some(record))
    }

    async fn delete(&self, queue: &QueueName, id: JobId) -> Result<(), QueueError> {
        let _guard = self.lock_queue(queue).await?;

        self.kv.delete(&self.record_key(id)).await?;

        let reserved_key = self.reserved_key(queue);
        let mut reserved: Vec<ReservedEntry> = self.load(&reserved_key).await?;
        if let Some(pos) = reserved.iter().position(|r| r.id == id) {
            reserved.remove(pos);
            self.save(&reserved_key, &reserved).await?;
            return Ok(());
        }

        let list_key = self.list_key(queue);
        let mut ready: Vec<JobId> = self.load(&list_key).await?;
        let before = ready.len();
        ready.retain(|r| *r != id);
        if ready.len() != before {
            self.save(&list_key, &ready).await?;
        }

        let delayed_key = self.delayed_key(queue);
        let mut delayed: Vec<DelayedEntry> = self.load(&delayed_key).await?;
        let before = delayed.len();
        delayed.retain(|e| e.id != id);
        if delayed.len() != before {
            self.save(&delayed_key, &delayed).await?;
        }
        Ok(())
    }

    async fn release(
        &self,
        queue: &QueueName,
        id: JobId,
        delay: Duration,
        error: Option<String>,
    ) -> Result<(), QueueError> {
        let now = self.clock.now();
        let _guard = self.lock_queue(queue).await?;

        let reserved_key = self.reserved_key(queue);
        let mut reserved: Vec<ReservedEntry> = self.load(&reserved_key).await?;
        let pos = reserved
            .iter()
            .position(|r| r.id == id)
            .ok_or(QueueError::NotFound(id))?;
        let mut record = self.load_record(id).await?.ok_or(QueueError::NotFound(id))?;

        record.prepare_release(run_at_after(now, delay), error)?;
        self.save_record(&record).await?;
        self.place(&record, now).await?;

        reserved.remove(pos);
        self.save(&reserved_key, &reserved).await
    }

    async fn size(&self, queue: &QueueName) -> Result<usize, QueueError> {
        let ready: Vec<JobId> = self.load(&self.list_key(queue)).await?;
        Ok(ready.len())
    }

    async fn delayed_size(&self, queue: &QueueName) -> Result<usize, QueueError> {
        let delayed: Vec<DelayedEntry> = self.load(&self.delayed_key(queue)).await?;
        Ok(delayed.len())
    }

    async fn promote(&self, queue: &QueueName) -> Result<usize, QueueError> {
        let now = self.clock.now();
        let _guard = self.lock_queue(queue).await?;
        self.promote_locked(queue, now).await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::impls::{FileKv, MemoryKv};
    use crate::ports::FixedClock;
    use crate::test_support::{self, fixed_clock};

    fn store() -> (IndexStore<MemoryKv>, FixedClock) {
        let clock = fixed_clock();
        (
            IndexStore::with_clock(MemoryKv::new(), Arc::new(clock.clone())),
            clock,
        )
    }

    #[tokio::test]
    async fn contract_fifo() {
        let (store, clock) = store();
        test_support::check_fifo(&store, &clock).await;
    }

    #[tokio::test]
    async fn contract_pop_bumps_attempts() {
        let (store, clock) = store();
        test_support::check_pop_bumps_attempts(&store, &clock).await;
    }

    #[tokio::test]
    async fn contract_delayed_visibility() {
        let (store, clock) = store();
        test_support::check_delayed_visibility(&store, &clock).await;
    }

    #[tokio::test]
    async fn contract_delete_is_idempotent() {
        let (store, clock) = store();
        test_support::check_delete_idempotent(&store, &clock).await;
    }

    #[tokio::test]
    async fn contract_release() {
        let (store, clock) = store();
        test_support::check_release(&store, &clock).await;
    }

    #[tokio::test]
    async fn contract_queues_are_isolated() {
        let (store, clock) = store();
        test_support::check_queue_isolation(&store, &clock).await;
    }

    #[tokio::test]
    async fn contract_abandoned_reservations_return() {
        let (store, clock) = store();
        test_support::check_abandoned_reservation_returns(&store, &clock).await;
    }

    #[tokio::test]
    async fn records_and_indexes_use_the_prefix() {
        let (store, clock) = store();
        let queue = QueueName::default();
        let id = store
            .push(test_support::record(&clock, "noop", &queue))
            .await
            .unwrap();

        let kv = store.kv();
        let raw = kv.get(&format!("spindle:queue:{id}")).await.unwrap().unwrap();
        assert_eq!(JobRecord::from_json(&raw).unwrap().id, id);
        let list = kv.get("spindle:queue:list:default").await.unwrap().unwrap();
        assert_eq!(list, format!("[\"{id}\"]"));

        store.pop(&queue).await.unwrap().unwrap();
        assert_eq!(kv.get("spindle:queue:list:default").await.unwrap(), None);
        assert!(
            kv.get("spindle:queue:reserved:default")
                .await
                .unwrap()
                .is_some()
        );

        store.delete(&queue, id).await.unwrap();
        assert_eq!(kv.get(&format!("spindle:queue:{id}")).await.unwrap(), None);
        assert!(kv.is_empty());
    }

    #[tokio::test]
    async fn ids_without_records_are_skipped() {
        let (store, clock) = store();
        let queue = QueueName::default();
        let orphan = store
            .push(test_support::record(&clock, "noop", &queue))
            .await
            .unwrap();
        let live = store
            .push(test_support::record(&clock, "noop", &queue))
            .await
            .unwrap();
        store
            .kv()
            .delete(&format!("spindle:queue:{orphan}"))
            .await
            .unwrap();

        assert_eq!(store.pop(&queue).await.unwrap().unwrap().id, live);
        assert_eq!(store.size(&queue).await.unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_pops_never_share_a_job() {
        let clock = fixed_clock();
        let store = Arc::new(IndexStore::with_clock(
            MemoryKv::new(),
            Arc::new(clock.clone()),
        ));
        let queue = QueueName::default();
        for _ in 0..40 {
            store
                .push(test_support::record(&clock, "noop", &queue))
                .await
                .unwrap();
        }

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let store = Arc::clone(&store);
            let queue = queue.clone();
            tasks.push(tokio::spawn(async move {
                let mut seen = Vec::new();
                while let Some(job) = store.pop(&queue).await.unwrap() {
                    seen.push(job.id);
                    store.delete(&queue, job.id).await.unwrap();
                }
                seen
            }));
        }

        let mut all = Vec::new();
        for task in tasks {
            all.extend(task.await.unwrap());
        }
        let unique: HashSet<_> = all.iter().copied().collect();
        assert_eq!(all.len(), 40);
        assert_eq!(unique.len(), 40);
    }

    #[tokio::test]
    async fn file_backed_store_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let clock = fixed_clock();
        let queue = QueueName::new("emails");

        let id = {
            let kv = FileKv::open(dir.path()).await.unwrap();
            let store = IndexStore::with_clock(kv, Arc::new(clock.clone()));
            store
                .push(test_support::record(&clock, "noop", &queue))
                .await
                .unwrap()
        };

        let kv = FileKv::open(dir.path()).await.unwrap();
        let store = IndexStore::with_clock(kv, Arc::new(clock.clone()));
        assert_eq!(store.size(&queue).await.unwrap(), 1);
        let job = store.pop(&queue).await.unwrap().unwrap();
        assert_eq!(job.id, id);
        assert_eq!(job.attempts, 1);
    }

    #[tokio::test]
    async fn file_backed_store_meets_the_contract() {
        let dir = tempfile::tempdir().unwrap();
        let clock = fixed_clock();
        let kv = FileKv::open(dir.path()).await.unwrap();
        let store = IndexStore::with_clock(kv, Arc::new(clock.clone())).with_prefix("t:");
        test_support::check_release(&store, &clock).await;
        test_support::check_queue_isolation(&store, &clock).await;
        test_support::check_abandoned_reservation_returns(&store, &clock).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn stores_sharing_a_directory_never_share_a_job() {
        let dir = tempfile::tempdir().unwrap();
        let clock = fixed_clock();
        let queue = QueueName::default();

        // 別プロセスの worker と同じく、FileKv も IndexStore も別インスタンス
        let mut stores = Vec::new();
        for _ in 0..2 {
            let kv = FileKv::open(dir.path()).await.unwrap();
            stores.push(Arc::new(IndexStore::with_clock(
                kv,
                Arc::new(clock.clone()),
            )));
        }
        for _ in 0..40 {
            stores[0]
                .push(test_support::record(&clock, "noop", &queue))
                .await
                .unwrap();
        }

        let mut tasks = Vec::new();
        for store in &stores {
            for _ in 0..2 {
                let store = Arc::clone(store);
                let queue = queue.clone();
                tasks.push(tokio::spawn(async move {
                    let mut seen = Vec::new();
                    while let Some(job) = store.pop(&queue).await.unwrap() {
                        seen.push(job.id);
                        store.delete(&queue, job.id).await.unwrap();
                    }
                    seen
                }));
            }
        }

        let mut all = Vec::new();
        for task in tasks {
            all.extend(task.await.unwrap());
        }
        let unique: HashSet<_> = all.iter().copied().collect();
        assert_eq!(all.len(), 40);
        assert_eq!(unique.len(), 40);
        assert_eq!(stores[1].size(&queue).await.unwrap(), 0);
    }
}

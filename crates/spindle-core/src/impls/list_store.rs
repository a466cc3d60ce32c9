//! Direct list store (in-memory default backend).
//!
//! 1 queue = ready list (FIFO) + delayed set (run_at の min-heap)。
//! pop された record は reserved に移り、delete / release を待つ。
//! reservation の期限を過ぎたものは promote で ready に戻す。

use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::domain::{JobId, JobRecord, QueueError, QueueName};
use crate::ports::{Clock, QueueStore, SystemClock};

/// Delayed entry for the priority queue.
///
/// We use reversed ordering so BinaryHeap acts as a min-heap (earliest first).
/// `seq` keeps FIFO among equal `run_at` and lets stale entries be detected.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ScheduledJob {
    run_at: DateTime<Utc>,
    seq: u64,
    id: JobId,
}

impl PartialOrd for ScheduledJob {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledJob {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .run_at
            .cmp(&self.run_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct QueueLists {
    ready: VecDeque<JobRecord>,
    scheduled: BinaryHeap<ScheduledJob>,
    /// Source of truth for delayed jobs; heap entries whose seq no longer
    /// matches are stale and skipped.
    delayed: HashMap<JobId, (u64, JobRecord)>,
}

impl QueueLists {
    fn promote_due(&mut self, now: DateTime<Utc>) -> usize {
        let mut promoted = 0;
        while let Some(entry) = self.scheduled.peek() {
            if entry.run_at > now {
                break; // Heap is sorted, so we can stop
            }
            let Some(entry) = self.scheduled.pop() else {
                break;
            };
            if self
                .delayed
                .get(&entry.id)
                .is_some_and(|(seq, _)| *seq == entry.seq)
                && let Some((_, record)) = self.delayed.remove(&entry.id)
            {
                self.ready.push_back(record);
                promoted += 1;
            }
        }
        promoted
    }
}

/// A popped job and the instant it counts as abandoned.
struct Reservation {
    until: DateTime<Utc>,
    record: JobRecord,
}

#[derive(Default)]
struct ListStoreState {
    queues: HashMap<QueueName, QueueLists>,
    reserved: HashMap<JobId, Reservation>,
    next_seq: u64,
}

impl ListStoreState {
    fn lists(&mut self, queue: &QueueName) -> &mut QueueLists {
        self.queues.entry(queue.clone()).or_default()
    }

    /// Ready list when due, delayed set otherwise.
    fn place(&mut self, record: JobRecord, now: DateTime<Utc>) {
        let seq = self.next_seq;
        self.next_seq += 1;

        let lists = self.lists(&record.queue.clone());
        match record.run_at {
            Some(run_at) if run_at > now => {
                lists.scheduled.push(ScheduledJob {
                    run_at,
                    seq,
                    id: record.id,
                });
                lists.delayed.insert(record.id, (seq, record));
            }
            _ => lists.ready.push_back(record),
        }
    }

    /// Put reservations of `queue` that expired by `now` back on its ready
    /// list, oldest deadline first.
    fn reclaim_expired(&mut self, queue: &QueueName, now: DateTime<Utc>) -> usize {
        let mut expired: Vec<(DateTime<Utc>, JobId)> = self
            .reserved
            .iter()
            .filter(|(_, r)| &r.record.queue == queue && r.until <= now)
            .map(|(id, r)| (r.until, *id))
            .collect();
        expired.sort();

        let mut reclaimed = 0;
        for (_, id) in expired {
            if let Some(reservation) = self.reserved.remove(&id) {
                self.lists(queue).ready.push_back(reservation.record);
                reclaimed += 1;
            }
        }
        reclaimed
    }

    /// Promote due delayed jobs, then reclaim abandoned reservations.
    fn promote(&mut self, queue: &QueueName, now: DateTime<Utc>) -> usize {
        let promoted = self.lists(queue).promote_due(now);
        promoted + self.reclaim_expired(queue, now)
    }
}

/// In-memory `QueueStore`: FIFO ready lists plus a time-ordered delayed set.
#[derive(Clone)]
pub struct ListStore {
    state: Arc<Mutex<ListStoreState>>,
    clock: Arc<dyn Clock>,
}

impl ListStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Arc::new(Mutex::new(ListStoreState::default())),
            clock,
        }
    }

    /// Number of popped jobs awaiting delete or release.
    pub async fn reserved_len(&self) -> usize {
        self.state.lock().await.reserved.len()
    }
}

impl Default for ListStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueueStore for ListStore {
    async fn push(&self, job: JobRecord) -> Result<JobId, QueueError> {
        let id = job.id;
        let now = self.clock.now();
        self.state.lock().await.place(job, now);
        Ok(id)
    }

    async fn pop(&self, queue: &QueueName) -> Result<Option<JobRecord>, QueueError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;

        state.promote(queue, now);
        let Some(mut record) = state.lists(queue).ready.pop_front() else {
            return Ok(None);
        };

        record.start_attempt();
        let until = reserved_until(now, &record);
        state.reserved.insert(
            record.id,
            Reservation {
                until,
                record: record.clone(),
            },
        );
        Ok(Some(record))
    }

    async fn delete(&self, queue: &QueueName, id: JobId) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        state.reserved.remove(&id);
        if let Some(lists) = state.queues.get_mut(queue) {
            lists.ready.retain(|r| r.id != id);
            lists.delayed.remove(&id);
        }
        Ok(())
    }

    async fn release(
        &self,
        _queue: &QueueName,
        id: JobId,
        delay: Duration,
        error: Option<String>,
    ) -> Result<(), QueueError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;

        let reservation = state.reserved.get_mut(&id).ok_or(QueueError::NotFound(id))?;
        // 失敗したら reserved のまま残して、呼び出し側が delete できるようにする
        reservation
            .record
            .prepare_release(run_at_after(now, delay), error)?;

        if let Some(reservation) = state.reserved.remove(&id) {
            state.place(reservation.record, now);
        }
        Ok(())
    }

    async fn size(&self, queue: &QueueName) -> Result<usize, QueueError> {
        let state = self.state.lock().await;
        Ok(state.queues.get(queue).map_or(0, |l| l.ready.len()))
    }

    async fn delayed_size(&self, queue: &QueueName) -> Result<usize, QueueError> {
        let state = self.state.lock().await;
        Ok(state.queues.get(queue).map_or(0, |l| l.delayed.len()))
    }

    async fn promote(&self, queue: &QueueName) -> Result<usize, QueueError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        Ok(state.promote(queue, now))
    }
}

/// `None` for an immediate release.
pub(crate) fn run_at_after(now: DateTime<Utc>, delay: Duration) -> Option<DateTime<Utc>> {
    if delay.is_zero() {
        return None;
    }
    let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
    Some(now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC))
}

/// Deadline of a reservation taken at `now`.
pub(crate) fn reserved_until(now: DateTime<Utc>, record: &JobRecord) -> DateTime<Utc> {
    run_at_after(now, record.reservation()).unwrap_or(now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{self, fixed_clock};

    fn store() -> (ListStore, crate::ports::FixedClock) {
        let clock = fixed_clock();
        (ListStore::with_clock(Arc::new(clock.clone())), clock)
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
    async fn reserved_jobs_are_tracked_until_settled() {
        let (store, clock) = store();
        let queue = QueueName::default();
        let job = test_support::record(&clock, "noop", &queue);
        store.push(job.clone()).await.unwrap();

        let popped = store.pop(&queue).await.unwrap().unwrap();
        assert_eq!(store.reserved_len().await, 1);

        store.delete(&queue, popped.id).await.unwrap();
        assert_eq!(store.reserved_len().await, 0);
    }

    #[tokio::test]
    async fn delayed_jobs_with_same_run_at_keep_push_order() {
        let (store, clock) = store();
        let queue = QueueName::default();
        let run_at = clock.now() + chrono::Duration::seconds(10);

        let mut ids = Vec::new();
        for _ in 0..3 {
            let mut job = test_support::record(&clock, "noop", &queue);
            job.run_at = Some(run_at);
            ids.push(store.push(job).await.unwrap());
        }

        clock.advance(Duration::from_secs(10));
        assert_eq!(store.promote(&queue).await.unwrap(), 3);
        for id in ids {
            assert_eq!(store.pop(&queue).await.unwrap().unwrap().id, id);
        }
    }

    #[tokio::test]
    async fn deleting_a_delayed_job_leaves_no_stale_entry() {
        let (store, clock) = store();
        let queue = QueueName::default();
        let mut job = test_support::record(&clock, "noop", &queue);
        job.run_at = Some(clock.now() + chrono::Duration::seconds(1));
        let id = store.push(job).await.unwrap();

        store.delete(&queue, id).await.unwrap();
        assert_eq!(store.delayed_size(&queue).await.unwrap(), 0);

        clock.advance(Duration::from_secs(2));
        assert!(store.pop(&queue).await.unwrap().is_none());
    }
}

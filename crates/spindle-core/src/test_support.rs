//! Shared fixtures and store contract checks for unit tests.
//!
//! 各 backend のテストはここの `check_*` を呼ぶだけにして、契約を 1 か所で定義する。

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::domain::{JobFailure, JobId, JobKind, JobRecord, Outcome, Payload, QueueName};
use crate::job::{Job, JobContext, TypedJob};
use crate::ports::{Clock, FixedClock, QueueStore};

pub fn fixed_clock() -> FixedClock {
    FixedClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap())
}

pub fn record(clock: &FixedClock, kind: &str, queue: &QueueName) -> JobRecord {
    let mut payload = Payload::new();
    payload.insert("n".into(), serde_json::json!(0));
    JobRecord::new(
        JobId::from_ulid(Ulid::new()),
        JobKind::new(kind),
        queue.clone(),
        payload,
        clock.now(),
    )
}

pub async fn check_fifo(store: &dyn QueueStore, clock: &FixedClock) {
    let queue = QueueName::default();
    let mut pushed = Vec::new();
    for _ in 0..5 {
        pushed.push(store.push(record(clock, "noop", &queue)).await.unwrap());
    }
    assert_eq!(store.size(&queue).await.unwrap(), 5);

    for id in pushed {
        let job = store.pop(&queue).await.unwrap().unwrap();
        assert_eq!(job.id, id);
        store.delete(&queue, job.id).await.unwrap();
    }
    assert!(store.pop(&queue).await.unwrap().is_none());
    assert_eq!(store.size(&queue).await.unwrap(), 0);
}

pub async fn check_pop_bumps_attempts(store: &dyn QueueStore, clock: &FixedClock) {
    let queue = QueueName::default();
    let id = store.push(record(clock, "noop", &queue)).await.unwrap();

    for expected in 1..=2 {
        let job = store.pop(&queue).await.unwrap().unwrap();
        assert_eq!(job.id, id);
        assert_eq!(job.attempts, expected);
        store
            .release(&queue, id, Duration::ZERO, Some(format!("fail {expected}")))
            .await
            .unwrap();
    }

    let job = store.pop(&queue).await.unwrap().unwrap();
    assert_eq!(job.attempts, 3);
    assert_eq!(job.last_error.as_deref(), Some("fail 2"));
}

pub async fn check_delayed_visibility(store: &dyn QueueStore, clock: &FixedClock) {
    let queue = QueueName::default();
    let mut job = record(clock, "noop", &queue);
    job.run_at = Some(clock.now() + chrono::Duration::seconds(5));
    let id = store.push(job).await.unwrap();

    assert!(store.pop(&queue).await.unwrap().is_none());
    assert_eq!(store.size(&queue).await.unwrap(), 0);
    assert_eq!(store.delayed_size(&queue).await.unwrap(), 1);

    clock.advance(Duration::from_secs(4));
    assert!(store.pop(&queue).await.unwrap().is_none());

    clock.advance(Duration::from_secs(2));
    assert_eq!(store.promote(&queue).await.unwrap(), 1);
    assert_eq!(store.size(&queue).await.unwrap(), 1);
    assert_eq!(store.delayed_size(&queue).await.unwrap(), 0);

    let popped = store.pop(&queue).await.unwrap().unwrap();
    assert_eq!(popped.id, id);
    assert!(popped.run_at.is_none());
}

pub async fn check_delete_idempotent(store: &dyn QueueStore, clock: &FixedClock) {
    let queue = QueueName::default();
    let keep = store.push(record(clock, "noop", &queue)).await.unwrap();
    let drop = store.push(record(clock, "noop", &queue)).await.unwrap();

    store.delete(&queue, drop).await.unwrap();
    store.delete(&queue, drop).await.unwrap();
    store
        .delete(&queue, JobId::from_ulid(Ulid::new()))
        .await
        .unwrap();

    assert_eq!(store.size(&queue).await.unwrap(), 1);
    assert_eq!(store.pop(&queue).await.unwrap().unwrap().id, keep);
}

pub async fn check_release(store: &dyn QueueStore, clock: &FixedClock) {
    let queue = QueueName::default();

    // 未 reserve の id は release できない
    let unknown = JobId::from_ulid(Ulid::new());
    let err = store
        .release(&queue, unknown, Duration::ZERO, None)
        .await
        .unwrap_err();
    assert!(matches!(err, crate::domain::QueueError::NotFound(id) if id == unknown));

    // delay 付き release は delayed set に入る
    let id = store.push(record(clock, "noop", &queue)).await.unwrap();
    let job = store.pop(&queue).await.unwrap().unwrap();
    store
        .release(&queue, job.id, Duration::from_secs(30), Some("later".into()))
        .await
        .unwrap();
    assert_eq!(store.size(&queue).await.unwrap(), 0);
    assert_eq!(store.delayed_size(&queue).await.unwrap(), 1);
    assert!(store.pop(&queue).await.unwrap().is_none());

    clock.advance(Duration::from_secs(30));
    let again = store.pop(&queue).await.unwrap().unwrap();
    assert_eq!(again.id, id);
    assert_eq!(again.attempts, 2);

    // 予算を使い切った job は release を拒否される
    store.release(&queue, id, Duration::ZERO, None).await.unwrap();
    let last = store.pop(&queue).await.unwrap().unwrap();
    assert_eq!(last.attempts, 3);
    let err = store
        .release(&queue, id, Duration::ZERO, None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        crate::domain::QueueError::RetriesExhausted { attempts: 3, .. }
    ));
    store.delete(&queue, id).await.unwrap();
    assert!(store.pop(&queue).await.unwrap().is_none());
}

pub async fn check_abandoned_reservation_returns(store: &dyn QueueStore, clock: &FixedClock) {
    let queue = QueueName::default();
    let mut job = record(clock, "noop", &queue);
    job.set_timeout(Duration::from_secs(10));
    let id = store.push(job).await.unwrap();

    let first = store.pop(&queue).await.unwrap().unwrap();
    assert_eq!(first.attempts, 1);

    // timeout + grace の間はまだ worker のもの
    clock.advance(Duration::from_secs(39));
    assert_eq!(store.promote(&queue).await.unwrap(), 0);
    assert!(store.pop(&queue).await.unwrap().is_none());

    clock.advance(Duration::from_secs(1));
    assert_eq!(store.promote(&queue).await.unwrap(), 1);
    assert_eq!(store.size(&queue).await.unwrap(), 1);

    let again = store.pop(&queue).await.unwrap().unwrap();
    assert_eq!(again.id, id);
    assert_eq!(again.attempts, 2);
    store.delete(&queue, id).await.unwrap();
    assert_eq!(store.promote(&queue).await.unwrap(), 0);
    assert!(store.pop(&queue).await.unwrap().is_none());
}

pub async fn check_queue_isolation(store: &dyn QueueStore, clock: &FixedClock) {
    let emails = QueueName::new("emails");
    let reports = QueueName::new("reports");
    let a = store.push(record(clock, "noop", &emails)).await.unwrap();
    let b = store.push(record(clock, "noop", &reports)).await.unwrap();

    assert_eq!(store.size(&emails).await.unwrap(), 1);
    assert_eq!(store.size(&reports).await.unwrap(), 1);
    assert_eq!(store.pop(&reports).await.unwrap().unwrap().id, b);
    assert_eq!(store.pop(&emails).await.unwrap().unwrap().id, a);
    assert!(store.pop(&QueueName::default()).await.unwrap().is_none());
}

/// Records which payload values were handled, in order.
#[derive(Clone, Default)]
pub struct Journal {
    pub handled: Arc<Mutex<Vec<String>>>,
    pub failed: Arc<Mutex<Vec<String>>>,
}

impl Journal {
    pub fn handled(&self) -> Vec<String> {
        self.handled.lock().unwrap().clone()
    }

    pub fn failed(&self) -> Vec<String> {
        self.failed.lock().unwrap().clone()
    }
}

/// Job whose behaviour is driven by its payload: `fail_times` retryable
/// failures, then success. `fail_times = u32::MAX` always fails.
pub struct ScriptedJob {
    pub label: String,
    pub fail_times: u32,
    pub journal: Journal,
    pub calls: Arc<AtomicU32>,
}

#[async_trait]
impl Job for ScriptedJob {
    async fn handle(&self, ctx: &JobContext) -> Outcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if ctx.attempt <= self.fail_times {
            return Outcome::retry(format!("{} failed on attempt {}", self.label, ctx.attempt));
        }
        self.journal.handled.lock().unwrap().push(self.label.clone());
        Outcome::Success
    }

    async fn failed(&self, _ctx: &JobContext, cause: &JobFailure) {
        self.journal.failed.lock().unwrap().push(cause.message.clone());
    }
}

/// Plain typed job used to exercise the registry and manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Greet {
    pub name: String,
}

#[async_trait]
impl Job for Greet {
    async fn handle(&self, _ctx: &JobContext) -> Outcome {
        if self.name.is_empty() {
            return Outcome::fail("empty name");
        }
        Outcome::Success
    }
}

impl TypedJob for Greet {
    const KIND: &'static str = "greet";
}

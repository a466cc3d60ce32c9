//! Redis-backed store (feature `redis`).
//!
//! queue ごとのキー:
//! - `{prefix}{queue}`           ready list（LPUSH で積み、RPOP で最古を取る）
//! - `{prefix}{queue}:delayed`   delayed zset（score = run_at の epoch ms）
//! - `{prefix}{queue}:jobs`      id -> record JSON
//! - `{prefix}{queue}:attempts`  id -> attempts（HINCRBY で原子的に増やす）
//! - `{prefix}{queue}:errors`    id -> last_error
//! - `{prefix}{queue}:reserved`  pop 済みの id の zset（score = 放棄とみなす epoch ms）
//! - `{prefix}{queue}:leases`    id -> reservation の長さ（ms）
//!
//! 状態遷移は Lua script 1 本ずつで行うので、複数プロセスから共有しても二重配送しない。
//! reservation の期限が切れた id は promote / pop が ready に戻す。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::{AsyncCommands, Client, Script};

use super::index_store::DEFAULT_PREFIX;
use super::list_store::run_at_after;
use crate::domain::{JobId, JobRecord, QueueError, QueueName, UNBOUNDED_RESERVATION};
use crate::ports::{Clock, QueueStore, SystemClock};

// KEYS: ready, delayed, reserved / ARGV: now_ms
const PROMOTE_LUA: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', ARGV[1])
for _, id in ipairs(due) do
    redis.call('ZREM', KEYS[2], id)
    redis.call('LPUSH', KEYS[1], id)
end
local expired = redis.call('ZRANGEBYSCORE', KEYS[3], '-inf', ARGV[1])
for _, id in ipairs(expired) do
    redis.call('ZREM', KEYS[3], id)
    redis.call('LPUSH', KEYS[1], id)
end
return #due + #expired
"#;

// KEYS: ready, delayed, jobs, attempts, errors, reserved, leases
// ARGV: now_ms, default lease ms
const POP_LUA: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', ARGV[1])
for _, id in ipairs(due) do
    redis.call('ZREM', KEYS[2], id)
    redis.call('LPUSH', KEYS[1], id)
end
local expired = redis.call('ZRANGEBYSCORE', KEYS[6], '-inf', ARGV[1])
for _, id in ipairs(expired) do
    redis.call('ZREM', KEYS[6], id)
    redis.call('LPUSH', KEYS[1], id)
end
while true do
    local id = redis.call('RPOP', KEYS[1])
    if not id then
        return nil
    end
    local raw = redis.call('HGET', KEYS[3], id)
    if raw then
        local attempts = redis.call('HINCRBY', KEYS[4], id, 1)
        local err = redis.call('HGET', KEYS[5], id)
        local lease = tonumber(redis.call('HGET', KEYS[7], id) or ARGV[2])
        redis.call('ZADD', KEYS[6], tonumber(ARGV[1]) + lease, id)
        return {raw, attempts, err}
    end
end
"#;

// KEYS: ready, delayed, errors, reserved / ARGV: id, run_at_ms (0 = now), error
const RELEASE_LUA: &str = r#"
if redis.call('ZREM', KEYS[4], ARGV[1]) == 0 then
    return 0
end
if ARGV[3] ~= '' then
    redis.call('HSET', KEYS[3], ARGV[1], ARGV[3])
end
if ARGV[2] == '0' then
    redis.call('LPUSH', KEYS[1], ARGV[1])
else
    redis.call('ZADD', KEYS[2], ARGV[2], ARGV[1])
end
return 1
"#;

// KEYS: ready, delayed, jobs, attempts, errors, reserved, leases / ARGV: id
const DELETE_LUA: &str = r#"
redis.call('LREM', KEYS[1], 0, ARGV[1])
redis.call('ZREM', KEYS[2], ARGV[1])
redis.call('HDEL', KEYS[3], ARGV[1])
redis.call('HDEL', KEYS[4], ARGV[1])
redis.call('HDEL', KEYS[5], ARGV[1])
redis.call('ZREM', KEYS[6], ARGV[1])
redis.call('HDEL', KEYS[7], ARGV[1])
return 1
"#;

struct QueueKeys {
    ready: String,
    delayed: String,
    jobs: String,
    attempts: String,
    errors: String,
    reserved: String,
    leases: String,
}

#[derive(Clone)]
pub struct RedisStore {
    client: Client,
    prefix: String,
    clock: Arc<dyn Clock>,
    promote_script: Script,
    pop_script: Script,
    release_script: Script,
    delete_script: Script,
}

fn unavailable(e: redis::RedisError) -> QueueError {
    QueueError::Unavailable(e.to_string())
}

fn millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn lease_ms(lease: Duration) -> u64 {
    u64::try_from(lease.as_millis()).unwrap_or(u64::MAX)
}

impl RedisStore {
    pub fn new(url: &str) -> Result<Self, QueueError> {
        Self::with_clock(url, Arc::new(SystemClock))
    }

    pub fn with_clock(url: &str, clock: Arc<dyn Clock>) -> Result<Self, QueueError> {
        let client = Client::open(url).map_err(unavailable)?;
        Ok(Self {
            client,
            prefix: DEFAULT_PREFIX.to_string(),
            clock,
            promote_script: Script::new(PROMOTE_LUA),
            pop_script: Script::new(POP_LUA),
            release_script: Script::new(RELEASE_LUA),
            delete_script: Script::new(DELETE_LUA),
        })
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    fn keys(&self, queue: &QueueName) -> QueueKeys {
        let base = format!("{}{}", self.prefix, queue);
        QueueKeys {
            delayed: format!("{base}:delayed"),
            jobs: format!("{base}:jobs"),
            attempts: format!("{base}:attempts"),
            errors: format!("{base}:errors"),
            reserved: format!("{base}:reserved"),
            leases: format!("{base}:leases"),
            ready: base,
        }
    }

    async fn connection(&self) -> Result<redis::aio::Connection, QueueError> {
        self.client.get_async_connection().await.map_err(unavailable)
    }
}

#[async_trait]
impl QueueStore for RedisStore {
    async fn push(&self, job: JobRecord) -> Result<JobId, QueueError> {
        let mut conn = self.connection().await?;
        let keys = self.keys(&job.queue);
        let id = job.id.to_string();
        let now = self.clock.now();

        let mut pipe = redis::pipe();
        pipe.atomic()
            .hset(&keys.jobs, &id, job.to_json()?)
            .ignore()
            .hset(&keys.attempts, &id, job.attempts)
            .ignore()
            .hset(&keys.leases, &id, lease_ms(job.reservation()))
            .ignore();
        if let Some(err) = &job.last_error {
            pipe.hset(&keys.errors, &id, err).ignore();
        }
        match job.run_at {
            Some(run_at) if run_at > now => {
                pipe.zadd(&keys.delayed, &id, millis(run_at)).ignore();
            }
            _ => {
                pipe.lpush(&keys.ready, &id).ignore();
            }
        }
        pipe.query_async::<_, ()>(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(job.id)
    }

    async fn pop(&self, queue: &QueueName) -> Result<Option<JobRecord>, QueueError> {
        let mut conn = self.connection().await?;
        let keys = self.keys(queue);

        let mut invocation = self.pop_script.prepare_invoke();
        invocation
            .key(&keys.ready)
            .key(&keys.delayed)
            .key(&keys.jobs)
            .key(&keys.attempts)
            .key(&keys.errors)
            .key(&keys.reserved)
            .key(&keys.leases)
            .arg(millis(self.clock.now()))
            .arg(lease_ms(UNBOUNDED_RESERVATION));
        let popped: Option<(String, u32, Option<String>)> = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;

        let Some((raw, attempts, last_error)) = popped else {
            return Ok(None);
        };
        let mut record = JobRecord::from_json(&raw)?;
        record.attempts = attempts;
        record.run_at = None;
        if last_error.is_some() {
            record.last_error = last_error;
        }
        Ok(Some(record))
    }

    async fn delete(&self, queue: &QueueName, id: JobId) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        let keys = self.keys(queue);

        let mut invocation = self.delete_script.prepare_invoke();
        invocation
            .key(&keys.ready)
            .key(&keys.delayed)
            .key(&keys.jobs)
            .key(&keys.attempts)
            .key(&keys.errors)
            .key(&keys.reserved)
            .key(&keys.leases)
            .arg(id.to_string());
        invocation
            .invoke_async::<_, i64>(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn release(
        &self,
        queue: &QueueName,
        id: JobId,
        delay: Duration,
        error: Option<String>,
    ) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        let keys = self.keys(queue);
        let field = id.to_string();

        let reserved: Option<f64> = conn
            .zscore(&keys.reserved, &field)
            .await
            .map_err(unavailable)?;
        let raw: Option<String> = conn.hget(&keys.jobs, &field).await.map_err(unavailable)?;
        let (Some(_), Some(raw)) = (reserved, raw) else {
            return Err(QueueError::NotFound(id));
        };
        let attempts: u32 = conn
            .hget(&keys.attempts, &field)
            .await
            .map_err(unavailable)?;

        let mut record = JobRecord::from_json(&raw)?;
        record.attempts = attempts;
        let run_at = run_at_after(self.clock.now(), delay);
        record.prepare_release(run_at, error.clone())?;

        let mut invocation = self.release_script.prepare_invoke();
        invocation
            .key(&keys.ready)
            .key(&keys.delayed)
            .key(&keys.errors)
            .key(&keys.reserved)
            .arg(&field)
            .arg(run_at.map_or(0, millis))
            .arg(error.unwrap_or_default());
        let released: i64 = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;
        if released == 0 {
            return Err(QueueError::NotFound(id));
        }
        Ok(())
    }

    async fn size(&self, queue: &QueueName) -> Result<usize, QueueError> {
        let mut conn = self.connection().await?;
        conn.llen(self.keys(queue).ready).await.map_err(unavailable)
    }

    async fn delayed_size(&self, queue: &QueueName) -> Result<usize, QueueError> {
        let mut conn = self.connection().await?;
        conn.zcard(self.keys(queue).delayed)
            .await
            .map_err(unavailable)
    }

    async fn promote(&self, queue: &QueueName) -> Result<usize, QueueError> {
        let mut conn = self.connection().await?;
        let keys = self.keys(queue);

        let mut invocation = self.promote_script.prepare_invoke();
        invocation
            .key(&keys.ready)
            .key(&keys.delayed)
            .key(&keys.reserved)
            .arg(millis(self.clock.now()));
        invocation.invoke_async(&mut conn).await.map_err(unavailable)
    }
}

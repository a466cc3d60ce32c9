//! spindle-core
//!
//! Deferred job queue: producers enqueue jobs, workers pop and run them,
//! failed attempts are released for retry until the job's budget runs out.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, kind, record, outcome, retry, errors）
//! - **ports**: 抽象化レイヤー（QueueStore, KeyValueStore, Clock, IdGenerator, MemoryProbe）
//! - **job**: Job trait, TypedJob, JobRegistry
//! - **impls**: store 実装（ListStore, IndexStore + MemoryKv / FileKv, RedisStore）
//! - **app**: JobManager, ManagerBuilder, Worker
//! - **config**: 設定の形とデフォルト値

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod job;
pub mod ports;

#[cfg(test)]
mod test_support;

pub use app::{
    BuildError, EnqueueOptions, JobManager, ManagerBuilder, Polled, StopHandle, StopReason, Worker,
    WorkerOptions, WorkerState,
};
pub use domain::{JobFailure, JobId, JobKind, JobRecord, Outcome, QueueError, QueueName, RetryPolicy};
pub use job::{Job, JobContext, JobRegistry, RegistryError, TypedJob};

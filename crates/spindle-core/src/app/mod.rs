//! App - アプリケーション層
//!
//! ports を組み合わせて queue の producer / consumer を実装する。
//!
//! # 主要コンポーネント
//! - **ManagerBuilder**: JobManager の構築と起動時検証
//! - **JobManager**: enqueue / pop / resolve / delete / release
//! - **Worker**: polling loop（pop→resolve→handle→delete/release）

pub mod builder;
pub mod manager;
pub mod worker_loop;

pub use self::builder::{BuildError, ManagerBuilder};
pub use self::manager::{EnqueueOptions, JobManager};
pub use self::worker_loop::{Polled, StopHandle, StopReason, Worker, WorkerOptions, WorkerState};

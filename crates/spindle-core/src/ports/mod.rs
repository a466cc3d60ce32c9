//! Ports - 抽象化レイヤー
//!
//! queue が外部に依存する部分（時刻、ID、storage、メモリ計測）を trait にしておき、
//! backend を設定で差し替えられるようにする。

pub mod clock;
pub mod id_generator;
pub mod kv;
pub mod memory_probe;
pub mod store;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::kv::{KeyValueStore, KvLock};
pub use self::memory_probe::{FixedMemoryProbe, MemoryProbe, ProcMemoryProbe};
pub use self::store::QueueStore;

//! MemoryProbe port - resident memory of the worker process.
//!
//! worker は 1 job 実行するごとにこれを見て、上限を超えていたら止まる。

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

pub trait MemoryProbe: Send + Sync {
    /// Resident set size in bytes, `None` when the platform cannot tell.
    fn resident_bytes(&self) -> Option<u64>;
}

/// Reads `VmRSS` from `/proc/self/status` (Linux).
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcMemoryProbe;

impl MemoryProbe for ProcMemoryProbe {
    fn resident_bytes(&self) -> Option<u64> {
        let status = std::fs::read_to_string("/proc/self/status").ok()?;
        parse_vm_rss(&status)
    }
}

/// `VmRSS:    12345 kB` の行を bytes にする
fn parse_vm_rss(status: &str) -> Option<u64> {
    let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
    let mut parts = line["VmRSS:".len()..].split_whitespace();
    let value: u64 = parts.next()?.parse().ok()?;
    let multiplier = match parts.next() {
        Some("kB") | None => 1024,
        Some("mB") | Some("MB") => 1024 * 1024,
        Some(_) => return None,
    };
    Some(value * multiplier)
}

/// Probe reporting whatever value it is given. Clones share the value.
#[derive(Debug, Clone, Default)]
pub struct FixedMemoryProbe {
    bytes: Arc<AtomicU64>,
}

impl FixedMemoryProbe {
    pub fn new(bytes: u64) -> Self {
        Self {
            bytes: Arc::new(AtomicU64::new(bytes)),
        }
    }

    pub fn set(&self, bytes: u64) {
        self.bytes.store(bytes, Ordering::Relaxed);
    }
}

impl MemoryProbe for FixedMemoryProbe {
    fn resident_bytes(&self) -> Option<u64> {
        Some(self.bytes.load(Ordering::Relaxed))
    }
}

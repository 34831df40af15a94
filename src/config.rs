//! Worker sizing and operational configuration.
//!
//! Hardcoded values that are not shared protocol constants live here next to
//! the runtime-tunable [`WorkerConfig`]. Protocol constants live in `constants`.

use std::time::Duration;

/// Upper bound on routing workers. Worker ids are stored in thread-locals and
/// epoll tokens as `usize`, the bound only guards against misconfiguration.
pub const MAX_WORKERS: usize = 128;

/// Per-worker mailbox ring size (disruptor capacity, power of two).
pub const MAILBOX_SIZE: usize = 4096;

/// Maximum events returned by one `epoll_wait` call.
pub const MAX_EVENTS: usize = 1000;

/// Loop heartbeat. `epoll_wait` never blocks longer than this so that
/// timeouts, delayed calls and tick functions keep running on an idle worker.
pub const HEARTBEAT: Duration = Duration::from_millis(100);

/// Heartbeats between two `process_timeouts` passes (one second).
pub const TIMEOUT_CHECK_TICKS: u64 = 10;

/// Bytes requested per `recv` call.
pub const READ_CHUNK: usize = 16384;

/// Initial descriptor arena capacity per worker.
pub const SLAB_CAPACITY: usize = 4096;

/// Interval between `try_shutdown` attempts once shutdown has started.
pub const SHUTDOWN_RETRY: Duration = Duration::from_millis(100);

const _: () = assert!(
    MAILBOX_SIZE.is_power_of_two(),
    "disruptor capacity must be a power of two"
);
const _: () = assert!(MAX_EVENTS > 0 && MAX_EVENTS <= i32::MAX as usize);
const _: () = assert!(
    SLAB_CAPACITY <= u32::MAX as usize,
    "descriptor keys are packed into the low 32 bits of an epoll token"
);

/// Runtime knobs for the routing workers.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Number of routing workers.
    pub threads: usize,
    /// Load difference (percentage points) between the busiest and the idlest
    /// worker that triggers a rebalance. Zero disables balancing.
    pub rebalance_threshold: u8,
    /// How often the main worker checks the load balance. Zero disables it.
    pub rebalance_period: Duration,
    /// Number of one-second load samples averaged when balancing.
    pub rebalance_window: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            threads: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
                .min(MAX_WORKERS),
            rebalance_threshold: 20,
            rebalance_period: Duration::ZERO,
            rebalance_window: 10,
        }
    }
}

impl WorkerConfig {
    pub fn with_threads(threads: usize) -> Self {
        Self {
            threads,
            ..Self::default()
        }
    }
}

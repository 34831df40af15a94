//! Per-worker statistics and load tracking.
//!
//! Counters are plain fields owned by the worker thread; they are read through
//! `WorkerRegistry::statistics`, which runs on every worker in turn. Load
//! percentages are additionally published into the worker handle so the
//! balancer can read them without messaging.

use std::time::{Duration, Instant};

#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct WorkerStatistics {
    pub n_read: u64,
    pub n_write: u64,
    pub n_error: u64,
    pub n_hup: u64,
    pub n_accept: u64,
    /// `epoll_wait` calls.
    pub n_polls: u64,
    /// `epoll_wait` calls that returned events.
    pub n_pollev: u64,
    /// Average events per non-empty poll.
    pub evq_avg: f64,
    pub evq_max: u64,
    pub n_current_descriptors: u64,
    pub n_total_descriptors: u64,
    pub n_sessions: u64,
    pub n_pooled: u64,
    pub load_1s: u8,
    pub load_1m: u8,
    pub load_1h: u8,
}

impl WorkerStatistics {
    pub(crate) fn record_poll(&mut self, n_events: usize) {
        self.n_polls += 1;
        if n_events > 0 {
            let n = n_events as u64;
            let total = self.evq_avg * self.n_pollev as f64 + n as f64;
            self.n_pollev += 1;
            self.evq_avg = total / self.n_pollev as f64;
            self.evq_max = self.evq_max.max(n);
        }
    }
}

/// Sum counters, average loads and queue lengths, keep maxima.
pub fn aggregate(stats: &[WorkerStatistics]) -> WorkerStatistics {
    let mut total = WorkerStatistics::default();
    if stats.is_empty() {
        return total;
    }
    let mut evq_sum = 0.0;
    let (mut l1s, mut l1m, mut l1h) = (0u64, 0u64, 0u64);
    for s in stats {
        total.n_read += s.n_read;
        total.n_write += s.n_write;
        total.n_error += s.n_error;
        total.n_hup += s.n_hup;
        total.n_accept += s.n_accept;
        total.n_polls += s.n_polls;
        total.n_pollev += s.n_pollev;
        total.n_current_descriptors += s.n_current_descriptors;
        total.n_total_descriptors += s.n_total_descriptors;
        total.n_sessions += s.n_sessions;
        total.n_pooled += s.n_pooled;
        total.evq_max = total.evq_max.max(s.evq_max);
        evq_sum += s.evq_avg;
        l1s += u64::from(s.load_1s);
        l1m += u64::from(s.load_1m);
        l1h += u64::from(s.load_1h);
    }
    let n = stats.len() as u64;
    total.evq_avg = evq_sum / n as f64;
    total.load_1s = (l1s / n) as u8;
    total.load_1m = (l1m / n) as u8;
    total.load_1h = (l1h / n) as u8;
    total
}

const SAMPLES: usize = 60;

/// Fixed ring of percentage samples.
#[derive(Debug, Clone)]
struct Samples {
    values: [u8; SAMPLES],
    len: usize,
    next: usize,
}

impl Samples {
    fn new() -> Self {
        Self {
            values: [0; SAMPLES],
            len: 0,
            next: 0,
        }
    }

    fn push(&mut self, value: u8) -> bool {
        self.values[self.next] = value;
        self.next = (self.next + 1) % SAMPLES;
        self.len = (self.len + 1).min(SAMPLES);
        self.next == 0
    }

    /// Average of the most recent `n` samples.
    fn recent(&self, n: usize) -> u8 {
        let n = n.min(self.len);
        if n == 0 {
            return 0;
        }
        let sum: u32 = (1..=n)
            .map(|back| u32::from(self.values[(self.next + SAMPLES - back) % SAMPLES]))
            .sum();
        (sum / n as u32) as u8
    }

    fn average(&self) -> u8 {
        self.recent(self.len)
    }
}

/// Busy-time accounting around `epoll_wait`.
///
/// Load is the share of a one-second period not spent waiting. Seconds roll
/// into a minute ring, full minutes into an hour ring.
#[derive(Debug, Clone)]
pub struct WorkerLoad {
    period_start: Instant,
    wait_start: Option<Instant>,
    waited: Duration,
    last_second: u8,
    seconds: Samples,
    minutes: Samples,
}

impl WorkerLoad {
    pub fn new(now: Instant) -> Self {
        Self {
            period_start: now,
            wait_start: None,
            waited: Duration::ZERO,
            last_second: 0,
            seconds: Samples::new(),
            minutes: Samples::new(),
        }
    }

    pub fn about_to_wait(&mut self, now: Instant) {
        self.wait_start = Some(now);
    }

    /// Returns true when a one-second period completed.
    pub fn about_to_work(&mut self, now: Instant) -> bool {
        if let Some(start) = self.wait_start.take() {
            self.waited += now.saturating_duration_since(start);
        }
        let elapsed = now.saturating_duration_since(self.period_start);
        if elapsed < Duration::from_secs(1) {
            return false;
        }
        let waited = self.waited.min(elapsed);
        let busy = elapsed - waited;
        self.last_second = ((busy.as_micros() * 100) / elapsed.as_micros().max(1)) as u8;
        if self.seconds.push(self.last_second) {
            self.minutes.push(self.seconds.average());
        }
        self.period_start = now;
        self.waited = Duration::ZERO;
        true
    }

    pub fn one_second(&self) -> u8 {
        self.last_second
    }

    pub fn one_minute(&self) -> u8 {
        self.seconds.average()
    }

    pub fn one_hour(&self) -> u8 {
        if self.minutes.len == 0 {
            self.seconds.average()
        } else {
            self.minutes.average()
        }
    }

    /// Average over the last `window` seconds.
    pub fn window(&self, window: usize) -> u8 {
        self.seconds.recent(window.max(1))
    }
}

#[cfg(feature = "metrics")]
mod imp {
    use std::sync::Weak;
    use std::time::Duration;

    use crate::registry::WorkerRegistry;

    /// Log aggregated worker statistics every ten seconds until the registry
    /// is dropped.
    pub fn spawn_reporter(registry: Weak<WorkerRegistry>) {
        const INTERVAL_SECS: u64 = 10;
        let spawned = std::thread::Builder::new()
            .name("metrics".into())
            .spawn(move || {
                let mut last = super::WorkerStatistics::default();
                loop {
                    std::thread::sleep(Duration::from_secs(INTERVAL_SECS));
                    let Some(registry) = registry.upgrade() else {
                        return;
                    };
                    let Ok(stats) = registry.statistics() else {
                        continue;
                    };
                    let snap = super::aggregate(&stats);
                    tracing::info!(
                        interval_secs = INTERVAL_SECS,
                        reads = snap.n_read.saturating_sub(last.n_read),
                        writes = snap.n_write.saturating_sub(last.n_write),
                        errors = snap.n_error.saturating_sub(last.n_error),
                        hangups = snap.n_hup.saturating_sub(last.n_hup),
                        accepts = snap.n_accept.saturating_sub(last.n_accept),
                        sessions = snap.n_sessions,
                        pooled = snap.n_pooled,
                        descriptors = snap.n_current_descriptors,
                        evq_avg = snap.evq_avg,
                        evq_max = snap.evq_max,
                        load_1s = snap.load_1s,
                        load_1m = snap.load_1m,
                        load_1h = snap.load_1h,
                        "worker statistics"
                    );
                    last = snap;
                }
            });
        if let Err(e) = spawned {
            tracing::warn!("could not start metrics reporter: {e}");
        }
    }
}

#[cfg(not(feature = "metrics"))]
mod imp {
    use std::sync::Weak;

    use crate::registry::WorkerRegistry;

    pub fn spawn_reporter(_registry: Weak<WorkerRegistry>) {}
}

pub use imp::*;

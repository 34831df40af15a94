//! Process-wide bookkeeping for the routing workers: creation, start and
//! join, the mailboxes used to hand work to a worker, fan-out of tasks to all
//! workers, statistics collection, load balancing and coordinated shutdown.

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::JoinHandle;

use disruptor::{
    BusySpin, EventPoller, MultiProducer, MultiProducerBarrier, Producer, RingBufferFull,
    SingleConsumerBarrier, build_multi_producer,
};
use tracing::{debug, error, info};

use crate::config::{HEARTBEAT, MAILBOX_SIZE, MAX_WORKERS, WorkerConfig};
use crate::dcb::Dcb;
use crate::error::{Error, Result};
use crate::listener::{Listener, SharedListeners};
use crate::metrics::{self, WorkerStatistics};
use crate::poll::EventFd;
use crate::session::{Session, SessionId};
use crate::worker::RoutingWorker;

/// Worker id that resolves to the main worker (worker 0).
pub const MAIN: usize = usize::MAX;

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// (registry instance, worker id) of the worker running on this thread.
    static CURRENT: Cell<Option<(u64, usize)>> = const { Cell::new(None) };
}

pub(crate) fn set_current(instance: u64, id: usize) {
    CURRENT.with(|c| c.set(Some((instance, id))));
}

pub(crate) fn clear_current() {
    CURRENT.with(|c| c.set(None));
}

fn current() -> Option<(u64, usize)> {
    CURRENT.with(|c| c.get())
}

pub type Task = Box<dyn FnOnce(&mut RoutingWorker) + Send>;

/// A session and all of its descriptors on their way to another worker.
pub struct MovedSession {
    pub(crate) session: Box<dyn Session>,
    pub(crate) client: Dcb,
    pub(crate) backends: Vec<Dcb>,
    pub(crate) io_activity: u64,
}

impl MovedSession {
    pub fn id(&self) -> SessionId {
        self.session.id()
    }
}

pub enum Message {
    Task(Task),
    Adopt(Box<MovedSession>),
    Shutdown,
}

/// Mailbox ring slot. The ring hands out shared references to consumers, the
/// mutex lets the consumer move the message out.
pub struct Mail {
    message: Mutex<Option<Message>>,
}

impl Mail {
    fn factory() -> Self {
        Self {
            message: Mutex::new(None),
        }
    }

    pub(crate) fn take(&self) -> Option<Message> {
        self.message
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

type MailProducer = MultiProducer<Mail, SingleConsumerBarrier>;
pub(crate) type MailPoller = EventPoller<Mail, MultiProducerBarrier>;

pub(crate) fn build_mailbox() -> (MailPoller, MailProducer) {
    let builder = build_multi_producer(MAILBOX_SIZE, Mail::factory, BusySpin);
    let (poller, builder) = builder.event_poller();
    (poller, builder.build())
}

/// The part of a worker other threads may touch.
pub struct WorkerHandle {
    id: usize,
    registry: u64,
    producer: Mutex<MailProducer>,
    pub(crate) doorbell: EventFd,
    load_1s: AtomicU8,
    load_1m: AtomicU8,
    load_1h: AtomicU8,
    load_window: AtomicU8,
    running: AtomicBool,
}

impl WorkerHandle {
    pub(crate) fn new(id: usize, registry: u64, producer: MailProducer, doorbell: EventFd) -> Self {
        Self {
            id,
            registry,
            producer: Mutex::new(producer),
            doorbell,
            load_1s: AtomicU8::new(0),
            load_1m: AtomicU8::new(0),
            load_1h: AtomicU8::new(0),
            load_window: AtomicU8::new(0),
            running: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub(crate) fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Release);
    }

    /// Post a message and ring the doorbell. A full mailbox hands the message
    /// back.
    pub fn try_post(&self, message: Message) -> std::result::Result<(), Message> {
        let mut message = Some(message);
        {
            let mut producer = self.producer.lock().unwrap_or_else(PoisonError::into_inner);
            match producer.try_publish(|slot| {
                *slot.message.get_mut().unwrap_or_else(PoisonError::into_inner) = message.take();
            }) {
                Ok(_) => {}
                Err(RingBufferFull) => {}
            }
        }
        match message {
            None => {
                self.doorbell.signal();
                Ok(())
            }
            Some(message) => Err(message),
        }
    }

    pub fn post(&self, message: Message) -> Result<()> {
        self.try_post(message).map_err(|_| Error::MailboxFull(self.id))
    }

    /// Run `task` on the worker's thread at its next wakeup.
    pub fn execute(&self, task: impl FnOnce(&mut RoutingWorker) + Send + 'static) -> Result<()> {
        self.post(Message::Task(Box::new(task)))
    }

    pub(crate) fn publish_load(&self, one_second: u8, one_minute: u8, one_hour: u8, window: u8) {
        self.load_1s.store(one_second, Ordering::Relaxed);
        self.load_1m.store(one_minute, Ordering::Relaxed);
        self.load_1h.store(one_hour, Ordering::Relaxed);
        self.load_window.store(window, Ordering::Relaxed);
    }

    pub fn load_1s(&self) -> u8 {
        self.load_1s.load(Ordering::Relaxed)
    }

    pub fn load_1m(&self) -> u8 {
        self.load_1m.load(Ordering::Relaxed)
    }

    pub fn load_1h(&self) -> u8 {
        self.load_1h.load(Ordering::Relaxed)
    }

    /// Load averaged over the configured rebalance window.
    pub fn load_window(&self) -> u8 {
        self.load_window.load(Ordering::Relaxed)
    }

    pub(crate) fn registry(&self) -> u64 {
        self.registry
    }
}

/// Counting semaphore for the synchronous fan-out operations.
#[derive(Debug, Default)]
pub struct Semaphore {
    count: Mutex<usize>,
    cond: Condvar,
}

impl Semaphore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn post(&self) {
        let mut count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        *count += 1;
        self.cond.notify_one();
    }

    pub fn wait(&self) {
        self.wait_n(1);
    }

    /// Wait for one post for as long as `alive` holds. Returns false if it
    /// stopped holding before a post arrived.
    pub fn wait_while(&self, alive: impl Fn() -> bool) -> bool {
        let mut count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if *count > 0 {
                *count -= 1;
                return true;
            }
            if !alive() {
                return false;
            }
            count = self
                .cond
                .wait_timeout(count, HEARTBEAT)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    pub fn wait_n(&self, n: usize) {
        let mut count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        for _ in 0..n {
            while *count == 0 {
                count = self.cond.wait(count).unwrap_or_else(PoisonError::into_inner);
            }
            *count -= 1;
        }
    }
}

pub type SharedTask = Arc<dyn Fn(&mut RoutingWorker) + Send + Sync>;

pub struct WorkerRegistry {
    instance: u64,
    config: WorkerConfig,
    shared: Arc<SharedListeners>,
    handles: Vec<Arc<WorkerHandle>>,
    pending: Mutex<Vec<RoutingWorker>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl WorkerRegistry {
    /// Create the shared listener set and `config.threads` workers. Nothing
    /// runs until [`start`](Self::start).
    pub fn init(config: WorkerConfig) -> Result<Arc<Self>> {
        if config.threads == 0 || config.threads > MAX_WORKERS {
            return Err(Error::WorkerCount(config.threads));
        }
        let instance = NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed);
        let shared = Arc::new(SharedListeners::new().map_err(Error::Epoll)?);
        let mut workers = Vec::with_capacity(config.threads);
        let mut handles = Vec::with_capacity(config.threads);
        for id in 0..config.threads {
            // Workers created so far are dropped, closing their descriptors.
            let (worker, handle) = RoutingWorker::new(id, &config, Some(Arc::clone(&shared)), instance)?;
            workers.push(worker);
            handles.push(handle);
        }
        info!(workers = config.threads, "routing workers initialized");
        Ok(Arc::new(Self {
            instance,
            config,
            shared,
            handles,
            pending: Mutex::new(workers),
            threads: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }))
    }

    /// Spawn one thread per worker. The first failure is returned and the
    /// registry is unusable afterwards.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(Error::AlreadyStarted);
        }
        let workers = std::mem::take(&mut *self.pending.lock().unwrap_or_else(PoisonError::into_inner));
        let mut threads = self.threads.lock().unwrap_or_else(PoisonError::into_inner);
        for mut worker in workers {
            let id = worker.id();
            worker.set_registry(Arc::downgrade(self));
            self.handles[id].set_running(true);
            let spawned = std::thread::Builder::new()
                .name(format!("rworker-{id}"))
                .spawn(move || worker.run());
            match spawned {
                Ok(thread) => threads.push(thread),
                Err(source) => {
                    self.handles[id].set_running(false);
                    error!(worker = id, "could not start routing worker: {source}");
                    return Err(Error::WorkerStart { id, source });
                }
            }
        }
        drop(threads);

        if !self.config.rebalance_period.is_zero() && self.config.rebalance_threshold > 0 {
            let registry = Arc::downgrade(self);
            let period = self.config.rebalance_period;
            self.handles[0].execute(move |worker| {
                worker.delayed_call(period, move |_| match registry.upgrade() {
                    Some(registry) => {
                        registry.balance_workers();
                        true
                    }
                    None => false,
                });
            })?;
        }
        Ok(())
    }

    /// Wait for every worker thread to exit.
    pub fn join(&self) {
        let threads = std::mem::take(&mut *self.threads.lock().unwrap_or_else(PoisonError::into_inner));
        for thread in threads {
            let name = thread.thread().name().map(str::to_owned);
            if thread.join().is_err() {
                error!(thread = name.as_deref().unwrap_or("?"), "routing worker panicked");
            }
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn worker_count(&self) -> usize {
        self.handles.len()
    }

    /// Handle of worker `id`, or of worker 0 for [`MAIN`].
    pub fn get(&self, id: usize) -> Option<&Arc<WorkerHandle>> {
        if id == MAIN {
            self.handles.first()
        } else {
            self.handles.get(id)
        }
    }

    /// Handle of the worker running on the calling thread.
    pub fn current(&self) -> Option<&Arc<WorkerHandle>> {
        match current() {
            Some((instance, id)) if instance == self.instance => self.handles.get(id),
            _ => None,
        }
    }

    pub fn handles(&self) -> &[Arc<WorkerHandle>] {
        &self.handles
    }

    /// Register a listener on the shared epoll set.
    pub fn add_listener(&self, listener: Listener) -> Result<usize> {
        let name = listener.name().to_string();
        let key = self.shared.add(listener)?;
        debug!(listener = %name, key, "listener added to shared epoll set");
        Ok(key)
    }

    pub fn remove_listener(&self, key: usize) -> bool {
        self.shared.remove(key)
    }

    fn check_not_worker(&self) -> Result<()> {
        match current() {
            Some((instance, id)) if instance == self.instance => Err(Error::CalledFromWorker(id)),
            _ => Ok(()),
        }
    }

    fn check_started(&self) -> Result<()> {
        if self.started.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(Error::NotStarted)
        }
    }

    /// Post `task` to every running worker without waiting. Returns the
    /// number of workers it was posted to.
    pub fn broadcast(&self, task: SharedTask) -> usize {
        let mut posted = 0;
        for handle in self.handles.iter().filter(|h| h.is_running()) {
            let task = Arc::clone(&task);
            match handle.execute(move |worker| task(worker)) {
                Ok(()) => posted += 1,
                Err(e) => error!(worker = handle.id(), "broadcast failed: {e}"),
            }
        }
        posted
    }

    /// Run `task` on each worker in turn, waiting for it to finish before
    /// posting to the next. Returns the number of workers that ran it; a
    /// worker that stops before reaching the task is skipped.
    pub fn execute_serially(&self, task: impl Fn(&mut RoutingWorker) + Send + Sync + 'static) -> Result<usize> {
        self.check_not_worker()?;
        self.check_started()?;
        let task: SharedTask = Arc::new(task);
        let sem = Arc::new(Semaphore::new());
        let mut executed = 0;
        for handle in self.handles.iter().filter(|h| h.is_running()) {
            let task = Arc::clone(&task);
            let done = Arc::clone(&sem);
            handle.execute(move |worker| {
                task(worker);
                done.post();
            })?;
            if sem.wait_while(|| handle.is_running()) {
                executed += 1;
            } else {
                debug!(worker = handle.id(), "worker stopped before running task");
            }
        }
        Ok(executed)
    }

    /// Run `task` on every worker at once and wait for all of them. Returns
    /// the number of workers that ran it.
    pub fn execute_concurrently(
        &self,
        task: impl Fn(&mut RoutingWorker) + Send + Sync + 'static,
    ) -> Result<usize> {
        self.check_not_worker()?;
        self.check_started()?;
        let task: SharedTask = Arc::new(task);
        let mut waiting = Vec::new();
        let mut failure = None;
        for handle in self.handles.iter().filter(|h| h.is_running()) {
            let task = Arc::clone(&task);
            let sem = Arc::new(Semaphore::new());
            let done = Arc::clone(&sem);
            match handle.execute(move |worker| {
                task(worker);
                done.post();
            }) {
                Ok(()) => waiting.push((handle, sem)),
                Err(e) => failure = Some(e),
            }
        }
        let executed = waiting
            .iter()
            .filter(|(handle, sem)| sem.wait_while(|| handle.is_running()))
            .count();
        match failure {
            Some(e) => Err(e),
            None => Ok(executed),
        }
    }

    /// Snapshot of every worker's statistics, indexed by worker id.
    pub fn statistics(&self) -> Result<Vec<WorkerStatistics>> {
        let collected = Arc::new(Mutex::new(vec![WorkerStatistics::default(); self.handles.len()]));
        let sink = Arc::clone(&collected);
        self.execute_serially(move |worker| {
            let mut stats = sink.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(slot) = stats.get_mut(worker.id()) {
                *slot = worker.statistics();
            }
        })?;
        let stats = collected.lock().unwrap_or_else(PoisonError::into_inner).clone();
        Ok(stats)
    }

    pub fn aggregate_statistics(&self) -> Result<WorkerStatistics> {
        Ok(metrics::aggregate(&self.statistics()?))
    }

    /// Window load of every worker, read without messaging.
    pub fn collect_worker_load(&self) -> Vec<u8> {
        self.handles.iter().map(|h| h.load_window()).collect()
    }

    /// Ask the busiest worker to move a session to the idlest one if their
    /// load differs by more than the configured threshold.
    pub fn balance_workers(&self) -> bool {
        self.balance_workers_with(self.config.rebalance_threshold)
    }

    pub fn balance_workers_with(&self, threshold: u8) -> bool {
        if threshold == 0 || self.handles.len() < 2 {
            return false;
        }
        let loads = self.collect_worker_load();
        let Some((from, &max)) = loads.iter().enumerate().max_by_key(|(_, l)| **l) else {
            return false;
        };
        let Some((to, &min)) = loads.iter().enumerate().min_by_key(|(_, l)| **l) else {
            return false;
        };
        if from == to || max - min <= threshold {
            return false;
        }
        info!(from, to, max, min, threshold, "load difference exceeds threshold, rebalancing");
        let target = Arc::clone(&self.handles[to]);
        match self.handles[from].execute(move |worker| worker.rebalance(target, 1)) {
            Ok(()) => true,
            Err(e) => {
                error!(worker = from, "could not post rebalance request: {e}");
                false
            }
        }
    }

    /// Stop accepting and tell every worker to wind down. Does not wait and
    /// does not log, so it may be called from a signal-handling thread.
    pub fn start_shutdown(&self) {
        self.shared.remove_all();
        for handle in &self.handles {
            let mut message = Message::Shutdown;
            while handle.is_running() {
                match handle.try_post(message) {
                    Ok(()) => break,
                    Err(returned) => {
                        message = returned;
                        std::thread::yield_now();
                    }
                }
            }
        }
    }

    /// (worker id, session id) of every session.
    pub fn list_sessions(&self) -> Result<Vec<(usize, SessionId)>> {
        let collected = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&collected);
        self.execute_serially(move |worker| {
            let id = worker.id();
            let mut sessions = sink.lock().unwrap_or_else(PoisonError::into_inner);
            sessions.extend(worker.session_ids().into_iter().map(|sid| (id, sid)));
        })?;
        let mut sessions = std::mem::take(&mut *collected.lock().unwrap_or_else(PoisonError::into_inner));
        sessions.sort_unstable();
        Ok(sessions)
    }
}

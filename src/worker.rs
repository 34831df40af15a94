//! The routing worker: one epoll loop per thread owning client and backend
//! descriptors, the sessions they belong to and a persistent connection pool.
//!
//! Descriptors live in a slab. Their epoll token carries the slab key, so an
//! event maps to its descriptor without a lookup table. Closing is two-phase:
//! [`RoutingWorker::close`] takes the descriptor out of epoll and queues it as
//! a zombie, the end of the loop tick destroys it. Sessions only talk to the
//! worker through [`Action`] lists, which are applied once the session
//! callback has returned.

use std::collections::{HashMap, HashSet, VecDeque};
use std::os::fd::AsRawFd;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use disruptor::Polling;
use slab::Slab;
use socket2::Socket;
use tracing::{debug, error, info, warn};

use crate::backend::{BackendConnection, BackendError, BackendEvent, FailurePhase, WriteOutcome};
use crate::config::{HEARTBEAT, MAX_EVENTS, SHUTDOWN_RETRY, SLAB_CAPACITY, TIMEOUT_CHECK_TICKS, WorkerConfig};
use crate::dcb::{Dcb, DcbId, DcbState, Handler, Role};
use crate::error::{Error, ErrorType, Result};
use crate::listener::SharedListeners;
use crate::metrics::{WorkerLoad, WorkerStatistics};
use crate::poll::{self, DCB_EVENTS, Epoll, EventFd};
use crate::pool::{Evict, PersistentPool};
use crate::protocol;
use crate::registry::{self, MailPoller, Message, MovedSession, WorkerHandle, WorkerRegistry};
use crate::server::Server;
use crate::session::{Action, Session, SessionId, next_session_id};

/// Encode the event source + descriptor key into epoll user data.
const OP_MAILBOX: u64 = 0;
const OP_SHARED: u64 = 1;
const OP_DCB: u64 = 2;

fn encode_token(op: u64, key: usize) -> u64 {
    (op << 32) | key as u64
}

fn decode_token(token: u64) -> (u64, usize) {
    (token >> 32, (token & 0xffff_ffff) as usize)
}

pub(crate) struct SessionEntry {
    pub(crate) session: Box<dyn Session>,
    pub(crate) client: DcbId,
    /// Backend descriptor per server name.
    pub(crate) backends: HashMap<String, DcbId>,
    /// Packets read from the client, used to pick sessions to migrate.
    pub(crate) io_activity: u64,
}

type DelayedFn = Box<dyn FnMut(&mut RoutingWorker) -> bool + Send>;
type TickFn = Box<dyn FnMut(&mut RoutingWorker) + Send>;

struct DelayedCall {
    due: Instant,
    interval: Duration,
    call: DelayedFn,
}

pub struct RoutingWorker {
    id: usize,
    epoll: Epoll,
    handle: Arc<WorkerHandle>,
    mailbox: MailPoller,
    shared: Option<Arc<SharedListeners>>,
    registry: Weak<WorkerRegistry>,
    pub(crate) dcbs: Slab<Dcb>,
    /// Descriptors in regular bookkeeping. Pooled descriptors are not here.
    pub(crate) live: HashSet<DcbId>,
    zombies: VecDeque<DcbId>,
    pub(crate) pool: PersistentPool,
    pub(crate) sessions: HashMap<SessionId, SessionEntry>,
    delayed_calls: Vec<DelayedCall>,
    tick_funcs: Vec<TickFn>,
    pending_rebalance: Option<(Arc<WorkerHandle>, usize)>,
    stats: WorkerStatistics,
    load: WorkerLoad,
    load_window: usize,
    started: Instant,
    next_timeout_check: u64,
    shutting_down: bool,
    should_shutdown: bool,
    events: Vec<libc::epoll_event>,
}

impl RoutingWorker {
    /// Create worker `id`. With `shared` set the worker also accepts clients
    /// from the shared listener set.
    pub fn new(
        id: usize,
        config: &WorkerConfig,
        shared: Option<Arc<SharedListeners>>,
        instance: u64,
    ) -> Result<(Self, Arc<WorkerHandle>)> {
        let epoll = Epoll::new().map_err(Error::Epoll)?;
        let doorbell = EventFd::new()?;
        epoll.add(doorbell.as_raw_fd(), poll::IN, encode_token(OP_MAILBOX, 0))?;
        if let Some(shared) = &shared {
            epoll.add(shared.fd(), poll::IN, encode_token(OP_SHARED, 0))?;
        }
        let (mailbox, producer) = registry::build_mailbox();
        let handle = Arc::new(WorkerHandle::new(id, instance, producer, doorbell));
        let now = Instant::now();
        let worker = Self {
            id,
            epoll,
            handle: Arc::clone(&handle),
            mailbox,
            shared,
            registry: Weak::new(),
            dcbs: Slab::with_capacity(SLAB_CAPACITY),
            live: HashSet::new(),
            zombies: VecDeque::new(),
            pool: PersistentPool::default(),
            sessions: HashMap::new(),
            delayed_calls: Vec::new(),
            tick_funcs: Vec::new(),
            pending_rebalance: None,
            stats: WorkerStatistics::default(),
            load: WorkerLoad::new(now),
            load_window: config.rebalance_window,
            started: now,
            next_timeout_check: 0,
            shutting_down: false,
            should_shutdown: false,
            events: Vec::with_capacity(MAX_EVENTS),
        };
        Ok((worker, handle))
    }

    /// A worker outside any registry, driven by calling
    /// [`poll_once`](Self::poll_once).
    pub fn standalone(id: usize) -> Result<(Self, Arc<WorkerHandle>)> {
        Self::new(id, &WorkerConfig::with_threads(1), None, 0)
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn handle(&self) -> &Arc<WorkerHandle> {
        &self.handle
    }

    pub(crate) fn set_registry(&mut self, registry: Weak<WorkerRegistry>) {
        self.registry = registry;
    }

    pub fn registry(&self) -> Option<Arc<WorkerRegistry>> {
        self.registry.upgrade()
    }

    pub fn should_shutdown(&self) -> bool {
        self.should_shutdown
    }

    /// Thread body: loop until shutdown completes.
    pub fn run(mut self) {
        registry::set_current(self.handle.registry(), self.id);
        self.handle.set_running(true);
        info!(worker = self.id, "routing worker started");
        while !self.should_shutdown {
            self.poll_once(HEARTBEAT);
        }
        self.post_run();
        // Mail posted before this point has been run by post_run.
        self.handle.set_running(false);
        registry::clear_current();
        info!(worker = self.id, "routing worker stopped");
    }

    /// One loop iteration: wait at most `timeout`, dispatch the events, run
    /// the per-tick housekeeping.
    pub fn poll_once(&mut self, timeout: Duration) {
        let mut events = std::mem::take(&mut self.events);
        self.load.about_to_wait(Instant::now());
        if let Err(e) = self.epoll.wait(&mut events, timeout.as_millis().min(i32::MAX as u128) as i32) {
            error!(worker = self.id, "epoll_wait failed: {e}");
            events.clear();
        }
        if self.load.about_to_work(Instant::now()) {
            self.handle.publish_load(
                self.load.one_second(),
                self.load.one_minute(),
                self.load.one_hour(),
                self.load.window(self.load_window),
            );
        }
        self.stats.record_poll(events.len());

        for ev in events.iter().copied() {
            let bits = ev.events;
            let (op, key) = decode_token(ev.u64);
            match op {
                OP_MAILBOX => self.drain_mailbox(),
                OP_SHARED => self.accept_from_shared(),
                OP_DCB => self.handle_dcb_event(key, bits),
                _ => {}
            }
        }
        self.events = events;
        self.epoll_tick();
    }

    fn epoll_tick(&mut self) {
        self.process_timeouts();
        self.delete_zombies();
        self.run_delayed_calls();
        let mut funcs = std::mem::take(&mut self.tick_funcs);
        for f in funcs.iter_mut() {
            f(self);
        }
        funcs.append(&mut self.tick_funcs);
        self.tick_funcs = funcs;
        self.do_rebalance();
    }

    fn drain_mailbox(&mut self) {
        self.handle.doorbell.drain();
        let mut messages = Vec::new();
        match self.mailbox.poll() {
            Ok(mut guard) => {
                for mail in &mut guard {
                    if let Some(message) = mail.take() {
                        messages.push(message);
                    }
                }
            }
            Err(Polling::NoEvents) => {}
            Err(Polling::Shutdown) => {}
        }
        for message in messages {
            match message {
                Message::Task(task) => task(self),
                Message::Adopt(moved) => self.adopt_session(*moved),
                Message::Shutdown => self.begin_shutdown(),
            }
        }
    }

    fn accept_from_shared(&mut self) {
        if self.shutting_down {
            return;
        }
        let Some(shared) = self.shared.clone() else {
            return;
        };
        let listener = match shared.next_ready() {
            Ok(Some(listener)) => listener,
            Ok(None) => return,
            Err(e) => {
                warn!(worker = self.id, "polling listeners failed: {e}");
                return;
            }
        };
        match listener.accept() {
            Ok((socket, remote)) => {
                self.stats.n_accept += 1;
                let session = listener.factory().create(next_session_id(), &remote);
                debug!(worker = self.id, listener = listener.name(), remote = %remote, "accepted client");
                if let Err(e) = self.add_session(session, socket, remote) {
                    warn!(worker = self.id, "could not register client: {e}");
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => warn!(worker = self.id, listener = listener.name(), "accept failed: {e}"),
        }
    }

    /// Put `dcb` under epoll and into the live set.
    fn register_dcb(&mut self, dcb: Dcb) -> Result<DcbId> {
        let entry = self.dcbs.vacant_entry();
        let key = entry.key();
        self.epoll.add(dcb.fd(), DCB_EVENTS, encode_token(OP_DCB, key))?;
        let dcb = entry.insert(dcb);
        dcb.state = DcbState::Polling;
        self.live.insert(key);
        self.stats.n_total_descriptors += 1;
        Ok(key)
    }

    /// Register a client connection and its session on this worker.
    pub fn add_session(&mut self, session: Box<dyn Session>, socket: Socket, remote: String) -> Result<SessionId> {
        let sid = session.id();
        let client = self.register_dcb(Dcb::client(socket, remote, sid))?;
        self.sessions.insert(
            sid,
            SessionEntry {
                session,
                client,
                backends: HashMap::new(),
                io_activity: 0,
            },
        );
        if let Some(actions) = self.session_call(sid, |s, a| s.on_connect(a)) {
            self.apply_actions(sid, actions);
        }
        Ok(sid)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<_> = self.sessions.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn find_session(&self, sid: SessionId) -> Option<&dyn Session> {
        self.sessions.get(&sid).map(|e| e.session.as_ref())
    }

    pub fn session_client(&self, sid: SessionId) -> Option<DcbId> {
        self.sessions.get(&sid).map(|e| e.client)
    }

    /// Backend descriptor the session uses for `server`.
    pub fn session_backend(&self, sid: SessionId, server: &str) -> Option<DcbId> {
        self.sessions.get(&sid).and_then(|e| e.backends.get(server).copied())
    }

    pub fn dcb(&self, id: DcbId) -> Option<&Dcb> {
        self.dcbs.get(id)
    }

    pub fn is_live(&self, id: DcbId) -> bool {
        self.live.contains(&id)
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    fn session_call(
        &mut self,
        sid: SessionId,
        f: impl FnOnce(&mut dyn Session, &mut Vec<Action>),
    ) -> Option<Vec<Action>> {
        let entry = self.sessions.get_mut(&sid)?;
        let mut actions = Vec::new();
        f(entry.session.as_mut(), &mut actions);
        Some(actions)
    }

    fn apply_actions(&mut self, sid: SessionId, actions: Vec<Action>) {
        for action in actions {
            if !self.sessions.contains_key(&sid) {
                return;
            }
            match action {
                Action::Reply(data) => self.reply_to_client(sid, &data),
                Action::Route { server, packet } => self.route(sid, &server, packet),
                Action::Close => {
                    self.close_session(sid);
                    return;
                }
            }
        }
    }

    fn reply_to_client(&mut self, sid: SessionId, data: &[u8]) {
        let Some(client) = self.session_client(sid) else {
            return;
        };
        let Some(dcb) = self.dcbs.get_mut(client) else {
            return;
        };
        if let Err(e) = dcb.write(data) {
            debug!(worker = self.id, session = sid, "write to client failed: {e}");
            self.close_session(sid);
        }
    }

    /// Hand one packet to the session's connection to `server`, creating or
    /// reusing a connection when the session has none yet.
    fn route(&mut self, sid: SessionId, server: &Arc<Server>, packet: Vec<u8>) {
        let id = match self.session_backend(sid, server.name()) {
            Some(id) => id,
            None => match self.get_backend_dcb(server, sid) {
                Ok(id) => {
                    if let Some(entry) = self.sessions.get_mut(&sid) {
                        entry.backends.insert(server.name().to_string(), id);
                    }
                    id
                }
                Err(e) => {
                    let err = BackendError {
                        server: server.name().to_string(),
                        kind: ErrorType::Transient,
                        phase: FailurePhase::Establishing,
                        message: format!("Failed to connect to backend server: {e}"),
                        code: None,
                    };
                    warn!(worker = self.id, session = ?sid, "{err}");
                    self.report_backend_error(sid, &err);
                    return;
                }
            },
        };
        let Some(dcb) = self.dcbs.get_mut(id) else {
            return;
        };
        let outcome = match dcb.backend.as_mut() {
            Some(conn) => conn.write(packet, &mut dcb.writeq),
            None => return,
        };
        match outcome {
            WriteOutcome::Sent => {
                if let Err(e) = dcb.flush() {
                    self.backend_io_error(id, e);
                }
            }
            WriteOutcome::Hangup => self.close(id),
            WriteOutcome::Delayed | WriteOutcome::Stored | WriteOutcome::Absorbed | WriteOutcome::Rejected => {}
        }
    }

    /// A backend connection for `sid` to `server`: pooled if the server has
    /// pooling enabled and is running, otherwise a new one.
    pub fn get_backend_dcb(&mut self, server: &Arc<Server>, sid: SessionId) -> Result<DcbId> {
        if !self.sessions.contains_key(&sid) {
            return Err(Error::UnknownSession(sid));
        }
        if server.persistent_conns_enabled() && server.is_running() {
            if let Some(id) = self.get_backend_dcb_from_pool(server, sid) {
                return Ok(id);
            }
        }
        let socket = server.address().connect()?;
        server.stats().inc_new_conn();
        self.attach_backend_socket(sid, server, socket)
    }

    /// Start the backend protocol on an already connected `socket` for
    /// session `sid`.
    pub fn attach_backend_socket(&mut self, sid: SessionId, server: &Arc<Server>, socket: Socket) -> Result<DcbId> {
        let entry = self.sessions.get(&sid).ok_or(Error::UnknownSession(sid))?;
        let conn = BackendConnection::new(
            Arc::clone(server),
            entry.session.credentials(),
            entry.session.authenticator(),
            entry.session.connection_init_sql(),
        );
        let mut dcb = Dcb::backend(socket, Arc::clone(server), conn);
        dcb.session = Some(sid);
        let id = self.register_dcb(dcb)?;
        if let Some(entry) = self.sessions.get_mut(&sid) {
            entry.backends.insert(server.name().to_string(), id);
        }
        debug!(worker = self.id, session = sid, server = server.name(), "backend connection created");
        Ok(id)
    }

    fn handle_dcb_event(&mut self, id: DcbId, events: u32) {
        let Some(dcb) = self.dcbs.get(id) else {
            return;
        };
        if dcb.state != DcbState::Polling {
            return;
        }
        if dcb.handler == Handler::Pool {
            self.evict_dcb(id);
            return;
        }
        let role = dcb.role();

        if events & poll::OUT != 0 {
            self.stats.n_write += 1;
            self.write_ready(id, role);
        }
        if events & poll::IN != 0 && self.is_polling(id) {
            self.stats.n_read += 1;
            match role {
                Role::Client => self.client_read(id),
                Role::Backend => self.backend_read(id),
                Role::Internal => {}
            }
        }
        if events & poll::ERR != 0 && self.is_polling(id) {
            self.stats.n_error += 1;
            let err = self.dcbs[id]
                .take_error()
                .unwrap_or_else(|| std::io::Error::other("socket error"));
            match role {
                Role::Backend => self.backend_io_error(id, err),
                _ => self.client_gone(id),
            }
        }
        if events & (poll::HUP | poll::RDHUP) != 0 && self.is_polling(id) {
            self.stats.n_hup += 1;
            self.dcbs[id].hung_up = true;
            match role {
                Role::Backend => self.backend_hangup(id),
                _ => self.client_gone(id),
            }
        }
    }

    fn is_polling(&self, id: DcbId) -> bool {
        self.dcbs.get(id).is_some_and(|d| d.state == DcbState::Polling)
    }

    fn write_ready(&mut self, id: DcbId, role: Role) {
        let dcb = &mut self.dcbs[id];
        if role == Role::Backend {
            if let Some(err) = dcb.take_error() {
                self.backend_io_error(id, err);
                return;
            }
        }
        if let Err(e) = dcb.flush() {
            match role {
                Role::Backend => self.backend_io_error(id, e),
                _ => self.client_gone(id),
            }
        }
    }

    fn client_read(&mut self, id: DcbId) {
        let dcb = &mut self.dcbs[id];
        let Some(sid) = dcb.session else {
            self.close(id);
            return;
        };
        let outcome = match dcb.read_available() {
            Ok(outcome) => outcome,
            Err(e) => {
                debug!(worker = self.id, session = sid, "client read failed: {e}");
                self.close_session(sid);
                return;
            }
        };
        let len = protocol::complete_packets_len(&dcb.readq);
        if len > 0 {
            let packets: Vec<u8> = dcb.readq.drain(..len).collect();
            if let Some(entry) = self.sessions.get_mut(&sid) {
                entry.io_activity += 1;
            }
            if let Some(actions) = self.session_call(sid, |s, a| s.on_client_data(&packets, a)) {
                self.apply_actions(sid, actions);
            }
        }
        if outcome.eof && self.is_polling(id) {
            self.dcbs[id].hung_up = true;
            self.close_session(sid);
        }
    }

    fn backend_read(&mut self, id: DcbId) {
        let dcb = &mut self.dcbs[id];
        let outcome = dcb.read_available();
        let fd = dcb.fd();
        let mut events = Vec::new();
        if let Some(conn) = dcb.backend.as_mut() {
            conn.ready_for_reading(fd, &mut dcb.readq, &mut dcb.writeq, &mut events);
        }
        if !dcb.writeq.is_empty() {
            if let Err(e) = dcb.flush() {
                self.backend_io_error(id, e);
                return;
            }
        }
        let server = dcb.server().cloned();
        let sid = dcb.session;

        for event in events {
            match event {
                BackendEvent::Reply { data, complete } => {
                    let (Some(sid), Some(server)) = (sid, server.as_ref()) else {
                        continue;
                    };
                    if let Some(actions) =
                        self.session_call(sid, |s, a| s.on_backend_reply(server, data, complete, a))
                    {
                        self.apply_actions(sid, actions);
                    }
                }
                BackendEvent::Failed(err) => {
                    self.backend_failure(id, err);
                    return;
                }
            }
        }

        match outcome {
            Ok(outcome) if outcome.eof && self.is_polling(id) => {
                self.dcbs[id].hung_up = true;
                self.backend_hangup(id);
            }
            Ok(_) => {}
            Err(e) => {
                if self.is_polling(id) {
                    self.backend_io_error(id, e);
                }
            }
        }
    }

    fn backend_hangup(&mut self, id: DcbId) {
        let err = self.transient_error(id, "Lost connection to backend server: connection closed by peer".into());
        self.backend_failure(id, err);
    }

    fn backend_io_error(&mut self, id: DcbId, e: std::io::Error) {
        let err = self.transient_error(id, format!("Lost connection to backend server: {e}"));
        self.backend_failure(id, err);
    }

    fn transient_error(&self, id: DcbId, message: String) -> BackendError {
        let dcb = self.dcbs.get(id);
        let phase = match dcb.and_then(|d| d.backend_conn()) {
            Some(conn) if conn.state() == crate::backend::State::Routing => FailurePhase::Routing,
            _ => FailurePhase::Establishing,
        };
        BackendError {
            server: dcb
                .and_then(|d| d.server())
                .map(|s| s.name().to_string())
                .unwrap_or_default(),
            kind: ErrorType::Transient,
            phase,
            message,
            code: None,
        }
    }

    /// Close the failed backend descriptor and let its session decide
    /// whether to continue.
    fn backend_failure(&mut self, id: DcbId, err: BackendError) {
        let sid = self.dcbs.get(id).and_then(|d| d.session);
        warn!(worker = self.id, session = ?sid, "{err}");
        self.close(id);
        if let Some(sid) = sid {
            self.report_backend_error(sid, &err);
        }
    }

    fn report_backend_error(&mut self, sid: SessionId, err: &BackendError) {
        let mut keep = true;
        if let Some(actions) = self.session_call(sid, |s, a| keep = s.on_backend_error(err, a)) {
            self.apply_actions(sid, actions);
        }
        if !keep {
            self.close_session(sid);
        }
    }

    fn client_gone(&mut self, id: DcbId) {
        match self.dcbs.get(id).and_then(|d| d.session) {
            Some(sid) => self.close_session(sid),
            None => self.close(id),
        }
    }

    /// Close a descriptor. Backend descriptors that qualify go to the
    /// persistent pool instead.
    pub fn close(&mut self, id: DcbId) {
        let Some(dcb) = self.dcbs.get(id) else {
            return;
        };
        if dcb.state == DcbState::Disconnected {
            return;
        }
        if dcb.role() == Role::Backend {
            if let (Some(sid), Some(server)) = (dcb.session, dcb.server()) {
                if let Some(entry) = self.sessions.get_mut(&sid) {
                    if entry.backends.get(server.name()) == Some(&id) {
                        entry.backends.remove(server.name());
                    }
                }
            }
            if !self.can_be_destroyed(id) {
                return;
            }
        }

        let dcb = &mut self.dcbs[id];
        if let Some(conn) = dcb.backend.as_mut() {
            conn.finish_connection(&mut dcb.writeq);
        }
        if !dcb.writeq.is_empty() {
            let _ = dcb.flush();
        }
        if dcb.state == DcbState::Polling {
            if let Err(e) = self.epoll.delete(dcb.fd()) {
                debug!(worker = self.id, "removing descriptor from epoll failed: {e}");
            }
        }
        dcb.shutdown();
        dcb.state = DcbState::Disconnected;
        self.live.remove(&id);
        self.zombies.push_back(id);
    }

    /// Close the session's client connection. The session itself and its
    /// backend connections go away when the client descriptor is destroyed.
    pub fn close_session(&mut self, sid: SessionId) {
        if let Some(client) = self.session_client(sid) {
            self.close(client);
        }
    }

    fn delete_zombies(&mut self) {
        while let Some(id) = self.zombies.pop_front() {
            let Some(dcb) = self.dcbs.try_remove(id) else {
                continue;
            };
            if dcb.role() == Role::Client {
                if let Some(sid) = dcb.session {
                    self.end_session(sid);
                }
            }
        }
    }

    fn end_session(&mut self, sid: SessionId) {
        let backends: Vec<DcbId> = match self.sessions.get(&sid) {
            Some(entry) => entry.backends.values().copied().collect(),
            None => return,
        };
        for id in backends {
            self.close(id);
        }
        self.sessions.remove(&sid);
        debug!(worker = self.id, session = sid, "session ended");
    }

    fn process_timeouts(&mut self) {
        let ticks = (self.started.elapsed().as_millis() / HEARTBEAT.as_millis()) as u64;
        if ticks < self.next_timeout_check {
            return;
        }
        self.next_timeout_check = ticks + TIMEOUT_CHECK_TICKS;
        let now = Instant::now();
        let idle: Vec<(SessionId, Duration)> = self
            .live
            .iter()
            .filter_map(|id| self.dcbs.get(*id))
            .filter(|d| d.role() == Role::Client && d.state == DcbState::Polling)
            .filter_map(|d| d.session.map(|sid| (sid, now.saturating_duration_since(d.last_read()))))
            .collect();
        for (sid, idle) in idle {
            if let Some(actions) = self.session_call(sid, |s, a| s.tick(idle, a)) {
                self.apply_actions(sid, actions);
            }
        }
    }

    /// Call `f` every `interval` from the loop tick for as long as it returns
    /// true.
    pub fn delayed_call(&mut self, interval: Duration, f: impl FnMut(&mut RoutingWorker) -> bool + Send + 'static) {
        self.delayed_calls.push(DelayedCall {
            due: Instant::now() + interval,
            interval,
            call: Box::new(f),
        });
    }

    /// Call `f` at the end of every loop tick.
    pub fn register_tick_func(&mut self, f: impl FnMut(&mut RoutingWorker) + Send + 'static) {
        self.tick_funcs.push(Box::new(f));
    }

    fn run_delayed_calls(&mut self) {
        if self.delayed_calls.is_empty() {
            return;
        }
        let now = Instant::now();
        let calls = std::mem::take(&mut self.delayed_calls);
        let mut kept = Vec::with_capacity(calls.len());
        for mut dc in calls {
            if dc.due > now {
                kept.push(dc);
            } else if (dc.call)(self) {
                dc.due = now + dc.interval;
                kept.push(dc);
            }
        }
        kept.append(&mut self.delayed_calls);
        self.delayed_calls = kept;
    }

    /// Ask for `n` sessions to be moved to `target`. The move happens after
    /// the current batch of events has been handled.
    pub fn rebalance(&mut self, target: Arc<WorkerHandle>, n: usize) {
        self.pending_rebalance = Some((target, n));
    }

    pub fn has_pending_rebalance(&self) -> bool {
        self.pending_rebalance.is_some()
    }

    fn do_rebalance(&mut self) {
        let Some((target, n)) = self.pending_rebalance.take() else {
            return;
        };
        let mut candidates: Vec<(u64, SessionId)> = self
            .sessions
            .iter()
            .filter(|(_, e)| e.session.is_movable())
            .map(|(sid, e)| (e.io_activity, *sid))
            .collect();
        candidates.sort_unstable_by(|a, b| b.cmp(a));

        let mut moved = 0;
        for (_, sid) in candidates {
            if moved == n {
                break;
            }
            if self.move_session(sid, &target) {
                moved += 1;
            }
        }
        if moved < n {
            info!(
                worker = self.id,
                target = target.id(),
                requested = n,
                moved,
                "fewer sessions than requested could be moved"
            );
        }
    }

    /// Detach the session and all of its descriptors and post them to
    /// `target`. If the mail cannot be posted the session stays here.
    pub fn move_session(&mut self, sid: SessionId, target: &Arc<WorkerHandle>) -> bool {
        if Arc::ptr_eq(target, &self.handle) {
            return false;
        }
        let Some(entry) = self.sessions.remove(&sid) else {
            return false;
        };
        let Some(client) = self.detach_dcb(entry.client) else {
            // Client already closing; put the entry back so the zombie pass
            // ends the session normally.
            self.sessions.insert(sid, entry);
            return false;
        };
        let backends = entry
            .backends
            .values()
            .filter_map(|id| self.detach_dcb(*id))
            .collect();
        let moved = MovedSession {
            session: entry.session,
            client,
            backends,
            io_activity: entry.io_activity,
        };
        match target.try_post(Message::Adopt(Box::new(moved))) {
            Ok(()) => {
                debug!(worker = self.id, target = target.id(), session = sid, "session moved");
                true
            }
            Err(Message::Adopt(moved)) => {
                warn!(worker = self.id, target = target.id(), session = sid, "could not move session, keeping it");
                self.adopt_session(*moved);
                false
            }
            Err(_) => false,
        }
    }

    fn detach_dcb(&mut self, id: DcbId) -> Option<Dcb> {
        if !self.is_polling(id) {
            return None;
        }
        let mut dcb = self.dcbs.try_remove(id)?;
        let _ = self.epoll.delete(dcb.fd());
        self.live.remove(&id);
        dcb.state = DcbState::NoPolling;
        Some(dcb)
    }

    /// Take over a session moved from another worker.
    pub fn adopt_session(&mut self, moved: MovedSession) {
        let MovedSession {
            session,
            client,
            backends,
            io_activity,
        } = moved;
        let sid = session.id();
        let client = match self.register_dcb(client) {
            Ok(id) => id,
            Err(e) => {
                error!(worker = self.id, session = sid, "could not adopt session: {e}");
                return;
            }
        };
        let mut by_server = HashMap::new();
        for dcb in backends {
            let name = dcb.server().map(|s| s.name().to_string()).unwrap_or_default();
            match self.register_dcb(dcb) {
                Ok(id) => {
                    by_server.insert(name, id);
                }
                Err(e) => warn!(worker = self.id, session = sid, server = %name, "dropping backend of adopted session: {e}"),
            }
        }
        self.sessions.insert(
            sid,
            SessionEntry {
                session,
                client,
                backends: by_server,
                io_activity,
            },
        );
    }

    /// Stop accepting, evict the pool and end all sessions; the loop exits
    /// once nothing is left.
    pub fn begin_shutdown(&mut self) {
        if self.shutting_down {
            return;
        }
        self.shutting_down = true;
        if let Some(shared) = &self.shared {
            let _ = self.epoll.delete(shared.fd());
        }
        info!(worker = self.id, sessions = self.sessions.len(), "routing worker shutting down");
        if !self.try_shutdown() {
            self.delayed_call(SHUTDOWN_RETRY, |worker| !worker.try_shutdown());
        }
    }

    /// Returns true once the worker may exit.
    fn try_shutdown(&mut self) -> bool {
        self.evict_all(Evict::All);
        if self.sessions.is_empty() {
            self.should_shutdown = true;
            return true;
        }
        for sid in self.session_ids() {
            self.close_session(sid);
        }
        false
    }

    fn post_run(&mut self) {
        // Tasks posted while the loop was winding down still have waiters.
        self.drain_mailbox();
        self.evict_all(Evict::All);
        for sid in self.session_ids() {
            self.close_session(sid);
        }
        self.delete_zombies();
        self.evict_all(Evict::All);
        self.delete_zombies();
    }

    pub fn statistics(&self) -> WorkerStatistics {
        WorkerStatistics {
            n_current_descriptors: self.dcbs.len() as u64,
            n_sessions: self.sessions.len() as u64,
            n_pooled: self.pool.len() as u64,
            load_1s: self.load.one_second(),
            load_1m: self.load.one_minute(),
            load_1h: self.load.one_hour(),
            ..self.stats
        }
    }
}

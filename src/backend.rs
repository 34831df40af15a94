//! Backend connection protocol state machine.
//!
//! A [`BackendConnection`] drives one server connection from the initial
//! handshake through authentication and the connection init queries into
//! ROUTING, where it forwards queries and tracks their replies. It never
//! touches the socket for plain I/O: the owning worker feeds it the bytes read
//! and flushes the bytes it queues.
//!
//! ```text
//! HANDSHAKING -> AUTHENTICATING -> CONNECTION_INIT -> SEND_DELAYQ -> ROUTING
//!       \______________\_________________\________________________> FAILED
//! ```

use std::fmt;
use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::auth::{AuthContext, AuthOutcome, BackendAuthenticator, Credentials};
use crate::constants::*;
use crate::error::{Error, ErrorType, Result};
use crate::protocol::{self, ErrPacket, HandshakeResponse, Packet, ServerHandshake};
use crate::reply::{Reply, ReplyTracker};
use crate::server::{Server, status};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum State {
    Handshaking,
    Authenticating,
    ConnectionInit,
    SendDelayq,
    Routing,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HandshakeState {
    ExpectHs,
    StartSsl,
    SslNeg,
    SendHsResp,
    Complete,
    Fail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InitState {
    SendQueries,
    ReceiveReplies,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StateMachineRes {
    InProgress,
    Done,
    Error,
}

/// Progress of a TLS handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SslProgress {
    InProgress,
    Established,
    Failed(String),
}

/// Client side of a TLS handshake on a backend socket.
///
/// Implementations perform the handshake and then install kernel TLS on the
/// socket, so plain reads and writes keep working once `Established` is
/// returned.
pub trait SslNegotiator: Send {
    /// Send `ssl_request` in the clear and begin the TLS handshake.
    fn start(&mut self, fd: RawFd, ssl_request: &[u8]) -> io::Result<()>;

    /// Continue the handshake. Called on every readiness event until it
    /// finishes.
    fn negotiate(&mut self, fd: RawFd) -> SslProgress;
}

/// Per-server TLS configuration.
pub trait TlsContext: Send + Sync {
    fn negotiator(&self) -> Box<dyn SslNegotiator>;
}

/// Queries sent on every new backend connection before it starts routing.
#[derive(Debug, Clone, Default)]
pub struct ConnectionInitSql {
    queries: Vec<String>,
    buffer: Vec<u8>,
}

impl ConnectionInitSql {
    pub fn new(queries: Vec<String>) -> Self {
        let buffer = queries.iter().flat_map(|q| protocol::com_query(q)).collect();
        Self { queries, buffer }
    }

    pub fn queries(&self) -> &[String] {
        &self.queries
    }

    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePhase {
    /// Before the connection reached ROUTING.
    Establishing,
    Routing,
}

/// Why a backend connection moved to FAILED.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendError {
    pub server: String,
    pub kind: ErrorType,
    pub phase: FailurePhase,
    pub message: String,
    /// Server error code when the failure was an ERR packet.
    pub code: Option<u16>,
}

impl BackendError {
    pub fn is_host_blocked(&self) -> bool {
        self.code == Some(ER_HOST_IS_BLOCKED)
    }
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.server, self.message)
    }
}

/// Something the worker has to act on after feeding the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendEvent {
    /// Reply bytes for the session. `complete` is set once the reply to the
    /// current command has fully arrived.
    Reply { data: Vec<u8>, complete: bool },
    /// The connection is in FAILED state and must be closed.
    Failed(BackendError),
}

/// What happened to a packet handed to [`BackendConnection::write`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Queued for the server.
    Sent,
    /// Kept until the connection reaches ROUTING.
    Delayed,
    /// Kept until the pending COM_CHANGE_USER is acknowledged.
    Stored,
    /// COM_QUIT swallowed so the connection can be pooled.
    Absorbed,
    /// The session quit while a COM_CHANGE_USER reply was pending; the
    /// connection should be closed.
    Hangup,
    /// The connection has failed; nothing was queued.
    Rejected,
}

pub struct BackendConnection {
    server: Arc<Server>,
    credentials: Arc<Credentials>,
    authenticator: Box<dyn BackendAuthenticator>,
    init_sql: Option<Arc<ConnectionInitSql>>,
    ssl: Option<Box<dyn SslNegotiator>>,
    state: State,
    hs_state: HandshakeState,
    init_state: InitState,
    init_replies: usize,
    scramble: [u8; SCRAMBLE_LEN],
    thread_id: u32,
    server_capabilities: u32,
    delayq: Vec<Vec<u8>>,
    ignore_replies: u32,
    stored_query: Vec<u8>,
    changing_user: bool,
    tracker: ReplyTracker,
}

impl fmt::Debug for BackendConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendConnection")
            .field("server", &self.server.name())
            .field("user", &self.credentials.user)
            .field("state", &self.state)
            .field("hs_state", &self.hs_state)
            .field("thread_id", &self.thread_id)
            .field("ignore_replies", &self.ignore_replies)
            .finish()
    }
}

impl BackendConnection {
    pub fn new(
        server: Arc<Server>,
        credentials: Arc<Credentials>,
        authenticator: Box<dyn BackendAuthenticator>,
        init_sql: Option<Arc<ConnectionInitSql>>,
    ) -> Self {
        let ssl = server.tls().map(|tls| tls.negotiator());
        Self {
            server,
            credentials,
            authenticator,
            init_sql,
            ssl,
            state: State::Handshaking,
            hs_state: HandshakeState::ExpectHs,
            init_state: InitState::SendQueries,
            init_replies: 0,
            scramble: [0; SCRAMBLE_LEN],
            thread_id: 0,
            server_capabilities: 0,
            delayq: Vec::new(),
            ignore_replies: 0,
            stored_query: Vec::new(),
            changing_user: false,
            tracker: ReplyTracker::new(),
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn handshake_state(&self) -> HandshakeState {
        self.hs_state
    }

    pub fn server(&self) -> &Arc<Server> {
        &self.server
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// Connection id the server assigned in its handshake.
    pub fn thread_id(&self) -> u32 {
        self.thread_id
    }

    pub fn reply(&self) -> &Reply {
        self.tracker.reply()
    }

    pub fn ignore_replies(&self) -> u32 {
        self.ignore_replies
    }

    /// Routing with nothing pending, i.e. safe to hand to another session.
    pub fn established(&self) -> bool {
        self.state == State::Routing && self.ignore_replies == 0 && self.stored_query.is_empty()
    }

    /// Process buffered server data. Consumed bytes are removed from `readq`,
    /// bytes for the server are appended to `writeq`.
    pub fn ready_for_reading(
        &mut self,
        fd: RawFd,
        readq: &mut Vec<u8>,
        writeq: &mut Vec<u8>,
        events: &mut Vec<BackendEvent>,
    ) {
        loop {
            let res = match self.state {
                State::Handshaking => self.handshake(fd, readq, writeq, events),
                State::Authenticating => self.authenticate(readq, writeq, events),
                State::ConnectionInit => self.send_connection_init_queries(readq, writeq, events),
                State::SendDelayq => {
                    self.send_delayed_packets(writeq);
                    StateMachineRes::Done
                }
                State::Routing => {
                    self.normal_read(readq, writeq, events);
                    return;
                }
                State::Failed => {
                    readq.clear();
                    return;
                }
            };
            match res {
                StateMachineRes::Done => self.advance(),
                StateMachineRes::InProgress | StateMachineRes::Error => return,
            }
        }
    }

    fn advance(&mut self) {
        self.state = match self.state {
            State::Handshaking => State::Authenticating,
            State::Authenticating => State::ConnectionInit,
            State::ConnectionInit => State::SendDelayq,
            State::SendDelayq => State::Routing,
            s => s,
        };
        if self.state == State::Routing {
            debug!(
                server = self.server.name(),
                thread_id = self.thread_id,
                "backend connection ready for routing"
            );
        }
    }

    fn fail(&mut self, kind: ErrorType, message: String, code: Option<u16>) -> BackendError {
        let phase = if self.state == State::Routing {
            FailurePhase::Routing
        } else {
            FailurePhase::Establishing
        };
        self.state = State::Failed;
        BackendError {
            server: self.server.name().to_string(),
            kind,
            phase,
            message,
            code,
        }
    }

    fn handshake(
        &mut self,
        fd: RawFd,
        readq: &mut Vec<u8>,
        writeq: &mut Vec<u8>,
        events: &mut Vec<BackendEvent>,
    ) -> StateMachineRes {
        loop {
            match self.hs_state {
                HandshakeState::ExpectHs => {
                    let Some(packet) = protocol::read_packet(readq) else {
                        return StateMachineRes::InProgress;
                    };
                    if packet.is_err() {
                        let detail = ErrPacket::parse(&packet.payload)
                            .map(|e| e.to_string())
                            .unwrap_or_default();
                        self.hs_state = HandshakeState::Fail;
                        let err = self.fail(
                            ErrorType::Transient,
                            format!("Connection rejected: {detail}"),
                            ErrPacket::parse(&packet.payload).map(|e| e.code),
                        );
                        events.push(BackendEvent::Failed(err));
                        continue;
                    }
                    match ServerHandshake::parse(&packet.payload) {
                        Ok(hs) => {
                            self.thread_id = hs.thread_id;
                            self.scramble = hs.scramble;
                            self.server_capabilities = hs.capabilities;
                            self.hs_state = if self.ssl.is_some() {
                                HandshakeState::StartSsl
                            } else {
                                HandshakeState::SendHsResp
                            };
                        }
                        Err(reason) => {
                            self.hs_state = HandshakeState::Fail;
                            let err = self.fail(
                                ErrorType::Permanent,
                                format!("Bad handshake: {reason}"),
                                None,
                            );
                            events.push(BackendEvent::Failed(err));
                        }
                    }
                }
                HandshakeState::StartSsl => {
                    let request = protocol::packet(
                        1,
                        &protocol::ssl_request(self.client_capabilities(), self.credentials.charset),
                    );
                    let started = match self.ssl.as_mut() {
                        Some(ssl) => ssl.start(fd, &request).map_err(|e| e.to_string()),
                        None => Err("no TLS context".to_string()),
                    };
                    match started {
                        Ok(()) => self.hs_state = HandshakeState::SslNeg,
                        Err(reason) => {
                            self.hs_state = HandshakeState::Fail;
                            let err = self.fail(
                                ErrorType::Transient,
                                format!("Could not start TLS: {reason}"),
                                None,
                            );
                            events.push(BackendEvent::Failed(err));
                        }
                    }
                }
                HandshakeState::SslNeg => {
                    let progress = match self.ssl.as_mut() {
                        Some(ssl) => ssl.negotiate(fd),
                        None => SslProgress::Failed("no TLS context".into()),
                    };
                    match progress {
                        SslProgress::InProgress => return StateMachineRes::InProgress,
                        SslProgress::Established => self.hs_state = HandshakeState::SendHsResp,
                        SslProgress::Failed(reason) => {
                            self.hs_state = HandshakeState::Fail;
                            let err = self.fail(
                                ErrorType::Transient,
                                format!("TLS negotiation failed: {reason}"),
                                None,
                            );
                            events.push(BackendEvent::Failed(err));
                        }
                    }
                }
                HandshakeState::SendHsResp => {
                    let seq = if self.ssl.is_some() { 2 } else { 1 };
                    let payload = self.handshake_response();
                    protocol::write_packet(writeq, seq, &payload);
                    self.hs_state = HandshakeState::Complete;
                }
                HandshakeState::Complete => return StateMachineRes::Done,
                HandshakeState::Fail => return StateMachineRes::Error,
            }
        }
    }

    fn client_capabilities(&self) -> u32 {
        let mut caps = DEFAULT_CAPABILITIES & (self.server_capabilities | CLIENT_LONG_PASSWORD);
        if self.ssl.is_some() {
            caps |= CLIENT_SSL;
        }
        if self.credentials.connect_attrs.is_empty() {
            caps &= !CLIENT_CONNECT_ATTRS;
        }
        caps
    }

    fn handshake_response(&self) -> Vec<u8> {
        let token = self.credentials.token_for(&self.scramble);
        HandshakeResponse {
            capabilities: self.client_capabilities(),
            charset: self.credentials.charset,
            user: &self.credentials.user,
            auth_token: &token,
            database: self.credentials.database.as_deref(),
            auth_plugin: self.authenticator.name(),
            connect_attrs: &self.credentials.connect_attrs,
        }
        .encode()
    }

    fn authenticate(
        &mut self,
        readq: &mut Vec<u8>,
        writeq: &mut Vec<u8>,
        events: &mut Vec<BackendEvent>,
    ) -> StateMachineRes {
        while let Some(packet) = protocol::read_packet(readq) {
            if packet.is_ok() {
                return StateMachineRes::Done;
            }
            if packet.is_err() {
                let err = self.handle_auth_error(&packet);
                events.push(BackendEvent::Failed(err));
                return StateMachineRes::Error;
            }
            if let Err(reason) = self.exchange(&packet, writeq) {
                let err = self.fail(
                    ErrorType::Permanent,
                    format!("Authentication to '{}' failed: {reason}", self.server.name()),
                    None,
                );
                events.push(BackendEvent::Failed(err));
                return StateMachineRes::Error;
            }
        }
        StateMachineRes::InProgress
    }

    fn handle_auth_error(&mut self, packet: &Packet) -> BackendError {
        let err = ErrPacket::parse(&packet.payload);
        let code = err.as_ref().map(|e| e.code);
        if code == Some(ER_HOST_IS_BLOCKED) {
            self.server.set_status(status::MAINTENANCE);
            error!(
                server = self.server.name(),
                "server blocked the proxy host because of too many connection errors, \
                 setting it into maintenance mode; run 'mysqladmin flush-hosts' on {} to unblock it",
                self.server.address()
            );
        }
        let detail = err.map(|e| e.to_string()).unwrap_or_default();
        self.fail(
            ErrorType::Permanent,
            format!(
                "Authentication to '{}' failed: {detail}",
                self.server.name()
            ),
            code,
        )
    }

    fn exchange(&mut self, packet: &Packet, writeq: &mut Vec<u8>) -> std::result::Result<(), String> {
        let mut ctx = AuthContext {
            credentials: &self.credentials,
            scramble: &mut self.scramble,
            out: writeq,
        };
        match self.authenticator.exchange(packet, &mut ctx) {
            AuthOutcome::Continue => Ok(()),
            AuthOutcome::Failed(reason) => Err(reason),
        }
    }

    fn send_connection_init_queries(
        &mut self,
        readq: &mut Vec<u8>,
        writeq: &mut Vec<u8>,
        events: &mut Vec<BackendEvent>,
    ) -> StateMachineRes {
        let Some(init) = self.init_sql.clone().filter(|sql| !sql.is_empty()) else {
            return StateMachineRes::Done;
        };
        if self.init_state == InitState::SendQueries {
            writeq.extend_from_slice(&init.buffer);
            self.init_replies = 0;
            self.init_state = InitState::ReceiveReplies;
        }
        while self.init_replies < init.queries.len() {
            let Some(packet) = protocol::read_packet(readq) else {
                return StateMachineRes::InProgress;
            };
            if !packet.is_ok() {
                let detail = ErrPacket::parse(&packet.payload)
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "unexpected response".to_string());
                let query = &init.queries[self.init_replies];
                let err = self.fail(
                    ErrorType::Permanent,
                    format!("Connection initialization query '{query}' failed: {detail}"),
                    ErrPacket::parse(&packet.payload).map(|e| e.code),
                );
                events.push(BackendEvent::Failed(err));
                return StateMachineRes::Error;
            }
            self.init_replies += 1;
        }
        StateMachineRes::Done
    }

    fn send_delayed_packets(&mut self, writeq: &mut Vec<u8>) {
        // Routing state is entered right after this, route as if already there.
        let delayed = std::mem::take(&mut self.delayq);
        for packet in delayed {
            self.route_packet(packet, writeq);
        }
    }

    fn normal_read(&mut self, readq: &mut Vec<u8>, writeq: &mut Vec<u8>, events: &mut Vec<BackendEvent>) {
        if self.ignore_replies > 0 && !self.read_change_user_replies(readq, writeq, events) {
            return;
        }
        let len = protocol::complete_packets_len(readq);
        if len == 0 {
            return;
        }
        if self.changing_user {
            // Auth switch requests for a client COM_CHANGE_USER stay between
            // the proxy and the server.
            while let Some(first) = protocol::command(readq) {
                if first != AUTH_SWITCH_HEADER || protocol::payload_len(readq) < 9 {
                    break;
                }
                let Some(packet) = protocol::read_packet(readq) else {
                    return;
                };
                if let Err(reason) = self.exchange(&packet, writeq) {
                    let err = self.fail(
                        ErrorType::Permanent,
                        format!("COM_CHANGE_USER failed: {reason}"),
                        None,
                    );
                    events.push(BackendEvent::Failed(err));
                    return;
                }
            }
            if protocol::complete_packets_len(readq) == 0 {
                return;
            }
            self.changing_user = false;
        }
        let len = protocol::complete_packets_len(readq);
        let data: Vec<u8> = readq.drain(..len).collect();
        self.tracker.process(&data);
        events.push(BackendEvent::Reply {
            data,
            complete: self.tracker.is_complete(),
        });
    }

    /// Consume replies to COM_CHANGE_USER packets the proxy sent on its own.
    /// Returns false if the connection failed.
    fn read_change_user_replies(
        &mut self,
        readq: &mut Vec<u8>,
        writeq: &mut Vec<u8>,
        events: &mut Vec<BackendEvent>,
    ) -> bool {
        while self.ignore_replies > 0 {
            let Some(packet) = protocol::read_packet(readq) else {
                return true;
            };
            if packet.is_ok() {
                self.ignore_replies -= 1;
                if self.ignore_replies == 0 && !self.stored_query.is_empty() {
                    let stored = std::mem::take(&mut self.stored_query);
                    debug!(
                        server = self.server.name(),
                        "COM_CHANGE_USER complete, sending stored query"
                    );
                    let mut rest = &stored[..];
                    while let Some(len) = protocol::logical_packet_len(rest) {
                        let (packet, tail) = rest.split_at(len);
                        self.route_packet(packet.to_vec(), writeq);
                        rest = tail;
                    }
                }
            } else if packet.is_err() {
                let detail = ErrPacket::parse(&packet.payload)
                    .map(|e| e.to_string())
                    .unwrap_or_default();
                let err = self.fail(
                    ErrorType::Permanent,
                    format!("COM_CHANGE_USER failed: {detail}"),
                    ErrPacket::parse(&packet.payload).map(|e| e.code),
                );
                events.push(BackendEvent::Failed(err));
                return false;
            } else if let Err(reason) = self.exchange(&packet, writeq) {
                let err = self.fail(
                    ErrorType::Permanent,
                    format!("COM_CHANGE_USER failed: {reason}"),
                    None,
                );
                events.push(BackendEvent::Failed(err));
                return false;
            }
        }
        true
    }

    /// Hand a packet from the session to the connection.
    pub fn write(&mut self, packet: Vec<u8>, writeq: &mut Vec<u8>) -> WriteOutcome {
        if self.state == State::Failed {
            warn!(server = self.server.name(), "write to failed backend connection dropped");
            return WriteOutcome::Rejected;
        }
        if self.ignore_replies > 0 {
            if protocol::command(&packet) == Some(COM_QUIT) {
                info!(
                    server = self.server.name(),
                    "COM_QUIT received while COM_CHANGE_USER is in progress, closing connection"
                );
                return WriteOutcome::Hangup;
            }
            self.stored_query.extend_from_slice(&packet);
            return WriteOutcome::Stored;
        }
        if self.state == State::Routing {
            self.route_packet(packet, writeq)
        } else {
            self.delayq.push(packet);
            WriteOutcome::Delayed
        }
    }

    fn route_packet(&mut self, packet: Vec<u8>, writeq: &mut Vec<u8>) -> WriteOutcome {
        match protocol::command(&packet) {
            Some(COM_QUIT) if self.server.persistent_conns_enabled() => {
                // The connection might be pooled, keep it open.
                WriteOutcome::Absorbed
            }
            Some(COM_CHANGE_USER) => {
                self.changing_user = true;
                self.tracker.track_query(&packet);
                writeq.extend_from_slice(&self.change_user_packet());
                WriteOutcome::Sent
            }
            _ => {
                self.tracker.track_query(&packet);
                writeq.extend_from_slice(&packet);
                WriteOutcome::Sent
            }
        }
    }

    fn change_user_packet(&self) -> Vec<u8> {
        let token = self.credentials.token_for(&self.scramble);
        let payload = protocol::change_user(
            &self.credentials.user,
            &token,
            self.credentials.database.as_deref(),
            self.credentials.charset,
            self.authenticator.name(),
            &self.credentials.connect_attrs,
        );
        protocol::packet(0, &payload)
    }

    /// Take the connection over for another session: switch identity and
    /// queue a COM_CHANGE_USER whose reply is consumed internally.
    pub fn reuse_connection(
        &mut self,
        credentials: Arc<Credentials>,
        authenticator: Box<dyn BackendAuthenticator>,
        init_sql: Option<Arc<ConnectionInitSql>>,
        writeq: &mut Vec<u8>,
    ) -> Result<()> {
        if self.state != State::Routing {
            return Err(Error::NotReusable("connection is not routing"));
        }
        if !self.delayq.is_empty() {
            return Err(Error::NotReusable("delay queue is not empty"));
        }
        self.credentials = credentials;
        self.authenticator = authenticator;
        self.init_sql = init_sql;
        self.changing_user = false;
        self.tracker = ReplyTracker::new();
        writeq.extend_from_slice(&self.change_user_packet());
        self.ignore_replies += 1;
        Ok(())
    }

    /// Bytes to send before the socket is closed.
    pub fn finish_connection(&mut self, writeq: &mut Vec<u8>) {
        if !matches!(self.state, State::Handshaking | State::Failed) {
            writeq.extend_from_slice(&protocol::com_quit());
        }
    }
}

//! Connection descriptors: one non-blocking socket plus the state the owning
//! worker keeps for it.

use std::io::{self, Read};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;
use std::time::Instant;

use socket2::Socket;

use crate::backend::BackendConnection;
use crate::config::READ_CHUNK;
use crate::server::Server;
use crate::session::SessionId;

/// Key of a descriptor in its worker's arena. Only meaningful on that worker.
pub type DcbId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Backend,
    Internal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DcbState {
    Created,
    Polling,
    Disconnected,
    NoPolling,
}

/// What readiness events on the descriptor mean.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handler {
    /// Normal protocol processing.
    Protocol,
    /// The descriptor sits idle in the persistent pool; any event evicts it.
    Pool,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReadOutcome {
    pub bytes: usize,
    /// The peer closed its side.
    pub eof: bool,
}

pub struct Dcb {
    socket: Socket,
    role: Role,
    pub(crate) state: DcbState,
    pub(crate) handler: Handler,
    pub(crate) session: Option<SessionId>,
    server: Option<Arc<Server>>,
    pub(crate) backend: Option<BackendConnection>,
    pub(crate) readq: Vec<u8>,
    pub(crate) writeq: Vec<u8>,
    pub(crate) hung_up: bool,
    last_read: Instant,
    last_write: Instant,
    remote: String,
}

impl std::fmt::Debug for Dcb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dcb")
            .field("fd", &self.fd())
            .field("role", &self.role)
            .field("state", &self.state)
            .field("handler", &self.handler)
            .field("session", &self.session)
            .field("remote", &self.remote)
            .finish()
    }
}

impl Dcb {
    fn new(socket: Socket, role: Role, remote: String) -> Self {
        let now = Instant::now();
        Self {
            socket,
            role,
            state: DcbState::Created,
            handler: Handler::Protocol,
            session: None,
            server: None,
            backend: None,
            readq: Vec::new(),
            writeq: Vec::new(),
            hung_up: false,
            last_read: now,
            last_write: now,
            remote,
        }
    }

    pub fn client(socket: Socket, remote: String, session: SessionId) -> Self {
        let mut dcb = Self::new(socket, Role::Client, remote);
        dcb.session = Some(session);
        dcb
    }

    pub fn backend(socket: Socket, server: Arc<Server>, conn: BackendConnection) -> Self {
        let mut dcb = Self::new(socket, Role::Backend, server.address().to_string());
        dcb.server = Some(server);
        dcb.backend = Some(conn);
        dcb
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> DcbState {
        self.state
    }

    pub fn handler(&self) -> Handler {
        self.handler
    }

    pub fn session(&self) -> Option<SessionId> {
        self.session
    }

    pub fn server(&self) -> Option<&Arc<Server>> {
        self.server.as_ref()
    }

    pub fn backend_conn(&self) -> Option<&BackendConnection> {
        self.backend.as_ref()
    }

    pub fn is_hung_up(&self) -> bool {
        self.hung_up
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    pub fn fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }

    pub fn last_read(&self) -> Instant {
        self.last_read
    }

    pub fn last_write(&self) -> Instant {
        self.last_write
    }

    /// Read everything the socket has into the read queue. Edge-triggered
    /// registration requires draining until EAGAIN.
    pub fn read_available(&mut self) -> io::Result<ReadOutcome> {
        let mut chunk = [0u8; READ_CHUNK];
        let mut outcome = ReadOutcome::default();
        loop {
            match (&self.socket).read(&mut chunk) {
                Ok(0) => {
                    outcome.eof = true;
                    break;
                }
                Ok(n) => {
                    self.readq.extend_from_slice(&chunk[..n]);
                    outcome.bytes += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        if outcome.bytes > 0 {
            self.last_read = Instant::now();
        }
        Ok(outcome)
    }

    /// Write as much of the write queue as the socket accepts.
    pub fn flush(&mut self) -> io::Result<usize> {
        let mut written = 0;
        while !self.writeq.is_empty() {
            match self.socket.send_with_flags(&self.writeq, libc::MSG_NOSIGNAL) {
                Ok(n) => {
                    self.writeq.drain(..n);
                    written += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        if written > 0 {
            self.last_write = Instant::now();
        }
        Ok(written)
    }

    /// Queue `data` and try to send it right away.
    pub fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.writeq.extend_from_slice(data);
        self.flush()
    }

    pub fn take_error(&self) -> Option<io::Error> {
        self.socket.take_error().ok().flatten()
    }

    pub(crate) fn shutdown(&self) {
        let _ = self.socket.shutdown(std::net::Shutdown::Both);
    }

    /// Forget buffered data and the session link before the descriptor is
    /// parked in the pool.
    pub(crate) fn clear(&mut self) {
        self.readq.clear();
        self.writeq.clear();
        self.session = None;
    }
}

//! Listening sockets and the shared epoll set all workers poll.

use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::{Arc, RwLock};

use slab::Slab;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use crate::poll::{self, Epoll};
use crate::session::SessionFactory;

const LISTEN_BACKLOG: i32 = 1024;

/// A bound listening socket and the factory for the sessions it accepts.
pub struct Listener {
    name: String,
    socket: Socket,
    factory: Arc<dyn SessionFactory>,
}

impl Listener {
    /// Bind a non-blocking TCP listener with `SO_REUSEADDR` and `SO_REUSEPORT`.
    pub fn bind_tcp(
        name: impl Into<String>,
        addr: SocketAddr,
        factory: Arc<dyn SessionFactory>,
    ) -> io::Result<Self> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.set_reuse_port(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(LISTEN_BACKLOG)?;
        Ok(Self {
            name: name.into(),
            socket,
            factory,
        })
    }

    /// Bind a non-blocking Unix domain listener at `path`.
    pub fn bind_unix(
        name: impl Into<String>,
        path: &std::path::Path,
        factory: Arc<dyn SessionFactory>,
    ) -> io::Result<Self> {
        let socket = Socket::new(Domain::UNIX, Type::STREAM, None)?;
        socket.set_nonblocking(true)?;
        socket.bind(&SockAddr::unix(path)?)?;
        socket.listen(LISTEN_BACKLOG)?;
        Ok(Self {
            name: name.into(),
            socket,
            factory,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_addr(&self) -> io::Result<SockAddr> {
        self.socket.local_addr()
    }

    pub fn factory(&self) -> &Arc<dyn SessionFactory> {
        &self.factory
    }

    /// Accept one client as a non-blocking socket.
    pub fn accept(&self) -> io::Result<(Socket, String)> {
        let (socket, addr) = self.socket.accept()?;
        socket.set_nonblocking(true)?;
        let remote = match addr.as_socket() {
            Some(addr) => {
                socket.set_nodelay(true)?;
                addr.to_string()
            }
            None => "localhost".to_string(),
        };
        Ok((socket, remote))
    }
}

impl AsRawFd for Listener {
    fn as_raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}

/// Listeners registered on one epoll set that every worker has added to its
/// own set. Whichever worker wakes first takes the next ready listener.
pub struct SharedListeners {
    epoll: Epoll,
    listeners: RwLock<Slab<Arc<Listener>>>,
}

impl SharedListeners {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            epoll: Epoll::new()?,
            listeners: RwLock::new(Slab::new()),
        })
    }

    pub fn fd(&self) -> RawFd {
        self.epoll.as_raw_fd()
    }

    /// Register a listener. Listeners are always level-triggered so a
    /// connection one worker did not accept wakes another.
    pub fn add(&self, listener: Listener) -> io::Result<usize> {
        let mut listeners = self.listeners.write().unwrap_or_else(|e| e.into_inner());
        let entry = listeners.vacant_entry();
        let key = entry.key();
        self.epoll.add(listener.as_raw_fd(), poll::IN & !poll::ET, key as u64)?;
        entry.insert(Arc::new(listener));
        Ok(key)
    }

    pub fn remove(&self, key: usize) -> bool {
        let mut listeners = self.listeners.write().unwrap_or_else(|e| e.into_inner());
        match listeners.try_remove(key) {
            Some(listener) => {
                let _ = self.epoll.delete(listener.as_raw_fd());
                true
            }
            None => false,
        }
    }

    pub fn remove_all(&self) -> usize {
        let mut listeners = self.listeners.write().unwrap_or_else(|e| e.into_inner());
        for (_, listener) in listeners.iter() {
            let _ = self.epoll.delete(listener.as_raw_fd());
        }
        let n = listeners.len();
        listeners.clear();
        n
    }

    pub fn len(&self) -> usize {
        self.listeners.read().map(|l| l.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The next listener with a pending connection, without blocking.
    pub fn next_ready(&self) -> io::Result<Option<Arc<Listener>>> {
        let mut events = Vec::with_capacity(1);
        self.epoll.wait(&mut events, 0)?;
        let Some(ev) = events.first().copied() else {
            return Ok(None);
        };
        let key = ev.u64 as usize;
        let listeners = self.listeners.read().unwrap_or_else(|e| e.into_inner());
        Ok(listeners.get(key).cloned())
    }
}

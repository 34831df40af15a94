//! Backend servers as seen by the routing workers: address, status bits
//! maintained by monitors, connection pool settings and pool statistics.

use std::fmt;
use std::io;
use std::net::ToSocketAddrs;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use crate::backend::TlsContext;

/// Server status bits. Monitors set them; the pool only reads them.
pub mod status {
    pub const RUNNING: u64 = 1 << 0;
    pub const MAINTENANCE: u64 = 1 << 1;
    pub const MASTER: u64 = 1 << 2;
    pub const SLAVE: u64 = 1 << 3;
    pub const DRAINING: u64 = 1 << 4;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerAddress {
    Tcp { host: String, port: u16 },
    Unix(PathBuf),
}

impl ServerAddress {
    /// `host:port`, `[v6]:port` or an absolute Unix socket path.
    pub fn parse(s: &str) -> Option<Self> {
        if s.starts_with('/') {
            return Some(Self::Unix(PathBuf::from(s)));
        }
        let (host, port) = s.rsplit_once(':')?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return None;
        }
        Some(Self::Tcp {
            host: host.to_string(),
            port: port.parse().ok()?,
        })
    }

    /// Open a non-blocking socket and start connecting. The connection may
    /// still be in progress when this returns.
    pub fn connect(&self) -> io::Result<Socket> {
        let (socket, addr) = match self {
            Self::Tcp { host, port } => {
                let addr = (host.as_str(), *port)
                    .to_socket_addrs()?
                    .next()
                    .ok_or_else(|| {
                        io::Error::new(io::ErrorKind::NotFound, format!("cannot resolve {host}"))
                    })?;
                let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
                socket.set_nodelay(true)?;
                (socket, SockAddr::from(addr))
            }
            Self::Unix(path) => (Socket::new(Domain::UNIX, Type::STREAM, None)?, SockAddr::unix(path)?),
        };
        socket.set_nonblocking(true)?;
        match socket.connect(&addr) {
            Ok(()) => Ok(socket),
            Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => Ok(socket),
            Err(e) => Err(e),
        }
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp { host, port } if host.contains(':') => write!(f, "[{host}]:{port}"),
            Self::Tcp { host, port } => write!(f, "{host}:{port}"),
            Self::Unix(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Atomically add `delta` to `counter` unless the result would exceed `limit`.
pub fn add_limited(counter: &AtomicUsize, delta: usize, limit: usize) -> bool {
    let mut current = counter.load(Ordering::Relaxed);
    loop {
        let Some(next) = current.checked_add(delta).filter(|&n| n <= limit) else {
            return false;
        };
        match counter.compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Relaxed) {
            Ok(_) => return true,
            Err(actual) => current = actual,
        }
    }
}

fn update_max(target: &AtomicUsize, value: usize) {
    let mut prev = target.load(Ordering::Relaxed);
    while value > prev {
        match target.compare_exchange_weak(prev, value, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => break,
            Err(next) => prev = next,
        }
    }
}

/// Connection pool counters, shared by all workers.
#[derive(Debug, Default)]
pub struct PoolStats {
    n_persistent: AtomicUsize,
    persistmax: AtomicUsize,
    n_from_pool: AtomicU64,
    n_new_conn: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStatsSnapshot {
    /// Connections currently pooled across all workers.
    pub n_persistent: usize,
    /// Largest pool size observed by an eviction sweep.
    pub persistmax: usize,
    /// Connections handed out from a pool.
    pub n_from_pool: u64,
    /// Connections created because no pooled one was available.
    pub n_new_conn: u64,
}

impl PoolStats {
    pub fn snapshot(&self) -> PoolStatsSnapshot {
        PoolStatsSnapshot {
            n_persistent: self.n_persistent.load(Ordering::Relaxed),
            persistmax: self.persistmax.load(Ordering::Relaxed),
            n_from_pool: self.n_from_pool.load(Ordering::Relaxed),
            n_new_conn: self.n_new_conn.load(Ordering::Relaxed),
        }
    }

    pub fn n_persistent(&self) -> usize {
        self.n_persistent.load(Ordering::Relaxed)
    }

    pub(crate) fn try_add_persistent(&self, limit: usize) -> bool {
        add_limited(&self.n_persistent, 1, limit)
    }

    pub(crate) fn remove_persistent(&self) {
        let _ = self
            .n_persistent
            .fetch_update(Ordering::AcqRel, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub(crate) fn update_persistmax(&self, count: usize) {
        update_max(&self.persistmax, count);
    }

    pub(crate) fn inc_from_pool(&self) {
        self.n_from_pool.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_new_conn(&self) {
        self.n_new_conn.fetch_add(1, Ordering::Relaxed);
    }
}

pub struct Server {
    name: String,
    address: ServerAddress,
    status: AtomicU64,
    persistpoolmax: AtomicUsize,
    persistmaxtime_secs: AtomicU64,
    stats: PoolStats,
    tls: Option<Arc<dyn TlsContext>>,
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("name", &self.name)
            .field("address", &self.address)
            .field("status", &self.status_string())
            .field("persistpoolmax", &self.persistpoolmax())
            .finish()
    }
}

impl Server {
    pub fn new(name: impl Into<String>, address: ServerAddress) -> Self {
        Self {
            name: name.into(),
            address,
            status: AtomicU64::new(0),
            persistpoolmax: AtomicUsize::new(0),
            persistmaxtime_secs: AtomicU64::new(0),
            stats: PoolStats::default(),
            tls: None,
        }
    }

    pub fn with_pool(self, persistpoolmax: usize, persistmaxtime: Duration) -> Self {
        self.set_persistpoolmax(persistpoolmax);
        self.set_persistmaxtime(persistmaxtime);
        self
    }

    pub fn with_tls(mut self, tls: Arc<dyn TlsContext>) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> &ServerAddress {
        &self.address
    }

    pub fn tls(&self) -> Option<&Arc<dyn TlsContext>> {
        self.tls.as_ref()
    }

    pub fn status(&self) -> u64 {
        self.status.load(Ordering::Acquire)
    }

    pub fn set_status(&self, bits: u64) {
        self.status.fetch_or(bits, Ordering::AcqRel);
    }

    pub fn clear_status(&self, bits: u64) {
        self.status.fetch_and(!bits, Ordering::AcqRel);
    }

    /// Running and not in maintenance.
    pub fn is_running(&self) -> bool {
        let s = self.status();
        s & status::RUNNING != 0 && s & status::MAINTENANCE == 0
    }

    pub fn is_in_maintenance(&self) -> bool {
        self.status() & status::MAINTENANCE != 0
    }

    pub fn status_string(&self) -> String {
        const NAMES: [(u64, &str); 5] = [
            (status::MAINTENANCE, "Maintenance"),
            (status::DRAINING, "Draining"),
            (status::MASTER, "Master"),
            (status::SLAVE, "Slave"),
            (status::RUNNING, "Running"),
        ];
        let s = self.status();
        let names: Vec<&str> = NAMES
            .iter()
            .filter(|(bit, _)| s & bit != 0)
            .map(|(_, name)| *name)
            .collect();
        if names.is_empty() {
            "Down".to_string()
        } else {
            names.join(", ")
        }
    }

    pub fn persistpoolmax(&self) -> usize {
        self.persistpoolmax.load(Ordering::Relaxed)
    }

    pub fn set_persistpoolmax(&self, max: usize) {
        self.persistpoolmax.store(max, Ordering::Relaxed);
    }

    pub fn persistmaxtime(&self) -> Duration {
        Duration::from_secs(self.persistmaxtime_secs.load(Ordering::Relaxed))
    }

    pub fn set_persistmaxtime(&self, time: Duration) {
        self.persistmaxtime_secs
            .store(time.as_secs(), Ordering::Relaxed);
    }

    pub fn persistent_conns_enabled(&self) -> bool {
        self.persistpoolmax() > 0
    }

    pub fn stats(&self) -> &PoolStats {
        &self.stats
    }
}

//! Per-worker persistent pool of idle backend connections.
//!
//! A backend connection whose session ends may be parked here instead of
//! being closed, provided it is fully established and the server-wide count
//! of pooled connections stays within `persistpoolmax`. A pooled descriptor
//! stays registered with epoll under the [`Handler::Pool`] handler, so any
//! activity on it (data, error, hang-up) evicts it. The next session on the
//! same worker that needs the server takes the oldest entry and
//! re-authenticates it with `COM_CHANGE_USER`.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info};

use crate::dcb::{DcbId, DcbState, Handler};
use crate::error::Error;
use crate::server::Server;
use crate::session::SessionId;
use crate::worker::RoutingWorker;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Evict {
    /// Only hung up, expired or surplus entries.
    Expired,
    All,
}

#[derive(Debug, Clone, Copy)]
struct PooledEntry {
    created: Instant,
    dcb: DcbId,
}

struct ServerPool {
    server: Arc<Server>,
    entries: VecDeque<PooledEntry>,
}

#[derive(Default)]
pub struct PersistentPool {
    servers: HashMap<String, ServerPool>,
    /// Set while evicted connections are being closed, so that closing them
    /// does not put them straight back.
    evicting: bool,
}

impl PersistentPool {
    /// Pooled connections on this worker.
    pub fn len(&self) -> usize {
        self.servers.values().map(|p| p.entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn server_len(&self, server: &str) -> usize {
        self.servers.get(server).map_or(0, |p| p.entries.len())
    }

    pub fn contains(&self, id: DcbId) -> bool {
        self.servers.values().any(|p| p.entries.iter().any(|e| e.dcb == id))
    }

    pub fn is_evicting(&self) -> bool {
        self.evicting
    }
}

impl RoutingWorker {
    /// Decide the fate of a backend descriptor being closed. Returns false
    /// if it was moved into the pool instead.
    pub(crate) fn can_be_destroyed(&mut self, id: DcbId) -> bool {
        if self.pool.evicting {
            return true;
        }
        let Some(dcb) = self.dcbs.get(id) else {
            return true;
        };
        if dcb.state != DcbState::Polling || dcb.handler != Handler::Protocol || dcb.hung_up {
            return true;
        }
        let (Some(server), Some(conn)) = (dcb.server().cloned(), dcb.backend_conn()) else {
            return true;
        };
        if !conn.established() {
            return true;
        }
        let valid_for_pool = dcb
            .session
            .and_then(|sid| self.sessions.get(&sid))
            .is_some_and(|entry| entry.session.valid_for_pool());
        if !valid_for_pool {
            return true;
        }
        let persistpoolmax = server.persistpoolmax();
        if persistpoolmax == 0 || !server.is_running() {
            return true;
        }
        if self.evict_dcbs(&server, Evict::Expired) >= persistpoolmax {
            return true;
        }
        if !server.stats().try_add_persistent(persistpoolmax) {
            return true;
        }

        let dcb = &mut self.dcbs[id];
        dcb.clear();
        dcb.handler = Handler::Pool;
        self.live.remove(&id);
        self.pool
            .servers
            .entry(server.name().to_string())
            .or_insert_with(|| ServerPool {
                server: Arc::clone(&server),
                entries: VecDeque::new(),
            })
            .entries
            .push_back(PooledEntry {
                created: Instant::now(),
                dcb: id,
            });
        debug!(worker = self.id(), server = server.name(), dcb = id, "backend connection pooled");
        false
    }

    /// Take the oldest reusable pooled connection to `server` for session
    /// `sid`. Connections that cannot be re-authenticated are closed and the
    /// next one is tried.
    pub(crate) fn get_backend_dcb_from_pool(&mut self, server: &Arc<Server>, sid: SessionId) -> Option<DcbId> {
        self.evict_dcbs(server, Evict::Expired);
        let worker = self.id();

        loop {
            let session = &self.sessions.get(&sid)?.session;
            let credentials = session.credentials();
            let authenticator = session.authenticator();
            let init_sql = session.connection_init_sql();

            let entry = self
                .pool
                .servers
                .get_mut(server.name())
                .and_then(|p| p.entries.pop_front())?;
            server.stats().remove_persistent();
            let id = entry.dcb;

            let Some(dcb) = self.dcbs.get_mut(id) else {
                continue;
            };
            dcb.handler = Handler::Protocol;
            dcb.session = Some(sid);
            self.live.insert(id);

            let reused = match dcb.backend.as_mut() {
                Some(conn) => conn.reuse_connection(credentials, authenticator, init_sql, &mut dcb.writeq),
                None => Err(Error::NotReusable("not a backend connection")),
            }
            .and_then(|()| dcb.flush().map(drop).map_err(Error::from));

            match reused {
                Ok(()) => {
                    server.stats().inc_from_pool();
                    debug!(worker, server = server.name(), session = sid, dcb = id, "reusing pooled connection");
                    return Some(id);
                }
                Err(e) => {
                    dcb.session = None;
                    info!(worker, server = server.name(), "failed to reuse pooled connection: {e}");
                    let evicting = std::mem::replace(&mut self.pool.evicting, true);
                    self.close(id);
                    self.pool.evicting = evicting;
                }
            }
        }
    }

    /// Evict pooled connections to `server`. Returns the number kept.
    pub(crate) fn evict_dcbs(&mut self, server: &Arc<Server>, mode: Evict) -> usize {
        let evicting = std::mem::replace(&mut self.pool.evicting, true);
        let mode = if server.is_running() { mode } else { Evict::All };
        let persistpoolmax = server.persistpoolmax();
        let persistmaxtime = server.persistmaxtime();
        let now = Instant::now();

        let mut evicted = Vec::new();
        let mut kept = 0;
        if let Some(pool) = self.pool.servers.get_mut(server.name()) {
            let dcbs = &self.dcbs;
            pool.entries.retain(|entry| {
                let hung_up = dcbs.get(entry.dcb).is_none_or(|d| d.hung_up);
                let expired = mode == Evict::All || now.duration_since(entry.created) > persistmaxtime;
                let too_many = kept >= persistpoolmax;
                if hung_up || expired || too_many {
                    evicted.push(entry.dcb);
                    false
                } else {
                    kept += 1;
                    true
                }
            });
        }
        server.stats().update_persistmax(kept);

        for id in evicted {
            server.stats().remove_persistent();
            self.close_pooled_dcb(id);
        }
        self.pool.evicting = evicting;
        kept
    }

    /// Run [`evict_dcbs`](Self::evict_dcbs) for every server with a pool on
    /// this worker.
    pub fn evict_all(&mut self, mode: Evict) {
        let servers: Vec<Arc<Server>> = self.pool.servers.values().map(|p| Arc::clone(&p.server)).collect();
        for server in servers {
            self.evict_dcbs(&server, mode);
        }
    }

    /// Evict one pooled descriptor that showed activity.
    pub(crate) fn evict_dcb(&mut self, id: DcbId) {
        let evicting = std::mem::replace(&mut self.pool.evicting, true);
        let server = self.dcbs.get(id).and_then(|d| d.server().cloned());
        if let Some(server) = server {
            if let Some(pool) = self.pool.servers.get_mut(server.name()) {
                let before = pool.entries.len();
                pool.entries.retain(|e| e.dcb != id);
                if pool.entries.len() < before {
                    server.stats().remove_persistent();
                }
            }
            debug!(worker = self.id(), server = server.name(), dcb = id, "evicting pooled connection");
        }
        self.close_pooled_dcb(id);
        self.pool.evicting = evicting;
    }

    fn close_pooled_dcb(&mut self, id: DcbId) {
        if !self.dcbs.contains(id) {
            return;
        }
        // Back into regular bookkeeping so close() finds it there.
        self.live.insert(id);
        self.close(id);
    }

    /// Pooled connections to `server` on this worker.
    pub fn pool_len(&self, server: &str) -> usize {
        self.pool.server_len(server)
    }

    pub fn is_pooled(&self, id: DcbId) -> bool {
        self.pool.contains(id)
    }

    pub fn pool(&self) -> &PersistentPool {
        &self.pool
    }
}

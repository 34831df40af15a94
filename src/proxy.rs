//! A minimal pass-through session used by the `shardproxy` binary.
//!
//! Client authentication belongs to another layer, so the session greets the
//! client, accepts whatever handshake response it gets and then forwards
//! every command to the first running server using the service's own
//! backend credentials.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{debug, info};

use crate::auth::{self, Credentials};
use crate::backend::{BackendError, ConnectionInitSql};
use crate::constants::*;
use crate::protocol::{self, ClientHello, ServerHandshake};
use crate::reply;
use crate::server::Server;
use crate::session::{Action, Session, SessionFactory, SessionId};

const SERVER_VERSION: &str = "10.11.0-shardproxy";

/// What a listener's sessions route to.
pub struct Service {
    pub name: String,
    pub servers: Vec<Arc<Server>>,
    pub credentials: Arc<Credentials>,
    pub init_sql: Option<Arc<ConnectionInitSql>>,
    /// Zero disables the idle check.
    pub idle_timeout: Duration,
}

pub struct ProxyService {
    service: Arc<Service>,
}

impl ProxyService {
    pub fn new(service: Service) -> Self {
        Self {
            service: Arc::new(service),
        }
    }

    pub fn service(&self) -> &Arc<Service> {
        &self.service
    }
}

impl SessionFactory for ProxyService {
    fn create(&self, id: SessionId, remote: &str) -> Box<dyn Session> {
        debug!(service = %self.service.name, session = id, remote, "new session");
        Box::new(ProxySession::new(id, Arc::clone(&self.service)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Greeting sent, waiting for the handshake response.
    Greeting,
    Routing,
}

pub struct ProxySession {
    id: SessionId,
    service: Arc<Service>,
    credentials: Arc<Credentials>,
    phase: Phase,
    scramble: [u8; SCRAMBLE_LEN],
    /// Server the session routes to, kept while it stays running.
    target: Option<Arc<Server>>,
    awaiting_reply: bool,
}

impl ProxySession {
    pub fn new(id: SessionId, service: Arc<Service>) -> Self {
        let credentials = Arc::clone(&service.credentials);
        Self {
            id,
            service,
            credentials,
            phase: Phase::Greeting,
            scramble: scramble_for(id),
            target: None,
            awaiting_reply: false,
        }
    }

    fn greeting(&self) -> Vec<u8> {
        let hs = ServerHandshake {
            server_version: SERVER_VERSION.to_string(),
            thread_id: self.id as u32,
            scramble: self.scramble,
            capabilities: DEFAULT_CAPABILITIES,
            charset: DEFAULT_CHARSET,
            status: SERVER_STATUS_AUTOCOMMIT,
            auth_plugin: DEFAULT_AUTH_PLUGIN.to_string(),
        };
        protocol::packet(0, &hs.encode())
    }

    fn handshake_response(&mut self, packet: &[u8], actions: &mut Vec<Action>) {
        let seq = protocol::sequence(packet).wrapping_add(1);
        let Some(hello) = ClientHello::parse(&packet[HEADER_LEN..]) else {
            actions.push(Action::Reply(protocol::err_packet(seq, ER_ACCESS_DENIED_ERROR, "08S01", "Bad handshake")));
            actions.push(Action::Close);
            return;
        };
        if let Some(db) = hello.database {
            let mut credentials = (*self.credentials).clone();
            credentials.database = Some(db);
            self.credentials = Arc::new(credentials);
        }
        debug!(session = self.id, user = %hello.user, "client handshake accepted");
        self.phase = Phase::Routing;
        actions.push(Action::Reply(protocol::ok_packet(seq, SERVER_STATUS_AUTOCOMMIT)));
    }

    fn pick_server(&mut self) -> Option<Arc<Server>> {
        if let Some(target) = self.target.as_ref().filter(|s| s.is_running()) {
            return Some(Arc::clone(target));
        }
        self.target = self.service.servers.iter().find(|s| s.is_running()).cloned();
        self.target.clone()
    }

    fn route(&mut self, packet: &[u8], actions: &mut Vec<Action>) {
        let command = protocol::command(packet).unwrap_or(0);
        if command == COM_QUIT {
            if let Some(server) = self.target.clone() {
                actions.push(Action::Route {
                    server,
                    packet: packet.to_vec(),
                });
            }
            actions.push(Action::Close);
            return;
        }
        let Some(server) = self.pick_server() else {
            actions.push(Action::Reply(protocol::err_packet(
                1,
                ER_CONNECTION_KILLED,
                "HY000",
                "No running backend server available",
            )));
            return;
        };
        if reply::will_respond(command) {
            self.awaiting_reply = true;
        }
        actions.push(Action::Route {
            server,
            packet: packet.to_vec(),
        });
    }
}

/// Printable 20-byte scramble, unique per session.
fn scramble_for(id: SessionId) -> [u8; SCRAMBLE_LEN] {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let digest = auth::sha1(&[&id.to_le_bytes(), &nanos.to_le_bytes()]);
    let mut scramble = [0u8; SCRAMBLE_LEN];
    for (dst, src) in scramble.iter_mut().zip(digest) {
        *dst = b'!' + src % 94;
    }
    scramble
}

impl Session for ProxySession {
    fn id(&self) -> SessionId {
        self.id
    }

    fn credentials(&self) -> Arc<Credentials> {
        Arc::clone(&self.credentials)
    }

    fn connection_init_sql(&self) -> Option<Arc<ConnectionInitSql>> {
        self.service.init_sql.clone()
    }

    fn on_connect(&mut self, actions: &mut Vec<Action>) {
        actions.push(Action::Reply(self.greeting()));
    }

    fn on_client_data(&mut self, packets: &[u8], actions: &mut Vec<Action>) {
        let mut rest = packets;
        while let Some(len) = protocol::logical_packet_len(rest) {
            let (packet, tail) = rest.split_at(len);
            rest = tail;
            match self.phase {
                Phase::Greeting => self.handshake_response(packet, actions),
                Phase::Routing => self.route(packet, actions),
            }
            if matches!(actions.last(), Some(Action::Close)) {
                return;
            }
        }
    }

    fn on_backend_reply(&mut self, _server: &Arc<Server>, data: Vec<u8>, complete: bool, actions: &mut Vec<Action>) {
        if complete {
            self.awaiting_reply = false;
        }
        actions.push(Action::Reply(data));
    }

    fn on_backend_error(&mut self, error: &BackendError, actions: &mut Vec<Action>) -> bool {
        if self.awaiting_reply {
            self.awaiting_reply = false;
            actions.push(Action::Reply(protocol::err_packet(
                1,
                ER_CONNECTION_KILLED,
                "HY000",
                &format!("Lost connection to backend server: {}", error.message),
            )));
        }
        false
    }

    fn tick(&mut self, idle: Duration, actions: &mut Vec<Action>) {
        let timeout = self.service.idle_timeout;
        if !timeout.is_zero() && idle > timeout {
            info!(session = self.id, idle_secs = idle.as_secs(), "closing idle session");
            actions.push(Action::Close);
        }
    }

    fn valid_for_pool(&self) -> bool {
        !self.awaiting_reply
    }

    fn is_movable(&self) -> bool {
        self.phase == Phase::Routing && !self.awaiting_reply
    }
}

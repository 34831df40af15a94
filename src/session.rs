//! The seam between routing workers and the session/router layer.
//!
//! Workers own sockets and drive I/O; sessions decide what the bytes mean.
//! Every callback receives an action list that the worker applies once the
//! callback has returned, so a session never re-enters its worker.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::auth::{BackendAuthenticator, Credentials, NativePasswordAuthenticator};
use crate::backend::{BackendError, ConnectionInitSql};
use crate::server::Server;

pub type SessionId = u64;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-wide unique session id. Ids stay valid when a session migrates.
pub fn next_session_id() -> SessionId {
    NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Clone)]
pub enum Action {
    /// Bytes for the client.
    Reply(Vec<u8>),
    /// One logical packet for `server`. The worker picks a pooled connection
    /// or creates one if the session has none to that server yet.
    Route { server: Arc<Server>, packet: Vec<u8> },
    /// End the session.
    Close,
}

pub trait Session: Send {
    fn id(&self) -> SessionId;

    /// Identity used to authenticate backend connections.
    fn credentials(&self) -> Arc<Credentials>;

    /// Backend side of the authentication plugin of this session.
    fn authenticator(&self) -> Box<dyn BackendAuthenticator> {
        Box::new(NativePasswordAuthenticator)
    }

    fn connection_init_sql(&self) -> Option<Arc<ConnectionInitSql>> {
        None
    }

    fn on_connect(&mut self, _actions: &mut Vec<Action>) {}

    /// `packets` holds only complete logical packets.
    fn on_client_data(&mut self, packets: &[u8], actions: &mut Vec<Action>);

    fn on_backend_reply(
        &mut self,
        server: &Arc<Server>,
        data: Vec<u8>,
        complete: bool,
        actions: &mut Vec<Action>,
    );

    /// A backend connection failed and has been closed. Returning `false`
    /// closes the session.
    fn on_backend_error(&mut self, error: &BackendError, actions: &mut Vec<Action>) -> bool;

    /// Called about once per second with the time since the client last sent
    /// anything.
    fn tick(&mut self, _idle: Duration, _actions: &mut Vec<Action>) {}

    /// Whether the session's backend connections may be pooled when it ends.
    fn valid_for_pool(&self) -> bool {
        true
    }

    /// Whether the session may be migrated to another worker right now.
    fn is_movable(&self) -> bool {
        true
    }
}

/// Creates sessions for clients accepted by a listener.
pub trait SessionFactory: Send + Sync {
    fn create(&self, id: SessionId, remote: &str) -> Box<dyn Session>;
}

#![allow(dead_code)]

use std::io::{ErrorKind, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use socket2::Socket;

use shardproxy::auth::Credentials;
use shardproxy::backend::BackendError;
use shardproxy::constants::*;
use shardproxy::dcb::DcbId;
use shardproxy::protocol::{self, Packet, ServerHandshake};
use shardproxy::server::{Server, ServerAddress, status};
use shardproxy::session::{Action, Session, SessionId, next_session_id};
use shardproxy::worker::RoutingWorker;

/// Poll iterations before a helper gives up waiting.
const MAX_PUMPS: usize = 1000;
const PUMP_TIMEOUT: Duration = Duration::from_millis(2);

pub fn pump(worker: &mut RoutingWorker, n: usize) {
    for _ in 0..n {
        worker.poll_once(PUMP_TIMEOUT);
    }
}

/// Poll `worker` until `done` holds.
pub fn pump_until(worker: &mut RoutingWorker, what: &str, mut done: impl FnMut(&RoutingWorker) -> bool) {
    for _ in 0..MAX_PUMPS {
        if done(worker) {
            return;
        }
        worker.poll_once(PUMP_TIMEOUT);
    }
    panic!("timed out waiting for {what}");
}

/// The test's end of a socket the worker owns the other end of.
pub struct Peer {
    stream: UnixStream,
    buf: Vec<u8>,
}

/// A connected pair: a non-blocking socket for the worker and the peer.
pub fn pair() -> (Socket, Peer) {
    let (ours, theirs) = UnixStream::pair().expect("socketpair");
    ours.set_nonblocking(true).unwrap();
    theirs.set_nonblocking(true).unwrap();
    (Socket::from(ours), Peer::new(theirs))
}

impl Peer {
    pub fn new(stream: UnixStream) -> Self {
        stream.set_nonblocking(true).unwrap();
        Self {
            stream,
            buf: Vec::new(),
        }
    }

    pub fn send(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).expect("peer write");
    }

    /// Read whatever is available. Returns false on EOF.
    fn fill(&mut self) -> bool {
        let mut chunk = [0u8; 4096];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => return false,
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => return true,
                Err(e) if e.kind() == ErrorKind::ConnectionReset => return false,
                Err(e) => panic!("peer read: {e}"),
            }
        }
    }

    pub fn try_packet(&mut self) -> Option<Packet> {
        self.fill();
        protocol::read_packet(&mut self.buf)
    }

    /// Poll `worker` until a whole packet arrives.
    pub fn recv(&mut self, worker: &mut RoutingWorker) -> Packet {
        for _ in 0..MAX_PUMPS {
            if let Some(packet) = self.try_packet() {
                return packet;
            }
            worker.poll_once(PUMP_TIMEOUT);
        }
        panic!("timed out waiting for a packet");
    }

    /// Poll `worker` until the worker side is closed, discarding data.
    pub fn wait_closed(&mut self, worker: &mut RoutingWorker) {
        for _ in 0..MAX_PUMPS {
            if !self.fill() {
                return;
            }
            worker.poll_once(PUMP_TIMEOUT);
        }
        panic!("timed out waiting for the worker to close the connection");
    }

    pub fn pending(&mut self) -> usize {
        self.fill();
        self.buf.len()
    }
}

pub fn handshake_packet(thread_id: u32) -> Vec<u8> {
    let hs = ServerHandshake {
        server_version: "10.11.6-MariaDB".into(),
        thread_id,
        scramble: *b"abcdefghij0123456789",
        capabilities: DEFAULT_CAPABILITIES,
        charset: DEFAULT_CHARSET,
        status: SERVER_STATUS_AUTOCOMMIT,
        auth_plugin: DEFAULT_AUTH_PLUGIN.into(),
    };
    protocol::packet(0, &hs.encode())
}

/// A running server with pooling configured. The address is only used for
/// fresh connections.
pub fn running_server(name: &str, address: &str, persistpoolmax: usize, persistmaxtime: Duration) -> Arc<Server> {
    let server = Server::new(name, ServerAddress::parse(address).expect("server address"))
        .with_pool(persistpoolmax, persistmaxtime);
    server.set_status(status::RUNNING);
    Arc::new(server)
}

/// Play the server side of a fresh connection on `peer` until the backend
/// connection is routing.
pub fn serve_handshake(worker: &mut RoutingWorker, id: DcbId, peer: &mut Peer, thread_id: u32) {
    peer.send(&handshake_packet(thread_id));
    let response = peer.recv(worker);
    assert_eq!(response.seq, 1, "handshake response sequence");
    peer.send(&protocol::ok_packet(2, SERVER_STATUS_AUTOCOMMIT));
    pump_until(worker, "backend connection to be established", |w| {
        w.dcb(id)
            .and_then(|d| d.backend_conn())
            .is_some_and(|c| c.established())
    });
    // Let the write-space wakeups caused by the peer's reads arrive.
    pump(worker, 3);
}

/// Attach an established backend connection to `server` for session `sid`.
pub fn establish(worker: &mut RoutingWorker, server: &Arc<Server>, sid: SessionId) -> (DcbId, Peer) {
    let (socket, mut peer) = pair();
    let id = worker
        .attach_backend_socket(sid, server, socket)
        .expect("attach backend");
    serve_handshake(worker, id, &mut peer, sid as u32);
    (id, peer)
}

/// Serve the COM_CHANGE_USER a pooled connection sends when it is reused.
pub fn serve_change_user(worker: &mut RoutingWorker, peer: &mut Peer) {
    let change_user = peer.recv(worker);
    assert_eq!(change_user.first_byte(), Some(COM_CHANGE_USER));
    peer.send(&protocol::ok_packet(1, SERVER_STATUS_AUTOCOMMIT));
}

static NEXT_PATH: AtomicUsize = AtomicUsize::new(0);

/// A fresh Unix socket path under the temp dir.
pub fn socket_path(tag: &str) -> PathBuf {
    let n = NEXT_PATH.fetch_add(1, Ordering::Relaxed);
    let path = std::env::temp_dir().join(format!("shardproxy-{tag}-{}-{n}.sock", std::process::id()));
    let _ = std::fs::remove_file(&path);
    path
}

#[derive(Debug, Clone)]
pub enum Seen {
    Client(Vec<u8>),
    Reply { data: Vec<u8>, complete: bool },
    Error(BackendError),
    Tick(Duration),
}

/// Shared view of what a [`TestSession`] saw.
#[derive(Clone, Default)]
pub struct Recorder {
    seen: Arc<Mutex<Vec<Seen>>>,
    not_poolable: Arc<AtomicBool>,
    not_movable: Arc<AtomicBool>,
}

impl Recorder {
    pub fn seen(&self) -> Vec<Seen> {
        self.seen.lock().unwrap().clone()
    }

    pub fn client_packets(&self) -> usize {
        self.seen().iter().filter(|s| matches!(s, Seen::Client(_))).count()
    }

    pub fn errors(&self) -> Vec<BackendError> {
        self.seen()
            .into_iter()
            .filter_map(|s| match s {
                Seen::Error(e) => Some(e),
                _ => None,
            })
            .collect()
    }

    pub fn set_poolable(&self, poolable: bool) {
        self.not_poolable.store(!poolable, Ordering::Relaxed);
    }

    pub fn set_movable(&self, movable: bool) {
        self.not_movable.store(!movable, Ordering::Relaxed);
    }
}

/// Session that records every callback. With a route target it forwards
/// client packets there and backend replies to the client.
pub struct TestSession {
    id: SessionId,
    credentials: Arc<Credentials>,
    route_to: Option<Arc<Server>>,
    recorder: Recorder,
}

impl TestSession {
    pub fn new(route_to: Option<Arc<Server>>) -> (Box<dyn Session>, Recorder) {
        let recorder = Recorder::default();
        let session = Self {
            id: next_session_id(),
            credentials: Arc::new(Credentials::new("app", "secret").with_database("shop")),
            route_to,
            recorder: recorder.clone(),
        };
        (Box::new(session), recorder)
    }

    fn record(&self, seen: Seen) {
        self.recorder.seen.lock().unwrap().push(seen);
    }
}

impl Session for TestSession {
    fn id(&self) -> SessionId {
        self.id
    }

    fn credentials(&self) -> Arc<Credentials> {
        Arc::clone(&self.credentials)
    }

    fn on_client_data(&mut self, packets: &[u8], actions: &mut Vec<Action>) {
        let mut rest = packets;
        while let Some(len) = protocol::logical_packet_len(rest) {
            let (packet, tail) = rest.split_at(len);
            rest = tail;
            self.record(Seen::Client(packet.to_vec()));
            if let Some(server) = &self.route_to {
                actions.push(Action::Route {
                    server: Arc::clone(server),
                    packet: packet.to_vec(),
                });
            }
        }
    }

    fn on_backend_reply(&mut self, _server: &Arc<Server>, data: Vec<u8>, complete: bool, actions: &mut Vec<Action>) {
        self.record(Seen::Reply {
            data: data.clone(),
            complete,
        });
        actions.push(Action::Reply(data));
    }

    fn on_backend_error(&mut self, error: &BackendError, _actions: &mut Vec<Action>) -> bool {
        self.record(Seen::Error(error.clone()));
        true
    }

    fn tick(&mut self, idle: Duration, _actions: &mut Vec<Action>) {
        self.record(Seen::Tick(idle));
    }

    fn valid_for_pool(&self) -> bool {
        !self.recorder.not_poolable.load(Ordering::Relaxed)
    }

    fn is_movable(&self) -> bool {
        !self.recorder.not_movable.load(Ordering::Relaxed)
    }
}

/// Register a [`TestSession`] on `worker` over a fresh socket pair.
pub fn add_test_session(worker: &mut RoutingWorker, route_to: Option<Arc<Server>>) -> (SessionId, Peer, Recorder) {
    let (session, recorder) = TestSession::new(route_to);
    let (socket, peer) = pair();
    let sid = worker
        .add_session(session, socket, "test".into())
        .expect("add session");
    (sid, peer, recorder)
}

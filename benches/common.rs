#![allow(dead_code)]

use std::io::{ErrorKind, Read, Write};
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::time::Duration;

use socket2::Socket;

use shardproxy::auth::Credentials;
use shardproxy::backend::BackendError;
use shardproxy::constants::*;
use shardproxy::protocol::{self, Packet, ServerHandshake};
use shardproxy::server::Server;
use shardproxy::session::{Action, Session, SessionId, next_session_id};
use shardproxy::worker::RoutingWorker;

/// Worker-side socket and the bench's end of a socket pair.
pub fn pair() -> (Socket, UnixStream) {
    let (ours, theirs) = UnixStream::pair().expect("socketpair");
    ours.set_nonblocking(true).unwrap();
    theirs.set_nonblocking(true).unwrap();
    (Socket::from(ours), theirs)
}

/// Poll `worker` until a packet can be read from `peer`.
pub fn recv(worker: &mut RoutingWorker, peer: &mut UnixStream, buf: &mut Vec<u8>) -> Packet {
    let mut chunk = [0u8; 4096];
    loop {
        if let Some(packet) = protocol::read_packet(buf) {
            return packet;
        }
        match peer.read(&mut chunk) {
            Ok(0) => panic!("peer closed"),
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            Err(e) if e.kind() == ErrorKind::WouldBlock => worker.poll_once(Duration::from_millis(1)),
            Err(e) => panic!("peer read: {e}"),
        }
    }
}

pub fn handshake_packet() -> Vec<u8> {
    let hs = ServerHandshake {
        server_version: "10.11.6-MariaDB".into(),
        thread_id: 1,
        scramble: *b"abcdefghij0123456789",
        capabilities: DEFAULT_CAPABILITIES,
        charset: DEFAULT_CHARSET,
        status: SERVER_STATUS_AUTOCOMMIT,
        auth_plugin: DEFAULT_AUTH_PLUGIN.into(),
    };
    protocol::packet(0, &hs.encode())
}

pub fn ok(seq: u8) -> Vec<u8> {
    protocol::ok_packet(seq, SERVER_STATUS_AUTOCOMMIT)
}

/// A text resultset: column count, `cols` definitions, EOF, `rows` rows, EOF.
pub fn resultset(cols: usize, rows: usize) -> Vec<u8> {
    let mut out = Vec::new();
    let mut seq = 1u8;
    seq = protocol::write_packet(&mut out, seq, &[cols as u8]);
    for i in 0..cols {
        let name = format!("c{i}");
        let mut def = Vec::new();
        for part in ["def", "shop", "t", "t", name.as_str(), name.as_str()] {
            protocol::write_lenenc_int(&mut def, part.len() as u64);
            def.extend_from_slice(part.as_bytes());
        }
        def.extend_from_slice(&[0x0c, 0x21, 0, 0x40, 0, 0, 0, 0xfd, 0, 0, 0, 0, 0]);
        seq = protocol::write_packet(&mut out, seq, &def);
    }
    seq = protocol::write_packet(&mut out, seq, &[EOF_HEADER, 0, 0, 2, 0]);
    for r in 0..rows {
        let mut row = Vec::new();
        for c in 0..cols {
            let value = format!("{r}-{c}");
            protocol::write_lenenc_int(&mut row, value.len() as u64);
            row.extend_from_slice(value.as_bytes());
        }
        seq = protocol::write_packet(&mut out, seq, &row);
    }
    protocol::write_packet(&mut out, seq, &[EOF_HEADER, 0, 0, 2, 0]);
    out
}

/// Session that does nothing on its own.
pub struct IdleSession {
    id: SessionId,
    credentials: Arc<Credentials>,
}

impl IdleSession {
    pub fn boxed() -> Box<dyn Session> {
        Box::new(Self {
            id: next_session_id(),
            credentials: Arc::new(Credentials::new("bench", "secret")),
        })
    }
}

impl Session for IdleSession {
    fn id(&self) -> SessionId {
        self.id
    }

    fn credentials(&self) -> Arc<Credentials> {
        Arc::clone(&self.credentials)
    }

    fn on_client_data(&mut self, _packets: &[u8], _actions: &mut Vec<Action>) {}

    fn on_backend_reply(&mut self, _server: &Arc<Server>, _data: Vec<u8>, _complete: bool, _actions: &mut Vec<Action>) {}

    fn on_backend_error(&mut self, _error: &BackendError, _actions: &mut Vec<Action>) -> bool {
        true
    }
}

pub fn send(peer: &mut UnixStream, bytes: &[u8]) {
    peer.write_all(bytes).expect("peer write");
}

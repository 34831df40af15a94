//! Integration tests: routing workers driven by hand, sessions moving between
//! them, timeouts, backend failures and a full proxy round trip.

mod common;

use std::os::unix::net::UnixListener;
use std::sync::Arc;
use std::time::Duration;

use shardproxy::auth::Credentials;
use shardproxy::backend::{ConnectionInitSql, FailurePhase};
use shardproxy::constants::*;
use shardproxy::error::ErrorType;
use shardproxy::protocol::{self, ErrPacket, HandshakeResponse, ServerHandshake};
use shardproxy::proxy::{ProxyService, Service};
use shardproxy::session::{SessionFactory, next_session_id};
use shardproxy::worker::RoutingWorker;

use common::*;

const HOUR: Duration = Duration::from_secs(3600);

#[test]
fn rebalance_runs_after_the_event_batch() {
    let (mut a, a_handle) = RoutingWorker::standalone(0).unwrap();
    let (mut b, b_handle) = RoutingWorker::standalone(1).unwrap();
    let (sid, mut client, recorder) = add_test_session(&mut a, None);
    pump(&mut a, 2);

    // Request and client data land in the same poll batch.
    let target = Arc::clone(&b_handle);
    a_handle.execute(move |w| w.rebalance(target, 1)).unwrap();
    client.send(&protocol::com_query("on a"));
    a.poll_once(Duration::from_millis(50));

    assert!(!a.has_pending_rebalance());
    assert_eq!(recorder.client_packets(), 1, "data must be handled before the move");
    assert_eq!(a.session_count(), 0);

    pump_until(&mut b, "session adoption", |w| w.find_session(sid).is_some());
    client.send(&protocol::com_query("on b"));
    pump_until(&mut b, "data on the new worker", |_| recorder.client_packets() == 2);
    assert_eq!(a.session_count(), 0);
}

#[test]
fn sessions_move_with_their_backend_connections() {
    let (mut a, _a_handle) = RoutingWorker::standalone(0).unwrap();
    let (mut b, b_handle) = RoutingWorker::standalone(1).unwrap();
    let server = running_server("db1", "127.0.0.1:1", 0, HOUR);

    let (sid, mut client, recorder) = add_test_session(&mut a, Some(Arc::clone(&server)));
    let (_, mut backend) = establish(&mut a, &server, sid);

    assert!(a.move_session(sid, &b_handle));
    pump_until(&mut b, "session adoption", |w| w.find_session(sid).is_some());
    assert!(b.session_backend(sid, "db1").is_some());

    client.send(&protocol::com_query("SELECT 2"));
    let query = backend.recv(&mut b);
    assert_eq!(&query.payload[1..], b"SELECT 2");
    backend.send(&protocol::ok_packet(1, 0));
    assert!(client.recv(&mut b).is_ok());
    assert_eq!(recorder.client_packets(), 1);
    assert_eq!(a.live_count(), 0);
}

#[test]
fn unmovable_sessions_stay() {
    let (mut a, a_handle) = RoutingWorker::standalone(0).unwrap();
    let (_b, b_handle) = RoutingWorker::standalone(1).unwrap();
    let (sid, _client, recorder) = add_test_session(&mut a, None);
    recorder.set_movable(false);

    a.rebalance(Arc::clone(&b_handle), 1);
    a.poll_once(Duration::ZERO);
    assert!(a.find_session(sid).is_some());

    // Moving to itself is refused as well.
    assert!(!a.move_session(sid, &a_handle));
}

#[test]
fn rebalance_skips_sessions_that_cannot_move() {
    let (mut a, _a_handle) = RoutingWorker::standalone(0).unwrap();
    let (_b, b_handle) = RoutingWorker::standalone(1).unwrap();
    let (busy, mut busy_client, busy_rec) = add_test_session(&mut a, None);
    let (quiet, _quiet_client, _quiet_rec) = add_test_session(&mut a, None);
    busy_client.send(&protocol::com_query("SELECT 1"));
    pump_until(&mut a, "client data", |_| busy_rec.client_packets() == 1);

    // The busiest session starts closing in the same tick as the rebalance.
    a.register_tick_func(move |w| w.close_session(busy));
    a.rebalance(Arc::clone(&b_handle), 1);
    a.poll_once(Duration::ZERO);

    assert!(a.find_session(quiet).is_none(), "next candidate should have moved");
    assert!(!a.has_pending_rebalance());
}

#[test]
fn idle_sessions_get_ticked_and_can_time_out() {
    let (mut worker, _handle) = RoutingWorker::standalone(0).unwrap();
    let (_sid, _client, recorder) = add_test_session(&mut worker, None);
    pump_until(&mut worker, "a session tick", |_| {
        recorder.seen().iter().any(|s| matches!(s, Seen::Tick(_)))
    });

    let factory = ProxyService::new(Service {
        name: "rw".into(),
        servers: vec![],
        credentials: Arc::new(Credentials::new("svc", "pw")),
        init_sql: None,
        idle_timeout: Duration::from_millis(1),
    });
    let (socket, mut peer) = pair();
    let sid = worker
        .add_session(factory.create(next_session_id(), "test"), socket, "test".into())
        .unwrap();
    std::thread::sleep(Duration::from_millis(5));
    peer.wait_closed(&mut worker);
    pump_until(&mut worker, "idle session to end", |w| w.find_session(sid).is_none());
}

#[test]
fn client_hangup_ends_session_and_backends() {
    let (mut worker, _handle) = RoutingWorker::standalone(0).unwrap();
    let server = running_server("db1", "127.0.0.1:1", 0, HOUR);
    let (sid, client, _recorder) = add_test_session(&mut worker, None);
    let (backend_id, mut backend) = establish(&mut worker, &server, sid);

    drop(client);
    pump_until(&mut worker, "session to end", |w| w.find_session(sid).is_none());
    assert!(worker.dcb(backend_id).is_none());
    let quit = backend.recv(&mut worker);
    assert_eq!(quit.first_byte(), Some(COM_QUIT));
    assert_eq!(worker.live_count(), 0);
}

#[test]
fn backend_hangup_is_reported_to_the_session() {
    let (mut worker, _handle) = RoutingWorker::standalone(0).unwrap();
    let server = running_server("db1", "127.0.0.1:1", 0, HOUR);
    let (sid, _client, recorder) = add_test_session(&mut worker, None);
    let (backend_id, backend) = establish(&mut worker, &server, sid);

    drop(backend);
    pump_until(&mut worker, "backend error", |_| !recorder.errors().is_empty());
    let err = &recorder.errors()[0];
    assert_eq!(err.server, "db1");
    assert_eq!(err.kind, ErrorType::Transient);
    assert_eq!(err.phase, FailurePhase::Routing);
    assert!(worker.session_backend(sid, "db1").is_none());
    pump(&mut worker, 2);
    assert!(worker.dcb(backend_id).is_none());
    assert!(worker.find_session(sid).is_some(), "session chose to continue");
}

#[test]
fn blocked_host_puts_server_into_maintenance() {
    let (mut worker, _handle) = RoutingWorker::standalone(0).unwrap();
    let server = running_server("db1", "127.0.0.1:1", 0, HOUR);
    let (sid, _client, recorder) = add_test_session(&mut worker, None);

    let (socket, mut backend) = pair();
    worker.attach_backend_socket(sid, &server, socket).unwrap();
    backend.send(&handshake_packet(5));
    backend.recv(&mut worker);
    backend.send(&protocol::err_packet(2, ER_HOST_IS_BLOCKED, "HY000", "Host is blocked"));
    pump_until(&mut worker, "authentication failure", |_| !recorder.errors().is_empty());

    let err = &recorder.errors()[0];
    assert_eq!(err.code, Some(ER_HOST_IS_BLOCKED));
    assert_eq!(err.kind, ErrorType::Permanent);
    assert_eq!(err.phase, FailurePhase::Establishing);
    assert!(!server.is_running());
}

#[test]
fn unreachable_server_is_reported_without_a_descriptor() {
    let (mut worker, _handle) = RoutingWorker::standalone(0).unwrap();
    let path = socket_path("nobody");
    let server = running_server("db1", path.to_str().unwrap(), 0, HOUR);
    let (_sid, mut client, recorder) = add_test_session(&mut worker, Some(server));

    client.send(&protocol::com_query("SELECT 1"));
    pump_until(&mut worker, "connect failure", |_| !recorder.errors().is_empty());
    assert_eq!(recorder.errors()[0].phase, FailurePhase::Establishing);
    assert_eq!(worker.live_count(), 1);
}

/// Accept the proxy's backend connection and complete its handshake,
/// answering `init_queries` OKs.
fn accept_backend(worker: &mut RoutingWorker, listener: &UnixListener, sid: u64, init_queries: usize) -> Peer {
    listener.set_nonblocking(true).unwrap();
    let stream = loop {
        match listener.accept() {
            Ok((stream, _)) => break stream,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => worker.poll_once(Duration::from_millis(2)),
            Err(e) => panic!("accept: {e}"),
        }
    };
    let mut backend = Peer::new(stream);
    backend.send(&handshake_packet(sid as u32));
    let response = backend.recv(worker);
    assert_eq!(response.seq, 1);
    backend.send(&protocol::ok_packet(2, SERVER_STATUS_AUTOCOMMIT));
    for i in 0..init_queries {
        let query = backend.recv(worker);
        assert_eq!(query.first_byte(), Some(COM_QUERY), "init query {i}");
        backend.send(&protocol::ok_packet(1, SERVER_STATUS_AUTOCOMMIT));
    }
    backend
}

#[test]
fn proxy_session_round_trip() {
    let path = socket_path("proxy");
    let listener = UnixListener::bind(&path).unwrap();
    let server = running_server("db1", path.to_str().unwrap(), 1, HOUR);
    let factory = ProxyService::new(Service {
        name: "rw".into(),
        servers: vec![Arc::clone(&server)],
        credentials: Arc::new(Credentials::new("svc", "pw")),
        init_sql: Some(Arc::new(ConnectionInitSql::new(vec!["SET NAMES utf8mb4".into()]))),
        idle_timeout: Duration::ZERO,
    });
    let (mut worker, _handle) = RoutingWorker::standalone(0).unwrap();

    let (socket, mut client) = pair();
    let sid = worker
        .add_session(factory.create(next_session_id(), "test"), socket, "test".into())
        .unwrap();

    let greeting = client.recv(&mut worker);
    let hs = ServerHandshake::parse(&greeting.payload).unwrap();
    assert_eq!(hs.thread_id, sid as u32);
    let response = HandshakeResponse {
        capabilities: DEFAULT_CAPABILITIES,
        charset: DEFAULT_CHARSET,
        user: "alice",
        auth_token: &[],
        database: Some("shop"),
        auth_plugin: DEFAULT_AUTH_PLUGIN,
        connect_attrs: &[],
    };
    client.send(&protocol::packet(1, &response.encode()));
    let ok = client.recv(&mut worker);
    assert!(ok.is_ok());
    assert_eq!(ok.seq, 2);

    client.send(&protocol::com_query("SELECT 1"));
    let mut backend = accept_backend(&mut worker, &listener, sid, 1);
    let query = backend.recv(&mut worker);
    assert_eq!(&query.payload[1..], b"SELECT 1");
    backend.send(&protocol::err_packet(1, 1146, "42S02", "Table 'shop.t' doesn't exist"));
    let reply = client.recv(&mut worker);
    assert_eq!(ErrPacket::parse(&reply.payload).map(|e| e.code), Some(1146));

    // COM_QUIT on a poolable server is absorbed and the connection pooled.
    client.send(&protocol::com_quit());
    client.wait_closed(&mut worker);
    pump_until(&mut worker, "session to end", |w| w.find_session(sid).is_none());
    assert_eq!(worker.pool_len("db1"), 1);
    assert_eq!(backend.pending(), 0, "COM_QUIT must not reach a pooled connection");
    assert_eq!(server.stats().snapshot().n_new_conn, 1);
    let _ = std::fs::remove_file(&path);
}

#[test]
fn proxy_reports_missing_backend() {
    let server = running_server("db1", "127.0.0.1:1", 0, HOUR);
    server.clear_status(shardproxy::server::status::RUNNING);
    let factory = ProxyService::new(Service {
        name: "rw".into(),
        servers: vec![server],
        credentials: Arc::new(Credentials::new("svc", "pw")),
        init_sql: None,
        idle_timeout: Duration::ZERO,
    });
    let (mut worker, _handle) = RoutingWorker::standalone(0).unwrap();
    let (socket, mut client) = pair();
    worker
        .add_session(factory.create(next_session_id(), "test"), socket, "test".into())
        .unwrap();
    client.recv(&mut worker);
    let response = HandshakeResponse {
        capabilities: DEFAULT_CAPABILITIES,
        charset: DEFAULT_CHARSET,
        user: "alice",
        auth_token: &[],
        database: None,
        auth_plugin: DEFAULT_AUTH_PLUGIN,
        connect_attrs: &[],
    };
    client.send(&protocol::packet(1, &response.encode()));
    client.recv(&mut worker);

    client.send(&protocol::com_query("SELECT 1"));
    let reply = client.recv(&mut worker);
    assert_eq!(
        ErrPacket::parse(&reply.payload).map(|e| e.code),
        Some(ER_CONNECTION_KILLED)
    );
}

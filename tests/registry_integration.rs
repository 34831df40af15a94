//! Integration tests: worker registry with real worker threads.

use std::io::Read;
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use shardproxy::Error;
use shardproxy::auth::Credentials;
use shardproxy::config::{MAX_WORKERS, WorkerConfig};
use shardproxy::listener::Listener;
use shardproxy::protocol::{self, ServerHandshake};
use shardproxy::proxy::{ProxyService, Service};
use shardproxy::registry::{MAIN, WorkerRegistry};
use shardproxy::worker::RoutingWorker;

fn started(threads: usize) -> Arc<WorkerRegistry> {
    let registry = WorkerRegistry::init(WorkerConfig::with_threads(threads)).unwrap();
    registry.start().unwrap();
    registry
}

fn stop(registry: &WorkerRegistry) {
    registry.start_shutdown();
    registry.join();
    assert!(registry.handles().iter().all(|h| !h.is_running()));
}

#[test]
fn init_rejects_bad_worker_counts() {
    assert!(matches!(
        WorkerRegistry::init(WorkerConfig::with_threads(0)),
        Err(Error::WorkerCount(0))
    ));
    assert!(matches!(
        WorkerRegistry::init(WorkerConfig::with_threads(MAX_WORKERS + 1)),
        Err(Error::WorkerCount(_))
    ));
}

#[test]
fn waiting_calls_need_started_workers() {
    let registry = WorkerRegistry::init(WorkerConfig::with_threads(2)).unwrap();
    assert!(matches!(registry.execute_serially(|_| {}), Err(Error::NotStarted)));
    assert!(matches!(registry.execute_concurrently(|_| {}), Err(Error::NotStarted)));
    registry.start().unwrap();
    assert!(matches!(registry.start(), Err(Error::AlreadyStarted)));
    stop(&registry);
}

#[test]
fn execute_serially_visits_workers_in_order() {
    let registry = started(3);
    let order = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&order);
    let n = registry
        .execute_serially(move |worker| seen.lock().unwrap().push(worker.id()))
        .unwrap();
    assert_eq!(n, 3);
    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    stop(&registry);
}

#[test]
fn execute_concurrently_runs_everywhere() {
    let registry = started(4);
    let count = Arc::new(AtomicUsize::new(0));
    let c = Arc::clone(&count);
    let n = registry
        .execute_concurrently(move |_| {
            c.fetch_add(1, Ordering::Relaxed);
        })
        .unwrap();
    assert_eq!(n, 4);
    assert_eq!(count.load(Ordering::Relaxed), 4);
    stop(&registry);
}

#[test]
fn broadcast_does_not_wait() {
    let registry = started(2);
    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    let posted = registry.broadcast(Arc::new(move |worker: &mut RoutingWorker| {
        let _ = tx.lock().unwrap().send(worker.id());
    }));
    assert_eq!(posted, 2);
    let mut ids: Vec<usize> = (0..2)
        .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
        .collect();
    ids.sort_unstable();
    assert_eq!(ids, vec![0, 1]);
    stop(&registry);
}

#[test]
fn waiting_calls_finish_while_workers_wind_down() {
    let registry = started(1);
    let (stopping_tx, stopping_rx) = mpsc::channel();
    registry
        .get(0)
        .unwrap()
        .execute(move |worker| {
            let mut held = false;
            worker.register_tick_func(move |w| {
                if w.should_shutdown() && !held {
                    held = true;
                    let _ = stopping_tx.send(());
                    std::thread::sleep(Duration::from_millis(200));
                }
            });
        })
        .unwrap();

    registry.start_shutdown();
    stopping_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    // The loop has decided to exit but has not stopped yet.
    assert!(registry.get(0).unwrap().is_running());
    let ran = Arc::new(AtomicUsize::new(0));
    let r = Arc::clone(&ran);
    let n = registry
        .execute_serially(move |_| {
            r.fetch_add(1, Ordering::Relaxed);
        })
        .unwrap();
    assert_eq!(n, 1);
    assert_eq!(ran.load(Ordering::Relaxed), 1);

    registry.join();
    assert_eq!(registry.execute_concurrently(|_| {}).unwrap(), 0);
}

#[test]
fn workers_know_where_they_run() {
    let registry = started(2);
    assert!(registry.current().is_none());
    assert_eq!(registry.get(MAIN).map(|h| h.id()), Some(0));
    assert!(registry.get(2).is_none());

    let (tx, rx) = mpsc::channel();
    registry
        .get(1)
        .unwrap()
        .execute(move |worker| {
            let registry = worker.registry().expect("registry still alive");
            let current = registry.current().map(|h| h.id());
            let nested = registry.execute_serially(|_| {});
            let _ = tx.send((current, nested.map_err(|e| e.to_string())));
        })
        .unwrap();
    let (current, nested) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(current, Some(1));
    assert_eq!(nested, Err(Error::CalledFromWorker(1).to_string()));
    stop(&registry);
}

#[test]
fn statistics_cover_every_worker() {
    let registry = started(3);
    let stats = registry.statistics().unwrap();
    assert_eq!(stats.len(), 3);
    assert!(stats.iter().all(|s| s.n_polls > 0));
    let total = registry.aggregate_statistics().unwrap();
    assert_eq!(total.n_sessions, 0);
    assert_eq!(registry.collect_worker_load().len(), 3);
    stop(&registry);
}

#[test]
fn balancing_needs_a_load_difference() {
    let registry = started(2);
    // Idle workers sit at the same load.
    assert!(!registry.balance_workers_with(50));
    assert!(!registry.balance_workers_with(0));
    stop(&registry);
}

#[test]
fn accepted_clients_get_a_greeting_and_shutdown_closes_them() {
    let registry = started(2);
    let factory = ProxyService::new(Service {
        name: "rw".into(),
        servers: vec![],
        credentials: Arc::new(Credentials::new("svc", "pw")),
        init_sql: None,
        idle_timeout: Duration::ZERO,
    });
    let listener = Listener::bind_tcp("test", "127.0.0.1:0".parse().unwrap(), Arc::new(factory)).unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap().as_socket().unwrap();
    let key = registry.add_listener(listener).unwrap();

    let mut client = TcpStream::connect(addr).unwrap();
    client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let mut header = [0u8; 4];
    client.read_exact(&mut header).unwrap();
    let mut payload = vec![0u8; protocol::payload_len(&header)];
    client.read_exact(&mut payload).unwrap();
    let greeting = ServerHandshake::parse(&payload).unwrap();

    let sessions = registry.list_sessions().unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].1, u64::from(greeting.thread_id));
    assert_eq!(registry.aggregate_statistics().unwrap().n_accept, 1);

    assert!(registry.remove_listener(key));
    assert!(!registry.remove_listener(key));
    stop(&registry);
    let mut rest = Vec::new();
    let _ = client.read_to_end(&mut rest);
    assert!(rest.is_empty());
}

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};

use shardproxy::constants::*;
use shardproxy::protocol::{self, ErrPacket, HandshakeResponse, ServerHandshake};

#[derive(Parser)]
#[command(about = "Test client for the shardproxy MySQL proxy")]
struct Args {
    /// Proxy port
    #[arg(short, long, default_value_t = 4006)]
    port: u16,

    /// User sent in the handshake response
    #[arg(short, long, default_value = "client")]
    user: String,

    /// Database sent in the handshake response
    #[arg(short, long)]
    database: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Connect, ping, run one query and quit (default)
    Smoke {
        /// Query to run
        #[arg(short, long, default_value = "SELECT 1")]
        query: String,
    },
    /// Open and close sessions in a loop so backend connections cycle
    /// through the pool
    Churn {
        /// Number of concurrent connections
        #[arg(short, long, default_value_t = 4)]
        connections: usize,
        /// Sessions opened per connection thread
        #[arg(short, long, default_value_t = 1000)]
        iterations: usize,
    },
    /// Sustained COM_PING or query load with per-reply latency measurement
    Sustain {
        /// Query to run instead of COM_PING
        #[arg(short, long)]
        query: Option<String>,
        /// Number of concurrent connections
        #[arg(short, long, default_value_t = 4)]
        connections: usize,
        /// Measurement duration in seconds
        #[arg(short = 'D', long, default_value_t = 10)]
        duration: u64,
    },
}

/// Read one packet, returning its sequence number and payload.
fn read_packet(stream: &mut TcpStream) -> (u8, Vec<u8>) {
    let mut header = [0u8; HEADER_LEN];
    stream.read_exact(&mut header).expect("failed to read packet header");
    let len = protocol::payload_len(&header);
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).expect("failed to read packet payload");
    (header[3], payload)
}

fn expect_ok(stream: &mut TcpStream, what: &str) {
    let (_, payload) = read_packet(stream);
    if let Some(err) = ErrPacket::parse(&payload) {
        panic!("{what}: server returned {err}");
    }
    assert_eq!(payload.first(), Some(&OK_HEADER), "{what}: expected OK packet");
}

/// Connect and complete the handshake. Any authentication token is accepted
/// by the proxy, so none is sent.
fn connect(addr: &str, user: &str, database: Option<&str>) -> TcpStream {
    let mut stream = TcpStream::connect(addr).expect("failed to connect");
    stream.set_nodelay(true).expect("failed to set TCP_NODELAY");

    let (seq, payload) = read_packet(&mut stream);
    let greeting = ServerHandshake::parse(&payload).expect("malformed server greeting");
    let response = HandshakeResponse {
        capabilities: DEFAULT_CAPABILITIES & greeting.capabilities,
        charset: DEFAULT_CHARSET,
        user,
        auth_token: &[],
        database,
        auth_plugin: DEFAULT_AUTH_PLUGIN,
        connect_attrs: &[],
    };
    stream
        .write_all(&protocol::packet(seq.wrapping_add(1), &response.encode()))
        .expect("failed to write handshake response");
    expect_ok(&mut stream, "handshake");
    stream
}

fn ping(stream: &mut TcpStream) {
    stream.write_all(&protocol::packet(0, &[COM_PING])).expect("failed to write");
    expect_ok(stream, "ping");
}

/// Send a query and skip packets until the final OK, EOF or ERR. Returns the
/// number of packets in the result.
fn query(stream: &mut TcpStream, sql: &str) -> usize {
    stream.write_all(&protocol::com_query(sql)).expect("failed to write");
    let (_, first) = read_packet(stream);
    if let Some(err) = ErrPacket::parse(&first) {
        panic!("query failed: {err}");
    }
    if first.first() == Some(&OK_HEADER) {
        return 1;
    }
    // Column definitions, EOF, rows, EOF.
    let mut packets = 1;
    let mut eofs = 0;
    while eofs < 2 {
        let (_, payload) = read_packet(stream);
        packets += 1;
        if protocol::is_eof(&payload) || payload.first() == Some(&ERR_HEADER) {
            eofs += 1;
        }
    }
    packets
}

fn main() {
    let args = Args::parse();
    let addr = format!("127.0.0.1:{}", args.port);
    let database = args.database.as_deref();

    match args.command.unwrap_or(Command::Smoke {
        query: "SELECT 1".into(),
    }) {
        Command::Smoke { query: sql } => smoke_test(&addr, &args.user, database, &sql),
        Command::Churn {
            connections,
            iterations,
        } => churn_test(&addr, &args.user, database, connections, iterations),
        Command::Sustain {
            query,
            connections,
            duration,
        } => sustain_test(&addr, &args.user, database, connections, duration, query),
    }
}

fn smoke_test(addr: &str, user: &str, database: Option<&str>, sql: &str) {
    eprintln!("smoke test: connecting to {addr}");
    let started = Instant::now();
    let mut stream = connect(addr, user, database);
    eprintln!("  handshake: OK ({:.1}ms)", started.elapsed().as_secs_f64() * 1e3);

    ping(&mut stream);
    eprintln!("  ping: OK");

    let packets = query(&mut stream, sql);
    eprintln!("  {sql}: OK ({packets} packets)");

    stream.write_all(&protocol::com_quit()).expect("failed to write");
    let mut rest = Vec::new();
    stream.read_to_end(&mut rest).expect("failed to read after quit");
    assert!(rest.is_empty(), "unexpected data after COM_QUIT");
    eprintln!("smoke test: PASSED");
}

fn churn_test(addr: &str, user: &str, database: Option<&str>, connections: usize, iterations: usize) {
    eprintln!("churn: {connections} connections x {iterations} sessions to {addr}");
    let start = Instant::now();

    let handles: Vec<_> = (0..connections)
        .map(|_| {
            let addr = addr.to_string();
            let user = user.to_string();
            let database = database.map(str::to_string);
            std::thread::spawn(move || {
                for _ in 0..iterations {
                    let mut stream = connect(&addr, &user, database.as_deref());
                    // The first routed command is what takes a backend
                    // connection, pooled or new.
                    ping(&mut stream);
                    stream.write_all(&protocol::com_quit()).expect("failed to write");
                }
            })
        })
        .collect();

    for h in handles {
        h.join().expect("thread panicked");
    }

    let elapsed = start.elapsed();
    let total = connections * iterations;
    eprintln!(
        "churn: {} sessions in {:.2}s = {:.0} sessions/s",
        total,
        elapsed.as_secs_f64(),
        total as f64 / elapsed.as_secs_f64()
    );
}

/// Replies collected over a reporting window.
#[derive(Default)]
struct Window {
    latencies_ns: Vec<u64>,
    packets: u64,
}

impl Window {
    fn record(&mut self, reply: Reply) {
        self.latencies_ns.push(reply.latency_ns);
        self.packets += reply.packets as u64;
    }

    fn is_empty(&self) -> bool {
        self.latencies_ns.is_empty()
    }

    /// Latency at quantile `q` in microseconds. Sorts the window.
    fn quantile_us(&mut self, q: f64) -> f64 {
        self.latencies_ns.sort_unstable();
        let i = (q * self.latencies_ns.len() as f64) as usize;
        self.latencies_ns[i.min(self.latencies_ns.len() - 1)] as f64 / 1_000.0
    }

    /// One line: replies/s, reply packets/s and latency quantiles.
    fn report(&mut self, label: &str, elapsed: Duration) {
        let secs = elapsed.as_secs_f64();
        let (p50, p99, max) = (self.quantile_us(0.50), self.quantile_us(0.99), self.quantile_us(1.0));
        eprintln!(
            "{label:>8}  {:>9.0}/s  {:>10.0} pkt/s  p50 {:>8.1}µs  p99 {:>8.1}µs  max {:>8.1}µs",
            self.latencies_ns.len() as f64 / secs,
            self.packets as f64 / secs,
            p50,
            p99,
            max,
        );
    }
}

#[derive(Clone, Copy)]
struct Reply {
    latency_ns: u64,
    packets: usize,
}

fn sustain_test(
    addr: &str,
    user: &str,
    database: Option<&str>,
    connections: usize,
    duration_secs: u64,
    sql: Option<String>,
) {
    let what = sql.as_deref().unwrap_or("COM_PING");
    eprintln!("sustain: {connections} connections running {what} for {duration_secs}s -> {addr}");

    let (tx, rx) = mpsc::channel::<Reply>();
    for _ in 0..connections {
        let mut stream = connect(addr, user, database);
        let tx = tx.clone();
        let sql = sql.clone();
        std::thread::spawn(move || {
            loop {
                let sent_at = Instant::now();
                let packets = match &sql {
                    Some(sql) => query(&mut stream, sql),
                    None => {
                        ping(&mut stream);
                        1
                    }
                };
                let reply = Reply {
                    latency_ns: sent_at.elapsed().as_nanos() as u64,
                    packets,
                };
                if tx.send(reply).is_err() {
                    break;
                }
            }
        });
    }
    drop(tx);

    let measure_start = Instant::now();
    let measure_end = measure_start + Duration::from_secs(duration_secs);
    let mut total = Window::default();
    let mut second = Window::default();
    let mut last_print = Instant::now();

    loop {
        let now = Instant::now();
        if now >= measure_end {
            break;
        }
        match rx.recv_timeout((measure_end - now).min(Duration::from_millis(100))) {
            Ok(reply) => {
                total.record(reply);
                second.record(reply);
            }
            Err(RecvTimeoutError::Disconnected) => {
                eprintln!("error: all connections died, is the proxy running?");
                break;
            }
            Err(RecvTimeoutError::Timeout) => {}
        }

        if last_print.elapsed() >= Duration::from_secs(1) && !second.is_empty() {
            let secs = format!("{}s", measure_start.elapsed().as_secs());
            second.report(&secs, last_print.elapsed());
            second = Window::default();
            last_print = Instant::now();
        }
    }

    if total.is_empty() {
        eprintln!("no replies collected");
        return;
    }
    total.report("total", measure_start.elapsed());
}

use std::net::{Ipv4Addr, SocketAddr};
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use shardproxy::auth::Credentials;
use shardproxy::backend::ConnectionInitSql;
use shardproxy::config::{MAX_WORKERS, WorkerConfig};
use shardproxy::listener::Listener;
use shardproxy::metrics;
use shardproxy::proxy::{ProxyService, Service};
use shardproxy::registry::WorkerRegistry;
use shardproxy::server::{Server, ServerAddress, status};

#[derive(Parser)]
#[command(about = "MySQL/MariaDB proxy with per-thread routing workers and pooled backend connections")]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value_t = 4006)]
    port: u16,

    /// Number of routing workers (defaults to the number of CPUs)
    #[arg(short, long)]
    threads: Option<usize>,

    /// Backend server as NAME=HOST:PORT or NAME=/path/to/socket (repeatable)
    #[arg(short, long = "backend", value_parser = parse_backend, required = true)]
    backends: Vec<(String, ServerAddress)>,

    /// User the proxy authenticates to backends as
    #[arg(short, long, default_value = "proxy")]
    user: String,

    /// Password of the backend user
    #[arg(long, default_value = "")]
    password: String,

    /// Default database for backend connections
    #[arg(short, long)]
    database: Option<String>,

    /// Pooled connections kept per server across all workers (0 disables pooling)
    #[arg(long, default_value_t = 0)]
    persistpoolmax: usize,

    /// Seconds a pooled connection may stay idle before eviction
    #[arg(long, default_value_t = 3600)]
    persistmaxtime: u64,

    /// Load difference between workers that triggers a rebalance (0 disables)
    #[arg(long, default_value_t = 20)]
    rebalance_threshold: u8,

    /// Seconds between load balance checks (0 disables)
    #[arg(long, default_value_t = 0)]
    rebalance_period: u64,

    /// One-second load samples averaged by the balancer
    #[arg(long, default_value_t = 10)]
    rebalance_window: usize,

    /// Close client sessions idle for this many seconds (0 disables)
    #[arg(long, default_value_t = 0)]
    idle_timeout: u64,

    /// Query run on every new or reused backend connection (repeatable)
    #[arg(long = "init-sql")]
    init_sql: Vec<String>,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn parse_backend(s: &str) -> Result<(String, ServerAddress), String> {
    let (name, addr) = s
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=ADDRESS, got `{s}`"))?;
    if name.is_empty() {
        return Err(format!("backend `{s}` has no name"));
    }
    let addr = ServerAddress::parse(addr).ok_or_else(|| format!("invalid backend address `{addr}`"))?;
    Ok((name.to_string(), addr))
}

/// Block SIGINT and SIGTERM in the calling thread and every thread spawned
/// after it, so only the waiter below receives them.
fn block_shutdown_signals() -> libc::sigset_t {
    unsafe {
        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, libc::SIGINT);
        libc::sigaddset(&mut set, libc::SIGTERM);
        libc::pthread_sigmask(libc::SIG_BLOCK, &set, std::ptr::null_mut());
        set
    }
}

fn spawn_signal_waiter(set: libc::sigset_t, registry: Arc<WorkerRegistry>) -> std::io::Result<()> {
    thread::Builder::new().name("signals".into()).spawn(move || {
        let mut sig: libc::c_int = 0;
        let rc = unsafe { libc::sigwait(&set, &mut sig) };
        if rc != 0 {
            error!("sigwait failed: {}", std::io::Error::from_raw_os_error(rc));
            return;
        }
        info!(signal = sig, "shutting down");
        registry.start_shutdown();
    })?;
    Ok(())
}

fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let threads = args.threads.unwrap_or_else(|| WorkerConfig::default().threads).clamp(1, MAX_WORKERS);
    let config = WorkerConfig {
        threads,
        rebalance_threshold: args.rebalance_threshold,
        rebalance_period: Duration::from_secs(args.rebalance_period),
        rebalance_window: args.rebalance_window,
    };

    let servers: Vec<Arc<Server>> = args
        .backends
        .into_iter()
        .map(|(name, addr)| {
            let server = Server::new(name, addr)
                .with_pool(args.persistpoolmax, Duration::from_secs(args.persistmaxtime));
            // Monitoring is not part of the proxy core; assume every backend is up.
            server.set_status(status::RUNNING);
            Arc::new(server)
        })
        .collect();

    let mut credentials = Credentials::new(args.user, &args.password);
    credentials.database = args.database;
    let service = Service {
        name: "proxy".into(),
        servers,
        credentials: Arc::new(credentials),
        init_sql: (!args.init_sql.is_empty()).then(|| Arc::new(ConnectionInitSql::new(args.init_sql))),
        idle_timeout: Duration::from_secs(args.idle_timeout),
    };

    let signals = block_shutdown_signals();
    let registry = WorkerRegistry::init(config)?;
    registry.start()?;

    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, args.port));
    let listener = Listener::bind_tcp("proxy", addr, Arc::new(ProxyService::new(service)))?;
    registry.add_listener(listener)?;
    spawn_signal_waiter(signals, Arc::clone(&registry))?;
    metrics::spawn_reporter(Arc::downgrade(&registry));

    info!(port = args.port, workers = threads, "shardproxy: ready");
    registry.join();
    info!("shardproxy: all workers stopped");
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).with_thread_names(true).init();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("shardproxy: {e}");
            ExitCode::FAILURE
        }
    }
}

// Kivi server binary
// Startup order matters: open and replay the WAL before the listener is
// bound, so no client can observe pre-recovery state.

// Global allocator - jemalloc for performance
#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: jemallocator::Jemalloc = jemallocator::Jemalloc;

use std::path::Path;
use std::process::ExitCode;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info};

use kivi::{Config, Result, Server};

// Server start time for uptime reporting
static START_TIME: Lazy<Instant> = Lazy::new(Instant::now);

const DEFAULT_CONFIG_PATH: &str = "kv_config.conf";
const STATUS_INTERVAL: Duration = Duration::from_secs(10);

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

fn load_config(arg: Option<String>) -> Result<Config> {
    match arg {
        // An explicitly named file must exist.
        Some(path) => Config::load(Path::new(&path)),
        None => {
            let default = Path::new(DEFAULT_CONFIG_PATH);
            if default.exists() {
                Config::load(default)
            } else {
                Ok(Config::default())
            }
        }
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal as unix_signal, SignalKind};
        let mut terminate =
            unix_signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = signal::ctrl_c().await;
    }
    info!("shutdown signal received");
}

async fn status_task(server: Server) {
    let mut interval = tokio::time::interval(STATUS_INTERVAL);
    interval.tick().await; // skip the immediate first tick
    loop {
        interval.tick().await;
        info!(
            uptime_secs = START_TIME.elapsed().as_secs(),
            connections = server.connection_count(),
            items = server.item_count(),
            "status"
        );
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let _ = *START_TIME;

    let config = match load_config(std::env::args().nth(1)) {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    info!(
        port = config.server_port,
        segments = config.num_segments,
        wal = %config.wal_file.display(),
        sync_wal = config.sync_wal,
        max_connections = config.max_connections,
        "starting kivi"
    );

    let server = match Server::new(config.clone()) {
        Ok(server) => server,
        Err(e) => {
            error!("startup failed: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let listener = match TcpListener::bind(("0.0.0.0", config.server_port)).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("failed to bind port {}: {}", config.server_port, e);
            return ExitCode::FAILURE;
        }
    };
    info!(port = config.server_port, "listening");

    let status = tokio::spawn(status_task(server.clone()));
    server.serve(listener, shutdown_signal()).await;
    status.abort();

    info!(
        items = server.item_count(),
        uptime_secs = START_TIME.elapsed().as_secs(),
        "kivi shut down gracefully"
    );
    ExitCode::SUCCESS
}

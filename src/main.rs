//! simbridge - main entry point
//!
//! Remote control plane for iOS simulators: session lifecycle, streaming,
//! input, and recording over REST + WebSocket.

mod args;
mod capture;
mod config;
mod connections;
mod driver;
mod error;
mod recording;
mod resources;
mod session;
mod web;

use args::Args;
use clap::Parser;
use connections::ConnectionManager;
use driver::HostDriver;
use log::{error, info};
use recording::RecordingService;
use resources::ResourceManager;
use session::{SessionManager, SessionStore};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use web::AppState;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

const EXIT_BAD_CONFIG: i32 = 2;
const EXIT_STATE_DIR: i32 = 3;
const EXIT_NO_DRIVER: i32 = 4;

fn main() {
    let args = Args::parse();

    let log_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::new()
        .parse_filters(&format!("simbridge={},webrtc=warn,webrtc_ice=warn", log_level))
        .init();

    info!("simbridge v{} starting", env!("CARGO_PKG_VERSION"));

    let mut config = match args.load_config() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config: {}", e);
            std::process::exit(EXIT_BAD_CONFIG);
        }
    };
    if let Err(e) = args.apply_overrides(&mut config) {
        eprintln!("Invalid arguments: {}", e);
        std::process::exit(EXIT_BAD_CONFIG);
    }
    if let Err(e) = config.validate() {
        eprintln!("Invalid configuration: {}", e);
        std::process::exit(EXIT_BAD_CONFIG);
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to start runtime: {}", e);
            std::process::exit(1);
        }
    };

    let code = runtime.block_on(run(config));
    runtime.shutdown_timeout(Duration::from_secs(3));
    std::process::exit(code);
}

async fn run(config: config::Config) -> i32 {
    let config = Arc::new(config);

    let driver = Arc::new(HostDriver::new());
    if let Err(e) = driver.probe().await {
        eprintln!("Host driver unavailable: {}", e);
        error!("Host driver unavailable: {}", e);
        return EXIT_NO_DRIVER;
    }

    if let Err(e) = std::fs::create_dir_all(&config.storage.state_dir) {
        eprintln!("State dir {:?} unusable: {}", config.storage.state_dir, e);
        return EXIT_STATE_DIR;
    }
    let store = match SessionStore::open(
        &config.storage.state_dir,
        config.storage.backup_retention_count,
    ) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("State dir {:?} unusable: {}", config.storage.state_dir, e);
            return EXIT_STATE_DIR;
        }
    };
    let recordings = match RecordingService::new(driver.clone(), &config.storage.state_dir) {
        Ok(r) => Arc::new(r),
        Err(e) => {
            eprintln!("State dir {:?} unusable: {}", config.storage.state_dir, e);
            return EXIT_STATE_DIR;
        }
    };

    let sessions = Arc::new(SessionManager::new(driver.clone(), store));
    if let Err(e) = sessions.startup().await {
        error!("Session startup incomplete: {}", e);
    }

    let resources = Arc::new(ResourceManager::new(
        driver.clone(),
        &config.capture,
        config.memory.clone(),
    ));
    let connections = Arc::new(ConnectionManager::new(&config.connections));

    // Background tasks are owned here and cancelled on shutdown.
    let mut background = resources.clone().spawn_background();
    background.push(connections.clone().spawn_reaper());

    let state = Arc::new(AppState {
        config: config.clone(),
        driver,
        sessions: sessions.clone(),
        resources: resources.clone(),
        connections,
        recordings: recordings.clone(),
        started_at: Instant::now(),
    });
    let app = web::build_router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            eprintln!("Cannot bind {}: {}", addr, e);
            return EXIT_BAD_CONFIG;
        }
    };
    info!("Listening on http://{}", addr);

    let serve = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal());

    if let Err(e) = serve.await {
        error!("Server error: {}", e);
    }

    // Shutdown in reverse dependency order: endpoints have drained, then
    // capture services, then recordings (emergency save), then the store.
    info!("Shutting down...");
    for task in background {
        task.abort();
    }
    resources.cleanup_all();
    recordings.emergency_save_all().await;
    if let Err(e) = sessions.flush().await {
        error!("Final store flush failed: {}", e);
    }
    info!("simbridge stopped");
    0
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}

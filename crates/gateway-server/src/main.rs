mod admin;
mod config;
mod gateway;
mod upstream;

use arc_swap::ArcSwap;
use axum::routing::{any, get, post};
use axum::Router;
use config::Config;
use gateway::{gateway_handler, AppState, Engine};
use notify::{Event, EventKind, RecursiveMode, Watcher};
use offgate_cache::{Gatekeeper, MemoryStore};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    // Load config
    let config = if Path::new("config.toml").exists() {
        match Config::load(Path::new("config.toml")) {
            Ok(c) => {
                tracing::info!("loaded config from config.toml");
                c
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to load config.toml, using defaults");
                Config::default_config()
            }
        }
    } else {
        tracing::info!("no config.toml found, using defaults");
        Config::default_config()
    };

    // Install Prometheus metrics recorder
    let prom_handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .expect("prometheus recorder");

    let policy = config
        .policy()
        .unwrap_or_else(|e| panic!("invalid public origin {:?}: {e}", config.server.public_origin));

    let store = Arc::new(MemoryStore::new());
    let client = upstream::build_client();
    let fetcher = Arc::new(upstream::UpstreamFetcher::new(
        client.clone(),
        config.upstream.origin.clone(),
        Duration::from_millis(config.upstream.timeout_ms),
    ));

    let engine: Arc<Engine> = Arc::new(Gatekeeper::new(
        Arc::clone(&store),
        Arc::clone(&fetcher),
        policy,
        config.cache.generation.clone(),
        config.cache.bootstrap.clone(),
    ));

    // First generation: bootstrap population is best-effort, then take over
    // immediately. Older generations left by previous runs of a persistent
    // store are swept here.
    engine.install().await;
    engine.activate();

    let state = Arc::new(AppState {
        engine: ArcSwap::from(engine),
        pending: Mutex::new(None),
        store,
        fetcher,
        client,
        upstream_origin: config.upstream.origin.clone(),
        started_at: std::time::Instant::now(),
    });

    // Shutdown token for graceful shutdown
    let shutdown = CancellationToken::new();

    // Build admin/control router (separate port)
    let admin_router = Router::new()
        .route("/api/stats", get(admin::stats_handler))
        .route("/api/status", get(admin::status_handler))
        .route("/api/control", post(admin::control_handler))
        .route(
            "/metrics",
            get(move || {
                let h = prom_handle.clone();
                async move { h.render() }
            }),
        )
        .with_state(Arc::clone(&state));

    // Build gateway router (main port)
    let gateway_router = Router::new()
        .route("/{*path}", any(gateway_handler))
        .route("/", any(gateway_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::clone(&state));

    let gateway_addr = config.server.listen_addr.clone();
    let admin_addr = config.server.admin_addr.clone();

    tracing::info!(
        gateway = %gateway_addr,
        admin = %admin_addr,
        upstream = %config.upstream.origin,
        public_origin = %config.server.public_origin,
        generation = %config.cache.generation,
        bypass_hosts = ?config.bypass.hosts,
        "offgate gateway starting"
    );

    let gateway_listener = tokio::net::TcpListener::bind(&gateway_addr)
        .await
        .unwrap_or_else(|e| panic!("failed to bind gateway to {gateway_addr}: {e}"));

    let admin_listener = tokio::net::TcpListener::bind(&admin_addr)
        .await
        .unwrap_or_else(|e| panic!("failed to bind admin to {admin_addr}: {e}"));

    // Spawn config file watcher
    spawn_config_watcher(PathBuf::from("config.toml"), config, Arc::clone(&state));

    // Spawn shutdown signal handler
    let shutdown_clone = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal(shutdown_clone).await;
    });

    // Run both servers with graceful shutdown
    let gateway_shutdown = shutdown.clone();
    let admin_shutdown = shutdown.clone();

    let gateway_future = axum::serve(gateway_listener, gateway_router)
        .with_graceful_shutdown(gateway_shutdown.cancelled_owned());

    let admin_future = axum::serve(admin_listener, admin_router)
        .with_graceful_shutdown(admin_shutdown.cancelled_owned());

    tokio::select! {
        result = gateway_future => {
            if let Err(e) = result {
                tracing::error!(error = %e, "gateway server error");
            }
        }
        result = admin_future => {
            if let Err(e) = result {
                tracing::error!(error = %e, "admin server error");
            }
        }
    }

    tracing::info!("offgate gateway shut down");
}

/// Listen for SIGINT (Ctrl+C) or SIGTERM and cancel the shutdown token.
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {},
            _ = sigterm.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }

    tracing::info!("shutdown signal received, draining connections...");
    token.cancel();
}

/// Spawn a filesystem watcher on config.toml that applies safe config
/// changes at runtime. A generation bump installs and activates a fresh
/// generation without a restart; the watcher callback only parses and
/// forwards — the actual install runs on the async side of the channel.
fn spawn_config_watcher(config_path: PathBuf, initial_config: Config, state: Arc<AppState>) {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<Config>();

    let config_path_clone = config_path.clone();
    let mut watcher = match notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
        if let Ok(event) = res {
            if matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                match Config::load(&config_path_clone) {
                    Ok(new_config) => {
                        let _ = tx.send(new_config);
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "failed to reload config.toml");
                    }
                }
            }
        }
    }) {
        Ok(w) => w,
        Err(e) => {
            tracing::warn!(error = %e, "failed to start config watcher");
            return;
        }
    };

    if let Err(e) = watcher.watch(&config_path, RecursiveMode::NonRecursive) {
        tracing::warn!(error = %e, "failed to watch config.toml");
        return;
    }

    // Leak the watcher so it lives for the process lifetime
    std::mem::forget(watcher);

    tokio::spawn(async move {
        let mut current = initial_config;
        while let Some(new_config) = rx.recv().await {
            config::diff_and_apply(&current, &new_config, &state).await;
            current = new_config;
        }
    });

    tracing::info!("config file watcher started");
}

mod auth;
mod config;
mod error;
mod hub;
mod ingest;
mod queue;
mod resolver;
#[cfg(test)]
mod scenarios;
mod store;
mod tls;
mod web;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::Level;
use tracing_subscriber::EnvFilter;

use crate::auth::AuthService;
use crate::hub::agents::AgentHub;
use crate::hub::subscribers::BroadcastHub;
use crate::ingest::IngestPipeline;
use crate::queue::SpeedtestQueue;
use crate::resolver::ProbeResolver;
use crate::store::memory::{MemoryIdentityStore, MemoryTimeSeriesStore};
use crate::store::postgres::{PgIdentityStore, PgTimeSeriesStore};
use crate::store::{IdentityStore, TimeSeriesStore};
use crate::web::AppState;

fn parse_args() -> (PathBuf, Option<u16>) {
    let args: Vec<String> = std::env::args().collect();
    let mut config_path = PathBuf::from("./config/netwatch.toml");
    let mut port_override = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    config_path = PathBuf::from(&args[i + 1]);
                    i += 1;
                }
            }
            "--port" | "-p" => {
                if i + 1 < args.len() {
                    port_override = args[i + 1].parse().ok();
                    i += 1;
                }
            }
            _ => {}
        }
        i += 1;
    }

    (config_path, port_override)
}

/// Resolve the token signing secret: config/env first, then a secret
/// persisted under /var/lib/netwatch so sessions survive restarts.
fn resolve_signing_key(configured: Option<String>) -> String {
    if let Some(key) = configured {
        return key;
    }
    let secret_path = std::path::Path::new("/var/lib/netwatch/key");
    if let Ok(existing) = std::fs::read_to_string(secret_path) {
        let trimmed = existing.trim().to_string();
        if !trimmed.is_empty() {
            tracing::info!("Loaded signing key from {}", secret_path.display());
            return trimmed;
        }
    }
    let secret = auth::generate_secret(32);
    if let Err(e) = std::fs::create_dir_all("/var/lib/netwatch") {
        tracing::warn!("Failed to create /var/lib/netwatch: {e}");
    } else {
        use std::os::unix::fs::OpenOptionsExt;
        match std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(secret_path)
        {
            Ok(mut f) => {
                use std::io::Write;
                let _ = f.write_all(secret.as_bytes());
                tracing::info!("Persisted signing key to {}", secret_path.display());
            }
            Err(e) => {
                tracing::warn!("Failed to persist signing key: {e}");
            }
        }
    }
    secret
}

#[tokio::main]
async fn main() -> Result<()> {
    // Install rustls crypto provider
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let (config_path, port_override) = parse_args();

    // Load configuration and apply environment overrides
    let mut config = config::load_config(&config_path)?;
    config::apply_env_overrides(&mut config);
    if let Some(p) = port_override {
        config.server.port = p;
    }
    if let Err(issues) = config.validate() {
        let has_errors = issues.iter().any(|i| i.starts_with("ERROR:"));
        for issue in &issues {
            if issue.starts_with("ERROR:") {
                tracing::error!("{}", issue);
            } else {
                tracing::warn!("{}", issue);
            }
        }
        if has_errors {
            tracing::error!(
                "Configuration has {} issue(s). Fix the ERROR(s) above and restart.",
                issues.len()
            );
            std::process::exit(1);
        }
    }

    let port = config.server.port;
    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, port)
        .parse()
        .context("Invalid bind address")?;

    // Build TLS config
    let tls_config = tls::build_tls_config(
        config.server.tls_cert.as_deref(),
        config.server.tls_key.as_deref(),
    )?;
    let tls_acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(tls_config));

    let signing_key = resolve_signing_key(config.auth.key.clone());
    let pin_pepper = config.auth.pin_pepper.clone().unwrap_or_else(|| {
        tracing::warn!(
            "PIN_PEPPER not configured; bootstrap PINs issued before this \
             start will not verify. Set PIN_PEPPER for stable bootstrap."
        );
        auth::generate_secret(16)
    });

    // Select stores: Postgres when a DSN is configured, in-memory otherwise
    let (identity, timeseries): (Arc<dyn IdentityStore>, Arc<dyn TimeSeriesStore>) =
        match &config.database.url {
            Some(url) => {
                let pg = PgIdentityStore::connect(url, config.database.max_connections)
                    .await
                    .map_err(|e| anyhow::anyhow!("Failed to connect to database: {e}"))?;
                pg.migrate()
                    .await
                    .map_err(|e| anyhow::anyhow!("Schema bootstrap failed: {e}"))?;
                let tss = PgTimeSeriesStore::new(pg.pool().clone());
                tracing::info!("Using Postgres stores");
                (Arc::new(pg), Arc::new(tss))
            }
            None => {
                tracing::warn!(
                    "No DATABASE_URL configured; using volatile in-memory stores"
                );
                (
                    Arc::new(MemoryIdentityStore::new()),
                    Arc::new(MemoryTimeSeriesStore::new()),
                )
            }
        };

    // Core services, injected into the request handlers via AppState
    let auth_service = AuthService::new(
        identity.clone(),
        signing_key,
        pin_pepper,
        config.auth.session_ttl_secs,
    );
    let broadcast = Arc::new(BroadcastHub::new(
        identity.clone(),
        config.auth.share_revalidate_secs,
    ));
    let resolver = ProbeResolver::new(
        identity.clone(),
        timeseries.clone(),
        config.database.netinfo_cache_secs,
    );
    let ingest = IngestPipeline::new(
        identity.clone(),
        timeseries.clone(),
        broadcast.clone(),
        config.limits.clock_skew_secs,
    );
    let queue = SpeedtestQueue::new(
        identity.clone(),
        config.limits.speedtest_pending_max,
        config.limits.speedtest_ttl_secs,
    );
    let agents = AgentHub::new(config.limits.send_queue_depth);

    let sweep_interval = config.limits.sweep_interval_secs;
    let state = Arc::new(AppState {
        config,
        identity,
        auth: auth_service,
        resolver,
        ingest,
        queue,
        agents,
        broadcast,
        login_limiter: web::LoginRateLimiter::new(5, 60), // 5 attempts per 60 seconds
        started_at: std::time::Instant::now(),
    });

    let app = web::build_router(Arc::clone(&state))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &axum::http::Request<_>| {
                    let request_id = request
                        .headers()
                        .get("x-request-id")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("-");
                    tracing::info_span!(
                        "request",
                        method = %request.method(),
                        path = %request.uri().path(),
                        request_id = %request_id,
                    )
                })
                .on_request(|_request: &axum::http::Request<_>, _span: &tracing::Span| {
                    tracing::event!(Level::INFO, "started");
                })
                .on_response(
                    |response: &axum::http::Response<_>,
                     latency: std::time::Duration,
                     _span: &tracing::Span| {
                        tracing::event!(
                            Level::INFO,
                            status = %response.status().as_u16(),
                            duration_ms = %latency.as_millis(),
                            "completed"
                        );
                    },
                ),
        )
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid));

    tracing::info!("===========================================");
    tracing::info!("  NetWatcher Controller v0.1.0");
    tracing::info!("  Listening on https://{bind_addr}");
    tracing::info!("===========================================");

    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {bind_addr}"))?;

    tracing::info!("Controller ready, accepting connections");

    // Background sweeps: speedtest expiry + session purge
    {
        let sweep_state = Arc::clone(&state);
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(std::time::Duration::from_secs(sweep_interval.max(1)));
            loop {
                ticker.tick().await;
                match sweep_state.queue.expire().await {
                    Ok(expired) => {
                        // An expired in-flight item unblocks the agent's queue
                        let mut agents: Vec<i64> = expired.iter().map(|i| i.agent_id).collect();
                        agents.sort_unstable();
                        agents.dedup();
                        for agent_id in agents {
                            web::deliver_next_speedtest(&sweep_state, agent_id).await;
                        }
                    }
                    Err(e) => tracing::warn!("Speedtest expiry sweep failed: {e}"),
                }
                match sweep_state
                    .identity
                    .purge_expired_sessions(chrono::Utc::now())
                    .await
                {
                    Ok(0) => {}
                    Ok(purged) => tracing::debug!(purged, "Purged expired sessions"),
                    Err(e) => tracing::warn!("Session purge failed: {e}"),
                }
            }
        });
    }

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    // Accept TLS connections and serve with axum
    loop {
        tokio::select! {
            result = listener.accept() => {
                let (stream, peer_addr) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::warn!("Failed to accept TCP connection: {e}");
                        continue;
                    }
                };

                let acceptor = tls_acceptor.clone();
                let app = app.clone();

                tokio::spawn(async move {
                    // TLS handshake timeout (10 seconds)
                    let tls_stream = match tokio::time::timeout(
                        std::time::Duration::from_secs(10),
                        acceptor.accept(stream),
                    ).await {
                        Ok(Ok(s)) => s,
                        Ok(Err(e)) => {
                            tracing::debug!(%peer_addr, "TLS handshake failed: {e}");
                            return;
                        }
                        Err(_) => {
                            tracing::debug!(%peer_addr, "TLS handshake timed out");
                            return;
                        }
                    };

                    let io = hyper_util::rt::TokioIo::new(tls_stream);
                    let hyper_service = hyper_util::service::TowerToHyperService::new(app);
                    let builder = hyper_util::server::conn::auto::Builder::new(
                        hyper_util::rt::TokioExecutor::new(),
                    );

                    if let Err(e) = builder.serve_connection_with_upgrades(io, hyper_service).await {
                        tracing::debug!(%peer_addr, "Connection error: {e}");
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received SIGINT, initiating graceful shutdown");
                break;
            }
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, initiating graceful shutdown");
                break;
            }
        }
    }

    // Ask connected agents to close; their writers flush the frame before the
    // process exits. Agents reconnect and replay from their local queues.
    tracing::info!("Notifying connected agents of shutdown...");
    state.agents.shutdown_all().await;
    tokio::time::sleep(std::time::Duration::from_secs(1)).await;

    tracing::info!("NetWatcher controller shut down cleanly");

    Ok(())
}

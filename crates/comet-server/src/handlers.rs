//! Server wiring and admin HTTP handlers.
//!
//! One registry is built here and handed to the RPC service, the migrator and
//! both subscriber transports.

use crate::config::Config;
use crate::metrics;
use crate::rpc::{self, ChannelRpc};
use anyhow::{Context, Result};
use axum::{
    extract::{Query, State},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use comet_core::{Migrator, PushStats, Registry};
use comet_protocol::{ResultCode, RpcCall};
use comet_transport::{websocket, SessionContext, TcpTransport};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

/// Shared admin state.
pub struct AppState {
    /// The channel registry.
    pub registry: Registry,
    /// The RPC service, shared with the HTTP migrate trigger.
    pub rpc: ChannelRpc,
}

/// Query parameters of `GET /migrate`.
#[derive(Debug, Deserialize)]
pub struct MigrateParams {
    /// Comma-separated node names.
    #[serde(default)]
    pub nodes: String,
    /// Virtual nodes per node, parsed by the handler so a bad value still
    /// gets a result-code body.
    #[serde(default)]
    pub vnode: String,
}

/// Admin routes: `/health`, `/stats`, `/migrate`.
pub fn admin_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .route("/migrate", get(migrate_handler))
        .with_state(state)
}

/// Run the node until Ctrl-C.
///
/// # Errors
///
/// Returns an error if a listener cannot be bound or the startup migration is
/// refused.
pub async fn run_server(config: Config) -> Result<()> {
    let registry = Registry::with_config(config.registry_config());
    let stats = Arc::new(PushStats::new());
    let migrator = Migrator::new(registry.clone(), config.node.clone());
    let rpc = ChannelRpc::new(
        registry.clone(),
        stats,
        migrator.clone(),
        config.channel.message_expire_sec,
    );

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
        tokio::spawn(metrics::run_gauge_refresh(
            registry.clone(),
            Duration::from_secs(10),
        ));
    }

    if !config.migration.nodes.is_empty() {
        let report = migrator
            .migrate(&config.migration.nodes, config.migration.vnodes)
            .await
            .context("Startup migration refused")?;
        info!(evicted = report.evicted, "Startup migration done");
    }

    let rpc_addr = config.admin_addr()?;
    let rpc_listener = TcpListener::bind(rpc_addr)
        .await
        .with_context(|| format!("Failed to bind RPC listener on {}", rpc_addr))?;
    let rpc_task = tokio::spawn(rpc::serve(rpc_listener, rpc.clone()));

    let sessions = Arc::new(SessionContext::new(registry.clone(), config.session_config()));

    let tcp_task = if config.transport.tcp {
        let tcp_addr = config.tcp_addr()?;
        let transport = TcpTransport::bind(tcp_addr, Arc::clone(&sessions))
            .await
            .with_context(|| format!("Failed to bind TCP transport on {}", tcp_addr))?;
        Some(tokio::spawn(transport.run()))
    } else {
        None
    };

    let state = Arc::new(AppState {
        registry: registry.clone(),
        rpc,
    });
    let mut app = admin_router(state);
    if config.transport.websocket {
        app = app.merge(websocket::router(&config.http.websocket_path, sessions));
    }

    let addr = config.http_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind HTTP listener on {}", addr))?;

    info!(node = %config.node, "Comet node listening on {}", addr);
    if config.transport.websocket {
        info!(
            "WebSocket endpoint: ws://{}{}",
            addr, config.http.websocket_path
        );
    }

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    rpc_task.abort();
    if let Some(task) = tcp_task {
        task.abort();
    }

    let channels = registry.len();
    let failures = registry.close_all().await;
    info!(channels, failures, "Comet node stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}

/// Health check handler.
async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Push counters and registry size.
async fn stats_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let push = state.rpc.stats().snapshot();
    let registry = state.registry.stats();
    Json(serde_json::json!({
        "succeeded": push.succeeded,
        "failed": push.failed,
        "channels": registry.channel_count,
        "shards": registry.shard_count
    }))
}

/// HTTP form of the Migrate RPC.
async fn migrate_handler(
    Query(params): Query<MigrateParams>,
    State(state): State<Arc<AppState>>,
) -> Json<serde_json::Value> {
    let Ok(vnode) = params.vnode.trim().parse::<u32>() else {
        warn!(vnode = %params.vnode, "Migrate: vnode is not a number");
        metrics::record_rpc("migrate", ResultCode::Param);
        return migrate_body(ResultCode::Param);
    };
    let nodes: Vec<String> = params
        .nodes
        .split(',')
        .map(str::trim)
        .filter(|node| !node.is_empty())
        .map(String::from)
        .collect();
    let ret = state.rpc.handle(RpcCall::migrate(nodes, vnode)).await;
    migrate_body(ret)
}

fn migrate_body(ret: ResultCode) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "ret": ret.as_u32(),
        "msg": ret.description()
    }))
}

//! HTTP surface: captive probes, portal, admin, websocket push, and the
//! health/status/metrics trio. One listener serves all of it.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use eyre::WrapErr;
use serde::Serialize;
use sqlx::SqlitePool;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::Config;
use crate::db;
use crate::error::CoreResult;
use crate::events::EventBus;
use crate::firewall::Firewall;
use crate::identity::IdentityResolver;
use crate::metrics;
use crate::session::SessionEngine;
use crate::shaper::Shaper;
use crate::slots::SlotManager;

pub mod admin;
pub mod captive;
pub mod portal;
pub mod ws;

/// Explicit application context threaded into every handler; tests build
/// their own with the in-memory store and fakes.
pub struct AppContext {
    pub db: SqlitePool,
    pub config: Config,
    pub firewall: Arc<dyn Firewall>,
    pub shaper: Arc<dyn Shaper>,
    pub resolver: IdentityResolver,
    pub slots: SlotManager,
    pub engine: Arc<SessionEngine>,
    pub bus: EventBus,
    pub started_at: Instant,
}

pub type Ctx = Arc<AppContext>;

pub fn router(ctx: Ctx) -> Router {
    Router::new()
        .merge(captive::routes())
        .merge(portal::routes())
        .nest("/admin", admin::routes(ctx.clone()))
        .route("/ws", get(ws::ws_handler))
        .route("/healthz", get(healthz))
        .route("/status", get(status))
        .route("/metrics", get(metrics_endpoint))
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}

pub async fn serve(ctx: Ctx) -> eyre::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], ctx.config.server.port));
    let app = router(ctx);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .wrap_err_with(|| format!("failed to bind {addr}"))?;
    info!(%addr, "HTTP server started");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .wrap_err("HTTP server stopped")?;
    Ok(())
}

/// Liveness probe (always returns OK if server is running)
async fn healthz() -> &'static str {
    "OK"
}

#[derive(Serialize)]
struct StatusResponse {
    status: String,
    uptime_seconds: u64,
    clients_connected: i64,
    active_sessions: i64,
    queued_coins: i64,
    slots_claimed: usize,
}

async fn status(State(ctx): State<Ctx>) -> CoreResult<Json<StatusResponse>> {
    let slots = db::list_slots(&ctx.db).await?;
    Ok(Json(StatusResponse {
        status: "ok".to_string(),
        uptime_seconds: ctx.started_at.elapsed().as_secs(),
        clients_connected: db::count_clients_by_status(&ctx.db, "CONNECTED").await?,
        active_sessions: db::count_active_sessions(&ctx.db).await?,
        queued_coins: db::count_queued_entries(&ctx.db).await?,
        slots_claimed: slots.iter().filter(|s| s.status == "claimed").count(),
    }))
}

async fn metrics_endpoint() -> Response {
    let buffer = metrics::encode();
    (
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        buffer,
    )
        .into_response()
}

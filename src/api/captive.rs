//! OS connectivity-probe endpoints. Every modern OS fires a well-known
//! HTTP request on association; answering with the expected payload tells
//! it "online", anything else pops the captive-portal sheet. Authenticated
//! clients get the success payload, everyone else gets bounced to /portal.

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;

use crate::db;
use crate::types::ClientStatus;

use super::Ctx;

const APPLE_SUCCESS_HTML: &str =
    "<HTML><HEAD><TITLE>Success</TITLE></HEAD><BODY>Success</BODY></HTML>";

#[derive(Clone, Copy)]
enum Probe {
    /// Android / ChromeOS: empty 204.
    NoContent,
    /// Apple CNA: 200 with a literal Success page.
    AppleHtml,
    /// Plain-text success bodies (Apple success.txt, Microsoft NCSI).
    Text(&'static str),
}

pub fn routes() -> Router<Ctx> {
    Router::new()
        .route("/generate_204", get(android_probe))
        .route("/gen_204", get(android_probe))
        .route("/hotspot-detect.html", get(apple_probe))
        .route("/library/test/success.html", get(apple_probe))
        .route("/canonical.html", get(apple_probe))
        .route("/success.txt", get(apple_text_probe))
        .route("/connecttest.txt", get(ms_connecttest_probe))
        .route("/ncsi.txt", get(ms_ncsi_probe))
        .route("/connectivity-check.html", get(android_probe))
        .route("/chrome-variations/seed", get(android_probe))
        .route("/redirect", get(android_probe))
}

async fn android_probe(
    State(ctx): State<Ctx>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    answer(ctx, addr, headers, Probe::NoContent).await
}

async fn apple_probe(
    State(ctx): State<Ctx>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    answer(ctx, addr, headers, Probe::AppleHtml).await
}

async fn apple_text_probe(
    State(ctx): State<Ctx>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    answer(ctx, addr, headers, Probe::Text("Success")).await
}

async fn ms_connecttest_probe(
    State(ctx): State<Ctx>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    answer(ctx, addr, headers, Probe::Text("Microsoft Connect Test")).await
}

async fn ms_ncsi_probe(
    State(ctx): State<Ctx>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    answer(ctx, addr, headers, Probe::Text("Microsoft NCSI")).await
}

async fn answer(ctx: Ctx, addr: SocketAddr, headers: HeaderMap, probe: Probe) -> Response {
    // Probes never create client rows; an unknown device is simply
    // unauthenticated.
    let identity = ctx.resolver.resolve(addr, &headers).await;
    let authenticated = match db::find_client_by_identifiers(
        &ctx.db,
        identity.ip_string().as_deref(),
        &identity.mac,
        identity.token.as_deref(),
    )
    .await
    {
        Ok(Some(client)) => {
            client.whitelisted
                || ClientStatus::parse(&client.status)
                    .map(|s| s == ClientStatus::Connected)
                    .unwrap_or(false)
        }
        Ok(None) => false,
        Err(e) => {
            tracing::warn!(error = %e, "probe lookup failed; treating as unauthenticated");
            false
        }
    };

    let mut response = if authenticated {
        success_payload(probe)
    } else {
        portal_redirect(&ctx).await
    };
    response.headers_mut().insert(
        header::CACHE_CONTROL,
        header::HeaderValue::from_static("no-store"),
    );
    response
}

fn success_payload(probe: Probe) -> Response {
    match probe {
        Probe::NoContent => StatusCode::NO_CONTENT.into_response(),
        Probe::AppleHtml => (
            [(header::CONTENT_TYPE, "text/html")],
            APPLE_SUCCESS_HTML,
        )
            .into_response(),
        Probe::Text(body) => (
            [(header::CONTENT_TYPE, "text/plain")],
            body,
        )
            .into_response(),
    }
}

async fn portal_redirect(ctx: &Ctx) -> Response {
    let gateway_ip = match db::get_network_config(&ctx.db).await {
        Ok(config) => config.gateway_ip,
        Err(_) => "10.0.0.1".to_string(),
    };
    let location = format!("http://{gateway_ip}/portal");
    match header::HeaderValue::from_str(&location) {
        Ok(value) => (StatusCode::FOUND, [(header::LOCATION, value)]).into_response(),
        Err(_) => StatusCode::FOUND.into_response(),
    }
}

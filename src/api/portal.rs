//! Public captive-portal endpoints. Every request runs the Identity
//! Resolver first and threads the (mac, ip, token) triple through the call;
//! a freshly minted token rides back on the response as the session cookie.

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, State};
use axum::http::{header, HeaderMap};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::db::{self, CoinSlot};
use crate::error::{CoreError, CoreResult};
use crate::identity::Identity;
use crate::slots::{parse_money, Claimant};
use crate::types::{ClientStatus, PaymentMethod};

use super::Ctx;

pub fn routes() -> Router<Ctx> {
    Router::new()
        .route("/portal", get(portal_page))
        .route("/portal/session-status", get(session_status))
        .route("/portal/rates", get(rates))
        .route("/portal/claim", post(claim))
        .route("/portal/add-coin", post(add_coin))
        .route("/portal/my-slot", get(my_slot))
        .route("/portal/release", post(release))
        .route("/portal/purchase", post(purchase))
}

/// Attach the freshly minted session cookie, when there is one.
fn with_cookie(identity: &Identity, mut response: Response) -> Response {
    if let Some(cookie) = identity.set_cookie_value() {
        response.headers_mut().append(header::SET_COOKIE, cookie);
    }
    response
}

fn user_agent(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
}

/// Minimal HTML shell; the page polls session-status and drives the coin
/// flow through the JSON endpoints below.
async fn portal_page(
    State(ctx): State<Ctx>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let identity = ctx.resolver.resolve(addr, &headers).await;
    let body = Html(
        r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"><meta name="viewport" content="width=device-width, initial-scale=1"><title>PisoWiFi</title></head>
<body>
<h1>PisoWiFi</h1>
<p>Insert coins to buy internet time.</p>
<div id="status">Checking session…</div>
<script>
async function poll() {
  const r = await fetch('/portal/session-status');
  const s = await r.json();
  document.getElementById('status').textContent =
    s.authenticated ? 'Connected: ' + s.time_remaining + 's left' : 'Not connected';
}
poll(); setInterval(poll, 3000);
</script>
</body>
</html>
"#,
    );
    with_cookie(&identity, body.into_response())
}

#[derive(Serialize)]
struct SessionStatusResponse {
    authenticated: bool,
    time_remaining: i64,
    status: String,
}

async fn session_status(
    State(ctx): State<Ctx>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> CoreResult<Response> {
    let identity = ctx.resolver.resolve(addr, &headers).await;
    let client = ctx
        .engine
        .ensure_client(&identity, user_agent(&headers).as_deref())
        .await?;
    let status = ClientStatus::parse(&client.status)?;
    let response = Json(SessionStatusResponse {
        authenticated: status == ClientStatus::Connected || client.whitelisted,
        time_remaining: client.time_remaining,
        status: client.status,
    })
    .into_response();
    Ok(with_cookie(&identity, response))
}

async fn rates(State(ctx): State<Ctx>) -> CoreResult<Response> {
    let rates = db::list_active_rates(&ctx.db).await?;
    Ok(Json(rates).into_response())
}

#[derive(Deserialize)]
struct ClaimRequest {
    slot_number: i64,
}

#[derive(Serialize)]
struct ClaimResponse {
    slot: CoinSlot,
}

async fn claim(
    State(ctx): State<Ctx>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(request): Json<ClaimRequest>,
) -> CoreResult<Response> {
    let identity = ctx.resolver.resolve(addr, &headers).await;
    ctx.engine
        .ensure_client(&identity, user_agent(&headers).as_deref())
        .await?;
    let slot = ctx
        .slots
        .claim(request.slot_number, &Claimant::from(&identity))
        .await?;
    let response = Json(ClaimResponse { slot }).into_response();
    Ok(with_cookie(&identity, response))
}

#[derive(Deserialize)]
struct AddCoinRequest {
    slot_number: i64,
    coin_value: f64,
    coin_count: i64,
}

#[derive(Serialize)]
struct AddCoinResponse {
    queued_total: String,
}

/// Typically called by the coin ingress on behalf of the claimant; the
/// browser may also call it (kiosk testing). Both paths verify slot
/// ownership the same way.
async fn add_coin(
    State(ctx): State<Ctx>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(request): Json<AddCoinRequest>,
) -> CoreResult<Response> {
    let identity = ctx.resolver.resolve(addr, &headers).await;
    let value = parse_money(&format!("{}", request.coin_value))?;
    let total = ctx
        .slots
        .add_coin(
            request.slot_number,
            &Claimant::from(&identity),
            &value,
            request.coin_count,
        )
        .await?;
    let response = Json(AddCoinResponse {
        queued_total: total.to_string(),
    })
    .into_response();
    Ok(with_cookie(&identity, response))
}

#[derive(Serialize)]
struct MySlotResponse {
    claim: Option<CoinSlot>,
    queued_total: String,
}

async fn my_slot(
    State(ctx): State<Ctx>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> CoreResult<Response> {
    let identity = ctx.resolver.resolve(addr, &headers).await;
    let view = ctx.slots.my_slot(&Claimant::from(&identity)).await?;
    let response = Json(MySlotResponse {
        claim: view.claim,
        queued_total: view.queued_total.to_string(),
    })
    .into_response();
    Ok(with_cookie(&identity, response))
}

#[derive(Deserialize)]
struct ReleaseRequest {
    slot_number: i64,
    #[serde(default)]
    preserve_queue: bool,
}

async fn release(
    State(ctx): State<Ctx>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(request): Json<ReleaseRequest>,
) -> CoreResult<Response> {
    let identity = ctx.resolver.resolve(addr, &headers).await;
    ctx.slots
        .release(
            request.slot_number,
            &Claimant::from(&identity),
            request.preserve_queue,
        )
        .await?;
    let response = Json(serde_json::json!({ "released": true })).into_response();
    Ok(with_cookie(&identity, response))
}

#[derive(Deserialize)]
struct PurchaseRequest {
    rate_id: i64,
}

#[derive(Serialize)]
struct PurchaseResponse {
    status: String,
    time_remaining: i64,
    granted_duration: i64,
    amount_charged: String,
    change: String,
}

/// Redeem queued coins for time, then open the session. The redeem commit
/// happens before this response is prepared, so a client that disconnects
/// mid-purchase still gets its time.
async fn purchase(
    State(ctx): State<Ctx>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(request): Json<PurchaseRequest>,
) -> CoreResult<Response> {
    if request.rate_id <= 0 {
        return Err(CoreError::InvalidInput(format!(
            "rate id must be positive, got {}",
            request.rate_id
        )));
    }
    let identity = ctx.resolver.resolve(addr, &headers).await;
    let client = ctx
        .engine
        .ensure_client(&identity, user_agent(&headers).as_deref())
        .await?;
    // Refuse before redeem: a blocked client must not burn its queued
    // coins on a purchase that can never be granted.
    if ClientStatus::parse(&client.status)? == ClientStatus::Blocked {
        return Err(CoreError::Forbidden(format!(
            "client {} is blocked",
            client.mac_address
        )));
    }
    let rate = db::get_active_rate(&ctx.db, request.rate_id)
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("rate {}", request.rate_id)))?;

    let redemption = ctx.slots.redeem(&Claimant::from(&identity), &rate).await?;
    let client = ctx
        .engine
        .authenticate(
            client.id,
            redemption.granted_duration,
            PaymentMethod::Coin,
            Some(redemption.rate_id),
            &redemption.amount_charged.to_string(),
            redemption.coins_used,
        )
        .await?;

    let response = Json(PurchaseResponse {
        status: client.status,
        time_remaining: client.time_remaining,
        granted_duration: redemption.granted_duration,
        amount_charged: redemption.amount_charged.to_string(),
        change: redemption.change.to_string(),
    })
    .into_response();
    Ok(with_cookie(&identity, response))
}

//! Operator endpoints behind a bearer-token check. Token issuance lives in
//! the dashboard; this layer only verifies the HS256 signature against
//! `JWT_SECRET`. Every input is validated before the store or kernel is
//! touched, and every mutating action lands in the system log.

use std::time::Duration;

use axum::extract::{Path, Request, State};
use axum::http::HeaderMap;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::db::{self, Client, NewRate};
use crate::error::{CoreError, CoreResult};
use crate::net::{canonical_mac, validate_service};
use crate::slots::parse_money;
use crate::types::{DisconnectReason, PaymentMethod};

use super::Ctx;

pub fn routes(ctx: Ctx) -> Router<Ctx> {
    Router::new()
        .route("/clients", get(list_clients))
        .route("/clients/{mac}", get(get_client))
        .route("/clients/{mac}/authenticate", post(authenticate_client))
        .route("/clients/{mac}/disconnect", post(disconnect_client))
        .route("/clients/{mac}/pause", post(pause_client))
        .route("/clients/{mac}/resume", post(resume_client))
        .route("/clients/{mac}/block", post(block_client))
        .route("/clients/{mac}/whitelist", post(whitelist_client))
        .route("/clients/{mac}/bandwidth", post(set_bandwidth))
        .route("/rates", get(list_rates).post(create_rate))
        .route("/rates/{id}", delete(delete_rate))
        .route("/settings/portal", get(get_portal_settings).put(put_portal_settings))
        .route("/settings/ttl", get(get_ttl_settings).put(put_ttl_settings))
        .route("/slots", get(list_slots))
        .route("/slots/{n}/release", post(force_release_slot))
        .route("/ttl/violations", get(list_violations))
        .route("/ttl/violations/{mac}/resolve", post(resolve_violation))
        .route("/transactions", get(list_transactions))
        .route("/services/{name}/restart", post(restart_service))
        .layer(middleware::from_fn_with_state(ctx, admin_auth))
}

#[derive(Debug, Deserialize)]
struct Claims {
    #[allow(dead_code)]
    sub: String,
    #[allow(dead_code)]
    exp: usize,
}

pub fn verify_token(secret: &str, token: &str) -> bool {
    let key = DecodingKey::from_secret(secret.as_bytes());
    jsonwebtoken::decode::<Claims>(token, &key, &Validation::new(Algorithm::HS256)).is_ok()
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

async fn admin_auth(State(ctx): State<Ctx>, request: Request, next: Next) -> Response {
    if ctx.config.server.dev_mode && ctx.config.server.jwt_secret.is_empty() {
        return next.run(request).await;
    }
    match bearer_token(request.headers()) {
        Some(token) if verify_token(&ctx.config.server.jwt_secret, token) => {
            next.run(request).await
        }
        _ => CoreError::Forbidden("admin token missing or invalid".into()).into_response(),
    }
}

async fn log_action(ctx: &Ctx, action: &str, details: String) {
    if let Err(e) = db::append_system_log(&ctx.db, "admin", action, Some(&details), Utc::now()).await
    {
        warn!(error = %e, action, "failed to append system log");
    }
}

async fn client_by_mac(ctx: &Ctx, mac: &str) -> CoreResult<Client> {
    let mac = canonical_mac(mac)?;
    db::get_client_by_mac(&ctx.db, &mac)
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("client {mac}")))
}

async fn list_clients(State(ctx): State<Ctx>) -> CoreResult<Json<Vec<Client>>> {
    Ok(Json(db::list_clients(&ctx.db).await?))
}

async fn get_client(State(ctx): State<Ctx>, Path(mac): Path<String>) -> CoreResult<Json<Client>> {
    Ok(Json(client_by_mac(&ctx, &mac).await?))
}

#[derive(Deserialize)]
struct GrantRequest {
    duration_secs: i64,
}

/// Manual grant: credits time with a zero-amount ADMIN transaction.
async fn authenticate_client(
    State(ctx): State<Ctx>,
    Path(mac): Path<String>,
    Json(request): Json<GrantRequest>,
) -> CoreResult<Json<Client>> {
    let client = client_by_mac(&ctx, &mac).await?;
    let updated = ctx
        .engine
        .authenticate(client.id, request.duration_secs, PaymentMethod::Admin, None, "0", 0)
        .await?;
    log_action(&ctx, "authenticate", format!("{mac} +{}s", request.duration_secs)).await;
    Ok(Json(updated))
}

async fn disconnect_client(
    State(ctx): State<Ctx>,
    Path(mac): Path<String>,
) -> CoreResult<Json<Client>> {
    let client = client_by_mac(&ctx, &mac).await?;
    let updated = ctx.engine.disconnect(client.id, DisconnectReason::AdminAction).await?;
    log_action(&ctx, "disconnect", mac).await;
    Ok(Json(updated))
}

async fn pause_client(State(ctx): State<Ctx>, Path(mac): Path<String>) -> CoreResult<Json<Client>> {
    let client = client_by_mac(&ctx, &mac).await?;
    let updated = ctx.engine.pause(client.id, None).await?;
    log_action(&ctx, "pause", mac).await;
    Ok(Json(updated))
}

async fn resume_client(State(ctx): State<Ctx>, Path(mac): Path<String>) -> CoreResult<Json<Client>> {
    let client = client_by_mac(&ctx, &mac).await?;
    let updated = ctx.engine.resume(client.id).await?;
    log_action(&ctx, "resume", mac).await;
    Ok(Json(updated))
}

async fn block_client(State(ctx): State<Ctx>, Path(mac): Path<String>) -> CoreResult<Json<Client>> {
    let client = client_by_mac(&ctx, &mac).await?;
    let updated = ctx.engine.block(client.id).await?;
    log_action(&ctx, "block", mac).await;
    Ok(Json(updated))
}

#[derive(Deserialize)]
struct WhitelistRequest {
    #[serde(default = "default_true")]
    enabled: bool,
}

fn default_true() -> bool {
    true
}

async fn whitelist_client(
    State(ctx): State<Ctx>,
    Path(mac): Path<String>,
    Json(request): Json<WhitelistRequest>,
) -> CoreResult<Json<Client>> {
    let client = client_by_mac(&ctx, &mac).await?;
    let updated = ctx.engine.set_whitelist(client.id, request.enabled).await?;
    log_action(&ctx, "whitelist", format!("{mac} enabled={}", request.enabled)).await;
    Ok(Json(updated))
}

#[derive(Deserialize)]
struct BandwidthRequest {
    download_kbps: i64,
    upload_kbps: i64,
}

async fn set_bandwidth(
    State(ctx): State<Ctx>,
    Path(mac): Path<String>,
    Json(request): Json<BandwidthRequest>,
) -> CoreResult<Json<Client>> {
    for kbps in [request.download_kbps, request.upload_kbps] {
        if kbps != 0 && !(1..=10_000_000).contains(&kbps) {
            return Err(CoreError::InvalidInput(format!(
                "bandwidth out of range [1, 10000000] kbps: {kbps}"
            )));
        }
    }
    let client = client_by_mac(&ctx, &mac).await?;
    db::set_client_limits(&ctx.db, client.id, request.download_kbps, request.upload_kbps).await?;

    if let Some(ip) = client.ip_address.as_deref().and_then(|ip| ip.parse().ok()) {
        if request.download_kbps == 0 && request.upload_kbps == 0 {
            if let Err(e) = ctx.shaper.clear_client(ip).await {
                warn!(%ip, error = %e, "shaper clear failed");
            }
        } else if client.status == "CONNECTED" || client.whitelisted {
            let limits = crate::shaper::ClientLimits {
                download_kbps: request.download_kbps as u32,
                upload_kbps: request.upload_kbps as u32,
            };
            if let Err(e) = ctx.shaper.set_client(ip, limits).await {
                warn!(%ip, error = %e, "shaper update failed");
            }
        }
    }
    log_action(
        &ctx,
        "bandwidth",
        format!("{mac} down={} up={}", request.download_kbps, request.upload_kbps),
    )
    .await;
    let updated = db::get_client(&ctx.db, client.id)
        .await?
        .ok_or_else(|| CoreError::Io("client vanished".into()))?;
    Ok(Json(updated))
}

async fn list_rates(State(ctx): State<Ctx>) -> CoreResult<Json<Vec<db::Rate>>> {
    Ok(Json(db::list_active_rates(&ctx.db).await?))
}

#[derive(Deserialize)]
struct CreateRateRequest {
    name: String,
    price: String,
    duration_secs: i64,
    #[serde(default = "default_coins_required")]
    coins_required: i64,
}

fn default_coins_required() -> i64 {
    1
}

async fn create_rate(
    State(ctx): State<Ctx>,
    Json(request): Json<CreateRateRequest>,
) -> CoreResult<Json<db::Rate>> {
    if request.name.trim().is_empty() || request.name.len() > 100 {
        return Err(CoreError::InvalidInput("rate name must be 1..100 chars".into()));
    }
    let price = parse_money(&request.price)?;
    if price <= bigdecimal::BigDecimal::from(0) {
        return Err(CoreError::InvalidInput("rate price must be positive".into()));
    }
    if request.duration_secs <= 0 {
        return Err(CoreError::InvalidInput("rate duration must be positive".into()));
    }
    if request.coins_required < 1 {
        return Err(CoreError::InvalidInput("coins_required must be >= 1".into()));
    }
    let id = db::insert_rate(
        &ctx.db,
        &NewRate {
            name: request.name.trim().to_string(),
            price: price.to_string(),
            duration: request.duration_secs,
            coins_required: request.coins_required,
        },
        Utc::now(),
    )
    .await?;
    log_action(&ctx, "rate_create", format!("id={id} price={price}")).await;
    let rate = db::get_active_rate(&ctx.db, id)
        .await?
        .ok_or_else(|| CoreError::Io("rate vanished after insert".into()))?;
    Ok(Json(rate))
}

async fn delete_rate(State(ctx): State<Ctx>, Path(id): Path<i64>) -> CoreResult<Response> {
    if db::deactivate_rate(&ctx.db, id).await? == 0 {
        return Err(CoreError::NotFound(format!("rate {id}")));
    }
    log_action(&ctx, "rate_delete", format!("id={id}")).await;
    Ok(Json(serde_json::json!({ "deleted": true })).into_response())
}

async fn get_portal_settings(State(ctx): State<Ctx>) -> CoreResult<Json<db::PortalSettings>> {
    Ok(Json(db::get_portal_settings(&ctx.db).await?))
}

#[derive(Deserialize)]
struct PortalSettingsUpdate {
    coin_timeout: i64,
    auto_pause_on_disconnect: bool,
    auto_resume_on_pause: bool,
    pause_resume_minutes: i64,
    coin_abuse_protection: bool,
    coin_attempt_limit: i64,
    coin_attempt_window: i64,
    coin_block_duration: i64,
}

async fn put_portal_settings(
    State(ctx): State<Ctx>,
    Json(update): Json<PortalSettingsUpdate>,
) -> CoreResult<Json<db::PortalSettings>> {
    if !(10..=3600).contains(&update.coin_timeout) {
        return Err(CoreError::InvalidInput(
            "coin_timeout must be 10..3600 seconds".into(),
        ));
    }
    if update.coin_attempt_limit < 1 || update.coin_attempt_window < 1 || update.coin_block_duration < 1
    {
        return Err(CoreError::InvalidInput(
            "abuse guard settings must be positive".into(),
        ));
    }
    let settings = db::PortalSettings {
        id: 1,
        coin_timeout: update.coin_timeout,
        auto_pause_on_disconnect: update.auto_pause_on_disconnect,
        auto_resume_on_pause: update.auto_resume_on_pause,
        pause_resume_minutes: update.pause_resume_minutes,
        coin_abuse_protection: update.coin_abuse_protection,
        coin_attempt_limit: update.coin_attempt_limit,
        coin_attempt_window: update.coin_attempt_window,
        coin_block_duration: update.coin_block_duration,
    };
    db::update_portal_settings(&ctx.db, &settings).await?;
    log_action(&ctx, "portal_settings", format!("coin_timeout={}", settings.coin_timeout)).await;
    Ok(Json(db::get_portal_settings(&ctx.db).await?))
}

async fn get_ttl_settings(State(ctx): State<Ctx>) -> CoreResult<Json<db::TtlSettings>> {
    Ok(Json(db::get_ttl_settings(&ctx.db).await?))
}

#[derive(Deserialize)]
struct TtlSettingsUpdate {
    enabled: bool,
    sensitivity: String,
    auto_block: bool,
    alert_threshold: i64,
}

async fn put_ttl_settings(
    State(ctx): State<Ctx>,
    Json(update): Json<TtlSettingsUpdate>,
) -> CoreResult<Json<db::TtlSettings>> {
    crate::types::TtlSensitivity::parse(&update.sensitivity)?;
    if !(1..=100).contains(&update.alert_threshold) {
        return Err(CoreError::InvalidInput("alert_threshold must be 1..100".into()));
    }
    let settings = db::TtlSettings {
        id: 1,
        enabled: update.enabled,
        sensitivity: update.sensitivity,
        auto_block: update.auto_block,
        alert_threshold: update.alert_threshold,
    };
    db::update_ttl_settings(&ctx.db, &settings).await?;
    log_action(&ctx, "ttl_settings", format!("sensitivity={}", settings.sensitivity)).await;
    Ok(Json(db::get_ttl_settings(&ctx.db).await?))
}

async fn list_slots(State(ctx): State<Ctx>) -> CoreResult<Json<Vec<db::CoinSlot>>> {
    Ok(Json(db::list_slots(&ctx.db).await?))
}

/// Force-release a wedged claim. The queue is preserved so the claimant's
/// coins stay redeemable.
async fn force_release_slot(
    State(ctx): State<Ctx>,
    Path(n): Path<i64>,
) -> CoreResult<Response> {
    let claimant = crate::slots::Claimant {
        ip: None,
        mac: crate::net::UNKNOWN_MAC.to_string(),
        token: None,
    };
    ctx.slots.release(n, &claimant, true).await?;
    log_action(&ctx, "slot_release", format!("slot={n}")).await;
    Ok(Json(serde_json::json!({ "released": true })).into_response())
}

async fn list_violations(State(ctx): State<Ctx>) -> CoreResult<Json<Vec<db::TtlViolation>>> {
    Ok(Json(db::list_ttl_violations(&ctx.db).await?))
}

/// Clear a tethering violation: lift the selective drop and mark resolved.
async fn resolve_violation(
    State(ctx): State<Ctx>,
    Path(mac): Path<String>,
) -> CoreResult<Response> {
    let mac = canonical_mac(&mac)?;
    if let Some(baseline) = db::get_ttl_baseline(&ctx.db, &mac).await? {
        if let Err(e) = ctx
            .firewall
            .remove_ttl_drop(&mac, baseline.baseline_ttl as u8)
            .await
        {
            warn!(mac = %mac, error = %e, "TTL drop removal failed");
        }
    }
    if db::resolve_ttl_violation(&ctx.db, &mac, Utc::now()).await? == 0 {
        return Err(CoreError::NotFound(format!("violation for {mac}")));
    }
    log_action(&ctx, "ttl_resolve", mac).await;
    Ok(Json(serde_json::json!({ "resolved": true })).into_response())
}

async fn list_transactions(State(ctx): State<Ctx>) -> CoreResult<Json<Vec<db::Transaction>>> {
    Ok(Json(db::list_recent_transactions(&ctx.db, 100).await?))
}

/// Restart one of the allow-listed companion services. The name never
/// reaches argv unless it is literally on the list.
async fn restart_service(
    State(ctx): State<Ctx>,
    Path(name): Path<String>,
) -> CoreResult<Response> {
    let service = validate_service(&name)?;
    let fut = Command::new("systemctl")
        .args(["restart", service])
        .kill_on_drop(true)
        .output();
    let out = match timeout(Duration::from_secs(5), fut).await {
        Ok(Ok(out)) => out,
        Ok(Err(e)) => return Err(CoreError::KernelError(format!("spawn systemctl: {e}"))),
        Err(_) => return Err(CoreError::KernelError("systemctl timed out".into())),
    };
    if !out.status.success() {
        return Err(CoreError::KernelError(format!(
            "restart {service}: {}",
            String::from_utf8_lossy(&out.stderr).trim()
        )));
    }
    info!(service, "service restarted");
    log_action(&ctx, "service_restart", service.to_string()).await;
    Ok(Json(serde_json::json!({ "restarted": service })).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde::Serialize;

    #[derive(Serialize)]
    struct TestClaims {
        sub: String,
        exp: usize,
    }

    #[test]
    fn test_verify_token_roundtrip() {
        let secret = "0123456789abcdef0123";
        let token = encode(
            &Header::default(),
            &TestClaims {
                sub: "operator".into(),
                exp: (chrono::Utc::now().timestamp() + 3600) as usize,
            },
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap();
        assert!(verify_token(secret, &token));
        assert!(!verify_token("wrong-secret-wrong-1", &token));
        assert!(!verify_token(secret, "not-a-jwt"));
    }

    #[test]
    fn test_expired_token_rejected() {
        let secret = "0123456789abcdef0123";
        let token = encode(
            &Header::default(),
            &TestClaims {
                sub: "operator".into(),
                exp: (chrono::Utc::now().timestamp() - 3600) as usize,
            },
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap();
        assert!(!verify_token(secret, &token));
    }

    #[test]
    fn test_bearer_token_extraction() {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            "Bearer abc.def.ghi".parse().unwrap(),
        );
        assert_eq!(bearer_token(&headers), Some("abc.def.ghi"));
        headers.insert(
            axum::http::header::AUTHORIZATION,
            "Basic zzzz".parse().unwrap(),
        );
        assert_eq!(bearer_token(&headers), None);
    }
}

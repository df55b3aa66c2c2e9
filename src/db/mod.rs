//! Durable state. Single-writer discipline: every component that owns a
//! table mutates it only through these queries; multi-step operations run
//! inside one transaction at the call site and pass the connection down.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use eyre::{Result, WrapErr};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{Executor, QueryBuilder, Sqlite};

use crate::error::CoreResult;

pub mod models;

pub use models::*;

/// Create a database connection pool. The embedded file store is created on
/// first boot; `DATABASE_URL` can point it elsewhere.
pub async fn create_pool(database_url: &str) -> Result<SqlitePool> {
    let opts = SqliteConnectOptions::from_str(database_url)
        .wrap_err("invalid DATABASE_URL")?
        .create_if_missing(true)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(5));

    // An in-memory database exists per connection; more than one pooled
    // connection would silently shard the data.
    let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };

    SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(opts)
        .await
        .wrap_err("Failed to connect to database")
}

/// Run pending migrations (uses the migration files in migrations/)
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .wrap_err("Failed to run database migrations")?;
    Ok(())
}

// ============ Clients ============

pub async fn insert_client(
    ex: impl Executor<'_, Database = Sqlite>,
    client: &NewClient,
    now: DateTime<Utc>,
) -> CoreResult<i64> {
    let res = sqlx::query(
        r#"
        INSERT INTO clients (mac_address, ip_address, session_token, device_os,
            device_browser, user_agent, created_at, last_seen)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&client.mac_address)
    .bind(&client.ip_address)
    .bind(&client.session_token)
    .bind(&client.device_os)
    .bind(&client.device_browser)
    .bind(&client.user_agent)
    .bind(now)
    .bind(now)
    .execute(ex)
    .await?;

    Ok(res.last_insert_rowid())
}

pub async fn get_client(
    ex: impl Executor<'_, Database = Sqlite>,
    id: i64,
) -> CoreResult<Option<Client>> {
    let row = sqlx::query_as::<_, Client>(r#"SELECT * FROM clients WHERE id = ?"#)
        .bind(id)
        .fetch_optional(ex)
        .await?;
    Ok(row)
}

pub async fn get_client_by_mac(
    ex: impl Executor<'_, Database = Sqlite>,
    mac: &str,
) -> CoreResult<Option<Client>> {
    let row = sqlx::query_as::<_, Client>(
        r#"SELECT * FROM clients WHERE mac_address = ? AND mac_address != 'Unknown'"#,
    )
    .bind(mac)
    .fetch_optional(ex)
    .await?;
    Ok(row)
}

pub async fn get_client_by_token(
    ex: impl Executor<'_, Database = Sqlite>,
    token: &str,
) -> CoreResult<Option<Client>> {
    let row = sqlx::query_as::<_, Client>(
        r#"SELECT * FROM clients WHERE session_token = ? ORDER BY last_seen DESC LIMIT 1"#,
    )
    .bind(token)
    .fetch_optional(ex)
    .await?;
    Ok(row)
}

pub async fn get_client_by_ip(
    ex: impl Executor<'_, Database = Sqlite>,
    ip: &str,
) -> CoreResult<Option<Client>> {
    let row = sqlx::query_as::<_, Client>(
        r#"SELECT * FROM clients WHERE ip_address = ? ORDER BY last_seen DESC LIMIT 1"#,
    )
    .bind(ip)
    .fetch_optional(ex)
    .await?;
    Ok(row)
}

/// Locate a client by the identifier fallback order: MAC (when real), then
/// session token, then IP. MAC randomization means the token is the stable
/// key; the MAC is still checked first because it is unique when present.
pub async fn find_client_by_identifiers(
    pool: &SqlitePool,
    ip: Option<&str>,
    mac: &str,
    token: Option<&str>,
) -> CoreResult<Option<Client>> {
    if mac != crate::net::UNKNOWN_MAC {
        if let Some(client) = get_client_by_mac(pool, mac).await? {
            return Ok(Some(client));
        }
    }
    if let Some(token) = token {
        if let Some(client) = get_client_by_token(pool, token).await? {
            return Ok(Some(client));
        }
    }
    if let Some(ip) = ip {
        if let Some(client) = get_client_by_ip(pool, ip).await? {
            return Ok(Some(client));
        }
    }
    Ok(None)
}

pub async fn list_clients(ex: impl Executor<'_, Database = Sqlite>) -> CoreResult<Vec<Client>> {
    let rows = sqlx::query_as::<_, Client>(r#"SELECT * FROM clients ORDER BY last_seen DESC"#)
        .fetch_all(ex)
        .await?;
    Ok(rows)
}

pub async fn count_clients_by_status(
    ex: impl Executor<'_, Database = Sqlite>,
    status: &str,
) -> CoreResult<i64> {
    let row: (i64,) = sqlx::query_as(r#"SELECT COUNT(*) FROM clients WHERE status = ?"#)
        .bind(status)
        .fetch_one(ex)
        .await?;
    Ok(row.0)
}

/// Refresh a client's address and visit time on portal contact.
pub async fn touch_client(
    ex: impl Executor<'_, Database = Sqlite>,
    id: i64,
    ip: Option<&str>,
    now: DateTime<Utc>,
) -> CoreResult<()> {
    sqlx::query(
        r#"UPDATE clients SET ip_address = COALESCE(?, ip_address), last_seen = ? WHERE id = ?"#,
    )
    .bind(ip)
    .bind(now)
    .bind(id)
    .execute(ex)
    .await?;
    Ok(())
}

pub async fn set_client_limits(
    ex: impl Executor<'_, Database = Sqlite>,
    id: i64,
    download_kbps: i64,
    upload_kbps: i64,
) -> CoreResult<()> {
    sqlx::query(r#"UPDATE clients SET download_limit = ?, upload_limit = ? WHERE id = ?"#)
        .bind(download_kbps)
        .bind(upload_kbps)
        .bind(id)
        .execute(ex)
        .await?;
    Ok(())
}

pub async fn set_client_status(
    ex: impl Executor<'_, Database = Sqlite>,
    id: i64,
    status: &str,
) -> CoreResult<()> {
    sqlx::query(r#"UPDATE clients SET status = ? WHERE id = ?"#)
        .bind(status)
        .bind(id)
        .execute(ex)
        .await?;
    Ok(())
}

pub async fn set_client_paused_until(
    ex: impl Executor<'_, Database = Sqlite>,
    id: i64,
    until: Option<DateTime<Utc>>,
) -> CoreResult<()> {
    sqlx::query(r#"UPDATE clients SET paused_until = ? WHERE id = ?"#)
        .bind(until)
        .bind(id)
        .execute(ex)
        .await?;
    Ok(())
}

/// Credit purchased time and mark the client connected.
pub async fn credit_client_time(
    ex: impl Executor<'_, Database = Sqlite>,
    id: i64,
    duration_secs: i64,
    amount_paid: &str,
    now: DateTime<Utc>,
) -> CoreResult<()> {
    sqlx::query(
        r#"
        UPDATE clients
        SET time_remaining = time_remaining + ?,
            total_amount_paid = CAST(CAST(total_amount_paid AS REAL) + CAST(? AS REAL) AS TEXT),
            status = 'CONNECTED',
            paused_until = NULL,
            last_seen = ?
        WHERE id = ?
        "#,
    )
    .bind(duration_secs)
    .bind(amount_paid)
    .bind(now)
    .bind(id)
    .execute(ex)
    .await?;
    Ok(())
}

pub async fn zero_client_time(
    ex: impl Executor<'_, Database = Sqlite>,
    id: i64,
) -> CoreResult<()> {
    sqlx::query(r#"UPDATE clients SET time_remaining = 0 WHERE id = ?"#)
        .bind(id)
        .execute(ex)
        .await?;
    Ok(())
}

pub async fn set_client_token(
    ex: impl Executor<'_, Database = Sqlite>,
    id: i64,
    token: &str,
) -> CoreResult<()> {
    sqlx::query(r#"UPDATE clients SET session_token = ? WHERE id = ?"#)
        .bind(token)
        .bind(id)
        .execute(ex)
        .await?;
    Ok(())
}

/// Adopt a freshly resolved MAC onto a token-keyed row. Callers must have
/// verified no other row holds this MAC (the unique index backs them up).
pub async fn set_client_mac(
    ex: impl Executor<'_, Database = Sqlite>,
    id: i64,
    mac: &str,
) -> CoreResult<()> {
    sqlx::query(r#"UPDATE clients SET mac_address = ? WHERE id = ?"#)
        .bind(mac)
        .bind(id)
        .execute(ex)
        .await?;
    Ok(())
}

pub async fn set_client_whitelisted(
    ex: impl Executor<'_, Database = Sqlite>,
    id: i64,
    whitelisted: bool,
) -> CoreResult<()> {
    sqlx::query(r#"UPDATE clients SET whitelisted = ? WHERE id = ?"#)
        .bind(whitelisted)
        .bind(id)
        .execute(ex)
        .await?;
    Ok(())
}

/// Tick step 3a: one-second decrement for every connected client with time
/// left. Always exactly one second regardless of tick drift.
pub async fn decrement_connected_time(
    ex: impl Executor<'_, Database = Sqlite>,
) -> CoreResult<u64> {
    let res = sqlx::query(
        r#"
        UPDATE clients SET time_remaining = time_remaining - 1
        WHERE status = 'CONNECTED' AND time_remaining > 0 AND whitelisted = 0
        "#,
    )
    .execute(ex)
    .await?;
    Ok(res.rows_affected())
}

/// Tick step 3b: refresh last_seen for connected clients whose MAC is
/// present on the LAN (or unverifiable). Absent devices keep a stale
/// last_seen, which is what arms the auto-pause check.
pub async fn refresh_last_seen(
    ex: impl Executor<'_, Database = Sqlite>,
    present_macs: &[String],
    now: DateTime<Utc>,
) -> CoreResult<u64> {
    let mut qb = QueryBuilder::<Sqlite>::new(
        "UPDATE clients SET last_seen = ",
    );
    qb.push_bind(now);
    qb.push(" WHERE status = 'CONNECTED' AND (mac_address = 'Unknown'");
    if !present_macs.is_empty() {
        qb.push(" OR mac_address IN (");
        let mut sep = qb.separated(", ");
        for mac in present_macs {
            sep.push_bind(mac);
        }
        qb.push(")");
    }
    qb.push(")");
    let res = qb.build().execute(ex).await?;
    Ok(res.rows_affected())
}

pub async fn select_connected_out_of_time(
    ex: impl Executor<'_, Database = Sqlite>,
) -> CoreResult<Vec<Client>> {
    let rows = sqlx::query_as::<_, Client>(
        r#"SELECT * FROM clients WHERE status = 'CONNECTED' AND time_remaining <= 0 AND whitelisted = 0"#,
    )
    .fetch_all(ex)
    .await?;
    Ok(rows)
}

pub async fn select_autopause_candidates(
    ex: impl Executor<'_, Database = Sqlite>,
    seen_before: DateTime<Utc>,
) -> CoreResult<Vec<Client>> {
    let rows = sqlx::query_as::<_, Client>(
        r#"
        SELECT * FROM clients
        WHERE status = 'CONNECTED' AND time_remaining > 0 AND whitelisted = 0 AND last_seen < ?
        "#,
    )
    .bind(seen_before)
    .fetch_all(ex)
    .await?;
    Ok(rows)
}

pub async fn select_autoresume_candidates(
    ex: impl Executor<'_, Database = Sqlite>,
    now: DateTime<Utc>,
) -> CoreResult<Vec<Client>> {
    let rows = sqlx::query_as::<_, Client>(
        r#"
        SELECT * FROM clients
        WHERE status = 'PAUSED' AND paused_until IS NOT NULL AND paused_until <= ?
        "#,
    )
    .bind(now)
    .fetch_all(ex)
    .await?;
    Ok(rows)
}

/// Clients that should currently hold a forwarding grant: connected payers
/// plus whitelisted devices. Used only for reconciliation.
pub async fn select_authorized_clients(
    ex: impl Executor<'_, Database = Sqlite>,
) -> CoreResult<Vec<Client>> {
    let rows = sqlx::query_as::<_, Client>(
        r#"
        SELECT * FROM clients
        WHERE (status = 'CONNECTED' AND time_remaining > 0) OR whitelisted = 1
        "#,
    )
    .fetch_all(ex)
    .await?;
    Ok(rows)
}

pub async fn select_stale_disconnected(
    ex: impl Executor<'_, Database = Sqlite>,
    seen_before: DateTime<Utc>,
) -> CoreResult<Vec<Client>> {
    let rows = sqlx::query_as::<_, Client>(
        r#"
        SELECT * FROM clients
        WHERE status = 'DISCONNECTED' AND time_remaining = 0
          AND whitelisted = 0 AND last_seen < ?
        "#,
    )
    .bind(seen_before)
    .fetch_all(ex)
    .await?;
    Ok(rows)
}

/// Remove a dead client row; sessions and transactions cascade.
pub async fn delete_client(
    ex: impl Executor<'_, Database = Sqlite>,
    id: i64,
) -> CoreResult<()> {
    sqlx::query(r#"DELETE FROM clients WHERE id = ?"#)
        .bind(id)
        .execute(ex)
        .await?;
    Ok(())
}

// ============ Sessions ============

pub async fn get_active_session(
    ex: impl Executor<'_, Database = Sqlite>,
    client_id: i64,
) -> CoreResult<Option<Session>> {
    let row = sqlx::query_as::<_, Session>(
        r#"SELECT * FROM sessions WHERE client_id = ? AND status = 'ACTIVE' LIMIT 1"#,
    )
    .bind(client_id)
    .fetch_optional(ex)
    .await?;
    Ok(row)
}

pub async fn insert_session(
    ex: impl Executor<'_, Database = Sqlite>,
    client: &Client,
    granted_duration: i64,
    now: DateTime<Utc>,
) -> CoreResult<i64> {
    let res = sqlx::query(
        r#"
        INSERT INTO sessions (client_id, mac_address, ip_address, session_token,
            granted_duration, status, started_at)
        VALUES (?, ?, ?, ?, ?, 'ACTIVE', ?)
        "#,
    )
    .bind(client.id)
    .bind(&client.mac_address)
    .bind(&client.ip_address)
    .bind(&client.session_token)
    .bind(granted_duration)
    .bind(now)
    .execute(ex)
    .await?;
    Ok(res.last_insert_rowid())
}

pub async fn extend_session(
    ex: impl Executor<'_, Database = Sqlite>,
    session_id: i64,
    extra_secs: i64,
) -> CoreResult<()> {
    sqlx::query(r#"UPDATE sessions SET granted_duration = granted_duration + ? WHERE id = ?"#)
        .bind(extra_secs)
        .bind(session_id)
        .execute(ex)
        .await?;
    Ok(())
}

pub async fn end_active_sessions(
    ex: impl Executor<'_, Database = Sqlite>,
    client_id: i64,
    now: DateTime<Utc>,
) -> CoreResult<u64> {
    let res = sqlx::query(
        r#"UPDATE sessions SET status = 'ENDED', ended_at = ? WHERE client_id = ? AND status = 'ACTIVE'"#,
    )
    .bind(now)
    .bind(client_id)
    .execute(ex)
    .await?;
    Ok(res.rows_affected())
}

pub async fn count_active_sessions(
    ex: impl Executor<'_, Database = Sqlite>,
) -> CoreResult<i64> {
    let row: (i64,) = sqlx::query_as(r#"SELECT COUNT(*) FROM sessions WHERE status = 'ACTIVE'"#)
        .fetch_one(ex)
        .await?;
    Ok(row.0)
}

// ============ Transactions ============

pub async fn insert_transaction(
    ex: impl Executor<'_, Database = Sqlite>,
    tx: &NewTransaction,
    now: DateTime<Utc>,
) -> CoreResult<i64> {
    let res = sqlx::query(
        r#"
        INSERT INTO transactions (client_id, session_id, rate_id, amount_paid,
            coins_used, payment_method, status, created_at)
        VALUES (?, ?, ?, ?, ?, ?, 'COMPLETED', ?)
        "#,
    )
    .bind(tx.client_id)
    .bind(tx.session_id)
    .bind(tx.rate_id)
    .bind(&tx.amount_paid)
    .bind(tx.coins_used)
    .bind(&tx.payment_method)
    .bind(now)
    .execute(ex)
    .await?;
    Ok(res.last_insert_rowid())
}

pub async fn list_recent_transactions(
    ex: impl Executor<'_, Database = Sqlite>,
    limit: i64,
) -> CoreResult<Vec<Transaction>> {
    let rows = sqlx::query_as::<_, Transaction>(
        r#"SELECT * FROM transactions ORDER BY created_at DESC LIMIT ?"#,
    )
    .bind(limit)
    .fetch_all(ex)
    .await?;
    Ok(rows)
}

// ============ Rates ============

pub async fn list_active_rates(
    ex: impl Executor<'_, Database = Sqlite>,
) -> CoreResult<Vec<Rate>> {
    let rows = sqlx::query_as::<_, Rate>(
        r#"SELECT * FROM rates WHERE is_active = 1 ORDER BY CAST(price AS REAL) ASC"#,
    )
    .fetch_all(ex)
    .await?;
    Ok(rows)
}

pub async fn get_active_rate(
    ex: impl Executor<'_, Database = Sqlite>,
    id: i64,
) -> CoreResult<Option<Rate>> {
    let row = sqlx::query_as::<_, Rate>(r#"SELECT * FROM rates WHERE id = ? AND is_active = 1"#)
        .bind(id)
        .fetch_optional(ex)
        .await?;
    Ok(row)
}

pub async fn insert_rate(
    ex: impl Executor<'_, Database = Sqlite>,
    rate: &NewRate,
    now: DateTime<Utc>,
) -> CoreResult<i64> {
    let res = sqlx::query(
        r#"INSERT INTO rates (name, price, duration, coins_required, is_active, created_at)
           VALUES (?, ?, ?, ?, 1, ?)"#,
    )
    .bind(&rate.name)
    .bind(&rate.price)
    .bind(rate.duration)
    .bind(rate.coins_required)
    .bind(now)
    .execute(ex)
    .await?;
    Ok(res.last_insert_rowid())
}

pub async fn deactivate_rate(
    ex: impl Executor<'_, Database = Sqlite>,
    id: i64,
) -> CoreResult<u64> {
    let res = sqlx::query(r#"UPDATE rates SET is_active = 0 WHERE id = ?"#)
        .bind(id)
        .execute(ex)
        .await?;
    Ok(res.rows_affected())
}

// ============ Settings ============

pub async fn get_portal_settings(
    ex: impl Executor<'_, Database = Sqlite>,
) -> CoreResult<PortalSettings> {
    let row = sqlx::query_as::<_, PortalSettings>(r#"SELECT * FROM portal_settings WHERE id = 1"#)
        .fetch_one(ex)
        .await?;
    Ok(row)
}

pub async fn update_portal_settings(
    ex: impl Executor<'_, Database = Sqlite>,
    s: &PortalSettings,
) -> CoreResult<()> {
    sqlx::query(
        r#"
        UPDATE portal_settings SET coin_timeout = ?, auto_pause_on_disconnect = ?,
            auto_resume_on_pause = ?, pause_resume_minutes = ?, coin_abuse_protection = ?,
            coin_attempt_limit = ?, coin_attempt_window = ?, coin_block_duration = ?
        WHERE id = 1
        "#,
    )
    .bind(s.coin_timeout)
    .bind(s.auto_pause_on_disconnect)
    .bind(s.auto_resume_on_pause)
    .bind(s.pause_resume_minutes)
    .bind(s.coin_abuse_protection)
    .bind(s.coin_attempt_limit)
    .bind(s.coin_attempt_window)
    .bind(s.coin_block_duration)
    .execute(ex)
    .await?;
    Ok(())
}

pub async fn get_network_config(
    ex: impl Executor<'_, Database = Sqlite>,
) -> CoreResult<NetworkConfig> {
    let row = sqlx::query_as::<_, NetworkConfig>(r#"SELECT * FROM network_config WHERE id = 1"#)
        .fetch_one(ex)
        .await?;
    Ok(row)
}

pub async fn update_bandwidth_config(
    ex: impl Executor<'_, Database = Sqlite>,
    enabled: bool,
    download_kbps: i64,
    upload_kbps: i64,
    per_client_enabled: bool,
    per_client_download: i64,
    per_client_upload: i64,
) -> CoreResult<()> {
    sqlx::query(
        r#"
        UPDATE network_config SET bandwidth_enabled = ?, bandwidth_download_limit = ?,
            bandwidth_upload_limit = ?, per_client_bandwidth_enabled = ?,
            per_client_download_limit = ?, per_client_upload_limit = ?
        WHERE id = 1
        "#,
    )
    .bind(enabled)
    .bind(download_kbps)
    .bind(upload_kbps)
    .bind(per_client_enabled)
    .bind(per_client_download)
    .bind(per_client_upload)
    .execute(ex)
    .await?;
    Ok(())
}

pub async fn get_ttl_settings(
    ex: impl Executor<'_, Database = Sqlite>,
) -> CoreResult<TtlSettings> {
    let row = sqlx::query_as::<_, TtlSettings>(r#"SELECT * FROM ttl_settings WHERE id = 1"#)
        .fetch_one(ex)
        .await?;
    Ok(row)
}

pub async fn update_ttl_settings(
    ex: impl Executor<'_, Database = Sqlite>,
    s: &TtlSettings,
) -> CoreResult<()> {
    sqlx::query(
        r#"
        UPDATE ttl_settings SET enabled = ?, sensitivity = ?, auto_block = ?, alert_threshold = ?
        WHERE id = 1
        "#,
    )
    .bind(s.enabled)
    .bind(&s.sensitivity)
    .bind(s.auto_block)
    .bind(s.alert_threshold)
    .execute(ex)
    .await?;
    Ok(())
}

// ============ System log ============

pub async fn append_system_log(
    ex: impl Executor<'_, Database = Sqlite>,
    category: &str,
    action: &str,
    details: Option<&str>,
    now: DateTime<Utc>,
) -> CoreResult<()> {
    sqlx::query(
        r#"INSERT INTO system_logs (category, action, details, created_at) VALUES (?, ?, ?, ?)"#,
    )
    .bind(category)
    .bind(action)
    .bind(details)
    .bind(now)
    .execute(ex)
    .await?;
    Ok(())
}

// ============ Coin slots ============

pub async fn get_slot(
    ex: impl Executor<'_, Database = Sqlite>,
    slot_number: i64,
) -> CoreResult<Option<CoinSlot>> {
    let row = sqlx::query_as::<_, CoinSlot>(r#"SELECT * FROM coin_slots WHERE slot_number = ?"#)
        .bind(slot_number)
        .fetch_optional(ex)
        .await?;
    Ok(row)
}

pub async fn list_slots(ex: impl Executor<'_, Database = Sqlite>) -> CoreResult<Vec<CoinSlot>> {
    let rows =
        sqlx::query_as::<_, CoinSlot>(r#"SELECT * FROM coin_slots ORDER BY slot_number ASC"#)
            .fetch_all(ex)
            .await?;
    Ok(rows)
}

/// Atomic claim: flips the slot to claimed iff it is currently available.
/// Returns false when someone else holds it.
pub async fn try_claim_slot(
    ex: impl Executor<'_, Database = Sqlite>,
    slot_number: i64,
    ip: Option<&str>,
    mac: &str,
    token: Option<&str>,
    now: DateTime<Utc>,
    expires_at: DateTime<Utc>,
) -> CoreResult<bool> {
    let res = sqlx::query(
        r#"
        UPDATE coin_slots
        SET status = 'claimed', claimed_by_ip = ?, claimed_by_mac = ?,
            claimed_by_session_token = ?, claimed_at = ?, expires_at = ?
        WHERE slot_number = ? AND status = 'available'
        "#,
    )
    .bind(ip)
    .bind(mac)
    .bind(token)
    .bind(now)
    .bind(expires_at)
    .bind(slot_number)
    .execute(ex)
    .await?;
    Ok(res.rows_affected() == 1)
}

pub async fn release_slot(
    ex: impl Executor<'_, Database = Sqlite>,
    slot_number: i64,
) -> CoreResult<()> {
    sqlx::query(
        r#"
        UPDATE coin_slots
        SET status = 'available', claimed_by_ip = NULL, claimed_by_mac = NULL,
            claimed_by_session_token = NULL, claimed_at = NULL, expires_at = NULL
        WHERE slot_number = ?
        "#,
    )
    .bind(slot_number)
    .execute(ex)
    .await?;
    Ok(())
}

/// Release every slot held by this client (any identifier match); used by
/// redeem so a purchase always frees the acceptor.
pub async fn release_slots_claimed_by(
    ex: impl Executor<'_, Database = Sqlite>,
    ip: Option<&str>,
    mac: &str,
    token: Option<&str>,
) -> CoreResult<u64> {
    let res = sqlx::query(
        r#"
        UPDATE coin_slots
        SET status = 'available', claimed_by_ip = NULL, claimed_by_mac = NULL,
            claimed_by_session_token = NULL, claimed_at = NULL, expires_at = NULL
        WHERE status = 'claimed' AND (
            (claimed_by_ip = ? AND ? IS NOT NULL)
            OR (claimed_by_mac = ? AND ? != 'Unknown')
            OR (claimed_by_session_token = ? AND ? IS NOT NULL)
        )
        "#,
    )
    .bind(ip)
    .bind(ip)
    .bind(mac)
    .bind(mac)
    .bind(token)
    .bind(token)
    .execute(ex)
    .await?;
    Ok(res.rows_affected())
}

pub async fn release_expired_slots(
    ex: impl Executor<'_, Database = Sqlite>,
    now: DateTime<Utc>,
) -> CoreResult<u64> {
    let res = sqlx::query(
        r#"
        UPDATE coin_slots
        SET status = 'available', claimed_by_ip = NULL, claimed_by_mac = NULL,
            claimed_by_session_token = NULL, claimed_at = NULL, expires_at = NULL
        WHERE status = 'claimed' AND expires_at < ?
        "#,
    )
    .bind(now)
    .execute(ex)
    .await?;
    Ok(res.rows_affected())
}

// ============ Coin queues ============

/// Re-attach preserved (slot-less) queue entries belonging to this client to
/// the slot they are now paying at.
pub async fn attach_preserved_entries(
    ex: impl Executor<'_, Database = Sqlite>,
    slot_id: i64,
    ip: Option<&str>,
    mac: &str,
    token: Option<&str>,
) -> CoreResult<u64> {
    let res = sqlx::query(
        r#"
        UPDATE coin_queues SET slot_id = ?
        WHERE slot_id IS NULL AND status = 'queued' AND (
            (client_ip = ? AND ? IS NOT NULL)
            OR (client_mac = ? AND ? != 'Unknown')
            OR (session_token = ? AND ? IS NOT NULL)
        )
        "#,
    )
    .bind(slot_id)
    .bind(ip)
    .bind(ip)
    .bind(mac)
    .bind(mac)
    .bind(token)
    .bind(token)
    .execute(ex)
    .await?;
    Ok(res.rows_affected())
}

pub async fn insert_queue_entry(
    ex: impl Executor<'_, Database = Sqlite>,
    slot_id: Option<i64>,
    ip: Option<&str>,
    mac: &str,
    token: Option<&str>,
    coin_value: &str,
    coin_count: i64,
    total_value: &str,
    now: DateTime<Utc>,
) -> CoreResult<i64> {
    let res = sqlx::query(
        r#"
        INSERT INTO coin_queues (slot_id, client_ip, client_mac, session_token,
            coin_value, coin_count, total_value, status, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, 'queued', ?)
        "#,
    )
    .bind(slot_id)
    .bind(ip)
    .bind(mac)
    .bind(token)
    .bind(coin_value)
    .bind(coin_count)
    .bind(total_value)
    .bind(now)
    .execute(ex)
    .await?;
    Ok(res.last_insert_rowid())
}

/// Every still-queued entry belonging to this client across any identifier.
pub async fn queued_entries_for(
    ex: impl Executor<'_, Database = Sqlite>,
    ip: Option<&str>,
    mac: &str,
    token: Option<&str>,
) -> CoreResult<Vec<CoinQueueEntry>> {
    let rows = sqlx::query_as::<_, CoinQueueEntry>(
        r#"
        SELECT * FROM coin_queues
        WHERE status = 'queued' AND (
            (client_ip = ? AND ? IS NOT NULL)
            OR (client_mac = ? AND ? != 'Unknown')
            OR (session_token = ? AND ? IS NOT NULL)
        )
        ORDER BY created_at ASC, id ASC
        "#,
    )
    .bind(ip)
    .bind(ip)
    .bind(mac)
    .bind(mac)
    .bind(token)
    .bind(token)
    .fetch_all(ex)
    .await?;
    Ok(rows)
}

pub async fn mark_entries_redeemed(
    ex: impl Executor<'_, Database = Sqlite>,
    ids: &[i64],
) -> CoreResult<u64> {
    if ids.is_empty() {
        return Ok(0);
    }
    let mut qb =
        QueryBuilder::<Sqlite>::new("UPDATE coin_queues SET status = 'redeemed' WHERE id IN (");
    let mut sep = qb.separated(", ");
    for id in ids {
        sep.push_bind(id);
    }
    qb.push(")");
    let res = qb.build().execute(ex).await?;
    Ok(res.rows_affected())
}

/// Preserve-on-release: detach queued entries from a slot; they stay
/// findable through the client identifiers recorded at insert time.
pub async fn detach_entries_for_slot(
    ex: impl Executor<'_, Database = Sqlite>,
    slot_id: i64,
) -> CoreResult<u64> {
    let res = sqlx::query(
        r#"UPDATE coin_queues SET slot_id = NULL WHERE slot_id = ? AND status = 'queued'"#,
    )
    .bind(slot_id)
    .execute(ex)
    .await?;
    Ok(res.rows_affected())
}

/// The only path by which a paid coin loses value.
pub async fn expire_stale_queue_entries(
    ex: impl Executor<'_, Database = Sqlite>,
    older_than: DateTime<Utc>,
) -> CoreResult<u64> {
    let res = sqlx::query(
        r#"UPDATE coin_queues SET status = 'expired' WHERE status = 'queued' AND created_at < ?"#,
    )
    .bind(older_than)
    .execute(ex)
    .await?;
    Ok(res.rows_affected())
}

pub async fn count_queued_entries(
    ex: impl Executor<'_, Database = Sqlite>,
) -> CoreResult<i64> {
    let row: (i64,) = sqlx::query_as(r#"SELECT COUNT(*) FROM coin_queues WHERE status = 'queued'"#)
        .fetch_one(ex)
        .await?;
    Ok(row.0)
}

// ============ Coin attempt guard ============

pub async fn get_coin_attempt(
    ex: impl Executor<'_, Database = Sqlite>,
    ip: &str,
    mac: &str,
) -> CoreResult<Option<CoinAttempt>> {
    let row = sqlx::query_as::<_, CoinAttempt>(
        r#"SELECT * FROM coin_attempts WHERE client_ip = ? AND client_mac = ?"#,
    )
    .bind(ip)
    .bind(mac)
    .fetch_optional(ex)
    .await?;
    Ok(row)
}

/// Start or restart an attempt window at one attempt.
pub async fn reset_coin_attempt(
    ex: impl Executor<'_, Database = Sqlite>,
    ip: &str,
    mac: &str,
    now: DateTime<Utc>,
) -> CoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO coin_attempts (client_ip, client_mac, attempts, window_start, blocked_until)
        VALUES (?, ?, 1, ?, NULL)
        ON CONFLICT (client_ip, client_mac)
        DO UPDATE SET attempts = 1, window_start = excluded.window_start, blocked_until = NULL
        "#,
    )
    .bind(ip)
    .bind(mac)
    .bind(now)
    .execute(ex)
    .await?;
    Ok(())
}

pub async fn bump_coin_attempt(
    ex: impl Executor<'_, Database = Sqlite>,
    ip: &str,
    mac: &str,
) -> CoreResult<i64> {
    let row: (i64,) = sqlx::query_as(
        r#"
        UPDATE coin_attempts SET attempts = attempts + 1
        WHERE client_ip = ? AND client_mac = ?
        RETURNING attempts
        "#,
    )
    .bind(ip)
    .bind(mac)
    .fetch_one(ex)
    .await?;
    Ok(row.0)
}

pub async fn block_coin_attempts(
    ex: impl Executor<'_, Database = Sqlite>,
    ip: &str,
    mac: &str,
    until: DateTime<Utc>,
) -> CoreResult<()> {
    sqlx::query(
        r#"UPDATE coin_attempts SET blocked_until = ? WHERE client_ip = ? AND client_mac = ?"#,
    )
    .bind(until)
    .bind(ip)
    .bind(mac)
    .execute(ex)
    .await?;
    Ok(())
}

// ============ TTL tables ============

pub async fn get_ttl_baseline(
    ex: impl Executor<'_, Database = Sqlite>,
    mac: &str,
) -> CoreResult<Option<TtlBaseline>> {
    let row = sqlx::query_as::<_, TtlBaseline>(
        r#"SELECT * FROM ttl_baselines WHERE client_mac = ?"#,
    )
    .bind(mac)
    .fetch_optional(ex)
    .await?;
    Ok(row)
}

pub async fn insert_ttl_baseline(
    ex: impl Executor<'_, Database = Sqlite>,
    mac: &str,
    baseline_ttl: i64,
    confidence: f64,
    now: DateTime<Utc>,
) -> CoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO ttl_baselines (client_mac, baseline_ttl, confidence, established_at, last_verified)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT (client_mac) DO UPDATE SET baseline_ttl = excluded.baseline_ttl,
            confidence = excluded.confidence, established_at = excluded.established_at,
            last_verified = excluded.last_verified
        "#,
    )
    .bind(mac)
    .bind(baseline_ttl)
    .bind(confidence)
    .bind(now)
    .bind(now)
    .execute(ex)
    .await?;
    Ok(())
}

pub async fn touch_ttl_baseline(
    ex: impl Executor<'_, Database = Sqlite>,
    mac: &str,
    now: DateTime<Utc>,
) -> CoreResult<()> {
    sqlx::query(r#"UPDATE ttl_baselines SET last_verified = ? WHERE client_mac = ?"#)
        .bind(now)
        .bind(mac)
        .execute(ex)
        .await?;
    Ok(())
}

pub async fn delete_ttl_baseline(
    ex: impl Executor<'_, Database = Sqlite>,
    mac: &str,
) -> CoreResult<()> {
    sqlx::query(r#"DELETE FROM ttl_baselines WHERE client_mac = ?"#)
        .bind(mac)
        .execute(ex)
        .await?;
    Ok(())
}

pub async fn insert_ttl_anomaly(
    ex: impl Executor<'_, Database = Sqlite>,
    mac: &str,
    anomaly_type: &str,
    details: Option<&str>,
    now: DateTime<Utc>,
) -> CoreResult<()> {
    sqlx::query(
        r#"INSERT INTO ttl_anomalies (client_mac, anomaly_type, details, created_at) VALUES (?, ?, ?, ?)"#,
    )
    .bind(mac)
    .bind(anomaly_type)
    .bind(details)
    .bind(now)
    .execute(ex)
    .await?;
    Ok(())
}

pub async fn get_ttl_violation(
    ex: impl Executor<'_, Database = Sqlite>,
    mac: &str,
) -> CoreResult<Option<TtlViolation>> {
    let row = sqlx::query_as::<_, TtlViolation>(
        r#"SELECT * FROM ttl_violations WHERE client_mac = ?"#,
    )
    .bind(mac)
    .fetch_optional(ex)
    .await?;
    Ok(row)
}

pub async fn upsert_ttl_violation(
    ex: impl Executor<'_, Database = Sqlite>,
    mac: &str,
    severity: &str,
    now: DateTime<Utc>,
) -> CoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO ttl_violations (client_mac, status, violation_count, severity, created_at, updated_at)
        VALUES (?, 'pending', 1, ?, ?, ?)
        ON CONFLICT (client_mac) DO UPDATE SET
            violation_count = ttl_violations.violation_count + 1,
            status = 'pending', severity = excluded.severity, updated_at = excluded.updated_at
        "#,
    )
    .bind(mac)
    .bind(severity)
    .bind(now)
    .bind(now)
    .execute(ex)
    .await?;
    Ok(())
}

pub async fn resolve_ttl_violation(
    ex: impl Executor<'_, Database = Sqlite>,
    mac: &str,
    now: DateTime<Utc>,
) -> CoreResult<u64> {
    let res = sqlx::query(
        r#"UPDATE ttl_violations SET status = 'resolved', updated_at = ? WHERE client_mac = ?"#,
    )
    .bind(now)
    .bind(mac)
    .execute(ex)
    .await?;
    Ok(res.rows_affected())
}

pub async fn list_ttl_violations(
    ex: impl Executor<'_, Database = Sqlite>,
) -> CoreResult<Vec<TtlViolation>> {
    let rows = sqlx::query_as::<_, TtlViolation>(
        r#"SELECT * FROM ttl_violations ORDER BY updated_at DESC"#,
    )
    .fetch_all(ex)
    .await?;
    Ok(rows)
}

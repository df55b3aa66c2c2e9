use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Instant;

use eyre::WrapErr;

use piso_gateway::api::{self, AppContext};
use piso_gateway::coin_ingress::CoinBridge;
use piso_gateway::config::Config;
use piso_gateway::db;
use piso_gateway::events::EventBus;
use piso_gateway::firewall::{Firewall, IptablesFirewall};
use piso_gateway::identity::IdentityResolver;
use piso_gateway::metrics;
use piso_gateway::net::{NeighborTable, ProcNeighborTable};
use piso_gateway::reconcile::Reconciler;
use piso_gateway::session::SessionEngine;
use piso_gateway::shaper::{Shaper, TcShaper};
use piso_gateway::slots::SlotManager;
use piso_gateway::ttl::TtlDetector;

fn main() -> eyre::Result<()> {
    color_eyre::install()?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main())
}

async fn async_main() -> eyre::Result<()> {
    init_logging();

    tracing::info!("Starting PisoWiFi gateway");

    let config = Config::load()?;
    tracing::info!(
        port = config.server.port,
        lan = %config.network.lan_interface,
        wan = %config.network.wan_interface,
        ttl_iface = %config.network.ttl_interface,
        gpio_coin_pin = config.gpio.coin_pin,
        gpio_led_pin = config.gpio.led_pin,
        dns_interceptor = config.network.enable_dns_interceptor,
        dev_mode = config.server.dev_mode,
        "Configuration loaded"
    );

    let db = db::create_pool(&config.database.url).await?;
    tracing::info!("Database connected");

    db::run_migrations(&db).await?;
    tracing::info!("Database migrations complete");

    // Refuse to boot on a half-initialized store rather than guess at the
    // coin timeout or the LAN layout.
    let portal_settings = db::get_portal_settings(&db)
        .await
        .wrap_err("portal_settings singleton missing; refusing to boot")?;
    let network = db::get_network_config(&db)
        .await
        .wrap_err("network_config singleton missing; refusing to boot")?;
    tracing::info!(
        coin_timeout = portal_settings.coin_timeout,
        gateway_ip = %network.gateway_ip,
        "Settings loaded"
    );

    let firewall: Arc<dyn Firewall> = Arc::new(
        IptablesFirewall::new(
            &config.network.lan_interface,
            &config.network.wan_interface,
            config.server.port,
        )
        .await
        .wrap_err("firewall driver init failed")?,
    );
    let shaper: Arc<dyn Shaper> =
        Arc::new(TcShaper::new(&config.network.lan_interface).wrap_err("shaper driver init failed")?);
    let neighbors: Arc<dyn NeighborTable> = Arc::new(ProcNeighborTable::new());
    let bus = EventBus::new();
    let slots = SlotManager::new(db.clone(), bus.clone());
    let engine = Arc::new(SessionEngine::new(
        db.clone(),
        firewall.clone(),
        shaper.clone(),
        neighbors.clone(),
        bus.clone(),
        slots.clone(),
    ));
    let detector = Arc::new(TtlDetector::new(
        db.clone(),
        firewall.clone(),
        neighbors.clone(),
        bus.clone(),
    ));
    let reconciler = Arc::new(Reconciler::new(db.clone(), firewall.clone(), shaper.clone()));
    let bridge = CoinBridge::new(config.gpio.bridge_addr.clone(), db.clone(), slots.clone());

    // Interception and global caps are projections of stored state; a
    // failure here is logged and healed by reconciliation, not fatal.
    if let Err(e) = firewall.install_portal_redirect().await {
        tracing::error!(error = %e, "portal redirect setup failed; clients may reach WAN unmetered");
    }
    if network.bandwidth_enabled
        && network.bandwidth_download_limit > 0
        && network.bandwidth_upload_limit > 0
    {
        if let Err(e) = shaper
            .set_global(
                network.bandwidth_download_limit.clamp(0, u32::MAX as i64) as u32,
                network.bandwidth_upload_limit.clamp(0, u32::MAX as i64) as u32,
            )
            .await
        {
            tracing::error!(error = %e, "global bandwidth cap setup failed");
        }
    }

    let gateway_ip: Ipv4Addr = network
        .gateway_ip
        .parse()
        .unwrap_or_else(|_| Ipv4Addr::new(10, 0, 0, 1));
    let resolver = IdentityResolver::new(
        neighbors.clone(),
        gateway_ip,
        network.lan_prefix.clamp(0, 32) as u8,
    );

    let ctx = Arc::new(AppContext {
        db: db.clone(),
        config: config.clone(),
        firewall: firewall.clone(),
        shaper: shaper.clone(),
        resolver,
        slots: slots.clone(),
        engine: engine.clone(),
        bus: bus.clone(),
        started_at: Instant::now(),
    });

    metrics::UP.set(1.0);
    tracing::info!("Gateway tasks starting");

    let ttl_iface = config.network.ttl_interface.clone();
    tokio::select! {
        result = api::serve(ctx.clone()) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server error");
            }
        }
        result = engine.clone().run() => {
            if let Err(e) = result {
                tracing::error!(error = %e, "session engine error");
            }
        }
        result = detector.clone().run(ttl_iface) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "TTL detector error");
            }
        }
        result = reconciler.clone().run() => {
            if let Err(e) = result {
                tracing::error!(error = %e, "reconciliation error");
            }
        }
        result = bridge.run() => {
            if let Err(e) = result {
                tracing::error!(error = %e, "coin bridge error");
            }
        }
        _ = wait_for_shutdown_signal() => {}
    }

    metrics::UP.set(0.0);
    tracing::info!("PisoWiFi gateway stopped");
    Ok(())
}

/// Initialize tracing/logging with structured output
fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,piso_gateway=debug"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .init();
}

/// Wait for shutdown signals (SIGINT/SIGTERM)
async fn wait_for_shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }
}

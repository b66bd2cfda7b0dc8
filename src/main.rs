use std::sync::Arc;

use anyhow::Context;
use tower_http::cors::CorsLayer;
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

use smart_warehouse::arm::{ArmContext, Mode};
use smart_warehouse::broadcast::Broadcaster;
use smart_warehouse::clock::{Clock, SystemClock};
use smart_warehouse::config::WarehouseConfig;
use smart_warehouse::device::{DeviceGateway, HttpTransport};
use smart_warehouse::store::{Database, LibSqlBackend};
use smart_warehouse::warehouse::{Warehouse, warehouse_routes};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = WarehouseConfig::from_env().context("invalid configuration")?;

    // Held for the process lifetime so buffered log lines are flushed.
    let _log_guard = init_tracing(&config);

    eprintln!("📦 Smart Warehouse v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   WS: ws://0.0.0.0:{}/ws", config.port);
    eprintln!("   Health: http://0.0.0.0:{}/health", config.port);
    eprintln!("   Grid: {}x{}", config.grid.rows, config.grid.cols);

    // ── Database ─────────────────────────────────────────────────────────
    let store: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("failed to open database at {}", config.db_path.display()))?,
    );
    eprintln!("   Database: {}", config.db_path.display());

    // ── Core ─────────────────────────────────────────────────────────────
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let gateway = Arc::new(DeviceGateway::new(
        Arc::new(HttpTransport::new()),
        config.device.timeout,
    ));
    let arm = Arc::new(ArmContext::new(Mode::Manual));
    let events = Broadcaster::new(config.broadcast_capacity);

    let warehouse = Arc::new(Warehouse::new(
        store,
        Arc::clone(&gateway),
        arm,
        events,
        clock,
        config.scheduler.clone(),
    ));

    let _forwarder = warehouse.spawn_device_forwarder();
    match config.device.address.as_deref() {
        Some(address) => {
            let status = warehouse
                .register_device(address)
                .context("invalid WAREHOUSE_DEVICE_ADDR")?;
            eprintln!(
                "   Device: {}",
                status.address.as_deref().unwrap_or(address)
            );
        }
        None => eprintln!("   Device: waiting for registration"),
    }

    let recovered = warehouse.initialize(config.grid).await?;
    if recovered.operations + recovered.tasks > 0 {
        eprintln!(
            "   Recovered: {} operations, {} tasks marked failed",
            recovered.operations, recovered.tasks
        );
    }

    let _scheduler = warehouse.scheduler().spawn();
    let _ticker = Arc::clone(&warehouse).spawn_snapshot_ticker(config.snapshot_interval);

    // ── Server ───────────────────────────────────────────────────────────
    let app = warehouse_routes(Arc::clone(&warehouse)).layer(CorsLayer::permissive());
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("failed to bind port {}", config.port))?;
    tracing::info!(port = config.port, "Warehouse server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutting down");
        })
        .await?;

    Ok(())
}

/// stderr always; a daily rolling file as well when a log directory is set.
fn init_tracing(config: &WarehouseConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(filter());

    match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "warehouse.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer)
                .with_filter(filter());
            tracing_subscriber::registry().with(stderr).with(file).init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry().with(stderr).init();
            None
        }
    }
}

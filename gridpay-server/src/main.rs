use std::path::PathBuf;
use std::time::Duration;

use axum::routing::get;
use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use gridpay_server::{
    AppState,
    api,
    config::{Config, MonitorConfig, StoreConfig},
    engine::Engine,
    store::{
        AlertStore, CommandStore, LedgerStore, MeterStore,
        memory::{MemoryAlertStore, MemoryCommandStore, MemoryLedgerStore, MemoryMeterStore},
        sqlite::{
            SqliteAlertStore, SqliteCommandStore, SqliteLedgerStore, SqliteMeterStore, open_pool,
        },
    },
};

#[derive(Parser)]
#[command(name = "gridpay-server")]
#[command(about = "Gridpay prepaid metering server")]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "gridpay-server.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    let filter =
        std::env::var("RUST_LOG").unwrap_or_else(|_| "tracing=info,gridpay_server=info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_span_events(tracing_subscriber::fmt::format::FmtSpan::CLOSE)
        .init();

    let cli = Cli::parse();

    let config = if cli.config.exists() {
        info!(path = ?cli.config, "Loading configuration");
        Config::load(&cli.config)?
    } else {
        info!("No configuration file found, using defaults");
        Config::default()
    };

    info!(http_addr = %config.server.http_addr, "Starting gridpay-server");

    match config.store {
        StoreConfig::Memory => {
            info!("Using in-memory stores");
            let engine = Engine::new(
                MemoryMeterStore::default(),
                MemoryLedgerStore::default(),
                MemoryAlertStore::default(),
                MemoryCommandStore::default(),
            );
            run_server(engine, config.server.http_addr, config.monitor).await?;
        }
        StoreConfig::Sqlite { ref path } => {
            info!(path = ?path, "Using SQLite stores");
            let pool = open_pool(path.to_string_lossy()).await?;
            let engine = Engine::new(
                SqliteMeterStore::new(pool.clone()),
                SqliteLedgerStore::new(pool.clone()),
                SqliteAlertStore::new(pool.clone()),
                SqliteCommandStore::new(pool),
            );
            run_server(engine, config.server.http_addr, config.monitor).await?;
        }
    }

    Ok(())
}

async fn run_server<M, L, A, C>(
    engine: Engine<M, L, A, C>,
    http_addr: std::net::SocketAddr,
    monitor: MonitorConfig,
) -> color_eyre::Result<()>
where
    M: MeterStore,
    L: LedgerStore,
    A: AlertStore,
    C: CommandStore,
{
    let cancel = CancellationToken::new();

    // Connectivity sweep: devices that stop reporting go offline and
    // raise an alert for the owning account.
    let sweep_engine = engine.clone();
    let sweep_cancel = cancel.clone();
    let sweep_handle = tokio::spawn(async move {
        run_offline_sweep(sweep_engine, monitor, sweep_cancel).await;
    });

    let state = AppState { engine };
    let app = axum::Router::new()
        .nest("/api", api::router())
        .route("/health", get(health_handler))
        .with_state(state);

    let listener = TcpListener::bind(http_addr).await?;
    info!(%http_addr, "HTTP server listening");

    let cancel_for_http = cancel.clone();
    tokio::select! {
        result = axum::serve(listener, app).with_graceful_shutdown(async move {
            cancel_for_http.cancelled().await;
        }) => {
            if let Err(e) = result {
                error!(error = ?e, "HTTP server error");
            }
            info!("HTTP server shut down");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
            cancel.cancel();
        }
    }

    let _ = sweep_handle.await;
    info!("gridpay-server shut down complete");
    Ok(())
}

async fn run_offline_sweep<M, L, A, C>(
    engine: Engine<M, L, A, C>,
    monitor: MonitorConfig,
    cancel: CancellationToken,
) where
    M: MeterStore,
    L: LedgerStore,
    A: AlertStore,
    C: CommandStore,
{
    let offline_after = Duration::from_secs(monitor.offline_after_secs);
    let mut interval = tokio::time::interval(Duration::from_secs(monitor.sweep_interval_secs));
    info!(
        offline_after_secs = monitor.offline_after_secs,
        sweep_interval_secs = monitor.sweep_interval_secs,
        "Connectivity sweep started"
    );

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Connectivity sweep shutting down");
                break;
            }
            _ = interval.tick() => {
                let stale_before = jiff::Timestamp::now()
                    - jiff::SignedDuration::try_from(offline_after).unwrap_or_default();
                match engine.sweep_offline(stale_before).await {
                    Ok(0) => {}
                    Ok(count) => info!(count, "devices marked offline"),
                    Err(e) => error!(error = %e, "connectivity sweep failed"),
                }
            }
        }
    }
}

async fn health_handler() -> &'static str {
    "OK"
}

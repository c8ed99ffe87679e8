use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use gridpay_worker::client::ServerClient;
use gridpay_worker::config::{Config, DriverConfig, WorkerConfig};
use gridpay_worker::driver::{BreakerDriver, MockBreakerDriver, ModbusBreakerDriver};
use gridpay_worker::executor::{self, CommandSpec};

#[derive(Parser)]
#[command(name = "gridpay-worker")]
#[command(about = "Gridpay breaker command worker")]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "gridpay-worker.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    let filter =
        std::env::var("RUST_LOG").unwrap_or_else(|_| "tracing=info,gridpay_worker=info".to_owned());
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

    info!(base_url = %config.server.base_url, "Starting gridpay-worker");

    let client = ServerClient::new(config.server.base_url.clone());
    let cancel = CancellationToken::new();

    let cancel_for_ctrlc = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C, shutting down...");
            cancel_for_ctrlc.cancel();
        }
    });

    match config.driver {
        DriverConfig::Mock { fail_rate } => {
            info!(fail_rate, "Using mock breaker driver");
            let driver = MockBreakerDriver::new(fail_rate);
            run_worker(client, driver, config.worker, cancel).await;
        }
        DriverConfig::Modbus => {
            info!("Using Modbus TCP breaker driver");
            let driver = ModbusBreakerDriver::new();
            run_worker(client, driver, config.worker, cancel).await;
        }
    }

    info!("gridpay-worker shut down complete");
    Ok(())
}

async fn run_worker<D: BreakerDriver>(
    client: ServerClient,
    driver: D,
    worker: WorkerConfig,
    cancel: CancellationToken,
) {
    let write_timeout = Duration::from_secs(worker.write_timeout_secs);
    let retry_delay = Duration::from_millis(worker.retry_delay_ms);
    let mut interval = tokio::time::interval(Duration::from_secs(worker.poll_interval_secs));

    info!(
        poll_interval_secs = worker.poll_interval_secs,
        write_timeout_secs = worker.write_timeout_secs,
        "Worker loop started, waiting for commands"
    );

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Worker loop shutting down");
                break;
            }
            _ = interval.tick() => {
                let pending = match client.pending_commands().await {
                    Ok(pending) => pending,
                    Err(e) => {
                        warn!(error = %e, "failed to fetch pending commands, will retry");
                        continue;
                    }
                };

                if pending.is_empty() {
                    continue;
                }
                info!(count = pending.len(), "processing pending commands");

                for command in pending {
                    if cancel.is_cancelled() {
                        break;
                    }

                    let spec = CommandSpec {
                        command_id: command.command_id.clone(),
                        address: command.device_address.clone(),
                        unit_id: command.unit_id,
                        coil: command.coil,
                        target_state: command.target_state,
                        max_retries: command.max_retries,
                    };

                    let outcome =
                        executor::execute(&driver, &client, &spec, write_timeout, retry_delay)
                            .await;

                    info!(
                        command_id = %command.command_id,
                        result = outcome.result.as_str(),
                        attempts = outcome.attempts,
                        "command executed"
                    );

                    if let Err(e) = client
                        .report_result(
                            &command.command_id,
                            outcome.result.as_str(),
                            outcome.error.clone(),
                        )
                        .await
                    {
                        error!(
                            command_id = %command.command_id,
                            error = %e,
                            "failed to report result; command stays pending for the next poll"
                        );
                    }
                }
            }
        }
    }
}

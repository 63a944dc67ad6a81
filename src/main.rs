use std::path::PathBuf;

use anyhow::Result;
use chrono::Utc;
use clap::Parser;
use mpptread::BleTransport;
use mpptread::Config;
use mpptread::LinkSession;
use mpptread::SystemRadioReset;
use mpptread::TelemetryStore;
use tokio::time::interval;
use tracing::info;
use tracing::warn;
use tracing_subscriber::EnvFilter;

/// mpptread – keep a solar charge controller's telemetry fresh over BLE.
#[derive(Parser, Debug)]
#[command(name = "mpptread", version)]
struct Cli {
    /// TOML config. Defaults apply when the file does not exist.
    #[arg(long, default_value = "mpptread.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("mpptread=info")))
        .init();

    let cli = Cli::parse();
    let config = Config::load(&cli.config)?;
    info!(config = %cli.config.display(), device = %config.device.name_filter, "Starting mpptread");

    let transport = BleTransport::new(config.device.service).await?;
    let radio = SystemRadioReset::new(config.recovery.steps.clone());
    let store = TelemetryStore::new();
    let mut session = LinkSession::new(transport, &config, store.clone(), radio);
    let link = tokio::spawn(async move { session.run().await });

    let mut report = interval(config.report.interval());
    loop {
        tokio::select! {
            _ = report.tick() => log_snapshot(&store),
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                link.abort();
                return Ok(());
            }
        }
    }
}

fn log_snapshot(store: &TelemetryStore) {
    let (Some(reading), Some(updated_at)) = (store.get_last_reading(), store.last_updated()) else {
        warn!("No reading yet");
        return;
    };
    info!(
        age_s = (Utc::now() - updated_at).num_seconds(),
        charging_current_a = reading.charging_current_a,
        battery_voltage_v = reading.battery_voltage_v,
        panel_voltage_v = reading.panel_voltage_v,
        charging_power_w = reading.charging_power_w,
        charging_capacity_ah = reading.charging_capacity_ah,
        energy_daily_wh = reading.energy_daily_wh,
        "Latest telemetry"
    );
}

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Result, anyhow};
use bioage_sync_lib::config::AppConfig;
use bioage_sync_lib::core::bluetooth::{
    DeviceHandle, DisconnectInitiator, HealthReport, LifecycleEvent, NotReadyReason,
    PermissionOutcome, Readiness, ReconnectOutcome,
};
use bioage_sync_lib::logging::UiLogger;
use bioage_sync_lib::state::AppState;
use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use log::{info, warn};

#[derive(Parser)]
#[command(name = "bioage-sync", about = "Desktop harness for the BioAge wearable sync layer")]
struct Cli {
    /// Config file (defaults to the per-user config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Scan for wearables and list them
    Scan,
    /// Send a bio-age and health scores to the wearable
    Sync {
        #[arg(long)]
        age: f64,
        #[arg(long)]
        oral: f64,
        #[arg(long)]
        systemic: f64,
        #[arg(long)]
        fitness: f64,
        /// Identifier of the device to use instead of the remembered one
        #[arg(long)]
        device: Option<String>,
    },
    /// Print live telemetry
    Listen {
        #[arg(long, default_value_t = 30)]
        seconds: u64,
        #[arg(long)]
        device: Option<String>,
    },
    /// Try a silent reconnect to the remembered device
    Reconnect,
    /// Forget the remembered device
    Forget,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { log::Level::Debug } else { log::Level::Info };
    // RUST_LOG hands filtering over to env_logger for debugging sessions.
    if std::env::var_os("RUST_LOG").is_some() {
        env_logger::init();
    } else if let Err(e) = UiLogger::init(None, level) {
        eprintln!("Failed to install logger: {}", e);
    }

    let config_path = match cli.config {
        Some(path) => path,
        None => AppConfig::default_path()?,
    };
    let config = AppConfig::load_config(&config_path).await?;
    let state = AppState::new(config).await?;

    match cli.command {
        Command::Scan => {
            ensure_ready(&state).await?;
            let mut scan = state
                .connection_manager
                .start_scan(state.config.sync.scan_filter(), state.config.sync.scan_timeout())
                .await?;
            while let Some(device) = scan.next().await {
                println!("{}  {:<24} {:>4} dBm", device.id, device.name, device.rssi);
            }
            let outcome = scan.finish().await;
            println!("{} device(s) found ({:?})", outcome.devices.len(), outcome.end);
        }
        Command::Sync {
            age,
            oral,
            systemic,
            fitness,
            device,
        } => {
            let report = HealthReport {
                age_years: age,
                oral,
                systemic,
                fitness,
            };
            // Reject bad input before touching the radio.
            let packet = report.to_bytes()?;
            connect(&state, device).await?;
            state.connection_manager.write_health_data(&report).await?;
            println!("Sent {:02X?}", packet);
            state
                .connection_manager
                .disconnect_requested(DisconnectInitiator::App)
                .await?;
        }
        Command::Listen { seconds, device } => {
            connect(&state, device).await?;
            let subscription = state
                .telemetry_listener
                .subscribe(|event| println!("{} {:?}", event.received_at, event.reading))
                .await?;
            tokio::time::sleep(Duration::from_secs(seconds)).await;
            subscription.unsubscribe().await;
            if state.connection_manager.status().is_connected() {
                state
                    .connection_manager
                    .disconnect_requested(DisconnectInitiator::App)
                    .await?;
            }
        }
        Command::Reconnect => {
            match state
                .reconnection_policy
                .attempt_silent_reconnect(LifecycleEvent::AppStart)
                .await
            {
                ReconnectOutcome::Connected(status) => {
                    println!("Reconnected to {:?}", status.device.map(|d| d.name));
                    state
                        .connection_manager
                        .disconnect_requested(DisconnectInitiator::App)
                        .await?;
                }
                ReconnectOutcome::NotAttempted(reason) => println!("Not attempted: {:?}", reason),
                ReconnectOutcome::Failed(e) => println!("Reconnect failed: {}", e),
            }
        }
        Command::Forget => {
            state.connection_manager.forget_last_device().await?;
            println!("Remembered device cleared");
        }
    }
    Ok(())
}

/// Requests permissions explicitly when the gate reports them missing
async fn ensure_ready(state: &AppState) -> Result<()> {
    match state.connection_manager.check_ready().await {
        Readiness::Ready => Ok(()),
        Readiness::NotReady(NotReadyReason::PermissionDenied) => {
            match state.connection_manager.request_permissions().await {
                PermissionOutcome::Granted => Ok(()),
                PermissionOutcome::Denied => Err(anyhow!("Bluetooth permission denied")),
            }
        }
        Readiness::NotReady(reason) => Err(anyhow!("Bluetooth not ready: {:?}", reason)),
    }
}

/// Reconnects silently, or scans for the requested (or first) device
async fn connect(state: &AppState, device_id: Option<String>) -> Result<()> {
    ensure_ready(state).await?;
    if device_id.is_none() {
        match state
            .reconnection_policy
            .attempt_silent_reconnect(LifecycleEvent::AppStart)
            .await
        {
            ReconnectOutcome::Connected(_) => return Ok(()),
            ReconnectOutcome::NotAttempted(reason) => info!("No silent reconnect: {:?}", reason),
            ReconnectOutcome::Failed(e) => warn!("Silent reconnect failed: {}", e),
        }
    }

    let mut scan = state
        .connection_manager
        .start_scan(state.config.sync.scan_filter(), state.config.sync.scan_timeout())
        .await?;
    let mut target: Option<DeviceHandle> = None;
    while let Some(device) = scan.next().await {
        if device_id.as_deref().is_none_or(|id| id == device.id) {
            target = Some(device);
            break;
        }
    }
    let target = target.ok_or_else(|| anyhow!("No matching wearable found"))?;
    state.connection_manager.connect_requested(target).await?;
    Ok(())
}

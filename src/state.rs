//! Application state management
//! Builds the sync components once per process and hands out the shared
//! handles to the shell.

use std::sync::Arc;

use anyhow::{Result, anyhow};
use bluest::Adapter;
use log::info;

use crate::config::AppConfig;
use crate::core::bluetooth::{
    BlePlatform, BluestPermissionGate, BluestPlatform, ConnectionManager, JsonFileStore,
    LastDeviceStore, PermissionGate, ReconnectionPolicy, TelemetryListener,
};

pub struct AppState {
    pub config: AppConfig,
    pub connection_manager: ConnectionManager,
    pub reconnection_policy: ReconnectionPolicy,
    pub telemetry_listener: TelemetryListener,
}

impl AppState {
    /// Wires the components around the given platform pieces
    pub fn with_platform(
        config: AppConfig,
        platform: Arc<dyn BlePlatform>,
        gate: Arc<dyn PermissionGate>,
        store: Arc<dyn LastDeviceStore>,
    ) -> Self {
        let connection_manager = ConnectionManager::new(platform, gate, store, &config.sync);
        let reconnection_policy = ReconnectionPolicy::new(connection_manager.clone(), &config.sync);
        let telemetry_listener = TelemetryListener::new(connection_manager.clone());
        Self {
            config,
            connection_manager,
            reconnection_policy,
            telemetry_listener,
        }
    }

    /// Creates the state on top of the system Bluetooth adapter
    pub async fn new(config: AppConfig) -> Result<Self> {
        info!("Initializing Bluetooth adapter...");
        let adapter = Adapter::default()
            .await
            .ok_or_else(|| anyhow!("No Bluetooth adapter found"))?;

        let config_dir = AppConfig::config_dir()?;
        let store = JsonFileStore::new(config.sync.last_device_path(&config_dir));
        info!("Last device record kept at {:?}", store.path());

        Ok(Self::with_platform(
            config,
            Arc::new(BluestPlatform::new(adapter.clone())),
            Arc::new(BluestPermissionGate::new(Some(adapter))),
            Arc::new(store),
        ))
    }
}

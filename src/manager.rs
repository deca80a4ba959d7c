use std::future::Future;
use std::path::PathBuf;

use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

use crate::actions::ActionRunner;
use crate::config::{self, Settings};
use crate::engine::PresenceEngine;
use crate::messages::{PresenceChange, ScanRequest};
use crate::mqtt::MqttClient;
use crate::scanner::DeviceScanner;

/// Drives one cycle at a time: config, scan, transition, announce.
pub struct Manager<S, R> {
    scanner: S,
    engine: PresenceEngine<R>,
    config_path: PathBuf,
    settings: Settings,
    mqtt_client: Option<MqttClient>,
    scan_requests: Option<mpsc::Receiver<ScanRequest>>,
}

impl<S: DeviceScanner, R: ActionRunner> Manager<S, R> {
    pub fn new(
        scanner: S,
        engine: PresenceEngine<R>,
        config_path: PathBuf,
        settings: Settings,
    ) -> Self {
        Manager {
            scanner,
            engine,
            config_path,
            settings,
            mqtt_client: None,
            scan_requests: None,
        }
    }

    #[must_use]
    pub fn with_mqtt(
        mut self,
        mqtt_client: MqttClient,
        scan_requests: mpsc::Receiver<ScanRequest>,
    ) -> Self {
        self.mqtt_client = Some(mqtt_client);
        self.scan_requests = Some(scan_requests);
        self
    }

    #[cfg(test)]
    pub fn engine(&self) -> &PresenceEngine<R> {
        &self.engine
    }

    /// Runs a single cycle. Failing to read the config or to scan is fatal.
    pub async fn run_cycle(&mut self) -> Result<Vec<PresenceChange>> {
        let app_config = config::load(&self.config_path)?;
        let device_configs = app_config.device_configs();

        let scanned = self
            .scanner
            .scan(self.settings.max_devices, self.settings.scan_timeout)
            .await
            .context("Device discovery failed")?;
        if scanned.is_empty() {
            debug!("No devices visible");
        } else {
            debug!("Scan found {} device(s)", scanned.len());
        }

        let changes = self.engine.transition(&scanned, &device_configs).await;
        self.announce(&changes).await;
        if self.engine.is_empty() {
            debug!("No configured devices present");
        } else {
            let names: Vec<&str> = self
                .engine
                .present()
                .map(|(_, device)| device.name.as_str())
                .collect();
            debug!("Present: {}", names.join(", "));
        }
        Ok(changes)
    }

    /// Runs cycles on the configured interval until SIGINT or SIGTERM.
    pub async fn run_loop(self) -> Result<()> {
        self.run_until(shutdown_signal()).await
    }

    /// Runs cycles until `shutdown` resolves, even in the middle of a cycle.
    ///
    /// A cycle that overruns the interval delays the next tick; cycles never
    /// overlap. Dropping an interrupted cycle kills its running action.
    pub async fn run_until(mut self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let mut ticker = tokio::time::interval(self.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tokio::pin!(shutdown);

        info!(
            "Scanning every {:?} (timeout {:?}, up to {} devices)",
            self.settings.interval, self.settings.scan_timeout, self.settings.max_devices
        );

        let result = loop {
            tokio::select! {
                _ = ticker.tick() => {}
                Some(request) = next_request(&mut self.scan_requests) => {
                    info!("Received {:?} scan request", request);
                }
                _ = &mut shutdown => {
                    info!("Shutting down");
                    break Ok(());
                }
            }
            tokio::select! {
                cycle = self.run_cycle() => {
                    if let Err(err) = cycle {
                        break Err(err);
                    }
                }
                _ = &mut shutdown => {
                    info!("Shutting down during a cycle");
                    break Ok(());
                }
            }
        };

        if let Some(mqtt_client) = &self.mqtt_client
            && let Err(err) = mqtt_client.disconnect().await
        {
            warn!("Error disconnecting MQTT client: {:?}", err);
        }
        result
    }

    async fn announce(&self, changes: &[PresenceChange]) {
        let Some(mqtt_client) = &self.mqtt_client else {
            return;
        };
        for change in changes {
            if let Err(err) = mqtt_client.announce(change).await {
                error!("Error announcing presence: {:?}", err);
            }
        }
    }
}

async fn next_request(rx: &mut Option<mpsc::Receiver<ScanRequest>>) -> Option<ScanRequest> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(err) => {
                warn!("Cannot listen for SIGTERM: {}", err);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

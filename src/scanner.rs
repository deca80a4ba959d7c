use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;

use anyhow::{Context, Result};
use btleplug::api::{Central as _, CentralEvent, Peripheral as _, ScanFilter};
use btleplug::platform::PeripheralId;
use futures::StreamExt as _;
use log::{debug, warn};

use crate::messages::Device;

const UNKNOWN_NAME: &str = "[Unknown]";

/// Produces a fresh snapshot of visible devices.
pub trait DeviceScanner {
    /// Returns at most `max_devices` devices seen within `timeout`.
    fn scan(&self, max_devices: usize, timeout: Duration)
    -> impl Future<Output = Result<Vec<Device>>>;
}

pub struct BtleScanner {
    adapter: btleplug::platform::Adapter,
}

impl BtleScanner {
    pub fn new(adapter: btleplug::platform::Adapter) -> Self {
        BtleScanner { adapter }
    }

    // The adapter keeps every peripheral it has ever seen, so presence comes
    // from events received inside the window rather than `peripherals()`.
    async fn collect_ids(&self, max_devices: usize, timeout: Duration) -> Result<Vec<PeripheralId>> {
        let mut events = self
            .adapter
            .events()
            .await
            .context("Failed to subscribe to adapter events")?;
        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .context("Failed to start scan")?;

        let mut seen = HashSet::new();
        let mut ids = Vec::new();
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        while ids.len() < max_devices {
            tokio::select! {
                _ = &mut deadline => break,
                event = events.next() => {
                    let id = match event {
                        Some(CentralEvent::DeviceDiscovered(id))
                        | Some(CentralEvent::DeviceUpdated(id))
                        | Some(CentralEvent::ManufacturerDataAdvertisement { id, .. })
                        | Some(CentralEvent::ServiceDataAdvertisement { id, .. })
                        | Some(CentralEvent::ServicesAdvertisement { id, .. }) => id,
                        Some(_) => continue,
                        None => {
                            debug!("Adapter event stream closed");
                            break;
                        }
                    };
                    if seen.insert(id.clone()) {
                        ids.push(id);
                    }
                }
            }
        }

        if let Err(err) = self.adapter.stop_scan().await {
            warn!("Failed to stop scan: {:?}", err);
        }
        Ok(ids)
    }
}

impl DeviceScanner for BtleScanner {
    async fn scan(&self, max_devices: usize, timeout: Duration) -> Result<Vec<Device>> {
        if max_devices == 0 {
            return Ok(Vec::new());
        }
        let ids = self.collect_ids(max_devices, timeout).await?;

        let mut devices = Vec::with_capacity(ids.len());
        for id in ids {
            let peripheral = match self.adapter.peripheral(&id).await {
                Ok(peripheral) => peripheral,
                Err(err) => {
                    warn!("Lost peripheral {:?} before it could be read: {:?}", id, err);
                    continue;
                }
            };
            let name = match peripheral.properties().await {
                Ok(properties) => properties.and_then(|p| p.local_name),
                Err(err) => {
                    debug!("No properties for {:?}: {:?}", id, err);
                    None
                }
            };
            let device = Device::new(
                peripheral.address().to_string(),
                name.unwrap_or_else(|| UNKNOWN_NAME.to_string()),
            );
            debug!("Discovered {} ({})", device.address, device.name);
            devices.push(device);
        }
        Ok(devices)
    }
}

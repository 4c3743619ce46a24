use std::time::{Duration, SystemTime};

use btleplug::api::{Central as _, CentralEvent, Peripheral as _, PeripheralProperties, ScanFilter};
use btleplug::platform::{Adapter, PeripheralId};
use futures::StreamExt as _;
use log::{debug, error, info, trace};
use tokio::sync::mpsc;

use crate::messages::{Input, Observation};

/// Feeds raw adapter events to the engine as observations. Matching
/// against known devices happens downstream; everything seen is forwarded.
pub struct Scanner {
    adapter: Adapter,
    rescan_interval: Duration,
    tx: mpsc::Sender<Input>,
}

fn observation_from(
    properties: &PeripheralProperties,
    present: bool,
    at: SystemTime,
) -> Observation {
    Observation {
        device_id: properties.address.to_string(),
        present,
        rssi: if present { properties.rssi } else { None },
        at,
    }
}

impl Scanner {
    pub fn new(adapter: Adapter, rescan_interval: Duration, tx: mpsc::Sender<Input>) -> Self {
        Scanner {
            adapter,
            rescan_interval,
            tx,
        }
    }

    async fn restart_scan(&self) {
        if let Err(err) = self.adapter.stop_scan().await {
            trace!("Error stopping scan: {:?}", err);
        }
        if let Err(err) = self.adapter.start_scan(ScanFilter::default()).await {
            error!("Error starting scan: {:?}", err);
        }
    }

    async fn forward(&self, id: &PeripheralId, present: bool) -> anyhow::Result<()> {
        let peripheral = self.adapter.peripheral(id).await?;
        let Some(properties) = peripheral.properties().await? else {
            trace!("No properties for {:?}", id);
            return Ok(());
        };
        let observation = observation_from(&properties, present, SystemTime::now());
        self.tx.send(Input::Observe(observation)).await?;
        Ok(())
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let mut events = self.adapter.events().await?;
        self.adapter.start_scan(ScanFilter::default()).await?;

        // Some adapters stop reporting repeat advertisements within one
        // scan, so restart it every interval.
        let mut rescan = tokio::time::interval(self.rescan_interval);

        loop {
            tokio::select! {
                _ = rescan.tick() => self.restart_scan().await,
                event = events.next() => {
                    let result = match event {
                        Some(CentralEvent::DeviceDiscovered(id))
                        | Some(CentralEvent::DeviceUpdated(id)) => self.forward(&id, true).await,
                        Some(CentralEvent::DeviceDisconnected(id)) => {
                            debug!("DeviceDisconnected: {:?}", id);
                            self.forward(&id, false).await
                        }
                        Some(_) => Ok(()),
                        None => {
                            info!("No more events");
                            break;
                        }
                    };
                    if let Err(err) = result {
                        if self.tx.is_closed() {
                            info!("Engine gone, stopping scanner");
                            break;
                        }
                        debug!("Error handling adapter event: {:?}", err);
                    }
                }
            }
        }

        self.adapter.stop_scan().await?;
        Ok(())
    }
}

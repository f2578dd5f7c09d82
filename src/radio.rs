use btleplug::api::{Central as _, CentralEvent, CentralState, Peripheral as _, ScanFilter};
use futures::StreamExt as _;
use log::{debug, error};
use tokio::sync::mpsc;

use crate::messages::{PowerState, RadioEvent, RawAdvertisement};

/// The scanning capability the session drives. Advertisements and power-state
/// changes arrive separately, as [`RadioEvent`]s on the channel handed out by
/// the concrete radio.
pub trait Radio {
    async fn power_state(&self) -> PowerState;
    async fn start_scan(&self) -> anyhow::Result<()>;
    async fn stop_scan(&self) -> anyhow::Result<()>;
}

/// btleplug-backed radio. Scans without a filter so manufacturer data from
/// any vendor reaches the decoder, and relies on the platform delivering
/// repeated advertisements per device (the session wants every burst, not
/// first-seen only).
pub struct BtleRadio {
    adapter: btleplug::platform::Adapter,
}

impl BtleRadio {
    /// Wraps an adapter and spawns the event forwarder. The receiver yields
    /// one event per advertisement or power-state change until the adapter's
    /// event stream ends.
    pub fn new(adapter: btleplug::platform::Adapter) -> (Self, mpsc::Receiver<RadioEvent>) {
        let (tx, rx) = mpsc::channel(32);
        let event_adapter = adapter.clone();
        tokio::task::spawn(async move {
            if let Err(err) = forward_events(event_adapter, tx).await {
                error!("Error forwarding adapter events: {err:?}");
            }
        });
        (BtleRadio { adapter }, rx)
    }
}

impl Radio for BtleRadio {
    async fn power_state(&self) -> PowerState {
        match self.adapter.adapter_state().await {
            Ok(CentralState::PoweredOn) => PowerState::PoweredOn,
            Ok(state) => {
                debug!("Adapter state: {state:?}");
                PowerState::Other
            }
            Err(err) => {
                debug!("Failed to read adapter state: {err:?}");
                PowerState::Other
            }
        }
    }

    async fn start_scan(&self) -> anyhow::Result<()> {
        self.adapter.start_scan(ScanFilter::default()).await?;
        Ok(())
    }

    async fn stop_scan(&self) -> anyhow::Result<()> {
        self.adapter.stop_scan().await?;
        Ok(())
    }
}

async fn forward_events(
    adapter: btleplug::platform::Adapter,
    tx: mpsc::Sender<RadioEvent>,
) -> Result<(), btleplug::Error> {
    let mut events = adapter.events().await?;

    while let Some(event) = events.next().await {
        match event {
            CentralEvent::ManufacturerDataAdvertisement {
                id,
                manufacturer_data,
            } => {
                // Peripheral lookup can race with the device going away; skip
                // the event rather than killing the forwarder.
                let peripheral = match adapter.peripheral(&id).await {
                    Ok(peripheral) => peripheral,
                    Err(err) => {
                        debug!("Peripheral {id:?} not available: {err:?}");
                        continue;
                    }
                };
                let properties = peripheral.properties().await.ok().flatten();
                let name = properties.as_ref().and_then(|p| p.local_name.clone());
                let rssi = properties.as_ref().and_then(|p| p.rssi);
                let device_id = peripheral.address().to_string();

                // btleplug strips the company id out of the AD structure;
                // the decoder expects the raw payload, so put it back
                // (little-endian, as on the wire).
                for (company_id, payload) in manufacturer_data {
                    let mut data = Vec::with_capacity(payload.len() + 2);
                    data.extend_from_slice(&company_id.to_le_bytes());
                    data.extend_from_slice(&payload);

                    let advertisement = RawAdvertisement {
                        id: device_id.clone(),
                        name: name.clone(),
                        rssi,
                        manufacturer_data: Some(data),
                    };
                    if tx
                        .send(RadioEvent::Advertisement(advertisement))
                        .await
                        .is_err()
                    {
                        return Ok(());
                    }
                }
            }
            CentralEvent::StateUpdate(state) => {
                let power = match state {
                    CentralState::PoweredOn => PowerState::PoweredOn,
                    _ => PowerState::Other,
                };
                if tx.send(RadioEvent::PowerStateChanged(power)).await.is_err() {
                    return Ok(());
                }
            }
            _ => {}
        }
    }

    debug!("Adapter event stream closed");
    Ok(())
}

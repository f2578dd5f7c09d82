use std::collections::HashMap;

use log::{debug, info, warn};
use tokio::sync::{broadcast, mpsc};

use crate::frames;
use crate::messages::{DeviceRecord, PowerState, RadioEvent, RawAdvertisement, ScanCommand};
use crate::radio::Radio;

/// Destination for device snapshots. Detaching a sink never stops the scan;
/// it only suppresses publication.
pub trait Sink {
    async fn publish(&self, devices: Vec<DeviceRecord>) -> anyhow::Result<()>;
}

/// One BLE scan session: owns the radio handle, the per-device aggregate and
/// an optional subscriber sink.
///
/// The aggregate is only ever mutated from whichever task drives
/// [`ScanSession::run`] (or calls the handlers directly), so there is a
/// single writer by construction.
pub struct ScanSession<R: Radio, S: Sink> {
    radio: R,
    sink: Option<S>,
    engaged: bool,
    devices: HashMap<String, DeviceRecord>,
}

impl<R: Radio, S: Sink> ScanSession<R, S> {
    pub fn new(radio: R) -> Self {
        ScanSession {
            radio,
            sink: None,
            engaged: false,
            devices: HashMap::new(),
        }
    }

    pub fn attach_sink(&mut self, sink: S) {
        self.sink = Some(sink);
    }

    pub fn detach_sink(&mut self) -> Option<S> {
        self.sink.take()
    }

    /// Requests scanning. Returns true if the radio was powered on and the
    /// scan engaged, false otherwise; the caller may retry, or rely on the
    /// radio's power-state notification to start the scan once power comes
    /// up.
    pub async fn start(&mut self) -> bool {
        self.engaged = true;
        match self.radio.power_state().await {
            PowerState::PoweredOn => match self.radio.start_scan().await {
                Ok(()) => {
                    info!("Scanning started");
                    true
                }
                Err(err) => {
                    warn!("Failed to start scanning: {err:?}");
                    false
                }
            },
            PowerState::Other => {
                info!("Radio not powered on; scan deferred until power-state change");
                false
            }
        }
    }

    /// Stops scanning and clears the device aggregate. Always returns true,
    /// even if the session was never started.
    pub async fn stop(&mut self) -> bool {
        self.engaged = false;
        if let Err(err) = self.radio.stop_scan().await {
            warn!("Failed to stop scanning: {err:?}");
        }
        self.devices.clear();
        true
    }

    pub async fn handle_event(&mut self, event: RadioEvent) {
        match event {
            RadioEvent::Advertisement(adv) => self.on_advertisement(adv).await,
            RadioEvent::PowerStateChanged(PowerState::PoweredOn) => {
                // Power came (back) up; resume a requested scan without a new
                // explicit start() call.
                if self.engaged {
                    match self.radio.start_scan().await {
                        Ok(()) => info!("Radio powered on, scanning started"),
                        Err(err) => warn!("Failed to start scanning on power-up: {err:?}"),
                    }
                }
            }
            RadioEvent::PowerStateChanged(PowerState::Other) => {
                debug!("Radio no longer powered on");
            }
        }
    }

    async fn on_advertisement(&mut self, adv: RawAdvertisement) {
        // Advertisements without manufacturer data are not Minew beacons.
        let Some(data) = adv.manufacturer_data else {
            return;
        };

        // An empty decode result still counts: the record is upserted and the
        // snapshot republished either way.
        let advertisement_frames = frames::decode(&data);
        let record = DeviceRecord {
            name: adv.name.unwrap_or_else(|| "Unknown".to_string()),
            advertisement_frames,
        };
        self.devices.insert(adv.id, record);

        self.publish().await;
    }

    /// Publishes the entire current value set of the aggregate. Dropped, not
    /// queued, while no sink is attached.
    async fn publish(&self) {
        let Some(sink) = self.sink.as_ref() else {
            return;
        };
        let snapshot: Vec<DeviceRecord> = self.devices.values().cloned().collect();
        if let Err(err) = sink.publish(snapshot).await {
            warn!("Failed to publish device snapshot: {err:?}");
        }
    }

    #[cfg(test)]
    fn device(&self, id: &str) -> Option<&DeviceRecord> {
        self.devices.get(id)
    }

    #[cfg(test)]
    fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// Drives the session until the radio event channel closes: radio events
    /// mutate the aggregate, commands from the host application start and
    /// stop the scan.
    pub async fn run(
        &mut self,
        mut events: mpsc::Receiver<RadioEvent>,
        mut commands: broadcast::Receiver<ScanCommand>,
    ) {
        let mut commands_open = true;

        loop {
            tokio::select! {
                cmd = commands.recv(), if commands_open => match cmd {
                    Ok(ScanCommand::Start) => {
                        let started = self.start().await;
                        debug!("Start command handled, scanning engaged: {started}");
                    }
                    Ok(ScanCommand::Stop) => {
                        self.stop().await;
                        debug!("Stop command handled");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("Command channel closed");
                        commands_open = false;
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!("Command receiver lagged by {n}");
                    }
                },
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => {
                        debug!("Radio event channel closed");
                        break;
                    }
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::frames::Frame;

    #[derive(Clone)]
    struct FakeRadio {
        powered: Arc<AtomicBool>,
        scanning: Arc<AtomicBool>,
    }

    impl FakeRadio {
        fn new(powered: bool) -> Self {
            FakeRadio {
                powered: Arc::new(AtomicBool::new(powered)),
                scanning: Arc::new(AtomicBool::new(false)),
            }
        }

        fn is_scanning(&self) -> bool {
            self.scanning.load(Ordering::SeqCst)
        }
    }

    impl Radio for FakeRadio {
        async fn power_state(&self) -> PowerState {
            if self.powered.load(Ordering::SeqCst) {
                PowerState::PoweredOn
            } else {
                PowerState::Other
            }
        }

        async fn start_scan(&self) -> anyhow::Result<()> {
            self.scanning.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn stop_scan(&self) -> anyhow::Result<()> {
            self.scanning.store(false, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Clone, Default)]
    struct FakeSink {
        published: Arc<Mutex<Vec<Vec<DeviceRecord>>>>,
    }

    impl FakeSink {
        fn snapshots(&self) -> Vec<Vec<DeviceRecord>> {
            self.published.lock().unwrap().clone()
        }
    }

    impl Sink for FakeSink {
        async fn publish(&self, devices: Vec<DeviceRecord>) -> anyhow::Result<()> {
            self.published.lock().unwrap().push(devices);
            Ok(())
        }
    }

    fn temp_advertisement(id: &str, name: &str, raw: u16) -> RadioEvent {
        let mut data = vec![0x39, 0x06, 0x02, 0x01];
        data.extend_from_slice(&raw.to_be_bytes());
        RadioEvent::Advertisement(RawAdvertisement {
            id: id.to_string(),
            name: Some(name.to_string()),
            rssi: Some(-60),
            manufacturer_data: Some(data),
        })
    }

    #[tokio::test]
    async fn test_start_when_powered() {
        let radio = FakeRadio::new(true);
        let mut session = ScanSession::<_, FakeSink>::new(radio.clone());
        assert!(session.start().await);
        assert!(radio.is_scanning());
    }

    #[tokio::test]
    async fn test_start_when_not_powered() {
        let radio = FakeRadio::new(false);
        let mut session = ScanSession::<_, FakeSink>::new(radio.clone());
        assert!(!session.start().await);
        assert!(!radio.is_scanning());
        assert_eq!(session.device_count(), 0);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let radio = FakeRadio::new(true);
        let mut session = ScanSession::<_, FakeSink>::new(radio);
        assert!(session.stop().await);
        assert_eq!(session.device_count(), 0);
        assert!(session.stop().await);
        assert_eq!(session.device_count(), 0);
    }

    #[tokio::test]
    async fn test_stop_clears_aggregate() {
        let radio = FakeRadio::new(true);
        let mut session = ScanSession::<_, FakeSink>::new(radio.clone());
        session.start().await;
        session.handle_event(temp_advertisement("dev-1", "MST01", 3000)).await;
        assert_eq!(session.device_count(), 1);
        assert!(session.stop().await);
        assert_eq!(session.device_count(), 0);
        assert!(!radio.is_scanning());
    }

    #[tokio::test]
    async fn test_advertisement_without_manufacturer_data_ignored() {
        let sink = FakeSink::default();
        let mut session = ScanSession::new(FakeRadio::new(true));
        session.attach_sink(sink.clone());
        session
            .handle_event(RadioEvent::Advertisement(RawAdvertisement {
                id: "dev-1".to_string(),
                name: Some("MST01".to_string()),
                rssi: Some(-60),
                manufacturer_data: None,
            }))
            .await;
        assert_eq!(session.device_count(), 0);
        assert!(sink.snapshots().is_empty());
    }

    #[tokio::test]
    async fn test_empty_decode_still_publishes() {
        // Manufacturer data that decodes to zero frames is still a qualifying
        // event.
        let sink = FakeSink::default();
        let mut session = ScanSession::new(FakeRadio::new(true));
        session.attach_sink(sink.clone());
        session
            .handle_event(RadioEvent::Advertisement(RawAdvertisement {
                id: "dev-1".to_string(),
                name: None,
                rssi: None,
                manufacturer_data: Some(vec![0x39, 0x06]),
            }))
            .await;
        assert_eq!(session.device_count(), 1);
        let record = session.device("dev-1").unwrap();
        assert_eq!(record.name, "Unknown");
        assert!(record.advertisement_frames.is_empty());
        assert_eq!(sink.snapshots().len(), 1);
    }

    #[tokio::test]
    async fn test_same_device_overwrites() {
        let mut session = ScanSession::<_, FakeSink>::new(FakeRadio::new(true));
        session.handle_event(temp_advertisement("dev-1", "MST01", 3000)).await;
        session.handle_event(temp_advertisement("dev-1", "MST01-renamed", 2100)).await;
        assert_eq!(session.device_count(), 1);
        let record = session.device("dev-1").unwrap();
        assert_eq!(record.name, "MST01-renamed");
        assert_eq!(
            record.advertisement_frames,
            vec![Frame::TempSensor { temp: 21.0 }]
        );
    }

    #[tokio::test]
    async fn test_snapshot_contains_all_devices() {
        let sink = FakeSink::default();
        let mut session = ScanSession::new(FakeRadio::new(true));
        session.attach_sink(sink.clone());
        assert!(session.start().await);

        session.handle_event(temp_advertisement("dev-1", "MST01", 3000)).await;
        session.handle_event(temp_advertisement("dev-2", "MST02", 2150)).await;

        let snapshots = sink.snapshots();
        assert_eq!(snapshots.len(), 2);

        let last = &snapshots[1];
        assert_eq!(last.len(), 2);
        let mut temps: Vec<f32> = last
            .iter()
            .map(|record| match record.advertisement_frames[0] {
                Frame::TempSensor { temp } => temp,
            })
            .collect();
        temps.sort_by(f32::total_cmp);
        assert_eq!(temps, vec![21.5, 30.0]);
    }

    #[tokio::test]
    async fn test_detached_sink_drops_events_but_keeps_scanning() {
        let sink = FakeSink::default();
        let radio = FakeRadio::new(true);
        let mut session = ScanSession::new(radio.clone());
        session.attach_sink(sink.clone());
        session.start().await;

        session.detach_sink();
        session.handle_event(temp_advertisement("dev-1", "MST01", 3000)).await;
        assert!(sink.snapshots().is_empty());
        assert!(radio.is_scanning());
        assert_eq!(session.device_count(), 1);

        session.attach_sink(sink.clone());
        session.handle_event(temp_advertisement("dev-2", "MST02", 2100)).await;
        assert_eq!(sink.snapshots().len(), 1);
        assert_eq!(sink.snapshots()[0].len(), 2);
    }

    #[tokio::test]
    async fn test_power_on_resumes_engaged_session() {
        let radio = FakeRadio::new(false);
        let mut session = ScanSession::<_, FakeSink>::new(radio.clone());
        assert!(!session.start().await);
        assert!(!radio.is_scanning());

        radio.powered.store(true, Ordering::SeqCst);
        session
            .handle_event(RadioEvent::PowerStateChanged(PowerState::PoweredOn))
            .await;
        assert!(radio.is_scanning());
    }

    #[tokio::test]
    async fn test_power_on_after_stop_does_not_resume() {
        let radio = FakeRadio::new(true);
        let mut session = ScanSession::<_, FakeSink>::new(radio.clone());
        session.start().await;
        session.stop().await;
        session
            .handle_event(RadioEvent::PowerStateChanged(PowerState::PoweredOn))
            .await;
        assert!(!radio.is_scanning());
    }

    /// Yields to the session task until `condition` holds.
    async fn settle(condition: impl Fn() -> bool) {
        for _ in 0..1000 {
            if condition() {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_run_loop_round_trip() {
        let sink = FakeSink::default();
        let radio = FakeRadio::new(true);
        let mut session = ScanSession::new(radio.clone());
        session.attach_sink(sink.clone());

        let (event_tx, event_rx) = mpsc::channel(8);
        let (command_tx, command_rx) = broadcast::channel(8);
        let handle = tokio::spawn(async move {
            session.run(event_rx, command_rx).await;
        });

        command_tx.send(ScanCommand::Start).unwrap();
        {
            let radio = radio.clone();
            settle(move || radio.is_scanning()).await;
        }

        event_tx.send(temp_advertisement("dev-1", "MST01", 3000)).await.unwrap();
        event_tx.send(temp_advertisement("dev-2", "MST02", 2150)).await.unwrap();
        {
            let sink = sink.clone();
            settle(move || sink.snapshots().len() == 2).await;
        }
        assert_eq!(sink.snapshots()[1].len(), 2);

        command_tx.send(ScanCommand::Stop).unwrap();
        {
            let radio = radio.clone();
            settle(move || !radio.is_scanning()).await;
        }

        drop(event_tx);
        drop(command_tx);
        handle.await.unwrap();
    }
}

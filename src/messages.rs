use serde_derive::Serialize;

use crate::frames::Frame;

/// One advertisement as delivered by the radio. Lives only for the duration
/// of a single callback.
#[allow(dead_code)]
#[derive(Clone, Debug)]
pub struct RawAdvertisement {
    pub id: String,
    pub name: Option<String>,
    pub rssi: Option<i16>,
    pub manufacturer_data: Option<Vec<u8>>,
}

/// Radio power state as the session cares about it: powered on, or anything
/// else (off, unauthorized, resetting, unknown).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PowerState {
    PoweredOn,
    Other,
}

#[derive(Clone, Debug)]
pub enum RadioEvent {
    Advertisement(RawAdvertisement),
    PowerStateChanged(PowerState),
}

/// Host-application control commands, delivered over the sink's command
/// topics.
#[derive(Clone, Debug)]
pub enum ScanCommand {
    Start,
    Stop,
}

/// Latest decoded data for one device, keyed by device id in the session
/// aggregate. Last write wins; no frame history is kept.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DeviceRecord {
    pub name: String,
    #[serde(rename = "advFrames")]
    pub advertisement_frames: Vec<Frame>,
}

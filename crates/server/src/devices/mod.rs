pub mod connect;
pub mod tracker;

pub use connect::{ConnectPreferenceService, KeepAwakeService, Transport};
pub use tracker::{DeviceRecord, DeviceTracker, RecordingState};

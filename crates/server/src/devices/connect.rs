//! USB/Wi-Fi connection-mode switching and keep-awake control (spec §4.6).
//! Grounded on `session.rs`'s `Command`-building and kill/timeout handling,
//! adapted from spawning the scrcpy/agent process to issuing `adb` commands.

use std::collections::HashMap;
use std::time::Duration;

use tokio::process::Command;
use tokio::sync::RwLock;
use tokio::time::{sleep, timeout};

const WIFI_CONNECT_DEADLINE: Duration = Duration::from_secs(10);
const WIFI_CONNECT_RETRY_GAP: Duration = Duration::from_millis(200);
const WIFI_TCPIP_SETTLE_GAP: Duration = Duration::from_millis(400);
const WIFI_CONNECT_MAX_RETRIES: usize = 3;
const DEFAULT_WIFI_PORT: u16 = 5555;
const KEEP_AWAKE_KEYCODE: &str = "224";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Usb,
    Wifi,
}

/// Remembers which transport each hardware serial last preferred, purely
/// in memory (spec §4.6: no persistence across restarts).
pub struct ConnectPreferenceService {
    preferred: RwLock<HashMap<String, Transport>>,
}

impl ConnectPreferenceService {
    pub fn new() -> Self {
        Self {
            preferred: RwLock::new(HashMap::new()),
        }
    }

    pub async fn get(&self, hardware_serial: &str) -> Option<Transport> {
        self.preferred.read().await.get(hardware_serial).copied()
    }

    pub async fn set(&self, hardware_serial: String, transport: Transport) {
        self.preferred.write().await.insert(hardware_serial, transport);
    }

    /// Switch a device to USB: set the preference, run `adb -s <id> usb`,
    /// then disconnect any Wi-Fi peer sharing the same hardware serial.
    pub async fn switch_to_usb(
        &self,
        device_id: &str,
        hardware_serial: &str,
        wifi_peer_ids: &[String],
    ) -> anyhow::Result<()> {
        self.set(hardware_serial.to_string(), Transport::Usb).await;
        run_adb(&["-s", device_id, "usb"]).await?;
        for peer in wifi_peer_ids {
            let _ = run_adb(&["disconnect", peer]).await;
        }
        Ok(())
    }

    /// Switch a device to Wi-Fi: enable tcpip mode, wait for the daemon to
    /// settle, then retry `adb connect` up to 3 times within a 10s deadline.
    pub async fn switch_to_wifi(
        &self,
        device_id: &str,
        hardware_serial: &str,
        ip: &str,
        port: Option<u16>,
    ) -> anyhow::Result<String> {
        let port = port.unwrap_or(DEFAULT_WIFI_PORT);
        self.set(hardware_serial.to_string(), Transport::Wifi).await;
        run_adb(&["-s", device_id, "tcpip", &port.to_string()]).await?;
        sleep(WIFI_TCPIP_SETTLE_GAP).await;

        let target = format!("{ip}:{port}");
        let attempt = async {
            for retry in 0..WIFI_CONNECT_MAX_RETRIES {
                if retry > 0 {
                    sleep(WIFI_CONNECT_RETRY_GAP).await;
                }
                if let Ok(output) = run_adb(&["connect", &target]).await {
                    if output.contains("connected to") || output.contains("already connected") {
                        return Ok(target.clone());
                    }
                }
            }
            anyhow::bail!("failed to connect to {target} over wifi")
        };

        timeout(WIFI_CONNECT_DEADLINE, attempt)
            .await
            .map_err(|_| anyhow::anyhow!("wifi connect to {target} timed out"))?
    }
}

/// Issues `svc power stayon true` and a wake keyevent, with a per-device
/// timer that reverts `stayon` after a caller-chosen duration.
pub struct KeepAwakeService {
    active: RwLock<HashMap<String, tokio::task::JoinHandle<()>>>,
}

impl KeepAwakeService {
    pub fn new() -> Self {
        Self {
            active: RwLock::new(HashMap::new()),
        }
    }

    pub async fn keep_awake(&self, device_id: &str, duration: Duration) -> anyhow::Result<()> {
        run_adb(&["-s", device_id, "shell", "svc", "power", "stayon", "true"]).await?;
        run_adb(&["-s", device_id, "shell", "input", "keyevent", KEEP_AWAKE_KEYCODE]).await?;

        if let Some(previous) = self.active.write().await.remove(device_id) {
            previous.abort();
        }

        let id = device_id.to_string();
        let handle = tokio::spawn(async move {
            sleep(duration).await;
            let _ = run_adb(&["-s", &id, "shell", "svc", "power", "stayon", "false"]).await;
        });
        self.active.write().await.insert(device_id.to_string(), handle);
        Ok(())
    }

    pub async fn cancel(&self, device_id: &str) {
        if let Some(handle) = self.active.write().await.remove(device_id) {
            handle.abort();
        }
    }
}

async fn run_adb(args: &[&str]) -> anyhow::Result<String> {
    let output = Command::new("adb").args(args).output().await?;
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn preference_service_starts_empty() {
        let prefs = ConnectPreferenceService::new();
        assert_eq!(prefs.get("SERIAL1").await, None);
    }

    #[tokio::test]
    async fn preference_service_remembers_last_set() {
        let prefs = ConnectPreferenceService::new();
        prefs.set("SERIAL1".to_string(), Transport::Wifi).await;
        assert_eq!(prefs.get("SERIAL1").await, Some(Transport::Wifi));
        prefs.set("SERIAL1".to_string(), Transport::Usb).await;
        assert_eq!(prefs.get("SERIAL1").await, Some(Transport::Usb));
    }

    #[tokio::test]
    async fn keep_awake_cancel_on_unknown_device_is_noop() {
        let service = KeepAwakeService::new();
        service.cancel("no-such-device").await;
    }
}

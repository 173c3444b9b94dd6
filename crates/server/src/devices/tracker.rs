//! Live set of attached devices, consuming the ADB server's change-stream
//! with a coalesced broadcast (spec §4.5). Grounded on `session.rs`'s
//! `SessionManager`'s `RwLock<HashMap<..>>` cache and `DisplayPool`'s
//! allocate/release bookkeeping, adapted from "display numbers" to "device
//! records"; the single-flight refresh guard is grounded on `web.rs`'s
//! `LoginRateLimiter`'s "periodic sweep gated by a counter" shape.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::process::Command;
use tokio::sync::{broadcast, RwLock};
use tokio::time::sleep;

use crate::devices::connect::{ConnectPreferenceService, Transport};

const CACHE_TTL: Duration = Duration::from_secs(5);
const TRACKER_RESTART_BACKOFF: Duration = Duration::from_secs(1);
const IP_RESOLUTION_ATTEMPT_GAP: Duration = Duration::from_millis(300);
const FAN_OUT: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordingState {
    Stop,
    Record,
    Run,
    Pause,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRecord {
    pub id: String,
    pub transport: Transport,
    pub ipv4: Option<String>,
    pub hardware_serial: Option<String>,
    pub recording_state: RecordingState,
    pub last_seen_ms: u128,
}

struct CacheEntry<T> {
    value: T,
    fetched_at: Instant,
}

impl<T: Clone> CacheEntry<T> {
    fn fresh(&self) -> Option<T> {
        if self.fetched_at.elapsed() < CACHE_TTL {
            Some(self.value.clone())
        } else {
            None
        }
    }
}

/// Cached, event-driven view of attached devices. Survives ADB server
/// restarts by auto-restarting its change-stream consumer with a 1s
/// backoff.
pub struct DeviceTracker {
    records: RwLock<HashMap<String, DeviceRecord>>,
    ip_cache: RwLock<HashMap<String, CacheEntry<Option<String>>>>,
    serial_cache: RwLock<HashMap<String, CacheEntry<Option<String>>>>,
    refreshing: AtomicBool,
    pending: AtomicBool,
    snapshots: broadcast::Sender<Vec<DeviceRecord>>,
    preferences: Arc<ConnectPreferenceService>,
}

impl DeviceTracker {
    pub fn new(preferences: Arc<ConnectPreferenceService>) -> Arc<Self> {
        let (snapshots, _) = broadcast::channel(16);
        Arc::new(Self {
            records: RwLock::new(HashMap::new()),
            ip_cache: RwLock::new(HashMap::new()),
            serial_cache: RwLock::new(HashMap::new()),
            refreshing: AtomicBool::new(false),
            pending: AtomicBool::new(false),
            snapshots,
            preferences,
        })
    }

    /// New subscribers immediately receive the cached snapshot (id-only if
    /// nothing has refreshed yet), then every subsequent refreshed snapshot.
    pub async fn subscribe(&self) -> (Vec<DeviceRecord>, broadcast::Receiver<Vec<DeviceRecord>>) {
        let snapshot: Vec<DeviceRecord> = self.records.read().await.values().cloned().collect();
        (snapshot, self.snapshots.subscribe())
    }

    /// Spawn the ADB change-stream consumer loop. Auto-restarts on
    /// error/end with a 1s backoff (spec §4.5, scenario 5).
    pub fn start(self: &Arc<Self>) {
        let tracker = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                if let Err(err) = tracker.run_change_stream().await {
                    tracing::warn!(%err, "device change-stream ended, restarting");
                } else {
                    tracing::debug!("device change-stream ended cleanly, restarting");
                }
                sleep(TRACKER_RESTART_BACKOFF).await;
            }
        });
    }

    async fn run_change_stream(self: &Arc<Self>) -> anyhow::Result<()> {
        // A full "track-devices" long-poll against the ADB server protocol
        // would live here; we poll `adb devices` on an interval as the
        // library-call fallback path (spec §4.5 step 1) and treat every
        // poll as one change-stream "tick".
        loop {
            self.trigger_refresh().await;
            sleep(Duration::from_secs(2)).await;
        }
    }

    /// Trigger a coalesced refresh: at most one collection runs at a time;
    /// at most one follow-up is queued; extra triggers during flight drop.
    pub async fn trigger_refresh(self: &Arc<Self>) {
        if self
            .refreshing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            self.pending.store(true, Ordering::SeqCst);
            return;
        }

        let tracker = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tracker.collect_once().await;
                if tracker
                    .pending
                    .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
                    .is_err()
                {
                    break;
                }
            }
            tracker.refreshing.store(false, Ordering::SeqCst);
        });
    }

    async fn collect_once(self: &Arc<Self>) {
        let ids = match list_device_ids().await {
            Ok(ids) if !ids.is_empty() => ids,
            _ => Vec::new(),
        };

        let mut handles = Vec::new();
        let mut all_resolved = Vec::new();
        for chunk in ids.chunks(FAN_OUT) {
            for id in chunk {
                let tracker = Arc::clone(self);
                let id = id.clone();
                handles.push(tokio::spawn(async move { tracker.resolve_record(id).await }));
            }
            for handle in handles.drain(..) {
                if let Ok(record) = handle.await {
                    all_resolved.push(record);
                }
            }
        }
        self.merge_records(&ids, all_resolved).await;

        let selected = self.select_by_preference().await;
        let _ = self.snapshots.send(selected);
    }

    async fn resolve_record(&self, id: String) -> DeviceRecord {
        let transport = if id.contains(':') {
            Transport::Wifi
        } else {
            Transport::Usb
        };
        let ipv4 = self.resolve_ip(&id).await;
        let hardware_serial = self.resolve_serial(&id).await;
        DeviceRecord {
            id,
            transport,
            ipv4,
            hardware_serial,
            recording_state: RecordingState::Stop,
            last_seen_ms: now_ms(),
        }
    }

    /// Replace the live set with exactly the devices seen in this poll,
    /// dropping any record whose id did not appear in `live_ids` (spec
    /// §4.5: the tracker presents a live set, not a log).
    async fn merge_records(&self, live_ids: &[String], resolved: Vec<DeviceRecord>) {
        let mut records = self.records.write().await;
        records.retain(|id, _| live_ids.contains(id));
        for record in resolved {
            records.insert(record.id.clone(), record);
        }
    }

    /// Group by hardware serial and pick one per group per
    /// `ConnectPreferenceService`, falling back to first-seen.
    async fn select_by_preference(&self) -> Vec<DeviceRecord> {
        let records = self.records.read().await;
        let mut by_serial: HashMap<String, Vec<DeviceRecord>> = HashMap::new();
        let mut no_serial = Vec::new();
        for record in records.values() {
            match &record.hardware_serial {
                Some(serial) => by_serial.entry(serial.clone()).or_default().push(record.clone()),
                None => no_serial.push(record.clone()),
            }
        }

        let mut out = no_serial;
        for (serial, mut group) in by_serial {
            if group.len() == 1 {
                out.push(group.remove(0));
                continue;
            }
            let preferred = self.preferences.get(&serial).await;
            let pick = preferred
                .and_then(|transport| group.iter().position(|r| r.transport == transport))
                .unwrap_or(0);
            out.push(group.remove(pick));
        }
        out
    }

    /// Resolve a device's IPv4 with up to 3 sequential attempts, caching
    /// results for `CACHE_TTL`.
    async fn resolve_ip(&self, id: &str) -> Option<String> {
        if let Some(entry) = self.ip_cache.read().await.get(id) {
            if let Some(cached) = entry.fresh() {
                return cached;
            }
        }

        let mut result = None;
        for attempt in 0..3 {
            if attempt > 0 {
                sleep(IP_RESOLUTION_ATTEMPT_GAP).await;
            }
            result = run_ip_resolution_attempt(id, attempt).await;
            if result.is_some() {
                break;
            }
        }

        self.ip_cache.write().await.insert(
            id.to_string(),
            CacheEntry {
                value: result.clone(),
                fetched_at: Instant::now(),
            },
        );
        result
    }

    async fn resolve_serial(&self, id: &str) -> Option<String> {
        if let Some(entry) = self.serial_cache.read().await.get(id) {
            if let Some(cached) = entry.fresh() {
                return cached;
            }
        }
        let result = run_adb_get_serialno(id).await;
        self.serial_cache.write().await.insert(
            id.to_string(),
            CacheEntry {
                value: result.clone(),
                fetched_at: Instant::now(),
            },
        );
        result
    }
}

fn now_ms() -> u128 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

async fn list_device_ids() -> anyhow::Result<Vec<String>> {
    let output = Command::new("adb").arg("devices").output().await?;
    let text = String::from_utf8_lossy(&output.stdout);
    let ids = text
        .lines()
        .skip(1)
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let id = parts.next()?;
            let state = parts.next()?;
            (state == "device").then(|| id.to_string())
        })
        .collect();
    Ok(ids)
}

async fn run_adb_get_serialno(id: &str) -> Option<String> {
    let output = Command::new("adb")
        .args(["-s", id, "shell", "getprop", "ro.serialno"])
        .output()
        .await
        .ok()?;
    let serial = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!serial.is_empty()).then_some(serial)
}

/// One of the three-stage IP resolution attempts in spec §4.5: `ip route
/// get`, `ip addr show`, `ifconfig`.
async fn run_ip_resolution_attempt(id: &str, attempt: usize) -> Option<String> {
    let args: Vec<&str> = match attempt {
        0 => vec!["-s", id, "shell", "ip", "route", "get", "1.1.1.1"],
        1 => vec!["-s", id, "shell", "ip", "-f", "inet", "addr", "show", "wlan0"],
        _ => vec!["-s", id, "shell", "ifconfig"],
    };
    let output = Command::new("adb").args(&args).output().await.ok()?;
    let text = String::from_utf8_lossy(&output.stdout);
    extract_ipv4(&text)
}

fn extract_ipv4(text: &str) -> Option<String> {
    for line in text.lines() {
        if let Some(idx) = line.find("src ") {
            if let Some(addr) = line[idx + 4..].split_whitespace().next() {
                if is_non_loopback_ipv4(addr) {
                    return Some(addr.to_string());
                }
            }
        }
        if let Some(idx) = line.find("inet ") {
            let rest = &line[idx + 5..];
            let addr = rest.split('/').next().unwrap_or("").trim();
            if is_non_loopback_ipv4(addr) {
                return Some(addr.to_string());
            }
        }
        if let Some(idx) = line.find("inet addr:") {
            let rest = &line[idx + "inet addr:".len()..];
            let addr = rest.split_whitespace().next().unwrap_or("");
            if is_non_loopback_ipv4(addr) {
                return Some(addr.to_string());
            }
        }
    }
    None
}

fn is_non_loopback_ipv4(addr: &str) -> bool {
    addr.parse::<std::net::Ipv4Addr>()
        .map(|ip| !ip.is_loopback())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_ipv4_from_ip_route_get() {
        let text = "1.1.1.1 via 192.168.1.1 dev wlan0 src 192.168.1.42 uid 0";
        assert_eq!(extract_ipv4(text), Some("192.168.1.42".to_string()));
    }

    #[test]
    fn extract_ipv4_from_ip_addr_show() {
        let text = "2: wlan0: <UP> mtu 1500\n    inet 10.0.0.5/24 brd 10.0.0.255 scope global wlan0";
        assert_eq!(extract_ipv4(text), Some("10.0.0.5".to_string()));
    }

    #[test]
    fn extract_ipv4_from_ifconfig_legacy() {
        let text = "wlan0     Link encap:Ethernet\n          inet addr:172.16.0.9  Bcast:172.16.0.255";
        assert_eq!(extract_ipv4(text), Some("172.16.0.9".to_string()));
    }

    #[test]
    fn extract_ipv4_skips_loopback() {
        let text = "inet 127.0.0.1/8 scope host lo";
        assert_eq!(extract_ipv4(text), None);
    }

    #[test]
    fn extract_ipv4_no_match_returns_none() {
        assert_eq!(extract_ipv4("nothing useful here"), None);
    }

    #[tokio::test]
    async fn coalesced_refresh_drops_extra_triggers_during_flight() {
        let prefs = Arc::new(ConnectPreferenceService::new());
        let tracker = DeviceTracker::new(prefs);
        // Two triggers back to back: the second should fold into `pending`
        // rather than spawning a second concurrent collection.
        tracker.trigger_refresh().await;
        tracker.trigger_refresh().await;
        assert!(tracker.pending.load(Ordering::SeqCst) || tracker.refreshing.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn select_by_preference_dedupes_by_hardware_serial() {
        let prefs = Arc::new(ConnectPreferenceService::new());
        let tracker = DeviceTracker::new(prefs);
        {
            let mut records = tracker.records.write().await;
            records.insert(
                "ABC123".to_string(),
                DeviceRecord {
                    id: "ABC123".to_string(),
                    transport: Transport::Usb,
                    ipv4: None,
                    hardware_serial: Some("SERIAL1".to_string()),
                    recording_state: RecordingState::Stop,
                    last_seen_ms: 0,
                },
            );
            records.insert(
                "192.168.1.5:5555".to_string(),
                DeviceRecord {
                    id: "192.168.1.5:5555".to_string(),
                    transport: Transport::Wifi,
                    ipv4: Some("192.168.1.5".to_string()),
                    hardware_serial: Some("SERIAL1".to_string()),
                    recording_state: RecordingState::Stop,
                    last_seen_ms: 0,
                },
            );
        }
        let snapshot = tracker.select_by_preference().await;
        assert_eq!(snapshot.len(), 1);
    }
}

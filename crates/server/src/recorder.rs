//! Time-stamped capture/replay engine for a session's upstream-bound
//! control traffic (spec §4.4). Persistence follows `session.rs`'s
//! tmp-then-rename JSON write pattern; binary payloads are base64-encoded
//! (pack-wide convention, e.g. `Has-X-Sensitivity`, `h1dr0nn-adb-compass`).

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::Context;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::time::sleep;

/// One captured frame: elapsed offset from recording start (minus paused
/// time), payload (base64 for binary frames, raw string otherwise), and
/// whether the payload is binary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecordedMessage {
    pub at: u64,
    pub data: String,
    pub binary: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recording {
    pub id: String,
    pub remote: String,
    #[serde(rename = "createdAt")]
    pub created_at: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub meta: serde_json::Value,
    pub messages: Vec<RecordedMessage>,
}

/// A frame as observed by the proxy, before timestamping.
pub enum CaptureFrame {
    Binary(Vec<u8>),
    Text(String),
}

/// Sanitize an externally supplied recording id to `[A-Za-z0-9_-]`
/// (non-conforming chars become `_`). The sentinels `"true"`/`"1"` are
/// replaced by a freshly generated id using the given epoch-millis clock
/// reading, matching spec §4.4.
pub fn normalize_id(raw: &str, now_ms: u128) -> String {
    if raw == "true" || raw == "1" {
        return format!("session-{now_ms}");
    }
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Captures downstream-origin frames with elapsed timestamps, honoring
/// pause/resume.
pub struct Recorder {
    id: String,
    remote: String,
    name: Option<String>,
    meta: serde_json::Value,
    started_at: Instant,
    paused_duration: Duration,
    paused_at: Option<Instant>,
    messages: Vec<RecordedMessage>,
}

impl Recorder {
    pub fn new(id: String, remote: String) -> Self {
        Self {
            id,
            remote,
            name: None,
            meta: serde_json::Value::Null,
            started_at: Instant::now(),
            paused_duration: Duration::ZERO,
            paused_at: None,
            messages: Vec::new(),
        }
    }

    pub fn with_meta(mut self, name: Option<String>, meta: serde_json::Value) -> Self {
        self.name = name;
        self.meta = meta;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn elapsed_ms(&self) -> u64 {
        let mut elapsed = self.started_at.elapsed() - self.paused_duration;
        if let Some(paused_at) = self.paused_at {
            elapsed -= paused_at.elapsed();
        }
        elapsed.as_millis() as u64
    }

    /// Capture a frame with its elapsed timestamp. No-op while paused.
    pub fn capture(&mut self, frame: CaptureFrame) {
        if self.paused_at.is_some() {
            return;
        }
        let at = self.elapsed_ms();
        let (data, binary) = match frame {
            CaptureFrame::Binary(bytes) => (BASE64.encode(bytes), true),
            CaptureFrame::Text(text) => (text, false),
        };
        self.messages.push(RecordedMessage { at, data, binary });
    }

    /// Freeze the elapsed clock; capture becomes a no-op until `resume`.
    pub fn pause(&mut self) {
        if self.paused_at.is_none() {
            self.paused_at = Some(Instant::now());
        }
    }

    pub fn resume(&mut self) {
        if let Some(paused_at) = self.paused_at.take() {
            self.paused_duration += paused_at.elapsed();
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused_at.is_some()
    }

    /// Write `{id, remote, createdAt, name?, meta?, messages}` to
    /// `<dir>/<id>.json` via a tmp-file-then-rename, matching the teacher's
    /// `SessionManager::persist_sessions` pattern.
    pub fn persist(&self, dir: &Path, created_at_iso: &str) -> anyhow::Result<PathBuf> {
        std::fs::create_dir_all(dir).context("creating recordings directory")?;
        let recording = Recording {
            id: self.id.clone(),
            remote: self.remote.clone(),
            created_at: created_at_iso.to_string(),
            name: self.name.clone(),
            meta: self.meta.clone(),
            messages: self.messages.clone(),
        };
        let path = dir.join(format!("{}.json", self.id));
        let tmp_path = dir.join(format!("{}.json.tmp", self.id));
        let data = serde_json::to_string_pretty(&recording).context("serializing recording")?;
        std::fs::write(&tmp_path, data)
            .with_context(|| format!("writing {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, &path)
            .with_context(|| format!("renaming {} to {}", tmp_path.display(), path.display()))?;
        Ok(path)
    }
}

/// Load a persisted recording from `<dir>/<id>.json`.
pub fn load_recording(dir: &Path, id: &str) -> anyhow::Result<Recording> {
    let path = dir.join(format!("{id}.json"));
    let data =
        std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
    let recording: Recording =
        serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))?;
    Ok(recording)
}

/// Rewrite only the `name` field of an existing recording file, leaving
/// `messages` untouched (spec §4.4, supplemented from original_source).
pub fn update_recording_name(dir: &Path, id: &str, name: &str) -> anyhow::Result<PathBuf> {
    let mut recording = load_recording(dir, id)?;
    recording.name = Some(name.to_string());
    let path = dir.join(format!("{id}.json"));
    let tmp_path = dir.join(format!("{id}.json.tmp"));
    let data = serde_json::to_string_pretty(&recording)?;
    std::fs::write(&tmp_path, data)?;
    std::fs::rename(&tmp_path, &path)?;
    Ok(path)
}

/// A command sent to a running `Player` task.
enum PlayerCommand {
    Pause,
    Resume,
    Stop,
}

/// Handle to a running player task.
pub struct Player {
    commands: mpsc::UnboundedSender<PlayerCommand>,
    done: oneshot::Receiver<()>,
}

impl Player {
    /// Schedule a timer per message at `max(0, message.at - offset_ms)`.
    /// `write_upstream` is invoked with the decoded payload on each fire; it
    /// is expected to be a no-op if the upstream socket has since closed.
    /// After the last message's `at` plus 200ms, `on_finished` is invoked.
    pub fn spawn<W, F>(
        messages: Vec<RecordedMessage>,
        offset_ms: u64,
        write_upstream: W,
        on_finished: F,
    ) -> Self
    where
        W: Fn(Vec<u8>, bool) + Send + 'static,
        F: FnOnce() + Send + 'static,
    {
        let (commands_tx, mut commands_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = oneshot::channel();

        tokio::spawn(async move {
            let mut paused = false;
            let mut offset = offset_ms;
            let mut idx = 0usize;

            'outer: while idx < messages.len() {
                let msg = &messages[idx];
                let delay_ms = msg.at.saturating_sub(offset);
                let mut remaining = Duration::from_millis(delay_ms);
                let tick = Duration::from_millis(20);

                while !remaining.is_zero() {
                    let step = remaining.min(tick);
                    tokio::select! {
                        _ = sleep(step) => {
                            remaining -= step;
                        }
                        cmd = commands_rx.recv() => {
                            match cmd {
                                Some(PlayerCommand::Pause) => paused = true,
                                Some(PlayerCommand::Resume) => paused = false,
                                Some(PlayerCommand::Stop) | None => break 'outer,
                            }
                        }
                    }
                    while paused {
                        match commands_rx.recv().await {
                            Some(PlayerCommand::Resume) => paused = false,
                            Some(PlayerCommand::Stop) | None => break 'outer,
                            Some(PlayerCommand::Pause) => {}
                        }
                    }
                }

                let payload = if msg.binary {
                    BASE64.decode(msg.data.as_bytes()).unwrap_or_default()
                } else {
                    msg.data.clone().into_bytes()
                };
                write_upstream(payload, msg.binary);
                offset = msg.at;
                idx += 1;
            }

            sleep(Duration::from_millis(200)).await;
            on_finished();
            let _ = done_tx.send(());
        });

        Self {
            commands: commands_tx,
            done: done_rx,
        }
    }

    pub fn pause(&self) {
        let _ = self.commands.send(PlayerCommand::Pause);
    }

    pub fn resume(&self) {
        let _ = self.commands.send(PlayerCommand::Resume);
    }

    pub fn stop(&self) {
        let _ = self.commands.send(PlayerCommand::Stop);
    }

    pub async fn wait_finished(self) {
        let _ = self.done.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn normalize_id_strips_invalid_chars() {
        assert_eq!(normalize_id("hello world!", 123), "hello_world_");
        assert_eq!(normalize_id("already-valid_123", 123), "already-valid_123");
    }

    #[test]
    fn normalize_id_sentinels_generate_fresh_id() {
        assert_eq!(normalize_id("true", 42), "session-42");
        assert_eq!(normalize_id("1", 42), "session-42");
    }

    #[test]
    fn capture_binary_encodes_base64() {
        let mut recorder = Recorder::new("demo".into(), "tcp:8886".into());
        recorder.capture(CaptureFrame::Binary(vec![0xDE, 0xAD, 0xBE, 0xEF]));
        assert_eq!(recorder.messages.len(), 1);
        assert!(recorder.messages[0].binary);
        assert_eq!(
            BASE64.decode(&recorder.messages[0].data).unwrap(),
            vec![0xDE, 0xAD, 0xBE, 0xEF]
        );
    }

    #[test]
    fn capture_while_paused_is_dropped() {
        let mut recorder = Recorder::new("demo".into(), "tcp:8886".into());
        recorder.pause();
        recorder.capture(CaptureFrame::Text("ignored".into()));
        assert!(recorder.messages.is_empty());
    }

    #[test]
    fn persist_then_load_roundtrips_messages() {
        let dir = std::env::temp_dir().join(format!("tether-recorder-test-{}", std::process::id()));
        let mut recorder = Recorder::new("demo-test".into(), "tcp:8886".into());
        recorder.capture(CaptureFrame::Text("hello".into()));
        recorder.capture(CaptureFrame::Binary(vec![1, 2, 3]));
        let path = recorder.persist(&dir, "2026-07-26T00:00:00Z").unwrap();
        assert!(path.exists());

        let loaded = load_recording(&dir, "demo-test").unwrap();
        assert_eq!(loaded.messages.len(), 2);
        assert_eq!(loaded.messages[0].data, "hello");
        assert!(!loaded.messages[0].binary);
        assert!(loaded.messages[1].binary);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn update_name_leaves_messages_untouched() {
        let dir = std::env::temp_dir().join(format!("tether-recorder-test-name-{}", std::process::id()));
        let mut recorder = Recorder::new("renamed".into(), "tcp:8886".into());
        recorder.capture(CaptureFrame::Text("hi".into()));
        recorder.persist(&dir, "2026-07-26T00:00:00Z").unwrap();

        update_recording_name(&dir, "renamed", "My Session").unwrap();
        let loaded = load_recording(&dir, "renamed").unwrap();
        assert_eq!(loaded.name.as_deref(), Some("My Session"));
        assert_eq!(loaded.messages.len(), 1);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn player_replays_messages_in_order() {
        let messages = vec![
            RecordedMessage { at: 0, data: "a".into(), binary: false },
            RecordedMessage { at: 5, data: "b".into(), binary: false },
        ];
        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_write = Arc::clone(&seen);
        let finished = Arc::new(Mutex::new(false));
        let finished_flag = Arc::clone(&finished);

        let player = Player::spawn(
            messages,
            0,
            move |payload, _binary| {
                seen_write
                    .lock()
                    .unwrap()
                    .push(String::from_utf8(payload).unwrap());
            },
            move || {
                *finished_flag.lock().unwrap() = true;
            },
        );
        player.wait_finished().await;

        assert_eq!(*seen.lock().unwrap(), vec!["a".to_string(), "b".to_string()]);
        assert!(*finished.lock().unwrap());
    }
}

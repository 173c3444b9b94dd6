//! Mirror fabric: one source device's downstream frames get fanned out to a
//! set of follower proxies (spec §4.7). Grounded on `signaling.rs`'s
//! broadcast-channel fan-out shape, adapted to an explicit source→followers
//! map rather than a single per-session broadcast sender, since a follower
//! here is another live proxy session rather than a passive subscriber.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::RwLock;

/// Anything a sync follower can forward mirrored frames into. Implemented
/// by `proxy::Session` (not modeled in this module to avoid a dependency
/// cycle between `sync` and `proxy`).
#[async_trait::async_trait]
pub trait SyncTarget: Send + Sync {
    async fn forward_from_sync(&self, data: Vec<u8>);
}

/// Registry of source → set<follower> mappings plus the live follower
/// handles needed to dispatch `mirror()` calls.
pub struct SyncService {
    mapping: RwLock<HashMap<String, HashSet<String>>>,
    targets: RwLock<HashMap<String, Arc<dyn SyncTarget>>>,
}

impl SyncService {
    pub fn new() -> Self {
        Self {
            mapping: RwLock::new(HashMap::new()),
            targets: RwLock::new(HashMap::new()),
        }
    }

    /// Register (or replace) the live dispatch target for a session name.
    pub async fn register_target(&self, name: String, target: Arc<dyn SyncTarget>) {
        self.targets.write().await.insert(name, target);
    }

    pub async fn unregister_target(&self, name: &str) {
        self.targets.write().await.remove(name);
    }

    /// Normalize and replace the follower set for `target` atomically:
    /// trim, dedupe, drop empties, exclude `target` from its own followers.
    pub async fn set_mapping(&self, target: &str, devices: &[String]) {
        let normalized: HashSet<String> = devices
            .iter()
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty())
            .filter(|d| d != target)
            .collect();
        self.mapping.write().await.insert(target.to_string(), normalized);
    }

    pub async fn clear_mapping(&self, target: &str) {
        self.mapping.write().await.remove(target);
    }

    pub async fn current_mapping(&self) -> HashMap<String, HashSet<String>> {
        self.mapping.read().await.clone()
    }

    /// Fan a downstream→upstream frame from `source` out to each follower's
    /// `forward_from_sync`. Followers with no live target are silently
    /// skipped — no buffering.
    pub async fn mirror(&self, source: &str, data: &[u8]) {
        let followers = {
            let mapping = self.mapping.read().await;
            match mapping.get(source) {
                Some(set) => set.clone(),
                None => return,
            }
        };
        if followers.is_empty() {
            return;
        }

        let targets = self.targets.read().await;
        for follower in followers {
            if let Some(target) = targets.get(&follower) {
                target.forward_from_sync(data.to_vec()).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingTarget {
        count: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl SyncTarget for CountingTarget {
        async fn forward_from_sync(&self, _data: Vec<u8>) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn set_mapping_excludes_target_from_its_own_followers() {
        let service = SyncService::new();
        service
            .set_mapping("deviceA", &["deviceA".to_string(), "deviceB".to_string()])
            .await;
        let mapping = service.current_mapping().await;
        assert_eq!(
            mapping.get("deviceA").cloned().unwrap_or_default(),
            HashSet::from(["deviceB".to_string()])
        );
    }

    #[tokio::test]
    async fn set_mapping_trims_dedupes_and_drops_empties() {
        let service = SyncService::new();
        service
            .set_mapping(
                "deviceA",
                &[" deviceB ".to_string(), "deviceB".to_string(), "".to_string(), "   ".to_string()],
            )
            .await;
        let mapping = service.current_mapping().await;
        assert_eq!(
            mapping.get("deviceA").cloned().unwrap_or_default(),
            HashSet::from(["deviceB".to_string()])
        );
    }

    #[tokio::test]
    async fn mirror_dispatches_to_live_followers_only() {
        let service = SyncService::new();
        service
            .set_mapping("deviceA", &["deviceB".to_string(), "deviceC".to_string()])
            .await;
        let target_b = Arc::new(CountingTarget { count: AtomicUsize::new(0) });
        service.register_target("deviceB".to_string(), target_b.clone()).await;
        // deviceC has no registered target: should be silently skipped.

        service.mirror("deviceA", b"frame").await;
        assert_eq!(target_b.count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn mirror_with_no_mapping_is_noop() {
        let service = SyncService::new();
        let target = Arc::new(CountingTarget { count: AtomicUsize::new(0) });
        service.register_target("deviceB".to_string(), target.clone()).await;
        service.mirror("unknown-source", b"frame").await;
        assert_eq!(target.count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn clear_mapping_removes_followers() {
        let service = SyncService::new();
        service.set_mapping("deviceA", &["deviceB".to_string()]).await;
        service.clear_mapping("deviceA").await;
        assert!(service.current_mapping().await.get("deviceA").is_none());
    }
}

//! Checkpoint Manager
//!
//! Durable, hash-verified snapshots of critical state for crash recovery.
//! Payloads are staged fully before being published in the index, so a
//! crash mid-write never produces a partially-visible checkpoint. Every
//! restore re-verifies the content hash and never returns unverified
//! bytes.

use crate::component::Checkpointable;
use crate::error::{Result, VigilError};
use crate::persistence::store::{content_hash, KvStore};
use crate::supervisor::alert::AlertDispatcher;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const INDEX_KEY: &str = "checkpoints/index";
const DATA_PREFIX: &str = "checkpoints/data/";

/// Retention tier a checkpoint currently belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetentionTier {
    /// One of the most recent K checkpoints
    Recent,
    /// Kept as the daily representative for its UTC day
    Daily,
}

impl std::fmt::Display for RetentionTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetentionTier::Recent => write!(f, "recent"),
            RetentionTier::Daily => write!(f, "daily"),
        }
    }
}

/// Checkpoint metadata. The payload itself is immutable once published.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub id: String,
    pub tag: String,
    pub created_at: DateTime<Utc>,
    pub hash: String,
    pub size: u64,
    pub tier: RetentionTier,
}

/// Tiered retention policy: keep the most recent `keep_recent`
/// checkpoints plus one per UTC day for `keep_daily` days.
#[derive(Debug, Clone, Copy)]
pub struct RetentionPolicy {
    pub keep_recent: usize,
    pub keep_daily: usize,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            keep_recent: 5,
            keep_daily: 7,
        }
    }
}

/// Manages durable checkpoints of critical state over a [`KvStore`].
pub struct BackupManager {
    store: Arc<dyn KvStore>,
    source: Arc<dyn Checkpointable>,
    alerts: Arc<AlertDispatcher>,
    /// Index of published checkpoints, newest first. Also serializes the
    /// write path so concurrent creates cannot interleave.
    index: Mutex<Vec<CheckpointMeta>>,
}

impl BackupManager {
    /// Open the manager, loading any existing index from the store.
    pub async fn open(
        store: Arc<dyn KvStore>,
        source: Arc<dyn Checkpointable>,
        alerts: Arc<AlertDispatcher>,
    ) -> Result<Self> {
        let index = match store.get(INDEX_KEY).await? {
            Some(bytes) => {
                let mut metas: Vec<CheckpointMeta> = serde_json::from_slice(&bytes)?;
                sort_newest_first(&mut metas);
                metas
            }
            None => Vec::new(),
        };

        info!("Checkpoint store opened ({} checkpoints)", index.len());

        Ok(Self {
            store,
            source,
            alerts,
            index: Mutex::new(index),
        })
    }

    fn data_key(id: &str) -> String {
        format!("{}{}", DATA_PREFIX, id)
    }

    async fn persist_index(&self, index: &[CheckpointMeta]) -> Result<()> {
        let bytes = serde_json::to_vec(index)?;
        self.store.put(INDEX_KEY, &bytes).await?;
        Ok(())
    }

    /// Capture the current state and publish it as a new checkpoint.
    ///
    /// The payload is written under its data key first; the checkpoint
    /// only becomes visible once the index is rewritten afterwards.
    pub async fn create(&self, tag: &str) -> Result<CheckpointMeta> {
        let mut index = self.index.lock().await;

        let payload = self.source.capture().await?;
        let hash = content_hash(&payload);
        let id = uuid::Uuid::new_v4().to_string();

        let stored_hash = self.store.put(&Self::data_key(&id), &payload).await?;
        if stored_hash != hash {
            return Err(VigilError::Store(format!(
                "store reported hash {} for checkpoint {}, expected {}",
                stored_hash, id, hash
            )));
        }

        let meta = CheckpointMeta {
            id: id.clone(),
            tag: tag.to_string(),
            created_at: Utc::now(),
            hash,
            size: payload.len() as u64,
            tier: RetentionTier::Recent,
        };

        index.insert(0, meta.clone());
        sort_newest_first(&mut index);
        self.persist_index(&index).await?;

        info!(
            "Created checkpoint {} (tag: {}, {} bytes)",
            meta.id, meta.tag, meta.size
        );

        Ok(meta)
    }

    /// Fetch and verify a checkpoint payload.
    ///
    /// A hash mismatch raises an alert and returns
    /// [`VigilError::Integrity`]; the payload is never returned.
    pub async fn restore(&self, id: &str) -> Result<Vec<u8>> {
        let meta = {
            let index = self.index.lock().await;
            index
                .iter()
                .find(|m| m.id == id)
                .cloned()
                .ok_or_else(|| VigilError::UnknownCheckpoint(id.to_string()))?
        };

        let payload = self
            .store
            .get(&Self::data_key(id))
            .await?
            .ok_or_else(|| VigilError::Store(format!("checkpoint payload missing: {}", id)))?;

        let actual = content_hash(&payload);
        if actual != meta.hash {
            self.alerts
                .error(
                    "backup",
                    "Checkpoint Integrity Failure",
                    &format!("checkpoint {} hash mismatch, restore aborted", id),
                )
                .await;
            return Err(VigilError::Integrity {
                id: id.to_string(),
                expected: meta.hash,
                actual,
            });
        }

        info!("Restored checkpoint {} ({} bytes)", id, payload.len());
        Ok(payload)
    }

    /// All published checkpoints, newest first.
    pub async fn list(&self) -> Vec<CheckpointMeta> {
        self.index.lock().await.clone()
    }

    /// The most recent checkpoint, if any.
    pub async fn latest(&self) -> Option<CheckpointMeta> {
        self.index.lock().await.first().cloned()
    }

    /// Apply the retention policy, deleting everything outside it.
    /// Deterministic for a given index and policy; applying it twice in a
    /// row deletes nothing the second time. Also sweeps payloads that
    /// were staged but never published.
    pub async fn prune(&self, policy: RetentionPolicy) -> Result<usize> {
        let mut index = self.index.lock().await;

        let (keep, daily) = plan_retention(&index, policy);

        let mut removed = 0usize;
        let mut retained = Vec::with_capacity(keep.len());
        for meta in index.drain(..) {
            if keep.contains(&meta.id) {
                let mut meta = meta;
                meta.tier = if daily.contains(&meta.id) {
                    RetentionTier::Daily
                } else {
                    RetentionTier::Recent
                };
                retained.push(meta);
            } else {
                self.store.delete(&Self::data_key(&meta.id)).await?;
                removed += 1;
                debug!("Pruned checkpoint {} (tag: {})", meta.id, meta.tag);
            }
        }
        *index = retained;
        self.persist_index(&index).await?;

        // Sweep orphaned payloads from interrupted creates.
        let indexed: HashSet<String> = index.iter().map(|m| Self::data_key(&m.id)).collect();
        for key in self.store.list(DATA_PREFIX).await? {
            if !indexed.contains(&key) {
                self.store.delete(&key).await?;
                warn!("Swept orphaned checkpoint payload {}", key);
            }
        }

        if removed > 0 {
            info!("Pruned {} checkpoints ({} retained)", removed, index.len());
        }

        Ok(removed)
    }

    /// Run the periodic checkpoint cadence until cancelled. A cycle that
    /// cannot finish before the next one is due causes the next cycle to
    /// be skipped, not queued.
    pub fn spawn_periodic(
        self: &Arc<Self>,
        interval: Duration,
        policy: RetentionPolicy,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // interval() fires immediately; swallow that first tick so
            // the cadence starts one interval after startup.
            timer.tick().await;

            info!("Periodic checkpoints every {:?}", interval);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = timer.tick() => {}
                }

                let started = tokio::time::Instant::now();
                match manager.create("periodic").await {
                    Ok(meta) => {
                        if let Err(e) = manager.prune(policy).await {
                            warn!("Checkpoint prune failed: {}", e);
                        }
                        debug!("Periodic checkpoint {} complete", meta.id);
                    }
                    Err(e) => {
                        warn!("Periodic checkpoint failed: {}", e);
                        manager
                            .alerts
                            .warning("backup", "Checkpoint Failed", &e.to_string())
                            .await;
                    }
                }

                if started.elapsed() > interval {
                    warn!(
                        "Checkpoint cycle overran its {:?} interval; missed cycle skipped",
                        interval
                    );
                }
            }

            info!("Periodic checkpoints stopped");
        })
    }
}

fn sort_newest_first(metas: &mut [CheckpointMeta]) {
    metas.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
}

/// Decide which checkpoint ids survive pruning. Returns the keep set and
/// the subset kept as daily representatives. `metas` must be newest
/// first.
fn plan_retention(
    metas: &[CheckpointMeta],
    policy: RetentionPolicy,
) -> (HashSet<String>, HashSet<String>) {
    let mut keep = HashSet::new();
    let mut daily = HashSet::new();

    for meta in metas.iter().take(policy.keep_recent) {
        keep.insert(meta.id.clone());
    }

    // Older checkpoints: the newest per UTC day, most recent days first.
    let mut days_kept: Vec<chrono::NaiveDate> = Vec::new();
    for meta in metas.iter().skip(policy.keep_recent) {
        let day = meta.created_at.date_naive();
        if days_kept.contains(&day) {
            continue;
        }
        if days_kept.len() >= policy.keep_daily {
            continue;
        }
        days_kept.push(day);
        keep.insert(meta.id.clone());
        daily.insert(meta.id.clone());
    }

    (keep, daily)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::store::MemoryStore;
    use crate::supervisor::alert::{AlertDispatcher, LogAlertSink};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use tokio::sync::RwLock;

    struct FixedSource {
        payload: RwLock<Vec<u8>>,
    }

    impl FixedSource {
        fn new(payload: &[u8]) -> Self {
            Self {
                payload: RwLock::new(payload.to_vec()),
            }
        }
    }

    #[async_trait]
    impl Checkpointable for FixedSource {
        async fn capture(&self) -> crate::error::Result<Vec<u8>> {
            Ok(self.payload.read().await.clone())
        }

        async fn apply(&self, payload: &[u8]) -> crate::error::Result<()> {
            *self.payload.write().await = payload.to_vec();
            Ok(())
        }
    }

    async fn manager_with(payload: &[u8]) -> (Arc<MemoryStore>, BackupManager) {
        let store = Arc::new(MemoryStore::new());
        let manager = BackupManager::open(
            store.clone(),
            Arc::new(FixedSource::new(payload)),
            Arc::new(AlertDispatcher::new(Arc::new(LogAlertSink))),
        )
        .await
        .unwrap();
        (store, manager)
    }

    #[tokio::test]
    async fn test_create_restore_roundtrip() {
        let (_store, manager) = manager_with(b"critical state v1").await;

        let meta = manager.create("test").await.unwrap();
        assert_eq!(meta.size, 17);
        assert_eq!(meta.tier, RetentionTier::Recent);

        let restored = manager.restore(&meta.id).await.unwrap();
        assert_eq!(restored, b"critical state v1");
    }

    #[tokio::test]
    async fn test_restore_unknown_id() {
        let (_store, manager) = manager_with(b"x").await;
        let err = manager.restore("no-such-id").await.unwrap_err();
        assert!(matches!(err, VigilError::UnknownCheckpoint(_)));
    }

    #[tokio::test]
    async fn test_corruption_detected_and_no_payload_returned() {
        let (store, manager) = manager_with(b"pristine bytes").await;
        let meta = manager.create("test").await.unwrap();

        // Flip one byte in the stored payload behind the manager's back.
        let key = BackupManager::data_key(&meta.id);
        let mut bytes = store.get(&key).await.unwrap().unwrap();
        bytes[0] ^= 0xff;
        store.put(&key, &bytes).await.unwrap();

        let err = manager.restore(&meta.id).await.unwrap_err();
        assert!(matches!(err, VigilError::Integrity { .. }));
    }

    #[tokio::test]
    async fn test_list_is_newest_first() {
        let (_store, manager) = manager_with(b"s").await;
        let first = manager.create("a").await.unwrap();
        let second = manager.create("b").await.unwrap();

        let listed = manager.list().await;
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, second.id);
        assert_eq!(listed[1].id, first.id);
        assert_eq!(manager.latest().await.unwrap().id, second.id);
    }

    #[tokio::test]
    async fn test_prune_is_deterministic_and_idempotent() {
        let (_store, manager) = manager_with(b"s").await;
        for i in 0..8 {
            manager.create(&format!("cp{}", i)).await.unwrap();
        }

        let policy = RetentionPolicy {
            keep_recent: 3,
            keep_daily: 1,
        };

        // 8 same-day checkpoints: keep 3 recent + 1 daily representative.
        let removed = manager.prune(policy).await.unwrap();
        assert_eq!(removed, 4);
        let remaining = manager.list().await;
        assert_eq!(remaining.len(), 4);
        assert_eq!(remaining[3].tier, RetentionTier::Daily);

        // Second application deletes nothing.
        let removed_again = manager.prune(policy).await.unwrap();
        assert_eq!(removed_again, 0);
        assert_eq!(manager.list().await.len(), 4);
    }

    #[tokio::test]
    async fn test_restore_after_prune_survivors() {
        let (_store, manager) = manager_with(b"survivor").await;
        for _ in 0..4 {
            manager.create("cp").await.unwrap();
        }
        manager
            .prune(RetentionPolicy {
                keep_recent: 2,
                keep_daily: 0,
            })
            .await
            .unwrap();

        for meta in manager.list().await {
            assert_eq!(manager.restore(&meta.id).await.unwrap(), b"survivor");
        }
    }

    #[test]
    fn test_plan_retention_daily_buckets() {
        let at = |d: u32, h: u32| Utc.with_ymd_and_hms(2026, 8, d, h, 0, 0).unwrap();
        let meta = |id: &str, created_at: DateTime<Utc>| CheckpointMeta {
            id: id.to_string(),
            tag: "t".to_string(),
            created_at,
            hash: String::new(),
            size: 0,
            tier: RetentionTier::Recent,
        };

        // Newest first: two on day 3, three on day 2, two on day 1.
        let metas = vec![
            meta("a", at(3, 12)),
            meta("b", at(3, 8)),
            meta("c", at(2, 20)),
            meta("d", at(2, 10)),
            meta("e", at(2, 1)),
            meta("f", at(1, 9)),
            meta("g", at(1, 2)),
        ];

        let (keep, daily) = plan_retention(
            &metas,
            RetentionPolicy {
                keep_recent: 2,
                keep_daily: 2,
            },
        );

        // Recent: a, b. Daily reps: newest of day 2 (c) and day 1 (f).
        assert!(keep.contains("a") && keep.contains("b"));
        assert!(keep.contains("c") && keep.contains("f"));
        assert_eq!(keep.len(), 4);
        assert!(daily.contains("c") && daily.contains("f"));
        assert_eq!(daily.len(), 2);
    }
}
